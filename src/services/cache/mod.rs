pub mod backend;
pub mod policy;
pub mod service;

pub use backend::{BackendInfo, CacheBackend, KeyTtl, MemoryBackend, RedisBackend};
pub use policy::{ResultType, ResultTypePolicy};
pub use service::{
    CacheCounterSnapshot, CacheService, CacheVersionInfo, CleanupReport, DetailedCacheStatistics,
    EvictionReport, WarmupReport,
};
