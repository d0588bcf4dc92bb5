// Library exports for the vision optimization service
//
// Caching, request batching, bounded background work and memory management
// in front of a remote image-analysis API

pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use self::core::{
    config::Config,
    errors::{CacheError, ConfigError, ProcessingError, VisionError},
    types::{
        BatchOperation, BatchProcessingResult, BatchRequest, DetectionParams, DispatchMode,
        FaceDetectionParams, NaturalElementsParams, Operation, OptimizedResult, Params,
    },
};

pub use middleware::{with_retry, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};

pub use orchestration::{AsyncProcessingQueue, PerformanceOptimizer, VisionApiBatcher};

pub use services::{
    CacheBackend, CacheService, MemoryBackend, MemoryManager, RedisBackend, ResultType,
    VisionClient, VisionService,
};

pub use utils::PerformanceMetrics;
