pub mod cache;
pub mod memory;
pub mod vision;

// Re-export commonly used services
pub use cache::{CacheBackend, CacheService, MemoryBackend, RedisBackend, ResultType};
pub use memory::{MemoryManager, MemoryProbe, ProcessMemoryProbe};
pub use vision::{VisionClient, VisionService};
