pub mod batcher;
pub mod performance_optimizer;
pub mod work_queue;

pub use batcher::{BatcherStats, VisionApiBatcher};
pub use performance_optimizer::{OptimizationCycleReport, PerformanceOptimizer, PerformanceReport};
pub use work_queue::{AsyncProcessingQueue, QueueStats, TaskHandle};
