pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{CacheError, ConfigError, ProcessingError, VisionError};
pub use types::{
    BatchOperation, BatchRequest, DetectionParams, DispatchMode, FaceDetectionParams,
    NaturalElementsParams, Operation, OperationParams, OptimizedResult, Params,
};
