// Custom error types for the optimization core
//
// Using thiserror for ergonomic error definitions with:
// - Type-safe error matching
// - Recoverable vs permanent classification for callers
// - Source error chaining

use thiserror::Error;

/// Errors raised by the batcher, the work queue and the optimizer façade.
///
/// Callers decide whether to retry via [`ProcessingError::is_recoverable`].
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Batch request {request_id} timed out after {timeout_secs:.1}s")]
    BatchTimeout { request_id: String, timeout_secs: f64 },

    #[error("Processing queue is full ({max_queue_size} tasks)")]
    QueueFull { max_queue_size: usize },

    #[error("Processing queue is not running")]
    QueueStopped,

    #[error("Unsupported operation type: {0}")]
    UnsupportedOperation(String),

    #[error("Image content for {image_hash} is not available")]
    ImageUnavailable { image_hash: String },

    #[error("Batch dispatch failed for {operation}: {reason}")]
    DispatchFailed { operation: String, reason: String },

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Request was cancelled before a result was produced")]
    Cancelled,

    #[error("Remote analysis failed: {0}")]
    Remote(#[from] VisionError),
}

impl ProcessingError {
    /// Whether a caller may reasonably retry the same request unchanged.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProcessingError::BatchTimeout { .. }
            | ProcessingError::QueueFull { .. }
            | ProcessingError::QueueStopped
            | ProcessingError::Cancelled
            | ProcessingError::DispatchFailed { .. } => true,
            ProcessingError::UnsupportedOperation(_)
            | ProcessingError::ImageUnavailable { .. }
            | ProcessingError::TaskFailed(_) => false,
            ProcessingError::Remote(e) => e.is_transient(),
        }
    }

    /// Short machine-readable error kind, used in API responses and batch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::BatchTimeout { .. } => "batch_timeout",
            ProcessingError::QueueFull { .. } => "queue_full",
            ProcessingError::QueueStopped => "queue_stopped",
            ProcessingError::UnsupportedOperation(_) => "unsupported_operation",
            ProcessingError::ImageUnavailable { .. } => "image_unavailable",
            ProcessingError::DispatchFailed { .. } => "dispatch_failed",
            ProcessingError::TaskFailed(_) => "task_failed",
            ProcessingError::Cancelled => "cancelled",
            ProcessingError::Remote(_) => "remote_error",
        }
    }
}

/// Remote analysis service errors
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Circuit breaker is open, analysis service unavailable")]
    CircuitOpen,

    #[error("API request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Analysis of image {index} failed: {message}")]
    Image { index: usize, message: String },

    #[error("Analysis service unavailable: {0}")]
    Unavailable(String),
}

impl VisionError {
    /// Transient errors may succeed on retry (network, throttling, overload).
    pub fn is_transient(&self) -> bool {
        match self {
            VisionError::CircuitOpen | VisionError::Unavailable(_) => true,
            VisionError::RequestFailed(e) => e.is_timeout() || e.is_connect(),
            VisionError::Status { status, .. } => *status == 429 || *status >= 500,
            VisionError::InvalidResponse(_) | VisionError::Image { .. } => false,
        }
    }
}

/// Cache backend errors. These never leave `CacheService`: they are logged
/// and degraded into empty results.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis command failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cache serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Batch size must be > 0, got {0}")]
    InvalidBatchSize(usize),

    #[error("Batch timeout must be > 0")]
    InvalidBatchTimeout,

    #[error("Invalid queue config: {0}")]
    InvalidQueueConfig(String),

    #[error("Invalid memory config: {0}")]
    InvalidMemoryConfig(String),

    #[error("Invalid cache config: {0}")]
    InvalidCacheConfig(String),

    #[error("Invalid vision config: {0}")]
    InvalidVisionConfig(String),
}

// Convenience type aliases for Results
pub type ProcessingResult<T> = Result<T, ProcessingError>;
pub type VisionResult<T> = Result<T, VisionError>;
pub type CacheResult<T> = Result<T, CacheError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(ProcessingError::QueueFull { max_queue_size: 4 }.is_recoverable());
        assert!(ProcessingError::BatchTimeout {
            request_id: "r1".to_string(),
            timeout_secs: 0.5,
        }
        .is_recoverable());
        assert!(!ProcessingError::UnsupportedOperation("ocr".to_string()).is_recoverable());
        assert!(!ProcessingError::ImageUnavailable {
            image_hash: "abc".to_string()
        }
        .is_recoverable());
    }

    #[test]
    fn test_remote_errors_follow_transience() {
        let throttled = ProcessingError::Remote(VisionError::Status {
            status: 429,
            body: String::new(),
        });
        let bad_request = ProcessingError::Remote(VisionError::Status {
            status: 400,
            body: "bad image".to_string(),
        });
        assert!(throttled.is_recoverable());
        assert!(!bad_request.is_recoverable());
        assert_eq!(bad_request.kind(), "remote_error");
    }
}
