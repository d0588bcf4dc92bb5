// Shared request/result types for the optimization core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::errors::ProcessingError;
use crate::services::cache::ResultType;

/// Operation parameters, kept in a sorted map so that serialization is
/// independent of insertion order.
pub type Params = BTreeMap<String, Value>;

/// Remote analysis operations supported by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "detect_objects_enhanced")]
    ObjectDetection,
    #[serde(rename = "analyze_natural_elements")]
    NaturalElements,
    #[serde(rename = "detect_faces")]
    FaceDetection,
}

impl Operation {
    pub const ALL: [Operation; 3] = [
        Operation::ObjectDetection,
        Operation::NaturalElements,
        Operation::FaceDetection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ObjectDetection => "detect_objects_enhanced",
            Operation::NaturalElements => "analyze_natural_elements",
            Operation::FaceDetection => "detect_faces",
        }
    }

    /// Cache result type the operation's output is stored under
    pub fn result_type(&self) -> ResultType {
        match self {
            Operation::ObjectDetection => ResultType::DetectionResults,
            Operation::NaturalElements => ResultType::NaturalElements,
            Operation::FaceDetection => ResultType::FaceDetection,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ProcessingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| ProcessingError::UnsupportedOperation(s.to_string()))
    }
}

/// Typed parameter set of a single operation
pub trait OperationParams: Serialize {
    const OPERATION: Operation;

    fn to_params(&self) -> Params {
        to_params(self)
    }
}

/// Convert any serializable struct into a sorted parameter map.
pub fn to_params<T: Serialize + ?Sized>(value: &T) -> Params {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => Params::new(),
    }
}

/// Parameters of `detect_objects_enhanced`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    pub confidence_threshold: f64,
    pub include_faces: bool,
    pub include_labels: bool,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            include_faces: true,
            include_labels: true,
        }
    }
}

impl OperationParams for DetectionParams {
    const OPERATION: Operation = Operation::ObjectDetection;
}

/// Parameters of `analyze_natural_elements`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NaturalElementsParams {
    pub confidence_threshold: f64,
    pub include_colors: bool,
}

impl Default for NaturalElementsParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            include_colors: true,
        }
    }
}

impl OperationParams for NaturalElementsParams {
    const OPERATION: Operation = Operation::NaturalElements;
}

/// Parameters of `detect_faces`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceDetectionParams {
    pub confidence_threshold: f64,
}

impl Default for FaceDetectionParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
        }
    }
}

impl OperationParams for FaceDetectionParams {
    const OPERATION: Operation = Operation::FaceDetection;
}

/// One caller's pending unit of work inside the batcher
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub request_id: String,
    pub image_hash: String,
    pub image_content: Arc<Vec<u8>>,
    pub operation: Operation,
    pub params: Params,
    /// Higher values are dispatched first within a flush
    pub priority: Option<u8>,
    pub created_at: Instant,
    pub timeout: Duration,
}

impl BatchRequest {
    pub fn new(
        image_hash: impl Into<String>,
        image_content: Arc<Vec<u8>>,
        operation: Operation,
        params: Params,
        timeout: Duration,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            image_hash: image_hash.into(),
            image_content,
            operation,
            params,
            priority: None,
            created_at: Instant::now(),
            timeout,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// How a result was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Cache,
    Batched,
    Direct,
}

/// Result returned by the optimizer's per-operation entry points
#[derive(Debug, Clone, Serialize)]
pub struct OptimizedResult {
    pub operation: Operation,
    pub image_hash: String,
    pub result: Value,
    pub from_cache: bool,
    pub dispatch: DispatchMode,
    pub processing_time_ms: f64,
}

/// One item of a batch-processing call
#[derive(Debug, Clone)]
pub struct BatchOperation {
    /// Operation name as received from the caller, e.g. "detect_objects_enhanced"
    pub operation: String,
    pub image_hash: String,
    /// Falls back to the memory manager's soft image cache when absent
    pub image_content: Option<Arc<Vec<u8>>>,
    pub params: Params,
}

/// Per-item outcome of a batch-processing call
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub operation: String,
    pub image_hash: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<OptimizedResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
}

/// Aggregate outcome of a batch-processing call
#[derive(Debug, Clone, Serialize)]
pub struct BatchProcessingResult {
    pub batch_id: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub processing_time_ms: f64,
    pub results: Vec<BatchItemResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Processing,
    Completed,
}

/// Batch progress record stored under the `batch_processing` policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub status: BatchState,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub updated_at: DateTime<Utc>,
}
