use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const HOUR: u64 = 3600;

/// Kinds of results stored in the cache. Each has exactly one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    DetectionResults,
    SegmentationMasks,
    ExtractionResults,
    BatchProcessing,
    NaturalElements,
    FaceDetection,
    Annotations,
}

/// Static caching policy of a result type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultTypePolicy {
    pub prefix: &'static str,
    pub ttl: Duration,
    /// Fixed importance term of the eviction score; higher is evicted sooner
    pub eviction_weight: f64,
}

impl ResultType {
    pub const ALL: [ResultType; 7] = [
        ResultType::DetectionResults,
        ResultType::SegmentationMasks,
        ResultType::ExtractionResults,
        ResultType::BatchProcessing,
        ResultType::NaturalElements,
        ResultType::FaceDetection,
        ResultType::Annotations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::DetectionResults => "detection_results",
            ResultType::SegmentationMasks => "segmentation_masks",
            ResultType::ExtractionResults => "extraction_results",
            ResultType::BatchProcessing => "batch_processing",
            ResultType::NaturalElements => "natural_elements",
            ResultType::FaceDetection => "face_detection",
            ResultType::Annotations => "annotations",
        }
    }

    pub const fn policy(&self) -> ResultTypePolicy {
        match self {
            ResultType::DetectionResults => ResultTypePolicy {
                prefix: "det",
                ttl: Duration::from_secs(24 * HOUR),
                eviction_weight: 0.5,
            },
            ResultType::SegmentationMasks => ResultTypePolicy {
                prefix: "seg",
                ttl: Duration::from_secs(12 * HOUR),
                eviction_weight: 0.6,
            },
            ResultType::ExtractionResults => ResultTypePolicy {
                prefix: "ext",
                ttl: Duration::from_secs(48 * HOUR),
                eviction_weight: 0.1,
            },
            ResultType::BatchProcessing => ResultTypePolicy {
                prefix: "batch",
                ttl: Duration::from_secs(HOUR),
                eviction_weight: 0.9,
            },
            ResultType::NaturalElements => ResultTypePolicy {
                prefix: "nat",
                ttl: Duration::from_secs(24 * HOUR),
                eviction_weight: 0.4,
            },
            ResultType::FaceDetection => ResultTypePolicy {
                prefix: "face",
                ttl: Duration::from_secs(24 * HOUR),
                eviction_weight: 0.5,
            },
            ResultType::Annotations => ResultTypePolicy {
                prefix: "ann",
                ttl: Duration::from_secs(6 * HOUR),
                eviction_weight: 0.7,
            },
        }
    }

    pub fn prefix(&self) -> &'static str {
        self.policy().prefix
    }

    pub fn ttl(&self) -> Duration {
        self.policy().ttl
    }

    /// Resolve the result type owning a key prefix
    pub fn from_prefix(prefix: &str) -> Option<ResultType> {
        ResultType::ALL.iter().copied().find(|rt| rt.prefix() == prefix)
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
