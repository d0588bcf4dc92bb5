// Remote image analysis (Google Cloud Vision style annotate API)

pub mod client;
pub mod response;

pub use client::VisionClient;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::core::errors::VisionResult;
use crate::core::types::{Operation, Params};

/// Contract of the remote analysis service.
///
/// `analyze_batch` returns one result per input image, in input order. An
/// outer `Err` means the whole call failed; an inner `Err` affects only that
/// image.
#[async_trait]
pub trait VisionService: Send + Sync {
    async fn analyze(
        &self,
        operation: Operation,
        image: Arc<Vec<u8>>,
        params: &Params,
    ) -> VisionResult<Value>;

    async fn analyze_batch(
        &self,
        operation: Operation,
        params: &Params,
        images: Vec<Arc<Vec<u8>>>,
    ) -> VisionResult<Vec<VisionResult<Value>>> {
        let calls = images
            .into_iter()
            .map(|image| self.analyze(operation, image, params));
        Ok(futures::future::join_all(calls).await)
    }
}
