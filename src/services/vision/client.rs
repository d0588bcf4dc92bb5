use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::response::{features_for, shape_response};
use super::VisionService;
use crate::core::config::VisionConfig;
use crate::core::errors::{VisionError, VisionResult};
use crate::core::types::{Operation, Params};
use crate::middleware::{with_retry, CircuitBreaker, CircuitBreakerStats, RetryPolicy};

/// Images per annotate call accepted by the remote API
const MAX_IMAGES_PER_CALL: usize = 16;

#[derive(Serialize)]
struct AnnotateRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Serialize)]
struct AnnotateImageRequest {
    image: ImageContent,
    features: Vec<Feature>,
}

#[derive(Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
    max_results: u32,
}

#[derive(Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<Value>,
}

/// HTTP client for the `images:annotate` endpoint with circuit breaking and
/// retries on transient failures.
pub struct VisionClient {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl VisionClient {
    pub fn new(config: &VisionConfig, breaker: CircuitBreaker) -> VisionResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            url: format!("{}/v1/images:annotate", config.endpoint.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            breaker,
            retry: RetryPolicy::with_max_retries(config.max_retries),
        })
    }

    pub fn breaker_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    fn build_request(operation: Operation, params: &Params, images: &[Arc<Vec<u8>>]) -> AnnotateRequest {
        let features = features_for(operation, params);
        AnnotateRequest {
            requests: images
                .iter()
                .map(|image| AnnotateImageRequest {
                    image: ImageContent {
                        content: general_purpose::STANDARD.encode(image.as_slice()),
                    },
                    features: features
                        .iter()
                        .map(|&(kind, max_results)| Feature { kind, max_results })
                        .collect(),
                })
                .collect(),
        }
    }

    async fn post_annotate(&self, api_key: &str, body: &AnnotateRequest) -> VisionResult<Vec<Value>> {
        let response = self
            .http
            .post(&self.url)
            .query(&[("key", api_key)])
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: AnnotateResponse = response
            .json()
            .await
            .map_err(|e| VisionError::InvalidResponse(e.to_string()))?;
        Ok(parsed.responses)
    }

    async fn annotate(
        &self,
        operation: Operation,
        params: &Params,
        images: &[Arc<Vec<u8>>],
    ) -> VisionResult<Vec<Value>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| VisionError::Unavailable("VISION_API_KEY is not configured".into()))?;
        let body = Self::build_request(operation, params, images);
        let body = &body;

        let responses = with_retry(&self.retry, move || {
            self.breaker.call(move || self.post_annotate(api_key, body))
        })
        .await?;

        if responses.len() != images.len() {
            return Err(VisionError::InvalidResponse(format!(
                "expected {} responses, got {}",
                images.len(),
                responses.len()
            )));
        }
        Ok(responses)
    }
}

#[async_trait]
impl VisionService for VisionClient {
    #[instrument(skip(self, image, params), fields(operation = %operation, bytes = image.len()))]
    async fn analyze(
        &self,
        operation: Operation,
        image: Arc<Vec<u8>>,
        params: &Params,
    ) -> VisionResult<Value> {
        let responses = self.annotate(operation, params, std::slice::from_ref(&image)).await?;
        shape_response(operation, params, 0, &responses[0])
    }

    #[instrument(skip(self, params, images), fields(operation = %operation, images = images.len()))]
    async fn analyze_batch(
        &self,
        operation: Operation,
        params: &Params,
        images: Vec<Arc<Vec<u8>>>,
    ) -> VisionResult<Vec<VisionResult<Value>>> {
        let mut results = Vec::with_capacity(images.len());
        for (chunk_index, chunk) in images.chunks(MAX_IMAGES_PER_CALL).enumerate() {
            let responses = self.annotate(operation, params, chunk).await?;
            let offset = chunk_index * MAX_IMAGES_PER_CALL;
            results.extend(
                responses
                    .iter()
                    .enumerate()
                    .map(|(i, response)| shape_response(operation, params, offset + i, response)),
            );
        }
        debug!("Annotated {} images for {}", results.len(), operation);
        Ok(results)
    }
}
