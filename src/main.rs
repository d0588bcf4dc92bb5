// Main entry point for the vision optimization service

use vision_optimizer::{
    core::{
        errors::{ProcessingError, VisionError},
        types::{BatchOperation, Operation, Params},
        Config,
    },
    middleware::CircuitBreaker,
    orchestration::PerformanceOptimizer,
    services::{CacheService, MemoryManager, VisionClient},
};

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use xxhash_rust::xxh3::xxh3_128;

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    optimizer: PerformanceOptimizer,
    vision: Arc<VisionClient>,
}

type ApiError = (StatusCode, Json<Value>);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "vision_optimizer={}",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== VISION OPTIMIZER ===");
    info!(
        "Config: batch={} workers={} queue={} memory={}MB cache={}",
        config.batch_size(),
        config.max_workers(),
        config.max_queue_size(),
        config.max_memory_mb(),
        if config.cache_enabled() { "ON" } else { "OFF" }
    );
    if config.vision_api_key().is_none() {
        info!("VISION_API_KEY not set; remote analysis calls will fail until it is configured");
    }

    let vision = Arc::new(
        VisionClient::new(&config.vision, CircuitBreaker::new())
            .context("Failed to create vision client")?,
    );
    let cache = CacheService::connect(&config.cache).await;
    if cache.is_enabled() {
        let cleanup = cache.cleanup_expired_cache_entries().await;
        info!(
            "Startup cache cleanup removed {} entries",
            cleanup.removed_without_ttl + cleanup.removed_stale_version
        );
    }
    let memory = MemoryManager::new(&config.memory);

    let optimizer = PerformanceOptimizer::new(&config, vision.clone(), cache, memory);
    optimizer.start();

    let state = AppState {
        config: config.clone(),
        optimizer: optimizer.clone(),
        vision,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/performance", get(performance))
        .route("/performance/optimize", post(run_optimization_cycle))
        .route("/cache/statistics", get(cache_statistics))
        .route("/cache/warm", post(warm_cache))
        .route("/analyze/:operation", post(analyze))
        .route("/batch", post(process_batch))
        .route("/batch/:batch_id", get(batch_status))
        .with_state(state)
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024))
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /health                - Health check");
    info!("  GET  /metrics               - Prometheus metrics");
    info!("  GET  /performance           - Optimizer metrics (JSON)");
    info!("  POST /performance/optimize  - Run an optimization cycle");
    info!("  GET  /cache/statistics      - Detailed cache statistics");
    info!("  POST /cache/warm            - Refresh TTLs for known images");
    info!("  POST /analyze/:operation    - Analyze one image (multipart/form-data)");
    info!("  POST /batch                 - Analyze several images (multipart/form-data)");
    info!("  GET  /batch/:batch_id       - Batch status");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    optimizer.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn root() -> &'static str {
    "Vision Optimizer - caching and batching layer for image analysis"
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let report = state.optimizer.get_performance_metrics();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "cache_enabled": state.optimizer.cache().is_enabled(),
        "cache_version": state.config.cache_version(),
        "batcher_running": report.batcher.running,
        "queue_running": report.queue.is_running,
        "memory_pressure": report.memory.under_pressure,
        "vision_circuit": state.vision.breaker_stats(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.optimizer.to_prometheus(),
    )
}

async fn performance(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    to_json(&state.optimizer.get_performance_metrics())
}

async fn run_optimization_cycle(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    to_json(&state.optimizer.perform_optimization_cycle().await)
}

async fn cache_statistics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    to_json(&state.optimizer.cache().get_detailed_cache_statistics().await)
}

#[derive(Deserialize)]
struct WarmRequest {
    image_hashes: Vec<String>,
}

async fn warm_cache(
    State(state): State<AppState>,
    Json(request): Json<WarmRequest>,
) -> Result<Json<Value>, ApiError> {
    to_json(
        &state
            .optimizer
            .cache()
            .warm_cache_for_common_operations(&request.image_hashes)
            .await,
    )
}

/// Analyze a single image
///
/// # Request Format:
/// - multipart/form-data
/// - Field "image": the image file (PNG/JPEG/...)
/// - Field "params" (optional): JSON object of operation parameters
async fn analyze(
    State(state): State<AppState>,
    Path(operation): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let operation: Operation = operation.parse().map_err(processing_error)?;

    let mut image: Option<Vec<u8>> = None;
    let mut params = Params::new();

    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "image" => {
                let data = field.bytes().await.map_err(bad_request)?;
                image::guess_format(&data).map_err(|e| bad_request(format!("Invalid image: {}", e)))?;
                image = Some(data.to_vec());
            }
            "params" => {
                let text = field.text().await.map_err(bad_request)?;
                params = serde_json::from_str(&text)
                    .map_err(|e| bad_request(format!("Invalid params JSON: {}", e)))?;
            }
            _ => {}
        }
    }

    let image = image.ok_or_else(|| bad_request("No image provided"))?;
    let image_hash = content_hash(&image);

    let result = state
        .optimizer
        .optimize(operation, Arc::new(image), &image_hash, params)
        .await
        .map_err(processing_error)?;
    to_json(&result)
}

#[derive(Deserialize)]
struct BatchItemRequest {
    operation: String,
    /// Index into the uploaded "images" files
    image_index: Option<usize>,
    /// Hash of a previously uploaded image
    image_hash: Option<String>,
    #[serde(default)]
    params: Params,
}

/// Analyze several images in one request
///
/// # Request Format:
/// - multipart/form-data
/// - Field "images": zero or more image files
/// - Field "operations": JSON array of `{operation, image_index | image_hash, params}`
async fn process_batch(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut images: Vec<(String, Arc<Vec<u8>>)> = Vec::new();
    let mut items: Vec<BatchItemRequest> = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "images" => {
                let data = field.bytes().await.map_err(bad_request)?;
                image::guess_format(&data).map_err(|e| bad_request(format!("Invalid image: {}", e)))?;
                images.push((content_hash(&data), Arc::new(data.to_vec())));
            }
            "operations" => {
                let text = field.text().await.map_err(bad_request)?;
                items = serde_json::from_str(&text)
                    .map_err(|e| bad_request(format!("Invalid operations JSON: {}", e)))?;
            }
            _ => {}
        }
    }

    if items.is_empty() {
        return Err(bad_request("No operations provided"));
    }

    let operations = items
        .into_iter()
        .map(|item| {
            let uploaded = item.image_index.and_then(|i| images.get(i));
            BatchOperation {
                operation: item.operation,
                image_hash: uploaded
                    .map(|(hash, _)| hash.clone())
                    .or(item.image_hash)
                    .unwrap_or_default(),
                image_content: uploaded.map(|(_, bytes)| Arc::clone(bytes)),
                params: item.params,
            }
        })
        .collect();

    let result = state.optimizer.optimize_batch_processing(operations).await;
    info!(
        "Batch {} finished: {} successful, {} failed",
        result.batch_id, result.successful, result.failed
    );
    to_json(&result)
}

async fn batch_status(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.optimizer.batch_status(&batch_id).await {
        Some(status) => to_json(&status),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Unknown batch {}", batch_id)})),
        )),
    }
}

fn content_hash(data: &[u8]) -> String {
    format!("{:032x}", xxh3_128(data))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Json<Value>, ApiError> {
    serde_json::to_value(value).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("Failed to serialize response: {}", e)})),
        )
    })
}

fn bad_request(message: impl ToString) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message.to_string()})),
    )
}

fn processing_error(e: ProcessingError) -> ApiError {
    let status = match &e {
        ProcessingError::UnsupportedOperation(_) => StatusCode::BAD_REQUEST,
        ProcessingError::ImageUnavailable { .. } => StatusCode::NOT_FOUND,
        ProcessingError::BatchTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ProcessingError::QueueFull { .. }
        | ProcessingError::QueueStopped
        | ProcessingError::Remote(VisionError::CircuitOpen)
        | ProcessingError::Remote(VisionError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        ProcessingError::Remote(VisionError::Image { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        ProcessingError::Remote(_) | ProcessingError::DispatchFailed { .. } => StatusCode::BAD_GATEWAY,
        ProcessingError::TaskFailed(_) | ProcessingError::Cancelled => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    (
        status,
        Json(json!({
            "error": e.to_string(),
            "kind": e.kind(),
            "recoverable": e.is_recoverable(),
        })),
    )
}
