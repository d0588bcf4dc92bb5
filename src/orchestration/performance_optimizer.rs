// Performance optimizer: cache, memory, batching and metrics around every
// remote analysis call

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::batcher::{BatcherStats, VisionApiBatcher};
use super::work_queue::{AsyncProcessingQueue, QueueStats};
use crate::core::config::Config;
use crate::core::errors::{ProcessingError, ProcessingResult};
use crate::core::types::{
    BatchItemResult, BatchOperation, BatchProcessingResult, BatchRequest, BatchState, BatchStatus,
    DetectionParams, DispatchMode, FaceDetectionParams, NaturalElementsParams, Operation,
    OperationParams, OptimizedResult, Params,
};
use crate::services::cache::{CacheCounterSnapshot, CacheService, EvictionReport};
use crate::services::memory::{MemoryManager, MemoryOptimizationReport, MemoryStatus};
use crate::services::vision::VisionService;
use crate::utils::metrics::{MetricsSnapshot, PerformanceMetrics};

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationCycleReport {
    /// RFC 3339
    pub timestamp: String,
    pub optimizations_performed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryOptimizationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction: Option<EvictionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub metrics: MetricsSnapshot,
    pub in_flight: usize,
    pub batching_active: bool,
    pub memory: MemoryStatus,
    pub queue: QueueStats,
    pub batcher: BatcherStats,
    pub cache: CacheCounterSnapshot,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Façade in front of the remote vision service.
///
/// Cache hits never reach the remote side. Misses are dispatched either
/// directly or through the batcher, which only kicks in under concurrent
/// load or when recent responses are slow.
#[derive(Clone)]
pub struct PerformanceOptimizer {
    inner: Arc<OptimizerInner>,
}

struct OptimizerInner {
    vision: Arc<dyn VisionService>,
    cache: CacheService,
    memory: MemoryManager,
    batcher: VisionApiBatcher,
    queue: AsyncProcessingQueue,
    metrics: PerformanceMetrics,
    in_flight: AtomicUsize,
    request_timeout: Duration,
    slow_response_threshold: Duration,
    optimization_interval: Duration,
    cache_max_memory_mb: f64,
    cycle_loop: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceOptimizer {
    pub fn new(
        config: &Config,
        vision: Arc<dyn VisionService>,
        cache: CacheService,
        memory: MemoryManager,
    ) -> Self {
        let batcher = VisionApiBatcher::new(Arc::clone(&vision), &config.batch);
        let queue = AsyncProcessingQueue::new(&config.queue);

        Self {
            inner: Arc::new(OptimizerInner {
                vision,
                cache,
                memory,
                batcher,
                queue,
                metrics: PerformanceMetrics::new(),
                in_flight: AtomicUsize::new(0),
                request_timeout: config.batch.request_timeout,
                slow_response_threshold: config.optimizer.slow_response_threshold,
                optimization_interval: config.optimization_interval(),
                cache_max_memory_mb: config.cache_max_memory_mb(),
                cycle_loop: Mutex::new(None),
            }),
        }
    }

    pub fn cache(&self) -> &CacheService {
        &self.inner.cache
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.inner.memory
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.inner.metrics
    }

    /// Start the batcher, the work queue and the periodic optimization cycle.
    pub fn start(&self) {
        self.inner.batcher.start();
        self.inner.queue.start();

        let period = self.inner.optimization_interval;
        if period.is_zero() {
            info!("Performance optimizer started (periodic cycle disabled)");
            return;
        }
        let mut cycle_loop = self.inner.cycle_loop.lock();
        if cycle_loop.is_some() {
            return;
        }
        let weak: Weak<OptimizerInner> = Arc::downgrade(&self.inner);
        *cycle_loop = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let report = PerformanceOptimizer { inner }.perform_optimization_cycle().await;
                debug!("Optimization cycle: {:?}", report.optimizations_performed);
            }
        }));
        info!("Performance optimizer started (cycle every {:?})", period);
    }

    /// Stop background work; queued batcher requests are flushed first.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.cycle_loop.lock().take() {
            handle.abort();
        }
        self.inner.batcher.stop();
        self.inner.queue.stop();
        info!("Performance optimizer shut down");
    }

    pub fn should_use_batching(&self) -> bool {
        self.inner.batcher.is_running()
            && (self.inner.in_flight.load(Ordering::SeqCst) > 1
                || self.inner.metrics.average_response_time() > self.inner.slow_response_threshold)
    }

    pub async fn optimize_detection_request(
        &self,
        image: Arc<Vec<u8>>,
        image_hash: &str,
        params: &DetectionParams,
    ) -> ProcessingResult<OptimizedResult> {
        self.optimize(DetectionParams::OPERATION, image, image_hash, params.to_params())
            .await
    }

    pub async fn optimize_natural_elements_analysis(
        &self,
        image: Arc<Vec<u8>>,
        image_hash: &str,
        params: &NaturalElementsParams,
    ) -> ProcessingResult<OptimizedResult> {
        self.optimize(NaturalElementsParams::OPERATION, image, image_hash, params.to_params())
            .await
    }

    pub async fn optimize_face_detection(
        &self,
        image: Arc<Vec<u8>>,
        image_hash: &str,
        params: &FaceDetectionParams,
    ) -> ProcessingResult<OptimizedResult> {
        self.optimize(FaceDetectionParams::OPERATION, image, image_hash, params.to_params())
            .await
    }

    /// Untyped entry point, used for batch items and the HTTP surface.
    #[instrument(skip(self, image, params), fields(operation = %operation, image_hash = %image_hash))]
    pub async fn optimize(
        &self,
        operation: Operation,
        image: Arc<Vec<u8>>,
        image_hash: &str,
        params: Params,
    ) -> ProcessingResult<OptimizedResult> {
        let inner = &self.inner;
        let started = Instant::now();
        let _in_flight = InFlightGuard::enter(&inner.in_flight);
        inner.metrics.record_operation(operation.as_str());

        let result_type = operation.result_type();
        if let Some(cached) = inner.cache.get_result(result_type, image_hash, &params).await {
            inner.metrics.record_cache_hit();
            let elapsed = started.elapsed();
            inner.metrics.record_response_time(elapsed);
            return Ok(OptimizedResult {
                operation,
                image_hash: image_hash.to_string(),
                result: cached,
                from_cache: true,
                dispatch: DispatchMode::Cache,
                processing_time_ms: elapsed.as_secs_f64() * 1000.0,
            });
        }
        inner.metrics.record_cache_miss();

        if inner.memory.check_memory_pressure() {
            inner.memory.optimize_memory();
            inner.metrics.record_memory_optimization();
        }

        let dispatch = if self.should_use_batching() {
            DispatchMode::Batched
        } else {
            DispatchMode::Direct
        };
        let outcome = match dispatch {
            DispatchMode::Batched => {
                inner.metrics.record_batched_call();
                let request = BatchRequest::new(
                    image_hash,
                    Arc::clone(&image),
                    operation,
                    params.clone(),
                    inner.request_timeout,
                );
                inner.batcher.add_request(request).await
            }
            _ => {
                inner.metrics.record_individual_call();
                inner
                    .vision
                    .analyze(operation, Arc::clone(&image), &params)
                    .await
                    .map_err(ProcessingError::from)
            }
        };

        let result = match outcome {
            Ok(value) => {
                inner.cache.set_result(result_type, image_hash, &params, &value).await;
                inner.memory.cache_image_safely(image_hash, image);
                Ok(value)
            }
            Err(e) => {
                inner.metrics.record_failure();
                warn!("{} failed for {}: {}", operation, image_hash, e);
                Err(e)
            }
        };

        let elapsed = started.elapsed();
        inner.metrics.record_response_time(elapsed);
        inner.metrics.record_memory_usage(inner.memory.get_memory_usage());

        result.map(|value| OptimizedResult {
            operation,
            image_hash: image_hash.to_string(),
            result: value,
            from_cache: false,
            dispatch,
            processing_time_ms: elapsed.as_secs_f64() * 1000.0,
        })
    }

    /// Run a list of operations through the work queue and record the
    /// batch's progress in the cache.
    ///
    /// Items beyond the queue's free capacity fail individually with
    /// `QueueFull` (recoverable), so a large batch may partly succeed.
    #[instrument(skip(self, operations), fields(count = operations.len()))]
    pub async fn optimize_batch_processing(&self, operations: Vec<BatchOperation>) -> BatchProcessingResult {
        let started = Instant::now();
        let batch_id = uuid::Uuid::new_v4().to_string();
        let total = operations.len();
        self.write_batch_status(&batch_id, BatchState::Processing, total, 0, 0)
            .await;

        let mut pending: Vec<BoxFuture<'static, BatchItemResult>> = Vec::with_capacity(total);
        for (index, item) in operations.into_iter().enumerate() {
            let BatchOperation {
                operation: name,
                image_hash,
                image_content,
                params,
            } = item;

            let prepared = name.parse::<Operation>().and_then(|operation| {
                image_content
                    .or_else(|| self.inner.memory.get_cached_image(&image_hash))
                    .map(|image| (operation, image))
                    .ok_or_else(|| ProcessingError::ImageUnavailable {
                        image_hash: image_hash.clone(),
                    })
            });
            let (operation, image) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    let failed = item_result(index, name, image_hash, Err(e));
                    pending.push(async move { failed }.boxed());
                    continue;
                }
            };

            let this = self.clone();
            let hash = image_hash.clone();
            let task = move || async move { this.optimize(operation, image, &hash, params).await };

            let future: BoxFuture<'static, ProcessingResult<OptimizedResult>> =
                if self.inner.queue.is_running() {
                    match self.inner.queue.submit_task(task) {
                        Ok(handle) => handle.boxed(),
                        Err(e) => async move { Err(e) }.boxed(),
                    }
                } else {
                    task().boxed()
                };
            pending.push(
                async move { item_result(index, name, image_hash, future.await) }.boxed(),
            );
        }

        let results = join_all(pending).await;
        let successful = results.iter().filter(|r| r.success).count();
        let failed = total - successful;

        self.write_batch_status(&batch_id, BatchState::Completed, total, successful, failed)
            .await;
        info!(
            "Batch {} completed: {}/{} successful",
            batch_id, successful, total
        );

        BatchProcessingResult {
            batch_id,
            total,
            successful,
            failed,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            results,
        }
    }

    async fn write_batch_status(
        &self,
        batch_id: &str,
        status: BatchState,
        total: usize,
        successful: usize,
        failed: usize,
    ) {
        let record = BatchStatus {
            batch_id: batch_id.to_string(),
            status,
            total,
            successful,
            failed,
            updated_at: Utc::now(),
        };
        match serde_json::to_value(&record) {
            Ok(value) => {
                self.inner
                    .cache
                    .set_batch_processing_status(batch_id, &value)
                    .await;
            }
            Err(e) => warn!("Failed to encode batch status {}: {}", batch_id, e),
        }
    }

    pub async fn batch_status(&self, batch_id: &str) -> Option<BatchStatus> {
        let value = self.inner.cache.get_batch_processing_status(batch_id).await?;
        serde_json::from_value(value).ok()
    }

    /// Reclaim memory under pressure and evict cache entries over budget.
    pub async fn perform_optimization_cycle(&self) -> OptimizationCycleReport {
        let inner = &self.inner;
        let mut report = OptimizationCycleReport {
            timestamp: Utc::now().to_rfc3339(),
            optimizations_performed: Vec::new(),
            memory: None,
            eviction: None,
            error: None,
        };

        if inner.memory.check_memory_pressure() {
            let memory = inner.memory.optimize_memory();
            inner.metrics.record_memory_optimization();
            report.optimizations_performed.push(format!(
                "memory_optimization ({:.1}MB freed)",
                memory.memory_freed_mb
            ));
            report.memory = Some(memory);
        }

        if inner.cache.is_enabled() {
            let eviction = inner
                .cache
                .implement_lru_eviction(inner.cache_max_memory_mb)
                .await;
            if eviction.evicted_keys > 0 {
                report
                    .optimizations_performed
                    .push(format!("cache_eviction ({} keys)", eviction.evicted_keys));
            }
            if let Some(e) = &eviction.error {
                report.error = Some(format!("cache eviction: {}", e));
            }
            report.eviction = Some(eviction);
        }

        inner.metrics.record_memory_usage(inner.memory.get_memory_usage());
        report
    }

    pub fn get_performance_metrics(&self) -> PerformanceReport {
        PerformanceReport {
            metrics: self.inner.metrics.snapshot(),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            batching_active: self.should_use_batching(),
            memory: self.inner.memory.status(),
            queue: self.inner.queue.get_stats(),
            batcher: self.inner.batcher.stats(),
            cache: self.inner.cache.counters(),
        }
    }

    /// Prometheus exposition: request metrics plus component gauges.
    pub fn to_prometheus(&self) -> String {
        let report = self.get_performance_metrics();
        let mut out = self.inner.metrics.to_prometheus();
        let gauges = [
            ("vision_in_flight_requests", report.in_flight as f64),
            ("vision_memory_usage_mb", report.memory.current_mb),
            ("vision_soft_cache_entries", report.memory.soft_cache_entries as f64),
            ("vision_queue_size", report.queue.queue_size as f64),
            ("vision_queue_processed_total", report.queue.processed_count as f64),
            ("vision_queue_failed_total", report.queue.failed_count as f64),
            ("vision_batcher_calls_dispatched_total", report.batcher.calls_dispatched as f64),
            ("vision_batcher_orphaned_results_total", report.batcher.orphaned_results as f64),
            ("vision_cache_errors_total", report.cache.errors as f64),
        ];
        for (name, value) in gauges {
            out.push_str(&format!("\n# TYPE {} gauge\n{} {}\n", name, name, value));
        }
        out
    }
}

fn item_result(
    index: usize,
    operation: String,
    image_hash: String,
    outcome: ProcessingResult<OptimizedResult>,
) -> BatchItemResult {
    match outcome {
        Ok(result) => BatchItemResult {
            index,
            operation,
            image_hash,
            success: true,
            result: Some(result),
            error: None,
            error_kind: None,
            recoverable: None,
        },
        Err(e) => BatchItemResult {
            index,
            operation,
            image_hash,
            success: false,
            result: None,
            error: Some(e.to_string()),
            error_kind: Some(e.kind()),
            recoverable: Some(e.is_recoverable()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{VisionError, VisionResult};
    use crate::services::cache::{CacheBackend, MemoryBackend, ResultType};
    use crate::services::memory::MemoryProbe;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct FakeVision {
        single_calls: AtomicUsize,
        batch_calls: AtomicUsize,
        delay: Duration,
        fail_status: Option<u16>,
    }

    #[async_trait]
    impl VisionService for FakeVision {
        async fn analyze(
            &self,
            operation: Operation,
            image: Arc<Vec<u8>>,
            _params: &Params,
        ) -> VisionResult<Value> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(status) = self.fail_status {
                return Err(VisionError::Status {
                    status,
                    body: "rejected".into(),
                });
            }
            Ok(json!({"operation": operation.as_str(), "bytes": image.len(), "objects": []}))
        }

        async fn analyze_batch(
            &self,
            operation: Operation,
            params: &Params,
            images: Vec<Arc<Vec<u8>>>,
        ) -> VisionResult<Vec<VisionResult<Value>>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            let mut results = Vec::new();
            for image in images {
                results.push(self.analyze(operation, image, params).await);
            }
            Ok(results)
        }
    }

    struct FixedProbe(AtomicU64);

    impl MemoryProbe for FixedProbe {
        fn resident_bytes(&self) -> Option<u64> {
            Some(self.0.load(Ordering::SeqCst))
        }
    }

    struct Harness {
        optimizer: PerformanceOptimizer,
        vision: Arc<FakeVision>,
        backend: Arc<MemoryBackend>,
    }

    fn harness(vision: FakeVision, resident_mb: u64) -> Harness {
        harness_with_config(Config::default(), vision, resident_mb)
    }

    fn harness_with_config(config: Config, vision: FakeVision, resident_mb: u64) -> Harness {
        let vision = Arc::new(vision);
        let backend = Arc::new(MemoryBackend::new());
        let cache = CacheService::with_backend(backend.clone(), "v1");
        let memory = MemoryManager::with_probe(
            &config.memory,
            Box::new(FixedProbe(AtomicU64::new(resident_mb * 1024 * 1024))),
        );
        let optimizer = PerformanceOptimizer::new(&config, vision.clone(), cache, memory);
        Harness {
            optimizer,
            vision,
            backend,
        }
    }

    fn image() -> Arc<Vec<u8>> {
        Arc::new(vec![1, 2, 3, 4])
    }

    #[tokio::test]
    async fn test_second_identical_request_is_served_from_cache() {
        let h = harness(FakeVision::default(), 100);
        let params = DetectionParams::default();

        let first = h
            .optimizer
            .optimize_detection_request(image(), "abc123", &params)
            .await
            .unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.dispatch, DispatchMode::Direct);

        let second = h
            .optimizer
            .optimize_detection_request(image(), "abc123", &params)
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.dispatch, DispatchMode::Cache);
        assert_eq!(second.result, first.result);
        assert_eq!(h.vision.single_calls.load(Ordering::SeqCst), 1);

        assert_eq!(h.backend.len(), 1);
        let key = h
            .optimizer
            .cache()
            .generate_cache_key(ResultType::DetectionResults, "abc123", &params.to_params());
        assert!(h.backend.get(&key).await.unwrap().is_some());

        let m = h.optimizer.get_performance_metrics().metrics;
        assert_eq!(m.cache_hits, 1);
        assert_eq!(m.cache_misses, 1);
        assert_eq!(m.individual_api_calls, 1);
        assert_eq!(m.batched_api_calls, 0);
        assert_eq!(m.response_time_samples, 2);
    }

    #[tokio::test]
    async fn test_miss_writes_cache_exactly_once() {
        let h = harness(FakeVision::default(), 100);
        let params = NaturalElementsParams::default();

        h.optimizer
            .optimize_natural_elements_analysis(image(), "img-1", &params)
            .await
            .unwrap();

        assert_eq!(h.optimizer.cache().counters().sets, 1);
        assert_eq!(h.backend.len(), 1);
        let cached = h
            .optimizer
            .cache()
            .get_result(ResultType::NaturalElements, "img-1", &params.to_params())
            .await;
        assert!(cached.is_some());
        assert!(h.optimizer.memory().get_cached_image("img-1").is_some());
    }

    #[tokio::test]
    async fn test_batched_miss_writes_cache_exactly_once() {
        let h = harness(FakeVision::default(), 100);
        h.optimizer.start();
        h.optimizer.metrics().record_response_time(Duration::from_secs(3));
        let params = NaturalElementsParams::default();

        let result = h
            .optimizer
            .optimize_natural_elements_analysis(image(), "img-2", &params)
            .await
            .unwrap();
        assert_eq!(result.dispatch, DispatchMode::Batched);
        assert_eq!(h.vision.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.optimizer.cache().counters().sets, 1);
        assert_eq!(h.backend.len(), 1);
        h.optimizer.shutdown();
    }

    #[tokio::test]
    async fn test_remote_failure_propagates_and_is_not_cached() {
        let h = harness(
            FakeVision {
                fail_status: Some(400),
                ..Default::default()
            },
            100,
        );

        let err = h
            .optimizer
            .optimize_face_detection(image(), "bad", &FaceDetectionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessingError::Remote(VisionError::Status { status: 400, .. })
        ));
        assert!(!err.is_recoverable());
        assert!(h.backend.is_empty());

        let m = h.optimizer.get_performance_metrics().metrics;
        assert_eq!(m.failed_requests, 1);
        assert_eq!(m.response_time_samples, 1);
    }

    #[tokio::test]
    async fn test_batched_remote_failure_is_not_cached() {
        let h = harness(
            FakeVision {
                fail_status: Some(400),
                ..Default::default()
            },
            100,
        );
        h.optimizer.start();
        h.optimizer.metrics().record_response_time(Duration::from_secs(3));

        let err = h
            .optimizer
            .optimize_face_detection(image(), "bad", &FaceDetectionParams::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessingError::Remote(VisionError::Status { status: 400, .. })
        ));
        assert_eq!(h.vision.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.optimizer.cache().counters().sets, 0);
        assert!(h.backend.is_empty());
        assert_eq!(h.optimizer.get_performance_metrics().metrics.failed_requests, 1);
        h.optimizer.shutdown();
    }

    #[tokio::test]
    async fn test_zero_interval_disables_cycle_loop() {
        let mut config = Config::default();
        config.optimizer.optimization_interval = Duration::ZERO;
        assert!(config.validate().is_ok());

        let h = harness_with_config(config, FakeVision::default(), 100);
        h.optimizer.start();
        assert!(h.optimizer.inner.cycle_loop.lock().is_none());
        assert!(h.optimizer.inner.batcher.is_running());

        let report = h.optimizer.perform_optimization_cycle().await;
        assert!(report.error.is_none());
        h.optimizer.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_load_switches_to_batching() {
        let h = harness(
            FakeVision {
                delay: Duration::from_millis(50),
                ..Default::default()
            },
            100,
        );
        h.optimizer.start();
        let params = DetectionParams::default();

        let (a, b) = tokio::join!(
            h.optimizer.optimize_detection_request(image(), "first", &params),
            h.optimizer.optimize_detection_request(image(), "second", &params),
        );
        assert_eq!(a.unwrap().dispatch, DispatchMode::Direct);
        assert_eq!(b.unwrap().dispatch, DispatchMode::Batched);

        let m = h.optimizer.get_performance_metrics().metrics;
        assert_eq!(m.batched_api_calls, 1);
        assert_eq!(m.individual_api_calls, 1);
        assert_eq!(m.batch_efficiency_ratio, 0.5);
        assert_eq!(h.vision.batch_calls.load(Ordering::SeqCst), 1);
        h.optimizer.shutdown();
    }

    #[tokio::test]
    async fn test_slow_history_switches_to_batching() {
        let h = harness(FakeVision::default(), 100);
        assert!(!h.optimizer.should_use_batching());

        h.optimizer.start();
        assert!(!h.optimizer.should_use_batching());
        h.optimizer.metrics().record_response_time(Duration::from_secs(3));
        assert!(h.optimizer.should_use_batching());

        let result = h
            .optimizer
            .optimize_face_detection(image(), "slow", &FaceDetectionParams::default())
            .await
            .unwrap();
        assert_eq!(result.dispatch, DispatchMode::Batched);
        h.optimizer.shutdown();
        assert!(!h.optimizer.should_use_batching());
    }

    #[tokio::test]
    async fn test_memory_pressure_triggers_reclaim() {
        // Default budget is 2048MB; 1900MB is above the 80% threshold.
        let h = harness(FakeVision::default(), 1900);
        h.optimizer
            .optimize_detection_request(image(), "pressured", &DetectionParams::default())
            .await
            .unwrap();

        let report = h.optimizer.get_performance_metrics();
        assert_eq!(report.metrics.memory_optimizations, 1);
        assert!(report.memory.under_pressure);
        // Pressure persists, so the image is not retained.
        assert!(h.optimizer.memory().get_cached_image("pressured").is_none());
        assert_eq!(report.metrics.peak_memory_mb, 1900.0);
    }

    #[tokio::test]
    async fn test_batch_processing_reports_per_item() {
        let h = harness(FakeVision::default(), 100);
        h.optimizer.start();

        // Seed the soft image cache so the third item can omit its bytes.
        h.optimizer.memory().cache_image_safely("known", image());

        let operations = vec![
            BatchOperation {
                operation: "detect_objects_enhanced".into(),
                image_hash: "a".into(),
                image_content: Some(image()),
                params: DetectionParams::default().to_params(),
            },
            BatchOperation {
                operation: "extract_text".into(),
                image_hash: "b".into(),
                image_content: Some(image()),
                params: Params::new(),
            },
            BatchOperation {
                operation: "detect_faces".into(),
                image_hash: "known".into(),
                image_content: None,
                params: Params::new(),
            },
            BatchOperation {
                operation: "analyze_natural_elements".into(),
                image_hash: "missing".into(),
                image_content: None,
                params: Params::new(),
            },
        ];

        let batch = h.optimizer.optimize_batch_processing(operations).await;
        assert_eq!(batch.total, 4);
        assert_eq!(batch.successful, 2);
        assert_eq!(batch.failed, 2);

        let by_index = |i: usize| batch.results.iter().find(|r| r.index == i).unwrap();
        assert!(by_index(0).success);
        assert_eq!(by_index(1).error_kind, Some("unsupported_operation"));
        assert_eq!(by_index(1).recoverable, Some(false));
        assert!(by_index(2).success);
        assert_eq!(by_index(3).error_kind, Some("image_unavailable"));

        let status = h.optimizer.batch_status(&batch.batch_id).await.unwrap();
        assert_eq!(status.status, BatchState::Completed);
        assert_eq!(status.successful, 2);
        assert_eq!(status.failed, 2);
        assert!(h.optimizer.batch_status("unknown-batch").await.is_none());

        let queue = h.optimizer.get_performance_metrics().queue;
        assert_eq!(queue.processed_count, 2);
        h.optimizer.shutdown();
    }

    #[tokio::test]
    async fn test_batch_processing_runs_directly_without_queue() {
        let h = harness(FakeVision::default(), 100);
        let batch = h
            .optimizer
            .optimize_batch_processing(vec![BatchOperation {
                operation: "detect_faces".into(),
                image_hash: "direct".into(),
                image_content: Some(image()),
                params: Params::new(),
            }])
            .await;
        assert_eq!(batch.successful, 1);
        assert_eq!(h.optimizer.get_performance_metrics().queue.processed_count, 0);
    }

    #[tokio::test]
    async fn test_optimization_cycle() {
        let h = harness(FakeVision::default(), 1900);
        let report = h.optimizer.perform_optimization_cycle().await;

        assert!(chrono::DateTime::parse_from_rfc3339(&report.timestamp).is_ok());
        assert!(report.memory.is_some());
        assert!(report.optimizations_performed[0].starts_with("memory_optimization"));
        let eviction = report.eviction.unwrap();
        assert!(!eviction.eviction_needed);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_is_transparent() {
        let config = Config::default();
        let vision = Arc::new(FakeVision::default());
        let optimizer = PerformanceOptimizer::new(
            &config,
            vision.clone(),
            CacheService::disabled(),
            MemoryManager::with_probe(&config.memory, Box::new(FixedProbe(AtomicU64::new(0)))),
        );

        for _ in 0..2 {
            let result = optimizer
                .optimize_face_detection(image(), "same", &FaceDetectionParams::default())
                .await
                .unwrap();
            assert!(!result.from_cache);
        }
        assert_eq!(vision.single_calls.load(Ordering::SeqCst), 2);

        let report = optimizer.perform_optimization_cycle().await;
        assert!(report.eviction.is_none());
    }

    #[tokio::test]
    async fn test_metrics_without_traffic() {
        let h = harness(FakeVision::default(), 100);
        let report = h.optimizer.get_performance_metrics();
        assert_eq!(report.metrics.batch_efficiency_ratio, 0.0);
        assert_eq!(report.metrics.cache_hit_rate, 0.0);
        assert_eq!(report.in_flight, 0);
        assert!(!report.batching_active);

        let text = h.optimizer.to_prometheus();
        assert!(text.contains("vision_cache_hit_rate 0"));
        assert!(text.contains("vision_queue_size 0"));
    }
}
