// Request batcher: coalesces concurrent vision requests into multi-image calls

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::core::config::BatchConfig;
use crate::core::errors::{ProcessingError, ProcessingResult};
use crate::core::types::{BatchRequest, Operation, Params};
use crate::services::vision::VisionService;

type Responder = oneshot::Sender<ProcessingResult<Value>>;

#[derive(Default)]
struct BatcherState {
    buckets: HashMap<Operation, Vec<BatchRequest>>,
    pending: HashMap<String, Responder>,
}

/// Snapshot of the batcher for metrics
#[derive(Debug, Clone, Serialize)]
pub struct BatcherStats {
    pub running: bool,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub queued_by_operation: BTreeMap<String, usize>,
    pub pending_futures: usize,
    pub batches_processed: u64,
    pub calls_dispatched: u64,
    pub requests_completed: u64,
    pub orphaned_results: u64,
}

/// Groups concurrently submitted requests per operation and dispatches every
/// parameter-identical sub-group as one `analyze_batch` call.
///
/// A bucket is flushed when it reaches `batch_size` or when the background
/// loop ticks (every `batch_timeout`). Each caller waits only for its own
/// result and gives up after the request's own timeout.
#[derive(Clone)]
pub struct VisionApiBatcher {
    inner: Arc<BatcherInner>,
}

struct BatcherInner {
    vision: Arc<dyn VisionService>,
    batch_size: usize,
    batch_timeout: Duration,
    state: Mutex<BatcherState>,
    running: AtomicBool,
    flush_loop: Mutex<Option<JoinHandle<()>>>,
    batches_processed: AtomicU64,
    calls_dispatched: AtomicU64,
    requests_completed: AtomicU64,
    orphaned_results: AtomicU64,
}

impl VisionApiBatcher {
    pub fn new(vision: Arc<dyn VisionService>, config: &BatchConfig) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                vision,
                batch_size: config.batch_size.max(1),
                batch_timeout: config.batch_timeout,
                state: Mutex::new(BatcherState::default()),
                running: AtomicBool::new(false),
                flush_loop: Mutex::new(None),
                batches_processed: AtomicU64::new(0),
                calls_dispatched: AtomicU64::new(0),
                requests_completed: AtomicU64::new(0),
                orphaned_results: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Launch the periodic flush loop. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak: Weak<BatcherInner> = Arc::downgrade(&self.inner);
        let period = self.inner.batch_timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => VisionApiBatcher { inner }.flush_all(),
                    None => break,
                }
            }
        });
        *self.inner.flush_loop.lock() = Some(handle);

        info!(
            "Vision batcher started (batch size {}, flush every {:?})",
            self.inner.batch_size, self.inner.batch_timeout
        );
    }

    /// Stop the flush loop and dispatch everything still queued.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.flush_loop.lock().take() {
            handle.abort();
        }
        self.flush_all();
        info!("Vision batcher stopped");
    }

    /// Queue a request and wait for its result.
    #[instrument(skip(self, request), fields(request_id = %request.request_id, operation = %request.operation))]
    pub async fn add_request(&self, request: BatchRequest) -> ProcessingResult<Value> {
        let (tx, mut rx) = oneshot::channel();
        let request_id = request.request_id.clone();
        let operation = request.operation;
        let timeout = request.timeout;

        let ready = {
            let mut state = self.inner.state.lock();
            state.pending.insert(request_id.clone(), tx);
            let bucket = state.buckets.entry(operation).or_default();
            bucket.push(request);
            // Without the flush loop nothing else would pick the bucket up.
            if bucket.len() >= self.inner.batch_size || !self.is_running() {
                Some(std::mem::take(bucket))
            } else {
                None
            }
        };
        if let Some(batch) = ready {
            self.process_bucket(operation, batch);
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProcessingError::Cancelled),
            Err(_) => {
                let still_pending = {
                    let mut state = self.inner.state.lock();
                    if let Some(bucket) = state.buckets.get_mut(&operation) {
                        bucket.retain(|r| r.request_id != request_id);
                    }
                    state.pending.remove(&request_id).is_some()
                };
                // The result may have been sent between the deadline and the lock.
                if !still_pending {
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                }
                warn!("Batch request {} timed out after {:?}", request_id, timeout);
                Err(ProcessingError::BatchTimeout {
                    request_id,
                    timeout_secs: timeout.as_secs_f64(),
                })
            }
        }
    }

    /// Dispatch every non-empty bucket.
    pub fn flush_all(&self) {
        let buckets: Vec<(Operation, Vec<BatchRequest>)> = {
            let mut state = self.inner.state.lock();
            state
                .buckets
                .iter_mut()
                .filter(|(_, requests)| !requests.is_empty())
                .map(|(op, requests)| (*op, std::mem::take(requests)))
                .collect()
        };
        for (operation, requests) in buckets {
            self.process_bucket(operation, requests);
        }
    }

    fn process_bucket(&self, operation: Operation, requests: Vec<BatchRequest>) {
        if requests.is_empty() {
            return;
        }
        self.inner.batches_processed.fetch_add(1, Ordering::Relaxed);

        let mut groups = group_by_params(requests);
        // Stable: equal priorities keep first-arrival order.
        groups.sort_by_key(|g| std::cmp::Reverse(g.priority));

        debug!(
            "Processing {} bucket: {} sub-group(s)",
            operation,
            groups.len()
        );
        for group in groups {
            self.dispatch_group(operation, group);
        }
    }

    fn dispatch_group(&self, operation: Operation, group: ParamGroup) {
        self.inner.calls_dispatched.fetch_add(1, Ordering::Relaxed);
        let batcher = self.clone();

        tokio::spawn(async move {
            let ParamGroup {
                params,
                request_ids,
                images,
                ..
            } = group;
            let expected = request_ids.len();

            let call = batcher.inner.vision.analyze_batch(operation, &params, images);
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(results)) if results.len() == expected => {
                    for (request_id, result) in request_ids.iter().zip(results) {
                        batcher.resolve(request_id, result.map_err(ProcessingError::from));
                    }
                }
                Ok(Ok(results)) => {
                    let reason = format!("expected {} results, got {}", expected, results.len());
                    batcher.fail_group(operation, &request_ids, reason);
                }
                Ok(Err(e)) if expected == 1 => {
                    batcher.resolve(&request_ids[0], Err(ProcessingError::Remote(e)));
                }
                Ok(Err(e)) => {
                    batcher.fail_group(operation, &request_ids, e.to_string());
                }
                Err(_) => {
                    batcher.fail_group(operation, &request_ids, "dispatch task panicked".into());
                }
            }
        });
    }

    fn fail_group(&self, operation: Operation, request_ids: &[String], reason: String) {
        warn!(
            "Batch dispatch for {} ({} requests) failed: {}",
            operation,
            request_ids.len(),
            reason
        );
        for request_id in request_ids {
            self.resolve(
                request_id,
                Err(ProcessingError::DispatchFailed {
                    operation: operation.to_string(),
                    reason: reason.clone(),
                }),
            );
        }
    }

    /// Deliver a result to its caller. A missing registration (timed out or
    /// abandoned caller) is counted and otherwise ignored.
    fn resolve(&self, request_id: &str, result: ProcessingResult<Value>) {
        let responder = self.inner.state.lock().pending.remove(request_id);
        let delivered = match responder {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        };
        if delivered {
            self.inner.requests_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!("Dropping result for abandoned request {}", request_id);
            self.inner.orphaned_results.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> BatcherStats {
        let state = self.inner.state.lock();
        BatcherStats {
            running: self.is_running(),
            batch_size: self.inner.batch_size,
            batch_timeout_ms: self.inner.batch_timeout.as_millis() as u64,
            queued_by_operation: state
                .buckets
                .iter()
                .filter(|(_, requests)| !requests.is_empty())
                .map(|(op, requests)| (op.to_string(), requests.len()))
                .collect(),
            pending_futures: state.pending.len(),
            batches_processed: self.inner.batches_processed.load(Ordering::Relaxed),
            calls_dispatched: self.inner.calls_dispatched.load(Ordering::Relaxed),
            requests_completed: self.inner.requests_completed.load(Ordering::Relaxed),
            orphaned_results: self.inner.orphaned_results.load(Ordering::Relaxed),
        }
    }
}

struct ParamGroup {
    params: Params,
    priority: u8,
    request_ids: Vec<String>,
    images: Vec<Arc<Vec<u8>>>,
}

/// Split a bucket into parameter-identical groups, keeping arrival order
/// both across and within groups.
fn group_by_params(requests: Vec<BatchRequest>) -> Vec<ParamGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<ParamGroup> = Vec::new();

    for request in requests {
        let canonical = serde_json::to_string(&request.params).unwrap_or_default();
        let slot = *index.entry(canonical).or_insert_with(|| {
            groups.push(ParamGroup {
                params: request.params.clone(),
                priority: 0,
                request_ids: Vec::new(),
                images: Vec::new(),
            });
            groups.len() - 1
        });
        let group = &mut groups[slot];
        group.priority = group.priority.max(request.priority.unwrap_or(0));
        group.request_ids.push(request.request_id);
        group.images.push(request.image_content);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{VisionError, VisionResult};
    use async_trait::async_trait;
    use serde_json::json;

    /// Echoes the threshold and image bytes back; records every batch call.
    #[derive(Default)]
    struct RecordingVision {
        calls: Mutex<Vec<(Operation, Params, usize)>>,
        delay: Duration,
        fail_image: Option<u8>,
        fail_call: bool,
    }

    #[async_trait]
    impl VisionService for RecordingVision {
        async fn analyze(
            &self,
            _operation: Operation,
            image: Arc<Vec<u8>>,
            params: &Params,
        ) -> VisionResult<Value> {
            if Some(image[0]) == self.fail_image {
                return Err(VisionError::Image {
                    index: 0,
                    message: "bad image".into(),
                });
            }
            Ok(json!({"image": image[0], "threshold": params.get("confidence_threshold")}))
        }

        async fn analyze_batch(
            &self,
            operation: Operation,
            params: &Params,
            images: Vec<Arc<Vec<u8>>>,
        ) -> VisionResult<Vec<VisionResult<Value>>> {
            self.calls.lock().push((operation, params.clone(), images.len()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_call {
                return Err(VisionError::Unavailable("remote down".into()));
            }
            let mut results = Vec::new();
            for image in images {
                results.push(self.analyze(operation, image, params).await);
            }
            Ok(results)
        }
    }

    fn config(batch_size: usize, batch_timeout: Duration) -> BatchConfig {
        BatchConfig {
            batch_size,
            batch_timeout,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn request(op: Operation, threshold: f64, image: u8) -> BatchRequest {
        let mut params = Params::new();
        params.insert("confidence_threshold".into(), json!(threshold));
        BatchRequest::new(
            format!("hash{}", image),
            Arc::new(vec![image]),
            op,
            params,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_groups_by_identical_params() {
        let vision = Arc::new(RecordingVision::default());
        let batcher = VisionApiBatcher::new(vision.clone(), &config(10, Duration::from_millis(50)));
        batcher.start();

        let (a1, a2, b) = tokio::join!(
            batcher.add_request(request(Operation::ObjectDetection, 0.5, 1)),
            batcher.add_request(request(Operation::ObjectDetection, 0.5, 2)),
            batcher.add_request(request(Operation::ObjectDetection, 0.9, 3)),
        );

        assert_eq!(a1.unwrap(), json!({"image": 1, "threshold": 0.5}));
        assert_eq!(a2.unwrap(), json!({"image": 2, "threshold": 0.5}));
        assert_eq!(b.unwrap(), json!({"image": 3, "threshold": 0.9}));

        let calls = vision.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        let mut sizes: Vec<usize> = calls.iter().map(|c| c.2).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);

        let stats = batcher.stats();
        assert_eq!(stats.calls_dispatched, 2);
        assert_eq!(stats.requests_completed, 3);
        assert_eq!(stats.pending_futures, 0);
        batcher.stop();
    }

    #[tokio::test]
    async fn test_operations_are_bucketed_separately() {
        let vision = Arc::new(RecordingVision::default());
        let batcher = VisionApiBatcher::new(vision.clone(), &config(10, Duration::from_millis(30)));
        batcher.start();

        let (a, b) = tokio::join!(
            batcher.add_request(request(Operation::ObjectDetection, 0.5, 1)),
            batcher.add_request(request(Operation::FaceDetection, 0.5, 2)),
        );
        assert!(a.is_ok() && b.is_ok());

        let ops: Vec<Operation> = vision.calls.lock().iter().map(|c| c.0).collect();
        assert_eq!(ops.len(), 2);
        assert!(ops.contains(&Operation::ObjectDetection));
        assert!(ops.contains(&Operation::FaceDetection));
        batcher.stop();
    }

    #[tokio::test]
    async fn test_full_bucket_dispatches_without_timer() {
        let vision = Arc::new(RecordingVision::default());
        let batcher = VisionApiBatcher::new(vision.clone(), &config(3, Duration::from_secs(3600)));
        batcher.start();

        let started = std::time::Instant::now();
        let (a, b, c) = tokio::join!(
            batcher.add_request(request(Operation::FaceDetection, 0.5, 1)),
            batcher.add_request(request(Operation::FaceDetection, 0.5, 2)),
            batcher.add_request(request(Operation::FaceDetection, 0.5, 3)),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(vision.calls.lock().len(), 1);
        batcher.stop();
    }

    #[tokio::test]
    async fn test_timeout_removes_queued_request() {
        let vision = Arc::new(RecordingVision::default());
        let batcher = VisionApiBatcher::new(vision.clone(), &config(10, Duration::from_secs(3600)));
        batcher.start();

        let mut req = request(Operation::ObjectDetection, 0.5, 1);
        req.timeout = Duration::from_millis(30);
        let err = batcher.add_request(req).await.unwrap_err();

        assert!(matches!(err, ProcessingError::BatchTimeout { .. }));
        assert!(err.is_recoverable());
        let stats = batcher.stats();
        assert_eq!(stats.pending_futures, 0);
        assert!(stats.queued_by_operation.is_empty());

        // Nothing is left to dispatch after stop.
        batcher.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(vision.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_late_result_after_timeout_is_noop() {
        let vision = Arc::new(RecordingVision {
            delay: Duration::from_millis(150),
            ..Default::default()
        });
        let batcher = VisionApiBatcher::new(vision.clone(), &config(1, Duration::from_secs(3600)));
        batcher.start();

        let mut req = request(Operation::ObjectDetection, 0.5, 1);
        req.timeout = Duration::from_millis(30);
        let err = batcher.add_request(req).await.unwrap_err();
        assert!(matches!(err, ProcessingError::BatchTimeout { .. }));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = batcher.stats();
        assert_eq!(stats.orphaned_results, 1);
        assert_eq!(stats.requests_completed, 0);
        assert_eq!(stats.pending_futures, 0);
        batcher.stop();
    }

    #[tokio::test]
    async fn test_per_image_failure_is_isolated() {
        let vision = Arc::new(RecordingVision {
            fail_image: Some(2),
            ..Default::default()
        });
        let batcher = VisionApiBatcher::new(vision.clone(), &config(2, Duration::from_secs(3600)));
        batcher.start();

        let (ok, bad) = tokio::join!(
            batcher.add_request(request(Operation::NaturalElements, 0.5, 1)),
            batcher.add_request(request(Operation::NaturalElements, 0.5, 2)),
        );
        assert!(ok.is_ok());
        assert!(matches!(
            bad,
            Err(ProcessingError::Remote(VisionError::Image { .. }))
        ));
        batcher.stop();
    }

    #[tokio::test]
    async fn test_failed_dispatch_fails_whole_group() {
        let vision = Arc::new(RecordingVision {
            fail_call: true,
            ..Default::default()
        });
        let batcher = VisionApiBatcher::new(vision.clone(), &config(2, Duration::from_secs(3600)));
        batcher.start();

        let (a, b) = tokio::join!(
            batcher.add_request(request(Operation::FaceDetection, 0.5, 1)),
            batcher.add_request(request(Operation::FaceDetection, 0.5, 2)),
        );
        for result in [a, b] {
            match result {
                Err(e @ ProcessingError::DispatchFailed { .. }) => assert!(e.is_recoverable()),
                other => panic!("unexpected result {:?}", other),
            }
        }
        batcher.stop();
    }

    #[tokio::test]
    async fn test_stopped_batcher_dispatches_immediately_and_stop_drains() {
        let vision = Arc::new(RecordingVision::default());
        let batcher = VisionApiBatcher::new(vision.clone(), &config(10, Duration::from_secs(3600)));
        assert!(!batcher.is_running());
        assert!(batcher
            .add_request(request(Operation::FaceDetection, 0.5, 1))
            .await
            .is_ok());

        batcher.start();
        let pending = {
            let batcher = batcher.clone();
            tokio::spawn(async move {
                batcher
                    .add_request(request(Operation::FaceDetection, 0.5, 2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            batcher.stats().queued_by_operation.get("detect_faces"),
            Some(&1)
        );

        batcher.stop();
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(vision.calls.lock().len(), 2);
    }

    #[test]
    fn test_grouping_keeps_arrival_order_and_priority() {
        let requests = vec![
            request(Operation::ObjectDetection, 0.5, 1),
            request(Operation::ObjectDetection, 0.9, 2).with_priority(5),
            request(Operation::ObjectDetection, 0.5, 3),
        ];
        let ids: Vec<String> = requests.iter().map(|r| r.request_id.clone()).collect();

        let groups = group_by_params(requests);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].request_ids, vec![ids[0].clone(), ids[2].clone()]);
        assert_eq!(groups[0].priority, 0);
        assert_eq!(groups[1].priority, 5);
    }
}
