// Bounded async work queue with a fixed worker pool

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::core::config::QueueConfig;
use crate::core::errors::{ProcessingError, ProcessingResult};

/// How long an idle worker waits for a task before re-checking shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Pause after a task panicked
const PANIC_BACKOFF: Duration = Duration::from_millis(50);

enum TaskOutcome {
    Succeeded,
    Failed,
    Panicked,
}

/// Type-erased job; the result travels through its own oneshot channel.
struct QueueTask {
    run: BoxFuture<'static, TaskOutcome>,
}

/// Future resolving to the result of a submitted task.
///
/// Yields `ProcessingError::Cancelled` if the queue was stopped before the
/// task ran.
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<ProcessingResult<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = ProcessingResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ProcessingError::Cancelled)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub is_running: bool,
    pub active_workers: usize,
    pub busy_workers: usize,
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub processed_count: u64,
    pub failed_count: u64,
    pub success_rate: f64,
}

#[derive(Clone)]
pub struct AsyncProcessingQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    max_workers: usize,
    max_queue_size: usize,
    running: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<QueueTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active_workers: AtomicUsize,
    busy_workers: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl AsyncProcessingQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                max_workers: config.max_workers.max(1),
                max_queue_size: config.max_queue_size.max(1),
                running: AtomicBool::new(false),
                sender: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
                active_workers: AtomicUsize::new(0),
                busy_workers: AtomicUsize::new(0),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Spawn `max_workers` worker loops over a fresh bounded channel.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = mpsc::channel::<QueueTask>(self.inner.max_queue_size);
        let receiver = Arc::new(tokio::sync::Mutex::new(rx));
        *self.inner.sender.lock() = Some(tx);

        let mut workers = self.inner.workers.lock();
        for worker_id in 0..self.inner.max_workers {
            let inner = Arc::clone(&self.inner);
            let receiver = Arc::clone(&receiver);
            workers.push(tokio::spawn(worker_loop(worker_id, inner, receiver)));
        }

        info!(
            "Processing queue started ({} workers, capacity {})",
            self.inner.max_workers, self.inner.max_queue_size
        );
    }

    /// Stop accepting work and abort the workers. Tasks still queued resolve
    /// their handles with `Cancelled`.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.sender.lock().take();
        for handle in self.inner.workers.lock().drain(..) {
            handle.abort();
        }
        self.inner.active_workers.store(0, Ordering::SeqCst);
        self.inner.busy_workers.store(0, Ordering::SeqCst);
        info!("Processing queue stopped");
    }

    /// Enqueue a task without waiting for capacity.
    pub fn submit_task<F, Fut, T>(&self, f: F) -> ProcessingResult<TaskHandle<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ProcessingResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let sender = match self.inner.sender.lock().as_ref() {
            Some(sender) if self.is_running() => sender.clone(),
            _ => return Err(ProcessingError::QueueStopped),
        };

        let (tx, rx) = oneshot::channel();
        let run = async move {
            match AssertUnwindSafe(async move { f().await }).catch_unwind().await {
                Ok(Ok(value)) => {
                    let _ = tx.send(Ok(value));
                    TaskOutcome::Succeeded
                }
                Ok(Err(e)) => {
                    let _ = tx.send(Err(e));
                    TaskOutcome::Failed
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    let _ = tx.send(Err(ProcessingError::TaskFailed(message)));
                    TaskOutcome::Panicked
                }
            }
        }
        .boxed();

        match sender.try_send(QueueTask { run }) {
            Ok(()) => Ok(TaskHandle { rx }),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ProcessingError::QueueFull {
                max_queue_size: self.inner.max_queue_size,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ProcessingError::QueueStopped),
        }
    }

    pub fn get_stats(&self) -> QueueStats {
        let queue_size = self
            .inner
            .sender
            .lock()
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0);
        let processed = self.inner.processed.load(Ordering::Relaxed);
        let failed = self.inner.failed.load(Ordering::Relaxed);

        QueueStats {
            is_running: self.is_running(),
            active_workers: self.inner.active_workers.load(Ordering::Relaxed),
            busy_workers: self.inner.busy_workers.load(Ordering::Relaxed),
            queue_size,
            max_queue_size: self.inner.max_queue_size,
            processed_count: processed,
            failed_count: failed,
            success_rate: processed as f64 / (processed + failed).max(1) as f64,
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    inner: Arc<QueueInner>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueTask>>>,
) {
    inner.active_workers.fetch_add(1, Ordering::SeqCst);
    debug!("Worker {} started", worker_id);

    while inner.running.load(Ordering::SeqCst) {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::time::timeout(POLL_INTERVAL, rx.recv()).await
        };

        let task = match next {
            Ok(Some(task)) => task,
            Ok(None) => break,
            Err(_) => continue,
        };

        inner.busy_workers.fetch_add(1, Ordering::SeqCst);
        let outcome = task.run.await;
        inner.busy_workers.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            TaskOutcome::Succeeded => {
                inner.processed.fetch_add(1, Ordering::Relaxed);
            }
            TaskOutcome::Failed => {
                inner.failed.fetch_add(1, Ordering::Relaxed);
            }
            TaskOutcome::Panicked => {
                inner.failed.fetch_add(1, Ordering::Relaxed);
                error!("Worker {} task panicked", worker_id);
                tokio::time::sleep(PANIC_BACKOFF).await;
            }
        }
    }

    // `stop()` already zeroed the gauge when it aborted the pool.
    let _ = inner
        .active_workers
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    debug!("Worker {} exiting", worker_id);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}
