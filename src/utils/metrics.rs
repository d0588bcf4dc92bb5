use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of most recent response times kept for averages and percentiles
pub const RESPONSE_TIME_WINDOW: usize = 100;

/// Request-path metrics of the optimizer.
///
/// Counters and the response-time window share one lock so that a snapshot
/// is always internally consistent.
#[derive(Clone)]
pub struct PerformanceMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    state: Mutex<MetricsState>,
    requests_by_operation: DashMap<String, AtomicU64>,
    start_time: Instant,
}

#[derive(Default)]
struct MetricsState {
    batched_api_calls: u64,
    individual_api_calls: u64,
    cache_hits: u64,
    cache_misses: u64,
    memory_optimizations: u64,
    failed_requests: u64,
    response_times_ms: VecDeque<f64>,
    average_response_time_ms: f64,
    peak_memory_mb: f64,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                state: Mutex::new(MetricsState::default()),
                requests_by_operation: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_cache_hit(&self) {
        self.inner.state.lock().cache_hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.inner.state.lock().cache_misses += 1;
    }

    pub fn record_batched_call(&self) {
        self.inner.state.lock().batched_api_calls += 1;
    }

    pub fn record_individual_call(&self) {
        self.inner.state.lock().individual_api_calls += 1;
    }

    pub fn record_memory_optimization(&self) {
        self.inner.state.lock().memory_optimizations += 1;
    }

    pub fn record_failure(&self) {
        self.inner.state.lock().failed_requests += 1;
    }

    pub fn record_operation(&self, operation: &str) {
        self.inner
            .requests_by_operation
            .entry(operation.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_time(&self, elapsed: Duration) {
        let mut state = self.inner.state.lock();
        if state.response_times_ms.len() == RESPONSE_TIME_WINDOW {
            state.response_times_ms.pop_front();
        }
        state.response_times_ms.push_back(elapsed.as_secs_f64() * 1000.0);
        state.average_response_time_ms = mean(&state.response_times_ms);
    }

    pub fn record_memory_usage(&self, memory_mb: f64) {
        let mut state = self.inner.state.lock();
        if memory_mb > state.peak_memory_mb {
            state.peak_memory_mb = memory_mb;
        }
    }

    /// Mean of the response-time window
    pub fn average_response_time(&self) -> Duration {
        let avg_ms = self.inner.state.lock().average_response_time_ms;
        Duration::from_secs_f64(avg_ms.max(0.0) / 1000.0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.inner.state.lock();
        let api_calls = state.batched_api_calls + state.individual_api_calls;
        let lookups = state.cache_hits + state.cache_misses;
        let samples: Vec<f64> = state.response_times_ms.iter().copied().collect();

        MetricsSnapshot {
            batched_api_calls: state.batched_api_calls,
            individual_api_calls: state.individual_api_calls,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            memory_optimizations: state.memory_optimizations,
            failed_requests: state.failed_requests,
            batch_efficiency_ratio: state.batched_api_calls as f64 / api_calls.max(1) as f64,
            cache_hit_rate: state.cache_hits as f64 / lookups.max(1) as f64,
            average_response_time_ms: state.average_response_time_ms,
            p95_response_time_ms: percentile(&samples, 0.95),
            response_time_samples: samples.len(),
            peak_memory_mb: state.peak_memory_mb,
            requests_by_operation: self
                .inner
                .requests_by_operation
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Prometheus text exposition of the current snapshot
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            let _ = writeln!(out, "{} {}", name, value);
            out.push('\n');
        };

        metric(
            "vision_batched_api_calls_total",
            "counter",
            "Remote calls dispatched through the batcher",
            s.batched_api_calls.to_string(),
        );
        metric(
            "vision_individual_api_calls_total",
            "counter",
            "Remote calls dispatched directly",
            s.individual_api_calls.to_string(),
        );
        metric(
            "vision_batch_efficiency_ratio",
            "gauge",
            "Share of remote calls that went through the batcher",
            s.batch_efficiency_ratio.to_string(),
        );
        metric("vision_cache_hits_total", "counter", "Result cache hits", s.cache_hits.to_string());
        metric("vision_cache_misses_total", "counter", "Result cache misses", s.cache_misses.to_string());
        metric(
            "vision_cache_hit_rate",
            "gauge",
            "Result cache hit rate (0.0 to 1.0)",
            s.cache_hit_rate.to_string(),
        );
        metric(
            "vision_memory_optimizations_total",
            "counter",
            "Memory reclaim passes triggered by pressure",
            s.memory_optimizations.to_string(),
        );
        metric(
            "vision_failed_requests_total",
            "counter",
            "Optimized requests that returned an error",
            s.failed_requests.to_string(),
        );
        metric(
            "vision_response_time_avg_ms",
            "gauge",
            "Average response time over the recent window",
            format!("{:.3}", s.average_response_time_ms),
        );
        metric(
            "vision_response_time_p95_ms",
            "gauge",
            "95th percentile response time over the recent window",
            format!("{:.3}", s.p95_response_time_ms),
        );
        metric(
            "vision_peak_memory_mb",
            "gauge",
            "Peak observed process memory in MB",
            format!("{:.1}", s.peak_memory_mb),
        );
        metric(
            "vision_uptime_seconds",
            "counter",
            "Service uptime in seconds",
            s.uptime_seconds.to_string(),
        );

        let _ = writeln!(out, "# HELP vision_requests_total Optimized requests by operation");
        let _ = writeln!(out, "# TYPE vision_requests_total counter");
        for (operation, count) in &s.requests_by_operation {
            let _ = writeln!(out, "vision_requests_total{{operation=\"{}\"}} {}", operation, count);
        }

        out
    }

    pub fn reset(&self) {
        *self.inner.state.lock() = MetricsState::default();
        self.inner.requests_by_operation.clear();
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub batched_api_calls: u64,
    pub individual_api_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub memory_optimizations: u64,
    pub failed_requests: u64,
    pub batch_efficiency_ratio: f64,
    pub cache_hit_rate: f64,
    pub average_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub response_time_samples: usize,
    pub peak_memory_mb: f64,
    pub requests_by_operation: BTreeMap<String, u64>,
    pub uptime_seconds: u64,
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let idx = ((sorted.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
