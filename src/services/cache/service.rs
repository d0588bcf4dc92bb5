use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::backend::{BackendInfo, CacheBackend, KeyTtl, RedisBackend};
use super::policy::ResultType;
use crate::core::config::CacheConfig;
use crate::core::types::{
    DetectionParams, FaceDetectionParams, NaturalElementsParams, OperationParams, Params,
};

/// Share of the eviction score contributed by remaining-TTL freshness
const FRESHNESS_WEIGHT: f64 = 0.6;
/// Share contributed by the fixed per-result-type weight
const IMPORTANCE_WEIGHT: f64 = 0.4;
/// Eviction stops once usage is at or below this fraction of the limit
const EVICTION_TARGET_RATIO: f64 = 0.8;
/// Keys deleted between two memory re-checks
const EVICTION_CHUNK: usize = 10;
/// Key count at which utilisation counts as 100% in the efficiency score
const TARGET_KEY_COUNT: f64 = 1000.0;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default)]
struct CacheCounters {
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    errors: u64,
}

/// Hit/miss/operation counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheCounterSnapshot {
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheVersionInfo {
    pub result_type: String,
    pub current_version: String,
    pub total_keys: usize,
    pub version_counts: BTreeMap<String, usize>,
    pub ttl_hours: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionReport {
    pub memory_before_mb: f64,
    pub evicted_keys: usize,
    pub eviction_needed: bool,
    pub memory_after_mb: f64,
    pub candidates: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DetailedCacheStatistics {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendInfo>,
    pub keys_by_type: BTreeMap<String, usize>,
    pub total_keys: usize,
    pub counters: CacheCounterSnapshot,
    /// 0-100: 70% hit rate, 30% key utilisation
    pub cache_efficiency_score: f64,
    /// 0-100, derived from the backend's fragmentation ratio
    pub memory_efficiency_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmupReport {
    pub enabled: bool,
    pub attempted: usize,
    pub warmed: usize,
    pub missing: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub enabled: bool,
    pub scanned: usize,
    pub removed_without_ttl: usize,
    pub removed_stale_version: usize,
    pub errors: usize,
}

/// Versioned, TTL'd result cache over a `CacheBackend`.
///
/// Every public method is infallible from the caller's point of view: backend
/// failures are logged and degrade to `None`/`false`/`0`, and a disabled cache
/// short-circuits without touching the backend.
#[derive(Clone)]
pub struct CacheService {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    backend: Option<Arc<dyn CacheBackend>>,
    enabled: AtomicBool,
    version: String,
    counters: Mutex<CacheCounters>,
}

impl CacheService {
    /// Connect according to configuration. An unreachable Redis yields a
    /// disabled cache rather than an error.
    pub async fn connect(config: &CacheConfig) -> Self {
        if !config.enabled {
            info!("Result cache disabled by configuration");
            return Self::disabled_with_version(&config.version);
        }

        let connected = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let backend = RedisBackend::connect(&config.redis_url).await?;
            backend.ping().await?;
            Ok::<_, crate::core::errors::CacheError>(backend)
        })
        .await;

        match connected {
            Ok(Ok(backend)) => Self::with_backend(Arc::new(backend), config.version.clone()),
            Ok(Err(e)) => {
                warn!("Redis unavailable, continuing without result cache: {}", e);
                Self::disabled_with_version(&config.version)
            }
            Err(_) => {
                warn!(
                    "Redis connection timed out after {:?}, continuing without result cache",
                    CONNECT_TIMEOUT
                );
                Self::disabled_with_version(&config.version)
            }
        }
    }

    pub fn with_backend(backend: Arc<dyn CacheBackend>, version: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend: Some(backend),
                enabled: AtomicBool::new(true),
                version: version.into(),
                counters: Mutex::new(CacheCounters::default()),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::disabled_with_version("v1")
    }

    fn disabled_with_version(version: &str) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend: None,
                enabled: AtomicBool::new(false),
                version: version.to_string(),
                counters: Mutex::new(CacheCounters::default()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.backend.is_some() && self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Toggle the cache at runtime; has no effect on a cache without backend.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    fn backend(&self) -> Option<&Arc<dyn CacheBackend>> {
        if self.is_enabled() {
            self.inner.backend.as_ref()
        } else {
            None
        }
    }

    fn record_error(&self) {
        self.inner.counters.lock().errors += 1;
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    /// Look up a key. Counts exactly one hit or miss per call.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let backend = self.backend()?;

        let outcome = match backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!("Discarding undecodable cache entry {}: {}", key, e);
                    Err(())
                }
            },
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("Cache get failed for {}: {}", key, e);
                Err(())
            }
        };

        let mut counters = self.inner.counters.lock();
        match outcome {
            Ok(Some(value)) => {
                counters.hits += 1;
                debug!("Cache HIT {}", key);
                Some(value)
            }
            Ok(None) => {
                counters.misses += 1;
                debug!("Cache MISS {}", key);
                None
            }
            Err(()) => {
                counters.misses += 1;
                counters.errors += 1;
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &Value, ttl: Duration) -> bool {
        let Some(backend) = self.backend() else {
            return false;
        };

        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize cache value for {}: {}", key, e);
                self.record_error();
                return false;
            }
        };

        match backend.set_ex(key, &raw, ttl).await {
            Ok(()) => {
                self.inner.counters.lock().sets += 1;
                true
            }
            Err(e) => {
                warn!("Cache set failed for {}: {}", key, e);
                self.record_error();
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let Some(backend) = self.backend() else {
            return false;
        };

        match backend.del(&[key.to_string()]).await {
            Ok(removed) => {
                self.inner.counters.lock().deletes += removed as u64;
                removed > 0
            }
            Err(e) => {
                warn!("Cache delete failed for {}: {}", key, e);
                self.record_error();
                false
            }
        }
    }

    /// Delete every key matching a glob pattern; returns the number removed.
    pub async fn clear_pattern(&self, pattern: &str) -> usize {
        let Some(backend) = self.backend() else {
            return 0;
        };

        let keys = match backend.keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cache key scan failed for {}: {}", pattern, e);
                self.record_error();
                return 0;
            }
        };

        match backend.del(&keys).await {
            Ok(removed) => {
                self.inner.counters.lock().deletes += removed as u64;
                if removed > 0 {
                    info!("Cleared {} cache keys matching {}", removed, pattern);
                }
                removed
            }
            Err(e) => {
                warn!("Cache delete failed for pattern {}: {}", pattern, e);
                self.record_error();
                0
            }
        }
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    /// Build `prefix:version:imageHash:paramHash` where the parameter hash is
    /// the first 8 hex chars of xxHash3 over the sorted-key JSON encoding.
    pub fn generate_cache_key(&self, result_type: ResultType, image_hash: &str, params: &Params) -> String {
        Self::key_for_version(result_type, &self.inner.version, image_hash, params)
    }

    pub fn key_for_version(
        result_type: ResultType,
        version: &str,
        image_hash: &str,
        params: &Params,
    ) -> String {
        // BTreeMap keys serialize in sorted order; nested objects are
        // serde_json maps which are sorted as well.
        let encoded = serde_json::to_string(params).unwrap_or_default();
        let digest = format!("{:016x}", xxh3_64(encoded.as_bytes()));
        format!(
            "{}:{}:{}:{}",
            result_type.prefix(),
            version,
            image_hash,
            &digest[..8]
        )
    }

    // ------------------------------------------------------------------
    // Typed helpers
    // ------------------------------------------------------------------

    pub async fn get_result(&self, result_type: ResultType, image_hash: &str, params: &Params) -> Option<Value> {
        let key = self.generate_cache_key(result_type, image_hash, params);
        self.get(&key).await
    }

    pub async fn set_result(
        &self,
        result_type: ResultType,
        image_hash: &str,
        params: &Params,
        value: &Value,
    ) -> bool {
        let key = self.generate_cache_key(result_type, image_hash, params);
        self.set(&key, value, result_type.ttl()).await
    }

    pub async fn get_detection_result(&self, image_hash: &str, params: &Params) -> Option<Value> {
        self.get_result(ResultType::DetectionResults, image_hash, params).await
    }

    pub async fn set_detection_result(&self, image_hash: &str, params: &Params, value: &Value) -> bool {
        self.set_result(ResultType::DetectionResults, image_hash, params, value).await
    }

    pub async fn get_segmentation_mask(&self, image_hash: &str, params: &Params) -> Option<Value> {
        self.get_result(ResultType::SegmentationMasks, image_hash, params).await
    }

    pub async fn set_segmentation_mask(&self, image_hash: &str, params: &Params, value: &Value) -> bool {
        self.set_result(ResultType::SegmentationMasks, image_hash, params, value).await
    }

    pub async fn get_extraction_result(&self, image_hash: &str, params: &Params) -> Option<Value> {
        self.get_result(ResultType::ExtractionResults, image_hash, params).await
    }

    pub async fn set_extraction_result(&self, image_hash: &str, params: &Params, value: &Value) -> bool {
        self.set_result(ResultType::ExtractionResults, image_hash, params, value).await
    }

    pub async fn get_natural_elements_result(&self, image_hash: &str, params: &Params) -> Option<Value> {
        self.get_result(ResultType::NaturalElements, image_hash, params).await
    }

    pub async fn set_natural_elements_result(&self, image_hash: &str, params: &Params, value: &Value) -> bool {
        self.set_result(ResultType::NaturalElements, image_hash, params, value).await
    }

    pub async fn get_face_detection_result(&self, image_hash: &str, params: &Params) -> Option<Value> {
        self.get_result(ResultType::FaceDetection, image_hash, params).await
    }

    pub async fn set_face_detection_result(&self, image_hash: &str, params: &Params, value: &Value) -> bool {
        self.set_result(ResultType::FaceDetection, image_hash, params, value).await
    }

    pub async fn get_annotations(&self, image_hash: &str, params: &Params) -> Option<Value> {
        self.get_result(ResultType::Annotations, image_hash, params).await
    }

    pub async fn set_annotations(&self, image_hash: &str, params: &Params, value: &Value) -> bool {
        self.set_result(ResultType::Annotations, image_hash, params, value).await
    }

    /// Batch status records are keyed by batch id in the image-hash slot.
    pub async fn get_batch_processing_status(&self, batch_id: &str) -> Option<Value> {
        self.get_result(ResultType::BatchProcessing, batch_id, &Params::new()).await
    }

    pub async fn set_batch_processing_status(&self, batch_id: &str, status: &Value) -> bool {
        self.set_result(ResultType::BatchProcessing, batch_id, &Params::new(), status).await
    }

    // ------------------------------------------------------------------
    // Versioning
    // ------------------------------------------------------------------

    /// Remove every key of `result_type` written under `version`.
    pub async fn invalidate_cache_version(&self, result_type: ResultType, version: &str) -> usize {
        let pattern = format!("{}:{}:*", result_type.prefix(), version);
        let removed = self.clear_pattern(&pattern).await;
        info!(
            "Invalidated {} {} entries of version {}",
            removed, result_type, version
        );
        removed
    }

    pub async fn get_cache_version_info(&self, result_type: ResultType) -> CacheVersionInfo {
        let mut info = CacheVersionInfo {
            result_type: result_type.to_string(),
            current_version: self.inner.version.clone(),
            ttl_hours: result_type.ttl().as_secs_f64() / 3600.0,
            ..Default::default()
        };

        let Some(backend) = self.backend() else {
            return info;
        };

        match backend.keys(&format!("{}:*", result_type.prefix())).await {
            Ok(keys) => {
                info.total_keys = keys.len();
                for key in &keys {
                    if let Some(version) = key.split(':').nth(1) {
                        *info.version_counts.entry(version.to_string()).or_insert(0) += 1;
                    }
                }
            }
            Err(e) => {
                warn!("Version scan failed for {}: {}", result_type, e);
                self.record_error();
            }
        }

        info
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Eviction score of a key: `0.6 * remaining_ttl_ratio + 0.4 * weight`.
    ///
    /// Higher scores are evicted first, so among keys of the same type the
    /// most recently written (highest remaining TTL) go before keys that are
    /// about to expire anyway.
    pub fn eviction_priority(result_type: ResultType, remaining: Duration) -> f64 {
        let policy = result_type.policy();
        let freshness = if policy.ttl.is_zero() {
            0.0
        } else {
            (remaining.as_secs_f64() / policy.ttl.as_secs_f64()).clamp(0.0, 1.0)
        };
        FRESHNESS_WEIGHT * freshness + IMPORTANCE_WEIGHT * policy.eviction_weight
    }

    /// Evict keys by priority until backend memory is back under 80% of
    /// `max_memory_mb`. Does nothing when usage is already within the limit.
    #[instrument(skip(self))]
    pub async fn implement_lru_eviction(&self, max_memory_mb: f64) -> EvictionReport {
        let mut report = EvictionReport::default();
        let Some(backend) = self.backend() else {
            return report;
        };

        let before = match backend.info().await {
            Ok(info) => info.used_memory_mb(),
            Err(e) => {
                warn!("Cache INFO failed, skipping eviction: {}", e);
                self.record_error();
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.memory_before_mb = before;
        report.memory_after_mb = before;

        if before <= max_memory_mb {
            return report;
        }
        report.eviction_needed = true;

        let mut candidates: Vec<(f64, String)> = Vec::new();
        for result_type in ResultType::ALL {
            let keys = match backend.keys(&format!("{}:*", result_type.prefix())).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!("Key scan failed for {}: {}", result_type, e);
                    self.record_error();
                    continue;
                }
            };
            for key in keys {
                match backend.ttl(&key).await {
                    Ok(KeyTtl::Expires(remaining)) => {
                        candidates.push((Self::eviction_priority(result_type, remaining), key));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("TTL lookup failed for {}: {}", key, e);
                        self.record_error();
                    }
                }
            }
        }
        report.candidates = candidates.len();

        candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let target = max_memory_mb * EVICTION_TARGET_RATIO;
        let mut current = before;
        let keys: Vec<String> = candidates.into_iter().map(|(_, key)| key).collect();

        for chunk in keys.chunks(EVICTION_CHUNK) {
            match backend.del(chunk).await {
                Ok(removed) => report.evicted_keys += removed,
                Err(e) => {
                    warn!("Eviction delete failed: {}", e);
                    self.record_error();
                    report.error = Some(e.to_string());
                    break;
                }
            }

            match backend.info().await {
                Ok(info) => current = info.used_memory_mb(),
                Err(e) => {
                    self.record_error();
                    report.error = Some(e.to_string());
                    break;
                }
            }

            if current <= target {
                break;
            }
        }

        self.inner.counters.lock().deletes += report.evicted_keys as u64;
        report.memory_after_mb = current;

        info!(
            "LRU eviction: {:.2}MB -> {:.2}MB, evicted {} of {} candidates",
            before, current, report.evicted_keys, report.candidates
        );
        report
    }

    // ------------------------------------------------------------------
    // Statistics and maintenance
    // ------------------------------------------------------------------

    pub fn counters(&self) -> CacheCounterSnapshot {
        let counters = *self.inner.counters.lock();
        let lookups = counters.hits + counters.misses;
        CacheCounterSnapshot {
            enabled: self.is_enabled(),
            hits: counters.hits,
            misses: counters.misses,
            sets: counters.sets,
            deletes: counters.deletes,
            errors: counters.errors,
            hit_rate: counters.hits as f64 / lookups.max(1) as f64,
        }
    }

    pub async fn get_detailed_cache_statistics(&self) -> DetailedCacheStatistics {
        let counters = self.counters();
        let mut stats = DetailedCacheStatistics {
            enabled: counters.enabled,
            counters,
            ..Default::default()
        };

        let Some(backend) = self.backend() else {
            return stats;
        };

        match backend.info().await {
            Ok(info) => stats.backend = Some(info),
            Err(e) => {
                warn!("Cache INFO failed: {}", e);
                self.record_error();
            }
        }

        for result_type in ResultType::ALL {
            match backend.keys(&format!("{}:*", result_type.prefix())).await {
                Ok(keys) => {
                    stats.total_keys += keys.len();
                    stats.keys_by_type.insert(result_type.to_string(), keys.len());
                }
                Err(e) => {
                    warn!("Key scan failed for {}: {}", result_type, e);
                    self.record_error();
                }
            }
        }

        let utilisation = (stats.total_keys as f64 / TARGET_KEY_COUNT).min(1.0);
        stats.cache_efficiency_score =
            (stats.counters.hit_rate * 70.0 + utilisation * 30.0).clamp(0.0, 100.0);

        stats.memory_efficiency_percent = stats
            .backend
            .as_ref()
            .map(|info| memory_efficiency_percent(info.mem_fragmentation_ratio))
            .unwrap_or(0.0);

        stats
    }

    /// Refresh the TTL of existing default-parameter entries for the given
    /// images; absent entries are reported as missing.
    pub async fn warm_cache_for_common_operations(&self, image_hashes: &[String]) -> WarmupReport {
        let mut report = WarmupReport {
            enabled: self.is_enabled(),
            ..Default::default()
        };
        let Some(backend) = self.backend() else {
            return report;
        };

        let common = [
            (ResultType::DetectionResults, DetectionParams::default().to_params()),
            (ResultType::NaturalElements, NaturalElementsParams::default().to_params()),
            (ResultType::FaceDetection, FaceDetectionParams::default().to_params()),
        ];

        for image_hash in image_hashes {
            for (result_type, params) in &common {
                report.attempted += 1;
                let key = self.generate_cache_key(*result_type, image_hash, params);
                match backend.expire(&key, result_type.ttl()).await {
                    Ok(true) => report.warmed += 1,
                    Ok(false) => report.missing += 1,
                    Err(e) => {
                        debug!("Warmup failed for {}: {}", key, e);
                        self.record_error();
                        report.errors += 1;
                    }
                }
            }
        }

        info!(
            "Cache warmup: {} attempted, {} warmed, {} missing",
            report.attempted, report.warmed, report.missing
        );
        report
    }

    /// Remove keys that can never expire on their own (no TTL) and keys
    /// written under a version other than the current one.
    pub async fn cleanup_expired_cache_entries(&self) -> CleanupReport {
        let mut report = CleanupReport {
            enabled: self.is_enabled(),
            ..Default::default()
        };
        let Some(backend) = self.backend() else {
            return report;
        };

        for result_type in ResultType::ALL {
            let keys = match backend.keys(&format!("{}:*", result_type.prefix())).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!("Cleanup scan failed for {}: {}", result_type, e);
                    self.record_error();
                    report.errors += 1;
                    continue;
                }
            };

            let mut stale = Vec::new();
            let mut without_ttl = Vec::new();
            for key in keys {
                report.scanned += 1;
                if key.split(':').nth(1) != Some(self.inner.version.as_str()) {
                    stale.push(key);
                    continue;
                }
                match backend.ttl(&key).await {
                    Ok(KeyTtl::Persistent) => without_ttl.push(key),
                    Ok(_) => {}
                    Err(_) => report.errors += 1,
                }
            }

            match backend.del(&stale).await {
                Ok(n) => report.removed_stale_version += n,
                Err(_) => report.errors += 1,
            }
            match backend.del(&without_ttl).await {
                Ok(n) => report.removed_without_ttl += n,
                Err(_) => report.errors += 1,
            }
        }

        self.inner.counters.lock().deletes +=
            (report.removed_stale_version + report.removed_without_ttl) as u64;

        info!(
            "Cache cleanup: scanned {}, removed {} without TTL, {} stale",
            report.scanned, report.removed_without_ttl, report.removed_stale_version
        );
        report
    }
}

fn memory_efficiency_percent(fragmentation_ratio: f64) -> f64 {
    if fragmentation_ratio > 0.0 {
        (100.0 / fragmentation_ratio).clamp(0.0, 100.0)
    } else {
        0.0
    }
}
