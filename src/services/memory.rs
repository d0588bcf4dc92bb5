use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use crate::core::config::MemoryConfig;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
/// Usage above this fraction of the budget counts as memory pressure
const PRESSURE_RATIO: f64 = 0.8;

/// Source of the process's resident memory reading
pub trait MemoryProbe: Send + Sync {
    /// Resident bytes, or `None` when the reading is unavailable.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads resident memory of the current process through `sysinfo`.
pub struct ProcessMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot resolve current pid, memory readings will be estimated: {}", e);
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|process| process.memory())
    }
}

/// Bounded LRU of image bytes with a byte budget
struct SoftImageCache {
    entries: LruCache<String, Arc<Vec<u8>>>,
    capacity: NonZeroUsize,
    bytes: usize,
    max_bytes: usize,
    evictions: u64,
}

impl SoftImageCache {
    fn new(max_entries: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            capacity,
            bytes: 0,
            max_bytes,
            evictions: 0,
        }
    }

    fn insert(&mut self, key: String, image: Arc<Vec<u8>>) -> bool {
        if image.len() > self.max_bytes {
            return false;
        }

        self.bytes += image.len();
        if let Some((old_key, old)) = self.entries.push(key.clone(), image) {
            self.bytes -= old.len();
            if old_key != key {
                self.evictions += 1;
            }
        }

        while self.bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => {
                    self.bytes -= evicted.len();
                    self.evictions += 1;
                }
                None => break,
            }
        }
        true
    }

    fn get(&mut self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.entries.get(key).cloned()
    }

    /// Drop every entry and the backing allocation; returns entries removed.
    fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries = LruCache::new(self.capacity);
        self.bytes = 0;
        removed
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryOptimizationReport {
    pub memory_before_mb: f64,
    pub memory_after_mb: f64,
    pub memory_freed_mb: f64,
    pub optimizations_performed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatus {
    pub current_mb: f64,
    pub max_memory_mb: f64,
    pub pressure_threshold_mb: f64,
    pub under_pressure: bool,
    /// `false` when `current_mb` is the soft-cache estimate
    pub measured: bool,
    pub soft_cache_entries: usize,
    pub soft_cache_mb: f64,
    pub soft_cache_evictions: u64,
    pub optimizations_performed: u64,
}

/// Process memory tracking plus a soft cache for uploaded image bytes.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    probe: Box<dyn MemoryProbe>,
    max_memory_mb: f64,
    images: Mutex<SoftImageCache>,
    optimizations: AtomicU64,
}

impl MemoryManager {
    pub fn new(config: &MemoryConfig) -> Self {
        Self::with_probe(config, Box::new(ProcessMemoryProbe::new()))
    }

    pub fn with_probe(config: &MemoryConfig, probe: Box<dyn MemoryProbe>) -> Self {
        let max_bytes = (config.soft_cache_max_mb.max(0.0) * BYTES_PER_MB) as usize;
        Self {
            inner: Arc::new(MemoryInner {
                probe,
                max_memory_mb: config.max_memory_mb,
                images: Mutex::new(SoftImageCache::new(config.soft_cache_max_entries, max_bytes)),
                optimizations: AtomicU64::new(0),
            }),
        }
    }

    pub fn max_memory_mb(&self) -> f64 {
        self.inner.max_memory_mb
    }

    fn soft_cache_mb(&self) -> f64 {
        self.inner.images.lock().bytes as f64 / BYTES_PER_MB
    }

    fn measure(&self) -> (f64, bool) {
        match self.inner.probe.resident_bytes() {
            Some(bytes) => (bytes as f64 / BYTES_PER_MB, true),
            None => (self.soft_cache_mb(), false),
        }
    }

    /// Current memory usage in MB. Falls back to the soft cache footprint
    /// when the process cannot be measured.
    pub fn get_memory_usage(&self) -> f64 {
        self.measure().0
    }

    pub fn check_memory_pressure(&self) -> bool {
        self.get_memory_usage() > self.inner.max_memory_mb * PRESSURE_RATIO
    }

    pub fn optimize_memory(&self) -> MemoryOptimizationReport {
        let (before, measured) = self.measure();
        let mut report = MemoryOptimizationReport {
            memory_before_mb: before,
            ..Default::default()
        };

        let (removed, freed_bytes) = {
            let mut images = self.inner.images.lock();
            let freed = images.bytes;
            (images.clear(), freed)
        };
        if removed > 0 {
            report
                .optimizations_performed
                .push(format!("cleared_soft_image_cache ({} entries)", removed));
        }
        report
            .optimizations_performed
            .push("released_soft_cache_capacity".to_string());

        if !measured {
            report.error = Some("process memory probe unavailable, using estimate".to_string());
        }

        let after = self.get_memory_usage();
        report.memory_after_mb = after;
        report.memory_freed_mb = (before - after).max(0.0);
        self.inner.optimizations.fetch_add(1, Ordering::Relaxed);

        info!(
            "Memory optimization: {:.1}MB -> {:.1}MB (soft cache released {:.1}MB)",
            before,
            after,
            freed_bytes as f64 / BYTES_PER_MB
        );
        report
    }

    /// Keep image bytes in the soft cache when memory allows it.
    pub fn cache_image_safely(&self, image_hash: &str, image: Arc<Vec<u8>>) -> bool {
        if self.check_memory_pressure() {
            self.optimize_memory();
            if self.check_memory_pressure() {
                debug!("Skipping soft cache for {}: memory pressure persists", image_hash);
                return false;
            }
        }
        self.inner.images.lock().insert(image_hash.to_string(), image)
    }

    pub fn get_cached_image(&self, image_hash: &str) -> Option<Arc<Vec<u8>>> {
        self.inner.images.lock().get(image_hash)
    }

    pub fn status(&self) -> MemoryStatus {
        let (current_mb, measured) = self.measure();
        let images = self.inner.images.lock();
        MemoryStatus {
            current_mb,
            max_memory_mb: self.inner.max_memory_mb,
            pressure_threshold_mb: self.inner.max_memory_mb * PRESSURE_RATIO,
            under_pressure: current_mb > self.inner.max_memory_mb * PRESSURE_RATIO,
            measured,
            soft_cache_entries: images.entries.len(),
            soft_cache_mb: images.bytes as f64 / BYTES_PER_MB,
            soft_cache_evictions: images.evictions,
            optimizations_performed: self.inner.optimizations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Option<u64>);

    impl MemoryProbe for FixedProbe {
        fn resident_bytes(&self) -> Option<u64> {
            self.0
        }
    }

    fn config(max_memory_mb: f64, entries: usize, soft_mb: f64) -> MemoryConfig {
        MemoryConfig {
            max_memory_mb,
            soft_cache_max_entries: entries,
            soft_cache_max_mb: soft_mb,
        }
    }

    fn image(len: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![7u8; len])
    }

    #[test]
    fn test_pressure_threshold_is_eighty_percent() {
        let mb = 1024 * 1024;
        let under = MemoryManager::with_probe(&config(100.0, 8, 1.0), Box::new(FixedProbe(Some(80 * mb))));
        let over = MemoryManager::with_probe(&config(100.0, 8, 1.0), Box::new(FixedProbe(Some(81 * mb))));

        assert_eq!(under.get_memory_usage(), 80.0);
        assert!(!under.check_memory_pressure());
        assert!(over.check_memory_pressure());
    }

    #[test]
    fn test_stores_when_not_under_pressure() {
        let manager = MemoryManager::with_probe(&config(100.0, 8, 1.0), Box::new(FixedProbe(Some(0))));
        assert!(manager.cache_image_safely("a", image(10)));
        assert_eq!(manager.get_cached_image("a").map(|b| b.len()), Some(10));
        assert!(manager.get_cached_image("b").is_none());
    }

    #[test]
    fn test_refuses_when_pressure_persists() {
        let manager = MemoryManager::with_probe(
            &config(100.0, 8, 1.0),
            Box::new(FixedProbe(Some(500 * 1024 * 1024))),
        );
        assert!(!manager.cache_image_safely("a", image(10)));
        assert!(manager.get_cached_image("a").is_none());
        assert_eq!(manager.status().optimizations_performed, 1);
    }

    #[test]
    fn test_optimize_clears_estimated_pressure() {
        // Without a probe the soft cache is the only measured memory.
        let manager = MemoryManager::with_probe(&config(1.0, 16, 2.0), Box::new(FixedProbe(None)));
        let chunk = 300 * 1024;
        for i in 0..3 {
            assert!(manager.cache_image_safely(&format!("img{}", i), image(chunk)));
        }
        assert!(manager.check_memory_pressure());

        // Pressure triggers a reclaim, after which the new image fits.
        assert!(manager.cache_image_safely("fresh", image(chunk)));
        let status = manager.status();
        assert!(!status.measured);
        assert_eq!(status.soft_cache_entries, 1);
        assert!(manager.get_cached_image("img0").is_none());
        assert!(manager.get_cached_image("fresh").is_some());
    }

    #[test]
    fn test_soft_cache_respects_entry_and_byte_limits() {
        let manager = MemoryManager::with_probe(&config(10_000.0, 2, 1.0), Box::new(FixedProbe(Some(0))));
        manager.cache_image_safely("a", image(100));
        manager.cache_image_safely("b", image(100));
        manager.cache_image_safely("c", image(100));
        assert!(manager.get_cached_image("a").is_none());
        assert_eq!(manager.status().soft_cache_entries, 2);

        // Larger than the whole byte budget: rejected outright.
        assert!(!manager.cache_image_safely("huge", image(2 * 1024 * 1024)));

        // Two 600KB images cannot coexist in a 1MB budget.
        manager.cache_image_safely("d", image(600 * 1024));
        manager.cache_image_safely("e", image(600 * 1024));
        let status = manager.status();
        assert_eq!(status.soft_cache_entries, 1);
        assert!(status.soft_cache_mb <= 1.0);
        assert!(status.soft_cache_evictions >= 3);
    }

    #[test]
    fn test_replacing_an_entry_keeps_byte_count() {
        let manager = MemoryManager::with_probe(&config(10_000.0, 4, 1.0), Box::new(FixedProbe(Some(0))));
        manager.cache_image_safely("a", image(1024));
        manager.cache_image_safely("a", image(2048));
        let status = manager.status();
        assert_eq!(status.soft_cache_entries, 1);
        assert_eq!(status.soft_cache_evictions, 0);
        assert!((status.soft_cache_mb - 2048.0 / BYTES_PER_MB).abs() < 1e-12);
    }

    #[test]
    fn test_optimize_report() {
        let manager = MemoryManager::with_probe(&config(100.0, 4, 1.0), Box::new(FixedProbe(None)));
        manager.cache_image_safely("a", image(512 * 1024));

        let report = manager.optimize_memory();
        assert_eq!(report.memory_before_mb, 0.5);
        assert_eq!(report.memory_after_mb, 0.0);
        assert_eq!(report.memory_freed_mb, 0.5);
        assert!(report.optimizations_performed[0].starts_with("cleared_soft_image_cache"));
        assert!(report.error.is_some());
    }

    #[test]
    fn test_process_probe_reads_something() {
        let probe = ProcessMemoryProbe::new();
        if let Some(bytes) = probe.resident_bytes() {
            assert!(bytes > 0);
        }
    }
}
