// Cache backends: Redis for production, an in-process map for tests and
// deployments without Redis.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::core::errors::{CacheError, CacheResult};

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

/// Server statistics reported by `INFO`
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendInfo {
    pub backend: String,
    pub version: String,
    pub used_memory_bytes: u64,
    pub mem_fragmentation_ratio: f64,
    pub connected_clients: u64,
    pub keyspace_hits: u64,
    pub keyspace_misses: u64,
    pub uptime_seconds: u64,
}

impl BackendInfo {
    pub fn used_memory_mb(&self) -> f64 {
        self.used_memory_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Key/value store contract used by `CacheService`.
///
/// Values are opaque strings (serialized JSON); the service owns encoding.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn ping(&self) -> CacheResult<()>;
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;
    /// Returns the number of keys actually removed
    async fn del(&self, keys: &[String]) -> CacheResult<usize>;
    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>>;
    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl>;
    /// Returns false when the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool>;
    async fn info(&self) -> CacheResult<BackendInfo>;
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Redis backend over a reconnecting multiplexed connection
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis at {}", url);
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs(ttl))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> CacheResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: usize = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(&mut conn).await?;
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        let mut conn = self.conn.clone();
        let secs: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(match secs {
            -2 => KeyTtl::Missing,
            s if s < 0 => KeyTtl::Persistent,
            s => KeyTtl::Expires(Duration::from_secs(s as u64)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn info(&self) -> CacheResult<BackendInfo> {
        let mut conn = self.conn.clone();
        let raw: String = redis::cmd("INFO").query_async(&mut conn).await?;
        Ok(parse_redis_info(&raw))
    }
}

/// Parse the `field:value` lines of a Redis `INFO` reply.
pub fn parse_redis_info(raw: &str) -> BackendInfo {
    let fields: HashMap<&str, &str> = raw
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.trim().split_once(':'))
        .collect();

    let number = |name: &str| -> u64 {
        fields
            .get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };

    BackendInfo {
        backend: "redis".to_string(),
        version: fields
            .get("redis_version")
            .map(|v| v.to_string())
            .unwrap_or_default(),
        used_memory_bytes: number("used_memory"),
        mem_fragmentation_ratio: fields
            .get("mem_fragmentation_ratio")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0),
        connected_clients: number("connected_clients"),
        keyspace_hits: number("keyspace_hits"),
        keyspace_misses: number("keyspace_misses"),
        uptime_seconds: number("uptime_in_seconds"),
    }
}

/// Approximate per-entry bookkeeping cost counted into `used_memory`
const ENTRY_OVERHEAD_BYTES: u64 = 64;

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// In-process backend with expiry and byte-accounted memory usage
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    available: AtomicBool,
    started_at: Instant,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            started_at: Instant::now(),
        }
    }

    /// Simulate the backend going away (every command fails) or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Store a key without expiry, as a foreign writer would.
    pub fn insert_persistent(&self, key: &str, value: &str) {
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("memory backend offline".to_string()))
        }
    }

    fn purge_expired(entries: &mut HashMap<String, MemoryEntry>) {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            debug!("Purged {} expired in-memory cache entries", purged);
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn ping(&self) -> CacheResult<()> {
        self.check_available()
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.check_available()?;
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> CacheResult<usize> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(keys
            .iter()
            .filter_map(|k| entries.remove(k))
            .filter(|e| !e.is_expired(now))
            .count())
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        self.check_available()?;
        let now = Instant::now();
        let entries = self.entries.lock();
        Ok(match entries.get(key) {
            None => KeyTtl::Missing,
            Some(e) if e.is_expired(now) => KeyTtl::Missing,
            Some(MemoryEntry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(MemoryEntry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn info(&self) -> CacheResult<BackendInfo> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries);
        let used_memory_bytes = entries
            .iter()
            .map(|(k, e)| k.len() as u64 + e.value.len() as u64 + ENTRY_OVERHEAD_BYTES)
            .sum();

        Ok(BackendInfo {
            backend: "memory".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            used_memory_bytes,
            mem_fragmentation_ratio: 1.0,
            connected_clients: 1,
            keyspace_hits: 0,
            keyspace_misses: 0,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        })
    }
}

/// Redis-style glob matching supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_ti = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("det:v1:*", "det:v1:abc:1234abcd"));
        assert!(glob_match("*", ""));
        assert!(glob_match("det:v?:*", "det:v2:x"));
        assert!(!glob_match("det:v1:*", "nat:v1:abc"));
        assert!(!glob_match("det:v1", "det:v1:abc"));
        assert!(glob_match("*:abc:*", "face:v1:abc:00ff00ff"));
    }

    #[test]
    fn test_parse_redis_info() {
        let raw = "# Server\r\nredis_version:7.2.4\r\nuptime_in_seconds:42\r\n\r\n# Memory\r\nused_memory:1048576\r\nmem_fragmentation_ratio:1.25\r\n# Clients\r\nconnected_clients:3\r\n";
        let info = parse_redis_info(raw);
        assert_eq!(info.version, "7.2.4");
        assert_eq!(info.used_memory_bytes, 1_048_576);
        assert_eq!(info.used_memory_mb(), 1.0);
        assert_eq!(info.mem_fragmentation_ratio, 1.25);
        assert_eq!(info.connected_clients, 3);
        assert_eq!(info.uptime_seconds, 42);
    }

    #[tokio::test]
    async fn test_memory_backend_expiry_and_ttl() {
        let backend = MemoryBackend::new();
        backend
            .set_ex("k1", "v1", Duration::from_millis(50))
            .await
            .unwrap();
        backend.insert_persistent("k2", "v2");

        assert_eq!(backend.get("k1").await.unwrap().as_deref(), Some("v1"));
        assert!(matches!(backend.ttl("k1").await.unwrap(), KeyTtl::Expires(_)));
        assert_eq!(backend.ttl("k2").await.unwrap(), KeyTtl::Persistent);
        assert_eq!(backend.ttl("nope").await.unwrap(), KeyTtl::Missing);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(backend.get("k1").await.unwrap(), None);
        assert_eq!(backend.keys("*").await.unwrap(), vec!["k2".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_backend_offline() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        assert!(backend.ping().await.is_err());
        assert!(backend.get("k").await.is_err());
        backend.set_available(true);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_backend_accounts_used_memory() {
        let backend = MemoryBackend::new();
        let empty = backend.info().await.unwrap().used_memory_bytes;
        assert_eq!(empty, 0);

        backend
            .set_ex("key", "value", Duration::from_secs(60))
            .await
            .unwrap();
        let used = backend.info().await.unwrap().used_memory_bytes;
        assert_eq!(used, 3 + 5 + ENTRY_OVERHEAD_BYTES);

        assert_eq!(backend.del(&["key".to_string()]).await.unwrap(), 1);
        assert_eq!(backend.info().await.unwrap().used_memory_bytes, 0);
    }
}
