use crate::core::errors::ConfigError;
use std::env;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Cache backend configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub redis_url: String,
    /// Key version segment used for every generated key (e.g. "v1")
    pub version: String,
    /// Backend memory budget enforced by the LRU eviction routine
    pub max_memory_mb: f64,
}

/// Request batcher configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Bucket size that triggers immediate processing
    pub batch_size: usize,
    /// Flush interval of the background dispatch loop
    pub batch_timeout: Duration,
    /// Default per-request wait limit
    pub request_timeout: Duration,
}

/// Work queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_workers: usize,
    pub max_queue_size: usize,
}

/// Process memory configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Process memory budget; pressure starts at 80% of it
    pub max_memory_mb: f64,
    pub soft_cache_max_entries: usize,
    pub soft_cache_max_mb: f64,
}

/// Remote analysis service configuration
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// Optimizer façade configuration
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Interval of the background optimization cycle (zero disables it)
    pub optimization_interval: Duration,
    /// Average response time above which batching turns itself on
    pub slow_response_threshold: Duration,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub queue: QueueConfig,
    pub memory: MemoryConfig,
    pub vision: VisionConfig,
    pub optimizer: OptimizerConfig,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env();
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Self {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        Self {
            server: ServerConfig {
                port: env_parse("SERVER_PORT").unwrap_or(8000),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
            },
            cache: CacheConfig {
                enabled: env_parse("CACHE_ENABLED").unwrap_or(true),
                redis_url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
                version: env::var("CACHE_VERSION").unwrap_or_else(|_| "v1".to_string()),
                max_memory_mb: env_parse("CACHE_MAX_MEMORY_MB").unwrap_or(512.0),
            },
            batch: BatchConfig {
                batch_size: env_parse("BATCH_SIZE").unwrap_or(10),
                batch_timeout: Duration::from_millis(
                    env_parse("BATCH_TIMEOUT_MS").unwrap_or(100),
                ),
                request_timeout: Duration::from_secs(
                    env_parse("BATCH_REQUEST_TIMEOUT_SECONDS").unwrap_or(30),
                ),
            },
            queue: QueueConfig {
                max_workers: env_parse("QUEUE_MAX_WORKERS").unwrap_or_else(|| {
                    // Default: one worker per core, kept within a sane range
                    num_cpus::get().clamp(2, 16)
                }),
                max_queue_size: env_parse("QUEUE_MAX_SIZE").unwrap_or(1000),
            },
            memory: MemoryConfig {
                max_memory_mb: env_parse("MAX_MEMORY_MB").unwrap_or(2048.0),
                soft_cache_max_entries: env_parse("SOFT_CACHE_MAX_ENTRIES").unwrap_or(256),
                soft_cache_max_mb: env_parse("SOFT_CACHE_MAX_MB").unwrap_or(256.0),
            },
            vision: VisionConfig {
                api_key: env::var("VISION_API_KEY")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
                endpoint: env::var("VISION_ENDPOINT")
                    .unwrap_or_else(|_| "https://vision.googleapis.com".to_string()),
                timeout: Duration::from_secs(env_parse("VISION_TIMEOUT_SECONDS").unwrap_or(60)),
                max_retries: env_parse("MAX_RETRIES").unwrap_or(3),
            },
            optimizer: OptimizerConfig {
                optimization_interval: Duration::from_secs(
                    env_parse("OPTIMIZATION_INTERVAL_SECONDS").unwrap_or(300),
                ),
                slow_response_threshold: Duration::from_millis(
                    env_parse("SLOW_RESPONSE_THRESHOLD_MS").unwrap_or(2000),
                ),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(self.batch.batch_size));
        }
        if self.batch.batch_timeout.is_zero() {
            return Err(ConfigError::InvalidBatchTimeout);
        }

        if self.queue.max_workers == 0 {
            return Err(ConfigError::InvalidQueueConfig(
                "max_workers must be > 0".to_string(),
            ));
        }
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::InvalidQueueConfig(
                "max_queue_size must be > 0".to_string(),
            ));
        }

        if self.memory.max_memory_mb <= 0.0 {
            return Err(ConfigError::InvalidMemoryConfig(format!(
                "max_memory_mb must be positive, got {}",
                self.memory.max_memory_mb
            )));
        }
        if self.memory.soft_cache_max_entries == 0 {
            return Err(ConfigError::InvalidMemoryConfig(
                "soft_cache_max_entries must be > 0".to_string(),
            ));
        }

        if self.cache.enabled && !self.cache.redis_url.starts_with("redis") {
            return Err(ConfigError::InvalidCacheConfig(format!(
                "REDIS_URL must use the redis:// or rediss:// scheme, got {}",
                self.cache.redis_url
            )));
        }
        if self.cache.version.is_empty() || self.cache.version.contains(':') {
            return Err(ConfigError::InvalidCacheConfig(format!(
                "cache version must be non-empty and must not contain ':', got {:?}",
                self.cache.version
            )));
        }

        if !self.vision.endpoint.starts_with("http") {
            return Err(ConfigError::InvalidVisionConfig(format!(
                "endpoint must be an http(s) URL, got {}",
                self.vision.endpoint
            )));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.enabled
    }

    pub fn cache_version(&self) -> &str {
        &self.cache.version
    }

    pub fn cache_max_memory_mb(&self) -> f64 {
        self.cache.max_memory_mb
    }

    pub fn batch_size(&self) -> usize {
        self.batch.batch_size
    }

    pub fn max_workers(&self) -> usize {
        self.queue.max_workers
    }

    pub fn max_queue_size(&self) -> usize {
        self.queue.max_queue_size
    }

    pub fn max_memory_mb(&self) -> f64 {
        self.memory.max_memory_mb
    }

    pub fn vision_api_key(&self) -> Option<&str> {
        self.vision.api_key.as_deref()
    }

    pub fn optimization_interval(&self) -> Duration {
        self.optimizer.optimization_interval
    }
}

impl Default for Config {
    /// Defaults without consulting the environment; used by tests and embedders.
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 8000,
                host: "127.0.0.1".to_string(),
                log_level: Level::INFO,
            },
            cache: CacheConfig {
                enabled: true,
                redis_url: "redis://127.0.0.1:6379".to_string(),
                version: "v1".to_string(),
                max_memory_mb: 512.0,
            },
            batch: BatchConfig {
                batch_size: 10,
                batch_timeout: Duration::from_millis(100),
                request_timeout: Duration::from_secs(30),
            },
            queue: QueueConfig {
                max_workers: 4,
                max_queue_size: 1000,
            },
            memory: MemoryConfig {
                max_memory_mb: 2048.0,
                soft_cache_max_entries: 256,
                soft_cache_max_mb: 256.0,
            },
            vision: VisionConfig {
                api_key: None,
                endpoint: "https://vision.googleapis.com".to_string(),
                timeout: Duration::from_secs(60),
                max_retries: 3,
            },
            optimizer: OptimizerConfig {
                optimization_interval: Duration::from_secs(300),
                slow_response_threshold: Duration::from_millis(2000),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let mut config = Config::default();
        config.batch.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBatchSize(0))
        ));
    }

    #[test]
    fn test_rejects_zero_batch_timeout() {
        let mut config = Config::default();
        config.batch.batch_timeout = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBatchTimeout)
        ));
    }

    #[test]
    fn test_zero_optimization_interval_is_accepted() {
        let mut config = Config::default();
        config.optimizer.optimization_interval = Duration::ZERO;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_cache_version() {
        let mut config = Config::default();
        config.cache.version = "v:1".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCacheConfig(_))
        ));
    }

    #[test]
    fn test_disabled_cache_skips_url_check() {
        let mut config = Config::default();
        config.cache.enabled = false;
        config.cache.redis_url = "not-a-url".to_string();
        assert!(config.validate().is_ok());
    }
}
