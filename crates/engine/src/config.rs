//! Engine configuration
//!
//! Every tunable lives in one TOML document. Missing sections and keys fall
//! back to their defaults, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

const MIB: u64 = 1024 * 1024;

/// Directory name used under the platform data dir
pub const APP_DIR_NAME: &str = "cirrus";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for the database, cache and logs
    pub data_dir: PathBuf,
    /// Overrides `<data_dir>/metadata.db`; `sqlite::memory:` for an
    /// in-memory store
    pub database_url: Option<Url>,
    pub hydration: HydrationConfig,
    pub upload: UploadConfig,
    pub cache: CacheConfig,
    pub eviction: EvictionConfig,
    pub retry: RetryConfig,
    pub workers: WorkerConfig,
    pub events: EventConfig,
    pub gc: GcConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HydrationConfig {
    /// Bytes requested from the remote per download call
    pub chunk_size: u64,
    /// Bytes between two progress events
    pub progress_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Content at or below this size goes up in a single request
    pub small_threshold: u64,
    /// Bytes per session chunk
    pub chunk_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Budget of the in-memory cache of recently read files
    pub hot_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Sweeping starts once cached content exceeds this
    pub max_cache_bytes: u64,
    /// Fraction of `max_cache_bytes` a pressure sweep evicts down to
    pub low_watermark: f64,
    /// Entries not read for this long are evicted regardless of pressure
    pub idle_ttl_secs: Option<u64>,
    pub sweep_interval_secs: u64,
    /// Candidates examined per sweep
    pub batch: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per remote call before the record surfaces as ERROR
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Automatic re-drives of a temporary ERROR before it is left for the user
    pub max_redrives: u32,
    pub redrive_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Jobs running at once
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Buffered events per subscriber before new ones are dropped
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// How long DELETED records are kept before they are purged
    pub deleted_retention_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`
    pub filter: String,
    /// Also write a daily-rolling file under `<data_dir>/logs`
    pub file: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .map(|dir| dir.join(APP_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(".").join(APP_DIR_NAME));
        Self::for_dir(data_dir)
    }
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * MIB,
            progress_interval: 4 * MIB,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            small_threshold: 4 * MIB,
            chunk_size: 10 * MIB,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { hot_bytes: 64 * MIB }
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: 10 * 1024 * MIB,
            low_watermark: 0.8,
            idle_ttl_secs: None,
            sweep_interval_secs: 300,
            batch: 256,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
            max_redrives: 5,
            redrive_interval_secs: 60,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            deleted_retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "engine=info,metadata_store=info".to_string(),
            file: false,
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `data_dir`
    pub fn for_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            database_url: None,
            hydration: HydrationConfig::default(),
            upload: UploadConfig::default(),
            cache: CacheConfig::default(),
            eviction: EvictionConfig::default(),
            retry: RetryConfig::default(),
            workers: WorkerConfig::default(),
            events: EventConfig::default(),
            gc: GcConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hydration.chunk_size == 0 {
            return Err(ConfigError::Invalid("hydration.chunk_size must be > 0".into()));
        }
        if self.upload.chunk_size == 0 {
            return Err(ConfigError::Invalid("upload.chunk_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.eviction.low_watermark) {
            return Err(ConfigError::Invalid(
                "eviction.low_watermark must be within 0.0..=1.0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        if self.workers.max_concurrent == 0 {
            return Err(ConfigError::Invalid("workers.max_concurrent must be >= 1".into()));
        }
        if self.events.capacity == 0 {
            return Err(ConfigError::Invalid("events.capacity must be >= 1".into()));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("metadata.db")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

impl EvictionConfig {
    pub fn low_watermark_bytes(&self) -> u64 {
        (self.max_cache_bytes as f64 * self.low_watermark) as u64
    }

    pub fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl RetryConfig {
    pub fn redrive_interval(&self) -> Duration {
        Duration::from_secs(self.redrive_interval_secs)
    }
}

impl GcConfig {
    pub fn deleted_retention(&self) -> Duration {
        Duration::from_secs(self.deleted_retention_secs)
    }
}
