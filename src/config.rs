//! Configuration parsing and structures

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CloudMountError, Result};

/// Parse a size string like "1G", "500M", or "2048K" into bytes.
///
/// Bare numbers are bytes; fractional values are allowed ("2.5G").
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    if s.is_empty() {
        return Err(CloudMountError::Config("empty size value".to_string()));
    }

    let (num_part, multiplier) = match s.as_bytes()[s.len() - 1] {
        b'T' => (&s[..s.len() - 1], 1u64 << 40),
        b'G' => (&s[..s.len() - 1], 1u64 << 30),
        b'M' => (&s[..s.len() - 1], 1u64 << 20),
        b'K' => (&s[..s.len() - 1], 1u64 << 10),
        b'B' => (&s[..s.len() - 1], 1),
        _ => (s.as_str(), 1),
    };

    let number: f64 = num_part
        .trim()
        .parse()
        .map_err(|_| CloudMountError::Config(format!("invalid size format: {s}")))?;
    if number < 0.0 {
        return Err(CloudMountError::Config(format!("negative size: {s}")));
    }

    Ok((number * multiplier as f64) as u64)
}

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub transfers: TransferSection,

    #[serde(default)]
    pub timeouts: TimeoutSection,

    #[serde(default)]
    pub mount: MountSection,

    /// S3 backend settings
    #[serde(default)]
    pub s3: S3Config,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Cache settings section
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Max cache size (e.g., "1G", "500M")
    #[serde(default = "default_cache_size")]
    pub size: String,

    /// TTL for cached metadata (e.g., "5m")
    #[serde(default = "default_cache_ttl")]
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Directory holding cached file payloads
    #[serde(default = "default_cache_location")]
    pub location: PathBuf,
}

fn default_cache_size() -> String {
    "1G".to_string()
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_cache_location() -> PathBuf {
    PathBuf::from("/var/cache/cloudmount")
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            size: default_cache_size(),
            ttl: default_cache_ttl(),
            location: default_cache_location(),
        }
    }
}

/// Transfer concurrency and scheduling section
#[derive(Debug, Clone, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_max_uploads")]
    pub max_concurrent_uploads: usize,

    #[serde(default = "default_max_downloads")]
    pub max_concurrent_downloads: usize,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Interval between background sync cycles
    #[serde(default = "default_auto_sync_interval")]
    #[serde(with = "humantime_serde")]
    pub auto_sync_interval: Duration,
}

fn default_max_uploads() -> usize {
    5
}

fn default_max_downloads() -> usize {
    10
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_auto_sync_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: default_max_uploads(),
            max_concurrent_downloads: default_max_downloads(),
            max_queue_size: default_max_queue_size(),
            auto_sync_interval: default_auto_sync_interval(),
        }
    }
}

/// Synchronous-upload timeout section
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSection {
    /// Base timeout for synchronous uploads
    #[serde(default = "default_sync_upload_timeout")]
    #[serde(with = "humantime_serde")]
    pub sync_upload_timeout: Duration,

    /// Additional timeout per MiB of file size
    #[serde(default = "default_sync_upload_timeout_per_mb")]
    #[serde(with = "humantime_serde")]
    pub sync_upload_timeout_per_mb: Duration,

    /// Upper bound for any synchronous upload
    #[serde(default = "default_max_sync_upload_timeout")]
    #[serde(with = "humantime_serde")]
    pub max_sync_upload_timeout: Duration,
}

fn default_sync_upload_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_sync_upload_timeout_per_mb() -> Duration {
    Duration::from_secs(2)
}

fn default_max_sync_upload_timeout() -> Duration {
    Duration::from_secs(1800)
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            sync_upload_timeout: default_sync_upload_timeout(),
            sync_upload_timeout_per_mb: default_sync_upload_timeout_per_mb(),
            max_sync_upload_timeout: default_max_sync_upload_timeout(),
        }
    }
}

/// Mount flags passed through to the kernel interface
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MountSection {
    #[serde(default)]
    pub foreground: bool,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub allow_other: bool,
}

/// S3 backend configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,

    /// AWS region
    pub region: Option<String>,

    /// Key prefix for mounting a subpath
    pub prefix: Option<String>,

    /// Custom endpoint URL (for S3-compatible stores)
    pub endpoint: Option<String>,

    /// Force path-style addressing (for MinIO, LocalStack, etc.)
    #[serde(default)]
    pub force_path_style: bool,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from `RawConfig`)
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,

    /// Maximum data-cache size in bytes
    pub cache_size: u64,
    /// TTL for metadata cache entries
    pub cache_ttl: Duration,
    /// Directory holding cached file payloads
    pub cache_location: PathBuf,

    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
    pub max_queue_size: usize,
    pub auto_sync_interval: Duration,

    pub sync_upload_timeout: Duration,
    pub sync_upload_timeout_per_mb: Duration,
    pub max_sync_upload_timeout: Duration,

    pub foreground: bool,
    pub debug: bool,
    pub allow_other: bool,

    pub s3: S3Config,
}

impl Config {
    /// Load and resolve configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let raw: RawConfig = serde_yaml::from_str(&contents)
            .map_err(|e| CloudMountError::Config(format!("{path:?}: {e}")))?;
        raw.resolve()
    }

    /// Validate resolved values
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            return Err(CloudMountError::Config(
                "cache size must be positive".to_string(),
            ));
        }
        if self.max_concurrent_uploads == 0 || self.max_concurrent_downloads == 0 {
            return Err(CloudMountError::Config(
                "concurrency limits must be positive".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(CloudMountError::Config(
                "max_queue_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Compute the synchronous-upload timeout for a file of the given size:
    /// base + per-MiB overhead, capped at the configured maximum.
    pub fn calculate_upload_timeout(&self, file_size_bytes: u64) -> Duration {
        let size_mb = file_size_bytes as f64 / (1024.0 * 1024.0);
        let computed = self.sync_upload_timeout.as_secs_f64()
            + size_mb * self.sync_upload_timeout_per_mb.as_secs_f64();
        Duration::from_secs_f64(computed.min(self.max_sync_upload_timeout.as_secs_f64()))
    }
}

impl Default for Config {
    fn default() -> Self {
        RawConfig::default()
            .resolve()
            .expect("default configuration is valid")
    }
}

impl RawConfig {
    /// Resolve string sizes into bytes and flatten sections
    pub fn resolve(self) -> Result<Config> {
        Ok(Config {
            logging: self.logging,
            cache_size: parse_size(&self.cache.size)?,
            cache_ttl: self.cache.ttl,
            cache_location: self.cache.location,
            max_concurrent_uploads: self.transfers.max_concurrent_uploads,
            max_concurrent_downloads: self.transfers.max_concurrent_downloads,
            max_queue_size: self.transfers.max_queue_size,
            auto_sync_interval: self.transfers.auto_sync_interval,
            sync_upload_timeout: self.timeouts.sync_upload_timeout,
            sync_upload_timeout_per_mb: self.timeouts.sync_upload_timeout_per_mb,
            max_sync_upload_timeout: self.timeouts.max_sync_upload_timeout,
            foreground: self.mount.foreground,
            debug: self.mount.debug,
            allow_other: self.mount.allow_other,
            s3: self.s3,
        })
    }
}
