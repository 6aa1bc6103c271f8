//! Orchestrator configuration.
//!
//! [`DownloadConfig`] is built in code with the `with_*` methods, or loaded
//! from an INI file through [`ConfigFile`]:
//!
//! ```ini
//! [download]
//! work_dir = /var/lib/bundlefetch
//! output_dir = /srv/content
//! chunk_size = 4194304
//! max_concurrent_chunks = 2
//! max_retries = 3
//! retry_base_delay_secs = 5
//! retry_max_delay_secs = 60
//! safety_margin_bytes = 524288000
//! request_timeout_secs = 30
//! recheck_storage = true
//! progress_interval_ms = 250
//! require_artifact_digest = false
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;

use crate::error::{DownloadError, DownloadResult};
use crate::orchestrator::RetryPolicy;

/// Default chunk size (4 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of chunk transfers in flight.
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 2;

/// Default free space kept on the device (500 MiB).
pub const DEFAULT_SAFETY_MARGIN_BYTES: u64 = 500 * 1024 * 1024;

/// Default HTTP timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default minimum interval between progress notifications per task.
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 250;

const SECTION: &str = "download";

/// Configuration for the download orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadConfig {
    /// Directory for chunk files, temp files and the task store.
    pub work_dir: PathBuf,

    /// Default directory for assembled artifacts.
    pub output_dir: PathBuf,

    /// Chunk size used when a request does not override it.
    pub chunk_size: u64,

    /// Maximum chunk transfers in flight across all tasks.
    pub max_concurrent_chunks: usize,

    /// Retry behaviour for failed chunks.
    pub retry: RetryPolicy,

    /// Free space that must remain after admitting new content.
    pub safety_margin_bytes: u64,

    /// HTTP timeout for connects and body reads.
    pub request_timeout: Duration,

    /// Re-run the storage check before every chunk dispatch.
    pub recheck_storage: bool,

    /// Minimum interval between progress notifications per task.
    pub progress_interval: Duration,

    /// Reject requests that carry no whole-artifact digest.
    pub require_artifact_digest: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let work_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("bundlefetch");
        Self {
            output_dir: work_dir.join("content"),
            work_dir,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            retry: RetryPolicy::default(),
            safety_margin_bytes: DEFAULT_SAFETY_MARGIN_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            recheck_storage: true,
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            require_artifact_digest: false,
        }
    }
}

impl DownloadConfig {
    /// Create a configuration rooted at `work_dir`.
    ///
    /// Artifacts go to `<work_dir>/content` unless an output directory is set.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            output_dir: work_dir.join("content"),
            work_dir,
            ..Default::default()
        }
    }

    /// Set the artifact output directory.
    pub fn with_output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    /// Set the default chunk size.
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set the concurrency ceiling (at least 1).
    pub fn with_max_concurrent_chunks(mut self, max: usize) -> Self {
        self.max_concurrent_chunks = max.max(1);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the storage safety margin.
    pub fn with_safety_margin(mut self, bytes: u64) -> Self {
        self.safety_margin_bytes = bytes;
        self
    }

    /// Set the HTTP timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable or disable the per-chunk storage re-check.
    pub fn with_recheck_storage(mut self, recheck: bool) -> Self {
        self.recheck_storage = recheck;
        self
    }

    /// Set the progress notification interval.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Require every request to carry a whole-artifact digest.
    pub fn with_require_artifact_digest(mut self, require: bool) -> Self {
        self.require_artifact_digest = require;
        self
    }

    /// Check values that would make the orchestrator unusable.
    pub fn validate(&self) -> DownloadResult<()> {
        if self.chunk_size == 0 {
            return Err(DownloadError::InvalidConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(DownloadError::InvalidConfig(
                "max_concurrent_chunks must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(DownloadError::InvalidConfig(
                "retry base delay exceeds max delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding per-task chunk and temp files.
    pub fn tasks_dir(&self) -> PathBuf {
        self.work_dir.join("tasks")
    }

    /// Path of the JSON task store.
    pub fn store_path(&self) -> PathBuf {
        self.work_dir.join("state").join("tasks.json")
    }

    /// Directory for log files.
    pub fn log_dir(&self) -> PathBuf {
        self.work_dir.join("logs")
    }
}

/// INI-backed configuration file.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    /// Wrap the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/bundlefetch/config.ini`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bundlefetch").join("config.ini"))
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file over the defaults.
    ///
    /// A missing file yields the defaults. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for unparsable files or malformed values.
    pub fn load(&self) -> DownloadResult<DownloadConfig> {
        if !self.path.exists() {
            return Ok(DownloadConfig::default());
        }

        let ini = Ini::load_from_file(&self.path).map_err(|e| {
            DownloadError::InvalidConfig(format!("{}: {}", self.path.display(), e))
        })?;
        let mut config = DownloadConfig::default();

        let Some(section) = ini.section(Some(SECTION)) else {
            return Ok(config);
        };

        if let Some(v) = section.get("work_dir") {
            config.work_dir = PathBuf::from(v);
            config.output_dir = config.work_dir.join("content");
        }
        if let Some(v) = section.get("output_dir") {
            config.output_dir = PathBuf::from(v);
        }
        if let Some(v) = section.get("chunk_size") {
            config.chunk_size = parse_value("chunk_size", v)?;
        }
        if let Some(v) = section.get("max_concurrent_chunks") {
            config.max_concurrent_chunks = parse_value::<usize>("max_concurrent_chunks", v)?.max(1);
        }
        if let Some(v) = section.get("max_retries") {
            config.retry.max_retries = parse_value("max_retries", v)?;
        }
        if let Some(v) = section.get("retry_base_delay_secs") {
            config.retry.base_delay = Duration::from_secs(parse_value("retry_base_delay_secs", v)?);
        }
        if let Some(v) = section.get("retry_max_delay_secs") {
            config.retry.max_delay = Duration::from_secs(parse_value("retry_max_delay_secs", v)?);
        }
        if let Some(v) = section.get("safety_margin_bytes") {
            config.safety_margin_bytes = parse_value("safety_margin_bytes", v)?;
        }
        if let Some(v) = section.get("request_timeout_secs") {
            config.request_timeout = Duration::from_secs(parse_value("request_timeout_secs", v)?);
        }
        if let Some(v) = section.get("recheck_storage") {
            config.recheck_storage = parse_bool("recheck_storage", v)?;
        }
        if let Some(v) = section.get("progress_interval_ms") {
            config.progress_interval =
                Duration::from_millis(parse_value("progress_interval_ms", v)?);
        }
        if let Some(v) = section.get("require_artifact_digest") {
            config.require_artifact_digest = parse_bool("require_artifact_digest", v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Write `config` to the file, creating parent directories.
    pub fn save(&self, config: &DownloadConfig) -> DownloadResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DownloadError::io(parent, e))?;
        }

        let mut ini = Ini::new();
        ini.with_section(Some(SECTION))
            .set("work_dir", config.work_dir.to_string_lossy())
            .set("output_dir", config.output_dir.to_string_lossy())
            .set("chunk_size", config.chunk_size.to_string())
            .set(
                "max_concurrent_chunks",
                config.max_concurrent_chunks.to_string(),
            )
            .set("max_retries", config.retry.max_retries.to_string())
            .set(
                "retry_base_delay_secs",
                config.retry.base_delay.as_secs().to_string(),
            )
            .set(
                "retry_max_delay_secs",
                config.retry.max_delay.as_secs().to_string(),
            )
            .set(
                "safety_margin_bytes",
                config.safety_margin_bytes.to_string(),
            )
            .set(
                "request_timeout_secs",
                config.request_timeout.as_secs().to_string(),
            )
            .set("recheck_storage", config.recheck_storage.to_string())
            .set(
                "progress_interval_ms",
                config.progress_interval.as_millis().to_string(),
            )
            .set(
                "require_artifact_digest",
                config.require_artifact_digest.to_string(),
            );

        ini.write_to_file(&self.path)
            .map_err(|e| DownloadError::io(&self.path, e))
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> DownloadResult<T> {
    value.trim().parse().map_err(|_| {
        DownloadError::InvalidConfig(format!("invalid value for {}: '{}'", key, value))
    })
}

fn parse_bool(key: &str, value: &str) -> DownloadResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(DownloadError::InvalidConfig(format!(
            "invalid value for {}: '{}'",
            key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = DownloadConfig::default();
        assert_eq!(config.chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.max_concurrent_chunks, 2);
        assert_eq!(config.safety_margin_bytes, 500 * 1024 * 1024);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.recheck_storage);
        assert!(!config.require_artifact_digest);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = DownloadConfig::new("/data/work")
            .with_output_dir("/data/out")
            .with_chunk_size(1024)
            .with_max_concurrent_chunks(0)
            .with_safety_margin(10)
            .with_recheck_storage(false);

        assert_eq!(config.work_dir, PathBuf::from("/data/work"));
        assert_eq!(config.output_dir, PathBuf::from("/data/out"));
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.max_concurrent_chunks, 1); // clamped
        assert_eq!(config.store_path(), PathBuf::from("/data/work/state/tasks.json"));
        assert!(!config.recheck_storage);
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let config = DownloadConfig::new("/w").with_chunk_size(0);
        assert!(matches!(
            config.validate(),
            Err(DownloadError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let file = ConfigFile::new(temp.path().join("config.ini"));
        assert_eq!(file.load().unwrap(), DownloadConfig::default());
    }

    #[test]
    fn test_load_overrides_and_ignores_unknown_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(
            &path,
            "[download]\nwork_dir = /srv/bf\nchunk_size = 1048576\nmax_retries = 5\n\
             recheck_storage = no\nprogress_interval_ms = 100\nflavour = vanilla\n",
        )
        .unwrap();

        let config = ConfigFile::new(&path).load().unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/srv/bf"));
        assert_eq!(config.output_dir, PathBuf::from("/srv/bf/content"));
        assert_eq!(config.chunk_size, 1_048_576);
        assert_eq!(config.retry.max_retries, 5);
        assert!(!config.recheck_storage);
        assert_eq!(config.progress_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_malformed_value_is_invalid_config() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[download]\nchunk_size = four megs\n").unwrap();

        let err = ConfigFile::new(&path).load().unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let file = ConfigFile::new(temp.path().join("nested").join("config.ini"));
        let config = DownloadConfig::new(temp.path().join("work"))
            .with_chunk_size(65_536)
            .with_require_artifact_digest(true);

        file.save(&config).unwrap();
        assert_eq!(file.load().unwrap(), config);
    }
}
