//! Worker configuration
//!
//! Loaded from a TOML file. Every field has a default so an empty (or missing)
//! file yields a usable configuration.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    /// Per-tenant overrides, keyed by tenant id
    pub tenants: HashMap<String, TenantConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("worker.db");
        Self { path }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: u64,
    pub attachment_matching: bool,
    pub template_matching: bool,
    /// Outcomes scoring above this are never cached
    pub score_ceiling: f64,
    /// The scanner's own reject threshold; the ceiling must stay below it
    pub reject_threshold: f64,
    pub maintenance_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 24 * 60 * 60,
            max_entries: 100_000,
            attachment_matching: false,
            template_matching: false,
            score_ceiling: 3.0,
            reject_threshold: 15.0,
            maintenance_interval_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    /// A lock older than this is presumed abandoned
    pub lock_stale_secs: u64,
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub max_attempts: u32,
    pub retry_base_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lock_stale_secs: 600,
            poll_interval_ms: 250,
            max_poll_interval_ms: 5_000,
            max_attempts: 5,
            retry_base_secs: 30,
        }
    }
}

impl QueueConfig {
    pub fn lock_stale_window(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_secs(self.retry_base_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    /// Set to false to opt this tenant out of the scan cache entirely
    pub cache: bool,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self { cache: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load `config.toml` from the platform config directory, or defaults if absent
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.workers == 0 {
            bail!("queue.workers must be at least 1");
        }
        if self.queue.lock_stale_secs == 0 {
            bail!("queue.lock_stale_secs must be greater than zero");
        }
        if self.queue.max_attempts == 0 {
            bail!("queue.max_attempts must be at least 1");
        }
        if self.queue.poll_interval_ms == 0 {
            bail!("queue.poll_interval_ms must be greater than zero");
        }
        if self.queue.max_poll_interval_ms < self.queue.poll_interval_ms {
            bail!("queue.max_poll_interval_ms must not be below queue.poll_interval_ms");
        }
        if self.cache.ttl_secs == 0 {
            bail!("cache.ttl_secs must be greater than zero");
        }
        if self.cache.maintenance_interval_secs == 0 {
            bail!("cache.maintenance_interval_secs must be greater than zero");
        }
        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be greater than zero");
        }
        if !(self.cache.score_ceiling < self.cache.reject_threshold) {
            bail!(
                "cache.score_ceiling ({}) must be below cache.reject_threshold ({})",
                self.cache.score_ceiling,
                self.cache.reject_threshold
            );
        }
        Ok(())
    }

    /// Whether jobs for this tenant may use the scan cache
    pub fn cache_enabled_for(&self, tenant: &str) -> bool {
        self.cache.enabled && self.tenants.get(tenant).map_or(true, |t| t.cache)
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "mailworker")
}

/// `<config dir>/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert!(config.cache.enabled);
        assert_eq!(config.queue.workers, 4);
        assert_eq!(config.cache.ttl(), Duration::from_secs(86_400));
        assert!(!config.cache.attachment_matching);
        assert!(!config.cache.template_matching);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
            [database]
            path = "/tmp/worker.db"

            [cache]
            ttl_secs = 60
            max_entries = 10
            template_matching = true
            score_ceiling = 2.5

            [queue]
            workers = 8
            lock_stale_secs = 30

            [tenants.acme]
            cache = false

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.database.path, PathBuf::from("/tmp/worker.db"));
        assert_eq!(config.cache.max_entries, 10);
        assert!(config.cache.template_matching);
        assert_eq!(config.queue.workers, 8);
        assert_eq!(config.queue.lock_stale_window(), Duration::from_secs(30));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.cache_enabled_for("acme"));
        assert!(config.cache_enabled_for("globex"));
    }

    #[test]
    fn test_ceiling_must_be_below_reject_threshold() {
        let err = Config::from_toml(
            r#"
            [cache]
            score_ceiling = 15.0
            reject_threshold = 15.0
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("score_ceiling"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(Config::from_toml("[queue]\nworkers = 0").is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let err = Config::from_toml("[queue]\npoll_interval_ms = 0\nmax_poll_interval_ms = 0")
            .unwrap_err();
        assert!(format!("{:#}", err).contains("poll_interval_ms"));

        let err = Config::from_toml("[cache]\nmaintenance_interval_secs = 0").unwrap_err();
        assert!(format!("{:#}", err).contains("maintenance_interval_secs"));

        assert!(Config::from_toml("[queue]\nlock_stale_secs = 0").is_err());
    }

    #[test]
    fn test_global_switch_overrides_tenants() {
        let mut config = Config::default();
        config.cache.enabled = false;
        assert!(!config.cache_enabled_for("anyone"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[queue]\nworkers = 2\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.queue.workers, 2);
    }
}
