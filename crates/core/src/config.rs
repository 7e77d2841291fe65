//! driftsync configuration file parsing (.driftsync.toml)

use std::path::Path;
use std::time::Duration;

use color_eyre::eyre::bail;

use crate::hash::SAMPLE_SIZE;
use crate::protocol::MAX_REGION_SIZE;
use crate::region::REGION_SIZE;
use crate::slow::BATCH_SIZE;

/// Config file name, looked up at the synced root
pub const CONFIG_FILE: &str = ".driftsync.toml";

/// driftsync project configuration
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Glob patterns left out of the directory walk
    pub exclude: Vec<String>,

    /// Skip files matched by `.gitignore`
    pub respect_gitignore: bool,

    pub engine: EngineConfig,

    pub replica: ReplicaConfig,
}

/// Server engine tuning
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub region_size: u64,
    pub sample_size: u64,
    /// Regions per slow-scan read
    pub batch_size: usize,
    pub offer_expiry_secs: u64,
    pub fast_scan_interval_ms: u64,
    pub slow_scan_interval_ms: u64,
    pub finder_interval_ms: u64,
    pub progress_interval_ms: u64,
    pub stats_interval_secs: u64,
    /// Candidate queue drains to this before producers resume
    pub queue_min_shrink: usize,
    /// Candidate queue size at which producers are held back
    pub queue_max_grow: usize,
    pub client_idle_timeout_secs: u64,
    /// Confirmed transfers of one region before it is reported as diverging
    pub divergence_warn_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            region_size: REGION_SIZE,
            sample_size: SAMPLE_SIZE,
            batch_size: BATCH_SIZE,
            offer_expiry_secs: 30,
            fast_scan_interval_ms: 5_000,
            slow_scan_interval_ms: 30_000,
            finder_interval_ms: 2_000,
            progress_interval_ms: 1_000,
            stats_interval_secs: 30,
            queue_min_shrink: 50,
            queue_max_grow: 200,
            client_idle_timeout_secs: 600,
            divergence_warn_threshold: 5,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn offer_expiry(&self) -> Duration {
        Duration::from_secs(self.offer_expiry_secs)
    }

    #[must_use]
    pub fn fast_scan_interval(&self) -> Duration {
        Duration::from_millis(self.fast_scan_interval_ms)
    }

    #[must_use]
    pub fn slow_scan_interval(&self) -> Duration {
        Duration::from_millis(self.slow_scan_interval_ms)
    }

    #[must_use]
    pub fn finder_interval(&self) -> Duration {
        Duration::from_millis(self.finder_interval_ms)
    }

    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    #[must_use]
    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.client_idle_timeout_secs)
    }
}

/// Replica tuning
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Concurrent puller workers
    pub workers: usize,
    pub refresh_interval_ms: u64,
    /// How long the server may hold a poll open waiting for work
    pub poll_timeout_ms: u64,
    /// Pause after an empty poll or a failed one
    pub idle_backoff_ms: u64,
    /// Digests per report call
    pub digest_batch_size: usize,
    /// Give up on one remote call after this long; must exceed the poll timeout
    pub call_timeout_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            refresh_interval_ms: 30_000,
            poll_timeout_ms: 2_000,
            idle_backoff_ms: 1_000,
            digest_batch_size: 200,
            call_timeout_ms: 90_000,
        }
    }
}

impl ReplicaConfig {
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    #[must_use]
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl SyncConfig {
    /// Load config from the synced root.
    ///
    /// Returns default config if .driftsync.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(root: &Path) -> color_eyre::Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Check values the engine and wire format cannot work with.
    ///
    /// # Errors
    /// Returns an error naming the offending key.
    pub fn validate(&self) -> color_eyre::Result<()> {
        let region_size = self.engine.region_size;
        if region_size == 0 {
            bail!("engine.region_size must be positive");
        }
        if region_size > MAX_REGION_SIZE {
            bail!("engine.region_size {region_size} exceeds the {MAX_REGION_SIZE} byte frame limit");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
exclude = ["*.tmp", "target/"]
respect_gitignore = true

[engine]
region_size = 1048576
offer_expiry_secs = 10
queue_min_shrink = 5
queue_max_grow = 20

[replica]
workers = 4
"#;

        let config: SyncConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.exclude, vec!["*.tmp", "target/"]);
        assert!(config.respect_gitignore);
        assert_eq!(config.engine.region_size, 1_048_576);
        assert_eq!(config.engine.offer_expiry(), Duration::from_secs(10));
        assert_eq!(config.engine.queue_min_shrink, 5);
        assert_eq!(config.engine.queue_max_grow, 20);
        // Unset keys keep their defaults
        assert_eq!(config.engine.sample_size, SAMPLE_SIZE);
        assert_eq!(config.replica.workers, 4);
        assert_eq!(config.replica.digest_batch_size, 200);
    }

    #[test]
    fn test_parse_empty_config() {
        let config: SyncConfig = toml::from_str("").unwrap();
        assert!(config.exclude.is_empty());
        assert!(!config.respect_gitignore);
        assert_eq!(config.engine.region_size, REGION_SIZE);
        assert_eq!(config.engine.batch_size, BATCH_SIZE);
        assert_eq!(config.engine.divergence_warn_threshold, 5);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = SyncConfig::load(dir.path()).unwrap();
        assert_eq!(config.engine.offer_expiry(), Duration::from_secs(30));
    }

    #[test]
    fn test_region_size_must_fit_a_frame() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[engine]\nregion_size = 134217728\n").unwrap();
        let err = SyncConfig::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("engine.region_size"), "{err}");

        let mut config = SyncConfig::default();
        config.engine.region_size = MAX_REGION_SIZE;
        assert!(config.validate().is_ok());
        config.engine.region_size = MAX_REGION_SIZE + 1;
        assert!(config.validate().is_err());
        config.engine.region_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "engine = 3").unwrap();
        assert!(SyncConfig::load(dir.path()).is_err());
    }
}
