//! Pond configuration file support
//!
//! Handles parsing of `.duckpond.toml` configuration files and
//! environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PondError, PondResult};

/// Default configuration filename
pub const CONFIG_FILENAME: &str = ".duckpond.toml";

/// Default pond root directory
pub const DEFAULT_POND_ROOT_DIR: &str = "duckpond";

/// Default namespace for stream tables
pub const DEFAULT_TARGET_SCHEMA: &str = "main";

/// Environment variable for the pond root directory
pub const ENV_POND_ROOT_DIR: &str = "DUCKPOND_ROOT_DIR";

/// Environment variable for the default namespace
pub const ENV_DEFAULT_TARGET_SCHEMA: &str = "DUCKPOND_DEFAULT_TARGET_SCHEMA";

/// Environment variable for the commit lock timeout
pub const ENV_LOCK_TIMEOUT_SECS: &str = "DUCKPOND_LOCK_TIMEOUT_SECS";

/// Environment variable for the batch size
pub const ENV_BATCH_SIZE_ROWS: &str = "DUCKPOND_BATCH_SIZE_ROWS";

fn default_pond_root_dir() -> PathBuf {
    PathBuf::from(DEFAULT_POND_ROOT_DIR)
}

fn default_target_schema() -> Option<String> {
    Some(DEFAULT_TARGET_SCHEMA.to_string())
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_batch_size_rows() -> usize {
    10_000
}

/// Main configuration structure
///
/// Represents the `.duckpond.toml` configuration file format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PondConfig {
    /// Root directory holding `raw/` and `tmp/`
    #[serde(default = "default_pond_root_dir")]
    pub pond_root_dir: PathBuf,

    /// Namespace used for every stream table; empty disables it
    #[serde(default = "default_target_schema")]
    pub default_target_schema: Option<String>,

    /// Seconds to wait for a destination lock; 0 waits forever
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Rows a stream writer stages before it is committed and replaced
    #[serde(default = "default_batch_size_rows")]
    pub batch_size_rows: usize,
}

impl Default for PondConfig {
    fn default() -> Self {
        Self {
            pond_root_dir: default_pond_root_dir(),
            default_target_schema: default_target_schema(),
            lock_timeout_secs: default_lock_timeout_secs(),
            batch_size_rows: default_batch_size_rows(),
        }
    }
}

impl PondConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration rooted at the given directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            pond_root_dir: root.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a directory
    ///
    /// Looks for `.duckpond.toml` in the directory.
    /// Falls back to defaults if not found.
    pub fn load(dir: &Path) -> PondResult<Self> {
        let config_path = dir.join(CONFIG_FILENAME);

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| PondError::resource(&config_path, e))?;

            Self::parse(&content)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> PondResult<Self> {
        toml::from_str(content)
            .map_err(|e| PondError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a directory
    pub fn save(&self, dir: &Path) -> PondResult<()> {
        let config_path = dir.join(CONFIG_FILENAME);
        let content = self.to_toml()?;

        std::fs::write(&config_path, content).map_err(|e| PondError::resource(&config_path, e))?;

        Ok(())
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> PondResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PondError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var(ENV_POND_ROOT_DIR) {
            self.pond_root_dir = PathBuf::from(root);
        }

        if let Ok(schema) = std::env::var(ENV_DEFAULT_TARGET_SCHEMA) {
            self.default_target_schema = Some(schema);
        }

        if let Ok(secs) = std::env::var(ENV_LOCK_TIMEOUT_SECS)
            && let Ok(secs) = secs.parse()
        {
            self.lock_timeout_secs = secs;
        }

        if let Ok(rows) = std::env::var(ENV_BATCH_SIZE_ROWS)
            && let Ok(rows) = rows.parse()
        {
            self.batch_size_rows = rows;
        }
    }

    /// The default namespace, with an empty string treated as none
    pub fn default_namespace(&self) -> Option<&str> {
        self.default_target_schema
            .as_deref()
            .filter(|schema| !schema.trim().is_empty())
    }

    /// Lock wait bound; `None` blocks until the lock is free
    pub fn lock_timeout(&self) -> Option<Duration> {
        match self.lock_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Generate a sample configuration file content
pub fn sample_config() -> &'static str {
    r#"# DuckPond target configuration

# Root directory of the pond (holds raw/ and tmp/)
pond_root_dir = "duckpond"

# Namespace for stream tables; set to "" to derive it from the stream name
default_target_schema = "main"

# Seconds to wait for another writer to release a destination (0 = forever)
lock_timeout_secs = 30

# Rows staged per writer before it is committed
batch_size_rows = 10000
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = PondConfig::new();
        assert_eq!(config.pond_root_dir, PathBuf::from(DEFAULT_POND_ROOT_DIR));
        assert_eq!(config.default_namespace(), Some("main"));
        assert_eq!(config.lock_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.batch_size_rows, 10_000);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
pond_root_dir = "/data/pond"
default_target_schema = "analytics"
lock_timeout_secs = 5
batch_size_rows = 500
"#;
        let config = PondConfig::parse(toml).unwrap();
        assert_eq!(config.pond_root_dir, PathBuf::from("/data/pond"));
        assert_eq!(config.default_namespace(), Some("analytics"));
        assert_eq!(config.lock_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.batch_size_rows, 500);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = PondConfig::parse("pond_root_dir = \"elsewhere\"").unwrap();
        assert_eq!(config.pond_root_dir, PathBuf::from("elsewhere"));
        assert_eq!(config.default_namespace(), Some(DEFAULT_TARGET_SCHEMA));
        assert_eq!(config.batch_size_rows, 10_000);
    }

    #[test]
    fn test_empty_schema_disables_namespace() {
        let config = PondConfig::parse("default_target_schema = \"\"").unwrap();
        assert_eq!(config.default_namespace(), None);
    }

    #[test]
    fn test_zero_timeout_waits_forever() {
        let config = PondConfig::parse("lock_timeout_secs = 0").unwrap();
        assert_eq!(config.lock_timeout(), None);
    }

    #[test]
    fn test_invalid_config() {
        let err = PondConfig::parse("lock_timeout_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, PondError::Config(_)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let config = PondConfig {
            batch_size_rows: 42,
            ..PondConfig::with_root("/srv/pond")
        };

        config.save(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILENAME).exists());

        let loaded = PondConfig::parse(
            &std::fs::read_to_string(dir.path().join(CONFIG_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_sample_config_is_valid() {
        let result = PondConfig::parse(sample_config());
        assert!(result.is_ok(), "Sample config should be valid TOML");
        assert_eq!(result.unwrap(), PondConfig::default());
    }
}
