/// Configuration for the Quire workflow engine
/// Loaded from `.quire/config.toml`, overridable through environment variables.
use crate::errors::{ConfigError, ConfigResult};
use crate::runner::{DEFAULT_ESCALATION_TARGET, DEFAULT_MAX_STEP_RETRIES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_RELATIVE_PATH: &str = ".quire/config.toml";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuireConfig {
    /// Database location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Step runner behaviour
    #[serde(default)]
    pub engine: EngineConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base storage directory (defaults to .quire)
    #[serde(default = "default_storage_path")]
    pub base_path: String,

    /// SQLite database file, relative to `base_path` unless absolute
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: default_storage_path(),
            database_path: default_database_path(),
        }
    }
}

impl StorageConfig {
    /// Database file with `base_path` applied.
    pub fn resolved_database_path(&self) -> PathBuf {
        let db = PathBuf::from(&self.database_path);
        if db.is_absolute() {
            db
        } else {
            PathBuf::from(&self.base_path).join(db)
        }
    }
}

fn default_storage_path() -> String {
    ".quire".to_string()
}

fn default_database_path() -> String {
    "quire.db".to_string()
}

/// Step runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Postcondition failures tolerated per step before escalating
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,

    /// Extra directories scanned for `*.toml` workflow definitions
    #[serde(default)]
    pub workflow_dirs: Vec<String>,

    /// Directory relative condition paths resolve against
    #[serde(default = "default_base_dir")]
    pub base_dir: String,

    /// Who escalation records are addressed to
    #[serde(default = "default_escalation_target")]
    pub escalation_target: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_step_retries: default_max_step_retries(),
            workflow_dirs: Vec::new(),
            base_dir: default_base_dir(),
            escalation_target: default_escalation_target(),
        }
    }
}

fn default_max_step_retries() -> u32 {
    DEFAULT_MAX_STEP_RETRIES
}

fn default_base_dir() -> String {
    ".".to_string()
}

fn default_escalation_target() -> String {
    DEFAULT_ESCALATION_TARGET.to_string()
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration loader and manager
pub struct ConfigManager {
    config: QuireConfig,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults
    ///
    /// Without an explicit path, `./.quire/config.toml` is tried first and
    /// then `~/.quire/config.toml`.
    pub fn load(config_path: Option<&Path>) -> ConfigResult<Self> {
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => {
                let local = PathBuf::from(CONFIG_RELATIVE_PATH);
                match dirs::home_dir().map(|home| home.join(CONFIG_RELATIVE_PATH)) {
                    Some(home_path) if !local.exists() && home_path.exists() => home_path,
                    _ => local,
                }
            }
        };

        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            warn!("Config file not found at {:?}, using defaults", path);
            QuireConfig::default()
        };

        debug!("Configuration loaded successfully");
        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    pub fn from_config(config: QuireConfig, config_path: PathBuf) -> Self {
        Self {
            config,
            config_path,
        }
    }

    /// Get configuration reference
    pub fn config(&self) -> &QuireConfig {
        &self.config
    }

    /// Get mutable configuration reference
    pub fn config_mut(&mut self) -> &mut QuireConfig {
        &mut self.config
    }

    /// Save configuration to file
    pub fn save(&self) -> ConfigResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::Write(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| ConfigError::Write(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| ConfigError::Write(format!("Failed to write config file: {}", e)))?;

        info!("Configuration saved to {:?}", self.config_path);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.config.storage.database_path.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "storage.database_path must not be empty".to_string(),
            ));
        }

        let level = self.config.logging.level.to_lowercase();
        if !["trace", "debug", "info", "warn", "error"].contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Unknown log level: {}",
                self.config.logging.level
            )));
        }

        if self.config.engine.escalation_target.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "engine.escalation_target must not be empty".to_string(),
            ));
        }

        if self.config.engine.max_step_retries == 0 {
            warn!("engine.max_step_retries is 0, every postcondition failure escalates");
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Apply `QUIRE_DATABASE`, `QUIRE_LOG_LEVEL` and `QUIRE_WORKFLOW_DIRS`.
    pub fn load_from_env(&mut self) -> ConfigResult<()> {
        if let Ok(db) = std::env::var("QUIRE_DATABASE") {
            self.config.storage.database_path = db;
        }

        if let Ok(level) = std::env::var("QUIRE_LOG_LEVEL") {
            self.config.logging.level = level;
        }

        if let Ok(dirs) = std::env::var("QUIRE_WORKFLOW_DIRS") {
            self.config.engine.workflow_dirs = std::env::split_paths(&dirs)
                .map(|p| p.display().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }

        debug!("Configuration loaded from environment variables");
        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QuireConfig::default();
        assert_eq!(config.engine.max_step_retries, 1);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.engine.escalation_target, "human-reviewer");
        assert_eq!(
            config.storage.resolved_database_path(),
            PathBuf::from(".quire/quire.db")
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: QuireConfig = toml::from_str(
            r#"
[engine]
max_step_retries = 3
workflow_dirs = ["workflows"]
"#,
        )
        .unwrap();
        assert_eq!(config.engine.max_step_retries, 3);
        assert_eq!(config.engine.workflow_dirs, vec!["workflows"]);
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn test_absolute_database_path_wins() {
        let storage = StorageConfig {
            base_path: "/srv/quire".to_string(),
            database_path: "/var/db/quire.db".to_string(),
        };
        assert_eq!(
            storage.resolved_database_path(),
            PathBuf::from("/var/db/quire.db")
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = QuireConfig::default();
        config.logging.level = "debug".to_string();
        ConfigManager::from_config(config.clone(), path.clone())
            .save()
            .unwrap();

        let loaded = ConfigManager::load(Some(&path)).unwrap();
        assert_eq!(loaded.config(), &config);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(manager.config(), &QuireConfig::default());
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine\nmax_step_retries = ").unwrap();
        assert!(matches!(
            ConfigManager::load(Some(&path)),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = QuireConfig::default();
        config.storage.database_path = " ".to_string();
        let manager = ConfigManager::from_config(config, PathBuf::from("/tmp/test.toml"));
        assert!(manager.validate().is_err());

        let mut config = QuireConfig::default();
        config.engine.escalation_target = String::new();
        let manager = ConfigManager::from_config(config, PathBuf::from("/tmp/test.toml"));
        assert!(manager.validate().is_err());

        let mut config = QuireConfig::default();
        config.logging.level = "loud".to_string();
        let manager = ConfigManager::from_config(config, PathBuf::from("/tmp/test.toml"));
        assert!(manager.validate().is_err());

        let manager =
            ConfigManager::from_config(QuireConfig::default(), PathBuf::from("/tmp/test.toml"));
        assert!(manager.validate().is_ok());
    }
}
