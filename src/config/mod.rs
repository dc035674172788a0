//! Configuration management for strata

pub mod schema;

pub use schema::Config;

use crate::error::{StrataError, StrataResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Name of the project-local override file
pub const LOCAL_CONFIG: &str = "strata.toml";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Global config path: `STRATA_CONFIG`, else the user config dir
    pub fn default_config_path() -> PathBuf {
        if let Some(path) = std::env::var_os("STRATA_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata")
    }

    /// Default cache store location
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| Self::state_dir().join("cache"))
            .join("strata")
    }

    /// Get the audit log path
    pub fn audit_log_path() -> PathBuf {
        Self::state_dir().join("audit.log")
    }

    /// Load the global configuration, defaults if the file is absent
    pub async fn load(&self) -> StrataResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load the global configuration with `strata.toml` from `project_dir` merged over it
    pub async fn load_for_project(&self, project_dir: &Path) -> StrataResult<Config> {
        let mut merged = if self.config_path.exists() {
            read_table(&self.config_path).await?
        } else {
            toml::Table::new()
        };

        let local = project_dir.join(LOCAL_CONFIG);
        if local.exists() {
            debug!("Merging project config {}", local.display());
            merge_tables(&mut merged, read_table(&local).await?);
        }

        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| StrataError::ConfigInvalid {
                path: local,
                reason: e.to_string(),
            })
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> StrataResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| StrataError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| StrataError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> StrataResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            StrataError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> StrataResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StrataError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure the state directory exists
    pub async fn ensure_state_dirs() -> StrataResult<()> {
        let dir = Self::state_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StrataError::io(format!("creating directory {}", dir.display()), e))
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_table(path: &Path) -> StrataResult<toml::Table> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| StrataError::io(format!("reading config from {}", path.display()), e))?;
    toml::from_str(&content).map_err(|e| StrataError::ConfigInvalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Merge `overlay` into `base`; nested tables merge, everything else replaces
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nonexistent.toml");
        let manager = ConfigManager::with_path(path);

        let config = manager.load().await.unwrap();
        assert_eq!(config.image.base, "python:3.12-slim");
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let manager = ConfigManager::with_path(path);

        let mut config = Config::default();
        config.install.retries = 2;

        manager.save(&config).await.unwrap();
        let loaded = manager.load().await.unwrap();

        assert_eq!(loaded.install.retries, 2);
    }

    #[tokio::test]
    async fn project_config_overrides_global() {
        let temp = TempDir::new().unwrap();
        let global = temp.path().join("config.toml");
        std::fs::write(
            &global,
            "[image]\nbase = \"python:3.11-slim\"\nworkdir = \"/srv\"\n[install]\nretries = 3\n",
        )
        .unwrap();
        let project = temp.path().join("project");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(
            project.join(LOCAL_CONFIG),
            "[image]\ntag = \"tools:dev\"\n[entry]\nport = 9000\n",
        )
        .unwrap();

        let config = ConfigManager::with_path(global)
            .load_for_project(&project)
            .await
            .unwrap();
        assert_eq!(config.image.base, "python:3.11-slim");
        assert_eq!(config.image.workdir, PathBuf::from("/srv"));
        assert_eq!(config.image.tag.as_deref(), Some("tools:dev"));
        assert_eq!(config.entry.port, 9000);
        assert_eq!(config.install.retries, 3);
    }

    #[test]
    #[serial_test::serial]
    fn strata_config_env_overrides_default_path() {
        std::env::set_var("STRATA_CONFIG", "/tmp/strata-test/config.toml");
        let path = ConfigManager::default_config_path();
        std::env::remove_var("STRATA_CONFIG");

        assert_eq!(path, PathBuf::from("/tmp/strata-test/config.toml"));
        assert!(ConfigManager::default_config_path().ends_with("strata/config.toml"));
    }

    #[tokio::test]
    async fn invalid_project_config_is_reported() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(LOCAL_CONFIG), "[entry]\nport = \"high\"\n").unwrap();

        let err = ConfigManager::with_path(temp.path().join("missing.toml"))
            .load_for_project(temp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::ConfigInvalid { .. }));
    }
}
