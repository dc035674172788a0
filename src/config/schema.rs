//! Configuration schema for strata
//!
//! Global configuration lives at `~/.config/strata/config.toml`; a project
//! may override any key in a `strata.toml` next to its manifest.

use crate::entry::{DEFAULT_CONFIG_TARGET, DEFAULT_PORT, DEFAULT_PORT_FLAG};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Produced image
    pub image: ImageSettings,

    /// Input file locations, relative to the project directory
    pub paths: PathsConfig,

    /// Entry process
    pub entry: EntryConfig,

    /// Package installation
    pub install: InstallConfig,

    /// Cache store
    pub cache: CacheConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Image settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    /// Base image reference
    pub base: String,

    /// Image tag; defaults to `<project name>:latest`
    pub tag: Option<String>,

    /// Application directory inside the image
    pub workdir: PathBuf,

    /// Where image directories are written, relative to the project
    pub output_dir: PathBuf,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            base: "python:3.12-slim".to_string(),
            tag: None,
            workdir: PathBuf::from("/app"),
            output_dir: PathBuf::from(".strata/images"),
        }
    }
}

/// Input file locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub manifest: PathBuf,
    pub lockfile: PathBuf,
    pub runtime_config: PathBuf,

    /// Source tree patterns never copied into the image
    pub exclude: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("pyproject.toml"),
            lockfile: PathBuf::from("uv.lock"),
            runtime_config: PathBuf::from(".streamlit/config.toml"),
            exclude: crate::layer::DEFAULT_EXCLUDES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Entry process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    /// Module run with `python -m`
    pub module: String,

    /// Module arguments
    pub args: Vec<String>,

    /// Port used when the runtime config sets none
    pub port: u16,

    /// Flag passing `port` to the server when the runtime config sets none;
    /// empty to pass nothing
    pub port_flag: String,

    /// In-image path of the runtime config
    pub config_path: PathBuf,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            module: "streamlit".to_string(),
            args: vec!["run".to_string(), "src/app.py".to_string()],
            port: DEFAULT_PORT,
            port_flag: DEFAULT_PORT_FLAG.to_string(),
            config_path: PathBuf::from(DEFAULT_CONFIG_TARGET),
        }
    }
}

/// Installation settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Dependency groups installed with the runtime dependencies
    pub groups: Vec<String>,

    /// `X.Y` interpreter version; derived from `requires-python` when unset
    pub python: Option<String>,

    /// Wheel platform of the base image; `manylinux_2_36_x86_64` when unset
    pub platform: Option<String>,

    /// Whole-build retries on transient fetch failures
    pub retries: u32,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Store directory; defaults to the user cache dir
    pub dir: Option<PathBuf>,

    /// `cache gc` removes entries older than N days
    pub gc_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            gc_days: 30,
        }
    }
}
