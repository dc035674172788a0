//! CLI command implementations

pub mod build;
pub mod cache;
pub mod check;
pub mod config;
pub mod containerfile;
pub mod plan;

pub use build::execute as build;
pub use cache::execute as cache;
pub use check::execute as check;
pub use config::execute as config;
pub use containerfile::execute as containerfile;
pub use plan::execute as plan;

use crate::cache::CacheStore;
use crate::config::{Config, ConfigManager};
use crate::entry::EntrySettings;
use crate::error::{StrataError, StrataResult};
use crate::layer::{BuildInputs, BuildSettings};
use crate::resolve::target::DEFAULT_PLATFORM;
use crate::resolve::Manifest;
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Inputs and settings of one project, resolved from configuration
pub struct ProjectSetup {
    pub dir: PathBuf,
    pub inputs: BuildInputs,
    pub settings: BuildSettings,
    pub output_dir: PathBuf,
}

impl ProjectSetup {
    /// Resolve the project at `project` (or the current directory)
    pub async fn load(
        config: &Config,
        project: Option<&Path>,
        tag: Option<String>,
    ) -> StrataResult<Self> {
        let dir = project_dir(project)?;
        let inputs = BuildInputs {
            manifest: dir.join(&config.paths.manifest),
            lockfile: dir.join(&config.paths.lockfile),
            source_dir: dir.clone(),
            runtime_config: dir.join(&config.paths.runtime_config),
        };

        let tag = match tag.or_else(|| config.image.tag.clone()) {
            Some(tag) => tag,
            None => default_tag(&inputs.manifest, &dir).await,
        };

        let settings = BuildSettings {
            tag,
            base_image: config.image.base.clone(),
            workdir: config.image.workdir.clone(),
            python_version: config.install.python.clone(),
            groups: config.install.groups.clone(),
            platform: config
                .install
                .platform
                .clone()
                .unwrap_or_else(|| DEFAULT_PLATFORM.to_string()),
            entry: EntrySettings {
                module: config.entry.module.clone(),
                args: config.entry.args.clone(),
                default_port: config.entry.port,
                port_flag: Some(config.entry.port_flag.trim())
                    .filter(|flag| !flag.is_empty())
                    .map(str::to_string),
                config_target: config.entry.config_path.clone(),
            },
            source_excludes: config.paths.exclude.clone(),
            no_cache: false,
        };

        Ok(Self {
            output_dir: dir.join(&config.image.output_dir),
            dir,
            inputs,
            settings,
        })
    }
}

/// Open the configured cache store
pub fn open_store(config: &Config) -> StrataResult<CacheStore> {
    let root = config
        .cache
        .dir
        .clone()
        .unwrap_or_else(ConfigManager::default_cache_dir);
    debug!("Cache store at {}", root.display());
    CacheStore::open(root)
}

/// Canonical project directory
pub fn project_dir(project: Option<&Path>) -> StrataResult<PathBuf> {
    let dir = match project {
        Some(p) => p.to_path_buf(),
        None => env::current_dir().map_err(|e| StrataError::io("getting current directory", e))?,
    };
    if !dir.is_dir() {
        return Err(StrataError::PathNotFound(dir));
    }
    Ok(dir.canonicalize().unwrap_or(dir))
}

/// `<project name>:latest`, or the directory name when the manifest is unreadable
async fn default_tag(manifest: &Path, dir: &Path) -> String {
    match Manifest::from_file(manifest).await {
        Ok(m) => format!("{}:latest", m.name),
        Err(_) => {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_else(|| "app".to_string());
            format!("{}:latest", name)
        }
    }
}
