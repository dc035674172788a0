//! Entry configurator
//!
//! Copies the runtime configuration file to its fixed path in the image
//! and assembles the launch command. The file's contents belong to the
//! served application; only `[server] port` is read, to pick the port the
//! image exposes. When the file sets no port the server would fall back to
//! its own default, so the configured port is passed on the command line.

use crate::error::{StrataError, StrataResult};
use crate::install::FileWriter;
use crate::layer::digest::in_root;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Port exposed when nothing else picks one
pub const DEFAULT_PORT: u16 = 8501;

/// Fixed in-image path of the runtime configuration
pub const DEFAULT_CONFIG_TARGET: &str = "/root/.streamlit/config.toml";

/// Flag that sets the server port
pub const DEFAULT_PORT_FLAG: &str = "--server.port";

/// How the image starts its entry process
#[derive(Debug, Clone)]
pub struct EntrySettings {
    /// Module run with `python -m`
    pub module: String,
    /// Arguments after the module name
    pub args: Vec<String>,
    /// Port used when the runtime config sets none
    pub default_port: u16,
    /// Flag passing `default_port` to the server; `None` passes nothing
    pub port_flag: Option<String>,
    /// Where the runtime config is copied inside the image
    pub config_target: PathBuf,
}

impl Default for EntrySettings {
    fn default() -> Self {
        Self {
            module: "streamlit".to_string(),
            args: vec!["run".to_string(), "src/app.py".to_string()],
            default_port: DEFAULT_PORT,
            port_flag: Some(DEFAULT_PORT_FLAG.to_string()),
            config_target: PathBuf::from(DEFAULT_CONFIG_TARGET),
        }
    }
}

/// The runtime configuration file on the host
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub source: PathBuf,
    contents: Vec<u8>,
    port: Option<u16>,
}

impl RuntimeConfig {
    /// Read the file; absence is the only failure
    pub fn load(path: &Path) -> StrataResult<Self> {
        if !path.is_file() {
            return Err(StrataError::ConfigNotFound(path.to_path_buf()));
        }
        let contents = fs::read(path)
            .map_err(|e| StrataError::io(format!("reading {}", path.display()), e))?;
        let port = server_port(&contents, path);
        Ok(Self {
            source: path.to_path_buf(),
            contents,
            port,
        })
    }

    /// `[server] port` from the file, if it sets a valid one
    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

fn server_port(contents: &[u8], path: &Path) -> Option<u16> {
    let text = String::from_utf8_lossy(contents);
    let value: toml::Value = match toml::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Runtime config {} is not valid TOML: {}", path.display(), e);
            return None;
        }
    };
    let port = value.get("server")?.get("port")?.as_integer()?;
    match u16::try_from(port) {
        Ok(p) if p > 0 => Some(p),
        _ => {
            warn!("Ignoring out-of-range server.port {} in {}", port, path.display());
            None
        }
    }
}

/// Fully assembled entry process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchCommand {
    pub interpreter: PathBuf,
    pub module: String,
    pub args: Vec<String>,
    pub port: u16,
    pub working_dir: PathBuf,
}

impl LaunchCommand {
    /// Command vector as stored in the image config
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![
            self.interpreter.display().to_string(),
            "-m".to_string(),
            self.module.clone(),
        ];
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Launch command on the default port, before any runtime config is read.
///
/// The port flag is appended unless the configured args already set it.
pub fn default_launch(settings: &EntrySettings, workdir: &Path) -> LaunchCommand {
    let mut args = settings.args.clone();
    if let Some(flag) = &settings.port_flag {
        let prefixed = format!("{}=", flag);
        if !args.iter().any(|a| a == flag || a.starts_with(&prefixed)) {
            args.push(flag.clone());
            args.push(settings.default_port.to_string());
        }
    }
    LaunchCommand {
        interpreter: workdir.join(".venv").join("bin").join("python"),
        module: settings.module.clone(),
        args,
        port: settings.default_port,
        working_dir: workdir.to_path_buf(),
    }
}

/// Build the launch command for an image rooted at `workdir`
pub fn launch_command(
    settings: &EntrySettings,
    workdir: &Path,
    config: &RuntimeConfig,
) -> LaunchCommand {
    match config.port() {
        // The server reads the port from the file itself
        Some(port) => LaunchCommand {
            args: settings.args.clone(),
            port,
            ..default_launch(settings, workdir)
        },
        None => default_launch(settings, workdir),
    }
}

/// Copy the runtime config into `rootfs` and assemble the launch command
pub fn configure(
    settings: &EntrySettings,
    workdir: &Path,
    runtime_config: &Path,
    rootfs: &Path,
) -> StrataResult<LaunchCommand> {
    let config = RuntimeConfig::load(runtime_config)?;
    let dest = in_root(rootfs, &settings.config_target);
    let mut writer = FileWriter::new();
    writer.write(&dest, &config.contents, false)?;
    debug!(
        "Runtime config {} -> {}",
        config.source.display(),
        settings.config_target.display()
    );
    Ok(launch_command(settings, workdir, &config))
}
