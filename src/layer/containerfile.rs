//! Containerfile rendering
//!
//! Renders the canonical plan for external build engines. Instruction
//! order mirrors the native steps, so the engine's own layer cache is
//! reused the same way: the dependency-only sync sees just the manifest
//! and lockfile through bind mounts, and the package cache is a cache
//! mount that never lands in a layer.

use crate::entry::LaunchCommand;
use crate::layer::sequencer::BuildSettings;
use std::path::Path;

/// Image the `uv` binary is copied from
pub const UV_IMAGE: &str = "ghcr.io/astral-sh/uv:latest";

/// Cache mount target used by every sync
const UV_CACHE: &str = "/root/.cache/uv";

/// Render a Containerfile for `settings`.
///
/// `manifest`, `lockfile` and `runtime_config` are paths relative to the
/// build context (the project directory).
pub fn render_containerfile(
    settings: &BuildSettings,
    manifest: &Path,
    lockfile: &Path,
    runtime_config: &Path,
    launch: &LaunchCommand,
) -> String {
    let workdir = settings.workdir.display().to_string();
    let venv = settings.workdir.join(".venv");
    let cache_mount = format!("--mount=type=cache,target={}", UV_CACHE);
    let groups = group_flags(&settings.groups);

    let mut lines = Vec::new();
    lines.push(format!("FROM {}", settings.base_image));
    lines.push(String::new());
    lines.push(format!("COPY --from={} /uv /uvx /bin/", UV_IMAGE));
    lines.push(format!("WORKDIR {}", workdir));
    lines.push(format!(
        "ENV UV_LINK_MODE=copy UV_PROJECT_ENVIRONMENT={}",
        containerfile_quote(&venv.display().to_string())
    ));
    if let Some(python) = &settings.python_version {
        lines.push(format!("ENV UV_PYTHON={}", containerfile_quote(python)));
    }
    lines.push(String::new());

    lines.push("# install-dependencies: manifest and lockfile only".to_string());
    lines.push(format!("RUN {} \\", cache_mount));
    lines.push(format!(
        "    --mount=type=bind,source={},target=pyproject.toml \\",
        manifest.display()
    ));
    lines.push(format!(
        "    --mount=type=bind,source={},target=uv.lock \\",
        lockfile.display()
    ));
    lines.push(format!("    uv sync --frozen --no-install-project{}", groups));
    lines.push(String::new());

    lines.push("# copy-source".to_string());
    lines.push(format!("COPY . {}", workdir));
    lines.push(String::new());

    lines.push("# install-full".to_string());
    lines.push(format!("RUN {} \\", cache_mount));
    lines.push(format!("    uv sync --frozen{}", groups));
    lines.push(String::new());

    lines.push("# write-runtime-config".to_string());
    lines.push(format!(
        "COPY {} {}",
        runtime_config.display(),
        settings.entry.config_target.display()
    ));
    lines.push(String::new());

    lines.push(format!(
        "ENV PATH={}",
        containerfile_quote(&format!("{}:${{PATH}}", venv.join("bin").display()))
    ));
    lines.push(format!("EXPOSE {}", launch.port));
    lines.push(format!("CMD {}", exec_form(&launch.argv())));
    lines.push(String::new());

    lines.join("\n")
}

fn group_flags(groups: &[String]) -> String {
    let mut flags = String::from(" --no-default-groups");
    for group in groups {
        flags.push_str(" --group ");
        flags.push_str(group);
    }
    flags
}

/// JSON array form for CMD, so no shell is involved
fn exec_form(argv: &[String]) -> String {
    serde_json::to_string(argv).unwrap_or_else(|_| "[]".to_string())
}

/// Quote a value for an ENV instruction.
/// Values with `$`, spaces, quotes or backslashes are double-quoted with
/// embedded quotes and backslashes escaped.
fn containerfile_quote(value: &str) -> String {
    if value.contains('$') || value.contains(' ') || value.contains('"') || value.contains('\\') {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{}\"", escaped)
    } else {
        value.to_string()
    }
}
