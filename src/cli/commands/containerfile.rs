//! Containerfile command - print the plan for external build engines

use crate::cli::args::ProjectArgs;
use crate::cli::commands::ProjectSetup;
use crate::config::Config;
use crate::entry::{self, RuntimeConfig};
use crate::error::StrataResult;
use crate::layer::render_containerfile;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Execute the containerfile command
pub async fn execute(args: ProjectArgs, config: &Config) -> StrataResult<()> {
    let setup = ProjectSetup::load(config, args.project.as_deref(), None).await?;

    // The port comes from the runtime config when it is already present
    let launch = match RuntimeConfig::load(&setup.inputs.runtime_config) {
        Ok(runtime) => entry::launch_command(&setup.settings.entry, &setup.settings.workdir, &runtime),
        Err(e) => {
            warn!("{}; using port {}", e, setup.settings.entry.default_port);
            entry::default_launch(&setup.settings.entry, &setup.settings.workdir)
        }
    };

    let rendered = render_containerfile(
        &setup.settings,
        &relative(&setup.inputs.manifest, &setup.dir),
        &relative(&setup.inputs.lockfile, &setup.dir),
        &relative(&setup.inputs.runtime_config, &setup.dir),
        &launch,
    );
    print!("{}", rendered);
    Ok(())
}

/// Path relative to the build context
fn relative(path: &Path, dir: &Path) -> PathBuf {
    path.strip_prefix(dir).unwrap_or(path).to_path_buf()
}
