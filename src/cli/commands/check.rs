//! Check command - frozen lockfile validation without building

use crate::cli::args::ProjectArgs;
use crate::cli::commands::ProjectSetup;
use crate::config::Config;
use crate::error::{StrataError, StrataResult};
use crate::resolve::{python_version_for, resolve_lock, Lockfile, Manifest, Target};
use crate::ui::{self, TaskSpinner, UiContext};

/// Execute the check command
pub async fn execute(args: ProjectArgs, config: &Config) -> StrataResult<()> {
    let ctx = UiContext::detect();
    let setup = ProjectSetup::load(config, args.project.as_deref(), None).await?;

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start("Checking lockfile against manifest...");

    let manifest = Manifest::from_file(&setup.inputs.manifest).await?;
    let lockfile = Lockfile::from_file(&setup.inputs.lockfile).await?;
    let python = setup
        .settings
        .python_version
        .clone()
        .unwrap_or_else(|| python_version_for(manifest.requires_python.as_deref()));
    let target = Target::new(&python, &setup.settings.platform)?;
    let set = match resolve_lock(&manifest, &lockfile, &setup.settings.groups, &target) {
        Ok(set) => set,
        Err(e) => {
            spinner.stop_error("Lockfile does not match manifest");
            return Err(e);
        }
    };
    spinner.stop(&format!(
        "Lockfile matches manifest ({} package(s) for {})",
        set.packages.len(),
        target
    ));

    for pin in set.pins() {
        ui::step_info(&ctx, &pin);
    }
    if set.installs_project() {
        ui::step_info(&ctx, &format!("{} (project, editable)", set.project.pin()));
    }

    if setup.inputs.runtime_config.is_file() {
        ui::step_ok(
            &ctx,
            &format!("Runtime config {}", config.paths.runtime_config.display()),
        );
        Ok(())
    } else {
        ui::step_error(
            &ctx,
            &format!("Runtime config {} is missing", config.paths.runtime_config.display()),
        );
        Err(StrataError::ConfigNotFound(setup.inputs.runtime_config))
    }
}
