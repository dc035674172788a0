//! Cache-scoped installer
//!
//! Materializes an [`InstallSet`] into a virtual environment. Artifacts
//! come from the [`CacheStore`] when present and are fetched, verified and
//! committed to it otherwise; the store itself never ends up inside the
//! environment.
//!
//! Two entry points mirror the two install passes of a build:
//!
//! - [`Installer::install_dependencies_only`] installs third-party packages
//!   and never the project, so it can run before the source tree exists.
//! - [`Installer::install_full`] re-validates the lockfile, re-syncs
//!   third-party packages (a no-op when they are already in place) and
//!   installs the project itself.

pub mod editable;
pub mod venv;
pub mod wheel;
pub mod writer;

pub use editable::ProjectMetadata;
pub use venv::Venv;
pub use writer::FileWriter;

use crate::cache::{CacheStore, PackageFetcher};
use crate::error::{StrataError, StrataResult};
use crate::resolve::{
    resolve_lock, Artifact, InstallSet, LockedPackage, Lockfile, Manifest, Target,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};

/// What an install pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    /// Pins that were (re)installed
    pub installed: Vec<String>,
    /// Pins already present and left alone
    pub unchanged: Vec<String>,
    /// Artifacts fetched because the store did not have them
    pub fetched: usize,
    /// Files created or modified in the environment
    pub files_written: usize,
}

impl InstallReport {
    /// Whether the pass changed nothing on disk
    pub fn is_noop(&self) -> bool {
        self.files_written == 0
    }
}

/// Installs locked packages into one environment
pub struct Installer<'a> {
    store: &'a CacheStore,
    fetcher: &'a dyn PackageFetcher,
    venv: Venv,
    source_root: PathBuf,
    groups: Vec<String>,
    target: Option<Target>,
}

impl<'a> Installer<'a> {
    pub fn new(store: &'a CacheStore, fetcher: &'a dyn PackageFetcher, venv: Venv) -> Self {
        Self {
            store,
            fetcher,
            venv,
            source_root: PathBuf::from("/app"),
            groups: Vec::new(),
            target: None,
        }
    }

    /// Project source root as seen from inside the image
    pub fn with_source_root(mut self, source_root: impl Into<PathBuf>) -> Self {
        self.source_root = source_root.into();
        self
    }

    /// Dependency groups to install alongside runtime dependencies
    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    /// Interpreter and platform to resolve for; defaults to the venv's
    /// Python on the default platform
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn venv(&self) -> &Venv {
        &self.venv
    }

    /// Install every third-party package of `set`, never the project
    pub async fn install_dependencies_only(&self, set: &InstallSet) -> StrataResult<InstallReport> {
        let mut writer = FileWriter::new();
        let mut report = InstallReport::default();

        self.venv.ensure(&mut writer)?;
        let packages: Vec<&LockedPackage> = set
            .packages
            .iter()
            .filter(|p| p.name != set.project.name)
            .collect();
        self.sync_packages(&packages, &mut writer, &mut report).await?;

        report.files_written = writer.written();
        info!(
            "Dependencies: {} installed, {} unchanged, {} fetched",
            report.installed.len(),
            report.unchanged.len(),
            report.fetched
        );
        Ok(report)
    }

    /// Re-validate, re-sync dependencies and install the project
    pub async fn install_full(
        &self,
        manifest: &Manifest,
        lockfile: &Lockfile,
    ) -> StrataResult<InstallReport> {
        let target = match &self.target {
            Some(target) => target.clone(),
            None => Target::for_python(self.venv.python_version())?,
        };
        let set = resolve_lock(manifest, lockfile, &self.groups, &target)?;

        let mut writer = FileWriter::new();
        let mut report = InstallReport::default();

        self.venv.ensure(&mut writer)?;
        let packages: Vec<&LockedPackage> = set
            .packages
            .iter()
            .filter(|p| p.name != set.project.name)
            .collect();
        self.sync_packages(&packages, &mut writer, &mut report).await?;

        if set.installs_project() {
            let before = writer.written();
            let project = ProjectMetadata::from_manifest(manifest, set.project.version.as_deref());
            editable::install_editable(&project, &self.source_root, &self.venv, &mut writer)?;
            let pin = format!("{}=={}", project.name, project.version);
            if writer.written() > before {
                report.installed.push(pin);
            } else {
                report.unchanged.push(pin);
            }
        } else {
            debug!("Project {} is virtual, not installing it", set.project.name);
        }

        report.files_written = writer.written();
        info!(
            "Full sync: {} installed, {} unchanged, {} file(s) written",
            report.installed.len(),
            report.unchanged.len(),
            report.files_written
        );
        Ok(report)
    }

    async fn sync_packages(
        &self,
        packages: &[&LockedPackage],
        writer: &mut FileWriter,
        report: &mut InstallReport,
    ) -> StrataResult<()> {
        let installed = self.venv.installed()?;

        for pkg in packages {
            let wheel = pkg.wheel.as_ref().ok_or_else(|| {
                StrataError::install(pkg.pin(), "no wheel selected for the build target")
            })?;

            if let Some(existing) = installed.get(&pkg.name) {
                if Some(existing.version.as_str()) == pkg.version.as_deref()
                    && existing.dist_info.join("INSTALLER").is_file()
                {
                    debug!("{} already installed", pkg.pin());
                    report.unchanged.push(pkg.pin());
                    continue;
                }
                debug!(
                    "Replacing {} {} with {}",
                    pkg.name,
                    existing.version,
                    pkg.pin()
                );
                let removed = wheel::remove_installed(&existing.dist_info, &self.venv)?;
                debug!("Removed {} file(s) of {} {}", removed, pkg.name, existing.version);
            }

            let bytes = self.artifact_bytes(pkg, wheel, report).await?;
            let unpacked = wheel::unpack_wheel(pkg, &bytes, &self.venv, writer)?;
            debug!("Installed {} ({} entries)", pkg.pin(), unpacked.entries);
            report.installed.push(pkg.pin());
        }
        Ok(())
    }

    /// Artifact bytes from the store, fetching and committing on a miss
    async fn artifact_bytes(
        &self,
        pkg: &LockedPackage,
        wheel: &Artifact,
        report: &mut InstallReport,
    ) -> StrataResult<Vec<u8>> {
        let _lock = self.store.lock_package(pkg)?;

        if let Some(bytes) = self.store.read_artifact(pkg, wheel)? {
            debug!("Cache hit for {}", pkg.pin());
            return Ok(bytes);
        }

        debug!("Cache miss for {}, fetching via {}", pkg.pin(), self.fetcher.name());
        let bytes = self.fetcher.fetch(pkg, wheel).await?;
        self.store.put_artifact(pkg, wheel, &bytes)?;
        report.fetched += 1;
        Ok(bytes)
    }
}
