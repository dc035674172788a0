//! Layer sequencer
//!
//! Runs a validated [`Plan`] against a staging root filesystem. Every
//! layer-producing step gets a cache key from its parent key, its command
//! and the digests of its declared inputs. On a hit the committed layer is
//! replayed instead of running the step; on a miss the step runs and its
//! changes are committed. Steps run strictly in order, and any error ends
//! the build before an image is written.

use crate::cache::{CacheState, CacheStore, PackageFetcher};
use crate::entry::{self, EntrySettings, LaunchCommand, RuntimeConfig};
use crate::error::{StrataError, StrataResult};
use crate::image::{self, ImageConfig, ImageManifest};
use crate::install::{InstallReport, Installer, Venv};
use crate::layer::cache::{cache_key, LayerCache, LayerRecord};
use crate::layer::digest::{self, in_root};
use crate::layer::step::{BuildInputs, BuildStep, InputKind, Plan, StepInputs};
use crate::resolve::target::DEFAULT_PLATFORM;
use crate::resolve::{python_version_for, resolve_lock, InstallSet, Lockfile, Manifest, Target};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Paths never copied from the source tree
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".venv",
    ".strata",
    "__pycache__",
    "*.pyc",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
];

/// Everything that shapes the image besides the input files
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub tag: String,
    /// Base image reference recorded in the image
    pub base_image: String,
    /// Application directory inside the image
    pub workdir: PathBuf,
    /// `X.Y` override; derived from `requires-python` when unset
    pub python_version: Option<String>,
    /// Dependency groups installed with the runtime dependencies
    pub groups: Vec<String>,
    /// Wheel platform of the base image, e.g. `manylinux_2_36_x86_64`
    pub platform: String,
    pub entry: EntrySettings,
    pub source_excludes: Vec<String>,
    /// Ignore committed layers (new layers are still committed)
    pub no_cache: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            tag: "app:latest".to_string(),
            base_image: "python:3.12-slim".to_string(),
            workdir: PathBuf::from("/app"),
            python_version: None,
            groups: Vec::new(),
            platform: DEFAULT_PLATFORM.to_string(),
            entry: EntrySettings::default(),
            source_excludes: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            no_cache: false,
        }
    }
}

/// Lifecycle of a step as reported to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Running,
    Complete { cache_hit: bool },
    Failed,
}

/// Receives step transitions (progress display, audit)
pub trait StepObserver: Send + Sync {
    fn step_changed(&self, step: BuildStep, status: &StepStatus);
}

/// Observer that ignores everything
pub struct NoopObserver;

impl StepObserver for NoopObserver {
    fn step_changed(&self, _step: BuildStep, _status: &StepStatus) {}
}

/// Result of one executed step
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step: BuildStep,
    pub cache_key: Option<String>,
    pub cache_hit: bool,
    /// Layer content digest, for layer-producing steps
    pub digest: Option<String>,
    pub files: usize,
    pub duration_ms: u64,
}

/// Result of a successful build
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub tag: String,
    pub image_dir: PathBuf,
    pub image_digest: String,
    pub steps: Vec<StepOutcome>,
    pub launch: LaunchCommand,
    /// Pins of the installed third-party packages
    pub packages: Vec<String>,
    /// Artifacts fetched into the store during this build
    pub fetched: usize,
}

impl BuildReport {
    pub fn outcome(&self, step: BuildStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|o| o.step == step)
    }

    pub fn cache_hits(&self) -> usize {
        self.steps.iter().filter(|o| o.cache_hit).count()
    }
}

/// One row of a dry-run plan
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    pub step: BuildStep,
    pub inputs: Vec<InputKind>,
    pub cache_key: Option<String>,
    /// `None` for steps that produce no layer or whose key is unknown
    pub state: Option<CacheState>,
    pub note: Option<String>,
}

/// State carried between steps of one run
#[derive(Default)]
struct RunState {
    set: Option<InstallSet>,
    python: Option<String>,
    target: Option<Target>,
    launch: Option<LaunchCommand>,
    fetched: usize,
}

/// Removes the staging root on every exit path
struct StagingRoot(PathBuf);

impl StagingRoot {
    fn create(store: &CacheStore) -> StrataResult<Self> {
        let path = store.tmp_path("rootfs");
        fs::create_dir_all(&path)
            .map_err(|e| StrataError::io(format!("creating {}", path.display()), e))?;
        Ok(Self(path))
    }
}

impl Drop for StagingRoot {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

/// A configured build of one image
pub struct Pipeline<'a> {
    store: &'a CacheStore,
    fetcher: &'a dyn PackageFetcher,
    settings: BuildSettings,
    inputs: BuildInputs,
    plan: Plan,
    observer: &'a dyn StepObserver,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        store: &'a CacheStore,
        fetcher: &'a dyn PackageFetcher,
        settings: BuildSettings,
        inputs: BuildInputs,
    ) -> Self {
        Self {
            store,
            fetcher,
            settings,
            inputs,
            plan: Plan::canonical(),
            observer: &NoopObserver,
        }
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn StepObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Run the build and write the image under `output_dir`
    pub async fn run(&self, output_dir: &Path) -> StrataResult<BuildReport> {
        let _image_lock = self.store.lock_image(&self.settings.tag)?;
        let _store_lock = self.store.lock_shared()?;
        info!("Building {} from {}", self.settings.tag, self.inputs.source_dir.display());

        let staging = StagingRoot::create(self.store)?;
        let rootfs = staging.0.as_path();
        let layers = LayerCache::new(self.store);

        let mut state = RunState::default();
        let mut parent = self.root_key();
        let mut outcomes = Vec::new();
        let mut records: Vec<LayerRecord> = Vec::new();

        for &step in self.plan.steps() {
            self.observer.step_changed(step, &StepStatus::Running);
            let started = Instant::now();

            let result = self
                .run_step(step, &mut state, &mut parent, rootfs, &layers)
                .await;
            let (key, record, cache_hit) = match result {
                Ok(done) => done,
                Err(e) => {
                    self.observer.step_changed(step, &StepStatus::Failed);
                    return Err(e);
                }
            };

            self.observer
                .step_changed(step, &StepStatus::Complete { cache_hit });
            outcomes.push(StepOutcome {
                step,
                cache_key: key,
                cache_hit,
                digest: record.as_ref().map(|r| r.digest.clone()),
                files: record.as_ref().map(LayerRecord::files).unwrap_or(0),
                duration_ms: started.elapsed().as_millis() as u64,
            });
            records.extend(record);
        }

        let launch = state.launch.clone().ok_or_else(|| {
            StrataError::PlanOrdering("plan has no write-runtime-config step".to_string())
        })?;
        let config = ImageConfig::from_launch(&launch, &self.settings.entry.config_target);
        let manifest =
            ImageManifest::new(&self.settings.tag, &self.settings.base_image, &records, config);
        let image_dir = image::write_image(output_dir, &manifest, &layers, &records)?;

        info!(
            "Built {} ({} layer(s), {} cached)",
            self.settings.tag,
            records.len(),
            outcomes.iter().filter(|o| o.cache_hit).count()
        );

        Ok(BuildReport {
            tag: self.settings.tag.clone(),
            image_dir,
            image_digest: manifest.digest()?,
            steps: outcomes,
            launch,
            packages: state.set.map(|s| s.pins()).unwrap_or_default(),
            fetched: state.fetched,
        })
    }

    /// Compute keys and cache states without executing anything
    pub async fn plan(&self) -> StrataResult<Vec<PlannedStep>> {
        let python = match &self.settings.python_version {
            Some(v) => Some(v.clone()),
            None => Manifest::from_file(&self.inputs.manifest)
                .await
                .ok()
                .map(|m| python_version_for(m.requires_python.as_deref())),
        };

        let mut parent = Some(self.root_key());
        let mut rows = Vec::new();
        for &step in self.plan.steps() {
            let mut row = PlannedStep {
                step,
                inputs: step.declared_inputs().to_vec(),
                cache_key: None,
                state: None,
                note: None,
            };
            if !step.produces_layer() {
                rows.push(row);
                continue;
            }

            let key = match (&parent, &python) {
                (Some(parent_key), Some(python)) => {
                    match self.input_digests(step) {
                        Ok(digests) => Some(cache_key(
                            parent_key,
                            &self.step_command(step, python),
                            &digests,
                        )),
                        Err(e) => {
                            row.note = Some(e.to_string());
                            None
                        }
                    }
                }
                (_, None) => {
                    row.note = Some("manifest could not be read".to_string());
                    None
                }
                (None, _) => {
                    row.note = Some("depends on an earlier step".to_string());
                    None
                }
            };

            row.state = key.as_deref().map(|k| self.store.layer_state(k));
            row.cache_key = key.clone();
            parent = key;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Key every chain starts from: base image and workdir
    fn root_key(&self) -> String {
        cache_key(
            "",
            &format!(
                "base={} workdir={}",
                self.settings.base_image,
                self.settings.workdir.display()
            ),
            &[],
        )
    }

    /// Command string of a step; settings that change its output belong here
    fn step_command(&self, step: BuildStep, python: &str) -> String {
        let venv = self.settings.workdir.join(".venv");
        let groups = self.settings.groups.join(",");
        let platform = &self.settings.platform;
        match step {
            BuildStep::ResolveLock => format!(
                "resolve-lock --frozen python={} platform={} groups={}",
                python, platform, groups
            ),
            BuildStep::InstallDependencies => format!(
                "install-dependencies --frozen --no-install-project python={} platform={} venv={} groups={}",
                python,
                platform,
                venv.display(),
                groups
            ),
            BuildStep::CopySource => format!(
                "copy-source dest={} exclude={}",
                self.settings.workdir.display(),
                self.settings.source_excludes.join(",")
            ),
            BuildStep::InstallFull => format!(
                "install-full --frozen python={} platform={} venv={} source={} groups={}",
                python,
                platform,
                venv.display(),
                self.settings.workdir.display(),
                groups
            ),
            BuildStep::WriteRuntimeConfig => format!(
                "write-runtime-config dest={}",
                self.settings.entry.config_target.display()
            ),
        }
    }

    /// Digests of the step's declared inputs, in declaration order
    fn input_digests(&self, step: BuildStep) -> StrataResult<Vec<(InputKind, String)>> {
        let inputs = StepInputs::new(step, &self.inputs);
        step.declared_inputs()
            .iter()
            .map(|&kind| {
                let path = inputs.path(kind)?;
                let digest = match kind {
                    InputKind::SourceTree => {
                        digest::tree_digest(path, &self.settings.source_excludes)?
                    }
                    InputKind::RuntimeConfig if !path.is_file() => {
                        return Err(StrataError::ConfigNotFound(path.to_path_buf()))
                    }
                    _ => digest::file_digest(path)?,
                };
                Ok((kind, digest))
            })
            .collect()
    }

    async fn run_step(
        &self,
        step: BuildStep,
        state: &mut RunState,
        parent: &mut String,
        rootfs: &Path,
        layers: &LayerCache<'_>,
    ) -> StrataResult<(Option<String>, Option<LayerRecord>, bool)> {
        let inputs = StepInputs::new(step, &self.inputs);

        if !step.produces_layer() {
            self.execute(inputs, state, rootfs).await?;
            return Ok((None, None, false));
        }

        let python = state.python.clone().ok_or_else(|| {
            StrataError::PlanOrdering(format!("{} must run after resolve-lock", step))
        })?;
        let key = cache_key(parent, &self.step_command(step, &python), &self.input_digests(step)?);
        *parent = key.clone();

        if !self.settings.no_cache {
            if let Some(record) = layers.lookup(&key)? {
                debug!("{}: cache hit {}", step, &key[..12]);
                layers.apply(&record, rootfs)?;
                if step == BuildStep::WriteRuntimeConfig {
                    // The layer holds the file; the launch command is rebuilt from it
                    let config = RuntimeConfig::load(inputs.path(InputKind::RuntimeConfig)?)?;
                    state.launch = Some(entry::launch_command(
                        &self.settings.entry,
                        &self.settings.workdir,
                        &config,
                    ));
                }
                return Ok((Some(key), Some(record), true));
            }
        }

        debug!("{}: cache miss {}", step, &key[..12]);
        let before = digest::snapshot(rootfs, &[])?;
        self.execute(inputs, state, rootfs).await?;
        let after = digest::snapshot(rootfs, &[])?;
        let changes = digest::diff(&before, &after);
        let record = layers.commit(&key, step, rootfs, &changes)?;

        Ok((Some(key), Some(record), false))
    }

    async fn execute(
        &self,
        inputs: StepInputs<'_>,
        state: &mut RunState,
        rootfs: &Path,
    ) -> StrataResult<()> {
        let step = inputs.step();
        match step {
            BuildStep::ResolveLock => {
                let manifest = Manifest::from_file(inputs.path(InputKind::Manifest)?).await?;
                let lockfile = Lockfile::from_file(inputs.path(InputKind::Lockfile)?).await?;
                let python = self
                    .settings
                    .python_version
                    .clone()
                    .unwrap_or_else(|| python_version_for(manifest.requires_python.as_deref()));
                let target = Target::new(&python, &self.settings.platform)?;
                let set = resolve_lock(&manifest, &lockfile, &self.settings.groups, &target)?;
                info!(
                    "Lockfile matches manifest: {} package(s) for {}",
                    set.packages.len(),
                    target
                );
                state.python = Some(python);
                state.target = Some(target);
                state.set = Some(set);
            }
            BuildStep::InstallDependencies => {
                let set = state.set.as_ref().ok_or_else(|| {
                    StrataError::PlanOrdering(format!("{} must run after resolve-lock", step))
                })?;
                // Keep the declared-input contract: both files must be readable here
                inputs.path(InputKind::Manifest)?;
                inputs.path(InputKind::Lockfile)?;
                let report = self.installer(state, rootfs)?.install_dependencies_only(set).await?;
                self.record_install(state, &report);
            }
            BuildStep::CopySource => {
                let source = inputs.path(InputKind::SourceTree)?;
                let dest = in_root(rootfs, &self.settings.workdir);
                let entries = digest::snapshot(source, &self.settings.source_excludes)?;
                digest::copy_entries(source, &dest, &entries)?;
                debug!("Copied {} source entries", entries.len());
            }
            BuildStep::InstallFull => {
                let manifest = Manifest::from_file(inputs.path(InputKind::Manifest)?).await?;
                let lockfile = Lockfile::from_file(inputs.path(InputKind::Lockfile)?).await?;
                let report = self
                    .installer(state, rootfs)?
                    .install_full(&manifest, &lockfile)
                    .await?;
                self.record_install(state, &report);
            }
            BuildStep::WriteRuntimeConfig => {
                let launch = entry::configure(
                    &self.settings.entry,
                    &self.settings.workdir,
                    inputs.path(InputKind::RuntimeConfig)?,
                    rootfs,
                )?;
                state.launch = Some(launch);
            }
        }
        Ok(())
    }

    fn installer(&self, state: &RunState, rootfs: &Path) -> StrataResult<Installer<'a>> {
        let target = state.target.clone().ok_or_else(|| {
            StrataError::Internal("build target unknown before resolve-lock".to_string())
        })?;
        let venv_path = self.settings.workdir.join(".venv");
        let venv = Venv::new(in_root(rootfs, &venv_path), target.python_version())
            .with_image_path(venv_path);
        Ok(Installer::new(self.store, self.fetcher, venv)
            .with_source_root(self.settings.workdir.clone())
            .with_groups(self.settings.groups.clone())
            .with_target(target))
    }

    fn record_install(&self, state: &mut RunState, report: &InstallReport) {
        state.fetched += report.fetched;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{sha256_hex, ArtifactFetcher};
    use std::io::{Cursor, Write};
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn wheel(name: &str, version: &str) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file(format!("{name}/__init__.py"), FileOptions::default())
            .unwrap();
        zip.write_all(b"").unwrap();
        zip.start_file(
            format!("{name}-{version}.dist-info/METADATA"),
            FileOptions::default(),
        )
        .unwrap();
        zip.write_all(format!("Name: {name}\nVersion: {version}\n").as_bytes())
            .unwrap();
        zip.finish().unwrap().into_inner()
    }

    /// Project with one locked dependency served from `wheels/`
    fn project(dir: &Path) -> BuildInputs {
        let bytes = wheel("requests", "2.31.0");
        fs::create_dir_all(dir.join("wheels")).unwrap();
        fs::write(dir.join("wheels/requests-2.31.0-py3-none-any.whl"), &bytes).unwrap();
        fs::write(
            dir.join("pyproject.toml"),
            "[project]\nname = \"tools\"\nversion = \"0.1.0\"\nrequires-python = \">=3.12\"\ndependencies = [\"requests>=2.0\"]\n",
        )
        .unwrap();
        fs::write(
            dir.join("uv.lock"),
            format!(
                r#"version = 1
requires-python = ">=3.12"

[[package]]
name = "requests"
version = "2.31.0"
source = {{ registry = "https://pypi.org/simple" }}
wheels = [{{ path = "wheels/requests-2.31.0-py3-none-any.whl", hash = "sha256:{}" }}]

[[package]]
name = "tools"
version = "0.1.0"
source = {{ editable = "." }}
dependencies = [{{ name = "requests" }}]
"#,
                sha256_hex(&bytes)
            ),
        )
        .unwrap();
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::write(dir.join("src/app.py"), "import streamlit as st\n").unwrap();
        fs::create_dir_all(dir.join(".streamlit")).unwrap();
        fs::write(dir.join(".streamlit/config.toml"), "[server]\nheadless = true\n").unwrap();

        BuildInputs {
            manifest: dir.join("pyproject.toml"),
            lockfile: dir.join("uv.lock"),
            source_dir: dir.to_path_buf(),
            runtime_config: dir.join(".streamlit/config.toml"),
        }
    }

    fn setup() -> (TempDir, CacheStore, BuildInputs) {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::open(dir.path().join("store")).unwrap();
        let project_dir = dir.path().join("project");
        let inputs = project(&project_dir);
        (dir, store, inputs)
    }

    #[tokio::test]
    async fn build_then_rebuild_hits_every_layer() {
        let (dir, store, inputs) = setup();
        let fetcher = ArtifactFetcher::new(&inputs.source_dir);
        let out = dir.path().join("images");
        let pipeline = Pipeline::new(&store, &fetcher, BuildSettings::default(), inputs);

        let first = pipeline.run(&out).await.unwrap();
        assert_eq!(first.cache_hits(), 0);
        assert_eq!(first.fetched, 1);
        assert_eq!(first.packages, vec!["requests==2.31.0"]);
        assert_eq!(first.launch.port, 8501);
        assert!(first.image_dir.join("image.json").is_file());

        let second = pipeline.run(&out).await.unwrap();
        assert_eq!(second.cache_hits(), 4);
        assert_eq!(second.fetched, 0);
        assert_eq!(second.image_digest, first.image_digest);
    }

    #[tokio::test]
    async fn plan_reports_states_without_building() {
        let (_dir, store, inputs) = setup();
        let fetcher = ArtifactFetcher::new(&inputs.source_dir);
        let pipeline = Pipeline::new(&store, &fetcher, BuildSettings::default(), inputs);

        let rows = pipeline.plan().await.unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows[0].cache_key.is_none());
        assert!(rows[1..]
            .iter()
            .all(|r| r.state == Some(CacheState::Miss) && r.cache_key.is_some()));
        assert!(store.entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn plan_notes_missing_runtime_config() {
        let (_dir, store, inputs) = setup();
        fs::remove_file(&inputs.runtime_config).unwrap();
        let fetcher = ArtifactFetcher::new(&inputs.source_dir);
        let pipeline = Pipeline::new(&store, &fetcher, BuildSettings::default(), inputs);

        let rows = pipeline.plan().await.unwrap();
        let last = rows.last().unwrap();
        assert!(last.cache_key.is_none());
        assert!(last.note.as_deref().unwrap().contains("config.toml"));
    }

    #[tokio::test]
    async fn python_override_changes_install_keys_only() {
        let (_dir, store, inputs) = setup();
        let fetcher = ArtifactFetcher::new(&inputs.source_dir);
        let default = Pipeline::new(&store, &fetcher, BuildSettings::default(), inputs.clone())
            .plan()
            .await
            .unwrap();
        let settings = BuildSettings {
            python_version: Some("3.13".to_string()),
            ..BuildSettings::default()
        };
        let pinned = Pipeline::new(&store, &fetcher, settings, inputs)
            .plan()
            .await
            .unwrap();

        assert_ne!(default[1].cache_key, pinned[1].cache_key);
    }

    #[tokio::test]
    async fn platform_changes_install_keys() {
        let (_dir, store, inputs) = setup();
        let fetcher = ArtifactFetcher::new(&inputs.source_dir);
        let default = Pipeline::new(&store, &fetcher, BuildSettings::default(), inputs.clone())
            .plan()
            .await
            .unwrap();
        let settings = BuildSettings {
            platform: "musllinux_1_2_x86_64".to_string(),
            ..BuildSettings::default()
        };
        let alpine = Pipeline::new(&store, &fetcher, settings, inputs)
            .plan()
            .await
            .unwrap();

        assert_ne!(default[1].cache_key, alpine[1].cache_key);
        assert_ne!(default[3].cache_key, alpine[3].cache_key);
    }

    #[tokio::test]
    async fn failed_step_reports_to_observer() {
        struct Recorder(std::sync::Mutex<Vec<(BuildStep, StepStatus)>>);
        impl StepObserver for Recorder {
            fn step_changed(&self, step: BuildStep, status: &StepStatus) {
                self.0.lock().unwrap().push((step, status.clone()));
            }
        }

        let (dir, store, inputs) = setup();
        fs::write(&inputs.manifest, "[project]\nname = \"tools\"\nversion = \"0.1.0\"\nrequires-python = \">=3.12\"\ndependencies = [\"requests==1.0.0\"]\n").unwrap();
        let fetcher = ArtifactFetcher::new(&inputs.source_dir);
        let recorder = Recorder(std::sync::Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(&store, &fetcher, BuildSettings::default(), inputs)
            .with_observer(&recorder);

        let err = pipeline.run(&dir.path().join("images")).await.unwrap_err();
        assert!(matches!(err, StrataError::LockMismatch { .. }));
        let events = recorder.0.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                (BuildStep::ResolveLock, StepStatus::Running),
                (BuildStep::ResolveLock, StepStatus::Failed),
            ]
        );
        assert!(!dir.path().join("images").exists());
    }
}
