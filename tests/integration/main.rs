//! Integration tests for strata

mod fixture {
    use std::fs;
    use std::io::{Cursor, Write};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    pub fn sha256_hex(bytes: &[u8]) -> String {
        strata::cache::sha256_hex(bytes)
    }

    pub fn wheel(name: &str, version: &str) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file(format!("{name}/__init__.py"), FileOptions::default())
            .unwrap();
        zip.write_all(format!("__version__ = \"{version}\"\n").as_bytes())
            .unwrap();
        zip.start_file(
            format!("{name}-{version}.dist-info/METADATA"),
            FileOptions::default(),
        )
        .unwrap();
        zip.write_all(format!("Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n").as_bytes())
            .unwrap();
        zip.start_file(
            format!("{name}-{version}.dist-info/WHEEL"),
            FileOptions::default(),
        )
        .unwrap();
        zip.write_all(b"Wheel-Version: 1.0\nRoot-Is-Purelib: true\nTag: py3-none-any\n")
            .unwrap();
        zip.finish().unwrap().into_inner()
    }

    /// A Streamlit-style tool index: requests (with idna) locked at 2.31.0
    pub struct Project {
        pub root: TempDir,
    }

    impl Project {
        pub fn new(requirement: &str) -> Self {
            let root = TempDir::new().unwrap();
            let dir = root.path().join("tools");
            fs::create_dir_all(dir.join("wheels")).unwrap();

            let mut entries = String::new();
            for (name, version, deps) in [
                ("idna", "3.7", ""),
                ("requests", "2.31.0", "{ name = \"idna\" }"),
            ] {
                let bytes = wheel(name, version);
                let file = format!("wheels/{name}-{version}-py3-none-any.whl");
                fs::write(dir.join(&file), &bytes).unwrap();
                entries.push_str(&format!(
                    r#"
[[package]]
name = "{name}"
version = "{version}"
source = {{ registry = "https://pypi.org/simple" }}
dependencies = [{deps}]
wheels = [{{ path = "{file}", hash = "sha256:{}" }}]
"#,
                    sha256_hex(&bytes)
                ));
            }

            fs::write(
                dir.join("uv.lock"),
                format!(
                    r#"version = 1
requires-python = ">=3.12"

[[package]]
name = "tools"
version = "0.1.0"
source = {{ editable = "." }}
dependencies = [{{ name = "requests" }}]
{entries}"#
                ),
            )
            .unwrap();

            let project = Self { root };
            project.set_requirement(requirement);
            project.write("src/app.py", "import streamlit as st\n\nst.title(\"Tools\")\n");
            project.write("src/pages/01_search.py", "import streamlit as st\n");
            project.write(".streamlit/config.toml", "[server]\nheadless = true\n");
            project
        }

        pub fn dir(&self) -> PathBuf {
            self.root.path().join("tools")
        }

        pub fn store(&self) -> PathBuf {
            self.root.path().join("store")
        }

        pub fn images(&self) -> PathBuf {
            self.root.path().join("images")
        }

        pub fn write(&self, rel: &str, body: &str) {
            let path = self.dir().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }

        pub fn set_requirement(&self, requirement: &str) {
            self.write(
                "pyproject.toml",
                &format!(
                    "[project]\nname = \"tools\"\nversion = \"0.1.0\"\nrequires-python = \">=3.12\"\ndependencies = [\"{requirement}\"]\n"
                ),
            );
        }

        /// Global config pointing the store into the fixture, audit off
        pub fn config_file(&self) -> PathBuf {
            let path = self.root.path().join("config.toml");
            fs::write(
                &path,
                format!(
                    "[general]\naudit_log = false\n\n[cache]\ndir = \"{}\"\n",
                    self.store().display()
                ),
            )
            .unwrap();
            path
        }
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }
}

mod pipeline_tests {
    use super::fixture::{exists, Project};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata::cache::{ArtifactFetcher, CacheStore, EntryKind, PackageFetcher};
    use strata::layer::{BuildInputs, BuildReport, BuildSettings, BuildStep, Pipeline};
    use strata::resolve::{Artifact, LockedPackage};
    use strata::{StrataError, StrataResult};

    /// Counts fetches that reach the underlying fetcher
    struct CountingFetcher {
        inner: ArtifactFetcher,
        calls: AtomicUsize,
    }

    impl CountingFetcher {
        fn new(project: &Project) -> Self {
            Self {
                inner: ArtifactFetcher::new(project.dir()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PackageFetcher for CountingFetcher {
        async fn fetch(&self, package: &LockedPackage, artifact: &Artifact) -> StrataResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(package, artifact).await
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn inputs(project: &Project) -> BuildInputs {
        let dir = project.dir();
        BuildInputs {
            manifest: dir.join("pyproject.toml"),
            lockfile: dir.join("uv.lock"),
            source_dir: dir.clone(),
            runtime_config: dir.join(".streamlit/config.toml"),
        }
    }

    fn settings() -> BuildSettings {
        BuildSettings {
            tag: "tools:latest".to_string(),
            ..BuildSettings::default()
        }
    }

    async fn build(
        project: &Project,
        store: &CacheStore,
        fetcher: &CountingFetcher,
    ) -> StrataResult<BuildReport> {
        Pipeline::new(store, fetcher, settings(), inputs(project))
            .run(&project.images())
            .await
    }

    #[tokio::test]
    async fn dependency_layer_is_deterministic_across_stores() {
        let project = Project::new("requests>=2.0");
        let fetcher = CountingFetcher::new(&project);

        let a = CacheStore::open(project.root.path().join("store-a")).unwrap();
        let b = CacheStore::open(project.root.path().join("store-b")).unwrap();
        let first = build(&project, &a, &fetcher).await.unwrap();
        let second = build(&project, &b, &fetcher).await.unwrap();

        let deps_a = first.outcome(BuildStep::InstallDependencies).unwrap();
        let deps_b = second.outcome(BuildStep::InstallDependencies).unwrap();
        assert!(!deps_b.cache_hit);
        assert_eq!(deps_a.cache_key, deps_b.cache_key);
        assert_eq!(deps_a.digest, deps_b.digest);
        assert_eq!(first.image_digest, second.image_digest);
    }

    #[tokio::test]
    async fn source_edit_reuses_dependency_layer() {
        let project = Project::new("requests>=2.0");
        let store = CacheStore::open(project.store()).unwrap();
        let fetcher = CountingFetcher::new(&project);

        let first = build(&project, &store, &fetcher).await.unwrap();
        project.write("src/app.py", "import streamlit as st\n\nst.title(\"Tool index\")\n");
        let second = build(&project, &store, &fetcher).await.unwrap();

        let deps = second.outcome(BuildStep::InstallDependencies).unwrap();
        assert!(deps.cache_hit);
        assert_eq!(
            deps.cache_key,
            first.outcome(BuildStep::InstallDependencies).unwrap().cache_key
        );
        assert!(!second.outcome(BuildStep::CopySource).unwrap().cache_hit);
        assert!(!second.outcome(BuildStep::InstallFull).unwrap().cache_hit);
        assert_ne!(first.image_digest, second.image_digest);

        // Both wheels were fetched exactly once, by the first build
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(second.fetched, 0);
    }

    #[tokio::test]
    async fn locked_versions_satisfying_manifest_build() {
        let project = Project::new("requests>=2.0");
        let store = CacheStore::open(project.store()).unwrap();
        let fetcher = CountingFetcher::new(&project);

        let report = build(&project, &store, &fetcher).await.unwrap();
        assert_eq!(report.packages, vec!["idna==3.7", "requests==2.31.0"]);
        assert_eq!(report.launch.port, 8501);
        assert_eq!(
            report.launch.argv(),
            vec![
                "/app/.venv/bin/python",
                "-m",
                "streamlit",
                "run",
                "src/app.py",
                "--server.port",
                "8501"
            ]
        );

        let image = strata::image::ImageManifest::read(&report.image_dir).unwrap();
        assert_eq!(image.config.exposed_ports, vec![8501]);
        assert_eq!(image.layers.len(), 4);
        assert_eq!(image.layers[0].step, BuildStep::InstallDependencies);
    }

    #[tokio::test]
    async fn exact_pin_matching_lock_builds() {
        let project = Project::new("requests==2.31.0");
        let store = CacheStore::open(project.store()).unwrap();
        let fetcher = CountingFetcher::new(&project);

        let report = build(&project, &store, &fetcher).await.unwrap();
        assert!(report.packages.contains(&"requests==2.31.0".to_string()));
    }

    #[tokio::test]
    async fn drift_fails_before_any_fetch() {
        let project = Project::new("requests==1.0.0");
        let store = CacheStore::open(project.store()).unwrap();
        let fetcher = CountingFetcher::new(&project);

        let err = build(&project, &store, &fetcher).await.unwrap_err();
        assert!(matches!(err, StrataError::LockMismatch { .. }));
        assert!(!err.is_retryable());
        assert_eq!(fetcher.calls(), 0);
        assert!(store.entries().unwrap().is_empty());
        assert!(!exists(&project.images()));
    }

    #[tokio::test]
    async fn missing_runtime_config_fails_after_dependencies() {
        let project = Project::new("requests>=2.0");
        std::fs::remove_file(project.dir().join(".streamlit/config.toml")).unwrap();
        let store = CacheStore::open(project.store()).unwrap();
        let fetcher = CountingFetcher::new(&project);

        let err = build(&project, &store, &fetcher).await.unwrap_err();
        assert!(matches!(err, StrataError::ConfigNotFound(_)));

        // Dependencies were installed and their layers committed first
        assert_eq!(fetcher.calls(), 2);
        let layers = store
            .entries()
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EntryKind::Layer)
            .count();
        assert_eq!(layers, 3);
        assert!(!exists(&project.images().join("tools_latest")));
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_previous_image() {
        let project = Project::new("requests>=2.0");
        let store = CacheStore::open(project.store()).unwrap();
        let fetcher = CountingFetcher::new(&project);

        let good = build(&project, &store, &fetcher).await.unwrap();
        project.set_requirement("requests==1.0.0");
        build(&project, &store, &fetcher).await.unwrap_err();

        let image = strata::image::ImageManifest::read(&good.image_dir).unwrap();
        assert_eq!(image.digest().unwrap(), good.image_digest);
    }
}

mod cli_tests {
    use super::fixture::Project;
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;

    fn strata(project: &Project) -> Command {
        let mut cmd = cargo_bin_cmd!("strata");
        cmd.env("STRATA_CONFIG", project.config_file())
            .env("XDG_STATE_HOME", project.root.path().join("state"))
            .env("CI", "1");
        cmd
    }

    #[test]
    fn help_displays() {
        let project = Project::new("requests>=2.0");
        strata(&project)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("reproducible layered images"));
    }

    #[test]
    fn version_displays() {
        let project = Project::new("requests>=2.0");
        strata(&project)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("strata"));
    }

    #[test]
    fn config_path_follows_env() {
        let project = Project::new("requests>=2.0");
        strata(&project)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_merges_project_file() {
        let project = Project::new("requests>=2.0");
        project.write("strata.toml", "[entry]\nport = 8600\n");
        strata(&project)
            .args(["config", "show"])
            .current_dir(project.dir())
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("port = 8600"));
    }

    #[test]
    fn check_passes() {
        let project = Project::new("requests>=2.0");
        strata(&project)
            .args(["check", "--project"])
            .arg(project.dir())
            .assert()
            .success()
            .stdout(predicate::str::contains("requests==2.31.0"));
    }

    #[test]
    fn check_reports_drift_with_hint() {
        let project = Project::new("requests==1.0.0");
        strata(&project)
            .args(["check", "--project"])
            .arg(project.dir())
            .assert()
            .failure()
            .stderr(predicate::str::contains("Lockfile does not match manifest"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn build_then_plan_shows_hits() {
        let project = Project::new("requests>=2.0");
        strata(&project)
            .args(["build", "--project"])
            .arg(project.dir())
            .arg("--output")
            .arg(project.images())
            .assert()
            .success()
            .stdout(predicate::str::contains("Built tools:latest"));
        assert!(project.images().join("tools_latest/image.json").is_file());

        let output = strata(&project)
            .args(["plan", "--format", "json", "--project"])
            .arg(project.dir())
            .output()
            .unwrap();
        assert!(output.status.success());
        let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 5);
        assert_eq!(rows[1]["step"], "install-dependencies");
        assert_eq!(rows[1]["state"], "complete");
    }

    #[test]
    fn build_without_runtime_config_fails() {
        let project = Project::new("requests>=2.0");
        std::fs::remove_file(project.dir().join(".streamlit/config.toml")).unwrap();
        strata(&project)
            .args(["build", "--project"])
            .arg(project.dir())
            .arg("--output")
            .arg(project.images())
            .assert()
            .failure()
            .stderr(predicate::str::contains("Runtime configuration file not found"));
        assert!(!project.images().join("tools_latest").exists());
    }

    #[test]
    fn containerfile_renders() {
        let project = Project::new("requests>=2.0");
        strata(&project)
            .args(["containerfile", "--project"])
            .arg(project.dir())
            .assert()
            .success()
            .stdout(predicate::str::starts_with("FROM python:3.12-slim"))
            .stdout(predicate::str::contains("--no-install-project"))
            .stdout(predicate::str::contains("EXPOSE 8501"));
    }

    #[test]
    fn cache_list_empty_store() {
        let project = Project::new("requests>=2.0");
        strata(&project)
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cache store is empty"));
    }
}
