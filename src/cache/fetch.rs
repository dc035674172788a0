//! Artifact fetching
//!
//! A fetcher turns a locked artifact location into bytes. It does not
//! verify hashes or touch the store; [`CacheStore::put_artifact`] does
//! that, so every fetcher gets the same integrity check.
//!
//! [`CacheStore::put_artifact`]: crate::cache::CacheStore::put_artifact

use crate::error::{StrataError, StrataResult};
use crate::resolve::{Artifact, LockedPackage};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Upper bound on a single artifact download
const MAX_ARTIFACT_BYTES: u64 = 512 * 1024 * 1024;

/// Source of artifact bytes
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Fetch the raw bytes of `artifact` for `package`
    async fn fetch(&self, package: &LockedPackage, artifact: &Artifact) -> StrataResult<Vec<u8>>;

    /// Human-readable fetcher name for logs
    fn name(&self) -> &'static str;
}

/// Fetches over HTTP(S), from `file://` URLs, and from project-relative paths
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    project_dir: PathBuf,
    timeout: Duration,
}

impl ArtifactFetcher {
    /// Create a fetcher resolving relative paths against `project_dir`
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Local file path an artifact location refers to, if it is not remote
    pub fn local_path(&self, location: &str) -> Option<PathBuf> {
        if is_remote(location) {
            return None;
        }
        let path = match location.strip_prefix("file://") {
            Some(rest) => PathBuf::from(rest),
            None => PathBuf::from(location),
        };
        Some(if path.is_absolute() {
            path
        } else {
            self.project_dir.join(path)
        })
    }
}

#[async_trait]
impl PackageFetcher for ArtifactFetcher {
    async fn fetch(&self, package: &LockedPackage, artifact: &Artifact) -> StrataResult<Vec<u8>> {
        if let Some(path) = self.local_path(&artifact.location) {
            debug!("Reading {} from {}", package.pin(), path.display());
            return read_local(package, &path).await;
        }

        debug!("Downloading {} from {}", package.pin(), artifact.location);
        let url = artifact.location.clone();
        let timeout = self.timeout;
        let result = tokio::task::spawn_blocking(move || download(&url, timeout))
            .await
            .map_err(|e| StrataError::Internal(format!("download task failed: {}", e)))?;

        result.map_err(|reason| StrataError::PackageFetch {
            package: package.pin(),
            url: artifact.location.clone(),
            reason,
        })
    }

    fn name(&self) -> &'static str {
        "artifact"
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

async fn read_local(package: &LockedPackage, path: &Path) -> StrataResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        StrataError::install(
            package.pin(),
            format!("cannot read artifact {}: {}", path.display(), e),
        )
    })
}

fn download(url: &str, timeout: Duration) -> Result<Vec<u8>, String> {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    let agent: ureq::Agent = config.into();

    let mut response = agent.get(url).call().map_err(|e| e.to_string())?;
    response
        .body_mut()
        .with_config()
        .limit(MAX_ARTIFACT_BYTES)
        .read_to_vec()
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::PackageSource;
    use tempfile::TempDir;

    fn package(location: &str) -> (LockedPackage, Artifact) {
        let artifact = Artifact {
            location: location.into(),
            sha256: "0".repeat(64),
        };
        let pkg = LockedPackage {
            name: "idna".into(),
            version: Some("3.7".into()),
            source: PackageSource::Registry("local".into()),
            dependencies: vec![],
            optional_dependencies: Default::default(),
            wheels: vec![artifact.clone()],
            wheel: Some(artifact.clone()),
        };
        (pkg, artifact)
    }

    #[test]
    fn local_path_resolution() {
        let fetcher = ArtifactFetcher::new("/project");
        assert_eq!(
            fetcher.local_path("wheels/a.whl"),
            Some(PathBuf::from("/project/wheels/a.whl"))
        );
        assert_eq!(
            fetcher.local_path("file:///srv/a.whl"),
            Some(PathBuf::from("/srv/a.whl"))
        );
        assert_eq!(fetcher.local_path("https://files.example/a.whl"), None);
    }

    #[tokio::test]
    async fn fetch_relative_path() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("wheels")).unwrap();
        std::fs::write(dir.path().join("wheels/idna.whl"), b"zip").unwrap();

        let fetcher = ArtifactFetcher::new(dir.path());
        let (pkg, artifact) = package("wheels/idna.whl");
        assert_eq!(fetcher.fetch(&pkg, &artifact).await.unwrap(), b"zip");
    }

    #[tokio::test]
    async fn missing_local_file_is_install_error() {
        let dir = TempDir::new().unwrap();
        let fetcher = ArtifactFetcher::new(dir.path());
        let (pkg, artifact) = package("wheels/missing.whl");

        let err = fetcher.fetch(&pkg, &artifact).await.unwrap_err();
        assert!(matches!(err, StrataError::PackageInstall { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_host_is_retryable() {
        let fetcher = ArtifactFetcher::new("/").with_timeout(Duration::from_secs(2));
        let (pkg, artifact) = package("http://127.0.0.1:9/idna.whl");

        let err = fetcher.fetch(&pkg, &artifact).await.unwrap_err();
        assert!(matches!(err, StrataError::PackageFetch { .. }));
        assert!(err.is_retryable());
    }
}
