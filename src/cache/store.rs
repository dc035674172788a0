//! Content-addressed cache store
//!
//! The store is a directory outside every image, shared by all builds:
//!
//! ```text
//! <root>/
//!   artifacts/<name>/<version>/<sha256>/<file>   fetched wheels
//!   layers/<cache-key>/                          committed layers
//!   locks/                                       flock files
//!   tmp/                                         staging for atomic writes
//! ```
//!
//! Entries are written under `tmp/` and renamed into place, so readers
//! never observe a partial artifact. A layer directory without its
//! `layer.json` record is left over from an interrupted build and is
//! treated as absent.

use crate::cache::lock::FileLock;
use crate::error::{StrataError, StrataResult};
use crate::resolve::{Artifact, LockedPackage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// File that marks a committed layer
pub const LAYER_RECORD: &str = "layer.json";

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Lowercase hex SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// State of a store entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    /// Nothing stored under the key
    Miss,
    /// Directory exists but was never finalized (interrupted build)
    Building,
    /// Finalized and immutable
    Complete,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Miss => f.pad("miss"),
            Self::Building => f.pad("building"),
            Self::Complete => f.pad("complete"),
        }
    }
}

/// Kind of store entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Artifact,
    Layer,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Artifact => f.pad("artifact"),
            Self::Layer => f.pad("layer"),
        }
    }
}

/// One artifact or layer in the store
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub kind: EntryKind,
    /// `name==version` for artifacts, cache key for layers
    pub name: String,
    pub path: PathBuf,
    pub state: CacheState,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

impl CacheEntry {
    /// Check if this entry is older than the given number of days
    pub fn is_older_than_days(&self, days: u32) -> bool {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        self.created_at < cutoff
    }
}

/// Handle to an opened cache store
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Open (creating if needed) the store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> StrataResult<Self> {
        let store = Self { root: root.into() };
        for dir in ["artifacts", "layers", "locks", "tmp"] {
            let path = store.root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|e| StrataError::io(format!("creating {}", path.display()), e))?;
        }
        debug!("Opened cache store at {}", store.root.display());
        Ok(store)
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where an artifact lives once committed
    pub fn artifact_path(&self, package: &LockedPackage, artifact: &Artifact) -> PathBuf {
        self.root
            .join("artifacts")
            .join(&package.name)
            .join(package.version.as_deref().unwrap_or("unversioned"))
            .join(&artifact.sha256)
            .join(artifact.filename())
    }

    /// Read a committed artifact, verifying its hash.
    ///
    /// A corrupted entry is removed and reported as a miss.
    pub fn read_artifact(
        &self,
        package: &LockedPackage,
        artifact: &Artifact,
    ) -> StrataResult<Option<Vec<u8>>> {
        let path = self.artifact_path(package, artifact);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .map_err(|e| StrataError::io(format!("reading {}", path.display()), e))?;
        if sha256_hex(&bytes) != artifact.sha256 {
            warn!(
                "Cached artifact for {} is corrupt, discarding {}",
                package.pin(),
                path.display()
            );
            if let Some(parent) = path.parent() {
                let _ = fs::remove_dir_all(parent);
            }
            return Ok(None);
        }
        Ok(Some(bytes))
    }

    /// Verify and commit fetched artifact bytes
    pub fn put_artifact(
        &self,
        package: &LockedPackage,
        artifact: &Artifact,
        bytes: &[u8],
    ) -> StrataResult<PathBuf> {
        let actual = sha256_hex(bytes);
        if actual != artifact.sha256 {
            return Err(StrataError::install(
                package.pin(),
                format!(
                    "hash mismatch for {}: expected sha256:{}, got sha256:{}",
                    artifact.filename(),
                    artifact.sha256,
                    actual
                ),
            ));
        }

        let dest = self.artifact_path(package, artifact);
        let staging = self.tmp_path(&format!("artifact-{}", package.name));
        fs::write(&staging, bytes)
            .map_err(|e| StrataError::io(format!("writing {}", staging.display()), e))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StrataError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::rename(&staging, &dest)
            .map_err(|e| StrataError::io(format!("committing {}", dest.display()), e))?;

        debug!("Stored {} at {}", package.pin(), dest.display());
        Ok(dest)
    }

    /// Directory of a committed (or in-progress) layer
    pub fn layer_dir(&self, key: &str) -> PathBuf {
        self.root.join("layers").join(key)
    }

    /// Current state of a layer key
    pub fn layer_state(&self, key: &str) -> CacheState {
        let dir = self.layer_dir(key);
        if dir.join(LAYER_RECORD).is_file() {
            CacheState::Complete
        } else if dir.exists() {
            CacheState::Building
        } else {
            CacheState::Miss
        }
    }

    /// Unique path under `tmp/` on the store's filesystem
    pub fn tmp_path(&self, prefix: &str) -> PathBuf {
        self.root
            .join("tmp")
            .join(format!("{}-{}", sanitize(prefix), uuid::Uuid::new_v4()))
    }

    /// Exclusive lock serializing builds of one image tag
    pub fn lock_image(&self, tag: &str) -> StrataResult<FileLock> {
        FileLock::acquire(&self.image_lock_path(tag))
    }

    /// Lock path for an image tag
    pub fn image_lock_path(&self, tag: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(format!("image-{}.lock", sanitize(tag)))
    }

    /// Shared lock a build holds on the whole store while it runs
    pub fn lock_shared(&self) -> StrataResult<FileLock> {
        FileLock::acquire_shared(&self.store_lock_path())
    }

    /// Exclusive lock for removing entries; fails while any build runs
    pub fn lock_for_pruning(&self) -> StrataResult<FileLock> {
        FileLock::try_acquire(&self.store_lock_path())?.ok_or_else(|| {
            StrataError::User(format!(
                "cache store {} is in use by a running build; retry when it finishes",
                self.root.display()
            ))
        })
    }

    fn store_lock_path(&self) -> PathBuf {
        self.root.join("locks").join("store.lock")
    }

    /// Exclusive lock guarding one package's artifact
    pub fn lock_package(&self, package: &LockedPackage) -> StrataResult<FileLock> {
        let name = format!(
            "pkg-{}-{}.lock",
            sanitize(&package.name),
            sanitize(package.version.as_deref().unwrap_or("unversioned"))
        );
        FileLock::acquire(&self.root.join("locks").join(name))
    }

    /// All artifacts and layers currently in the store
    pub fn entries(&self) -> StrataResult<Vec<CacheEntry>> {
        let mut entries = Vec::new();

        // artifacts/<name>/<version>/<hash>/<file>
        let artifacts = self.root.join("artifacts");
        for entry in WalkDir::new(&artifacts)
            .min_depth(4)
            .max_depth(4)
            .sort_by_file_name()
        {
            let entry = entry.map_err(walk_error)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&artifacts).unwrap_or(entry.path());
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let name = match parts.as_slice() {
                [name, version, ..] => format!("{}=={}", name, version),
                _ => rel.display().to_string(),
            };
            let metadata = entry.metadata().map_err(walk_error)?;
            entries.push(CacheEntry {
                kind: EntryKind::Artifact,
                name,
                path: entry.path().to_path_buf(),
                state: CacheState::Complete,
                created_at: modified_at(metadata.modified().ok()),
                size_bytes: metadata.len(),
            });
        }

        let layers = self.root.join("layers");
        let read = fs::read_dir(&layers)
            .map_err(|e| StrataError::io(format!("reading {}", layers.display()), e))?;
        let mut layer_dirs: Vec<PathBuf> = read
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        layer_dirs.sort();
        for dir in layer_dirs {
            let key = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let state = self.layer_state(&key);
            let stamp = fs::metadata(dir.join(LAYER_RECORD))
                .or_else(|_| fs::metadata(&dir))
                .ok()
                .and_then(|m| m.modified().ok());
            entries.push(CacheEntry {
                kind: EntryKind::Layer,
                name: key,
                size_bytes: dir_size(&dir),
                path: dir,
                state,
                created_at: modified_at(stamp),
            });
        }

        Ok(entries)
    }

    /// Remove one entry from the store
    pub fn remove(&self, entry: &CacheEntry) -> StrataResult<()> {
        let target = match entry.kind {
            // Remove the whole <hash>/ directory, not just the file
            EntryKind::Artifact => entry.path.parent().unwrap_or(&entry.path).to_path_buf(),
            EntryKind::Layer => entry.path.clone(),
        };
        if !target.starts_with(&self.root) {
            return Err(StrataError::Internal(format!(
                "refusing to remove {} outside the cache store",
                target.display()
            )));
        }
        fs::remove_dir_all(&target)
            .map_err(|e| StrataError::io(format!("removing {}", target.display()), e))?;
        debug!("Removed {} {}", entry.kind, entry.name);
        Ok(())
    }

    /// Remove every artifact, layer and staging file; returns bytes freed
    pub fn clear(&self) -> StrataResult<u64> {
        let mut freed = 0;
        for dir in ["artifacts", "layers", "tmp"] {
            let path = self.root.join(dir);
            freed += dir_size(&path);
            if path.exists() {
                fs::remove_dir_all(&path)
                    .map_err(|e| StrataError::io(format!("removing {}", path.display()), e))?;
            }
            fs::create_dir_all(&path)
                .map_err(|e| StrataError::io(format!("creating {}", path.display()), e))?;
        }
        Ok(freed)
    }
}

/// Total size of regular files under `path`
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Reduce a label to characters safe in a file name
pub(crate) fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn modified_at(time: Option<SystemTime>) -> DateTime<Utc> {
    time.map(DateTime::<Utc>::from).unwrap_or_else(Utc::now)
}

fn walk_error(e: walkdir::Error) -> StrataError {
    let context = e
        .path()
        .map(|p| format!("walking {}", p.display()))
        .unwrap_or_else(|| "walking cache store".to_string());
    match e.into_io_error() {
        Some(io) => StrataError::io(context, io),
        None => StrataError::Internal(context),
    }
}
