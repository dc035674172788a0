//! Tree snapshots and content digests
//!
//! Digests cover relative paths, entry kinds, executable bits and file
//! contents, and nothing else. Timestamps, owners and traversal order never
//! reach a hash, which is what makes layer digests reproducible.

use crate::error::{StrataError, StrataResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Digest of one tree entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntryDigest {
    File { sha256: String, executable: bool },
    Symlink { target: String },
    Dir,
}

/// Every entry under a root, keyed by `/`-separated relative path
pub type Snapshot = BTreeMap<String, EntryDigest>;

/// Entries a step added or changed, plus paths it removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDiff {
    pub changed: Snapshot,
    pub removed: Vec<String>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// SHA-256 of a single file's contents
pub fn file_digest(path: &Path) -> StrataResult<String> {
    let bytes =
        fs::read(path).map_err(|e| StrataError::io(format!("reading {}", path.display()), e))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Snapshot `root`, skipping anything matched by `excludes`
pub fn snapshot(root: &Path, excludes: &[String]) -> StrataResult<Snapshot> {
    let mut entries = Snapshot::new();
    if !root.exists() {
        return Ok(entries);
    }

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let rel = e.path().strip_prefix(root).unwrap_or(e.path());
            !is_excluded(rel, excludes)
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            let context = format!("walking {}", root.display());
            match e.into_io_error() {
                Some(io) => StrataError::io(context, io),
                None => StrataError::Internal(context),
            }
        })?;
        let path = entry.path();
        let rel = relative_key(root, path);
        let file_type = entry.file_type();

        let digest = if file_type.is_symlink() {
            let target = fs::read_link(path)
                .map_err(|e| StrataError::io(format!("reading link {}", path.display()), e))?;
            EntryDigest::Symlink {
                target: target.to_string_lossy().into_owned(),
            }
        } else if file_type.is_dir() {
            EntryDigest::Dir
        } else {
            let meta = entry
                .metadata()
                .map_err(|e| StrataError::Internal(format!("stat {}: {}", path.display(), e)))?;
            EntryDigest::File {
                sha256: file_digest(path)?,
                executable: is_executable(&meta),
            }
        };
        entries.insert(rel, digest);
    }
    Ok(entries)
}

/// Digest of a whole tree (used for the source tree input)
pub fn tree_digest(root: &Path, excludes: &[String]) -> StrataResult<String> {
    Ok(snapshot_digest(&snapshot(root, excludes)?, &[]))
}

/// Digest over a snapshot and a removal list
pub fn snapshot_digest(entries: &Snapshot, removed: &[String]) -> String {
    let mut hasher = Sha256::new();
    for (path, entry) in entries {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        match entry {
            EntryDigest::File { sha256, executable } => {
                hasher.update(if *executable { b"x" } else { b"f" });
                hasher.update(sha256.as_bytes());
            }
            EntryDigest::Symlink { target } => {
                hasher.update(b"l");
                hasher.update(target.as_bytes());
            }
            EntryDigest::Dir => hasher.update(b"d"),
        }
        hasher.update([0]);
    }
    for path in removed {
        hasher.update(b"-");
        hasher.update(path.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

/// What changed between two snapshots of the same root
pub fn diff(before: &Snapshot, after: &Snapshot) -> TreeDiff {
    let changed = after
        .iter()
        .filter(|(path, entry)| before.get(*path) != Some(*entry))
        .map(|(path, entry)| (path.clone(), entry.clone()))
        .collect();
    let removed = before
        .keys()
        .filter(|path| !after.contains_key(*path))
        .cloned()
        .collect();
    TreeDiff { changed, removed }
}

/// Copy the `entries` of `src` into `dest`, preserving kinds and modes
pub fn copy_entries(src: &Path, dest: &Path, entries: &Snapshot) -> StrataResult<()> {
    for (rel, entry) in entries {
        let from = src.join(rel);
        let to = dest.join(rel);
        match entry {
            EntryDigest::Dir => {
                fs::create_dir_all(&to)
                    .map_err(|e| StrataError::io(format!("creating {}", to.display()), e))?;
            }
            EntryDigest::File { executable, .. } => {
                ensure_parent(&to)?;
                remove_existing(&to)?;
                fs::copy(&from, &to).map_err(|e| {
                    StrataError::io(format!("copying {} to {}", from.display(), to.display()), e)
                })?;
                set_mode(&to, *executable)?;
            }
            EntryDigest::Symlink { target } => {
                ensure_parent(&to)?;
                remove_existing(&to)?;
                make_symlink(Path::new(target), &to)?;
            }
        }
    }
    Ok(())
}

/// Remove `paths` (relative to `root`) if present
pub fn remove_entries(root: &Path, paths: &[String]) -> StrataResult<()> {
    // Deepest first so directories are empty by the time they are removed
    for rel in paths.iter().rev() {
        let path = root.join(rel);
        let Ok(meta) = path.symlink_metadata() else {
            continue;
        };
        let result = if meta.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| StrataError::io(format!("removing {}", path.display()), e))?;
    }
    Ok(())
}

/// Whether a relative path is matched by an exclude pattern.
///
/// Patterns match a whole path component (`.git`), a relative path
/// prefix (`build/cache`), or a file suffix (`*.pyc`).
pub fn is_excluded(rel: &Path, excludes: &[String]) -> bool {
    excludes.iter().any(|pattern| {
        if let Some(suffix) = pattern.strip_prefix('*') {
            return rel.to_string_lossy().ends_with(suffix);
        }
        if pattern.contains('/') {
            return rel.starts_with(pattern.trim_end_matches('/'));
        }
        rel.components()
            .any(|c| c.as_os_str().to_string_lossy() == pattern.as_str())
    })
}

/// Map an absolute in-image path to its location under a staging root
pub fn in_root(root: &Path, image_path: &Path) -> PathBuf {
    let rel: PathBuf = image_path
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .collect();
    root.join(rel)
}

fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn ensure_parent(path: &Path) -> StrataResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| StrataError::io(format!("creating {}", parent.display()), e))?;
    }
    Ok(())
}

fn remove_existing(path: &Path) -> StrataResult<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(_) => return Ok(()),
    }
    .map_err(|e| StrataError::io(format!("replacing {}", path.display()), e))
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_mode(path: &Path, executable: bool) -> StrataResult<()> {
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| StrataError::io(format!("setting mode on {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _executable: bool) -> StrataResult<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> StrataResult<()> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| StrataError::io(format!("linking {}", link.display()), e))
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, link: &Path) -> StrataResult<()> {
    fs::write(link, target.to_string_lossy().as_bytes())
        .map_err(|e| StrataError::io(format!("writing {}", link.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn digest_ignores_timestamps_and_location() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write(a.path(), "src/app.py", "import streamlit\n");
        std::thread::sleep(std::time::Duration::from_millis(20));
        write(b.path(), "src/app.py", "import streamlit\n");

        assert_eq!(
            tree_digest(a.path(), &[]).unwrap(),
            tree_digest(b.path(), &[]).unwrap()
        );
    }

    #[test]
    fn digest_tracks_content_and_names() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/app.py", "a");
        let first = tree_digest(dir.path(), &[]).unwrap();

        write(dir.path(), "src/app.py", "b");
        let second = tree_digest(dir.path(), &[]).unwrap();
        assert_ne!(first, second);

        fs::rename(dir.path().join("src/app.py"), dir.path().join("src/main.py")).unwrap();
        assert_ne!(second, tree_digest(dir.path(), &[]).unwrap());
    }

    #[test]
    fn excludes_are_skipped() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/app.py", "a");
        let clean = tree_digest(dir.path(), &[".venv".into(), "*.pyc".into()]).unwrap();

        write(dir.path(), ".venv/lib/x.py", "noise");
        write(dir.path(), "src/__pycache__/app.cpython-312.pyc", "noise");
        let excludes = vec![".venv".to_string(), "*.pyc".to_string()];
        let snap = snapshot(dir.path(), &excludes).unwrap();
        assert!(!snap.keys().any(|k| k.starts_with(".venv")));
        assert!(!snap.keys().any(|k| k.ends_with(".pyc")));
        // the now-empty __pycache__ dir itself is still an entry
        assert_ne!(clean, tree_digest(dir.path(), &excludes).unwrap());
        assert!(is_excluded(Path::new("build/cache/x"), &["build/cache".into()]));
    }

    #[test]
    fn diff_reports_changes_and_removals() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "keep.txt", "same");
        write(dir.path(), "edit.txt", "old");
        write(dir.path(), "gone.txt", "bye");
        let before = snapshot(dir.path(), &[]).unwrap();

        write(dir.path(), "edit.txt", "new");
        write(dir.path(), "added/new.txt", "hi");
        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        let after = snapshot(dir.path(), &[]).unwrap();

        let d = diff(&before, &after);
        let changed: Vec<&str> = d.changed.keys().map(String::as_str).collect();
        assert_eq!(changed, vec!["added", "added/new.txt", "edit.txt"]);
        assert_eq!(d.removed, vec!["gone.txt"]);
    }

    #[test]
    fn copy_and_remove_entries() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        write(src.path(), "a/b.txt", "body");
        let snap = snapshot(src.path(), &[]).unwrap();

        copy_entries(src.path(), dest.path(), &snap).unwrap();
        assert_eq!(fs::read_to_string(dest.path().join("a/b.txt")).unwrap(), "body");
        assert_eq!(snapshot(dest.path(), &[]).unwrap(), snap);

        remove_entries(dest.path(), &["a".into(), "a/b.txt".into()]).unwrap();
        assert!(!dest.path().join("a").exists());
    }

    #[test]
    fn in_root_strips_leading_slash() {
        assert_eq!(
            in_root(Path::new("/stage"), Path::new("/root/.streamlit/config.toml")),
            PathBuf::from("/stage/root/.streamlit/config.toml")
        );
    }
}
