//! Change-aware file writes
//!
//! Every file the installer produces goes through [`FileWriter`], which
//! leaves a file alone when its bytes and executable bit already match.
//! Re-running an install over an identical tree therefore writes nothing,
//! and the written count doubles as a change signal.

use crate::error::{StrataError, StrataResult};
use std::fs;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Writes files only when their content differs
#[derive(Debug, Default)]
pub struct FileWriter {
    written: usize,
}

impl FileWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files actually written so far
    pub fn written(&self) -> usize {
        self.written
    }

    /// Write `bytes` to `path`; returns whether anything changed
    pub fn write(&mut self, path: &Path, bytes: &[u8], executable: bool) -> StrataResult<bool> {
        if is_unchanged(path, bytes, executable) {
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StrataError::io(format!("creating {}", parent.display()), e))?;
        }
        // Replace rather than truncate so hard links and symlinks are never written through
        if path.symlink_metadata().is_ok() {
            fs::remove_file(path)
                .map_err(|e| StrataError::io(format!("replacing {}", path.display()), e))?;
        }
        fs::write(path, bytes)
            .map_err(|e| StrataError::io(format!("writing {}", path.display()), e))?;
        set_executable(path, executable)?;

        self.written += 1;
        Ok(true)
    }

    /// Point a symlink at `target`; returns whether anything changed
    #[cfg(unix)]
    pub fn symlink(&mut self, path: &Path, target: &Path) -> StrataResult<bool> {
        if fs::read_link(path).ok().as_deref() == Some(target) {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StrataError::io(format!("creating {}", parent.display()), e))?;
        }
        if path.symlink_metadata().is_ok() {
            fs::remove_file(path)
                .map_err(|e| StrataError::io(format!("replacing {}", path.display()), e))?;
        }
        std::os::unix::fs::symlink(target, path)
            .map_err(|e| StrataError::io(format!("linking {}", path.display()), e))?;

        self.written += 1;
        Ok(true)
    }

    #[cfg(not(unix))]
    pub fn symlink(&mut self, path: &Path, target: &Path) -> StrataResult<bool> {
        let body = target.to_string_lossy();
        self.write(path, body.as_bytes(), false)
    }
}

fn is_unchanged(path: &Path, bytes: &[u8], executable: bool) -> bool {
    let Ok(meta) = path.symlink_metadata() else {
        return false;
    };
    if !meta.is_file() || meta.len() != bytes.len() as u64 {
        return false;
    }
    if is_executable(&meta) != executable {
        return false;
    }
    fs::read(path).map(|existing| existing == bytes).unwrap_or(false)
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
fn set_executable(path: &Path, executable: bool) -> StrataResult<()> {
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| StrataError::io(format!("setting mode on {}", path.display()), e))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> StrataResult<()> {
    Ok(())
}
