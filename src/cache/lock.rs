//! Advisory file locks over the cache store
//!
//! Locks are `flock(2)` locks on small files under `locks/`. They are tied
//! to the open file description, so dropping the guard (closing the file)
//! releases the lock, including when the holding process dies. Shared
//! holders coexist; an exclusive holder excludes everyone else.

use crate::error::{StrataError, StrataResult};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held lock; released on drop
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock at `path` is acquired
    pub fn acquire(path: &Path) -> StrataResult<Self> {
        let file = open_lock_file(path)?;
        flock(&file, false, false).map_err(|e| {
            StrataError::io(format!("locking {}", path.display()), e)
        })?;
        debug!("Acquired lock {}", path.display());
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// Block until a shared lock at `path` is acquired
    pub fn acquire_shared(path: &Path) -> StrataResult<Self> {
        let file = open_lock_file(path)?;
        flock(&file, true, false).map_err(|e| {
            StrataError::io(format!("locking {} shared", path.display()), e)
        })?;
        debug!("Acquired shared lock {}", path.display());
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// Acquire the lock without waiting; `None` if another holder has it
    pub fn try_acquire(path: &Path) -> StrataResult<Option<Self>> {
        let file = open_lock_file(path)?;
        match flock(&file, false, true) {
            Ok(()) => Ok(Some(Self {
                _file: file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(StrataError::io(format!("locking {}", path.display()), e)),
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        debug!("Released lock {}", self.path.display());
    }
}

fn open_lock_file(path: &Path) -> StrataResult<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| StrataError::io(format!("creating {}", parent.display()), e))?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| StrataError::io(format!("opening lock file {}", path.display()), e))
}

#[cfg(unix)]
fn flock(file: &File, shared: bool, non_blocking: bool) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let mut op = if shared { libc::LOCK_SH } else { libc::LOCK_EX };
    if non_blocking {
        op |= libc::LOCK_NB;
    }
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), op) };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(code) if code == libc::EWOULDBLOCK => {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, err))
            }
            _ => return Err(err),
        }
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _shared: bool, _non_blocking: bool) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_creates_lock_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks").join("image-tools.lock");

        let lock = FileLock::acquire(&path).unwrap();
        assert!(path.exists());
        assert_eq!(lock.path(), path);
    }

    #[cfg(unix)]
    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pkg-requests-2.31.0.lock");

        let first = FileLock::acquire(&path).unwrap();
        assert!(FileLock::try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn shared_holders_block_exclusive_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.lock");

        let a = FileLock::acquire_shared(&path).unwrap();
        let b = FileLock::acquire_shared(&path).unwrap();
        assert!(FileLock::try_acquire(&path).unwrap().is_none());

        drop(a);
        assert!(FileLock::try_acquire(&path).unwrap().is_none());
        drop(b);
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn distinct_paths_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let _a = FileLock::acquire(&dir.path().join("a.lock")).unwrap();
        assert!(FileLock::try_acquire(&dir.path().join("b.lock"))
            .unwrap()
            .is_some());
    }
}
