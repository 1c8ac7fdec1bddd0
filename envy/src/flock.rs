use std::fs::{File, OpenOptions};
use std::io;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fs4::{FileExt, lock_contended_error};
use tracing::{debug, warn};

use crate::internal::fsx;

/// An exclusive advisory file lock, released on drop.
///
/// Advisory locks are correct across processes: two engines on the same host
/// contending for one cache entry serialize on the entry's lock file. If the
/// holding process terminates abnormally the OS releases the lock.
#[derive(Debug)]
pub struct FileLockGuard {
    file: Option<File>,
    path: Utf8PathBuf,
}

impl FileLockGuard {
    pub fn path(&self) -> &Utf8Path {
        self.path.as_path()
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}

/// Acquires an exclusive advisory lock on `path`, creating the file (and
/// intermediate directories) if needed.
///
/// Tries a non-blocking acquisition first; on contention logs a blocking
/// notice naming `description` and waits. Filesystems that do not implement
/// locking are treated as uncontended.
pub fn lock_exclusive(path: &Utf8Path, description: &str) -> Result<FileLockGuard> {
    if let Some(parent) = path.parent() {
        fsx::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open lock file `{path}`"))?;

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::Unsupported => {
            // Filesystem does not implement file locking.
            warn!(path = %path, "file locking unsupported, proceeding unlocked");
        }
        Err(err) if is_lock_contended_error(&err) => {
            debug!(path = %path, "blocking: waiting for file lock on {description}");
            file.lock_exclusive()
                .with_context(|| format!("failed to lock file `{path}`"))?;
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to lock file `{path}`"));
        }
    }

    Ok(FileLockGuard {
        file: Some(file),
        path: path.to_path_buf(),
    })
}

fn is_lock_contended_error(err: &io::Error) -> bool {
    let t = lock_contended_error();
    err.raw_os_error() == t.raw_os_error() || err.kind() == t.kind()
}
