//! Content-addressed store of recipe outputs.
//!
//! Every recipe fingerprint owns one entry directory under
//! `<root>/entries/<fp>/` with a fixed internal layout:
//!
//! ```text
//! .lock           advisory exclusion lock file
//! tmp/            transient per-phase scratch (purged after completion)
//! fetch/          verified downloaded artifacts (retained)
//! stage/          extracted working tree (purged after completion)
//! install/        final outputs referenced by asset paths (retained)
//! install.done    completion marker, written by atomic rename
//! ```
//!
//! The store is shared by all engines on the host; an entry is mutated only
//! while its [`ScopedLock`] is held.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::core::errors::EnvyError;
use crate::fingerprint::Fingerprint;
use crate::flock::{self, FileLockGuard};
use crate::internal::fsx;
use crate::{CACHE_ENTRIES_DIR_NAME, CACHE_LOCK_FILE_NAME, INSTALL_MARKER_FILE_NAME};

#[derive(Debug)]
pub struct Cache {
    root: Utf8PathBuf,
}

/// The five stable paths of one cache entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryPaths {
    pub root: Utf8PathBuf,
    pub tmp: Utf8PathBuf,
    pub fetch: Utf8PathBuf,
    pub stage: Utf8PathBuf,
    pub install: Utf8PathBuf,
}

/// Exclusive hold on a cache entry, released on drop.
///
/// While held, no other cache operation on the same fingerprint — from this
/// or any other process — may mutate the entry.
#[derive(Debug)]
pub struct ScopedLock {
    _guard: FileLockGuard,
    fingerprint: Fingerprint,
}

impl ScopedLock {
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl Cache {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn entry_root(&self, fp: Fingerprint) -> Utf8PathBuf {
        self.root
            .join(CACHE_ENTRIES_DIR_NAME)
            .join(fp.to_hex())
    }

    pub fn paths(&self, fp: Fingerprint) -> EntryPaths {
        let root = self.entry_root(fp);
        EntryPaths {
            tmp: root.join("tmp"),
            fetch: root.join("fetch"),
            stage: root.join("stage"),
            install: root.join("install"),
            root,
        }
    }

    /// Blocks until an exclusive advisory lock on the entry is held.
    ///
    /// The entry directory is created lazily here, on first acquisition.
    pub fn acquire(&self, fp: Fingerprint) -> Result<ScopedLock> {
        let root = self.entry_root(fp);
        let lock_path = root.join(CACHE_LOCK_FILE_NAME);
        let guard =
            flock::lock_exclusive(&lock_path, &format!("cache entry {fp}")).map_err(|err| {
                EnvyError::CacheLockFailed {
                    path: lock_path.to_string(),
                    reason: format!("{err:#}"),
                }
            })?;
        Ok(ScopedLock {
            _guard: guard,
            fingerprint: fp,
        })
    }

    /// Idempotently creates `tmp/`, `fetch/`, `stage/` and `install/`.
    pub fn ensure_dirs(&self, fp: Fingerprint) -> Result<()> {
        let paths = self.paths(fp);
        for dir in [&paths.tmp, &paths.fetch, &paths.stage, &paths.install] {
            fsx::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// True iff the install-complete marker exists.
    pub fn is_complete(&self, fp: Fingerprint) -> bool {
        self.entry_root(fp).join(INSTALL_MARKER_FILE_NAME).exists()
    }

    /// Writes the completion marker atomically (temp file, then rename), so
    /// a crash can never leave a half-written marker behind.
    pub fn mark_complete(&self, fp: Fingerprint) -> Result<()> {
        let marker = self.entry_root(fp).join(INSTALL_MARKER_FILE_NAME);
        fsx::write_atomic(&marker, fp.to_hex().as_bytes())
            .with_context(|| format!("failed to mark cache entry {fp} complete"))
    }

    pub fn purge_tmp(&self, fp: Fingerprint) -> Result<()> {
        fsx::remove_dir_all(self.paths(fp).tmp)
    }

    pub fn purge_stage(&self, fp: Fingerprint) -> Result<()> {
        fsx::remove_dir_all(self.paths(fp).stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_fingerprint(seed: &str) -> Fingerprint {
        let inputs = crate::fingerprint::FingerprintInputs {
            identity_hash: blake3::hash(seed.as_bytes()),
            deps: &[],
            script_hash: blake3::hash(b"script"),
            source_hash: blake3::hash(b"source"),
        };
        crate::fingerprint::compute(&inputs)
    }

    fn cache() -> (tempfile::TempDir, Cache) {
        let t = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(t.path().to_path_buf()).unwrap();
        (t, Cache::new(root))
    }

    #[test]
    fn entry_layout() {
        let (_t, cache) = cache();
        let fp = test_fingerprint("layout");
        let _lock = cache.acquire(fp).unwrap();
        cache.ensure_dirs(fp).unwrap();

        let paths = cache.paths(fp);
        assert_eq!(paths.root, cache.root().join("entries").join(fp.to_hex()));
        for dir in [&paths.tmp, &paths.fetch, &paths.stage, &paths.install] {
            assert!(dir.is_dir());
        }
        assert!(paths.root.join(".lock").is_file());
    }

    #[test]
    fn completion_marker_is_atomic_and_sticky() {
        let (_t, cache) = cache();
        let fp = test_fingerprint("marker");
        let _lock = cache.acquire(fp).unwrap();
        cache.ensure_dirs(fp).unwrap();

        assert!(!cache.is_complete(fp));
        cache.mark_complete(fp).unwrap();
        assert!(cache.is_complete(fp));
        assert!(!cache.paths(fp).root.join("install.done.tmp").exists());
        // Marking twice is fine.
        cache.mark_complete(fp).unwrap();
        assert!(cache.is_complete(fp));
    }

    #[test]
    fn purge_removes_transient_dirs_only() {
        let (_t, cache) = cache();
        let fp = test_fingerprint("purge");
        let _lock = cache.acquire(fp).unwrap();
        cache.ensure_dirs(fp).unwrap();
        let paths = cache.paths(fp);
        fsx::write(paths.tmp.join("scratch"), "x").unwrap();
        fsx::write(paths.stage.join("tree"), "x").unwrap();
        fsx::write(paths.install.join("bin"), "x").unwrap();

        cache.purge_tmp(fp).unwrap();
        cache.purge_stage(fp).unwrap();

        assert!(!paths.tmp.exists());
        assert!(!paths.stage.exists());
        assert!(paths.install.join("bin").is_file());

        // Purging again is a no-op.
        cache.purge_tmp(fp).unwrap();
    }

    #[test]
    fn lock_is_reacquirable_after_release() {
        let (_t, cache) = cache();
        let fp = test_fingerprint("lock");
        let lock = cache.acquire(fp).unwrap();
        assert_eq!(lock.fingerprint(), fp);
        drop(lock);
        let _lock = cache.acquire(fp).unwrap();
    }

    #[test]
    fn distinct_fingerprints_get_distinct_entries() {
        let (_t, cache) = cache();
        let a = test_fingerprint("a");
        let b = test_fingerprint("b");
        assert_ne!(cache.paths(a).root, cache.paths(b).root);
    }
}
