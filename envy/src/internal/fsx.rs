//! Mostly [`fs`] extensions with extra error messaging.

use std::fs;
use std::fs::File;

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};

/// Equivalent to [`fs::create_dir_all`] with better error messages.
pub fn create_dir_all(p: impl AsRef<Utf8Path>) -> Result<()> {
    return inner(p.as_ref());

    fn inner(p: &Utf8Path) -> Result<()> {
        fs::create_dir_all(p).with_context(|| format!("failed to create directory `{p}`"))?;
        Ok(())
    }
}

/// Equivalent to [`fs::remove_dir_all`] with better error messages.
///
/// Missing directories are not an error.
pub fn remove_dir_all(p: impl AsRef<Utf8Path>) -> Result<()> {
    return inner(p.as_ref());

    fn inner(p: &Utf8Path) -> Result<()> {
        if !p.exists() {
            return Ok(());
        }
        fs::remove_dir_all(p).with_context(|| format!("failed to remove directory `{p}`"))?;
        Ok(())
    }
}

/// Removes and recreates a directory, leaving it empty.
pub fn recreate_dir(p: impl AsRef<Utf8Path>) -> Result<()> {
    remove_dir_all(p.as_ref())?;
    create_dir_all(p.as_ref())
}

/// Equivalent to [`fs::write`] with better error messages.
pub fn write(path: impl AsRef<Utf8Path>, contents: impl AsRef<[u8]>) -> Result<()> {
    return inner(path.as_ref(), contents.as_ref());

    fn inner(path: &Utf8Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents).with_context(|| format!("failed to write `{path}`"))
    }
}

/// Writes a file atomically: write to `<path>.tmp`, then rename over `path`.
///
/// The rename is atomic on POSIX filesystems, so observers never see a
/// half-written file at `path`.
pub fn write_atomic(path: impl AsRef<Utf8Path>, contents: impl AsRef<[u8]>) -> Result<()> {
    return inner(path.as_ref(), contents.as_ref());

    fn inner(path: &Utf8Path, contents: &[u8]) -> Result<()> {
        let tmp = Utf8PathBuf::from(format!("{path}.tmp"));
        write(&tmp, contents)?;
        rename(&tmp, path)
    }
}

/// Equivalent to [`File::create`] with better error messages.
pub fn create(path: impl AsRef<Utf8Path>) -> Result<File> {
    return inner(path.as_ref());

    fn inner(path: &Utf8Path) -> Result<File> {
        File::create(path).with_context(|| format!("failed to create `{path}`"))
    }
}

/// Equivalent to [`fs::read`] with better error messages.
pub fn read(path: impl AsRef<Utf8Path>) -> Result<Vec<u8>> {
    return inner(path.as_ref());

    fn inner(path: &Utf8Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("failed to read `{path}`"))
    }
}

/// Equivalent to [`fs::read_to_string`] with better error messages.
pub fn read_to_string(path: impl AsRef<Utf8Path>) -> Result<String> {
    return inner(path.as_ref());

    fn inner(path: &Utf8Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("failed to read `{path}`"))
    }
}

/// Equivalent to [`fs::rename`] with better error messages.
pub fn rename(from: impl AsRef<Utf8Path>, to: impl AsRef<Utf8Path>) -> Result<()> {
    return inner(from.as_ref(), to.as_ref());

    fn inner(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        fs::rename(from, to).with_context(|| format!("failed to rename `{from}` to `{to}`"))
    }
}

/// Equivalent to [`fs::copy`] with better error messages.
pub fn copy(from: impl AsRef<Utf8Path>, to: impl AsRef<Utf8Path>) -> Result<u64> {
    return inner(from.as_ref(), to.as_ref());

    fn inner(from: &Utf8Path, to: &Utf8Path) -> Result<u64> {
        fs::copy(from, to).with_context(|| format!("failed to copy `{from}` to `{to}`"))
    }
}

/// Moves every entry of `from` into `to`, preserving names.
///
/// Renames entry-by-entry, falling back to a recursive copy + delete when
/// the rename crosses a filesystem boundary.
pub fn move_dir_contents(from: impl AsRef<Utf8Path>, to: impl AsRef<Utf8Path>) -> Result<()> {
    return inner(from.as_ref(), to.as_ref());

    fn inner(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        create_dir_all(to)?;
        for entry in from
            .read_dir_utf8()
            .with_context(|| format!("failed to read directory `{from}`"))?
        {
            let entry = entry.with_context(|| format!("failed to read directory `{from}`"))?;
            let dest = to.join(entry.file_name());
            if fs::rename(entry.path(), &dest).is_err() {
                copy_recursive(entry.path(), &dest)?;
                if entry.path().is_dir() {
                    remove_dir_all(entry.path())?;
                } else {
                    fs::remove_file(entry.path())
                        .with_context(|| format!("failed to remove `{}`", entry.path()))?;
                }
            }
        }
        Ok(())
    }
}

/// Recursively copies a file or directory tree.
pub fn copy_recursive(from: impl AsRef<Utf8Path>, to: impl AsRef<Utf8Path>) -> Result<()> {
    return inner(from.as_ref(), to.as_ref());

    fn inner(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        if from.is_dir() {
            for entry in walkdir::WalkDir::new(from).min_depth(1) {
                let entry = entry.with_context(|| format!("failed to walk `{from}`"))?;
                let rel = entry
                    .path()
                    .strip_prefix(from)
                    .expect("walked path must be rooted in the walked directory");
                let rel = Utf8Path::from_path(rel)
                    .ok_or_else(|| anyhow!("path `{}` is not UTF-8 encoded", rel.display()))?;
                let dest = to.join(rel);
                if entry.file_type().is_dir() {
                    create_dir_all(&dest)?;
                } else {
                    if let Some(parent) = dest.parent() {
                        create_dir_all(parent)?;
                    }
                    let src = Utf8Path::from_path(entry.path()).ok_or_else(|| {
                        anyhow!("path `{}` is not UTF-8 encoded", entry.path().display())
                    })?;
                    copy(src, &dest)?;
                }
            }
            Ok(())
        } else {
            if let Some(parent) = to.parent() {
                create_dir_all(parent)?;
            }
            copy(from, to).map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_leaves_no_tmp_file() {
        let t = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(t.path()).unwrap();
        let target = root.join("marker");
        write_atomic(&target, b"done").unwrap();
        assert_eq!(read_to_string(&target).unwrap(), "done");
        assert!(!root.join("marker.tmp").exists());
    }

    #[test]
    fn move_dir_contents_moves_nested_trees() {
        let t = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(t.path()).unwrap();
        let src = root.join("src");
        create_dir_all(src.join("sub")).unwrap();
        write(src.join("a.txt"), "a").unwrap();
        write(src.join("sub/b.txt"), "b").unwrap();
        let dst = root.join("dst");
        move_dir_contents(&src, &dst).unwrap();
        assert_eq!(read_to_string(dst.join("a.txt")).unwrap(), "a");
        assert_eq!(read_to_string(dst.join("sub/b.txt")).unwrap(), "b");
        assert!(src.read_dir_utf8().unwrap().next().is_none());
    }
}
