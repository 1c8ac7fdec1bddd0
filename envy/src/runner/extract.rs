use std::fs::File;
use std::io::Read;
use std::path::{Component, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tracing::debug;

use camino::Utf8Path;

use crate::core::errors::EnvyError;
use crate::internal::fsx;

use super::Extractor;

/// Extractor for `.tar`, `.tar.gz` and `.tgz` archives.
#[derive(Debug, Default)]
pub struct ArchiveExtractor;

impl Extractor for ArchiveExtractor {
    #[tracing::instrument(level = "trace", skip(self))]
    fn extract(&self, archive: &Utf8Path, dest: &Utf8Path, strip: usize) -> Result<()> {
        let file = File::open(archive)
            .with_context(|| format!("failed to open archive `{archive}`"))?;
        let name = archive.as_str();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            unpack(tar::Archive::new(GzDecoder::new(file)), archive, dest, strip)
        } else if name.ends_with(".tar") {
            unpack(tar::Archive::new(file), archive, dest, strip)
        } else {
            Err(EnvyError::ExtractionFailed {
                archive: archive.to_string(),
                reason: "unsupported archive format".to_string(),
            }
            .into())
        }
    }

    fn recognizes(&self, archive: &Utf8Path) -> bool {
        let name = archive.as_str();
        name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz")
    }
}

fn unpack<R: Read>(
    mut archive: tar::Archive<R>,
    archive_path: &Utf8Path,
    dest: &Utf8Path,
    strip: usize,
) -> Result<()> {
    let failed = |reason: String| EnvyError::ExtractionFailed {
        archive: archive_path.to_string(),
        reason,
    };

    fsx::create_dir_all(dest)?;
    let entries = archive
        .entries()
        .map_err(|e| failed(format!("failed to read entries: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| failed(format!("corrupt entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| failed(format!("entry has invalid path: {e}")))?
            .into_owned();

        let mut components = path.components();
        for _ in 0..strip {
            if components.next().is_none() {
                break;
            }
        }
        let stripped: PathBuf = components.as_path().to_path_buf();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        if stripped
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(failed(format!("entry `{}` escapes the stage tree", path.display())).into());
        }

        let target = dest.as_std_path().join(&stripped);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| failed(format!("failed to create `{}`: {e}", parent.display())))?;
        }
        debug!(entry = %path.display(), "unpacking");
        entry
            .unpack(&target)
            .map_err(|e| failed(format!("failed to unpack `{}`: {e}", path.display())))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn make_tar(root: &Utf8Path, entries: &[(&str, &str)]) -> Utf8PathBuf {
        let path = root.join("fixture.tar");
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.finish().unwrap();
        path
    }

    fn root(t: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(t.path().to_path_buf()).unwrap()
    }

    #[test]
    fn extracts_with_strip() {
        let t = tempfile::tempdir().unwrap();
        let root = root(&t);
        let tar = make_tar(
            &root,
            &[
                ("pkg-1.0/bin/tool", "binary"),
                ("pkg-1.0/README", "docs"),
            ],
        );
        let dest = root.join("stage");
        ArchiveExtractor.extract(&tar, &dest, 1).unwrap();
        assert_eq!(fsx::read_to_string(dest.join("bin/tool")).unwrap(), "binary");
        assert_eq!(fsx::read_to_string(dest.join("README")).unwrap(), "docs");
        assert!(!dest.join("pkg-1.0").exists());
    }

    #[test]
    fn strip_deeper_than_entry_skips_it() {
        let t = tempfile::tempdir().unwrap();
        let root = root(&t);
        let tar = make_tar(&root, &[("shallow", "x"), ("deep/file", "y")]);
        let dest = root.join("stage");
        ArchiveExtractor.extract(&tar, &dest, 1).unwrap();
        assert!(!dest.join("shallow").exists());
        assert_eq!(fsx::read_to_string(dest.join("file")).unwrap(), "y");
    }

    #[test]
    fn rejects_unknown_formats() {
        let t = tempfile::tempdir().unwrap();
        let root = root(&t);
        let weird = root.join("blob.xyz");
        fsx::write(&weird, "data").unwrap();
        let err = ArchiveExtractor
            .extract(&weird, &root.join("stage"), 0)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnvyError>(),
            Some(EnvyError::ExtractionFailed { .. })
        ));
        assert!(!ArchiveExtractor.recognizes(&weird));
        assert!(ArchiveExtractor.recognizes(Utf8Path::new("a.tar.gz")));
    }
}
