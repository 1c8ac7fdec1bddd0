use anyhow::Result;
use camino::Utf8PathBuf;
use tracing::debug;

use crate::core::checksum::Checksum;
use crate::core::errors::EnvyError;
use crate::internal::fsx;
use crate::shutdown;

use super::{FetchOrigin, FetchOutcome, FetchRequest, Fetcher};

/// Fetcher for `file:` URLs and plain local paths.
///
/// Network and git fetching belong to the embedding application; this
/// implementation covers local recipe collections and the test suite. It
/// copies the source file to the destination and reports its SHA-256.
#[derive(Debug, Default)]
pub struct FileFetcher;

impl Fetcher for FileFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        // Fetchers are a cancellation point of their own.
        shutdown::check()?;
        let url = match &request.origin {
            FetchOrigin::Url(url) => url,
            FetchOrigin::Git { url, .. } => {
                return Err(EnvyError::FetchFailed {
                    source_id: url.to_string(),
                    reason: "git sources require an external fetcher".to_string(),
                }
                .into());
            }
        };

        let path = local_path(url).ok_or_else(|| EnvyError::FetchFailed {
            source_id: url.to_string(),
            reason: "only file: and path-like URLs are fetchable locally".to_string(),
        })?;
        if !path.is_file() {
            return Err(EnvyError::FetchFailed {
                source_id: url.to_string(),
                reason: format!("`{path}` does not exist"),
            }
            .into());
        }

        debug!(from = %path, to = %request.dest, "copying local source");
        if let Some(parent) = request.dest.parent() {
            fsx::create_dir_all(parent)?;
        }
        fsx::copy(&path, &request.dest)?;

        let checksum = Checksum::compute(fsx::read(&request.dest)?);
        Ok(FetchOutcome {
            checksum: Some(checksum),
        })
    }
}

fn local_path(url: &url::Url) -> Option<Utf8PathBuf> {
    match url.scheme() {
        "file" => {
            let path = url.to_file_path().ok()?;
            Utf8PathBuf::from_path_buf(path).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_and_digests_local_files() {
        let t = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(t.path().to_path_buf()).unwrap();
        let src = root.join("artifact.tar");
        fsx::write(&src, b"payload").unwrap();

        let request = FetchRequest {
            origin: FetchOrigin::Url(url::Url::from_file_path(src.as_std_path()).unwrap()),
            dest: root.join("out/artifact.tar"),
        };
        let outcome = FileFetcher.fetch(&request).unwrap();

        assert_eq!(fsx::read(&request.dest).unwrap(), b"payload");
        assert_eq!(outcome.checksum.unwrap(), Checksum::compute(b"payload"));
    }

    #[test]
    fn rejects_remote_schemes() {
        let request = FetchRequest {
            origin: FetchOrigin::Url("https://example.com/x.tar".parse().unwrap()),
            dest: "/tmp/never".into(),
        };
        let err = FileFetcher.fetch(&request).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnvyError>(),
            Some(EnvyError::FetchFailed { .. })
        ));
    }
}
