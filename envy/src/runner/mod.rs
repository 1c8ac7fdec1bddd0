//! External collaborator seams: fetching, extraction, shell execution.
//!
//! The engine invokes these with fully resolved arguments. The in-crate
//! implementations cover local files, tar archives and the system shell; the
//! HTTPS/git fetcher is supplied by the embedding application.

use std::collections::BTreeMap;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use smol_str::SmolStr;
use url::Url;

use crate::core::checksum::Checksum;

mod extract;
mod fetch;
mod shell;

pub use extract::ArchiveExtractor;
pub use fetch::FileFetcher;
pub use shell::SystemShell;

/// Downloads payloads and recipe scripts.
pub trait Fetcher: Send + Sync {
    /// Materializes `origin` at `request.dest` (a file, or a directory for
    /// git checkouts). Returns the checksum of the fetched bytes when the
    /// origin kind has one; digest comparison is the engine's job.
    fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome>;
}

#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub origin: FetchOrigin,
    pub dest: Utf8PathBuf,
}

#[derive(Clone, Debug)]
pub enum FetchOrigin {
    Url(Url),
    Git { url: Url, reference: SmolStr },
}

#[derive(Clone, Debug, Default)]
pub struct FetchOutcome {
    /// SHA-256 of the fetched file; `None` for git checkouts (the ref pin is
    /// the fetcher's verification).
    pub checksum: Option<Checksum>,
}

/// Unpacks fetched archives into the stage tree.
pub trait Extractor: Send + Sync {
    /// Extracts `archive` into `dest`, stripping `strip` leading path
    /// components from every entry.
    fn extract(&self, archive: &Utf8Path, dest: &Utf8Path, strip: usize) -> Result<()>;

    /// Whether this extractor recognizes the file as an archive.
    fn recognizes(&self, archive: &Utf8Path) -> bool;
}

/// Runs shell snippets on behalf of recipe hooks.
pub trait ShellRunner: Send + Sync {
    fn run(&self, request: &RunRequest) -> Result<RunOutput>;
}

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub script: String,
    pub cwd: Utf8PathBuf,
    pub env: BTreeMap<String, String>,
    pub shell: crate::script::ShellKind,
    /// Suppress log forwarding of the child's output.
    pub quiet: bool,
    /// Collect stdout and return it in [`RunOutput::stdout`].
    pub capture: bool,
    /// Inherit the parent's stdio instead of piping.
    pub interactive: bool,
}

#[derive(Clone, Debug)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: Option<String>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
