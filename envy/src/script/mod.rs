//! The seam between the engine and the embedded scripting runtime.
//!
//! The engine treats recipe scripts as opaque callable handles: the runtime
//! compiles script text into a [`RecipeScript`], the engine reads top-level
//! declarations from it and invokes lifecycle hooks against a
//! [`ScriptContext`](bindings::ScriptContext). The binding layer is the only
//! place that touches the runtime's value representation.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

use crate::core::checksum::Checksum;
use crate::core::key::RecipeKey;
use crate::core::spec::{DependencySpec, OptionMap};

pub mod bindings;

pub use bindings::{RunOptions, ScriptContext, ShellKind, template};

/// Compiles recipe scripts in fresh contexts; implemented by the embedded
/// scripting runtime.
pub trait ScriptHost: Send + Sync {
    fn load(&self, key: &RecipeKey, text: &str, origin: &str) -> Result<Box<dyn RecipeScript>>;
}

/// A compiled recipe script.
///
/// Handles are per-recipe and never shared between workers; every method is
/// invoked from the owning recipe's worker thread only.
pub trait RecipeScript: Send {
    /// Top-level declarations read once during recipe-load.
    fn declarations(&self) -> Result<Declarations>;

    /// The `validate` callback, run against the spec's options during
    /// recipe-load. Scripts without the callback accept everything.
    fn validate(&self, options: &OptionMap) -> Result<()> {
        let _ = options;
        Ok(())
    }

    fn has_hook(&self, hook: Hook) -> bool;

    /// The `check` hook. Returning [`CheckOutcome::Satisfied`] short-circuits
    /// the remaining phases.
    fn check(&self, ctx: &mut ScriptContext<'_>) -> Result<CheckOutcome> {
        let _ = ctx;
        Ok(CheckOutcome::Stale)
    }

    /// One of the `fetch`/`stage`/`build`/`install` hooks.
    fn call(&self, hook: Hook, ctx: &mut ScriptContext<'_>) -> Result<()>;

    /// Callback body of a programmatic source declaration; expected to leave
    /// its artifact in `fetch/` via `commit_fetch`.
    fn fetch_source(&self, name: &str, ctx: &mut ScriptContext<'_>) -> Result<()> {
        let _ = (name, ctx);
        Ok(())
    }

    /// Resolves a callback-style products declaration.
    fn products(&self, ctx: &mut ScriptContext<'_>) -> Result<BTreeMap<SmolStr, String>> {
        let _ = ctx;
        Ok(BTreeMap::new())
    }
}

/// Lifecycle hooks a script may declare.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Hook {
    Check,
    Fetch,
    Stage,
    Build,
    Install,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Hook::Check => "check",
            Hook::Fetch => "fetch",
            Hook::Stage => "stage",
            Hook::Build => "build",
            Hook::Install => "install",
        })
    }
}

/// Result of the `check` hook.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CheckOutcome {
    /// The package is already present; skip fetch through deploy.
    Satisfied,
    /// Work is needed; continue with the remaining phases.
    Stale,
}

/// Top-level declarations the engine reads from a compiled script.
#[derive(Clone, Debug, Default)]
pub struct Declarations {
    /// Must agree with the spec identity the recipe was requested under.
    pub identity: String,
    pub alias: Option<SmolStr>,
    /// Script-declared dependencies; processed after the spec's own, both in
    /// declaration order.
    pub dependencies: Vec<DependencySpec>,
    /// Payload sources fetched during the fetch phase.
    pub sources: Vec<SourceDecl>,
    /// Leading path components stripped when extracting archives.
    pub strip: usize,
    pub products: ProductsDecl,
}

/// A payload source declared by a script.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SourceDecl {
    /// Name the verified artifact gets under `fetch/`.
    pub filename: SmolStr,
    pub origin: SourceOrigin,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceOrigin {
    /// Plain download, verified against the expected digest when given.
    Archive {
        url: Url,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<Checksum>,
    },
    /// Git checkout pinned to a commit or tag.
    Git { url: Url, reference: SmolStr },
    /// Programmatic source: the script's callback produces the artifact
    /// through the fetch bindings.
    Callback,
}

/// The `products` declaration: absent, a literal table, or a callback
/// resolved during deploy.
#[derive(Clone, Debug, Default)]
pub enum ProductsDecl {
    #[default]
    Absent,
    Table(BTreeMap<SmolStr, String>),
    Callback,
}

impl ProductsDecl {
    pub fn is_absent(&self) -> bool {
        matches!(self, ProductsDecl::Absent)
    }
}
