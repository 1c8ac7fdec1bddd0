use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use camino::Utf8PathBuf;
use smol_str::SmolStr;

use crate::cache::ScopedLock;
use crate::core::key::RecipeKey;
use crate::core::phase::Phase;
use crate::core::spec::{RecipeSpec, ScriptSource};
use crate::fingerprint::Fingerprint;
use crate::script::{Declarations, RecipeScript};

/// An engine-owned recipe instance.
///
/// The immutable half (key, spec, identity hash) is plain data; everything a
/// worker accumulates while driving phases lives in the mutex-guarded
/// [`RecipeData`] block. Only the owning worker writes the data block; other
/// workers read it after the coordinator has established a happens-before
/// edge for the field they need. All synchronization state
/// (current/target phase, condvar) lives in the engine's coordination
/// records, not here.
pub struct Recipe {
    key: RecipeKey,
    spec: RecipeSpec,
    identity_hash: blake3::Hash,
    data: Mutex<RecipeData>,
}

/// Mutable per-recipe state, owned by the recipe's worker.
#[derive(Default)]
pub struct RecipeData {
    pub script: Option<Box<dyn RecipeScript>>,
    pub declarations: Option<Declarations>,
    pub script_hash: Option<blake3::Hash>,
    pub source_hash: Option<blake3::Hash>,
    /// Declared dependency edges, in declaration order. All edges are
    /// `Resolved` once the check phase finishes weak/bare resolution.
    pub edges: Vec<DepEdge>,
    /// Product-name -> provider mapping, filled during resolution.
    pub product_deps: BTreeMap<SmolStr, ProductDep>,
    pub fingerprint: Option<Fingerprint>,
    pub cache_lock: Option<ScopedLock>,
    /// Product name -> path relative to `install/`, resolved at deploy.
    pub products: BTreeMap<SmolStr, String>,
    pub asset_path: Option<Utf8PathBuf>,
    pub result_hash: Option<String>,
}

/// A dependency edge of a recipe.
///
/// Edges reference other recipes by key only: the engine owns every recipe
/// object and back-references stay non-owning.
#[derive(Clone, Debug)]
pub enum DepEdge {
    Resolved(ResolvedDep),
    /// Weak edge awaiting resolution; binds to a graph match or falls back
    /// to the embedded spec.
    PendingWeak {
        query: SmolStr,
        fallback: RecipeSpec,
        needed_by: Phase,
        product: Option<SmolStr>,
    },
    /// Query-only edge awaiting resolution; an empty match set is an error.
    PendingBare {
        query: SmolStr,
        needed_by: Phase,
        product: Option<SmolStr>,
    },
}

impl DepEdge {
    pub fn query(&self) -> &SmolStr {
        match self {
            DepEdge::Resolved(dep) => &dep.query,
            DepEdge::PendingWeak { query, .. } => query,
            DepEdge::PendingBare { query, .. } => query,
        }
    }

    pub fn needed_by(&self) -> Phase {
        match self {
            DepEdge::Resolved(dep) => dep.needed_by,
            DepEdge::PendingWeak { needed_by, .. } => *needed_by,
            DepEdge::PendingBare { needed_by, .. } => *needed_by,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedDep {
    pub query: SmolStr,
    pub key: RecipeKey,
    pub needed_by: Phase,
    pub product: Option<SmolStr>,
}

/// One entry of a recipe's product-dependency map.
#[derive(Clone, Debug)]
pub struct ProductDep {
    pub provider: RecipeKey,
    pub needed_by: Phase,
    /// The query the dependency was declared with; the provider identity is
    /// re-checked against it at access time.
    pub constraint: SmolStr,
}

impl Recipe {
    pub(crate) fn new(key: RecipeKey, spec: RecipeSpec) -> Self {
        let identity_hash = key.identity_hash();
        Self {
            key,
            spec,
            identity_hash,
            data: Mutex::new(RecipeData::default()),
        }
    }

    pub fn key(&self) -> &RecipeKey {
        &self.key
    }

    pub fn spec(&self) -> &RecipeSpec {
        &self.spec
    }

    pub fn source(&self) -> &ScriptSource {
        &self.spec.source
    }

    /// BLAKE3 of the canonical key; the identity input of the fingerprint.
    pub fn identity_hash(&self) -> blake3::Hash {
        self.identity_hash
    }

    pub(crate) fn data(&self) -> MutexGuard<'_, RecipeData> {
        // A panicking hook must not wedge lock release or failure handling,
        // so recover the data even when the mutex is poisoned.
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the resolved dependency edges.
    ///
    /// Pending edges are omitted; after the check phase there are none.
    pub fn resolved_edges(&self) -> Vec<ResolvedDep> {
        self.data()
            .edges
            .iter()
            .filter_map(|edge| match edge {
                DepEdge::Resolved(dep) => Some(dep.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.data().fingerprint
    }

    /// Final asset path; `None` until completion.
    pub fn asset_path(&self) -> Option<Utf8PathBuf> {
        self.data().asset_path.clone()
    }

    /// Final result hash; `None` until completion.
    pub fn result_hash(&self) -> Option<String> {
        self.data().result_hash.clone()
    }

    /// Resolved product map; empty until deploy.
    pub fn products(&self) -> BTreeMap<SmolStr, String> {
        self.data().products.clone()
    }
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Recipe({})", self.key)
    }
}
