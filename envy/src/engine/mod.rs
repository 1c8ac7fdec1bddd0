//! The recipe execution engine.
//!
//! A memoizing registry of recipe instances, each driven through the eight
//! lifecycle phases by its own worker thread. The engine owns every recipe
//! object; recipes reference each other by key only.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use itertools::Itertools;
use smol_str::SmolStr;
use tracing::{debug, info};

use crate::cache::Cache;
use crate::core::errors::EnvyError;
use crate::core::key::RecipeKey;
use crate::core::phase::Phase;
use crate::core::recipe::Recipe;
use crate::core::spec::RecipeSpec;
use crate::runner::{ArchiveExtractor, Extractor, Fetcher, FileFetcher, ShellRunner, SystemShell};
use crate::script::ScriptHost;
use crate::shutdown;

mod coordinator;
mod phases;
mod resolve;

use coordinator::{Coordination, ResolutionBarrier, worker_main};

/// Published outputs of one completed recipe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildOutput {
    pub asset_path: Utf8PathBuf,
    pub result_hash: String,
}

/// One recorded phase failure, in emission order.
#[derive(Debug)]
pub struct Failure {
    pub key: RecipeKey,
    pub phase: Phase,
    pub error: anyhow::Error,
}

pub struct EngineBuilder {
    cache_root: Utf8PathBuf,
    host: Box<dyn ScriptHost>,
    fetcher: Box<dyn Fetcher>,
    extractor: Box<dyn Extractor>,
    shell: Box<dyn ShellRunner>,
}

impl EngineBuilder {
    /// Overrides the cache root; defaults to `./.envy` in the invoking
    /// project.
    pub fn cache_root(mut self, cache_root: impl Into<Utf8PathBuf>) -> Self {
        self.cache_root = cache_root.into();
        self
    }

    pub fn fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Box::new(fetcher);
        self
    }

    pub fn extractor(mut self, extractor: impl Extractor + 'static) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    pub fn shell(mut self, shell: impl ShellRunner + 'static) -> Self {
        self.shell = Box::new(shell);
        self
    }

    pub fn build(self) -> Engine {
        let scripts_dir = self.cache_root.join("scripts");
        Engine {
            inner: Arc::new_cyclic(|self_ref| EngineInner {
                self_ref: self_ref.clone(),
                cache: Cache::new(self.cache_root),
                scripts_dir,
                host: self.host,
                fetcher: self.fetcher,
                extractor: self.extractor,
                shell: self.shell,
                registry: Mutex::new(Registry::default()),
                barrier: ResolutionBarrier::new(),
                failures: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

/// Handle to one engine instance.
///
/// Dropping the engine tears it down: workers are asked to stop and joined.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(script_host: impl ScriptHost + 'static) -> EngineBuilder {
        EngineBuilder {
            cache_root: Utf8PathBuf::from(crate::DEFAULT_CACHE_DIR_NAME),
            host: Box::new(script_host),
            fetcher: Box::new(FileFetcher),
            extractor: Box::new(ArchiveExtractor),
            shell: Box::new(SystemShell),
        }
    }

    /// Memoizing recipe factory: one recipe object per canonical key.
    ///
    /// On first sight of a key this registers the recipe, its coordination
    /// record and alias, and spawns its worker (initially idle at target
    /// phase −1).
    pub fn ensure_recipe(&self, spec: &RecipeSpec) -> Result<Arc<Recipe>> {
        self.inner.ensure_recipe(spec)
    }

    pub fn find_exact(&self, key: &RecipeKey) -> Option<Arc<Recipe>> {
        self.inner.recipe(key)
    }

    /// Alias table first, then a scan with the query-matching rules.
    /// Results are unordered.
    pub fn find_matches(&self, query: &str) -> Vec<Arc<Recipe>> {
        self.inner.find_matches(query)
    }

    pub fn register_alias(&self, alias: impl Into<SmolStr>, key: RecipeKey) -> Result<()> {
        self.inner.register_alias(alias.into(), key)
    }

    /// Extends the recipe's target phase to at least `phase` and blocks until
    /// its `current_phase` reaches it, or surfaces `DependencyFailed`.
    pub fn ensure_recipe_at_phase(&self, key: &RecipeKey, phase: Phase) -> Result<()> {
        self.inner.ensure_recipe_at_phase(key, phase)
    }

    /// Ensures every root, drives the graph through recipe-load, and waits on
    /// the resolution barrier. Afterwards the static graph is frozen.
    pub fn resolve_graph(&self, roots: &[RecipeSpec]) -> Result<Vec<Arc<Recipe>>> {
        self.inner.resolve_graph(roots)
    }

    /// Resolves, drives every known recipe to completion, and returns the
    /// published outputs keyed by canonical key.
    pub fn run_full(&self, roots: &[RecipeSpec]) -> Result<BTreeMap<RecipeKey, BuildOutput>> {
        self.inner.run_full(roots)
    }

    /// Failures recorded so far, drained in emission order.
    pub fn take_failures(&self) -> Vec<Failure> {
        self.inner.take_failures()
    }

    /// Current phase index of a recipe: −1 before recipe-load, 7 when
    /// completed. For progress reporting.
    pub fn current_phase(&self, key: &RecipeKey) -> Option<i32> {
        self.inner.current_phase(key)
    }

    /// Stops all workers and joins them. Idempotent; also runs on drop.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.close();
    }
}

#[derive(Default)]
struct Registry {
    recipes: HashMap<RecipeKey, Arc<Recipe>>,
    coords: HashMap<RecipeKey, Arc<Coordination>>,
    aliases: HashMap<SmolStr, RecipeKey>,
    workers: Vec<JoinHandle<()>>,
}

/// Shared engine state; worker threads hold an `Arc` of this.
pub(crate) struct EngineInner {
    /// Back-reference to the owning `Arc`, for handing clones to spawned
    /// workers.
    self_ref: Weak<EngineInner>,
    cache: Cache,
    scripts_dir: Utf8PathBuf,
    host: Box<dyn ScriptHost>,
    fetcher: Box<dyn Fetcher>,
    extractor: Box<dyn Extractor>,
    shell: Box<dyn ShellRunner>,
    registry: Mutex<Registry>,
    barrier: ResolutionBarrier,
    failures: Mutex<Vec<Failure>>,
    closed: AtomicBool,
}

impl EngineInner {
    pub(crate) fn cache(&self) -> &Cache {
        &self.cache
    }

    pub(crate) fn scripts_dir(&self) -> &Utf8PathBuf {
        &self.scripts_dir
    }

    pub(crate) fn host(&self) -> &dyn ScriptHost {
        self.host.as_ref()
    }

    pub(crate) fn fetcher(&self) -> &dyn Fetcher {
        self.fetcher.as_ref()
    }

    pub(crate) fn extractor(&self) -> &dyn Extractor {
        self.extractor.as_ref()
    }

    pub(crate) fn shell(&self) -> &dyn ShellRunner {
        self.shell.as_ref()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("engine registry mutex poisoned")
    }

    pub(crate) fn ensure_recipe(&self, spec: &RecipeSpec) -> Result<Arc<Recipe>> {
        if self.is_closed() {
            return Err(EnvyError::Cancelled.into());
        }
        let key = spec.key()?;

        let (recipe, coord) = {
            let mut registry = self.registry();
            if let Some(existing) = registry.recipes.get(&key) {
                if existing.spec() != spec {
                    debug!(recipe = %key, "spec differs from memoized instance, reusing existing");
                }
                return Ok(existing.clone());
            }
            if let Some(alias) = &spec.alias {
                if let Some(existing) = registry.aliases.get(alias) {
                    if *existing != key {
                        return Err(EnvyError::DuplicateAlias {
                            alias: alias.to_string(),
                            existing: existing.to_string(),
                            incoming: key.to_string(),
                        }
                        .into());
                    }
                }
            }

            let recipe = Arc::new(Recipe::new(key.clone(), spec.clone()));
            let coord = Arc::new(Coordination::new());
            registry.recipes.insert(key.clone(), recipe.clone());
            registry.coords.insert(key.clone(), coord.clone());
            if let Some(alias) = &spec.alias {
                registry.aliases.insert(alias.clone(), key.clone());
            }
            self.barrier.register();
            (recipe, coord)
        };

        let spawned = thread::Builder::new()
            .name(format!("envy:{}", key.name()))
            .spawn({
                let engine = self
                    .self_ref
                    .upgrade()
                    .expect("engine torn down while ensuring a recipe");
                let recipe = recipe.clone();
                let coord = coord.clone();
                move || worker_main(engine, recipe, coord)
            })
            .context("failed to spawn recipe worker");
        match spawned {
            Ok(handle) => self.registry().workers.push(handle),
            Err(err) => {
                coord.fail();
                self.barrier_arrive(&coord);
                return Err(err);
            }
        }

        info!(recipe = %key, "registered recipe");
        Ok(recipe)
    }

    pub(crate) fn recipe(&self, key: &RecipeKey) -> Option<Arc<Recipe>> {
        self.registry().recipes.get(key).cloned()
    }

    fn coordination(&self, key: &RecipeKey) -> Option<Arc<Coordination>> {
        self.registry().coords.get(key).cloned()
    }

    pub(crate) fn find_matches(&self, query: &str) -> Vec<Arc<Recipe>> {
        let registry = self.registry();
        if let Some(key) = registry.aliases.get(query) {
            return registry.recipes.get(key).cloned().into_iter().collect();
        }
        registry
            .recipes
            .values()
            .filter(|recipe| recipe.key().matches_query(query))
            .cloned()
            .collect()
    }

    pub(crate) fn register_alias(&self, alias: SmolStr, key: RecipeKey) -> Result<()> {
        let mut registry = self.registry();
        match registry.aliases.get(&alias) {
            Some(existing) if *existing == key => Ok(()),
            Some(existing) => Err(EnvyError::DuplicateAlias {
                alias: alias.to_string(),
                existing: existing.to_string(),
                incoming: key.to_string(),
            }
            .into()),
            None => {
                registry.aliases.insert(alias, key);
                Ok(())
            }
        }
    }

    pub(crate) fn extend_target(&self, key: &RecipeKey, phase: Phase) {
        if let Some(coord) = self.coordination(key) {
            coord.extend_target(phase.index());
        }
    }

    pub(crate) fn current_phase(&self, key: &RecipeKey) -> Option<i32> {
        self.coordination(key).map(|coord| coord.current_phase())
    }

    pub(crate) fn ensure_recipe_at_phase(&self, key: &RecipeKey, phase: Phase) -> Result<()> {
        let coord = self
            .coordination(key)
            .ok_or_else(|| anyhow::anyhow!("no recipe registered for key `{key}`"))?;
        coord.extend_target(phase.index());
        loop {
            if coord.current_phase() >= phase.index() {
                return Ok(());
            }
            if coord.is_failed() {
                return Err(EnvyError::DependencyFailed {
                    key: key.to_string(),
                }
                .into());
            }
            shutdown::check()?;
            if self.is_closed() {
                return Err(EnvyError::Cancelled.into());
            }
            coord.wait_tick();
        }
    }

    pub(crate) fn resolve_graph(&self, roots: &[RecipeSpec]) -> Result<Vec<Arc<Recipe>>> {
        let mut ensured = Vec::with_capacity(roots.len());
        for spec in roots {
            ensured.push(self.ensure_recipe(spec)?);
        }
        for recipe in &ensured {
            self.extend_target(recipe.key(), Phase::RecipeLoad);
        }
        self.barrier_wait()?;
        Ok(ensured)
    }

    pub(crate) fn run_full(&self, roots: &[RecipeSpec]) -> Result<BTreeMap<RecipeKey, BuildOutput>> {
        self.resolve_graph(roots)?;

        // Drive everything to completion. Weak fallbacks may register new
        // recipes mid-flight, so iterate until the key set is stable.
        let mut processed = BTreeSet::new();
        loop {
            let keys: Vec<RecipeKey> = self.registry().recipes.keys().cloned().collect();
            let fresh: Vec<RecipeKey> = keys
                .into_iter()
                .filter(|key| !processed.contains(key))
                .collect();
            if fresh.is_empty() {
                break;
            }
            for key in &fresh {
                self.extend_target(key, Phase::Completion);
            }
            for key in &fresh {
                self.await_settled(key)?;
                processed.insert(key.clone());
            }
        }

        let failures = self.take_failures();
        if !failures.is_empty() {
            return Err(compose_failure_report(failures));
        }

        let recipes: Vec<Arc<Recipe>> = self.registry().recipes.values().cloned().collect();
        let mut outputs = BTreeMap::new();
        for recipe in recipes {
            let asset_path = recipe.asset_path().unwrap_or_default();
            let result_hash = recipe
                .result_hash()
                .expect("completed recipe must publish a result hash");
            outputs.insert(
                recipe.key().clone(),
                BuildOutput {
                    asset_path,
                    result_hash,
                },
            );
        }
        Ok(outputs)
    }

    /// Waits until the recipe has completed or failed.
    fn await_settled(&self, key: &RecipeKey) -> Result<()> {
        let coord = self
            .coordination(key)
            .ok_or_else(|| anyhow::anyhow!("no recipe registered for key `{key}`"))?;
        loop {
            if coord.current_phase() >= Phase::Completion.index() || coord.is_failed() {
                return Ok(());
            }
            shutdown::check()?;
            if self.is_closed() {
                return Err(EnvyError::Cancelled.into());
            }
            coord.wait_tick();
        }
    }

    pub(crate) fn record_failure(&self, key: RecipeKey, phase: Phase, error: anyhow::Error) {
        self.failures
            .lock()
            .expect("engine failure log mutex poisoned")
            .push(Failure { key, phase, error });
    }

    pub(crate) fn take_failures(&self) -> Vec<Failure> {
        self.failures
            .lock()
            .expect("engine failure log mutex poisoned")
            .drain(..)
            .collect()
    }

    pub(crate) fn barrier_arrive(&self, coord: &Coordination) {
        if coord.barrier_check_in() {
            self.barrier.arrive();
        }
    }

    /// The resolution barrier: returns once every known recipe has completed
    /// recipe-load.
    pub(crate) fn barrier_wait(&self) -> Result<()> {
        self.barrier.wait(&self.closed)
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<JoinHandle<()>> = self.registry().workers.drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
        debug!("engine closed");
    }
}

fn compose_failure_report(mut failures: Vec<Failure>) -> anyhow::Error {
    let first = failures.remove(0);
    let mut summary = format!(
        "recipe `{}` failed during the {} phase",
        first.key, first.phase
    );
    if !failures.is_empty() {
        summary.push_str("; subsequent failures: ");
        summary.push_str(
            &failures
                .iter()
                .map(|f| format!("`{}` at {}: {:#}", f.key, f.phase, f.error))
                .join(", "),
        );
    }
    first.error.context(summary)
}
