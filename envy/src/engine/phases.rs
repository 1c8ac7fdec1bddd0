//! The eight phase bodies.
//!
//! Each body receives the engine and the recipe it owns; it mutates only
//! that recipe's data block plus the engine's shared maps through their
//! methods. Failures propagate to the worker loop, which marks the recipe
//! failed and wakes every waiter.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use camino::Utf8PathBuf;
use tracing::{debug, info};

use crate::core::checksum::Checksum;
use crate::core::errors::EnvyError;
use crate::core::phase::Phase;
use crate::core::recipe::Recipe;
use crate::core::spec::ScriptSource;
use crate::engine::{EngineInner, resolve};
use crate::fingerprint::{self, FingerprintInputs};
use crate::internal::fsx;
use crate::runner::{FetchOrigin, FetchRequest};
use crate::script::bindings::ScriptContext;
use crate::script::{CheckOutcome, Declarations, Hook, ProductsDecl, RecipeScript, SourceOrigin};
use crate::shutdown;
use crate::{PROGRAMMATIC_RESULT_HASH, RECIPE_FILE_NAME};

/// How the worker should advance `current_phase` after a successful body.
pub(crate) enum PhaseOutcome {
    /// Normal single-step advance.
    Advance,
    /// Jump so that `skip_to` is the next phase executed.
    SkipTo(Phase),
}

pub(crate) fn run_phase(
    engine: &EngineInner,
    recipe: &Arc<Recipe>,
    phase: Phase,
) -> Result<PhaseOutcome> {
    shutdown::check()?;
    debug!(recipe = %recipe.key(), phase = %phase, "entering phase");
    match phase {
        Phase::RecipeLoad => recipe_load(engine, recipe),
        Phase::Check => check(engine, recipe),
        Phase::Fetch => fetch(engine, recipe),
        Phase::Stage => stage(engine, recipe),
        Phase::Build => build(engine, recipe),
        Phase::Install => install(engine, recipe),
        Phase::Deploy => deploy(engine, recipe),
        Phase::Completion => completion(engine, recipe),
    }
}

/// Phase 0: load and compile the script, read declarations, validate
/// options, and record dependency edges in declaration order. Strong
/// dependencies are instantiated here; weak and bare edges stay pending
/// until the check phase.
#[tracing::instrument(level = "debug", skip_all, fields(recipe = %recipe.key()))]
fn recipe_load(engine: &EngineInner, recipe: &Arc<Recipe>) -> Result<PhaseOutcome> {
    let key = recipe.key().clone();
    let load_failed = |reason: String| EnvyError::RecipeLoadFailed {
        key: key.to_string(),
        reason,
    };

    let (bytes, origin, source_hash) = load_script_source(engine, recipe)?;
    let text = String::from_utf8(bytes.clone())
        .map_err(|_| load_failed("script is not valid UTF-8".into()))?;
    let script_hash = fingerprint::script_hash(&bytes);

    let script = engine
        .host()
        .load(&key, &text, &origin)
        .map_err(|err| load_failed(format!("{err:#}")))?;
    let declarations = script
        .declarations()
        .map_err(|err| load_failed(format!("{err:#}")))?;

    if declarations.identity != key.identity() {
        return Err(load_failed(format!(
            "script declares identity `{}`, requested as `{}`",
            declarations.identity,
            key.identity()
        ))
        .into());
    }
    if let Some(alias) = &declarations.alias {
        engine.register_alias(alias.clone(), key.clone())?;
    }

    script.validate(&recipe.spec().options).map_err(|err| {
        EnvyError::RecipeValidation {
            key: key.to_string(),
            reason: format!("{err:#}"),
        }
    })?;

    // Spec-declared dependencies first, then script-declared, both in
    // declaration order.
    let spec = recipe.spec().clone();
    let mut edges = Vec::new();
    for dep in spec
        .dependencies
        .iter()
        .chain(declarations.dependencies.iter())
    {
        if !dep.needed_by.is_valid_needed_by() {
            return Err(load_failed(format!(
                "dependency `{}` has invalid needed_by phase `{}`",
                dep.query, dep.needed_by
            ))
            .into());
        }
        if dep.is_strong() {
            let child_spec = dep.spec.as_ref().expect("strong dependency carries a spec");
            let child = engine.ensure_recipe(child_spec)?;
            engine.extend_target(child.key(), Phase::RecipeLoad);
            edges.push(crate::core::recipe::DepEdge::Resolved(
                crate::core::recipe::ResolvedDep {
                    query: dep.query.clone(),
                    key: child.key().clone(),
                    needed_by: dep.needed_by,
                    product: dep.product.clone(),
                },
            ));
        } else if let Some(fallback) = &dep.spec {
            edges.push(crate::core::recipe::DepEdge::PendingWeak {
                query: dep.query.clone(),
                fallback: fallback.clone(),
                needed_by: dep.needed_by,
                product: dep.product.clone(),
            });
        } else {
            edges.push(crate::core::recipe::DepEdge::PendingBare {
                query: dep.query.clone(),
                needed_by: dep.needed_by,
                product: dep.product.clone(),
            });
        }
    }

    let mut data = recipe.data();
    data.script = Some(script);
    data.declarations = Some(declarations);
    data.script_hash = Some(script_hash);
    data.source_hash = Some(source_hash);
    data.edges = edges;
    Ok(PhaseOutcome::Advance)
}

/// Phase 1: barrier, resolution, dependency waits, fingerprint, cache lock,
/// and the short-circuit paths.
#[tracing::instrument(level = "debug", skip_all, fields(recipe = %recipe.key()))]
fn check(engine: &EngineInner, recipe: &Arc<Recipe>) -> Result<PhaseOutcome> {
    // After this every recipe has completed recipe-load and the static graph
    // is known.
    engine.barrier_wait()?;

    resolve::resolve_edges(engine, recipe)?;

    // Dependency waits, in declaration order. Every edge is awaited to the
    // child's check so its fingerprint is final; check-boundary edges are
    // awaited all the way to completion.
    let edges = recipe.resolved_edges();
    for edge in &edges {
        let wait_until = if edge.needed_by == Phase::Check {
            Phase::Completion
        } else {
            Phase::Check
        };
        engine.ensure_recipe_at_phase(&edge.key, wait_until)?;
    }

    let deps = edges
        .iter()
        .map(|edge| {
            let child = engine
                .recipe(&edge.key)
                .ok_or_else(|| anyhow!("resolved dependency `{}` disappeared", edge.key))?;
            let fp = child.fingerprint().ok_or_else(|| {
                anyhow!("dependency `{}` has no fingerprint after its check phase", edge.key)
            })?;
            Ok((edge.query.to_string(), fp))
        })
        .collect::<Result<Vec<_>>>()?;

    let (script_hash, source_hash) = {
        let data = recipe.data();
        (
            data.script_hash.expect("script hash recorded during recipe-load"),
            data.source_hash.expect("source hash recorded during recipe-load"),
        )
    };
    let fp = fingerprint::compute(&FingerprintInputs {
        identity_hash: recipe.identity_hash(),
        deps: &deps,
        script_hash,
        source_hash,
    });
    recipe.data().fingerprint = Some(fp);
    debug!(recipe = %recipe.key(), fingerprint = %fp, "fingerprinted");

    let lock = engine.cache().acquire(fp)?;
    recipe.data().cache_lock = Some(lock);

    if engine.cache().is_complete(fp) {
        info!(recipe = %recipe.key(), fingerprint = %fp, "cache hit");
        publish_outputs(engine, recipe);
        return Ok(PhaseOutcome::SkipTo(Phase::Completion));
    }

    let has_check = recipe
        .data()
        .script
        .as_ref()
        .is_some_and(|s| s.has_hook(Hook::Check));
    if has_check {
        let outcome = with_script(engine, recipe, Phase::Check, |script, ctx| script.check(ctx))?;
        if outcome == CheckOutcome::Satisfied {
            info!(recipe = %recipe.key(), "check hook reports already satisfied");
            engine.cache().ensure_dirs(fp)?;
            engine.cache().mark_complete(fp)?;
            publish_outputs(engine, recipe);
            return Ok(PhaseOutcome::SkipTo(Phase::Completion));
        }
    }

    Ok(PhaseOutcome::Advance)
}

/// Phase 2: materialize every declared source under `fetch/`, or run the
/// fetch hook when one is declared.
#[tracing::instrument(level = "debug", skip_all, fields(recipe = %recipe.key()))]
fn fetch(engine: &EngineInner, recipe: &Arc<Recipe>) -> Result<PhaseOutcome> {
    wait_deps(engine, recipe, Phase::Fetch)?;

    let fp = current_fingerprint(recipe)?;
    engine.cache().ensure_dirs(fp)?;
    let paths = engine.cache().paths(fp);

    if has_hook(recipe, Hook::Fetch) {
        return with_script(engine, recipe, Phase::Fetch, |script, ctx| {
            script.call(Hook::Fetch, ctx)
        })
        .map(|()| PhaseOutcome::Advance);
    }

    let declarations = declarations(recipe)?;
    for source in &declarations.sources {
        shutdown::check()?;
        let tmp_dest = paths.tmp.join(source.filename.as_str());
        let final_dest = paths.fetch.join(source.filename.as_str());
        if final_dest.exists() {
            // Verified artifact retained from an earlier partial run.
            debug!(recipe = %recipe.key(), artifact = %final_dest, "fetch artifact already present");
            continue;
        }
        match &source.origin {
            SourceOrigin::Callback => {
                with_script(engine, recipe, Phase::Fetch, |script, ctx| {
                    script.fetch_source(&source.filename, ctx)
                })?;
            }
            SourceOrigin::Archive { url, checksum } => {
                let outcome = engine.fetcher().fetch(&FetchRequest {
                    origin: FetchOrigin::Url(url.clone()),
                    dest: tmp_dest.clone(),
                })?;
                if let Some(expected) = checksum {
                    let actual = match outcome.checksum {
                        Some(actual) => actual,
                        None => Checksum::compute(fsx::read(&tmp_dest)?),
                    };
                    verify_digest(url.as_str(), expected, &actual)?;
                }
                fsx::rename(&tmp_dest, &final_dest)?;
            }
            SourceOrigin::Git { url, reference } => {
                engine.fetcher().fetch(&FetchRequest {
                    origin: FetchOrigin::Git {
                        url: url.clone(),
                        reference: reference.clone(),
                    },
                    dest: tmp_dest.clone(),
                })?;
                fsx::rename(&tmp_dest, &final_dest)?;
            }
        }
        info!(recipe = %recipe.key(), artifact = %final_dest, "fetched");
    }
    Ok(PhaseOutcome::Advance)
}

/// Phase 3: reset `stage/` and extract fetched archives into it, honoring
/// the declared strip count; a stage hook replaces the default extraction.
#[tracing::instrument(level = "debug", skip_all, fields(recipe = %recipe.key()))]
fn stage(engine: &EngineInner, recipe: &Arc<Recipe>) -> Result<PhaseOutcome> {
    wait_deps(engine, recipe, Phase::Stage)?;

    let fp = current_fingerprint(recipe)?;
    let paths = engine.cache().paths(fp);
    fsx::recreate_dir(&paths.stage)?;

    if has_hook(recipe, Hook::Stage) {
        return with_script(engine, recipe, Phase::Stage, |script, ctx| {
            script.call(Hook::Stage, ctx)
        })
        .map(|()| PhaseOutcome::Advance);
    }

    let strip = declarations(recipe)?.strip;
    for entry in paths
        .fetch
        .read_dir_utf8()
        .with_context(|| format!("failed to read `{}`", paths.fetch))?
    {
        let entry = entry.with_context(|| format!("failed to read `{}`", paths.fetch))?;
        shutdown::check()?;
        let path = entry.path();
        if path.is_file() && engine.extractor().recognizes(path) {
            engine.extractor().extract(path, &paths.stage, strip)?;
        } else if path.is_file() {
            fsx::copy(path, paths.stage.join(entry.file_name()))?;
        } else {
            // Git checkouts land as directories under fetch/.
            fsx::copy_recursive(path, paths.stage.join(entry.file_name()))?;
        }
    }
    Ok(PhaseOutcome::Advance)
}

/// Phase 4: the build hook, when declared.
#[tracing::instrument(level = "debug", skip_all, fields(recipe = %recipe.key()))]
fn build(engine: &EngineInner, recipe: &Arc<Recipe>) -> Result<PhaseOutcome> {
    wait_deps(engine, recipe, Phase::Build)?;

    if has_hook(recipe, Hook::Build) {
        with_script(engine, recipe, Phase::Build, |script, ctx| {
            script.call(Hook::Build, ctx)
        })
        .with_context(|| EnvyError::BuildFailed {
            key: recipe.key().to_string(),
            reason: "build hook failed".to_string(),
        })?;
    }
    Ok(PhaseOutcome::Advance)
}

/// Phase 5: the install hook, or the default move of `stage/` into
/// `install/`; marks the cache entry complete on success.
#[tracing::instrument(level = "debug", skip_all, fields(recipe = %recipe.key()))]
fn install(engine: &EngineInner, recipe: &Arc<Recipe>) -> Result<PhaseOutcome> {
    wait_deps(engine, recipe, Phase::Install)?;

    let fp = current_fingerprint(recipe)?;
    let paths = engine.cache().paths(fp);
    // A rerun after a mid-install failure must not merge into a stale tree.
    fsx::recreate_dir(&paths.install)?;

    let result = if has_hook(recipe, Hook::Install) {
        with_script(engine, recipe, Phase::Install, |script, ctx| {
            script.call(Hook::Install, ctx)
        })
    } else {
        fsx::move_dir_contents(&paths.stage, &paths.install)
    };
    result.with_context(|| EnvyError::InstallFailed {
        key: recipe.key().to_string(),
        reason: "install step failed".to_string(),
    })?;

    engine.cache().mark_complete(fp)?;
    info!(recipe = %recipe.key(), install = %paths.install, "installed");
    Ok(PhaseOutcome::Advance)
}

/// Phase 6: resolve the products declaration and validate every product
/// path exists under `install/`.
#[tracing::instrument(level = "debug", skip_all, fields(recipe = %recipe.key()))]
fn deploy(engine: &EngineInner, recipe: &Arc<Recipe>) -> Result<PhaseOutcome> {
    resolve_products(engine, recipe)?;
    Ok(PhaseOutcome::Advance)
}

/// Phase 7: publish asset path and result hash, resolve products if the
/// cached short-circuit skipped deploy, purge transients, release the lock.
#[tracing::instrument(level = "debug", skip_all, fields(recipe = %recipe.key()))]
fn completion(engine: &EngineInner, recipe: &Arc<Recipe>) -> Result<PhaseOutcome> {
    match recipe.fingerprint() {
        Some(fp) => {
            publish_outputs(engine, recipe);
            let needs_products = {
                let data = recipe.data();
                data.products.is_empty()
                    && data
                        .declarations
                        .as_ref()
                        .is_some_and(|d| !d.products.is_absent())
            };
            if needs_products {
                resolve_products(engine, recipe)?;
            }
            engine.cache().purge_tmp(fp)?;
            engine.cache().purge_stage(fp)?;
        }
        None => {
            // No cache fingerprint: a user-managed asset. The surrounding
            // policy is deliberately unspecified; publish the sentinel and
            // let the caller decide what to make of it.
            recipe.data().result_hash = Some(PROGRAMMATIC_RESULT_HASH.to_string());
        }
    }
    recipe.data().cache_lock.take();
    info!(recipe = %recipe.key(), "completed");
    Ok(PhaseOutcome::Advance)
}

/// Records `asset_path` and `result_hash` from the current fingerprint.
fn publish_outputs(engine: &EngineInner, recipe: &Recipe) {
    let fp = recipe
        .data()
        .fingerprint
        .expect("fingerprint required to publish outputs");
    let paths = engine.cache().paths(fp);
    let mut data = recipe.data();
    data.asset_path = Some(paths.install.clone());
    data.result_hash = Some(fp.to_hex());
}

/// Awaits completion of every dependency whose `needed_by` names `phase`,
/// in declaration order.
fn wait_deps(engine: &EngineInner, recipe: &Arc<Recipe>, phase: Phase) -> Result<()> {
    for edge in recipe.resolved_edges() {
        if edge.needed_by == phase {
            engine.ensure_recipe_at_phase(&edge.key, Phase::Completion)?;
        }
    }
    Ok(())
}

fn resolve_products(engine: &EngineInner, recipe: &Arc<Recipe>) -> Result<()> {
    let declarations = declarations(recipe)?;
    let table = match &declarations.products {
        ProductsDecl::Absent => return Ok(()),
        ProductsDecl::Table(table) => table.clone(),
        ProductsDecl::Callback => {
            with_script(engine, recipe, Phase::Deploy, |script, ctx| script.products(ctx))?
        }
    };

    let fp = current_fingerprint(recipe)?;
    let install = engine.cache().paths(fp).install;
    for (name, rel) in &table {
        if !install.join(rel.as_str()).exists() {
            return Err(EnvyError::ProductNotFound {
                consumer: recipe.key().to_string(),
                product: name.to_string(),
                reason: format!("`{rel}` does not exist under install/"),
            }
            .into());
        }
    }
    recipe.data().products = table;
    Ok(())
}

/// Runs `f` with the recipe's script handle and a phase-scoped binding
/// context. The handle is taken out of the data block for the duration so
/// bindings can re-enter the recipe's data without deadlocking.
fn with_script<T>(
    engine: &EngineInner,
    recipe: &Arc<Recipe>,
    phase: Phase,
    f: impl FnOnce(&dyn RecipeScript, &mut ScriptContext<'_>) -> Result<T>,
) -> Result<T> {
    let fp = current_fingerprint(recipe)?;
    let paths = engine.cache().paths(fp);
    let script = recipe
        .data()
        .script
        .take()
        .ok_or_else(|| anyhow!("recipe `{}` has no loaded script", recipe.key()))?;
    let mut ctx = ScriptContext::new(engine, recipe, phase, paths);
    let result = f(script.as_ref(), &mut ctx);
    recipe.data().script = Some(script);
    result
}

fn has_hook(recipe: &Recipe, hook: Hook) -> bool {
    recipe.data().script.as_ref().is_some_and(|s| s.has_hook(hook))
}

fn declarations(recipe: &Recipe) -> Result<Declarations> {
    recipe
        .data()
        .declarations
        .clone()
        .ok_or_else(|| anyhow!("recipe `{}` has no declarations", recipe.key()))
}

fn current_fingerprint(recipe: &Recipe) -> Result<crate::fingerprint::Fingerprint> {
    recipe
        .fingerprint()
        .ok_or_else(|| anyhow!("recipe `{}` has no fingerprint yet", recipe.key()))
}

fn verify_digest(source: &str, expected: &Checksum, actual: &Checksum) -> Result<()> {
    if actual != expected {
        return Err(EnvyError::DigestMismatch {
            source_id: source.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Materializes the recipe script named by the spec's source descriptor.
///
/// Returns the script bytes, a display origin for diagnostics, and the
/// source-descriptor hash that feeds the fingerprint.
fn load_script_source(
    engine: &EngineInner,
    recipe: &Arc<Recipe>,
) -> Result<(Vec<u8>, String, blake3::Hash)> {
    let source = recipe.source().clone();
    match &source {
        ScriptSource::Path { path } => {
            let abs = std::fs::canonicalize(path.as_std_path())
                .with_context(|| format!("failed to resolve script path `{path}`"))?;
            let abs = Utf8PathBuf::from_path_buf(abs)
                .map_err(|p| anyhow!("script path `{}` is not UTF-8 encoded", p.display()))?;
            let mtime = abs
                .as_std_path()
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let bytes = fsx::read(&abs)?;
            let hash = fingerprint::source_hash(&source, Some((abs.as_path(), mtime)));
            Ok((bytes, abs.to_string(), hash))
        }
        ScriptSource::Inline { script } => {
            let hash = fingerprint::source_hash(&source, None);
            Ok((script.clone().into_bytes(), "<inline>".to_string(), hash))
        }
        ScriptSource::Url { url, checksum } => {
            let name = blake3::hash(url.as_str().as_bytes()).to_hex().to_string();
            let dest = engine.scripts_dir().join(name);
            if !dest.exists() {
                let outcome = engine.fetcher().fetch(&FetchRequest {
                    origin: FetchOrigin::Url(url.clone()),
                    dest: dest.clone(),
                })?;
                if let Some(expected) = checksum {
                    let actual = match outcome.checksum {
                        Some(actual) => actual,
                        None => Checksum::compute(fsx::read(&dest)?),
                    };
                    verify_digest(url.as_str(), expected, &actual)?;
                }
            }
            let bytes = fsx::read(&dest)?;
            let hash = fingerprint::source_hash(&source, None);
            Ok((bytes, url.to_string(), hash))
        }
        ScriptSource::Git { url, reference } => {
            let name = blake3::hash(format!("{url}#{reference}").as_bytes())
                .to_hex()
                .to_string();
            let checkout = engine.scripts_dir().join(name);
            if !checkout.exists() {
                engine.fetcher().fetch(&FetchRequest {
                    origin: FetchOrigin::Git {
                        url: url.clone(),
                        reference: reference.clone(),
                    },
                    dest: checkout.clone(),
                })?;
            }
            let script_path = checkout.join(RECIPE_FILE_NAME);
            let bytes = fsx::read(&script_path)?;
            let hash = fingerprint::source_hash(&source, None);
            Ok((bytes, format!("{url}#{reference}"), hash))
        }
    }
}
