//! The surface recipe hooks call back into during phase execution.
//!
//! Every call is checked against the calling recipe's declared dependencies
//! and the current phase; each decision (allowed or denied) is emitted to
//! the trace log with the consumer, the target, both phases, and the reason.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::trace;
use url::Url;

use crate::cache::EntryPaths;
use crate::core::checksum::Checksum;
use crate::core::errors::EnvyError;
use crate::core::key::RecipeKey;
use crate::core::phase::Phase;
use crate::core::recipe::Recipe;
use crate::core::spec::OptionMap;
use crate::engine::EngineInner;
use crate::internal::fsx;
use crate::platform::{self, HostInfo};
use crate::runner::{FetchOrigin, FetchRequest, RunOutput, RunRequest};
use crate::shutdown;

/// Which shell [`ScriptContext::run`] dispatches to.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellKind {
    #[default]
    Posix,
    Bash,
}

/// Options of `envy.run`.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Working directory; defaults to `stage/` when present, the entry root
    /// otherwise.
    pub cwd: Option<Utf8PathBuf>,
    pub env: BTreeMap<String, String>,
    pub shell: ShellKind,
    pub quiet: bool,
    pub capture: bool,
    /// Raise `CommandFailed` on a non-zero exit.
    pub check: bool,
    pub interactive: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: BTreeMap::new(),
            shell: ShellKind::default(),
            quiet: false,
            capture: false,
            check: true,
            interactive: false,
        }
    }
}

/// Phase-scoped binding context handed to every hook invocation.
pub struct ScriptContext<'a> {
    engine: &'a EngineInner,
    recipe: &'a Arc<Recipe>,
    phase: Phase,
    paths: EntryPaths,
}

impl<'a> ScriptContext<'a> {
    pub(crate) fn new(
        engine: &'a EngineInner,
        recipe: &'a Arc<Recipe>,
        phase: Phase,
        paths: EntryPaths,
    ) -> Self {
        Self {
            engine,
            recipe,
            phase,
            paths,
        }
    }

    pub fn key(&self) -> &RecipeKey {
        self.recipe.key()
    }

    pub fn options(&self) -> &OptionMap {
        &self.recipe.spec().options
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn host(&self) -> &'static HostInfo {
        platform::host()
    }

    pub fn tmp_dir(&self) -> &Utf8Path {
        &self.paths.tmp
    }

    pub fn fetch_dir(&self) -> &Utf8Path {
        &self.paths.fetch
    }

    pub fn stage_dir(&self) -> &Utf8Path {
        &self.paths.stage
    }

    pub fn install_dir(&self) -> &Utf8Path {
        &self.paths.install
    }

    /// Install path of a dependency named by exact identity.
    ///
    /// Requires a (transitive) dependency edge whose effective boundary has
    /// already passed: the best path to the target must consist of edges
    /// needed no later than the current phase.
    pub fn package(&self, identity: &str) -> Result<Utf8PathBuf> {
        self.dependency_install(identity, false)
    }

    /// Like [`Self::package`], but accepts partial queries (name or
    /// `namespace.name`) as long as exactly one reachable recipe matches.
    pub fn asset(&self, query: &str) -> Result<Utf8PathBuf> {
        self.dependency_install(query, true)
    }

    fn dependency_install(&self, query: &str, partial: bool) -> Result<Utf8PathBuf> {
        let binding = if partial { "asset" } else { "package" };
        let reachable = self.reachable();
        let candidates: Vec<(&RecipeKey, Phase)> = reachable
            .iter()
            .filter(|(key, _)| {
                if partial {
                    key.matches_query(query)
                } else {
                    key.identity() == query || key.canonical() == query
                }
            })
            .map(|(key, needed_by)| (key, *needed_by))
            .collect();

        match candidates.as_slice() {
            [] => {
                self.trace_access(binding, query, None, false, "no dependency path to target");
                Err(EnvyError::UndeclaredDependency {
                    consumer: self.key().to_string(),
                    target: query.to_string(),
                }
                .into())
            }
            [(key, needed_by)] => {
                if *needed_by > self.phase {
                    self.trace_access(
                        binding,
                        query,
                        Some(*needed_by),
                        false,
                        "dependency boundary not reached",
                    );
                    return Err(EnvyError::OutOfPhase {
                        binding: format!("{binding}({query})"),
                        phase: self.phase.to_string(),
                    }
                    .into());
                }
                let target = self
                    .engine
                    .recipe(key)
                    .ok_or_else(|| anyhow!("recipe `{key}` disappeared from the registry"))?;
                let install = target.asset_path().ok_or_else(|| {
                    anyhow!("dependency `{key}` has not published an asset path")
                })?;
                self.trace_access(binding, query, Some(*needed_by), true, "ok");
                Ok(install)
            }
            _ => {
                self.trace_access(binding, query, None, false, "ambiguous query");
                Err(EnvyError::AmbiguousDependency {
                    consumer: self.key().to_string(),
                    query: query.to_string(),
                    matches: candidates.iter().map(|(k, _)| k.to_string()).collect(),
                }
                .into())
            }
        }
    }

    /// Path of a product this recipe declared a product dependency on.
    pub fn product(&self, name: &str) -> Result<String> {
        let Some(dep) = self.recipe.data().product_deps.get(name).cloned() else {
            self.trace_access("product", name, None, false, "no declared product dependency");
            return Err(EnvyError::ProductNotFound {
                consumer: self.key().to_string(),
                product: name.to_string(),
                reason: "no declared product dependency".to_string(),
            }
            .into());
        };

        if self.phase < dep.needed_by {
            self.trace_access(
                "product",
                name,
                Some(dep.needed_by),
                false,
                "dependency boundary not reached",
            );
            return Err(EnvyError::OutOfPhase {
                binding: format!("product({name})"),
                phase: self.phase.to_string(),
            }
            .into());
        }

        let provider = self
            .engine
            .recipe(&dep.provider)
            .ok_or_else(|| anyhow!("provider `{}` disappeared from the registry", dep.provider))?;
        if !provider.key().matches_query(&dep.constraint) {
            self.trace_access("product", name, Some(dep.needed_by), false, "identity constraint");
            return Err(EnvyError::ProductNotFound {
                consumer: self.key().to_string(),
                product: name.to_string(),
                reason: format!(
                    "provider `{}` does not satisfy constraint `{}`",
                    provider.key(),
                    dep.constraint
                ),
            }
            .into());
        }

        let products = provider.products();
        let Some(rel) = products.get(name) else {
            self.trace_access("product", name, Some(dep.needed_by), false, "provider lacks product");
            return Err(EnvyError::ProductNotFound {
                consumer: self.key().to_string(),
                product: name.to_string(),
                reason: format!("provider `{}` does not declare it", provider.key()),
            }
            .into());
        };
        let install = provider.asset_path().ok_or_else(|| {
            anyhow!("provider `{}` has not published an asset path", provider.key())
        })?;
        self.trace_access("product", name, Some(dep.needed_by), true, "ok");
        Ok(install.join(rel.as_str()).to_string())
    }

    /// Dispatches a shell snippet to the external runner.
    pub fn run(&self, script: &str, options: RunOptions) -> Result<RunOutput> {
        shutdown::check()?;
        let cwd = options.cwd.unwrap_or_else(|| {
            if self.paths.stage.is_dir() {
                self.paths.stage.clone()
            } else {
                self.paths.root.clone()
            }
        });
        let mut env = self.host().vars();
        env.extend(options.env);

        let output = self.engine.shell().run(&RunRequest {
            script: script.to_string(),
            cwd,
            env,
            shell: options.shell,
            quiet: options.quiet,
            capture: options.capture,
            interactive: options.interactive,
        })?;
        if options.check && !output.success() {
            return Err(EnvyError::CommandFailed {
                command: script.to_string(),
                exit_code: output.exit_code,
            }
            .into());
        }
        Ok(output)
    }

    /// `{{key}}` substitution with the host vars merged in; caller values
    /// win on collision.
    pub fn template(&self, input: &str, values: &BTreeMap<String, String>) -> Result<String> {
        let mut merged = self.host().vars();
        merged.extend(values.clone());
        template(input, &merged)
    }

    /// Downloads `url` into `tmp/` under `dest_name`. Fetch-phase family:
    /// callable during fetch and stage only.
    pub fn fetch(
        &self,
        url: &Url,
        checksum: Option<&Checksum>,
        dest_name: &str,
    ) -> Result<Utf8PathBuf> {
        self.ensure_fetch_phase("fetch")?;
        shutdown::check()?;
        let dest = self.paths.tmp.join(dest_name);
        let outcome = self.engine.fetcher().fetch(&FetchRequest {
            origin: FetchOrigin::Url(url.clone()),
            dest: dest.clone(),
        })?;
        if let Some(expected) = checksum {
            let actual = match outcome.checksum {
                Some(actual) => actual,
                None => Checksum::compute(fsx::read(&dest)?),
            };
            if actual != *expected {
                return Err(EnvyError::DigestMismatch {
                    source_id: url.to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                }
                .into());
            }
        }
        Ok(dest)
    }

    /// Atomically promotes a verified artifact from `tmp/` into `fetch/`.
    pub fn commit_fetch(&self, name: &str) -> Result<Utf8PathBuf> {
        self.ensure_fetch_phase("commit_fetch")?;
        let from = self.paths.tmp.join(name);
        let to = self.paths.fetch.join(name);
        fsx::create_dir_all(&self.paths.fetch)?;
        fsx::rename(&from, &to)?;
        Ok(to)
    }

    pub fn verify_hash(&self, path: &Utf8Path, expected: &Checksum) -> Result<()> {
        self.ensure_fetch_phase("verify_hash")?;
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open `{path}` for hashing"))?;
        let actual = Checksum::compute_read(file)?;
        if actual != *expected {
            return Err(EnvyError::DigestMismatch {
                source_id: path.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Extracts one archive into `stage/`.
    pub fn extract(&self, archive: &Utf8Path, strip: usize) -> Result<()> {
        self.ensure_fetch_phase("extract")?;
        fsx::create_dir_all(&self.paths.stage)?;
        self.engine.extractor().extract(archive, &self.paths.stage, strip)
    }

    /// Extracts every recognized archive under `fetch/` into `stage/`.
    pub fn extract_all(&self, strip: usize) -> Result<()> {
        self.ensure_fetch_phase("extract_all")?;
        fsx::create_dir_all(&self.paths.stage)?;
        for entry in self
            .paths
            .fetch
            .read_dir_utf8()
            .with_context(|| format!("failed to read `{}`", self.paths.fetch))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() && self.engine.extractor().recognizes(path) {
                self.engine.extractor().extract(path, &self.paths.stage, strip)?;
            }
        }
        Ok(())
    }

    // Stateless helpers, callable in any phase.

    pub fn copy(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        fsx::copy_recursive(from, to)
    }

    pub fn move_path(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fsx::create_dir_all(parent)?;
        }
        if std::fs::rename(from, to).is_ok() {
            return Ok(());
        }
        fsx::copy_recursive(from, to)?;
        self.remove(from)
    }

    pub fn remove(&self, path: &Utf8Path) -> Result<()> {
        if path.is_dir() {
            fsx::remove_dir_all(path)
        } else if path.exists() {
            std::fs::remove_file(path).with_context(|| format!("failed to remove `{path}`"))
        } else {
            Ok(())
        }
    }

    pub fn exists(&self, path: &Utf8Path) -> bool {
        path.exists()
    }

    pub fn is_file(&self, path: &Utf8Path) -> bool {
        path.is_file()
    }

    pub fn is_dir(&self, path: &Utf8Path) -> bool {
        path.is_dir()
    }

    /// Effective dependency boundary for every recipe reachable over
    /// resolved edges: minimum over paths of the latest `needed_by` along
    /// each path — a chain is available no earlier than its latest link.
    fn reachable(&self) -> HashMap<RecipeKey, Phase> {
        let mut best: HashMap<RecipeKey, Phase> = HashMap::new();
        let mut queue: VecDeque<(RecipeKey, Phase)> = self
            .recipe
            .resolved_edges()
            .into_iter()
            .map(|edge| (edge.key, edge.needed_by))
            .collect();
        while let Some((key, cost)) = queue.pop_front() {
            if best.get(&key).is_some_and(|existing| *existing <= cost) {
                continue;
            }
            best.insert(key.clone(), cost);
            if let Some(recipe) = self.engine.recipe(&key) {
                for edge in recipe.resolved_edges() {
                    queue.push_back((edge.key, cost.max(edge.needed_by)));
                }
            }
        }
        best
    }

    fn ensure_fetch_phase(&self, binding: &str) -> Result<()> {
        if !(Phase::Fetch..=Phase::Stage).contains(&self.phase) {
            self.trace_access(binding, "-", None, false, "fetch bindings are phase 2-3 only");
            return Err(EnvyError::OutOfPhase {
                binding: binding.to_string(),
                phase: self.phase.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn trace_access(
        &self,
        binding: &str,
        target: &str,
        needed_by: Option<Phase>,
        allowed: bool,
        reason: &str,
    ) {
        trace!(
            consumer = %self.key(),
            binding,
            target,
            phase = %self.phase,
            needed_by = needed_by.map(|p| p.name()),
            allowed,
            reason,
            "script binding access"
        );
    }
}

/// Substitutes `{{key}}` tokens; an unresolved token is an error.
pub fn template(input: &str, values: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // Unterminated braces are literal text.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let token = after[..end].trim();
        match values.get(token) {
            Some(value) => out.push_str(value),
            None => {
                return Err(EnvyError::TemplateUnresolved {
                    token: token.to_string(),
                }
                .into());
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Stateless path utilities exposed as `envy.path.*`.
pub mod path {
    use camino::{Utf8Path, Utf8PathBuf};

    pub fn join(base: &Utf8Path, segment: &str) -> Utf8PathBuf {
        base.join(segment)
    }

    pub fn basename(path: &Utf8Path) -> Option<&str> {
        path.file_name()
    }

    pub fn dirname(path: &Utf8Path) -> Option<&str> {
        path.parent().map(Utf8Path::as_str)
    }

    pub fn stem(path: &Utf8Path) -> Option<&str> {
        path.file_stem()
    }

    pub fn extension(path: &Utf8Path) -> Option<&str> {
        path.extension()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn template_substitutes_tokens() {
        let out = template(
            "fetch {{url}}/pkg-{{version}}.tar.gz",
            &values(&[("url", "https://example.com"), ("version", "1.2")]),
        )
        .unwrap();
        assert_eq!(out, "fetch https://example.com/pkg-1.2.tar.gz");
    }

    #[test]
    fn template_token_whitespace_is_trimmed() {
        let out = template("{{ name }}", &values(&[("name", "ninja")])).unwrap();
        assert_eq!(out, "ninja");
    }

    #[test]
    fn template_unresolved_token_is_an_error() {
        let err = template("{{missing}}", &BTreeMap::new()).unwrap_err();
        match err.downcast_ref::<EnvyError>() {
            Some(EnvyError::TemplateUnresolved { token }) => assert_eq!(token, "missing"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn template_unterminated_braces_stay_literal() {
        let out = template("a {{broken", &BTreeMap::new()).unwrap();
        assert_eq!(out, "a {{broken");
    }

    #[test_case("a/b/c.tar.gz", Some("c.tar.gz"), Some("a/b"); "nested")]
    #[test_case("c.txt", Some("c.txt"), Some(""); "bare file")]
    fn path_helpers(input: &str, base: Option<&str>, dir: Option<&str>) {
        let p = Utf8Path::new(input);
        assert_eq!(path::basename(p), base);
        assert_eq!(path::dirname(p), dir);
    }

    #[test]
    fn path_stem_and_extension() {
        let p = Utf8Path::new("dist/tool-1.2.tar");
        assert_eq!(path::stem(p), Some("tool-1.2"));
        assert_eq!(path::extension(p), Some("tar"));
        assert_eq!(path::join(Utf8Path::new("a"), "b").as_str(), "a/b");
    }
}
