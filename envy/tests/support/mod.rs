//! Shared fixtures: a scriptable mock host, a call-counting fetcher, and an
//! engine harness over a temporary cache root.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use camino::Utf8PathBuf;
use envy::core::{OptionMap, RecipeKey, RecipeSpec, ScriptSource};
use envy::engine::Engine;
use envy::runner::{FetchOutcome, FetchRequest, Fetcher, FileFetcher};
use envy::script::{
    CheckOutcome, Declarations, Hook, ProductsDecl, RecipeScript, ScriptContext, ScriptHost,
    SourceDecl,
};

/// Installs a subscriber once per test binary so `ENVY_LOG`-style filtering
/// works while debugging (`RUST_LOG=envy=trace cargo test ...`).
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn push_event(log: &EventLog, event: impl Into<String>) {
    log.lock().unwrap().push(event.into());
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

type HookFn = Arc<dyn Fn(&mut ScriptContext<'_>) -> Result<()> + Send + Sync>;
type CheckFn = Arc<dyn Fn(&mut ScriptContext<'_>) -> Result<CheckOutcome> + Send + Sync>;
type ValidateFn = Arc<dyn Fn(&OptionMap) -> Result<()> + Send + Sync>;

/// Scripted behavior of one mock recipe, keyed by identity in [`HostState`].
#[derive(Clone, Default)]
pub struct Behavior {
    pub dependencies: Vec<envy::core::DependencySpec>,
    pub sources: Vec<SourceDecl>,
    pub strip: usize,
    pub products: ProductsDecl,
    pub alias: Option<smol_str::SmolStr>,
    pub validate: Option<ValidateFn>,
    pub check: Option<CheckFn>,
    pub hooks: HashMap<Hook, HookFn>,
}

impl Behavior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dependency(mut self, dep: envy::core::DependencySpec) -> Self {
        self.dependencies.push(dep);
        self
    }

    pub fn source(mut self, source: SourceDecl) -> Self {
        self.sources.push(source);
        self
    }

    pub fn hook(
        mut self,
        hook: Hook,
        f: impl Fn(&mut ScriptContext<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.insert(hook, Arc::new(f));
        self
    }

    pub fn check_fn(
        mut self,
        f: impl Fn(&mut ScriptContext<'_>) -> Result<CheckOutcome> + Send + Sync + 'static,
    ) -> Self {
        self.check = Some(Arc::new(f));
        self
    }

    pub fn validate_fn(
        mut self,
        f: impl Fn(&OptionMap) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(f));
        self
    }

    pub fn products_table(mut self, entries: &[(&str, &str)]) -> Self {
        self.products = ProductsDecl::Table(
            entries
                .iter()
                .map(|(name, rel)| ((*name).into(), rel.to_string()))
                .collect(),
        );
        self
    }

    /// Install hook writing one file under `install/`, recording the event.
    pub fn installs_file(self, log: &EventLog, name: &'static str, contents: &'static str) -> Self {
        let log = log.clone();
        self.hook(Hook::Install, move |ctx| {
            std::fs::create_dir_all(ctx.install_dir())?;
            std::fs::write(ctx.install_dir().join(name), contents)?;
            push_event(&log, format!("install:{}", ctx.key().identity()));
            Ok(())
        })
    }

    /// Build hook that only records the event.
    pub fn records_build(self, log: &EventLog) -> Self {
        let log = log.clone();
        self.hook(Hook::Build, move |ctx| {
            push_event(&log, format!("build:{}", ctx.key().identity()));
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct HostState {
    behaviors: Mutex<HashMap<String, Behavior>>,
    loads: Mutex<Vec<String>>,
}

impl HostState {
    pub fn register(&self, identity: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(identity.to_string(), behavior);
    }

    pub fn load_count(&self, identity: &str) -> usize {
        self.loads
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.as_str() == identity)
            .count()
    }
}

pub struct TestHost(pub Arc<HostState>);

impl ScriptHost for TestHost {
    fn load(&self, key: &RecipeKey, _text: &str, _origin: &str) -> Result<Box<dyn RecipeScript>> {
        self.0.loads.lock().unwrap().push(key.identity().to_string());
        let behavior = self
            .0
            .behaviors
            .lock()
            .unwrap()
            .get(key.identity())
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(TestScript {
            identity: key.identity().to_string(),
            behavior,
        }))
    }
}

struct TestScript {
    identity: String,
    behavior: Behavior,
}

impl RecipeScript for TestScript {
    fn declarations(&self) -> Result<Declarations> {
        Ok(Declarations {
            identity: self.identity.clone(),
            alias: self.behavior.alias.clone(),
            dependencies: self.behavior.dependencies.clone(),
            sources: self.behavior.sources.clone(),
            strip: self.behavior.strip,
            products: self.behavior.products.clone(),
        })
    }

    fn validate(&self, options: &OptionMap) -> Result<()> {
        match &self.behavior.validate {
            Some(validate) => validate(options),
            None => Ok(()),
        }
    }

    fn has_hook(&self, hook: Hook) -> bool {
        match hook {
            Hook::Check => self.behavior.check.is_some(),
            _ => self.behavior.hooks.contains_key(&hook),
        }
    }

    fn check(&self, ctx: &mut ScriptContext<'_>) -> Result<CheckOutcome> {
        match &self.behavior.check {
            Some(check) => check(ctx),
            None => Ok(CheckOutcome::Stale),
        }
    }

    fn call(&self, hook: Hook, ctx: &mut ScriptContext<'_>) -> Result<()> {
        match self.behavior.hooks.get(&hook) {
            Some(f) => f(ctx),
            None => Ok(()),
        }
    }
}

/// [`FileFetcher`] wrapper counting fetch calls.
pub struct CountingFetcher {
    pub count: Arc<AtomicUsize>,
    inner: FileFetcher,
}

impl Fetcher for CountingFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(request)
    }
}

pub struct Harness {
    pub engine: Engine,
    pub host: Arc<HostState>,
    pub fetches: Arc<AtomicUsize>,
    /// Scratch root for test artifacts, outside the cache.
    pub root: Utf8PathBuf,
    pub cache_root: Utf8PathBuf,
    _tmp: assert_fs::TempDir,
}

pub fn harness() -> Harness {
    let tmp = assert_fs::TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
    let cache_root = root.join("cache");
    harness_at(tmp, root, cache_root)
}

/// A second engine over an existing cache root, with fresh host state.
pub fn harness_sharing_cache(other: &Harness) -> Harness {
    let tmp = assert_fs::TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
    harness_at(tmp, root, other.cache_root.clone())
}

fn harness_at(tmp: assert_fs::TempDir, root: Utf8PathBuf, cache_root: Utf8PathBuf) -> Harness {
    init_tracing();
    let host = Arc::new(HostState::default());
    let fetches = Arc::new(AtomicUsize::new(0));
    let engine = Engine::builder(TestHost(host.clone()))
        .cache_root(cache_root.clone())
        .fetcher(CountingFetcher {
            count: fetches.clone(),
            inner: FileFetcher,
        })
        .build();
    Harness {
        engine,
        host,
        fetches,
        root,
        cache_root,
        _tmp: tmp,
    }
}

/// Spec with an inline script; the mock host keys behavior off the identity,
/// so the script text only matters to the fingerprint.
pub fn inline(identity: &str) -> RecipeSpec {
    inline_with(identity, identity)
}

pub fn inline_with(identity: &str, script_text: &str) -> RecipeSpec {
    RecipeSpec::build(
        identity,
        ScriptSource::Inline {
            script: script_text.to_string(),
        },
    )
    .finish()
}
