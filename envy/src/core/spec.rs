use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::Result;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

use crate::core::checksum::Checksum;
use crate::core::key::RecipeKey;
use crate::core::phase::Phase;

/// Option map attached to a recipe instance. Keys are sorted, which the
/// canonical key rendering relies on.
pub type OptionMap = BTreeMap<SmolStr, OptionValue>;

/// Scalar-or-table option value a manifest can pass to a recipe.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    String(SmolStr),
    Table(OptionMap),
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::String(v.into())
    }
}

/// Where the recipe script itself comes from.
///
/// This locates the *script*, not the package payload; payload sources are
/// declared inside the script and fetched during the fetch phase.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptSource {
    /// Script file on the local filesystem.
    Path { path: Utf8PathBuf },
    /// Script fetched over HTTPS, optionally pinned to a digest.
    Url {
        url: Url,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<Checksum>,
    },
    /// Script taken from a git repository at a commit or tag.
    Git { url: Url, reference: SmolStr },
    /// Script text embedded directly in the spec, as weak-dependency
    /// fallbacks and programmatic recipes do.
    Inline { script: String },
}

impl fmt::Display for ScriptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptSource::Path { path } => write!(f, "{path}"),
            ScriptSource::Url { url, .. } => write!(f, "{url}"),
            ScriptSource::Git { url, reference } => write!(f, "{url}#{reference}"),
            ScriptSource::Inline { .. } => write!(f, "<inline>"),
        }
    }
}

/// See [`RecipeSpecInner`] for public fields reference.
///
/// The data a manifest or dependency declaration passes to the engine to
/// request a recipe instance. Cheap to clone.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipeSpec(Arc<RecipeSpecInner>);

#[derive(Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RecipeSpecInner {
    /// Identity in `<namespace>.<name>@<revision>` form.
    pub identity: String,
    pub source: ScriptSource,
    #[serde(default)]
    pub options: OptionMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<SmolStr>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
}

impl Deref for RecipeSpec {
    type Target = RecipeSpecInner;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl RecipeSpec {
    pub fn build(identity: impl Into<String>, source: ScriptSource) -> RecipeSpecBuilder {
        RecipeSpecBuilder {
            identity: identity.into(),
            source,
            options: OptionMap::new(),
            alias: None,
            dependencies: Vec::new(),
        }
    }

    /// Computes the canonical identity key for this spec.
    pub fn key(&self) -> Result<RecipeKey> {
        RecipeKey::for_spec(self)
    }
}

impl fmt::Debug for RecipeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecipeSpec({} from {})", self.identity, self.source)
    }
}

#[derive(Debug)]
pub struct RecipeSpecBuilder {
    identity: String,
    source: ScriptSource,
    options: OptionMap,
    alias: Option<SmolStr>,
    dependencies: Vec<DependencySpec>,
}

impl RecipeSpecBuilder {
    pub fn option(mut self, key: impl Into<SmolStr>, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn options(mut self, options: OptionMap) -> Self {
        self.options = options;
        self
    }

    pub fn alias(mut self, alias: impl Into<SmolStr>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn dependency(mut self, dep: DependencySpec) -> Self {
        self.dependencies.push(dep);
        self
    }

    pub fn finish(self) -> RecipeSpec {
        RecipeSpec(Arc::new(RecipeSpecInner {
            identity: self.identity,
            source: self.source,
            options: self.options,
            alias: self.alias,
            dependencies: self.dependencies,
        }))
    }
}

/// A declared dependency edge, before resolution.
///
/// Three shapes reach the engine:
/// - **strong**: an embedded spec with `weak == false`; instantiated
///   immediately during recipe-load,
/// - **weak**: a query plus an embedded fallback spec; the query is matched
///   against the graph first and the fallback instantiated only on a miss,
/// - **bare**: a query alone; an empty match set is an error.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Recipe query: name, `namespace.name`, identity, or full canonical.
    pub query: SmolStr,
    /// Embedded spec: the dependency itself (strong) or the fallback (weak).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<RecipeSpec>,
    #[serde(default)]
    pub weak: bool,
    /// Earliest consumer phase at which this dependency must have completed.
    #[serde(default)]
    pub needed_by: Phase,
    /// Product-name constraint; declares a product dependency on the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<SmolStr>,
}

impl DependencySpec {
    /// Strong dependency on an embedded spec.
    pub fn strong(spec: RecipeSpec) -> Self {
        Self {
            query: spec.identity.as_str().into(),
            spec: Some(spec),
            weak: false,
            needed_by: Phase::default(),
            product: None,
        }
    }

    /// Weak dependency: prefer a graph match for `query`, fall back to the
    /// embedded spec when nothing matches.
    pub fn weak(query: impl Into<SmolStr>, fallback: RecipeSpec) -> Self {
        Self {
            query: query.into(),
            spec: Some(fallback),
            weak: true,
            needed_by: Phase::default(),
            product: None,
        }
    }

    /// Bare query dependency; resolution fails if nothing matches.
    pub fn query(query: impl Into<SmolStr>) -> Self {
        Self {
            query: query.into(),
            spec: None,
            weak: false,
            needed_by: Phase::default(),
            product: None,
        }
    }

    pub fn needed_by(mut self, phase: Phase) -> Self {
        self.needed_by = phase;
        self
    }

    pub fn product(mut self, name: impl Into<SmolStr>) -> Self {
        self.product = Some(name.into());
        self
    }

    pub fn is_strong(&self) -> bool {
        self.spec.is_some() && !self.weak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(identity: &str) -> RecipeSpec {
        RecipeSpec::build(
            identity,
            ScriptSource::Path {
                path: "recipes/test.envy".into(),
            },
        )
        .finish()
    }

    #[test]
    fn dependency_shapes() {
        let strong = DependencySpec::strong(local("local.ninja@r0"));
        assert!(strong.is_strong());
        assert_eq!(strong.query, "local.ninja@r0");

        let weak = DependencySpec::weak("ninja", local("local.ninja@r0"));
        assert!(!weak.is_strong());
        assert!(weak.spec.is_some());

        let bare = DependencySpec::query("cmake");
        assert!(!bare.is_strong());
        assert!(bare.spec.is_none());
        assert_eq!(bare.needed_by, Phase::Check);
    }

    #[test]
    fn spec_serde_round_trip() {
        let spec = RecipeSpec::build(
            "local.ninja@r0",
            ScriptSource::Url {
                url: "https://example.com/ninja.envy".parse().unwrap(),
                checksum: None,
            },
        )
        .option("static", true)
        .alias("ninja")
        .dependency(DependencySpec::query("cmake").needed_by(Phase::Build))
        .finish();

        let json = serde_json::to_string(&spec).unwrap();
        let back: RecipeSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
