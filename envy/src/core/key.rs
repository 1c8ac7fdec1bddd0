use std::cmp::Ordering;
use std::fmt;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;

use crate::core::errors::EnvyError;
use crate::core::spec::{OptionMap, OptionValue, RecipeSpec};

/// Canonical identity key of a recipe instance.
///
/// Rendered as `<namespace>.<name>@<revision>{k=v,...}` with option keys
/// lexicographically sorted; the option block is omitted when the recipe has
/// no options. Two specs name the same recipe instance if and only if their
/// canonical strings are equal, and the canonical string is the memoization
/// key for the whole engine.
///
/// Cheap to clone; equality, ordering and hashing all use the canonical
/// string.
#[derive(Clone)]
pub struct RecipeKey(Arc<KeyInner>);

struct KeyInner {
    canonical: String,
    /// Byte offset of `<name>` within `canonical`.
    name_off: usize,
    /// Byte offset of `<revision>` within `canonical`.
    rev_off: usize,
    /// Byte length of the `<namespace>.<name>@<revision>` prefix.
    identity_len: usize,
}

impl RecipeKey {
    /// Computes the key for a spec, validating the identity shape.
    pub fn for_spec(spec: &RecipeSpec) -> Result<Self> {
        Self::new(&spec.identity, &spec.options)
    }

    pub fn new(identity: &str, options: &OptionMap) -> Result<Self> {
        let (namespace, name, revision) = split_identity(identity)?;
        validate_segment(identity, "namespace", namespace)?;
        validate_segment(identity, "name", name)?;
        validate_revision(identity, revision)?;

        let mut canonical = String::with_capacity(identity.len());
        canonical.push_str(namespace);
        canonical.push('.');
        let name_off = canonical.len();
        canonical.push_str(name);
        canonical.push('@');
        let rev_off = canonical.len();
        canonical.push_str(revision);
        let identity_len = canonical.len();
        if !options.is_empty() {
            render_options(options, &mut canonical);
        }

        Ok(Self(Arc::new(KeyInner {
            canonical,
            name_off,
            rev_off,
            identity_len,
        })))
    }

    pub fn namespace(&self) -> &str {
        &self.0.canonical[..self.0.name_off - 1]
    }

    pub fn name(&self) -> &str {
        &self.0.canonical[self.0.name_off..self.0.rev_off - 1]
    }

    pub fn revision(&self) -> &str {
        &self.0.canonical[self.0.rev_off..self.0.identity_len]
    }

    /// `<namespace>.<name>`, without revision or options.
    pub fn namespace_name(&self) -> &str {
        &self.0.canonical[..self.0.rev_off - 1]
    }

    /// `<namespace>.<name>@<revision>`, without options.
    pub fn identity(&self) -> &str {
        &self.0.canonical[..self.0.identity_len]
    }

    pub fn canonical(&self) -> &str {
        &self.0.canonical
    }

    /// Query matching: a query selects this key when it equals the full
    /// canonical, the identity, `namespace.name`, or the bare name.
    /// Aliases are a separate exact-match table owned by the engine.
    pub fn matches_query(&self, query: &str) -> bool {
        query == self.canonical()
            || query == self.identity()
            || query == self.namespace_name()
            || query == self.name()
    }

    /// BLAKE3 hash of the canonical string; the identity component of the
    /// cache fingerprint.
    pub fn identity_hash(&self) -> blake3::Hash {
        blake3::hash(self.canonical().as_bytes())
    }
}

impl PartialEq for RecipeKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for RecipeKey {}

impl PartialOrd for RecipeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecipeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical().cmp(other.canonical())
    }
}

impl Hash for RecipeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for RecipeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical())
    }
}

impl fmt::Debug for RecipeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecipeKey({})", self.canonical())
    }
}

fn split_identity(identity: &str) -> Result<(&str, &str, &str)> {
    let invalid = |reason: &str| EnvyError::InvalidIdentity {
        identity: identity.to_string(),
        reason: reason.to_string(),
    };

    let Some((prefix, revision)) = identity.split_once('@') else {
        return Err(invalid("expected `<namespace>.<name>@<revision>`").into());
    };
    if revision.contains('@') {
        return Err(invalid("more than one `@`").into());
    }
    let Some((namespace, name)) = prefix.split_once('.') else {
        return Err(invalid("expected `<namespace>.<name>` before `@`").into());
    };
    if name.contains('.') {
        return Err(invalid("more than one `.` before `@`").into());
    }
    Ok((namespace, name, revision))
}

fn validate_segment(identity: &str, what: &str, segment: &str) -> Result<()> {
    let invalid = |reason: String| EnvyError::InvalidIdentity {
        identity: identity.to_string(),
        reason,
    };

    let mut chars = segment.chars();
    match chars.next() {
        None => return Err(invalid(format!("{what} is empty")).into()),
        Some(ch) if ch.is_ascii_lowercase() || ch == '_' => {}
        Some(ch) => {
            return Err(invalid(format!(
                "{what} must start with an ASCII lowercase letter or `_`, got `{ch}`"
            ))
            .into());
        }
    }
    for ch in chars {
        if !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-') {
            return Err(invalid(format!("invalid character `{ch}` in {what}")).into());
        }
    }
    Ok(())
}

fn validate_revision(identity: &str, revision: &str) -> Result<()> {
    if revision.is_empty() {
        return Err(EnvyError::InvalidIdentity {
            identity: identity.to_string(),
            reason: "revision is empty".to_string(),
        }
        .into());
    }
    for ch in revision.chars() {
        if !(ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-') {
            return Err(EnvyError::InvalidIdentity {
                identity: identity.to_string(),
                reason: format!("invalid character `{ch}` in revision"),
            }
            .into());
        }
    }
    Ok(())
}

fn render_options(options: &OptionMap, out: &mut String) {
    out.push('{');
    for (i, (k, v)) in options.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        escape_into(k, out);
        out.push('=');
        render_value(v, out);
    }
    out.push('}');
}

fn render_value(value: &OptionValue, out: &mut String) {
    match value {
        OptionValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        OptionValue::Int(i) => {
            let _ = write!(out, "{i}");
        }
        OptionValue::String(s) => escape_into(s, out),
        OptionValue::Table(map) => render_options(map, out),
    }
}

/// Escapes `{`, `}`, `=`, `,` and `\` with a backslash so option values
/// cannot forge canonical-string structure.
fn escape_into(s: &str, out: &mut String) {
    for ch in s.chars() {
        if matches!(ch, '{' | '}' | '=' | ',' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::spec::ScriptSource;
    use test_case::test_case;

    fn key(identity: &str) -> RecipeKey {
        RecipeKey::new(identity, &OptionMap::new()).unwrap()
    }

    #[test]
    fn substrings() {
        let k = key("local.ninja@r0");
        assert_eq!(k.namespace(), "local");
        assert_eq!(k.name(), "ninja");
        assert_eq!(k.revision(), "r0");
        assert_eq!(k.namespace_name(), "local.ninja");
        assert_eq!(k.identity(), "local.ninja@r0");
        assert_eq!(k.canonical(), "local.ninja@r0");
    }

    #[test]
    fn options_are_sorted_and_escaped() {
        let mut options = OptionMap::new();
        options.insert("zeta".into(), OptionValue::from("a,b=c"));
        options.insert("alpha".into(), OptionValue::from(true));
        let k = RecipeKey::new("local.ninja@r0", &options).unwrap();
        assert_eq!(k.canonical(), r"local.ninja@r0{alpha=true,zeta=a\,b\=c}");
        assert_eq!(k.identity(), "local.ninja@r0");
    }

    #[test]
    fn nested_table_options_render_canonically() {
        let mut inner = OptionMap::new();
        inner.insert("lto".into(), OptionValue::from(false));
        let mut options = OptionMap::new();
        options.insert("build".into(), OptionValue::Table(inner));
        options.insert("jobs".into(), OptionValue::from(4i64));
        let k = RecipeKey::new("tools.cc@1.2.3", &options).unwrap();
        assert_eq!(k.canonical(), "tools.cc@1.2.3{build={lto=false},jobs=4}");
    }

    #[test]
    fn equal_specs_collide_and_hash_alike() {
        use std::collections::HashSet;
        let a = key("local.ninja@r0");
        let b = key("local.ninja@r0");
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn different_options_are_different_keys() {
        let plain = key("local.ninja@r0");
        let mut options = OptionMap::new();
        options.insert("static".into(), OptionValue::from(true));
        let with_opts = RecipeKey::new("local.ninja@r0", &options).unwrap();
        assert_ne!(plain, with_opts);
        assert_ne!(plain.identity_hash(), with_opts.identity_hash());
    }

    #[test_case("ninja@r0"; "missing namespace dot")]
    #[test_case("local.ninja"; "missing revision")]
    #[test_case("local.ninja@"; "empty revision")]
    #[test_case(".ninja@r0"; "empty namespace")]
    #[test_case("local.@r0"; "empty name")]
    #[test_case("local.sub.ninja@r0"; "extra dot")]
    #[test_case("local.ninja@r0@r1"; "extra at")]
    #[test_case("Local.ninja@r0"; "uppercase namespace")]
    #[test_case("local.nin ja@r0"; "space in name")]
    #[test_case("local.ninja@r 0"; "space in revision")]
    fn invalid_identities(identity: &str) {
        let err = RecipeKey::new(identity, &OptionMap::new()).unwrap_err();
        assert!(err.downcast_ref::<EnvyError>().is_some_and(|e| matches!(
            e,
            EnvyError::InvalidIdentity { .. }
        )));
    }

    #[test_case("local.ninja@r0{static=true}", true; "canonical")]
    #[test_case("local.ninja@r0", true; "identity")]
    #[test_case("local.ninja", true; "namespace name")]
    #[test_case("ninja", true; "bare name")]
    #[test_case("local", false; "bare namespace")]
    #[test_case("ninja@r0", false; "name at revision")]
    #[test_case("other.ninja", false; "wrong namespace")]
    fn query_matching(query: &str, expected: bool) {
        let mut options = OptionMap::new();
        options.insert("static".into(), OptionValue::from(true));
        let k = RecipeKey::new("local.ninja@r0", &options).unwrap();
        assert_eq!(k.matches_query(query), expected);
    }

    #[test]
    fn spec_key_round_trip() {
        let spec = RecipeSpec::build(
            "local.ninja@r0",
            ScriptSource::Path {
                path: "recipes/ninja.envy".into(),
            },
        )
        .option("static", true)
        .finish();
        assert_eq!(spec.key().unwrap().canonical(), "local.ninja@r0{static=true}");
    }
}
