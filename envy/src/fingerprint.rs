use std::fmt;
use std::time::SystemTime;

use camino::Utf8Path;
use itertools::Itertools;

use crate::core::spec::ScriptSource;

/// Content-addressed fingerprint of a recipe; the cache entry name.
///
/// A fingerprint is a pure function of the canonical identity, the loaded
/// script bytes, the resolved source descriptor, and the fingerprints of all
/// dependencies. It can only be computed once every dependency has finalized
/// its own fingerprint, which gives fingerprints a topological order matching
/// the dependency DAG.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    /// 64-character lowercase hex rendering; used as the entry directory name.
    pub fn to_hex(self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.0.to_hex())
    }
}

/// Inputs to [`compute`], gathered by the check phase.
pub struct FingerprintInputs<'a> {
    pub identity_hash: blake3::Hash,
    /// `(dependency query, dependency fingerprint)` pairs; sorted before
    /// hashing so declaration order does not leak into the digest.
    pub deps: &'a [(String, Fingerprint)],
    pub script_hash: blake3::Hash,
    pub source_hash: blake3::Hash,
}

/// Folds the inputs into a 32-byte BLAKE3 digest.
///
/// Every variable-length component is length-prefixed so adjacent components
/// cannot alias each other.
pub fn compute(inputs: &FingerprintInputs<'_>) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(inputs.identity_hash.as_bytes());

    hasher.update(&(inputs.deps.len() as u64).to_le_bytes());
    for (query, fingerprint) in inputs
        .deps
        .iter()
        .sorted_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.to_hex().cmp(&b.1.to_hex())))
    {
        hasher.update(&(query.len() as u64).to_le_bytes());
        hasher.update(query.as_bytes());
        hasher.update(fingerprint.as_bytes());
    }

    hasher.update(inputs.script_hash.as_bytes());
    hasher.update(inputs.source_hash.as_bytes());
    Fingerprint(hasher.finalize())
}

pub fn script_hash(script_bytes: &[u8]) -> blake3::Hash {
    blake3::hash(script_bytes)
}

/// Hashes the resolved source descriptor.
///
/// Local scripts fold in the absolute path and mtime, remote scripts the URL
/// plus expected digest, git scripts the URL plus ref, and inline scripts
/// their own bytes. Each variant is tag-prefixed so, e.g., a URL can never
/// collide with an equal-looking local path.
pub fn source_hash(
    source: &ScriptSource,
    resolved_path: Option<(&Utf8Path, SystemTime)>,
) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    match source {
        ScriptSource::Path { path } => {
            hasher.update(b"path\0");
            let (abs, mtime) = match resolved_path {
                Some((abs, mtime)) => (abs.to_owned(), mtime),
                None => (path.clone(), SystemTime::UNIX_EPOCH),
            };
            hasher.update(abs.as_str().as_bytes());
            hasher.update(b"\0");
            let nanos = mtime
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            hasher.update(&nanos.to_le_bytes());
        }
        ScriptSource::Url { url, checksum } => {
            hasher.update(b"url\0");
            hasher.update(url.as_str().as_bytes());
            hasher.update(b"\0");
            match checksum {
                Some(checksum) => hasher.update(checksum.to_string().as_bytes()),
                None => hasher.update(b"-"),
            };
        }
        ScriptSource::Git { url, reference } => {
            hasher.update(b"git\0");
            hasher.update(url.as_str().as_bytes());
            hasher.update(b"\0");
            hasher.update(reference.as_bytes());
        }
        ScriptSource::Inline { script } => {
            hasher.update(b"inline\0");
            hasher.update(blake3::hash(script.as_bytes()).as_bytes());
        }
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(seed: &str) -> Fingerprint {
        Fingerprint(blake3::hash(seed.as_bytes()))
    }

    fn inputs<'a>(deps: &'a [(String, Fingerprint)]) -> FingerprintInputs<'a> {
        FingerprintInputs {
            identity_hash: blake3::hash(b"local.ninja@r0"),
            deps,
            script_hash: blake3::hash(b"script"),
            source_hash: blake3::hash(b"source"),
        }
    }

    #[test]
    fn pure_function_of_inputs() {
        let deps = vec![("cmake".to_string(), fp("cmake"))];
        assert_eq!(compute(&inputs(&deps)), compute(&inputs(&deps)));
    }

    #[test]
    fn dependency_order_is_canonicalized() {
        let ab = vec![("a".to_string(), fp("a")), ("b".to_string(), fp("b"))];
        let ba = vec![("b".to_string(), fp("b")), ("a".to_string(), fp("a"))];
        assert_eq!(compute(&inputs(&ab)), compute(&inputs(&ba)));
    }

    #[test]
    fn every_component_is_significant() {
        let deps = vec![("a".to_string(), fp("a"))];
        let base = compute(&inputs(&deps));

        let other_deps = vec![("a".to_string(), fp("a'"))];
        assert_ne!(base, compute(&inputs(&other_deps)));

        let mut changed = inputs(&deps);
        changed.identity_hash = blake3::hash(b"local.ninja@r1");
        assert_ne!(base, compute(&changed));

        let mut changed = inputs(&deps);
        changed.script_hash = blake3::hash(b"script'");
        assert_ne!(base, compute(&changed));

        let mut changed = inputs(&deps);
        changed.source_hash = blake3::hash(b"source'");
        assert_ne!(base, compute(&changed));
    }

    #[test]
    fn dep_list_cannot_alias_concatenation() {
        // ("ab", x) ++ ("c", y) must differ from ("a", x) ++ ("bc", y).
        let left = vec![("ab".to_string(), fp("x")), ("c".to_string(), fp("y"))];
        let right = vec![("a".to_string(), fp("x")), ("bc".to_string(), fp("y"))];
        assert_ne!(compute(&inputs(&left)), compute(&inputs(&right)));
    }

    #[test]
    fn source_hash_distinguishes_variants() {
        let url = source_hash(
            &ScriptSource::Url {
                url: "https://example.com/x".parse().unwrap(),
                checksum: None,
            },
            None,
        );
        let git = source_hash(
            &ScriptSource::Git {
                url: "https://example.com/x".parse().unwrap(),
                reference: "main".into(),
            },
            None,
        );
        assert_ne!(url, git);
    }

    #[test]
    fn hex_rendering_is_lowercase_and_64_chars() {
        let hex = fp("anything").to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex, hex.to_lowercase());
    }
}
