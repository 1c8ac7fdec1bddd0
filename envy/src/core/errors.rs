use thiserror::Error;

/// Typed failures produced by the engine.
///
/// Errors travel through [`anyhow::Error`] so call sites can attach context
/// freely; the CLI downcasts back to this type to pick an exit code, and the
/// coordinator downcasts to tell a propagated dependency failure from a local
/// one.
#[derive(Debug, Error)]
pub enum EnvyError {
    #[error("invalid recipe identity `{identity}`: {reason}")]
    InvalidIdentity { identity: String, reason: String },

    #[error("recipe `{key}` rejected its options: {reason}")]
    RecipeValidation { key: String, reason: String },

    #[error("failed to load recipe `{key}`: {reason}")]
    RecipeLoadFailed { key: String, reason: String },

    #[error("recipe `{consumer}` depends on `{query}` which matches nothing")]
    MissingDependency { consumer: String, query: String },

    #[error(
        "recipe `{consumer}` dependency query `{query}` is ambiguous; matches: {}",
        matches.join(", ")
    )]
    AmbiguousDependency {
        consumer: String,
        query: String,
        matches: Vec<String>,
    },

    #[error("dependency cycle detected: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("alias `{alias}` already registered for `{existing}`, cannot re-register for `{incoming}`")]
    DuplicateAlias {
        alias: String,
        existing: String,
        incoming: String,
    },

    #[error("digest mismatch for `{source_id}`: expected {expected}, got {actual}")]
    DigestMismatch {
        source_id: String,
        expected: String,
        actual: String,
    },

    #[error("failed to fetch `{source_id}`: {reason}")]
    FetchFailed { source_id: String, reason: String },

    #[error("failed to extract `{archive}`: {reason}")]
    ExtractionFailed { archive: String, reason: String },

    #[error("build hook of `{key}` failed: {reason}")]
    BuildFailed { key: String, reason: String },

    #[error("install of `{key}` failed: {reason}")]
    InstallFailed { key: String, reason: String },

    #[error("command `{command}` exited with code {exit_code}")]
    CommandFailed { command: String, exit_code: i32 },

    #[error("product `{product}` not available to `{consumer}`: {reason}")]
    ProductNotFound {
        consumer: String,
        product: String,
        reason: String,
    },

    #[error("`{binding}` is not callable during the {phase} phase")]
    OutOfPhase { binding: String, phase: String },

    #[error("recipe `{consumer}` accessed `{target}` without a dependency edge allowing it")]
    UndeclaredDependency { consumer: String, target: String },

    #[error("template token `{{{{{token}}}}}` has no value")]
    TemplateUnresolved { token: String },

    #[error("dependency `{key}` failed")]
    DependencyFailed { key: String },

    #[error("cancelled")]
    Cancelled,

    #[error("failed to lock cache entry `{path}`: {reason}")]
    CacheLockFailed { path: String, reason: String },

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl EnvyError {
    /// Process exit code the CLI should surface for this failure.
    pub fn exit_code(&self) -> i32 {
        use EnvyError::*;
        match self {
            RecipeValidation { .. } => 2,
            MissingDependency { .. }
            | AmbiguousDependency { .. }
            | DependencyCycle { .. }
            | DuplicateAlias { .. } => 3,
            CacheLockFailed { .. } => 4,
            Cancelled => 130,
            _ => 1,
        }
    }
}

/// Picks an exit code for an arbitrary error chain.
///
/// The whole-error downcast sees [`EnvyError`]s attached as context (the
/// phase-level wrappers); the chain scan sees the original causes.
/// Cancellation dominates: a `Cancelled` buried under phase-level context
/// (e.g. `BuildFailed`) still exits 130. Errors with no typed kind anywhere
/// map to the generic failure code.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    let mut first = err.downcast_ref::<EnvyError>();
    for cause in err.chain() {
        if let Some(kind) = cause.downcast_ref::<EnvyError>() {
            if matches!(kind, EnvyError::Cancelled) {
                return kind.exit_code();
            }
            first.get_or_insert(kind);
        }
    }
    first.map(EnvyError::exit_code).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(EnvyError::Cancelled.exit_code(), 130);
        assert_eq!(
            EnvyError::RecipeValidation {
                key: "a.b@r0".into(),
                reason: "bad".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            EnvyError::DependencyCycle { path: vec![] }.exit_code(),
            3
        );
        assert_eq!(
            EnvyError::CacheLockFailed {
                path: "x".into(),
                reason: "held".into()
            }
            .exit_code(),
            4
        );
    }

    #[test]
    fn exit_code_found_through_context_chain() {
        let err = anyhow::Error::from(EnvyError::Cancelled).context("while doing things");
        assert_eq!(exit_code(&err), 130);
        assert_eq!(exit_code(&anyhow::anyhow!("plain failure")), 1);
    }

    #[test]
    fn cancellation_dominates_phase_context() {
        let err = anyhow::Error::from(EnvyError::Cancelled).context(EnvyError::BuildFailed {
            key: "local.a@r0".into(),
            reason: "build hook failed".into(),
        });
        assert_eq!(exit_code(&err), 130);
    }
}
