//! Typed error taxonomy shared by every crate in the workspace.
//!
//! Each variant is one of seven named error categories, carrying
//! whatever structured context a caller needs to act on it.

use thiserror::Error;

/// The error taxonomy from the design's error-handling section.
///
/// Every fallible operation in the engine, reconciler, and dispatcher
/// returns one of these variants (or wraps a lower-level error into one).
/// The CLI maps each variant to an exit code; see `clusterup::cli::exit_code`.
#[derive(Debug, Error)]
pub enum ClusterupError {
    /// Malformed plan, missing package in phase data, unknown executor tag.
    /// Fatal to the operation; never retried.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Missing operation, missing plan, missing prerequisite package.
    #[error("not found: {message}")]
    NotFound {
        message: String,
        /// User-facing next step, e.g. "run `upgrade --manual` first".
        guidance: Option<String>,
    },

    /// Idempotent creates (admin agent, RBAC resources, cluster name).
    /// Swallowed at the call site; logged, never propagated as a failure.
    #[error("already exists: {message}")]
    AlreadyExists { message: String },

    /// Backend unreachable, network blip, Kubernetes API throttling.
    /// Retried with exponential backoff up to a per-call cap.
    #[error("transient error: {message}")]
    Transient { message: String },

    /// An executor's `execute`, `rollback`, `pre_check`, or `post_check`
    /// returned an error. Recorded as a `Failed` changelog entry.
    #[error("phase {phase_id} failed: {message}")]
    PhaseFailure { phase_id: String, message: String },

    /// The running binary's semver does not match the plan's recorded
    /// `gravity_package` semver. Fatal unless `--skip-version-check`.
    #[error(
        "binary version {found} does not match plan version {expected}; \
         use the matching binary or pass --skip-version-check"
    )]
    VersionMismatch { expected: String, found: String },

    /// A non-root `--phase` was invoked on a node other than the
    /// designated coordinator.
    #[error("phase {phase_id} must be executed on the coordinator node, not {node}")]
    Coordinator { phase_id: String, node: String },
}

impl ClusterupError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into(), guidance: None }
    }

    pub fn not_found_with_guidance(message: impl Into<String>, guidance: impl Into<String>) -> Self {
        Self::NotFound { message: message.into(), guidance: Some(guidance.into()) }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists { message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into() }
    }

    pub fn phase_failure(phase_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PhaseFailure { phase_id: phase_id.into(), message: message.into() }
    }

    pub fn coordinator(phase_id: impl Into<String>, node: impl Into<String>) -> Self {
        Self::Coordinator { phase_id: phase_id.into(), node: node.into() }
    }

    /// True for categories the engine should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// True for the benign "it's already there" case callers may swallow.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_exists_is_benign_not_transient() {
        let err = ClusterupError::already_exists("admin agent");
        assert!(err.is_benign());
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_is_retryable() {
        let err = ClusterupError::transient("backend unreachable");
        assert!(err.is_retryable());
    }

    #[test]
    fn not_found_carries_optional_guidance() {
        let err = ClusterupError::not_found_with_guidance("no operation plan", "run `upgrade --manual` first");
        match err {
            ClusterupError::NotFound { guidance: Some(g), .. } => {
                assert_eq!(g, "run `upgrade --manual` first");
            }
            _ => panic!("expected NotFound with guidance"),
        }
    }

    #[test]
    fn coordinator_message_names_phase_and_node() {
        let err = ClusterupError::coordinator("/masters/m2/drain", "m2");
        let msg = err.to_string();
        assert!(msg.contains("/masters/m2/drain"));
        assert!(msg.contains("m2"));
    }

    #[test]
    fn version_mismatch_message_is_actionable() {
        let err = ClusterupError::VersionMismatch {
            expected: "2.0.0".into(),
            found: "1.9.0".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("2.0.0"));
        assert!(msg.contains("1.9.0"));
        assert!(msg.contains("skip-version-check"));
    }
}
