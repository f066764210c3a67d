use thiserror::Error;

/// Applies a complete manifest bundle to the cluster.
///
/// Must be idempotent: applying the same bundle twice leaves the same end state.
/// Multi-document bundles are one opaque call; partial success is not inspected.
pub trait Applier {
    fn apply(&mut self, manifest_bundle: &str) -> Result<(), ApplyError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("failed to stage manifests: {0}")]
    Staging(String),
    #[error("failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },
    #[error("apply exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("apply rejected bundle: {0}")]
    Rejected(String),
}
