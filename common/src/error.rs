//! Fatal-error tagging shared across the pipeline
//!
//! Most failures are batch-scoped and subject to the continue-on-error
//! policy. A small class of invariant violations (task-count mismatch,
//! archive over-release, missing required dependency) must halt the pipeline
//! regardless of policy; they are tagged by wrapping a [`FatalError`] into
//! the anyhow chain so the monitor can spot them at the single decision
//! point.

/// Marker error for invariant violations that always halt the pipeline.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct FatalError {
    message: String,
}

impl FatalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Builds a fatal-tagged `anyhow::Error`.
pub fn fatal(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(FatalError::new(message))
}

/// True if any error in the chain is fatal-tagged.
pub fn is_fatal(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<FatalError>().is_some())
}
