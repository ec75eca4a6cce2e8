//! Deployment error taxonomy.
//!
//! Stage-local failures (attachments, generation, publishing, hosting) are
//! caught by the coordinator and converted into a `success: false` outcome;
//! only `Unauthorized` and `Validation` short-circuit to HTTP status codes.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the deployment pipeline.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The shared secret in the request did not match. No downstream
    /// component is invoked when this is returned.
    #[error("invalid secret")]
    Unauthorized,

    /// The request body was structurally valid JSON but failed semantic
    /// validation (bad round number, malformed URL, illegal task name, ...).
    #[error("invalid request: {0}")]
    Validation(String),

    /// Another in-flight attempt holds the same (task, round, nonce) triple.
    #[error("duplicate attempt for task '{task}' round {round} (nonce {nonce})")]
    Duplicate {
        task: String,
        round: u32,
        nonce: String,
    },

    /// A remote attachment could not be fetched within the timeout and size
    /// limits.
    #[error("attachment '{name}' could not be fetched: {reason}")]
    AttachmentFetch { name: String, reason: String },

    /// An inline attachment payload could not be decoded.
    #[error("attachment '{name}' is malformed: {reason}")]
    MalformedAttachment { name: String, reason: String },

    /// The model produced no usable file tree after exhausting the repair
    /// budget.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// A generated file path would escape the project root.
    #[error("unsafe generated path: {0:?}")]
    UnsafeGeneratedPath(String),

    /// The hosting provider rejected repository creation after retries.
    #[error("repository creation failed: {0}")]
    RepoCreateFailed(String),

    /// The provider rejected the commit (for example a conflicting
    /// concurrent update). The round record is not advanced in this case.
    #[error("commit rejected: {0}")]
    CommitFailed(String),

    /// Static hosting was still propagating when the poll deadline elapsed.
    /// Non-fatal: the coordinator reports the expected URL with a caveat.
    #[error("hosting not live after {0:?}")]
    HostingTimeout(Duration),

    /// Callback delivery failed after all attempts. Logged only; never
    /// surfaced to the original caller.
    #[error("notification delivery failed: {0}")]
    NotificationFailed(String),
}

impl DeployError {
    /// Whether this error still allows the deployment as a whole to be
    /// reported as successful (the commit already happened).
    pub fn is_degraded_only(&self) -> bool {
        matches!(
            self,
            DeployError::HostingTimeout(_) | DeployError::NotificationFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosting_timeout_is_degraded_only() {
        assert!(DeployError::HostingTimeout(Duration::from_secs(60)).is_degraded_only());
        assert!(!DeployError::CommitFailed("conflict".into()).is_degraded_only());
        assert!(!DeployError::Unauthorized.is_degraded_only());
    }
}
