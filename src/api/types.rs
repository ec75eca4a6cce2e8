//! API request and response types.

use serde::{Deserialize, Serialize};

/// Reference to an attachment supplied with a deployment request.
///
/// The `url` is either an inline `data:` URI or a remote HTTP(S) URL; the
/// attachment resolver materializes it into bytes before generation runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// File name the brief refers to the attachment by
    pub name: String,

    /// Inline data URI or remote URL
    pub url: String,
}

/// Inbound request to deploy one round of a task.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    /// Caller's email, echoed in the notification payload
    pub email: String,

    /// Shared secret; checked before anything else runs
    pub secret: String,

    /// Task name; also determines the repository name
    pub task: String,

    /// Round number, starting at 1
    pub round: u32,

    /// Caller-supplied token distinguishing otherwise-identical attempts
    pub nonce: String,

    /// Natural-language project brief
    pub brief: String,

    /// Acceptance criteria the generated project is evaluated against
    pub checks: Vec<String>,

    /// Callback URL the final outcome is posted to
    pub evaluation_url: String,

    /// Input assets for the generated project
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

/// Outcome of one deployment round.
///
/// Serves as both the synchronous response body and (extended with the
/// request identity) the notification payload. Immutable once constructed;
/// replays of a processed (task, round, nonce) triple receive this exact
/// value from the idempotency log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployOutcome {
    /// Whether the round deployed a commit
    pub success: bool,

    /// Human-readable summary of what happened
    pub message: String,

    /// Canonical repository URL ("" until known)
    #[serde(default)]
    pub repo_url: String,

    /// Identifier of the commit this round produced ("" on failure)
    #[serde(default)]
    pub commit_sha: String,

    /// Public static-site URL ("" until hosting is at least expected)
    #[serde(default)]
    pub pages_url: String,
}

impl DeployOutcome {
    /// Build a failure outcome carrying whatever partial results exist.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            repo_url: String::new(),
            commit_sha: String::new(),
            pages_url: String::new(),
        }
    }
}

/// Payload posted to the caller's evaluation URL.
///
/// The outcome fields are flattened so the callback sees the same JSON shape
/// as the synchronous response, plus the identity of the attempt it belongs
/// to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub email: String,
    pub task: String,
    pub round: u32,
    pub nonce: String,
    #[serde(flatten)]
    pub outcome: DeployOutcome,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,
}
