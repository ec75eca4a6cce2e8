//! Repository hosting capability.
//!
//! `RepoHost` abstracts the version-control provider: repository
//! resolve/create, prior-tree reads, atomic multi-file commits and the
//! static-hosting (Pages) operations the activator polls. `publish` is the
//! one operation the coordinator calls to turn a generated tree into a
//! commit.

mod github;

pub use github::GitHubClient;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::DeployError;
use crate::generate::TreeEntry;

/// A resolved repository.
#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub name: String,
    pub default_branch: String,
}

/// Static-hosting state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagesStatus {
    /// Hosting has not been enabled for the repository
    Disabled,
    /// Enabled, build/propagation still in progress
    Building,
    /// Live and publicly reachable
    Built,
}

/// Capability interface over the version-control / hosting provider.
///
/// Errors are provider-level (`anyhow`); the callers map them into the
/// deployment taxonomy (`RepoCreateFailed`, `CommitFailed`, ...).
#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Look up a repository by name. `None` when it does not exist.
    async fn resolve_repo(&self, name: &str) -> anyhow::Result<Option<RepoInfo>>;

    /// Create a public repository.
    async fn create_repo(&self, name: &str) -> anyhow::Result<RepoInfo>;

    /// Read the text files of the repository HEAD as path -> content.
    /// Empty map for an empty repository.
    async fn read_tree(&self, name: &str) -> anyhow::Result<BTreeMap<String, String>>;

    /// Write all entries as one atomic commit and return its identifier.
    ///
    /// Files absent from `files` but present in HEAD are left untouched;
    /// `TreeEntry::Delete` removes a path explicitly. A partially written
    /// tree must never become HEAD.
    async fn commit_tree(
        &self,
        name: &str,
        files: &BTreeMap<String, TreeEntry>,
        message: &str,
    ) -> anyhow::Result<String>;

    /// Enable static hosting for the repository (idempotent).
    async fn enable_pages(&self, name: &str) -> anyhow::Result<()>;

    /// Current static-hosting state.
    async fn pages_status(&self, name: &str) -> anyhow::Result<PagesStatus>;

    /// Canonical repository URL.
    fn repo_url(&self, name: &str) -> String;

    /// Expected public static-site URL.
    fn pages_url(&self, name: &str) -> String;
}

/// Result of publishing one generated tree.
#[derive(Debug, Clone)]
pub struct Published {
    /// Repository name derived from the task
    pub repo: String,
    /// Canonical repository URL
    pub repo_url: String,
    /// Identifier of the new commit
    pub commit_sha: String,
    /// Whether this publish created the repository
    pub created: bool,
}

/// Publish a generated tree: resolve (or create) the task's repository and
/// write the tree as a single commit.
pub async fn publish(
    host: &dyn RepoHost,
    task: &str,
    files: &BTreeMap<String, TreeEntry>,
    message: &str,
) -> Result<Published, DeployError> {
    let repo = repo_slug(task);

    let existing = host
        .resolve_repo(&repo)
        .await
        .map_err(|e| DeployError::RepoCreateFailed(format!("resolving {}: {}", repo, e)))?;

    let created = existing.is_none();
    if created {
        host.create_repo(&repo)
            .await
            .map_err(|e| DeployError::RepoCreateFailed(e.to_string()))?;
        tracing::info!("created repository {}", repo);
    }

    let commit_sha = host
        .commit_tree(&repo, files, message)
        .await
        .map_err(|e| DeployError::CommitFailed(e.to_string()))?;

    tracing::info!(
        "committed {} entries to {} as {}",
        files.len(),
        repo,
        commit_sha
    );

    Ok(Published {
        repo_url: host.repo_url(&repo),
        repo,
        commit_sha,
        created,
    })
}

/// Deterministic repository name for a task.
///
/// Lowercases, maps every non-alphanumeric run to a single `-`, and trims.
/// The same task always maps to the same repository.
pub fn repo_slug(task: &str) -> String {
    let mut slug = String::with_capacity(task.len());
    let mut last_dash = true;
    for c in task.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(100);
    slug
}
