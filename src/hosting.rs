//! Static-hosting activation.
//!
//! Walks the `NotConfigured -> Configuring -> Propagating -> Live` state
//! machine over the repository host's Pages operations. Propagation delay is
//! never a deployment failure: the commit already succeeded, so a poll
//! deadline yields the expected URL with a caveat instead of an error.

use std::time::{Duration, Instant};

use crate::error::DeployError;
use crate::repohost::{PagesStatus, RepoHost};

/// Phases of hosting activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagesPhase {
    /// Hosting has not been enabled for the repository
    NotConfigured,
    /// Enable request issued, provider has not started building
    Configuring,
    /// Provider is building/propagating the site
    Propagating,
    /// Publicly reachable
    Live,
}

/// Outcome of hosting activation.
#[derive(Debug, Clone)]
pub struct HostingResult {
    /// Public static-site URL (expected URL when still propagating)
    pub pages_url: String,
    /// True when the poll deadline elapsed before the site went live
    pub propagating: bool,
}

/// Polling knobs for [`activate`].
#[derive(Debug, Clone)]
pub struct ActivateOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ActivateOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Ensure a publicly reachable static-site endpoint exists for `repo`.
///
/// Returns `Ok` once the site is `Live`. Returns
/// `Err(DeployError::HostingTimeout)` when the deadline elapses while still
/// propagating; the coordinator treats that as a degraded success and
/// reports the expected URL with a caveat.
pub async fn activate(
    host: &dyn RepoHost,
    repo: &str,
    options: &ActivateOptions,
) -> Result<HostingResult, DeployError> {
    let started = Instant::now();
    let mut phase = PagesPhase::NotConfigured;

    loop {
        let status = match host.pages_status(repo).await {
            Ok(s) => s,
            Err(e) => {
                // Status checks are best-effort; a flaky poll is
                // indistinguishable from propagation in progress.
                tracing::warn!("pages status check for {} failed: {}", repo, e);
                PagesStatus::Building
            }
        };

        phase = match (phase, status) {
            (PagesPhase::NotConfigured, PagesStatus::Disabled) => {
                match host.enable_pages(repo).await {
                    Ok(()) => tracing::info!("enabled pages for {}", repo),
                    Err(e) => {
                        tracing::warn!("enabling pages for {} failed: {}", repo, e);
                    }
                }
                PagesPhase::Configuring
            }
            (_, PagesStatus::Built) => PagesPhase::Live,
            (PagesPhase::NotConfigured, _) | (PagesPhase::Configuring, PagesStatus::Disabled) => {
                PagesPhase::Configuring
            }
            (_, PagesStatus::Building) => PagesPhase::Propagating,
            (p, PagesStatus::Disabled) => p,
        };

        if phase == PagesPhase::Live {
            tracing::info!(
                "pages for {} live after {:?}",
                repo,
                started.elapsed()
            );
            return Ok(HostingResult {
                pages_url: host.pages_url(repo),
                propagating: false,
            });
        }

        if started.elapsed() >= options.timeout {
            tracing::warn!(
                "pages for {} still {:?} after {:?}",
                repo,
                phase,
                started.elapsed()
            );
            return Err(DeployError::HostingTimeout(started.elapsed()));
        }

        tokio::time::sleep(options.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::TreeEntry;
    use crate::repohost::RepoInfo;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Host double whose pages status advances through a scripted sequence,
    /// holding the last value once the script runs out.
    struct SequencedHost {
        statuses: Mutex<Vec<PagesStatus>>,
        enabled: Mutex<bool>,
    }

    impl SequencedHost {
        fn new(mut statuses: Vec<PagesStatus>) -> Self {
            statuses.reverse();
            Self {
                statuses: Mutex::new(statuses),
                enabled: Mutex::new(false),
            }
        }
    }

    #[async_trait]
    impl RepoHost for SequencedHost {
        async fn resolve_repo(&self, _name: &str) -> anyhow::Result<Option<RepoInfo>> {
            unreachable!("not used by activation")
        }
        async fn create_repo(&self, _name: &str) -> anyhow::Result<RepoInfo> {
            unreachable!("not used by activation")
        }
        async fn read_tree(&self, _name: &str) -> anyhow::Result<BTreeMap<String, String>> {
            unreachable!("not used by activation")
        }
        async fn commit_tree(
            &self,
            _name: &str,
            _files: &BTreeMap<String, TreeEntry>,
            _message: &str,
        ) -> anyhow::Result<String> {
            unreachable!("not used by activation")
        }
        async fn enable_pages(&self, _name: &str) -> anyhow::Result<()> {
            *self.enabled.lock().unwrap() = true;
            Ok(())
        }
        async fn pages_status(&self, _name: &str) -> anyhow::Result<PagesStatus> {
            let mut statuses = self.statuses.lock().unwrap();
            Ok(if statuses.len() > 1 {
                statuses.pop().unwrap()
            } else {
                *statuses.last().unwrap()
            })
        }
        fn repo_url(&self, name: &str) -> String {
            format!("https://github.com/test/{}", name)
        }
        fn pages_url(&self, name: &str) -> String {
            format!("https://test.github.io/{}/", name)
        }
    }

    fn fast_options() -> ActivateOptions {
        ActivateOptions {
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_activation_reaches_live() {
        let host = SequencedHost::new(vec![
            PagesStatus::Disabled,
            PagesStatus::Building,
            PagesStatus::Building,
            PagesStatus::Built,
        ]);
        let result = activate(&host, "todo-app", &fast_options()).await.unwrap();
        assert!(!result.propagating);
        assert_eq!(result.pages_url, "https://test.github.io/todo-app/");
        assert!(*host.enabled.lock().unwrap());
    }

    #[tokio::test]
    async fn test_already_live_returns_immediately() {
        let host = SequencedHost::new(vec![PagesStatus::Built]);
        let result = activate(&host, "todo-app", &fast_options()).await.unwrap();
        assert!(!result.propagating);
        assert!(!*host.enabled.lock().unwrap());
    }

    #[tokio::test]
    async fn test_propagation_timeout_is_hosting_timeout() {
        let host = SequencedHost::new(vec![PagesStatus::Disabled, PagesStatus::Building]);
        let err = activate(&host, "todo-app", &fast_options())
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::HostingTimeout(_)));
    }
}
