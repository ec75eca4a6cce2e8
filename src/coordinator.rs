//! Round coordination.
//!
//! The coordinator owns the end-to-end lifecycle of one deployment round:
//! authentication, validation, idempotency claim, attachment resolution,
//! generation, publishing, hosting activation and notification. Stage
//! failures past the claim become recorded `success: false` outcomes rather
//! than HTTP errors; only authentication and validation short-circuit.

use constant_time_eq::constant_time_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::api::types::{DeployOutcome, DeployRequest, NotificationPayload};
use crate::attachments::AttachmentResolver;
use crate::config::Config;
use crate::error::DeployError;
use crate::generate::{
    self, Engine, GenerationResult, TreeEntry,
};
use crate::hosting::{self, ActivateOptions};
use crate::notify::Notifier;
use crate::repohost::{self, RepoHost};
use crate::state::{Begin, RoundRecord, StateStore};

/// How long a duplicate in-flight request waits for the first one to finish.
const DUPLICATE_WAIT: Duration = Duration::from_secs(45);

/// Maximum length of the brief fragment embedded in commit messages.
const COMMIT_BRIEF_CAP: usize = 80;

pub struct Coordinator {
    config: Config,
    engine: Engine,
    host: Arc<dyn RepoHost>,
    resolver: AttachmentResolver,
    state: Arc<StateStore>,
    notifier: Notifier,
    activate_options: ActivateOptions,
}

impl Coordinator {
    pub fn new(
        config: Config,
        engine: Engine,
        host: Arc<dyn RepoHost>,
        resolver: AttachmentResolver,
        state: Arc<StateStore>,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            engine,
            host,
            resolver,
            state,
            notifier,
            activate_options: ActivateOptions::default(),
        }
    }

    #[cfg(test)]
    fn with_activate_options(mut self, options: ActivateOptions) -> Self {
        self.activate_options = options;
        self
    }

    /// Process one deployment request end to end.
    ///
    /// Returns `Err` only for `Unauthorized` and `Validation`; every failure
    /// past the idempotency claim is recorded and returned as a
    /// `success: false` outcome so replays observe the same answer.
    pub async fn handle(&self, request: DeployRequest) -> Result<DeployOutcome, DeployError> {
        if !constant_time_eq(
            request.secret.as_bytes(),
            self.config.api_secret.as_bytes(),
        ) {
            return Err(DeployError::Unauthorized);
        }
        validate(&request)?;

        let (task, round, nonce) = (&request.task, request.round, &request.nonce);

        match self.state.begin(task, round, nonce) {
            Begin::Fresh => {}
            Begin::Completed(outcome) => {
                tracing::info!(
                    "replay of {} round {} nonce {}, returning recorded outcome",
                    task,
                    round,
                    nonce
                );
                return Ok(outcome);
            }
            Begin::InProgress => {
                tracing::info!(
                    "duplicate in-flight request for {} round {} nonce {}, waiting",
                    task,
                    round,
                    nonce
                );
                let waited = self
                    .state
                    .wait_for_completion(task, round, nonce, DUPLICATE_WAIT)
                    .await;
                return Ok(waited.unwrap_or_else(|| {
                    DeployOutcome::failure(
                        DeployError::Duplicate {
                            task: task.clone(),
                            round,
                            nonce: nonce.clone(),
                        }
                        .to_string(),
                    )
                }));
            }
        }

        // Rounds only move forward. A round the task has not reached yet is
        // a caller error, not a deployment failure, so the claim is released
        // rather than burned.
        let record = self.state.round_record(task);
        let last_round = record.as_ref().map(|r| r.last_round).unwrap_or(0);
        if round > last_round + 1 {
            self.state.abandon(task, round, nonce);
            return Err(DeployError::Validation(format!(
                "round {} requested but task '{}' has only completed round {}",
                round, task, last_round
            )));
        }

        let run_id = uuid::Uuid::new_v4();
        tracing::info!(
            "run {}: processing {} round {} nonce {} ({} checks, {} attachments)",
            run_id,
            task,
            round,
            nonce,
            request.checks.len(),
            request.attachments.len()
        );

        let outcome = match self.run_round(&request, record).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("run {}: {} round {} failed: {}", run_id, task, round, e);
                DeployOutcome::failure(e.to_string())
            }
        };

        if let Err(e) = self.state.complete(task, round, nonce, &outcome) {
            tracing::error!("failed to persist outcome for {} round {}: {}", task, round, e);
        }

        self.notifier.spawn(
            request.evaluation_url.clone(),
            NotificationPayload {
                email: request.email.clone(),
                task: task.clone(),
                round,
                nonce: nonce.clone(),
                outcome: outcome.clone(),
            },
        );

        Ok(outcome)
    }

    /// Run the deployment stages for one claimed round.
    async fn run_round(
        &self,
        request: &DeployRequest,
        record: Option<RoundRecord>,
    ) -> Result<DeployOutcome, DeployError> {
        let repo = repohost::repo_slug(&request.task);

        // Incremental rounds build on the committed tree, not on what the
        // model remembers. A read failure degrades to a fresh generation;
        // the commit still only touches generated paths.
        let prior_tree = match &record {
            Some(rec) => match self.host.read_tree(&rec.repo_name).await {
                Ok(tree) => Some(tree),
                Err(e) => {
                    tracing::warn!(
                        "could not read prior tree of {}, generating fresh: {}",
                        rec.repo_name,
                        e
                    );
                    None
                }
            },
            None => None,
        };

        let attachments = self.resolver.resolve(&request.attachments).await?;
        let attachment_names: Vec<String> =
            attachments.iter().map(|a| a.name.clone()).collect();

        let generated = self
            .engine
            .generate(
                &request.brief,
                &request.checks,
                &attachment_names,
                prior_tree.as_ref(),
            )
            .await?;

        let mut files = generated.files.clone();

        // attachments.js is owned by the service; the model is told never to
        // produce it. Entries accumulate across rounds.
        files.remove("attachments.js");
        let mut attachment_map = prior_tree
            .as_ref()
            .and_then(|t| t.get("attachments.js"))
            .map(|content| generate::parse_attachments_js(content))
            .unwrap_or_default();
        for att in &attachments {
            attachment_map.insert(att.name.clone(), att.as_data_uri());
        }
        if !attachment_map.is_empty() {
            files.insert(
                "attachments.js".to_string(),
                TreeEntry::Text(generate::build_attachments_js(&attachment_map)),
            );
        }

        if let Some(TreeEntry::Text(html)) = files.get("index.html") {
            let completed = generate::complete_html(html);
            files.insert("index.html".to_string(), TreeEntry::Text(completed));
        }

        let has_prior = |name: &str| {
            prior_tree
                .as_ref()
                .map(|t| t.contains_key(name))
                .unwrap_or(false)
        };
        // A check that names the MIT license gets the canonical text even if
        // the model emitted its own LICENSE.
        let mit_required = request
            .checks
            .iter()
            .any(|c| c.to_lowercase().contains("mit license"));
        if mit_required || (!files.contains_key("LICENSE") && !has_prior("LICENSE")) {
            files.insert("LICENSE".to_string(), TreeEntry::Text(generate::mit_license()));
        }
        if !files.contains_key("README.md") && !has_prior("README.md") {
            files.insert(
                "README.md".to_string(),
                TreeEntry::Text(generate::fallback_readme(
                    &repo,
                    &request.brief,
                    &request.checks,
                )),
            );
        }

        // The entry point is non-negotiable; a tree without it would deploy
        // a 404 as the site.
        if !files.contains_key("index.html") && !has_prior("index.html") {
            return Err(DeployError::GenerationFailed(
                "generated tree has no index.html".to_string(),
            ));
        }

        let message = commit_message(request.round, &request.brief);
        let published =
            match repohost::publish(self.host.as_ref(), &request.task, &files, &message).await {
                Ok(p) => p,
                // A rejected commit still means the repository exists; keep
                // that partial result in the recorded outcome.
                Err(e @ DeployError::CommitFailed(_)) => {
                    let mut outcome = DeployOutcome::failure(e.to_string());
                    outcome.repo_url = self.host.repo_url(&repo);
                    return Ok(outcome);
                }
                Err(e) => return Err(e),
            };

        let (pages_url, propagating) =
            match hosting::activate(self.host.as_ref(), &published.repo, &self.activate_options)
                .await
            {
                Ok(result) => (result.pages_url, result.propagating),
                Err(e) if e.is_degraded_only() => {
                    // The commit landed; a slow Pages build is a caveat,
                    // not a failed deployment.
                    (self.host.pages_url(&published.repo), true)
                }
                Err(e) => return Err(e),
            };

        let record = RoundRecord {
            repo_name: published.repo.clone(),
            repo_url: published.repo_url.clone(),
            commit_sha: published.commit_sha.clone(),
            pages_url: pages_url.clone(),
            last_round: request.round,
            updated_at: chrono::Utc::now(),
        };
        if let Err(e) = self.state.put_round_record(&request.task, record) {
            // The commit is already visible; a record that failed to flush
            // costs only the incremental context of the next round.
            tracing::error!("failed to persist round record for {}: {}", request.task, e);
        }

        Ok(DeployOutcome {
            success: true,
            message: outcome_message(request.round, &generated, propagating),
            repo_url: published.repo_url,
            commit_sha: published.commit_sha,
            pages_url,
        })
    }
}

/// Semantic validation past JSON deserialization.
fn validate(request: &DeployRequest) -> Result<(), DeployError> {
    let invalid = |msg: &str| Err(DeployError::Validation(msg.to_string()));

    if request.round < 1 {
        return invalid("round must be at least 1");
    }
    if request.nonce.trim().is_empty() {
        return invalid("nonce must not be empty");
    }
    if request.task.trim().is_empty() || repohost::repo_slug(&request.task).is_empty() {
        return invalid("task must contain at least one alphanumeric character");
    }
    if request.brief.trim().is_empty() {
        return invalid("brief must not be empty");
    }
    match url::Url::parse(&request.evaluation_url) {
        Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
        _ => return invalid("evaluation_url must be a valid http(s) URL"),
    }
    for att in &request.attachments {
        if att.name.trim().is_empty() {
            return invalid("attachment name must not be empty");
        }
        let is_http = url::Url::parse(&att.url)
            .map(|u| u.scheme() == "http" || u.scheme() == "https")
            .unwrap_or(false);
        if !crate::attachments::is_data_uri(&att.url) && !is_http {
            return Err(DeployError::Validation(format!(
                "attachment '{}' must be a data URI or http(s) URL",
                att.name
            )));
        }
    }
    Ok(())
}

/// Commit message for a round, with the brief flattened and capped.
fn commit_message(round: u32, brief: &str) -> String {
    let flat = brief.split_whitespace().collect::<Vec<_>>().join(" ");
    let summary: String = flat.chars().take(COMMIT_BRIEF_CAP).collect();
    format!("Round {}: {}", round, summary)
}

fn outcome_message(round: u32, generated: &GenerationResult, propagating: bool) -> String {
    let total = generated.verdicts.len();
    let mut message = if generated.all_passed() {
        format!("Round {} deployed ({}/{} checks passed)", round, total, total)
    } else {
        format!(
            "Round {} deployed best attempt ({}/{} checks passed; failing: {})",
            round,
            generated.passing_count(),
            total,
            generated.failing_checks().join("; ")
        )
    };
    if propagating {
        message.push_str("; site is still propagating and may not be reachable yet");
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::AttachmentRef;
    use crate::llm::{ChatMessage, ChatOptions, ChatResponse, LlmClient};
    use crate::repohost::{PagesStatus, RepoInfo};
    use async_trait::async_trait;
    use base64::Engine as _;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedLlm {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<&str>) -> Self {
            let mut v: Vec<String> = responses.into_iter().map(String::from).collect();
            v.reverse();
            Self {
                responses: Mutex::new(v),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat_completion(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _options: ChatOptions,
        ) -> anyhow::Result<ChatResponse> {
            let content = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("scripted LLM ran out of responses"))?;
            Ok(ChatResponse {
                content,
                finish_reason: Some("stop".to_string()),
                usage: None,
                model: None,
            })
        }
    }

    #[derive(Default)]
    struct FakeHostState {
        repos: HashMap<String, BTreeMap<String, String>>,
        commits: u32,
        pages_enabled: bool,
    }

    /// In-memory host. Pages report `Built` once enabled unless
    /// `stuck_building` is set.
    struct FakeHost {
        state: Mutex<FakeHostState>,
        stuck_building: bool,
        fail_commit: bool,
    }

    impl FakeHost {
        fn new() -> Self {
            Self {
                state: Mutex::new(FakeHostState::default()),
                stuck_building: false,
                fail_commit: false,
            }
        }

        fn stuck() -> Self {
            Self {
                stuck_building: true,
                ..Self::new()
            }
        }

        fn rejecting_commits() -> Self {
            Self {
                fail_commit: true,
                ..Self::new()
            }
        }

        fn commits(&self) -> u32 {
            self.state.lock().unwrap().commits
        }

        fn file(&self, repo: &str, path: &str) -> Option<String> {
            self.state
                .lock()
                .unwrap()
                .repos
                .get(repo)
                .and_then(|t| t.get(path))
                .cloned()
        }
    }

    #[async_trait]
    impl RepoHost for FakeHost {
        async fn resolve_repo(&self, name: &str) -> anyhow::Result<Option<RepoInfo>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .repos
                .contains_key(name)
                .then(|| RepoInfo {
                    name: name.to_string(),
                    default_branch: "main".to_string(),
                }))
        }

        async fn create_repo(&self, name: &str) -> anyhow::Result<RepoInfo> {
            self.state
                .lock()
                .unwrap()
                .repos
                .insert(name.to_string(), BTreeMap::new());
            Ok(RepoInfo {
                name: name.to_string(),
                default_branch: "main".to_string(),
            })
        }

        async fn read_tree(&self, name: &str) -> anyhow::Result<BTreeMap<String, String>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .repos
                .get(name)
                .cloned()
                .unwrap_or_default())
        }

        async fn commit_tree(
            &self,
            name: &str,
            files: &BTreeMap<String, TreeEntry>,
            _message: &str,
        ) -> anyhow::Result<String> {
            if self.fail_commit {
                anyhow::bail!("update is not a fast forward");
            }
            let mut state = self.state.lock().unwrap();
            let tree = state.repos.entry(name.to_string()).or_default();
            for (path, entry) in files {
                match entry {
                    TreeEntry::Text(content) => {
                        tree.insert(path.clone(), content.clone());
                    }
                    TreeEntry::Binary(_) => {
                        tree.insert(path.clone(), String::new());
                    }
                    TreeEntry::Delete => {
                        tree.remove(path);
                    }
                }
            }
            state.commits += 1;
            Ok(format!("sha-{}", state.commits))
        }

        async fn enable_pages(&self, _name: &str) -> anyhow::Result<()> {
            self.state.lock().unwrap().pages_enabled = true;
            Ok(())
        }

        async fn pages_status(&self, _name: &str) -> anyhow::Result<PagesStatus> {
            let enabled = self.state.lock().unwrap().pages_enabled;
            Ok(match (enabled, self.stuck_building) {
                (false, _) => PagesStatus::Disabled,
                (true, true) => PagesStatus::Building,
                (true, false) => PagesStatus::Built,
            })
        }

        fn repo_url(&self, name: &str) -> String {
            format!("https://github.com/test/{}", name)
        }

        fn pages_url(&self, name: &str) -> String {
            format!("https://test.github.io/{}/", name)
        }
    }

    fn coordinator(
        dir: &TempDir,
        host: Arc<FakeHost>,
        responses: Vec<&str>,
    ) -> Coordinator {
        let config = Config::new("s3cret".into(), "test".into(), dir.path().to_path_buf());
        let engine = Engine::new(
            Arc::new(ScriptedLlm::new(responses)),
            config.model.clone(),
            config.max_repairs,
        );
        let state = Arc::new(StateStore::load(dir.path()).unwrap());
        Coordinator::new(
            config,
            engine,
            host,
            AttachmentResolver::default(),
            state,
            Notifier::default(),
        )
        .with_activate_options(ActivateOptions {
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(50),
        })
    }

    fn request(round: u32, nonce: &str) -> DeployRequest {
        DeployRequest {
            email: "dev@example.com".into(),
            secret: "s3cret".into(),
            task: "todo-app".into(),
            round,
            nonce: nonce.into(),
            brief: "a todo list".into(),
            checks: vec!["has add button".into()],
            evaluation_url: "http://127.0.0.1:1/callback".into(),
            attachments: vec![],
        }
    }

    const ROUND1_TREE: &str =
        r##"{"index.html": "<html><body><button>Add</button></body></html>", "README.md": "# app"}"##;

    #[tokio::test]
    async fn test_round_one_deploys_fresh_repo() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&dir, host.clone(), vec![ROUND1_TREE, "[true]"]);

        let outcome = coord.handle(request(1, "n-1")).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.repo_url, "https://github.com/test/todo-app");
        assert_eq!(outcome.pages_url, "https://test.github.io/todo-app/");
        assert_eq!(outcome.commit_sha, "sha-1");
        assert_eq!(host.commits(), 1);

        // Service-owned files are filled in
        assert!(host
            .file("todo-app", "LICENSE")
            .unwrap()
            .contains("MIT License"));
        assert!(host.file("todo-app", "README.md").is_some());
    }

    #[tokio::test]
    async fn test_replayed_nonce_returns_recorded_outcome_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&dir, host.clone(), vec![ROUND1_TREE, "[true]"]);

        let first = coord.handle(request(1, "n-1")).await.unwrap();
        let replay = coord.handle(request(1, "n-1")).await.unwrap();
        assert_eq!(first, replay);
        assert_eq!(host.commits(), 1, "replay must not commit again");
    }

    #[tokio::test]
    async fn test_round_two_builds_on_existing_tree() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(
            &dir,
            host.clone(),
            vec![
                ROUND1_TREE,
                "[true]",
                // Round 2 only changes index.html
                r#"{"index.html": "<html><body><button>Add</button><button>Del</button></body></html>"}"#,
                "[true]",
            ],
        );

        coord.handle(request(1, "n-1")).await.unwrap();
        let mut second = request(2, "n-2");
        second.brief = "also support deleting".into();
        let outcome = coord.handle(second).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.commit_sha, "sha-2");
        assert_eq!(host.commits(), 2);
        // Round 1 files survive a round 2 commit that did not touch them
        assert!(host.file("todo-app", "LICENSE").is_some());
        assert!(host
            .file("todo-app", "index.html")
            .unwrap()
            .contains("Del"));
    }

    #[tokio::test]
    async fn test_out_of_order_round_is_rejected() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&dir, host.clone(), vec![]);

        let err = coord.handle(request(3, "n-3")).await.unwrap_err();
        assert!(matches!(err, DeployError::Validation(_)));
        assert_eq!(host.commits(), 0);

        // The claim was released; the same nonce works once rounds catch up.
        let coord = coordinator(&dir, host.clone(), vec![ROUND1_TREE, "[true]"]);
        let mut req = request(1, "n-3");
        req.nonce = "n-3".into();
        assert!(coord.handle(req).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_bad_secret_rejected_before_any_work() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(&dir, host.clone(), vec![]);

        let mut req = request(1, "n-1");
        req.secret = "wrong".into();
        let err = coord.handle(req).await.unwrap_err();
        assert!(matches!(err, DeployError::Unauthorized));
        assert_eq!(host.commits(), 0);
    }

    #[tokio::test]
    async fn test_validation_failures_rejected() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir, Arc::new(FakeHost::new()), vec![]);

        let mut no_nonce = request(1, "  ");
        no_nonce.nonce = "  ".into();
        assert!(matches!(
            coord.handle(no_nonce).await.unwrap_err(),
            DeployError::Validation(_)
        ));

        let mut bad_url = request(1, "n-1");
        bad_url.evaluation_url = "not a url".into();
        assert!(matches!(
            coord.handle(bad_url).await.unwrap_err(),
            DeployError::Validation(_)
        ));

        let mut bad_task = request(1, "n-2");
        bad_task.task = "!!!".into();
        assert!(matches!(
            coord.handle(bad_task).await.unwrap_err(),
            DeployError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_generation_failure_becomes_recorded_failure_outcome() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(
            &dir,
            host.clone(),
            vec!["garbage", "more garbage", "still garbage"],
        );

        let outcome = coord.handle(request(1, "n-1")).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("generation failed"));
        assert_eq!(host.commits(), 0);

        // Replays of the failed attempt get the same recorded failure
        let replay = coord.handle(request(1, "n-1")).await.unwrap();
        assert_eq!(outcome, replay);
    }

    #[tokio::test]
    async fn test_hosting_timeout_is_reported_as_degraded_success() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::stuck());
        let coord = coordinator(&dir, host.clone(), vec![ROUND1_TREE, "[true]"]);

        let outcome = coord.handle(request(1, "n-1")).await.unwrap();
        assert!(outcome.success, "commit landed, slow pages is a caveat");
        assert_eq!(outcome.pages_url, "https://test.github.io/todo-app/");
        assert!(outcome.message.contains("propagating"));
        assert_eq!(host.commits(), 1);
    }

    #[tokio::test]
    async fn test_missing_index_html_is_a_generation_failure() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(
            &dir,
            host.clone(),
            vec![r#"{"style.css": "body { margin: 0; }"}"#, "[true]"],
        );

        let outcome = coord.handle(request(1, "n-1")).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("index.html"));
        assert_eq!(host.commits(), 0);
    }

    #[tokio::test]
    async fn test_rejected_commit_keeps_repo_url_in_failure_outcome() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::rejecting_commits());
        let coord = coordinator(&dir, host.clone(), vec![ROUND1_TREE, "[true]"]);

        let outcome = coord.handle(request(1, "n-1")).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("commit rejected"));
        assert_eq!(outcome.repo_url, "https://github.com/test/todo-app");
        assert!(outcome.commit_sha.is_empty());
    }

    #[tokio::test]
    async fn test_mit_check_forces_canonical_license() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::new());
        // The model keeps emitting its own license text; three attempts
        // because the MIT check fails statically each time.
        let tree = r#"{"index.html": "<html></html>", "LICENSE": "All rights reserved"}"#;
        let coord = coordinator(&dir, host.clone(), vec![tree, tree, tree]);

        let mut req = request(1, "n-1");
        req.checks = vec!["repo carries the MIT license".into()];
        let outcome = coord.handle(req).await.unwrap();

        assert!(outcome.success);
        assert!(host
            .file("todo-app", "LICENSE")
            .unwrap()
            .contains("MIT License"));
    }

    #[tokio::test]
    async fn test_attachments_accumulate_across_rounds() {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(FakeHost::new());
        let coord = coordinator(
            &dir,
            host.clone(),
            vec![ROUND1_TREE, "[true]", ROUND1_TREE, "[true]"],
        );

        let data_uri = |payload: &[u8]| {
            format!(
                "data:text/csv;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(payload)
            )
        };

        let mut first = request(1, "n-1");
        first.attachments = vec![AttachmentRef {
            name: "a.csv".into(),
            url: data_uri(b"round one"),
        }];
        coord.handle(first).await.unwrap();

        let mut second = request(2, "n-2");
        second.attachments = vec![AttachmentRef {
            name: "b.csv".into(),
            url: data_uri(b"round two"),
        }];
        coord.handle(second).await.unwrap();

        let js = host.file("todo-app", "attachments.js").unwrap();
        let map = generate::parse_attachments_js(&js);
        assert!(map.contains_key("a.csv"), "round 1 attachment kept");
        assert!(map.contains_key("b.csv"), "round 2 attachment added");
    }

    #[test]
    fn test_commit_message_flattens_and_caps_brief() {
        let msg = commit_message(2, "add a\ndelete button");
        assert_eq!(msg, "Round 2: add a delete button");

        let long = "x".repeat(500);
        let msg = commit_message(1, &long);
        assert!(msg.len() <= "Round 1: ".len() + COMMIT_BRIEF_CAP);
    }
}
