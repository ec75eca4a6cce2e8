//! GitHub REST implementation of the repository hosting capability.
//!
//! Commits go through the git data API (blobs -> tree -> commit -> ref) so a
//! K-file project is always exactly one commit; sequential per-file commits
//! would expose partially written trees as HEAD. Transient provider errors
//! (rate limits, 5xx, network) are retried with the same classification the
//! LLM client uses.

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{PagesStatus, RepoHost, RepoInfo};
use crate::generate::TreeEntry;
use crate::llm::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "autodeployd";
const BRANCH: &str = "main";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct GitHubClient {
    client: Client,
    token: String,
    owner: String,
    api_base: String,
    retry_config: RetryConfig,
}

impl GitHubClient {
    pub fn new(client: Client, token: String, owner: String) -> Self {
        Self {
            client,
            token,
            owner,
            api_base: API_BASE.to_string(),
            retry_config: RetryConfig {
                max_retries: 2,
                max_retry_duration: Duration::from_secs(60),
            },
        }
    }

    /// Point the client at a different API endpoint (GitHub Enterprise or a
    /// local stub).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base.trim_end_matches('/'), path)
    }

    /// Issue one request, classifying failures for the retry loop.
    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, LlmError> {
        let mut req = self
            .client
            .request(method, self.url(path))
            .bearer_auth(&self.token)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .timeout(REQUEST_TIMEOUT);
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::network_error(format!("github request timeout: {}", e))
            } else {
                LlmError::network_error(format!("github request failed: {}", e))
            }
        })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let status_code = status.as_u16();
            let message = format!("{} {}: {}", status_code, path, truncate(&text, 300));
            return Err(match classify_http_status(status_code) {
                LlmErrorKind::RateLimited => LlmError::rate_limited(message, None),
                LlmErrorKind::ClientError => LlmError::client_error(status_code, message),
                _ => LlmError::server_error(status_code, message),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| LlmError::parse_error(format!("github response for {}: {}", path, e)))
    }

    /// Issue a request with bounded retry for transient failures.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, LlmError> {
        let mut attempt = 0;
        loop {
            match self.send_once(method.clone(), path, body).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.retry_config.max_retries => {
                    let delay = e.suggested_delay(attempt);
                    tracing::warn!(
                        "github {} {} failed ({}), retrying in {:?}",
                        method,
                        path,
                        e.kind,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn repo_path(&self, name: &str, suffix: &str) -> String {
        format!("/repos/{}/{}{}", self.owner, name, suffix)
    }

    /// Head commit sha of the branch, or None for an empty repository.
    async fn head_sha(&self, name: &str) -> Result<Option<String>, LlmError> {
        let path = self.repo_path(name, &format!("/git/ref/heads/{}", BRANCH));
        match self.send(Method::GET, &path, None).await {
            Ok(v) => Ok(v["object"]["sha"].as_str().map(String::from)),
            Err(e) if e.status_code == Some(404) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create a blob and return its sha. Needed for binary content, which
    /// cannot be inlined into a tree element.
    async fn create_blob(&self, name: &str, bytes: &[u8]) -> Result<String, LlmError> {
        let body = json!({
            "content": base64::engine::general_purpose::STANDARD.encode(bytes),
            "encoding": "base64",
        });
        let v = self
            .send(
                Method::POST,
                &self.repo_path(name, "/git/blobs"),
                Some(&body),
            )
            .await?;
        v["sha"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| LlmError::parse_error("blob response missing sha".to_string()))
    }
}

/// Build one git tree element for the commit payload.
///
/// Deletions must carry an explicit `"sha": null`; omitting the field would
/// make the API treat the entry as invalid instead of removing the path.
fn tree_element(path: &str, content: Option<&str>, blob_sha: Option<&str>) -> Value {
    let mut element = json!({
        "path": path,
        "mode": "100644",
        "type": "blob",
    });
    match (content, blob_sha) {
        (Some(text), _) => {
            element["content"] = json!(text);
        }
        (None, Some(sha)) => {
            element["sha"] = json!(sha);
        }
        (None, None) => {
            element["sha"] = Value::Null;
        }
    }
    element
}

/// Cut an error body to at most `max` bytes without splitting a character.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[async_trait]
impl RepoHost for GitHubClient {
    async fn resolve_repo(&self, name: &str) -> anyhow::Result<Option<RepoInfo>> {
        let path = format!("/repos/{}/{}", self.owner, name);
        match self.send(Method::GET, &path, None).await {
            Ok(v) => Ok(Some(RepoInfo {
                name: name.to_string(),
                default_branch: v["default_branch"]
                    .as_str()
                    .unwrap_or(BRANCH)
                    .to_string(),
            })),
            Err(e) if e.status_code == Some(404) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("{}", e)),
        }
    }

    async fn create_repo(&self, name: &str) -> anyhow::Result<RepoInfo> {
        let body = json!({
            "name": name,
            "description": "Auto-generated project",
            "private": false,
            "auto_init": false,
        });
        match self.send(Method::POST, "/user/repos", Some(&body)).await {
            Ok(_) => Ok(RepoInfo {
                name: name.to_string(),
                default_branch: BRANCH.to_string(),
            }),
            // 422 "name already exists": a concurrent or retried create won
            Err(e) if e.status_code == Some(422) => {
                tracing::debug!("repository {} already exists", name);
                Ok(RepoInfo {
                    name: name.to_string(),
                    default_branch: BRANCH.to_string(),
                })
            }
            Err(e) => Err(anyhow::anyhow!("{}", e)),
        }
    }

    async fn read_tree(&self, name: &str) -> anyhow::Result<BTreeMap<String, String>> {
        let Some(head) = self.head_sha(name).await.map_err(|e| anyhow::anyhow!("{}", e))? else {
            return Ok(BTreeMap::new());
        };

        let commit = self
            .send(
                Method::GET,
                &self.repo_path(name, &format!("/git/commits/{}", head)),
                None,
            )
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        let tree_sha = commit["tree"]["sha"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("commit {} missing tree sha", head))?
            .to_string();

        let tree = self
            .send(
                Method::GET,
                &self.repo_path(name, &format!("/git/trees/{}?recursive=1", tree_sha)),
                None,
            )
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        let mut files = BTreeMap::new();
        for entry in tree["tree"].as_array().into_iter().flatten() {
            if entry["type"].as_str() != Some("blob") {
                continue;
            }
            let (Some(path), Some(sha)) = (entry["path"].as_str(), entry["sha"].as_str()) else {
                continue;
            };
            let blob = self
                .send(
                    Method::GET,
                    &self.repo_path(name, &format!("/git/blobs/{}", sha)),
                    None,
                )
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            let Some(content) = blob["content"].as_str() else {
                continue;
            };
            let raw: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(raw) else {
                continue;
            };
            // Prior-tree seeding only needs text files; binaries are skipped
            // the way the generation prompt skips them.
            if let Ok(text) = String::from_utf8(bytes) {
                files.insert(path.to_string(), text);
            }
        }
        Ok(files)
    }

    async fn commit_tree(
        &self,
        name: &str,
        files: &BTreeMap<String, TreeEntry>,
        message: &str,
    ) -> anyhow::Result<String> {
        let head = self.head_sha(name).await.map_err(|e| anyhow::anyhow!("{}", e))?;

        let base_tree = match &head {
            Some(sha) => {
                let commit = self
                    .send(
                        Method::GET,
                        &self.repo_path(name, &format!("/git/commits/{}", sha)),
                        None,
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!("{}", e))?;
                commit["tree"]["sha"].as_str().map(String::from)
            }
            None => None,
        };

        let mut elements = Vec::with_capacity(files.len());
        for (path, entry) in files {
            match entry {
                TreeEntry::Text(text) => elements.push(tree_element(path, Some(text), None)),
                TreeEntry::Binary(bytes) => {
                    let sha = self
                        .create_blob(name, bytes)
                        .await
                        .map_err(|e| anyhow::anyhow!("{}", e))?;
                    elements.push(tree_element(path, None, Some(&sha)));
                }
                TreeEntry::Delete => {
                    // Deleting from an empty repository is a no-op
                    if base_tree.is_some() {
                        elements.push(tree_element(path, None, None));
                    }
                }
            }
        }
        if elements.is_empty() {
            anyhow::bail!("nothing to commit for {}", name);
        }

        let mut tree_body = json!({ "tree": elements });
        if let Some(base) = &base_tree {
            tree_body["base_tree"] = json!(base);
        }
        let tree = self
            .send(
                Method::POST,
                &self.repo_path(name, "/git/trees"),
                Some(&tree_body),
            )
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        let tree_sha = tree["sha"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("tree response missing sha"))?;

        let parents: Vec<&String> = head.iter().collect();
        let commit = self
            .send(
                Method::POST,
                &self.repo_path(name, "/git/commits"),
                Some(&json!({
                    "message": message,
                    "tree": tree_sha,
                    "parents": parents,
                })),
            )
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        let commit_sha = commit["sha"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("commit response missing sha"))?
            .to_string();

        // The ref move is the only visible state change; everything above is
        // unreachable garbage until this succeeds.
        let result = match head {
            Some(_) => {
                self.send(
                    Method::PATCH,
                    &self.repo_path(name, &format!("/git/refs/heads/{}", BRANCH)),
                    Some(&json!({ "sha": commit_sha })),
                )
                .await
            }
            None => {
                self.send(
                    Method::POST,
                    &self.repo_path(name, "/git/refs"),
                    Some(&json!({
                        "ref": format!("refs/heads/{}", BRANCH),
                        "sha": commit_sha,
                    })),
                )
                .await
            }
        };
        result.map_err(|e| anyhow::anyhow!("ref update: {}", e))?;

        Ok(commit_sha)
    }

    async fn enable_pages(&self, name: &str) -> anyhow::Result<()> {
        let body = json!({
            "source": { "branch": BRANCH, "path": "/" }
        });
        match self
            .send(Method::POST, &self.repo_path(name, "/pages"), Some(&body))
            .await
        {
            Ok(_) => Ok(()),
            // 409: Pages already configured
            Err(e) if e.status_code == Some(409) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("{}", e)),
        }
    }

    async fn pages_status(&self, name: &str) -> anyhow::Result<PagesStatus> {
        match self
            .send(Method::GET, &self.repo_path(name, "/pages"), None)
            .await
        {
            Ok(v) => Ok(match v["status"].as_str() {
                Some("built") => PagesStatus::Built,
                _ => PagesStatus::Building,
            }),
            Err(e) if e.status_code == Some(404) => Ok(PagesStatus::Disabled),
            Err(e) => Err(anyhow::anyhow!("{}", e)),
        }
    }

    fn repo_url(&self, name: &str) -> String {
        format!("https://github.com/{}/{}", self.owner, name)
    }

    fn pages_url(&self, name: &str) -> String {
        format!("https://{}.github.io/{}/", self.owner, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_element_text_content() {
        let el = tree_element("index.html", Some("<html></html>"), None);
        assert_eq!(el["path"], "index.html");
        assert_eq!(el["mode"], "100644");
        assert_eq!(el["content"], "<html></html>");
        assert!(el.get("sha").is_none());
    }

    #[test]
    fn test_tree_element_blob_reference() {
        let el = tree_element("logo.png", None, Some("abc123"));
        assert_eq!(el["sha"], "abc123");
        assert!(el.get("content").is_none());
    }

    #[test]
    fn test_tree_element_deletion_has_explicit_null_sha() {
        let el = tree_element("old.js", None, None);
        assert!(el["sha"].is_null());
        assert!(el.as_object().unwrap().contains_key("sha"));
        assert!(el.get("content").is_none());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 300), "short");
        assert_eq!(truncate("abcdef", 3), "abc");
        // Multibyte error bodies must not split a character
        assert_eq!(truncate("aé", 2), "a");
    }

    #[test]
    fn test_urls() {
        let client = GitHubClient::new(Client::new(), "t".into(), "octo".into());
        assert_eq!(client.repo_url("todo-app"), "https://github.com/octo/todo-app");
        assert_eq!(client.pages_url("todo-app"), "https://octo.github.io/todo-app/");
    }
}
