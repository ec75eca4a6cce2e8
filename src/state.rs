//! Persistent deployment state.
//!
//! Two records live here: per-task round history (which repository a task
//! maps to and the last round applied) and the idempotency log of processed
//! `(task, round, nonce)` triples with their recorded outcomes. State is held
//! in memory behind an `RwLock` and flushed to a JSON file on every mutation;
//! restarts reload it so replays after a crash still short-circuit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use crate::api::types::DeployOutcome;

/// What a task's last successful round produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub repo_name: String,
    pub repo_url: String,
    pub commit_sha: String,
    pub pages_url: String,
    pub last_round: u32,
    pub updated_at: DateTime<Utc>,
}

/// A completed entry in the idempotency log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessedEntry {
    outcome: DeployOutcome,
    completed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    /// Task name -> latest round record
    #[serde(default)]
    rounds: HashMap<String, RoundRecord>,
    /// `task::round::nonce` -> recorded outcome
    #[serde(default)]
    processed: HashMap<String, ProcessedEntry>,
}

/// Result of claiming a request triple.
#[derive(Debug)]
pub enum Begin {
    /// The triple is new; the caller owns processing it.
    Fresh,
    /// The triple already completed; return the stored outcome.
    Completed(DeployOutcome),
    /// Another in-flight request holds the triple.
    InProgress,
}

/// Store for round records and the idempotency log.
///
/// `begin` is the check-and-claim step: exactly one concurrent caller per
/// triple observes `Fresh`, everyone else sees `Completed` or `InProgress`.
pub struct StateStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

struct Inner {
    persisted: PersistedState,
    /// Triples claimed but not yet completed. Never persisted: an entry that
    /// survives a crash would deadlock replays of a request that died mid-run.
    in_flight: HashSet<String>,
}

fn triple_key(task: &str, round: u32, nonce: &str) -> String {
    format!("{}::{}::{}", task, round, nonce)
}

impl StateStore {
    /// Load state from `dir/state.json`, starting empty when absent.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join("state.json");
        let persisted = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&data) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("state file {} unreadable, starting fresh: {}", path.display(), e);
                    PersistedState::default()
                }
            }
        } else {
            PersistedState::default()
        };

        tracing::info!(
            "loaded state: {} tasks, {} processed requests",
            persisted.rounds.len(),
            persisted.processed.len()
        );

        Ok(Self {
            path,
            inner: RwLock::new(Inner {
                persisted,
                in_flight: HashSet::new(),
            }),
        })
    }

    /// Claim a triple for processing.
    pub fn begin(&self, task: &str, round: u32, nonce: &str) -> Begin {
        let key = triple_key(task, round, nonce);
        let mut inner = self.inner.write().unwrap();

        if let Some(entry) = inner.persisted.processed.get(&key) {
            return Begin::Completed(entry.outcome.clone());
        }
        if !inner.in_flight.insert(key) {
            return Begin::InProgress;
        }
        Begin::Fresh
    }

    /// Record the outcome for a claimed triple and release the claim.
    ///
    /// Failed outcomes are recorded too: a replayed nonce gets the same
    /// answer it got the first time, success or not.
    pub fn complete(
        &self,
        task: &str,
        round: u32,
        nonce: &str,
        outcome: &DeployOutcome,
    ) -> anyhow::Result<()> {
        let key = triple_key(task, round, nonce);
        let mut inner = self.inner.write().unwrap();
        inner.in_flight.remove(&key);
        inner.persisted.processed.insert(
            key,
            ProcessedEntry {
                outcome: outcome.clone(),
                completed_at: Utc::now(),
            },
        );
        self.flush(&inner.persisted)
    }

    /// Release a claim without recording an outcome. Used when processing
    /// could not even produce a failure outcome (e.g. task panicked).
    pub fn abandon(&self, task: &str, round: u32, nonce: &str) {
        let key = triple_key(task, round, nonce);
        self.inner.write().unwrap().in_flight.remove(&key);
    }

    /// Wait for an in-flight triple to complete, polling the log.
    ///
    /// Returns the stored outcome if the concurrent request finishes within
    /// `timeout`, `None` otherwise.
    pub async fn wait_for_completion(
        &self,
        task: &str,
        round: u32,
        nonce: &str,
        timeout: Duration,
    ) -> Option<DeployOutcome> {
        let key = triple_key(task, round, nonce);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let inner = self.inner.read().unwrap();
                if let Some(entry) = inner.persisted.processed.get(&key) {
                    return Some(entry.outcome.clone());
                }
                if !inner.in_flight.contains(&key) {
                    // Abandoned without an outcome.
                    return None;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Latest round record for a task, if any round has completed.
    pub fn round_record(&self, task: &str) -> Option<RoundRecord> {
        self.inner
            .read()
            .unwrap()
            .persisted
            .rounds
            .get(task)
            .cloned()
    }

    /// Store the round record for a task.
    ///
    /// Round numbers only move forward; a stale write from a slow retry of an
    /// earlier round must not clobber a newer record.
    pub fn put_round_record(&self, task: &str, record: RoundRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.persisted.rounds.get(task) {
            if existing.last_round > record.last_round {
                tracing::warn!(
                    "ignoring stale round {} record for {} (current round {})",
                    record.last_round,
                    task,
                    existing.last_round
                );
                return Ok(());
            }
        }
        inner.persisted.rounds.insert(task.to_string(), record);
        self.flush(&inner.persisted)
    }

    /// Write state to disk via a temp file and rename.
    fn flush(&self, persisted: &PersistedState) -> anyhow::Result<()> {
        let data = serde_json::to_string_pretty(persisted)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn outcome(message: &str) -> DeployOutcome {
        DeployOutcome {
            success: true,
            message: message.to_string(),
            repo_url: "https://github.com/test/todo-app".into(),
            commit_sha: "abc123".into(),
            pages_url: "https://test.github.io/todo-app/".into(),
        }
    }

    fn record(round: u32) -> RoundRecord {
        RoundRecord {
            repo_name: "todo-app".into(),
            repo_url: "https://github.com/test/todo-app".into(),
            commit_sha: format!("sha-{}", round),
            pages_url: "https://test.github.io/todo-app/".into(),
            last_round: round,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_begin_claims_triple_once() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path()).unwrap();

        assert!(matches!(store.begin("todo-app", 1, "n-1"), Begin::Fresh));
        assert!(matches!(
            store.begin("todo-app", 1, "n-1"),
            Begin::InProgress
        ));
        // Different nonce is a distinct request
        assert!(matches!(store.begin("todo-app", 1, "n-2"), Begin::Fresh));
    }

    #[test]
    fn test_completed_triple_returns_stored_outcome() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path()).unwrap();

        assert!(matches!(store.begin("todo-app", 1, "n-1"), Begin::Fresh));
        store
            .complete("todo-app", 1, "n-1", &outcome("Round 1: done"))
            .unwrap();

        match store.begin("todo-app", 1, "n-1") {
            Begin::Completed(o) => assert_eq!(o.message, "Round 1: done"),
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_outcomes_are_recorded_too() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path()).unwrap();

        assert!(matches!(store.begin("todo-app", 1, "n-1"), Begin::Fresh));
        let failed = DeployOutcome::failure("generation failed");
        store.complete("todo-app", 1, "n-1", &failed).unwrap();

        match store.begin("todo-app", 1, "n-1") {
            Begin::Completed(o) => {
                assert!(!o.success);
                assert_eq!(o.message, "generation failed");
            }
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[test]
    fn test_abandon_releases_claim_without_recording() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path()).unwrap();

        assert!(matches!(store.begin("todo-app", 1, "n-1"), Begin::Fresh));
        store.abandon("todo-app", 1, "n-1");
        assert!(matches!(store.begin("todo-app", 1, "n-1"), Begin::Fresh));
    }

    #[test]
    fn test_state_survives_reload() {
        let dir = TempDir::new().unwrap();
        {
            let store = StateStore::load(dir.path()).unwrap();
            assert!(matches!(store.begin("todo-app", 1, "n-1"), Begin::Fresh));
            store
                .complete("todo-app", 1, "n-1", &outcome("Round 1: done"))
                .unwrap();
            store.put_round_record("todo-app", record(1)).unwrap();
        }

        let store = StateStore::load(dir.path()).unwrap();
        assert!(matches!(
            store.begin("todo-app", 1, "n-1"),
            Begin::Completed(_)
        ));
        let rec = store.round_record("todo-app").unwrap();
        assert_eq!(rec.last_round, 1);
        assert_eq!(rec.commit_sha, "sha-1");
    }

    #[test]
    fn test_round_records_only_move_forward() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(dir.path()).unwrap();

        store.put_round_record("todo-app", record(2)).unwrap();
        store.put_round_record("todo-app", record(1)).unwrap();
        assert_eq!(store.round_record("todo-app").unwrap().last_round, 2);

        store.put_round_record("todo-app", record(3)).unwrap();
        assert_eq!(store.round_record("todo-app").unwrap().last_round, 3);
    }

    #[tokio::test]
    async fn test_wait_for_completion_sees_concurrent_finish() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(StateStore::load(dir.path()).unwrap());

        assert!(matches!(store.begin("todo-app", 1, "n-1"), Begin::Fresh));

        let s = store.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            s.complete("todo-app", 1, "n-1", &outcome("Round 1: done"))
                .unwrap();
        });

        let waited = store
            .wait_for_completion("todo-app", 1, "n-1", Duration::from_secs(5))
            .await;
        writer.await.unwrap();
        assert_eq!(waited.unwrap().message, "Round 1: done");
    }
}
