//! autodeploy - turns project briefs into deployed static sites.
//!
//! One `POST /app` request carries a brief, acceptance checks and optional
//! attachments for a named task. The service generates a vanilla web project
//! with an LLM, publishes it to a GitHub repository as a single atomic
//! commit, activates GitHub Pages and posts the outcome to the caller's
//! evaluation URL. Rounds are incremental (later rounds build on the
//! committed tree) and requests are idempotent over (task, round, nonce).

pub mod api;
pub mod attachments;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod generate;
pub mod hosting;
pub mod llm;
pub mod notify;
pub mod repohost;
pub mod state;
