//! Configuration management for the autodeploy service.
//!
//! Configuration can be set via environment variables:
//! - `API_SECRET` - Required. Shared secret callers must present in each request.
//! - `GITHUB_TOKEN` - Required. Personal access token used for repository operations.
//! - `GITHUB_OWNER` - Required. Account under which repositories are created.
//! - `AIPIPE_API_KEY` - Required. API key for the AIPipe (OpenRouter-compatible) gateway.
//! - `AIPIPE_BASE_URL` - Optional. Gateway base URL. Defaults to `https://aipipe.org/openrouter/v1`.
//! - `MODEL` - Optional. Model identifier for generation. Defaults to `openai/gpt-4o-mini`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `8000`.
//! - `STATE_DIR` - Optional. Directory for the round/idempotency state file. Defaults to `.`.
//! - `MAX_REPAIRS` - Optional. Maximum repair iterations per generation. Defaults to `2`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Service configuration, constructed once at startup and passed into the
/// coordinator explicitly (no ambient globals).
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared secret for inbound requests
    pub api_secret: String,

    /// GitHub personal access token
    pub github_token: String,

    /// GitHub account owning the generated repositories
    pub github_owner: String,

    /// AIPipe API key
    pub aipipe_api_key: String,

    /// Base URL of the OpenRouter-compatible gateway
    pub aipipe_base_url: String,

    /// Model identifier used for generation and verification
    pub model: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Directory holding the persisted round records and idempotency log
    pub state_dir: PathBuf,

    /// Maximum repair iterations when generated code fails its checks
    pub max_repairs: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if a required variable is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let required = |name: &str| {
            std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
        };

        let api_secret = required("API_SECRET")?;
        let github_token = required("GITHUB_TOKEN")?;
        let github_owner = required("GITHUB_OWNER")?;
        let aipipe_api_key = required("AIPIPE_API_KEY")?;

        let aipipe_base_url = std::env::var("AIPIPE_BASE_URL")
            .unwrap_or_else(|_| "https://aipipe.org/openrouter/v1".to_string());

        let model = std::env::var("MODEL").unwrap_or_else(|_| "openai/gpt-4o-mini".to_string());

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let state_dir = std::env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let max_repairs = std::env::var("MAX_REPAIRS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("MAX_REPAIRS".to_string(), format!("{}", e)))?;

        Ok(Self {
            api_secret,
            github_token,
            github_owner,
            aipipe_api_key,
            aipipe_base_url,
            model,
            host,
            port,
            state_dir,
            max_repairs,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_secret: String, github_owner: String, state_dir: PathBuf) -> Self {
        Self {
            api_secret,
            github_token: String::new(),
            github_owner,
            aipipe_api_key: String::new(),
            aipipe_base_url: "https://aipipe.org/openrouter/v1".to_string(),
            model: "openai/gpt-4o-mini".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            state_dir,
            max_repairs: 2,
        }
    }
}
