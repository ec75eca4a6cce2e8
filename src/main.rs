//! autodeployd - deployment service entry point.

use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use autodeploy::api::{self, AppState};
use autodeploy::attachments::AttachmentResolver;
use autodeploy::config::Config;
use autodeploy::coordinator::Coordinator;
use autodeploy::generate::Engine;
use autodeploy::llm::AipipeClient;
use autodeploy::notify::Notifier;
use autodeploy::repohost::GitHubClient;
use autodeploy::state::StateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autodeploy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    let config = Config::from_env()?;
    tracing::info!(
        "starting autodeployd v{} (model {}, owner {})",
        env!("CARGO_PKG_VERSION"),
        config.model,
        config.github_owner
    );

    let llm = Arc::new(AipipeClient::new(
        config.aipipe_api_key.clone(),
        config.aipipe_base_url.clone(),
    ));
    let engine = Engine::new(llm, config.model.clone(), config.max_repairs);
    let host = Arc::new(GitHubClient::new(
        reqwest::Client::new(),
        config.github_token.clone(),
        config.github_owner.clone(),
    ));
    let state = Arc::new(StateStore::load(&config.state_dir)?);

    let coordinator = Coordinator::new(
        config.clone(),
        engine,
        host,
        AttachmentResolver::default(),
        state,
        Notifier::default(),
    );

    api::serve(
        AppState {
            coordinator: Arc::new(coordinator),
        },
        &config.host,
        config.port,
    )
    .await
}
