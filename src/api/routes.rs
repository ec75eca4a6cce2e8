//! Route handlers and server setup.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::types::{DeployOutcome, DeployRequest, HealthResponse};
use crate::coordinator::Coordinator;
use crate::error::DeployError;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/app", post(deploy))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// `POST /app` - process one deployment round.
///
/// The pipeline runs in a spawned task so a caller that hangs up mid-round
/// does not cancel the deployment; the outcome still lands in the
/// idempotency log and the notification still fires.
async fn deploy(
    State(state): State<AppState>,
    Json(request): Json<DeployRequest>,
) -> Result<Json<DeployOutcome>, (StatusCode, String)> {
    let coordinator = state.coordinator.clone();
    let handle = tokio::spawn(async move { coordinator.handle(request).await });

    match handle.await {
        Ok(Ok(outcome)) => Ok(Json(outcome)),
        Ok(Err(e)) => Err((error_status(&e), e.to_string())),
        Err(e) => {
            tracing::error!("deployment task panicked: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ))
        }
    }
}

/// `GET /api/health` - liveness probe.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// HTTP status for the errors that surface as errors. Everything past the
/// idempotency claim is reported as a 200 with `success: false` instead.
fn error_status(error: &DeployError) -> StatusCode {
    match error {
        DeployError::Unauthorized => StatusCode::UNAUTHORIZED,
        DeployError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
