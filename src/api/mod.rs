//! HTTP surface: request/response types and the axum router.

pub mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
