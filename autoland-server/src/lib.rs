pub mod config;
pub mod github;
pub mod http_log;
pub mod notify;
pub mod reconciliation;
pub mod status;
pub mod webhook;

use std::sync::Arc;

use autoland_core::Coordinator;
use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use github::GitHubClient;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Header carrying the id that ties a webhook to the API calls it causes.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

pub fn get_bot_version() -> String {
    // Prefer a revision pinned by the packager
    if let Some(git_hash) = option_env!("AUTOLAND_GIT_HASH") {
        git_hash.chars().take(8).collect()
    } else if let Some(git_hash) = built_info::GIT_COMMIT_HASH {
        git_hash.chars().take(8).collect()
    } else {
        built_info::PKG_VERSION.to_string()
    }
}

pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub webhook_secret: String,
    /// Shared secret CI callbacks must present, if set.
    pub ci_token: Option<String>,
    /// Bearer token for `/status` and `/reconcile`. Those routes are
    /// disabled when unset.
    pub admin_token: Option<String>,
}

/// The full HTTP surface.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(status::health_check))
        .route("/status", get(status::status_handler))
        .merge(webhook::webhook_router(state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
