//! Administrative HTTP/websocket surface
//!
//! A thin axum boundary over the manager, reconciler and telemetry hub.
//! Real administrator authentication (sessions, TOTP, CSRF) is an external
//! collaborator; this surface only verifies the shared bearer secret.

mod auth;
mod users;
mod ws;

pub use auth::AdminAuth;

use crate::config::Settings;
use crate::error::ConsoleError;
use crate::manager::PeerManager;
use crate::reconcile::Reconciler;
use crate::registry::Registry;
use crate::telemetry::ObserverHub;
use crate::wireguard::WgBackend;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state handed to every handler
#[derive(Clone)]
pub struct AppState {
    /// Durable store
    pub registry: Registry,
    /// Lifecycle orchestrator
    pub manager: Arc<PeerManager>,
    /// Homeostatic sync
    pub reconciler: Arc<Reconciler>,
    /// Kernel query seam (live enrichment of listings)
    pub kernel: Arc<dyn WgBackend>,
    /// Telemetry fan-out
    pub hub: Arc<ObserverHub>,
    /// Resolved runtime settings
    pub settings: Arc<Settings>,
}

impl IntoResponse for ConsoleError {
    fn into_response(self) -> Response {
        let status = match &self {
            ConsoleError::Validation(_) => StatusCode::BAD_REQUEST,
            ConsoleError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ConsoleError::NotFound(_) => StatusCode::NOT_FOUND,
            ConsoleError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}

/// Build the administrative router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/users", get(users::list).post(users::create))
        .route("/api/users/sync_all", post(users::sync_all))
        .route("/api/users/:handle", delete(users::remove))
        .route("/api/users/:handle/toggle", patch(users::toggle))
        .route("/api/users/:handle/rotate", post(users::rotate))
        .route("/api/users/:handle/config", get(users::config))
        .route("/api/users/:handle/sessions", get(users::sessions))
        .route("/api/users/:handle/sync", post(users::sync_one))
        .route("/ws/stats", get(ws::stats))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Liveness probe
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}
