//! Hub REST surface
//!
//! Three endpoints consumed by operator tooling and the edge agent's
//! callback; edge agents never call anything else here:
//!
//! - `POST /api/v1/connector/link` - issue an enrollment link
//! - `POST /api/v1/connector/link/callback` - claim a link for a cluster
//! - `GET /api/v1/connector/clusters/{cluster_id}/status` - liveness probe
//!
//! Link errors surface as their human-readable message with the status code
//! from [`Error::status_code`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{info, warn};

use crate::link::{CallbackRequest, Link, LinkRequest, LinkService, User};
use crate::Error;

/// Shared state for the REST handlers
#[derive(Clone)]
pub struct AppState {
    /// The link service backing all endpoints
    pub links: Arc<LinkService>,
    /// Identity attached to issued links.
    ///
    /// Stands in for a real authentication layer: a fronting gateway is
    /// expected to establish who the caller is.
    pub user: Option<User>,
}

/// Error wrapper that renders as an HTTP response
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "request failed");
        (self.0.status_code(), self.0.to_string()).into_response()
    }
}

/// Build the hub router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/connector/link", post(generate_link))
        .route("/api/v1/connector/link/callback", post(link_callback))
        .route(
            "/api/v1/connector/clusters/{cluster_id}/status",
            get(cluster_status),
        )
        .with_state(state)
}

/// Issue a new enrollment link
async fn generate_link(
    State(state): State<AppState>,
    Json(req): Json<LinkRequest>,
) -> Result<Json<Link>, ApiError> {
    let link = state.links.generate(state.user.clone(), req).await?;
    info!(link_id = %link.link_id, "link generated");
    Ok(Json(link))
}

/// Accept an edge agent's claim on a link
async fn link_callback(
    State(state): State<AppState>,
    Json(req): Json<CallbackRequest>,
) -> Result<StatusCode, ApiError> {
    state.links.callback(req).await?;
    Ok(StatusCode::OK)
}

/// Probe a bound cluster's edge agent
async fn cluster_status(
    State(state): State<AppState>,
    Path(cluster_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.links.status(&cluster_id).await?;
    Ok(StatusCode::OK)
}
