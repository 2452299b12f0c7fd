//! Admin router.
//!
//! Routes:
//! - `GET /healthz` - storage health check
//! - `GET /metrics` - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::error;

use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] for the admin listener.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let body = state.metrics.encode().map_err(AppError::Internal)?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum AppError {
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}
