//! API layer -- axum routes, handlers, and error mapping.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use self::state::AppState;
use crate::sync::SyncError;
use crate::tasks::TaskError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Task(e) => match e {
                TaskError::Validation(_) => StatusCode::BAD_REQUEST,
                TaskError::DuplicateName(_) => StatusCode::CONFLICT,
                TaskError::NotFound(_) => StatusCode::NOT_FOUND,
                TaskError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Sync(SyncError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Sync(SyncError::Source(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Sync(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            tracing::error!(status = code.as_u16(), error = %self, "request failed");
        }
        let body = json!({
            "data": null,
            "meta": {
                "status": code.as_u16(),
                "error": self.to_string(),
            }
        });
        (code, Json(body)).into_response()
    }
}
