//! HTTP/JSON control plane.
//!
//! Thin handlers over the store and the pipeline; every route lives
//! under `/api`. Mutating routes require either the configured API
//! token or a session token from `/api/auth/login`.

pub mod accounts;
pub mod auth;
pub mod emails;
pub mod health;
pub mod rules;
pub mod settings;
pub mod stats;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use serde::{Deserialize, Deserializer};
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::services::fetcher::Pipeline;
use crate::services::scheduler::SchedulerHandle;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub scheduler: SchedulerHandle,
    pub auth: Arc<auth::AuthState>,
    pub database_path: Arc<std::path::PathBuf>,
}

impl AppState {
    pub fn pool(&self) -> &crate::adapters::sqlite::DbPool {
        &self.pipeline.pool
    }
}

/// Error envelope: `{"error": "..."}` with a kind-derived status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, "{}", self.message);
        }
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Invalid(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Transient(_) | Error::Imap(_) | Error::Auth(_) => StatusCode::BAD_GATEWAY,
            Error::Database(_) | Error::Encryption(_) | Error::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Deserialize helper distinguishing an absent field from an explicit
/// `null`: wrap the target in `Option<Option<T>>` and mark the field
/// `#[serde(default, deserialize_with = "double_option")]`.
pub fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Assemble the `/api` router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .merge(accounts::router())
        .merge(emails::router())
        .merge(rules::router())
        .merge(settings::router())
        .merge(stats::router())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    let api = Router::new()
        .merge(health::router())
        .merge(auth::router())
        .merge(protected)
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}
