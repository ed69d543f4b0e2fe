//! Liveness endpoint, auth-free.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use super::{ApiResult, AppState};
use crate::adapters::sqlite::poll_status;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Serialize)]
struct PollerHealth {
    last_started_at: Option<String>,
    last_finished_at: Option<String>,
}

#[derive(Serialize)]
struct HealthOut {
    status: &'static str,
    poller: PollerHealth,
}

fn to_rfc3339(ts: Option<i64>) -> Option<String> {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|t| t.to_rfc3339())
}

/// Most recent poll boundary across all accounts.
async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthOut>> {
    let statuses = poll_status::list_statuses(state.pool())?;
    let last_started_at = statuses.iter().filter_map(|s| s.last_started_at).max();
    let last_finished_at = statuses.iter().filter_map(|s| s.last_finished_at).max();

    Ok(Json(HealthOut {
        status: "ok",
        poller: PollerHealth {
            last_started_at: to_rfc3339(last_started_at),
            last_finished_at: to_rfc3339(last_finished_at),
        },
    }))
}
