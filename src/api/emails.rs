//! Message listing, read state, the reapply maintenance operation, and
//! on-demand fetch.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ApiError, ApiResult, AppState};
use crate::adapters::sqlite::messages::{self, EmailFilter, EmailListItem};
use crate::adapters::sqlite::{accounts, rules};
use crate::services::fetcher::FetchOutcome;
use crate::services::rules_engine::{self, RuleInput};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/emails/", get(list))
        .route("/emails/apply-rules", post(apply_rules))
        .route("/emails/accounts/:id/fetch_once", post(fetch_once))
        .route("/emails/:id", get(detail))
        .route("/emails/:id/read", post(mark_read))
}

#[derive(Deserialize)]
struct EmailListQuery {
    account_id: Option<i64>,
    keyword: Option<String>,
    is_read: Option<bool>,
    label: Option<String>,
    /// YYYY-MM-DD, inclusive.
    date_from: Option<String>,
    /// YYYY-MM-DD, inclusive.
    date_to: Option<String>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

fn default_page() -> u32 {
    1
}
fn default_page_size() -> u32 {
    50
}

fn parse_day(raw: &str) -> ApiResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request(format!("invalid date: {}", raw)))
}

#[derive(Serialize)]
struct EmailListItemOut {
    id: i64,
    message_id: String,
    account_id: i64,
    account_email: String,
    subject: String,
    sender: String,
    content_summary: String,
    received_at: String,
    is_read: bool,
    labels: Vec<String>,
}

impl From<EmailListItem> for EmailListItemOut {
    fn from(item: EmailListItem) -> Self {
        Self {
            id: item.id,
            message_id: item.message_id,
            account_id: item.account_id,
            account_email: item.account_email,
            subject: item.subject,
            sender: item.sender,
            content_summary: item.content_summary,
            received_at: chrono::DateTime::from_timestamp(item.received_at, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            is_read: item.is_read,
            labels: item.labels,
        }
    }
}

#[derive(Serialize)]
struct EmailListOut {
    items: Vec<EmailListItemOut>,
    total: i64,
    page: u32,
    page_size: u32,
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<EmailListQuery>,
) -> ApiResult<Json<EmailListOut>> {
    if query.page == 0 {
        return Err(ApiError::bad_request("page starts at 1"));
    }
    if query.page_size == 0 || query.page_size > 200 {
        return Err(ApiError::bad_request("page_size must be 1..=200"));
    }

    let date_from = query
        .date_from
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(parse_day)
        .transpose()?
        .map(|d| d.and_hms_opt(0, 0, 0).expect("valid time").and_utc().timestamp());
    let date_to = query
        .date_to
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(parse_day)
        .transpose()?
        // Exclusive upper bound: the whole named day is included.
        .map(|d| {
            (d + chrono::Duration::days(1))
                .and_hms_opt(0, 0, 0)
                .expect("valid time")
                .and_utc()
                .timestamp()
        });

    let filter = EmailFilter {
        account_id: query.account_id,
        keyword: query.keyword,
        is_read: query.is_read,
        label: query.label,
        date_from,
        date_to,
    };

    let (items, total) = messages::query_messages(state.pool(), &filter, query.page, query.page_size)?;
    Ok(Json(EmailListOut {
        items: items.into_iter().map(EmailListItemOut::from).collect(),
        total,
        page: query.page,
        page_size: query.page_size,
    }))
}

#[derive(Serialize)]
struct EmailDetailOut {
    #[serde(flatten)]
    summary: EmailListItemOut,
    body_text: String,
    body_html: Option<String>,
}

async fn detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<EmailDetailOut>> {
    let record = messages::get_record(state.pool(), id)?
        .ok_or_else(|| ApiError::not_found(format!("email {}", id)))?;

    // Viewing a message marks it read locally.
    if !record.is_read {
        messages::set_read(state.pool(), id, true)?;
    }

    let account = accounts::get_account(state.pool(), record.account_id)?
        .ok_or_else(|| ApiError::not_found(format!("account {}", record.account_id)))?;

    Ok(Json(EmailDetailOut {
        summary: EmailListItemOut {
            id: record.id,
            message_id: record.message_id.clone(),
            account_id: record.account_id,
            account_email: account.email,
            subject: record.subject.clone(),
            sender: record.sender.clone(),
            content_summary: record.content_summary.clone(),
            received_at: chrono::DateTime::from_timestamp(record.received_at, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            is_read: true,
            labels: record.labels.clone(),
        },
        body_text: record.body_text,
        body_html: record.body_html,
    }))
}

async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    messages::set_read(state.pool(), id, true)?;
    Ok(Json(serde_json::json!({ "is_read": true })))
}

#[derive(Serialize)]
struct ApplyRulesOut {
    updated: usize,
    total: usize,
}

/// Re-run the rule engine over every stored message: old labels are
/// discarded and recomputed, `mark_read` may flip messages to read.
/// Deterministic, so the result matches what live processing would have
/// produced under the current rule set.
async fn apply_rules(State(state): State<AppState>) -> ApiResult<Json<ApplyRulesOut>> {
    let all_rules = rules::list_rules(state.pool())?;
    let account_defaults: HashMap<i64, bool> = accounts::list_accounts(state.pool(), false)?
        .into_iter()
        .map(|a| (a.id, a.telegram_push_enabled))
        .collect();

    let records = messages::list_all(state.pool())?;
    let total = records.len();
    let mut updated = 0;

    for record in &records {
        let body = if record.body_text.is_empty() {
            record.content_summary.as_str()
        } else {
            record.body_text.as_str()
        };
        let decision = rules_engine::evaluate(
            &RuleInput {
                account_id: record.account_id,
                sender: &record.sender,
                subject: &record.subject,
                body,
            },
            account_defaults
                .get(&record.account_id)
                .copied()
                .unwrap_or(true),
            &all_rules,
        );

        if messages::reset_decision(state.pool(), record.id, &decision.add_labels, decision.mark_read)? {
            updated += 1;
        }
    }

    info!(total, updated, "Reapplied rules to stored messages");
    Ok(Json(ApplyRulesOut { updated, total }))
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum FetchOnceOut {
    Completed { fetched: usize, inserted: usize },
    Skipped,
}

/// Immediate one-shot fetch, honoring the same single-flight lock as
/// the scheduler.
async fn fetch_once(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
) -> ApiResult<Json<FetchOnceOut>> {
    match state.pipeline.run(account_id).await? {
        FetchOutcome::Completed { fetched, inserted } => {
            Ok(Json(FetchOnceOut::Completed { fetched, inserted }))
        }
        FetchOutcome::Skipped => Ok(Json(FetchOnceOut::Skipped)),
        FetchOutcome::Failed { error } => Err(ApiError::bad_request(format!(
            "fetch failed: {}",
            error
        ))),
    }
}
