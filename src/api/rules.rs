//! Mail rule CRUD.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{double_option, ApiError, ApiResult, AppState};
use crate::adapters::sqlite::accounts;
use crate::adapters::sqlite::rules::{self, MailRule, MailRulePatch, NewMailRule};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rules/", get(list).post(create))
        .route("/rules/:id", axum::routing::patch(update).delete(remove))
}

#[derive(Serialize)]
struct RuleOut {
    id: i64,
    name: String,
    rule_order: i64,
    account_id: Option<i64>,
    sender_pattern: String,
    subject_pattern: String,
    body_pattern: String,
    add_labels: Vec<String>,
    push_telegram: bool,
    mark_read: bool,
}

impl From<MailRule> for RuleOut {
    fn from(rule: MailRule) -> Self {
        Self {
            id: rule.id,
            name: rule.name,
            rule_order: rule.rule_order,
            account_id: rule.account_id,
            sender_pattern: rule.sender_pattern,
            subject_pattern: rule.subject_pattern,
            body_pattern: rule.body_pattern,
            add_labels: rule.add_labels,
            push_telegram: rule.push_telegram,
            mark_read: rule.mark_read,
        }
    }
}

async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<RuleOut>>> {
    let listed = rules::list_rules(state.pool())?;
    Ok(Json(listed.into_iter().map(RuleOut::from).collect()))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleCreateIn {
    #[serde(default)]
    name: String,
    #[serde(default)]
    rule_order: i64,
    #[serde(default)]
    account_id: Option<i64>,
    #[serde(default)]
    sender_pattern: String,
    #[serde(default)]
    subject_pattern: String,
    #[serde(default)]
    body_pattern: String,
    #[serde(default)]
    add_labels: Vec<String>,
    #[serde(default = "default_true")]
    push_telegram: bool,
    #[serde(default)]
    mark_read: bool,
}

fn default_true() -> bool {
    true
}

async fn create(
    State(state): State<AppState>,
    Json(body): Json<RuleCreateIn>,
) -> ApiResult<Json<RuleOut>> {
    if let Some(account_id) = body.account_id {
        if accounts::get_account(state.pool(), account_id)?.is_none() {
            return Err(ApiError::bad_request(format!(
                "account {} does not exist",
                account_id
            )));
        }
    }

    let rule = rules::create_rule(
        state.pool(),
        &NewMailRule {
            name: body.name,
            rule_order: body.rule_order,
            account_id: body.account_id,
            sender_pattern: body.sender_pattern,
            subject_pattern: body.subject_pattern,
            body_pattern: body.body_pattern,
            add_labels: body.add_labels,
            push_telegram: body.push_telegram,
            mark_read: body.mark_read,
        },
    )?;
    Ok(Json(rule.into()))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleUpdateIn {
    name: Option<String>,
    rule_order: Option<i64>,
    /// Omitted = no change; explicit null = make the rule global.
    #[serde(default, deserialize_with = "double_option")]
    account_id: Option<Option<i64>>,
    sender_pattern: Option<String>,
    subject_pattern: Option<String>,
    body_pattern: Option<String>,
    add_labels: Option<Vec<String>>,
    push_telegram: Option<bool>,
    mark_read: Option<bool>,
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<RuleUpdateIn>,
) -> ApiResult<Json<RuleOut>> {
    if let Some(Some(account_id)) = body.account_id {
        if accounts::get_account(state.pool(), account_id)?.is_none() {
            return Err(ApiError::bad_request(format!(
                "account {} does not exist",
                account_id
            )));
        }
    }

    let rule = rules::update_rule(
        state.pool(),
        id,
        &MailRulePatch {
            name: body.name,
            rule_order: body.rule_order,
            account_id: body.account_id,
            sender_pattern: body.sender_pattern,
            subject_pattern: body.subject_pattern,
            body_pattern: body.body_pattern,
            add_labels: body.add_labels,
            push_telegram: body.push_telegram,
            mark_read: body.mark_read,
        },
    )?;
    Ok(Json(rule.into()))
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    rules::delete_rule(state.pool(), id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
