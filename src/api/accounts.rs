//! Account CRUD, poll status, and per-account Telegram filter rules.

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{double_option, ApiError, ApiResult, AppState};
use crate::adapters::sqlite::accounts::{
    self, Account, AccountPatch, NewAccount, PushTemplate,
};
use crate::adapters::sqlite::poll_status::{self, PollStatus};
use crate::adapters::sqlite::push_filters::{self, FilterField, FilterMode, NewPushFilter};
use crate::config::MIN_POLL_INTERVAL_SECS;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/accounts/", get(list).post(create))
        .route("/accounts/status", get(status))
        .route(
            "/accounts/:id",
            axum::routing::patch(update).delete(remove),
        )
        .route(
            "/accounts/:id/telegram-rules",
            get(list_telegram_rules).post(create_telegram_rule),
        )
        .route(
            "/accounts/telegram-rules/:id",
            delete(remove_telegram_rule),
        )
}

/// Account as exposed over the API: the credential ciphertext never
/// leaves the store on this path.
#[derive(Serialize)]
pub struct AccountOut {
    pub id: i64,
    pub email: String,
    pub provider: String,
    pub host: String,
    pub port: u16,
    pub is_active: bool,
    pub sort_order: i64,
    pub telegram_push_enabled: bool,
    pub push_template: PushTemplate,
    pub poll_interval_seconds: Option<u32>,
}

impl From<Account> for AccountOut {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            email: account.email,
            provider: account.provider,
            host: account.host,
            port: account.port,
            is_active: account.is_active,
            sort_order: account.sort_order,
            telegram_push_enabled: account.telegram_push_enabled,
            push_template: account.push_template,
            poll_interval_seconds: account.poll_interval_seconds,
        }
    }
}

fn validate_interval(interval: Option<u32>) -> ApiResult<()> {
    if let Some(seconds) = interval {
        if u64::from(seconds) < MIN_POLL_INTERVAL_SECS {
            return Err(ApiError::bad_request(format!(
                "poll_interval_seconds must be at least {}",
                MIN_POLL_INTERVAL_SECS
            )));
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    active_only: bool,
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<AccountOut>>> {
    let accounts = accounts::list_accounts(state.pool(), query.active_only)?;
    Ok(Json(accounts.into_iter().map(AccountOut::from).collect()))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AccountCreateIn {
    email: String,
    app_password: String,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_provider")]
    provider: String,
    #[serde(default = "default_true")]
    is_active: bool,
    #[serde(default)]
    sort_order: Option<i64>,
    #[serde(default = "default_true")]
    telegram_push_enabled: bool,
    #[serde(default = "default_template")]
    push_template: PushTemplate,
    #[serde(default)]
    poll_interval_seconds: Option<u32>,
}

fn default_host() -> String {
    "imap.gmail.com".to_string()
}
fn default_port() -> u16 {
    993
}
fn default_provider() -> String {
    "custom".to_string()
}
fn default_true() -> bool {
    true
}
fn default_template() -> PushTemplate {
    PushTemplate::Short
}

async fn create(
    State(state): State<AppState>,
    Json(body): Json<AccountCreateIn>,
) -> ApiResult<Json<AccountOut>> {
    let email = body.email.trim().to_string();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::bad_request("email is not valid"));
    }
    if body.app_password.is_empty() {
        return Err(ApiError::bad_request("app_password must not be empty"));
    }
    validate_interval(body.poll_interval_seconds)?;

    let encrypted_pwd = state.pipeline.cipher.encrypt(&body.app_password)?;
    let account = accounts::create_account(
        state.pool(),
        &NewAccount {
            email,
            provider: body.provider,
            host: body.host,
            port: body.port,
            encrypted_pwd,
            is_active: body.is_active,
            sort_order: body.sort_order,
            telegram_push_enabled: body.telegram_push_enabled,
            push_template: body.push_template,
            poll_interval_seconds: body.poll_interval_seconds,
        },
    )?;

    info!(account_id = account.id, email = %account.email, "Account created");
    state.scheduler.nudge();
    Ok(Json(account.into()))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AccountUpdateIn {
    provider: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    app_password: Option<String>,
    is_active: Option<bool>,
    sort_order: Option<i64>,
    telegram_push_enabled: Option<bool>,
    push_template: Option<PushTemplate>,
    /// Omitted = no change; explicit null = inherit the global interval.
    #[serde(default, deserialize_with = "double_option")]
    poll_interval_seconds: Option<Option<u32>>,
}

async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<AccountUpdateIn>,
) -> ApiResult<Json<AccountOut>> {
    if let Some(Some(seconds)) = body.poll_interval_seconds {
        validate_interval(Some(seconds))?;
    }
    if let Some(password) = body.app_password.as_deref() {
        if password.is_empty() {
            return Err(ApiError::bad_request("app_password must not be empty"));
        }
    }

    // Credential rotation re-encrypts under the current key.
    let encrypted_pwd = body
        .app_password
        .as_deref()
        .map(|password| state.pipeline.cipher.encrypt(password))
        .transpose()?;

    let account = accounts::update_account(
        state.pool(),
        id,
        &AccountPatch {
            provider: body.provider,
            host: body.host,
            port: body.port,
            encrypted_pwd,
            is_active: body.is_active,
            sort_order: body.sort_order,
            telegram_push_enabled: body.telegram_push_enabled,
            push_template: body.push_template,
            poll_interval_seconds: body.poll_interval_seconds,
        },
    )?;

    state.scheduler.nudge();
    Ok(Json(account.into()))
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    accounts::delete_account(state.pool(), id)?;
    info!(account_id = id, "Account deleted");
    state.scheduler.nudge();
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Serialize)]
struct PollStatusOut {
    account_id: i64,
    last_started_at: Option<String>,
    last_finished_at: Option<String>,
    last_success_at: Option<String>,
    last_error: Option<String>,
}

fn to_rfc3339(ts: Option<i64>) -> Option<String> {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|t| t.to_rfc3339())
}

impl From<PollStatus> for PollStatusOut {
    fn from(status: PollStatus) -> Self {
        Self {
            account_id: status.account_id,
            last_started_at: to_rfc3339(status.last_started_at),
            last_finished_at: to_rfc3339(status.last_finished_at),
            last_success_at: to_rfc3339(status.last_success_at),
            last_error: status.last_error,
        }
    }
}

async fn status(State(state): State<AppState>) -> ApiResult<Json<Vec<PollStatusOut>>> {
    let statuses = poll_status::list_statuses(state.pool())?;
    Ok(Json(statuses.into_iter().map(PollStatusOut::from).collect()))
}

// ---------------------------------------------------------------------------
// Telegram filter rules
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct TelegramRuleOut {
    id: i64,
    account_id: i64,
    field: FilterField,
    mode: FilterMode,
    value: String,
    rule_order: i64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TelegramRuleIn {
    field: FilterField,
    mode: FilterMode,
    value: String,
    #[serde(default)]
    rule_order: i64,
}

async fn list_telegram_rules(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
) -> ApiResult<Json<Vec<TelegramRuleOut>>> {
    if accounts::get_account(state.pool(), account_id)?.is_none() {
        return Err(ApiError::not_found(format!("account {}", account_id)));
    }
    let filters = push_filters::list_filters(state.pool(), account_id)?;
    Ok(Json(
        filters
            .into_iter()
            .map(|f| TelegramRuleOut {
                id: f.id,
                account_id: f.account_id,
                field: f.field,
                mode: f.mode,
                value: f.value,
                rule_order: f.rule_order,
            })
            .collect(),
    ))
}

async fn create_telegram_rule(
    State(state): State<AppState>,
    Path(account_id): Path<i64>,
    Json(body): Json<TelegramRuleIn>,
) -> ApiResult<Json<TelegramRuleOut>> {
    if accounts::get_account(state.pool(), account_id)?.is_none() {
        return Err(ApiError::not_found(format!("account {}", account_id)));
    }
    if body.value.trim().is_empty() {
        return Err(ApiError::bad_request("value must not be empty"));
    }

    let filter = push_filters::create_filter(
        state.pool(),
        account_id,
        &NewPushFilter {
            field: body.field,
            mode: body.mode,
            value: body.value.trim().to_string(),
            rule_order: body.rule_order,
        },
    )?;
    Ok(Json(TelegramRuleOut {
        id: filter.id,
        account_id: filter.account_id,
        field: filter.field,
        mode: filter.mode,
        value: filter.value,
        rule_order: filter.rule_order,
    }))
}

async fn remove_telegram_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    push_filters::delete_filter(state.pool(), id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
