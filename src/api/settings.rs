//! Runtime settings: read, patch, and the export/import round trip.
//!
//! Exported account credentials stay ciphered; an import on a fresh
//! instance with the same `ENCRYPTION_KEY` polls identically.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{double_option, ApiError, ApiResult, AppState};
use crate::adapters::sqlite::accounts::{self, AccountPatch, NewAccount, PushTemplate};
use crate::adapters::sqlite::push_filters::{self, FilterField, FilterMode, NewPushFilter};
use crate::adapters::sqlite::settings as settings_store;
use crate::config::MIN_POLL_INTERVAL_SECS;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/settings", get(get_settings).patch(patch_settings))
        .route("/settings/export", get(export_settings))
        .route("/settings/import", post(import_settings))
}

#[derive(Serialize)]
struct SettingsOut {
    telegram_bot_token: String,
    telegram_chat_id: String,
    poll_interval_seconds: u64,
    webhook_url: String,
    api_token: String,
    retention_keep_days: Option<u32>,
    retention_keep_per_account: Option<u32>,
    imap_mirror_mark_read: bool,
}

/// Current editable settings, plaintext, for form backfill.
async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<SettingsOut>> {
    let snapshot = state.pipeline.settings.current().await;
    Ok(Json(SettingsOut {
        telegram_bot_token: snapshot.telegram_bot_token.clone().unwrap_or_default(),
        telegram_chat_id: snapshot.telegram_chat_id.clone().unwrap_or_default(),
        poll_interval_seconds: snapshot.poll_interval_seconds,
        webhook_url: snapshot.webhook_url.clone().unwrap_or_default(),
        api_token: snapshot.api_token.clone().unwrap_or_default(),
        retention_keep_days: snapshot.retention_keep_days,
        retention_keep_per_account: snapshot.retention_keep_per_account,
        imap_mirror_mark_read: snapshot.imap_mirror_mark_read,
    }))
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SettingsPatchIn {
    #[serde(default, deserialize_with = "double_option")]
    telegram_bot_token: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    telegram_chat_id: Option<Option<String>>,
    poll_interval_seconds: Option<u64>,
    #[serde(default, deserialize_with = "double_option")]
    webhook_url: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    api_token: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    retention_keep_days: Option<Option<u32>>,
    #[serde(default, deserialize_with = "double_option")]
    retention_keep_per_account: Option<Option<u32>>,
    imap_mirror_mark_read: Option<bool>,
}

impl SettingsPatchIn {
    /// Rows to write: present string fields store their value ("" for
    /// null = cleared), numeric fields store their decimal rendering.
    fn to_rows(&self) -> ApiResult<Vec<(String, String)>> {
        let mut rows: Vec<(String, String)> = Vec::new();

        let mut push_string = |key: &str, field: &Option<Option<String>>| {
            if let Some(value) = field {
                let stored = value.as_deref().unwrap_or("").trim().to_string();
                rows.push((key.to_string(), stored));
            }
        };
        push_string("telegram_bot_token", &self.telegram_bot_token);
        push_string("telegram_chat_id", &self.telegram_chat_id);
        push_string("webhook_url", &self.webhook_url);
        push_string("api_token", &self.api_token);

        if let Some(seconds) = self.poll_interval_seconds {
            if seconds < MIN_POLL_INTERVAL_SECS {
                return Err(ApiError::bad_request(format!(
                    "poll_interval_seconds must be at least {}",
                    MIN_POLL_INTERVAL_SECS
                )));
            }
            rows.push(("poll_interval_seconds".to_string(), seconds.to_string()));
        }
        if let Some(value) = &self.retention_keep_days {
            if value == &Some(0) {
                return Err(ApiError::bad_request("retention_keep_days must be >= 1"));
            }
            rows.push((
                "retention_keep_days".to_string(),
                value.map(|v| v.to_string()).unwrap_or_default(),
            ));
        }
        if let Some(value) = &self.retention_keep_per_account {
            if value == &Some(0) {
                return Err(ApiError::bad_request(
                    "retention_keep_per_account must be >= 1",
                ));
            }
            rows.push((
                "retention_keep_per_account".to_string(),
                value.map(|v| v.to_string()).unwrap_or_default(),
            ));
        }
        if let Some(mirror) = self.imap_mirror_mark_read {
            rows.push(("imap_mirror_mark_read".to_string(), mirror.to_string()));
        }
        Ok(rows)
    }
}

/// Write the patch and rebuild the settings snapshot before responding,
/// so the next reader (including the poll loops) sees the new values.
async fn patch_settings(
    State(state): State<AppState>,
    Json(body): Json<SettingsPatchIn>,
) -> ApiResult<Json<SettingsOut>> {
    let rows = body.to_rows()?;
    settings_store::set_many(state.pool(), &rows)?;
    let snapshot = state.pipeline.settings.reload(state.pool()).await?;
    info!(keys = rows.len(), "Settings updated");

    Ok(Json(SettingsOut {
        telegram_bot_token: snapshot.telegram_bot_token.clone().unwrap_or_default(),
        telegram_chat_id: snapshot.telegram_chat_id.clone().unwrap_or_default(),
        poll_interval_seconds: snapshot.poll_interval_seconds,
        webhook_url: snapshot.webhook_url.clone().unwrap_or_default(),
        // Masked on mutation responses.
        api_token: if snapshot.api_token.is_some() {
            "***".to_string()
        } else {
            String::new()
        },
        retention_keep_days: snapshot.retention_keep_days,
        retention_keep_per_account: snapshot.retention_keep_per_account,
        imap_mirror_mark_read: snapshot.imap_mirror_mark_read,
    }))
}

// ---------------------------------------------------------------------------
// Export / import
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct TelegramRuleDoc {
    field: FilterField,
    mode: FilterMode,
    value: String,
    #[serde(default)]
    rule_order: i64,
}

#[derive(Serialize, Deserialize)]
struct AccountDoc {
    email: String,
    #[serde(default = "default_provider")]
    provider: String,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_true")]
    is_active: bool,
    #[serde(default)]
    sort_order: i64,
    #[serde(default = "default_true")]
    telegram_push_enabled: bool,
    #[serde(default = "default_template")]
    push_template: PushTemplate,
    #[serde(default)]
    poll_interval_seconds: Option<u32>,
    /// Ciphertext, round-tripped verbatim.
    #[serde(default)]
    encrypted_pwd: String,
    #[serde(default)]
    telegram_rules: Vec<TelegramRuleDoc>,
}

fn default_provider() -> String {
    "custom".to_string()
}
fn default_host() -> String {
    "imap.gmail.com".to_string()
}
fn default_port() -> u16 {
    993
}
fn default_true() -> bool {
    true
}
fn default_template() -> PushTemplate {
    PushTemplate::Short
}

#[derive(Serialize, Deserialize)]
struct SettingsDoc {
    #[serde(default)]
    telegram_bot_token: String,
    #[serde(default)]
    telegram_chat_id: String,
    #[serde(default = "default_interval")]
    poll_interval_seconds: u64,
    #[serde(default)]
    webhook_url: String,
    #[serde(default)]
    api_token: String,
    #[serde(default)]
    retention_keep_days: Option<u32>,
    #[serde(default)]
    retention_keep_per_account: Option<u32>,
    #[serde(default = "default_true")]
    imap_mirror_mark_read: bool,
}

fn default_interval() -> u64 {
    300
}

#[derive(Serialize, Deserialize)]
struct ExportDoc {
    settings: SettingsDoc,
    accounts: Vec<AccountDoc>,
}

/// Full configuration export: settings plus accounts with their push
/// filter rules. Credentials stay encrypted; treat the document as
/// sensitive anyway.
async fn export_settings(State(state): State<AppState>) -> ApiResult<Json<ExportDoc>> {
    let snapshot = state.pipeline.settings.current().await;
    let settings = SettingsDoc {
        telegram_bot_token: snapshot.telegram_bot_token.clone().unwrap_or_default(),
        telegram_chat_id: snapshot.telegram_chat_id.clone().unwrap_or_default(),
        poll_interval_seconds: snapshot.poll_interval_seconds,
        webhook_url: snapshot.webhook_url.clone().unwrap_or_default(),
        api_token: snapshot.api_token.clone().unwrap_or_default(),
        retention_keep_days: snapshot.retention_keep_days,
        retention_keep_per_account: snapshot.retention_keep_per_account,
        imap_mirror_mark_read: snapshot.imap_mirror_mark_read,
    };

    let mut account_docs = Vec::new();
    for account in accounts::list_accounts(state.pool(), false)? {
        let filters = push_filters::list_filters(state.pool(), account.id)?;
        account_docs.push(AccountDoc {
            email: account.email,
            provider: account.provider,
            host: account.host,
            port: account.port,
            is_active: account.is_active,
            sort_order: account.sort_order,
            telegram_push_enabled: account.telegram_push_enabled,
            push_template: account.push_template,
            poll_interval_seconds: account.poll_interval_seconds,
            encrypted_pwd: account.encrypted_pwd,
            telegram_rules: filters
                .into_iter()
                .map(|f| TelegramRuleDoc {
                    field: f.field,
                    mode: f.mode,
                    value: f.value,
                    rule_order: f.rule_order,
                })
                .collect(),
        });
    }

    Ok(Json(ExportDoc {
        settings,
        accounts: account_docs,
    }))
}

#[derive(Deserialize)]
struct ImportDoc {
    settings: Option<SettingsDoc>,
    accounts: Option<Vec<AccountDoc>>,
}

#[derive(Serialize)]
struct ImportOut {
    imported_accounts: usize,
}

/// Import a previously exported document. Accounts match by email:
/// existing ones are updated (ciphertext replaced only when provided),
/// new ones are created. Push filter lists are replaced wholesale.
async fn import_settings(
    State(state): State<AppState>,
    Json(body): Json<ImportDoc>,
) -> ApiResult<Json<ImportOut>> {
    if let Some(settings) = &body.settings {
        if settings.poll_interval_seconds < MIN_POLL_INTERVAL_SECS {
            return Err(ApiError::bad_request(format!(
                "poll_interval_seconds must be at least {}",
                MIN_POLL_INTERVAL_SECS
            )));
        }
        let rows = vec![
            (
                "telegram_bot_token".to_string(),
                settings.telegram_bot_token.trim().to_string(),
            ),
            (
                "telegram_chat_id".to_string(),
                settings.telegram_chat_id.trim().to_string(),
            ),
            (
                "poll_interval_seconds".to_string(),
                settings.poll_interval_seconds.to_string(),
            ),
            (
                "webhook_url".to_string(),
                settings.webhook_url.trim().to_string(),
            ),
            (
                "api_token".to_string(),
                settings.api_token.trim().to_string(),
            ),
            (
                "retention_keep_days".to_string(),
                settings
                    .retention_keep_days
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            ),
            (
                "retention_keep_per_account".to_string(),
                settings
                    .retention_keep_per_account
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            ),
            (
                "imap_mirror_mark_read".to_string(),
                settings.imap_mirror_mark_read.to_string(),
            ),
        ];
        settings_store::set_many(state.pool(), &rows)?;
        state.pipeline.settings.reload(state.pool()).await?;
    }

    let mut imported = 0;
    for (index, doc) in body.accounts.iter().flatten().enumerate() {
        let email = doc.email.trim();
        if email.is_empty() {
            continue;
        }

        let account_id = match accounts::get_account_by_email(state.pool(), email)? {
            Some(existing) => {
                let encrypted_pwd =
                    Some(doc.encrypted_pwd.clone()).filter(|ct| !ct.trim().is_empty());
                let updated = accounts::update_account(
                    state.pool(),
                    existing.id,
                    &AccountPatch {
                        provider: Some(doc.provider.clone()),
                        host: Some(doc.host.clone()),
                        port: Some(doc.port),
                        encrypted_pwd,
                        is_active: Some(doc.is_active),
                        sort_order: Some(doc.sort_order),
                        telegram_push_enabled: Some(doc.telegram_push_enabled),
                        push_template: Some(doc.push_template),
                        poll_interval_seconds: Some(doc.poll_interval_seconds),
                    },
                )?;
                updated.id
            }
            None => {
                let created = accounts::create_account(
                    state.pool(),
                    &NewAccount {
                        email: email.to_string(),
                        provider: doc.provider.clone(),
                        host: doc.host.clone(),
                        port: doc.port,
                        encrypted_pwd: doc.encrypted_pwd.clone(),
                        is_active: doc.is_active,
                        sort_order: Some(if doc.sort_order != 0 {
                            doc.sort_order
                        } else {
                            index as i64
                        }),
                        telegram_push_enabled: doc.telegram_push_enabled,
                        push_template: doc.push_template,
                        poll_interval_seconds: doc.poll_interval_seconds,
                    },
                )?;
                created.id
            }
        };

        let filters: Vec<NewPushFilter> = doc
            .telegram_rules
            .iter()
            .map(|r| NewPushFilter {
                field: r.field,
                mode: r.mode,
                value: r.value.trim().to_string(),
                rule_order: r.rule_order,
            })
            .collect();
        push_filters::replace_filters(state.pool(), account_id, &filters)?;
        imported += 1;
    }

    if imported > 0 {
        state.scheduler.nudge();
    }
    info!(imported, "Configuration import finished");
    Ok(Json(ImportOut {
        imported_accounts: imported,
    }))
}
