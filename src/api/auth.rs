//! Admin authentication.
//!
//! Two ways in: the static API token (`Authorization: Bearer` or
//! `X-API-Key`), or an opaque session token issued by `POST /auth/login`
//! and held server-side with an expiry. The admin password comes from
//! the environment until it is changed through the API, after which the
//! argon2 hash in `system_settings` wins. With neither an API token nor
//! admin credentials configured the control plane is open (single-user,
//! self-hosted default).

use std::collections::HashMap;
use std::sync::Mutex;

use argon2::password_hash::{rand_core::OsRng as PasswordOsRng, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ApiError, ApiResult, AppState};
use crate::adapters::sqlite;
use crate::config::BootConfig;

const SESSION_TTL_SECS: i64 = 24 * 60 * 60;
const PASSWORD_HASH_KEY: &str = "admin_password_hash";

pub struct AuthState {
    admin_username: Option<String>,
    admin_password_env: Option<String>,
    reset_token: Option<String>,
    /// token -> expiry (unix seconds)
    sessions: Mutex<HashMap<String, i64>>,
}

impl AuthState {
    pub fn new(boot: &BootConfig) -> Self {
        Self {
            admin_username: boot.admin_username.clone(),
            admin_password_env: boot.admin_password.clone(),
            reset_token: boot.admin_reset_token.clone(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn login_configured(&self) -> bool {
        self.admin_username.is_some()
    }

    fn issue_session(&self) -> (String, i64) {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        let expires_at = chrono::Utc::now().timestamp() + SESSION_TTL_SECS;

        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let now = chrono::Utc::now().timestamp();
        sessions.retain(|_, expiry| *expiry > now);
        sessions.insert(token.clone(), expires_at);
        (token, expires_at)
    }

    fn session_valid(&self, token: &str) -> bool {
        let sessions = self.sessions.lock().expect("session map poisoned");
        sessions
            .get(token)
            .is_some_and(|expiry| *expiry > chrono::Utc::now().timestamp())
    }

    /// Verify the admin password: a stored argon2 hash (set via
    /// change/reset) takes precedence over the environment value.
    fn verify_password(&self, pool: &sqlite::DbPool, password: &str) -> bool {
        match sqlite::settings::get(pool, PASSWORD_HASH_KEY) {
            Ok(Some(stored)) => PasswordHash::new(&stored)
                .map(|hash| {
                    Argon2::default()
                        .verify_password(password.as_bytes(), &hash)
                        .is_ok()
                })
                .unwrap_or(false),
            Ok(None) => self
                .admin_password_env
                .as_deref()
                .is_some_and(|env_password| env_password == password),
            Err(e) => {
                warn!(error = %e, "Password verification failed to read settings");
                false
            }
        }
    }

    fn store_password(&self, pool: &sqlite::DbPool, password: &str) -> ApiResult<()> {
        let salt = SaltString::generate(&mut PasswordOsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| ApiError::bad_request(format!("could not hash password: {}", e)))?
            .to_string();
        sqlite::settings::set(pool, PASSWORD_HASH_KEY, &hash)?;
        Ok(())
    }
}

/// Gate for all mutating/protected routes.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let settings = state.pipeline.settings.current().await;
    let api_token = settings.api_token.as_deref();

    // Nothing configured: open mode.
    if api_token.is_none() && !state.auth.login_configured() {
        return Ok(next.run(request).await);
    }

    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let api_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    let presented = bearer.or(api_key);
    let authorized = match presented {
        Some(token) => api_token == Some(token) || state.auth.session_valid(token),
        None => false,
    };

    if authorized {
        Ok(next.run(request).await)
    } else {
        Err(ApiError::unauthorized("missing or invalid credentials"))
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/config", get(auth_config))
        .route("/auth/login", post(login))
        .route("/auth/change-password", post(change_password))
        .route("/auth/reset-password", post(reset_password))
}

#[derive(Serialize)]
struct AuthConfigOut {
    login_required: bool,
    reset_enabled: bool,
}

async fn auth_config(State(state): State<AppState>) -> Json<AuthConfigOut> {
    let settings = state.pipeline.settings.current().await;
    Json(AuthConfigOut {
        login_required: settings.api_token.is_some() || state.auth.login_configured(),
        reset_enabled: state.auth.reset_token.is_some(),
    })
}

#[derive(Deserialize)]
struct LoginIn {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct LoginOut {
    token: String,
    expires_at: i64,
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginIn>,
) -> ApiResult<Json<LoginOut>> {
    let Some(expected_user) = state.auth.admin_username.as_deref() else {
        return Err(ApiError::bad_request("password login is not configured"));
    };
    if body.username != expected_user || !state.auth.verify_password(state.pool(), &body.password)
    {
        warn!(username = %body.username, "Rejected login attempt");
        return Err(ApiError::unauthorized("invalid username or password"));
    }

    let (token, expires_at) = state.auth.issue_session();
    info!(username = %body.username, "Admin logged in");
    Ok(Json(LoginOut { token, expires_at }))
}

#[derive(Deserialize)]
struct ChangePasswordIn {
    old_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    Json(body): Json<ChangePasswordIn>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.auth.login_configured() {
        return Err(ApiError::bad_request("password login is not configured"));
    }
    if body.new_password.len() < 8 {
        return Err(ApiError::bad_request(
            "new password must be at least 8 characters",
        ));
    }
    if !state.auth.verify_password(state.pool(), &body.old_password) {
        return Err(ApiError::unauthorized("current password is incorrect"));
    }

    state.auth.store_password(state.pool(), &body.new_password)?;
    info!("Admin password changed");
    Ok(Json(serde_json::json!({ "changed": true })))
}

#[derive(Deserialize)]
struct ResetPasswordIn {
    reset_token: String,
    new_password: String,
}

async fn reset_password(
    State(state): State<AppState>,
    Json(body): Json<ResetPasswordIn>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(expected) = state.auth.reset_token.as_deref() else {
        return Err(ApiError::bad_request("password reset is not enabled"));
    };
    if body.reset_token != expected {
        return Err(ApiError::unauthorized("invalid reset token"));
    }
    if body.new_password.len() < 8 {
        return Err(ApiError::bad_request(
            "new password must be at least 8 characters",
        ));
    }

    state.auth.store_password(state.pool(), &body.new_password)?;
    info!("Admin password reset via token");
    Ok(Json(serde_json::json!({ "reset": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool::create_test_pool;

    fn boot_with_admin() -> BootConfig {
        BootConfig {
            encryption_key: String::new(),
            database_path: "./unused.db".into(),
            listen_addr: String::new(),
            admin_username: Some("admin".to_string()),
            admin_password: Some("env-secret".to_string()),
            admin_reset_token: Some("reset-me".to_string()),
            api_token: None,
            telegram_bot_token: None,
            telegram_chat_id: None,
            webhook_url: None,
            poll_interval_seconds: 300,
        }
    }

    #[test]
    fn sessions_expire_and_validate() {
        let auth = AuthState::new(&boot_with_admin());
        let (token, expires_at) = auth.issue_session();
        assert!(auth.session_valid(&token));
        assert!(expires_at > chrono::Utc::now().timestamp());
        assert!(!auth.session_valid("other-token"));

        // Force expiry.
        auth.sessions
            .lock()
            .unwrap()
            .insert(token.clone(), chrono::Utc::now().timestamp() - 1);
        assert!(!auth.session_valid(&token));
    }

    #[test]
    fn stored_hash_overrides_env_password() {
        let pool = create_test_pool();
        let auth = AuthState::new(&boot_with_admin());

        assert!(auth.verify_password(&pool, "env-secret"));
        assert!(!auth.verify_password(&pool, "wrong"));

        auth.store_password(&pool, "rotated-secret").unwrap();
        assert!(auth.verify_password(&pool, "rotated-secret"));
        assert!(!auth.verify_password(&pool, "env-secret"));
    }
}
