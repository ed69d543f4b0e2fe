//! Environment bootstrap.
//!
//! Everything needed before the store exists comes from the environment.
//! Editable runtime settings (Telegram credentials, poll interval, ...)
//! live in the `system_settings` table and override these defaults; see
//! `services::settings`.

use std::path::PathBuf;

use crate::error::{Error, Result};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;
pub const MIN_POLL_INTERVAL_SECS: u64 = 5;

/// Process-level configuration, read once at boot.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Base64-encoded 32-byte key for the credential cipher. Required.
    pub encryption_key: String,
    /// SQLite database file path.
    pub database_path: PathBuf,
    /// Bind address for the HTTP control plane.
    pub listen_addr: String,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub admin_reset_token: Option<String>,
    pub api_token: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub webhook_url: Option<String>,
    pub poll_interval_seconds: u64,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl BootConfig {
    /// Read configuration from the environment. A missing or empty
    /// `ENCRYPTION_KEY` is fatal: starting without it would strand every
    /// stored credential.
    pub fn from_env() -> Result<Self> {
        let encryption_key = env_opt("ENCRYPTION_KEY").ok_or_else(|| {
            Error::Config(
                "ENCRYPTION_KEY is required (base64-encoded 32-byte key)".to_string(),
            )
        })?;

        let database_path = env_opt("DATABASE_URL")
            .map(|v| PathBuf::from(v.trim_start_matches("sqlite://")))
            .unwrap_or_else(|| PathBuf::from("./mail_agg.db"));

        let poll_interval_seconds = env_opt("POLL_INTERVAL_SECONDS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.max(MIN_POLL_INTERVAL_SECS))
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);

        Ok(Self {
            encryption_key,
            database_path,
            listen_addr: env_opt("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            admin_username: env_opt("ADMIN_USERNAME"),
            admin_password: env_opt("ADMIN_PASSWORD"),
            admin_reset_token: env_opt("ADMIN_RESET_TOKEN"),
            api_token: env_opt("API_TOKEN"),
            telegram_bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_opt("TELEGRAM_CHAT_ID"),
            webhook_url: env_opt("WEBHOOK_URL"),
            poll_interval_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_encryption_key_is_fatal() {
        std::env::remove_var("ENCRYPTION_KEY");
        let err = BootConfig::from_env().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
