//! Runtime settings snapshot.
//!
//! Environment variables provide the defaults; rows in
//! `system_settings` override them. Readers grab a cheap `Arc` snapshot;
//! `PATCH /settings` (and import) rewrites the table and rebuilds the
//! snapshot under the write lock before the response returns, so no
//! request ever sees a half-applied change.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::adapters::sqlite::{self, DbPool};
use crate::config::{BootConfig, MIN_POLL_INTERVAL_SECS};
use crate::error::Result;

/// Keys the API may write. Everything else in the environment is
/// boot-only.
pub const EDITABLE_KEYS: &[&str] = &[
    "telegram_bot_token",
    "telegram_chat_id",
    "poll_interval_seconds",
    "webhook_url",
    "api_token",
    "retention_keep_days",
    "retention_keep_per_account",
    "imap_mirror_mark_read",
];

#[derive(Debug, Clone)]
pub struct Settings {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    /// Global poll interval, clamped to at least 5 s.
    pub poll_interval_seconds: u64,
    pub webhook_url: Option<String>,
    pub api_token: Option<String>,
    pub retention_keep_days: Option<u32>,
    pub retention_keep_per_account: Option<u32>,
    /// Mirror rule-driven mark-read to the IMAP server (default on).
    pub imap_mirror_mark_read: bool,
}

impl Settings {
    fn from_defaults(boot: &BootConfig) -> Self {
        Self {
            telegram_bot_token: boot.telegram_bot_token.clone(),
            telegram_chat_id: boot.telegram_chat_id.clone(),
            poll_interval_seconds: boot.poll_interval_seconds.max(MIN_POLL_INTERVAL_SECS),
            webhook_url: boot.webhook_url.clone(),
            api_token: boot.api_token.clone(),
            retention_keep_days: None,
            retention_keep_per_account: None,
            imap_mirror_mark_read: true,
        }
    }

    fn apply_overrides(&mut self, overrides: &HashMap<String, String>) {
        // A stored empty string clears a string setting; unparseable
        // numbers keep the default.
        let string_field = |key: &str| -> Option<Option<String>> {
            overrides
                .get(key)
                .map(|v| Some(v.trim().to_string()).filter(|s| !s.is_empty()))
        };

        if let Some(v) = string_field("telegram_bot_token") {
            self.telegram_bot_token = v;
        }
        if let Some(v) = string_field("telegram_chat_id") {
            self.telegram_chat_id = v;
        }
        if let Some(v) = string_field("webhook_url") {
            self.webhook_url = v;
        }
        if let Some(v) = string_field("api_token") {
            self.api_token = v;
        }
        if let Some(v) = overrides.get("poll_interval_seconds") {
            if let Ok(parsed) = v.trim().parse::<u64>() {
                self.poll_interval_seconds = parsed.max(MIN_POLL_INTERVAL_SECS);
            }
        }
        if let Some(v) = overrides.get("retention_keep_days") {
            self.retention_keep_days = v.trim().parse::<u32>().ok();
        }
        if let Some(v) = overrides.get("retention_keep_per_account") {
            self.retention_keep_per_account = v.trim().parse::<u32>().ok();
        }
        if let Some(v) = overrides.get("imap_mirror_mark_read") {
            self.imap_mirror_mark_read = v.trim() != "false";
        }
    }
}

pub struct SettingsCache {
    defaults: BootConfig,
    snapshot: RwLock<Arc<Settings>>,
}

impl SettingsCache {
    pub fn new(boot: BootConfig) -> Self {
        let initial = Arc::new(Settings::from_defaults(&boot));
        Self {
            defaults: boot,
            snapshot: RwLock::new(initial),
        }
    }

    /// Current consistent snapshot. Cheap; hold the `Arc`, not the lock.
    pub async fn current(&self) -> Arc<Settings> {
        self.snapshot.read().await.clone()
    }

    /// Rebuild the snapshot from env defaults plus the settings table.
    /// Called at boot and synchronously after every settings mutation.
    pub async fn reload(&self, pool: &DbPool) -> Result<Arc<Settings>> {
        let overrides = sqlite::settings::get_all(pool)?;
        let mut settings = Settings::from_defaults(&self.defaults);
        settings.apply_overrides(&overrides);
        let settings = Arc::new(settings);

        let mut guard = self.snapshot.write().await;
        *guard = settings.clone();
        debug!("Settings snapshot reloaded");
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool::create_test_pool;

    fn boot() -> BootConfig {
        BootConfig {
            encryption_key: "unused".to_string(),
            database_path: "./unused.db".into(),
            listen_addr: "127.0.0.1:0".to_string(),
            admin_username: None,
            admin_password: None,
            admin_reset_token: None,
            api_token: Some("env-token".to_string()),
            telegram_bot_token: None,
            telegram_chat_id: None,
            webhook_url: None,
            poll_interval_seconds: 300,
        }
    }

    #[tokio::test]
    async fn overrides_replace_env_defaults() {
        let pool = create_test_pool();
        let cache = SettingsCache::new(boot());

        assert_eq!(
            cache.current().await.api_token.as_deref(),
            Some("env-token")
        );

        sqlite::settings::set(&pool, "api_token", "db-token").unwrap();
        sqlite::settings::set(&pool, "poll_interval_seconds", "60").unwrap();
        cache.reload(&pool).await.unwrap();

        let snapshot = cache.current().await;
        assert_eq!(snapshot.api_token.as_deref(), Some("db-token"));
        assert_eq!(snapshot.poll_interval_seconds, 60);
    }

    #[tokio::test]
    async fn empty_override_clears_and_interval_is_clamped() {
        let pool = create_test_pool();
        let cache = SettingsCache::new(boot());

        sqlite::settings::set(&pool, "api_token", "").unwrap();
        sqlite::settings::set(&pool, "poll_interval_seconds", "1").unwrap();
        sqlite::settings::set(&pool, "imap_mirror_mark_read", "false").unwrap();
        cache.reload(&pool).await.unwrap();

        let snapshot = cache.current().await;
        assert_eq!(snapshot.api_token, None);
        assert_eq!(snapshot.poll_interval_seconds, MIN_POLL_INTERVAL_SECS);
        assert!(!snapshot.imap_mirror_mark_read);
    }
}
