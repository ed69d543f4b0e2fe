//! Per-account fetch pipeline.
//!
//! One `Pipeline::run` call is one poll: acquire the account's
//! single-flight lock, pull new messages over IMAP, and for each one
//! walk insert → rules → labels/read → deliveries. Transport and auth
//! errors stop the poll and land in the account's poll status; nothing
//! propagates into the scheduler loop. Delivery failures never roll
//! back persistence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::adapters::imap;
use crate::adapters::imap::fetch::FetchedEmail;
use crate::adapters::sqlite::accounts::Account;
use crate::adapters::sqlite::messages::{EmailRecord, NewEmail};
use crate::adapters::sqlite::rules::MailRule;
use crate::adapters::sqlite::{self, DbPool};
use crate::encryption::SecretCipher;
use crate::error::{Error, Result};
use crate::services::rules_engine::{self, Decision, RuleInput};
use crate::services::settings::SettingsCache;
use crate::services::{helpers, telegram, webhook};

/// Days of history pulled when an account has no watermark yet.
const FIRST_SYNC_LOOKBACK_DAYS: u32 = 7;

/// Result of one poll attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The poll ran to completion.
    Completed { fetched: usize, inserted: usize },
    /// Another fetch for this account was already in flight, or the
    /// account is gone/inactive.
    Skipped,
    /// The poll aborted; the message is also in the poll status row.
    Failed { error: String },
}

/// Shared dependencies for the ingestion side: the scheduler, the
/// on-demand fetch endpoint, and the API all hold one `Arc<Pipeline>`.
pub struct Pipeline {
    pub pool: DbPool,
    pub cipher: Arc<SecretCipher>,
    pub settings: Arc<SettingsCache>,
    pub http: reqwest::Client,
    locks: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(
        pool: DbPool,
        cipher: Arc<SecretCipher>,
        settings: Arc<SettingsCache>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            pool,
            cipher,
            settings,
            http,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// The named lock guaranteeing at most one in-flight fetch per
    /// account.
    fn fetch_lock(&self, account_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one poll for the account. A second call while one is in
    /// flight returns `Skipped` immediately.
    pub async fn run(&self, account_id: i64) -> Result<FetchOutcome> {
        let lock = self.fetch_lock(account_id);
        let Ok(_guard) = lock.try_lock() else {
            debug!(account_id, "Fetch already in flight; skipping");
            return Ok(FetchOutcome::Skipped);
        };

        let Some(account) = sqlite::accounts::get_account(&self.pool, account_id)? else {
            return Err(Error::NotFound(format!("account {}", account_id)));
        };
        if !account.is_active {
            return Ok(FetchOutcome::Skipped);
        }

        sqlite::poll_status::mark_started(&self.pool, account_id, now())?;
        match self.poll_account(&account).await {
            Ok(outcome) => {
                let finished = now();
                sqlite::poll_status::mark_success(&self.pool, account_id, finished)?;
                sqlite::poll_status::mark_finished(&self.pool, account_id, finished)?;
                Ok(outcome)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(account_id, email = %account.email, error = %message, "Poll failed");
                sqlite::poll_status::record_error(&self.pool, account_id, &message)?;
                sqlite::poll_status::mark_finished(&self.pool, account_id, now())?;
                Ok(FetchOutcome::Failed { error: message })
            }
        }
    }

    /// The fallible body of one poll. Any error here is recorded by the
    /// caller; persistence done before the failure stays.
    async fn poll_account(&self, account: &Account) -> Result<FetchOutcome> {
        let settings = self.settings.current().await;
        let password = self.cipher.decrypt(&account.encrypted_pwd)?;

        let rules = sqlite::rules::list_rules_for_account(&self.pool, account.id)?;
        let filters = sqlite::push_filters::list_filters(&self.pool, account.id)?;

        // Select read-write only if some rule may ask for a server-side
        // \Seen write this poll.
        let mirror = settings.imap_mirror_mark_read;
        let read_only = !(mirror && rules.iter().any(|r| r.mark_read));

        let mut conn = imap::connect(
            &account.host,
            account.port,
            &account.email,
            &password,
            read_only,
        )
        .await?;
        drop(password);

        let fetch_result = imap::fetch_new(
            &mut conn,
            &account.host,
            account.last_seen_uid.as_deref(),
            FIRST_SYNC_LOOKBACK_DAYS,
        )
        .await;
        let (emails, new_watermark) = match fetch_result {
            Ok(result) => result,
            Err(e) => {
                conn.logout().await;
                return Err(e);
            }
        };

        // The very first poll backfills history without notifying.
        let initial_sync = account.last_seen_uid.is_none();

        let fetched = emails.len();
        let mut inserted = 0;
        let mut mark_uids: Vec<u32> = Vec::new();

        for email in &emails {
            let processed = match process_new_message(&self.pool, account, &rules, email) {
                Ok(processed) => processed,
                Err(e) => {
                    // Store failure: stop here without advancing the
                    // watermark. Rows persisted so far survive; the next
                    // poll re-fetches and dedup absorbs the overlap.
                    conn.logout().await;
                    return Err(e);
                }
            };
            let Some((record, decision)) = processed else {
                debug!(account_id = account.id, message_id = %email.message_id, "Duplicate; skipping");
                continue;
            };
            inserted += 1;

            if decision.mark_read && mirror && !read_only {
                mark_uids.push(email.uid);
            }

            if initial_sync {
                continue;
            }

            if account.telegram_push_enabled
                && decision.push_telegram
                && telegram::filters_admit(&record, &filters)
            {
                if let Err(e) =
                    telegram::send_notification(&self.http, &settings, account, &record).await
                {
                    error!(account_id = account.id, error = %e, "Telegram delivery failed");
                }
            }

            if let Err(e) =
                webhook::send_webhook(&self.http, &settings, &account.email, &record).await
            {
                error!(account_id = account.id, error = %e, "Webhook delivery failed");
            }
        }

        if !mark_uids.is_empty() {
            if let Err(e) = imap::mark_seen(&mut conn, &mark_uids).await {
                warn!(account_id = account.id, error = %e, "Server-side mark-read failed");
            }
        }
        conn.logout().await;

        if let Some(watermark) = new_watermark {
            sqlite::accounts::set_watermark(&self.pool, account.id, &watermark)?;
        }

        if inserted > 0 {
            info!(
                account_id = account.id,
                email = %account.email,
                fetched,
                inserted,
                "Poll completed"
            );
        }
        Ok(FetchOutcome::Completed { fetched, inserted })
    }
}

/// Steps 1–3 of the per-message pipeline: dedup-gated insert, rule
/// evaluation, label/read update. Returns `None` when the message was
/// already present (side effects already happened or were waived in a
/// prior run).
pub fn process_new_message(
    pool: &DbPool,
    account: &Account,
    rules: &[MailRule],
    email: &FetchedEmail,
) -> Result<Option<(EmailRecord, Decision)>> {
    let body_text = if email.body_text.is_empty() {
        email
            .body_html
            .as_deref()
            .map(helpers::html_to_text)
            .unwrap_or_default()
    } else {
        email.body_text.clone()
    };

    let summary_source = if body_text.trim().is_empty() {
        email.subject.as_str()
    } else {
        body_text.as_str()
    };

    let new_email = NewEmail {
        account_id: account.id,
        message_id: email.message_id.clone(),
        subject: email.subject.clone(),
        sender: email.sender.clone(),
        content_summary: helpers::summarize(summary_source),
        body_text,
        body_html: email.body_html.clone(),
        received_at: email.received_at,
    };

    let (record, was_inserted) = sqlite::messages::insert_if_new(pool, &new_email)?;
    if !was_inserted {
        return Ok(None);
    }

    let decision = rules_engine::evaluate(
        &RuleInput {
            account_id: account.id,
            sender: &record.sender,
            subject: &record.subject,
            body: &record.body_text,
        },
        account.telegram_push_enabled,
        rules,
    );

    sqlite::messages::apply_rule_decision(pool, record.id, &decision.add_labels, decision.mark_read)?;

    let record = sqlite::messages::get_record(pool, record.id)?
        .ok_or_else(|| Error::Database("email vanished mid-pipeline".to_string()))?;
    Ok(Some((record, decision)))
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::accounts::{self, NewAccount, PushTemplate};
    use crate::adapters::sqlite::pool::create_test_pool;
    use crate::adapters::sqlite::rules::{self, NewMailRule};

    fn seed_account(pool: &DbPool) -> Account {
        accounts::create_account(
            pool,
            &NewAccount {
                email: "a@example.com".to_string(),
                provider: "custom".to_string(),
                host: "imap.example.com".to_string(),
                port: 993,
                encrypted_pwd: "ct".to_string(),
                is_active: true,
                sort_order: None,
                telegram_push_enabled: true,
                push_template: PushTemplate::Short,
                poll_interval_seconds: None,
            },
        )
        .unwrap()
    }

    fn fetched(uid: u32, message_id: &str, subject: &str) -> FetchedEmail {
        FetchedEmail {
            uid,
            message_id: message_id.to_string(),
            subject: subject.to_string(),
            sender: "ops@example.com".to_string(),
            body_text: "disk almost full".to_string(),
            body_html: None,
            received_at: 1_700_000_000,
        }
    }

    #[test]
    fn pipeline_is_idempotent_per_message_id() {
        let pool = create_test_pool();
        let account = seed_account(&pool);
        rules::create_rule(
            &pool,
            &NewMailRule {
                name: "alerts".to_string(),
                rule_order: 0,
                account_id: None,
                sender_pattern: String::new(),
                subject_pattern: "alert".to_string(),
                body_pattern: String::new(),
                add_labels: vec!["P1".to_string()],
                push_telegram: true,
                mark_read: false,
            },
        )
        .unwrap();
        let rule_list = rules::list_rules_for_account(&pool, account.id).unwrap();

        let email = fetched(100, "<a@x>", "Alert: disk");
        let first = process_new_message(&pool, &account, &rule_list, &email)
            .unwrap()
            .unwrap();
        assert_eq!(first.0.labels, vec!["P1"]);

        // Observed again (restart, watermark rewind): no second row, no
        // second decision.
        let second = process_new_message(&pool, &account, &rule_list, &email).unwrap();
        assert!(second.is_none());
        assert_eq!(
            sqlite::messages::count_for_account(&pool, account.id).unwrap(),
            1
        );
    }

    #[test]
    fn html_only_body_is_converted_and_summarized() {
        let pool = create_test_pool();
        let account = seed_account(&pool);

        let mut email = fetched(101, "<b@x>", "newsletter");
        email.body_text = String::new();
        email.body_html = Some("<p>Hello <b>there</b></p>".to_string());

        let (record, _) = process_new_message(&pool, &account, &[], &email)
            .unwrap()
            .unwrap();
        assert_eq!(record.body_text, "Hello there");
        assert_eq!(record.content_summary, "Hello there");
        assert_eq!(record.body_html.as_deref(), Some("<p>Hello <b>there</b></p>"));
    }

    #[test]
    fn mark_read_rule_flips_the_local_flag() {
        let pool = create_test_pool();
        let account = seed_account(&pool);
        rules::create_rule(
            &pool,
            &NewMailRule {
                name: "auto-read".to_string(),
                rule_order: 0,
                account_id: None,
                sender_pattern: "ops@".to_string(),
                subject_pattern: String::new(),
                body_pattern: String::new(),
                add_labels: vec![],
                push_telegram: true,
                mark_read: true,
            },
        )
        .unwrap();
        let rule_list = rules::list_rules_for_account(&pool, account.id).unwrap();

        let (record, decision) =
            process_new_message(&pool, &account, &rule_list, &fetched(1, "<c@x>", "s"))
                .unwrap()
                .unwrap();
        assert!(decision.mark_read);
        assert!(record.is_read);
    }

    fn test_pipeline(pool: DbPool) -> Pipeline {
        use base64::Engine;
        let settings = Arc::new(SettingsCache::new(crate::config::BootConfig {
            encryption_key: String::new(),
            database_path: "./unused.db".into(),
            listen_addr: String::new(),
            admin_username: None,
            admin_password: None,
            admin_reset_token: None,
            api_token: None,
            telegram_bot_token: None,
            telegram_chat_id: None,
            webhook_url: None,
            poll_interval_seconds: 300,
        }));
        let cipher = Arc::new(
            crate::encryption::SecretCipher::from_key(
                &base64::engine::general_purpose::STANDARD.encode([1u8; 32]),
            )
            .unwrap(),
        );
        Pipeline::new(pool, cipher, settings, reqwest::Client::new())
    }

    #[tokio::test]
    async fn second_fetch_is_skipped_while_first_holds_the_lock() {
        let pool = create_test_pool();
        let account = seed_account(&pool);
        let pipeline = test_pipeline(pool);

        let lock = pipeline.fetch_lock(account.id);
        let _held = lock.lock().await;

        let outcome = pipeline.run(account.id).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Skipped);
    }

    #[tokio::test]
    async fn inactive_account_is_skipped() {
        let pool = create_test_pool();
        let account = seed_account(&pool);
        accounts::update_account(
            &pool,
            account.id,
            &accounts::AccountPatch {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        let pipeline = test_pipeline(pool);

        let outcome = pipeline.run(account.id).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Skipped);
    }
}
