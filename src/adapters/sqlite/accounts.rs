//! Account rows.
//!
//! Credentials are stored as ciphertext only; no read path here returns a
//! plaintext password. Decryption happens in the fetcher, right before the
//! IMAP login.

use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use super::DbPool;
use crate::error::{Error, Result};

/// Notification body rendering preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushTemplate {
    FullEmail,
    Full,
    Short,
    TitleOnly,
}

impl PushTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullEmail => "full_email",
            Self::Full => "full",
            Self::Short => "short",
            Self::TitleOnly => "title_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full_email" => Some(Self::FullEmail),
            "full" => Some(Self::Full),
            "short" => Some(Self::Short),
            "title_only" => Some(Self::TitleOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub email: String,
    pub provider: String,
    pub host: String,
    pub port: u16,
    pub encrypted_pwd: String,
    pub is_active: bool,
    pub sort_order: i64,
    pub telegram_push_enabled: bool,
    pub push_template: PushTemplate,
    pub poll_interval_seconds: Option<u32>,
    pub last_seen_uid: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields for a new account. `encrypted_pwd` is already ciphered by the
/// caller.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub provider: String,
    pub host: String,
    pub port: u16,
    pub encrypted_pwd: String,
    pub is_active: bool,
    pub sort_order: Option<i64>,
    pub telegram_push_enabled: bool,
    pub push_template: PushTemplate,
    pub poll_interval_seconds: Option<u32>,
}

/// Partial update. `poll_interval_seconds` distinguishes "no change"
/// (None) from "set to inherit" (Some(None)).
#[derive(Debug, Clone, Default)]
pub struct AccountPatch {
    pub provider: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub encrypted_pwd: Option<String>,
    pub is_active: Option<bool>,
    pub sort_order: Option<i64>,
    pub telegram_push_enabled: Option<bool>,
    pub push_template: Option<PushTemplate>,
    pub poll_interval_seconds: Option<Option<u32>>,
}

fn row_to_account(row: &Row) -> rusqlite::Result<Account> {
    let template: String = row.get("push_template")?;
    Ok(Account {
        id: row.get("id")?,
        email: row.get("email")?,
        provider: row.get("provider")?,
        host: row.get("host")?,
        port: row.get::<_, i64>("port")? as u16,
        encrypted_pwd: row.get("encrypted_pwd")?,
        is_active: row.get("is_active")?,
        sort_order: row.get("sort_order")?,
        telegram_push_enabled: row.get("telegram_push_enabled")?,
        push_template: PushTemplate::parse(&template).unwrap_or(PushTemplate::Short),
        poll_interval_seconds: row.get("poll_interval_seconds")?,
        last_seen_uid: row.get("last_seen_uid")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

const ACCOUNT_COLUMNS: &str = "id, email, provider, host, port, encrypted_pwd, is_active, \
     sort_order, telegram_push_enabled, push_template, poll_interval_seconds, \
     last_seen_uid, created_at, updated_at";

pub fn create_account(pool: &DbPool, spec: &NewAccount) -> Result<Account> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp();

    // New accounts go to the end of the list unless told otherwise.
    let sort_order = match spec.sort_order {
        Some(v) => v,
        None => conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM accounts",
            [],
            |row| row.get(0),
        )?,
    };

    let inserted = conn.execute(
        "INSERT INTO accounts (
            email, provider, host, port, encrypted_pwd, is_active, sort_order,
            telegram_push_enabled, push_template, poll_interval_seconds,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        params![
            spec.email,
            spec.provider,
            spec.host,
            spec.port as i64,
            spec.encrypted_pwd,
            spec.is_active,
            sort_order,
            spec.telegram_push_enabled,
            spec.push_template.as_str(),
            spec.poll_interval_seconds,
            now,
        ],
    );

    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(f, _))
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(Error::Conflict(format!(
                "account {} already exists",
                spec.email
            )));
        }
        Err(e) => return Err(e.into()),
    }

    let id = conn.last_insert_rowid();
    drop(conn);
    get_account(pool, id)?.ok_or_else(|| Error::Database("account vanished after insert".into()))
}

pub fn get_account(pool: &DbPool, id: i64) -> Result<Option<Account>> {
    let conn = pool.get()?;
    let result = conn.query_row(
        &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
        params![id],
        row_to_account,
    );
    match result {
        Ok(account) => Ok(Some(account)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn get_account_by_email(pool: &DbPool, email: &str) -> Result<Option<Account>> {
    let conn = pool.get()?;
    let result = conn.query_row(
        &format!("SELECT {} FROM accounts WHERE email = ?1", ACCOUNT_COLUMNS),
        params![email],
        row_to_account,
    );
    match result {
        Ok(account) => Ok(Some(account)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn list_accounts(pool: &DbPool, active_only: bool) -> Result<Vec<Account>> {
    let conn = pool.get()?;
    let sql = if active_only {
        format!(
            "SELECT {} FROM accounts WHERE is_active = 1 ORDER BY sort_order ASC, id ASC",
            ACCOUNT_COLUMNS
        )
    } else {
        format!(
            "SELECT {} FROM accounts ORDER BY sort_order ASC, id ASC",
            ACCOUNT_COLUMNS
        )
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_account)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn update_account(pool: &DbPool, id: i64, patch: &AccountPatch) -> Result<Account> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp();

    let tx = conn.unchecked_transaction()?;
    let existing = tx
        .query_row(
            &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
            params![id],
            row_to_account,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("account {}", id)),
            other => other.into(),
        })?;

    let poll_interval = match patch.poll_interval_seconds {
        Some(v) => v,
        None => existing.poll_interval_seconds,
    };

    tx.execute(
        "UPDATE accounts SET
            provider = ?2, host = ?3, port = ?4, encrypted_pwd = ?5,
            is_active = ?6, sort_order = ?7, telegram_push_enabled = ?8,
            push_template = ?9, poll_interval_seconds = ?10, updated_at = ?11
         WHERE id = ?1",
        params![
            id,
            patch.provider.as_ref().unwrap_or(&existing.provider),
            patch.host.as_ref().unwrap_or(&existing.host),
            patch.port.unwrap_or(existing.port) as i64,
            patch
                .encrypted_pwd
                .as_ref()
                .unwrap_or(&existing.encrypted_pwd),
            patch.is_active.unwrap_or(existing.is_active),
            patch.sort_order.unwrap_or(existing.sort_order),
            patch
                .telegram_push_enabled
                .unwrap_or(existing.telegram_push_enabled),
            patch
                .push_template
                .unwrap_or(existing.push_template)
                .as_str(),
            poll_interval,
            now,
        ],
    )?;
    tx.commit()?;
    drop(conn);

    get_account(pool, id)?.ok_or_else(|| Error::NotFound(format!("account {}", id)))
}

pub fn delete_account(pool: &DbPool, id: i64) -> Result<()> {
    let conn = pool.get()?;
    let deleted = conn.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
    if deleted == 0 {
        return Err(Error::NotFound(format!("account {}", id)));
    }
    Ok(())
}

/// Persist the fetch watermark after a fully successful poll.
pub fn set_watermark(pool: &DbPool, id: i64, watermark: &str) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE accounts SET last_seen_uid = ?2 WHERE id = ?1",
        params![id, watermark],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool::create_test_pool;

    fn sample_account(email: &str) -> NewAccount {
        NewAccount {
            email: email.to_string(),
            provider: "custom".to_string(),
            host: "imap.example.com".to_string(),
            port: 993,
            encrypted_pwd: "ciphertext".to_string(),
            is_active: true,
            sort_order: None,
            telegram_push_enabled: true,
            push_template: PushTemplate::Short,
            poll_interval_seconds: None,
        }
    }

    #[test]
    fn create_and_fetch() {
        let pool = create_test_pool();
        let account = create_account(&pool, &sample_account("a@example.com")).unwrap();
        assert_eq!(account.email, "a@example.com");
        assert!(account.is_active);
        assert_eq!(account.sort_order, 0);

        let second = create_account(&pool, &sample_account("b@example.com")).unwrap();
        assert_eq!(second.sort_order, 1);

        let listed = list_accounts(&pool, false).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, account.id);
    }

    #[test]
    fn duplicate_email_is_conflict() {
        let pool = create_test_pool();
        create_account(&pool, &sample_account("a@example.com")).unwrap();
        let err = create_account(&pool, &sample_account("a@example.com")).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn patch_distinguishes_inherit_from_no_change() {
        let pool = create_test_pool();
        let mut spec = sample_account("a@example.com");
        spec.poll_interval_seconds = Some(60);
        let account = create_account(&pool, &spec).unwrap();

        // No change requested: interval stays.
        let unchanged =
            update_account(&pool, account.id, &AccountPatch::default()).unwrap();
        assert_eq!(unchanged.poll_interval_seconds, Some(60));

        // Explicit null: back to inheriting the global interval.
        let patch = AccountPatch {
            poll_interval_seconds: Some(None),
            ..Default::default()
        };
        let inherited = update_account(&pool, account.id, &patch).unwrap();
        assert_eq!(inherited.poll_interval_seconds, None);
    }

    #[test]
    fn active_only_listing() {
        let pool = create_test_pool();
        let account = create_account(&pool, &sample_account("a@example.com")).unwrap();
        create_account(&pool, &sample_account("b@example.com")).unwrap();

        let patch = AccountPatch {
            is_active: Some(false),
            ..Default::default()
        };
        update_account(&pool, account.id, &patch).unwrap();

        let active = list_accounts(&pool, true).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].email, "b@example.com");
    }

    #[test]
    fn watermark_round_trip() {
        let pool = create_test_pool();
        let account = create_account(&pool, &sample_account("a@example.com")).unwrap();
        assert!(account.last_seen_uid.is_none());

        set_watermark(&pool, account.id, "7:1042").unwrap();
        let reloaded = get_account(&pool, account.id).unwrap().unwrap();
        assert_eq!(reloaded.last_seen_uid.as_deref(), Some("7:1042"));
    }
}
