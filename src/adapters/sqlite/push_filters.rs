//! Per-account Telegram push filter rows.

use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use super::DbPool;
use crate::error::{Error, Result};

/// Which message field a filter inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    Sender,
    /// Domain part of the sender address.
    Domain,
    Subject,
    Body,
}

impl FilterField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sender => "sender",
            Self::Domain => "domain",
            Self::Subject => "subject",
            Self::Body => "body",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sender" => Some(Self::Sender),
            "domain" => Some(Self::Domain),
            "subject" => Some(Self::Subject),
            "body" => Some(Self::Body),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Allow,
    Deny,
}

impl FilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PushFilter {
    pub id: i64,
    pub account_id: i64,
    pub field: FilterField,
    pub mode: FilterMode,
    pub value: String,
    pub rule_order: i64,
}

#[derive(Debug, Clone)]
pub struct NewPushFilter {
    pub field: FilterField,
    pub mode: FilterMode,
    pub value: String,
    pub rule_order: i64,
}

fn row_to_filter(row: &Row) -> rusqlite::Result<PushFilter> {
    let field: String = row.get("field")?;
    let mode: String = row.get("mode")?;
    Ok(PushFilter {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        field: FilterField::parse(&field).unwrap_or(FilterField::Sender),
        mode: FilterMode::parse(&mode).unwrap_or(FilterMode::Allow),
        value: row.get("value")?,
        rule_order: row.get("rule_order")?,
    })
}

pub fn create_filter(pool: &DbPool, account_id: i64, spec: &NewPushFilter) -> Result<PushFilter> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO telegram_filter_rules (account_id, field, mode, value, rule_order)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            account_id,
            spec.field.as_str(),
            spec.mode.as_str(),
            spec.value,
            spec.rule_order,
        ],
    )?;
    let id = conn.last_insert_rowid();
    let filter = conn.query_row(
        "SELECT id, account_id, field, mode, value, rule_order
         FROM telegram_filter_rules WHERE id = ?1",
        params![id],
        row_to_filter,
    )?;
    Ok(filter)
}

pub fn list_filters(pool: &DbPool, account_id: i64) -> Result<Vec<PushFilter>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, account_id, field, mode, value, rule_order
         FROM telegram_filter_rules
         WHERE account_id = ?1
         ORDER BY rule_order ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![account_id], row_to_filter)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn delete_filter(pool: &DbPool, id: i64) -> Result<()> {
    let conn = pool.get()?;
    let deleted = conn.execute(
        "DELETE FROM telegram_filter_rules WHERE id = ?1",
        params![id],
    )?;
    if deleted == 0 {
        return Err(Error::NotFound(format!("telegram filter rule {}", id)));
    }
    Ok(())
}

/// Drop and recreate an account's filter list (settings import).
pub fn replace_filters(pool: &DbPool, account_id: i64, specs: &[NewPushFilter]) -> Result<()> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM telegram_filter_rules WHERE account_id = ?1",
        params![account_id],
    )?;
    for spec in specs {
        tx.execute(
            "INSERT INTO telegram_filter_rules (account_id, field, mode, value, rule_order)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                account_id,
                spec.field.as_str(),
                spec.mode.as_str(),
                spec.value,
                spec.rule_order,
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool::create_test_pool;

    fn seed_account(pool: &DbPool, email: &str) -> i64 {
        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO accounts (email, encrypted_pwd, created_at, updated_at)
             VALUES (?1, 'ct', 0, 0)",
            params![email],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn crud_and_ordering() {
        let pool = create_test_pool();
        let account = seed_account(&pool, "a@example.com");

        let second = create_filter(
            &pool,
            account,
            &NewPushFilter {
                field: FilterField::Domain,
                mode: FilterMode::Allow,
                value: "example.com".to_string(),
                rule_order: 1,
            },
        )
        .unwrap();
        let first = create_filter(
            &pool,
            account,
            &NewPushFilter {
                field: FilterField::Subject,
                mode: FilterMode::Deny,
                value: "spam".to_string(),
                rule_order: 0,
            },
        )
        .unwrap();

        let listed = list_filters(&pool, account).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);

        delete_filter(&pool, first.id).unwrap();
        assert_eq!(list_filters(&pool, account).unwrap().len(), 1);
        assert!(matches!(
            delete_filter(&pool, first.id).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn replace_swaps_the_whole_list() {
        let pool = create_test_pool();
        let account = seed_account(&pool, "a@example.com");
        create_filter(
            &pool,
            account,
            &NewPushFilter {
                field: FilterField::Sender,
                mode: FilterMode::Deny,
                value: "old".to_string(),
                rule_order: 0,
            },
        )
        .unwrap();

        replace_filters(
            &pool,
            account,
            &[NewPushFilter {
                field: FilterField::Body,
                mode: FilterMode::Allow,
                value: "new".to_string(),
                rule_order: 0,
            }],
        )
        .unwrap();

        let listed = list_filters(&pool, account).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].value, "new");
        assert_eq!(listed[0].mode, FilterMode::Allow);
    }
}
