//! Persisted email rows.
//!
//! The UNIQUE(account_id, message_id) index is the only concurrency
//! control the pipeline depends on: `insert_if_new` either creates the
//! row or reports the existing one, and everything downstream keys off
//! that answer.

use rusqlite::{params, params_from_iter, Row};
use serde::Serialize;

use super::DbPool;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct NewEmail {
    pub account_id: i64,
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub content_summary: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub received_at: i64,
}

#[derive(Debug, Clone)]
pub struct EmailRecord {
    pub id: i64,
    pub account_id: i64,
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub content_summary: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub received_at: i64,
    pub is_read: bool,
    pub labels: Vec<String>,
}

/// List row joined with the owning account's email address.
#[derive(Debug, Clone, Serialize)]
pub struct EmailListItem {
    pub id: i64,
    pub message_id: String,
    pub account_id: i64,
    pub account_email: String,
    pub subject: String,
    pub sender: String,
    pub content_summary: String,
    pub received_at: i64,
    pub is_read: bool,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EmailFilter {
    pub account_id: Option<i64>,
    pub keyword: Option<String>,
    pub is_read: Option<bool>,
    pub label: Option<String>,
    pub date_from: Option<i64>,
    pub date_to: Option<i64>,
}

pub fn parse_labels(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn labels_to_json(labels: &[String]) -> String {
    serde_json::to_string(labels).unwrap_or_else(|_| "[]".to_string())
}

fn row_to_record(row: &Row) -> rusqlite::Result<EmailRecord> {
    let labels: String = row.get("labels")?;
    Ok(EmailRecord {
        id: row.get("id")?,
        account_id: row.get("account_id")?,
        message_id: row.get("message_id")?,
        subject: row.get("subject")?,
        sender: row.get("sender")?,
        content_summary: row.get("content_summary")?,
        body_text: row.get("body_text")?,
        body_html: row.get("body_html")?,
        received_at: row.get("received_at")?,
        is_read: row.get("is_read")?,
        labels: parse_labels(&labels),
    })
}

const RECORD_COLUMNS: &str = "id, account_id, message_id, subject, sender, content_summary, \
     body_text, body_html, received_at, is_read, labels";

/// Insert a message unless the (account_id, message_id) pair already
/// exists. Returns the row and whether it was inserted by this call.
/// Runs as one transaction so a concurrent duplicate resolves to exactly
/// one `inserted = true`.
pub fn insert_if_new(pool: &DbPool, email: &NewEmail) -> Result<(EmailRecord, bool)> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;
    let now = chrono::Utc::now().timestamp();

    let changed = tx.execute(
        "INSERT OR IGNORE INTO emails (
            account_id, message_id, subject, sender, content_summary,
            body_text, body_html, received_at, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            email.account_id,
            email.message_id,
            email.subject,
            email.sender,
            email.content_summary,
            email.body_text,
            email.body_html,
            email.received_at,
            now,
        ],
    )?;

    let record = tx.query_row(
        &format!(
            "SELECT {} FROM emails WHERE account_id = ?1 AND message_id = ?2",
            RECORD_COLUMNS
        ),
        params![email.account_id, email.message_id],
        row_to_record,
    )?;
    tx.commit()?;

    Ok((record, changed > 0))
}

/// Apply a rule decision: union `add_labels` into the stored label list
/// (insertion order preserved, no duplicates) and optionally flip
/// `is_read`. One transaction.
pub fn apply_rule_decision(
    pool: &DbPool,
    email_id: i64,
    add_labels: &[String],
    mark_read: bool,
) -> Result<()> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;

    let raw: String = tx
        .query_row(
            "SELECT labels FROM emails WHERE id = ?1",
            params![email_id],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("email {}", email_id)),
            other => other.into(),
        })?;

    let mut labels = parse_labels(&raw);
    for label in add_labels {
        if !labels.iter().any(|l| l == label) {
            labels.push(label.clone());
        }
    }

    tx.execute(
        "UPDATE emails SET labels = ?2, is_read = CASE WHEN ?3 THEN 1 ELSE is_read END
         WHERE id = ?1",
        params![email_id, labels_to_json(&labels), mark_read],
    )?;
    tx.commit()?;

    Ok(())
}

/// Replace the label list outright (reapply path: old labels are
/// discarded first). Returns true if the row changed.
pub fn reset_decision(
    pool: &DbPool,
    email_id: i64,
    labels: &[String],
    mark_read: bool,
) -> Result<bool> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;

    let (old_labels, was_read): (String, bool) = tx
        .query_row(
            "SELECT labels, is_read FROM emails WHERE id = ?1",
            params![email_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("email {}", email_id)),
            other => other.into(),
        })?;

    let new_labels = labels_to_json(labels);
    let new_read = was_read || mark_read;
    let changed = old_labels != new_labels || was_read != new_read;

    if changed {
        tx.execute(
            "UPDATE emails SET labels = ?2, is_read = ?3 WHERE id = ?1",
            params![email_id, new_labels, new_read],
        )?;
    }
    tx.commit()?;

    Ok(changed)
}

pub fn set_read(pool: &DbPool, email_id: i64, is_read: bool) -> Result<()> {
    let conn = pool.get()?;
    let changed = conn.execute(
        "UPDATE emails SET is_read = ?2 WHERE id = ?1",
        params![email_id, is_read],
    )?;
    if changed == 0 {
        return Err(Error::NotFound(format!("email {}", email_id)));
    }
    Ok(())
}

pub fn get_record(pool: &DbPool, email_id: i64) -> Result<Option<EmailRecord>> {
    let conn = pool.get()?;
    let result = conn.query_row(
        &format!("SELECT {} FROM emails WHERE id = ?1", RECORD_COLUMNS),
        params![email_id],
        row_to_record,
    );
    match result {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// All rows, oldest first. Used by the reapply maintenance operation.
pub fn list_all(pool: &DbPool) -> Result<Vec<EmailRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM emails ORDER BY id ASC",
        RECORD_COLUMNS
    ))?;
    let rows = stmt.query_map([], row_to_record)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn build_filter_clause(filter: &EmailFilter) -> (String, Vec<rusqlite::types::Value>) {
    use rusqlite::types::Value;

    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(account_id) = filter.account_id {
        values.push(Value::Integer(account_id));
        clauses.push(format!("e.account_id = ?{}", values.len()));
    }
    if let Some(keyword) = filter.keyword.as_ref().filter(|k| !k.trim().is_empty()) {
        let like = format!("%{}%", keyword.trim());
        values.push(Value::Text(like.clone()));
        let n = values.len();
        values.push(Value::Text(like.clone()));
        values.push(Value::Text(like));
        clauses.push(format!(
            "(e.subject LIKE ?{} OR e.sender LIKE ?{} OR e.content_summary LIKE ?{})",
            n,
            n + 1,
            n + 2
        ));
    }
    if let Some(is_read) = filter.is_read {
        values.push(Value::Integer(is_read as i64));
        clauses.push(format!("e.is_read = ?{}", values.len()));
    }
    if let Some(label) = filter.label.as_ref().filter(|l| !l.trim().is_empty()) {
        // Labels are a JSON array of strings; membership is an exact
        // match on the quoted element.
        let quoted = serde_json::to_string(label.trim()).unwrap_or_default();
        values.push(Value::Text(format!("%{}%", quoted)));
        clauses.push(format!("e.labels LIKE ?{}", values.len()));
    }
    if let Some(from) = filter.date_from {
        values.push(Value::Integer(from));
        clauses.push(format!("e.received_at >= ?{}", values.len()));
    }
    if let Some(to) = filter.date_to {
        values.push(Value::Integer(to));
        clauses.push(format!("e.received_at < ?{}", values.len()));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (where_sql, values)
}

/// Filtered, paginated listing with a stable `received_at DESC, id DESC`
/// order. Returns the page plus the unpaginated total.
pub fn query_messages(
    pool: &DbPool,
    filter: &EmailFilter,
    page: u32,
    page_size: u32,
) -> Result<(Vec<EmailListItem>, i64)> {
    let conn = pool.get()?;
    let (where_sql, values) = build_filter_clause(filter);

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(e.id) FROM emails e{}", where_sql),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    let offset = (page.saturating_sub(1) as i64) * page_size as i64;
    let sql = format!(
        "SELECT e.id, e.message_id, e.account_id, a.email AS account_email,
                e.subject, e.sender, e.content_summary, e.received_at,
                e.is_read, e.labels
         FROM emails e JOIN accounts a ON a.id = e.account_id{}
         ORDER BY e.received_at DESC, e.id DESC
         LIMIT {} OFFSET {}",
        where_sql, page_size, offset
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
        let labels: String = row.get("labels")?;
        Ok(EmailListItem {
            id: row.get("id")?,
            message_id: row.get("message_id")?,
            account_id: row.get("account_id")?,
            account_email: row.get("account_email")?,
            subject: row.get("subject")?,
            sender: row.get("sender")?,
            content_summary: row.get("content_summary")?,
            received_at: row.get("received_at")?,
            is_read: row.get("is_read")?,
            labels: parse_labels(&labels),
        })
    })?;

    Ok((rows.collect::<rusqlite::Result<Vec<_>>>()?, total))
}

pub fn count_for_account(pool: &DbPool, account_id: i64) -> Result<i64> {
    let conn = pool.get()?;
    Ok(conn.query_row(
        "SELECT COUNT(id) FROM emails WHERE account_id = ?1",
        params![account_id],
        |row| row.get(0),
    )?)
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

    fn sample_email(account_id: i64, message_id: &str, received_at: i64) -> NewEmail {
        NewEmail {
            account_id,
            message_id: message_id.to_string(),
            subject: "Alert: disk".to_string(),
            sender: "ops@example.com".to_string(),
            content_summary: "disk almost full".to_string(),
            body_text: "disk almost full on host-1".to_string(),
            body_html: None,
            received_at,
        }
    }

    #[test]
    fn insert_if_new_dedupes_per_account() {
        let pool = create_test_pool();
        let account = seed_account(&pool, "a@example.com");
        let other = seed_account(&pool, "b@example.com");

        let (first, inserted) =
            insert_if_new(&pool, &sample_email(account, "<m1@x>", 100)).unwrap();
        assert!(inserted);

        let (again, inserted) =
            insert_if_new(&pool, &sample_email(account, "<m1@x>", 100)).unwrap();
        assert!(!inserted);
        assert_eq!(again.id, first.id);

        // Same Message-ID under a different account is a distinct row.
        let (_, inserted) = insert_if_new(&pool, &sample_email(other, "<m1@x>", 100)).unwrap();
        assert!(inserted);

        assert_eq!(count_for_account(&pool, account).unwrap(), 1);
        assert_eq!(count_for_account(&pool, other).unwrap(), 1);
    }

    #[test]
    fn rule_decision_merges_labels_without_duplicates() {
        let pool = create_test_pool();
        let account = seed_account(&pool, "a@example.com");
        let (record, _) = insert_if_new(&pool, &sample_email(account, "<m1@x>", 100)).unwrap();

        apply_rule_decision(&pool, record.id, &["P1".into(), "P2".into()], false).unwrap();
        apply_rule_decision(&pool, record.id, &["P2".into(), "P3".into()], true).unwrap();

        let reloaded = get_record(&pool, record.id).unwrap().unwrap();
        assert_eq!(reloaded.labels, vec!["P1", "P2", "P3"]);
        assert!(reloaded.is_read);

        // mark_read = false never un-reads.
        apply_rule_decision(&pool, record.id, &[], false).unwrap();
        assert!(get_record(&pool, record.id).unwrap().unwrap().is_read);
    }

    #[test]
    fn reset_decision_replaces_labels() {
        let pool = create_test_pool();
        let account = seed_account(&pool, "a@example.com");
        let (record, _) = insert_if_new(&pool, &sample_email(account, "<m1@x>", 100)).unwrap();
        apply_rule_decision(&pool, record.id, &["Old".into()], false).unwrap();

        let changed = reset_decision(&pool, record.id, &["New".into()], false).unwrap();
        assert!(changed);
        let reloaded = get_record(&pool, record.id).unwrap().unwrap();
        assert_eq!(reloaded.labels, vec!["New"]);

        // Identical outcome reports no change.
        let changed = reset_decision(&pool, record.id, &["New".into()], false).unwrap();
        assert!(!changed);
    }

    #[test]
    fn query_filters_and_paginates() {
        let pool = create_test_pool();
        let account = seed_account(&pool, "a@example.com");
        for i in 0..5 {
            let mut email = sample_email(account, &format!("<m{}@x>", i), 100 + i);
            if i % 2 == 0 {
                email.subject = format!("newsletter {}", i);
            }
            insert_if_new(&pool, &email).unwrap();
        }

        let filter = EmailFilter {
            keyword: Some("newsletter".to_string()),
            ..Default::default()
        };
        let (items, total) = query_messages(&pool, &filter, 1, 2).unwrap();
        assert_eq!(total, 3);
        assert_eq!(items.len(), 2);
        // Newest first.
        assert!(items[0].received_at > items[1].received_at);
        assert_eq!(items[0].account_email, "a@example.com");

        let (page2, _) = query_messages(&pool, &filter, 2, 2).unwrap();
        assert_eq!(page2.len(), 1);
    }

    #[test]
    fn label_filter_matches_exact_element() {
        let pool = create_test_pool();
        let account = seed_account(&pool, "a@example.com");
        let (a, _) = insert_if_new(&pool, &sample_email(account, "<m1@x>", 100)).unwrap();
        let (b, _) = insert_if_new(&pool, &sample_email(account, "<m2@x>", 101)).unwrap();
        apply_rule_decision(&pool, a.id, &["P1".into()], false).unwrap();
        apply_rule_decision(&pool, b.id, &["P10".into()], false).unwrap();

        let filter = EmailFilter {
            label: Some("P1".to_string()),
            ..Default::default()
        };
        let (items, total) = query_messages(&pool, &filter, 1, 50).unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].id, a.id);
    }
}
