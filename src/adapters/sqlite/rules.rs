//! Mail rule rows.
//!
//! Rules are always read back in `(rule_order ASC, id ASC)` order; the
//! engine relies on the store for ordering so that live processing and
//! the reapply operation see the same sequence.

use rusqlite::{params, Row};

use super::messages::parse_labels;
use super::DbPool;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct MailRule {
    pub id: i64,
    pub name: String,
    pub rule_order: i64,
    /// None applies to every account.
    pub account_id: Option<i64>,
    pub sender_pattern: String,
    pub subject_pattern: String,
    pub body_pattern: String,
    pub add_labels: Vec<String>,
    pub push_telegram: bool,
    pub mark_read: bool,
}

#[derive(Debug, Clone)]
pub struct NewMailRule {
    pub name: String,
    pub rule_order: i64,
    pub account_id: Option<i64>,
    pub sender_pattern: String,
    pub subject_pattern: String,
    pub body_pattern: String,
    pub add_labels: Vec<String>,
    pub push_telegram: bool,
    pub mark_read: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MailRulePatch {
    pub name: Option<String>,
    pub rule_order: Option<i64>,
    pub account_id: Option<Option<i64>>,
    pub sender_pattern: Option<String>,
    pub subject_pattern: Option<String>,
    pub body_pattern: Option<String>,
    pub add_labels: Option<Vec<String>>,
    pub push_telegram: Option<bool>,
    pub mark_read: Option<bool>,
}

fn row_to_rule(row: &Row) -> rusqlite::Result<MailRule> {
    let labels: String = row.get("add_labels")?;
    Ok(MailRule {
        id: row.get("id")?,
        name: row.get("name")?,
        rule_order: row.get("rule_order")?,
        account_id: row.get("account_id")?,
        sender_pattern: row.get("sender_pattern")?,
        subject_pattern: row.get("subject_pattern")?,
        body_pattern: row.get("body_pattern")?,
        add_labels: parse_labels(&labels),
        push_telegram: row.get("push_telegram")?,
        mark_read: row.get("mark_read")?,
    })
}

const RULE_COLUMNS: &str = "id, name, rule_order, account_id, sender_pattern, subject_pattern, \
     body_pattern, add_labels, push_telegram, mark_read";

pub fn create_rule(pool: &DbPool, spec: &NewMailRule) -> Result<MailRule> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO mail_rules (
            name, rule_order, account_id, sender_pattern, subject_pattern,
            body_pattern, add_labels, push_telegram, mark_read
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            spec.name,
            spec.rule_order,
            spec.account_id,
            spec.sender_pattern,
            spec.subject_pattern,
            spec.body_pattern,
            serde_json::to_string(&spec.add_labels)?,
            spec.push_telegram,
            spec.mark_read,
        ],
    )?;
    let id = conn.last_insert_rowid();
    drop(conn);
    get_rule(pool, id)?.ok_or_else(|| Error::Database("rule vanished after insert".into()))
}

pub fn get_rule(pool: &DbPool, id: i64) -> Result<Option<MailRule>> {
    let conn = pool.get()?;
    let result = conn.query_row(
        &format!("SELECT {} FROM mail_rules WHERE id = ?1", RULE_COLUMNS),
        params![id],
        row_to_rule,
    );
    match result {
        Ok(rule) => Ok(Some(rule)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Every rule, already sorted for evaluation.
pub fn list_rules(pool: &DbPool) -> Result<Vec<MailRule>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM mail_rules ORDER BY rule_order ASC, id ASC",
        RULE_COLUMNS
    ))?;
    let rows = stmt.query_map([], row_to_rule)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Global rules plus rules scoped to the given account, sorted.
pub fn list_rules_for_account(pool: &DbPool, account_id: i64) -> Result<Vec<MailRule>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM mail_rules
         WHERE account_id IS NULL OR account_id = ?1
         ORDER BY rule_order ASC, id ASC",
        RULE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![account_id], row_to_rule)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn update_rule(pool: &DbPool, id: i64, patch: &MailRulePatch) -> Result<MailRule> {
    let existing = get_rule(pool, id)?.ok_or_else(|| Error::NotFound(format!("rule {}", id)))?;

    let account_id = match patch.account_id {
        Some(v) => v,
        None => existing.account_id,
    };
    let labels = patch.add_labels.as_ref().unwrap_or(&existing.add_labels);

    let conn = pool.get()?;
    conn.execute(
        "UPDATE mail_rules SET
            name = ?2, rule_order = ?3, account_id = ?4, sender_pattern = ?5,
            subject_pattern = ?6, body_pattern = ?7, add_labels = ?8,
            push_telegram = ?9, mark_read = ?10
         WHERE id = ?1",
        params![
            id,
            patch.name.as_ref().unwrap_or(&existing.name),
            patch.rule_order.unwrap_or(existing.rule_order),
            account_id,
            patch
                .sender_pattern
                .as_ref()
                .unwrap_or(&existing.sender_pattern),
            patch
                .subject_pattern
                .as_ref()
                .unwrap_or(&existing.subject_pattern),
            patch
                .body_pattern
                .as_ref()
                .unwrap_or(&existing.body_pattern),
            serde_json::to_string(labels)?,
            patch.push_telegram.unwrap_or(existing.push_telegram),
            patch.mark_read.unwrap_or(existing.mark_read),
        ],
    )?;
    drop(conn);

    get_rule(pool, id)?.ok_or_else(|| Error::NotFound(format!("rule {}", id)))
}

pub fn delete_rule(pool: &DbPool, id: i64) -> Result<()> {
    let conn = pool.get()?;
    let deleted = conn.execute("DELETE FROM mail_rules WHERE id = ?1", params![id])?;
    if deleted == 0 {
        return Err(Error::NotFound(format!("rule {}", id)));
    }
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

    fn sample_rule(order: i64, account_id: Option<i64>) -> NewMailRule {
        NewMailRule {
            name: format!("rule-{}", order),
            rule_order: order,
            account_id,
            sender_pattern: String::new(),
            subject_pattern: "alert".to_string(),
            body_pattern: String::new(),
            add_labels: vec!["P1".to_string()],
            push_telegram: true,
            mark_read: false,
        }
    }

    #[test]
    fn listing_is_sorted_by_order_then_id() {
        let pool = create_test_pool();
        let late = create_rule(&pool, &sample_rule(5, None)).unwrap();
        let early = create_rule(&pool, &sample_rule(0, None)).unwrap();
        let tie = create_rule(&pool, &sample_rule(0, None)).unwrap();

        let listed = list_rules(&pool).unwrap();
        let ids: Vec<i64> = listed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, tie.id, late.id]);
    }

    #[test]
    fn account_scoping() {
        let pool = create_test_pool();
        let a = seed_account(&pool, "a@example.com");
        let b = seed_account(&pool, "b@example.com");

        create_rule(&pool, &sample_rule(0, None)).unwrap();
        create_rule(&pool, &sample_rule(1, Some(a))).unwrap();
        create_rule(&pool, &sample_rule(2, Some(b))).unwrap();

        let for_a = list_rules_for_account(&pool, a).unwrap();
        assert_eq!(for_a.len(), 2);
        assert!(for_a.iter().all(|r| r.account_id.is_none() || r.account_id == Some(a)));
    }

    #[test]
    fn patch_can_clear_account_scope() {
        let pool = create_test_pool();
        let a = seed_account(&pool, "a@example.com");
        let rule = create_rule(&pool, &sample_rule(0, Some(a))).unwrap();

        let patch = MailRulePatch {
            account_id: Some(None),
            ..Default::default()
        };
        let updated = update_rule(&pool, rule.id, &patch).unwrap();
        assert_eq!(updated.account_id, None);

        // Untouched fields survive.
        assert_eq!(updated.subject_pattern, "alert");
        assert_eq!(updated.add_labels, vec!["P1"]);
    }

    #[test]
    fn delete_missing_rule_is_not_found() {
        let pool = create_test_pool();
        assert!(matches!(
            delete_rule(&pool, 42).unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
