//! Aggregate queries backing `/stats` and the retention maintenance
//! endpoints.

use rusqlite::params;
use serde::Serialize;

use super::messages::parse_labels;
use super::DbPool;
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct OverviewTotals {
    pub emails: i64,
    pub unread: i64,
    pub accounts: i64,
    pub oldest_received_at: Option<i64>,
    pub newest_received_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyCount {
    pub date: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountBreakdown {
    pub account_id: i64,
    pub account_email: String,
    pub total: i64,
    pub unread: i64,
    pub share: f64,
}

pub fn overview_totals(pool: &DbPool) -> Result<OverviewTotals> {
    let conn = pool.get()?;
    let (emails, unread): (i64, i64) = conn.query_row(
        "SELECT COUNT(id), COALESCE(SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END), 0)
         FROM emails",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let accounts: i64 = conn.query_row("SELECT COUNT(id) FROM accounts", [], |row| row.get(0))?;
    let (oldest, newest): (Option<i64>, Option<i64>) = conn.query_row(
        "SELECT MIN(received_at), MAX(received_at) FROM emails",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(OverviewTotals {
        emails,
        unread,
        accounts,
        oldest_received_at: oldest,
        newest_received_at: newest,
    })
}

/// Messages per UTC day since `start`, sparse (days with zero messages
/// are filled in by the API layer).
pub fn daily_counts(pool: &DbPool, start: i64) -> Result<Vec<DailyCount>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT date(received_at, 'unixepoch') AS d, COUNT(id) AS c
         FROM emails
         WHERE received_at >= ?1
         GROUP BY d ORDER BY d",
    )?;
    let rows = stmt.query_map(params![start], |row| {
        Ok(DailyCount {
            date: row.get(0)?,
            count: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn by_account(pool: &DbPool) -> Result<Vec<AccountBreakdown>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT a.id, a.email, COUNT(e.id) AS total,
                COALESCE(SUM(CASE WHEN e.is_read = 0 THEN 1 ELSE 0 END), 0) AS unread
         FROM accounts a
         LEFT JOIN emails e ON e.account_id = a.id
         GROUP BY a.id, a.email
         ORDER BY total DESC, a.email ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;
    let raw = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    let grand_total: i64 = raw.iter().map(|(_, _, total, _)| total).sum();
    let denom = grand_total.max(1) as f64;
    Ok(raw
        .into_iter()
        .map(|(account_id, account_email, total, unread)| AccountBreakdown {
            account_id,
            account_email,
            total,
            unread,
            share: total as f64 / denom,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

pub fn count_older_than(pool: &DbPool, cutoff: i64) -> Result<i64> {
    let conn = pool.get()?;
    Ok(conn.query_row(
        "SELECT COUNT(id) FROM emails WHERE received_at < ?1",
        params![cutoff],
        |row| row.get(0),
    )?)
}

pub fn delete_older_than(pool: &DbPool, cutoff: i64) -> Result<usize> {
    let conn = pool.get()?;
    Ok(conn.execute(
        "DELETE FROM emails WHERE received_at < ?1",
        params![cutoff],
    )?)
}

const OVERFLOW_SELECT: &str = "SELECT id FROM (
         SELECT id, ROW_NUMBER() OVER (
             PARTITION BY account_id ORDER BY received_at DESC, id DESC
         ) AS rn
         FROM emails
     ) WHERE rn > ?1";

/// Rows beyond the newest `keep` per account.
pub fn count_overflow(pool: &DbPool, keep: i64) -> Result<i64> {
    let conn = pool.get()?;
    Ok(conn.query_row(
        &format!("SELECT COUNT(*) FROM ({})", OVERFLOW_SELECT),
        params![keep],
        |row| row.get(0),
    )?)
}

pub fn delete_overflow(pool: &DbPool, keep: i64) -> Result<usize> {
    let conn = pool.get()?;
    Ok(conn.execute(
        &format!("DELETE FROM emails WHERE id IN ({})", OVERFLOW_SELECT),
        params![keep],
    )?)
}

/// VACUUM cannot run inside a transaction; best-effort only.
pub fn vacuum(pool: &DbPool) -> Result<()> {
    let conn = pool.get()?;
    conn.execute_batch("VACUUM")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRow {
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

/// Rows older than `cutoff`, oldest first, optionally capped.
pub fn list_older_than(pool: &DbPool, cutoff: i64, limit: Option<u32>) -> Result<Vec<ArchiveRow>> {
    let conn = pool.get()?;
    let mut sql = String::from(
        "SELECT e.id, e.message_id, e.account_id, a.email, e.subject, e.sender,
                e.content_summary, e.received_at, e.is_read, e.labels
         FROM emails e JOIN accounts a ON a.id = e.account_id
         WHERE e.received_at < ?1
         ORDER BY e.received_at ASC",
    );
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![cutoff], |row| {
        let labels: String = row.get(9)?;
        Ok(ArchiveRow {
            id: row.get(0)?,
            message_id: row.get(1)?,
            account_id: row.get(2)?,
            account_email: row.get(3)?,
            subject: row.get(4)?,
            sender: row.get(5)?,
            content_summary: row.get(6)?,
            received_at: row.get(7)?,
            is_read: row.get(8)?,
            labels: parse_labels(&labels),
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn delete_by_ids(pool: &DbPool, ids: &[i64]) -> Result<usize> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;
    let mut deleted = 0;
    for chunk in ids.chunks(500) {
        let placeholders = chunk
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        deleted += tx.execute(
            &format!("DELETE FROM emails WHERE id IN ({})", placeholders),
            rusqlite::params_from_iter(chunk.iter()),
        )?;
    }
    tx.commit()?;
    Ok(deleted)
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

    fn seed_email(pool: &DbPool, account_id: i64, message_id: &str, received_at: i64) {
        let conn = pool.get().unwrap();
        conn.execute(
            "INSERT INTO emails (account_id, message_id, received_at, created_at)
             VALUES (?1, ?2, ?3, 0)",
            params![account_id, message_id, received_at],
        )
        .unwrap();
    }

    #[test]
    fn totals_and_breakdown() {
        let pool = create_test_pool();
        let a = seed_account(&pool, "a@example.com");
        let b = seed_account(&pool, "b@example.com");
        seed_email(&pool, a, "<1@x>", 100);
        seed_email(&pool, a, "<2@x>", 200);
        seed_email(&pool, b, "<3@x>", 300);

        let totals = overview_totals(&pool).unwrap();
        assert_eq!(totals.emails, 3);
        assert_eq!(totals.unread, 3);
        assert_eq!(totals.accounts, 2);
        assert_eq!(totals.oldest_received_at, Some(100));
        assert_eq!(totals.newest_received_at, Some(300));

        let breakdown = by_account(&pool).unwrap();
        assert_eq!(breakdown[0].account_email, "a@example.com");
        assert_eq!(breakdown[0].total, 2);
        assert!((breakdown[0].share - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn retention_by_age_and_overflow() {
        let pool = create_test_pool();
        let a = seed_account(&pool, "a@example.com");
        for i in 0..10 {
            seed_email(&pool, a, &format!("<{}@x>", i), 100 + i);
        }

        assert_eq!(count_older_than(&pool, 105).unwrap(), 5);
        assert_eq!(count_overflow(&pool, 7).unwrap(), 3);

        assert_eq!(delete_older_than(&pool, 105).unwrap(), 5);
        assert_eq!(delete_overflow(&pool, 3).unwrap(), 2);
        assert_eq!(overview_totals(&pool).unwrap().emails, 3);
    }

    #[test]
    fn archive_selection_is_oldest_first() {
        let pool = create_test_pool();
        let a = seed_account(&pool, "a@example.com");
        for i in 0..5 {
            seed_email(&pool, a, &format!("<{}@x>", i), 100 + i);
        }

        let rows = list_older_than(&pool, 104, None).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.windows(2).all(|w| w[0].received_at <= w[1].received_at));

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        assert_eq!(delete_by_ids(&pool, &ids).unwrap(), 4);
        assert_eq!(overview_totals(&pool).unwrap().emails, 1);
    }
}
