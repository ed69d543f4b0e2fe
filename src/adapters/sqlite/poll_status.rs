//! Per-account poll health, written by the fetcher at loop boundaries
//! and read back by the status API and `/health`.

use rusqlite::{params, Row};
use serde::Serialize;

use super::DbPool;
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct PollStatus {
    pub account_id: i64,
    pub last_started_at: Option<i64>,
    pub last_finished_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub last_error: Option<String>,
}

fn row_to_status(row: &Row) -> rusqlite::Result<PollStatus> {
    Ok(PollStatus {
        account_id: row.get("account_id")?,
        last_started_at: row.get("last_started_at")?,
        last_finished_at: row.get("last_finished_at")?,
        last_success_at: row.get("last_success_at")?,
        last_error: row.get("last_error")?,
    })
}

fn ensure_row(conn: &rusqlite::Connection, account_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO account_poll_status (account_id) VALUES (?1)",
        params![account_id],
    )?;
    Ok(())
}

/// A poll began. Clears the previous error so the UI shows in-progress
/// state, not a stale failure.
pub fn mark_started(pool: &DbPool, account_id: i64, now: i64) -> Result<()> {
    let conn = pool.get()?;
    ensure_row(&conn, account_id)?;
    conn.execute(
        "UPDATE account_poll_status
         SET last_started_at = ?2, last_error = NULL
         WHERE account_id = ?1",
        params![account_id, now],
    )?;
    Ok(())
}

pub fn mark_finished(pool: &DbPool, account_id: i64, now: i64) -> Result<()> {
    let conn = pool.get()?;
    ensure_row(&conn, account_id)?;
    conn.execute(
        "UPDATE account_poll_status SET last_finished_at = ?2 WHERE account_id = ?1",
        params![account_id, now],
    )?;
    Ok(())
}

/// Only called after a fully completed fetch loop; `last_success_at`
/// stays monotonic because `now` always moves forward.
pub fn mark_success(pool: &DbPool, account_id: i64, now: i64) -> Result<()> {
    let conn = pool.get()?;
    ensure_row(&conn, account_id)?;
    conn.execute(
        "UPDATE account_poll_status
         SET last_success_at = ?2, last_error = NULL
         WHERE account_id = ?1",
        params![account_id, now],
    )?;
    Ok(())
}

pub fn record_error(pool: &DbPool, account_id: i64, message: &str) -> Result<()> {
    let conn = pool.get()?;
    ensure_row(&conn, account_id)?;
    conn.execute(
        "UPDATE account_poll_status SET last_error = ?2 WHERE account_id = ?1",
        params![account_id, message],
    )?;
    Ok(())
}

pub fn get_status(pool: &DbPool, account_id: i64) -> Result<Option<PollStatus>> {
    let conn = pool.get()?;
    let result = conn.query_row(
        "SELECT account_id, last_started_at, last_finished_at, last_success_at, last_error
         FROM account_poll_status WHERE account_id = ?1",
        params![account_id],
        row_to_status,
    );
    match result {
        Ok(status) => Ok(Some(status)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn list_statuses(pool: &DbPool) -> Result<Vec<PollStatus>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT account_id, last_started_at, last_finished_at, last_success_at, last_error
         FROM account_poll_status ORDER BY account_id ASC",
    )?;
    let rows = stmt.query_map([], row_to_status)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
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
    fn lifecycle_updates() {
        let pool = create_test_pool();
        let account = seed_account(&pool, "a@example.com");

        mark_started(&pool, account, 100).unwrap();
        record_error(&pool, account, "IMAP login failed").unwrap();
        mark_finished(&pool, account, 105).unwrap();

        let status = get_status(&pool, account).unwrap().unwrap();
        assert_eq!(status.last_started_at, Some(100));
        assert_eq!(status.last_finished_at, Some(105));
        assert_eq!(status.last_success_at, None);
        assert_eq!(status.last_error.as_deref(), Some("IMAP login failed"));

        // The next successful poll clears the error.
        mark_started(&pool, account, 200).unwrap();
        mark_success(&pool, account, 204).unwrap();
        mark_finished(&pool, account, 204).unwrap();

        let status = get_status(&pool, account).unwrap().unwrap();
        assert_eq!(status.last_success_at, Some(204));
        assert_eq!(status.last_error, None);
    }
}
