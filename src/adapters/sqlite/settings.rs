//! Key/value store for runtime-editable settings. These override the
//! environment defaults; `services::settings` builds the merged snapshot.

use std::collections::HashMap;

use rusqlite::params;

use super::DbPool;
use crate::error::Result;

pub fn get_all(pool: &DbPool) -> Result<HashMap<String, String>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT key, value FROM system_settings")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
}

pub fn get(pool: &DbPool, key: &str) -> Result<Option<String>> {
    let conn = pool.get()?;
    let result = conn.query_row(
        "SELECT value FROM system_settings WHERE key = ?1",
        params![key],
        |row| row.get(0),
    );
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn set(pool: &DbPool, key: &str, value: &str) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO system_settings (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

/// Write several keys in one transaction.
pub fn set_many(pool: &DbPool, entries: &[(String, String)]) -> Result<()> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;
    for (key, value) in entries {
        tx.execute(
            "INSERT OR REPLACE INTO system_settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool::create_test_pool;

    #[test]
    fn set_get_overwrite() {
        let pool = create_test_pool();
        assert_eq!(get(&pool, "poll_interval_seconds").unwrap(), None);

        set(&pool, "poll_interval_seconds", "120").unwrap();
        set(&pool, "poll_interval_seconds", "60").unwrap();
        assert_eq!(
            get(&pool, "poll_interval_seconds").unwrap().as_deref(),
            Some("60")
        );

        set_many(
            &pool,
            &[
                ("webhook_url".to_string(), "https://x.test/hook".to_string()),
                ("api_token".to_string(), "tok".to_string()),
            ],
        )
        .unwrap();
        let all = get_all(&pool).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all["webhook_url"], "https://x.test/hook");
    }
}
