use rusqlite::Connection;

use crate::error::Result;

pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS accounts (
            id                      INTEGER PRIMARY KEY,
            email                   TEXT NOT NULL UNIQUE,
            provider                TEXT NOT NULL DEFAULT 'custom',
            host                    TEXT NOT NULL DEFAULT 'imap.gmail.com',
            port                    INTEGER NOT NULL DEFAULT 993,
            encrypted_pwd           TEXT NOT NULL,      -- base64(nonce || AES-GCM ciphertext)
            is_active               INTEGER NOT NULL DEFAULT 1,
            sort_order              INTEGER NOT NULL DEFAULT 0,
            telegram_push_enabled   INTEGER NOT NULL DEFAULT 1,
            push_template           TEXT NOT NULL DEFAULT 'short',   -- full_email | full | short | title_only
            poll_interval_seconds   INTEGER,            -- NULL = inherit global
            last_seen_uid           TEXT,               -- opaque watermark, owned by adapters::imap
            created_at              INTEGER NOT NULL,   -- unix epoch seconds
            updated_at              INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS emails (
            id              INTEGER PRIMARY KEY,
            account_id      INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            message_id      TEXT NOT NULL,      -- RFC 5322 Message-ID
            subject         TEXT NOT NULL DEFAULT '',
            sender          TEXT NOT NULL DEFAULT '',
            content_summary TEXT NOT NULL DEFAULT '',
            body_text       TEXT NOT NULL DEFAULT '',
            body_html       TEXT,
            received_at     INTEGER NOT NULL,
            is_read         INTEGER NOT NULL DEFAULT 0,
            labels          TEXT NOT NULL DEFAULT '[]', -- JSON array, insertion order
            created_at      INTEGER NOT NULL,

            -- The at-most-once gate for downstream side effects.
            UNIQUE(account_id, message_id)
        );

        CREATE INDEX IF NOT EXISTS idx_emails_account_received ON emails(account_id, received_at DESC);
        CREATE INDEX IF NOT EXISTS idx_emails_received         ON emails(received_at DESC);
        CREATE INDEX IF NOT EXISTS idx_emails_is_read          ON emails(is_read);

        CREATE TABLE IF NOT EXISTS mail_rules (
            id              INTEGER PRIMARY KEY,
            name            TEXT NOT NULL DEFAULT '',
            rule_order      INTEGER NOT NULL DEFAULT 0,
            account_id      INTEGER REFERENCES accounts(id) ON DELETE CASCADE,  -- NULL = all accounts
            sender_pattern  TEXT NOT NULL DEFAULT '',
            subject_pattern TEXT NOT NULL DEFAULT '',
            body_pattern    TEXT NOT NULL DEFAULT '',
            add_labels      TEXT NOT NULL DEFAULT '[]', -- JSON array
            push_telegram   INTEGER NOT NULL DEFAULT 1,
            mark_read       INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_mail_rules_order ON mail_rules(rule_order, id);

        CREATE TABLE IF NOT EXISTS telegram_filter_rules (
            id              INTEGER PRIMARY KEY,
            account_id      INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
            field           TEXT NOT NULL,      -- sender | domain | subject | body
            mode            TEXT NOT NULL,      -- allow | deny
            value           TEXT NOT NULL,      -- substring, case-insensitive
            rule_order      INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_telegram_rules_account ON telegram_filter_rules(account_id, rule_order, id);

        CREATE TABLE IF NOT EXISTS system_settings (
            key             TEXT PRIMARY KEY,
            value           TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS account_poll_status (
            account_id      INTEGER PRIMARY KEY REFERENCES accounts(id) ON DELETE CASCADE,
            last_started_at  INTEGER,
            last_finished_at INTEGER,
            last_success_at  INTEGER,
            last_error       TEXT
        );
        ",
    )?;

    Ok(())
}
