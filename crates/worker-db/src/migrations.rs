//! Schema migrations for the relational store.
//!
//! Runs once, on a dedicated connection, when a [`crate::DatabasePool`] is
//! opened. Migrations are plain idempotent DDL (`CREATE TABLE IF NOT
//! EXISTS`) rather than a numbered migration chain, since the schema is
//! small and stable; a real multi-version chain would be the next step if
//! the schema grows past what a single pass can express safely.

use crate::DatabaseResult;
use rusqlite::Connection;

pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS proxies (
            id              TEXT PRIMARY KEY,
            host            TEXT NOT NULL,
            port            INTEGER NOT NULL,
            username        TEXT,
            password        TEXT
        );

        CREATE TABLE IF NOT EXISTS dealer_accounts (
            id                  TEXT PRIMARY KEY,
            username            TEXT NOT NULL,
            password            TEXT NOT NULL,
            totp_seed           TEXT,
            proxy_id            TEXT REFERENCES proxies(id),
            active              INTEGER NOT NULL DEFAULT 1,
            priority            INTEGER NOT NULL DEFAULT 0,
            last_known_balance  REAL,
            balance_updated_at  INTEGER,
            cooldown_until      INTEGER NOT NULL DEFAULT 0,
            fail_reason         TEXT,
            last_used_at        INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_dealer_accounts_priority
            ON dealer_accounts(active, priority DESC, last_used_at ASC);

        CREATE TABLE IF NOT EXISTS operations (
            id                      TEXT PRIMARY KEY,
            user_id                 TEXT NOT NULL,
            op_type                 TEXT NOT NULL,
            status                  TEXT NOT NULL,
            card_number             TEXT NOT NULL,
            account_id              TEXT REFERENCES dealer_accounts(id),
            amount                  REAL NOT NULL DEFAULT 0,
            selected_package        TEXT,
            stb_number              TEXT,
            captcha_image           TEXT,
            captcha_solution        TEXT,
            response_data           TEXT,
            response_message        TEXT,
            heartbeat_at            INTEGER,
            heartbeat_expiry        INTEGER,
            final_confirm_expiry    INTEGER,
            completed_at            INTEGER,
            created_at              INTEGER NOT NULL,
            updated_at              INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status);
        CREATE INDEX IF NOT EXISTS idx_operations_account ON operations(account_id);

        CREATE TABLE IF NOT EXISTS transactions (
            id              TEXT PRIMARY KEY,
            operation_id    TEXT NOT NULL REFERENCES operations(id),
            user_id         TEXT NOT NULL,
            kind            TEXT NOT NULL,
            amount          REAL NOT NULL,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_operation ON transactions(operation_id);

        CREATE TABLE IF NOT EXISTS settings (
            key     TEXT PRIMARY KEY,
            value   TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let table_count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='operations'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(table_count, 1);
    }
}
