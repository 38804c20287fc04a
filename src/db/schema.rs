//! SQLite schema, created on store open.

use rusqlite::Connection;

use super::StoreError;

/// Creates all tables and indexes if they do not exist.
pub fn init(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS services (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            name                TEXT NOT NULL UNIQUE,
            type                TEXT NOT NULL,
            enabled             INTEGER NOT NULL DEFAULT 0,
            deleted             INTEGER NOT NULL DEFAULT 0,
            health_status       TEXT NOT NULL DEFAULT 'unknown',
            last_health_check   TEXT,
            health_details      TEXT,
            command             TEXT NOT NULL DEFAULT '',
            args_json           TEXT NOT NULL DEFAULT '[]',
            headers_json        TEXT NOT NULL DEFAULT '{}',
            default_envs_json   TEXT NOT NULL DEFAULT '{}',
            allow_user_override INTEGER NOT NULL DEFAULT 0,
            rpd_limit           INTEGER NOT NULL DEFAULT 0,
            request_timeout_s   INTEGER,
            installer_user_id   INTEGER,
            created_at          TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS user_env_overrides (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            service_id INTEGER NOT NULL,
            user_id    INTEGER NOT NULL,
            envs_json  TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (service_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS access_tokens (
            token   TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            role    TEXT NOT NULL DEFAULT 'user',
            enabled INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS proxy_request_stats (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            service_id   INTEGER NOT NULL,
            service_name TEXT NOT NULL,
            user_id      INTEGER NOT NULL,
            request_type TEXT NOT NULL,
            method       TEXT NOT NULL,
            path         TEXT NOT NULL,
            status_code  INTEGER NOT NULL,
            success      INTEGER NOT NULL,
            elapsed_ms   INTEGER NOT NULL,
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_request_stats_service
            ON proxy_request_stats (service_id, created_at);

        CREATE TABLE IF NOT EXISTS request_counters (
            user_id    INTEGER NOT NULL,
            service_id INTEGER NOT NULL,
            day        TEXT NOT NULL,
            count      INTEGER NOT NULL DEFAULT 0,
            UNIQUE (user_id, service_id, day)
        );
        "#,
    )?;
    Ok(())
}
