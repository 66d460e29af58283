use anyhow::Result;
use rusqlite::Connection;

/// Idempotent schema setup, run at every open.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id         TEXT PRIMARY KEY,
            email      TEXT UNIQUE,
            name       TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id                   TEXT PRIMARY KEY,
            user_id              TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            token                TEXT,
            started_at           TEXT NOT NULL,
            last_activity        TEXT NOT NULL,
            updated_at           TEXT NOT NULL,
            is_active            INTEGER NOT NULL DEFAULT 1,
            conversation_summary TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user_activity
            ON sessions(user_id, last_activity);
        CREATE INDEX IF NOT EXISTS idx_sessions_user_active
            ON sessions(user_id, is_active);

        CREATE TABLE IF NOT EXISTS conversations (
            id         TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            title      TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_session
            ON conversations(session_id, created_at);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            role            TEXT NOT NULL,
            content         TEXT NOT NULL,
            timestamp       TEXT NOT NULL,
            tool_calls      TEXT,
            analysis        TEXT,
            metadata        TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
            ON messages(conversation_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_ts
            ON messages(timestamp);

        CREATE TABLE IF NOT EXISTS app_connections (
            id         TEXT PRIMARY KEY,
            user_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            app_name   TEXT NOT NULL,
            account_id TEXT NOT NULL,
            status     TEXT NOT NULL,
            metadata   TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(user_id, app_name)
        );
        CREATE INDEX IF NOT EXISTS idx_connections_user_status
            ON app_connections(user_id, status);
        CREATE INDEX IF NOT EXISTS idx_connections_status
            ON app_connections(status);

        CREATE TABLE IF NOT EXISTS user_preferences (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
            preferences TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}
