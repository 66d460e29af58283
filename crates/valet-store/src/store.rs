use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;
use uuid::Uuid;
use valet_schema::{ConnectionStatus, MessageRole};

use crate::migrations::run_migrations;
use crate::models::{
    AppConnectionRecord, ConversationRecord, MessageRecord, SessionRecord, UserPreferenceRecord,
    UserRecord,
};

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Process-start open with exponential backoff: 1s base, factor 2,
    /// at most 3 attempts. Operational failures after open are not retried.
    pub async fn open_with_retry(path: &str) -> Result<Self> {
        let mut last_err = None;
        for attempt in 0..3u32 {
            match Self::open(path) {
                Ok(store) => return Ok(store),
                Err(e) => {
                    let backoff = Duration::from_secs(1 << attempt);
                    tracing::warn!(
                        "store open failed (attempt {}/3), backing off {}s: {e}",
                        attempt + 1,
                        backoff.as_secs()
                    );
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("store open failed")))
    }

    pub fn db(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    // ============================================================
    // Users
    // ============================================================

    pub async fn find_or_create_user(
        &self,
        user_id: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<UserRecord> {
        let db = Arc::clone(&self.db);
        let user_id = user_id.to_owned();
        let email = email.map(str::to_owned);
        let name = name.map(str::to_owned);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let now = Utc::now();
            conn.execute(
                r#"
                INSERT INTO users (id, email, name, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    email = COALESCE(excluded.email, users.email),
                    name = COALESCE(excluded.name, users.name),
                    updated_at = excluded.updated_at
                "#,
                params![user_id, email, name, now.to_rfc3339()],
            )?;
            let mut stmt = conn.prepare(
                "SELECT id, email, name, created_at, updated_at FROM users WHERE id = ?1",
            )?;
            let user = stmt.query_row(params![user_id], row_to_user)?;
            Ok::<UserRecord, anyhow::Error>(user)
        })
        .await?
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let db = Arc::clone(&self.db);
        let user_id = user_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT id, email, name, created_at, updated_at FROM users WHERE id = ?1",
            )?;
            let user = stmt.query_row(params![user_id], row_to_user).optional()?;
            Ok::<Option<UserRecord>, anyhow::Error>(user)
        })
        .await?
    }

    // ============================================================
    // Sessions
    // ============================================================

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let db = Arc::clone(&self.db);
        let session_id = session_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, token, started_at, last_activity, updated_at, is_active, conversation_summary \
                 FROM sessions WHERE id = ?1",
            )?;
            let session = stmt
                .query_row(params![session_id], row_to_session)
                .optional()?;
            Ok::<Option<SessionRecord>, anyhow::Error>(session)
        })
        .await?
    }

    pub async fn insert_session(&self, session: SessionRecord) -> Result<()> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let summary = session
                .conversation_summary
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                r#"
                INSERT INTO sessions (id, user_id, token, started_at, last_activity, updated_at, is_active, conversation_summary)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    session.id,
                    session.user_id,
                    session.token,
                    session.started_at.to_rfc3339(),
                    session.last_activity.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                    session.is_active as i64,
                    summary,
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    /// Refresh the activity timestamp and reactivate the session.
    pub async fn touch_session(&self, session_id: &str) -> Result<()> {
        let db = Arc::clone(&self.db);
        let session_id = session_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET last_activity = ?1, updated_at = ?1, is_active = 1 WHERE id = ?2",
                params![now, session_id],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    /// Deactivate sessions with no activity for the given number of days.
    pub async fn deactivate_stale_sessions(&self, days: i64) -> Result<usize> {
        let db = Arc::clone(&self.db);
        let delta =
            TimeDelta::try_days(days).ok_or_else(|| anyhow!("invalid days value: {days}"))?;
        let cutoff = (Utc::now() - delta).to_rfc3339();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let affected = conn.execute(
                "UPDATE sessions SET is_active = 0 WHERE is_active = 1 AND last_activity < ?1",
                params![cutoff],
            )?;
            Ok::<usize, anyhow::Error>(affected)
        })
        .await?
    }

    /// Overwrite the session-level conversation summary (last-write-wins).
    pub async fn update_session_summary(
        &self,
        session_id: &str,
        summary: &serde_json::Value,
    ) -> Result<()> {
        let db = Arc::clone(&self.db);
        let session_id = session_id.to_owned();
        let summary = serde_json::to_string(summary)?;
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                "UPDATE sessions SET conversation_summary = ?1, updated_at = ?2 WHERE id = ?3",
                params![summary, Utc::now().to_rfc3339(), session_id],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    pub async fn get_session_summary(&self, session_id: &str) -> Result<Option<serde_json::Value>> {
        let db = Arc::clone(&self.db);
        let session_id = session_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let raw: Option<Option<String>> = conn
                .query_row(
                    "SELECT conversation_summary FROM sessions WHERE id = ?1",
                    params![session_id],
                    |r| r.get(0),
                )
                .optional()?;
            match raw.flatten() {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
        .await?
    }

    // ============================================================
    // Conversations
    // ============================================================

    /// The "current" conversation is the most recently created one.
    pub async fn current_conversation(
        &self,
        session_id: &str,
    ) -> Result<Option<ConversationRecord>> {
        let db = Arc::clone(&self.db);
        let session_id = session_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT id, session_id, title, created_at, updated_at FROM conversations \
                 WHERE session_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
            )?;
            let conversation = stmt
                .query_row(params![session_id], row_to_conversation)
                .optional()?;
            Ok::<Option<ConversationRecord>, anyhow::Error>(conversation)
        })
        .await?
    }

    pub async fn insert_conversation(&self, conversation: ConversationRecord) -> Result<()> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                "INSERT INTO conversations (id, session_id, title, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conversation.id,
                    conversation.session_id,
                    conversation.title,
                    conversation.created_at.to_rfc3339(),
                    conversation.updated_at.to_rfc3339(),
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    pub async fn set_conversation_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        let db = Arc::clone(&self.db);
        let conversation_id = conversation_id.to_owned();
        let title = title.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3 AND title IS NULL",
                params![title, Utc::now().to_rfc3339(), conversation_id],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    // ============================================================
    // Messages
    // ============================================================

    pub async fn append_message(&self, message: MessageRecord) -> Result<()> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let tool_calls = message
                .tool_calls
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let analysis = message
                .analysis
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let metadata = message
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                r#"
                INSERT INTO messages (id, conversation_id, role, content, timestamp, tool_calls, analysis, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    message.id,
                    message.conversation_id,
                    message.role.as_str(),
                    message.content,
                    message.timestamp.to_rfc3339(),
                    tool_calls,
                    analysis,
                    metadata,
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    /// Last `limit` messages for a conversation, oldest-first. Timestamp
    /// ties are broken by insertion order (rowid).
    pub async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let db = Arc::clone(&self.db);
        let conversation_id = conversation_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, timestamp, tool_calls, analysis, metadata \
                 FROM messages WHERE conversation_id = ?1 \
                 ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![conversation_id, limit as i64], row_to_message)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            messages.reverse();
            Ok::<Vec<MessageRecord>, anyhow::Error>(messages)
        })
        .await?
    }

    pub async fn delete_messages(&self, conversation_id: &str) -> Result<usize> {
        let db = Arc::clone(&self.db);
        let conversation_id = conversation_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let deleted = conn.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
            Ok::<usize, anyhow::Error>(deleted)
        })
        .await?
    }

    // ============================================================
    // App connections (registry primitives)
    // ============================================================

    pub async fn get_connection(
        &self,
        user_id: &str,
        app_name: &str,
    ) -> Result<Option<AppConnectionRecord>> {
        let db = Arc::clone(&self.db);
        let user_id = user_id.to_owned();
        let app_name = app_name.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, app_name, account_id, status, metadata, created_at, updated_at \
                 FROM app_connections WHERE user_id = ?1 AND app_name = ?2",
            )?;
            let connection = stmt
                .query_row(params![user_id, app_name], row_to_connection)
                .optional()?;
            Ok::<Option<AppConnectionRecord>, anyhow::Error>(connection)
        })
        .await?
    }

    pub async fn upsert_connection_row(
        &self,
        user_id: &str,
        app_name: &str,
        account_id: &str,
        status: ConnectionStatus,
        metadata: Option<&serde_json::Value>,
    ) -> Result<AppConnectionRecord> {
        let db = Arc::clone(&self.db);
        let user_id = user_id.to_owned();
        let app_name = app_name.to_owned();
        let account_id = account_id.to_owned();
        let metadata = metadata.map(serde_json::to_string).transpose()?;
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                r#"
                INSERT INTO app_connections (id, user_id, app_name, account_id, status, metadata, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                ON CONFLICT(user_id, app_name) DO UPDATE SET
                    account_id = excluded.account_id,
                    status = excluded.status,
                    metadata = COALESCE(excluded.metadata, app_connections.metadata),
                    updated_at = excluded.updated_at
                "#,
                params![
                    Uuid::new_v4().to_string(),
                    user_id,
                    app_name,
                    account_id,
                    status.as_str(),
                    metadata,
                    now,
                ],
            )?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, app_name, account_id, status, metadata, created_at, updated_at \
                 FROM app_connections WHERE user_id = ?1 AND app_name = ?2",
            )?;
            let connection = stmt.query_row(params![user_id, app_name], row_to_connection)?;
            Ok::<AppConnectionRecord, anyhow::Error>(connection)
        })
        .await?
    }

    pub async fn list_connections(
        &self,
        user_id: &str,
        status: Option<ConnectionStatus>,
    ) -> Result<Vec<AppConnectionRecord>> {
        let db = Arc::clone(&self.db);
        let user_id = user_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut connections = Vec::new();
            match status {
                Some(status) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, user_id, app_name, account_id, status, metadata, created_at, updated_at \
                         FROM app_connections WHERE user_id = ?1 AND status = ?2 ORDER BY app_name",
                    )?;
                    let rows =
                        stmt.query_map(params![user_id, status.as_str()], row_to_connection)?;
                    for row in rows {
                        connections.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, user_id, app_name, account_id, status, metadata, created_at, updated_at \
                         FROM app_connections WHERE user_id = ?1 ORDER BY app_name",
                    )?;
                    let rows = stmt.query_map(params![user_id], row_to_connection)?;
                    for row in rows {
                        connections.push(row?);
                    }
                }
            }
            Ok::<Vec<AppConnectionRecord>, anyhow::Error>(connections)
        })
        .await?
    }

    // ============================================================
    // User preferences
    // ============================================================

    pub async fn upsert_preferences(
        &self,
        user_id: &str,
        preferences: &serde_json::Value,
    ) -> Result<()> {
        let db = Arc::clone(&self.db);
        let user_id = user_id.to_owned();
        let preferences = serde_json::to_string(preferences)?;
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                r#"
                INSERT INTO user_preferences (id, user_id, preferences, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?4)
                ON CONFLICT(user_id) DO UPDATE SET
                    preferences = excluded.preferences,
                    updated_at = excluded.updated_at
                "#,
                params![Uuid::new_v4().to_string(), user_id, preferences, now],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    pub async fn get_preferences(&self, user_id: &str) -> Result<Option<UserPreferenceRecord>> {
        let db = Arc::clone(&self.db);
        let user_id = user_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, preferences, created_at, updated_at \
                 FROM user_preferences WHERE user_id = ?1",
            )?;
            let prefs = stmt
                .query_row(params![user_id], row_to_preference)
                .optional()?;
            Ok::<Option<UserPreferenceRecord>, anyhow::Error>(prefs)
        })
        .await?
    }
}

fn parse_datetime_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_json_sql(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(UserRecord {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        created_at: parse_datetime_sql(&created_at)?,
        updated_at: parse_datetime_sql(&updated_at)?,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let started_at: String = row.get(3)?;
    let last_activity: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    let is_active: i64 = row.get(6)?;
    let summary: Option<String> = row.get(7)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        token: row.get(2)?,
        started_at: parse_datetime_sql(&started_at)?,
        last_activity: parse_datetime_sql(&last_activity)?,
        updated_at: parse_datetime_sql(&updated_at)?,
        is_active: is_active != 0,
        conversation_summary: parse_json_sql(summary),
    })
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRecord> {
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(ConversationRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_datetime_sql(&created_at)?,
        updated_at: parse_datetime_sql(&updated_at)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role_raw: String = row.get(2)?;
    let timestamp: String = row.get(4)?;
    let role = match role_raw.as_str() {
        "assistant" => MessageRole::Assistant,
        "system" => MessageRole::System,
        _ => MessageRole::User,
    };
    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role,
        content: row.get(3)?,
        timestamp: parse_datetime_sql(&timestamp)?,
        tool_calls: parse_json_sql(row.get(5)?),
        analysis: parse_json_sql(row.get(6)?),
        metadata: parse_json_sql(row.get(7)?),
    })
}

fn row_to_connection(row: &Row<'_>) -> rusqlite::Result<AppConnectionRecord> {
    let status_raw: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(AppConnectionRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        app_name: row.get(2)?,
        account_id: row.get(3)?,
        status: ConnectionStatus::parse(&status_raw).unwrap_or(ConnectionStatus::Failed),
        metadata: parse_json_sql(row.get(5)?),
        created_at: parse_datetime_sql(&created_at)?,
        updated_at: parse_datetime_sql(&updated_at)?,
    })
}

fn row_to_preference(row: &Row<'_>) -> rusqlite::Result<UserPreferenceRecord> {
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;
    Ok(UserPreferenceRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        preferences: parse_json_sql(row.get(2)?),
        created_at: parse_datetime_sql(&created_at)?,
        updated_at: parse_datetime_sql(&updated_at)?,
    })
}
