use crate::errors::{RelaydeskError, RelaydeskResult};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Customer,
    Bot,
    HumanAgent,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::Customer => "customer",
            MessageRole::Bot => "bot",
            MessageRole::HumanAgent => "human_agent",
            MessageRole::System => "system",
        }
    }

    fn parse(s: &str) -> RelaydeskResult<Self> {
        match s {
            "customer" => Ok(MessageRole::Customer),
            "bot" => Ok(MessageRole::Bot),
            "human_agent" => Ok(MessageRole::HumanAgent),
            "system" => Ok(MessageRole::System),
            other => Err(RelaydeskError::Persistence(format!(
                "unknown role in ledger row: {}",
                other
            ))),
        }
    }
}

/// A stored transcript entry. Immutable once created; the ledger is the single
/// authority for `seq` and `timestamp`.
///
/// `(session_id, seq)` is the true primary identity. Content/role/time are
/// used only for duplicate suppression, so identical repeated text submitted
/// far enough apart stays distinguishable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub seq: i64,
    pub session_id: String,
    pub customer_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// What callers hand to [`MessageLedger::append`] — everything except the
/// ledger-assigned fields.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub session_id: String,
    pub customer_id: String,
    pub role: MessageRole,
    pub content: String,
}

impl MessageDraft {
    pub fn new(
        session_id: impl Into<String>,
        customer_id: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            customer_id: customer_id.into(),
            role,
            content: content.into(),
        }
    }
}

/// Durable, append-only, per-session ordered message log.
///
/// No update or delete exists; corrections are modeled as new SYSTEM messages.
pub struct MessageLedger {
    conn: Mutex<Connection>,
}

impl MessageLedger {
    pub fn open(db_path: impl AsRef<Path>) -> RelaydeskResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create ledger parent dir: {}", parent.display())
            })?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                session_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_us INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_session
             ON messages(session_id, created_us, id)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append a message, assigning the authoritative timestamp and sequence.
    ///
    /// The timestamp is clamped to the session's latest stored timestamp so
    /// retrieval order stays non-decreasing even if the wall clock steps back.
    pub fn append(&self, draft: MessageDraft) -> RelaydeskResult<Message> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RelaydeskError::Persistence(format!("ledger lock poisoned: {}", e)))?;

        let now_us = Utc::now().timestamp_micros();
        let last_us: Option<i64> = conn
            .query_row(
                "SELECT MAX(created_us) FROM messages WHERE session_id = ?1",
                params![draft.session_id],
                |row| row.get(0),
            )
            .unwrap_or(None);
        let created_us = last_us.map_or(now_us, |last| now_us.max(last));

        conn.execute(
            "INSERT INTO messages (session_id, customer_id, role, content, created_us)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                draft.session_id,
                draft.customer_id,
                draft.role.as_str(),
                draft.content,
                created_us
            ],
        )?;
        let seq = conn.last_insert_rowid();

        debug!(
            session_id = %draft.session_id,
            role = draft.role.as_str(),
            seq,
            "message appended"
        );

        Ok(Message {
            seq,
            session_id: draft.session_id,
            customer_id: draft.customer_id,
            role: draft.role,
            content: draft.content,
            timestamp: timestamp_from_us(created_us)?,
        })
    }

    /// Most recent `limit` messages for the session/customer pair, ascending
    /// by (timestamp, seq). Safe to call concurrently with `append`.
    pub fn read(
        &self,
        session_id: &str,
        customer_id: &str,
        limit: usize,
    ) -> RelaydeskResult<Vec<Message>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RelaydeskError::Persistence(format!("ledger lock poisoned: {}", e)))?;

        let mut stmt = conn.prepare(
            "SELECT id, session_id, customer_id, role, content, created_us
             FROM messages
             WHERE session_id = ?1 AND customer_id = ?2
             ORDER BY created_us DESC, id DESC
             LIMIT ?3",
        )?;

        let mut messages = stmt
            .query_map(params![session_id, customer_id, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(seq, session_id, customer_id, role, content, created_us)| {
                Ok(Message {
                    seq,
                    session_id,
                    customer_id,
                    role: MessageRole::parse(&role)?,
                    content,
                    timestamp: timestamp_from_us(created_us)?,
                })
            })
            .collect::<RelaydeskResult<Vec<_>>>()?;

        messages.reverse();
        Ok(messages)
    }
}

fn timestamp_from_us(us: i64) -> RelaydeskResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| RelaydeskError::Persistence(format!("timestamp out of range: {}", us)))
}
