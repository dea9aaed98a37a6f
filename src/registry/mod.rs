use crate::errors::{RelaydeskError, RelaydeskResult};
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Which side currently owns the next reply in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Bot,
    Human,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Bot => "bot",
            AgentKind::Human => "human",
        }
    }

    fn parse(s: &str) -> RelaydeskResult<Self> {
        match s {
            "bot" => Ok(AgentKind::Bot),
            "human" => Ok(AgentKind::Human),
            other => Err(RelaydeskError::Persistence(format!(
                "unknown agent kind in registry row: {}",
                other
            ))),
        }
    }
}

/// Per-conversation control-state record. Mutated only through the registry's
/// atomic operations; the routing coordinator serializes writers per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub customer_id: String,
    pub current_agent: AgentKind,
    pub start_time: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
    pub message_count: i64,
    pub archived: bool,
}

/// Durable registry of one [`Session`] per conversation.
///
/// Sessions are never deleted while messages reference them — the terminal
/// state is archival, applied by [`SessionRegistry::archive_idle`].
pub struct SessionRegistry {
    conn: Mutex<Connection>,
    /// How long a customer's latest session stays reusable when a request
    /// arrives without a session id.
    reuse_window: Duration,
}

impl SessionRegistry {
    pub fn open(db_path: impl AsRef<Path>, reuse_window: Duration) -> RelaydeskResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create registry parent dir: {}", parent.display())
            })?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                current_agent TEXT NOT NULL,
                start_us INTEGER NOT NULL,
                last_us INTEGER NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                archived INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_customer
             ON sessions(customer_id, last_us)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            reuse_window,
        })
    }

    fn lock(&self) -> RelaydeskResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RelaydeskError::Persistence(format!("registry lock poisoned: {}", e)))
    }

    /// Resolve a session for the customer. A known `session_id` returns the
    /// existing record (idempotent); an unknown or absent id creates a fresh
    /// session owned by the bot. Without an id, the customer's most recent
    /// unarchived session inside the reuse window is picked up, so a widget
    /// reload resumes the same conversation.
    pub fn get_or_create(
        &self,
        customer_id: &str,
        session_id: Option<&str>,
    ) -> RelaydeskResult<Session> {
        let conn = self.lock()?;

        if let Some(id) = session_id {
            if let Some(session) = query_session(&conn, id)? {
                return Ok(session);
            }
        }

        if session_id.is_none() {
            let cutoff_us = (Utc::now() - self.reuse_window).timestamp_micros();
            let recent: Option<String> = conn
                .query_row(
                    "SELECT session_id FROM sessions
                     WHERE customer_id = ?1 AND archived = 0 AND last_us >= ?2
                     ORDER BY last_us DESC LIMIT 1",
                    params![customer_id, cutoff_us],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = recent {
                debug!(session_id = %id, customer_id, "reusing recent session");
                if let Some(session) = query_session(&conn, &id)? {
                    return Ok(session);
                }
            }
        }

        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now_us = Utc::now().timestamp_micros();
        conn.execute(
            "INSERT INTO sessions (session_id, customer_id, current_agent, start_us, last_us)
             VALUES (?1, ?2, 'bot', ?3, ?3)",
            params![id, customer_id, now_us],
        )?;
        info!(session_id = %id, customer_id, "session created");

        query_session(&conn, &id)?.ok_or_else(|| {
            RelaydeskError::Persistence(format!("session {} vanished after insert", id))
        })
    }

    pub fn get(&self, session_id: &str) -> RelaydeskResult<Option<Session>> {
        let conn = self.lock()?;
        query_session(&conn, session_id)
    }

    /// Atomically swap `current_agent`, returning the updated record.
    pub fn set_agent(&self, session_id: &str, agent: AgentKind) -> RelaydeskResult<Session> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE sessions SET current_agent = ?2, last_us = ?3 WHERE session_id = ?1",
            params![session_id, agent.as_str(), Utc::now().timestamp_micros()],
        )?;
        if changed == 0 {
            return Err(RelaydeskError::Persistence(format!(
                "session not found: {}",
                session_id
            )));
        }
        query_session(&conn, session_id)?.ok_or_else(|| {
            RelaydeskError::Persistence(format!("session {} vanished after update", session_id))
        })
    }

    /// Bump `last_interaction` and `message_count` for an accepted message.
    pub fn touch(&self, session_id: &str) -> RelaydeskResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sessions
             SET last_us = ?2, message_count = message_count + 1
             WHERE session_id = ?1",
            params![session_id, Utc::now().timestamp_micros()],
        )?;
        Ok(())
    }

    /// All unarchived sessions, most recently active first (staff dashboard).
    pub fn list_active(&self) -> RelaydeskResult<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, customer_id, current_agent, start_us, last_us,
                    message_count, archived
             FROM sessions WHERE archived = 0
             ORDER BY last_us DESC",
        )?;
        let rows = stmt
            .query_map([], row_to_parts)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(parts_to_session).collect()
    }

    /// Archive sessions idle longer than `idle_for`. Returns how many were
    /// archived.
    pub fn archive_idle(&self, idle_for: Duration) -> RelaydeskResult<usize> {
        let conn = self.lock()?;
        let cutoff_us = (Utc::now() - idle_for).timestamp_micros();
        let archived = conn.execute(
            "UPDATE sessions SET archived = 1 WHERE archived = 0 AND last_us < ?1",
            params![cutoff_us],
        )?;
        if archived > 0 {
            info!(archived, "idle sessions archived");
        }
        Ok(archived)
    }
}

type SessionParts = (String, String, String, i64, i64, i64, i64);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn parts_to_session(parts: SessionParts) -> RelaydeskResult<Session> {
    let (session_id, customer_id, agent, start_us, last_us, message_count, archived) = parts;
    Ok(Session {
        session_id,
        customer_id,
        current_agent: AgentKind::parse(&agent)?,
        start_time: us_to_timestamp(start_us)?,
        last_interaction: us_to_timestamp(last_us)?,
        message_count,
        archived: archived != 0,
    })
}

fn query_session(conn: &Connection, session_id: &str) -> RelaydeskResult<Option<Session>> {
    let parts = conn
        .query_row(
            "SELECT session_id, customer_id, current_agent, start_us, last_us,
                    message_count, archived
             FROM sessions WHERE session_id = ?1",
            params![session_id],
            row_to_parts,
        )
        .optional()?;
    parts.map(parts_to_session).transpose()
}

fn us_to_timestamp(us: i64) -> RelaydeskResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| RelaydeskError::Persistence(format!("timestamp out of range: {}", us)))
}
