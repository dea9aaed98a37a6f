//! Deterministic transcript reconciliation.
//!
//! Merges two message views (snapshot vs. live events, or a fetched history
//! vs. locally buffered optimistic sends) into one deduplicated, time-ordered
//! transcript. Used by the broadcast hub while closing the snapshot/live race
//! and by any polling consumer of the fallback endpoint.
//!
//! Identity rules: two ledger-stamped messages (`seq > 0`) are the same event
//! iff their seq matches — the ledger already guarantees distinct identity
//! for identical repeated text. The content/role/time-window heuristic only
//! kicks in when one side is an unconfirmed optimistic echo (`seq == 0`),
//! wide enough to absorb fallback-transport latency, narrow enough that two
//! genuinely distinct identical texts sent far apart stay separate.

use crate::ledger::Message;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tunables for duplicate suppression.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Max timestamp distance for two copies to count as one logical event.
    pub tolerance: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            tolerance: Duration::seconds(30),
        }
    }
}

impl ReconcilePolicy {
    pub fn with_tolerance_secs(secs: i64) -> Self {
        Self {
            tolerance: Duration::seconds(secs),
        }
    }
}

/// Merge `local` and `incoming` into one deduplicated transcript ordered by
/// (timestamp, seq).
///
/// Idempotent (`reconcile(reconcile(a, b), b) == reconcile(a, b)`) and
/// commutative with respect to final content: the order in which snapshot and
/// live events arrive does not change the result. When an optimistic echo and
/// a ledger-stamped copy collide, the stamped copy survives.
pub fn reconcile(
    local: &[Message],
    incoming: &[Message],
    policy: &ReconcilePolicy,
) -> Vec<Message> {
    let mut confirmed: Vec<Message> = Vec::new();
    let mut unconfirmed: Vec<Message> = Vec::new();

    for msg in local.iter().chain(incoming) {
        if msg.seq > 0 {
            if !confirmed
                .iter()
                .any(|kept| kept.seq == msg.seq && kept.session_id == msg.session_id)
            {
                confirmed.push(msg.clone());
            }
        } else {
            unconfirmed.push(msg.clone());
        }
    }

    // Drop echoes the ledger has already confirmed, then echoes that
    // duplicate an earlier echo.
    let mut kept_echoes: Vec<Message> = Vec::new();
    for echo in unconfirmed {
        let confirmed_copy = confirmed.iter().any(|c| echo_matches(&echo, c, policy));
        let echo_copy = kept_echoes.iter().any(|e| echo_matches(&echo, e, policy));
        if !confirmed_copy && !echo_copy {
            kept_echoes.push(echo);
        }
    }

    let mut merged = confirmed;
    merged.extend(kept_echoes);
    merged.sort_by(|a, b| (a.timestamp, a.seq).cmp(&(b.timestamp, b.seq)));
    merged
}

fn echo_matches(echo: &Message, other: &Message, policy: &ReconcilePolicy) -> bool {
    // Role is deliberately ignored here: an optimistic echo of an
    // as-yet-unconfirmed send may carry a provisional role.
    echo.content == other.content
        && echo.session_id == other.session_id
        && within_tolerance(echo.timestamp, other.timestamp, policy)
}

fn within_tolerance(a: DateTime<Utc>, b: DateTime<Utc>, policy: &ReconcilePolicy) -> bool {
    (a - b).abs() <= policy.tolerance
}

/// One optimistic local send awaiting server confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEcho {
    pub correlation: Uuid,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl PendingEcho {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            correlation: Uuid::new_v4(),
            content: content.into(),
            sent_at: Utc::now(),
        }
    }
}

/// Tracks optimistic local sends by correlation token and retires them as
/// ledger-confirmed copies arrive.
#[derive(Debug, Default)]
pub struct PendingSet {
    echoes: Vec<PendingEcho>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, echo: PendingEcho) {
        self.echoes.push(echo);
    }

    /// Retire echoes matched by a confirmed message (content within the
    /// tolerance window, any role). Returns the retired correlation tokens.
    pub fn confirm(&mut self, confirmed: &[Message], policy: &ReconcilePolicy) -> Vec<Uuid> {
        let mut retired = Vec::new();
        self.echoes.retain(|echo| {
            let hit = confirmed.iter().any(|m| {
                m.content == echo.content && within_tolerance(echo.sent_at, m.timestamp, policy)
            });
            if hit {
                retired.push(echo.correlation);
            }
            !hit
        });
        retired
    }

    pub fn is_empty(&self) -> bool {
        self.echoes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.echoes.len()
    }
}
