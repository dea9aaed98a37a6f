//! Agent-control state machine.
//!
//! Pure transition logic over [`AgentKind`]; the routing coordinator applies
//! the planned transition to the registry and appends the SYSTEM notice to
//! the ledger so every observer sees the handoff inline.

use crate::registry::AgentKind;
use serde::{Deserialize, Serialize};

/// Why a handoff was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffReason {
    /// Explicit staff "take over" command.
    StaffTakeover,
    /// Explicit staff "transfer to bot" command.
    StaffRelease,
    /// Customer sentiment breached the configured threshold.
    SentimentBased,
    /// The upstream pipeline detected an explicit request for a human.
    CustomerRequest,
    /// A staff member replied while the bot still owned the session —
    /// evidence of takeover even without an explicit command.
    StaffReply,
}

/// A planned transition and the SYSTEM notice that announces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub target: AgentKind,
    pub reason: HandoffReason,
    pub notice: &'static str,
}

pub const HUMAN_MODE_NOTICE: &str = "Human agent mode activated";
pub const BOT_MODE_NOTICE: &str = "Bot mode activated";

/// Decide whether moving `current` to `target` for `reason` is a real
/// transition.
///
/// Returns `None` when the session is already in the requested state (a
/// no-op that callers treat as success, without a duplicate SYSTEM message)
/// and when the transition is not permitted: only an explicit staff release
/// may move Human back to Bot, so message content can never silently drop a
/// human-handled customer.
pub fn plan(current: AgentKind, target: AgentKind, reason: HandoffReason) -> Option<Handoff> {
    if current == target {
        return None;
    }
    match (target, reason) {
        (
            AgentKind::Human,
            HandoffReason::StaffTakeover
            | HandoffReason::SentimentBased
            | HandoffReason::CustomerRequest
            | HandoffReason::StaffReply,
        ) => Some(Handoff {
            target,
            reason,
            notice: HUMAN_MODE_NOTICE,
        }),
        (AgentKind::Bot, HandoffReason::StaffRelease) => Some(Handoff {
            target,
            reason,
            notice: BOT_MODE_NOTICE,
        }),
        _ => None,
    }
}
