//! Wire protocol for the live transport.
//!
//! Closed tagged-variant types for everything crossing a connection, matched
//! exhaustively. Unknown tags fail deserialization and are reported to the
//! client as an error event instead of being silently ignored.

use crate::ledger::Message;
use crate::registry::AgentKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events sent FROM a client (customer widget or staff dashboard) TO the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// A chat message to append and route.
    Message {
        content: String,
        customer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Correlation token of the sender's optimistic local echo, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation: Option<Uuid>,
    },
    /// A staff control command.
    Command {
        action: CommandAction,
        session_id: String,
        customer_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Takeover,
    TransferToBot,
}

/// Events sent FROM the server TO every subscriber of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full transcript snapshot, sent once on subscribe.
    History { messages: Vec<Message> },
    /// One appended message, sent per ledger delta.
    NewMessage { message: Message },
    /// Conversation ownership changed.
    AgentChange { current_agent: AgentKind },
    /// The client sent something we could not accept.
    Error { message: String },
}

/// Which kind of viewer opened a live connection. Determines the role given
/// to chat messages arriving on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    #[default]
    Customer,
    Staff,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_round_trip() {
        let json = r#"{"type":"message","content":"hi","customer_id":"c1","session_id":"s1"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::Message {
                content,
                customer_id,
                session_id,
                correlation,
            } => {
                assert_eq!(content, "hi");
                assert_eq!(customer_id, "c1");
                assert_eq!(session_id.as_deref(), Some("s1"));
                assert!(correlation.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn client_command_round_trip() {
        let json =
            r#"{"type":"command","action":"takeover","session_id":"s1","customer_id":"c1"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::Command { action, .. } => assert_eq!(action, CommandAction::Takeover),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let json = r#"{"type":"ping"}"#;
        assert!(serde_json::from_str::<ClientEvent>(json).is_err());
    }

    #[test]
    fn unknown_action_is_rejected() {
        let json =
            r#"{"type":"command","action":"self_destruct","session_id":"s1","customer_id":"c1"}"#;
        assert!(serde_json::from_str::<ClientEvent>(json).is_err());
    }

    #[test]
    fn server_event_tags() {
        let event = ServerEvent::AgentChange {
            current_agent: AgentKind::Human,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"agent_change""#));
        assert!(json.contains(r#""current_agent":"human""#));
    }
}
