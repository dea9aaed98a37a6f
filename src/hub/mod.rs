//! Per-session broadcast hub.
//!
//! Multiplexes one ledger onto many live subscribers. Subscription state is
//! transient and non-authoritative: a restart drops it, and clients recover
//! by resubscribing for a fresh snapshot.
//!
//! The snapshot/live race is closed by registering the sink in a buffering
//! state first, reading the snapshot, then reconciling anything published in
//! between — no message is lost, none is delivered twice.

use crate::errors::{RelaydeskError, RelaydeskResult};
use crate::ledger::{Message, MessageLedger};
use crate::protocol::ServerEvent;
use crate::reconcile::{reconcile, ReconcilePolicy};
use crate::registry::AgentKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum SinkState {
    /// Snapshot read in progress; deltas published meanwhile are buffered
    /// and folded into the snapshot.
    Buffering(Vec<Message>),
    /// Receiving deltas. `last_seq` guards against re-delivering anything
    /// already covered by the snapshot.
    Live {
        tx: mpsc::Sender<ServerEvent>,
        last_seq: i64,
    },
}

pub struct BroadcastHub {
    ledger: Arc<MessageLedger>,
    // {session_id: {sink_id: state}} — distinct lock from the routing
    // coordinator's per-session scope so subscribe/unsubscribe never blocks
    // message processing.
    sessions: Mutex<HashMap<String, HashMap<u64, SinkState>>>,
    next_sink: AtomicU64,
    sink_capacity: usize,
    snapshot_limit: usize,
    policy: ReconcilePolicy,
}

impl BroadcastHub {
    pub fn new(
        ledger: Arc<MessageLedger>,
        sink_capacity: usize,
        snapshot_limit: usize,
        policy: ReconcilePolicy,
    ) -> Self {
        Self {
            ledger,
            sessions: Mutex::new(HashMap::new()),
            next_sink: AtomicU64::new(1),
            sink_capacity,
            snapshot_limit,
            policy,
        }
    }

    /// Register a live sink and return the current full history plus the
    /// event receiver. The returned sink id must be passed to
    /// [`BroadcastHub::unsubscribe`] on disconnect.
    pub fn subscribe(
        &self,
        session_id: &str,
        customer_id: &str,
    ) -> RelaydeskResult<(Vec<Message>, mpsc::Receiver<ServerEvent>, u64)> {
        let sink_id = self.next_sink.fetch_add(1, Ordering::Relaxed);

        {
            let mut sessions = lock_sessions(&self.sessions);
            sessions
                .entry(session_id.to_string())
                .or_default()
                .insert(sink_id, SinkState::Buffering(Vec::new()));
        }

        let snapshot = match self.ledger.read(session_id, customer_id, self.snapshot_limit) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.unsubscribe(session_id, sink_id);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(self.sink_capacity);

        let mut sessions = lock_sessions(&self.sessions);
        let sinks = sessions.entry(session_id.to_string()).or_default();
        let buffered = match sinks.remove(&sink_id) {
            Some(SinkState::Buffering(buffered)) => buffered,
            // Unsubscribed while we were reading — treat as a plain snapshot.
            _ => Vec::new(),
        };
        let merged = reconcile(&snapshot, &buffered, &self.policy);
        let last_seq = merged.iter().map(|m| m.seq).max().unwrap_or(0);
        sinks.insert(sink_id, SinkState::Live { tx, last_seq });

        debug!(session_id, sink_id, history = merged.len(), "sink subscribed");
        Ok((merged, rx, sink_id))
    }

    /// Fan one appended message out to every sink of its session. Slow or
    /// dead sinks are dropped rather than blocking healthy ones; the client
    /// is expected to resubscribe.
    pub fn publish(&self, message: &Message) {
        let mut sessions = lock_sessions(&self.sessions);
        let Some(sinks) = sessions.get_mut(&message.session_id) else {
            return;
        };

        let mut dead: Vec<u64> = Vec::new();
        for (&sink_id, state) in sinks.iter_mut() {
            match state {
                SinkState::Buffering(buffered) => buffered.push(message.clone()),
                SinkState::Live { tx, last_seq } => {
                    if message.seq <= *last_seq {
                        continue; // already covered by this sink's snapshot
                    }
                    match tx.try_send(ServerEvent::NewMessage {
                        message: message.clone(),
                    }) {
                        Ok(()) => *last_seq = message.seq,
                        Err(e) => {
                            warn!(
                                session_id = %message.session_id,
                                "dropping sink: {}",
                                RelaydeskError::Transport {
                                    sink_id,
                                    message: e.to_string(),
                                }
                            );
                            dead.push(sink_id);
                        }
                    }
                }
            }
        }

        remove_sinks(&mut sessions, &message.session_id, &dead);
    }

    /// Announce a conversation ownership change to every live sink.
    pub fn publish_agent_change(&self, session_id: &str, agent: AgentKind) {
        let mut sessions = lock_sessions(&self.sessions);
        let Some(sinks) = sessions.get_mut(session_id) else {
            return;
        };

        let mut dead: Vec<u64> = Vec::new();
        for (&sink_id, state) in sinks.iter_mut() {
            if let SinkState::Live { tx, .. } = state {
                if let Err(e) = tx.try_send(ServerEvent::AgentChange {
                    current_agent: agent,
                }) {
                    warn!(
                        session_id,
                        "dropping sink: {}",
                        RelaydeskError::Transport {
                            sink_id,
                            message: e.to_string(),
                        }
                    );
                    dead.push(sink_id);
                }
            }
        }

        remove_sinks(&mut sessions, session_id, &dead);
    }

    pub fn unsubscribe(&self, session_id: &str, sink_id: u64) {
        let mut sessions = lock_sessions(&self.sessions);
        if let Some(sinks) = sessions.get_mut(session_id) {
            if sinks.remove(&sink_id).is_some() {
                debug!(session_id, sink_id, "sink unsubscribed");
            }
            if sinks.is_empty() {
                sessions.remove(session_id);
            }
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        lock_sessions(&self.sessions)
            .get(session_id)
            .map_or(0, HashMap::len)
    }
}

fn lock_sessions(
    sessions: &Mutex<HashMap<String, HashMap<u64, SinkState>>>,
) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<u64, SinkState>>> {
    sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn remove_sinks(
    sessions: &mut HashMap<String, HashMap<u64, SinkState>>,
    session_id: &str,
    dead: &[u64],
) {
    if dead.is_empty() {
        return;
    }
    if let Some(sinks) = sessions.get_mut(session_id) {
        for sink_id in dead {
            sinks.remove(sink_id);
        }
        if sinks.is_empty() {
            sessions.remove(session_id);
        }
    }
}
