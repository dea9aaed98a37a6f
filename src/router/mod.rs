//! Routing coordinator.
//!
//! Every inbound message or command for a session funnels through here.
//! Mutations for one session are serialized behind a per-session lock so the
//! ledger and registry never observe interleaved intermediate state, while
//! different sessions proceed fully in parallel.

use crate::errors::{RelaydeskError, RelaydeskResult};
use crate::handoff::{self, HandoffReason};
use crate::hub::BroadcastHub;
use crate::ledger::{Message, MessageDraft, MessageLedger, MessageRole};
use crate::pipeline::{ReplyPipeline, SentimentScorer};
use crate::protocol::{ClientKind, CommandAction};
use crate::registry::{AgentKind, Session, SessionRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// SYSTEM message emitted when the reply pipeline fails or times out. The
/// customer must always see either a real reply or this — never silence.
pub const PIPELINE_FALLBACK_NOTICE: &str =
    "Sorry, I'm having trouble responding right now. Please try again in a moment, \
     or ask to speak with a human agent.";

#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Sentiment scores below this escalate a bot-owned session to a human.
    pub sentiment_threshold: f32,
    /// Deadline for one reply-pipeline invocation.
    pub pipeline_timeout_secs: u64,
    /// How much conversation history the pipeline receives.
    pub history_limit: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            sentiment_threshold: 0.35,
            pipeline_timeout_secs: 60,
            history_limit: 30,
        }
    }
}

/// One inbound unit of work.
#[derive(Debug, Clone)]
pub enum Inbound {
    Message {
        role: MessageRole,
        content: String,
        customer_id: String,
        session_id: Option<String>,
    },
    Command {
        action: CommandAction,
        session_id: String,
        customer_id: String,
        /// Who issued the command; customers may request a human but never
        /// release one.
        initiator: ClientKind,
    },
}

/// What a handled inbound produced: the session's final state and every
/// message appended to the ledger during handling, in ledger order.
#[derive(Debug, Clone)]
pub struct RoutingOutcome {
    pub session: Session,
    pub appended: Vec<Message>,
}

pub struct RoutingCoordinator {
    ledger: Arc<MessageLedger>,
    registry: Arc<SessionRegistry>,
    hub: Arc<BroadcastHub>,
    pipeline: Arc<dyn ReplyPipeline>,
    scorer: Option<Arc<dyn SentimentScorer>>,
    config: RoutingConfig,
    // One lock per session. Lock order: session lock first, then whatever
    // the ledger/registry/hub take internally — never the reverse.
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RoutingCoordinator {
    pub fn new(
        ledger: Arc<MessageLedger>,
        registry: Arc<SessionRegistry>,
        hub: Arc<BroadcastHub>,
        pipeline: Arc<dyn ReplyPipeline>,
        scorer: Option<Arc<dyn SentimentScorer>>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            ledger,
            registry,
            hub,
            pipeline,
            scorer,
            config,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Handle one inbound message or command to completion.
    pub async fn handle(&self, inbound: Inbound) -> RelaydeskResult<RoutingOutcome> {
        match inbound {
            Inbound::Message {
                role,
                content,
                customer_id,
                session_id,
            } => {
                let session = self
                    .registry
                    .get_or_create(&customer_id, session_id.as_deref())?;
                let lock = self.session_lock(&session.session_id).await;
                let _guard = lock.lock().await;
                self.handle_message(session, role, content).await
            }
            Inbound::Command {
                action,
                session_id,
                customer_id,
                initiator,
            } => {
                let session = self
                    .registry
                    .get_or_create(&customer_id, Some(&session_id))?;
                let lock = self.session_lock(&session.session_id).await;
                let _guard = lock.lock().await;
                self.handle_command(session, action, initiator)
            }
        }
    }

    async fn handle_message(
        &self,
        session: Session,
        role: MessageRole,
        content: String,
    ) -> RelaydeskResult<RoutingOutcome> {
        // State may have moved between resolution and lock acquisition
        let mut session = self
            .registry
            .get(&session.session_id)?
            .unwrap_or(session);
        let mut appended = Vec::new();

        // A staff reply is evidence of takeover even without an explicit
        // command; its transition notice must precede the staff message in
        // ledger order, so the handoff is applied before the append.
        if role == MessageRole::HumanAgent && session.current_agent != AgentKind::Human {
            session = self.apply_handoff(
                session,
                AgentKind::Human,
                HandoffReason::StaffReply,
                &mut appended,
            )?;
        }

        // The inbound message is durably appended and broadcast before any
        // pipeline work, so a pipeline failure can never lose it.
        let stored = self.append_and_publish(&session, role, &content)?;
        appended.push(stored);

        if role == MessageRole::Customer {
            session = self
                .escalate_on_sentiment(session, &content, &mut appended)
                .await?;

            if session.current_agent == AgentKind::Human {
                // Persist-only: a human is expected to answer.
                debug!(session_id = %session.session_id, "human-owned, skipping pipeline");
            } else {
                session = self
                    .invoke_pipeline(session, &content, &mut appended)
                    .await?;
            }
        }

        Ok(RoutingOutcome { session, appended })
    }

    /// Run the scorer on a customer message and escalate a bot-owned session
    /// when the score breaches the threshold. Scorer trouble is logged and
    /// ignored — it must never reject the message itself.
    async fn escalate_on_sentiment(
        &self,
        session: Session,
        content: &str,
        appended: &mut Vec<Message>,
    ) -> RelaydeskResult<Session> {
        let Some(scorer) = &self.scorer else {
            return Ok(session);
        };
        if session.current_agent != AgentKind::Bot {
            return Ok(session);
        }

        let score = match scorer.score(content).await {
            Ok(score) => score,
            Err(e) => {
                warn!(session_id = %session.session_id, "sentiment scorer failed: {:#}", e);
                return Ok(session);
            }
        };

        if score >= self.config.sentiment_threshold {
            return Ok(session);
        }

        info!(
            session_id = %session.session_id,
            score,
            threshold = self.config.sentiment_threshold,
            "sentiment breach, escalating to human"
        );
        self.apply_handoff(
            session,
            AgentKind::Human,
            HandoffReason::SentimentBased,
            appended,
        )
    }

    async fn invoke_pipeline(
        &self,
        session: Session,
        content: &str,
        appended: &mut Vec<Message>,
    ) -> RelaydeskResult<Session> {
        let history =
            self.ledger
                .read(&session.session_id, &session.customer_id, self.config.history_limit)?;

        let deadline = Duration::from_secs(self.config.pipeline_timeout_secs);
        let reply = tokio::time::timeout(deadline, self.pipeline.generate_reply(content, &history))
            .await;

        match reply {
            Ok(Ok(text)) => {
                let stored = self.append_and_publish(&session, MessageRole::Bot, &text)?;
                appended.push(stored);
            }
            Ok(Err(e)) => {
                warn!(
                    session_id = %session.session_id,
                    "reply pipeline failed: {:#}",
                    RelaydeskError::Pipeline(format!("{:#}", e))
                );
                let stored = self.append_and_publish(
                    &session,
                    MessageRole::System,
                    PIPELINE_FALLBACK_NOTICE,
                )?;
                appended.push(stored);
            }
            Err(_) => {
                warn!(
                    session_id = %session.session_id,
                    "{}",
                    RelaydeskError::PipelineTimeout(self.config.pipeline_timeout_secs)
                );
                let stored = self.append_and_publish(
                    &session,
                    MessageRole::System,
                    PIPELINE_FALLBACK_NOTICE,
                )?;
                appended.push(stored);
            }
        }

        // Pipeline failure never auto-escalates: the bot keeps ownership and
        // the customer sees the fallback notice instead of a silent handoff.
        Ok(session)
    }

    fn handle_command(
        &self,
        session: Session,
        action: CommandAction,
        initiator: ClientKind,
    ) -> RelaydeskResult<RoutingOutcome> {
        let session = self
            .registry
            .get(&session.session_id)?
            .unwrap_or(session);
        let mut appended = Vec::new();

        let (target, reason) = match (action, initiator) {
            (CommandAction::Takeover, ClientKind::Staff) => {
                (AgentKind::Human, HandoffReason::StaffTakeover)
            }
            (CommandAction::Takeover, ClientKind::Customer) => {
                (AgentKind::Human, HandoffReason::CustomerRequest)
            }
            (CommandAction::TransferToBot, ClientKind::Staff) => {
                (AgentKind::Bot, HandoffReason::StaffRelease)
            }
            (CommandAction::TransferToBot, ClientKind::Customer) => {
                return Err(RelaydeskError::InvalidEvent(
                    "only staff may transfer a session back to the bot".to_string(),
                ));
            }
        };

        // Requesting the current state is an idempotent no-op success — no
        // duplicate SYSTEM message, no error.
        let session = self.apply_handoff(session, target, reason, &mut appended)?;
        Ok(RoutingOutcome { session, appended })
    }

    fn apply_handoff(
        &self,
        session: Session,
        target: AgentKind,
        reason: HandoffReason,
        appended: &mut Vec<Message>,
    ) -> RelaydeskResult<Session> {
        let Some(planned) = handoff::plan(session.current_agent, target, reason) else {
            return Ok(session);
        };

        let updated = self.registry.set_agent(&session.session_id, planned.target)?;
        let stored = self.append_and_publish(&updated, MessageRole::System, planned.notice)?;
        appended.push(stored);
        self.hub
            .publish_agent_change(&updated.session_id, planned.target);

        info!(
            session_id = %updated.session_id,
            agent = planned.target.as_str(),
            reason = ?planned.reason,
            "conversation ownership changed"
        );
        Ok(updated)
    }

    fn append_and_publish(
        &self,
        session: &Session,
        role: MessageRole,
        content: &str,
    ) -> RelaydeskResult<Message> {
        let stored = self.ledger.append(MessageDraft::new(
            &session.session_id,
            &session.customer_id,
            role,
            content,
        ))?;
        self.registry.touch(&session.session_id)?;
        self.hub.publish(&stored);
        Ok(stored)
    }
}
