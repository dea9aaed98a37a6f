// Shared test helpers — not all items used by every test binary.
#![allow(unused)]

use async_trait::async_trait;
use chrono::Duration;
use relaydesk::hub::BroadcastHub;
use relaydesk::ledger::{Message, MessageLedger, MessageRole};
use relaydesk::pipeline::{ReplyPipeline, SentimentScorer};
use relaydesk::reconcile::ReconcilePolicy;
use relaydesk::registry::SessionRegistry;
use relaydesk::router::{RoutingConfig, RoutingCoordinator};
use std::collections::VecDeque;
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub content: String,
    pub history_len: usize,
}

pub struct MockPipeline {
    responses: std::sync::Mutex<VecDeque<anyhow::Result<String>>>,
    pub calls: std::sync::Mutex<Vec<RecordedCall>>,
    pub default_response: String,
}

impl MockPipeline {
    pub fn with_responses(responses: Vec<anyhow::Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            responses: std::sync::Mutex::new(VecDeque::from(responses)),
            calls: std::sync::Mutex::new(Vec::new()),
            default_response: "Mock reply".to_string(),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ReplyPipeline for MockPipeline {
    async fn generate_reply(&self, content: &str, history: &[Message]) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(RecordedCall {
            content: content.to_string(),
            history_len: history.len(),
        });
        match self.responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(self.default_response.clone()),
        }
    }
}

pub struct MockScorer(pub f32);

#[async_trait]
impl SentimentScorer for MockScorer {
    async fn score(&self, _text: &str) -> anyhow::Result<f32> {
        Ok(self.0)
    }
}

pub struct TestApp {
    pub ledger: Arc<MessageLedger>,
    pub registry: Arc<SessionRegistry>,
    pub hub: Arc<BroadcastHub>,
    pub coordinator: Arc<RoutingCoordinator>,
    pub pipeline: Arc<MockPipeline>,
    pub tmp: TempDir,
}

pub fn build_app(pipeline: Arc<MockPipeline>, scorer: Option<Arc<dyn SentimentScorer>>) -> TestApp {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("relaydesk.db");
    let ledger = Arc::new(MessageLedger::open(&db).unwrap());
    let registry = Arc::new(SessionRegistry::open(&db, Duration::hours(24)).unwrap());
    let hub = Arc::new(BroadcastHub::new(
        ledger.clone(),
        32,
        100,
        ReconcilePolicy::default(),
    ));
    let coordinator = Arc::new(RoutingCoordinator::new(
        ledger.clone(),
        registry.clone(),
        hub.clone(),
        pipeline.clone(),
        scorer,
        RoutingConfig {
            sentiment_threshold: 0.35,
            pipeline_timeout_secs: 5,
            history_limit: 30,
        },
    ));
    TestApp {
        ledger,
        registry,
        hub,
        coordinator,
        pipeline,
        tmp,
    }
}

pub fn customer_message(content: &str, session_id: Option<&str>) -> relaydesk::router::Inbound {
    relaydesk::router::Inbound::Message {
        role: MessageRole::Customer,
        content: content.to_string(),
        customer_id: "cust-1".to_string(),
        session_id: session_id.map(str::to_string),
    }
}
