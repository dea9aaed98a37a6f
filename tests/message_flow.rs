mod common;

use common::{build_app, customer_message, MockPipeline, MockScorer};
use relaydesk::ledger::MessageRole;
use relaydesk::registry::AgentKind;
use relaydesk::router::PIPELINE_FALLBACK_NOTICE;
use std::sync::Arc;

#[tokio::test]
async fn first_contact_creates_session_and_gets_reply() {
    let app = build_app(MockPipeline::with_responses(vec![Ok("Hello!".into())]), None);

    let outcome = app
        .coordinator
        .handle(customer_message("hi", None))
        .await
        .unwrap();

    assert_eq!(outcome.session.current_agent, AgentKind::Bot);
    let session_id = outcome.session.session_id.clone();

    let transcript = app.ledger.read(&session_id, "cust-1", 10).unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, MessageRole::Customer);
    assert_eq!(transcript[0].content, "hi");
    assert_eq!(transcript[1].role, MessageRole::Bot);
    assert_eq!(transcript[1].content, "Hello!");
    assert!(transcript[0].seq < transcript[1].seq);
}

#[tokio::test]
async fn session_is_reused_across_messages() {
    let app = build_app(MockPipeline::with_responses(vec![]), None);

    let first = app
        .coordinator
        .handle(customer_message("one", None))
        .await
        .unwrap();
    let second = app
        .coordinator
        .handle(customer_message("two", None))
        .await
        .unwrap();

    // Within the reuse window the customer lands in the same session.
    assert_eq!(first.session.session_id, second.session.session_id);

    let transcript = app
        .ledger
        .read(&first.session.session_id, "cust-1", 10)
        .unwrap();
    assert_eq!(transcript.len(), 4);
}

#[tokio::test]
async fn pipeline_sees_prior_history() {
    let app = build_app(MockPipeline::with_responses(vec![]), None);

    app.coordinator
        .handle(customer_message("one", Some("s1")))
        .await
        .unwrap();
    app.coordinator
        .handle(customer_message("two", Some("s1")))
        .await
        .unwrap();

    let calls = app.pipeline.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].content, "one");
    // Second call sees the first exchange plus its own message.
    assert_eq!(calls[1].history_len, 3);
}

#[tokio::test]
async fn pipeline_failure_appends_single_fallback() {
    let app = build_app(
        MockPipeline::with_responses(vec![Err(anyhow::anyhow!("upstream 500"))]),
        None,
    );

    let outcome = app
        .coordinator
        .handle(customer_message("hi", Some("s1")))
        .await
        .unwrap();

    assert_eq!(outcome.session.current_agent, AgentKind::Bot);
    let transcript = app.ledger.read("s1", "cust-1", 10).unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].content, "hi");
    assert_eq!(transcript[1].role, MessageRole::System);
    assert_eq!(transcript[1].content, PIPELINE_FALLBACK_NOTICE);

    let fallbacks = transcript
        .iter()
        .filter(|m| m.content == PIPELINE_FALLBACK_NOTICE)
        .count();
    assert_eq!(fallbacks, 1);
}

#[tokio::test]
async fn low_sentiment_escalates_and_skips_pipeline() {
    let app = build_app(
        MockPipeline::with_responses(vec![]),
        Some(Arc::new(MockScorer(0.05))),
    );

    let outcome = app
        .coordinator
        .handle(customer_message("this is awful", Some("s1")))
        .await
        .unwrap();

    assert_eq!(outcome.session.current_agent, AgentKind::Human);
    assert_eq!(app.pipeline.call_count(), 0);

    let transcript = app.ledger.read("s1", "cust-1", 10).unwrap();
    assert_eq!(transcript[0].content, "this is awful");
    assert_eq!(transcript[1].role, MessageRole::System);
}

#[tokio::test]
async fn neutral_sentiment_keeps_bot_flow() {
    let app = build_app(
        MockPipeline::with_responses(vec![Ok("Happy to help".into())]),
        Some(Arc::new(MockScorer(0.8))),
    );

    let outcome = app
        .coordinator
        .handle(customer_message("all good", Some("s1")))
        .await
        .unwrap();

    assert_eq!(outcome.session.current_agent, AgentKind::Bot);
    assert_eq!(app.pipeline.call_count(), 1);
    let transcript = app.ledger.read("s1", "cust-1", 10).unwrap();
    assert_eq!(transcript[1].content, "Happy to help");
}

#[tokio::test]
async fn transcript_survives_reopen() {
    let app = build_app(MockPipeline::with_responses(vec![Ok("Hello!".into())]), None);
    app.coordinator
        .handle(customer_message("hi", Some("s1")))
        .await
        .unwrap();

    let db = app.tmp.path().join("relaydesk.db");
    drop(app.ledger);

    let reopened = relaydesk::ledger::MessageLedger::open(&db).unwrap();
    let transcript = reopened.read("s1", "cust-1", 10).unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1].content, "Hello!");
}
