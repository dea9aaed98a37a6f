use super::*;
use crate::handoff::HUMAN_MODE_NOTICE;
use crate::ledger::MessageDraft;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use tempfile::TempDir;
use tower::ServiceExt;

struct EchoPipeline;

#[async_trait]
impl ReplyPipeline for EchoPipeline {
    async fn generate_reply(&self, content: &str, _history: &[Message]) -> anyhow::Result<String> {
        Ok(format!("echo: {}", content))
    }
}

fn make_state(tmp: &TempDir) -> AppState {
    let db = tmp.path().join("gateway.db");
    let ledger = Arc::new(MessageLedger::open(&db).unwrap());
    let registry = Arc::new(SessionRegistry::open(&db, Duration::hours(24)).unwrap());
    let hub = Arc::new(BroadcastHub::new(
        ledger.clone(),
        16,
        100,
        ReconcilePolicy::default(),
    ));
    let coordinator = Arc::new(RoutingCoordinator::new(
        ledger.clone(),
        registry.clone(),
        hub.clone(),
        Arc::new(EchoPipeline),
        None,
        RoutingConfig::default(),
    ));
    AppState {
        ledger,
        registry,
        hub,
        coordinator,
    }
}

async fn json_body(resp: axum::http::Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_endpoint_returns_version() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(make_state(&tmp));

    let req = Request::builder()
        .method("GET")
        .uri("/api/health")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = json_body(resp).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], crate::VERSION);
}

#[tokio::test]
async fn message_endpoint_creates_session_and_replies() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(make_state(&tmp));

    let resp = app
        .oneshot(post_json(
            "/api/message",
            serde_json::json!({"content": "hi", "customer_id": "c1"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = json_body(resp).await;
    assert_eq!(json["current_agent"], "bot");
    assert!(!json["session_id"].as_str().unwrap().is_empty());
    let messages = json["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["content"], "hi");
    assert_eq!(messages[1]["content"], "echo: hi");
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(make_state(&tmp));

    let resp = app
        .oneshot(post_json(
            "/api/message",
            serde_json::json!({"content": "   ", "customer_id": "c1"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn history_endpoint_pages_the_transcript() {
    let tmp = TempDir::new().unwrap();
    let state = make_state(&tmp);
    for i in 0..5 {
        state
            .ledger
            .append(MessageDraft::new(
                "s1",
                "c1",
                MessageRole::Customer,
                format!("msg {}", i),
            ))
            .unwrap();
    }
    let app = build_router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/api/history?session_id=s1&customer_id=c1&limit=3")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = json_body(resp).await;
    let messages = json["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    // The newest page, oldest first.
    assert_eq!(messages[0]["content"], "msg 2");
    assert_eq!(messages[2]["content"], "msg 4");
}

#[tokio::test]
async fn command_endpoint_takes_over_session() {
    let tmp = TempDir::new().unwrap();
    let state = make_state(&tmp);
    let session = state.registry.get_or_create("c1", Some("s1")).unwrap();
    let app = build_router(state);

    let resp = app
        .oneshot(post_json(
            "/api/command",
            serde_json::json!({
                "action": "takeover",
                "session_id": session.session_id,
                "customer_id": "c1",
                "kind": "staff"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = json_body(resp).await;
    assert_eq!(json["current_agent"], "human");
    assert_eq!(json["messages"][0]["content"], HUMAN_MODE_NOTICE);
}

#[tokio::test]
async fn session_listing_shows_active_sessions() {
    let tmp = TempDir::new().unwrap();
    let state = make_state(&tmp);
    state.registry.get_or_create("c1", Some("s1")).unwrap();
    state.registry.get_or_create("c2", Some("s2")).unwrap();
    let app = build_router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/api/sessions")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let json = json_body(resp).await;
    assert_eq!(json["sessions"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn session_lookup_is_ownership_checked() {
    let tmp = TempDir::new().unwrap();
    let state = make_state(&tmp);
    state.registry.get_or_create("c1", Some("s1")).unwrap();
    let app = build_router(state);

    let owned = Request::builder()
        .method("GET")
        .uri("/api/sessions/s1?customer_id=c1")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(owned).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let foreign = Request::builder()
        .method("GET")
        .uri("/api/sessions/s1?customer_id=intruder")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(foreign).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ws_upgrade_rejects_unknown_session() {
    let tmp = TempDir::new().unwrap();
    let app = build_router(make_state(&tmp));

    let req = Request::builder()
        .method("GET")
        .uri("/ws/no-such-session?customer_id=c1")
        .header("connection", "upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn client_frame_parse_errors_are_reported() {
    let tmp = TempDir::new().unwrap();
    let state = make_state(&tmp);
    state.registry.get_or_create("c1", Some("s1")).unwrap();

    let reply = handle_client_frame(&state, "s1", ClientKind::Customer, "{not json").await;
    match reply {
        Some(ServerEvent::Error { message }) => assert!(message.contains("Invalid client event")),
        other => panic!("expected error event, got {:?}", other),
    }

    let reply = handle_client_frame(&state, "s1", ClientKind::Customer, r#"{"type":"ping"}"#).await;
    assert!(matches!(reply, Some(ServerEvent::Error { .. })));
}

#[tokio::test]
async fn client_frames_route_through_the_coordinator() {
    let tmp = TempDir::new().unwrap();
    let state = make_state(&tmp);
    state.registry.get_or_create("c1", Some("s1")).unwrap();

    let frame = r#"{"type":"message","content":"hello","customer_id":"c1"}"#;
    let reply = handle_client_frame(&state, "s1", ClientKind::Customer, frame).await;
    assert!(reply.is_none());

    let transcript = state.ledger.read("s1", "c1", 10).unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].content, "hello");
    assert_eq!(transcript[1].content, "echo: hello");
}

#[tokio::test]
async fn staff_frames_carry_the_staff_role() {
    let tmp = TempDir::new().unwrap();
    let state = make_state(&tmp);
    state.registry.get_or_create("c1", Some("s1")).unwrap();

    let frame = r#"{"type":"message","content":"agent here","customer_id":"c1"}"#;
    let reply = handle_client_frame(&state, "s1", ClientKind::Staff, frame).await;
    assert!(reply.is_none());

    // Implicit takeover: notice first, then the staff message
    let transcript = state.ledger.read("s1", "c1", 10).unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].content, HUMAN_MODE_NOTICE);
    assert_eq!(transcript[1].role, MessageRole::HumanAgent);
}
