//! HTTP and WebSocket surface of the service.
//!
//! REST endpoints cover stateless clients (send a message, fetch history,
//! staff session listing); the WebSocket endpoint carries the live event
//! stream for connected widgets and dashboards.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Duration;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::RelaydeskError;
use crate::hub::BroadcastHub;
use crate::ledger::{Message, MessageLedger, MessageRole};
use crate::pipeline::{HttpReplyPipeline, HttpSentimentScorer, ReplyPipeline, SentimentScorer};
use crate::protocol::{ClientEvent, ClientKind, CommandAction, ServerEvent};
use crate::reconcile::ReconcilePolicy;
use crate::registry::{AgentKind, SessionRegistry};
use crate::router::{Inbound, RoutingConfig, RoutingCoordinator};

/// Max chat message size: 64 KB.
const MAX_MESSAGE_SIZE: usize = 65_536;

/// History page size when the query does not name one.
const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Liveness probe cadence for WebSocket connections.
const PING_INTERVAL_SECS: u64 = 30;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<MessageLedger>,
    pub registry: Arc<SessionRegistry>,
    pub hub: Arc<BroadcastHub>,
    pub coordinator: Arc<RoutingCoordinator>,
}

/// Request body for POST /api/message.
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub content: String,
    pub customer_id: String,
    /// Omitted on a customer's first contact; the registry resolves or
    /// creates the session.
    pub session_id: Option<String>,
    #[serde(default)]
    pub kind: ClientKind,
}

/// Response body for POST /api/message and /api/command.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub session_id: String,
    pub current_agent: AgentKind,
    /// Every message the request caused to be appended, in ledger order.
    pub messages: Vec<Message>,
}

/// Request body for POST /api/command.
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub action: CommandAction,
    pub session_id: String,
    pub customer_id: String,
    #[serde(default)]
    pub kind: ClientKind,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub session_id: String,
    pub customer_id: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub customer_id: String,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub customer_id: String,
    #[serde(default)]
    pub kind: ClientKind,
}

fn error_response(err: &RelaydeskError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        RelaydeskError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
        RelaydeskError::PipelineTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": err.to_string()})))
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/message", post(message_handler))
        .route("/api/command", post(command_handler))
        .route("/api/history", get(history_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/sessions/{id}", get(get_session_handler))
        .route("/ws/{session_id}", get(ws_handler))
        .with_state(state)
}

/// GET /api/health — health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION
    }))
}

/// POST /api/message — append a chat message and run routing.
async fn message_handler(
    State(state): State<AppState>,
    Json(body): Json<MessageRequest>,
) -> Response {
    if body.content.len() > MAX_MESSAGE_SIZE {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(serde_json::json!({"error": "message too large"})),
        )
            .into_response();
    }
    if body.content.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "message content is empty"})),
        )
            .into_response();
    }

    let role = match body.kind {
        ClientKind::Customer => MessageRole::Customer,
        ClientKind::Staff => MessageRole::HumanAgent,
    };
    debug!(
        customer_id = %body.customer_id,
        content_len = body.content.len(),
        "api message request"
    );

    let inbound = Inbound::Message {
        role,
        content: body.content,
        customer_id: body.customer_id,
        session_id: body.session_id,
    };
    match state.coordinator.handle(inbound).await {
        Ok(outcome) => Json(MessageResponse {
            session_id: outcome.session.session_id,
            current_agent: outcome.session.current_agent,
            messages: outcome.appended,
        })
        .into_response(),
        Err(e) => {
            error!("api message failed: {}", e);
            error_response(&e).into_response()
        }
    }
}

/// POST /api/command — staff control command (takeover / transfer back).
async fn command_handler(
    State(state): State<AppState>,
    Json(body): Json<CommandRequest>,
) -> Response {
    let inbound = Inbound::Command {
        action: body.action,
        session_id: body.session_id,
        customer_id: body.customer_id,
        initiator: body.kind,
    };
    match state.coordinator.handle(inbound).await {
        Ok(outcome) => Json(MessageResponse {
            session_id: outcome.session.session_id,
            current_agent: outcome.session.current_agent,
            messages: outcome.appended,
        })
        .into_response(),
        Err(e) => {
            error!("api command failed: {}", e);
            error_response(&e).into_response()
        }
    }
}

/// GET /api/history — transcript page for one session.
async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    match state.ledger.read(&query.session_id, &query.customer_id, limit) {
        Ok(messages) => Json(serde_json::json!({"messages": messages})).into_response(),
        Err(e) => {
            error!("history read failed: {}", e);
            error_response(&e).into_response()
        }
    }
}

/// GET /api/sessions — active (unarchived) sessions for the staff dashboard.
async fn list_sessions_handler(State(state): State<AppState>) -> Response {
    match state.registry.list_active() {
        Ok(sessions) => Json(serde_json::json!({"sessions": sessions})).into_response(),
        Err(e) => {
            error!("session listing failed: {}", e);
            error_response(&e).into_response()
        }
    }
}

/// GET /api/sessions/{id} — one session, ownership-checked.
async fn get_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Response {
    match state.registry.get(&id) {
        Ok(Some(session)) if session.customer_id == query.customer_id => {
            Json(session).into_response()
        }
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "session not found"})),
        )
            .into_response(),
        Err(e) => {
            error!("session lookup failed: {}", e);
            error_response(&e).into_response()
        }
    }
}

/// GET /ws/{session_id} — live event stream for one session.
async fn ws_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // A customer reaches the socket only after /api/message created the
    // session, so an unknown id is a hard miss for both client kinds.
    match state.registry.get(&session_id) {
        Ok(Some(_)) => {}
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!("ws session lookup failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    ws.on_upgrade(move |socket| {
        handle_socket(socket, state, session_id, query.customer_id, query.kind)
    })
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    customer_id: String,
    kind: ClientKind,
) {
    let (snapshot, mut rx, sink_id) = match state.hub.subscribe(&session_id, &customer_id) {
        Ok(sub) => sub,
        Err(e) => {
            error!(session_id, "ws subscribe failed: {}", e);
            return;
        }
    };
    info!(session_id, sink_id, ?kind, "ws connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The snapshot goes out first so live deltas land on a known baseline.
    let history = ServerEvent::History { messages: snapshot };
    if send_event(&mut ws_sender, &history).await.is_err() {
        state.hub.unsubscribe(&session_id, sink_id);
        return;
    }

    let mut ping = tokio::time::interval(StdDuration::from_secs(PING_INTERVAL_SECS));
    ping.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = ping.tick() => {
                // Liveness probe; a dead peer surfaces as a send error here
                // instead of lingering until the next delivery.
                if ws_sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut ws_sender, &event).await.is_err() {
                            break;
                        }
                    }
                    // Hub dropped the sink (overflow or shutdown).
                    None => break,
                }
            }
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(reply) =
                            handle_client_frame(&state, &session_id, kind, &text).await
                        {
                            if send_event(&mut ws_sender, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by the transport
                    Some(Err(e)) => {
                        debug!(session_id, "ws receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    state.hub.unsubscribe(&session_id, sink_id);
    info!(session_id, sink_id, "ws disconnected");
}

/// Parse and route one inbound frame. Returns an event to send back directly
/// when the frame could not be routed; routed messages come back through the
/// hub instead.
async fn handle_client_frame(
    state: &AppState,
    session_id: &str,
    kind: ClientKind,
    text: &str,
) -> Option<ServerEvent> {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            let err = RelaydeskError::InvalidEvent(e.to_string());
            warn!(session_id, "{}", err);
            return Some(ServerEvent::Error {
                message: err.to_string(),
            });
        }
    };

    let inbound = match event {
        ClientEvent::Message {
            content,
            customer_id,
            ..
        } => {
            if content.len() > MAX_MESSAGE_SIZE {
                return Some(ServerEvent::Error {
                    message: "message too large".to_string(),
                });
            }
            let role = match kind {
                ClientKind::Customer => MessageRole::Customer,
                ClientKind::Staff => MessageRole::HumanAgent,
            };
            // The socket is bound to its path session regardless of what the
            // payload claims.
            Inbound::Message {
                role,
                content,
                customer_id,
                session_id: Some(session_id.to_string()),
            }
        }
        ClientEvent::Command {
            action,
            customer_id,
            ..
        } => Inbound::Command {
            action,
            session_id: session_id.to_string(),
            customer_id,
            initiator: kind,
        },
    };

    match state.coordinator.handle(inbound).await {
        Ok(_) => None,
        Err(e) => {
            error!(session_id, "ws routing failed: {}", e);
            Some(ServerEvent::Error {
                message: e.to_string(),
            })
        }
    }
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            error!("failed to serialize server event: {}", e);
            return Ok(());
        }
    };
    sender.send(WsMessage::Text(json.into())).await
}

/// Compose the full application from configuration.
pub fn build_state(config: &Config) -> Result<AppState> {
    let ledger = Arc::new(MessageLedger::open(&config.storage.db_path)?);
    let registry = Arc::new(SessionRegistry::open(
        &config.storage.db_path,
        Duration::hours(config.sessions.reuse_window_hours),
    )?);
    let hub = Arc::new(BroadcastHub::new(
        ledger.clone(),
        config.hub.sink_capacity,
        config.hub.snapshot_limit,
        ReconcilePolicy::with_tolerance_secs(config.reconcile.tolerance_secs),
    ));

    let pipeline: Arc<dyn ReplyPipeline> =
        Arc::new(HttpReplyPipeline::new(config.pipeline.reply_url.clone()));
    let scorer: Option<Arc<dyn SentimentScorer>> = if config.pipeline.sentiment_url.is_empty() {
        None
    } else {
        Some(Arc::new(HttpSentimentScorer::new(
            config.pipeline.sentiment_url.clone(),
        )))
    };

    let coordinator = Arc::new(RoutingCoordinator::new(
        ledger.clone(),
        registry.clone(),
        hub.clone(),
        pipeline,
        scorer,
        RoutingConfig {
            sentiment_threshold: config.routing.sentiment_threshold,
            pipeline_timeout_secs: config.routing.pipeline_timeout_secs,
            history_limit: config.routing.history_limit,
        },
    ));

    Ok(AppState {
        ledger,
        registry,
        hub,
        coordinator,
    })
}

/// Run the server until shutdown.
pub async fn serve(config: Config) -> Result<()> {
    config.validate()?;
    let state = build_state(&config)?;

    spawn_archive_sweep(
        state.registry.clone(),
        config.sessions.sweep_interval_secs,
        config.sessions.idle_archive_hours,
    );

    let app = build_router(state);
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Periodically archive sessions idle past the configured window.
fn spawn_archive_sweep(registry: Arc<SessionRegistry>, interval_secs: u64, idle_hours: i64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(interval_secs.max(1)));
        ticker.tick().await; // first tick fires immediately, skip it
        loop {
            ticker.tick().await;
            match registry.archive_idle(Duration::hours(idle_hours)) {
                Ok(0) => {}
                Ok(n) => info!("archived {} idle session(s)", n),
                Err(e) => warn!("archive sweep failed: {}", e),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install shutdown handler: {}", e);
        // Fall through and keep serving; the task can still be aborted.
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests;
