//! HTTP/WebSocket surface: carrier media stream, dashboard subscriber feed,
//! and a small read-only introspection API.
//!
//! Grounded on the teacher's `ServerState`/axum wiring in this same module
//! (state constructed once, threaded through `.with_state()`, no hidden
//! globals) and the original's `routers/dashboard.py` `/ws` endpoint for the
//! heartbeat-on-timeout and inbound-command handling.

use crate::analytics::Recorder;
use crate::clients::HangupClient;
use crate::config::{GatewayConfig, LiveParamStore, LiveParams};
use crate::conversation::KnowledgeSnapshot;
use crate::dashboard::{self, Broadcaster, HEARTBEAT_TIMEOUT_SECS};
use crate::pipeline::PipelineContext;
use crate::scheduler::location::LocationCoordinator;
use crate::scheduler::ActionScheduler;
use crate::session::{self, SessionDeps};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::{Arc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    pub live_params: Arc<RwLock<LiveParams>>,
    pub recorder: Arc<Recorder>,
    pub broadcaster: Arc<Broadcaster>,
    pub scheduler: Arc<ActionScheduler>,
    pub location: Arc<LocationCoordinator>,
    pub session_deps: Arc<SessionDeps>,
}

pub fn build_state(
    config: GatewayConfig,
    pipeline: PipelineContext,
    hangup: Arc<dyn HangupClient>,
    location_sender: Arc<dyn crate::scheduler::location::LocationSender>,
    knowledge: KnowledgeSnapshot,
    greeting: String,
) -> ServerState {
    let live_params = Arc::new(RwLock::new(config.live.clone()));
    let broadcaster = pipeline.broadcaster.clone();
    let recorder = pipeline.recorder.clone();
    let scheduler = Arc::new(ActionScheduler::new());
    let location = Arc::new(LocationCoordinator::new(
        scheduler.clone(),
        location_sender,
        broadcaster.clone(),
    ));

    let session_deps = Arc::new(SessionDeps {
        pipeline,
        hangup,
        scheduler: scheduler.clone(),
        broadcaster: broadcaster.clone(),
        knowledge,
        greeting,
        live_params: live_params.clone(),
    });

    ServerState {
        config: Arc::new(config),
        live_params,
        recorder,
        broadcaster,
        scheduler,
        location,
        session_deps,
    }
}

pub fn carrier_router(state: ServerState) -> Router {
    Router::new()
        .route("/carrier/stream", get(carrier_stream_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub fn dashboard_router(state: ServerState) -> Router {
    Router::new()
        .route("/dashboard/ws", get(dashboard_ws_handler))
        .route("/config", get(config_handler))
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}

async fn config_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let snapshot = state.live_params.read().unwrap().clone();
    Json(snapshot)
}

async fn carrier_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::handle_carrier_session(socket, state.session_deps))
}

async fn dashboard_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_dashboard_session(socket, state))
}

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DashboardInbound {
    Ping,
    SendLocation { call_sid: String, caller: String },
    CancelLocation { call_sid: String },
}

async fn handle_dashboard_session(socket: WebSocket, state: ServerState) {
    use futures_util::{SinkExt, StreamExt};

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (id, mut outbound_rx) = state.broadcaster.subscribe().await;
    info!(subscriber_id = id, "dashboard subscriber connected");

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = tokio::time::timeout(
                std::time::Duration::from_secs(HEARTBEAT_TIMEOUT_SECS),
                ws_rx.next(),
            ) => {
                match inbound {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        handle_dashboard_command(&state, &mut ws_tx, &text).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Err(_))) => break,
                    Ok(Some(Ok(_))) => {}
                    Err(_) => {
                        state.broadcaster.heartbeat().await;
                    }
                }
            }
        }
    }

    state.broadcaster.unsubscribe(id).await;
    info!(subscriber_id = id, "dashboard subscriber disconnected");
}

async fn handle_dashboard_command(
    state: &ServerState,
    ws_tx: &mut (impl futures_util::Sink<Message> + Unpin),
    text: &str,
) {
    use futures_util::SinkExt;

    let Ok(command) = serde_json::from_str::<DashboardInbound>(text) else {
        warn!("dropping malformed dashboard command");
        return;
    };
    match command {
        DashboardInbound::Ping => {
            let _ = ws_tx
                .send(Message::Text(dashboard::pong_frame().to_string().into()))
                .await;
        }
        DashboardInbound::SendLocation { call_sid, caller } => {
            state.location.send_now(&call_sid, &caller).await;
        }
        DashboardInbound::CancelLocation { call_sid } => {
            state.location.cancel(&call_sid).await;
        }
    }
}

/// Applies a single live-parameter mutation by dotted path (used by the CLI
/// and, potentially, a future operator tool). Returns an error for unknown
/// paths or out-of-range values.
pub fn apply_live_param(store: &RwLock<LiveParams>, path: &str, value: &str, source: &str) -> anyhow::Result<()> {
    let wrapped = LiveParamStore::new(store.read().unwrap().clone());
    match path {
        "audio.silence_duration_ms" => wrapped.set_silence_duration_ms(value.parse()?, source)?,
        "audio.min_speech_duration_ms" => wrapped.set_min_speech_duration_ms(value.parse()?, source)?,
        "audio.silence_threshold" => wrapped.set_silence_threshold(value.parse()?, source)?,
        "llm.model" => wrapped.set_llm_model(value.to_string(), source)?,
        "llm.max_tokens" => wrapped.set_llm_max_tokens(value.parse()?, source)?,
        "llm.context_turns" => wrapped.set_context_turns(value.parse()?, source)?,
        "tts.voice" => wrapped.set_tts_voice(value.to_string(), source)?,
        "tts.speed" => wrapped.set_tts_speed(value.parse()?, source)?,
        "analytics.confidence_threshold" => wrapped.set_confidence_threshold(value.parse()?, source)?,
        other => anyhow::bail!("unknown live parameter path: {other}"),
    }
    *store.write().unwrap() = wrapped.snapshot();
    Ok(())
}
