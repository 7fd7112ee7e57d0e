use std::path::PathBuf;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use serde::Serialize;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::broadcast::StatsSnapshot;
use crate::ingest::{run_ingest, ProducerLimits};
use crate::payload::Payload;
use crate::producer::ProducerLease;
use crate::relay::Relay;
use crate::shutdown::{SessionRole, ShutdownCoordinator};

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub shutdown: ShutdownCoordinator,
    pub producer_limits: ProducerLimits,
}

impl AppState {
    pub fn new(relay: Relay, producer_limits: ProducerLimits) -> Self {
        Self {
            relay,
            shutdown: ShutdownCoordinator::new(),
            producer_limits,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.relay.stats())
}

/// `GET /stream`: the producer's ingest endpoint.
///
/// The producer slot is claimed before upgrading, so a second producer under
/// the exclusive policy gets a plain `409 Conflict` and never reaches the
/// relay.
async fn stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "relay is shutting down").into_response();
    }
    let lease = match state.relay.begin_ingest() {
        Ok(lease) => lease,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting producer");
            return (StatusCode::CONFLICT, e.to_string()).into_response();
        }
    };
    ws.max_message_size(state.producer_limits.max_message_bytes)
        .on_upgrade(move |socket| handle_producer(socket, state, lease))
}

async fn handle_producer(socket: WebSocket, state: AppState, lease: ProducerLease) {
    let (_guard, shutdown_rx) = state.shutdown.register(SessionRole::Producer);
    let limits = state.producer_limits;
    let (mut ws_tx, ws_rx) = socket.split();

    // The only thing the relay writes to a producer is pings. Their pongs
    // keep the ingest loop's idle deadline from expiring on a quiet but
    // healthy connection; a half-open one stops answering and gets dropped.
    let ping_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(limits.ping_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                break;
            }
        }
    });

    run_ingest(
        lease,
        ws_rx,
        state.relay.broadcaster(),
        limits.idle_timeout,
        shutdown_rx,
    )
    .await;
    ping_task.abort();
}

/// `GET /view`: the subscriber endpoint.
async fn view(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "relay is shutting down").into_response();
    }
    ws.on_upgrade(move |socket| handle_subscriber(socket, state))
}

async fn handle_subscriber(socket: WebSocket, state: AppState) {
    let (_guard, shutdown_rx) = state.shutdown.register(SessionRole::Subscriber);
    let (ws_tx, ws_rx) = socket.split();
    let sink = ws_tx.with(|payload: Payload| future::ready(Ok::<_, axum::Error>(payload.into_message())));

    let (session, writer) = state.relay.subscriber(sink);
    let reason = session.run(ws_rx, shutdown_rx).await;
    state.relay.record_close(&reason);

    // The writer exits promptly once the handle is closed; wait so the
    // transport is released before the session guard drops.
    if let Err(e) = writer.await {
        tracing::error!(connection = %session.handle().id(), "subscriber writer panicked: {}", e);
    }
}

pub fn router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/stream", get(stream))
        .route("/view", get(view));

    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
