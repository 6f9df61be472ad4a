use crate::config::AppConfig;
use crate::delivery::{ChannelSink, PullDelivery, PullError, StreamEvent, Transport, WireEvent};
use crate::model::{TopicError, TopicKey};
use crate::orchestrator::AnalyticsOrchestrator;
use crate::scheduler::TopicScheduler;
use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<AppConfig>,
    pub scheduler: Arc<TopicScheduler>,
    pub orchestrator: Arc<AnalyticsOrchestrator>,
    pub pull: Arc<PullDelivery>,
}

impl ServerState {
    pub fn new(
        config: Arc<AppConfig>,
        scheduler: Arc<TopicScheduler>,
        orchestrator: Arc<AnalyticsOrchestrator>,
    ) -> Self {
        let pull = Arc::new(PullDelivery::new(Arc::clone(&orchestrator)));
        Self {
            config,
            scheduler,
            orchestrator,
            pull,
        }
    }

    fn resolve_topic(&self, symbol: &str, expiry: &str) -> Result<TopicKey, ApiError> {
        let key = TopicKey::parse(symbol, expiry)?;
        self.config.check_topic(&key, Utc::now())?;
        Ok(key)
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

impl From<TopicError> for ApiError {
    fn from(err: TopicError) -> Self {
        match err {
            TopicError::UnsupportedSymbol(_) => ApiError::NotFound(err.to_string()),
            _ => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<PullError> for ApiError {
    fn from(err: PullError) -> Self {
        ApiError::Unavailable(err.to_string())
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/stream/{symbol}/{expiry}", get(stream_topic))
        .route("/api/v1/ws/{symbol}/{expiry}", get(ws_topic))
        .route("/api/v1/snapshot/{symbol}/{expiry}", get(snapshot_topic))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: ServerState, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    serve_on(listener, state, shutdown).await
}

pub async fn serve_on(
    listener: TcpListener,
    state: ServerState,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(target: "server", addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server failed")
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    let hub = state
        .scheduler
        .hub()
        .stats(stale_horizon(&state.config));
    Json(json!({
        "status": "ok",
        "service": "chain_pulse",
        "version": env!("CARGO_PKG_VERSION"),
        "hub": hub,
        "workers": state.scheduler.active_workers(),
        "cache": state.orchestrator.cache_stats(),
    }))
}

async fn snapshot_topic(
    State(state): State<ServerState>,
    Path((symbol, expiry)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let key = state.resolve_topic(&symbol, &expiry)?;
    let frame = state.pull.snapshot(&key).await?;
    Ok(Json(frame.as_ref()).into_response())
}

async fn stream_topic(
    State(state): State<ServerState>,
    Path((symbol, expiry)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let key = state.resolve_topic(&symbol, &expiry)?;
    let (sink, mut rx) =
        ChannelSink::channel(Transport::EventStream, state.config.subscriber_buffer);
    let guard = state.scheduler.subscribe(&key, Arc::new(sink));
    let heartbeat = state.config.broadcast_interval;
    info!(target: "server", topic = %key, id = guard.id(), "event stream opened");

    let stream = async_stream::stream! {
        // Dropped with the stream when the client goes away.
        let _guard = guard;
        loop {
            match tokio::time::timeout(heartbeat, rx.recv()).await {
                Ok(Some(event)) => yield Ok(sse_event(&event)),
                Ok(None) => break,
                Err(_) => yield Ok(Event::default().event("heartbeat").data("")),
            }
        }
    };
    Ok(Sse::new(stream))
}

fn sse_event(event: &StreamEvent) -> Event {
    let wire = WireEvent::from_stream(event);
    let named = Event::default().event(wire.name());
    match wire {
        WireEvent::Data(frame) => match serde_json::to_string(frame) {
            Ok(json) => named.data(json),
            Err(err) => Event::default().event("error").data(err.to_string()),
        },
        WireEvent::Error(msg) => named.data(msg),
        WireEvent::Heartbeat => named.data(""),
    }
}

async fn ws_topic(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    Path((symbol, expiry)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let key = state.resolve_topic(&symbol, &expiry)?;
    Ok(ws.on_upgrade(move |socket| push_session(socket, state, key)))
}

async fn push_session(socket: WebSocket, state: ServerState, key: TopicKey) {
    let (sink, mut rx) = ChannelSink::channel(Transport::Push, state.config.subscriber_buffer);
    let guard = state.scheduler.subscribe(&key, Arc::new(sink));
    let heartbeat = state.config.broadcast_interval;
    let (mut sender, mut receiver) = socket.split();
    info!(target: "server", topic = %key, id = guard.id(), "push client connected");

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            next = tokio::time::timeout(heartbeat, rx.recv()) => {
                let encoded = match next {
                    Ok(Some(event)) => serde_json::to_string(&WireEvent::from_stream(&event)),
                    Ok(None) => break,
                    Err(_) => serde_json::to_string(&WireEvent::Heartbeat),
                };
                let text = match encoded {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target: "server", topic = %key, error = %err, "failed to encode event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    debug!(target: "server", topic = %key, "push send failed");
                    break;
                }
            }
        }
    }
    info!(target: "server", topic = %key, id = guard.id(), "push client disconnected");
}

fn stale_horizon(config: &AppConfig) -> chrono::Duration {
    chrono::Duration::from_std(config.broadcast_interval * 3)
        .unwrap_or_else(|_| chrono::Duration::seconds(60))
}
