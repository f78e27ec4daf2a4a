//! HTTP surfaces of a server bus.
//!
//! - `GET /__devtools/ws`: socket upgrade, bidirectional
//! - `GET /__devtools/sse`: `text/event-stream`, server to client
//! - `POST /__devtools/send`: one envelope, client to server
//! - `GET /__devtools/health`: liveness and connection count

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use devbus_core::constants::{HEALTH_PATH, SEND_PATH, SSE_PATH, WS_PATH};
use devbus_core::{CodecError, DebugLog, Envelope, LocalDispatcher};
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::broadcast::{ConnectionSet, ConsumerGuard};
use crate::connection::{CONSUMER_QUEUE, Consumer, ConsumerKind};

/// Every path a bus claims on its host server.
pub const BUS_PATHS: [&str; 4] = [WS_PATH, SSE_PATH, SEND_PATH, HEALTH_PATH];

/// Shared state accessible from the bus handlers.
#[derive(Clone)]
pub struct BusState {
    /// Live consumers.
    pub connections: Arc<ConnectionSet>,
    /// Dispatcher that accepted envelopes are re-published into.
    pub target: Arc<LocalDispatcher>,
    /// Debug channel.
    pub log: DebugLog,
    /// When the bus started.
    pub started_at: Instant,
}

impl BusState {
    /// Fan `envelope` out to every consumer but `origin`, then publish it locally.
    pub fn accept(&self, envelope: &Envelope, origin: Option<&str>) -> usize {
        match envelope.encode() {
            Ok(json) => self.deliver(Arc::new(json), envelope, origin),
            Err(e) => {
                warn!(event_type = %envelope.event_type, error = %e, "failed to encode envelope");
                0
            }
        }
    }

    /// Validate a raw frame and fan it out unchanged.
    ///
    /// Peers receive the exact text the producer sent; decoding only checks
    /// the frame and feeds the local publish.
    pub fn accept_frame(&self, frame: &str, origin: Option<&str>) -> Result<usize, CodecError> {
        let envelope = Envelope::decode(frame)?;
        Ok(self.deliver(Arc::new(frame.to_owned()), &envelope, origin))
    }

    fn deliver(&self, frame: Arc<String>, envelope: &Envelope, origin: Option<&str>) -> usize {
        let delivered = self.connections.fan_out(&frame, origin);
        debug!(event_type = %envelope.event_type, delivered, "fanned out envelope");
        self.log.log(format_args!(
            "fan-out {} to {delivered} consumer(s)",
            envelope.event_type
        ));
        self.target.publish(envelope);
        delivered
    }
}

/// Optional peer identification on every surface.
#[derive(Debug, Default, Deserialize)]
pub struct PeerQuery {
    /// Peer-chosen identity; fan-out skips it for its own frames.
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the bus is mounted.
    pub status: &'static str,
    /// Current consumer count.
    pub connections: usize,
    /// Seconds since the bus started.
    pub uptime_secs: u64,
}

/// Build the bus router.
pub fn router(state: BusState) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_handler))
        .route(SSE_PATH, get(sse_handler))
        .route(SEND_PATH, post(send_handler))
        .route(HEALTH_PATH, get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// GET /__devtools/health
async fn health_handler(State(state): State<BusState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.connections.connection_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// POST /__devtools/send
async fn send_handler(
    Query(peer): Query<PeerQuery>,
    State(state): State<BusState>,
    body: Bytes,
) -> Response {
    let accepted = std::str::from_utf8(&body)
        .map_err(|_| CodecError::InvalidUtf8)
        .and_then(|frame| state.accept_frame(frame, peer.client_id.as_deref()));
    match accepted {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => {
            debug!(error = %e, len = body.len(), "dropping malformed POST body");
            state.log.log(format_args!("dropped malformed POST body: {e}"));
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

/// GET /__devtools/sse
async fn sse_handler(
    Query(peer): Query<PeerQuery>,
    State(state): State<BusState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Arc<String>>(CONSUMER_QUEUE);
    let id = state
        .connections
        .add(Consumer::new(ConsumerKind::EventStream, peer.client_id, tx));
    state.log.log(format_args!("event-stream subscriber {id} opened"));
    let guard = ConsumerGuard::new(Arc::clone(&state.connections), id);

    let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let frame = rx.recv().await?;
        let event = Event::default().data(frame.as_str());
        Some((Ok::<_, Infallible>(event), (rx, guard)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /__devtools/ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(peer): Query<PeerQuery>,
    State(state): State<BusState>,
) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, peer.client_id, state))
}

/// Run one socket peer from upgrade through disconnect.
///
/// The writer drains the consumer queue; the reader decodes inbound text
/// frames and fans them out. Whichever side finishes first ends the peer.
async fn run_socket(socket: WebSocket, peer: Option<String>, state: BusState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CONSUMER_QUEUE);

    let consumer = Consumer::new(ConsumerKind::Socket, peer, tx);
    let origin = consumer.origin().to_owned();
    let id = state.connections.add(consumer);
    info!(conn_id = %id, "socket peer connected");
    state.log.log(format_args!("socket peer {id} connected"));
    let _guard = ConsumerGuard::new(Arc::clone(&state.connections), id.clone());

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Text(frame.as_str().to_owned().into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_state = state.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let text = match msg {
                Message::Text(ref t) => t.as_str().to_owned(),
                Message::Binary(ref data) => match std::str::from_utf8(data) {
                    Ok(s) => s.to_owned(),
                    Err(_) => {
                        debug!(len = data.len(), "dropping non-UTF8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if let Err(e) = reader_state.accept_frame(&text, Some(&origin)) {
                debug!(error = %e, "dropping malformed socket frame");
                reader_state
                    .log
                    .log(format_args!("dropped malformed socket frame: {e}"));
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    info!(conn_id = %id, "socket peer disconnected");
    state.log.log(format_args!("socket peer {id} disconnected"));
}
