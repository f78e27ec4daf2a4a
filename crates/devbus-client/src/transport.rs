//! Transport strategies for reaching a server bus.
//!
//! A [`TransportStrategy`] opens one connection and hands back an
//! [`ActiveTransport`]: a non-blocking outbound queue plus a cancellation
//! token that fires when the connection ends, whichever side ends it.
//! Inbound envelopes are delivered to the [`InboundHandler`] passed to
//! `connect`. Frames the I/O side could not deliver are parked on the
//! transport's unsent list so the bus can queue them again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devbus_core::Envelope;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, warn};

use crate::config::ClientBusConfig;
use crate::errors::{Result, TransportError};
use crate::sse::parse_sse_events;

/// Handshake deadline for every strategy.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives envelopes decoded from the remote side.
pub type InboundHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Frames accepted by [`ActiveTransport::send`] that never reached the server.
pub type UnsentFrames = Arc<Mutex<Vec<String>>>;

/// Which wire a transport uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Bidirectional socket.
    WebSocket,
    /// Event stream inbound, one POST per outbound envelope.
    EventStream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WebSocket => "websocket",
            Self::EventStream => "event-stream",
        })
    }
}

/// One way of opening a connection to a server bus.
#[async_trait]
pub trait TransportStrategy: Send + Sync {
    /// Wire used by this strategy.
    fn kind(&self) -> TransportKind;

    /// Open a connection identified as `client_id`.
    async fn connect(
        &self,
        config: &ClientBusConfig,
        client_id: &str,
        inbound: InboundHandler,
    ) -> Result<ActiveTransport>;
}

/// Socket first, then event stream plus POST.
pub fn default_strategies() -> Vec<Arc<dyn TransportStrategy>> {
    vec![Arc::new(WebSocketStrategy), Arc::new(SseStrategy::new())]
}

/// An open connection.
pub struct ActiveTransport {
    kind: TransportKind,
    outbound: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
    unsent: UnsentFrames,
}

impl ActiveTransport {
    /// Wrap an outbound frame queue and its close signal.
    ///
    /// The I/O side must cancel `closed` when the connection ends and stop
    /// when it is cancelled.
    pub fn new(
        kind: TransportKind,
        outbound: mpsc::UnboundedSender<String>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            kind,
            outbound,
            closed,
            unsent: UnsentFrames::default(),
        }
    }

    /// Queue `envelope` for sending. Never waits on the network.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = envelope.encode()?;
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    /// Shut the connection down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has ended.
    pub fn closed(&self) -> WaitForCancellationFutureOwned {
        self.closed.clone().cancelled_owned()
    }

    /// Wire in use.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Where the I/O side parks frames it failed to deliver, in send order.
    pub fn unsent_sink(&self) -> UnsentFrames {
        Arc::clone(&self.unsent)
    }

    /// Drain the undelivered frames as envelopes, oldest first.
    pub fn take_unsent(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.unsent.lock())
            .iter()
            .filter_map(|frame| Envelope::decode(frame).ok())
            .collect()
    }
}

impl fmt::Debug for ActiveTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTransport")
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .field("unsent", &self.unsent.lock().len())
            .finish_non_exhaustive()
    }
}

impl Drop for ActiveTransport {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn deliver(inbound: &InboundHandler, frame: &str) {
    match Envelope::decode(frame) {
        Ok(envelope) => inbound(envelope),
        Err(e) => debug!(error = %e, "dropping malformed inbound frame"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// `ws://host:port/__devtools/ws` via `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketStrategy;

#[async_trait]
impl TransportStrategy for WebSocketStrategy {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn connect(
        &self,
        config: &ClientBusConfig,
        client_id: &str,
        inbound: InboundHandler,
    ) -> Result<ActiveTransport> {
        let url = config.ws_url(client_id);
        let ws = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                return Err(TransportError::WebSocket {
                    url,
                    source: Box::new(e),
                });
            }
            Err(_) => return Err(TransportError::Timeout { url }),
        };
        debug!(%url, "websocket connected");

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let closed = CancellationToken::new();
        let token = closed.clone();

        let _task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Some(frame) = rx.recv() => {
                        if let Err(e) = sink.send(Message::text(frame)).await {
                            debug!(error = %e, "websocket write failed");
                            break;
                        }
                    }
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => deliver(&inbound, text.as_str()),
                        Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                            Ok(text) => deliver(&inbound, text),
                            Err(_) => debug!("dropping non-UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(error = %e, "websocket read failed");
                            break;
                        }
                        Some(Ok(_)) => {}
                    },
                }
            }
            token.cancel();
        });

        Ok(ActiveTransport::new(TransportKind::WebSocket, tx, closed))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event stream + POST
// ─────────────────────────────────────────────────────────────────────────────

/// `GET /__devtools/sse` inbound, `POST /__devtools/send` outbound.
///
/// POSTs go out one at a time from a single writer task so the server
/// sees them in send order.
#[derive(Clone, Debug)]
pub struct SseStrategy {
    http: reqwest::Client,
}

impl SseStrategy {
    /// Strategy with a fresh HTTP client.
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Strategy sharing an existing HTTP client.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Default for SseStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportStrategy for SseStrategy {
    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    async fn connect(
        &self,
        config: &ClientBusConfig,
        client_id: &str,
        inbound: InboundHandler,
    ) -> Result<ActiveTransport> {
        let url = config.sse_url(client_id);
        let request = self
            .http
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send();
        let response = match tokio::time::timeout(CONNECT_TIMEOUT, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => return Err(TransportError::Http { url, source }),
            Err(_) => return Err(TransportError::Timeout { url }),
        };
        if !response.status().is_success() {
            return Err(TransportError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        debug!(%url, "event stream connected");

        let closed = CancellationToken::new();

        let reader_token = closed.clone();
        let events = parse_sse_events(Box::pin(response.bytes_stream()));
        let _reader = tokio::spawn(async move {
            let mut events = std::pin::pin!(events);
            loop {
                tokio::select! {
                    () = reader_token.cancelled() => break,
                    next = events.next() => match next {
                        Some(data) => deliver(&inbound, &data),
                        None => break,
                    },
                }
            }
            reader_token.cancel();
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let transport = ActiveTransport::new(TransportKind::EventStream, tx, closed.clone());
        let unsent = transport.unsent_sink();
        let writer_token = closed;
        let http = self.http.clone();
        let send_url = config.send_url(client_id);
        let _writer = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = writer_token.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let posted = http
                    .post(&send_url)
                    .header(CONTENT_TYPE, "application/json")
                    .body(frame.clone())
                    .send()
                    .await;
                match posted {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) if resp.status().is_client_error() => {
                        warn!(status = resp.status().as_u16(), "server rejected event");
                    }
                    failed => {
                        match failed {
                            Ok(resp) => warn!(status = resp.status().as_u16(), "event POST failed"),
                            Err(e) => warn!(error = %e, "event POST failed"),
                        }
                        // Later sends fail and get queued by the bus; park the
                        // rest before signalling close so the bus sees them.
                        rx.close();
                        {
                            let mut parked = unsent.lock();
                            parked.push(frame);
                            while let Ok(rest) = rx.try_recv() {
                                parked.push(rest);
                            }
                        }
                        writer_token.cancel();
                        break;
                    }
                }
            }
        });

        Ok(transport)
    }
}
