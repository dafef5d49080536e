//! Connection handlers for the Confide server.
//!
//! This module handles the connection lifecycle and event processing.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
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
use bytes::BytesMut;
use confide_core::{ConnectionHub, ConnectionId, EventSink, Relay};
use confide_protocol::codec::{self, ProtocolError, LENGTH_PREFIX_SIZE};
use confide_protocol::{ClientEvent, ServerEvent};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Wire type for undecodable inbound frames.
const INVALID_MESSAGE: &str = "invalid-message";

/// Shared server state.
pub struct AppState {
    /// The signaling relay.
    pub relay: Arc<Relay>,
    /// Outbound queues of live sockets.
    pub hub: Arc<ConnectionHub>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub = Arc::new(ConnectionHub::new());
        let sink: Arc<dyn EventSink> = hub.clone();
        let relay = Arc::new(Relay::with_config(sink, config.relay_config()));

        Self { relay, hub, config }
    }
}

/// Response body for `GET /status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Registered peers attached to a live connection.
    pub connected_peer_count: usize,
    /// Confidants currently listed as available.
    pub available_confidant_count: usize,
    /// Open WebSocket connections, registered or not.
    pub active_connection_count: usize,
}

/// Encoding the client last spoke; replies use the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Text,
    Binary,
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let _supervisor = state.relay.spawn_supervisor();

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Confide server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Presence counters.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let stats = state.relay.stats();
    metrics::set_relay_stats(&stats);

    Json(StatusResponse {
        connected_peer_count: stats.registry.attached_peers,
        available_confidant_count: stats.registry.available_confidants,
        active_connection_count: state.hub.len(),
    })
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if state.hub.len() >= state.config.limits.max_connections {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached, refusing upgrade"
        );
        metrics::record_rejected_connection();
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut outbound = state.hub.attach(connection_id.clone());
    let mut encoding = Encoding::Text;

    let connected = ServerEvent::connected(
        connection_id.as_str(),
        u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX),
    );
    if send_event(&mut sender, &connected, encoding).await.is_err() {
        error!(connection = %connection_id, "Failed to send connected event");
        state.hub.detach(&connection_id);
        return;
    }

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);
    let max_message_size = state.config.limits.max_message_size;

    let period = state.config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            biased;

            // Events routed to this connection by the relay
            Some(event) = outbound.recv() => {
                if send_event(&mut sender, &event, encoding).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        encoding = Encoding::Text;
                        let decoded = if text.len() > max_message_size {
                            Err(oversize(text.len(), max_message_size))
                        } else {
                            codec::decode_text::<ClientEvent>(&text).map_err(|e| e.to_string())
                        };

                        let delivered = match decoded {
                            Ok(event) => {
                                handle_event(&state, &connection_id, event);
                                true
                            }
                            Err(reason) => {
                                reject_frame(&mut sender, &connection_id, "text", reason, encoding).await
                            }
                        };
                        if !delivered {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::Binary;
                        read_buffer.extend_from_slice(&data);

                        let mut delivered = true;
                        for decoded in drain_binary(&mut read_buffer, max_message_size) {
                            match decoded {
                                Ok(event) => handle_event(&state, &connection_id, event),
                                Err(reason) => {
                                    delivered = reject_frame(
                                        &mut sender,
                                        &connection_id,
                                        "binary",
                                        reason,
                                        encoding,
                                    )
                                    .await;
                                    if !delivered {
                                        break;
                                    }
                                }
                            }
                        }
                        if !delivered {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        state.relay.touch(&connection_id);
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.relay.touch(&connection_id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub.detach(&connection_id);
    state.relay.disconnect(&connection_id);
    metrics::set_relay_stats(&state.relay.stats());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Run one decoded event through the relay.
fn handle_event(state: &AppState, connection_id: &ConnectionId, event: ClientEvent) {
    metrics::record_event(event.name(), "inbound");
    let start = Instant::now();

    if let Err(e) = state.relay.handle(connection_id, event) {
        metrics::record_relay_error(e.kind());
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
    metrics::set_relay_stats(&state.relay.stats());
}

/// Decode every complete frame in the buffer.
///
/// A frame declaring more than `max_size` bytes discards the buffer, since
/// the stream can no longer be resynchronised.
fn drain_binary(buf: &mut BytesMut, max_size: usize) -> Vec<Result<ClientEvent, String>> {
    let mut decoded = Vec::new();

    loop {
        if buf.len() >= LENGTH_PREFIX_SIZE {
            let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            if length > max_size {
                buf.clear();
                decoded.push(Err(oversize(length, max_size)));
                break;
            }
        }

        match codec::decode_from::<ClientEvent>(buf) {
            Ok(Some(event)) => decoded.push(Ok(event)),
            Ok(None) => break,
            Err(e @ ProtocolError::FrameTooLarge(_)) => {
                buf.clear();
                decoded.push(Err(e.to_string()));
                break;
            }
            Err(e) => decoded.push(Err(e.to_string())),
        }
    }

    decoded
}

fn oversize(size: usize, limit: usize) -> String {
    format!("Message size {} exceeds limit {}", size, limit)
}

/// Report an undecodable frame to the client. Returns false if the socket is gone.
async fn reject_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    connection_id: &ConnectionId,
    kind: &'static str,
    reason: String,
    encoding: Encoding,
) -> bool {
    debug!(connection = %connection_id, encoding = kind, reason = %reason, "Invalid frame");
    metrics::record_invalid_frame(kind);

    let event = ServerEvent::error(INVALID_MESSAGE, reason);
    send_event(sender, &event, encoding).await.is_ok()
}

/// Send an event to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    encoding: Encoding,
) -> Result<()> {
    let message = match encoding {
        Encoding::Text => Message::Text(codec::encode_text(event)?),
        Encoding::Binary => Message::Binary(codec::encode_binary(event)?.to_vec()),
    };
    metrics::record_event(event.name(), "outbound");
    sender.send(message).await?;
    Ok(())
}
