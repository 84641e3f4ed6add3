//! Manages the client-facing WebSocket connection for one relay session.
//!
//! Each socket is split in two: a writer task drains the session's outbound queue into
//! the socket, and the reader loop below feeds inbound frames to the relay task. The
//! relay task owns the [`ClientHandle`]; once it drops the handle (session ended) the
//! writer sends a close frame and the reader loop exits.

use super::{protocol::ServerMessage, relay::RelayHandle};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{Instrument, debug, info, instrument, trace, warn};
use uuid::Uuid;

/// The relay's side of a client socket: a queue of outbound messages.
#[derive(Debug)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientHandle {
    /// Creates a handle plus the queue a socket writer should drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues a message. Skipped silently if the socket is no longer open.
    pub fn send(&self, message: ServerMessage) {
        if self.tx.send(message).is_err() {
            trace!("Client socket is closed, dropping outbound message.");
        }
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Axum handler to upgrade an HTTP connection to a relay WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    upgrade(ws, state)
}

pub(crate) fn upgrade(ws: WebSocketUpgrade, state: Arc<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual client connection.
///
/// Assigns the session id, registers the session with the relay and pumps frames until
/// either side goes away.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4().simple().to_string();
    tracing::Span::current().record("session_id", session_id.as_str());
    let _client_guard = state.track_client();
    info!("Client connected.");

    let (socket_tx, socket_rx) = socket.split();
    let (client, outbound) = ClientHandle::channel();
    let mut writer = tokio::spawn(write_outbound(socket_tx, outbound).in_current_span());

    state.relay.client_connected(session_id.clone(), client);
    read_inbound(&state.relay, &session_id, socket_rx, &mut writer).await;
    state.relay.client_disconnected(session_id);
    info!("Client disconnected.");
}

/// Forwards inbound client frames to the relay until the socket or the writer finishes.
async fn read_inbound(
    relay: &RelayHandle,
    session_id: &str,
    mut socket_rx: SplitStream<WebSocket>,
    writer: &mut JoinHandle<()>,
) {
    loop {
        tokio::select! {
            frame = socket_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    relay.client_frame(session_id.to_string(), Bytes::copy_from_slice(text.as_str().as_bytes()));
                }
                Some(Ok(Message::Binary(data))) => relay.client_frame(session_id.to_string(), data),
                Some(Ok(Message::Close(close_frame))) => {
                    info!(?close_frame, "Client sent close frame.");
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    warn!(error = ?e, "Error receiving from client WebSocket.");
                    break;
                }
                None => break,
            },
            _ = &mut *writer => {
                debug!("Outbound stream finished, closing client session.");
                break;
            }
        }
    }
}

/// Drains outbound messages into the socket, then closes it once the session is dropped.
async fn write_outbound(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = send_msg(&mut socket_tx, message).await {
            debug!(error = ?e, "Client socket closed, stopping writer.");
            return;
        }
    }

    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static("session closed"),
    }));
    if let Err(e) = socket_tx.send(close).await {
        trace!(error = ?e, "Client socket already closed.");
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
