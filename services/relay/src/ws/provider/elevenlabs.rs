//! Handles the real-time WebSocket connection to ElevenLabs Conversational AI.

use super::{
    OpenRequest, UpstreamCommand, UpstreamConnector, UpstreamError, UpstreamEvent,
    UpstreamEvents, UpstreamHandle,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Error as WsError,
        client::IntoClientRequest,
        handshake::client::Request,
        http::HeaderValue,
        protocol::Message as WsMessage,
    },
};
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::Url;

const API_KEY_HEADER: &str = "xi-api-key";

/// Opens ElevenLabs conversation sockets authenticated with a single API key.
pub struct ElevenLabsConnector {
    base_url: String,
    api_key: SecretString,
}

impl ElevenLabsConnector {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
        }
    }

    /// Builds the handshake request: `<base_url>?agent_id=<id>` plus the credential header.
    fn build_request(&self, agent_id: &str) -> Result<Request, UpstreamError> {
        let url = Url::parse_with_params(&self.base_url, &[("agent_id", agent_id)])
            .map_err(|e| UpstreamError::Request(e.to_string()))?;

        let mut request = url.as_str().into_client_request()?;
        let mut api_key = HeaderValue::from_str(self.api_key.expose_secret())
            .map_err(|e| UpstreamError::Request(format!("invalid API key header: {}", e)))?;
        api_key.set_sensitive(true);
        request.headers_mut().insert(API_KEY_HEADER, api_key);
        Ok(request)
    }
}

impl UpstreamConnector for ElevenLabsConnector {
    fn open(&self, request: OpenRequest, events: UpstreamEvents) {
        let ws_request = match self.build_request(&request.agent_id) {
            Ok(ws_request) => ws_request,
            Err(e) => {
                error!(session_id = %request.session_id, error = %e, "Failed to build ElevenLabs request.");
                events.emit(UpstreamEvent::OpenFailed(e.to_string()));
                return;
            }
        };

        debug!(
            session_id = %request.session_id,
            voice_settings = ?request.voice_settings,
            "Opening ElevenLabs conversation."
        );
        let span = info_span!(
            "elevenlabs",
            session_id = %request.session_id,
            agent_id = %request.agent_id,
            generation = request.generation
        );
        tokio::spawn(run(ws_request, events).instrument(span));
    }
}

/// Runs one upstream connection from handshake to close.
///
/// Emits `Opened` after the handshake, `Frame` for every data frame, `Error` on failure
/// and always finishes with `Closed`.
async fn run(request: Request, events: UpstreamEvents) {
    let ws_stream = match connect_async(request).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            error!(error = %e, "ElevenLabs handshake failed.");
            events.emit(UpstreamEvent::Error(e.to_string()));
            events.emit(UpstreamEvent::Closed);
            return;
        }
    };
    info!("ElevenLabs connected.");

    let (handle, mut commands) = UpstreamHandle::channel();
    events.emit(UpstreamEvent::Opened(handle));
    let (mut upstream_tx, mut upstream_rx) = ws_stream.split();

    let mut closing = false;
    loop {
        tokio::select! {
            command = commands.recv(), if !closing => match command {
                Some(UpstreamCommand::Send(payload)) => {
                    if let Err(e) = upstream_tx.send(WsMessage::Text(payload.into())).await {
                        error!(error = %e, "Failed to send to ElevenLabs.");
                        events.emit(UpstreamEvent::Error(e.to_string()));
                        break;
                    }
                }
                // A dropped handle means the session is gone; close just the same.
                Some(UpstreamCommand::Close) | None => {
                    closing = true;
                    if let Err(e) = upstream_tx.close().await {
                        debug!(error = %e, "ElevenLabs socket already closed.");
                        break;
                    }
                }
            },
            frame = upstream_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    events.emit(UpstreamEvent::Frame(Bytes::copy_from_slice(text.as_bytes())));
                }
                Some(Ok(WsMessage::Binary(data))) => events.emit(UpstreamEvent::Frame(data)),
                Some(Ok(WsMessage::Close(close_frame))) => {
                    info!(?close_frame, "ElevenLabs closed the connection.");
                }
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => break,
                Some(Err(e)) => {
                    warn!(error = %e, "Error reading from ElevenLabs.");
                    events.emit(UpstreamEvent::Error(e.to_string()));
                    break;
                }
                None => break,
            },
        }
    }

    info!("ElevenLabs disconnected.");
    events.emit(UpstreamEvent::Closed);
}
