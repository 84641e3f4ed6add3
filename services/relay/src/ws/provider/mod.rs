//! Manages the upstream WebSocket connection to the conversational voice API.
//!
//! A connector only starts connections. Everything that happens afterwards
//! (handshake result, inbound frames, close, errors) comes back to the relay
//! task as [`UpstreamEvent`]s tagged with the session id and the connection
//! generation, and the relay talks to a live connection through an
//! [`UpstreamHandle`].

pub mod elevenlabs;

use super::{protocol::VoiceSettings, relay::RelayEvent};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

pub use elevenlabs::ElevenLabsConnector;

/// Errors raised while talking to the upstream voice API.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid base64 audio: {0}")]
    InvalidAudio(#[from] base64::DecodeError),
    #[error("upstream connection task has stopped")]
    ChannelClosed,
    #[error("failed to serialize upstream message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid upstream request: {0}")]
    Request(String),
    #[error("upstream websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Everything a connector needs to open one upstream conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub session_id: String,
    pub generation: u64,
    pub agent_id: String,
    pub voice_settings: VoiceSettings,
}

/// Starts upstream connections without blocking the relay task.
pub trait UpstreamConnector: Send + Sync + 'static {
    /// Begins connecting and returns immediately. The outcome is reported through `events`.
    fn open(&self, request: OpenRequest, events: UpstreamEvents);
}

/// Lifecycle and data events emitted by an upstream connection.
#[derive(Debug)]
pub enum UpstreamEvent {
    /// The handshake completed and the connection accepts commands.
    Opened(UpstreamHandle),
    /// A text or binary frame arrived.
    Frame(Bytes),
    /// The connection is gone. Always the last event of a connection that got past `open`.
    Closed,
    /// The handshake or the running connection failed.
    Error(String),
    /// The connection could not even be attempted.
    OpenFailed(String),
}

/// Sender for one connection's events, pre-tagged with its session and generation.
#[derive(Debug, Clone)]
pub struct UpstreamEvents {
    session_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl UpstreamEvents {
    pub fn new(session_id: String, generation: u64, tx: mpsc::UnboundedSender<RelayEvent>) -> Self {
        Self {
            session_id,
            generation,
            tx,
        }
    }

    pub fn emit(&self, event: UpstreamEvent) {
        let event = RelayEvent::Upstream {
            session_id: self.session_id.clone(),
            generation: self.generation,
            event,
        };
        if self.tx.send(event).is_err() {
            trace!(session_id = %self.session_id, "Relay task is gone, dropping upstream event.");
        }
    }
}

/// Commands the relay issues to a running upstream connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamCommand {
    /// Send a JSON text frame.
    Send(String),
    /// Start the closing handshake.
    Close,
}

/// The user input envelope the upstream expects. Exactly one field is set.
#[derive(Serialize, Debug)]
struct UserInput<'a> {
    user_audio_chunk: Option<&'a str>,
    user_message: Option<&'a str>,
}

/// The relay's side of an open upstream connection.
///
/// Dropping the last handle closes the connection.
#[derive(Debug)]
pub struct UpstreamHandle {
    tx: mpsc::UnboundedSender<UpstreamCommand>,
}

impl UpstreamHandle {
    /// Creates a handle plus the command stream a connection task should drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UpstreamCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues a user text turn. Fire-and-forget: `Ok` means queued, not delivered.
    pub fn send_text(&self, text: &str) -> Result<(), UpstreamError> {
        self.send_input(&UserInput {
            user_audio_chunk: None,
            user_message: Some(text),
        })
    }

    /// Validates a base64 audio chunk and queues it, re-encoded, as user audio.
    pub fn send_audio(&self, audio_base64: &str) -> Result<(), UpstreamError> {
        use base64::Engine;
        let engine = base64::engine::general_purpose::STANDARD;
        let pcm = engine.decode(audio_base64)?;
        let encoded = engine.encode(&pcm);
        self.send_input(&UserInput {
            user_audio_chunk: Some(&encoded),
            user_message: None,
        })
    }

    fn send_input(&self, input: &UserInput<'_>) -> Result<(), UpstreamError> {
        let payload = serde_json::to_string(input)?;
        self.tx
            .send(UpstreamCommand::Send(payload))
            .map_err(|_| UpstreamError::ChannelClosed)
    }

    /// Asks the connection to close. Safe to call on an already closed connection.
    pub fn close(&self) {
        let _ = self.tx.send(UpstreamCommand::Close);
    }
}

/// An upstream frame after classification.
#[derive(Debug, PartialEq)]
pub enum UpstreamPayload {
    /// Structured event data, forwarded to the client as-is.
    Control(serde_json::Value),
    /// Anything that is not JSON is treated as raw audio.
    Audio(Bytes),
}

/// Splits upstream frames into control messages and audio.
///
/// There is no framing byte: a frame that parses as JSON is control, everything else is audio.
pub fn classify_frame(frame: Bytes) -> UpstreamPayload {
    match serde_json::from_slice::<serde_json::Value>(&frame) {
        Ok(value) => UpstreamPayload::Control(value),
        Err(_) => UpstreamPayload::Audio(frame),
    }
}
