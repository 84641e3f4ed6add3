//! Defines the WebSocket message protocol between the browser client and the relay.

use serde::{Deserialize, Serialize};

/// Voice parameters a client may pass with `init_conversation`.
///
/// Missing fields fall back to the defaults below, so a partial object is accepted.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.8,
            style: 0.0,
            use_speaker_boost: true,
        }
    }
}

/// Messages sent from the client (browser) to the relay.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the upstream conversation for this session.
    InitConversation {
        agent_id: String,
        voice_settings: Option<VoiceSettings>,
    },
    /// A user text turn to forward upstream.
    SendText { text: String },
    /// A base64 encoded chunk of user audio to forward upstream.
    SendAudio { audio: String },
    /// Closes the upstream conversation and ends the session.
    EndConversation,
    /// Any other `type`. Ignored by the relay.
    #[serde(other)]
    Unknown,
}

/// Messages sent from the relay to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greets a freshly accepted client with its session id.
    Connected {
        #[serde(rename = "clientId")]
        client_id: String,
        message: String,
    },
    /// The upstream handshake completed.
    ElevenlabsConnected { message: String },
    /// The upstream socket closed.
    ElevenlabsDisconnected { message: String },
    /// A structured upstream event, forwarded verbatim.
    ElevenlabsMessage { data: serde_json::Value },
    /// Raw upstream audio, base64 encoded.
    AudioChunk { audio: String },
    TextSent { message: String },
    AudioSent { message: String },
    ConversationEnded { message: String },
    /// Reports a recoverable, per-session failure.
    Error { message: String },
}

impl ServerMessage {
    pub fn connected(client_id: impl Into<String>) -> Self {
        Self::Connected {
            client_id: client_id.into(),
            message: "Connected to ElevenLabs proxy server".to_string(),
        }
    }

    pub fn elevenlabs_connected() -> Self {
        Self::ElevenlabsConnected {
            message: "Connected to ElevenLabs".to_string(),
        }
    }

    pub fn elevenlabs_disconnected() -> Self {
        Self::ElevenlabsDisconnected {
            message: "ElevenLabs connection closed".to_string(),
        }
    }

    pub fn text_sent() -> Self {
        Self::TextSent {
            message: "Text sent to ElevenLabs".to_string(),
        }
    }

    pub fn audio_sent() -> Self {
        Self::AudioSent {
            message: "Audio sent to ElevenLabs".to_string(),
        }
    }

    pub fn conversation_ended() -> Self {
        Self::ConversationEnded {
            message: "Conversation ended".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
