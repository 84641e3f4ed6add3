//! Per-client relay state and the registry that owns it.

use super::{
    protocol::{ServerMessage, VoiceSettings},
    provider::UpstreamHandle,
    session::ClientHandle,
};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque, hash_map::Entry};
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound on buffered upstream audio frames per session.
pub const RECENT_AUDIO_FRAMES: usize = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} already exists")]
    DuplicateSession(String),
}

/// The most recent upstream audio frames of a session, oldest first.
#[derive(Debug, Default)]
pub struct RecentAudio {
    frames: VecDeque<Bytes>,
}

impl RecentAudio {
    /// Appends a frame, evicting the oldest ones beyond [`RECENT_AUDIO_FRAMES`].
    pub fn push(&mut self, frame: Bytes) {
        self.frames.push_back(frame);
        while self.frames.len() > RECENT_AUDIO_FRAMES {
            self.frames.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.frames.iter()
    }

    pub fn total_bytes(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum()
    }
}

/// Relay state for one connected client.
#[derive(Debug)]
pub struct Session {
    id: String,
    client: ClientHandle,
    upstream: Option<UpstreamHandle>,
    /// Generation of the most recently requested upstream connection, 0 if none.
    pub upstream_generation: u64,
    connected: bool,
    pub voice_settings: VoiceSettings,
    pub recent_audio: RecentAudio,
    last_activity: Instant,
}

impl Session {
    fn new(id: String, client: ClientHandle, now: Instant) -> Self {
        Self {
            id,
            client,
            upstream: None,
            upstream_generation: 0,
            connected: false,
            voice_settings: VoiceSettings::default(),
            recent_audio: RecentAudio::default(),
            last_activity: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queues a message for the client. Dropped silently once the client socket is gone.
    pub fn notify(&self, message: ServerMessage) {
        self.client.send(message);
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The upstream handle, but only while the handshake has completed and the socket is open.
    pub fn connected_upstream(&self) -> Option<&UpstreamHandle> {
        self.upstream.as_ref().filter(|_| self.connected)
    }

    pub fn attach_upstream(&mut self, upstream: UpstreamHandle) {
        self.upstream = Some(upstream);
        self.connected = true;
    }

    /// Takes the upstream handle out of the session and marks it disconnected.
    pub fn detach_upstream(&mut self) -> Option<UpstreamHandle> {
        self.connected = false;
        self.upstream.take()
    }
}

/// All live sessions, keyed by session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        id: String,
        client: ClientHandle,
        now: Instant,
    ) -> Result<&mut Session, RegistryError> {
        match self.sessions.entry(id) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateSession(entry.key().clone())),
            Entry::Vacant(entry) => {
                let id = entry.key().clone();
                Ok(entry.insert(Session::new(id, client, now)))
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Removes a session. Returns `None` if it was already gone.
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of sessions whose last client activity is strictly older than `idle_timeout`.
    pub fn idle_sessions(&self, now: Instant, idle_timeout: Duration) -> Vec<String> {
        self.sessions
            .values()
            .filter(|session| now.saturating_duration_since(session.last_activity) > idle_timeout)
            .map(|session| session.id.clone())
            .collect()
    }
}
