//! The relay task: the single owner of every session.
//!
//! Client sockets, upstream sockets and the idle-sweep timer all report to one task
//! through a single channel. Events are handled one at a time, so the session registry
//! needs no locking and a session's fields are never touched concurrently.

use super::{
    lifecycle,
    protocol::{ClientMessage, ServerMessage, VoiceSettings},
    provider::{
        OpenRequest, UpstreamConnector, UpstreamEvent, UpstreamEvents, UpstreamPayload,
        classify_frame,
    },
    registry::SessionRegistry,
    session::ClientHandle,
};
use crate::config::LifecycleSettings;
use base64::Engine;
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Everything the relay task reacts to.
#[derive(Debug)]
pub enum RelayEvent {
    ClientConnected {
        session_id: String,
        client: ClientHandle,
    },
    /// A raw inbound client frame, parsed by the relay task.
    ClientFrame { session_id: String, payload: Bytes },
    ClientDisconnected { session_id: String },
    Upstream {
        session_id: String,
        generation: u64,
        event: UpstreamEvent,
    },
}

/// Cloneable entry point used by client sockets to reach the relay task.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayHandle {
    pub fn client_connected(&self, session_id: String, client: ClientHandle) {
        self.send(RelayEvent::ClientConnected { session_id, client });
    }

    pub fn client_frame(&self, session_id: String, payload: Bytes) {
        self.send(RelayEvent::ClientFrame {
            session_id,
            payload,
        });
    }

    pub fn client_disconnected(&self, session_id: String) {
        self.send(RelayEvent::ClientDisconnected { session_id });
    }

    fn send(&self, event: RelayEvent) {
        if self.tx.send(event).is_err() {
            warn!("Relay task has stopped, dropping client event.");
        }
    }
}

pub struct Relay {
    registry: SessionRegistry,
    connector: Arc<dyn UpstreamConnector>,
    events: mpsc::WeakUnboundedSender<RelayEvent>,
    idle_timeout: Duration,
    last_generation: u64,
}

impl Relay {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        idle_timeout: Duration,
        events: &mpsc::UnboundedSender<RelayEvent>,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            connector,
            events: events.downgrade(),
            idle_timeout,
            last_generation: 0,
        }
    }

    /// Spawns the relay task and returns the handle client sockets use to reach it.
    pub fn spawn(
        connector: Arc<dyn UpstreamConnector>,
        settings: LifecycleSettings,
    ) -> (RelayHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = Relay::new(connector, settings.idle_timeout, &tx);
        let task = tokio::spawn(
            relay
                .run(rx, settings.sweep_interval)
                .instrument(info_span!("relay")),
        );
        (RelayHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RelayEvent>, sweep_interval: Duration) {
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(?sweep_interval, idle_timeout = ?self.idle_timeout, "Relay started.");

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event, Instant::now()),
                    None => break,
                },
                _ = sweep.tick() => {
                    let removed = lifecycle::sweep_idle(&mut self.registry, Instant::now(), self.idle_timeout);
                    debug!(removed = removed.len(), active = self.registry.len(), "Idle sweep finished.");
                }
            }
        }
        info!("Relay stopped.");
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn handle_event(&mut self, event: RelayEvent, now: Instant) {
        match event {
            RelayEvent::ClientConnected { session_id, client } => {
                self.on_client_connected(session_id, client, now)
            }
            RelayEvent::ClientFrame {
                session_id,
                payload,
            } => self.on_client_frame(&session_id, &payload, now),
            RelayEvent::ClientDisconnected { session_id } => {
                lifecycle::teardown(&mut self.registry, &session_id, "client disconnected");
            }
            RelayEvent::Upstream {
                session_id,
                generation,
                event,
            } => self.on_upstream_event(&session_id, generation, event),
        }
    }

    fn on_client_connected(&mut self, session_id: String, client: ClientHandle, now: Instant) {
        match self.registry.create(session_id, client, now) {
            Ok(session) => {
                session.notify(ServerMessage::connected(session.id()));
                info!(session_id = %session.id(), "Session registered.");
            }
            Err(e) => error!(error = %e, "Failed to register session."),
        }
    }

    fn on_client_frame(&mut self, session_id: &str, payload: &[u8], now: Instant) {
        let Some(session) = self.registry.get_mut(session_id) else {
            debug!(session_id, "Client frame for an unknown session, ignoring.");
            return;
        };
        session.touch(now);

        let message = match serde_json::from_slice::<ClientMessage>(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id, error = %e, "Error handling client message.");
                session.notify(ServerMessage::error("Failed to process message"));
                return;
            }
        };

        match message {
            ClientMessage::InitConversation {
                agent_id,
                voice_settings,
            } => self.init_conversation(session_id, agent_id, voice_settings.unwrap_or_default()),
            ClientMessage::SendText { text } => self.send_text(session_id, &text),
            ClientMessage::SendAudio { audio } => self.send_audio(session_id, &audio),
            ClientMessage::EndConversation => self.end_conversation(session_id),
            ClientMessage::Unknown => warn!(session_id, "Unknown client message type, ignoring."),
        }
    }

    fn init_conversation(&mut self, session_id: &str, agent_id: String, voice_settings: VoiceSettings) {
        let Some(events_tx) = self.events.upgrade() else {
            warn!(session_id, "Relay is shutting down, not opening upstream.");
            return;
        };
        self.last_generation += 1;
        let generation = self.last_generation;

        let Some(session) = self.registry.get_mut(session_id) else {
            return;
        };
        // At most one upstream per session: a new init replaces the previous connection.
        if let Some(previous) = session.detach_upstream() {
            info!(session_id, "Replacing existing upstream connection.");
            previous.close();
        }
        session.upstream_generation = generation;
        session.voice_settings = voice_settings.clone();

        info!(session_id, %agent_id, generation, "Opening upstream conversation.");
        self.connector.open(
            OpenRequest {
                session_id: session_id.to_string(),
                generation,
                agent_id,
                voice_settings,
            },
            UpstreamEvents::new(session_id.to_string(), generation, events_tx),
        );
    }

    fn send_text(&self, session_id: &str, text: &str) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        let Some(upstream) = session.connected_upstream() else {
            session.notify(ServerMessage::error("Not connected to ElevenLabs"));
            return;
        };
        match upstream.send_text(text) {
            Ok(()) => session.notify(ServerMessage::text_sent()),
            Err(e) => {
                error!(session_id, error = %e, "Error sending text to ElevenLabs.");
                session.notify(ServerMessage::error("Failed to send text"));
            }
        }
    }

    fn send_audio(&self, session_id: &str, audio: &str) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        let Some(upstream) = session.connected_upstream() else {
            session.notify(ServerMessage::error("Not connected to ElevenLabs"));
            return;
        };
        match upstream.send_audio(audio) {
            Ok(()) => session.notify(ServerMessage::audio_sent()),
            Err(e) => {
                error!(session_id, error = %e, "Error sending audio to ElevenLabs.");
                session.notify(ServerMessage::error("Failed to send audio"));
            }
        }
    }

    fn end_conversation(&mut self, session_id: &str) {
        // Reported even when no upstream was ever opened. Teardown closes the upstream.
        if let Some(session) = self.registry.get(session_id) {
            session.notify(ServerMessage::conversation_ended());
        }
        lifecycle::teardown(&mut self.registry, session_id, "conversation ended");
    }

    fn on_upstream_event(&mut self, session_id: &str, generation: u64, event: UpstreamEvent) {
        let Some(session) = self.registry.get_mut(session_id) else {
            // An `Opened` handle dropped here closes the orphaned connection.
            debug!(session_id, generation, "Upstream event for a closed session, ignoring.");
            return;
        };
        if session.upstream_generation != generation {
            debug!(session_id, generation, "Upstream event from a replaced connection, ignoring.");
            return;
        }

        match event {
            UpstreamEvent::Opened(upstream) => {
                info!(session_id, generation, "ElevenLabs connected.");
                session.attach_upstream(upstream);
                session.notify(ServerMessage::elevenlabs_connected());
            }
            UpstreamEvent::Frame(frame) => match classify_frame(frame) {
                UpstreamPayload::Control(data) => {
                    session.notify(ServerMessage::ElevenlabsMessage { data });
                }
                UpstreamPayload::Audio(frame) => {
                    let audio = base64::engine::general_purpose::STANDARD.encode(&frame);
                    session.recent_audio.push(frame);
                    session.notify(ServerMessage::AudioChunk { audio });
                }
            },
            UpstreamEvent::Closed => {
                info!(session_id, generation, "ElevenLabs disconnected.");
                session.detach_upstream();
                session.notify(ServerMessage::elevenlabs_disconnected());
            }
            UpstreamEvent::Error(reason) => {
                warn!(session_id, generation, %reason, "ElevenLabs connection error.");
                session.notify(ServerMessage::error("ElevenLabs connection error"));
            }
            UpstreamEvent::OpenFailed(reason) => {
                error!(session_id, generation, %reason, "Failed to connect to ElevenLabs.");
                session.notify(ServerMessage::error("Failed to connect to ElevenLabs"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::provider::{UpstreamCommand, UpstreamHandle};
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use tokio::sync::mpsc::error::TryRecvError;

    #[derive(Default)]
    struct FakeConnector {
        opened: Mutex<Vec<OpenRequest>>,
    }

    impl UpstreamConnector for FakeConnector {
        fn open(&self, request: OpenRequest, _events: UpstreamEvents) {
            self.opened.lock().unwrap().push(request);
        }
    }

    impl FakeConnector {
        fn requests(&self) -> Vec<OpenRequest> {
            self.opened.lock().unwrap().clone()
        }
    }

    struct Harness {
        relay: Relay,
        connector: Arc<FakeConnector>,
        _events: (
            mpsc::UnboundedSender<RelayEvent>,
            mpsc::UnboundedReceiver<RelayEvent>,
        ),
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let connector = Arc::new(FakeConnector::default());
            let (tx, rx) = mpsc::unbounded_channel();
            let relay = Relay::new(connector.clone(), Duration::from_secs(300), &tx);
            Self {
                relay,
                connector,
                _events: (tx, rx),
                now: Instant::now(),
            }
        }

        fn connect(&mut self, session_id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
            let (client, mut outbound) = ClientHandle::channel();
            self.relay.handle_event(
                RelayEvent::ClientConnected {
                    session_id: session_id.to_string(),
                    client,
                },
                self.now,
            );
            assert_eq!(outbound.try_recv().unwrap(), ServerMessage::connected(session_id));
            outbound
        }

        fn client_sends(&mut self, session_id: &str, message: Value) {
            self.client_sends_raw(session_id, message.to_string().into_bytes());
        }

        fn client_sends_raw(&mut self, session_id: &str, payload: Vec<u8>) {
            self.relay.handle_event(
                RelayEvent::ClientFrame {
                    session_id: session_id.to_string(),
                    payload: Bytes::from(payload),
                },
                self.now,
            );
        }

        fn generation(&self, session_id: &str) -> u64 {
            self.relay.registry().get(session_id).unwrap().upstream_generation
        }

        fn upstream(&mut self, session_id: &str, generation: u64, event: UpstreamEvent) {
            self.relay.handle_event(
                RelayEvent::Upstream {
                    session_id: session_id.to_string(),
                    generation,
                    event,
                },
                self.now,
            );
        }

        /// Runs `init_conversation` and completes the upstream handshake.
        fn open_upstream(
            &mut self,
            session_id: &str,
            outbound: &mut mpsc::UnboundedReceiver<ServerMessage>,
        ) -> mpsc::UnboundedReceiver<UpstreamCommand> {
            self.client_sends(session_id, json!({"type": "init_conversation", "agent_id": "a1"}));
            let (handle, commands) = UpstreamHandle::channel();
            let generation = self.generation(session_id);
            self.upstream(session_id, generation, UpstreamEvent::Opened(handle));
            assert_eq!(outbound.try_recv().unwrap(), ServerMessage::elevenlabs_connected());
            commands
        }
    }

    fn drain(outbound: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = outbound.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_text_round_trip_through_upstream() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");

        h.client_sends("s1", json!({"type": "init_conversation", "agent_id": "a1"}));
        let requests = h.connector.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].agent_id, "a1");
        assert_eq!(requests[0].session_id, "s1");
        assert_eq!(requests[0].voice_settings, VoiceSettings::default());
        assert!(drain(&mut outbound).is_empty());

        let (handle, mut commands) = UpstreamHandle::channel();
        h.upstream("s1", requests[0].generation, UpstreamEvent::Opened(handle));
        assert_eq!(drain(&mut outbound), vec![ServerMessage::elevenlabs_connected()]);
        assert!(h.relay.registry().get("s1").unwrap().is_connected());

        h.client_sends("s1", json!({"type": "send_text", "text": "hi"}));
        assert_eq!(
            commands.try_recv().unwrap(),
            UpstreamCommand::Send(r#"{"user_audio_chunk":null,"user_message":"hi"}"#.to_string())
        );
        assert_eq!(
            drain(&mut outbound),
            vec![ServerMessage::TextSent {
                message: "Text sent to ElevenLabs".to_string()
            }]
        );
    }

    #[test]
    fn test_init_passes_voice_settings() {
        let mut h = Harness::new();
        let _outbound = h.connect("s1");
        h.client_sends(
            "s1",
            json!({
                "type": "init_conversation",
                "agent_id": "a2",
                "voice_settings": {"stability": 0.25, "similarity_boost": 0.5, "style": 1.0, "use_speaker_boost": false}
            }),
        );

        let expected = VoiceSettings {
            stability: 0.25,
            similarity_boost: 0.5,
            style: 1.0,
            use_speaker_boost: false,
        };
        assert_eq!(h.connector.requests()[0].voice_settings, expected);
        assert_eq!(h.relay.registry().get("s1").unwrap().voice_settings, expected);
    }

    #[test]
    fn test_send_before_connected_is_rejected() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");

        h.client_sends("s1", json!({"type": "send_text", "text": "hi"}));
        h.client_sends("s1", json!({"type": "send_audio", "audio": "AAEC"}));
        assert_eq!(
            drain(&mut outbound),
            vec![
                ServerMessage::error("Not connected to ElevenLabs"),
                ServerMessage::error("Not connected to ElevenLabs"),
            ]
        );

        // Handshake still pending: still rejected, nothing transmitted.
        h.client_sends("s1", json!({"type": "init_conversation", "agent_id": "a1"}));
        h.client_sends("s1", json!({"type": "send_text", "text": "hi"}));
        assert_eq!(
            drain(&mut outbound),
            vec![ServerMessage::error("Not connected to ElevenLabs")]
        );
        assert!(!h.relay.registry().get("s1").unwrap().is_connected());
    }

    #[test]
    fn test_send_audio_forwards_and_reports() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");
        let mut commands = h.open_upstream("s1", &mut outbound);

        h.client_sends("s1", json!({"type": "send_audio", "audio": "AAECAw=="}));
        assert_eq!(
            commands.try_recv().unwrap(),
            UpstreamCommand::Send(r#"{"user_audio_chunk":"AAECAw==","user_message":null}"#.to_string())
        );
        assert_eq!(drain(&mut outbound), vec![ServerMessage::audio_sent()]);

        h.client_sends("s1", json!({"type": "send_audio", "audio": "%%%"}));
        assert!(commands.try_recv().is_err());
        assert_eq!(
            drain(&mut outbound),
            vec![ServerMessage::error("Failed to send audio")]
        );
        assert!(h.relay.registry().contains("s1"));
    }

    #[test]
    fn test_send_text_after_upstream_task_died() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");
        let commands = h.open_upstream("s1", &mut outbound);
        drop(commands);

        h.client_sends("s1", json!({"type": "send_text", "text": "hi"}));
        assert_eq!(
            drain(&mut outbound),
            vec![ServerMessage::error("Failed to send text")]
        );
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");

        h.client_sends("s1", json!({"type": "make_coffee", "sugar": 2}));

        assert!(drain(&mut outbound).is_empty());
        assert!(h.connector.requests().is_empty());
        let session = h.relay.registry().get("s1").unwrap();
        assert!(!session.is_connected());
        assert_eq!(session.upstream_generation, 0);
    }

    #[test]
    fn test_malformed_message_reports_error_and_keeps_session() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");

        h.client_sends_raw("s1", b"{not json".to_vec());
        h.client_sends_raw("s1", vec![0xff, 0xfe, 0x00]);
        h.client_sends("s1", json!({"type": "send_text"}));

        assert_eq!(
            drain(&mut outbound),
            vec![ServerMessage::error("Failed to process message"); 3]
        );
        assert!(h.relay.registry().contains("s1"));
    }

    #[test]
    fn test_client_activity_updates_last_activity() {
        let mut h = Harness::new();
        let _outbound = h.connect("s1");
        let connected_at = h.relay.registry().get("s1").unwrap().last_activity();

        h.now += Duration::from_secs(42);
        h.client_sends("s1", json!({"type": "whatever"}));

        assert_eq!(
            h.relay.registry().get("s1").unwrap().last_activity(),
            connected_at + Duration::from_secs(42)
        );
    }

    #[test]
    fn test_upstream_audio_is_base64_forwarded_and_buffered() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");
        let _commands = h.open_upstream("s1", &mut outbound);
        let generation = h.generation("s1");

        for i in 0..11u8 {
            h.upstream("s1", generation, UpstreamEvent::Frame(Bytes::from(vec![0xff, i, 0x80])));
        }

        let messages = drain(&mut outbound);
        assert_eq!(messages.len(), 11);
        assert_eq!(
            messages[0],
            ServerMessage::AudioChunk {
                audio: base64::engine::general_purpose::STANDARD.encode([0xff, 0x00, 0x80])
            }
        );

        let session = h.relay.registry().get("s1").unwrap();
        assert_eq!(session.recent_audio.len(), 10);
        assert_eq!(session.recent_audio.iter().next().unwrap()[1], 1);
    }

    #[test]
    fn test_upstream_json_is_forwarded_as_message() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");
        let _commands = h.open_upstream("s1", &mut outbound);
        let generation = h.generation("s1");

        let event = json!({"type": "agent_response", "agent_response_event": {"agent_response": "Hello"}});
        h.upstream("s1", generation, UpstreamEvent::Frame(Bytes::from(event.to_string())));

        assert_eq!(
            drain(&mut outbound),
            vec![ServerMessage::ElevenlabsMessage { data: event }]
        );
        assert!(h.relay.registry().get("s1").unwrap().recent_audio.is_empty());
    }

    #[test]
    fn test_upstream_close_and_errors_are_reported() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");
        let _commands = h.open_upstream("s1", &mut outbound);
        let generation = h.generation("s1");

        h.upstream("s1", generation, UpstreamEvent::Error("reset".to_string()));
        h.upstream("s1", generation, UpstreamEvent::Closed);
        assert_eq!(
            drain(&mut outbound),
            vec![
                ServerMessage::error("ElevenLabs connection error"),
                ServerMessage::elevenlabs_disconnected(),
            ]
        );
        assert!(!h.relay.registry().get("s1").unwrap().is_connected());

        h.client_sends("s1", json!({"type": "send_text", "text": "hi"}));
        assert_eq!(
            drain(&mut outbound),
            vec![ServerMessage::error("Not connected to ElevenLabs")]
        );
    }

    #[test]
    fn test_open_failed_is_reported() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");
        h.client_sends("s1", json!({"type": "init_conversation", "agent_id": "a1"}));
        let generation = h.generation("s1");

        h.upstream("s1", generation, UpstreamEvent::OpenFailed("bad url".to_string()));
        assert_eq!(
            drain(&mut outbound),
            vec![ServerMessage::error("Failed to connect to ElevenLabs")]
        );
    }

    #[test]
    fn test_reinit_replaces_upstream() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");
        let mut first = h.open_upstream("s1", &mut outbound);
        let first_generation = h.generation("s1");

        h.client_sends("s1", json!({"type": "init_conversation", "agent_id": "a2"}));
        assert_eq!(first.try_recv().unwrap(), UpstreamCommand::Close);
        assert!(!h.relay.registry().get("s1").unwrap().is_connected());

        // The old connection's close is not reported against the new one.
        h.upstream("s1", first_generation, UpstreamEvent::Closed);
        assert!(drain(&mut outbound).is_empty());
        assert_eq!(h.connector.requests().len(), 2);
        assert!(h.generation("s1") > first_generation);
    }

    #[test]
    fn test_stale_open_is_dropped() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");
        h.client_sends("s1", json!({"type": "init_conversation", "agent_id": "a1"}));
        let stale_generation = h.generation("s1");
        h.client_sends("s1", json!({"type": "init_conversation", "agent_id": "a1"}));

        let (stale, mut stale_commands) = UpstreamHandle::channel();
        h.upstream("s1", stale_generation, UpstreamEvent::Opened(stale));

        assert!(drain(&mut outbound).is_empty());
        assert!(!h.relay.registry().get("s1").unwrap().is_connected());
        assert_eq!(stale_commands.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_end_conversation_tears_down_session() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");
        let mut commands = h.open_upstream("s1", &mut outbound);

        h.client_sends("s1", json!({"type": "end_conversation"}));

        assert!(!h.relay.registry().contains("s1"));
        assert_eq!(commands.try_recv().unwrap(), UpstreamCommand::Close);
        assert_eq!(commands.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(outbound.try_recv().unwrap(), ServerMessage::conversation_ended());
        assert_eq!(outbound.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_end_conversation_without_upstream_still_reports() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");

        h.client_sends("s1", json!({"type": "end_conversation"}));

        assert_eq!(drain(&mut outbound), vec![ServerMessage::conversation_ended()]);
        assert!(!h.relay.registry().contains("s1"));
    }

    #[test]
    fn test_client_disconnect_cleans_up() {
        let mut h = Harness::new();
        let mut outbound = h.connect("s1");
        let mut commands = h.open_upstream("s1", &mut outbound);
        let generation = h.generation("s1");

        h.relay.handle_event(
            RelayEvent::ClientDisconnected {
                session_id: "s1".to_string(),
            },
            h.now,
        );
        assert!(!h.relay.registry().contains("s1"));
        assert_eq!(commands.try_recv().unwrap(), UpstreamCommand::Close);

        // Late events for the session are ignored, repeated disconnects are harmless.
        h.upstream("s1", generation, UpstreamEvent::Closed);
        h.relay.handle_event(
            RelayEvent::ClientDisconnected {
                session_id: "s1".to_string(),
            },
            h.now,
        );
        assert!(h.relay.registry().is_empty());
    }

    #[test]
    fn test_sessions_are_isolated() {
        let mut h = Harness::new();
        let mut first = h.connect("s1");
        let mut second = h.connect("s2");
        let _commands = h.open_upstream("s1", &mut first);

        h.client_sends_raw("s2", b"garbage".to_vec());
        h.client_sends("s2", json!({"type": "end_conversation"}));

        assert!(drain(&mut first).is_empty());
        assert_eq!(drain(&mut second).len(), 2);
        assert!(h.relay.registry().get("s1").unwrap().is_connected());
    }

    #[test]
    fn test_duplicate_connect_keeps_original_session() {
        let mut h = Harness::new();
        let mut original = h.connect("s1");
        let (duplicate, mut duplicate_outbound) = ClientHandle::channel();

        h.relay.handle_event(
            RelayEvent::ClientConnected {
                session_id: "s1".to_string(),
                client: duplicate,
            },
            h.now,
        );

        assert_eq!(h.relay.registry().len(), 1);
        assert_eq!(duplicate_outbound.try_recv(), Err(TryRecvError::Disconnected));
        h.client_sends("s1", json!({"type": "send_text", "text": "hi"}));
        assert_eq!(drain(&mut original).len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_relay_greets_clients() {
        let connector = Arc::new(FakeConnector::default());
        let (relay, _task) = Relay::spawn(connector, LifecycleSettings::default());
        let (client, mut outbound) = ClientHandle::channel();

        relay.client_connected("s1".to_string(), client);
        assert_eq!(outbound.recv().await, Some(ServerMessage::connected("s1")));

        relay.client_frame("s1".to_string(), Bytes::from_static(br#"{"type":"end_conversation"}"#));
        assert_eq!(outbound.recv().await, Some(ServerMessage::conversation_ended()));
        assert_eq!(outbound.recv().await, None);
    }
}
