//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the resources shared
//! by all HTTP and WebSocket handlers.

use crate::ws::RelayHandle;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: RelayHandle,
    live_clients: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(relay: RelayHandle) -> Self {
        Self {
            relay,
            live_clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of client sockets currently open.
    pub fn client_count(&self) -> usize {
        self.live_clients.load(Ordering::Acquire)
    }

    /// Counts a client socket for as long as the returned guard lives.
    pub(crate) fn track_client(&self) -> ClientGuard {
        self.live_clients.fetch_add(1, Ordering::AcqRel);
        ClientGuard(self.live_clients.clone())
    }
}

pub(crate) struct ClientGuard(Arc<AtomicUsize>);

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
