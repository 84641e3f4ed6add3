//! WebSocket Relay
//!
//! This module contains the client-to-upstream relay. It is structured into
//! submodules for clarity:
//!
//! - `protocol`: Defines the JSON-based message format for client-relay communication.
//! - `session`: Manages the client WebSocket connection, from upgrade to close.
//! - `registry`: Holds the per-client session state.
//! - `relay`: The single task that routes client messages and upstream events.
//! - `lifecycle`: Session teardown and the idle sweep.
//! - `provider`: Handles the connection to the third-party voice API (ElevenLabs).

pub mod lifecycle;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod relay;
pub mod session;

pub use relay::{Relay, RelayHandle};
pub use session::ws_handler;
