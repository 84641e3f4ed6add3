//! Voice Relay Library Crate
//!
//! This library contains all the logic for the voice relay service: configuration,
//! the shared application state, the health endpoint, routing and the WebSocket
//! relay itself. The `relay` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
