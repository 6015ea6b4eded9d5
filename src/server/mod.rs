//! WebSocket server module
//!
//! Accepts WebSocket connections from browser peers, decodes the signaling
//! envelope and hands events to the signaling router.

mod connection;
mod protocol;
mod websocket;

pub use connection::*;
pub use protocol::*;
pub use websocket::*;
