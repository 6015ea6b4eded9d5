//! Signaling module
//!
//! The protocol state machine sitting between the transport and the room
//! registry.

mod router;

pub use router::*;
