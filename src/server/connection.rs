//! Connection handles
//!
//! A `Connection` is the outbound side of one WebSocket peer: an id plus a
//! bounded queue drained by the socket's writer task.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use super::protocol::SignalMessage;

/// Default capacity of a connection's outbound queue
pub const DEFAULT_OUTBOUND_QUEUE: usize = 128;

/// Errors that can occur when sending to a connection
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Outbound queue full for connection {0}")]
    QueueFull(ConnectionId),

    #[error("Connection {0} is closed")]
    Closed(ConnectionId),
}

/// Unique identifier of a connection, assigned at accept time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<ConnectionId> for String {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

/// Cloneable handle used to send messages to one peer
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<SignalMessage>,
}

impl Connection {
    /// Wrap an existing queue sender
    pub fn new(id: ConnectionId, tx: mpsc::Sender<SignalMessage>) -> Self {
        Self { id, tx }
    }

    /// Create a connection with a fresh id and its receiving end
    ///
    /// `capacity` must be non-zero.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SignalMessage>) {
        Self::with_id(ConnectionId::generate(), capacity)
    }

    /// Create a connection with a known id and its receiving end
    pub fn with_id(
        id: impl Into<ConnectionId>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<SignalMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(id.into(), tx), rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a message without waiting
    ///
    /// Fails when the peer is not draining its queue or its socket is gone.
    pub fn send(&self, message: SignalMessage) -> Result<(), SendError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull(self.id.clone()),
            TrySendError::Closed(_) => SendError::Closed(self.id.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::MessageType;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_send_and_receive() {
        let (conn, mut rx) = Connection::with_id("a", 4);
        conn.send(SignalMessage::new(MessageType::Leave)).unwrap();
        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind, MessageType::Leave);
    }

    #[test]
    fn test_send_to_full_queue() {
        let (conn, _rx) = Connection::with_id("a", 1);
        conn.send(SignalMessage::new(MessageType::Leave)).unwrap();
        let result = conn.send(SignalMessage::new(MessageType::Leave));
        assert!(matches!(result, Err(SendError::QueueFull(id)) if id.as_str() == "a"));
    }

    #[test]
    fn test_send_to_closed_connection() {
        let (conn, rx) = Connection::with_id("a", 1);
        drop(rx);
        let result = conn.send(SignalMessage::new(MessageType::Leave));
        assert!(matches!(result, Err(SendError::Closed(_))));
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = ConnectionId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }
}
