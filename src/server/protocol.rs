//! Protocol message definitions
//!
//! Defines the signaling envelope exchanged between browser peers and the relay.
//! Every message is a flat JSON object with a `type` tag and camelCase keys;
//! absent fields are omitted rather than sent as `null`.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Caller-supplied room identifier
pub type RoomId = i64;

/// Maximum length of a receiver connection id
pub const MAX_RECEIVER_LENGTH: usize = 256;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{kind} message is missing `{field}`")]
    MissingField {
        kind: MessageType,
        field: &'static str,
    },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Envelope
// ============================================================================

/// Message kinds carried in the `type` field
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Peer asks to join a room
    JoinRoom,
    /// Session description offer, relayed point to point
    Offer,
    /// Session description answer, relayed point to point
    Answer,
    /// ICE candidate, relayed point to point
    Candidate,
    /// Request for (and response carrying) the known room ids
    RoomList,
    /// Sent to a joining peer with the other members of the room
    AllUsers,
    /// Sent to remaining members when a peer disconnects
    Leave,
    /// Any tag this relay does not know
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::JoinRoom => "join_room",
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::Candidate => "candidate",
            MessageType::RoomList => "room_list",
            MessageType::AllUsers => "all_users",
            MessageType::Leave => "leave",
            MessageType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The signaling envelope, used for both directions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    /// Connection id or a caller-chosen display name, depending on the type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Only populated in `all_users` responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_users: Option<Vec<String>>,
    /// Target connection id for offer/answer/candidate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<Value>,
}

impl SignalMessage {
    /// Create an empty message of the given kind
    pub fn new(kind: MessageType) -> Self {
        Self {
            sender: None,
            kind,
            room_id: None,
            data: None,
            all_users: None,
            receiver: None,
            offer: None,
            answer: None,
            candidate: None,
            sdp: None,
        }
    }

    /// Parse a message from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Build the `all_users` reply for a join request
    ///
    /// Echoes the request's sender, data, candidate and sdp.
    pub fn all_users(request: &SignalMessage, members: Vec<String>) -> Self {
        Self {
            sender: request.sender.clone(),
            data: request.data.clone(),
            all_users: Some(members),
            candidate: request.candidate.clone(),
            sdp: request.sdp.clone(),
            ..Self::new(MessageType::AllUsers)
        }
    }

    /// Build the `room_list` reply, rooms rendered as `[1, 2, 3]`
    pub fn room_list(sender: Option<String>, rooms: impl IntoIterator<Item = RoomId>) -> Self {
        Self {
            sender,
            data: Some(format_room_ids(rooms)),
            ..Self::new(MessageType::RoomList)
        }
    }

    /// Rewrite a relayed request for delivery, stamping the sender's connection id
    pub fn relayed(sender: impl Into<String>, request: SignalMessage) -> Self {
        Self {
            sender: Some(sender.into()),
            receiver: request.receiver,
            data: request.data,
            offer: request.offer,
            answer: request.answer,
            candidate: request.candidate,
            sdp: request.sdp,
            ..Self::new(request.kind)
        }
    }

    /// Build the `leave` notification for one remaining member
    pub fn leave(departed: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self {
            sender: Some(departed.into()),
            receiver: Some(receiver.into()),
            ..Self::new(MessageType::Leave)
        }
    }
}

fn format_room_ids(rooms: impl IntoIterator<Item = RoomId>) -> String {
    let sorted: BTreeSet<RoomId> = rooms.into_iter().collect();
    let joined = sorted
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{}]", joined)
}

// ============================================================================
// Inbound Requests
// ============================================================================

/// A decoded inbound message, one variant per thing the router can do
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Join (creating if needed) the room
    JoinRoom {
        room_id: RoomId,
        message: SignalMessage,
    },
    /// List known room ids
    RoomList { sender: Option<String> },
    /// Forward an offer/answer/candidate to `receiver`
    Relay {
        receiver: String,
        message: SignalMessage,
    },
    /// Server-only or unknown kinds; never answered
    Ignored(MessageType),
}

impl Request {
    /// Decode and validate a raw text frame
    pub fn decode(json: &str) -> ProtocolResult<Self> {
        Self::try_from(SignalMessage::from_json(json)?)
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Request::JoinRoom { .. } => MessageType::JoinRoom,
            Request::RoomList { .. } => MessageType::RoomList,
            Request::Relay { message, .. } => message.kind,
            Request::Ignored(kind) => *kind,
        }
    }
}

impl TryFrom<SignalMessage> for Request {
    type Error = ProtocolError;

    fn try_from(message: SignalMessage) -> ProtocolResult<Self> {
        match message.kind {
            MessageType::JoinRoom => {
                let room_id = message.room_id.ok_or(ProtocolError::MissingField {
                    kind: MessageType::JoinRoom,
                    field: "roomId",
                })?;
                Ok(Request::JoinRoom { room_id, message })
            }

            MessageType::RoomList => Ok(Request::RoomList {
                sender: message.sender,
            }),

            MessageType::Offer | MessageType::Answer | MessageType::Candidate => {
                let receiver = message
                    .receiver
                    .clone()
                    .ok_or(ProtocolError::MissingField {
                        kind: message.kind,
                        field: "receiver",
                    })?;
                if receiver.is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "receiver cannot be empty".to_string(),
                    ));
                }
                if receiver.len() > MAX_RECEIVER_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "receiver exceeds maximum length of {} characters",
                        MAX_RECEIVER_LENGTH
                    )));
                }
                Ok(Request::Relay { receiver, message })
            }

            MessageType::AllUsers | MessageType::Leave | MessageType::Unknown => {
                Ok(Request::Ignored(message.kind))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
