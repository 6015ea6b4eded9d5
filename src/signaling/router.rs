//! Signaling router
//!
//! Interprets inbound signaling messages and connection lifecycle events,
//! updates the room registry and decides who gets notified.
//!
//! The router holds no per-connection state of its own; whether a connection
//! is in a room is read from the registry on every event. Registry snapshots
//! are taken under its lock and all sends happen afterwards.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::room::{Departure, Entered, RoomRegistry};
use crate::server::{
    Connection, ConnectionId, ProtocolError, Request, RoomId, SendError, SignalMessage,
};

/// Errors raised while handling a single event
///
/// None of these are reported to peers; they are logged and the event is
/// dropped.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Failed to decode message: {0}")]
    Decode(#[from] ProtocolError),

    #[error("No route from {sender} to {receiver}")]
    UnknownRoomOrReceiver {
        sender: ConnectionId,
        receiver: String,
    },

    #[error("Connection {0} was not in any room")]
    MissingRoomOnDisconnect(ConnectionId),

    #[error("Send failed: {0}")]
    SendFailure(#[from] SendError),
}

/// Result type for router operations
pub type SignalResult<T> = Result<T, SignalError>;

impl SignalError {
    /// Log the error at a level matching how unusual it is
    fn log(&self, connection_id: &ConnectionId) {
        match self {
            SignalError::Decode(e) => {
                warn!("Dropping message from {}: {}", connection_id, e);
            }
            SignalError::SendFailure(SendError::QueueFull(_)) => {
                warn!("{}", self);
            }
            // the peer is already going away; its own disconnect cleans up
            SignalError::SendFailure(SendError::Closed(_)) => {
                debug!("{}", self);
            }
            SignalError::UnknownRoomOrReceiver { .. } | SignalError::MissingRoomOnDisconnect(_) => {
                debug!("{}", self);
            }
        }
    }
}

/// Routes signaling messages between the members of a room
pub struct SignalingRouter {
    registry: Arc<RoomRegistry>,
}

impl SignalingRouter {
    /// Create a router over an explicitly constructed registry
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// A transport accepted a new connection
    pub async fn on_connection_established(&self, connection: &Connection) {
        info!("Connection {} established", connection.id());
    }

    /// A transport received a text frame from `connection`
    pub async fn on_message_received(&self, connection: &Connection, raw: &str) {
        debug!("Received from {}: {}", connection.id(), raw);

        let result = match Request::decode(raw) {
            Ok(request) => {
                debug!("Decoded {} request from {}", request.kind(), connection.id());
                self.dispatch(connection, request).await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            e.log(connection.id());
        }
    }

    /// A transport reported `connection_id` closed
    pub async fn on_connection_closed(&self, connection_id: &ConnectionId) {
        info!("Connection {} closed", connection_id);
        if let Err(e) = self.disconnect(connection_id).await {
            e.log(connection_id);
        }
    }

    /// Handle one decoded request from `connection`
    pub async fn dispatch(&self, connection: &Connection, request: Request) -> SignalResult<()> {
        match request {
            Request::JoinRoom { room_id, message } => {
                self.join_room(connection, room_id, &message).await
            }
            Request::RoomList { sender } => self.room_list(connection, sender).await,
            Request::Relay { receiver, message } => {
                self.relay(connection, receiver, message).await
            }
            Request::Ignored(kind) => {
                debug!(
                    "Ignoring {} message from {}",
                    kind,
                    connection.id()
                );
                Ok(())
            }
        }
    }

    /// Remove a closed connection from its room and tell the others
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> SignalResult<()> {
        let departure = self
            .registry
            .depart(connection_id)
            .await
            .ok_or_else(|| SignalError::MissingRoomOnDisconnect(connection_id.clone()))?;

        info!(
            "Connection {} left room {} ({} remaining)",
            connection_id,
            departure.room_id,
            departure.remaining.len()
        );
        self.notify_departure(connection_id, departure);
        Ok(())
    }

    async fn join_room(
        &self,
        connection: &Connection,
        room_id: RoomId,
        request: &SignalMessage,
    ) -> SignalResult<()> {
        let Entered { others, previous } =
            self.registry.enter(room_id, connection.clone()).await;

        if let Some(departure) = previous {
            info!(
                "Connection {} moved from room {} to room {}",
                connection.id(),
                departure.room_id,
                room_id
            );
            self.notify_departure(connection.id(), departure);
        }

        info!(
            "Connection {} joined room {} with {} other member(s)",
            connection.id(),
            room_id,
            others.len()
        );

        let members = others.into_iter().map(String::from).collect();
        connection.send(SignalMessage::all_users(request, members))?;
        Ok(())
    }

    async fn room_list(&self, connection: &Connection, sender: Option<String>) -> SignalResult<()> {
        let rooms = self.registry.list_room_ids().await;
        debug!("Room list for {}: {:?}", connection.id(), rooms);

        connection.send(SignalMessage::room_list(sender, rooms))?;
        Ok(())
    }

    async fn relay(
        &self,
        connection: &Connection,
        receiver: String,
        message: SignalMessage,
    ) -> SignalResult<()> {
        let unroutable = || SignalError::UnknownRoomOrReceiver {
            sender: connection.id().clone(),
            receiver: receiver.clone(),
        };

        let (room_id, target) = self
            .registry
            .relay_target(connection.id(), &ConnectionId::from(receiver.as_str()))
            .await
            .ok_or_else(unroutable)?;

        if message.room_id.is_some_and(|requested| requested != room_id) {
            return Err(unroutable());
        }

        debug!(
            "Relaying {} from {} to {} in room {}",
            message.kind,
            connection.id(),
            receiver,
            room_id
        );
        target.send(SignalMessage::relayed(connection.id().as_str(), message))?;
        Ok(())
    }

    /// Send `leave` to everyone still in the room, continuing past failures
    fn notify_departure(&self, departed: &ConnectionId, departure: Departure) {
        for member in departure.remaining {
            let notice = SignalMessage::leave(departed.as_str(), member.id().as_str());
            if let Err(e) = member.send(notice) {
                SignalError::from(e).log(departed);
            }
        }
    }
}
