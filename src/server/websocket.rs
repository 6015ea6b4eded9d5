//! WebSocket server implementation
//!
//! Provides a WebSocket server that listens on a configurable port, upgrades
//! requests on the signaling endpoint and feeds each connection's events to
//! the signaling router.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::ORIGIN, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_hdr_async_with_config, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use crate::config::ServerSettings;
use crate::signaling::SignalingRouter;

/// How long a closing connection may spend flushing its outbound queue
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long shutdown waits for open connections to finish cleanup
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Path accepted for upgrades
    pub path: String,
    /// Allowed `Origin` patterns
    pub allowed_origins: Vec<String>,
    /// Per-connection outbound queue capacity
    pub outbound_queue: usize,
    /// Largest inbound message accepted, in bytes
    pub max_message_size: usize,
}

impl ServerConfig {
    /// Create a new server configuration with default settings
    #[allow(dead_code)]
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            ..Self::from(&ServerSettings::default())
        }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Whether a browser `Origin` header value is accepted
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins
            .iter()
            .any(|pattern| origin_matches(pattern, origin))
    }

    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            bind: settings.bind.clone(),
            port: settings.port,
            path: settings.path.clone(),
            allowed_origins: settings.allowed_origins.clone(),
            outbound_queue: settings.outbound_queue,
            max_message_size: settings.max_message_size,
        }
    }
}

/// Match an origin against a pattern with at most one `*` wildcard
fn origin_matches(pattern: &str, origin: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == origin,
        Some((prefix, suffix)) => {
            origin.len() >= prefix.len() + suffix.len()
                && origin.starts_with(prefix)
                && origin.ends_with(suffix)
        }
    }
}

/// WebSocket server for signaling peers
pub struct SignalServer {
    config: Arc<ServerConfig>,
    router: Arc<SignalingRouter>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SignalServer {
    /// Create a new signaling server
    pub fn new(config: ServerConfig, router: Arc<SignalingRouter>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            router,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// Returns after a shutdown signal once open connections have cleaned up
    /// (or the grace period expired).
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "Signaling server listening on ws://{}{}",
            listener.local_addr()?,
            self.config.path
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let router = Arc::clone(&self.router);
                            let config = Arc::clone(&self.config);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, router, config, shutdown_rx).await {
                                    warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connection tasks
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let registry = self.router.registry();
        info!(
            "{} connections bound in {} rooms at shutdown",
            registry.connection_count().await,
            registry.room_count().await
        );

        if !connections.is_empty() {
            info!("Waiting for {} open connections to close...", connections.len());
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("{} connections still open after grace period", connections.len());
                connections.abort_all();
            }
        }

        Ok(())
    }
}

/// Accept or reject an upgrade request based on its path and origin
fn check_handshake(config: &ServerConfig, request: &Request) -> Result<(), ErrorResponse> {
    if request.uri().path() != config.path {
        return Err(reject(StatusCode::NOT_FOUND, "unknown endpoint"));
    }

    if let Some(origin) = request.headers().get(ORIGIN) {
        let origin = origin.to_str().unwrap_or_default();
        if !config.origin_allowed(origin) {
            return Err(reject(StatusCode::FORBIDDEN, "origin not allowed"));
        }
    }

    Ok(())
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<SignalingRouter>,
    config: Arc<ServerConfig>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    debug!("New TCP connection from {}", peer_addr);

    // Upgrade to WebSocket
    let handshake = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        check_handshake(&config, request).map(|()| response)
    };
    let ws_stream =
        accept_hdr_async_with_config(stream, handshake, Some(config.websocket_config())).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (connection, mut outbound_rx) = Connection::channel(config.outbound_queue);
    let connection_id = connection.id().clone();
    info!("Connection {} opened from {}", connection_id, peer_addr);

    // Drain the outbound queue into the socket
    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode message for {}: {}", writer_id, e);
                    continue;
                }
            };
            debug!("Sending to {}: {}", writer_id, json);
            if let Err(e) = ws_sender.send(Message::Text(json)).await {
                debug!("Socket for {} stopped accepting writes: {}", writer_id, e);
                return;
            }
        }
        let _ = ws_sender.close().await;
    });
    let writer_abort = writer.abort_handle();

    router.on_connection_established(&connection).await;

    // Message handling loop
    loop {
        tokio::select! {
            // Receive messages from client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        router.on_message_received(&connection, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message from {} ({} bytes), ignoring", connection_id, data.len());
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                        // tungstenite answers pings itself
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Client {} requested close", connection_id);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", connection_id, e);
                        break;
                    }
                    None => {
                        debug!("Connection {} reached end of stream", connection_id);
                        break;
                    }
                }
            }
            // Handle shutdown signal
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection {}", connection_id);
                break;
            }
        }
    }

    router.on_connection_closed(&connection_id).await;

    // The registry no longer holds this handle, so dropping ours ends the writer
    drop(connection);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        writer_abort.abort();
    }

    info!("Connection {} from {} closed", connection_id, peer_addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RoomRegistry;
    use crate::server::{MessageType, SignalMessage};
    use serde_json::json;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start(config: ServerConfig) -> (SocketAddr, Arc<SignalServer>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Arc::new(SignalingRouter::new(Arc::new(RoomRegistry::default())));
        let server = Arc::new(SignalServer::new(config, router));

        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });
        (addr, server)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = connect_async(format!("ws://{}/signal", addr)).await.unwrap();
        client
    }

    async fn send(client: &mut Client, value: serde_json::Value) {
        client.send(Message::Text(value.to_string())).await.unwrap();
    }

    async fn recv(client: &mut Client) -> SignalMessage {
        loop {
            let frame = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for message")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = frame {
                return SignalMessage::from_json(&text).unwrap();
            }
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig::new("127.0.0.1".to_string(), 0)
    }

    #[test]
    fn test_server_config() {
        let config = ServerConfig::new("127.0.0.1".to_string(), 9000);
        assert_eq!(config.socket_addr(), "127.0.0.1:9000");
        assert_eq!(config.path, "/signal");
        assert!(config.outbound_queue > 0);
    }

    #[test]
    fn test_server_config_from_settings() {
        let settings = ServerSettings {
            path: "/ws".to_string(),
            outbound_queue: 4,
            ..Default::default()
        };
        let config = ServerConfig::from(&settings);
        assert_eq!(config.path, "/ws");
        assert_eq!(config.outbound_queue, 4);
        assert_eq!(config.websocket_config().max_message_size, Some(settings.max_message_size));
    }

    #[test]
    fn test_origin_patterns() {
        assert!(origin_matches("*", "https://anything.test"));
        assert!(origin_matches("https://app.example.com", "https://app.example.com"));
        assert!(!origin_matches("https://app.example.com", "https://evil.com"));
        assert!(origin_matches("https://*.example.com", "https://a.example.com"));
        assert!(!origin_matches("https://*.example.com", "https://example.com.evil.org"));
        assert!(!origin_matches("https://*.example.com", "https://.example.co"));
        assert!(origin_matches("http://localhost:*", "http://localhost:3000"));
    }

    #[test]
    fn test_origin_allowed_uses_any_pattern() {
        let config = ServerConfig {
            allowed_origins: vec!["https://a.test".to_string(), "https://*.b.test".to_string()],
            ..test_config()
        };
        assert!(config.origin_allowed("https://a.test"));
        assert!(config.origin_allowed("https://x.b.test"));
        assert!(!config.origin_allowed("https://c.test"));
    }

    #[tokio::test]
    async fn test_end_to_end_signaling() {
        let (addr, server) = start(test_config()).await;
        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;

        send(&mut alice, json!({"type": "join_room", "sender": "alice", "roomId": 5})).await;
        let reply = recv(&mut alice).await;
        assert_eq!(reply.kind, MessageType::AllUsers);
        assert_eq!(reply.all_users, Some(vec![]));

        send(&mut bob, json!({"type": "join_room", "sender": "bob", "roomId": 5})).await;
        let reply = recv(&mut bob).await;
        let others = reply.all_users.unwrap();
        assert_eq!(others.len(), 1);
        let alice_id = others[0].clone();

        send(
            &mut bob,
            json!({"type": "offer", "receiver": &alice_id, "roomId": 5, "offer": {"sdp": "v=0"}}),
        )
        .await;
        let offer = recv(&mut alice).await;
        assert_eq!(offer.kind, MessageType::Offer);
        assert_eq!(offer.offer, Some(json!({"sdp": "v=0"})));
        let bob_id = offer.sender.unwrap();
        assert_ne!(bob_id, alice_id);

        send(&mut alice, json!({"type": "room_list", "sender": "alice"})).await;
        let rooms = recv(&mut alice).await;
        assert_eq!(rooms.kind, MessageType::RoomList);
        assert_eq!(rooms.data.as_deref(), Some("[5]"));

        bob.close(None).await.unwrap();
        let leave = recv(&mut alice).await;
        assert_eq!(leave.kind, MessageType::Leave);
        assert_eq!(leave.sender.as_deref(), Some(bob_id.as_str()));
        assert_eq!(leave.receiver.as_deref(), Some(alice_id.as_str()));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection_open() {
        let (addr, server) = start(test_config()).await;
        let mut client = connect(addr).await;

        client.send(Message::Text("not json".to_string())).await.unwrap();
        send(&mut client, json!({"type": "room_list"})).await;

        let reply = recv(&mut client).await;
        assert_eq!(reply.kind, MessageType::RoomList);
        assert_eq!(reply.data.as_deref(), Some("[]"));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_path_rejected() {
        let (addr, server) = start(test_config()).await;
        let result = connect_async(format!("ws://{}/other", addr)).await;
        assert!(result.is_err());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_disallowed_origin_rejected() {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let config = ServerConfig {
            allowed_origins: vec!["https://good.test".to_string()],
            ..test_config()
        };
        let (addr, server) = start(config).await;

        let mut request = format!("ws://{}/signal", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert(ORIGIN, "https://bad.test".parse().unwrap());
        assert!(connect_async(request).await.is_err());

        let mut request = format!("ws://{}/signal", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert(ORIGIN, "https://good.test".parse().unwrap());
        assert!(connect_async(request).await.is_ok());

        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let (addr, server) = start(test_config()).await;
        let mut client = connect(addr).await;
        send(&mut client, json!({"type": "join_room", "roomId": 1})).await;
        recv(&mut client).await;

        server.shutdown();

        let ended = timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(ended.is_ok());
    }
}
