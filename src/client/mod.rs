//! Signaling client
//!
//! Owns the persistent WebSocket connection to the relay. The client:
//! - answers relay heartbeats
//! - presents the identity cookie it was issued, so reconnects keep the same peer id
//! - reconnects after a fixed delay when the connection is lost
//! - drops outbound envelopes while disconnected
//! - sends an explicit `disconnect` before closing on shutdown

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, SET_COOKIE, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, PEER_ID_COOKIE};
use crate::protocol::{Envelope, ServerMessage};

/// Signaling client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// The relay URL or a header value is unusable
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

/// Result type for signaling client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// What the client reports to its owner
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// Connected (or reconnected) to the relay
    Connected,
    /// Connection lost; a reconnect is scheduled
    Disconnected,
    /// Decoded relay message (heartbeats are handled internally)
    Message(ServerMessage),
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Exit {
    Lost,
    Shutdown,
}

/// Handle to a running [`SignalingClient`]
pub struct SignalingHandle {
    outbound: mpsc::UnboundedSender<Envelope>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SignalingHandle {
    /// Queue for envelopes to send to the relay
    pub fn sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.outbound.clone()
    }

    /// Say goodbye to the relay and stop reconnecting
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = self.task.await {
            warn!("Signaling task ended abnormally: {}", e);
        }
    }
}

/// Persistent connection to the relay
pub struct SignalingClient {
    config: ClientConfig,
    cookie: Option<String>,
    outbound: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<ClientEvent>,
    shutdown: oneshot::Receiver<()>,
}

impl SignalingClient {
    /// Start the client in a background task
    pub fn spawn(config: ClientConfig) -> (SignalingHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown) = oneshot::channel();

        let cookie = config
            .identity
            .as_ref()
            .map(|id| format!("{}={}", PEER_ID_COOKIE, id));
        let client = SignalingClient {
            config,
            cookie,
            outbound,
            events,
            shutdown,
        };
        let task = tokio::spawn(client.run());

        (
            SignalingHandle {
                outbound: outbound_tx,
                shutdown: Some(shutdown_tx),
                task,
            },
            events_rx,
        )
    }

    async fn run(mut self) {
        let mut reported_down = false;
        loop {
            match self.connect().await {
                Ok(ws) => {
                    info!("Connected to relay {}", self.config.server_url);
                    reported_down = false;
                    self.emit(ClientEvent::Connected);
                    if let Exit::Shutdown = self.serve(ws).await {
                        return;
                    }
                }
                Err(e) => warn!("{}", e),
            }

            if !reported_down {
                self.emit(ClientEvent::Disconnected);
                reported_down = true;
            }
            info!(
                "Connection lost. Retry in {} seconds...",
                self.config.reconnect_delay.as_secs_f32()
            );

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = &mut self.shutdown => return,
            }

            let mut dropped = 0;
            while self.outbound.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                debug!("Dropped {} envelopes while disconnected", dropped);
            }
        }
    }

    async fn connect(&mut self) -> ClientResult<WsStream> {
        let mut request = self
            .config
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(USER_AGENT, header_value(&self.config.user_agent)?);
        if let Some(cookie) = &self.cookie {
            headers.insert(COOKIE, header_value(cookie)?);
        }

        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        let issued = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(identity_cookie);
        if let Some(cookie) = issued {
            debug!("Relay issued {}", cookie);
            self.cookie = Some(cookie);
        }
        Ok(ws)
    }

    async fn serve(&mut self, ws: WsStream) -> Exit {
        let (mut write, mut read) = ws.split();

        let exit = loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match Envelope::parse(&text).and_then(ServerMessage::try_from) {
                                Ok(ServerMessage::Ping) => {
                                    if let Err(e) = send(&mut write, &Envelope::pong()).await {
                                        warn!("Failed to answer heartbeat: {}", e);
                                        break Exit::Lost;
                                    }
                                }
                                Ok(message) => self.emit(ClientEvent::Message(message)),
                                Err(e) => warn!("Ignoring relay message: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break Exit::Lost,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Err(e)) => {
                            warn!("Relay connection error: {}", e);
                            break Exit::Lost;
                        }
                        _ => {}
                    }
                }

                out = self.outbound.recv() => {
                    match out {
                        Some(envelope) => {
                            if let Err(e) = send(&mut write, &envelope).await {
                                warn!("Failed to send {}: {}", envelope.kind, e);
                                break Exit::Lost;
                            }
                        }
                        None => break Exit::Shutdown,
                    }
                }

                _ = &mut self.shutdown => break Exit::Shutdown,
            }
        };

        if let Exit::Shutdown = exit {
            if let Err(e) = send(&mut write, &Envelope::disconnect()).await {
                debug!("Could not say goodbye: {}", e);
            }
            let _ = write.close().await;
            info!("Disconnected from relay");
        }
        exit
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("Nobody listens to signaling events");
        }
    }
}

async fn send<S>(write: &mut S, envelope: &Envelope) -> Result<(), String>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = envelope.to_json().map_err(|e| e.to_string())?;
    write.send(Message::Text(json)).await.map_err(|e| e.to_string())
}

fn header_value(value: &str) -> ClientResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ClientError::InvalidRequest(e.to_string()))
}

/// `peerid=<id>` pair from a `Set-Cookie` value
fn identity_cookie(set_cookie: &str) -> Option<String> {
    let pair = set_cookie.split(';').next()?.trim();
    let (key, value) = pair.split_once('=')?;
    (key == PEER_ID_COOKIE && !value.is_empty()).then(|| pair.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::protocol::PeerId;
    use crate::relay::{RelayServer, Room};
    use std::sync::Arc;
    use std::time::Duration;

    async fn start_relay(heartbeat_interval: Duration) -> (String, Arc<Room>) {
        let config = RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            heartbeat_interval,
            ..Default::default()
        };
        let server = RelayServer::bind(&config).await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let room = server.room();
        tokio::spawn(server.run());
        (url, room)
    }

    fn client_config(url: &str) -> ClientConfig {
        ClientConfig {
            server_url: url.to_string(),
            reconnect_delay: Duration::from_millis(100),
            ..Default::default()
        }
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no client event")
            .expect("client stopped")
    }

    async fn own_id(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> PeerId {
        assert_eq!(next(events).await, ClientEvent::Connected);
        match next(events).await {
            ClientEvent::Message(ServerMessage::ExistingPeers { me, .. }) => me.peer_id,
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_identity_cookie() {
        assert_eq!(
            identity_cookie("peerid=abc-1; SameSite=Strict; Secure").as_deref(),
            Some("peerid=abc-1")
        );
        assert!(identity_cookie("session=xyz; Secure").is_none());
        assert!(identity_cookie("peerid=; Secure").is_none());
    }

    #[tokio::test]
    async fn test_reconnect_keeps_identity() {
        let (url, room) = start_relay(Duration::from_secs(5)).await;
        let (handle, mut events) = SignalingClient::spawn(client_config(&url));
        let id = own_id(&mut events).await;

        // Evict the session server-side
        assert!(room.leave(&id).await);
        assert_eq!(next(&mut events).await, ClientEvent::Disconnected);
        assert_eq!(own_id(&mut events).await, id);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_preset_identity_is_presented() {
        let (url, _room) = start_relay(Duration::from_secs(5)).await;
        let config = ClientConfig {
            identity: Some("kitchen-laptop".to_string()),
            ..client_config(&url)
        };
        let (handle, mut events) = SignalingClient::spawn(config);
        assert_eq!(own_id(&mut events).await, PeerId::from("kitchen-laptop"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeats_are_answered() {
        let (url, room) = start_relay(Duration::from_millis(50)).await;
        let (handle, mut events) = SignalingClient::spawn(client_config(&url));
        let id = own_id(&mut events).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(room.contains(&id).await);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_says_goodbye() {
        let (url, room) = start_relay(Duration::from_secs(5)).await;
        let (a, mut a_events) = SignalingClient::spawn(client_config(&url));
        let a_id = own_id(&mut a_events).await;
        let (b, mut b_events) = SignalingClient::spawn(client_config(&url));
        let b_id = own_id(&mut b_events).await;

        match next(&mut a_events).await {
            ClientEvent::Message(ServerMessage::PeerJoined(info)) => assert_eq!(info.peer_id, b_id),
            other => panic!("Unexpected: {:?}", other),
        }

        b.shutdown().await;
        assert_eq!(
            next(&mut a_events).await,
            ClientEvent::Message(ServerMessage::PeerLeft(b_id.clone()))
        );
        assert!(!room.contains(&b_id).await);
        assert!(room.contains(&a_id).await);
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_relay_reports_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (handle, mut events) = SignalingClient::spawn(client_config(&url));
        assert_eq!(next(&mut events).await, ClientEvent::Disconnected);
        // Several retries fail in the meantime without repeating the event
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(events.try_recv().is_err());
        handle.shutdown().await;
    }
}
