//! WebSocket front end of the relay
//!
//! Accepts connections, assigns an identity during the HTTP upgrade, registers the
//! connection in the [`Room`] and pumps envelopes between socket and room.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HeaderName, COOKIE, SET_COOKIE, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::{identity, DeviceInfo, Outbound, Room, SessionHandle};
use crate::config::RelayConfig;
use crate::protocol::{Envelope, PeerId};

/// Relay server errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listening socket could not be opened
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for relay server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// A bound relay, ready to accept connections
pub struct RelayServer {
    listener: TcpListener,
    room: Arc<Room>,
}

impl RelayServer {
    /// Bind the listening socket described by `config`
    pub async fn bind(config: &RelayConfig) -> ServerResult<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(RelayServer {
            listener,
            room: Room::from_config(config),
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The room shared by all connections
    pub fn room(&self) -> Arc<Room> {
        self.room.clone()
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> ServerResult<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            tokio::spawn(handle_connection(stream, addr, self.room.clone()));
        }
    }
}

/// Serve one client connection until it closes or is evicted
pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, room: Arc<Room>) {
    debug!("New connection from: {}", addr);

    let mut handshake: Option<(PeerId, DeviceInfo)> = None;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let header = |name: HeaderName| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
        };

        let resolved = identity::resolve(header(COOKIE));
        if let Some(set_cookie) = &resolved.set_cookie {
            match HeaderValue::from_str(set_cookie) {
                Ok(value) => {
                    response.headers_mut().append(SET_COOKIE, value);
                }
                Err(e) => warn!("Cannot encode cookie for {}: {}", addr, e),
            }
        }

        let device = DeviceInfo::from_user_agent(header(USER_AGENT).unwrap_or_default());
        handshake = Some((resolved.peer_id, device));
        Ok(response)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    let Some((peer_id, device)) = handshake else {
        error!("Handshake for {} completed without identity", addr);
        return;
    };

    let (mut write, mut read) = ws_stream.split();
    let (handle, mut outbound) = SessionHandle::channel();
    let serial = handle.serial();

    info!("Client {} connected as {}", addr, peer_id);
    room.join(device.into_peer_info(peer_id.clone()), handle).await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match Envelope::parse(&text) {
                        Ok(envelope) => room.handle_message(&peer_id, serial, envelope).await,
                        Err(e) => warn!("Invalid message from {}: {}", peer_id, e),
                    },

                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client {} disconnected", addr);
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }

                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }

                    _ => {}
                }
            }

            out = outbound.recv() => {
                match out {
                    Some(Outbound::Envelope(envelope)) => match envelope.to_json() {
                        Ok(json) => {
                            if let Err(e) = write.send(Message::Text(json)).await {
                                warn!("Send to {} failed: {}", peer_id, e);
                                break;
                            }
                        }
                        Err(e) => error!("Cannot encode {} for {}: {}", envelope.kind, peer_id, e),
                    },
                    Some(Outbound::Close) | None => {
                        let _ = write.close().await;
                        break;
                    }
                }
            }
        }
    }

    room.leave_connection(&peer_id, serial).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{kind, ServerMessage, SessionDescription, SignalDetail};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start() -> (String, Arc<Room>) {
        let config = RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        let server = RelayServer::bind(&config).await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let room = server.room();
        tokio::spawn(server.run());
        (url, room)
    }

    async fn next_message(ws: &mut Client) -> ServerMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("relay went quiet");
            match msg {
                Some(Ok(Message::Text(text))) => {
                    return ServerMessage::try_from(Envelope::parse(&text).unwrap()).unwrap()
                }
                Some(Ok(_)) => continue,
                other => panic!("Unexpected frame: {:?}", other),
            }
        }
    }

    async fn send(ws: &mut Client, envelope: Envelope) {
        ws.send(Message::Text(envelope.to_json().unwrap()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_new_client_gets_cookie_and_snapshot() {
        let (url, _room) = start().await;

        let (mut ws, response) = connect_async(url.as_str()).await.unwrap();
        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("peerid="));

        match next_message(&mut ws).await {
            ServerMessage::ExistingPeers { peers, me } => {
                assert!(peers.is_empty());
                assert!(cookie.starts_with(&format!("peerid={};", me.peer_id)));
            }
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cookie_is_reused_without_set_cookie() {
        let (url, room) = start().await;

        let mut request = url.as_str().into_client_request().unwrap();
        request.headers_mut().insert(
            COOKIE,
            HeaderValue::from_static("peerid=0f3c2a1b-1111-4222-8333-444455556666"),
        );
        request
            .headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static("peerdrop/0.1.0 (Linux)"));

        let (mut ws, response) = connect_async(request).await.unwrap();
        assert!(response.headers().get(SET_COOKIE).is_none());

        match next_message(&mut ws).await {
            ServerMessage::ExistingPeers { me, .. } => {
                assert_eq!(me.peer_id.as_str(), "0f3c2a1b-1111-4222-8333-444455556666");
                assert_eq!(me.device_name, "Linux peerdrop");
                assert_eq!(me.display_name, "0f3c");
            }
            other => panic!("Unexpected: {:?}", other),
        }
        assert!(room.contains(&PeerId::from("0f3c2a1b-1111-4222-8333-444455556666")).await);
    }

    #[tokio::test]
    async fn test_signal_relayed_between_clients() {
        let (url, room) = start().await;

        let (mut a, _) = connect_async(url.as_str()).await.unwrap();
        let a_id = match next_message(&mut a).await {
            ServerMessage::ExistingPeers { me, .. } => me.peer_id,
            other => panic!("Unexpected: {:?}", other),
        };

        let (mut b, _) = connect_async(url.as_str()).await.unwrap();
        let b_id = match next_message(&mut b).await {
            ServerMessage::ExistingPeers { peers, me } => {
                assert!(peers.contains_key(&a_id));
                me.peer_id
            }
            other => panic!("Unexpected: {:?}", other),
        };
        match next_message(&mut a).await {
            ServerMessage::PeerJoined(info) => assert_eq!(info.peer_id, b_id),
            other => panic!("Unexpected: {:?}", other),
        }

        let offer = SignalDetail {
            sdp: Some(SessionDescription::offer("v=0")),
            ..Default::default()
        };
        send(&mut b, Envelope::signal(&a_id, offer)).await;
        match next_message(&mut a).await {
            ServerMessage::Signal(detail) => {
                assert_eq!(detail.from, Some(b_id.clone()));
                assert!(detail.to.is_none());
                assert_eq!(detail.sdp, Some(SessionDescription::offer("v=0")));
            }
            other => panic!("Unexpected: {:?}", other),
        }

        send(&mut b, Envelope::disconnect()).await;
        match next_message(&mut a).await {
            ServerMessage::PeerLeft(id) => assert_eq!(id, b_id),
            other => panic!("Unexpected: {:?}", other),
        }
        assert_eq!(room.len().await, 1);
    }

    #[tokio::test]
    async fn test_garbage_is_ignored() {
        let (url, room) = start().await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        let me = match next_message(&mut ws).await {
            ServerMessage::ExistingPeers { me, .. } => me.peer_id,
            other => panic!("Unexpected: {:?}", other),
        };

        ws.send(Message::Text("{not json".to_string())).await.unwrap();
        send(&mut ws, Envelope::new(kind::PING, serde_json::json!({}))).await;

        // Still registered and still answered
        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap();
        match reply {
            Some(Ok(Message::Text(text))) => {
                assert_eq!(Envelope::parse(&text).unwrap().kind, kind::PONG)
            }
            other => panic!("Unexpected frame: {:?}", other),
        }
        assert!(room.contains(&me).await);
    }
}
