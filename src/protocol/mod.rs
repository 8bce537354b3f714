//! Wire formats shared by the relay and its clients
//!
//! Two envelope families exist:
//! - signaling envelopes, exchanged with the relay over the persistent connection
//!   (`{ "type": ..., "detail": {...} }`)
//! - data-channel envelopes, exchanged directly between two peers (see [`channel`])
//!
//! The relay never interprets signaling payloads beyond the `to` field, so envelopes are
//! kept as raw JSON on that side. Clients decode them into [`ServerMessage`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;

pub mod channel;

pub use channel::{ChannelFrame, ChannelMessage, FileMetadata, PartitionMark};

/// Envelope `type` values understood by the relay and its clients
pub mod kind {
    /// Snapshot of current members, sent once to a newcomer
    pub const EXISTING_PEERS: &str = "existing-peers";
    /// A member joined the room
    pub const PEER_JOINED: &str = "peer-joined";
    /// A member left the room
    pub const PEER_LEFT: &str = "peer-left";
    /// Negotiation payload relayed between two peers
    pub const SIGNAL: &str = "signal";
    /// Heartbeat probe from the relay
    pub const PING: &str = "ping";
    /// Heartbeat answer from a client
    pub const PONG: &str = "pong";
    /// Explicit leave from a client
    pub const DISCONNECT: &str = "disconnect";
}

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The message body could not be parsed
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The envelope type is not recognised
    #[error("Unknown envelope type: {0}")]
    UnknownType(String),

    /// A required field is absent
    #[error("Missing field: {0}")]
    MissingField(&'static str),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Identifier of one peer within a relay
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an identifier string
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used for display names and logs
    pub fn short(&self) -> &str {
        self.0.get(..4).unwrap_or(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId(id)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public description of a peer, broadcast to other members
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Stable identifier
    pub peer_id: PeerId,
    /// Device model, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Operating system name, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    /// Browser or client name, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    /// Device class (`mobile`, `tablet`), when known
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// Human readable device label, never empty
    pub device_name: String,
    /// Short name derived from the identifier, never empty
    pub display_name: String,
}

/// Kind of a session description
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Produced by the caller
    Offer,
    /// Produced by the recipient in response to an offer
    Answer,
}

/// Connection description exchanged during negotiation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Opaque SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network reachability candidate, in the browser's JSON shape
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    /// ICE username fragment
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Detail of a `signal` envelope
///
/// Outbound signals name the destination in `to`; the relay replaces it with `from`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDetail {
    /// Destination peer (client to relay)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    /// Originating peer (relay to client)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,
    /// Offer or answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    /// Reachability candidate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice: Option<IceCandidate>,
}

/// A signaling envelope as it travels over the persistent connection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Application-defined message type
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload
    #[serde(default)]
    pub detail: Value,
}

impl Envelope {
    /// Create an envelope with an arbitrary detail
    pub fn new(kind: impl Into<String>, detail: Value) -> Self {
        Envelope {
            kind: kind.into(),
            detail,
        }
    }

    /// Parse an envelope from its JSON text
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to JSON text
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// `existing-peers` snapshot for a newcomer
    pub fn existing_peers<'a>(peers: impl IntoIterator<Item = &'a PeerInfo>, me: &PeerInfo) -> Self {
        let peers: HashMap<&PeerId, &PeerInfo> =
            peers.into_iter().map(|info| (&info.peer_id, info)).collect();
        Envelope::new(kind::EXISTING_PEERS, json!({ "peers": peers, "self": me }))
    }

    /// `peer-joined` notification
    pub fn peer_joined(peer: &PeerInfo) -> Self {
        Envelope::new(kind::PEER_JOINED, json!({ "peer": peer }))
    }

    /// `peer-left` notification
    pub fn peer_left(peer_id: &PeerId) -> Self {
        Envelope::new(kind::PEER_LEFT, json!({ "peerId": peer_id }))
    }

    /// Heartbeat probe
    pub fn ping() -> Self {
        Envelope::new(kind::PING, json!({}))
    }

    /// Heartbeat answer
    pub fn pong() -> Self {
        Envelope::new(kind::PONG, json!({}))
    }

    /// Explicit leave
    pub fn disconnect() -> Self {
        Envelope::new(kind::DISCONNECT, json!({}))
    }

    /// Negotiation payload addressed to `to`
    pub fn signal(to: &PeerId, mut detail: SignalDetail) -> Self {
        detail.to = Some(to.clone());
        detail.from = None;
        Envelope::new(kind::SIGNAL, json!(detail))
    }
}

/// Relay-to-client messages, decoded
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// Current members and our own public info
    ExistingPeers {
        /// Other members keyed by id
        peers: HashMap<PeerId, PeerInfo>,
        /// Our own info as seen by the relay
        me: PeerInfo,
    },
    /// A member joined
    PeerJoined(PeerInfo),
    /// A member left
    PeerLeft(PeerId),
    /// Negotiation payload from another peer
    Signal(SignalDetail),
    /// Heartbeat probe
    Ping,
}

#[derive(Deserialize)]
struct ExistingPeersDetail {
    peers: HashMap<PeerId, PeerInfo>,
    #[serde(rename = "self")]
    me: PeerInfo,
}

#[derive(Deserialize)]
struct PeerJoinedDetail {
    peer: PeerInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerLeftDetail {
    peer_id: PeerId,
}

impl TryFrom<Envelope> for ServerMessage {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> ProtocolResult<Self> {
        match envelope.kind.as_str() {
            kind::EXISTING_PEERS => {
                let detail: ExistingPeersDetail = serde_json::from_value(envelope.detail)?;
                Ok(ServerMessage::ExistingPeers {
                    peers: detail.peers,
                    me: detail.me,
                })
            }
            kind::PEER_JOINED => {
                let detail: PeerJoinedDetail = serde_json::from_value(envelope.detail)?;
                Ok(ServerMessage::PeerJoined(detail.peer))
            }
            kind::PEER_LEFT => {
                let detail: PeerLeftDetail = serde_json::from_value(envelope.detail)?;
                Ok(ServerMessage::PeerLeft(detail.peer_id))
            }
            kind::SIGNAL => {
                let detail: SignalDetail = serde_json::from_value(envelope.detail)?;
                if detail.from.is_none() {
                    return Err(ProtocolError::MissingField("from"));
                }
                Ok(ServerMessage::Signal(detail))
            }
            kind::PING => Ok(ServerMessage::Ping),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}
