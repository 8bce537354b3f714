//! Signaling relay
//!
//! The relay keeps one [`Room`]: the authoritative map of connected peers. Every
//! membership change and every forwarded envelope goes through the room's lock, so
//! join/leave/relay are serialized against each other.
//!
//! - `join` notifies existing members, sends the newcomer a snapshot, then inserts it
//! - `leave` is idempotent and notifies the remaining members after removal
//! - `relay` rewrites `to` into `from` and forwards on a best-effort basis
//! - each session runs its own heartbeat timer, cancelled on leave

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::protocol::{kind, Envelope, PeerId, PeerInfo};

pub mod device;
pub mod identity;
pub mod server;

pub use device::DeviceInfo;
pub use identity::ResolvedIdentity;
pub use server::{RelayServer, ServerError, ServerResult};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Instruction for a connection's writer task
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// Write an envelope
    Envelope(Envelope),
    /// Close the underlying transport
    Close,
}

/// Send/close capability for one connection
///
/// Each handle carries a serial so a stale connection can never act on a newer session
/// registered under the same peer id.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    serial: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle {
    /// Wrap the sending half of a connection's outbound queue
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        SessionHandle {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Create a handle together with the queue its writer drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionHandle::new(tx), rx)
    }

    /// Connection serial
    pub fn serial(&self) -> u64 {
        self.serial
    }

    fn send(&self, envelope: Envelope) {
        if self.tx.send(Outbound::Envelope(envelope)).is_err() {
            debug!("Connection {} already closed", self.serial);
        }
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// What happened to a relayed envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Forwarded to the destination
    Delivered,
    /// Destination not registered; dropped
    UnknownRecipient,
    /// No usable `to` field; dropped
    Invalid,
}

struct PeerSession {
    info: PeerInfo,
    handle: SessionHandle,
    heartbeat: Option<JoinHandle<()>>,
    awaiting_pong: bool,
    missed_heartbeats: u32,
    last_heartbeat_at: Instant,
}

/// Registry of the peers connected to one relay
pub struct Room {
    members: Mutex<HashMap<PeerId, PeerSession>>,
    heartbeat_interval: Duration,
    max_missed_heartbeats: u32,
    this: Weak<Room>,
}

impl Room {
    /// Create an empty room
    pub fn new(heartbeat_interval: Duration, max_missed_heartbeats: u32) -> Arc<Self> {
        Arc::new_cyclic(|this| Room {
            members: Mutex::new(HashMap::new()),
            heartbeat_interval,
            max_missed_heartbeats: max_missed_heartbeats.max(1),
            this: this.clone(),
        })
    }

    /// Create an empty room with the heartbeat settings of `config`
    pub fn from_config(config: &RelayConfig) -> Arc<Self> {
        Room::new(config.heartbeat_interval, config.max_missed_heartbeats)
    }

    /// Register a new session
    ///
    /// Existing members receive `peer-joined`, the newcomer receives `existing-peers`
    /// listing exactly those members, and only then is the newcomer inserted. A session
    /// already registered under the same id is evicted first.
    pub async fn join(&self, info: PeerInfo, handle: SessionHandle) {
        let mut members = self.members.lock().await;

        if members.contains_key(&info.peer_id) {
            info!("Peer {} reconnected, replacing previous session", info.peer_id);
            Self::remove_locked(&mut members, &info.peer_id);
        }

        let joined = Envelope::peer_joined(&info);
        for other in members.values() {
            other.handle.send(joined.clone());
        }
        handle.send(Envelope::existing_peers(
            members.values().map(|session| &session.info),
            &info,
        ));

        let heartbeat = self.spawn_heartbeat(info.peer_id.clone(), handle.serial());
        info!(
            "Peer {} ({}) joined, {} peers",
            info.peer_id,
            info.device_name,
            members.len() + 1
        );
        members.insert(
            info.peer_id.clone(),
            PeerSession {
                info,
                handle,
                heartbeat: Some(heartbeat),
                awaiting_pong: false,
                missed_heartbeats: 0,
                last_heartbeat_at: Instant::now(),
            },
        );
    }

    /// Remove a session; returns `false` if `peer_id` was not registered
    pub async fn leave(&self, peer_id: &PeerId) -> bool {
        let mut members = self.members.lock().await;
        Self::remove_locked(&mut members, peer_id)
    }

    /// Remove a session only if it still belongs to connection `serial`
    pub async fn leave_connection(&self, peer_id: &PeerId, serial: u64) -> bool {
        let mut members = self.members.lock().await;
        match members.get(peer_id) {
            Some(session) if session.handle.serial == serial => {
                Self::remove_locked(&mut members, peer_id)
            }
            _ => false,
        }
    }

    /// Forward `envelope` to the peer named in its `detail.to`
    ///
    /// `to` is removed and `from = sender` injected. Unknown recipients and envelopes
    /// without a usable `to` are dropped; the sender is never told.
    pub async fn relay(&self, sender: &PeerId, envelope: Envelope) -> RelayOutcome {
        let Envelope { kind, mut detail } = envelope;

        let Some(fields) = detail.as_object_mut() else {
            debug!("Dropping {} from {}: detail is not an object", kind, sender);
            return RelayOutcome::Invalid;
        };
        let recipient = match fields.remove("to") {
            Some(Value::String(to)) if !to.is_empty() => PeerId::from(to),
            _ => {
                debug!("Dropping {} from {}: no recipient", kind, sender);
                return RelayOutcome::Invalid;
            }
        };
        fields.insert("from".to_string(), Value::String(sender.to_string()));

        let members = self.members.lock().await;
        match members.get(&recipient) {
            Some(session) => {
                debug!("Relaying {} from {} to {}", kind, sender, recipient);
                session.handle.send(Envelope { kind, detail });
                RelayOutcome::Delivered
            }
            None => {
                warn!(
                    "Dropping {} from {}: unknown recipient {}",
                    kind, sender, recipient
                );
                RelayOutcome::UnknownRecipient
            }
        }
    }

    /// Note a heartbeat answer from connection `serial`
    pub async fn record_pong(&self, peer_id: &PeerId, serial: u64) {
        let mut members = self.members.lock().await;
        if let Some(session) = members
            .get_mut(peer_id)
            .filter(|session| session.handle.serial == serial)
        {
            session.awaiting_pong = false;
            session.missed_heartbeats = 0;
            session.last_heartbeat_at = Instant::now();
        }
    }

    /// Dispatch an envelope received on connection `serial` of `peer_id`
    pub async fn handle_message(&self, peer_id: &PeerId, serial: u64, envelope: Envelope) {
        match envelope.kind.as_str() {
            kind::PONG => self.record_pong(peer_id, serial).await,
            kind::DISCONNECT => {
                info!("Peer {} disconnected", peer_id);
                self.leave_connection(peer_id, serial).await;
            }
            kind::PING => {
                let members = self.members.lock().await;
                if let Some(session) = members
                    .get(peer_id)
                    .filter(|session| session.handle.serial == serial)
                {
                    session.handle.send(Envelope::pong());
                }
            }
            _ => {
                if !self.is_current(peer_id, serial).await {
                    debug!("Ignoring {} from stale connection of {}", envelope.kind, peer_id);
                    return;
                }
                self.relay(peer_id, envelope).await;
            }
        }
    }

    /// Whether `peer_id` is registered
    pub async fn contains(&self, peer_id: &PeerId) -> bool {
        self.members.lock().await.contains_key(peer_id)
    }

    /// Public info of every member
    pub async fn members(&self) -> Vec<PeerInfo> {
        let members = self.members.lock().await;
        members.values().map(|session| session.info.clone()).collect()
    }

    /// Number of members
    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    /// Whether the room has no members
    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.is_empty()
    }

    async fn is_current(&self, peer_id: &PeerId, serial: u64) -> bool {
        let members = self.members.lock().await;
        members
            .get(peer_id)
            .map_or(false, |session| session.handle.serial == serial)
    }

    fn remove_locked(members: &mut HashMap<PeerId, PeerSession>, peer_id: &PeerId) -> bool {
        let Some(session) = members.remove(peer_id) else {
            return false;
        };

        if let Some(timer) = session.heartbeat {
            timer.abort();
        }
        session.handle.close();

        let left = Envelope::peer_left(peer_id);
        for other in members.values() {
            other.handle.send(left.clone());
        }
        info!("Peer {} left, {} peers", peer_id, members.len());
        true
    }

    fn spawn_heartbeat(&self, peer_id: PeerId, serial: u64) -> JoinHandle<()> {
        let room = self.this.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(room) = room.upgrade() else { break };
                if !room.heartbeat_tick(&peer_id, serial).await {
                    break;
                }
            }
        })
    }

    /// One heartbeat cycle; returns `false` once the session is gone
    async fn heartbeat_tick(&self, peer_id: &PeerId, serial: u64) -> bool {
        let mut members = self.members.lock().await;
        let Some(session) = members
            .get_mut(peer_id)
            .filter(|session| session.handle.serial == serial)
        else {
            return false;
        };

        if session.awaiting_pong {
            session.missed_heartbeats += 1;
            if session.missed_heartbeats >= self.max_missed_heartbeats {
                warn!(
                    "Peer {} missed {} heartbeats (last answer {:?} ago), removing",
                    peer_id,
                    session.missed_heartbeats,
                    session.last_heartbeat_at.elapsed()
                );
                Self::remove_locked(&mut members, peer_id);
                return false;
            }
        }

        session.awaiting_pong = true;
        session.handle.send(Envelope::ping());
        true
    }
}
