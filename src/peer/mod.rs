//! Local peer management
//!
//! The [`PeerManager`] keeps one [`NegotiationSession`] and one [`TransferEngine`] per
//! remote member of the room. It consumes signaling events and backend events and turns
//! them into [`PeerEvent`]s for the application.
//!
//! Roles follow arrival order: members listed in `existing-peers` are called by us, members
//! announced later by `peer-joined` call us.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::ClientEvent;
use crate::negotiation::{
    NegotiationError, NegotiationSession, RtcEvent, RtcFactory, Role, SessionContext,
    SessionState, SessionUpdate,
};
use crate::protocol::{
    ChannelFrame, ChannelMessage, Envelope, PeerId, PeerInfo, ProtocolError, ServerMessage,
};
use crate::transfer::{OutgoingFile, Outbox, TransferEngine, TransferError, TransferEvent};

/// Peer management errors
#[derive(Error, Debug)]
pub enum PeerError {
    /// No such member in the room
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// Negotiation or channel failure
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// Transfer failure
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Message could not be encoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type for peer management operations
pub type PeerResult<T> = Result<T, PeerError>;

/// Something the application should know about
#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    /// Our own public info as assigned by the relay
    Identity(PeerInfo),
    /// Members present when we (re)joined
    Peers(Vec<PeerInfo>),
    /// A member joined
    PeerJoined(PeerInfo),
    /// A member left
    PeerLeft(PeerId),
    /// Direct channel to a peer opened
    ChannelOpened(PeerId),
    /// Direct channel to a peer closed
    ChannelClosed(PeerId),
    /// Text message received
    Text {
        /// Sender
        from: PeerId,
        /// Message body
        text: String,
    },
    /// File transfer update
    Transfer {
        /// Remote side of the transfer
        peer: PeerId,
        /// What happened
        event: TransferEvent,
    },
    /// Relay connection lost
    SignalingLost,
    /// Relay connection (re)established
    SignalingRestored,
}

/// Requests from the application
#[derive(Clone, Debug)]
pub enum PeerCommand {
    /// Send a text message
    SendText {
        /// Recipient
        to: PeerId,
        /// Message body
        text: String,
    },
    /// Queue a file
    SendFile {
        /// Recipient
        to: PeerId,
        /// File to send
        file: OutgoingFile,
    },
}

type Events = mpsc::UnboundedSender<PeerEvent>;

fn emit(events: &Events, event: PeerEvent) {
    if events.send(event).is_err() {
        debug!("Nobody listens to peer events");
    }
}

struct Peer {
    info: PeerInfo,
    session: NegotiationSession,
    transfers: TransferEngine,
}

impl Peer {
    fn id(&self) -> &PeerId {
        &self.info.peer_id
    }

    async fn apply(&mut self, update: SessionUpdate, events: &Events) {
        match update {
            SessionUpdate::Unchanged => {}
            SessionUpdate::Opened => {
                emit(events, PeerEvent::ChannelOpened(self.id().clone()));
                match self.transfers.pump() {
                    Ok(outbox) => self.deliver(outbox, events).await,
                    Err(e) => warn!("Cannot start transfer to {}: {}", self.id(), e),
                }
            }
            SessionUpdate::Lost => {
                emit(events, PeerEvent::ChannelClosed(self.id().clone()));
                self.abort_transfers(events);
            }
            SessionUpdate::Frame(frame) => self.on_frame(frame, events).await,
        }
    }

    async fn on_frame(&mut self, frame: ChannelFrame, events: &Events) {
        let result = match frame {
            ChannelFrame::Text(text) => match ChannelMessage::parse(&text) {
                Ok(ChannelMessage::Text(text)) => {
                    emit(
                        events,
                        PeerEvent::Text {
                            from: self.id().clone(),
                            text,
                        },
                    );
                    return;
                }
                Ok(message) => self.transfers.handle_message(message),
                Err(e) => {
                    warn!("Ignoring malformed message from {}: {}", self.id(), e);
                    return;
                }
            },
            ChannelFrame::Binary(chunk) => self.transfers.handle_chunk(chunk),
        };

        match result {
            Ok(outbox) => self.deliver(outbox, events).await,
            Err(e) => warn!("Transfer with {} failed: {}", self.id(), e),
        }
    }

    /// Send the outbox frames in order, then report its events
    async fn deliver(&mut self, outbox: Outbox, events: &Events) {
        for frame in outbox.frames {
            if let Err(e) = self.session.send_frame(frame).await {
                // The channel-closed event that follows resets the transfer
                warn!("Failed to send to {}: {}", self.id(), e);
                break;
            }
        }
        for event in outbox.events {
            emit(
                events,
                PeerEvent::Transfer {
                    peer: self.id().clone(),
                    event,
                },
            );
        }
    }

    fn abort_transfers(&mut self, events: &Events) {
        for event in self.transfers.reset() {
            emit(
                events,
                PeerEvent::Transfer {
                    peer: self.id().clone(),
                    event,
                },
            );
        }
    }

    async fn close(&mut self, events: &Events) {
        let was_open = self.session.is_open();
        self.session.close().await;
        if was_open {
            emit(events, PeerEvent::ChannelClosed(self.id().clone()));
        }
        self.abort_transfers(events);
    }
}

/// Sessions and transfers with every other member of the room
pub struct PeerManager {
    context: SessionContext,
    rtc_events: mpsc::UnboundedReceiver<RtcEvent>,
    events: Events,
    peers: HashMap<PeerId, Peer>,
    me: Option<PeerInfo>,
}

impl PeerManager {
    /// Create a manager sending signals through `signals`
    pub fn new(
        factory: Arc<dyn RtcFactory>,
        signals: mpsc::UnboundedSender<Envelope>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (rtc_tx, rtc_events) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = PeerManager {
            context: SessionContext {
                factory,
                signals,
                events: rtc_tx,
            },
            rtc_events,
            events,
            peers: HashMap::new(),
            me: None,
        };
        (manager, events_rx)
    }

    /// Our own info, once the relay assigned it
    pub fn me(&self) -> Option<&PeerInfo> {
        self.me.as_ref()
    }

    /// Known members, sorted by id
    pub fn peers(&self) -> Vec<&PeerInfo> {
        let mut peers: Vec<&PeerInfo> = self.peers.values().map(|peer| &peer.info).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Our role towards `peer`
    pub fn role(&self, peer: &PeerId) -> Option<Role> {
        self.peers.get(peer).map(|peer| peer.session.role())
    }

    /// Negotiation state towards `peer`
    pub fn session_state(&self, peer: &PeerId) -> Option<SessionState> {
        self.peers.get(peer).map(|peer| peer.session.state())
    }

    /// Process events until signaling stops or the command channel closes
    pub async fn run(
        mut self,
        mut signaling: mpsc::UnboundedReceiver<ClientEvent>,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) {
        loop {
            tokio::select! {
                event = signaling.recv() => match event {
                    Some(event) => self.handle_client_event(event).await,
                    None => break,
                },

                Some(event) = self.rtc_events.recv() => self.handle_rtc_event(event).await,

                command = commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.handle_command(command).await {
                            warn!("{}", e);
                        }
                    }
                    None => break,
                },
            }
        }
        self.shutdown().await;
    }

    /// Close every session
    pub async fn shutdown(&mut self) {
        let peers: Vec<Peer> = self.peers.drain().map(|(_, peer)| peer).collect();
        for mut peer in peers {
            peer.close(&self.events).await;
        }
    }

    /// React to the signaling connection
    pub async fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected => emit(&self.events, PeerEvent::SignalingRestored),
            ClientEvent::Disconnected => emit(&self.events, PeerEvent::SignalingLost),
            ClientEvent::Message(message) => self.handle_server_message(message).await,
        }
    }

    /// React to a relay message
    pub async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::ExistingPeers { peers, me } => {
                // A fresh snapshot supersedes everything negotiated before
                self.shutdown().await;

                info!("Joined as {} ({})", me.display_name, me.device_name);
                emit(&self.events, PeerEvent::Identity(me.clone()));
                self.me = Some(me);

                let mut peers: Vec<PeerInfo> = peers.into_values().collect();
                peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
                emit(&self.events, PeerEvent::Peers(peers.clone()));
                for info in peers {
                    self.add_peer(info, Role::Caller).await;
                }
            }

            ServerMessage::PeerJoined(info) => {
                info!("{} joined", info.display_name);
                emit(&self.events, PeerEvent::PeerJoined(info.clone()));
                self.add_peer(info, Role::Recipient).await;
            }

            ServerMessage::PeerLeft(peer_id) => {
                if let Some(mut peer) = self.peers.remove(&peer_id) {
                    info!("{} left", peer.info.display_name);
                    peer.close(&self.events).await;
                }
                emit(&self.events, PeerEvent::PeerLeft(peer_id));
            }

            ServerMessage::Signal(detail) => {
                let Some(from) = detail.from.clone() else {
                    warn!("Dropping signal without sender");
                    return;
                };
                let Some(peer) = self.peers.get_mut(&from) else {
                    debug!("Dropping signal from unknown peer {}", from);
                    return;
                };
                match peer.session.on_signal(detail).await {
                    Ok(update) => peer.apply(update, &self.events).await,
                    Err(e) => warn!("Negotiation with {} failed: {}", from, e),
                }
            }

            ServerMessage::Ping => {}
        }
    }

    /// React to a backend event
    pub async fn handle_rtc_event(&mut self, event: RtcEvent) {
        let remote = event.remote.clone();
        let Some(peer) = self.peers.get_mut(&remote) else {
            debug!("Dropping event for departed peer {}", remote);
            return;
        };
        match peer.session.on_event(event).await {
            Ok(update) => peer.apply(update, &self.events).await,
            Err(e) => warn!("Negotiation with {} failed: {}", remote, e),
        }
    }

    /// Execute an application request
    pub async fn handle_command(&mut self, command: PeerCommand) -> PeerResult<()> {
        match command {
            PeerCommand::SendText { to, text } => self.send_text(&to, &text).await,
            PeerCommand::SendFile { to, file } => self.send_file(&to, file).await,
        }
    }

    /// Send a text message; fails if no channel is open and asks for a new one
    pub async fn send_text(&mut self, to: &PeerId, text: &str) -> PeerResult<()> {
        let peer = self
            .peers
            .get_mut(to)
            .ok_or_else(|| PeerError::UnknownPeer(to.clone()))?;

        if !peer.session.is_open() {
            peer.session.refresh().await?;
            return Err(NegotiationError::ChannelClosed.into());
        }
        peer.session
            .send_message(&ChannelMessage::Text(text.to_string()))
            .await?;
        Ok(())
    }

    /// Queue a file; it goes out once the channel is open and earlier files are done
    pub async fn send_file(&mut self, to: &PeerId, file: OutgoingFile) -> PeerResult<()> {
        let peer = self
            .peers
            .get_mut(to)
            .ok_or_else(|| PeerError::UnknownPeer(to.clone()))?;

        peer.transfers.enqueue(file);
        if peer.session.is_open() {
            let outbox = peer.transfers.pump()?;
            peer.deliver(outbox, &self.events).await;
        } else {
            peer.session.refresh().await?;
        }
        Ok(())
    }

    async fn add_peer(&mut self, info: PeerInfo, role: Role) {
        if let Some(mut previous) = self.peers.remove(&info.peer_id) {
            debug!("Replacing session with {}", info.peer_id);
            previous.close(&self.events).await;
        }

        let mut session = NegotiationSession::new(info.peer_id.clone(), role, self.context.clone());
        if let Err(e) = session.start().await {
            warn!("Cannot start negotiation with {}: {}", info.peer_id, e);
        }
        self.peers.insert(
            info.peer_id.clone(),
            Peer {
                info,
                session,
                transfers: TransferEngine::new(),
            },
        );
    }
}
