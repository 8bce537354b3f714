//! Per-peer negotiation state machine
//!
//! A [`NegotiationSession`] drives the offer/answer/ICE exchange for one remote peer and
//! tracks whether a direct data channel is open. The actual peer connection is supplied by
//! an [`RtcFactory`] backend:
//! - [`loopback`] connects peers in-process (tests, demos)
//! - `webrtc` (feature `rtc`) uses the native WebRTC stack
//!
//! Backends report asynchronously through an [`RtcEventSink`]. Every event carries the
//! generation of the connection that produced it, so events from a torn-down connection
//! are ignored instead of corrupting its replacement.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DATA_CHANNEL_LABEL;
use crate::protocol::{
    ChannelFrame, ChannelMessage, Envelope, IceCandidate, PeerId, ProtocolError, SdpKind,
    SessionDescription, SignalDetail,
};

pub mod loopback;
#[cfg(feature = "rtc")]
pub mod webrtc;

/// Negotiation errors
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// The connection backend failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// No open data channel to send on
    #[error("Data channel is not open")]
    ChannelClosed,

    /// The session was destroyed
    #[error("Session is closed")]
    SessionClosed,

    /// A candidate or answer arrived before the description it depends on
    #[error("Remote description not set")]
    NoRemoteDescription,

    /// The signaling connection is gone
    #[error("Signaling connection closed")]
    SignalingClosed,

    /// Message could not be encoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type for negotiation operations
pub type NegotiationResult<T> = Result<T, NegotiationError>;

/// Which side originates offers for a pairing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Sends the offer and owns retries
    Caller,
    /// Only answers
    Recipient,
}

/// Lifecycle of a [`NegotiationSession`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing in flight
    Idle,
    /// Offer/answer exchange or transport setup in progress
    Connecting,
    /// Data channel usable
    ChannelOpen,
    /// Destroyed; terminal
    Closed,
}

/// Peer connection state as reported by a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Created, nothing exchanged yet
    New,
    /// Transport establishment in progress
    Connecting,
    /// Transport up
    Connected,
    /// Transport lost, may recover on its own
    Disconnected,
    /// Transport failed
    Failed,
    /// Connection closed
    Closed,
}

impl LinkState {
    /// Whether this state ends the usefulness of the connection
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed | LinkState::Closed)
    }
}

/// A direct, ordered, reliable message channel to one peer
#[async_trait]
pub trait DataChannel: Send + Sync + fmt::Debug {
    /// Send a text frame
    async fn send_text(&self, text: &str) -> NegotiationResult<()>;

    /// Send a binary frame
    async fn send_binary(&self, data: Bytes) -> NegotiationResult<()>;

    /// Whether frames can currently be sent
    fn is_open(&self) -> bool;

    /// Close the channel
    async fn close(&self) -> NegotiationResult<()>;
}

/// One negotiable peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Produce an offer description
    async fn create_offer(&self) -> NegotiationResult<SessionDescription>;

    /// Produce an answer to the applied remote offer
    async fn create_answer(&self) -> NegotiationResult<SessionDescription>;

    /// Apply our own description; starts candidate gathering
    async fn set_local_description(&self, description: SessionDescription) -> NegotiationResult<()>;

    /// Apply the remote side's description
    async fn set_remote_description(&self, description: SessionDescription)
        -> NegotiationResult<()>;

    /// Add a remote reachability candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> NegotiationResult<()>;

    /// Create the outgoing data channel; it is reported through
    /// [`RtcEventKind::ChannelOpen`] once usable
    async fn create_data_channel(&self, label: &str) -> NegotiationResult<()>;

    /// Tear down the connection
    async fn close(&self) -> NegotiationResult<()>;
}

/// Creates peer connections for a backend
#[async_trait]
pub trait RtcFactory: Send + Sync {
    /// Create a connection to `remote` reporting into `events`
    async fn new_connection(
        &self,
        remote: &PeerId,
        events: RtcEventSink,
    ) -> NegotiationResult<Arc<dyn PeerConnection>>;
}

/// Asynchronous report from a backend
#[derive(Clone, Debug)]
pub struct RtcEvent {
    /// Peer the connection belongs to
    pub remote: PeerId,
    /// Generation of the reporting connection
    pub generation: u64,
    /// What happened
    pub kind: RtcEventKind,
}

/// Kinds of backend reports
#[derive(Clone, Debug)]
pub enum RtcEventKind {
    /// A local candidate to forward to the remote peer
    LocalCandidate(IceCandidate),
    /// Connection state change
    LinkState(LinkState),
    /// A data channel (ours or the remote's) became usable
    ChannelOpen(Arc<dyn DataChannel>),
    /// The data channel closed
    ChannelClosed,
    /// A frame arrived on the data channel
    Frame(ChannelFrame),
}

/// Where a backend connection sends its events
#[derive(Clone, Debug)]
pub struct RtcEventSink {
    remote: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<RtcEvent>,
}

impl RtcEventSink {
    /// Sink for connection `generation` towards `remote`
    pub fn new(remote: PeerId, generation: u64, tx: mpsc::UnboundedSender<RtcEvent>) -> Self {
        RtcEventSink {
            remote,
            generation,
            tx,
        }
    }

    /// Report an event; silently dropped if nobody listens anymore
    pub fn emit(&self, kind: RtcEventKind) {
        let _ = self.tx.send(RtcEvent {
            remote: self.remote.clone(),
            generation: self.generation,
            kind,
        });
    }

    /// Peer this sink reports for
    pub fn remote(&self) -> &PeerId {
        &self.remote
    }
}

/// Everything a session needs from its owner
#[derive(Clone)]
pub struct SessionContext {
    /// Connection backend
    pub factory: Arc<dyn RtcFactory>,
    /// Outbound signaling envelopes
    pub signals: mpsc::UnboundedSender<Envelope>,
    /// Backend events, shared by all sessions of one owner
    pub events: mpsc::UnboundedSender<RtcEvent>,
}

/// Result of feeding an event to a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionUpdate {
    /// Nothing the owner needs to act on
    Unchanged,
    /// The data channel opened
    Opened,
    /// The open data channel was lost
    Lost,
    /// A frame arrived
    Frame(ChannelFrame),
}

/// Negotiation with one remote peer
pub struct NegotiationSession {
    remote: PeerId,
    role: Role,
    state: SessionState,
    generation: u64,
    connection: Option<Arc<dyn PeerConnection>>,
    channel: Option<Arc<dyn DataChannel>>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    context: SessionContext,
}

impl NegotiationSession {
    /// Create an idle session; callers must [`start`](Self::start) it
    pub fn new(remote: PeerId, role: Role, context: SessionContext) -> Self {
        NegotiationSession {
            remote,
            role,
            state: SessionState::Idle,
            generation: 0,
            connection: None,
            channel: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            context,
        }
    }

    /// Remote peer
    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    /// Role fixed at creation
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Generation of the current connection
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the data channel is usable
    pub fn is_open(&self) -> bool {
        self.state == SessionState::ChannelOpen
            && self.channel.as_ref().map_or(false, |channel| channel.is_open())
    }

    /// Begin negotiating
    ///
    /// A Caller opens a connection and sends an offer. A Recipient stays idle until the
    /// remote peer's offer arrives.
    pub async fn start(&mut self) -> NegotiationResult<()> {
        match (self.role, self.state) {
            (_, SessionState::Closed) => Err(NegotiationError::SessionClosed),
            (Role::Recipient, _) => Ok(()),
            (Role::Caller, _) => self.send_offer().await,
        }
    }

    /// Restart a Caller that is neither connecting nor connected
    pub async fn refresh(&mut self) -> NegotiationResult<()> {
        if self.role == Role::Caller && self.state == SessionState::Idle {
            info!("Refreshing connection to {}", self.remote);
            self.send_offer().await?;
        }
        Ok(())
    }

    /// Handle a relayed signal from the remote peer
    ///
    /// Returns [`SessionUpdate::Lost`] when a fresh offer replaces an open channel.
    pub async fn on_signal(&mut self, detail: SignalDetail) -> NegotiationResult<SessionUpdate> {
        if self.state == SessionState::Closed {
            debug!("Ignoring signal for closed session {}", self.remote);
            return Ok(SessionUpdate::Unchanged);
        }
        let was_open = self.state == SessionState::ChannelOpen;
        if self.role == Role::Recipient && self.state == SessionState::Idle {
            self.state = SessionState::Connecting;
        }

        if let Some(description) = detail.sdp {
            match description.kind {
                SdpKind::Offer => self.accept_offer(description).await?,
                SdpKind::Answer => self.accept_answer(description).await?,
            }
        }

        if let Some(candidate) = detail.ice {
            match &self.connection {
                Some(connection) if self.remote_description_set => {
                    connection.add_ice_candidate(candidate).await?;
                }
                _ => {
                    debug!("Buffering early candidate from {}", self.remote);
                    self.pending_candidates.push(candidate);
                }
            }
        }

        Ok(if was_open && self.state != SessionState::ChannelOpen {
            SessionUpdate::Lost
        } else {
            SessionUpdate::Unchanged
        })
    }

    /// Handle a backend event; events from older connections are ignored
    pub async fn on_event(&mut self, event: RtcEvent) -> NegotiationResult<SessionUpdate> {
        if event.generation != self.generation || self.state == SessionState::Closed {
            debug!(
                "Dropping stale event from {} (generation {} != {})",
                self.remote, event.generation, self.generation
            );
            return Ok(SessionUpdate::Unchanged);
        }

        match event.kind {
            RtcEventKind::LocalCandidate(candidate) => {
                self.signal(SignalDetail {
                    ice: Some(candidate),
                    ..Default::default()
                })?;
                Ok(SessionUpdate::Unchanged)
            }

            RtcEventKind::LinkState(state) => {
                debug!("Link to {} is {:?}", self.remote, state);
                if state.is_terminal() {
                    self.on_link_lost().await
                } else {
                    Ok(SessionUpdate::Unchanged)
                }
            }

            RtcEventKind::ChannelOpen(channel) => {
                info!("Data channel to {} open", self.remote);
                self.channel = Some(channel);
                self.state = SessionState::ChannelOpen;
                Ok(SessionUpdate::Opened)
            }

            RtcEventKind::ChannelClosed => self.on_link_lost().await,

            RtcEventKind::Frame(frame) => Ok(SessionUpdate::Frame(frame)),
        }
    }

    /// Send a control message over the data channel
    pub async fn send_message(&self, message: &ChannelMessage) -> NegotiationResult<()> {
        let text = message.to_json()?;
        self.open_channel()?.send_text(&text).await
    }

    /// Send one frame over the data channel
    pub async fn send_frame(&self, frame: ChannelFrame) -> NegotiationResult<()> {
        let channel = self.open_channel()?;
        match frame {
            ChannelFrame::Text(text) => channel.send_text(&text).await,
            ChannelFrame::Binary(data) => channel.send_binary(data).await,
        }
    }

    /// Destroy the session; terminal
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.teardown().await;
        self.state = SessionState::Closed;
        info!("Closed session with {}", self.remote);
    }

    fn open_channel(&self) -> NegotiationResult<&Arc<dyn DataChannel>> {
        match &self.channel {
            Some(channel) if self.state == SessionState::ChannelOpen && channel.is_open() => {
                Ok(channel)
            }
            _ => Err(NegotiationError::ChannelClosed),
        }
    }

    async fn send_offer(&mut self) -> NegotiationResult<()> {
        let connection = self.open_connection().await?;
        self.state = SessionState::Connecting;

        connection.create_data_channel(DATA_CHANNEL_LABEL).await?;
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;

        debug!("Sending offer to {}", self.remote);
        self.signal(SignalDetail {
            sdp: Some(offer),
            ..Default::default()
        })
    }

    async fn accept_offer(&mut self, offer: SessionDescription) -> NegotiationResult<()> {
        if self.role == Role::Caller {
            warn!("Ignoring offer from {}: we are the caller", self.remote);
            return Ok(());
        }

        // A fresh offer after a completed exchange means the caller restarted
        let reusable = self
            .connection
            .clone()
            .filter(|_| !self.remote_description_set);
        let connection = match reusable {
            Some(connection) => connection,
            None => self.open_connection().await?,
        };
        self.state = SessionState::Connecting;

        connection.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.flush_candidates(&connection).await?;

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;

        debug!("Sending answer to {}", self.remote);
        self.signal(SignalDetail {
            sdp: Some(answer),
            ..Default::default()
        })
    }

    async fn accept_answer(&mut self, answer: SessionDescription) -> NegotiationResult<()> {
        let connection = match &self.connection {
            Some(connection) if self.role == Role::Caller && !self.remote_description_set => {
                connection.clone()
            }
            _ => {
                warn!("Ignoring unexpected answer from {}", self.remote);
                return Ok(());
            }
        };

        connection.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.flush_candidates(&connection).await
    }

    async fn flush_candidates(&mut self, connection: &Arc<dyn PeerConnection>) -> NegotiationResult<()> {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            connection.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn on_link_lost(&mut self) -> NegotiationResult<SessionUpdate> {
        let was_open = self.state == SessionState::ChannelOpen;
        self.teardown().await;

        match self.role {
            Role::Caller => {
                info!("Connection to {} lost, renegotiating", self.remote);
                self.state = SessionState::Idle;
                self.send_offer().await?;
            }
            Role::Recipient => {
                info!("Connection to {} lost, waiting for a new offer", self.remote);
                self.state = SessionState::Idle;
            }
        }

        Ok(if was_open {
            SessionUpdate::Lost
        } else {
            SessionUpdate::Unchanged
        })
    }

    async fn open_connection(&mut self) -> NegotiationResult<Arc<dyn PeerConnection>> {
        self.teardown().await;

        let sink = RtcEventSink::new(
            self.remote.clone(),
            self.generation,
            self.context.events.clone(),
        );
        let connection = self
            .context
            .factory
            .new_connection(&self.remote, sink)
            .await?;
        self.connection = Some(connection.clone());
        Ok(connection)
    }

    /// Drop the current connection; later events from it are ignored
    ///
    /// Candidates buffered before any connection existed are kept for the next one.
    async fn teardown(&mut self) {
        self.generation += 1;
        self.remote_description_set = false;

        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!("Closing channel to {}: {}", self.remote, e);
            }
        }
        if let Some(connection) = self.connection.take() {
            self.pending_candidates.clear();
            if let Err(e) = connection.close().await {
                debug!("Closing connection to {}: {}", self.remote, e);
            }
        }
    }

    fn signal(&self, detail: SignalDetail) -> NegotiationResult<()> {
        self.context
            .signals
            .send(Envelope::signal(&self.remote, detail))
            .map_err(|_| NegotiationError::SignalingClosed)
    }
}

impl fmt::Debug for NegotiationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationSession")
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish()
    }
}
