//! In-process negotiation backend
//!
//! Pairs peer connections created through the same [`LoopbackNetwork`] without any
//! networking. A caller's connection links with the recipient's connection for the same
//! pair as soon as the caller applies the answer; both sides then receive
//! [`RtcEventKind::ChannelOpen`]. Links can be severed to simulate transport failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::{
    DataChannel, LinkState, NegotiationError, NegotiationResult, PeerConnection, RtcEventKind,
    RtcEventSink, RtcFactory,
};
use crate::protocol::{ChannelFrame, IceCandidate, PeerId, SdpKind, SessionDescription};

type Registry = HashMap<(PeerId, PeerId), Weak<Endpoint>>;

/// Shared switchboard for loopback connections
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<Registry>>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection factory for the peer `local`
    pub fn factory(&self, local: PeerId) -> LoopbackFactory {
        LoopbackFactory {
            local,
            network: self.clone(),
        }
    }

    /// Break the link between `a` and `b`; both sides observe a failed connection
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(endpoint) = self.endpoint(local, remote) {
                if let Some(channel) = endpoint.state().channel.take() {
                    channel.open.store(false, Ordering::SeqCst);
                }
                endpoint.sink.emit(RtcEventKind::LinkState(LinkState::Failed));
            }
        }
    }

    /// Whether `a` currently has an open channel to `b`
    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.endpoint(a, b)
            .and_then(|endpoint| endpoint.state().channel.clone())
            .map_or(false, |channel| channel.is_open())
    }

    /// Remote candidates applied to `local`'s current connection towards `remote`
    pub fn candidates_added(&self, local: &PeerId, remote: &PeerId) -> usize {
        self.endpoint(local, remote)
            .map_or(0, |endpoint| endpoint.candidates.load(Ordering::SeqCst))
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoint(&self, local: &PeerId, remote: &PeerId) -> Option<Arc<Endpoint>> {
        self.registry()
            .get(&(local.clone(), remote.clone()))
            .and_then(Weak::upgrade)
    }

    fn register(&self, endpoint: &Arc<Endpoint>) {
        self.registry().insert(
            (endpoint.local.clone(), endpoint.remote.clone()),
            Arc::downgrade(endpoint),
        );
    }

    fn unregister(&self, endpoint: &Arc<Endpoint>) {
        let mut registry = self.registry();
        let key = (endpoint.local.clone(), endpoint.remote.clone());
        let current = registry
            .get(&key)
            .map_or(false, |weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(endpoint)));
        if current {
            registry.remove(&key);
        }
    }
}

/// Creates loopback connections for one local peer
#[derive(Clone)]
pub struct LoopbackFactory {
    local: PeerId,
    network: LoopbackNetwork,
}

#[async_trait]
impl RtcFactory for LoopbackFactory {
    async fn new_connection(
        &self,
        remote: &PeerId,
        events: RtcEventSink,
    ) -> NegotiationResult<Arc<dyn PeerConnection>> {
        let endpoint = Arc::new(Endpoint {
            local: self.local.clone(),
            remote: remote.clone(),
            sink: events,
            state: Mutex::new(EndpointState::default()),
            candidates: AtomicUsize::new(0),
        });
        self.network.register(&endpoint);

        Ok(Arc::new(LoopbackConnection {
            endpoint,
            network: self.network.clone(),
        }))
    }
}

#[derive(Default)]
struct EndpointState {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    channel_label: Option<String>,
    channel: Option<Arc<LoopbackChannel>>,
    closed: bool,
}

struct Endpoint {
    local: PeerId,
    remote: PeerId,
    sink: RtcEventSink,
    state: Mutex<EndpointState>,
    candidates: AtomicUsize,
}

impl Endpoint {
    fn state(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct LoopbackConnection {
    endpoint: Arc<Endpoint>,
    network: LoopbackNetwork,
}

impl LoopbackConnection {
    fn ensure_open(&self) -> NegotiationResult<()> {
        if self.endpoint.state().closed {
            Err(NegotiationError::Backend("connection closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Join with the remote peer's connection once the answer is applied
    fn link(&self) {
        let local = &self.endpoint;
        let Some(peer) = self.network.endpoint(&local.remote, &local.local) else {
            warn!("No loopback peer for {} -> {}", local.local, local.remote);
            local.sink.emit(RtcEventKind::LinkState(LinkState::Failed));
            return;
        };

        let answered = {
            let peer_state = peer.state();
            !peer_state.closed
                && matches!(
                    &peer_state.local_description,
                    Some(SessionDescription { kind: SdpKind::Answer, .. })
                )
        };
        if !answered {
            local.sink.emit(RtcEventKind::LinkState(LinkState::Failed));
            return;
        }

        local.sink.emit(RtcEventKind::LinkState(LinkState::Connected));
        peer.sink.emit(RtcEventKind::LinkState(LinkState::Connected));

        let Some(label) = local.state().channel_label.clone() else {
            return;
        };
        let open = Arc::new(AtomicBool::new(true));
        let ours = Arc::new(LoopbackChannel {
            label: label.clone(),
            open: open.clone(),
            local: local.sink.clone(),
            peer: peer.sink.clone(),
        });
        let theirs = Arc::new(LoopbackChannel {
            label,
            open,
            local: peer.sink.clone(),
            peer: local.sink.clone(),
        });
        local.state().channel = Some(ours.clone());
        peer.state().channel = Some(theirs.clone());

        debug!(
            "Loopback link {} <-> {} up, channel '{}'",
            local.local,
            local.remote,
            ours.label()
        );
        local.sink.emit(RtcEventKind::ChannelOpen(ours));
        peer.sink.emit(RtcEventKind::ChannelOpen(theirs));
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> NegotiationResult<SessionDescription> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!(
            "loopback offer {} -> {}",
            self.endpoint.local, self.endpoint.remote
        )))
    }

    async fn create_answer(&self) -> NegotiationResult<SessionDescription> {
        self.ensure_open()?;
        match &self.endpoint.state().remote_description {
            Some(SessionDescription {
                kind: SdpKind::Offer,
                ..
            }) => Ok(SessionDescription::answer(format!(
                "loopback answer {} -> {}",
                self.endpoint.local, self.endpoint.remote
            ))),
            _ => Err(NegotiationError::NoRemoteDescription),
        }
    }

    async fn set_local_description(&self, description: SessionDescription) -> NegotiationResult<()> {
        self.ensure_open()?;
        self.endpoint.state().local_description = Some(description);

        self.endpoint
            .sink
            .emit(RtcEventKind::LocalCandidate(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 127.0.0.1 9 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            }));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> NegotiationResult<()> {
        self.ensure_open()?;
        let kind = description.kind;
        self.endpoint.state().remote_description = Some(description);

        if kind == SdpKind::Answer {
            self.link();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> NegotiationResult<()> {
        self.ensure_open()?;
        if self.endpoint.state().remote_description.is_none() {
            return Err(NegotiationError::NoRemoteDescription);
        }
        self.endpoint.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> NegotiationResult<()> {
        self.ensure_open()?;
        self.endpoint.state().channel_label = Some(label.to_string());
        Ok(())
    }

    async fn close(&self) -> NegotiationResult<()> {
        let channel = {
            let mut state = self.endpoint.state();
            state.closed = true;
            state.channel.take()
        };
        if let Some(channel) = channel {
            if channel.open.swap(false, Ordering::SeqCst) {
                channel.peer.emit(RtcEventKind::ChannelClosed);
                channel
                    .peer
                    .emit(RtcEventKind::LinkState(LinkState::Disconnected));
            }
        }
        self.network.unregister(&self.endpoint);
        Ok(())
    }
}

/// One half of a loopback data channel
#[derive(Debug)]
pub struct LoopbackChannel {
    label: String,
    open: Arc<AtomicBool>,
    local: RtcEventSink,
    peer: RtcEventSink,
}

impl LoopbackChannel {
    /// Channel label chosen by the caller
    pub fn label(&self) -> &str {
        &self.label
    }

    fn deliver(&self, frame: ChannelFrame) -> NegotiationResult<()> {
        if !self.is_open() {
            return Err(NegotiationError::ChannelClosed);
        }
        self.peer.emit(RtcEventKind::Frame(frame));
        Ok(())
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    async fn send_text(&self, text: &str) -> NegotiationResult<()> {
        self.deliver(ChannelFrame::Text(text.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> NegotiationResult<()> {
        self.deliver(ChannelFrame::Binary(data))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> NegotiationResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.local.emit(RtcEventKind::ChannelClosed);
            self.peer.emit(RtcEventKind::ChannelClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::RtcEvent;
    use tokio::sync::mpsc;

    struct Fixture {
        network: LoopbackNetwork,
        a: Arc<dyn PeerConnection>,
        b: Arc<dyn PeerConnection>,
        a_events: mpsc::UnboundedReceiver<RtcEvent>,
        b_events: mpsc::UnboundedReceiver<RtcEvent>,
    }

    async fn fixture() -> Fixture {
        let network = LoopbackNetwork::new();
        let (a_tx, a_events) = mpsc::unbounded_channel();
        let (b_tx, b_events) = mpsc::unbounded_channel();
        let a = network
            .factory(PeerId::from("aaaa"))
            .new_connection(&PeerId::from("bbbb"), RtcEventSink::new(PeerId::from("bbbb"), 1, a_tx))
            .await
            .unwrap();
        let b = network
            .factory(PeerId::from("bbbb"))
            .new_connection(&PeerId::from("aaaa"), RtcEventSink::new(PeerId::from("aaaa"), 1, b_tx))
            .await
            .unwrap();
        Fixture {
            network,
            a,
            b,
            a_events,
            b_events,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RtcEvent>) -> Vec<RtcEventKind> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event.kind);
        }
        out
    }

    fn open_channel(events: Vec<RtcEventKind>) -> Arc<dyn DataChannel> {
        events
            .into_iter()
            .find_map(|kind| match kind {
                RtcEventKind::ChannelOpen(channel) => Some(channel),
                _ => None,
            })
            .expect("channel should open")
    }

    async fn negotiate(f: &Fixture) {
        f.a.create_data_channel("data-channel").await.unwrap();
        let offer = f.a.create_offer().await.unwrap();
        f.a.set_local_description(offer.clone()).await.unwrap();
        f.b.set_remote_description(offer).await.unwrap();
        let answer = f.b.create_answer().await.unwrap();
        f.b.set_local_description(answer.clone()).await.unwrap();
        f.a.set_remote_description(answer).await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_flow_after_answer() {
        let mut f = fixture().await;
        negotiate(&f).await;

        let a_channel = open_channel(drain(&mut f.a_events));
        let b_channel = open_channel(drain(&mut f.b_events));
        assert!(f.network.is_linked(&PeerId::from("aaaa"), &PeerId::from("bbbb")));

        a_channel.send_text("hi").await.unwrap();
        b_channel
            .send_binary(Bytes::from_static(&[1, 2, 3]))
            .await
            .unwrap();

        assert!(matches!(
            drain(&mut f.b_events).as_slice(),
            [RtcEventKind::Frame(ChannelFrame::Text(text))] if text == "hi"
        ));
        assert!(matches!(
            drain(&mut f.a_events).as_slice(),
            [RtcEventKind::Frame(ChannelFrame::Binary(data))] if data.as_ref() == [1, 2, 3]
        ));
    }

    #[tokio::test]
    async fn test_candidate_needs_remote_description() {
        let f = fixture().await;
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".to_string(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        };
        assert!(matches!(
            f.b.add_ice_candidate(candidate).await,
            Err(NegotiationError::NoRemoteDescription)
        ));
    }

    #[tokio::test]
    async fn test_close_notifies_peer() {
        let mut f = fixture().await;
        negotiate(&f).await;
        let a_channel = open_channel(drain(&mut f.a_events));
        drain(&mut f.b_events);

        f.b.close().await.unwrap();
        let events = drain(&mut f.a_events);
        assert!(matches!(events[0], RtcEventKind::ChannelClosed));
        assert!(matches!(
            events[1],
            RtcEventKind::LinkState(LinkState::Disconnected)
        ));
        assert!(!a_channel.is_open());
        assert!(matches!(
            a_channel.send_text("late").await,
            Err(NegotiationError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_answer_without_peer_fails() {
        let network = LoopbackNetwork::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = network
            .factory(PeerId::from("aaaa"))
            .new_connection(&PeerId::from("zzzz"), RtcEventSink::new(PeerId::from("zzzz"), 1, tx))
            .await
            .unwrap();

        a.set_remote_description(SessionDescription::answer("bogus"))
            .await
            .unwrap();
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [RtcEventKind::LinkState(LinkState::Failed)]
        ));
    }
}
