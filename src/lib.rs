//! # PeerDrop
//!
//! Direct device-to-device messaging and file transfer for peers on the same network.
//!
//! ## Features
//!
//! - **Signaling relay** assigning stable identities and forwarding negotiation signals
//! - **Negotiation** of a direct data channel per pair of peers, with caller-owned retries
//! - **Chunked transfers** paced by partition acknowledgements
//! - **Pluggable backends**: native WebRTC (feature `rtc`) or in-process loopback
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peerdrop::{ClientConfig, PeerManager, SignalingClient};
//! use peerdrop::negotiation::loopback::LoopbackNetwork;
//!
//! # async fn demo() {
//! let (signaling, client_events) = SignalingClient::spawn(ClientConfig::default());
//! let factory = LoopbackNetwork::new().factory("my-id".into());
//! let (manager, mut events) = PeerManager::new(Arc::new(factory), signaling.sender());
//!
//! let (_commands, commands_rx) = tokio::sync::mpsc::unbounded_channel();
//! tokio::spawn(manager.run(client_events, commands_rx));
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              APPLICATION LAYER              │
//! │        peerdrop CLI  |  relay binary        │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │                PEER LAYER                   │
//! │   PeerManager | Negotiation | Transfers     │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │              SIGNALING LAYER                │
//! │  SignalingClient  <─ WebSocket ─>  Relay    │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │             DATA CHANNEL LAYER              │
//! │        WebRTC (rtc)  |  Loopback            │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod transfer;

// Re-export main types at crate root
pub use client::{ClientError, ClientEvent, ClientResult, SignalingClient, SignalingHandle};
pub use config::{ClientConfig, RelayConfig};
pub use negotiation::{NegotiationError, NegotiationResult, NegotiationSession, Role, SessionState};
pub use peer::{PeerCommand, PeerError, PeerEvent, PeerManager, PeerResult};
pub use protocol::{Envelope, PeerId, PeerInfo, ProtocolError, ProtocolResult, ServerMessage};
pub use relay::{RelayServer, Room, ServerError, ServerResult};
pub use transfer::{OutgoingFile, ReceivedFile, TransferEngine, TransferError, TransferEvent};
