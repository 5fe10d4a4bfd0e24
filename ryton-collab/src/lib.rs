//! # ryton-collab — Peer-to-peer collaboration core for RytonIDE
//!
//! Finds other IDE instances on the LAN, connects to them directly over
//! WebRTC, exchanges chat text on an ordered data channel and carries an
//! optional voice call on the same connection.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌───────────────────────┐
//!   UI ── commands ─►│   CollaborationHub    │── CollabEvent ──► UI
//!                    └──┬──────┬──────┬──────┘
//!                       │      │      │
//!          ┌────────────┘      │      └───────────────┐
//!          ▼                   ▼                      ▼
//! ┌──────────────────┐ ┌───────────────┐  ┌──────────────────────┐
//! │ DiscoveryService │ │ MessageRouter │  │ CallSessionManager   │
//! │ (mDNS / DNS-SD)  │ └───────┬───────┘  └──────────┬───────────┘
//! └──────────────────┘         ▼                     ▼ MediaLink
//!                    ┌──────────────────────────────────────┐
//!                    │ ConnectionManager                    │
//!                    │  WebSocket signaling (TCP 9090)      │
//!                    │  one PeerActor per RTCPeerConnection │
//!                    └──────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`identity`] — local identity and peer keys
//! - [`discovery`] — DNS-SD service registration and browsing
//! - [`protocol`] — binary signaling frames (bincode)
//! - [`connection`] — signaling listener, negotiation workers, peer table
//! - [`router`] — text messages over data channels
//! - [`call`] — single voice-call slot
//! - [`hub`] — the facade the IDE uses
//! - [`config`] — defaults and `RYTON_*` environment overrides

pub mod call;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod hub;
pub mod identity;
pub mod protocol;
pub mod router;

// Re-exports for convenience
pub use call::{AudioCapture, AudioSource, CallError, CallInfo, CallSessionManager, CallState, MediaLink, SilenceSource};
pub use config::{CollabConfig, ConfigError};
pub use connection::{ConnectionConfig, ConnectionError, ConnectionManager, ConnectionState};
pub use discovery::{DiscoveryConfig, DiscoveryEvent, DiscoveryService};
pub use hub::{CollabError, CollabEvent, CollaborationHub};
pub use identity::{LocalIdentity, PeerIdentity, PeerKey};
pub use protocol::{ProtocolError, SignalFrame};
pub use router::{Direction, Message, MessageRouter, RouterError};
