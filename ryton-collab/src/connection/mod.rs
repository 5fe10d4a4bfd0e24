//! Peer connections: signaling listener, per-peer negotiation workers and
//! the peer table.
//!
//! ```text
//!            connect(addr)                 SignalingListener (TCP 9090)
//!                 │                                  │ Hello
//!                 ▼                                  ▼
//!         ┌──────────────────── ConnectionManager ──────────────────┐
//!         │  peers: addr → { state watch, data channel, commands }  │
//!         └───────┬─────────────────────────────────────┬───────────┘
//!                 ▼                                     ▼
//!           PeerActor (outbound)                  PeerActor (inbound)
//!           ws → Hello → offer                    Welcome → answer
//!                 └────────── RTCPeerConnection ───────┘
//!                              "chat" data channel
//! ```
//!
//! Each actor is the only writer of its peer's state. The manager sees
//! state through a `watch` receiver and stops actors by cancellation.

mod peer;
mod signaling;

pub use signaling::{InboundRequest, SignalingListener};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_util::sync::CancellationToken;
use webrtc::data_channel::RTCDataChannel;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::call::{CallError, MediaLink};
use crate::identity::{LocalIdentity, PeerIdentity, PeerKey};
use crate::protocol::{ProtocolError, PROTOCOL_VERSION, REJECT_DUPLICATE, REJECT_SELF, REJECT_VERSION};
use peer::{PeerActor, PeerCommand, Role};

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// STUN/TURN URLs
    pub ice_servers: Vec<String>,
    /// Upper bound for signaling + ICE + channel open
    pub negotiation_timeout: Duration,
    /// Offer loopback ICE candidates (same-host peers without a LAN)
    pub include_loopback_candidates: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            negotiation_timeout: Duration::from_secs(30),
            include_loopback_candidates: false,
        }
    }
}

/// Per-peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Closed)
                | (Connecting, Open)
                | (Connecting, Closed)
                | (Connecting, Error)
                | (Open, Closed)
                | (Open, Error)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Events emitted by the manager and its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        peer: PeerIdentity,
        state: ConnectionState,
        /// Set for `Error`
        reason: Option<String>,
    },
    /// A connection attempt was refused before any state was created
    Rejected { address: PeerKey, reason: String },
    /// Remote audio track started or stopped
    RemoteAudio { address: PeerKey, active: bool },
}

/// A text message read off a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundText {
    pub peer: PeerKey,
    pub text: String,
}

/// Receivers handed out by [`ConnectionManager::new`].
pub struct ConnectionEvents {
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
    pub inbound: mpsc::UnboundedReceiver<InboundText>,
}

/// Connection errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("signaling: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Rejected(String),
    #[error("negotiation timed out")]
    Timeout,
    #[error("{0}")]
    Negotiation(String),
    #[error("no open connection to {0}")]
    NotOpen(PeerKey),
    #[error("connection closed")]
    Closed,
}

pub(crate) type ChannelSlot = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

struct PeerEntry {
    generation: u64,
    state: watch::Receiver<ConnectionState>,
    channel: ChannelSlot,
    commands: mpsc::Sender<PeerCommand>,
    cancel: CancellationToken,
}

impl PeerEntry {
    fn is_live(&self) -> bool {
        !self.state.borrow().is_terminal()
    }
}

pub(crate) struct Shared {
    pub(crate) identity: LocalIdentity,
    pub(crate) config: ConnectionConfig,
    peers: RwLock<HashMap<PeerKey, PeerEntry>>,
    pub(crate) events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    pub(crate) inbound_tx: mpsc::UnboundedSender<InboundText>,
    /// Parent of the listener's and every worker's token
    root: CancellationToken,
    next_generation: AtomicU64,
}

impl Shared {
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Drop a finished worker's entry, unless a newer worker took the key.
    pub(crate) async fn forget(&self, address: &PeerKey, generation: u64) {
        let mut peers = self.peers.write().await;
        if peers.get(address).is_some_and(|e| e.generation == generation) {
            peers.remove(address);
        }
    }
}

/// Owner of the peer table.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(identity: LocalIdentity, config: ConnectionConfig) -> (Self, ConnectionEvents) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Shared {
                identity,
                config,
                peers: RwLock::new(HashMap::new()),
                events_tx,
                inbound_tx,
                root: CancellationToken::new(),
                next_generation: AtomicU64::new(1),
            }),
        };
        (manager, ConnectionEvents { events, inbound })
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }

    /// Accept inbound signaling on `listener` until shutdown.
    pub fn serve(&self, listener: SignalingListener) {
        let cancel = self.inner.root.child_token();
        tokio::spawn(signaling::accept_loop(listener, self.clone(), cancel));
    }

    /// Start an outbound connection. `false` when the address is our own or
    /// already has a live connection.
    pub async fn connect(&self, address: PeerKey) -> bool {
        if self.inner.root.is_cancelled() {
            log::debug!("Not connecting to {address}: shutting down");
            return false;
        }
        if self.inner.identity.is_self(&address) {
            log::warn!("Refusing to connect to own endpoint {address}");
            self.reject(address, REJECT_SELF);
            return false;
        }

        let mut peers = self.inner.peers.write().await;
        if peers.get(&address).is_some_and(PeerEntry::is_live) {
            drop(peers);
            log::info!("Already connected to {address}");
            self.reject(address, REJECT_DUPLICATE);
            return false;
        }
        let (entry, actor) = self.prepare(PeerIdentity::unnamed(address));
        peers.insert(address, entry);
        drop(peers);

        log::info!("Connecting to {address}");
        tokio::spawn(actor.run(Role::Outbound));
        true
    }

    /// Admit a peer that opened signaling to us. Refused requests get a
    /// `Reject` frame and no state.
    pub async fn accept_inbound(&self, request: InboundRequest) -> bool {
        let address = request.peer_key();
        if self.inner.root.is_cancelled() {
            return false;
        }
        let refusal = if request.version != PROTOCOL_VERSION {
            Some(REJECT_VERSION)
        } else if request.instance_id == self.inner.identity.instance_id() {
            Some(REJECT_SELF)
        } else {
            None
        };
        if let Some(reason) = refusal {
            log::warn!("Rejecting signaling from {address}: {reason}");
            request.refuse(reason).await;
            self.reject(address, reason);
            return false;
        }

        let mut peers = self.inner.peers.write().await;
        if peers.get(&address).is_some_and(PeerEntry::is_live) {
            drop(peers);
            log::info!("Rejecting duplicate signaling from {address}");
            request.refuse(REJECT_DUPLICATE).await;
            self.reject(address, REJECT_DUPLICATE);
            return false;
        }
        let (entry, actor) = self.prepare(PeerIdentity::new(request.name.clone(), address));
        peers.insert(address, entry);
        drop(peers);

        log::info!("Accepted signaling from {} at {address}", request.name);
        tokio::spawn(actor.run(Role::Inbound(request.into_channel())));
        true
    }

    /// Close one connection and wait for its worker to finish.
    pub async fn close(&self, address: PeerKey) {
        let waiter = {
            let peers = self.inner.peers.read().await;
            match peers.get(&address) {
                Some(entry) if entry.is_live() => {
                    entry.cancel.cancel();
                    entry.state.clone()
                }
                _ => return,
            }
        };
        wait_terminal(waiter).await;
    }

    /// Close every connection and wait for all workers.
    pub async fn close_all(&self) {
        let waiters: Vec<watch::Receiver<ConnectionState>> = {
            let peers = self.inner.peers.read().await;
            peers
                .values()
                .map(|entry| {
                    entry.cancel.cancel();
                    entry.state.clone()
                })
                .collect()
        };
        for waiter in waiters {
            wait_terminal(waiter).await;
        }
    }

    /// Stop listening and close everything. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        self.close_all().await;
    }

    /// Cancel the listener and every worker without waiting.
    pub fn abort(&self) {
        self.inner.root.cancel();
    }

    pub async fn state(&self, address: &PeerKey) -> Option<ConnectionState> {
        let peers = self.inner.peers.read().await;
        peers.get(address).map(|entry| *entry.state.borrow())
    }

    pub async fn is_open(&self, address: &PeerKey) -> bool {
        self.state(address).await == Some(ConnectionState::Open)
    }

    /// Every peer with a live worker.
    pub async fn peers(&self) -> Vec<(PeerKey, ConnectionState)> {
        let peers = self.inner.peers.read().await;
        peers
            .iter()
            .map(|(address, entry)| (*address, *entry.state.borrow()))
            .collect()
    }

    /// The data channel of an Open peer.
    pub(crate) async fn open_channel(&self, address: &PeerKey) -> Option<Arc<RTCDataChannel>> {
        let slot = {
            let peers = self.inner.peers.read().await;
            let entry = peers.get(address)?;
            if *entry.state.borrow() != ConnectionState::Open {
                return None;
            }
            entry.channel.clone()
        };
        let channel = slot.read().await.clone();
        channel
    }

    async fn command(&self, address: &PeerKey, command: PeerCommand) -> Result<(), ConnectionError> {
        let commands = {
            let peers = self.inner.peers.read().await;
            match peers.get(address) {
                Some(entry) if *entry.state.borrow() == ConnectionState::Open => entry.commands.clone(),
                _ => return Err(ConnectionError::NotOpen(*address)),
            }
        };
        commands.send(command).await.map_err(|_| ConnectionError::Closed)
    }

    fn reject(&self, address: PeerKey, reason: &str) {
        self.inner.emit(ConnectionEvent::Rejected {
            address,
            reason: reason.to_string(),
        });
    }

    fn prepare(&self, peer: PeerIdentity) -> (PeerEntry, PeerActor) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let channel: ChannelSlot = Arc::new(RwLock::new(None));
        let cancel = self.inner.root.child_token();

        let entry = PeerEntry {
            generation,
            state: state_rx,
            channel: channel.clone(),
            commands: commands_tx,
            cancel: cancel.clone(),
        };
        let actor = PeerActor::new(self.inner.clone(), peer, generation, state_tx, channel, commands_rx, cancel);
        (entry, actor)
    }
}

async fn wait_terminal(mut state: watch::Receiver<ConnectionState>) {
    // Err means the worker is gone, which is terminal too.
    let _ = state.wait_for(|s| s.is_terminal()).await;
}

#[async_trait]
impl MediaLink for ConnectionManager {
    async fn is_open(&self, peer: PeerKey) -> bool {
        ConnectionManager::is_open(self, &peer).await
    }

    async fn attach_audio(&self, peer: PeerKey, track: Arc<TrackLocalStaticSample>) -> Result<(), CallError> {
        let (reply, done) = oneshot::channel();
        self.command(&peer, PeerCommand::AttachAudio { track, reply })
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        match done.await {
            Ok(result) => result.map_err(|e| CallError::Negotiation(e.to_string())),
            Err(_) => Err(CallError::Negotiation(ConnectionError::Closed.to_string())),
        }
    }

    async fn detach_audio(&self, peer: PeerKey) {
        let (reply, done) = oneshot::channel();
        if self.command(&peer, PeerCommand::DetachAudio { reply }).await.is_ok() {
            let _ = done.await;
        }
    }
}
