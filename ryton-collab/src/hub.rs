//! The single entry point for the IDE: commands in, [`CollabEvent`]s out.
//!
//! ```text
//!  DiscoveryService ──┐
//!  ConnectionManager ─┤                      ┌──► CollabEvent stream (UI)
//!  MessageRouter ─────┼──► pump ──► PeerBook ┤
//!  CallSessionManager ┘                      └──► calls.peer_closed()
//! ```
//!
//! The UI never talks to the components directly. The event stream is
//! unbounded so a slow reader never stalls the pump or a command.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::call::{AudioSource, CallError, CallEvent, CallInfo, CallSessionManager, CallState, SilenceSource};
use crate::config::CollabConfig;
use crate::connection::{ConnectionEvent, ConnectionEvents, ConnectionManager, ConnectionState, SignalingListener};
use crate::discovery::{DiscoveryEvent, DiscoveryService};
use crate::identity::{
    detect_local_ip, parse_peer_address, resolve_peer_address, AddressError, LocalIdentity, PeerAddress, PeerIdentity,
    PeerKey,
};
use crate::router::{Message, MessageRouter, RouterError};

/// Status texts carried by [`CollabEvent::ConnectionStatus`].
pub mod status {
    pub const CONNECTING: &str = "connecting";
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const RECEIVING_AUDIO: &str = "receiving audio";
    pub const AUDIO_ENDED: &str = "audio ended";
}

/// Everything the UI gets told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollabEvent {
    PeerFound { name: String, address: PeerKey },
    PeerLost { address: PeerKey },
    /// Human-readable progress; `address` is `None` for hub-wide status
    ConnectionStatus { address: Option<PeerKey>, status: String },
    MessageReceived { address: PeerKey, text: String },
    CallStateChanged { address: PeerKey, state: CallState },
}

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Call(#[from] CallError),
}

struct BookEntry {
    name: String,
    advertised: bool,
    connected: bool,
}

/// Peers the UI has been told about, from either source.
#[derive(Default)]
struct PeerBook {
    peers: HashMap<PeerKey, BookEntry>,
}

impl PeerBook {
    /// Returns true when the peer is new to the UI.
    fn advertised(&mut self, name: &str, address: PeerKey) -> bool {
        self.upsert(name, address, |e| e.advertised = true)
    }

    fn connected(&mut self, name: &str, address: PeerKey) -> bool {
        self.upsert(name, address, |e| e.connected = true)
    }

    /// Returns true when the peer is gone from the UI.
    fn unadvertised(&mut self, address: PeerKey) -> bool {
        self.clear(address, |e| e.advertised = false)
    }

    fn disconnected(&mut self, address: PeerKey) -> bool {
        self.clear(address, |e| e.connected = false)
    }

    fn rename(&mut self, name: &str, address: PeerKey) {
        if let Some(entry) = self.peers.get_mut(&address) {
            entry.name = name.to_string();
        }
    }

    fn upsert(&mut self, name: &str, address: PeerKey, mark: impl FnOnce(&mut BookEntry)) -> bool {
        let mut is_new = false;
        let entry = self.peers.entry(address).or_insert_with(|| {
            is_new = true;
            BookEntry {
                name: name.to_string(),
                advertised: false,
                connected: false,
            }
        });
        mark(entry);
        is_new
    }

    fn clear(&mut self, address: PeerKey, unmark: impl FnOnce(&mut BookEntry)) -> bool {
        let Some(entry) = self.peers.get_mut(&address) else {
            return false;
        };
        unmark(entry);
        if entry.advertised || entry.connected {
            return false;
        }
        self.peers.remove(&address);
        true
    }

    fn snapshot(&self) -> Vec<PeerIdentity> {
        self.peers
            .iter()
            .map(|(address, entry)| PeerIdentity::new(entry.name.clone(), *address))
            .collect()
    }
}

/// Collaboration network of one IDE instance.
pub struct CollaborationHub {
    identity: LocalIdentity,
    connections: ConnectionManager,
    router: MessageRouter,
    calls: Arc<CallSessionManager>,
    discovery: Option<DiscoveryService>,
    book: Arc<Mutex<PeerBook>>,
    events_tx: mpsc::UnboundedSender<CollabEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<CollabEvent>>,
    shut_down: AtomicBool,
}

impl CollaborationHub {
    /// Start with the silence audio source.
    pub async fn start(config: CollabConfig) -> Self {
        Self::start_with_audio(config, Arc::new(SilenceSource)).await
    }

    /// Bind signaling, start discovery and the event pump.
    ///
    /// A signaling bind failure is reported as a status event; the hub
    /// then only makes outbound connections.
    pub async fn start_with_audio(config: CollabConfig, audio: Arc<dyn AudioSource>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let listener = match SignalingListener::bind(config.listen_addr).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                log::error!("Cannot listen on {}: {e}", config.listen_addr);
                let _ = events_tx.send(CollabEvent::ConnectionStatus {
                    address: None,
                    status: format!("signaling unavailable: {e}"),
                });
                None
            }
        };
        let port = listener
            .as_ref()
            .map_or(config.listen_addr.port(), |l| l.local_addr().port());
        let identity = LocalIdentity::new(config.instance_name.clone(), advertised_ip(config.listen_addr), port);
        log::info!(
            "Collaboration hub {} ({}) at {}",
            identity.name(),
            identity.instance_id(),
            identity.signaling_addr()
        );

        let (connections, ConnectionEvents { events, inbound }) =
            ConnectionManager::new(identity.clone(), config.connection.clone());
        if let Some(listener) = listener {
            connections.serve(listener);
        }

        let mut router = MessageRouter::new(connections.clone(), inbound);
        let messages = router.take_message_rx();

        let mut calls = CallSessionManager::new(Arc::new(connections.clone()), audio);
        let call_events = calls.take_event_rx();
        let calls = Arc::new(calls);

        let (discovery, discovery_events) = if config.discovery.enabled {
            let mut service = DiscoveryService::new(identity.clone(), config.discovery.clone());
            let rx = service.take_event_rx();
            service.start().await;
            (Some(service), rx)
        } else {
            (None, None)
        };

        let book = Arc::new(Mutex::new(PeerBook::default()));
        let pump = Pump {
            book: book.clone(),
            calls: calls.clone(),
            out: events_tx.clone(),
            discovery: discovery_events,
            connections: Some(events),
            messages,
            call_events,
        };
        tokio::spawn(pump.run());

        Self {
            identity,
            connections,
            router,
            calls,
            discovery,
            book,
            events_tx,
            events_rx: Some(events_rx),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<CollabEvent>> {
        self.events_rx.take()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Connect to `ip`, `ip:port` or `host[:port]`. Progress and refusals
    /// arrive as status events.
    ///
    /// Host names are looked up in the background; the return value then
    /// only says the input was well formed.
    pub async fn connect(&self, input: &str) -> bool {
        let input = input.trim();
        match parse_peer_address(input, self.identity.listen_port()) {
            Ok(PeerAddress::Socket(address)) => self.connections.connect(address).await,
            Ok(host @ PeerAddress::Host { .. }) => {
                let connections = self.connections.clone();
                let events = self.events_tx.clone();
                let input = input.to_string();
                tokio::spawn(async move {
                    match host.resolve().await {
                        Ok(address) => {
                            connections.connect(address).await;
                        }
                        Err(e) => {
                            log::warn!("Cannot connect to {input:?}: {e}");
                            let _ = events.send(CollabEvent::ConnectionStatus {
                                address: None,
                                status: format!("invalid address: {input}"),
                            });
                        }
                    }
                });
                true
            }
            Err(e) => {
                log::warn!("Cannot connect to {input:?}: {e}");
                self.status(None, format!("invalid address: {input}"));
                false
            }
        }
    }

    /// Peer key for user input, defaulting to our signaling port.
    pub async fn resolve(&self, input: &str) -> Result<PeerKey, CollabError> {
        Ok(resolve_peer_address(input, self.identity.listen_port()).await?)
    }

    /// Close the connection to `peer`, if any. Ends a call on it.
    pub async fn disconnect(&self, peer: PeerKey) {
        self.connections.close(peer).await;
    }

    /// Send text to an Open peer.
    pub async fn send(&self, peer: PeerKey, text: &str) -> bool {
        self.router.send(peer, text).await
    }

    pub async fn send_message(&self, peer: PeerKey, text: &str) -> Result<Message, CollabError> {
        Ok(self.router.send_message(peer, text).await?)
    }

    /// A refused call is also reported as a status event for `peer`.
    pub async fn start_call(&self, peer: PeerKey) -> Result<(), CallError> {
        let result = self.calls.start_call(peer).await;
        if let Err(e) = &result {
            log::warn!("Call to {peer} refused: {e}");
            self.status(Some(peer), e.to_string());
        }
        result
    }

    pub async fn end_call(&self) {
        self.calls.end_call().await;
    }

    pub async fn current_call(&self) -> Option<CallInfo> {
        self.calls.current().await
    }

    pub async fn connection_state(&self, peer: &PeerKey) -> Option<ConnectionState> {
        self.connections.state(peer).await
    }

    /// Advertised and connected peers.
    pub async fn known_peers(&self) -> Vec<PeerIdentity> {
        self.book.lock().await.snapshot()
    }

    /// End the call, stop discovery and close every connection. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Shutting down collaboration hub {}", self.identity.name());
        self.calls.end_call().await;
        if let Some(discovery) = &self.discovery {
            discovery.stop().await;
        }
        self.connections.shutdown().await;
    }

    fn status(&self, address: Option<PeerKey>, status: String) {
        let _ = self.events_tx.send(CollabEvent::ConnectionStatus { address, status });
    }
}

impl Drop for CollaborationHub {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            self.connections.abort();
        }
    }
}

/// IPv4 other instances reach us at.
fn advertised_ip(listen: SocketAddr) -> std::net::Ipv4Addr {
    match listen.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_loopback() => ip,
        _ => detect_local_ip(),
    }
}

/// Folds component events into [`CollabEvent`]s.
struct Pump {
    book: Arc<Mutex<PeerBook>>,
    calls: Arc<CallSessionManager>,
    out: mpsc::UnboundedSender<CollabEvent>,
    discovery: Option<mpsc::UnboundedReceiver<DiscoveryEvent>>,
    connections: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    messages: Option<mpsc::UnboundedReceiver<Message>>,
    call_events: Option<mpsc::UnboundedReceiver<CallEvent>>,
}

impl Pump {
    async fn run(mut self) {
        loop {
            if self.discovery.is_none()
                && self.connections.is_none()
                && self.messages.is_none()
                && self.call_events.is_none()
            {
                break;
            }
            tokio::select! {
                event = recv(&mut self.discovery) => match event {
                    Some(event) => self.on_discovery(event).await,
                    None => self.discovery = None,
                },
                event = recv(&mut self.connections) => match event {
                    Some(event) => self.on_connection(event).await,
                    None => self.connections = None,
                },
                message = recv(&mut self.messages) => match message {
                    Some(message) => {
                        self.emit(CollabEvent::MessageReceived {
                            address: message.peer,
                            text: message.text,
                        })
                    }
                    None => self.messages = None,
                },
                event = recv(&mut self.call_events) => match event {
                    Some(event) => {
                        self.emit(CollabEvent::CallStateChanged {
                            address: event.peer,
                            state: event.state,
                        })
                    }
                    None => self.call_events = None,
                },
            }
        }
        log::debug!("Event pump finished");
    }

    async fn on_discovery(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerFound(peer) => {
                if self.book.lock().await.advertised(&peer.name, peer.address) {
                    self.emit(CollabEvent::PeerFound {
                        name: peer.name,
                        address: peer.address,
                    });
                }
            }
            DiscoveryEvent::PeerLost(address) => {
                if self.book.lock().await.unadvertised(address) {
                    self.emit(CollabEvent::PeerLost { address });
                }
            }
            DiscoveryEvent::Status(status) => {
                self.emit(CollabEvent::ConnectionStatus { address: None, status });
            }
        }
    }

    async fn on_connection(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { peer, state, reason } => {
                let address = peer.address;
                match state {
                    ConnectionState::Idle => {}
                    ConnectionState::Connecting => {
                        if self.book.lock().await.connected(&peer.name, address) {
                            self.emit(CollabEvent::PeerFound {
                                name: peer.name,
                                address,
                            });
                        }
                        self.status(address, status::CONNECTING.to_string());
                    }
                    ConnectionState::Open => {
                        self.book.lock().await.rename(&peer.name, address);
                        self.status(address, status::CONNECTED.to_string());
                    }
                    ConnectionState::Closed | ConnectionState::Error => {
                        // Before anything reaches the UI.
                        self.calls.peer_closed(address).await;
                        let text = match (state, reason) {
                            (ConnectionState::Error, Some(reason)) => format!("error: {reason}"),
                            (ConnectionState::Error, None) => "error: unknown".to_string(),
                            _ => status::DISCONNECTED.to_string(),
                        };
                        self.status(address, text);
                        if self.book.lock().await.disconnected(address) {
                            self.emit(CollabEvent::PeerLost { address });
                        }
                    }
                }
            }
            ConnectionEvent::Rejected { address, reason } => self.status(address, reason),
            ConnectionEvent::RemoteAudio { address, active } => {
                let text = if active {
                    status::RECEIVING_AUDIO
                } else {
                    status::AUDIO_ENDED
                };
                self.status(address, text.to_string());
            }
        }
    }

    fn status(&self, address: PeerKey, status: String) {
        self.emit(CollabEvent::ConnectionStatus {
            address: Some(address),
            status,
        });
    }

    fn emit(&self, event: CollabEvent) {
        let _ = self.out.send(event);
    }
}

async fn recv<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PeerKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_book_dedups_across_sources() {
        let mut book = PeerBook::default();
        let a = addr("10.0.0.2:9090");

        assert!(book.advertised("A", a));
        assert!(!book.connected("A", a));
        assert!(!book.advertised("A", a));

        // Still connected after the advertisement expires.
        assert!(!book.unadvertised(a));
        assert_eq!(book.snapshot().len(), 1);
        assert!(book.disconnected(a));
        assert!(book.snapshot().is_empty());
    }

    #[test]
    fn test_book_connection_only_peer() {
        let mut book = PeerBook::default();
        let b = addr("10.0.0.3:9091");

        assert!(book.connected("Peer@10.0.0.3", b));
        book.rename("Bob", b);
        assert_eq!(book.snapshot()[0].name, "Bob");
        assert!(book.disconnected(b));
        // Unknown peers are never reported lost.
        assert!(!book.disconnected(b));
        assert!(!book.unadvertised(b));
    }

    #[test]
    fn test_advertised_ip_prefers_explicit_bind() {
        assert_eq!(
            advertised_ip(addr("192.168.5.5:9090")),
            std::net::Ipv4Addr::new(192, 168, 5, 5)
        );
        assert!(!advertised_ip(addr("0.0.0.0:9090")).is_unspecified());
    }
}
