//! LAN peer discovery over mDNS / DNS-SD.
//!
//! Every instance registers a `_rytonide._tcp.local.` service whose TXT
//! record carries its instance id and display name, and browses for the
//! same service type:
//!
//! ```text
//!  register ──► mDNS responder ◄── browse
//!                  │ resolved            │ removed (goodbye or TTL expiry)
//!                  ▼                     ▼
//!            ┌──────────────┐  new   → PeerFound
//!            │ PeerRegistry │  gone  → PeerLost
//!            └──────────────┘
//! ```
//!
//! The responder sits behind [`ServiceBackend`]. Failures never stop the
//! worker; it reports a status and restarts the backend with exponential
//! backoff.

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::identity::{host_name, LocalIdentity, PeerIdentity, PeerKey};

/// DNS-SD service type shared by every instance.
pub const SERVICE_TYPE: &str = "_rytonide._tcp.local.";

/// TXT keys
const TXT_ID: &str = "id";
const TXT_NAME: &str = "name";

/// Discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Whether the hub starts discovery at all
    pub enabled: bool,
    pub service_type: String,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: SERVICE_TYPE.to_string(),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Discovery errors.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS: {0}")]
    Mdns(#[from] mdns_sd::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Unavailable(String),
    #[error("service browser stopped")]
    BrowseEnded,
}

/// Events from the discovery worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerFound(PeerIdentity),
    PeerLost(PeerKey),
    /// Non-fatal problem, already being retried
    Status(String),
}

/// The service this instance publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub service_type: String,
    /// Instance label; the port suffix keeps instances on one host apart
    pub instance: String,
    /// `<hostname>.local.`
    pub host: String,
    pub ip: Ipv4Addr,
    /// Signaling port
    pub port: u16,
    pub instance_id: Uuid,
    pub name: String,
}

impl ServiceRecord {
    pub fn new(identity: &LocalIdentity, config: &DiscoveryConfig) -> Self {
        Self {
            service_type: config.service_type.clone(),
            instance: format!("{} ({})", identity.name().replace('.', "_"), identity.listen_port()),
            host: format!("{}.local.", dns_label(&host_name())),
            ip: identity.ip(),
            port: identity.listen_port(),
            instance_id: identity.instance_id(),
            name: identity.name().to_string(),
        }
    }

    pub fn fullname(&self) -> String {
        format!("{}.{}", self.instance, self.service_type)
    }

    fn properties(&self) -> HashMap<String, String> {
        HashMap::from([
            (TXT_ID.to_string(), self.instance_id.to_string()),
            (TXT_NAME.to_string(), self.name.clone()),
        ])
    }
}

fn dns_label(name: &str) -> String {
    let label: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if label.is_empty() {
        "ryton".to_string()
    } else {
        label
    }
}

/// A service instance the browser resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub fullname: String,
    /// From TXT; absent for publishers that do not set it
    pub instance_id: Option<Uuid>,
    pub name: Option<String>,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

/// What the browser reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Resolved(ResolvedService),
    /// Goodbye received or cache entry expired
    Removed { fullname: String },
}

/// Registration and browsing on the local DNS-SD responder.
pub trait ServiceBackend: Send {
    /// Publish `record` and browse for its service type.
    fn start(&mut self, record: &ServiceRecord) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, DiscoveryError>;

    /// Withdraw the record (goodbye) and stop browsing. Idempotent.
    fn stop(&mut self);
}

/// Creates a fresh backend for each run of the service.
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn ServiceBackend> + Send + Sync>;

/// [`ServiceBackend`] on the `mdns-sd` responder.
#[derive(Default)]
pub struct MdnsBackend {
    daemon: Option<ServiceDaemon>,
    registered: Option<String>,
}

impl ServiceBackend for MdnsBackend {
    fn start(&mut self, record: &ServiceRecord) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, DiscoveryError> {
        self.stop();
        let daemon = self.daemon.insert(ServiceDaemon::new()?);

        let ip = record.ip.to_string();
        let info = ServiceInfo::new(
            &record.service_type,
            &record.instance,
            &record.host,
            ip.as_str(),
            record.port,
            record.properties(),
        )?;
        let fullname = info.get_fullname().to_string();
        daemon.register(info)?;
        self.registered = Some(fullname);
        let browse = daemon.browse(&record.service_type)?;

        // The daemon's channel is blocking; bridge it onto the runtime.
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("ryton-mdns-browse".into())
            .spawn(move || {
                while let Ok(event) = browse.recv() {
                    let event = match event {
                        ServiceEvent::ServiceResolved(info) => BrowseEvent::Resolved(ResolvedService {
                            fullname: info.get_fullname().to_string(),
                            instance_id: info.get_property_val_str(TXT_ID).and_then(|id| id.parse().ok()),
                            name: info.get_property_val_str(TXT_NAME).map(str::to_string),
                            addresses: info.get_addresses().iter().copied().collect(),
                            port: info.get_port(),
                        }),
                        ServiceEvent::ServiceRemoved(_, fullname) => BrowseEvent::Removed { fullname },
                        _ => continue,
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            })?;
        Ok(rx)
    }

    fn stop(&mut self) {
        let Some(daemon) = self.daemon.take() else {
            return;
        };
        if let Some(fullname) = self.registered.take() {
            if let Err(e) = daemon.unregister(&fullname) {
                log::debug!("Unregistering {fullname} failed: {e}");
            }
        }
        if let Err(e) = daemon.shutdown() {
            log::debug!("mDNS daemon shutdown failed: {e}");
        }
    }
}

impl Drop for MdnsBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Known remote instances, keyed by service instance name.
#[derive(Default)]
pub struct PeerRegistry {
    records: HashMap<String, PeerIdentity>,
}

impl PeerRegistry {
    /// Record or refresh a resolved instance. Returns the identity only when
    /// the instance was not known yet.
    pub fn observe(&mut self, fullname: &str, peer: PeerIdentity) -> Option<PeerIdentity> {
        if let Some(known) = self.records.get_mut(fullname) {
            known.name = peer.name;
            return None;
        }
        self.records.insert(fullname.to_string(), peer.clone());
        Some(peer)
    }

    /// Forget an instance. Returns its address if it was known.
    pub fn remove(&mut self, fullname: &str) -> Option<PeerKey> {
        self.records.remove(fullname).map(|peer| peer.address)
    }

    /// Forget everything.
    pub fn drain(&mut self) -> Vec<PeerKey> {
        self.records.drain().map(|(_, peer)| peer.address).collect()
    }
}

/// Peer a resolved service refers to, or `None` when it must be ignored
/// (foreign service, our own instance or endpoint, no address).
pub fn resolved_peer(
    identity: &LocalIdentity,
    config: &DiscoveryConfig,
    service: &ResolvedService,
) -> Option<PeerIdentity> {
    let label = service.fullname.strip_suffix(config.service_type.as_str())?;
    if service.instance_id == Some(identity.instance_id()) {
        return None;
    }
    let mut addresses = service.addresses.clone();
    addresses.sort();
    let ip = addresses
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addresses.first())
        .copied()?;
    let address = SocketAddr::new(ip, service.port);
    if identity.is_self(&address) {
        return None;
    }
    let name = service
        .name
        .clone()
        .unwrap_or_else(|| label.trim_end_matches('.').to_string());
    Some(PeerIdentity::new(name, address))
}

/// Doubling retry delay, capped.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Advertises this instance and reports others.
pub struct DiscoveryService {
    identity: LocalIdentity,
    config: DiscoveryConfig,
    backend: BackendFactory,
    running: Mutex<Option<Running>>,
    events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<DiscoveryEvent>>,
}

impl DiscoveryService {
    pub fn new(identity: LocalIdentity, config: DiscoveryConfig) -> Self {
        Self::with_backend(identity, config, Arc::new(|| Box::new(MdnsBackend::default())))
    }

    pub fn with_backend(identity: LocalIdentity, config: DiscoveryConfig, backend: BackendFactory) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            config,
            backend,
            running: Mutex::new(None),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        self.events_rx.take()
    }

    /// Start advertising and browsing. Returns `false` if already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return false;
        }
        let cancel = CancellationToken::new();
        let worker = Worker {
            identity: self.identity.clone(),
            config: self.config.clone(),
            backend: (self.backend)(),
            events_tx: self.events_tx.clone(),
            cancel: cancel.clone(),
            registry: PeerRegistry::default(),
        };
        let task = tokio::spawn(worker.run());
        *running = Some(Running { cancel, task });
        log::info!("Discovery started for {} ({})", self.identity.name(), self.config.service_type);
        true
    }

    /// Unregister and stop. Every known peer is reported lost.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            log::error!("Discovery worker panicked: {e}");
        }
        log::info!("Discovery stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

struct Worker {
    identity: LocalIdentity,
    config: DiscoveryConfig,
    backend: Box<dyn ServiceBackend>,
    events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    cancel: CancellationToken,
    registry: PeerRegistry,
}

impl Worker {
    async fn run(mut self) {
        let record = ServiceRecord::new(&self.identity, &self.config);
        let mut backoff = self.config.backoff_min;

        while !self.cancel.is_cancelled() {
            let failure = match self.backend.start(&record) {
                Ok(mut browse) => {
                    backoff = self.config.backoff_min;
                    log::info!("Registered {} on {}:{}", record.fullname(), record.ip, record.port);
                    match self.serve(&mut browse).await {
                        None => break,
                        Some(e) => e,
                    }
                }
                Err(e) => e,
            };
            self.backend.stop();
            // Records from a dead browser cannot be trusted.
            self.lose_all();

            log::warn!("Discovery unavailable, retrying in {backoff:?}: {failure}");
            self.emit(DiscoveryEvent::Status(format!("discovery unavailable: {failure}")));
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, self.config.backoff_max);
        }

        self.backend.stop();
        self.lose_all();
    }

    /// Returns `None` when cancelled.
    async fn serve(&mut self, browse: &mut mpsc::UnboundedReceiver<BrowseEvent>) -> Option<DiscoveryError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                event = browse.recv() => match event {
                    Some(event) => self.handle(event),
                    None => return Some(DiscoveryError::BrowseEnded),
                },
            }
        }
    }

    fn handle(&mut self, event: BrowseEvent) {
        match event {
            BrowseEvent::Resolved(service) => {
                let Some(peer) = resolved_peer(&self.identity, &self.config, &service) else {
                    log::trace!("Ignoring service {}", service.fullname);
                    return;
                };
                if let Some(peer) = self.registry.observe(&service.fullname, peer) {
                    log::info!("Discovered {} at {}", peer.name, peer.address);
                    self.emit(DiscoveryEvent::PeerFound(peer));
                }
            }
            BrowseEvent::Removed { fullname } => {
                if let Some(address) = self.registry.remove(&fullname) {
                    log::info!("Service {fullname} at {address} went away");
                    self.emit(DiscoveryEvent::PeerLost(address));
                }
            }
        }
    }

    fn lose_all(&mut self) {
        for address in self.registry.drain() {
            self.emit(DiscoveryEvent::PeerLost(address));
        }
    }

    fn emit(&self, event: DiscoveryEvent) {
        let _ = self.events_tx.send(event);
    }
}
