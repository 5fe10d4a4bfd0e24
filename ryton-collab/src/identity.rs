//! Who we are on the network, and how peer addresses are keyed.
//!
//! A peer is keyed by its *signaling endpoint*: the IP it is reachable at
//! plus the TCP port its signaling listener is bound to. Two IDE instances
//! on the same host are therefore distinct peers, while `127.0.0.1` with no
//! port still names our own endpoint.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::SystemTime;
use uuid::Uuid;

/// Peer key used throughout the public API.
pub type PeerKey = SocketAddr;

/// Prefix of the default instance name.
const NAME_PREFIX: &str = "RytonIDE Peer_";

/// Address used only to pick the outgoing interface; nothing is sent.
const ROUTE_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

/// This process's identity on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    instance_id: Uuid,
    name: String,
    ip: Ipv4Addr,
    listen_port: u16,
}

impl LocalIdentity {
    pub fn new(name: impl Into<String>, ip: Ipv4Addr, listen_port: u16) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            name: name.into(),
            ip,
            listen_port,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Our own peer key as other instances see it.
    pub fn signaling_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.listen_port)
    }

    /// Whether `addr` designates this process.
    ///
    /// Loopback and unspecified IPs count as ours, as does the detected
    /// routable address; the port must match our signaling port.
    pub fn is_self(&self, addr: &SocketAddr) -> bool {
        if addr.port() != self.listen_port {
            return false;
        }
        let ip = addr.ip();
        ip.is_loopback() || ip.is_unspecified() || ip == IpAddr::V4(self.ip)
    }
}

/// A remote IDE instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub name: String,
    pub address: PeerKey,
    pub discovered_at: SystemTime,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, address: PeerKey) -> Self {
        Self {
            name: name.into(),
            address,
            discovered_at: SystemTime::now(),
        }
    }

    /// Placeholder identity used until the remote introduces itself.
    pub fn unnamed(address: PeerKey) -> Self {
        Self::new(format!("Peer@{}", address.ip()), address)
    }
}

/// Errors turning user input into a peer key.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("invalid address: {0}")]
    Invalid(String),
    #[error("cannot resolve {host}: {reason}")]
    Unresolved { host: String, reason: String },
}

/// Routable IPv4 address of this host.
///
/// Connecting a UDP socket only selects a route; no datagram leaves the
/// machine. Falls back to loopback when there is no route.
pub fn detect_local_ip() -> Ipv4Addr {
    let route = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(ROUTE_TARGET)?;
        Ok(socket.local_addr()?.ip())
    };
    match route() {
        Ok(IpAddr::V4(ip)) if !ip.is_unspecified() => ip,
        Ok(_) => Ipv4Addr::LOCALHOST,
        Err(e) => {
            log::debug!("No outbound route, using loopback identity: {e}");
            Ipv4Addr::LOCALHOST
        }
    }
}

/// Host name for the default instance name.
pub fn host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .chain(std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// `"RytonIDE Peer_<hostname>"`.
pub fn default_instance_name() -> String {
    format!("{NAME_PREFIX}{}", host_name())
}

/// Parsed user input: either already a socket address, or a host name
/// still to be looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    Socket(SocketAddr),
    Host { host: String, port: u16 },
}

impl PeerAddress {
    /// Look the host name up, IPv4 preferred.
    pub async fn resolve(self) -> Result<SocketAddr, AddressError> {
        let (host, port) = match self {
            Self::Socket(addr) => return Ok(addr),
            Self::Host { host, port } => (host, port),
        };
        let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| AddressError::Unresolved {
                host: host.clone(),
                reason: e.to_string(),
            })?
            .collect();

        resolved
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| resolved.first())
            .copied()
            .ok_or_else(|| AddressError::Unresolved {
                host,
                reason: "no addresses".to_string(),
            })
    }
}

/// Parse user input without touching the network.
///
/// Accepts `ip`, `ip:port`, `[v6]:port`, `host` and `host:port`. A missing
/// port means `default_port` (normally our own signaling port, since every
/// instance listens on the same well-known port).
pub fn parse_peer_address(input: &str, default_port: u16) -> Result<PeerAddress, AddressError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AddressError::Empty);
    }
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(PeerAddress::Socket(addr));
    }
    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(PeerAddress::Socket(SocketAddr::new(ip, default_port)));
    }

    let (host, port) = match input.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| AddressError::Invalid(input.to_string()))?;
            (host, port)
        }
        Some(_) => return Err(AddressError::Invalid(input.to_string())),
        None => (input, default_port),
    };
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(AddressError::Invalid(input.to_string()));
    }
    Ok(PeerAddress::Host {
        host: host.to_string(),
        port,
    })
}

/// Turn user input into a peer key, resolving host names asynchronously.
pub async fn resolve_peer_address(input: &str, default_port: u16) -> Result<SocketAddr, AddressError> {
    parse_peer_address(input, default_port)?.resolve().await
}
