//! Data structures shared by the bridge, the runtime and the registries.
//!
//! A [`Container`] is the read-only record handed over by the runtime on
//! every inspection.  Each of its port bindings becomes a [`PublishedPort`],
//! and each published port that survives the metadata rules becomes a
//! [`Service`], the unit handed to registry backends.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::FilterError;

/// Transport protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(FilterError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Address family a service is advertised under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// IPv6 when `ip` parses as an IPv6 address, IPv4 otherwise.
    pub fn of(ip: &str) -> Self {
        if ip.parse::<Ipv6Addr>().is_ok() {
            Family::V6
        } else {
            Family::V4
        }
    }
}

/// A container port as Docker keys it, e.g. `80/tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortKey {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortKey {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

impl FromStr for PortKey {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, protocol) = match s.split_once('/') {
            Some((port, proto)) => (port, proto.parse()?),
            None => (s, Protocol::Tcp),
        };
        let port = port
            .parse()
            .map_err(|_| FilterError::InvalidPort(port.to_string()))?;
        Ok(Self::new(port, protocol))
    }
}

/// One host-side binding of a container port.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: Option<u16>,
}

/// Container configuration as reported by the runtime.
///
/// Supplied fresh on every inspection; the bridge never mutates it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Container {
    pub id: String,
    /// Docker reports names with a leading `/`.
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub hostname: String,
    pub network_mode: String,
    /// Address on the default bridge network, empty when not attached.
    pub ip_address: String,
    /// Network name to container address on that network.
    pub networks: BTreeMap<String, String>,
    /// Ports declared in the image/container config (host networking).
    pub exposed_ports: Vec<PortKey>,
    /// Runtime port bindings from the network settings.
    pub port_bindings: BTreeMap<PortKey, Vec<PortBinding>>,
    pub running: bool,
    pub exit_code: i64,
}

impl Container {
    /// Container name without Docker's leading slash.
    pub fn display_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }

    /// Union of configured and runtime port bindings.
    ///
    /// Configured ports are published on `0.0.0.0` at the same port number;
    /// runtime bindings overwrite them for the same `port/protocol` key.
    pub fn published_ports(self: &Arc<Self>) -> Vec<PublishedPort> {
        let mut ports = BTreeMap::new();
        for key in &self.exposed_ports {
            let binding = PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: Some(key.port),
            };
            ports.insert(*key, PublishedPort::new(self, *key, &[binding]));
        }
        for (key, bindings) in &self.port_bindings {
            ports.insert(*key, PublishedPort::new(self, *key, bindings));
        }
        ports.into_values().collect()
    }
}

/// First twelve characters of a container id, as Docker abbreviates them.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// A container port together with its host and internal addressing.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedPort {
    pub host_ip: String,
    /// `None` when the port is not published on the host.
    pub host_port: Option<u16>,
    pub exposed_ip: String,
    pub exposed_port: u16,
    pub protocol: Protocol,
    /// Owning container, for read-only lookups.
    pub container: Arc<Container>,
}

impl PublishedPort {
    pub fn new(container: &Arc<Container>, key: PortKey, published: &[PortBinding]) -> Self {
        let (mut host_ip, host_port) = published
            .first()
            .map(|b| (b.host_ip.clone(), b.host_port))
            .unwrap_or_default();
        if host_ip.is_empty() {
            host_ip = "0.0.0.0".to_string();
        }

        // User-defined networks publish on the container's own address there.
        let mode = container.network_mode.as_str();
        if !matches!(mode, "" | "bridge" | "default" | "host") {
            host_ip = container.networks.get(mode).cloned().unwrap_or_default();
        }

        let exposed_ip = if container.ip_address.is_empty() {
            container
                .networks
                .values()
                .last()
                .cloned()
                .unwrap_or_default()
        } else {
            container.ip_address.clone()
        };

        Self {
            host_ip,
            host_port,
            exposed_ip,
            exposed_port: key.port,
            protocol: key.protocol,
            container: Arc::clone(container),
        }
    }
}

/// The unit of registration handed to registry backends.
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    /// Stable across repeated derivation from the same container and port.
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub tags: Vec<String>,
    /// Metadata left over once `id`, `name` and `tags` are consumed.
    pub attrs: BTreeMap<String, String>,
    /// Seconds; zero means no expiry.
    pub ttl: u64,
    /// The published port this service was derived from.
    pub origin: PublishedPort,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} @ {}:{})", self.id, self.name, self.ip, self.port)
    }
}

/// Container lifecycle notifications from the runtime monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// A container started and should be added.
    Start { id: String },
    /// A container exited; the deregister check decides what happens.
    Die { id: String },
    /// The event stream was (re)established; state may have drifted.
    Resync,
}
