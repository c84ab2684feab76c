//! Derivation of [`Service`] entities from published ports.

use std::fmt;
use std::net::IpAddr;

use hickory_resolver::TokioAsyncResolver;
use log::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::metadata;
use crate::types::{Family, Protocol, PublishedPort, Service};

/// The machine the bridge runs on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Host {
    /// Hostname used as the first segment of service ids.
    pub name: String,
    /// What `name` resolves to; substituted for wildcard host bindings.
    pub address: Option<IpAddr>,
}

impl Host {
    /// Determines the hostname and resolves it once.
    ///
    /// A configured name wins over `$HOSTNAME`, which wins over `/etc/hostname`.
    pub async fn detect(configured: Option<&str>) -> Self {
        let name = configured
            .map(str::to_string)
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
            })
            .unwrap_or_default();

        let address = if name.is_empty() {
            None
        } else {
            resolve(&name).await
        };
        info!("Host {:?} resolves to {:?}", name, address);
        Self { name, address }
    }
}

async fn resolve(name: &str) -> Option<IpAddr> {
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to load system resolver configuration: {}", e);
            return None;
        }
    };
    match resolver.lookup_ip(name).await {
        Ok(lookup) => lookup.iter().next(),
        Err(e) => {
            warn!("Failed to resolve hostname {}: {}", name, e);
            None
        }
    }
}

/// Why a published port produced no service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// `SERVICE_IGNORE` (or a port-qualified variant) is set.
    Ignored,
    /// External addressing and the port has no host binding.
    NotPublished,
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Skip::Ignored => f.write_str("ignore attribute set"),
            Skip::NotPublished => f.write_str("not published on host"),
        }
    }
}

/// Turns published ports into services under one bridge configuration.
#[derive(Debug, Clone)]
pub struct ServiceBuilder {
    config: BridgeConfig,
    host: Host,
}

impl ServiceBuilder {
    pub fn new(config: BridgeConfig, host: Host) -> Self {
        Self { config, host }
    }

    /// Builds the service for `port`.
    ///
    /// `is_group` is set when the container publishes more than one port, in
    /// which case names not taken from a port-qualified declaration get the
    /// exposed port appended.
    pub fn build(&self, port: &PublishedPort, is_group: bool) -> Result<Service, Skip> {
        let container = &port.container;

        let hostname = if self.host.name.is_empty() {
            port.host_ip.as_str()
        } else {
            self.host.name.as_str()
        };

        let mut host_ip = port.host_ip.clone();
        if host_ip == "0.0.0.0" {
            if let Some(addr) = self.host.address {
                host_ip = addr.to_string();
            }
        }
        if let Some(forced) = &self.config.host_ip {
            host_ip = forced.clone();
        }

        let (mut ip, service_port) = if self.config.internal {
            (port.exposed_ip.clone(), port.exposed_port)
        } else {
            match port.host_port {
                Some(p) => (host_ip, p),
                None => return Err(Skip::NotPublished),
            }
        };

        if let Some(label) = &self.config.ip_from_label {
            let short = container.short_id();
            match container.labels.get(label).filter(|v| !v.is_empty()) {
                Some(value) => {
                    let addr = value.rsplit_once('/').map_or(value.as_str(), |(a, _)| a);
                    ip = addr.to_string();
                    debug!("using container IP {} from label '{}'", ip, label);
                }
                None => warn!("Label '{}' not found on container {}", label, short),
            }
        }

        let mut metadata = metadata::extract(
            metadata::declarations(container),
            port.exposed_port,
            Family::of(&ip),
        );
        if metadata.is_ignored() {
            return Err(Skip::Ignored);
        }

        let name_from_port = metadata.from_port("name");
        let mut name = metadata
            .take("name")
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| image_base_name(&container.image).to_string());
        if is_group && !name_from_port {
            name = format!("{}-{}", name, port.exposed_port);
        }

        let mut id = format!(
            "{}:{}:{}",
            hostname,
            container.display_name(),
            port.exposed_port
        );
        if port.protocol == Protocol::Udp {
            id.push_str(":udp");
        }
        if let Some(custom) = metadata.take("id").filter(|v| !v.is_empty()) {
            id = custom;
        }

        let tags = combine_tags(
            metadata.take("tags").as_deref(),
            &self.config.force_tags,
            port.protocol,
        );
        metadata.take("ignore");

        Ok(Service {
            id,
            name,
            ip,
            port: service_port,
            tags,
            attrs: metadata.into_attrs(),
            ttl: self.config.ttl,
            origin: port.clone(),
        })
    }
}

/// Repository name of an image reference, without registry, path or tag.
fn image_base_name(image: &str) -> &str {
    let base = image.rsplit('/').next().unwrap_or(image);
    let base = base.split('@').next().unwrap_or(base);
    base.split(':').next().unwrap_or(base)
}

/// Metadata tags, then forced tags, then the `udp` marker.
fn combine_tags(
    metadata_tags: Option<&str>,
    forced: &[String],
    protocol: Protocol,
) -> Vec<String> {
    let mut tags: Vec<String> = metadata_tags
        .filter(|t| !t.is_empty())
        .map(|t| t.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    tags.extend(forced.iter().cloned());
    if protocol == Protocol::Udp {
        tags.push("udp".to_string());
    }
    tags
}
