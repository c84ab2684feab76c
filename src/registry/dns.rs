//! In-process registry served over DNS.
//!
//! Registered services are kept in a table keyed by service id.  A
//! lightweight DNS server built on
//! [hickory-dns](https://crates.io/crates/hickory-server) answers queries
//! from that table:
//!
//! * **Single-label names** (no dots): treated as service names.  Every
//!   live service with that name contributes an A or AAAA record, and a
//!   TXT record carrying its id, port, tags and attributes.
//! * **FQDNs** (names containing a dot): forwarded to upstream resolvers
//!   using the `hickory-resolver` crate.
//!
//! Services with a TTL expire unless they are refreshed in time; expired
//! entries are no longer answered and are dropped on cleanup.

use std::collections::HashMap;
use std::iter;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::op::{Header, ResponseCode};
use hickory_server::proto::rr::rdata::{A, AAAA, TXT};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use hickory_server::server::{
    Request, RequestHandler, ResponseHandler, ResponseInfo, ServerFuture,
};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use super::RegistryAdapter;
use crate::error::RegistryError;
use crate::types::Service;

/// Timeout for idle TCP connections.
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Record TTL for services registered without one.
const DEFAULT_RECORD_TTL: u32 = 5;

/// TTL of forwarded answers.
const FORWARD_TTL: u32 = 60;

#[derive(Debug, Clone)]
struct Entry {
    service: Service,
    expires: Option<Instant>,
}

impl Entry {
    fn new(service: Service) -> Self {
        let expires = expiry(&service);
        Self { service, expires }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| at > now)
    }
}

fn expiry(service: &Service) -> Option<Instant> {
    let ttl = Duration::from_secs(service.ttl);
    (service.ttl > 0).then(|| Instant::now() + ttl)
}

/// Services by id, shared between the adapter and the DNS handler.
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl ServiceTable {
    pub async fn upsert(&self, service: &Service) {
        let entry = Entry::new(service.clone());
        let mut entries = self.entries.write().await;
        entries.insert(service.id.clone(), entry);
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.entries.write().await.remove(id).is_some()
    }

    /// Renews the TTL of a known service.
    pub async fn renew(&self, service: &Service) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&service.id) {
            Some(entry) => {
                *entry = Entry::new(service.clone());
                true
            }
            None => false,
        }
    }

    /// Live services, ordered by id.
    pub async fn live(&self) -> Vec<Service> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut services: Vec<Service> = entries
            .values()
            .filter(|e| e.is_live(now))
            .map(|e| e.service.clone())
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    /// Live services named `name`, ordered by id.
    pub async fn lookup(&self, name: &str) -> Vec<Service> {
        let mut services = self.live().await;
        services.retain(|s| s.name.eq_ignore_ascii_case(name));
        services
    }

    /// Keeps only live entries whose id appears in `valid`; returns how many were dropped.
    pub async fn retain(&self, valid: &[Service]) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|id, entry| {
            entry.is_live(now) && valid.iter().any(|s| &s.id == id)
        });
        before - entries.len()
    }
}

fn record_ttl(service: &Service) -> u32 {
    if service.ttl == 0 {
        DEFAULT_RECORD_TTL
    } else {
        u32::try_from(service.ttl).unwrap_or(u32::MAX)
    }
}

/// Registry adapter backed by a [`ServiceTable`] and its DNS server.
pub struct DnsRegistry {
    table: ServiceTable,
    server: Option<JoinHandle<()>>,
}

impl DnsRegistry {
    /// Binds UDP and TCP on `addr` and starts serving the table.
    pub async fn bind(addr: SocketAddr) -> Result<Self, RegistryError> {
        info!("DNS registry starting on {}", addr);

        // Create a system resolver for forwarding FQDNs.
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!(
                "Failed to load system resolv.conf: {}. Falling back to default upstreams.",
                e
            );
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });

        let table = ServiceTable::default();
        let handler = ServiceDns {
            table: table.clone(),
            resolver,
        };
        let mut server = ServerFuture::new(handler);

        let udp = UdpSocket::bind(addr).await?;
        server.register_socket(udp);

        let tcp = TcpListener::bind(addr).await?;
        server.register_listener(tcp, TCP_TIMEOUT);

        let server = tokio::spawn(async move {
            if let Err(e) = server.block_until_done().await {
                error!("DNS server failed: {}", e);
            }
        });

        Ok(Self {
            table,
            server: Some(server),
        })
    }

    /// A registry over `table` without a DNS server.
    #[cfg(test)]
    pub fn detached(table: ServiceTable) -> Self {
        Self {
            table,
            server: None,
        }
    }
}

impl Drop for DnsRegistry {
    fn drop(&mut self) {
        if let Some(server) = &self.server {
            server.abort();
        }
    }
}

#[async_trait]
impl RegistryAdapter for DnsRegistry {
    async fn ping(&self) -> Result<(), RegistryError> {
        match &self.server {
            Some(server) if server.is_finished() => {
                Err(RegistryError::Backend("DNS server is not running".into()))
            }
            _ => Ok(()),
        }
    }

    async fn register(&self, service: &Service) -> Result<(), RegistryError> {
        self.table.upsert(service).await;
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError> {
        if !self.table.remove(&service.id).await {
            debug!("Deregistering unknown service {}", service.id);
        }
        Ok(())
    }

    async fn refresh(&self, service: &Service) -> Result<(), RegistryError> {
        if self.table.renew(service).await {
            Ok(())
        } else {
            Err(RegistryError::Backend(format!(
                "service {} is not registered",
                service.id
            )))
        }
    }

    async fn services(&self) -> Result<Vec<Service>, RegistryError> {
        Ok(self.table.live().await)
    }

    async fn cleanup(&self, valid: &[Service]) -> Result<(), RegistryError> {
        let dropped = self.table.retain(valid).await;
        if dropped > 0 {
            info!("Cleaned up {} dangling services", dropped);
        }
        Ok(())
    }
}

/// `key=value` strings describing a service.
fn txt_data(service: &Service) -> Vec<String> {
    let mut data = vec![
        format!("id={}", service.id),
        format!("port={}", service.port),
    ];
    if !service.tags.is_empty() {
        data.push(format!("tags={}", service.tags.join(",")));
    }
    for (k, v) in &service.attrs {
        data.push(format!("{}={}", k, v));
    }
    data
}

struct ServiceDns {
    table: ServiceTable,
    resolver: TokioAsyncResolver,
}

impl ServiceDns {
    /// Answers for a service name: one address record per distinct address,
    /// plus one TXT record per service.
    fn service_records(name: &Name, services: &[Service], qtype: RecordType) -> Vec<Record> {
        let ttl = services
            .iter()
            .map(record_ttl)
            .min()
            .unwrap_or(DEFAULT_RECORD_TTL);

        let mut addrs: Vec<IpAddr> = Vec::new();
        for service in services {
            match service.ip.parse::<IpAddr>() {
                Ok(ip) if !addrs.contains(&ip) => addrs.push(ip),
                Ok(_) => {}
                Err(_) => debug!("Service {} has no usable address", service.id),
            }
        }

        let mut records = Self::records(name, &addrs, qtype, ttl);
        if matches!(qtype, RecordType::TXT | RecordType::ANY) {
            records.extend(services.iter().map(|service| {
                Record::from_rdata(name.clone(), ttl, RData::TXT(TXT::new(txt_data(service))))
            }));
        }
        records
    }

    fn records(name: &Name, addrs: &[IpAddr], qtype: RecordType, ttl: u32) -> Vec<Record> {
        addrs
            .iter()
            .filter_map(|addr| {
                let (wanted, rdata) = match addr {
                    IpAddr::V4(ip) => (RecordType::A, RData::A(A(*ip))),
                    IpAddr::V6(ip) => (RecordType::AAAA, RData::AAAA(AAAA(*ip))),
                };
                (qtype == wanted || qtype == RecordType::ANY)
                    .then(|| Record::from_rdata(name.clone(), ttl, rdata))
            })
            .collect()
    }

    async fn respond<R>(
        request: &Request,
        mut response_handle: R,
        header: Header,
        records: &[Record],
    ) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let mut failed = header.clone();
        failed.set_response_code(ResponseCode::ServFail);

        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            records.iter(),
            iter::empty(),
            iter::empty(),
            iter::empty(),
        );
        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to send DNS response: {}", e);
                failed.into()
            }
        }
    }
}

#[async_trait]
impl RequestHandler for ServiceDns {
    async fn handle_request<R>(&self, request: &Request, response: R) -> ResponseInfo
    where
        R: ResponseHandler + Send,
    {
        let query = request.query();
        let name: Name = query.name().clone().into();
        let qname = query.name().to_string().trim_end_matches('.').to_string();
        let qtype = query.query_type();

        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(true);

        if !qname.contains('.') {
            let services = self.table.lookup(&qname).await;
            if services.is_empty() {
                header.set_response_code(ResponseCode::NXDomain);
            }
            let records = Self::service_records(&name, &services, qtype);
            return Self::respond(request, response, header, &records).await;
        }

        match self.resolver.lookup_ip(qname.clone()).await {
            Ok(lookup) => {
                let addrs: Vec<IpAddr> = lookup.iter().collect();
                let records = Self::records(&name, &addrs, qtype, FORWARD_TTL);
                Self::respond(request, response, header, &records).await
            }
            Err(e) => {
                warn!("Resolver lookup failed for {}: {}", qname, e);
                header.set_response_code(ResponseCode::ServFail);
                Self::respond(request, response, header, &[]).await
            }
        }
    }
}
