//! Adapter decorator that only lets admitted endpoints through.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use super::RegistryAdapter;
use crate::error::RegistryError;
use crate::filter::Filters;
use crate::types::Service;

/// Forwards services to `inner` only when their address and port match
/// one of `filters`.
///
/// Rejected services are skipped silently, so the bridge still tracks them
/// and re-evaluates them on every sync.
pub struct FilteredRegistry {
    inner: Arc<dyn RegistryAdapter>,
    filters: Filters,
    /// Whether service addresses are container-side.
    internal: bool,
}

impl FilteredRegistry {
    pub fn new(inner: Arc<dyn RegistryAdapter>, filters: Filters, internal: bool) -> Self {
        Self {
            inner,
            filters,
            internal,
        }
    }

    fn admits(&self, service: &Service) -> bool {
        let ip = &service.ip;
        match self.filters.matches(ip, service.port, self.internal) {
            Ok(Some(filter)) => {
                debug!("admitted: {} by {}", service.id, filter);
                true
            }
            Ok(None) => {
                debug!("filtered: {} ({}:{})", service.id, service.ip, service.port);
                false
            }
            Err(e) => {
                warn!("filtered: {}: {}", service.id, e);
                false
            }
        }
    }
}

#[async_trait]
impl RegistryAdapter for FilteredRegistry {
    async fn ping(&self) -> Result<(), RegistryError> {
        self.inner.ping().await
    }

    async fn register(&self, service: &Service) -> Result<(), RegistryError> {
        if !self.admits(service) {
            return Ok(());
        }
        self.inner.register(service).await
    }

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError> {
        if !self.admits(service) {
            return Ok(());
        }
        self.inner.deregister(service).await
    }

    async fn refresh(&self, service: &Service) -> Result<(), RegistryError> {
        if !self.admits(service) {
            return Ok(());
        }
        self.inner.refresh(service).await
    }

    async fn services(&self) -> Result<Vec<Service>, RegistryError> {
        self.inner.services().await
    }

    async fn cleanup(&self, valid: &[Service]) -> Result<(), RegistryError> {
        let admitted: Vec<Service> = valid
            .iter()
            .filter(|s| self.admits(s))
            .cloned()
            .collect();
        self.inner.cleanup(&admitted).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::dns::ServiceTable;
    use crate::registry::DnsRegistry;
    use crate::types::{Container, PortKey, Protocol, PublishedPort};
    use std::collections::BTreeMap;

    fn service(id: &str, ip: &str, port: u16) -> Service {
        let container = Arc::new(Container::default());
        Service {
            id: id.into(),
            name: "web".into(),
            ip: ip.into(),
            port,
            tags: Vec::new(),
            attrs: BTreeMap::new(),
            ttl: 0,
            origin: PublishedPort::new(&container, PortKey::new(port, Protocol::Tcp), &[]),
        }
    }

    fn registry(filter: &str, internal: bool) -> FilteredRegistry {
        let backend = DnsRegistry::detached(ServiceTable::default());
        FilteredRegistry::new(Arc::new(backend), filter.parse().unwrap(), internal)
    }

    #[tokio::test]
    async fn test_only_admitted_services_reach_backend() {
        let registry = registry("10.0.0.0/8:80-89", false);
        for svc in [
            service("a", "10.1.1.1", 80),
            service("b", "10.1.1.1", 443),
            service("c", "192.168.0.1", 80),
            service("d", "", 80),
        ] {
            registry.register(&svc).await.unwrap();
        }

        let ids: Vec<String> = registry
            .services()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_not_an_error() {
        let registry = registry("10.0.0.0/8", false);
        let rejected = service("x", "192.168.0.1", 80);
        registry.refresh(&rejected).await.unwrap();

        // Admitted, so the backend sees a refresh for an unknown service.
        let admitted = service("y", "10.0.0.1", 80);
        assert!(registry.refresh(&admitted).await.is_err());
    }

    #[tokio::test]
    async fn test_role_filters_follow_addressing_mode() {
        let host_side = registry("container", false);
        let svc = service("a", "172.17.0.2", 80);
        host_side.register(&svc).await.unwrap();
        assert!(host_side.services().await.unwrap().is_empty());

        let container_side = registry("container", true);
        container_side.register(&svc).await.unwrap();
        assert_eq!(container_side.services().await.unwrap().len(), 1);
    }
}
