//! Registry backends.
//!
//! The bridge only ever talks to a [`RegistryAdapter`]; each backend is one
//! implementation selected by the scheme of the configured registry URI.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::types::Service;

pub mod dns;
pub mod filtered;

pub use dns::DnsRegistry;
pub use filtered::FilteredRegistry;

#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    /// Checks the backend is reachable and correctly configured.
    async fn ping(&self) -> Result<(), RegistryError>;

    async fn register(&self, service: &Service) -> Result<(), RegistryError>;

    async fn deregister(&self, service: &Service) -> Result<(), RegistryError>;

    /// Re-asserts a registered service, renewing its TTL.
    async fn refresh(&self, service: &Service) -> Result<(), RegistryError>;

    /// Services currently known to the backend.
    #[cfg_attr(not(test), allow(dead_code))]
    async fn services(&self) -> Result<Vec<Service>, RegistryError> {
        Err(RegistryError::Unsupported("listing services"))
    }

    /// Drops backend entries that are not in `valid`.
    async fn cleanup(&self, _valid: &[Service]) -> Result<(), RegistryError> {
        Err(RegistryError::Unsupported("cleanup"))
    }
}

/// Opens the backend named by `uri` (`scheme://address`).
pub async fn connect(uri: &str) -> Result<Arc<dyn RegistryAdapter>, RegistryError> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| RegistryError::InvalidUri(uri.to_string()))?;
    match scheme {
        "dns" => {
            let addr: SocketAddr = rest
                .parse()
                .map_err(|e| RegistryError::InvalidUri(format!("{}: {}", uri, e)))?;
            Ok(Arc::new(DnsRegistry::bind(addr).await?))
        }
        other => Err(RegistryError::InvalidUri(format!(
            "unsupported registry scheme {:?}",
            other
        ))),
    }
}
