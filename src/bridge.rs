//! Keeps a registry in step with the containers running on this host.
//!
//! The bridge remembers, per container id, the services it registered the
//! last time the container was added.  A container without an entry is
//! untracked; a container with an entry, even an empty one, has been
//! processed and further `add` calls for it are no-ops.
//!
//! Every operation takes the same lock for its whole duration, registry
//! calls and retry backoff included, so operations never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::config::{BridgeConfig, DeregisterCheck};
use crate::error::{RegistryError, RuntimeError};
use crate::registry::RegistryAdapter;
use crate::retry::RetryPolicy;
use crate::runtime::ContainerRuntime;
use crate::service::{Host, ServiceBuilder};
use crate::types::{short_id, Service};

/// Exit codes with this bit set mean the process was killed by a signal.
const SIGNAL_EXIT_MASK: i64 = 0x80;

/// Services of an exited container that were left to expire by TTL.
#[derive(Debug)]
struct DeadContainer {
    /// Seconds until the bridge forgets the container.
    ttl: i64,
    services: Vec<Service>,
}

#[derive(Debug, Default)]
struct State {
    services: HashMap<String, Vec<Service>>,
    /// Services whose registration failed; retried on sync.
    pending: HashMap<String, Vec<Service>>,
    dead: HashMap<String, DeadContainer>,
}

pub struct Bridge {
    registry: Arc<dyn RegistryAdapter>,
    runtime: Arc<dyn ContainerRuntime>,
    builder: ServiceBuilder,
    config: BridgeConfig,
    retry: RetryPolicy,
    state: Mutex<State>,
}

impl Bridge {
    pub fn new(
        registry: Arc<dyn RegistryAdapter>,
        runtime: Arc<dyn ContainerRuntime>,
        config: BridgeConfig,
        host: Host,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            runtime,
            builder: ServiceBuilder::new(config.clone(), host),
            config,
            retry,
            state: Mutex::new(State::default()),
        }
    }

    /// Checks the registry once; callers treat a failure as fatal.
    pub async fn ping(&self) -> Result<(), RegistryError> {
        self.registry.ping().await
    }

    /// Registers the services of a container not yet tracked.
    pub async fn add(&self, container_id: &str) {
        let mut state = self.state.lock().await;
        self.add_locked(&mut state, container_id, false).await;
    }

    /// Deregisters every service of the container and stops tracking it.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn remove(&self, container_id: &str) {
        let mut state = self.state.lock().await;
        self.remove_locked(&mut state, container_id, true).await;
    }

    /// Handles a container exit according to the deregister check.
    pub async fn remove_on_exit(&self, container_id: &str) {
        let mut state = self.state.lock().await;
        let deregister = self.should_remove(container_id).await;
        self.remove_locked(&mut state, container_id, deregister)
            .await;
    }

    /// Re-asserts every tracked service once, without retries.
    pub async fn refresh(&self) {
        let mut state = self.state.lock().await;

        let step = i64::try_from(self.config.refresh_interval)
            .unwrap_or(i64::MAX);
        state.dead.retain(|id, dead| {
            dead.ttl -= step;
            if dead.ttl <= 0 {
                debug!("forgetting dead container {}", short_id(id));
            }
            dead.ttl > 0
        });

        for (id, services) in &state.services {
            for service in services {
                match self.registry.refresh(service).await {
                    Ok(()) => debug!("refreshed: {} {}", short_id(id), service.id),
                    Err(e) => error!("refresh failed: {}: {}", service.id, e),
                }
            }
        }
    }

    /// Reconciles tracked state with the running containers.
    ///
    /// Untracked containers are added and tracked ones re-registered.
    /// Containers missing from the listing are left alone.
    pub async fn sync(&self, quiet: bool) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().await;

        let containers = self.runtime.list_running().await?;
        info!("Syncing services on {} containers", containers.len());

        for id in &containers {
            if state.services.contains_key(id) {
                self.reregister_locked(&mut state, id).await;
            } else {
                self.add_locked(&mut state, id, quiet).await;
            }
        }

        if self.config.cleanup {
            self.cleanup_locked(&state).await;
        }
        Ok(())
    }

    /// Services recorded for a container, `None` when untracked.
    #[cfg(test)]
    pub async fn services(&self, container_id: &str) -> Option<Vec<Service>> {
        self.state.lock().await.services.get(container_id).cloned()
    }

    async fn add_locked(&self, state: &mut State, container_id: &str, quiet: bool) {
        let short = short_id(container_id);

        if let Some(dead) = state.dead.remove(container_id) {
            state.services.insert(container_id.to_string(), dead.services);
        }
        if state.services.contains_key(container_id) {
            info!("container {} already exists, ignoring", short);
            return;
        }

        let container = match self.runtime.inspect(container_id).await {
            Ok(c) => Arc::new(c),
            Err(e) => {
                warn!("unable to inspect container {}: {}", short, e);
                return;
            }
        };

        debug!(
            "inspected {} ({}), image {}, hostname {}",
            short,
            container.display_name(),
            container.image,
            container.hostname
        );

        let ports = container.published_ports();
        if ports.is_empty() && !quiet {
            info!("ignored: {} no published ports", short);
        }

        let ports: Vec<_> = ports
            .into_iter()
            .filter(|port| {
                let keep = self.config.internal || port.host_port.is_some();
                if !keep && !quiet {
                    info!(
                        "ignored: {} port {} not published on host",
                        short, port.exposed_port
                    );
                }
                keep
            })
            .collect();

        let is_group = ports.len() > 1;
        let mut services = Vec::new();
        let mut pending = Vec::new();
        for port in &ports {
            let service = match self.builder.build(port, is_group) {
                Ok(service) => service,
                Err(skip) => {
                    if !quiet {
                        info!(
                            "ignored: {} service on port {} ({})",
                            short, port.exposed_port, skip
                        );
                    }
                    continue;
                }
            };
            match self.retry.run(|| self.registry.register(&service)).await {
                Ok(()) => {
                    info!("added: {} {}", short, service.id);
                    services.push(service);
                }
                Err(e) => {
                    error!("register failed: {}: {}", service, e);
                    pending.push(service);
                }
            }
        }

        state.services.insert(container_id.to_string(), services);
        if !pending.is_empty() {
            state.pending.insert(container_id.to_string(), pending);
        }
    }

    async fn reregister_locked(&self, state: &mut State, container_id: &str) {
        if let Some(services) = state.services.get(container_id) {
            for service in services {
                if let Err(e) = self.retry.run(|| self.registry.register(service)).await {
                    error!("sync register failed: {}: {}", service, e);
                }
            }
        }

        let Some(pending) = state.pending.remove(container_id) else {
            return;
        };
        let mut still_pending = Vec::new();
        for service in pending {
            match self.retry.run(|| self.registry.register(&service)).await {
                Ok(()) => {
                    info!("added: {} {}", short_id(container_id), service.id);
                    state
                        .services
                        .entry(container_id.to_string())
                        .or_default()
                        .push(service);
                }
                Err(e) => {
                    error!("sync register failed: {}: {}", service, e);
                    still_pending.push(service);
                }
            }
        }
        if !still_pending.is_empty() {
            state.pending.insert(container_id.to_string(), still_pending);
        }
    }

    async fn remove_locked(
        &self,
        state: &mut State,
        container_id: &str,
        deregister: bool,
    ) {
        let short = short_id(container_id);
        let services = state.services.remove(container_id);
        state.pending.remove(container_id);

        if deregister {
            let mut services = services.unwrap_or_default();
            if let Some(dead) = state.dead.remove(container_id) {
                services.extend(dead.services);
            }
            for service in &services {
                match self.retry.run(|| self.registry.deregister(service)).await {
                    Ok(()) => info!("removed: {} {}", short, service.id),
                    Err(e) => error!("deregister failed: {}: {}", service.id, e),
                }
            }
        } else if let Some(services) = services.filter(|_| self.config.ttl != 0) {
            // Stop refreshing and let the registry expire them.
            debug!(
                "parking {} services of {} until ttl expiry",
                services.len(),
                short
            );
            state.dead.insert(
                container_id.to_string(),
                DeadContainer {
                    ttl: i64::try_from(self.config.ttl).unwrap_or(i64::MAX),
                    services,
                },
            );
        }
    }

    async fn should_remove(&self, container_id: &str) -> bool {
        if self.config.deregister == DeregisterCheck::Always {
            return true;
        }
        let short = short_id(container_id);
        match self.runtime.inspect(container_id).await {
            Err(RuntimeError::NotFound(_)) => {
                info!(
                    "container {} was removed, could not fetch exit code",
                    short
                );
                true
            }
            Err(e) => {
                warn!(
                    "error fetching status for container {} on die event: {}",
                    short, e
                );
                false
            }
            Ok(c) if c.running => {
                info!("not removing container {}, still running", short);
                false
            }
            Ok(c) if c.exit_code == 0 || c.exit_code & SIGNAL_EXIT_MASK != 0 => true,
            Ok(c) => {
                info!(
                    "not removing container {}, exit code {}",
                    short, c.exit_code
                );
                false
            }
        }
    }

    async fn cleanup_locked(&self, state: &State) {
        let valid: Vec<Service> = state
            .services
            .values()
            .flatten()
            .chain(state.dead.values().flat_map(|d| d.services.iter()))
            .cloned()
            .collect();
        match self.registry.cleanup(&valid).await {
            Ok(()) => debug!("cleanup kept {} services", valid.len()),
            Err(RegistryError::Unsupported(what)) => debug!("registry does not support {}", what),
            Err(e) => warn!("cleanup failed: {}", e),
        }
    }
}
