//! portbridge daemon entry point.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

mod bridge;
mod config;
mod error;
mod filter;
mod metadata;
mod registry;
mod retry;
mod runtime;
mod service;
mod types;

use bridge::Bridge;
use config::Config;
use registry::{FilteredRegistry, RegistryAdapter};
use runtime::{ContainerRuntime, DockerRuntime};
use service::Host;
use types::ContainerEvent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting portbridge with config: {:?}", cfg);

    // Registry backend, optionally behind the admission filter
    let backend = registry::connect(&cfg.registry).await?;
    let registry: Arc<dyn RegistryAdapter> = match cfg.filters()? {
        Some(filters) => {
            info!("Admitting only endpoints matching {}", filters);
            Arc::new(FilteredRegistry::new(backend, filters, cfg.internal))
        }
        None => backend,
    };

    // Container Runtime (Docker)
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);

    let host = Host::detect(cfg.hostname.as_deref()).await;
    let bridge = Arc::new(Bridge::new(
        registry,
        Arc::clone(&runtime),
        cfg.bridge(),
        host,
        cfg.retry(),
    ));

    bridge
        .ping()
        .await
        .map_err(|e| {
            anyhow::anyhow!("Registry {} is not reachable: {}", cfg.registry, e)
        })?;
    info!("Using registry {}", cfg.registry);

    bridge
        .sync(false)
        .await
        .map_err(|e| anyhow::anyhow!("Initial sync failed: {}", e))?;

    // Event channel
    let (event_tx, mut event_rx) = mpsc::channel(128);
    let runtime_handle = tokio::spawn(async move {
        if let Err(e) = runtime.monitor(event_tx).await {
            error!("Container runtime failed: {}", e);
        }
    });

    // Events are applied in arrival order so a start never overtakes its die.
    let events_bridge = Arc::clone(&bridge);
    let events_handle = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                ContainerEvent::Start { id } => events_bridge.add(&id).await,
                ContainerEvent::Die { id } => events_bridge.remove_on_exit(&id).await,
                ContainerEvent::Resync => {
                    if let Err(e) = events_bridge.sync(true).await {
                        warn!("Error listing containers, skipping sync: {}", e);
                    }
                }
            }
        }
        info!("Event channel closed, shutting down");
    });

    let refresh_bridge = Arc::clone(&bridge);
    let refresh_handle = every(cfg.ttl_refresh, move || {
        let bridge = Arc::clone(&refresh_bridge);
        async move { bridge.refresh().await }
    });

    let resync_bridge = Arc::clone(&bridge);
    let resync_handle = every(cfg.resync, move || {
        let bridge = Arc::clone(&resync_bridge);
        async move {
            if let Err(e) = bridge.sync(true).await {
                warn!("Error listing containers, skipping sync: {}", e);
            }
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    runtime_handle.abort();
    events_handle.abort();
    for handle in [refresh_handle, resync_handle].into_iter().flatten() {
        handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}

/// Runs `tick` every `secs` seconds; `None` when `secs` is zero.
fn every<F, Fut>(secs: u64, mut tick: F) -> Option<JoinHandle<()>>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tick().await;
        }
    }))
}
