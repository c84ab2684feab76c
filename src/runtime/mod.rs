use crate::error::RuntimeError;
use crate::types::{Container, ContainerEvent};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fetches a fresh record for the container.
    async fn inspect(&self, id: &str) -> Result<Container, RuntimeError>;

    /// Ids of all running containers.
    async fn list_running(&self) -> Result<Vec<String>, RuntimeError>;

    /// Start monitoring the runtime for container lifecycle events.
    /// Events should be sent to the provided channel.
    async fn monitor(&self, event_tx: mpsc::Sender<ContainerEvent>) -> Result<()>;
}
