use super::ContainerRuntime;
use crate::error::RuntimeError;
use crate::types::{Container, ContainerEvent, PortBinding, PortKey};
use anyhow::Result;
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, PortMap};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using default settings.
    /// This handles the unix socket on Linux and honours `DOCKER_HOST`.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, id: &str) -> Result<Container, RuntimeError> {
        match self.docker.inspect_container(id, None).await {
            Ok(detail) => container_from_inspect(detail),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(RuntimeError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_running(&self) -> Result<Vec<String>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn monitor(&self, event_tx: mpsc::Sender<ContainerEvent>) -> Result<()> {
        loop {
            if let Err(e) = self.docker.ping().await {
                error!("Failed to reach Docker: {}. Retrying in 5s...", e);
                sleep(Duration::from_secs(5)).await;
                continue;
            }

            // Anything may have changed while we were not listening.
            event_tx
                .send(ContainerEvent::Resync)
                .await
                .map_err(|_| anyhow::anyhow!("Channel closed"))?;

            let opts = EventsOptions::<String> {
                filters: [
                    ("type", ["container"].as_slice()),
                    ("event", ["start", "die"].as_slice()),
                ]
                .iter()
                .map(|(k, v)| {
                    (k.to_string(), v.iter().map(|s| s.to_string()).collect())
                })
                .collect(),
                ..Default::default()
            };

            let mut stream = self.docker.events(Some(opts));

            info!("Listening for Docker events...");
            while let Some(msg) = stream.next().await {
                let event = match msg {
                    Ok(event) => event,
                    Err(e) => {
                        error!("Error in Docker event stream: {}", e);
                        break; // Break inner loop to reconnect
                    }
                };

                let id = event.actor.and_then(|a| a.id).unwrap_or_default();
                if id.is_empty() {
                    continue;
                }

                let action = event.action.unwrap_or_default();
                debug!("Container event: {} for {}", action, id);

                let update = match action.as_str() {
                    "start" => ContainerEvent::Start { id },
                    "die" => ContainerEvent::Die { id },
                    _ => continue,
                };
                if event_tx.send(update).await.is_err() {
                    return Err(anyhow::anyhow!("Channel closed"));
                }
            }

            warn!("Docker event stream ended. Reconnecting in 2s...");
            sleep(Duration::from_secs(2)).await;
        }
    }
}

fn container_from_inspect(detail: ContainerInspectResponse) -> Result<Container, RuntimeError> {
    let id = detail
        .id
        .ok_or_else(|| RuntimeError::Malformed("container without id".into()))?;
    let config = detail.config.unwrap_or_default();
    let host_config = detail.host_config.unwrap_or_default();
    let settings = detail.network_settings.unwrap_or_default();
    let state = detail.state.unwrap_or_default();

    let exposed_ports = config
        .exposed_ports
        .map(|ports| {
            ports.keys().filter_map(|k| parse_port_key(k)).collect()
        })
        .unwrap_or_default();

    let networks = settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| {
            (name, endpoint.ip_address.unwrap_or_default())
        })
        .collect();

    Ok(Container {
        id,
        name: detail.name.unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        hostname: config.hostname.unwrap_or_default(),
        network_mode: host_config.network_mode.unwrap_or_default(),
        ip_address: settings.ip_address.unwrap_or_default(),
        networks,
        exposed_ports,
        port_bindings: port_bindings(settings.ports.unwrap_or_default()),
        running: state.running.unwrap_or(false),
        exit_code: state.exit_code.unwrap_or(0),
    })
}

fn parse_port_key(key: &str) -> Option<PortKey> {
    match key.parse() {
        Ok(key) => Some(key),
        Err(e) => {
            debug!("Skipping port {}: {}", key, e);
            None
        }
    }
}

fn port_bindings(ports: PortMap) -> BTreeMap<PortKey, Vec<PortBinding>> {
    ports
        .into_iter()
        .filter_map(|(key, bindings)| {
            let key = parse_port_key(&key)?;
            let bindings = bindings
                .unwrap_or_default()
                .into_iter()
                .map(|b| PortBinding {
                    host_ip: b.host_ip.unwrap_or_default(),
                    host_port: b.host_port.and_then(|p| p.parse().ok()),
                })
                .collect();
            Some((key, bindings))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use bollard::models::{
        ContainerConfig, ContainerState, EndpointSettings, HostConfig, NetworkSettings,
    };
    use std::collections::HashMap;

    fn inspect_response() -> ContainerInspectResponse {
        let mut exposed = HashMap::new();
        exposed.insert("80/tcp".to_string(), HashMap::new());
        exposed.insert("53/udp".to_string(), HashMap::new());
        exposed.insert("132/sctp".to_string(), HashMap::new());

        let mut ports: PortMap = HashMap::new();
        ports.insert(
            "80/tcp".to_string(),
            Some(vec![bollard::models::PortBinding {
                host_ip: Some("0.0.0.0".into()),
                host_port: Some("8080".into()),
            }]),
        );
        ports.insert("53/udp".to_string(), None);

        let mut networks = HashMap::new();
        networks.insert(
            "bridge".to_string(),
            EndpointSettings {
                ip_address: Some("172.17.0.2".into()),
                ..Default::default()
            },
        );

        ContainerInspectResponse {
            id: Some("0123456789abcdef".into()),
            name: Some("/web".into()),
            config: Some(ContainerConfig {
                image: Some("nginx:latest".into()),
                env: Some(vec!["SERVICE_NAME=web".into()]),
                hostname: Some("0123456789ab".into()),
                exposed_ports: Some(exposed),
                ..Default::default()
            }),
            host_config: Some(HostConfig {
                network_mode: Some("bridge".into()),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                ip_address: Some("172.17.0.2".into()),
                ports: Some(ports),
                networks: Some(networks),
                ..Default::default()
            }),
            state: Some(ContainerState {
                running: Some(true),
                exit_code: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_container_from_inspect() {
        let c = container_from_inspect(inspect_response()).unwrap();
        assert_eq!(c.id, "0123456789abcdef");
        assert_eq!(c.display_name(), "web");
        assert_eq!(c.image, "nginx:latest");
        assert_eq!(c.env, vec!["SERVICE_NAME=web"]);
        assert_eq!(c.network_mode, "bridge");
        assert_eq!(c.ip_address, "172.17.0.2");
        assert_eq!(
            c.networks.get("bridge").map(String::as_str),
            Some("172.17.0.2")
        );
        assert!(c.running);

        let mut exposed = c.exposed_ports.clone();
        exposed.sort();
        assert_eq!(
            exposed,
            vec![PortKey::new(53, Protocol::Udp), PortKey::new(80, Protocol::Tcp)]
        );

        let web = &c.port_bindings[&PortKey::new(80, Protocol::Tcp)];
        assert_eq!(web[0].host_port, Some(8080));
        assert!(c.port_bindings[&PortKey::new(53, Protocol::Udp)].is_empty());
    }

    #[test]
    fn test_inspect_without_id_is_malformed() {
        let mut detail = inspect_response();
        detail.id = None;
        assert!(matches!(
            container_from_inspect(detail),
            Err(RuntimeError::Malformed(_))
        ));
    }
}
