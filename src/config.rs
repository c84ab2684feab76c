use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::filter::Filters;
use crate::retry::RetryPolicy;

/// When a `die` event should deregister a container's services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeregisterCheck {
    #[default]
    Always,
    OnSuccess,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Registry adapter URI, `scheme://rest`.
    pub registry: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    pub internal: bool,
    #[serde(deserialize_with = "comma_list")]
    pub tags: Vec<String>,
    pub ttl: u64,
    pub ttl_refresh: u64,
    pub resync: u64,
    pub deregister: DeregisterCheck,
    pub cleanup: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_from_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub retry_attempts: u32,
    pub retry_interval_ms: u64,
    pub retry_max_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: "dns://0.0.0.0:5353".into(),
            hostname: None,
            host_ip: None,
            internal: false,
            tags: Vec::new(),
            ttl: 0,
            ttl_refresh: 0,
            resync: 0,
            deregister: DeregisterCheck::Always,
            cleanup: false,
            ip_from_label: None,
            filter: None,
            retry_attempts: 5,
            retry_interval_ms: 500,
            retry_max_interval_ms: 10_000,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("portbridge.toml"))
                .merge(Json::file("portbridge.json"))
                .merge(Env::prefixed("PORTBRIDGE_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.ttl_refresh > 0 && self.ttl <= self.ttl_refresh {
            anyhow::bail!("ttl must be greater than ttl_refresh");
        }
        if self.retry_attempts == 0 {
            anyhow::bail!("retry_attempts must be at least 1");
        }
        if self.registry.split_once("://").is_none() {
            anyhow::bail!("registry must be a URI of the form scheme://address");
        }
        self.filters()?;
        Ok(())
    }

    /// The configured admission filter, if any.
    pub fn filters(&self) -> anyhow::Result<Option<Filters>> {
        self.filter
            .as_deref()
            .map(|list| {
                list.parse::<Filters>()
                    .map_err(|e| anyhow::anyhow!("Invalid filter {:?}: {}", list, e))
            })
            .transpose()
    }

    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            host_ip: self.host_ip.clone().filter(|ip| !ip.is_empty()),
            internal: self.internal,
            force_tags: self.tags.clone(),
            ttl: self.ttl,
            refresh_interval: self.ttl_refresh,
            deregister: self.deregister,
            cleanup: self.cleanup,
            ip_from_label: self.ip_from_label.clone().filter(|l| !l.is_empty()),
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_interval_ms),
            Duration::from_millis(self.retry_max_interval_ms),
        )
    }
}

/// The slice of configuration the bridge and service builder act on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeConfig {
    pub host_ip: Option<String>,
    pub internal: bool,
    pub force_tags: Vec<String>,
    /// Seconds; copied onto every service.
    pub ttl: u64,
    /// Seconds between refreshes; also the countdown step for parked services.
    pub refresh_interval: u64,
    pub deregister: DeregisterCheck,
    pub cleanup: bool,
    pub ip_from_label: Option<String>,
}

/// Accepts either a list or a comma-separated string, as env vars provide.
fn comma_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Tags {
        List(Vec<String>),
        Csv(String),
    }

    Ok(match Tags::deserialize(deserializer)? {
        Tags::List(list) => list,
        Tags::Csv(csv) => csv
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
    })
}
