//! Error types for the bridge and its collaborators.

use thiserror::Error;

/// Failures reported by a registry backend.
///
/// The retry policy does not distinguish transient from permanent failures;
/// every variant is retried the same way.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry backend error: {0}")]
    Backend(String),

    #[error("registry does not support {0}")]
    Unsupported(&'static str),

    #[error("invalid registry uri: {0}")]
    InvalidUri(String),

    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the container runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("malformed container record: {0}")]
    Malformed(String),
}

/// Failures parsing or evaluating an IP/port filter.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FilterError {
    #[error("empty filter entry")]
    EmptyEntry,

    #[error("invalid ip or network {0:?}")]
    InvalidIp(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("invalid port range {0:?}")]
    InvalidRange(String),

    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),
}
