//! Error types for the supervisor library
//!
//! Every failure is scoped to one service. Nothing here is fatal to the
//! supervisor itself; crashes of supervised processes are reported through
//! [`crate::status::StatusEvent`], not through these errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("executable for '{service}' not found at {}", path.display())]
    NotFound { service: String, path: PathBuf },

    #[error("failed to spawn '{service}': {source}")]
    Spawn {
        service: String,
        #[source]
        source: io::Error,
    },

    /// The forced kill after an expired grace period failed too.
    #[error("failed to kill '{service}' (pid {pid}): {source}")]
    Kill {
        service: String,
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to start monitor for '{service}': {source}")]
    Monitor {
        service: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start status bus dispatcher: {0}")]
    Bus(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("service name must not be empty")]
    EmptyName,

    #[error("service '{0}' is defined more than once")]
    DuplicateService(String),
}

impl SupervisorError {
    /// Name of the service the error is about, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::UnknownService(service)
            | Self::NotFound { service, .. }
            | Self::Spawn { service, .. }
            | Self::Kill { service, .. }
            | Self::Monitor { service, .. } => Some(service),
            Self::Config(ConfigError::DuplicateService(service)) => Some(service),
            Self::Config(_) | Self::Bus(_) => None,
        }
    }
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
