//! Server configuration
//!
//! Defaults reproduce the built-in credential table and an unbounded
//! outbound queue. A JSON file named by `CHAT_RELAY_CONFIG` overrides them.

use std::env;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::credentials::CredentialStore;
use crate::error::AppError;

/// Environment variable holding the config file path
pub const CONFIG_ENV: &str = "CHAT_RELAY_CONFIG";

/// Server settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Accepted username -> password pairs
    pub credentials: CredentialStore,
    /// Per-connection outbound backlog cap; exceeding it drops the connection
    pub max_outbound_bytes: Option<usize>,
}

impl ServerConfig {
    /// Parse a JSON document
    pub fn from_json(text: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let text = fs::read_to_string(path)?;
        let config = Self::from_json(&text)?;
        info!(
            "Loaded config from {} ({} users)",
            path.display(),
            config.credentials.len()
        );
        if config.credentials.is_empty() {
            warn!(
                "Config at {} has no users; every handshake will be rejected",
                path.display()
            );
        }
        Ok(config)
    }

    /// Load from `CHAT_RELAY_CONFIG` if set, else use defaults
    pub fn from_env() -> Result<Self, AppError> {
        match env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }
}

/// Resolve `host:port` to the first matching socket address
pub fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, AppError> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| AppError::AddressResolution(format!("{host}:{port}")))
}
