//! Message bus connection management
//!
//! The bus is the tunnel's only bearer. This module owns connection
//! configuration and setup; subjects and payloads live in [`crate::subjects`]
//! and [`crate::wire`].

use async_nats::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Error, Result};

/// Bus connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus server URLs
    pub servers: Vec<String>,
    /// Optional credentials file path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<String>,
    /// Optional username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            servers: vec!["localhost:4222".to_string()],
            credentials_file: None,
            username: None,
            password: None,
        }
    }
}

impl BusConfig {
    /// Parse servers from a comma-separated URL string
    pub fn from_url(url: impl AsRef<str>) -> Self {
        let servers = url
            .as_ref()
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();
        Self {
            servers,
            ..Default::default()
        }
    }

    /// Set credentials file
    pub fn with_credentials(mut self, file: impl Into<String>) -> Self {
        self.credentials_file = Some(file.into());
        self
    }

    /// Set username and password.
    ///
    /// Falls back to the `NATS_USERNAME` / `NATS_PASSWORD` environment
    /// variables when no credentials file is configured; see [`connect`].
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Connect to the bus.
///
/// The connection retries its initial dial and reconnects forever; proxied
/// traffic rides request/reply and tolerates short gaps.
pub async fn connect(config: &BusConfig, name: &str) -> Result<Client> {
    info!(servers = ?config.servers, name, "connecting to bus");

    let mut opts = async_nats::ConnectOptions::new().name(name);

    if let Some(ref creds_file) = config.credentials_file {
        opts = opts
            .credentials_file(creds_file)
            .await
            .map_err(|e| Error::connection(format!("failed to load credentials: {e}")))?;
    } else {
        let username = config
            .username
            .clone()
            .or_else(|| std::env::var("NATS_USERNAME").ok());
        let password = config
            .password
            .clone()
            .or_else(|| std::env::var("NATS_PASSWORD").ok());
        if let (Some(username), Some(password)) = (username, password) {
            opts = opts.user_and_password(username, password);
        }
    }

    opts = opts
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Connected => info!("connected to bus"),
                async_nats::Event::Disconnected => warn!("disconnected from bus"),
                async_nats::Event::ClientError(e) => warn!("bus client error: {e}"),
                _ => {}
            }
        })
        .retry_on_initial_connect()
        .max_reconnects(None);

    let servers: Vec<&str> = config.servers.iter().map(|s| s.as_str()).collect();
    let client = opts
        .connect(servers)
        .await
        .map_err(|e| Error::connection(format!("failed to connect to bus: {e}")))?;

    info!("bus connection established");
    Ok(client)
}
