//! Structural caching of hub transports
//!
//! Building a transport is cheap, but sharing one per TLS configuration keeps
//! the number of live response subscriptions and upstream connection pools
//! bounded when many callers proxy to the same cluster. Transports are cached
//! under a structural key of their comparable fields; configurations carrying
//! a dynamic identity provider cannot be compared and bypass the cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_nats::Client;

use crate::subjects::SubjectNames;
use crate::wire::PersistableTlsConfig;
use crate::{Error, Result};

use super::BusTransport;

/// Dynamic client-certificate source.
///
/// The persistable TLS record can only carry static bytes; callers that
/// rotate client certificates at runtime plug in an identity provider
/// instead. Such configurations are never cached - two providers cannot be
/// compared for equality.
pub trait IdentityProvider: Send + Sync {
    /// Return the current `(certificate PEM, key PEM)` pair
    fn identity(&self) -> Result<(Vec<u8>, Vec<u8>)>;
}

/// Where the client certificate and key come from
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TlsSource {
    /// No client certificate
    #[default]
    None,
    /// Static PEM bytes
    Data {
        /// PEM-encoded client certificate
        cert: Vec<u8>,
        /// PEM-encoded client key
        key: Vec<u8>,
    },
    /// Re-read from files on transport construction, so rotated files are
    /// picked up by new transports. The cache key uses the paths.
    Files {
        /// Path to the PEM-encoded client certificate
        cert_file: String,
        /// Path to the PEM-encoded client key
        key_file: String,
    },
}

/// Full configuration for a hub transport bound to one link
#[derive(Clone, Default)]
pub struct TransportConfig {
    /// Skip upstream certificate verification. For testing only.
    pub insecure: bool,
    /// Server name override for SNI and certificate verification
    pub server_name: String,
    /// PEM-encoded trusted roots for the upstream
    pub ca_data: Vec<u8>,
    /// Client certificate source
    pub cert_source: TlsSource,
    /// Application level protocols, in order of preference
    pub next_protos: Vec<String>,
    /// Bypass automatic gzip compression on upstream requests
    pub disable_compression: bool,
    /// Dynamic client-certificate source; disables caching when present
    pub identity_provider: Option<Arc<dyn IdentityProvider>>,
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("insecure", &self.insecure)
            .field("server_name", &self.server_name)
            .field("ca_data", &format!("{} bytes", self.ca_data.len()))
            .field("next_protos", &self.next_protos)
            .field("disable_compression", &self.disable_compression)
            .field("dynamic_identity", &self.identity_provider.is_some())
            .finish()
    }
}

impl TransportConfig {
    /// Resolve the configuration into the persistable TLS record carried in
    /// envelopes, reading file-based material if needed.
    ///
    /// Returns `None` when no transport-level security is requested at all.
    pub fn persistable(&self) -> Result<Option<PersistableTlsConfig>> {
        let (cert_data, key_data) = match (&self.cert_source, &self.identity_provider) {
            (_, Some(provider)) => provider.identity()?,
            (TlsSource::None, None) => (Vec::new(), Vec::new()),
            (TlsSource::Data { cert, key }, None) => (cert.clone(), key.clone()),
            (TlsSource::Files { cert_file, key_file }, None) => {
                let cert = std::fs::read(cert_file)
                    .map_err(|e| Error::tls(format!("reading {cert_file}: {e}")))?;
                let key = std::fs::read(key_file)
                    .map_err(|e| Error::tls(format!("reading {key_file}: {e}")))?;
                (cert, key)
            }
        };

        let tls = PersistableTlsConfig {
            insecure: self.insecure,
            server_name: self.server_name.clone(),
            ca_data: self.ca_data.clone(),
            cert_data,
            key_data,
            next_protos: self.next_protos.clone(),
        };
        tls.validate()?;

        if tls.is_empty() {
            Ok(None)
        } else {
            Ok(Some(tls))
        }
    }

    /// The structural cache key, or `None` when this configuration is not
    /// cacheable
    fn cache_key(&self, names: &SubjectNames) -> Option<TlsCacheKey> {
        if self.identity_provider.is_some() {
            return None;
        }
        let (cert_data, key_data, cert_file, key_file) = match &self.cert_source {
            TlsSource::None => Default::default(),
            TlsSource::Data { cert, key } => (cert.clone(), key.clone(), String::new(), String::new()),
            TlsSource::Files { cert_file, key_file } => {
                (Vec::new(), Vec::new(), cert_file.clone(), key_file.clone())
            }
        };
        Some(TlsCacheKey {
            names: names.clone(),
            insecure: self.insecure,
            ca_data: self.ca_data.clone(),
            cert_data,
            key_data,
            cert_file,
            key_file,
            server_name: self.server_name.clone(),
            next_protos: self.next_protos.join(","),
            disable_compression: self.disable_compression,
        })
    }
}

/// Structural identity of a cached transport.
///
/// Includes the link's subject names: an empty TLS configuration for cluster
/// A must never alias the transport already bound to cluster B.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TlsCacheKey {
    names: SubjectNames,
    insecure: bool,
    ca_data: Vec<u8>,
    cert_data: Vec<u8>,
    key_data: Vec<u8>,
    cert_file: String,
    key_file: String,
    server_name: String,
    next_protos: String,
    disable_compression: bool,
}

impl fmt::Display for TlsCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key_text = if self.key_data.is_empty() && self.key_file.is_empty() {
            "<none>"
        } else {
            "<redacted>"
        };
        write!(
            f,
            "link:{}, insecure:{}, ca:{}B, cert:{}B, key:{}, serverName:{}, disableCompression:{}",
            self.names.link_id(),
            self.insecure,
            self.ca_data.len(),
            self.cert_data.len(),
            key_text,
            self.server_name,
            self.disable_compression,
        )
    }
}

fn cache() -> &'static Mutex<HashMap<TlsCacheKey, BusTransport>> {
    static CACHE: OnceLock<Mutex<HashMap<TlsCacheKey, BusTransport>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Return a transport for the given configuration, shared with every other
/// caller whose configuration has the same structural key.
///
/// Configurations with a dynamic identity provider get a fresh transport on
/// every call.
pub fn transport_for(
    nc: &Client,
    names: &SubjectNames,
    timeout: Duration,
    config: &TransportConfig,
) -> Result<BusTransport> {
    let key = config.cache_key(names);

    if let Some(ref key) = key {
        if let Some(rt) = cache().lock().expect("transport cache poisoned").get(key) {
            return Ok(rt.clone());
        }
    }

    let tls = config.persistable()?;
    let rt = BusTransport::new(
        nc.clone(),
        names.clone(),
        timeout,
        tls,
        config.disable_compression,
    );

    if let Some(key) = key {
        // Entries are immutable after insertion; a racing builder may insert
        // first, in which case its instance wins.
        let mut cache = cache().lock().expect("transport cache poisoned");
        return Ok(cache.entry(key).or_insert(rt).clone());
    }

    Ok(rt)
}
