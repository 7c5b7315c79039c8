//! Records that cross the bus between hub and edge
//!
//! The hub serializes a whole HTTP request into an [`Envelope`] and publishes
//! it on the link's handler subject. The edge streams the raw response bytes
//! back as plain bus messages; the final message of a stream carries the
//! [`DONE_HEADER`] whose value is empty on success and an error string on
//! failure.
//!
//! Field names and byte encodings are part of the wire contract - byte fields
//! travel base64-encoded and the timeout is integer nanoseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bus message header marking the terminal chunk of a response stream.
///
/// Present with an empty value: the response is fully delivered. Present with
/// a non-empty value: the stream failed and the value is the error text.
pub const DONE_HEADER: &str = "Done";

/// Payload of the edge's liveness probe request
pub const PING: &[u8] = b"PING";

/// Expected reply to a liveness probe
pub const PONG: &[u8] = b"PONG";

/// Wire record sent hub → edge on the handler subject
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// The HTTP request in proxy wire form (absolute URL in the request line)
    #[serde(rename = "Request", with = "base64_bytes")]
    pub request: Vec<u8>,

    /// TLS material the edge uses to dial the upstream, if any
    #[serde(rename = "TLS", default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<PersistableTlsConfig>,

    /// Per-call deadline for the edge's upstream client, in nanoseconds.
    /// Zero means "use the edge default".
    #[serde(rename = "Timeout")]
    pub timeout_ns: i64,

    /// Bypass automatic gzip compression on the upstream request
    #[serde(rename = "DisableCompression", default)]
    pub disable_compression: bool,
}

impl Envelope {
    /// The per-call deadline as a [`Duration`], `None` when unset
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_ns > 0 {
            Some(Duration::from_nanos(self.timeout_ns as u64))
        } else {
            None
        }
    }

    /// Set the per-call deadline
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout_ns = timeout.as_nanos().min(i64::MAX as u128) as i64;
    }
}

/// The persistable subset of a TLS configuration.
///
/// This is what can travel over the bus: raw PEM bytes and scalar options.
/// Dynamic parts of a client TLS setup (certificate callbacks, custom
/// dialers) by definition cannot be carried here; see
/// [`crate::transport::TransportConfig`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistableTlsConfig {
    /// Access the server without verifying its certificate. For testing only.
    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure: bool,

    /// Override for the server name used for SNI and certificate verification
    #[serde(rename = "serverName", default, skip_serializing_if = "String::is_empty")]
    pub server_name: String,

    /// PEM-encoded trusted root certificates
    #[serde(rename = "caData", default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub ca_data: Vec<u8>,

    /// PEM-encoded client certificate
    #[serde(rename = "certData", default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub cert_data: Vec<u8>,

    /// PEM-encoded client key
    #[serde(rename = "keyData", default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub key_data: Vec<u8>,

    /// Application level protocols, in order of preference. `["http/1.1"]`
    /// pins the upstream connection to HTTP/1.1.
    #[serde(rename = "nextProtos", default, skip_serializing_if = "Vec::is_empty")]
    pub next_protos: Vec<String>,
}

fn is_false(b: &bool) -> bool {
    !b
}

impl PersistableTlsConfig {
    /// Whether the configuration carries a certificate authority
    pub fn has_ca(&self) -> bool {
        !self.ca_data.is_empty()
    }

    /// Whether the configuration carries a client certificate and key
    pub fn has_cert_auth(&self) -> bool {
        !self.cert_data.is_empty() && !self.key_data.is_empty()
    }

    /// Whether any transport-level security is requested at all
    pub fn is_empty(&self) -> bool {
        !self.has_ca()
            && !self.has_cert_auth()
            && !self.insecure
            && self.server_name.is_empty()
            && self.next_protos.is_empty()
    }

    /// Reject contradictory combinations before they cross the bus.
    ///
    /// A root CA together with `insecure` is disallowed: the caller either
    /// verifies against the CA or skips verification, not both.
    pub fn validate(&self) -> crate::Result<()> {
        if self.has_ca() && self.insecure {
            return Err(crate::Error::tls(
                "specifying root certificates with the insecure flag is not allowed",
            ));
        }
        Ok(())
    }
}

mod base64_bytes {
    //! Byte fields travel as base64 strings, not JSON integer arrays.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
