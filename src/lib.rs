//! Tether - bus-tunneled Kubernetes API access for NAT'd clusters
//!
//! Tether lets a centrally hosted control plane (the *hub*) issue HTTP
//! requests against the API server of a remote cluster without a direct TCP
//! path to it. The only bearer between the two sides is a message bus: the
//! cluster runs an *edge agent* subscribed to a per-link subject, and the hub
//! serializes whole HTTP requests onto that subject and reassembles the
//! streamed response.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  publish Envelope   ┌─────┐  queue subscribe  ┌──────────┐
//! │   Hub    │ ───────────────────▶│ Bus │ ─────────────────▶│   Edge   │
//! │ transport│                     │     │                   │ responder│
//! │          │ ◀─────────────────── chunks + Done ────────── │          │
//! └──────────┘                     └─────┘                   └────┬─────┘
//!       ▲                                                        │ HTTPS
//!       │ tower::Service                                         ▼
//!  kube::Client / HTTP callers                            local API server
//! ```
//!
//! A short-lived *link* bootstraps the pairing: the hub mints a linkID,
//! renders installation scripts for the remote operator, and accepts the
//! edge agent's callback only after proving liveness (PING/PONG over the
//! bus) and cluster identity (the `kube-system` namespace UID fetched
//! through the tunnel itself).
//!
//! # Modules
//!
//! - [`bus`] - message bus connection management
//! - [`subjects`] - per-link subject naming (same-account / cross-account)
//! - [`wire`] - envelope and TLS records crossing the bus
//! - [`http_wire`] - HTTP/1.1 proxy-form serialization and parsing
//! - [`transport`] - hub-side round-tripper over the bus
//! - [`edge`] - edge-side responder and liveness probe
//! - [`client`] - proxied HTTP / Kubernetes client constructors
//! - [`link`] - link issuance, verification, and state
//! - [`server`] - hub REST surface consumed by operator tooling
//! - [`error`] - error types

#![deny(missing_docs)]

use std::time::Duration;

pub mod bus;
pub mod client;
pub mod edge;
pub mod error;
pub mod http_wire;
pub mod link;
pub mod server;
pub mod subjects;
pub mod transport;
pub mod wire;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralized so the CLI defaults, transport, and test fixtures agree.

/// Lifetime of an enrollment link, from mint to expiry
pub const LINK_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// Default bus round-trip timeout for proxied calls (effectively "long";
/// watch streams and log follows stay open for hours)
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(10_000);

/// Fallback per-call timeout when neither the transport nor the request
/// carries a deadline
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack subtracted from the hub deadline before handing it to the edge, so
/// the edge's own client times out first and the terminal `Done` marker still
/// reaches the hub
pub const EDGE_TIMEOUT_SLACK: Duration = Duration::from_millis(500);

/// How long a callback waits for the edge agent to answer a liveness PING
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Dial timeout and TCP keep-alive for the edge's upstream connections
pub const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle connection cap per upstream host on the edge
pub const UPSTREAM_IDLE_CONNS_PER_HOST: usize = 25;

/// Write buffer size for streaming response bytes onto the bus. Kept well
/// under the bus's default 1 MiB message ceiling.
pub const EDGE_WRITE_BUFFER: usize = 8 * 1024;
