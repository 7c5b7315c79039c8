//! Error types for the tether tunnel and link service

use axum::http::StatusCode;
use thiserror::Error;

/// Main error type for tether operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Message bus connection error
    #[error("bus connection error: {0}")]
    Connection(String),

    /// Failed to publish to a bus subject
    #[error("publish error: {0}")]
    Publish(String),

    /// Failed to subscribe to a bus subject
    #[error("subscribe error: {0}")]
    Subscribe(String),

    /// Callback referenced a linkID that is not in the pending table
    #[error("unknown link id {0:?}")]
    LinkUnknown(String),

    /// Callback arrived after the link's notAfter instant
    #[error("link {link_id} expired {since_secs}s ago")]
    LinkExpired {
        /// The expired linkID
        link_id: String,
        /// Seconds elapsed since notAfter
        since_secs: u64,
    },

    /// Status query for a clusterID no link is bound to
    #[error("no bound link for cluster id {0:?}")]
    ClusterUnknown(String),

    /// Edge agent did not answer the liveness PING in time
    #[error("failed to ping cluster connector for link {0}")]
    Liveness(String),

    /// Cluster identity observed through the tunnel differs from the one the
    /// edge asserted
    #[error("actual cluster id {actual} does not match cluster id {claimed} provided by link {link_id}")]
    IdentityMismatch {
        /// UID observed through the proxied client
        actual: String,
        /// UID asserted by the edge in the callback
        claimed: String,
        /// The link being verified
        link_id: String,
    },

    /// Bus-level failure before any response bytes arrived
    #[error("transport error: {0}")]
    Transport(String),

    /// The response stream ended abnormally (non-empty `Done` marker or the
    /// bus closed the subject)
    #[error("stream error: {0}")]
    Stream(String),

    /// HTTP wire-format serialization or parsing error
    #[error("wire error: {0}")]
    Wire(String),

    /// TLS material could not be loaded or validated
    #[error("tls error: {0}")]
    Tls(String),

    /// JSON encoding/decoding error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Kubernetes client error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Installation script rendering error
    #[error("render error: {0}")]
    Render(String),

    /// Blob store read/write error
    #[error("blob store error: {0}")]
    BlobStore(String),
}

impl Error {
    /// Create a bus connection error with the given message
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a publish error with the given message
    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    /// Create a subscribe error with the given message
    pub fn subscribe(msg: impl Into<String>) -> Self {
        Self::Subscribe(msg.into())
    }

    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a stream error with the given message
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a wire-format error with the given message
    pub fn wire(msg: impl Into<String>) -> Self {
        Self::Wire(msg.into())
    }

    /// Create a TLS error with the given message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Get the HTTP status the REST surface reports for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::LinkUnknown(_) | Error::ClusterUnknown(_) => StatusCode::NOT_FOUND,
            Error::LinkExpired { .. } => StatusCode::GONE,
            Error::Liveness(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::IdentityMismatch { .. } => StatusCode::CONFLICT,
            Error::Transport(_) | Error::Publish(_) | Error::Subscribe(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::other(e.to_string())
    }
}
