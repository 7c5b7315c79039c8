//! Bus subject naming for proxied traffic
//!
//! Subject pattern: `k8s.proxy.{role}[.{linkID}][.{nonce}]`
//!
//! Hub → edge requests:
//! - `k8s.proxy.handler.{linkID}` (hub publishes)
//! - `k8s.proxy.handler` (edge subscribes, cross-account only)
//!
//! Edge → hub responses, scoped per call by a random nonce:
//! - `k8s.proxy.resp.{linkID}.{nonce}` / `k8s.proxy.resp.{nonce}`
//!
//! Liveness:
//! - `k8s.proxy.status.{linkID}` / `k8s.proxy.status`
//!
//! Two tenancy topologies exist. In *same-account* deployments hub and edge
//! share one bus account, so both sides use the fully qualified, linkID-scoped
//! subject. In *cross-account* deployments the edge lives in its own bus
//! account whose subject imports strip the qualifier: the hub still targets a
//! specific cluster by linkID, while the edge subscribes to the bare prefix
//! and replies on a nonce-only subject that the account mapping re-qualifies.

use uuid::Uuid;

const HANDLER_PREFIX: &str = "k8s.proxy.handler";
const RESPONSE_PREFIX: &str = "k8s.proxy.resp";
const STATUS_PREFIX: &str = "k8s.proxy.status";

/// Subject names for a single link, parameterized by bus tenancy topology.
///
/// Callers never branch on the topology; they ask for the subject pair for a
/// given direction and use whichever side of the pair is theirs.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubjectNames {
    /// Hub and edge share a bus account and a subject namespace
    SameAccount {
        /// The link this namespace belongs to
        link_id: String,
    },
    /// Edge runs in a separate bus account that only sees unqualified prefixes
    CrossAccount {
        /// The link this namespace belongs to
        link_id: String,
    },
}

impl SubjectNames {
    /// Subject names for a link in a shared bus account
    pub fn same_account(link_id: impl Into<String>) -> Self {
        Self::SameAccount {
            link_id: link_id.into(),
        }
    }

    /// Subject names for a link whose edge runs in its own bus account
    pub fn cross_account(link_id: impl Into<String>) -> Self {
        Self::CrossAccount {
            link_id: link_id.into(),
        }
    }

    /// The link this namespace belongs to
    pub fn link_id(&self) -> &str {
        match self {
            Self::SameAccount { link_id } | Self::CrossAccount { link_id } => link_id,
        }
    }

    /// Subjects for hub → edge request delivery: `(hub publish, edge subscribe)`
    pub fn proxy_handler_subjects(&self) -> (String, String) {
        self.request_subjects(HANDLER_PREFIX)
    }

    /// Subjects for the liveness probe: `(hub publish, edge subscribe)`
    pub fn proxy_status_subjects(&self) -> (String, String) {
        self.request_subjects(STATUS_PREFIX)
    }

    /// Subjects for edge → hub response delivery: `(hub subscribe, edge reply)`
    ///
    /// Each call mints a fresh random nonce so response streams of concurrent
    /// requests on the same link never interleave.
    pub fn proxy_response_subjects(&self) -> (String, String) {
        let nonce = Uuid::new_v4().simple().to_string();
        match self {
            Self::SameAccount { link_id } => {
                let sub = format!("{RESPONSE_PREFIX}.{link_id}.{nonce}");
                (sub.clone(), sub)
            }
            Self::CrossAccount { link_id } => (
                format!("{RESPONSE_PREFIX}.{link_id}.{nonce}"),
                format!("{RESPONSE_PREFIX}.{nonce}"),
            ),
        }
    }

    fn request_subjects(&self, prefix: &str) -> (String, String) {
        match self {
            Self::SameAccount { link_id } => {
                let sub = format!("{prefix}.{link_id}");
                (sub.clone(), sub)
            }
            Self::CrossAccount { link_id } => {
                (format!("{prefix}.{link_id}"), prefix.to_string())
            }
        }
    }
}
