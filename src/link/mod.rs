//! Link issuance and verification
//!
//! A *link* is a short-lived bearer associating the hub with one remote
//! cluster. Its lifecycle is a three-state machine:
//!
//! ```text
//!              generate()                callback(linkID, clusterID)
//!   (none) ──────────────▶ PENDING ────────────────────────▶ BOUND
//!                             │
//!                             │ wall clock > notAfter
//!                             ▼
//!                          EXPIRED
//! ```
//!
//! `generate` mints a lexicographically sortable linkID, renders the
//! installation scripts the operator runs inside the target cluster, and
//! parks the caller's kubeconfig in the pending table. The edge agent those
//! scripts deploy calls back with the cluster identity it claims; `callback`
//! accepts the link only after the agent answers a liveness PING and the
//! clusterID matches the `kube-system` namespace UID observed through the
//! tunnel itself. A caller therefore cannot bind a linkID to a cluster they
//! do not actually operate.
//!
//! The pending table is process-local and authoritative only for the link
//! lifetime; a hub restart simply forces the operator to reissue. Bound links
//! are announced through [`LinkSink`] for deployments that persist them.

pub mod scripts;
pub mod store;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::subjects::SubjectNames;
use crate::wire::{PING, PONG};
use crate::{Error, Result, LINK_LIFETIME, PING_TIMEOUT};

pub use scripts::{ScriptConfig, ScriptRenderer};
pub use store::{BlobStore, FsBlobStore, MemBlobStore};

/// A user on whose behalf a link is issued
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Display name
    pub name: String,
    /// Email address; scopes the verification token
    pub email: String,
}

/// User identity plus the email-verification token rendered into scripts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserValues {
    /// The user
    #[serde(flatten)]
    pub user: User,
    /// One-time verification token
    pub token: String,
}

/// What `generate` hands back to the operator
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Link {
    /// The freshly minted linkID
    #[serde(rename = "linkID")]
    pub link_id: String,
    /// Installation scripts keyed by variant (`yaml`, `helm3`)
    pub scripts: BTreeMap<String, String>,
}

/// Request body for link generation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkRequest {
    /// Kubeconfig the hub will use when proxying through this link
    #[serde(rename = "kubeConfig")]
    pub kube_config: String,
}

/// Request body for the edge agent's callback
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallbackRequest {
    /// The link being claimed
    #[serde(rename = "linkID")]
    pub link_id: String,
    /// Cluster identity the edge asserts (kube-system namespace UID)
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Optional product name reported by the agent
    #[serde(rename = "productName", default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
}

/// Pending or bound state of one link
#[derive(Clone, Debug)]
pub struct LinkData {
    /// The linkID
    pub link_id: String,
    /// Email-verification token, when a user was attached
    pub token: Option<String>,
    /// Bound cluster identity; `None` while PENDING
    pub cluster_id: Option<String>,
    /// Expiry instant
    pub not_after: SystemTime,
    /// The user the link was issued for
    pub user: Option<User>,
    /// Kubeconfig stored at generation time
    pub kube_config: String,
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// Liveness and identity checks performed during callback.
///
/// Split out so the state machine is testable without a bus or a cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterVerifier: Send + Sync {
    /// Prove an edge agent is listening on the link's status subject
    async fn ping(&self, names: &SubjectNames) -> Result<()>;

    /// Fetch the cluster's identity through the tunnel using the stored
    /// kubeconfig
    async fn cluster_uid(&self, kube_config: &str, names: &SubjectNames) -> Result<String>;
}

/// Hook invoked when a link transitions to BOUND.
///
/// Production hubs persist bound links in a database; the core only keeps
/// them in memory for the link lifetime.
#[async_trait]
pub trait LinkSink: Send + Sync {
    /// Called once per successful bind
    async fn bound(&self, link: &LinkData) -> Result<()>;
}

/// Sink that drops bind notifications
pub struct NoopLinkSink;

#[async_trait]
impl LinkSink for NoopLinkSink {
    async fn bound(&self, _link: &LinkData) -> Result<()> {
        Ok(())
    }
}

/// Production verifier: PING over the bus, identity through a proxied
/// Kubernetes client.
pub struct BusVerifier {
    nc: async_nats::Client,
}

impl BusVerifier {
    /// Create a verifier that uses the given bus connection
    pub fn new(nc: async_nats::Client) -> Self {
        Self { nc }
    }
}

#[async_trait]
impl ClusterVerifier for BusVerifier {
    async fn ping(&self, names: &SubjectNames) -> Result<()> {
        let (status_subject, _) = names.proxy_status_subjects();
        let pong = tokio::time::timeout(
            PING_TIMEOUT,
            self.nc.request(status_subject, PING.into()),
        )
        .await
        .map_err(|_| Error::Liveness(names.link_id().to_string()))?
        .map_err(|_| Error::Liveness(names.link_id().to_string()))?;

        if pong.payload.as_ref() != PONG {
            return Err(Error::transport(format!(
                "expected PONG from link {}, received {:?}",
                names.link_id(),
                String::from_utf8_lossy(&pong.payload),
            )));
        }
        Ok(())
    }

    async fn cluster_uid(&self, kube_config: &str, names: &SubjectNames) -> Result<String> {
        let client = crate::client::proxied_kube_client(kube_config, &self.nc, names)?;
        crate::client::cluster_uid(&client).await
    }
}

// =============================================================================
// The service
// =============================================================================

/// Issues links, verifies callbacks, and answers status probes
pub struct LinkService {
    links: DashMap<String, Arc<Mutex<LinkData>>>,
    verifier: Arc<dyn ClusterVerifier>,
    blobs: Arc<dyn BlobStore>,
    renderer: ScriptRenderer,
    sink: Arc<dyn LinkSink>,
    lifetime: Duration,
    cross_account: bool,
}

impl LinkService {
    /// Create a service with the default link lifetime and cross-account
    /// subject topology
    pub fn new(
        verifier: Arc<dyn ClusterVerifier>,
        blobs: Arc<dyn BlobStore>,
        renderer: ScriptRenderer,
    ) -> Self {
        Self {
            links: DashMap::new(),
            verifier,
            blobs,
            renderer,
            sink: Arc::new(NoopLinkSink),
            lifetime: LINK_LIFETIME,
            cross_account: true,
        }
    }

    /// Override the link lifetime
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Announce bound links to the given sink
    pub fn with_sink(mut self, sink: Arc<dyn LinkSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use same-account subject topology
    pub fn with_same_account(mut self) -> Self {
        self.cross_account = false;
        self
    }

    /// Subject names for one of this service's links
    pub fn names(&self, link_id: &str) -> SubjectNames {
        if self.cross_account {
            SubjectNames::cross_account(link_id)
        } else {
            SubjectNames::same_account(link_id)
        }
    }

    /// Mint a link: render installation scripts, store the pending state, and
    /// write the email-verification token when a user is attached.
    pub async fn generate(&self, user: Option<User>, req: LinkRequest) -> Result<Link> {
        let link_id = Ulid::new().to_string();
        let now = SystemTime::now();

        let user_values = match &user {
            Some(user) => {
                let token = Uuid::new_v4().to_string();
                self.write_email_token(user, &token).await?;
                Some(UserValues {
                    user: user.clone(),
                    token,
                })
            }
            None => None,
        };

        let scripts = self
            .renderer
            .render(self.blobs.as_ref(), &link_id, user_values.as_ref())
            .await?;

        let data = LinkData {
            link_id: link_id.clone(),
            token: user_values.map(|u| u.token),
            cluster_id: None,
            not_after: now + self.lifetime,
            user,
            kube_config: req.kube_config,
        };
        self.links
            .insert(link_id.clone(), Arc::new(Mutex::new(data)));

        info!(%link_id, "link issued");
        Ok(Link { link_id, scripts })
    }

    /// Verify a callback and bind the link to the asserted cluster.
    ///
    /// Verification for one linkID is serialized; a repeated callback for an
    /// already-bound link succeeds idempotently for the same clusterID and is
    /// rejected for any other.
    pub async fn callback(&self, req: CallbackRequest) -> Result<()> {
        let entry = self
            .links
            .get(&req.link_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::LinkUnknown(req.link_id.clone()))?;
        let mut data = entry.lock().await;

        if let Some(existing) = &data.cluster_id {
            if *existing == req.cluster_id {
                debug!(link_id = %req.link_id, "repeated callback for bound link");
                return Ok(());
            }
            return Err(Error::IdentityMismatch {
                actual: existing.clone(),
                claimed: req.cluster_id,
                link_id: req.link_id,
            });
        }

        let now = SystemTime::now();
        if now > data.not_after {
            let since = now
                .duration_since(data.not_after)
                .unwrap_or_default()
                .as_secs();
            return Err(Error::LinkExpired {
                link_id: req.link_id,
                since_secs: since,
            });
        }

        let names = self.names(&req.link_id);
        self.verifier.ping(&names).await?;

        let actual = self
            .verifier
            .cluster_uid(&data.kube_config, &names)
            .await?;
        if actual != req.cluster_id {
            return Err(Error::IdentityMismatch {
                actual,
                claimed: req.cluster_id,
                link_id: req.link_id,
            });
        }

        data.cluster_id = Some(req.cluster_id.clone());
        self.delete_email_token(&data).await;
        self.sink.bound(&data).await?;

        info!(link_id = %req.link_id, cluster_id = %req.cluster_id, "link bound");
        Ok(())
    }

    /// Liveness probe for a bound cluster: PING its edge agent.
    pub async fn status(&self, cluster_id: &str) -> Result<()> {
        let link_id = self
            .find_bound_link(cluster_id)
            .await
            .ok_or_else(|| Error::ClusterUnknown(cluster_id.to_string()))?;
        self.verifier.ping(&self.names(&link_id)).await
    }

    /// Drop links whose notAfter has passed and that never bound.
    pub async fn purge_expired(&self) {
        let now = SystemTime::now();
        let mut expired = Vec::new();
        for entry in self.links.iter() {
            let data = entry.value().lock().await;
            if data.cluster_id.is_none() && now > data.not_after {
                expired.push(data.link_id.clone());
            }
        }
        for link_id in expired {
            self.links.remove(&link_id);
            debug!(%link_id, "expired pending link purged");
        }
    }

    /// Number of links currently held (pending and bound)
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether no links are held
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    async fn find_bound_link(&self, cluster_id: &str) -> Option<String> {
        for entry in self.links.iter() {
            let data = entry.value().lock().await;
            if data.cluster_id.as_deref() == Some(cluster_id) {
                return Some(data.link_id.clone());
            }
        }
        None
    }

    async fn write_email_token(&self, user: &User, token: &str) -> Result<()> {
        let domain = store::domain(&user.email);
        let timestamp = chrono::Utc::now().to_rfc3339();

        let verified = store::email_verified_path(domain, &user.email);
        if !self.blobs.exists(&verified).await.unwrap_or(true) {
            self.blobs.write(&verified, timestamp.as_bytes()).await?;
        }

        let token_path = store::email_token_path(domain, &user.email, token);
        self.blobs.write(&token_path, timestamp.as_bytes()).await
    }

    async fn delete_email_token(&self, data: &LinkData) {
        let (Some(user), Some(token)) = (&data.user, &data.token) else {
            return;
        };
        let path = store::email_token_path(store::domain(&user.email), &user.email, token);
        if let Err(e) = self.blobs.delete(&path).await {
            warn!(link_id = %data.link_id, error = %e, "failed to delete verification token");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::always;

    fn renderer() -> ScriptRenderer {
        ScriptRenderer::new(ScriptConfig::new(
            "ghcr.io/tether-dev/tether:test",
            "nats://localhost:4222",
            "https://hub.test",
            "https://blobs.test",
        ))
        .unwrap()
    }

    fn service(verifier: MockClusterVerifier) -> (LinkService, Arc<MemBlobStore>) {
        let blobs = Arc::new(MemBlobStore::new());
        let svc = LinkService::new(Arc::new(verifier), blobs.clone(), renderer());
        (svc, blobs)
    }

    fn link_request() -> LinkRequest {
        LinkRequest {
            kube_config: "apiVersion: v1\nkind: Config\n".to_string(),
        }
    }

    fn test_user() -> User {
        User {
            name: "Ops Person".into(),
            email: "ops@example.com".into(),
        }
    }

    // =========================================================================
    // Generation Stories
    // =========================================================================

    /// Story: generation mints a sortable ID, scripts, and a pending entry
    #[tokio::test]
    async fn story_generate_creates_pending_link_with_scripts() {
        let (svc, _) = service(MockClusterVerifier::new());

        let link = svc.generate(None, link_request()).await.unwrap();

        assert!(!link.link_id.is_empty());
        assert!(link.scripts.contains_key("yaml"));
        assert!(link.scripts.contains_key("helm3"));
        assert_eq!(svc.len(), 1);
    }

    /// Story: linkIDs sort by mint time, so operators can list them in order
    #[tokio::test]
    async fn story_link_ids_are_lexicographically_sortable() {
        let (svc, _) = service(MockClusterVerifier::new());

        let first = svc.generate(None, link_request()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = svc.generate(None, link_request()).await.unwrap();

        assert!(first.link_id < second.link_id);
    }

    /// Story: issuing for a user writes a domain-scoped verification token
    #[tokio::test]
    async fn story_user_link_writes_email_token() {
        let (svc, blobs) = service(MockClusterVerifier::new());

        svc.generate(Some(test_user()), link_request())
            .await
            .unwrap();

        // manifest + verified marker + token
        assert_eq!(blobs.len(), 3);
        assert!(blobs
            .exists("domains/example.com/emails/ops@example.com/verified")
            .await
            .unwrap());
    }

    // =========================================================================
    // Callback Stories
    // =========================================================================

    fn callback(link_id: &str, cluster_id: &str) -> CallbackRequest {
        CallbackRequest {
            link_id: link_id.to_string(),
            cluster_id: cluster_id.to_string(),
            product_name: None,
        }
    }

    /// Story: a callback for a linkID the hub never issued is rejected
    #[tokio::test]
    async fn story_unknown_link_is_rejected() {
        let (svc, _) = service(MockClusterVerifier::new());

        let err = svc.callback(callback("no-such-link", "uid-a")).await.unwrap_err();
        assert!(matches!(err, Error::LinkUnknown(_)));
    }

    /// Story: a callback after notAfter fails and the link stays dead
    #[tokio::test]
    async fn story_expired_link_is_rejected() {
        let blobs = Arc::new(MemBlobStore::new());
        let svc = LinkService::new(
            Arc::new(MockClusterVerifier::new()),
            blobs,
            renderer(),
        )
        .with_lifetime(Duration::ZERO);

        let link = svc.generate(None, link_request()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = svc
            .callback(callback(&link.link_id, "uid-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LinkExpired { .. }));
        assert!(err.to_string().contains("expired"));
    }

    /// Story: the edge must answer PING before any identity check runs
    #[tokio::test]
    async fn story_liveness_failure_keeps_link_pending() {
        let mut verifier = MockClusterVerifier::new();
        verifier
            .expect_ping()
            .times(1)
            .returning(|names| Err(Error::Liveness(names.link_id().to_string())));
        verifier.expect_cluster_uid().times(0);
        let (svc, _) = service(verifier);

        let link = svc.generate(None, link_request()).await.unwrap();
        let err = svc
            .callback(callback(&link.link_id, "uid-a"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Liveness(_)));
        // A later, healthy callback must still be possible: the link is
        // neither bound nor consumed.
        assert_eq!(svc.len(), 1);
    }

    /// Story: an asserted clusterID that the tunnel disproves is rejected
    #[tokio::test]
    async fn story_identity_mismatch_keeps_link_pending() {
        let mut verifier = MockClusterVerifier::new();
        verifier.expect_ping().times(1).returning(|_| Ok(()));
        verifier
            .expect_cluster_uid()
            .times(1)
            .returning(|_, _| Ok("uid-b".to_string()));
        let (svc, _) = service(verifier);

        let link = svc.generate(None, link_request()).await.unwrap();
        let err = svc
            .callback(callback(&link.link_id, "uid-a"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::IdentityMismatch { .. }));
        assert!(err
            .to_string()
            .contains("actual cluster id uid-b does not match cluster id uid-a"));
    }

    /// Story: a verified callback binds the link and deletes the token
    #[tokio::test]
    async fn story_verified_callback_binds_link() {
        let mut verifier = MockClusterVerifier::new();
        verifier.expect_ping().times(1).returning(|_| Ok(()));
        verifier
            .expect_cluster_uid()
            .times(1)
            .with(always(), always())
            .returning(|_, _| Ok("uid-a".to_string()));
        let (svc, blobs) = service(verifier);

        let link = svc
            .generate(Some(test_user()), link_request())
            .await
            .unwrap();
        svc.callback(callback(&link.link_id, "uid-a")).await.unwrap();

        // The verification token is gone; the verified marker stays.
        assert!(blobs
            .exists("domains/example.com/emails/ops@example.com/verified")
            .await
            .unwrap());
        assert_eq!(blobs.len(), 2); // manifest + verified marker

        // The bound cluster now answers status probes through the verifier.
        assert!(svc.find_bound_link("uid-a").await.is_some());
    }

    /// Story: a second callback never re-verifies a different cluster onto a
    /// bound link
    #[tokio::test]
    async fn story_bound_link_rejects_other_cluster_and_accepts_same() {
        let mut verifier = MockClusterVerifier::new();
        // Exactly one verification pass: repeats must not ping again.
        verifier.expect_ping().times(1).returning(|_| Ok(()));
        verifier
            .expect_cluster_uid()
            .times(1)
            .returning(|_, _| Ok("uid-a".to_string()));
        let (svc, _) = service(verifier);

        let link = svc.generate(None, link_request()).await.unwrap();
        svc.callback(callback(&link.link_id, "uid-a")).await.unwrap();

        // Idempotent repeat.
        svc.callback(callback(&link.link_id, "uid-a")).await.unwrap();

        // Different cluster on the same link: refused outright.
        let err = svc
            .callback(callback(&link.link_id, "uid-b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdentityMismatch { .. }));
    }

    // =========================================================================
    // Status and Maintenance Stories
    // =========================================================================

    /// Story: status probes resolve the bound link and ping its agent
    #[tokio::test]
    async fn story_status_pings_bound_cluster() {
        let mut verifier = MockClusterVerifier::new();
        verifier.expect_ping().times(2).returning(|_| Ok(()));
        verifier
            .expect_cluster_uid()
            .times(1)
            .returning(|_, _| Ok("uid-a".to_string()));
        let (svc, _) = service(verifier);

        let link = svc.generate(None, link_request()).await.unwrap();
        svc.callback(callback(&link.link_id, "uid-a")).await.unwrap();

        svc.status("uid-a").await.unwrap();

        let err = svc.status("uid-unknown").await.unwrap_err();
        assert!(matches!(err, Error::ClusterUnknown(_)));
    }

    /// Story: abandoned pending links are purged, bound links survive
    #[tokio::test]
    async fn story_purge_drops_only_expired_pending_links() {
        let mut verifier = MockClusterVerifier::new();
        verifier.expect_ping().returning(|_| Ok(()));
        verifier
            .expect_cluster_uid()
            .returning(|_, _| Ok("uid-a".to_string()));
        let (svc, _) = service(verifier);

        let bound = svc.generate(None, link_request()).await.unwrap();
        svc.callback(callback(&bound.link_id, "uid-a")).await.unwrap();
        let abandoned = svc.generate(None, link_request()).await.unwrap();

        // Push the pending link past its notAfter.
        svc.links
            .get(&abandoned.link_id)
            .unwrap()
            .lock()
            .await
            .not_after = SystemTime::now() - Duration::from_secs(1);

        svc.purge_expired().await;
        assert_eq!(svc.len(), 1);
        assert!(svc.find_bound_link("uid-a").await.is_some());
    }

    /// Story: topology selection flows into subject names
    #[tokio::test]
    async fn story_topology_controls_subject_names() {
        let (svc, _) = service(MockClusterVerifier::new());
        assert_eq!(
            svc.names("lk"),
            SubjectNames::cross_account("lk")
        );

        let blobs = Arc::new(MemBlobStore::new());
        let svc = LinkService::new(
            Arc::new(MockClusterVerifier::new()),
            blobs,
            renderer(),
        )
        .with_same_account();
        assert_eq!(svc.names("lk"), SubjectNames::same_account("lk"));
    }
}
