//! Proxied client constructors
//!
//! Downstream hub code never talks to the bus directly: it asks for an HTTP
//! or Kubernetes client whose transport is a [`BusTransport`] bound to a
//! link. This module maps a caller's kubeconfig onto a transport
//! configuration (TLS material, server URL, bearer token) and wires the
//! result into `kube::Client`.

use std::str::FromStr;
use std::task::{Context, Poll};

use async_nats::Client;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use http::header::{HeaderValue, AUTHORIZATION};
use http::{Request, Response, Uri};
use k8s_openapi::api::core::v1::Namespace;
use kube::config::{AuthInfo, Cluster, Kubeconfig};
use kube::Api;
use secrecy::ExposeSecret;
use tower::Service;

use crate::subjects::SubjectNames;
use crate::transport::{transport_for, BusTransport, ProxyBody, TlsSource, TransportConfig};
use crate::{Error, Result, DEFAULT_PROXY_TIMEOUT};

/// A transport with no upstream TLS material, for plain HTTP upstreams inside
/// the remote cluster.
///
/// Shared through the transport cache like every other configuration.
pub fn proxied_http_transport(nc: &Client, names: &SubjectNames) -> Result<BusTransport> {
    transport_for(
        nc,
        names,
        DEFAULT_PROXY_TIMEOUT,
        &TransportConfig::default(),
    )
}

/// Build a Kubernetes client whose every request rides the bus to the link's
/// edge agent.
///
/// The kubeconfig supplies the API server URL, the TLS material the *edge*
/// will dial with, and the bearer token the hub injects into each request.
pub fn proxied_kube_client(
    kubeconfig_yaml: &str,
    nc: &Client,
    names: &SubjectNames,
) -> Result<kube::Client> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml)
        .map_err(|e| Error::tls(format!("parsing kubeconfig: {e}")))?;
    let target = KubeTarget::from_kubeconfig(&kubeconfig)?;

    let transport = transport_for(nc, names, DEFAULT_PROXY_TIMEOUT, &target.transport)?;
    let auth_header = target.auth_header()?;
    let service = ProxiedService {
        transport,
        base: target.server,
        auth_header,
    };

    Ok(kube::Client::new(service, "default"))
}

/// The remote cluster's stable identity: the UID of its `kube-system`
/// namespace.
pub async fn cluster_uid(client: &kube::Client) -> Result<String> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns = namespaces.get("kube-system").await?;
    ns.metadata
        .uid
        .ok_or_else(|| Error::transport("kube-system namespace has no UID"))
}

// =============================================================================
// Kubeconfig mapping
// =============================================================================

/// Everything a proxied client needs from a kubeconfig
pub struct KubeTarget {
    /// The API server URL requests are absolutized against
    pub server: Uri,
    /// Transport configuration carrying the edge's TLS material
    pub transport: TransportConfig,
    /// Bearer token the hub injects, when the kubeconfig has one
    pub token: Option<String>,
}

impl KubeTarget {
    /// Extract the current (or only) context's cluster and user material.
    pub fn from_kubeconfig(kubeconfig: &Kubeconfig) -> Result<Self> {
        let context_name = kubeconfig
            .current_context
            .clone()
            .or_else(|| kubeconfig.contexts.first().map(|c| c.name.clone()))
            .ok_or_else(|| Error::tls("kubeconfig has no contexts"))?;
        let context = kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .and_then(|c| c.context.clone())
            .ok_or_else(|| Error::tls(format!("kubeconfig context {context_name:?} not found")))?;

        let cluster = kubeconfig
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .and_then(|c| c.cluster.clone())
            .ok_or_else(|| {
                Error::tls(format!("kubeconfig cluster {:?} not found", context.cluster))
            })?;
        let auth_info = context.user.as_deref().and_then(|user| {
            kubeconfig
                .auth_infos
                .iter()
                .find(|a| a.name == user)
                .and_then(|a| a.auth_info.clone())
        });

        let server = cluster
            .server
            .as_deref()
            .ok_or_else(|| Error::tls("kubeconfig cluster has no server URL"))?;
        let server = Uri::from_str(server)
            .map_err(|e| Error::tls(format!("bad server URL {server:?}: {e}")))?;

        let transport = transport_config(&cluster, auth_info.as_ref())?;
        let token = bearer_token(auth_info.as_ref())?;

        Ok(Self {
            server,
            transport,
            token,
        })
    }

    fn auth_header(&self) -> Result<Option<HeaderValue>> {
        match &self.token {
            Some(token) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| Error::tls(format!("bad bearer token: {e}")))?;
                value.set_sensitive(true);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

fn transport_config(cluster: &Cluster, auth_info: Option<&AuthInfo>) -> Result<TransportConfig> {
    let ca_data = match (&cluster.certificate_authority_data, &cluster.certificate_authority) {
        (Some(data), _) => STANDARD
            .decode(data)
            .map_err(|e| Error::tls(format!("bad certificate-authority-data: {e}")))?,
        (None, Some(file)) => {
            std::fs::read(file).map_err(|e| Error::tls(format!("reading {file}: {e}")))?
        }
        (None, None) => Vec::new(),
    };

    let cert_source = match auth_info {
        Some(auth) => match (&auth.client_certificate_data, &auth.client_key_data) {
            (Some(cert), Some(key)) => TlsSource::Data {
                cert: STANDARD
                    .decode(cert)
                    .map_err(|e| Error::tls(format!("bad client-certificate-data: {e}")))?,
                key: STANDARD
                    .decode(key.expose_secret())
                    .map_err(|e| Error::tls(format!("bad client-key-data: {e}")))?,
            },
            _ => match (&auth.client_certificate, &auth.client_key) {
                (Some(cert_file), Some(key_file)) => TlsSource::Files {
                    cert_file: cert_file.clone(),
                    key_file: key_file.clone(),
                },
                _ => TlsSource::None,
            },
        },
        None => TlsSource::None,
    };

    Ok(TransportConfig {
        insecure: cluster.insecure_skip_tls_verify.unwrap_or(false),
        server_name: cluster.tls_server_name.clone().unwrap_or_default(),
        ca_data,
        cert_source,
        ..Default::default()
    })
}

fn bearer_token(auth_info: Option<&AuthInfo>) -> Result<Option<String>> {
    let Some(auth) = auth_info else {
        return Ok(None);
    };
    if let Some(token) = &auth.token {
        return Ok(Some(token.expose_secret().to_string()));
    }
    if let Some(file) = &auth.token_file {
        let token = std::fs::read_to_string(file)
            .map_err(|e| Error::tls(format!("reading token file {file}: {e}")))?;
        return Ok(Some(token.trim().to_string()));
    }
    Ok(None)
}

// =============================================================================
// Request adaptation
// =============================================================================

/// Tower service that absolutizes request URIs against the cluster's server
/// URL and injects the bearer token, then delegates to the bus transport.
///
/// `kube::Client` issues origin-form requests (`/api/v1/...`); the tunnel
/// serializes proxy-form, which needs the full URL.
#[derive(Clone)]
pub struct ProxiedService {
    transport: BusTransport,
    base: Uri,
    auth_header: Option<HeaderValue>,
}

impl ProxiedService {
    /// Wrap a transport with a server URL and optional bearer token
    pub fn new(transport: BusTransport, base: Uri, auth_header: Option<HeaderValue>) -> Self {
        Self {
            transport,
            base,
            auth_header,
        }
    }
}

impl Service<Request<kube::client::Body>> for ProxiedService {
    type Response = Response<ProxyBody>;
    type Error = tower::BoxError;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.transport.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<kube::client::Body>) -> Self::Future {
        match absolutize(&self.base, req.uri()) {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => return Box::pin(async move { Err(e.into()) }),
        }
        if let Some(auth) = &self.auth_header {
            if !req.headers().contains_key(AUTHORIZATION) {
                req.headers_mut().insert(AUTHORIZATION, auth.clone());
            }
        }
        self.transport.call(req)
    }
}

/// Graft an origin-form request path onto the server's scheme and authority.
fn absolutize(base: &Uri, uri: &Uri) -> Result<Uri> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }
    let scheme = base
        .scheme_str()
        .ok_or_else(|| Error::wire(format!("server URL {base} has no scheme")))?;
    let authority = base
        .authority()
        .ok_or_else(|| Error::wire(format!("server URL {base} has no authority")))?;

    // Server URLs may carry a path prefix (e.g. behind a gateway).
    let base_path = base.path().trim_end_matches('/');
    let request_path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(format!("{base_path}{request_path}"))
        .build()
        .map_err(|e| Error::wire(format!("absolutizing {uri}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: remote
clusters:
- name: remote
  cluster:
    server: https://10.96.0.1:6443
    certificate-authority-data: LS0tLUNBLS0tLQ==
    tls-server-name: kubernetes.default
contexts:
- name: remote
  context:
    cluster: remote
    user: remote-admin
users:
- name: remote-admin
  user:
    client-certificate-data: LS0tLUNFUlQtLS0t
    client-key-data: LS0tLUtFWS0tLS0=
"#;

    const TOKEN_KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: only
  cluster:
    server: https://api.internal:6443/prefix/
contexts:
- name: only
  context:
    cluster: only
    user: bot
users:
- name: bot
  user:
    token: sekret-token
"#;

    #[test]
    fn kubeconfig_cert_auth_maps_to_transport_config() {
        let kubeconfig = Kubeconfig::from_yaml(KUBECONFIG).unwrap();
        let target = KubeTarget::from_kubeconfig(&kubeconfig).unwrap();

        assert_eq!(target.server.to_string(), "https://10.96.0.1:6443/");
        assert_eq!(target.transport.server_name, "kubernetes.default");
        assert_eq!(target.transport.ca_data, b"----CA----");
        assert!(matches!(
            &target.transport.cert_source,
            TlsSource::Data { cert, key }
                if cert == b"----CERT----" && key == b"----KEY----"
        ));
        assert!(target.token.is_none());
        assert!(!target.transport.insecure);
    }

    #[test]
    fn kubeconfig_token_auth_is_extracted() {
        let kubeconfig = Kubeconfig::from_yaml(TOKEN_KUBECONFIG).unwrap();
        let target = KubeTarget::from_kubeconfig(&kubeconfig).unwrap();

        assert_eq!(target.token.as_deref(), Some("sekret-token"));
        assert!(matches!(target.transport.cert_source, TlsSource::None));

        let header = target.auth_header().unwrap().unwrap();
        assert_eq!(header.to_str().unwrap(), "Bearer sekret-token");
        assert!(header.is_sensitive());
    }

    #[test]
    fn kubeconfig_without_current_context_uses_first() {
        let kubeconfig = Kubeconfig::from_yaml(TOKEN_KUBECONFIG).unwrap();
        assert!(kubeconfig.current_context.is_none());
        assert!(KubeTarget::from_kubeconfig(&kubeconfig).is_ok());
    }

    #[test]
    fn empty_kubeconfig_is_rejected() {
        let kubeconfig = Kubeconfig::from_yaml("apiVersion: v1\nkind: Config\n").unwrap();
        assert!(KubeTarget::from_kubeconfig(&kubeconfig).is_err());
    }

    #[test]
    fn absolutize_grafts_origin_form_paths() {
        let base: Uri = "https://10.96.0.1:6443".parse().unwrap();
        let uri: Uri = "/api/v1/namespaces/kube-system?limit=1".parse().unwrap();
        assert_eq!(
            absolutize(&base, &uri).unwrap().to_string(),
            "https://10.96.0.1:6443/api/v1/namespaces/kube-system?limit=1"
        );
    }

    #[test]
    fn absolutize_preserves_server_path_prefix() {
        let base: Uri = "https://api.internal:6443/prefix/".parse().unwrap();
        let uri: Uri = "/api/v1/nodes".parse().unwrap();
        assert_eq!(
            absolutize(&base, &uri).unwrap().to_string(),
            "https://api.internal:6443/prefix/api/v1/nodes"
        );
    }

    #[test]
    fn absolutize_leaves_absolute_uris_alone() {
        let base: Uri = "https://10.96.0.1:6443".parse().unwrap();
        let uri: Uri = "https://elsewhere:443/x".parse().unwrap();
        assert_eq!(absolutize(&base, &uri).unwrap(), uri);
    }
}
