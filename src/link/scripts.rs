//! Installation script rendering
//!
//! `generate` hands the operator two ready-to-run scripts: a plain
//! `kubectl apply` of a rendered manifest, and a Helm 3 install. The manifest
//! itself is uploaded to the blob store so the yaml script can fetch it from
//! a stable URL.

use std::collections::BTreeMap;

use minijinja::{context, Environment};

use super::store::BlobStore;
use super::UserValues;
use crate::{Error, Result};

/// Script variant key for the kubectl-based installer
pub const SCRIPT_YAML: &str = "yaml";
/// Script variant key for the Helm 3 installer
pub const SCRIPT_HELM3: &str = "helm3";

/// Deployment parameters baked into rendered scripts
#[derive(Clone, Debug)]
pub struct ScriptConfig {
    /// Agent container image reference
    pub image: String,
    /// Bus URL the agent connects to
    pub bus_url: String,
    /// Hub base URL the agent calls back to
    pub hub_url: String,
    /// Public base URL under which blob-store manifests are served
    pub manifest_base_url: String,
    /// Namespace the agent installs into
    pub namespace: String,
    /// Agent replica count
    pub replicas: u32,
    /// Helm chart repository URL
    pub chart_repo: String,
    /// Helm chart name
    pub chart_name: String,
    /// Helm chart version; empty pins nothing
    pub chart_version: String,
}

impl ScriptConfig {
    /// Config with the standard chart coordinates and agent defaults
    pub fn new(
        image: impl Into<String>,
        bus_url: impl Into<String>,
        hub_url: impl Into<String>,
        manifest_base_url: impl Into<String>,
    ) -> Self {
        Self {
            image: image.into(),
            bus_url: bus_url.into(),
            hub_url: hub_url.into(),
            manifest_base_url: manifest_base_url.into(),
            namespace: "tether-system".to_string(),
            replicas: 2,
            chart_repo: "https://charts.tether.dev/stable".to_string(),
            chart_name: "tether-agent".to_string(),
            chart_version: String::new(),
        }
    }
}

/// Renders the agent manifest and the per-link installation scripts
pub struct ScriptRenderer {
    env: Environment<'static>,
    config: ScriptConfig,
}

impl ScriptRenderer {
    /// Compile the embedded templates
    pub fn new(config: ScriptConfig) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("manifest", include_str!("templates/agent-manifest.yaml.j2"))
            .map_err(|e| Error::Render(e.to_string()))?;
        env.add_template("yaml", include_str!("templates/install-yaml.sh.j2"))
            .map_err(|e| Error::Render(e.to_string()))?;
        env.add_template("helm3", include_str!("templates/install-helm3.sh.j2"))
            .map_err(|e| Error::Render(e.to_string()))?;
        Ok(Self { env, config })
    }

    /// Render the manifest for a link, upload it, and return the scripts
    /// keyed by variant.
    pub async fn render(
        &self,
        blobs: &dyn BlobStore,
        link_id: &str,
        user: Option<&UserValues>,
    ) -> Result<BTreeMap<String, String>> {
        let cfg = &self.config;
        let manifest = self
            .env
            .get_template("manifest")
            .and_then(|t| {
                t.render(context! {
                    link_id,
                    image => cfg.image,
                    bus_url => cfg.bus_url,
                    hub_url => cfg.hub_url,
                    namespace => cfg.namespace,
                    replicas => cfg.replicas,
                })
            })
            .map_err(|e| Error::Render(format!("manifest: {e}")))?;

        let manifest_path = format!("manifests/{link_id}.yaml");
        blobs.write(&manifest_path, manifest.as_bytes()).await?;
        let manifest_url = format!(
            "{}/{manifest_path}",
            cfg.manifest_base_url.trim_end_matches('/')
        );

        let yaml = self
            .env
            .get_template("yaml")
            .and_then(|t| t.render(context! { link_id, manifest_url }))
            .map_err(|e| Error::Render(format!("yaml script: {e}")))?;

        let helm3 = self
            .env
            .get_template("helm3")
            .and_then(|t| {
                t.render(context! {
                    link_id,
                    image => cfg.image,
                    bus_url => cfg.bus_url,
                    hub_url => cfg.hub_url,
                    namespace => cfg.namespace,
                    chart_repo => cfg.chart_repo,
                    chart_name => cfg.chart_name,
                    chart_version => cfg.chart_version,
                    user => user.map(|u| &u.user),
                    token => user.map(|u| u.token.as_str()),
                })
            })
            .map_err(|e| Error::Render(format!("helm3 script: {e}")))?;

        let mut scripts = BTreeMap::new();
        scripts.insert(SCRIPT_YAML.to_string(), yaml);
        scripts.insert(SCRIPT_HELM3.to_string(), helm3);
        Ok(scripts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::store::MemBlobStore;
    use crate::link::User;

    fn renderer() -> ScriptRenderer {
        ScriptRenderer::new(ScriptConfig::new(
            "ghcr.io/tether-dev/tether:v0.1.0",
            "nats://bus.tether.dev:4222",
            "https://hub.tether.dev",
            "https://blobs.tether.dev/",
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn manifest_is_uploaded_and_referenced() {
        let blobs = MemBlobStore::new();
        let scripts = renderer().render(&blobs, "01H455VB4R", None).await.unwrap();

        let manifest = String::from_utf8(blobs.get("manifests/01H455VB4R.yaml").unwrap()).unwrap();
        assert!(manifest.contains("--link-id=01H455VB4R"));
        assert!(manifest.contains("--bus-url=nats://bus.tether.dev:4222"));
        assert!(manifest.contains("image: ghcr.io/tether-dev/tether:v0.1.0"));
        assert!(manifest.contains("kind: Deployment"));

        let yaml = &scripts[SCRIPT_YAML];
        assert!(yaml.contains("kubectl apply -f https://blobs.tether.dev/manifests/01H455VB4R.yaml"));
    }

    #[tokio::test]
    async fn helm_script_carries_link_and_user_values() {
        let blobs = MemBlobStore::new();
        let user = UserValues {
            user: User {
                name: "Ops Person".into(),
                email: "ops@example.com".into(),
            },
            token: "tok-123".into(),
        };
        let scripts = renderer()
            .render(&blobs, "01H455VB4R", Some(&user))
            .await
            .unwrap();

        let helm = &scripts[SCRIPT_HELM3];
        assert!(helm.contains("--set linkID=01H455VB4R"));
        assert!(helm.contains("helm repo add tether https://charts.tether.dev/stable"));
        assert!(helm.contains("--set user.email=\"ops@example.com\""));
        assert!(helm.contains("--set user.token=\"tok-123\""));
    }

    #[tokio::test]
    async fn helm_script_omits_user_block_without_user() {
        let blobs = MemBlobStore::new();
        let scripts = renderer().render(&blobs, "lk", None).await.unwrap();
        assert!(!scripts[SCRIPT_HELM3].contains("--set user."));
    }

    #[tokio::test]
    async fn both_variants_are_rendered() {
        let blobs = MemBlobStore::new();
        let scripts = renderer().render(&blobs, "lk", None).await.unwrap();
        assert_eq!(scripts.len(), 2);
        assert!(scripts.contains_key(SCRIPT_YAML));
        assert!(scripts.contains_key(SCRIPT_HELM3));
    }
}
