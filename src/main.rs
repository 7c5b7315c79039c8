//! Tether - bus-tunneled Kubernetes API access for NAT'd clusters

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tether::bus::{self, BusConfig};
use tether::edge;
use tether::link::{
    BusVerifier, CallbackRequest, FsBlobStore, LinkService, ScriptConfig, ScriptRenderer, User,
};
use tether::server::{router, AppState};
use tether::subjects::SubjectNames;

/// Tether - proxy Kubernetes API traffic to NAT'd clusters over a message bus
#[derive(Parser, Debug)]
#[command(name = "tether", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the hub: issue links and serve the connector REST API
    Hub(HubArgs),

    /// Run the edge agent inside a remote cluster
    Agent(AgentArgs),
}

/// Hub mode arguments
#[derive(Parser, Debug)]
struct HubArgs {
    /// REST listen address
    #[arg(long, default_value = "0.0.0.0:3333")]
    listen: SocketAddr,

    /// Bus server URL(s), comma separated
    #[arg(long, env = "BUS_URL", default_value = "nats://localhost:4222")]
    bus_url: String,

    /// Path to bus credentials file
    #[arg(long, env = "BUS_CREDENTIALS_FILE")]
    bus_credentials_file: Option<String>,

    /// Public base URL of this hub, rendered into installation scripts
    #[arg(long, env = "HUB_URL")]
    hub_url: String,

    /// Public base URL under which the blob directory is served
    #[arg(long, env = "MANIFEST_BASE_URL")]
    manifest_base_url: String,

    /// Directory backing the blob store
    #[arg(long, default_value = "/var/lib/tether/blobs")]
    blob_dir: String,

    /// Agent container image rendered into manifests
    #[arg(long, default_value = "ghcr.io/tether-dev/tether:latest")]
    agent_image: String,

    /// Hub and edges share one bus account (single-tenant deployments)
    #[arg(long)]
    same_account: bool,

    /// Name of the user links are issued for
    #[arg(long)]
    user_name: Option<String>,

    /// Email of the user links are issued for
    #[arg(long)]
    user_email: Option<String>,
}

/// Agent mode arguments
#[derive(Parser, Debug)]
struct AgentArgs {
    /// The link this agent serves
    #[arg(long, env = "LINK_ID")]
    link_id: String,

    /// Bus server URL(s), comma separated
    #[arg(long, env = "BUS_URL", default_value = "nats://localhost:4222")]
    bus_url: String,

    /// Path to bus credentials file
    #[arg(long, env = "BUS_CREDENTIALS_FILE")]
    bus_credentials_file: Option<String>,

    /// Hub base URL for the enrollment callback
    #[arg(long, env = "HUB_URL")]
    hub_url: String,

    /// Number of subscription instances serving proxied requests
    #[arg(long, default_value = "5")]
    handler_count: usize,

    /// Hub and edges share one bus account (single-tenant deployments)
    #[arg(long)]
    same_account: bool,

    /// Skip the enrollment callback (agent restarts on an already-bound link)
    #[arg(long)]
    skip_callback: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Commands::Hub(args) => run_hub(args).await,
        Commands::Agent(args) => run_agent(args).await,
    }
}

/// Run hub mode: link issuance plus the connector REST surface
async fn run_hub(args: HubArgs) -> anyhow::Result<()> {
    tracing::info!(listen = %args.listen, "tether hub starting");

    let mut bus_config = BusConfig::from_url(&args.bus_url);
    if let Some(creds) = &args.bus_credentials_file {
        bus_config = bus_config.with_credentials(creds.clone());
    }
    let nc = bus::connect(&bus_config, "tether-hub").await?;

    let renderer = ScriptRenderer::new(ScriptConfig::new(
        args.agent_image,
        args.bus_url,
        args.hub_url,
        args.manifest_base_url,
    ))?;

    let mut links = LinkService::new(
        Arc::new(BusVerifier::new(nc)),
        Arc::new(FsBlobStore::new(&args.blob_dir)),
        renderer,
    );
    if args.same_account {
        links = links.with_same_account();
    }

    let user = match (args.user_name, args.user_email) {
        (Some(name), Some(email)) => Some(User { name, email }),
        _ => None,
    };

    let state = AppState {
        links: Arc::new(links),
        user,
    };

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!(addr = %args.listen, "connector REST API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("tether hub shutting down");
    Ok(())
}

/// Run agent mode: serve proxied requests and claim the link
async fn run_agent(args: AgentArgs) -> anyhow::Result<()> {
    tracing::info!(link_id = %args.link_id, "tether agent starting");

    let mut bus_config = BusConfig::from_url(&args.bus_url);
    if let Some(creds) = &args.bus_credentials_file {
        bus_config = bus_config.with_credentials(creds.clone());
    }
    let nc = bus::connect(&bus_config, "tether-agent").await?;

    let names = if args.same_account {
        SubjectNames::same_account(&args.link_id)
    } else {
        SubjectNames::cross_account(&args.link_id)
    };

    // Several subscription instances in one queue group: each handles its
    // messages sequentially, together they serve concurrent requests.
    let queue_group = edge::queue_group();
    for _ in 0..args.handler_count.max(1) {
        edge::subscribe(&nc, &names, &queue_group).await?;
    }
    tracing::info!(
        %queue_group,
        handlers = args.handler_count.max(1),
        "proxy handlers subscribed"
    );

    if !args.skip_callback {
        claim_link(&args).await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("tether agent shutting down");
    nc.flush().await.ok();
    Ok(())
}

/// Report this cluster's identity to the hub, binding the link.
async fn claim_link(args: &AgentArgs) -> anyhow::Result<()> {
    let kube_client = kube::Client::try_default().await?;
    let cluster_id = tether::client::cluster_uid(&kube_client).await?;
    tracing::info!(cluster_id = %cluster_id, "detected local cluster identity");

    let callback = CallbackRequest {
        link_id: args.link_id.clone(),
        cluster_id,
        product_name: None,
    };
    let url = format!(
        "{}/api/v1/connector/link/callback",
        args.hub_url.trim_end_matches('/')
    );

    let resp = reqwest::Client::new()
        .post(&url)
        .json(&callback)
        .send()
        .await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("link callback failed with status {status}: {body}");
    }

    tracing::info!("link callback successful");
    Ok(())
}
