use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mesh_client::{AppMessage, MeshConfig, MeshNode};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "mesh-peer",
    author,
    version,
    about = "Join a mesh, answer PING_REQUEST messages and optionally ping every peer"
)]
struct Cli {
    /// Relay websocket url.
    #[arg(long, env = "MESH_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Send one tracked ping once the session is ready.
    #[arg(long, default_value_t = false)]
    ping: bool,

    /// Give up on the ping after this many milliseconds.
    #[arg(long, env = "MESH_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let cli = Cli::parse();
    let mut config = MeshConfig::from_env();
    if let Some(url) = cli.signaling_url {
        config = config.with_signaling_url(url);
    }
    if let Some(ms) = cli.request_timeout_ms {
        config = config.with_request_timeout(Duration::from_millis(ms));
    }

    let node = Arc::new(
        MeshNode::connect(config)
            .await
            .context("failed to join mesh")?,
    );
    info!(local_id = %node.local_id(), "joined mesh; waiting for links");
    node.ready().await.context("session never became ready")?;
    info!(peers = ?node.peers().await?, "session ready");

    let responder = tokio::spawn(answer_pings(node.clone()));

    if cli.ping {
        match node.request_all("PING_REQUEST", json!(null)).await? {
            Some(reply) => info!(
                first = %reply.first.sender,
                replies = reply.replies.len(),
                "ping answered by every peer"
            ),
            None => info!("no peers to ping"),
        }
    }

    let _ = signal::ctrl_c().await;
    info!("shutting down");
    responder.abort();
    node.close().await?;
    Ok(())
}

async fn answer_pings(node: Arc<MeshNode>) {
    let Some(mut inbound) = node.messages() else {
        return;
    };
    while let Some(message) = inbound.recv().await {
        if message.kind != "PING_REQUEST" {
            info!(kind = %message.kind, sender = %message.sender, "message");
            continue;
        }
        let reply: AppMessage = message.reply("PING_RESPONSE", json!(node.local_id().as_u64()));
        if let Err(err) = node.send(reply) {
            warn!(error = %err, "failed to answer ping");
            return;
        }
    }
}
