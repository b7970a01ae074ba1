use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use doghair_peer::{PeerAgent, PeerAgentConfig};
use doghair_proto::NodeId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "doghair_peer=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let node = std::env::var("DOGHAIR_NODE")
        .map_err(|_| anyhow::anyhow!("DOGHAIR_NODE is not set"))?;
    let listen = std::env::var("DOGHAIR_LISTEN").unwrap_or_else(|_| "0.0.0.0:7199".to_string());
    let data_dir =
        std::env::var("DOGHAIR_DATA_DIR").unwrap_or_else(|_| "doghair-data".to_string());

    let agent = PeerAgent::spawn(PeerAgentConfig::new(NodeId(node), listen, data_dir))
        .await
        .map_err(|e| anyhow::anyhow!("failed to start collector agent: {e}"))?;
    info!(node = %agent.node(), addr = %agent.addr(), "collector agent running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = agent.wait() => info!("collector agent exited"),
    }
    Ok(())
}
