use std::time::Duration;

use ractor::Actor;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use doghair::actors::coordinator::{self, CoordinatorActor, CoordinatorArguments};
use doghair::deploy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "doghair=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let args = CoordinatorArguments::from_env()?;
    let peers = args.peers.clone();
    info!(peers = peers.len(), home = %args.home.display(), "doghaird starting");

    let (coordinator_ref, mut join) = Actor::spawn(
        Some("doghair.coordinator".to_string()),
        CoordinatorActor,
        args,
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to spawn coordinator: {e}"))?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            coordinator::shutdown(&coordinator_ref)
                .await
                .map_err(|e| anyhow::anyhow!("shutdown failed: {e}"))?;
        }
        _ = &mut join => {
            // The coordinator only exits on its own after a fatal startup
            // error; leave no stale collector code behind on the peers.
            deploy::retire(&peers, Duration::from_secs(2)).await;
            anyhow::bail!("coordinator terminated");
        }
    }

    let _ = join.await;
    Ok(())
}
