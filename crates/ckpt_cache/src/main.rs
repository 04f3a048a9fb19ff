use anyhow::Result;
use clap::Parser;

use ckpt_cache::config::Config;
use ckpt_cache::reconcile::ReconcileTask;
use ckpt_cache::{bootstrap, http_api, peer_server, NodeState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::parse();
    run_node(config).await
}

/// Wire the components, start every surface, bootstrap, then run until
/// interrupted.
async fn run_node(config: Config) -> Result<()> {
    let state = NodeState::new(config)?;
    tracing::info!(
        job = %state.world.job_name,
        rank = state.world.node_rank,
        world_size = state.world.world_size,
        "checkpoint cache node starting"
    );

    state.monitor.spawn_refresh();

    state.operator.set_handler(ReconcileTask::new(state.clone()));
    state.operator.run();

    state.loader.start();

    // Bind both listeners before bootstrap so peers can reach us while we
    // negotiate; failure to bind is fatal.
    let peer_listener = peer_server::bind(state.config.tcp_port).await?;
    tokio::spawn(peer_server::serve(state.clone(), peer_listener));

    let http_state = state.clone();
    let http_port = state.config.http_port;
    tokio::spawn(async move {
        if let Err(err) = http_api::serve(http_state, http_port).await {
            tracing::error!(error = %err, "http surface failed");
        }
    });

    bootstrap::run(state.clone()).await;
    state.mark_ready();

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    Ok(())
}
