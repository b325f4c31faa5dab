pub mod broadcaster;
pub mod config;
pub mod logging;
pub mod poll_loop;
pub mod server;

use anyhow::Context;
use broadcaster::Broadcaster;
use config::Config;
use poll_loop::{snapshot_channel, PollLoop};
use pulse_core::SnapshotSource;
use server::{router, HubState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub use broadcaster::{Channel, ChannelError, ConnectionId};

/// Serves the hub on `listener` until `shutdown` becomes true. The poll loop
/// is stopped and every connection closed before this returns.
pub async fn run_hub(
    config: Config,
    listener: TcpListener,
    source: Arc<dyn SnapshotSource>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let broadcaster = Arc::new(Broadcaster::new());
    let (snapshot_tx, snapshot_rx) = snapshot_channel();
    let poll_loop = PollLoop::new(
        source,
        broadcaster.clone(),
        snapshot_tx,
        config.poll_interval,
        config.heartbeat_interval,
    );
    let poll_task = tokio::spawn(poll_loop.run(shutdown.clone()));

    let state = Arc::new(HubState::new(&config, broadcaster, snapshot_rx));
    let app = router(state);
    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!(
        event = "hub_start",
        addr = %local_addr,
        sessions_dir = %config.sessions_dir.display()
    );

    let mut server_shutdown = shutdown;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut server_shutdown).await })
        .await
        .context("hub server failed");

    let _ = poll_task.await;
    info!(event = "hub_stop");
    served
}

pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
