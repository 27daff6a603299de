use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use drivealive::auth::Credentials;
use drivealive::compactor;
use drivealive::config::ServerConfig;
use drivealive::engine::Engine;
use drivealive::notify::NotifyHub;
use drivealive::observability;
use drivealive::tls::load_tls_acceptor;
use drivealive::wire;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves on ctrl-c, or SIGTERM where the platform has it.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable ({e}), ctrl-c only");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

/// Wait until every connection permit is back or the deadline passes.
async fn drain(semaphore: &Semaphore, max_connections: usize) {
    let deadline = tokio::time::sleep(DRAIN_TIMEOUT);
    tokio::pin!(deadline);
    while semaphore.available_permits() < max_connections {
        tokio::select! {
            _ = &mut deadline => {
                let open = max_connections - semaphore.available_permits();
                warn!("drain timeout, {open} connections still open");
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
    info!("all connections drained");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();
    observability::init(config.metrics_port)?;
    let tls = load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;
    let credentials = Credentials::new(config.user.clone(), config.password.clone());

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = Path::new(&config.data_dir).join("drivealive.wal");
    let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()), config.policy)?);
    info!("replayed {} instructors from {}", engine.state.len(), config.data_dir);

    tokio::spawn(compactor::run_compactor(engine.clone(), config.compact_threshold));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));
    let listener = TcpListener::bind(config.addr()).await?;
    info!(
        addr = %config.addr(),
        max_connections,
        lesson_minutes = config.policy.lesson_minutes,
        buffer_minutes = config.policy.buffer_minutes,
        window_days = config.policy.window_days,
        tls = tls.is_some(),
        "drivealive listening"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!("accept error: {e}");
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            warn!("connection limit reached, rejecting {peer}");
            metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };

        tracing::debug!("connection from {peer}");
        metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
        let engine = engine.clone();
        let credentials = credentials.clone();
        let tls = tls.clone();

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = wire::process_connection(socket, engine, credentials, tls).await {
                tracing::error!("connection error from {peer}: {e}");
            }
            metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
        });
    }

    info!("shutdown signal received, draining connections");
    drain(&semaphore, max_connections).await;

    // leave a compact log behind so the next start replays quickly
    if let Err(e) = engine.compact_wal().await {
        warn!("final WAL compaction failed: {e}");
    }

    info!("drivealive stopped");
    Ok(())
}
