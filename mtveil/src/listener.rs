//! Accept loop and process lifecycle.
//!
//! Binds the client-facing socket, spawns one session task per accepted
//! connection up to the configured cap, and owns the shutdown sequence:
//! stop accepting immediately, give live relays a grace window, then cut
//! the stragglers.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::{self, Metrics};
use crate::pool::{self, PeerPool};
use crate::replay::ReplayCache;
use crate::session::{Session, SessionContext};

/// How long relaying sessions may keep running after shutdown is asserted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Idle sockets pre-dialed per datacenter at startup.
const PREWARM_PER_DC: usize = 2;

/// Run the proxy until ctrl-c.
pub async fn run(config: Config) -> io::Result<()> {
    let config = Arc::new(config);
    let metrics = Metrics::new();
    let replay = Arc::new(ReplayCache::new(config.antireplay_mib));
    let pool = Arc::new(PeerPool::new(config.pool_size));
    let ctx = Arc::new(SessionContext {
        config: Arc::clone(&config),
        replay: Arc::clone(&replay),
        pool: Arc::clone(&pool),
        metrics: Arc::clone(&metrics),
    });

    let shutdown = CancellationToken::new();
    let relay_cancel = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    replay.start_sweeper(shutdown.clone());
    pool.prewarm(PREWARM_PER_DC.min(config.pool_size), config.prefer_ipv6);
    {
        let metrics = Arc::clone(&metrics);
        let addr = config.metrics_addr;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(metrics, addr, shutdown).await {
                warn!("[metrics] endpoint failed: {e}");
            }
        });
    }

    info!("client secret: {}", config.secret.to_hex());
    if let Some(url) = config.invite_url() {
        info!("invite: {url}");
    }

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("listening on {} ({:?})", config.bind_addr, config.secret);

    let tracker = TaskTracker::new();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (sock, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        if metrics.active() >= config.max_sessions as i64 {
            metrics.record_error("overload");
            metrics.connection_rejected();
            continue; // dropping the socket closes it
        }
        let sock = match pool::configure(sock) {
            Ok(sock) => sock,
            Err(e) => {
                warn!("socket setup for {remote} failed: {e}");
                continue;
            }
        };

        metrics.connection_opened();
        let session = Session::new(
            Arc::clone(&ctx),
            remote,
            shutdown.clone(),
            relay_cancel.child_token(),
        );
        tracker.spawn(session.run(sock));
    }
    drop(listener);

    // Sessions already relaying get the grace window; the rest saw the
    // shutdown token and are unwinding.
    tracker.close();
    if timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
        info!("grace expired, cancelling {} live sessions", metrics.active());
        relay_cancel.cancel();
        let _ = timeout(Duration::from_secs(5), tracker.wait()).await;
    }
    info!("bye");
    Ok(())
}
