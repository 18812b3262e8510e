//! Proxy counters and their Prometheus rendering.
//!
//! Everything here is a lock-free atomic; the hot relay path only ever does
//! relaxed adds.  The `/metrics` endpoint renders the whole registry as
//! Prometheus text on demand.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mtveil_proto::datacenter;

/// Every `errors_total{kind}` label, in render order.
pub const ERROR_KINDS: [&str; 10] = [
    "handshake_read",
    "obvious_marker",
    "unknown_transport",
    "unknown_dc",
    "replay",
    "peer_dial",
    "peer_handshake",
    "faketls_frame",
    "relay_io",
    "overload",
];

/// Relay direction, as seen from the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    ClientToPeer,
    PeerToClient,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Self::ClientToPeer => "client_to_peer",
            Self::PeerToClient => "peer_to_client",
        }
    }
}

/// Upper bounds of the `connection_duration_seconds` histogram, seconds.
const DURATION_BUCKETS: [f64; 9] = [0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0];

// ─── Metrics ──────────────────────────────────────────────────────────────────

/// The process-wide counter registry.
#[derive(Default)]
pub struct Metrics {
    connections_ok:       AtomicU64,
    connections_error:    AtomicU64,
    connections_rejected: AtomicU64,
    connections_active:   AtomicI64,

    /// `[direction][dc_id - 1]`
    bytes: [[AtomicU64; 5]; 2],
    /// Indexed like [`ERROR_KINDS`].
    errors: [AtomicU64; 10],
    dc_connections: [AtomicU64; 5],

    duration_buckets: [AtomicU64; 9],
    duration_count: AtomicU64,
    duration_sum_micros: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_opened(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_ok(&self) {
        self.connections_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connections_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> i64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Count one error by its `errors_total` label.
    pub fn record_error(&self, kind: &str) {
        if let Some(i) = ERROR_KINDS.iter().position(|k| *k == kind) {
            self.errors[i].fetch_add(1, Ordering::Relaxed);
        } else {
            debug_assert!(false, "unregistered error kind {kind}");
        }
    }

    pub fn add_bytes(&self, dir: Direction, dc_id: i32, n: u64) {
        if let Some(slot) = self.bytes[dir as usize].get((dc_id - 1) as usize) {
            slot.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn dc_connection(&self, dc_id: i32) {
        if let Some(slot) = self.dc_connections.get((dc_id - 1) as usize) {
            slot.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if secs <= *bound {
                self.duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.duration_count.fetch_add(1, Ordering::Relaxed);
        self.duration_sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        use std::fmt::Write;

        let mut out = String::with_capacity(4096);
        let w = &mut out;

        let _ = writeln!(w, "# TYPE connections_total counter");
        for (status, v) in [
            ("ok", &self.connections_ok),
            ("error", &self.connections_error),
            ("rejected", &self.connections_rejected),
        ] {
            let _ = writeln!(
                w,
                "connections_total{{status=\"{status}\"}} {}",
                v.load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(w, "# TYPE connections_active gauge");
        let _ = writeln!(w, "connections_active {}", self.active());

        let _ = writeln!(w, "# TYPE bytes_transferred_total counter");
        for dir in [Direction::ClientToPeer, Direction::PeerToClient] {
            for dc in datacenter::table() {
                let n = self.bytes[dir as usize][(dc.id - 1) as usize].load(Ordering::Relaxed);
                let _ = writeln!(
                    w,
                    "bytes_transferred_total{{direction=\"{}\",dc=\"{}\"}} {n}",
                    dir.label(),
                    dc.label()
                );
            }
        }

        let _ = writeln!(w, "# TYPE connection_duration_seconds histogram");
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            let _ = writeln!(
                w,
                "connection_duration_seconds_bucket{{le=\"{bound}\"}} {}",
                self.duration_buckets[i].load(Ordering::Relaxed)
            );
        }
        let count = self.duration_count.load(Ordering::Relaxed);
        let _ = writeln!(w, "connection_duration_seconds_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(
            w,
            "connection_duration_seconds_sum {}",
            self.duration_sum_micros.load(Ordering::Relaxed) as f64 / 1e6
        );
        let _ = writeln!(w, "connection_duration_seconds_count {count}");

        let _ = writeln!(w, "# TYPE errors_total counter");
        for (i, kind) in ERROR_KINDS.iter().enumerate() {
            let _ = writeln!(
                w,
                "errors_total{{kind=\"{kind}\"}} {}",
                self.errors[i].load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(w, "# TYPE datacenter_connections counter");
        for dc in datacenter::table() {
            let _ = writeln!(
                w,
                "datacenter_connections{{dc=\"{}\",location=\"{}\"}} {}",
                dc.label(),
                dc.location,
                self.dc_connections[(dc.id - 1) as usize].load(Ordering::Relaxed)
            );
        }

        out
    }
}

// ─── HTTP endpoint ────────────────────────────────────────────────────────────

async fn handle(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != "/metrics" {
        let mut resp = Response::new(Full::new(Bytes::new()));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return Ok(resp);
    }
    let mut resp = Response::new(Full::new(Bytes::from(metrics.render())));
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(resp)
}

/// Serve `/metrics` until shutdown.
pub async fn serve(
    metrics: Arc<Metrics>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    debug!("[metrics] listening on {addr}");

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req| handle(req, metrics.clone()));
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, svc)
                .await
            {
                warn!("[metrics] connection error: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_carries_every_family() {
        let m = Metrics::new();
        m.connection_opened();
        m.connection_ok();
        m.record_error("replay");
        m.add_bytes(Direction::ClientToPeer, 5, 4096);
        m.dc_connection(5);
        m.observe_duration(Duration::from_millis(250));

        let text = m.render();
        assert!(text.contains("connections_total{status=\"ok\"} 1"));
        assert!(text.contains("connections_active 1"));
        assert!(text.contains("bytes_transferred_total{direction=\"client_to_peer\",dc=\"DC5\"} 4096"));
        assert!(text.contains("errors_total{kind=\"replay\"} 1"));
        assert!(text.contains("datacenter_connections{dc=\"DC5\",location=\"SIN\"} 1"));
        assert!(text.contains("connection_duration_seconds_count 1"));
        // 250 ms lands in every bucket from 0.5 up
        assert!(text.contains("connection_duration_seconds_bucket{le=\"0.5\"} 1"));
        assert!(text.contains("connection_duration_seconds_bucket{le=\"0.1\"} 0"));
    }

    #[test]
    fn gauge_returns_to_zero() {
        let m = Metrics::new();
        m.connection_opened();
        m.connection_opened();
        m.connection_closed();
        m.connection_closed();
        assert_eq!(m.active(), 0);
    }
}
