//! Peer connection pool.
//!
//! One bounded queue of idle upstream sockets per datacenter.  Sockets in a
//! slot are clean — no handshake has been written on them — so any session
//! can pick one up and obfuscate it from scratch.  A session that wrote
//! framing must drop its socket instead of returning it.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use mtveil_proto::datacenter::{self, Datacenter};

/// Upstream connect timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the checkout probe waits for a socket to prove itself idle.
const PROBE_TIMEOUT: Duration = Duration::from_millis(1);

/// Default idle sockets kept per datacenter.
pub const DEFAULT_CAPACITY: usize = 10;

// ─── PeerPool ─────────────────────────────────────────────────────────────────

/// Bounded per-DC pool of idle upstream sockets.
pub struct PeerPool {
    /// `slots[dc_id - 1]`, pre-initialized empty for every DC.
    slots: [Mutex<VecDeque<TcpStream>>; 5],
    capacity: usize,
}

impl PeerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            capacity,
        }
    }

    /// A live socket to `dc`: an idle one from the pool if any proves
    /// healthy, otherwise a fresh dial.
    pub async fn checkout(&self, dc: &Datacenter, prefer_ipv6: bool) -> io::Result<TcpStream> {
        if let Some(sock) = self.checkout_idle(dc.id).await {
            debug!("[pool] reusing idle socket to {}", dc.label());
            return Ok(sock);
        }
        dial(dc, prefer_ipv6).await
    }

    /// Pop idle sockets until one passes the liveness probe.
    ///
    /// The probe is non-consuming: `peek` under a 1 ms timeout.  A healthy
    /// idle peer has nothing to send, so quiet means alive; any readability
    /// (bytes or EOF) disqualifies the socket and it is dropped.
    pub async fn checkout_idle(&self, dc_id: i32) -> Option<TcpStream> {
        let slot = self.slot(dc_id)?;
        loop {
            let sock = slot.lock().await.pop_front()?;
            if probe_idle(&sock).await {
                return Some(sock);
            }
            debug!("[pool] discarding stale socket for DC{dc_id}");
        }
    }

    /// Return a clean socket; full slots close it instead.
    pub async fn checkin(&self, dc_id: i32, sock: TcpStream) {
        if let Some(slot) = self.slot(dc_id) {
            let mut q = slot.lock().await;
            if q.len() < self.capacity {
                q.push_back(sock);
                return;
            }
        }
        // dropping the socket closes it
    }

    pub async fn idle_count(&self, dc_id: i32) -> usize {
        match self.slot(dc_id) {
            Some(slot) => slot.lock().await.len(),
            None => 0,
        }
    }

    fn slot(&self, dc_id: i32) -> Option<&Mutex<VecDeque<TcpStream>>> {
        usize::try_from(dc_id - 1).ok().and_then(|i| self.slots.get(i))
    }

    /// Pre-dial a few sockets per datacenter so early sessions skip the
    /// connect latency.  Failures are normal on restricted networks and
    /// only logged.
    pub fn prewarm(self: &Arc<Self>, per_dc: usize, prefer_ipv6: bool) {
        for dc in datacenter::table() {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                for _ in 0..per_dc {
                    match dial(dc, prefer_ipv6).await {
                        Ok(sock) => pool.checkin(dc.id, sock).await,
                        Err(e) => {
                            debug!("[pool] prewarm dial to {} failed: {e}", dc.label());
                            break;
                        }
                    }
                }
            });
        }
    }
}

async fn probe_idle(sock: &TcpStream) -> bool {
    let mut byte = [0u8; 1];
    match timeout(PROBE_TIMEOUT, sock.peek(&mut byte)).await {
        Err(_) => true,      // nothing to read within the window: healthy
        Ok(Ok(_)) => false,  // pending bytes or EOF on a pre-handshake socket
        Ok(Err(_)) => false,
    }
}

/// Dial a datacenter, preferred address family first.
async fn dial(dc: &Datacenter, prefer_ipv6: bool) -> io::Result<TcpStream> {
    if prefer_ipv6 {
        match connect(dc.addr_v6()).await {
            Ok(sock) => return Ok(sock),
            Err(e) => debug!("[pool] IPv6 dial to {} failed ({e}), trying IPv4", dc.label()),
        }
    }
    connect(dc.addr_v4()).await
}

async fn connect(addr: std::net::SocketAddr) -> io::Result<TcpStream> {
    let sock = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial {addr} timed out")))??;
    configure(sock)
}

/// Nodelay plus a keepalive so half-dead pool sockets die visibly.
pub fn configure(sock: TcpStream) -> io::Result<TcpStream> {
    sock.set_nodelay(true)?;
    let std_sock = sock.into_std()?;
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    socket2::SockRef::from(&std_sock).set_tcp_keepalive(&keepalive)?;
    TcpStream::from_std(std_sock)
}
