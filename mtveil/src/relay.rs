//! Bidirectional relay pumps.
//!
//! Once a session is established, two independent tasks move bytes: one per
//! direction, each owning its half of both sockets and its two cipher
//! states.  The only coupling between them is a shared cancellation token;
//! whichever pump stops first flips it and the sibling gets a short grace
//! period to drain.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use mtveil_crypto::ObfuscatedCipher;
use mtveil_proto::faketls::{self, RecordAssembler};

use crate::errors::SessionError;
use crate::metrics::{Direction, Metrics};

pub const READ_BUF_LEN: usize = 64 * 1024;

/// A direction with no traffic for this long is considered dead.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the surviving pump gets after its sibling stops.
const DRAIN_WAIT: Duration = Duration::from_secs(1);

// ─── SessionStats ─────────────────────────────────────────────────────────────

/// Per-session byte accounting.  Each counter has exactly one writer: the
/// pump that owns its direction.
#[derive(Default)]
pub struct SessionStats {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    last_activity_unix: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Arc<Self> {
        let stats = Self::default();
        stats.touch();
        Arc::new(stats)
    }

    fn record(&self, dir: Direction, n: u64) {
        match dir {
            Direction::ClientToPeer => self.bytes_in.fetch_add(n, Ordering::Relaxed),
            Direction::PeerToClient => self.bytes_out.fetch_add(n, Ordering::Relaxed),
        };
        self.touch();
    }

    fn touch(&self) {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.last_activity_unix.store(now, Ordering::Relaxed);
    }

    pub fn last_activity_unix(&self) -> u64 {
        self.last_activity_unix.load(Ordering::Relaxed)
    }
}

// ─── SessionCodecs ────────────────────────────────────────────────────────────

/// The four cipher states of an established session, grouped so the caller
/// can hand them over in one move.
pub struct SessionCodecs {
    /// Client → proxy ingress.
    pub client_decrypt: ObfuscatedCipher,
    /// Proxy → client egress.
    pub client_encrypt: ObfuscatedCipher,
    /// Proxy → peer egress.
    pub peer_encrypt: ObfuscatedCipher,
    /// Peer → proxy ingress.
    pub peer_decrypt: ObfuscatedCipher,
}

// ─── Pump ─────────────────────────────────────────────────────────────────────

struct Pump<R, W> {
    src: R,
    dst: W,
    /// Applied to bytes read from `src`.
    recv: ObfuscatedCipher,
    /// Applied before writing to `dst`.
    send: ObfuscatedCipher,
    /// TLS record reassembly on the ingress side (client → peer of a
    /// FakeTLS session).
    assembler: Option<RecordAssembler>,
    /// TLS record framing on the egress side (peer → client of a FakeTLS
    /// session).
    frame_out: bool,
    dir: Direction,
    dc_id: i32,
    stats: Arc<SessionStats>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl<R, W> Pump<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Drive this direction until EOF, error, or cancellation, then stop
    /// the sibling too.
    async fn run(mut self, carry: Option<BytesMut>) -> Result<(), SessionError> {
        let result = self.pump(carry).await;
        if let Err(e) = &result {
            debug!("[relay] {} pump stopped: {e}", self.dir.label());
        }
        self.cancel.cancel();
        result
    }

    async fn pump(&mut self, carry: Option<BytesMut>) -> Result<(), SessionError> {
        if let Some(mut payload) = carry {
            if !payload.is_empty() {
                self.recv.apply(&mut payload);
                self.send.apply(&mut payload);
                self.write_out(&payload).await?;
            }
        }

        let mut buf = vec![0u8; READ_BUF_LEN];
        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = timeout(IDLE_TIMEOUT, self.src.read(&mut buf)) => match read {
                    Err(_) => {
                        return Err(SessionError::RelayIo(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "relay direction idle past the deadline",
                        )))
                    }
                    Ok(Ok(0)) => {
                        // EOF: pass the FIN along before tearing down.
                        let _ = self.dst.shutdown().await;
                        return Ok(());
                    }
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(SessionError::RelayIo(e)),
                },
            };

            if self.assembler.is_some() {
                if let Some(asm) = self.assembler.as_mut() {
                    asm.push(&buf[..n]);
                }
                loop {
                    let popped = match self.assembler.as_mut() {
                        Some(asm) => asm.pop()?,
                        None => None,
                    };
                    let Some(mut payload) = popped else { break };
                    self.recv.apply(&mut payload);
                    self.send.apply(&mut payload);
                    self.write_out(&payload).await?;
                }
            } else {
                self.recv.apply(&mut buf[..n]);
                self.send.apply(&mut buf[..n]);
                self.write_out(&buf[..n]).await?;
            }
        }
    }

    async fn write_out(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        let write = async {
            if self.frame_out {
                let framed = faketls::frame_application_data(payload);
                self.dst.write_all(&framed).await
            } else {
                self.dst.write_all(payload).await
            }
        };
        timeout(WRITE_TIMEOUT, write)
            .await
            .map_err(|_| {
                SessionError::RelayIo(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "relay write stalled past the deadline",
                ))
            })?
            .map_err(SessionError::RelayIo)?;

        let n = payload.len() as u64;
        self.stats.record(self.dir, n);
        self.metrics.add_bytes(self.dir, self.dc_id, n);
        trace!("[relay] {} moved {n} bytes", self.dir.label());
        Ok(())
    }
}

// ─── run ──────────────────────────────────────────────────────────────────────

/// Relay until either side finishes.
///
/// `faketls_carry` holds the record assembler and any surplus payload left
/// over from the handshake exchange of a FakeTLS session; `None` runs the
/// plain obfuscated2 relay.
pub async fn run<C, P>(
    client: C,
    peer: P,
    codecs: SessionCodecs,
    faketls_carry: Option<(RecordAssembler, BytesMut)>,
    dc_id: i32,
    stats: Arc<SessionStats>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<(), SessionError>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    P: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (peer_rd, peer_wr) = tokio::io::split(peer);

    let is_faketls = faketls_carry.is_some();
    let (assembler, carry) = match faketls_carry {
        Some((asm, payload)) => (Some(asm), Some(payload)),
        None => (None, None),
    };

    let client_to_peer = Pump {
        src: client_rd,
        dst: peer_wr,
        recv: codecs.client_decrypt,
        send: codecs.peer_encrypt,
        assembler,
        frame_out: false,
        dir: Direction::ClientToPeer,
        dc_id,
        stats: Arc::clone(&stats),
        metrics: Arc::clone(&metrics),
        cancel: cancel.clone(),
    };
    let peer_to_client = Pump {
        src: peer_rd,
        dst: client_wr,
        recv: codecs.peer_decrypt,
        send: codecs.client_encrypt,
        assembler: None,
        frame_out: is_faketls,
        dir: Direction::PeerToClient,
        dc_id,
        stats,
        metrics,
        cancel,
    };

    let mut up = tokio::spawn(client_to_peer.run(carry));
    let mut down = tokio::spawn(peer_to_client.run(None));

    let (first, mut rest) = tokio::select! {
        r = &mut up => (r, down),
        r = &mut down => (r, up),
    };
    let second = match timeout(DRAIN_WAIT, &mut rest).await {
        Ok(r) => r,
        Err(_) => {
            // The sibling ignored the cancel flag for a full second;
            // dropping its halves closes both sockets.
            rest.abort();
            Ok(Ok(()))
        }
    };

    match (flatten(first), flatten(second)) {
        (Err(e), _) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn flatten(
    joined: Result<Result<(), SessionError>, tokio::task::JoinError>,
) -> Result<(), SessionError> {
    match joined {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(SessionError::RelayIo(io::Error::other(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn twin(key: u8) -> (ObfuscatedCipher, ObfuscatedCipher) {
        let k = [key; 32];
        let iv = [key ^ 0xff; 16];
        (ObfuscatedCipher::new(&k, &iv), ObfuscatedCipher::new(&k, &iv))
    }

    /// Ciphers for a loopback relay test: twin states on each of the four
    /// seams so the test doubles can decode what the proxy encodes.
    fn test_codecs() -> (SessionCodecs, ObfuscatedCipher, ObfuscatedCipher, ObfuscatedCipher, ObfuscatedCipher) {
        let (client_enc, client_decrypt) = twin(0x01);
        let (client_dec, client_encrypt) = twin(0x02);
        let (peer_encrypt, peer_dec) = twin(0x03);
        let (peer_decrypt, peer_enc) = twin(0x04);
        (
            SessionCodecs { client_decrypt, client_encrypt, peer_encrypt, peer_decrypt },
            client_enc,
            client_dec,
            peer_enc,
            peer_dec,
        )
    }

    #[tokio::test]
    async fn relays_both_directions_and_counts_bytes() {
        let (codecs, mut client_enc, mut client_dec, mut peer_enc, mut peer_dec) = test_codecs();
        let (client_side, proxy_client_end) = tokio::io::duplex(256 * 1024);
        let (proxy_peer_end, peer_side) = tokio::io::duplex(256 * 1024);

        let stats = SessionStats::new();
        let metrics = Metrics::new();
        let cancel = CancellationToken::new();
        let relay = tokio::spawn(run(
            proxy_client_end,
            proxy_peer_end,
            codecs,
            None,
            5,
            Arc::clone(&stats),
            Arc::clone(&metrics),
            cancel,
        ));

        let (mut client_rd, mut client_wr) = tokio::io::split(client_side);
        let (mut peer_rd, mut peer_wr) = tokio::io::split(peer_side);

        // client → peer
        let mut wire = *b"hello through the veil";
        client_enc.apply(&mut wire);
        client_wr.write_all(&wire).await.unwrap();

        let mut got = [0u8; 22];
        peer_rd.read_exact(&mut got).await.unwrap();
        peer_dec.apply(&mut got);
        assert_eq!(&got, b"hello through the veil");

        // peer → client
        let mut reply = *b"datacenter says hi";
        peer_enc.apply(&mut reply);
        peer_wr.write_all(&reply).await.unwrap();

        let mut got = [0u8; 18];
        client_rd.read_exact(&mut got).await.unwrap();
        client_dec.apply(&mut got);
        assert_eq!(&got, b"datacenter says hi");

        // EOF on the client side winds the whole relay down.
        client_wr.shutdown().await.unwrap();
        drop(client_wr);
        relay.await.unwrap().unwrap();

        assert_eq!(stats.bytes_in.load(Ordering::Relaxed), 22);
        assert_eq!(stats.bytes_out.load(Ordering::Relaxed), 18);
    }

    #[tokio::test]
    async fn faketls_sessions_deframe_in_and_frame_out() {
        let (codecs, mut client_enc, mut client_dec, mut peer_enc, mut peer_dec) = test_codecs();
        let (client_side, proxy_client_end) = tokio::io::duplex(256 * 1024);
        let (proxy_peer_end, peer_side) = tokio::io::duplex(256 * 1024);

        let stats = SessionStats::new();
        let metrics = Metrics::new();
        let relay = tokio::spawn(run(
            proxy_client_end,
            proxy_peer_end,
            codecs,
            Some((RecordAssembler::new(), BytesMut::new())),
            2,
            Arc::clone(&stats),
            Arc::clone(&metrics),
            CancellationToken::new(),
        ));

        let (mut client_rd, mut client_wr) = tokio::io::split(client_side);
        let (mut peer_rd, mut peer_wr) = tokio::io::split(peer_side);

        // client → peer: obfuscated payload inside an ApplicationData record
        let mut inner = *b"framed request";
        client_enc.apply(&mut inner);
        client_wr
            .write_all(&faketls::frame_application_data(&inner))
            .await
            .unwrap();

        let mut got = [0u8; 14];
        peer_rd.read_exact(&mut got).await.unwrap();
        peer_dec.apply(&mut got);
        assert_eq!(&got, b"framed request");

        // peer → client: raw obfuscated bytes come back framed
        let mut reply = *b"framed reply!";
        peer_enc.apply(&mut reply);
        peer_wr.write_all(&reply).await.unwrap();

        let mut header = [0u8; 5];
        client_rd.read_exact(&mut header).await.unwrap();
        let parsed = faketls::parse_header(&header).unwrap();
        assert_eq!(parsed.kind, faketls::APPLICATION_DATA);
        assert_eq!(parsed.len, 13);

        let mut payload = [0u8; 13];
        client_rd.read_exact(&mut payload).await.unwrap();
        client_dec.apply(&mut payload);
        assert_eq!(&payload, b"framed reply!");

        client_wr.shutdown().await.unwrap();
        drop(client_wr);
        relay.await.unwrap().unwrap();
    }
}
