//! Per-connection session state machine.
//!
//! One session per accepted socket, driven start to finish by its own
//! task: handshake → anti-replay witness → key derivation → peer checkout
//! and upstream handshake → bidirectional relay → teardown.  All shared
//! collaborators arrive through [`SessionContext`]; the session itself
//! owns both sockets for its whole life.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use mtveil_proto::datacenter::{self, Datacenter};
use mtveil_proto::faketls::{self, ClientHello, FakeTlsError, RecordAssembler};
use mtveil_proto::handshake::{ClientHandshake, PeerHandshake};
use mtveil_proto::{HANDSHAKE_LEN, SecretTag};

use crate::config::Config;
use crate::errors::SessionError;
use crate::metrics::Metrics;
use crate::pool::PeerPool;
use crate::relay::{self, SessionCodecs, SessionStats};
use crate::replay::{ReplayCache, Witness};

/// Deadline for everything up to and including the obfuscated2 frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// ─── SessionContext ───────────────────────────────────────────────────────────

/// Shared collaborators injected into every session at accept time, so a
/// session stays testable in isolation.
pub struct SessionContext {
    pub config: Arc<Config>,
    pub replay: Arc<ReplayCache>,
    pub pool: Arc<PeerPool>,
    pub metrics: Arc<Metrics>,
}

// ─── Session ──────────────────────────────────────────────────────────────────

/// Everything [`relay::run`] needs once the peer leg is up.
struct Established<S> {
    client: S,
    peer: TcpStream,
    codecs: SessionCodecs,
    carry: Option<(RecordAssembler, BytesMut)>,
    dc_id: i32,
}

/// One client connection, from accept to close.
pub struct Session {
    ctx: Arc<SessionContext>,
    id: String,
    stats: Arc<SessionStats>,
    /// Flipped once the peer leg is up; errors after that do not demote
    /// the connection's "ok" status.
    established: AtomicBool,
    /// Global shutdown: aborts sessions still in their handshake phase.
    shutdown: CancellationToken,
    /// Post-grace cut for sessions already relaying.
    relay_cancel: CancellationToken,
}

impl Session {
    pub fn new(
        ctx: Arc<SessionContext>,
        remote: SocketAddr,
        shutdown: CancellationToken,
        relay_cancel: CancellationToken,
    ) -> Self {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Self {
            ctx,
            id: format!("{remote}#{nanos}"),
            stats: SessionStats::new(),
            established: AtomicBool::new(false),
            shutdown,
            relay_cancel,
        }
    }

    /// Drive the session to completion, including metrics and teardown.
    /// The caller has already incremented the active-connections gauge.
    pub async fn run(self, client: TcpStream) {
        let started = Instant::now();
        match self.drive(client).await {
            Ok(()) => debug!("[session {}] closed", self.id),
            Err(e) => {
                self.ctx.metrics.record_error(e.kind());
                if !self.established.load(Ordering::Relaxed) {
                    self.ctx.metrics.connection_error();
                }
                debug!("[session {}] {e}", self.id);
            }
        }
        self.ctx.metrics.connection_closed();
        self.ctx.metrics.observe_duration(started.elapsed());
    }

    async fn drive<S>(&self, client: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let est = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            established = self.establish(client) => established?,
        };

        relay::run(
            est.client,
            est.peer,
            est.codecs,
            est.carry,
            est.dc_id,
            Arc::clone(&self.stats),
            Arc::clone(&self.ctx.metrics),
            self.relay_cancel.child_token(),
        )
        .await
    }

    /// AwaitHandshake → Deriving → AwaitPeer.
    async fn establish<S>(&self, mut client: S) -> Result<Established<S>, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut first = [0u8; HANDSHAKE_LEN];
        read_exact_deadline(&mut client, &mut first)
            .await
            .map_err(SessionError::HandshakeRead)?;

        let secret = &self.ctx.config.secret;
        let faketls_active =
            matches!(secret.tag, SecretTag::FakeTls { .. }) && faketls::looks_like_tls(&first);

        let (frame, carry) = if faketls_active {
            let (frame, asm, leftover) = faketls_exchange(&mut client, first, &secret.key).await?;
            (frame, Some((asm, leftover)))
        } else {
            (first, None)
        };

        // Witness strictly before any key derivation: a replayed frame must
        // never cause an upstream dial.
        if self.ctx.replay.witness(&frame) == Witness::Duplicate {
            return Err(SessionError::Replay);
        }
        let hs = ClientHandshake::parse(&frame, secret)?;

        let requested = i32::from(hs.dc_id.unsigned_abs());
        let dc = match datacenter::by_id(requested) {
            Some(dc) => dc,
            None if self.ctx.config.allow_fallback => {
                let fallback = datacenter::priority_one();
                debug!(
                    "[session {}] DC id {} out of range, using {}",
                    self.id,
                    hs.dc_id,
                    fallback.label()
                );
                fallback
            }
            None => return Err(SessionError::UnknownDc(hs.dc_id)),
        };

        let (dc, mut peer) = self.connect_peer(dc).await?;

        // The upstream leg gets its own fresh obfuscation, always speaking
        // padded-intermediate; a negative client id keeps its sign.
        let peer_dc_id = if hs.dc_id < 0 { -(dc.id as i16) } else { dc.id as i16 };
        let peer_hs =
            PeerHandshake::generate(peer_dc_id, self.ctx.config.upstream_secret.as_ref());
        match timeout(relay::WRITE_TIMEOUT, peer.write_all(&peer_hs.frame)).await {
            Err(_) => {
                return Err(SessionError::PeerHandshake(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream handshake write timed out",
                )))
            }
            Ok(Err(e)) => return Err(SessionError::PeerHandshake(e)),
            Ok(Ok(())) => {}
        }

        self.ctx.metrics.dc_connection(dc.id);
        self.ctx.metrics.connection_ok();
        self.established.store(true, Ordering::Relaxed);
        info!(
            "[session {}] relaying {} via {} ({})",
            self.id,
            hs.transport.name(),
            dc.label(),
            dc.location
        );

        Ok(Established {
            client,
            peer,
            codecs: SessionCodecs {
                client_decrypt: hs.decrypt,
                client_encrypt: hs.encrypt,
                peer_encrypt: peer_hs.encrypt,
                peer_decrypt: peer_hs.decrypt,
            },
            carry,
            dc_id: dc.id,
        })
    }

    /// Pool checkout with the configured dial-fallback walk.
    async fn connect_peer(
        &self,
        dc: &'static Datacenter,
    ) -> Result<(&'static Datacenter, TcpStream), SessionError> {
        let prefer_ipv6 = self.ctx.config.prefer_ipv6;
        let first_err = match self.ctx.pool.checkout(dc, prefer_ipv6).await {
            Ok(sock) => return Ok((dc, sock)),
            Err(e) => e,
        };
        if !self.ctx.config.allow_fallback {
            return Err(SessionError::PeerDial(first_err));
        }

        debug!("[session {}] dial to {} failed ({first_err}), walking fallbacks", self.id, dc.label());
        let mut last = first_err;
        for next in datacenter::fallback_order(dc.id) {
            match self.ctx.pool.checkout(next, prefer_ipv6).await {
                Ok(sock) => {
                    debug!("[session {}] fallback dial to {} succeeded", self.id, next.label());
                    return Ok((next, sock));
                }
                Err(e) => last = e,
            }
        }
        Err(SessionError::PeerDial(last))
    }
}

// ─── FakeTLS exchange ─────────────────────────────────────────────────────────

/// Consume the ClientHello, answer with the deterministic camouflage trio,
/// and pull the obfuscated2 frame out of the first ApplicationData record.
///
/// Returns the frame, the live record assembler, and any surplus payload
/// that arrived behind the frame (already de-framed, still obfuscated).
async fn faketls_exchange<S>(
    client: &mut S,
    first: [u8; HANDSHAKE_LEN],
    secret_key: &[u8; 16],
) -> Result<([u8; HANDSHAKE_LEN], RecordAssembler, BytesMut), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let header_bytes: [u8; faketls::RECORD_HEADER_LEN] =
        first[..faketls::RECORD_HEADER_LEN].try_into().expect("header slice");
    let header = faketls::parse_header(&header_bytes)?;
    let already = HANDSHAKE_LEN - faketls::RECORD_HEADER_LEN;
    if header.len < already {
        return Err(SessionError::FakeTlsFrame(FakeTlsError::MalformedHello));
    }

    let mut record = vec![0u8; header.len];
    record[..already].copy_from_slice(&first[faketls::RECORD_HEADER_LEN..]);
    read_exact_deadline(client, &mut record[already..])
        .await
        .map_err(SessionError::HandshakeRead)?;

    let hello = ClientHello::parse(&record)?;
    let response = faketls::camouflage_response(secret_key, &hello);
    match timeout(HANDSHAKE_TIMEOUT, client.write_all(&response)).await {
        Err(_) => {
            return Err(SessionError::HandshakeRead(io::Error::new(
                io::ErrorKind::TimedOut,
                "camouflage write timed out",
            )))
        }
        Ok(Err(e)) => return Err(SessionError::HandshakeRead(e)),
        Ok(Ok(())) => {}
    }

    // The client's first ApplicationData payload opens with the 64-byte
    // obfuscated2 frame.
    let mut asm = RecordAssembler::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(mut payload) = asm.pop()? {
            if payload.len() < HANDSHAKE_LEN {
                return Err(SessionError::FakeTlsFrame(FakeTlsError::ShortPayload(
                    payload.len(),
                )));
            }
            let leftover = payload.split_off(HANDSHAKE_LEN);
            let mut frame = [0u8; HANDSHAKE_LEN];
            frame.copy_from_slice(&payload);
            return Ok((frame, asm, leftover));
        }

        let n = match timeout(HANDSHAKE_TIMEOUT, client.read(&mut buf)).await {
            Err(_) => {
                return Err(SessionError::HandshakeRead(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "first ApplicationData record timed out",
                )))
            }
            Ok(Ok(0)) => {
                return Err(SessionError::HandshakeRead(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed before sending the frame",
                )))
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(SessionError::HandshakeRead(e)),
        };
        asm.push(&buf[..n]);
    }
}

async fn read_exact_deadline<S: AsyncRead + Unpin>(s: &mut S, buf: &mut [u8]) -> io::Result<()> {
    match timeout(HANDSHAKE_TIMEOUT, s.read_exact(buf)).await {
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "handshake read timed out",
        )),
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
    }
}
