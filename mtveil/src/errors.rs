//! Error types for the proxy core.
//!
//! Every way a session can die maps onto one `errors_total` label; nothing
//! is ever reported back to the client, which only sees a TCP close.

use std::{fmt, io};

use mtveil_proto::faketls::FakeTlsError;
use mtveil_proto::handshake::HandshakeError;

// ─── SessionError ─────────────────────────────────────────────────────────────

/// Why a session ended before completing, one variant per counter label.
#[derive(Debug)]
pub enum SessionError {
    /// Client closed or stalled before delivering the 64-byte handshake.
    HandshakeRead(io::Error),
    /// Handshake matched a known plaintext protocol prefix.
    ObviousMarker,
    /// Decrypted transport tag not in the accepted set.
    UnknownTransport([u8; 4]),
    /// Decrypted DC id outside 1..=5 and fallback disabled.
    UnknownDc(i16),
    /// The handshake fingerprint was seen recently.
    Replay,
    /// Every dial candidate failed.
    PeerDial(io::Error),
    /// The upstream refused our handshake bytes.
    PeerHandshake(io::Error),
    /// Malformed TLS record on a FakeTLS session.
    FakeTlsFrame(FakeTlsError),
    /// Read/write failure after the relay began.
    RelayIo(io::Error),
}

impl SessionError {
    /// The `errors_total{kind=…}` label for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HandshakeRead(_) => "handshake_read",
            Self::ObviousMarker => "obvious_marker",
            Self::UnknownTransport(_) => "unknown_transport",
            Self::UnknownDc(_) => "unknown_dc",
            Self::Replay => "replay",
            Self::PeerDial(_) => "peer_dial",
            Self::PeerHandshake(_) => "peer_handshake",
            Self::FakeTlsFrame(_) => "faketls_frame",
            Self::RelayIo(_) => "relay_io",
        }
    }

}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeRead(e) => write!(f, "handshake read failed: {e}"),
            Self::ObviousMarker => write!(f, "handshake matches a plaintext protocol"),
            Self::UnknownTransport(tag) => write!(
                f,
                "unknown transport tag {:02x}{:02x}{:02x}{:02x}",
                tag[0], tag[1], tag[2], tag[3]
            ),
            Self::UnknownDc(id) => write!(f, "datacenter id {id} out of range"),
            Self::Replay => write!(f, "handshake replayed within the TTL window"),
            Self::PeerDial(e) => write!(f, "all datacenter dials failed: {e}"),
            Self::PeerHandshake(e) => write!(f, "upstream rejected the handshake: {e}"),
            Self::FakeTlsFrame(e) => write!(f, "TLS framing error: {e}"),
            Self::RelayIo(e) => write!(f, "relay I/O error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<HandshakeError> for SessionError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::ObviousMarker => Self::ObviousMarker,
            HandshakeError::UnknownTransport(tag) => Self::UnknownTransport(tag),
        }
    }
}

impl From<FakeTlsError> for SessionError {
    fn from(e: FakeTlsError) -> Self {
        Self::FakeTlsFrame(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_the_metric_labels() {
        let samples = [
            (SessionError::ObviousMarker, "obvious_marker"),
            (SessionError::Replay, "replay"),
            (SessionError::UnknownDc(42), "unknown_dc"),
            (SessionError::RelayIo(io::Error::other("x")), "relay_io"),
        ];
        for (err, label) in samples {
            assert_eq!(err.kind(), label);
        }
    }
}
