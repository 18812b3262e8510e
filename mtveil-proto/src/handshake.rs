//! Obfuscated2 handshake codec.
//!
//! The first 64 bytes of every connection carry the stream-cipher keys and,
//! encrypted in their last 8 bytes, the transport tag plus target
//! datacenter.  This module parses that frame on the client side of the
//! proxy and builds a fresh one for the peer side.
//!
//! [Transport obfuscation]: https://core.telegram.org/mtproto/mtproto-transports#transport-obfuscation

use mtveil_crypto::{ObfuscatedCipher, mix_key};

use crate::secret::Secret;

/// Length of the obfuscated2 handshake frame.
pub const HANDSHAKE_LEN: usize = 64;

/// Plaintext prefixes of protocols a handshake must never look like.
const OBVIOUS_PREFIXES: [[u8; 4]; 5] = [
    [0xef, 0xef, 0xef, 0xef],     // abridged transport
    [0xee, 0xee, 0xee, 0xee],     // intermediate transport
    [b'G', b'E', b'T', b' '],
    [b'P', b'O', b'S', b'T'],
    [b'H', b'E', b'A', b'D'],
];

/// True if the frame starts like a known non-MTProto protocol.
fn is_obvious(frame: &[u8; HANDSHAKE_LEN]) -> bool {
    let prefix: [u8; 4] = frame[..4].try_into().expect("4-byte slice");
    OBVIOUS_PREFIXES.contains(&prefix) || frame[..8] == [0u8; 8]
}

// ─── TransportTag ─────────────────────────────────────────────────────────────

/// The inner MTProto framing the client selected.  Opaque to the proxy —
/// only the tag itself is inspected, the framed stream is relayed as-is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportTag {
    Abridged,
    Intermediate,
    PaddedIntermediate,
    Full,
}

impl TransportTag {
    /// Decode the 4-byte tag from the decrypted handshake tail.
    pub fn from_wire(tag: [u8; 4]) -> Option<Self> {
        match tag {
            [0xef, 0xef, 0xef, 0xef] => Some(Self::Abridged),
            [0xee, 0xee, 0xee, 0xee] => Some(Self::Intermediate),
            [0xdd, 0xdd, 0xdd, 0xdd] => Some(Self::PaddedIntermediate),
            [0x00, 0x00, 0x00, 0x00] => Some(Self::Full),
            _ => None,
        }
    }

    pub fn to_wire(self) -> [u8; 4] {
        match self {
            Self::Abridged => [0xef; 4],
            Self::Intermediate => [0xee; 4],
            Self::PaddedIntermediate => [0xdd; 4],
            Self::Full => [0x00; 4],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Abridged => "abridged",
            Self::Intermediate => "intermediate",
            Self::PaddedIntermediate => "padded-intermediate",
            Self::Full => "full",
        }
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Errors from [`ClientHandshake::parse`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeError {
    /// The frame starts like plain HTTP or an unobfuscated MTProto transport.
    ObviousMarker,
    /// The decrypted transport tag is not in the accepted set.
    UnknownTransport([u8; 4]),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObviousMarker => write!(f, "handshake matches a known plaintext protocol"),
            Self::UnknownTransport(tag) => {
                write!(f, "unknown transport tag {:02x}{:02x}{:02x}{:02x}", tag[0], tag[1], tag[2], tag[3])
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

// ─── Key derivation ───────────────────────────────────────────────────────────

/// Split `frame[8..56]` into a 32-byte key and 16-byte counter block,
/// forward for one direction and reversed for the other, and mix the key
/// with the secret.
fn derive_pair(
    frame: &[u8; HANDSHAKE_LEN],
    secret: Option<&[u8; 16]>,
) -> (ObfuscatedCipher, ObfuscatedCipher) {
    let mut fwd_key = [0u8; 32];
    let mut fwd_iv = [0u8; 16];
    fwd_key.copy_from_slice(&frame[8..40]);
    fwd_iv.copy_from_slice(&frame[40..56]);

    let mut rev = [0u8; 48];
    rev.copy_from_slice(&frame[8..56]);
    rev.reverse();
    let mut rev_key = [0u8; 32];
    let mut rev_iv = [0u8; 16];
    rev_key.copy_from_slice(&rev[..32]);
    rev_iv.copy_from_slice(&rev[32..]);

    let forward = ObfuscatedCipher::new(&mix_key(&fwd_key, secret), &fwd_iv);
    let reverse = ObfuscatedCipher::new(&mix_key(&rev_key, secret), &rev_iv);
    (forward, reverse)
}

// ─── ClientHandshake ──────────────────────────────────────────────────────────

/// The parsed client handshake: both direction ciphers plus the routing
/// information that was encrypted in the frame tail.
///
/// `decrypt` comes out positioned past the 64-byte frame, ready for the
/// first payload byte; `encrypt` starts at keystream position 0 because
/// nothing has been sent to the client yet.
pub struct ClientHandshake {
    /// Decrypts bytes arriving from the client.
    pub decrypt: ObfuscatedCipher,
    /// Encrypts bytes going back to the client.
    pub encrypt: ObfuscatedCipher,
    pub transport: TransportTag,
    /// Raw signed id as sent by the client; range-checking is the caller's
    /// job so that out-of-range ids can fall back instead of failing here.
    pub dc_id: i16,
}

impl ClientHandshake {
    /// Recover ciphers, transport tag and DC id from a client frame.
    ///
    /// The client derives its encrypt key from `frame[8..56]` and its
    /// decrypt key from the byte-reversed span, each mixed with the proxy
    /// secret via SHA-256.  Seen from the proxy the roles swap: forward is
    /// our decrypt direction, reversed is our encrypt direction.
    pub fn parse(
        frame: &[u8; HANDSHAKE_LEN],
        secret: &Secret,
    ) -> Result<Self, HandshakeError> {
        if is_obvious(frame) {
            return Err(HandshakeError::ObviousMarker);
        }

        let (mut decrypt, encrypt) = derive_pair(frame, Some(&secret.key));

        // The tail was encrypted at keystream positions 56..64, so run the
        // whole frame through and keep only the tail plaintext.  This also
        // leaves `decrypt` aligned with the client's cipher for payload.
        // `encrypt` stays at position 0: the client's inbound keystream
        // starts with the first byte the proxy sends.
        let mut plain = *frame;
        decrypt.apply(&mut plain);

        let tag: [u8; 4] = plain[56..60].try_into().expect("4-byte slice");
        let transport =
            TransportTag::from_wire(tag).ok_or(HandshakeError::UnknownTransport(tag))?;
        let dc_id = i16::from_le_bytes([plain[60], plain[61]]);
        log::debug!("[handshake] client selected {} to DC{}", transport.name(), dc_id);

        Ok(Self { decrypt, encrypt, transport, dc_id })
    }
}

// ─── PeerHandshake ────────────────────────────────────────────────────────────

/// A freshly built handshake for the upstream connection.
///
/// The proxy always selects the padded-intermediate transport upstream and
/// re-encodes the datacenter id the client asked for.
pub struct PeerHandshake {
    /// The 64 bytes to send to the peer, tail already encrypted.
    pub frame: [u8; HANDSHAKE_LEN],
    /// Encrypts bytes going to the peer.  Positioned past the frame.
    pub encrypt: ObfuscatedCipher,
    /// Decrypts bytes arriving from the peer.
    pub decrypt: ObfuscatedCipher,
}

impl PeerHandshake {
    /// Build a new upstream handshake selecting `dc_id`.
    ///
    /// `upstream_secret` is the out-of-band middleproxy secret; without one
    /// the stream keys are used unmixed.
    pub fn generate(dc_id: i16, upstream_secret: Option<&[u8; 16]>) -> Self {
        let mut frame = [0u8; HANDSHAKE_LEN];
        loop {
            getrandom::getrandom(&mut frame).expect("OS randomness unavailable");
            // Resample anything a DPI box could classify at a glance.  The
            // first-byte check also keeps us clear of the single-byte
            // abridged marker.
            if frame[0] != 0xef && !is_obvious(&frame) && frame[4..8] != [0u8; 4] {
                break;
            }
        }

        frame[56..60].copy_from_slice(&TransportTag::PaddedIntermediate.to_wire());
        frame[60..62].copy_from_slice(&dc_id.to_le_bytes());

        // Toward the peer we are the client: forward span keys our encrypt
        // direction, reversed span our decrypt direction.
        let (mut encrypt, decrypt) = derive_pair(&frame, upstream_secret);

        let mut sealed = frame;
        encrypt.apply(&mut sealed);
        frame[56..64].copy_from_slice(&sealed[56..64]);

        Self { frame, encrypt, decrypt }
    }
}
