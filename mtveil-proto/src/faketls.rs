//! FakeTLS record framing.
//!
//! Wraps the obfuscated2 stream in TLS 1.2 records so a passive observer
//! sees an ordinary HTTPS exchange: ClientHello in, ServerHello +
//! ChangeCipherSpec + ApplicationData out, then ApplicationData both ways.
//! The handshake is camouflage only — nothing is negotiated and no TLS
//! crypto runs; the record layer is framing around already-obfuscated
//! bytes.

use bytes::{Buf, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Record type byte, version word, big-endian payload length.
pub const RECORD_HEADER_LEN: usize = 5;

/// Maximum payload a single record may declare.
pub const MAX_RECORD_PAYLOAD: usize = 16 * 1024;

pub const CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const HANDSHAKE: u8 = 0x16;
pub const APPLICATION_DATA: u8 = 0x17;

const TLS12: [u8; 2] = [0x03, 0x03];

type HmacSha256 = Hmac<Sha256>;

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Malformed or out-of-place TLS records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeTlsError {
    /// Version word is not TLS 1.2.
    BadVersion([u8; 2]),
    /// Declared payload length beyond [`MAX_RECORD_PAYLOAD`].
    Oversized(usize),
    /// A record type that is not allowed at this point of the stream.
    UnexpectedRecord(u8),
    /// ClientHello payload too short or not a ClientHello.
    MalformedHello,
    /// First ApplicationData payload too short to hold a handshake frame.
    ShortPayload(usize),
}

impl std::fmt::Display for FakeTlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadVersion(v) => write!(f, "record version {:02x}{:02x} is not TLS 1.2", v[0], v[1]),
            Self::Oversized(n) => write!(f, "record declares {n} payload bytes (max {MAX_RECORD_PAYLOAD})"),
            Self::UnexpectedRecord(k) => write!(f, "unexpected record type 0x{k:02x}"),
            Self::MalformedHello => write!(f, "malformed ClientHello"),
            Self::ShortPayload(n) => {
                write!(f, "first ApplicationData payload is {n} bytes, need a 64-byte frame")
            }
        }
    }
}

impl std::error::Error for FakeTlsError {}

// ─── Record header ────────────────────────────────────────────────────────────

/// A validated record header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: u8,
    pub len: usize,
}

/// True if a connection prefix looks like a TLS 1.2 handshake record.
pub fn looks_like_tls(prefix: &[u8]) -> bool {
    prefix.len() >= 3 && prefix[0] == HANDSHAKE && prefix[1..3] == TLS12
}

/// Validate five header bytes.
pub fn parse_header(raw: &[u8; RECORD_HEADER_LEN]) -> Result<RecordHeader, FakeTlsError> {
    let kind = raw[0];
    if !matches!(kind, CHANGE_CIPHER_SPEC | HANDSHAKE | APPLICATION_DATA) {
        return Err(FakeTlsError::UnexpectedRecord(kind));
    }
    if raw[1..3] != TLS12 {
        return Err(FakeTlsError::BadVersion([raw[1], raw[2]]));
    }
    let len = u16::from_be_bytes([raw[3], raw[4]]) as usize;
    if len > MAX_RECORD_PAYLOAD {
        return Err(FakeTlsError::Oversized(len));
    }
    Ok(RecordHeader { kind, len })
}

fn record(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    out.push(kind);
    out.extend_from_slice(&TLS12);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

// ─── ClientHello ──────────────────────────────────────────────────────────────

/// The two ClientHello fields the camouflage needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientHello {
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
}

impl ClientHello {
    /// Extract random and session id from a Handshake record payload.
    pub fn parse(payload: &[u8]) -> Result<Self, FakeTlsError> {
        // msg type (1) + length (3) + version (2) + random (32) + sid len (1)
        if payload.len() < 39 || payload[0] != 0x01 {
            return Err(FakeTlsError::MalformedHello);
        }
        let mut random = [0u8; 32];
        random.copy_from_slice(&payload[6..38]);
        let sid_len = payload[38] as usize;
        if sid_len > 32 || payload.len() < 39 + sid_len {
            return Err(FakeTlsError::MalformedHello);
        }
        Ok(Self { random, session_id: payload[39..39 + sid_len].to_vec() })
    }
}

// ─── Server camouflage ────────────────────────────────────────────────────────

/// HMAC-SHA256 over the client random, keyed by the proxy secret.  Every
/// "random" field in the response comes from here so the reply is
/// bit-reproducible for a given client.
fn derive(secret_key: &[u8; 16], client_random: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(secret_key).expect("HMAC accepts any key length");
    mac.update(client_random);
    mac.update(label);
    mac.finalize().into_bytes().into()
}

/// Build the canned ServerHello + ChangeCipherSpec + ApplicationData trio.
pub fn camouflage_response(secret_key: &[u8; 16], hello: &ClientHello) -> Vec<u8> {
    let server_random = derive(secret_key, &hello.random, b"server hello random");
    let key_share = derive(secret_key, &hello.random, b"key share");

    // ServerHello for a TLS 1.3 session in 1.2 compatibility records:
    // x25519 key share, TLS_AES_128_GCM_SHA256, supported_versions 1.3.
    let mut body = Vec::with_capacity(128);
    body.extend_from_slice(&TLS12);
    body.extend_from_slice(&server_random);
    body.push(hello.session_id.len() as u8);
    body.extend_from_slice(&hello.session_id);
    body.extend_from_slice(&[0x13, 0x01]); // cipher suite
    body.push(0x00); // null compression

    let mut exts = Vec::with_capacity(48);
    exts.extend_from_slice(&[0x00, 0x2b, 0x00, 0x02, 0x03, 0x04]); // supported_versions: 1.3
    exts.extend_from_slice(&[0x00, 0x33, 0x00, 0x24, 0x00, 0x1d, 0x00, 0x20]); // key_share: x25519
    exts.extend_from_slice(&key_share);
    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut msg = Vec::with_capacity(4 + body.len());
    msg.push(0x02); // ServerHello
    msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    msg.extend_from_slice(&body);

    // Opaque bytes standing in for the encrypted server handshake tail.
    let tail_seed = derive(secret_key, &hello.random, b"application data");
    let tail_len = 128 + (tail_seed[0] as usize) * 2;
    let mut tail = Vec::with_capacity(tail_len + 32);
    let mut block = tail_seed;
    while tail.len() < tail_len {
        block = derive(secret_key, &hello.random, &block);
        tail.extend_from_slice(&block);
    }
    tail.truncate(tail_len);

    let mut out = record(HANDSHAKE, &msg);
    out.extend_from_slice(&record(CHANGE_CIPHER_SPEC, &[0x01]));
    out.extend_from_slice(&record(APPLICATION_DATA, &tail));
    out
}

// ─── RecordAssembler ──────────────────────────────────────────────────────────

/// Incremental ApplicationData extraction from a record stream.
///
/// Partial records stay buffered until the rest arrives.  ChangeCipherSpec
/// records are skipped; Handshake records after the hello exchange are an
/// error.
#[derive(Default)]
pub struct RecordAssembler {
    buf: BytesMut,
}

impl RecordAssembler {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(2 * MAX_RECORD_PAYLOAD) }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next complete ApplicationData payload, or `None` until one is
    /// fully buffered.
    pub fn pop(&mut self) -> Result<Option<BytesMut>, FakeTlsError> {
        loop {
            if self.buf.len() < RECORD_HEADER_LEN {
                return Ok(None);
            }
            let raw: [u8; RECORD_HEADER_LEN] =
                self.buf[..RECORD_HEADER_LEN].try_into().expect("header slice");
            let header = parse_header(&raw)?;
            if self.buf.len() < RECORD_HEADER_LEN + header.len {
                return Ok(None);
            }
            match header.kind {
                CHANGE_CIPHER_SPEC => {
                    self.buf.advance(RECORD_HEADER_LEN + header.len);
                }
                APPLICATION_DATA => {
                    self.buf.advance(RECORD_HEADER_LEN);
                    return Ok(Some(self.buf.split_to(header.len)));
                }
                other => return Err(FakeTlsError::UnexpectedRecord(other)),
            }
        }
    }
}

/// Wrap a payload in ApplicationData records of at most 16 KiB each.
pub fn frame_application_data(payload: &[u8]) -> Vec<u8> {
    let records = payload.len().div_ceil(MAX_RECORD_PAYLOAD).max(1);
    let mut out = Vec::with_capacity(payload.len() + records * RECORD_HEADER_LEN);
    if payload.is_empty() {
        return out;
    }
    for chunk in payload.chunks(MAX_RECORD_PAYLOAD) {
        out.push(APPLICATION_DATA);
        out.extend_from_slice(&TLS12);
        out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        out.extend_from_slice(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(kind: u8, len: u16) -> [u8; 5] {
        let l = len.to_be_bytes();
        [kind, 0x03, 0x03, l[0], l[1]]
    }

    #[test]
    fn header_parse_accepts_application_data() {
        let h = parse_header(&header_bytes(APPLICATION_DATA, 1024)).unwrap();
        assert_eq!(h, RecordHeader { kind: APPLICATION_DATA, len: 1024 });
    }

    #[test]
    fn header_parse_rejects_oversized_declared_length() {
        // 17 KiB declared payload
        let err = parse_header(&header_bytes(APPLICATION_DATA, 17 * 1024)).unwrap_err();
        assert_eq!(err, FakeTlsError::Oversized(17 * 1024));
    }

    #[test]
    fn header_parse_rejects_wrong_version_and_kind() {
        assert_eq!(
            parse_header(&[0x17, 0x03, 0x01, 0x00, 0x10]),
            Err(FakeTlsError::BadVersion([0x03, 0x01]))
        );
        assert_eq!(
            parse_header(&[0x15, 0x03, 0x03, 0x00, 0x10]),
            Err(FakeTlsError::UnexpectedRecord(0x15))
        );
    }

    fn sample_hello() -> Vec<u8> {
        let mut p = vec![0x01];
        p.extend_from_slice(&[0x00, 0x00, 0x67]); // length, unchecked
        p.extend_from_slice(&TLS12);
        p.extend_from_slice(&[0x5a; 32]); // random
        p.push(4);
        p.extend_from_slice(&[9, 8, 7, 6]); // session id
        p.extend_from_slice(&[0x00; 8]); // trailing fields, ignored
        p
    }

    #[test]
    fn client_hello_extracts_random_and_session_id() {
        let hello = ClientHello::parse(&sample_hello()).unwrap();
        assert_eq!(hello.random, [0x5a; 32]);
        assert_eq!(hello.session_id, [9, 8, 7, 6]);
    }

    #[test]
    fn client_hello_rejects_non_hello() {
        let mut p = sample_hello();
        p[0] = 0x02;
        assert_eq!(ClientHello::parse(&p), Err(FakeTlsError::MalformedHello));
        assert_eq!(ClientHello::parse(&[0x01, 0x00]), Err(FakeTlsError::MalformedHello));
    }

    #[test]
    fn camouflage_is_deterministic_per_client() {
        let key = [7u8; 16];
        let hello = ClientHello::parse(&sample_hello()).unwrap();
        let a = camouflage_response(&key, &hello);
        let b = camouflage_response(&key, &hello);
        assert_eq!(a, b);

        let mut other = hello.clone();
        other.random[0] ^= 1;
        assert_ne!(camouflage_response(&key, &other), a);
    }

    #[test]
    fn camouflage_is_a_hello_ccs_appdata_trio() {
        let key = [7u8; 16];
        let hello = ClientHello::parse(&sample_hello()).unwrap();
        let out = camouflage_response(&key, &hello);

        // ServerHello record
        let h1 = parse_header(&out[..5].try_into().unwrap()).unwrap();
        assert_eq!(h1.kind, HANDSHAKE);
        assert_eq!(out[5], 0x02, "ServerHello message type");
        // session id echoed
        let sid_len = out[5 + 4 + 2 + 32] as usize;
        assert_eq!(sid_len, hello.session_id.len());

        // ChangeCipherSpec record
        let ccs_at = 5 + h1.len;
        let h2 = parse_header(&out[ccs_at..ccs_at + 5].try_into().unwrap()).unwrap();
        assert_eq!((h2.kind, h2.len), (CHANGE_CIPHER_SPEC, 1));

        // ApplicationData record closes the trio
        let app_at = ccs_at + 5 + h2.len;
        let h3 = parse_header(&out[app_at..app_at + 5].try_into().unwrap()).unwrap();
        assert_eq!(h3.kind, APPLICATION_DATA);
        assert_eq!(out.len(), app_at + 5 + h3.len);
    }

    #[test]
    fn assembler_buffers_partial_records() {
        let mut asm = RecordAssembler::new();
        let rec = frame_application_data(b"hello relay");

        asm.push(&rec[..3]);
        assert_eq!(asm.pop().unwrap(), None);
        asm.push(&rec[3..7]);
        assert_eq!(asm.pop().unwrap(), None);
        asm.push(&rec[7..]);
        assert_eq!(asm.pop().unwrap().as_deref(), Some(b"hello relay".as_ref()));
        assert_eq!(asm.pop().unwrap(), None);
    }

    #[test]
    fn assembler_skips_ccs_and_rejects_mid_session_handshake() {
        let mut asm = RecordAssembler::new();
        asm.push(&record(CHANGE_CIPHER_SPEC, &[0x01]));
        asm.push(&frame_application_data(b"x"));
        assert_eq!(asm.pop().unwrap().as_deref(), Some(b"x".as_ref()));

        asm.push(&record(HANDSHAKE, &[0x0b, 0x00, 0x00, 0x00]));
        assert_eq!(asm.pop(), Err(FakeTlsError::UnexpectedRecord(HANDSHAKE)));
    }

    #[test]
    fn framing_splits_at_record_ceiling() {
        let payload = vec![0x33u8; 40 * 1024];
        let framed = frame_application_data(&payload);

        let mut asm = RecordAssembler::new();
        asm.push(&framed);
        let mut total = Vec::new();
        let mut count = 0;
        while let Some(p) = asm.pop().unwrap() {
            assert!(p.len() <= MAX_RECORD_PAYLOAD);
            total.extend_from_slice(&p);
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(total, payload);
    }
}
