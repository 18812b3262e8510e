//! Obfuscated2 stream cipher.
//!
//! The obfuscated2 envelope encrypts every byte on the wire with
//! AES-256-CTR.  Each connection direction owns one cipher state; the
//! keystream position only ever moves forward, so encrypt and decrypt are
//! the same XOR applied by two identically-seeded states.

use aes::Aes256;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};

// ─── ObfuscatedCipher ─────────────────────────────────────────────────────────

/// One direction of an obfuscated2 stream.
///
/// Wraps an AES-256-CTR state seeded from a 32-byte key and a 16-byte
/// initial counter block.  [`apply`](Self::apply) XORs the next keystream
/// bytes into the buffer; there is no rewind.
pub struct ObfuscatedCipher {
    inner: Ctr128BE<Aes256>,
}

impl ObfuscatedCipher {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self { inner: Ctr128BE::<Aes256>::new(key.into(), iv.into()) }
    }

    /// XOR `data` in place with the next `data.len()` keystream bytes.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}

// ─── Key mixing ───────────────────────────────────────────────────────────────

/// Mix a raw 32-byte stream key with the 16-byte proxy secret.
///
/// With a secret the key becomes `SHA-256(raw ‖ secret)`; without one the
/// raw key is used as-is.  The initial counter block is never mixed.
pub fn mix_key(raw: &[u8; 32], secret: Option<&[u8; 16]>) -> [u8; 32] {
    match secret {
        Some(s) => crate::sha256!(raw, s),
        None => *raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // AES-256-CTR vector from NIST SP 800-38A, F.5.5.
    const KEY: [u8; 32] = [
        0x60, 0x3d, 0xeb, 0x10, 0x15, 0xca, 0x71, 0xbe,
        0x2b, 0x73, 0xae, 0xf0, 0x85, 0x7d, 0x77, 0x81,
        0x1f, 0x35, 0x2c, 0x07, 0x3b, 0x61, 0x08, 0xd7,
        0x2d, 0x98, 0x10, 0xa3, 0x09, 0x14, 0xdf, 0xf4,
    ];
    const IV: [u8; 16] = [
        0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7,
        0xf8, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe, 0xff,
    ];

    #[test]
    fn ctr_known_answer() {
        let mut block = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96,
            0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17, 0x2a,
        ];
        let mut c = ObfuscatedCipher::new(&KEY, &IV);
        c.apply(&mut block);
        assert_eq!(
            block,
            [
                0x60, 0x1e, 0xc3, 0x13, 0x77, 0x57, 0x89, 0xa5,
                0xb7, 0xa7, 0xf5, 0x04, 0xbb, 0xf3, 0xd2, 0x28,
            ]
        );
    }

    #[test]
    fn roundtrip_with_twin_state() {
        let mut data = *b"the quick brown fox jumps over the lazy dog and keeps running..";
        let original = data;

        let mut enc = ObfuscatedCipher::new(&KEY, &IV);
        let mut dec = ObfuscatedCipher::new(&KEY, &IV);
        enc.apply(&mut data);
        assert_ne!(data, original);
        dec.apply(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn chunked_apply_matches_whole() {
        let mut whole = [0xabu8; 100];
        let mut chunked = [0xabu8; 100];

        let mut a = ObfuscatedCipher::new(&KEY, &IV);
        a.apply(&mut whole);

        let mut b = ObfuscatedCipher::new(&KEY, &IV);
        let (head, tail) = chunked.split_at_mut(37);
        b.apply(head);
        b.apply(tail);

        assert_eq!(whole, chunked, "keystream position must be monotone");
    }

    #[test]
    fn mix_key_with_secret_is_sha256() {
        let raw = [0x11u8; 32];
        let secret = [0x22u8; 16];
        assert_eq!(mix_key(&raw, Some(&secret)), crate::sha256!(&raw, &secret));
        assert_eq!(mix_key(&raw, None), raw);
    }
}
