//! Cryptographic primitives for the mtveil MTProto proxy.
//!
//! Provides:
//! - `ObfuscatedCipher` — the AES-256-CTR keystream used by the
//!   obfuscated2 transport envelope
//! - SHA-256 hash macro
//! - proxy-secret key mixing

#![deny(unsafe_code)]

mod obfuscated;
mod sha;

pub use obfuscated::{ObfuscatedCipher, mix_key};
