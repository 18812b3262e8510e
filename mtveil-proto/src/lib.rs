//! Protocol layer for the mtveil MTProto proxy.
//!
//! Provides:
//! - `Secret` — the shared proxy secret in its `ee`/`dd`/plain wire forms
//! - the static Telegram datacenter address table
//! - the obfuscated2 handshake codec (client-side parse, peer-side build)
//! - FakeTLS: TLS 1.2 record framing around the obfuscated stream

#![deny(unsafe_code)]

pub mod datacenter;
pub mod faketls;
pub mod handshake;
pub mod secret;

pub use datacenter::Datacenter;
pub use handshake::{ClientHandshake, PeerHandshake, TransportTag, HANDSHAKE_LEN};
pub use secret::{Secret, SecretTag};
