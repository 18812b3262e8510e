//! The shared proxy secret.
//!
//! A secret is 16 key bytes plus an optional mode prefix in its hex wire
//! form: `ee` selects FakeTLS and is followed by the hex-encoded SNI host,
//! `dd` selects the secured (random-padded) mode, no prefix is the plain
//! obfuscated2 mode.

use std::fmt;

// ─── SecretTag ────────────────────────────────────────────────────────────────

/// The client-facing transport mode selected by the secret prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretTag {
    /// Plain obfuscated2, no prefix.
    Simple,
    /// `dd` prefix — obfuscated2 with random padding enforced by the client.
    Secured,
    /// `ee` prefix — obfuscated2 wrapped in TLS 1.2 records, camouflaged
    /// under the contained SNI host.
    FakeTls { sni: String },
}

// ─── Secret ───────────────────────────────────────────────────────────────────

/// The proxy's shared secret.  Immutable for the process lifetime.
///
/// The key is always exactly 16 bytes; constructors enforce this.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub key: [u8; 16],
    pub tag: SecretTag,
}

/// Errors from [`Secret::parse`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretError {
    /// The string is not valid hex.
    InvalidHex,
    /// Decoded secret shorter than the mode requires.
    TooShort { got: usize, need: usize },
    /// The SNI host bytes of an `ee` secret are not UTF-8.
    InvalidSni,
}

impl fmt::Display for SecretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHex => write!(f, "secret is not valid hex"),
            Self::TooShort { got, need } => {
                write!(f, "secret too short: {got} bytes, need at least {need}")
            }
            Self::InvalidSni => write!(f, "SNI host in secret is not valid UTF-8"),
        }
    }
}

impl std::error::Error for SecretError {}

impl Secret {
    /// Parse a hex wire-form secret.
    ///
    /// `ee` ‖ key ‖ host → FakeTLS; `dd` ‖ key → Secured; bare key → Simple.
    pub fn parse(hex_form: &str) -> Result<Self, SecretError> {
        let bytes = hex::decode(hex_form.trim()).map_err(|_| SecretError::InvalidHex)?;
        match bytes.first() {
            Some(0xee) => {
                if bytes.len() < 17 {
                    return Err(SecretError::TooShort { got: bytes.len(), need: 17 });
                }
                let mut key = [0u8; 16];
                key.copy_from_slice(&bytes[1..17]);
                let sni = String::from_utf8(bytes[17..].to_vec())
                    .map_err(|_| SecretError::InvalidSni)?;
                Ok(Self { key, tag: SecretTag::FakeTls { sni } })
            }
            Some(0xdd) => {
                if bytes.len() < 17 {
                    return Err(SecretError::TooShort { got: bytes.len(), need: 17 });
                }
                let mut key = [0u8; 16];
                key.copy_from_slice(&bytes[1..17]);
                Ok(Self { key, tag: SecretTag::Secured })
            }
            _ => {
                if bytes.len() < 16 {
                    return Err(SecretError::TooShort { got: bytes.len(), need: 16 });
                }
                let mut key = [0u8; 16];
                key.copy_from_slice(&bytes[..16]);
                Ok(Self { key, tag: SecretTag::Simple })
            }
        }
    }

    /// Generate a FakeTLS secret with a fresh random key.
    pub fn generate(sni: &str) -> Self {
        let mut key = [0u8; 16];
        getrandom::getrandom(&mut key).expect("OS randomness unavailable");
        Self { key, tag: SecretTag::FakeTls { sni: sni.to_owned() } }
    }

    /// The hex wire form, including the mode prefix and SNI host.
    pub fn to_hex(&self) -> String {
        match &self.tag {
            SecretTag::Simple => hex::encode(self.key),
            SecretTag::Secured => format!("dd{}", hex::encode(self.key)),
            SecretTag::FakeTls { sni } => {
                format!("ee{}{}", hex::encode(self.key), hex::encode(sni.as_bytes()))
            }
        }
    }

    /// The SNI host, for FakeTLS secrets.
    pub fn sni(&self) -> Option<&str> {
        match &self.tag {
            SecretTag::FakeTls { sni } => Some(sni),
            _ => None,
        }
    }

    /// The `tg://proxy` invite link clients use to add this proxy.
    pub fn invite_url(&self, host: &str, port: u16) -> String {
        format!("tg://proxy?server={host}&port={port}&secret={}", self.to_hex())
    }
}

/// Key material stays out of logs; only the mode is shown.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            SecretTag::Simple => write!(f, "Secret(simple)"),
            SecretTag::Secured => write!(f, "Secret(secured)"),
            SecretTag::FakeTls { sni } => write!(f, "Secret(faketls, sni={sni})"),
        }
    }
}
