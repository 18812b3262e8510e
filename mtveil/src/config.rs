//! Environment configuration.
//!
//! Everything is optional: with no environment at all the proxy binds
//! `:443`, generates a fresh FakeTLS secret camouflaged as `google.com`,
//! and prints the invite URL.

use std::fmt;
use std::net::SocketAddr;

use mtveil_proto::Secret;
use mtveil_proto::secret::SecretError;

use crate::pool::DEFAULT_CAPACITY;

/// Default SNI host for generated secrets.
const DEFAULT_SNI: &str = "google.com";

// ─── Config ───────────────────────────────────────────────────────────────────

/// Process configuration, resolved once at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    pub secret: Secret,
    /// Host used in the printed invite URL, when known.
    pub advertised_host: Option<String>,
    pub prefer_ipv6: bool,
    pub antireplay_mib: usize,
    pub allow_fallback: bool,
    pub max_sessions: usize,
    pub pool_size: usize,
    /// Out-of-band middleproxy secret for upstream key mixing.
    pub upstream_secret: Option<[u8; 16]>,
}

/// Errors from [`Config::from_env`].
#[derive(Debug)]
pub enum ConfigError {
    BadAddr { name: &'static str, value: String },
    BadSecret(SecretError),
    BadNumber { name: &'static str, value: String },
    BadChoice { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAddr { name, value } => write!(f, "{name}: `{value}` is not a listen address"),
            Self::BadSecret(e) => write!(f, "SECRET: {e}"),
            Self::BadNumber { name, value } => write!(f, "{name}: `{value}` is not a number"),
            Self::BadChoice { name, value } => write!(f, "{name}: unrecognized value `{value}`"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<SecretError> for ConfigError {
    fn from(e: SecretError) -> Self {
        Self::BadSecret(e)
    }
}

impl Config {
    /// Resolve from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = parse_addr("BIND_ADDR", get("BIND_ADDR").as_deref().unwrap_or(":443"))?;
        let metrics_addr =
            parse_addr("METRICS_ADDR", get("METRICS_ADDR").as_deref().unwrap_or(":8080"))?;

        let sni = get("SNI_DOMAIN").unwrap_or_else(|| DEFAULT_SNI.to_owned());
        let secret = match get("SECRET") {
            Some(hex_form) => Secret::parse(&hex_form)?,
            None => Secret::generate(&sni),
        };

        let prefer_ipv6 = match get("PREFER_IP").as_deref() {
            None | Some("prefer-ipv6") => true,
            Some("prefer-ipv4") => false,
            Some(other) => {
                return Err(ConfigError::BadChoice { name: "PREFER_IP", value: other.to_owned() })
            }
        };

        let upstream_secret = match get("UPSTREAM_SECRET") {
            None => None,
            Some(hex_form) => {
                let bytes = hex::decode(hex_form.trim())
                    .map_err(|_| ConfigError::BadSecret(SecretError::InvalidHex))?;
                let key: [u8; 16] = bytes.try_into().map_err(|_| {
                    ConfigError::BadSecret(SecretError::TooShort { got: 0, need: 16 })
                })?;
                Some(key)
            }
        };

        Ok(Self {
            bind_addr,
            metrics_addr,
            secret,
            advertised_host: get("ADVERTISED_HOST"),
            prefer_ipv6,
            antireplay_mib: parse_number(&get, "ANTIREPLAY_MB", 64)?,
            allow_fallback: parse_flag(&get, "ALLOW_FALLBACK", false)?,
            max_sessions: parse_number(&get, "MAX_SESSIONS", 10_000)?,
            pool_size: parse_number(&get, "POOL_SIZE", DEFAULT_CAPACITY)?,
            upstream_secret,
        })
    }

    /// The invite URL to print at startup, if a host is known.
    pub fn invite_url(&self) -> Option<String> {
        let host = self.advertised_host.as_deref()?;
        Some(self.secret.invite_url(host, self.bind_addr.port()))
    }
}

/// `":443"` means all interfaces; anything else must parse as a socket
/// address.
fn parse_addr(name: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    let full = if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_owned()
    };
    full.parse().map_err(|_| ConfigError::BadAddr { name, value: value.to_owned() })
}

fn parse_number(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::BadNumber { name, value: v }),
    }
}

fn parse_flag(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(name).as_deref() {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::BadChoice { name, value: other.to_owned() }),
    }
}
