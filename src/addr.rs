//! RTMP endpoint addresses
//!
//! Accepts loosely written endpoints and fills in whatever is missing:
//!
//! ```text
//! rtmp://example.com:1935/live/my_key   full form
//! example.com/live                      scheme, port and key defaulted
//! localhost:                            everything but the host defaulted
//! :1935                                 host defaulted
//! ```
//!
//! A missing key is replaced by a freshly generated one, so two parses of the
//! same keyless string yield different addresses.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use thiserror::Error;

use crate::registry::StreamKey;

/// Scheme used when the input has none
pub const DEFAULT_SCHEME: &str = "rtmp";
/// Host used when the input has none
pub const DEFAULT_HOST: &str = "localhost";
/// Port used when the input has none
pub const DEFAULT_PORT: &str = "1935";
/// Application name used when the input has none
pub const DEFAULT_APP: &str = "live";
/// Prefix of generated stream keys
pub const GENERATED_KEY_PREFIX: &str = "stream-";
/// Number of random characters in a generated key
pub const GENERATED_KEY_LEN: usize = 12;

const KEY_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Address parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    /// More than host/app/key path segments
    #[error("too many path segments in {0:?} (expected at most host/app/key)")]
    TooManySegments(String),

    /// Port is not a number in 0..=65535
    #[error("invalid port {port:?} in {raw:?}")]
    InvalidPort { raw: String, port: String },

    /// Scheme contains characters other than letters, digits, `+`, `-`, `.`
    #[error("invalid scheme {scheme:?} in {raw:?}")]
    InvalidScheme { raw: String, scheme: String },

    /// Unterminated `[` in an IPv6 host
    #[error("invalid host in {0:?}")]
    InvalidHost(String),
}

/// A parsed, fully defaulted RTMP address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    raw: String,
    scheme: String,
    host: String,
    app: String,
    key: String,
}

impl Addr {
    /// Parse an address string, applying defaults for missing pieces
    pub fn parse(raw: &str) -> Result<Self, AddrError> {
        let input = raw.trim();

        let (scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() => {
                if !scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                {
                    return Err(AddrError::InvalidScheme {
                        raw: raw.to_string(),
                        scheme: scheme.to_string(),
                    });
                }
                (scheme.to_ascii_lowercase(), rest)
            }
            Some((_, rest)) => (DEFAULT_SCHEME.to_string(), rest),
            None => (DEFAULT_SCHEME.to_string(), input),
        };

        let path = rest.trim_end_matches('/');
        let segments: Vec<&str> = if path.is_empty() {
            Vec::new()
        } else {
            path.split('/').collect()
        };

        if segments.len() > 3 {
            return Err(AddrError::TooManySegments(raw.to_string()));
        }

        let host = normalize_host(raw, segments.first().copied().unwrap_or(""))?;

        let app = match segments.get(1) {
            Some(app) if !app.is_empty() => app.to_string(),
            _ => DEFAULT_APP.to_string(),
        };

        let key = match segments.get(2) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => generate_key(),
        };

        Ok(Self {
            raw: raw.to_string(),
            scheme,
            host,
            app,
            key,
        })
    }

    /// The original input string
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Scheme without the `://` separator
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// `host:port`, suitable for binding or dialing
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Application name (first path segment)
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Stream key (second path segment)
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `scheme://host:port/app`, the `tcUrl` sent in connect
    pub fn tc_url(&self) -> String {
        format!("{}://{}/{}", self.scheme, self.host, self.app)
    }

    /// Full `scheme://host:port/app/key` URL
    pub fn stream_url(&self) -> String {
        format!("{}://{}/{}/{}", self.scheme, self.host, self.app, self.key)
    }

    /// Registry key for the stream this address names
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.app.clone(), self.key.clone())
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stream_url())
    }
}

impl FromStr for Addr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Fill in a missing host and/or port independently
fn normalize_host(raw: &str, segment: &str) -> Result<String, AddrError> {
    let (host, port) = if let Some(bracketed) = segment.strip_prefix('[') {
        let (inner, after) = bracketed
            .split_once(']')
            .ok_or_else(|| AddrError::InvalidHost(raw.to_string()))?;
        let port = match after {
            "" => "",
            p => p
                .strip_prefix(':')
                .ok_or_else(|| AddrError::InvalidHost(raw.to_string()))?,
        };
        (format!("[{inner}]"), port)
    } else {
        match segment.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port),
            None => (segment.to_string(), ""),
        }
    };

    let host = if host.is_empty() {
        DEFAULT_HOST.to_string()
    } else {
        host
    };

    let port = if port.is_empty() { DEFAULT_PORT } else { port };
    if port.parse::<u16>().is_err() {
        return Err(AddrError::InvalidPort {
            raw: raw.to_string(),
            port: port.to_string(),
        });
    }

    Ok(format!("{host}:{port}"))
}

/// Generate a random stream key
pub fn generate_key() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..GENERATED_KEY_LEN)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect();
    format!("{GENERATED_KEY_PREFIX}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_generated(key: &str) -> bool {
        key.strip_prefix(GENERATED_KEY_PREFIX)
            .map(|s| s.len() == GENERATED_KEY_LEN && s.bytes().all(|b| KEY_ALPHABET.contains(&b)))
            .unwrap_or(false)
    }

    #[test]
    fn test_full_address() {
        let addr = Addr::parse("rtmp://host:1935/app/key").unwrap();

        assert_eq!(addr.scheme(), "rtmp");
        assert_eq!(addr.host(), "host:1935");
        assert_eq!(addr.app(), "app");
        assert_eq!(addr.key(), "key");
        assert_eq!(addr.stream_url(), "rtmp://host:1935/app/key");
        assert_eq!(addr.tc_url(), "rtmp://host:1935/app");
    }

    #[test]
    fn test_host_port_shorthands() {
        for raw in ["localhost:", ":1935", ":", "localhost", ""] {
            let addr = Addr::parse(raw).unwrap();
            assert_eq!(addr.host(), "localhost:1935", "input {raw:?}");
            assert_eq!(addr.scheme(), DEFAULT_SCHEME);
            assert_eq!(addr.app(), DEFAULT_APP);
            assert!(is_generated(addr.key()), "key {:?}", addr.key());
        }
    }

    #[test]
    fn test_host_and_port_defaulted_independently() {
        assert_eq!(Addr::parse("example.com:").unwrap().host(), "example.com:1935");
        assert_eq!(Addr::parse(":8080").unwrap().host(), "localhost:8080");
        assert_eq!(Addr::parse("rtmp://:1940/a/b").unwrap().host(), "localhost:1940");
    }

    #[test]
    fn test_segment_counts() {
        let one = Addr::parse("rtmp://example.com:1935").unwrap();
        assert_eq!(one.app(), DEFAULT_APP);
        assert!(is_generated(one.key()));

        let two = Addr::parse("example.com:1935/show").unwrap();
        assert_eq!(two.host(), "example.com:1935");
        assert_eq!(two.app(), "show");
        assert!(is_generated(two.key()));

        let three = Addr::parse("example.com/show/abc").unwrap();
        assert_eq!(three.host(), "example.com:1935");
        assert_eq!(three.key(), "abc");
    }

    #[test]
    fn test_too_many_segments_rejected() {
        let err = Addr::parse("rtmp://host:1935/app/key/extra").unwrap_err();
        assert!(matches!(err, AddrError::TooManySegments(_)));
    }

    #[test]
    fn test_trailing_slash_and_empty_segments() {
        let addr = Addr::parse("rtmp://host:1935/app/").unwrap();
        assert_eq!(addr.app(), "app");
        assert!(is_generated(addr.key()));

        let addr = Addr::parse("host//key").unwrap();
        assert_eq!(addr.app(), DEFAULT_APP);
        assert_eq!(addr.key(), "key");
    }

    #[test]
    fn test_invalid_port() {
        let err = Addr::parse("rtmp://host:99999/app/key").unwrap_err();
        assert!(matches!(err, AddrError::InvalidPort { .. }));
    }

    #[test]
    fn test_ipv6_host() {
        let addr = Addr::parse("rtmp://[::1]:1936/app/key").unwrap();
        assert_eq!(addr.host(), "[::1]:1936");

        let addr = Addr::parse("[::1]/app").unwrap();
        assert_eq!(addr.host(), "[::1]:1935");

        assert!(matches!(
            Addr::parse("[::1:1935/app"),
            Err(AddrError::InvalidHost(_))
        ));
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = Addr::parse("localhost").unwrap();
        let b = Addr::parse("localhost").unwrap();
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_from_str_and_display() {
        let addr: Addr = "rtmps://cdn.example.com:443/live2/k".parse().unwrap();
        assert_eq!(addr.scheme(), "rtmps");
        assert_eq!(addr.to_string(), "rtmps://cdn.example.com:443/live2/k");
        assert_eq!(addr.raw(), "rtmps://cdn.example.com:443/live2/k");
        assert_eq!(addr.stream_key(), StreamKey::new("live2", "k"));
    }

    #[test]
    fn test_invalid_scheme() {
        assert!(matches!(
            Addr::parse("rt mp://host/app/key"),
            Err(AddrError::InvalidScheme { .. })
        ));
    }
}
