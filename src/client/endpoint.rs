//! Sync server URL parsing.
//!
//! Accepted grammar: `scheme://host[:port][/path]` with scheme one of
//! `lagoon`, `lagoons`, `ws`, `wss`. Userinfo, query strings and fragments
//! are rejected.

use std::fmt;

use thiserror::Error;

use crate::config::ClientConfig;

/// Transport envelope selected by the URL scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolEnvelope {
    Lagoon,
    Lagoons,
    Ws,
    Wss,
}

impl ProtocolEnvelope {
    pub fn is_ssl(self) -> bool {
        matches!(self, ProtocolEnvelope::Lagoons | ProtocolEnvelope::Wss)
    }
}

impl fmt::Display for ProtocolEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self {
            ProtocolEnvelope::Lagoon => "lagoon",
            ProtocolEnvelope::Lagoons => "lagoons",
            ProtocolEnvelope::Ws => "ws",
            ProtocolEnvelope::Wss => "wss",
        };
        f.write_str(scheme)
    }
}

/// Identity of a sync server as seen by connection pooling.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerEndpoint {
    pub envelope: ProtocolEnvelope,
    pub address: String,
    pub port: u16,
    /// HTTP request path prefix, always beginning with `/` (possibly just
    /// `/`).
    pub path: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("missing `://` separator in server URL")]
    MissingSeparator,
    #[error("unsupported scheme `{0}` in server URL")]
    BadScheme(String),
    #[error("missing host in server URL")]
    MissingHost,
    #[error("userinfo is not allowed in server URLs")]
    UserinfoNotAllowed,
    #[error("query and fragment are not allowed in server URLs")]
    QueryOrFragmentNotAllowed,
    #[error("invalid port `{0}` in server URL")]
    BadPort(String),
}

impl ServerEndpoint {
    /// Parse a sync server URL, applying the scheme's default port when the
    /// URL does not carry one.
    pub fn parse(url: &str, config: &ClientConfig) -> Result<Self, UrlError> {
        let (scheme, rest) = url.split_once("://").ok_or(UrlError::MissingSeparator)?;

        let envelope = match scheme {
            "lagoon" => ProtocolEnvelope::Lagoon,
            "lagoons" => ProtocolEnvelope::Lagoons,
            "ws" => ProtocolEnvelope::Ws,
            "wss" => ProtocolEnvelope::Wss,
            other => return Err(UrlError::BadScheme(other.to_string())),
        };

        if rest.contains('?') || rest.contains('#') {
            return Err(UrlError::QueryOrFragmentNotAllowed);
        }

        let (authority, path) = match rest.find('/') {
            Some(at) => (&rest[..at], &rest[at..]),
            None => (rest, "/"),
        };

        if authority.contains('@') {
            return Err(UrlError::UserinfoNotAllowed);
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => {
                let port: u16 = port_str
                    .parse()
                    .ok()
                    .filter(|p| *p >= 1)
                    .ok_or_else(|| UrlError::BadPort(port_str.to_string()))?;
                (host, port)
            }
            None => (authority, default_port(envelope, config)),
        };

        if host.is_empty() {
            return Err(UrlError::MissingHost);
        }

        Ok(ServerEndpoint {
            envelope,
            address: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

fn default_port(envelope: ProtocolEnvelope, config: &ClientConfig) -> u16 {
    match envelope {
        ProtocolEnvelope::Lagoon => {
            if config.enable_default_port_hack {
                80
            } else {
                7800
            }
        }
        ProtocolEnvelope::Lagoons => {
            if config.enable_default_port_hack {
                443
            } else {
                7801
            }
        }
        ProtocolEnvelope::Ws => 80,
        ProtocolEnvelope::Wss => 443,
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.envelope, self.address, self.port, self.path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(url: &str) -> Result<ServerEndpoint, UrlError> {
        ServerEndpoint::parse(url, &ClientConfig::default())
    }

    #[test]
    fn scheme_default_ports() {
        assert_eq!(parse("lagoon://example.com").unwrap().port, 7800);
        assert_eq!(parse("lagoons://example.com").unwrap().port, 7801);
        assert_eq!(parse("ws://example.com").unwrap().port, 80);
        assert_eq!(parse("wss://example.com").unwrap().port, 443);
    }

    #[test]
    fn default_port_hack_remaps_native_schemes() {
        let config = ClientConfig {
            enable_default_port_hack: true,
            ..ClientConfig::default()
        };
        assert_eq!(
            ServerEndpoint::parse("lagoon://h", &config).unwrap().port,
            80
        );
        assert_eq!(
            ServerEndpoint::parse("lagoons://h", &config).unwrap().port,
            443
        );
    }

    #[test]
    fn explicit_port_and_path() {
        let ep = parse("wss://sync.example.com:7443/app/v2").unwrap();
        assert_eq!(ep.address, "sync.example.com");
        assert_eq!(ep.port, 7443);
        assert_eq!(ep.path, "/app/v2");
        assert!(ep.envelope.is_ssl());
    }

    #[test]
    fn missing_path_defaults_to_root() {
        assert_eq!(parse("lagoon://h:9000").unwrap().path, "/");
    }

    #[test]
    fn rejects_bad_urls() {
        assert_eq!(parse("http://h"), Err(UrlError::BadScheme("http".into())));
        assert_eq!(parse("no-separator"), Err(UrlError::MissingSeparator));
        assert_eq!(parse("ws://"), Err(UrlError::MissingHost));
        assert_eq!(parse("ws://u@h"), Err(UrlError::UserinfoNotAllowed));
        assert_eq!(
            parse("ws://h/p?q=1"),
            Err(UrlError::QueryOrFragmentNotAllowed)
        );
        assert_eq!(
            parse("ws://h/p#frag"),
            Err(UrlError::QueryOrFragmentNotAllowed)
        );
        assert_eq!(parse("ws://h:0"), Err(UrlError::BadPort("0".into())));
        assert_eq!(parse("ws://h:70000"), Err(UrlError::BadPort("70000".into())));
    }

    #[test]
    fn endpoint_keys_pooling() {
        let a = parse("ws://h:80/x").unwrap();
        let b = parse("ws://h/x").unwrap();
        assert_eq!(a, b);
    }
}
