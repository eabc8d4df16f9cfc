//! Endpoint URIs.
//!
//! The registry rendezvous uses `silkit://host:port`. Peers advertise their
//! acceptors as `tcp://host:port` or `local://<filesystem path>`.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("missing scheme separator in uri: {0}")]
    MissingScheme(String),

    #[error("unsupported uri scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid host:port in uri: {0}")]
    InvalidAuthority(String),
}

/// A parsed endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Uri {
    /// `silkit://host:port`: the registry rendezvous endpoint.
    SilKit { host: String, port: u16 },
    /// `tcp://host:port`: a peer's TCP acceptor.
    Tcp { host: String, port: u16 },
    /// `local://path`: a peer's Unix-domain acceptor.
    Local { path: String },
}

impl Uri {
    pub fn parse(raw: &str) -> Result<Self, UriError> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| UriError::MissingScheme(raw.to_string()))?;
        match scheme {
            "silkit" => {
                let (host, port) = split_authority(rest)?;
                Ok(Uri::SilKit { host, port })
            }
            "tcp" => {
                let (host, port) = split_authority(rest)?;
                Ok(Uri::Tcp { host, port })
            }
            "local" => Ok(Uri::Local {
                path: rest.to_string(),
            }),
            other => Err(UriError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn silkit(host: impl Into<String>, port: u16) -> Self {
        Uri::SilKit {
            host: host.into(),
            port,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Uri::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn local(path: impl Into<String>) -> Self {
        Uri::Local { path: path.into() }
    }
}

fn split_authority(rest: &str) -> Result<(String, u16), UriError> {
    // IPv6 literals are bracketed: [::1]:8500
    let (host, port_str) = if let Some(stripped) = rest.strip_prefix('[') {
        let (host, tail) = stripped
            .split_once(']')
            .ok_or_else(|| UriError::InvalidAuthority(rest.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| UriError::InvalidAuthority(rest.to_string()))?;
        (host.to_string(), port)
    } else {
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| UriError::InvalidAuthority(rest.to_string()))?;
        (host.to_string(), port)
    };
    let port = port_str
        .parse::<u16>()
        .map_err(|_| UriError::InvalidAuthority(rest.to_string()))?;
    if host.is_empty() {
        return Err(UriError::InvalidAuthority(rest.to_string()));
    }
    Ok((host, port))
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uri::SilKit { host, port } if host.contains(':') => {
                write!(f, "silkit://[{}]:{}", host, port)
            }
            Uri::SilKit { host, port } => write!(f, "silkit://{}:{}", host, port),
            Uri::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{}]:{}", host, port)
            }
            Uri::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Uri::Local { path } => write!(f, "local://{}", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_silkit_uri() {
        assert_eq!(
            Uri::parse("silkit://localhost:8500").unwrap(),
            Uri::silkit("localhost", 8500)
        );
    }

    #[test]
    fn test_parse_ipv6_authority() {
        assert_eq!(
            Uri::parse("silkit://[::1]:8500").unwrap(),
            Uri::silkit("::1", 8500)
        );
        assert_eq!(Uri::silkit("::1", 8500).to_string(), "silkit://[::1]:8500");
    }

    #[test]
    fn test_parse_local_uri() {
        assert_eq!(
            Uri::parse("local:///tmp/silbus-1234.sock").unwrap(),
            Uri::local("/tmp/silbus-1234.sock")
        );
    }

    #[test]
    fn test_display_roundtrip() {
        for raw in ["silkit://127.0.0.1:8500", "tcp://10.0.0.2:41000"] {
            assert_eq!(Uri::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn test_reject_malformed() {
        assert!(matches!(
            Uri::parse("localhost:8500"),
            Err(UriError::MissingScheme(_))
        ));
        assert!(matches!(
            Uri::parse("http://x:1"),
            Err(UriError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            Uri::parse("silkit://localhost"),
            Err(UriError::InvalidAuthority(_))
        ));
        assert!(matches!(
            Uri::parse("silkit://localhost:notaport"),
            Err(UriError::InvalidAuthority(_))
        ));
    }
}
