use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TransportError;

/// Default TCP port of the RPC service.
pub const DEFAULT_PORT: u16 = 9010;

/// Where a connection is made to, or accepted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A `host:port` TCP address.
    Tcp(String),
    /// A filesystem-path Unix domain socket.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match self {
            Endpoint::Tcp(_) => "tcp",
            #[cfg(unix)]
            Endpoint::Unix(_) => "unix-domain-socket",
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    /// Accepted forms: `unix:<path>`, `tcp:<host>:<port>`, `<host>:<port>`
    /// and a bare `<host>`, which gets [`DEFAULT_PORT`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(TransportError::InvalidEndpoint(s.to_string()));
            }
            #[cfg(unix)]
            return Ok(Endpoint::Unix(PathBuf::from(path)));
            #[cfg(not(unix))]
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }

        let addr = s.strip_prefix("tcp:").unwrap_or(s);
        if addr.is_empty() {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }

        let invalid = || TransportError::InvalidEndpoint(s.to_string());

        if addr.starts_with('[') {
            return match addr.rsplit_once("]:") {
                Some((_, port)) => {
                    port.parse::<u16>().map_err(|_| invalid())?;
                    Ok(Endpoint::Tcp(addr.to_string()))
                }
                None if addr.ends_with(']') => Ok(Endpoint::Tcp(format!("{addr}:{DEFAULT_PORT}"))),
                None => Err(invalid()),
            };
        }

        match addr.split_once(':') {
            None => Ok(Endpoint::Tcp(format!("{addr}:{DEFAULT_PORT}"))),
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(invalid());
                }
                port.parse::<u16>().map_err(|_| invalid())?;
                Ok(Endpoint::Tcp(addr.to_string()))
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}
