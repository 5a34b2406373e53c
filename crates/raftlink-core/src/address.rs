//! Network addresses of cluster nodes.
//!
//! An [`Address`] is a `(host, port)` pair compared and hashed by its
//! canonical `host:port` form. The host may be an IP literal or a name that
//! is resolved on demand; resolution never happens implicitly.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Port used when an address string carries no explicit port.
pub const DEFAULT_PORT: u16 = 5679;

/// A resolvable network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Create an address from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    /// Address of `ip:port`.
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            host: ip.to_string(),
            port,
        }
    }

    /// Local wildcard address on the given port.
    pub fn any(port: u16) -> Self {
        Self::new("0.0.0.0", port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an IP address, if it is an IP literal.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// The socket address, if the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Resolve the host to an IP address.
    ///
    /// IP literals are returned directly. Names go through the system
    /// resolver, which blocks the calling thread.
    pub fn resolve(&self) -> CoreResult<IpAddr> {
        if let Some(ip) = self.ip() {
            return Ok(ip);
        }
        let mut addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| CoreError::Resolve {
                address: self.to_string(),
                reason: e.to_string(),
            })?;
        addrs
            .next()
            .map(|sa| sa.ip())
            .ok_or_else(|| CoreError::Resolve {
                address: self.to_string(),
                reason: "no addresses returned".to_string(),
            })
    }

    /// Copy of this address with the host replaced by its resolved IP.
    pub fn resolved(&self) -> CoreResult<Address> {
        Ok(Address::from_ip(self.resolve()?, self.port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| CoreError::InvalidAddress {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty address"));
        }

        // Bracketed IPv6: [::1]:port or [::1]
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated '['"))?;
            let port = match tail {
                "" => DEFAULT_PORT,
                t => t
                    .strip_prefix(':')
                    .ok_or_else(|| invalid("expected ':' after ']'"))?
                    .parse()
                    .map_err(|_| invalid("invalid port"))?,
            };
            return Ok(Address::new(host, port));
        }

        // A bare IPv6 literal has more than one ':' and no port.
        if s.matches(':').count() > 1 {
            let ip: IpAddr = s.parse().map_err(|_| invalid("invalid IPv6 literal"))?;
            return Ok(Address::from_ip(ip, DEFAULT_PORT));
        }

        match s.split_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(invalid("empty host"));
                }
                let port = port.parse().map_err(|_| invalid("invalid port"))?;
                Ok(Address::new(host, port))
            }
            None => Ok(Address::new(s, DEFAULT_PORT)),
        }
    }
}

impl TryFrom<String> for Address {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl From<SocketAddr> for Address {
    fn from(sa: SocketAddr) -> Self {
        Address::from_ip(sa.ip(), sa.port())
    }
}
