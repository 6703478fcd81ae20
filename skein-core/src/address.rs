//! Network addressing for connection points.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Address of one connection point (IPv4 or IPv6 plus port).
///
/// # Examples
///
/// ```
/// use skein_core::NetworkAddress;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4500);
/// assert_eq!(addr.to_string(), "127.0.0.1:4500");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// IP address (IPv4 or IPv6).
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
}

impl NetworkAddress {
    /// Create a new address.
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The same address with a different port.
    pub const fn with_port(&self, port: u16) -> Self {
        Self { ip: self.ip, port }
    }

    /// Parse from `ip:port` notation.
    ///
    /// Supports both IPv4 (`127.0.0.1:4500`) and bracketed IPv6
    /// (`[::1]:4500`) forms.
    ///
    /// # Errors
    ///
    /// Returns an error when the IP or port cannot be parsed.
    pub fn parse(s: &str) -> Result<Self, AddressParseError> {
        if let Some(bracket_end) = s.rfind(']') {
            if !s.starts_with('[') {
                return Err(AddressParseError::InvalidIp);
            }
            let ip_str = &s[1..bracket_end];
            let port_str = s
                .get(bracket_end + 2..)
                .ok_or(AddressParseError::MissingPort)?;
            let ip: IpAddr = ip_str.parse().map_err(|_| AddressParseError::InvalidIp)?;
            let port: u16 = port_str
                .parse()
                .map_err(|_| AddressParseError::InvalidPort)?;
            Ok(Self::new(ip, port))
        } else {
            let (ip_str, port_str) = s
                .rsplit_once(':')
                .ok_or(AddressParseError::MissingPort)?;
            let ip: IpAddr = ip_str.parse().map_err(|_| AddressParseError::InvalidIp)?;
            let port: u16 = port_str
                .parse()
                .map_err(|_| AddressParseError::InvalidPort)?;
            Ok(Self::new(ip, port))
        }
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<NetworkAddress> for SocketAddr {
    fn from(addr: NetworkAddress) -> Self {
        SocketAddr::new(addr.ip, addr.port)
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Error parsing a [`NetworkAddress`] from a string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AddressParseError {
    /// The IP address could not be parsed.
    #[error("invalid IP address")]
    InvalidIp,
    /// The port number could not be parsed.
    #[error("invalid port number")]
    InvalidPort,
    /// No port separator (`:`) found in the input.
    #[error("missing port separator")]
    MissingPort,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn display_ipv4() {
        let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 4500);
        assert_eq!(addr.to_string(), "192.168.1.1:4500");
    }

    #[test]
    fn display_ipv6_uses_brackets() {
        let addr = NetworkAddress::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 4500);
        assert_eq!(addr.to_string(), "[::1]:4500");
    }

    #[test]
    fn parse_ipv4() {
        let addr = NetworkAddress::parse("127.0.0.1:4500").expect("parse");
        assert_eq!(addr.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(addr.port, 4500);
    }

    #[test]
    fn parse_ipv6() {
        let addr = NetworkAddress::parse("[::1]:4500").expect("parse");
        assert_eq!(addr.ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(addr.port, 4500);
    }

    #[test]
    fn parse_errors() {
        assert!(NetworkAddress::parse("invalid").is_err());
        assert!(NetworkAddress::parse("127.0.0.1").is_err());
        assert!(NetworkAddress::parse("127.0.0.1:abc").is_err());
        assert!(NetworkAddress::parse("not_an_ip:4500").is_err());
    }

    #[test]
    fn socket_addr_conversion_roundtrip() {
        let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        let sock: SocketAddr = addr.into();
        assert_eq!(NetworkAddress::from(sock), addr);
    }

    #[test]
    fn serde_roundtrip() {
        let addr = NetworkAddress::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 4500);
        let json = serde_json::to_string(&addr).expect("serialize");
        let decoded: NetworkAddress = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(addr, decoded);
    }
}
