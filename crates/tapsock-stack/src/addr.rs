//! Interface addresses, routes and conversions to the embedded stack's types.

use serde::{Deserialize, Serialize};
use smoltcp::wire::{IpAddress, IpEndpoint, IpListenEndpoint, Ipv4Address, Ipv6Address};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Address parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrParseError {
    /// Missing or malformed `/prefix`
    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),

    /// Prefix longer than the address
    #[error("prefix length {prefix} too long for {addr}")]
    PrefixTooLong {
        /// Address
        addr: IpAddr,
        /// Prefix length
        prefix: u8,
    },

    /// Malformed route
    #[error("invalid route: {0}")]
    InvalidRoute(String),
}

/// An address with its network prefix length, e.g. `10.147.17.5/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpCidr {
    addr: IpAddr,
    prefix: u8,
}

impl IpCidr {
    /// Create a CIDR
    ///
    /// # Errors
    ///
    /// Returns [`AddrParseError::PrefixTooLong`] if `prefix` exceeds the address width.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, AddrParseError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(AddrParseError::PrefixTooLong { addr, prefix });
        }
        Ok(Self { addr, prefix })
    }

    /// Address part
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Check if this is an IPv4 CIDR
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Check if this is an IPv6 CIDR
    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Check whether `ip` lies inside this network.
    ///
    /// Addresses of the other family never match.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }

    /// Network address (host bits cleared)
    pub fn network(&self) -> IpAddr {
        match self.addr {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & prefix_mask_u32(self.prefix))),
            IpAddr::V6(v6) => {
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & prefix_mask_u128(self.prefix)))
            }
        }
    }

    /// Check if this is a default (all-zero, /0) target
    pub fn is_default(&self) -> bool {
        self.prefix == 0 && self.addr.is_unspecified()
    }

    /// Equivalent CIDR for the embedded stack
    pub fn to_stack(&self) -> smoltcp::wire::IpCidr {
        smoltcp::wire::IpCidr::new(to_stack_addr(self.addr), self.prefix)
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IpCidr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| AddrParseError::InvalidCidr(s.to_string()))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| AddrParseError::InvalidCidr(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| AddrParseError::InvalidCidr(s.to_string()))?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for IpCidr {
    type Error = AddrParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpCidr> for String {
    fn from(cidr: IpCidr) -> Self {
        cidr.to_string()
    }
}

/// A managed route: a target network, optionally reached via a gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Route {
    /// Destination network
    pub target: IpCidr,
    /// Next hop, `None` for directly reachable networks
    pub via: Option<IpAddr>,
}

impl Route {
    /// Directly reachable network
    pub fn direct(target: IpCidr) -> Self {
        Self { target, via: None }
    }

    /// Network reached via `gateway`
    pub fn via(target: IpCidr, gateway: IpAddr) -> Self {
        Self {
            target,
            via: Some(gateway),
        }
    }

    /// Default route with a gateway, installable into the embedded stack
    pub fn default_gateway(&self) -> Option<IpAddr> {
        if self.target.is_default() {
            self.via
        } else {
            None
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.via {
            Some(via) => write!(f, "{} via {}", self.target, via),
            None => write!(f, "{}", self.target),
        }
    }
}

impl FromStr for Route {
    type Err = AddrParseError;

    /// Parses `"10.0.0.0/8"` or `"0.0.0.0/0 via 10.0.0.1"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let target: IpCidr = parts
            .next()
            .ok_or_else(|| AddrParseError::InvalidRoute(s.to_string()))?
            .parse()?;
        match (parts.next(), parts.next(), parts.next()) {
            (None, _, _) => Ok(Self::direct(target)),
            (Some("via"), Some(gw), None) => {
                let gw: IpAddr = gw
                    .parse()
                    .map_err(|_| AddrParseError::InvalidRoute(s.to_string()))?;
                Ok(Self::via(target, gw))
            }
            _ => Err(AddrParseError::InvalidRoute(s.to_string())),
        }
    }
}

impl TryFrom<String> for Route {
    type Error = AddrParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Route> for String {
    fn from(route: Route) -> Self {
        route.to_string()
    }
}

// ----------------------------------------------------------------------
// Embedded stack conversions
// ----------------------------------------------------------------------

/// Convert a standard address into the embedded stack's form
pub fn to_stack_addr(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            IpAddress::Ipv4(Ipv4Address::new(a, b, c, d))
        }
        IpAddr::V6(v6) => {
            let [a, b, c, d, e, f, g, h] = v6.segments();
            IpAddress::Ipv6(Ipv6Address::new(a, b, c, d, e, f, g, h))
        }
    }
}

/// Convert an embedded stack address into the standard form
pub fn from_stack_addr(ip: IpAddress) -> IpAddr {
    match ip {
        IpAddress::Ipv4(v4) => IpAddr::V4(Ipv4Addr::from(v4.octets())),
        IpAddress::Ipv6(v6) => IpAddr::V6(Ipv6Addr::from(v6.octets())),
    }
}

/// Remote endpoint for the embedded stack
pub fn to_endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(to_stack_addr(addr.ip()), addr.port())
}

/// Local endpoint for the embedded stack; unspecified addresses listen on all
pub fn to_listen_endpoint(addr: SocketAddr) -> IpListenEndpoint {
    IpListenEndpoint {
        addr: (!addr.ip().is_unspecified()).then(|| to_stack_addr(addr.ip())),
        port: addr.port(),
    }
}

/// Standard socket address of an embedded stack endpoint
pub fn from_endpoint(ep: IpEndpoint) -> SocketAddr {
    SocketAddr::new(from_stack_addr(ep.addr), ep.port)
}
