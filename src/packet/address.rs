//! Address value types used by headers and NAT sessions

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An IPv4 or IPv6 address in its numeric wire form
///
/// Two addresses are equal exactly when their canonical string forms are
/// equal, which for the numeric representation is plain value equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpAddress {
    /// 32-bit IPv4 address
    V4(u32),
    /// 128-bit IPv6 address
    V6(u128),
}

impl IpAddress {
    /// Build an IPv6 address from its high and low 64-bit halves
    #[must_use]
    pub const fn from_v6_halves(high: u64, low: u64) -> Self {
        Self::V6(((high as u128) << 64) | low as u128)
    }

    /// High and low 64-bit halves of an IPv6 address
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn v6_halves(&self) -> Option<(u64, u64)> {
        match self {
            Self::V4(_) => None,
            Self::V6(v) => Some(((*v >> 64) as u64, *v as u64)),
        }
    }

    /// Whether this is an IPv4 address
    #[must_use]
    pub const fn is_ipv4(&self) -> bool {
        matches!(self, Self::V4(_))
    }

    /// Whether this is an IPv6 address
    #[must_use]
    pub const fn is_ipv6(&self) -> bool {
        matches!(self, Self::V6(_))
    }

    /// Parse a dotted-decimal or colon-hex string
    ///
    /// Returns `None` on malformed input.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse::<IpAddr>().ok().map(Self::from)
    }

    /// Big-endian wire bytes (4 or 16)
    #[must_use]
    pub fn octets(&self) -> Vec<u8> {
        match self {
            Self::V4(v) => v.to_be_bytes().to_vec(),
            Self::V6(v) => v.to_be_bytes().to_vec(),
        }
    }

    /// Convert into the standard library representation
    #[must_use]
    pub const fn to_std(&self) -> IpAddr {
        match self {
            Self::V4(v) => IpAddr::V4(Ipv4Addr::from_bits(*v)),
            Self::V6(v) => IpAddr::V6(Ipv6Addr::from_bits(*v)),
        }
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        Self::V4(u32::from(addr))
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        Self::V6(u128::from(addr))
    }
}

impl From<IpAddr> for IpAddress {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

impl From<IpAddress> for IpAddr {
    fn from(addr: IpAddress) -> Self {
        addr.to_std()
    }
}

impl FromStr for IpAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<IpAddr>().map(Self::from)
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_std().fmt(f)
    }
}

impl Serialize for IpAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A transport-layer port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Port(u16);

impl Port {
    /// Wrap a raw port number
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self(port)
    }

    /// The raw port number
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self(port)
    }
}

impl From<Port> for u16 {
    fn from(port: Port) -> Self {
        port.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
