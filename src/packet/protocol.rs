//! IP protocol / next-header codes

use std::fmt;

/// Upper-layer protocol carried by an IP packet
///
/// Only the codes the interceptor acts on are mapped. Every other code,
/// including IPv6 extension headers, resolves to [`Protocol::Null`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Transmission Control Protocol (6)
    Tcp,
    /// User Datagram Protocol (17)
    Udp,
    /// IPv6 "no next header" (59)
    End,
    /// Anything else
    Null,
}

impl Protocol {
    /// Resolve a protocol byte. Never fails.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            6 => Self::Tcp,
            17 => Self::Udp,
            59 => Self::End,
            _ => Self::Null,
        }
    }

    /// Wire code (`Null` maps to 0)
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::End => 59,
            Self::Null => 0,
        }
    }

    /// Short protocol name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::End => "END",
            Self::Null => "NULL",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
