//! Raw packet codec
//!
//! Fixed-layout accessors over IPv4, IPv6, TCP and UDP wire bytes. Every
//! header type is a view over a borrowed buffer in the style of smoltcp's
//! `wire` module: construct with `new_checked`, read through `&self`, write
//! through `&mut self` when the buffer is mutable.
//!
//! # Example
//!
//! ```
//! use tun_interceptor::packet::{IpHeader, Protocol, TcpHeader};
//!
//! let mut frame = vec![0u8; 40];
//! frame[0] = 0x45;
//! frame[2..4].copy_from_slice(&40u16.to_be_bytes());
//! frame[9] = 6;
//! frame[32] = 0x50;
//!
//! let mut ip = IpHeader::parse(&mut frame[..]).expect("Should parse");
//! assert_eq!(ip.protocol(), Protocol::Tcp);
//! let pseudo = ip.pseudo_header_sum();
//! let mut tcp = TcpHeader::new_unchecked(ip.payload_mut());
//! tcp.fill_checksum(pseudo);
//! assert!(tcp.verify_checksum(pseudo));
//! ```

pub mod address;
pub mod bytes;
pub mod ip;
pub mod protocol;
pub mod tcp;
pub mod udp;

pub use address::{IpAddress, Port};
pub use ip::{ip_version, IpHeader, Ipv4Header, Ipv6Header, IPV4_MIN_HEADER_LEN, IPV6_HEADER_LEN};
pub use protocol::Protocol;
pub use tcp::TcpHeader;
pub use udp::{UdpHeader, UDP_HEADER_LEN};

/// A raw frame buffer plus its valid length
///
/// The dispatcher allocates one at MTU size and reuses it for every read.
/// Only `buffer[..len]` holds packet bytes.
#[derive(Debug, Clone)]
pub struct Packet {
    buffer: Vec<u8>,
    len: usize,
}

impl Packet {
    /// Allocate an empty packet with `capacity` bytes of backing storage
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            len: 0,
        }
    }

    /// Wrap already-filled bytes
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self { buffer: bytes, len }
    }

    /// Backing storage size
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of valid bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the packet holds no bytes
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark `len` bytes as valid (clamped to capacity)
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buffer.len());
    }

    /// The whole backing storage, for reading into
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Valid bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Valid bytes, mutable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.len]
    }

    /// Copy the valid bytes out
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}
