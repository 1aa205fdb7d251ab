//! IPv4 / IPv6 header views
//!
//! Headers are views over a caller-owned buffer (`T: AsRef<[u8]>`), never
//! copies. Mutating accessors require `T: AsMut<[u8]>`, so a header borrowed
//! from a [`Packet`](super::Packet) holds the only writable handle to the
//! bytes while it is alive.
//!
//! # IPv4 layout
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version|  IHL  |Type of Service|          Total Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Identification        |Flags|      Fragment Offset    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Time to Live |    Protocol   |         Header Checksum       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Source Address                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Destination Address                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! # IPv6 extension headers
//!
//! The upper-layer protocol of an IPv6 packet is found by walking the
//! extension-header chain once, when the view is built:
//!
//! ```text
//! offset = 40, next = header[6]
//! loop:
//!   TCP | UDP  -> header_len = offset, protocol = next
//!                 (offset past the buffer -> header_len = 0, protocol = END)
//!   END (59)   -> header_len = 0, protocol = END
//!   otherwise  -> next = buf[offset]; offset += buf[offset + 1] * 8 + 2
//!                 (out of bounds -> header_len = 0, protocol = END)
//! ```

use super::address::IpAddress;
use super::bytes::{self, ones_complement_sum, read_u16, read_u32, write_u16, write_u32};
use super::protocol::Protocol;
use crate::error::PacketError;

/// Minimum IPv4 header length
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Fixed IPv6 header length
pub const IPV6_HEADER_LEN: usize = 40;

mod v4_field {
    pub const TOTAL_LEN: usize = 2;
    pub const PROTOCOL: usize = 9;
    pub const CHECKSUM: usize = 10;
    pub const SRC: usize = 12;
    pub const DST: usize = 16;
}

mod v6_field {
    pub const PAYLOAD_LEN: usize = 4;
    pub const NEXT_HEADER: usize = 6;
    pub const SRC: usize = 8;
    pub const DST: usize = 24;
}

/// IP version nibble of a raw frame
#[must_use]
pub fn ip_version(buf: &[u8]) -> Option<u8> {
    buf.first().map(|b| b >> 4)
}

/// View over an IPv4 header
#[derive(Debug, Clone)]
pub struct Ipv4Header<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Ipv4Header<T> {
    /// Wrap a buffer after checking the minimum and declared header lengths
    ///
    /// # Errors
    ///
    /// Returns `PacketError` if the buffer is shorter than 20 bytes or than
    /// the IHL-declared header length.
    pub fn new_checked(buffer: T) -> Result<Self, PacketError> {
        let len = buffer.as_ref().len();
        if len < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::TooShort {
                len,
                min: IPV4_MIN_HEADER_LEN,
            });
        }
        let header = Self { buffer };
        let header_len = header.header_len();
        if header_len < IPV4_MIN_HEADER_LEN || header_len > len {
            return Err(PacketError::HeaderOverflow { header_len, len });
        }
        Ok(header)
    }

    /// Wrap a buffer without validation
    pub const fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    /// Release the underlying buffer
    pub fn into_inner(self) -> T {
        self.buffer
    }

    fn buf(&self) -> &[u8] {
        self.buffer.as_ref()
    }

    /// Header length in bytes (`IHL * 4`)
    #[must_use]
    pub fn header_len(&self) -> usize {
        usize::from(self.buf()[0] & 0x0F) * 4
    }

    /// Total length field
    #[must_use]
    pub fn total_len(&self) -> usize {
        usize::from(read_u16(self.buf(), v4_field::TOTAL_LEN))
    }

    /// Protocol byte
    #[must_use]
    pub fn protocol_code(&self) -> u8 {
        self.buf()[v4_field::PROTOCOL]
    }

    /// Header checksum field
    #[must_use]
    pub fn checksum(&self) -> u16 {
        read_u16(self.buf(), v4_field::CHECKSUM)
    }

    /// Source address as a raw `u32`
    #[must_use]
    pub fn source(&self) -> u32 {
        read_u32(self.buf(), v4_field::SRC)
    }

    /// Destination address as a raw `u32`
    #[must_use]
    pub fn destination(&self) -> u32 {
        read_u32(self.buf(), v4_field::DST)
    }

    /// Partial sum of the source and destination addresses
    #[must_use]
    pub fn address_sum(&self) -> u32 {
        ones_complement_sum(self.buf(), v4_field::SRC, 8)
    }

    /// Whether the stored header checksum is valid
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        bytes::checksum(self.buf(), 0, self.header_len()) == 0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv4Header<T> {
    fn buf_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut()
    }

    /// Set the total length field
    pub fn set_total_len(&mut self, len: u16) {
        write_u16(self.buf_mut(), v4_field::TOTAL_LEN, len);
    }

    /// Set the source address
    pub fn set_source(&mut self, addr: u32) {
        write_u32(self.buf_mut(), v4_field::SRC, addr);
    }

    /// Set the destination address
    pub fn set_destination(&mut self, addr: u32) {
        write_u32(self.buf_mut(), v4_field::DST, addr);
    }

    /// Zero the checksum field and recompute it over the header
    pub fn fill_checksum(&mut self) {
        let header_len = self.header_len();
        write_u16(self.buf_mut(), v4_field::CHECKSUM, 0);
        let csum = bytes::checksum(self.buf(), 0, header_len);
        write_u16(self.buf_mut(), v4_field::CHECKSUM, csum);
    }
}

/// View over an IPv6 header with its extension chain resolved
#[derive(Debug, Clone)]
pub struct Ipv6Header<T> {
    buffer: T,
    header_len: usize,
    protocol_code: u8,
}

impl<T: AsRef<[u8]>> Ipv6Header<T> {
    /// Wrap a buffer and resolve the extension-header chain
    ///
    /// # Errors
    ///
    /// Returns `PacketError::TooShort` if the buffer is shorter than 40 bytes.
    /// A truncated extension chain is not an error: it resolves to
    /// [`Protocol::End`] with a header length of 0.
    pub fn new_checked(buffer: T) -> Result<Self, PacketError> {
        let len = buffer.as_ref().len();
        if len < IPV6_HEADER_LEN {
            return Err(PacketError::TooShort {
                len,
                min: IPV6_HEADER_LEN,
            });
        }
        let (protocol_code, header_len) = resolve_upper_layer(buffer.as_ref());
        Ok(Self {
            buffer,
            header_len,
            protocol_code,
        })
    }

    /// Release the underlying buffer
    pub fn into_inner(self) -> T {
        self.buffer
    }

    fn buf(&self) -> &[u8] {
        self.buffer.as_ref()
    }

    /// Resolved header length, extension headers included
    #[must_use]
    pub const fn header_len(&self) -> usize {
        self.header_len
    }

    /// Resolved upper-layer protocol byte
    #[must_use]
    pub const fn protocol_code(&self) -> u8 {
        self.protocol_code
    }

    /// Payload length field
    #[must_use]
    pub fn payload_len(&self) -> usize {
        usize::from(read_u16(self.buf(), v6_field::PAYLOAD_LEN))
    }

    /// Next-header field of the fixed header
    #[must_use]
    pub fn standard_next_header(&self) -> u8 {
        self.buf()[v6_field::NEXT_HEADER]
    }

    /// Fixed header plus payload length
    #[must_use]
    pub fn total_len(&self) -> usize {
        IPV6_HEADER_LEN + self.payload_len()
    }

    /// Source address
    #[must_use]
    pub fn source(&self) -> u128 {
        read_u128(self.buf(), v6_field::SRC)
    }

    /// Destination address
    #[must_use]
    pub fn destination(&self) -> u128 {
        read_u128(self.buf(), v6_field::DST)
    }

    /// Partial sum of the source and destination addresses
    #[must_use]
    pub fn address_sum(&self) -> u32 {
        ones_complement_sum(self.buf(), v6_field::SRC, 32)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv6Header<T> {
    fn buf_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut()
    }

    /// Set the payload length from a total packet length
    pub fn set_total_len(&mut self, len: u16) {
        let payload = len.saturating_sub(40);
        write_u16(self.buf_mut(), v6_field::PAYLOAD_LEN, payload);
    }

    /// Set the source address
    pub fn set_source(&mut self, addr: u128) {
        write_u128(self.buf_mut(), v6_field::SRC, addr);
    }

    /// Set the destination address
    pub fn set_destination(&mut self, addr: u128) {
        write_u128(self.buf_mut(), v6_field::DST, addr);
    }
}

fn read_u128(buf: &[u8], offset: usize) -> u128 {
    (u128::from(bytes::read_u64(buf, offset)) << 64) | u128::from(bytes::read_u64(buf, offset + 8))
}

#[allow(clippy::cast_possible_truncation)]
fn write_u128(buf: &mut [u8], offset: usize, value: u128) {
    bytes::write_u64(buf, offset, (value >> 64) as u64);
    bytes::write_u64(buf, offset + 8, value as u64);
}

/// Walk the IPv6 extension chain, returning `(protocol, header_len)`
fn resolve_upper_layer(buf: &[u8]) -> (u8, usize) {
    let mut offset = IPV6_HEADER_LEN;
    let mut next = buf[v6_field::NEXT_HEADER];
    loop {
        match Protocol::from_code(next) {
            Protocol::Tcp | Protocol::Udp if offset <= buf.len() => return (next, offset),
            Protocol::Tcp | Protocol::Udp | Protocol::End => return (Protocol::End.code(), 0),
            Protocol::Null => {
                let (Some(&following), Some(&ext_len)) = (buf.get(offset), buf.get(offset + 1))
                else {
                    return (Protocol::End.code(), 0);
                };
                next = following;
                offset += usize::from(ext_len) * 8 + 2;
            }
        }
    }
}

/// An IP header of either version
#[derive(Debug, Clone)]
pub enum IpHeader<T> {
    /// IPv4 header
    V4(Ipv4Header<T>),
    /// IPv6 header
    V6(Ipv6Header<T>),
}

impl<T: AsRef<[u8]>> IpHeader<T> {
    /// Parse a raw frame by its version nibble
    ///
    /// # Errors
    ///
    /// Returns `PacketError` for empty or too-short frames and for versions
    /// other than 4 and 6.
    pub fn parse(buffer: T) -> Result<Self, PacketError> {
        match ip_version(buffer.as_ref()) {
            Some(4) => Ipv4Header::new_checked(buffer).map(Self::V4),
            Some(6) => Ipv6Header::new_checked(buffer).map(Self::V6),
            Some(v) => Err(PacketError::UnknownVersion(v)),
            None => Err(PacketError::TooShort {
                len: 0,
                min: IPV4_MIN_HEADER_LEN,
            }),
        }
    }

    /// IP version (4 or 6)
    #[must_use]
    pub const fn version(&self) -> u8 {
        match self {
            Self::V4(_) => 4,
            Self::V6(_) => 6,
        }
    }

    /// Release the underlying buffer
    pub fn into_inner(self) -> T {
        match self {
            Self::V4(h) => h.into_inner(),
            Self::V6(h) => h.into_inner(),
        }
    }

    /// Raw bytes of the whole frame
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::V4(h) => h.buf(),
            Self::V6(h) => h.buf(),
        }
    }

    /// Header length in bytes
    #[must_use]
    pub fn header_len(&self) -> usize {
        match self {
            Self::V4(h) => h.header_len(),
            Self::V6(h) => h.header_len(),
        }
    }

    /// Total packet length as declared by the header
    #[must_use]
    pub fn total_len(&self) -> usize {
        match self {
            Self::V4(h) => h.total_len(),
            Self::V6(h) => h.total_len(),
        }
    }

    /// Length of the upper-layer segment
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.total_len().saturating_sub(self.header_len())
    }

    /// Upper-layer protocol byte
    #[must_use]
    pub fn protocol_code(&self) -> u8 {
        match self {
            Self::V4(h) => h.protocol_code(),
            Self::V6(h) => h.protocol_code(),
        }
    }

    /// Upper-layer protocol
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        Protocol::from_code(self.protocol_code())
    }

    /// Source address
    #[must_use]
    pub fn source(&self) -> IpAddress {
        match self {
            Self::V4(h) => IpAddress::V4(h.source()),
            Self::V6(h) => IpAddress::V6(h.source()),
        }
    }

    /// Destination address
    #[must_use]
    pub fn destination(&self) -> IpAddress {
        match self {
            Self::V4(h) => IpAddress::V4(h.destination()),
            Self::V6(h) => IpAddress::V6(h.destination()),
        }
    }

    /// Partial one's-complement sum of both addresses
    #[must_use]
    pub fn address_sum(&self) -> u32 {
        match self {
            Self::V4(h) => h.address_sum(),
            Self::V6(h) => h.address_sum(),
        }
    }

    /// Pseudo-header sum for the upper-layer checksum
    ///
    /// `address sum + protocol + segment length`, unfolded.
    #[must_use]
    pub fn pseudo_header_sum(&self) -> u32 {
        let data_len = u32::try_from(self.data_len()).unwrap_or(u32::MAX);
        self.address_sum()
            .wrapping_add(u32::from(self.protocol_code()))
            .wrapping_add(data_len)
    }

    fn payload_range(&self) -> std::ops::Range<usize> {
        let len = self.as_bytes().len();
        let start = self.header_len().min(len);
        let end = self.total_len().min(len).max(start);
        start..end
    }

    /// Upper-layer segment bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let range = self.payload_range();
        &self.as_bytes()[range]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> IpHeader<T> {
    /// Mutable raw bytes of the whole frame
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::V4(h) => h.buf_mut(),
            Self::V6(h) => h.buf_mut(),
        }
    }

    /// Mutable upper-layer segment bytes
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let range = self.payload_range();
        &mut self.as_bytes_mut()[range]
    }

    /// Set the total packet length
    pub fn set_total_len(&mut self, len: u16) {
        match self {
            Self::V4(h) => h.set_total_len(len),
            Self::V6(h) => h.set_total_len(len),
        }
    }

    /// Rewrite the source address in place
    ///
    /// # Errors
    ///
    /// Returns `PacketError::AddressFamilyMismatch` if `addr` is not of the
    /// header's IP version.
    pub fn set_source(&mut self, addr: IpAddress) -> Result<(), PacketError> {
        match (self, addr) {
            (Self::V4(h), IpAddress::V4(a)) => h.set_source(a),
            (Self::V6(h), IpAddress::V6(a)) => h.set_source(a),
            (header, _) => {
                return Err(PacketError::AddressFamilyMismatch {
                    expected: header.version(),
                })
            }
        }
        Ok(())
    }

    /// Rewrite the destination address in place
    ///
    /// # Errors
    ///
    /// Returns `PacketError::AddressFamilyMismatch` if `addr` is not of the
    /// header's IP version.
    pub fn set_destination(&mut self, addr: IpAddress) -> Result<(), PacketError> {
        match (self, addr) {
            (Self::V4(h), IpAddress::V4(a)) => h.set_destination(a),
            (Self::V6(h), IpAddress::V6(a)) => h.set_destination(a),
            (header, _) => {
                return Err(PacketError::AddressFamilyMismatch {
                    expected: header.version(),
                })
            }
        }
        Ok(())
    }

    /// Recompute the header checksum (no-op for IPv6)
    pub fn fill_checksum(&mut self) {
        match self {
            Self::V4(h) => h.fill_checksum(),
            Self::V6(_) => {}
        }
    }
}
