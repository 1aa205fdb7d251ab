//! UDP header view

use super::bytes::{fold_checksum, ones_complement_sum, read_u16, write_u16};

/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

mod field {
    pub const SRC_PORT: usize = 0;
    pub const DST_PORT: usize = 2;
    pub const LENGTH: usize = 4;
    pub const CHECKSUM: usize = 6;
}

/// View over a UDP datagram (header plus payload)
#[derive(Debug, Clone)]
pub struct UdpHeader<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> UdpHeader<T> {
    /// Wrap a datagram, checking only the fixed header length
    #[must_use]
    pub fn new_checked(buffer: T) -> Option<Self> {
        (buffer.as_ref().len() >= UDP_HEADER_LEN).then_some(Self { buffer })
    }

    /// Wrap a datagram without validation
    pub const fn new_unchecked(buffer: T) -> Self {
        Self { buffer }
    }

    fn buf(&self) -> &[u8] {
        self.buffer.as_ref()
    }

    #[must_use]
    pub fn source_port(&self) -> u16 {
        read_u16(self.buf(), field::SRC_PORT)
    }

    #[must_use]
    pub fn destination_port(&self) -> u16 {
        read_u16(self.buf(), field::DST_PORT)
    }

    /// Length field (header plus payload)
    #[must_use]
    pub fn length(&self) -> usize {
        usize::from(read_u16(self.buf(), field::LENGTH))
    }

    #[must_use]
    pub fn checksum(&self) -> u16 {
        read_u16(self.buf(), field::CHECKSUM)
    }

    /// Datagram payload
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let end = self.length().max(UDP_HEADER_LEN).min(self.buf().len());
        &self.buf()[UDP_HEADER_LEN..end]
    }

    /// Whether the stored checksum matches the datagram
    #[must_use]
    pub fn verify_checksum(&self, pseudo_sum: u32) -> bool {
        let sum = pseudo_sum.wrapping_add(ones_complement_sum(self.buf(), 0, self.buf().len()));
        fold_checksum(sum) == 0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> UdpHeader<T> {
    fn buf_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut()
    }

    pub fn set_source_port(&mut self, port: u16) {
        write_u16(self.buf_mut(), field::SRC_PORT, port);
    }

    pub fn set_destination_port(&mut self, port: u16) {
        write_u16(self.buf_mut(), field::DST_PORT, port);
    }

    pub fn set_length(&mut self, len: u16) {
        write_u16(self.buf_mut(), field::LENGTH, len);
    }

    /// Zero the checksum field and recompute it over the pseudo-header and datagram
    pub fn fill_checksum(&mut self, pseudo_sum: u32) {
        write_u16(self.buf_mut(), field::CHECKSUM, 0);
        let len = self.buf().len();
        let sum = pseudo_sum.wrapping_add(ones_complement_sum(self.buf(), 0, len));
        // Zero means "no checksum" on the wire and is forbidden over IPv6
        let csum = match fold_checksum(sum) {
            0 => 0xFFFF,
            csum => csum,
        };
        write_u16(self.buf_mut(), field::CHECKSUM, csum);
    }
}
