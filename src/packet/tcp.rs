//! TCP header view
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Data |       |C|E|U|A|P|R|S|F|                               |
//! | Offset|  Res. |W|C|R|C|S|S|Y|I|            Window             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |         Urgent Pointer        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The view covers the whole segment (header plus payload) so that the
//! checksum can be computed over it.

use super::bytes::{fold_checksum, ones_complement_sum, read_u16, read_u32, write_u16, write_u32};

/// Minimum TCP header length
pub const TCP_MIN_HEADER_LEN: usize = 20;

/// TCP flag bits (byte 13)
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;
}

mod field {
    pub const SRC_PORT: usize = 0;
    pub const DST_PORT: usize = 2;
    pub const SEQ: usize = 4;
    pub const ACK: usize = 8;
    pub const DATA_OFFSET: usize = 12;
    pub const FLAGS: usize = 13;
    pub const WINDOW: usize = 14;
    pub const CHECKSUM: usize = 16;
}

/// View over a TCP segment
#[derive(Debug, Clone)]
pub struct TcpHeader<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> TcpHeader<T> {
    /// Wrap a segment, checking only the fixed header length
    #[must_use]
    pub fn new_checked(buffer: T) -> Option<Self> {
        (buffer.as_ref().len() >= TCP_MIN_HEADER_LEN).then_some(Self { buffer })
    }

    /// Wrap a segment without validation
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

    #[must_use]
    pub fn sequence_number(&self) -> u32 {
        read_u32(self.buf(), field::SEQ)
    }

    #[must_use]
    pub fn acknowledgment_number(&self) -> u32 {
        read_u32(self.buf(), field::ACK)
    }

    /// Header length from the data offset nibble
    #[must_use]
    pub fn header_len(&self) -> usize {
        usize::from(self.buf()[field::DATA_OFFSET] >> 4) << 2
    }

    #[must_use]
    pub fn flags(&self) -> u8 {
        self.buf()[field::FLAGS]
    }

    #[must_use]
    pub fn window(&self) -> u16 {
        read_u16(self.buf(), field::WINDOW)
    }

    #[must_use]
    pub fn checksum(&self) -> u16 {
        read_u16(self.buf(), field::CHECKSUM)
    }

    #[must_use]
    pub fn is_syn(&self) -> bool {
        self.flags() & flags::SYN != 0
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.flags() & flags::ACK != 0
    }

    #[must_use]
    pub fn is_fin(&self) -> bool {
        self.flags() & flags::FIN != 0
    }

    #[must_use]
    pub fn is_rst(&self) -> bool {
        self.flags() & flags::RST != 0
    }

    /// Payload after the TCP header and options
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let start = self.header_len().min(self.buf().len());
        &self.buf()[start..]
    }

    /// Whether the stored checksum matches the segment
    ///
    /// `pseudo_sum` is the unfolded pseudo-header sum from
    /// [`IpHeader::pseudo_header_sum`](super::IpHeader::pseudo_header_sum).
    #[must_use]
    pub fn verify_checksum(&self, pseudo_sum: u32) -> bool {
        let sum = pseudo_sum.wrapping_add(ones_complement_sum(self.buf(), 0, self.buf().len()));
        fold_checksum(sum) == 0
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> TcpHeader<T> {
    fn buf_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut()
    }

    pub fn set_source_port(&mut self, port: u16) {
        write_u16(self.buf_mut(), field::SRC_PORT, port);
    }

    pub fn set_destination_port(&mut self, port: u16) {
        write_u16(self.buf_mut(), field::DST_PORT, port);
    }

    pub fn set_sequence_number(&mut self, seq: u32) {
        write_u32(self.buf_mut(), field::SEQ, seq);
    }

    pub fn set_acknowledgment_number(&mut self, ack: u32) {
        write_u32(self.buf_mut(), field::ACK, ack);
    }

    pub fn set_flags(&mut self, value: u8) {
        self.buf_mut()[field::FLAGS] = value;
    }

    /// Zero the checksum field and recompute it over the pseudo-header and segment
    pub fn fill_checksum(&mut self, pseudo_sum: u32) {
        write_u16(self.buf_mut(), field::CHECKSUM, 0);
        let len = self.buf().len();
        let sum = pseudo_sum.wrapping_add(ones_complement_sum(self.buf(), 0, len));
        write_u16(self.buf_mut(), field::CHECKSUM, fold_checksum(sum));
    }
}
