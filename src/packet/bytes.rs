//! Big-endian accessors and one's-complement arithmetic over raw buffers
//!
//! Offsets are trusted: callers guarantee that the accessed range lies inside
//! the buffer (header lengths are validated once when a header view is built).
//! An out-of-range access is a contract violation and panics like any slice
//! index would.
//!
//! # Checksum
//!
//! The Internet checksum is the one's complement of the one's-complement sum
//! of all 16-bit big-endian words. An odd trailing byte is padded with a zero
//! low byte.
//!
//! ```text
//! sum  = w0 + w1 + ... + (last << 8)
//! while sum > 0xFFFF { sum = (sum & 0xFFFF) + (sum >> 16) }
//! csum = !sum
//! ```

/// Read a big-endian `u16` at `offset`
#[inline]
#[must_use]
pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Write a big-endian `u16` at `offset`
#[inline]
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Read a big-endian `u32` at `offset`
#[inline]
#[must_use]
pub fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Write a big-endian `u32` at `offset`
#[inline]
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Read a big-endian `u64` at `offset`
#[inline]
#[must_use]
pub fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// Write a big-endian `u64` at `offset`
#[inline]
pub fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Unfolded one's-complement sum of `buf[offset..offset + len]`
///
/// The result is a plain running sum of 16-bit words. It can be added to
/// other partial sums (pseudo-header fields) before being folded with
/// [`fold_checksum`].
#[must_use]
pub fn ones_complement_sum(buf: &[u8], offset: usize, len: usize) -> u32 {
    let data = &buf[offset..offset + len];
    let mut chunks = data.chunks_exact(2);
    let mut sum: u32 = 0;
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Fold carries out of a partial sum and return its one's complement
#[must_use]
pub fn fold_checksum(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    // Truncation is exact after folding
    #[allow(clippy::cast_possible_truncation)]
    let folded = sum as u16;
    !folded
}

/// Checksum of a byte range, no pseudo-header
#[must_use]
pub fn checksum(buf: &[u8], offset: usize, len: usize) -> u16 {
    fold_checksum(ones_complement_sum(buf, offset, len))
}
