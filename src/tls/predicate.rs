//! First-buffer classification of a relayed TCP stream
//!
//! ## TLS record layout
//!
//! ```text
//! ContentType (1 byte)      20..=24
//! ProtocolVersion (2 bytes)
//! Length (2 bytes)
//! ```
//!
//! ## `ClientHello` up to the session ID
//!
//! ```text
//! record header (5) | handshake type (1) + length (3) | version (2) | random (32)
//! ```
//!
//! 43 bytes in total before the session ID length byte.

use crate::packet::bytes::read_u16;

/// TLS record header length
pub const TLS_RECORD_HEADER_LEN: usize = 5;

/// Record content types: change cipher spec, alert, handshake, application
/// data, heartbeat
pub const TLS_CONTENT_TYPES: std::ops::RangeInclusive<u8> = 20..=24;

/// Handshake record content type
pub const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Fixed preamble before the `ClientHello` session ID
const CLIENT_HELLO_PREAMBLE_LEN: usize = 43;

/// Extension type of Server Name Indication
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// Server name list length (2) + name type (1) + name length (2)
const SERVER_NAME_SUB_HEADER_LEN: usize = 5;

/// Classify a stream from its first byte
///
/// Returns `Some(false)` when the byte starts an HTTP method (`GET`, `HEAD`,
/// `POST`, `PUT`, `PATCH`, `DELETE`, `OPTIONS`, `TRACE`, `CONNECT`),
/// `Some(true)` when it is a TLS record content type, `None` otherwise.
#[must_use]
pub fn sniff_https(buf: &[u8]) -> Option<bool> {
    match *buf.first()? {
        b'G' | b'H' | b'P' | b'D' | b'O' | b'T' | b'C' => Some(false),
        b if TLS_CONTENT_TYPES.contains(&b) => Some(true),
        _ => None,
    }
}

/// Extract the SNI host name from a `ClientHello` record
///
/// Truncated or malformed input yields `None`.
#[must_use]
pub fn parse_sni(buf: &[u8]) -> Option<String> {
    if buf.len() <= CLIENT_HELLO_PREAMBLE_LEN || buf[0] != TLS_CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    let limit = buf.len();
    let mut pos = CLIENT_HELLO_PREAMBLE_LEN;

    // Session ID
    let session_id_len = usize::from(*buf.get(pos)?);
    pos += 1 + session_id_len;

    // Cipher suites
    if pos + 2 > limit {
        return None;
    }
    pos += 2 + usize::from(read_u16(buf, pos));

    // Compression methods
    let compression_len = usize::from(*buf.get(pos)?);
    pos += 1 + compression_len;

    // Extensions
    if pos + 2 > limit {
        return None;
    }
    let extensions_len = usize::from(read_u16(buf, pos));
    pos += 2;
    if pos + extensions_len > limit {
        return None;
    }

    while pos + 4 <= limit {
        let ext_type = read_u16(buf, pos);
        let ext_len = usize::from(read_u16(buf, pos + 2));
        pos += 4;
        if ext_type == EXTENSION_SERVER_NAME && ext_len > SERVER_NAME_SUB_HEADER_LEN {
            let start = pos + SERVER_NAME_SUB_HEADER_LEN;
            let end = pos + ext_len;
            let name = buf.get(start..end)?;
            return std::str::from_utf8(name).ok().map(ToOwned::to_owned);
        }
        pos += ext_len;
    }
    None
}

/// Extract the `Host` header value from a plaintext request head
///
/// Header lines are scanned in order; an empty line or a line without a
/// colon ends the scan.
#[must_use]
pub fn parse_http_host(buf: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(buf);
    let mut lines = text.split("\r\n");
    lines.next()?;
    for line in lines {
        if line.is_empty() {
            return None;
        }
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("host") {
            return Some(value.trim().to_owned());
        }
    }
    None
}

/// Host hint for TLS engine creation, by stream classification
#[must_use]
pub fn host_hint(is_https: Option<bool>, buf: &[u8]) -> Option<String> {
    if is_https? {
        parse_sni(buf)
    } else {
        parse_http_host(buf)
    }
}
