//! HTTP/1.x header parsing into the session records
//!
//! Runs on the first plaintext buffer of each direction. Parsing is
//! best-effort: a head split across buffers or a malformed line leaves the
//! remaining fields unset and only logs.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use super::indexed::{HttpIndexedInterceptor, Indexed};
use super::session::{HttpRequest, HttpResponse, HttpSession};
use super::{HttpInterceptChain, HttpInterceptor};
use crate::error::Result;
use crate::interceptor::tunnel::Tunnel;

const MAX_HEADERS: usize = 96;

/// Header section of `text` (everything before the blank line)
fn header_section(text: &str) -> &str {
    text.split_once("\r\n\r\n").map_or(text, |(head, _)| head)
}

/// Non-blank header lines, first line included
fn format_head(head: &str) -> Vec<String> {
    head.split("\r\n")
        .filter(|line| !line.trim().is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn header_value(headers: &[httparse::Header<'_>], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| String::from_utf8_lossy(h.value).trim().to_owned())
}

fn format_version(minor: Option<u8>) -> Option<String> {
    minor.map(|v| format!("HTTP/1.{v}"))
}

/// Fill `request` from the first request buffer
pub fn parse_request_header(buffer: &[u8], request: &mut HttpRequest) {
    let text = String::from_utf8_lossy(buffer);
    let head = header_section(&text);
    request.origin_head = Some(text.to_string());
    request.format_head = Some(format_head(head));

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let status = parsed.parse(buffer);

    request.method = parsed.method.map(ToOwned::to_owned);
    request.path = parsed.path.map(ToOwned::to_owned);
    request.http_version = format_version(parsed.version);

    match status {
        Ok(httparse::Status::Complete(_)) => {
            request.host = header_value(parsed.headers, "Host");
        }
        Ok(httparse::Status::Partial) => {
            // Headers are only exposed once complete; fall back to a line scan
            request.host = scan_header_line(head, "host");
            trace!("Request head continues past the first buffer");
        }
        Err(e) => {
            request.host = scan_header_line(head, "host");
            debug!("Malformed request head: {}", e);
        }
    }
}

/// Fill `response` from the first response buffer
pub fn parse_response_header(buffer: &[u8], response: &mut HttpResponse, url: Option<String>) {
    response.url = url;
    let text = String::from_utf8_lossy(buffer);
    let head = header_section(&text);
    response.origin_head = Some(head.to_owned());
    response.format_head = Some(format_head(head));

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    let status = parsed.parse(buffer);

    response.http_version = format_version(parsed.version);
    response.status = parsed.code.map(|c| c.to_string());

    match status {
        Ok(httparse::Status::Complete(_)) => {
            response.content_type = header_value(parsed.headers, "Content-Type");
            response.content_encoding = header_value(parsed.headers, "Content-Encoding");
        }
        Ok(httparse::Status::Partial) | Err(_) => {
            response.content_type = scan_header_line(head, "content-type");
            response.content_encoding = scan_header_line(head, "content-encoding");
            if let Err(e) = status {
                debug!("Malformed response head: {}", e);
            }
        }
    }
}

/// Case-insensitive lookup of `name` among `Name: value` lines
fn scan_header_line(head: &str, name: &str) -> Option<String> {
    head.split("\r\n").skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_owned())
    })
}

/// Parses request and response heads on the first plaintext buffer
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpHeaderParser;

impl HttpHeaderParser {
    /// The parser wrapped with its per-session call counter
    #[must_use]
    pub fn indexed() -> Arc<dyn HttpInterceptor> {
        Arc::new(Indexed::new(Self))
    }
}

/// Parse the request head if this is the first plaintext buffer and nobody
/// parsed it yet
pub(crate) fn parse_request_once(buffer: &[u8], session: &HttpSession, index: usize) {
    let mut request = session.request();
    if index == 0 && request.is_plaintext == Some(true) && request.origin_head.is_none() {
        parse_request_header(buffer, &mut request);
    }
}

/// Parse the response head if this is the first plaintext buffer and nobody
/// parsed it yet
pub(crate) fn parse_response_once(buffer: &[u8], session: &HttpSession, index: usize) {
    if index != 0 {
        return;
    }
    let url = session.request().url();
    let mut response = session.response();
    if response.is_plaintext == Some(true) && response.origin_head.is_none() {
        parse_response_header(buffer, &mut response, url);
    }
}

impl HttpIndexedInterceptor for HttpHeaderParser {
    fn on_request(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
        index: usize,
    ) -> Result<()> {
        parse_request_once(&buffer, session, index);
        chain.process_request_next(buffer, session, tunnel)
    }

    fn on_response(
        &self,
        chain: &mut HttpInterceptChain<'_>,
        buffer: Bytes,
        session: &Arc<HttpSession>,
        tunnel: &dyn Tunnel,
        index: usize,
    ) -> Result<()> {
        parse_response_once(&buffer, session, index);
        chain.process_response_next(buffer, session, tunnel)
    }
}
