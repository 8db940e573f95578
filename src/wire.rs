//! Hand-rolled HTTP/1.0 wire codec.
//!
//! libprocess speaks a deliberately narrow subset of HTTP/1.0: request line,
//! a handful of headers, an optional fixed-length body. A general HTTP
//! library would fight this crate's need for exact header ordering and the
//! legacy `User-Agent: libprocess/<pid>` sender-identification path, so the
//! codec is scanned by hand instead, the same way `framing.rs` hand-rolls
//! its own frame boundary detection.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::error::WireError;
use crate::pid::Pid;

pub const HEADER_FROM: &str = "Libprocess-From";
const LEGACY_USER_AGENT_PREFIX: &str = "libprocess/";

/// Canonical (lowercase) form of a header name. HTTP header names are
/// case-insensitive; `ParsedRequest::headers` keys on this form so a lookup
/// never depends on how a particular peer happened to capitalize a header,
/// matching the canonicalization the original HTTP parser does.
fn canonical_header_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// An outbound request, ready to be written to a socket.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub path: String,
    pub from: Pid,
    pub content_type: Option<String>,
    pub body: Bytes,
    /// When true, identify the sender via the legacy `User-Agent:
    /// libprocess/<pid>` header instead of `Libprocess-From`, matching a
    /// peer that predates the modern header.
    pub legacy: bool,
}

/// Encode a request exactly as the original wire format expects: request
/// line, one sender-identification header (`Libprocess-From` by default, or
/// the legacy `User-Agent: libprocess/<pid>` form when `req.legacy` is set),
/// `Connection: Keep-Alive`, an optional `Content-Type`, then
/// `Content-Length` and the body.
pub fn encode_request(req: &OutboundRequest) -> Bytes {
    let mut out = BytesMut::with_capacity(256 + req.body.len());
    out.extend_from_slice(format!("POST {} HTTP/1.0\r\n", req.path).as_bytes());
    if req.legacy {
        out.extend_from_slice(
            format!("User-Agent: {LEGACY_USER_AGENT_PREFIX}{}\r\n", req.from).as_bytes(),
        );
    } else {
        out.extend_from_slice(format!("{}: {}\r\n", HEADER_FROM, req.from).as_bytes());
    }
    out.extend_from_slice(b"Connection: Keep-Alive\r\n");
    if let Some(ct) = &req.content_type {
        out.extend_from_slice(format!("Content-Type: {}\r\n", ct).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", req.body.len()).as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&req.body);
    out.freeze()
}

/// A fully parsed HTTP/1.0 request, ready for dispatch into the route or
/// mailbox table.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl ParsedRequest {
    /// Recover the sender pid, preferring the modern `Libprocess-From`
    /// header and falling back to the legacy `libprocess/<pid>`
    /// `User-Agent` encoding. Collapses the legacy/modern distinction;
    /// use [`identify_sender_kind`] where that distinction matters (e.g.
    /// choosing the mailbox-post response status).
    pub fn sender(&self) -> Option<Pid> {
        identify_sender(&self.headers)
    }

    pub fn sender_kind(&self) -> SenderIdentity {
        identify_sender_kind(&self.headers)
    }
}

/// How (or whether) a request identified itself as process-originating.
/// A request lacking both headers, or carrying an unparseable one, is "not
/// process-originating" per §4.3 and must not be treated as either variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderIdentity {
    Modern(Pid),
    Legacy(Pid),
    Unknown,
}

pub fn identify_sender(headers: &HashMap<String, String>) -> Option<Pid> {
    match identify_sender_kind(headers) {
        SenderIdentity::Modern(pid) | SenderIdentity::Legacy(pid) => Some(pid),
        SenderIdentity::Unknown => None,
    }
}

pub fn identify_sender_kind(headers: &HashMap<String, String>) -> SenderIdentity {
    if let Some(v) = headers.get(&canonical_header_name(HEADER_FROM)) {
        if let Ok(pid) = v.parse() {
            return SenderIdentity::Modern(pid);
        }
        return SenderIdentity::Unknown;
    }
    if let Some(ua) = headers.get("user-agent") {
        if let Some(rest) = ua.strip_prefix(LEGACY_USER_AGENT_PREFIX) {
            if let Ok(pid) = rest.parse() {
                return SenderIdentity::Legacy(pid);
            }
        }
    }
    SenderIdentity::Unknown
}

/// Split `buf` on the first `\r\n\r\n` (or bare `\n\n`, tolerated the same
/// way the original parser tolerates it), returning the header block and
/// the offset the body starts at.
fn split_headers(buf: &[u8]) -> Option<(&[u8], usize)> {
    if let Some(pos) = find_subslice(buf, b"\r\n\r\n") {
        return Some((&buf[..pos], pos + 4));
    }
    find_subslice(buf, b"\n\n").map(|pos| (&buf[..pos], pos + 2))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn crlf_tokenize(block: &[u8]) -> Vec<&[u8]> {
    block
        .split(|&b| b == b'\n')
        .map(|line| {
            if line.last() == Some(&b'\r') {
                &line[..line.len() - 1]
            } else {
                line
            }
        })
        .filter(|line| !line.is_empty())
        .collect()
}

/// Parse one request out of `buf`. Returns `Ok(None)` if `buf` does not yet
/// contain a full header block (more bytes are needed), `Ok(Some((req,
/// consumed)))` on success, consuming exactly the bytes that made up the
/// request (header block plus body).
pub fn parse_request(buf: &[u8]) -> Result<Option<(ParsedRequest, usize)>, WireError> {
    let Some((header_block, body_start)) = split_headers(buf) else {
        return Ok(None);
    };

    let lines = crlf_tokenize(header_block);
    let mut lines = lines.into_iter();
    let request_line = lines
        .next()
        .ok_or_else(|| WireError::MalformedRequestLine(String::new()))?;
    let request_line = std::str::from_utf8(request_line)
        .map_err(|_| WireError::MalformedRequestLine("non-utf8".into()))?;

    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .ok_or_else(|| WireError::MalformedRequestLine(request_line.into()))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| WireError::MalformedRequestLine(request_line.into()))?
        .to_string();
    let version = parts
        .next()
        .ok_or_else(|| WireError::MalformedRequestLine(request_line.into()))?;
    if version != "HTTP/1.0" && version != "HTTP/1.1" {
        return Err(WireError::UnsupportedVersion(version.to_string()));
    }

    let mut headers = HashMap::new();
    for line in lines {
        let line = std::str::from_utf8(line)
            .map_err(|_| WireError::MalformedHeader("non-utf8".into()))?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WireError::MalformedHeader(line.to_string()))?;
        headers.insert(canonical_header_name(name), value.trim().to_string());
    }

    let content_length: usize = match headers.get("content-length") {
        Some(v) => v.parse().map_err(|_| WireError::BadContentLength)?,
        None => 0,
    };

    let needed = body_start + content_length;
    if buf.len() < needed {
        return Ok(None);
    }

    let body = Bytes::copy_from_slice(&buf[body_start..needed]);
    Ok(Some((
        ParsedRequest {
            method,
            path,
            headers,
            body,
        },
        needed,
    )))
}

/// An incremental request decoder, feeding partial reads of a socket one
/// chunk at a time and yielding every complete request found so far. Mirrors
/// `FrameDecoder::feed`'s buffering contract: a caller can hand it
/// byte-at-a-time input and still get correct results.
#[derive(Debug, Default)]
pub struct RequestDecoder {
    buf: BytesMut,
}

impl RequestDecoder {
    pub fn new() -> Self {
        RequestDecoder {
            buf: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ParsedRequest>, WireError> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            match parse_request(&self.buf)? {
                Some((req, consumed)) => {
                    let _ = self.buf.split_to(consumed);
                    out.push(req);
                }
                None => break,
            }
        }
        Ok(out)
    }
}

/// Response status codes this server ever emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok200,
    Accepted202,
    NoContent204,
    NotFound404,
}

impl Status {
    fn line(self) -> &'static str {
        match self {
            Status::Ok200 => "HTTP/1.0 200 OK\r\n",
            Status::Accepted202 => "HTTP/1.0 202 Accepted\r\n",
            Status::NoContent204 => "HTTP/1.0 204 No Content\r\n",
            Status::NotFound404 => "HTTP/1.0 404 Not Found\r\n",
        }
    }
}

/// Encode a response. Message-mailbox handlers always pass an empty body
/// regardless of status, mirroring `WireProtocolMessageHandler.flush`'s
/// no-op override that suppresses any body a handler might have produced.
pub fn encode_response(status: Status, content_type: Option<&str>, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(64 + body.len());
    out.extend_from_slice(status.line().as_bytes());
    if let Some(ct) = content_type {
        out.extend_from_slice(format!("Content-Type: {}\r\n", ct).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"Connection: Keep-Alive\r\n\r\n");
    out.extend_from_slice(body);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn pid() -> Pid {
        Pid::new("echo", Ipv4Addr::new(127, 0, 0, 1), 5050)
    }

    #[test]
    fn encodes_request_with_expected_headers() {
        let req = OutboundRequest {
            method: "POST".into(),
            path: "/echo/ping".into(),
            from: pid(),
            content_type: Some("text/plain".into()),
            body: Bytes::from_static(b"hello"),
            legacy: false,
        };
        let bytes = encode_request(&req);
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("POST /echo/ping HTTP/1.0\r\n"));
        assert!(!text.contains("User-Agent:"));
        assert!(text.contains("Libprocess-From: echo@127.0.0.1:5050\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("hello"));
    }

    #[test]
    fn encodes_legacy_request_with_user_agent_only() {
        let req = OutboundRequest {
            method: "POST".into(),
            path: "/echo/ping".into(),
            from: pid(),
            content_type: None,
            body: Bytes::new(),
            legacy: true,
        };
        let bytes = encode_request(&req);
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("User-Agent: libprocess/echo@127.0.0.1:5050\r\n"));
        assert!(!text.contains("Libprocess-From:"));
    }

    #[test]
    fn parses_request_with_body() {
        let req = OutboundRequest {
            method: "POST".into(),
            path: "/echo/ping".into(),
            from: pid(),
            content_type: None,
            body: Bytes::from_static(b"hi"),
            legacy: false,
        };
        let bytes = encode_request(&req);
        let (parsed, consumed) = parse_request(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.path, "/echo/ping");
        assert_eq!(&parsed.body[..], b"hi");
        assert_eq!(parsed.sender(), Some(pid()));
        assert_eq!(parsed.sender_kind(), SenderIdentity::Modern(pid()));
    }

    #[test]
    fn identifies_legacy_sender_via_user_agent() {
        let mut headers = HashMap::new();
        headers.insert("user-agent".to_string(), "libprocess/echo@127.0.0.1:5050".to_string());
        assert_eq!(identify_sender(&headers), Some(pid()));
        assert_eq!(identify_sender_kind(&headers), SenderIdentity::Legacy(pid()));
    }

    #[test]
    fn unparseable_from_header_is_not_process_originating_even_with_user_agent() {
        let mut headers = HashMap::new();
        headers.insert("libprocess-from".to_string(), "not-a-pid".to_string());
        headers.insert("user-agent".to_string(), "libprocess/echo@127.0.0.1:5050".to_string());
        assert_eq!(identify_sender_kind(&headers), SenderIdentity::Unknown);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = b"POST /echo/ping HTTP/1.0\r\nLIBPROCESS-FROM: echo@127.0.0.1:5050\r\ncontent-length: 0\r\n\r\n";
        let (parsed, _) = parse_request(req).unwrap().unwrap();
        assert_eq!(parsed.sender(), Some(pid()));
    }

    #[test]
    fn decoder_handles_byte_at_a_time_feed() {
        let req = OutboundRequest {
            method: "POST".into(),
            path: "/echo/ping".into(),
            from: pid(),
            content_type: None,
            body: Bytes::from_static(b"hi"),
            legacy: false,
        };
        let bytes = encode_request(&req);
        let mut decoder = RequestDecoder::new();
        let mut found = Vec::new();
        for byte in bytes.iter() {
            found.extend(decoder.feed(&[*byte]).unwrap());
        }
        assert_eq!(found.len(), 1);
        assert_eq!(&found[0].body[..], b"hi");
    }

    #[test]
    fn incomplete_request_yields_none() {
        let partial = b"POST /echo/ping HTTP/1.0\r\nContent-Length: 5\r\n\r\nhi";
        assert!(parse_request(partial).unwrap().is_none());
    }

    #[test]
    fn rejects_unsupported_version() {
        let req = b"POST /echo/ping HTTP/2.0\r\n\r\n";
        assert!(matches!(
            parse_request(req),
            Err(WireError::UnsupportedVersion(_))
        ));
    }
}
