//! HTTP/1.1 request parsing and the request-completeness check the
//! reactor runs on every read.
//!
//! The framing detector is deliberately minimal: it looks for the header
//! terminator and an optional `Content-Length`. Transfer-Encoding is not
//! supported (non-chunked bodies only).

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("incomplete request")]
    Incomplete,
    #[error("malformed request")]
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Unknown,
}

impl Method {
    pub fn from_str(s: &str) -> Self {
        match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Unknown => "UNKNOWN",
        }
    }
}

/// A parsed request. Header names are stored lowercase; the path is
/// URL-decoded with the query string split off.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub query_params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    /// Parse a complete request out of `buf`. Callers gate on
    /// [`is_complete`] first; an unterminated header block still reports
    /// `Incomplete` defensively.
    pub fn parse(buf: &[u8]) -> Result<Request, ParseError> {
        let header_end = find_header_end(buf).ok_or(ParseError::Incomplete)?;
        let head = std::str::from_utf8(&buf[..header_end]).map_err(|_| ParseError::Invalid)?;

        let mut lines = head.split("\r\n");
        let request_line = lines.next().ok_or(ParseError::Invalid)?;

        let mut parts = request_line.split_whitespace();
        let method_str = parts.next().ok_or(ParseError::Invalid)?;
        let target = parts.next().ok_or(ParseError::Invalid)?;
        let version = parts.next().ok_or(ParseError::Invalid)?;

        let method = Method::from_str(method_str);

        let (raw_path, raw_query) = match target.find('?') {
            Some(pos) => (&target[..pos], Some(&target[pos + 1..])),
            None => (target, None),
        };
        let path = url_decode(raw_path);
        if path.is_empty() {
            return Err(ParseError::Invalid);
        }

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some(colon) = line.find(':') else {
                continue;
            };
            let name = line[..colon].trim().to_ascii_lowercase();
            let value = line[colon + 1..].trim().to_string();
            headers.insert(name, value);
        }

        let query_params = raw_query.map(parse_query).unwrap_or_default();

        let body_start = header_end + 4;
        let declared = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let available = buf.len().saturating_sub(body_start);
        let body = buf[body_start..body_start + declared.min(available)].to_vec();

        Ok(Request {
            method,
            path,
            version: version.to_string(),
            query_params,
            headers,
            body,
        })
    }

    /// Header lookup, case-insensitive (names are stored lowercase).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(|s| s.as_str())
    }

    /// HTTP/1.1 defaults to keep-alive unless the client says `close`;
    /// earlier versions must opt in explicitly.
    pub fn is_keep_alive(&self) -> bool {
        let connection = self
            .header("connection")
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();
        if self.version == "HTTP/1.1" {
            connection != "close"
        } else {
            connection == "keep-alive"
        }
    }
}

/// Does `buf` hold at least one complete request?
///
/// Complete means the header terminator is present and the declared body
/// (if any) has fully arrived. An absent or unparseable `Content-Length`
/// counts as zero.
pub fn is_complete(buf: &[u8]) -> bool {
    let Some(header_end) = find_header_end(buf) else {
        return false;
    };
    buf.len() >= header_end + 4 + declared_body_len(&buf[..header_end])
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn declared_body_len(head: &[u8]) -> usize {
    for line in head.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        if line[..colon].eq_ignore_ascii_case(b"content-length") {
            return std::str::from_utf8(&line[colon + 1..])
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
        }
    }
    0
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.find('=') {
            Some(pos) => {
                params.insert(url_decode(&pair[..pos]), url_decode(&pair[pos + 1..]));
            }
            None => {
                params.insert(url_decode(pair), String::new());
            }
        }
    }
    params
}

/// Percent-decoding with `+` treated as a space.
fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                if let Some(byte) = decoded {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_request() {
        let raw = b"GET /some/path?foo=bar&baz=qux HTTP/1.1\r\nHost: localhost\r\nUser-Agent: test\r\n\r\n";
        let req = Request::parse(raw).unwrap();

        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/some/path");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.query_param("foo"), Some("bar"));
        assert_eq!(req.query_param("baz"), Some("qux"));
        assert_eq!(req.header("host"), Some("localhost"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let raw = b"GET / HTTP/1.1\r\nX-Custom-Header: value\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.header("x-custom-header"), Some("value"));
        assert_eq!(req.header("X-CUSTOM-HEADER"), Some("value"));
        // Stored lowercase.
        assert!(req.headers.contains_key("x-custom-header"));
    }

    #[test]
    fn decodes_percent_escapes_and_plus() {
        let raw = b"GET /files/my%20doc.txt?q=a+b%21 HTTP/1.1\r\n\r\n";
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.path, "/files/my doc.txt");
        assert_eq!(req.query_param("q"), Some("a b!"));
    }

    #[test]
    fn body_is_bounded_by_content_length() {
        let raw = b"POST /submit HTTP/1.1\r\nContent-Length: 4\r\n\r\nbodyEXTRA";
        let req = Request::parse(raw).unwrap();
        assert_eq!(req.body, b"body");
    }

    #[test]
    fn truncated_request_is_incomplete() {
        assert_eq!(
            Request::parse(b"GET /some/path HTT").unwrap_err(),
            ParseError::Incomplete
        );
    }

    #[test]
    fn garbage_request_line_is_invalid() {
        assert_eq!(Request::parse(b"\r\n\r\n").unwrap_err(), ParseError::Invalid);
    }

    #[test]
    fn keep_alive_follows_version_semantics() {
        let req = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(req.is_keep_alive());

        let req = Request::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());

        let req = Request::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());

        let req = Request::parse(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").unwrap();
        assert!(req.is_keep_alive());
    }

    #[test]
    fn completeness_requires_header_terminator() {
        assert!(!is_complete(b"GET / HTTP/1.1\r\nHost: h\r\n"));
        assert!(is_complete(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n"));
    }

    #[test]
    fn completeness_waits_for_declared_body() {
        let partial = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n12345";
        assert!(!is_complete(partial));

        let full = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n1234567890";
        assert!(is_complete(full));
    }

    #[test]
    fn content_length_is_case_insensitive() {
        let buf = b"POST / HTTP/1.1\r\ncOnTeNt-LeNgTh: 3\r\n\r\nab";
        assert!(!is_complete(buf));
        let buf = b"POST / HTTP/1.1\r\ncOnTeNt-LeNgTh: 3\r\n\r\nabc";
        assert!(is_complete(buf));
    }

    #[test]
    fn unparseable_content_length_counts_as_zero() {
        let buf = b"POST / HTTP/1.1\r\nContent-Length: banana\r\n\r\n";
        assert!(is_complete(buf));
    }
}
