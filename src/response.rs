//! HTTP/1.1 response construction and serialization.

use std::collections::BTreeMap;

use chrono::Utc;

/// Value of the `Server` header and the `/api/status` `server` field.
pub const SERVER_NAME: &str = "plinth/0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Ok = 200,
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    InternalServerError = 500,
    ServiceUnavailable = 503,
}

impl Status {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::InternalServerError => "Internal Server Error",
            Status::ServiceUnavailable => "Service Unavailable",
        }
    }
}

/// A response under construction. Headers keep a deterministic order so
/// serialization is stable; `Date`, `Server` and `Connection: close` are
/// present from the start, and the final `Connection` value is stamped from
/// the connection's own keep-alive decision just before staging.
#[derive(Debug)]
pub struct Response {
    pub status: Status,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Date".to_string(), http_date());
        headers.insert("Server".to_string(), SERVER_NAME.to_string());
        headers.insert("Connection".to_string(), "close".to_string());
        Self {
            status,
            headers,
            body: Vec::new(),
        }
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    /// Install the body and its `Content-Length`.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.headers
            .insert("Content-Length".to_string(), body.len().to_string());
        self.body = body;
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.set_header("Content-Type", content_type);
    }

    /// Drop the body without touching any header: a HEAD response carries
    /// the `Content-Length` the GET body would have had.
    pub fn clear_body_for_head(&mut self) {
        self.body.clear();
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        if keep_alive {
            self.set_header("Connection", "keep-alive");
            self.set_header("Keep-Alive", "timeout=30, max=100");
        } else {
            self.set_header("Connection", "close");
            self.headers.remove("Keep-Alive");
        }
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Serialize to wire bytes: status line, headers, CRLF, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status.code(), self.status.reason()).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// An HTML error page for the given status.
    pub fn error(status: Status, message: &str) -> Self {
        let reason = status.reason();
        let text = if message.is_empty() { reason } else { message };
        let body = format!(
            "<!DOCTYPE html>\n<html><head><title>{code} {reason}</title></head>\n\
             <body>\n<h1>{code} {reason}</h1>\n<p>{text}</p>\n<hr>\n\
             <p><em>{server}</em></p>\n</body></html>\n",
            code = status.code(),
            reason = reason,
            text = text,
            server = SERVER_NAME,
        );
        let mut response = Self::new(status);
        response.set_body(body.into_bytes());
        response.set_content_type("text/html; charset=utf-8");
        response
    }

    /// A 200 carrying raw bytes with an explicit content type.
    pub fn content(body: Vec<u8>, content_type: &str) -> Self {
        let mut response = Self::new(Status::Ok);
        response.set_body(body);
        response.set_content_type(content_type);
        response
    }

    /// A 200 JSON document.
    pub fn json(body: String) -> Self {
        Self::content(body.into_bytes(), "application/json")
    }
}

/// RFC 1123 date, as required for the `Date` header.
fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// MIME type for a file extension (leading dot, any case). Unknown
/// extensions fall back to `application/octet-stream`.
pub fn mime_type(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        ".html" | ".htm" => "text/html; charset=utf-8",
        ".css" => "text/css",
        ".js" => "application/javascript",
        ".json" => "application/json",
        ".xml" => "application/xml",
        ".txt" => "text/plain; charset=utf-8",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".svg" => "image/svg+xml",
        ".ico" => "image/x-icon",
        ".pdf" => "application/pdf",
        ".zip" => "application/zip",
        ".tar" => "application/x-tar",
        ".gz" => "application/gzip",
        ".mp3" => "audio/mpeg",
        ".mp4" => "video/mp4",
        ".avi" => "video/x-msvideo",
        ".mov" => "video/quicktime",
        ".wav" => "audio/wav",
        ".woff" => "font/woff",
        ".woff2" => "font/woff2",
        ".ttf" => "font/ttf",
        ".otf" => "font/otf",
        _ => "application/octet-stream",
    }
}
