//! Request heads: the request line, header fields and message framing

use crate::config::{Limits, Method};
use crate::errors::{Error, Result};
use crate::filesystem::normalize_path;
use crate::server::Headers;

use std::net::SocketAddr;
use std::str;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// How the body of a message is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
}

/// The request-target, split up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Decoded, normalized path; always starts with `/`
    pub path: String,
    /// The path as the client sent it, still percent-encoded
    pub raw_path: String,
    pub query: Option<String>,
    /// Authority from an absolute-form target
    pub authority: Option<String>,
    /// The `*` form, only meaningful for OPTIONS
    pub asterisk: bool,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Target> {
        if raw == "*" {
            return Ok(Target {
                path: String::from("/"),
                raw_path: String::from("*"),
                query: None,
                authority: None,
                asterisk: true,
            });
        }

        let (authority, origin) = if raw.starts_with('/') {
            (None, raw)
        }
        else {
            let lower = raw.get(..8).map(|s| s.to_ascii_lowercase()).unwrap_or_default();
            let rest = if lower.starts_with("http://") {
                &raw[7..]
            }
            else if lower.starts_with("https://") {
                &raw[8..]
            }
            else {
                return Err(Error::BadRequest("request target is not origin or absolute form"));
            };

            match rest.find(|c: char| c == '/' || c == '?') {
                Some(i) => (Some(&rest[..i]), &rest[i..]),
                None => (Some(rest), "/"),
            }
        };

        if authority.map_or(false, |a| a.is_empty()) {
            return Err(Error::BadRequest("absolute-form target without a host"));
        }

        // Fragments never belong on the wire
        let origin = match origin.find('#') {
            Some(i) => &origin[..i],
            None => origin,
        };

        let (raw_path, query) = match origin.find('?') {
            Some(i) => (&origin[..i], Some(String::from(&origin[i + 1..]))),
            None => (origin, None),
        };
        let raw_path = if raw_path.is_empty() { "/" } else { raw_path };

        Ok(Target {
            path: normalize_path(raw_path.as_bytes())?,
            raw_path: String::from(raw_path),
            query: query,
            authority: authority.map(String::from),
            asterisk: false,
        })
    }

    /// The target as a CGI `REQUEST_URI`: encoded path plus query
    pub fn request_uri(&self) -> String {
        match self.query {
            Some(ref q) => format!("{}?{}", self.raw_path, q),
            None => self.raw_path.clone(),
        }
    }
}

/// A parsed request head, before the method has been interpreted
#[derive(Debug)]
pub struct Head {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

impl Head {
    /// Connection persistence per RFC 7230 §6.3
    pub fn keep_alive(&self) -> bool {
        let mut close = false;
        let mut keep_alive = false;
        for value in self.headers.get_all("Connection") {
            for token in value.split(|&b| b == b',') {
                let token = trim(token);
                if token.eq_ignore_ascii_case(b"close") {
                    close = true;
                }
                else if token.eq_ignore_ascii_case(b"keep-alive") {
                    keep_alive = true;
                }
            }
        }

        match self.version {
            _ if close => false,
            Version::Http11 => true,
            Version::Http10 => keep_alive,
        }
    }

    /// Works out how the body is delimited.
    ///
    /// Messages carrying both framings are refused outright rather than
    /// guessing which one an intermediary used.
    pub fn framing(&self) -> Result<Framing> {
        let has_length = self.headers.contains("Content-Length");

        if self.headers.contains("Transfer-Encoding") {
            if has_length {
                return Err(Error::BadRequest("both Transfer-Encoding and Content-Length"));
            }

            let codings: Vec<&[u8]> = self.headers.get_all("Transfer-Encoding")
                .flat_map(|v| v.split(|&b| b == b','))
                .map(trim)
                .filter(|c| !c.is_empty())
                .collect();

            return match codings.as_slice() {
                [only] if only.eq_ignore_ascii_case(b"chunked") => Ok(Framing::Chunked),
                _ => Err(Error::NotImplemented),
            };
        }

        let mut length = None;
        for value in self.headers.get_all("Content-Length") {
            for item in value.split(|&b| b == b',') {
                let item = trim(item);
                if item.is_empty() || !item.iter().all(|b| b.is_ascii_digit()) {
                    return Err(Error::BadRequest("invalid Content-Length"));
                }
                let n = str::from_utf8(item).ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or(Error::BadRequest("invalid Content-Length"))?;

                match length {
                    Some(previous) if previous != n =>
                        return Err(Error::BadRequest("conflicting Content-Length values")),
                    _ => length = Some(n),
                }
            }
        }

        Ok(match length {
            None | Some(0) => Framing::Empty,
            Some(n) => Framing::Length(n),
        })
    }

    /// The host the client asked for, lowercased and without a port.
    ///
    /// An absolute-form authority stands in for `Host`.
    pub fn host(&self, target: &Target) -> Result<Option<String>> {
        let mut hosts = self.headers.get_all("Host");
        let header = hosts.next();
        if hosts.next().is_some() {
            return Err(Error::BadRequest("multiple Host headers"));
        }

        if header.is_none() && self.version == Version::Http11 {
            return Err(Error::BadRequest("missing Host header"));
        }

        let raw = match target.authority {
            Some(ref authority) => authority.as_bytes(),
            None => match header {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let raw = str::from_utf8(trim(raw)).map_err(|_| Error::BadRequest("invalid Host"))?;
        Ok(Some(strip_port(raw).to_ascii_lowercase()))
    }
}

/// Drops a trailing `:port`, leaving bracketed IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(i) => &host[..i + 1],
            None => host,
        };
    }

    match host.rfind(':') {
        Some(i) if host[i + 1..].bytes().all(|b| b.is_ascii_digit()) => &host[..i],
        _ => host,
    }
}

fn trim(mut bytes: &[u8]) -> &[u8] {
    while let Some((&first, rest)) = bytes.split_first() {
        if first != b' ' && first != b'\t' {
            break;
        }
        bytes = rest;
    }
    while let Some((&last, rest)) = bytes.split_last() {
        if last != b' ' && last != b'\t' {
            break;
        }
        bytes = rest;
    }
    bytes
}

fn is_token(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// `HTTP/<digit>.<digit>`
fn looks_like_version(v: &[u8]) -> bool {
    v.len() == 8 && v.starts_with(b"HTTP/") && v[5].is_ascii_digit() && v[6] == b'.'
        && v[7].is_ascii_digit()
}

/// Parses a complete request head, up to and including the blank line.
pub fn parse_head(head: &[u8], limits: &Limits) -> Result<Head> {
    let line_end = head.iter().position(|&b| b == b'\n').unwrap_or(head.len());
    let mut line = &head[..line_end];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }

    if line.len() > limits.max_request_line {
        return Err(Error::RequestLineTooLong);
    }
    if line.is_empty() {
        return Err(Error::BadRequest("empty request line"));
    }

    let parts: Vec<&[u8]> = line.split(|&b| b == b' ').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::BadRequest("request line is not METHOD SP TARGET SP VERSION"));
    }

    if !parts[0].iter().all(|&b| is_token(b)) {
        return Err(Error::BadRequest("invalid method token"));
    }

    let version = match parts[2] {
        b"HTTP/1.1" => Version::Http11,
        b"HTTP/1.0" => Version::Http10,
        v if looks_like_version(v) => return Err(Error::VersionNotSupported),
        _ => return Err(Error::BadRequest("malformed HTTP version")),
    };

    let target = str::from_utf8(parts[1])
        .ok()
        .filter(|t| t.bytes().all(|b| b > b' ' && b < 0x7f))
        .ok_or(Error::BadRequest("invalid bytes in request target"))?;

    let fields = head.get(line_end + 1..).unwrap_or(&[]);
    if fields.len() > limits.max_header_bytes + 2 {
        return Err(Error::HeadersTooLarge);
    }

    // No obs-fold continuation lines
    for field_line in fields.split(|&b| b == b'\n') {
        if field_line.first() == Some(&b' ') || field_line.first() == Some(&b'\t') {
            return Err(Error::BadRequest("obsolete line folding"));
        }
    }

    let mut raw_headers = vec![httparse::EMPTY_HEADER; limits.max_headers];
    let parsed = match httparse::parse_headers(fields, &mut raw_headers)? {
        httparse::Status::Complete((_, parsed)) => parsed,
        httparse::Status::Partial => return Err(Error::BadRequest("incomplete header section")),
    };

    let mut headers = Headers::new();
    for header in parsed {
        if header.value.first() == Some(&b':') {
            return Err(Error::BadRequest("malformed header value"));
        }
        headers.append(header.name, header.value);
    }

    Ok(Head {
        method: String::from_utf8_lossy(parts[0]).into_owned(),
        target: String::from(target),
        version: version,
        headers: headers,
    })
}

/// A request that has been fully read, body included
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub target: Target,
    pub version: Version,
    pub headers: Headers,
    pub host: Option<String>,
    pub body: Vec<u8>,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

#[cfg(test)]
impl Request {
    /// A bodiless request from 127.0.0.1:40000 to port 8080
    pub fn for_test(method: Method, target: &str) -> Request {
        Request {
            method: method,
            target: Target::parse(target).unwrap(),
            version: Version::Http11,
            headers: Headers::new(),
            host: Some(String::from("localhost")),
            body: Vec::new(),
            peer_addr: "127.0.0.1:40000".parse().unwrap(),
            local_addr: "127.0.0.1:8080".parse().unwrap(),
        }
    }
}
