//! Helpers for filesystem manipulations

use crate::errors::{Error, Result};

use std::fs::canonicalize;
use std::path::{Path, PathBuf};

/// Normalizes a request path.
///
/// The following operations are performed:
///
/// 1. Percent-encoded bytes are decoded, exactly once. Bogus
///    percent-encoding, like `b"%bo"`, will return `Err`, and so will a
///    decoded NUL byte.
/// 2. Sequences of multiple `'/'` characters are collapsed into a single `'/'`.
/// 3. `.` segments are dropped and `..` segments pop their parent. A `..`
///    that would climb above the root returns `Err(PathTraversal)`.
///
/// The result always starts with `'/'`, and keeps a trailing `'/'` if the
/// input had one (or ended in a dot segment). If the request path doesn’t
/// lead with a slash, the path is ill-formed for our purposes.
pub fn normalize_path(path: &[u8]) -> Result<String> {
    if path.first() != Some(&b'/') {
        return Err(Error::BadRequest("path not in origin form"));
    }

    let decoded = percent_decode(path)?;
    if decoded.contains(&0) {
        return Err(Error::BadRequest("NUL byte in path"));
    }
    let decoded = String::from_utf8(decoded)
        .map_err(|_| Error::BadRequest("path is not valid UTF-8"))?;

    let mut segments: Vec<&str> = Vec::new();
    let mut trailing_slash = false;

    for segment in decoded.split('/') {
        match segment {
            "" => (),
            "." => trailing_slash = true,
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::PathTraversal);
                }
                trailing_slash = true;
            }
            s => {
                segments.push(s);
                trailing_slash = false;
            }
        }
    }
    if decoded.ends_with('/') {
        trailing_slash = true;
    }

    let mut normalized = String::with_capacity(decoded.len());
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if trailing_slash || normalized.is_empty() {
        normalized.push('/');
    }

    Ok(normalized)
}

/// Decodes `%XX` escapes without touching anything else.
pub fn percent_decode(input: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            // '%'
            0x25 => {
                if i + 2 >= input.len() {
                    return Err(Error::IllegalPercentEncoding);
                }

                let high_nybble = input[i + 1];
                let low_nybble = input[i + 2];

                if !is_hexit(high_nybble) || !is_hexit(low_nybble) {
                    return Err(Error::IllegalPercentEncoding);
                }

                buffer.push(from_hexit(high_nybble) << 4 | from_hexit(low_nybble));

                i += 3;
            }
            b => {
                buffer.push(b);
                i += 1;
            }
        }
    }

    Ok(buffer)
}

/// Percent-encodes everything in `path` except unreserved characters and
/// `'/'`, for use in generated `href`s.
pub fn percent_encode_path(path: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    let mut encoded = String::with_capacity(path.len());
    for &b in path.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                encoded.push(b as char)
            }
            _ => {
                encoded.push('%');
                encoded.push(HEX[(b >> 4) as usize] as char);
                encoded.push(HEX[(b & 0xF) as usize] as char);
            }
        }
    }
    encoded
}

/// Escapes text for inclusion in HTML element content or attribute values.
pub fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Joins a normalized request path onto `root`.
pub fn join_under(root: &Path, request_path: &str) -> PathBuf {
    root.join(request_path.trim_start_matches('/'))
}

/// Canonicalizes `path` and checks that it is `root` or lies beneath it.
///
/// `root` must already be canonical. Symlinks are followed, so a link that
/// points out of the document root is refused just like a literal `..`.
pub fn contained_canonical(root: &Path, path: &Path) -> Result<PathBuf> {
    let resolved = canonicalize(path)?;

    if !resolved.starts_with(root) {
        return Err(Error::PathTraversal);
    }

    Ok(resolved)
}

/// Returns `true` iff the byte is a hexadecimal digit according to ASCII
fn is_hexit(x: u8) -> bool {
    x.is_ascii_hexdigit()
}

/// Converts from a hexadecimal digit to its value
fn from_hexit(x: u8) -> u8 {
    match x {
        b'0'..=b'9' => x - b'0',
        b'A'..=b'F' => x - b'A' + 10,
        b'a'..=b'f' => x - b'a' + 10,
        _ => 0,
    }
}


#[test]
fn from_hexit_works() {
    use std::char;

    for x in 0x0..0x10 {
        assert_eq!(from_hexit(char::from_digit(x, 16).unwrap() as u8), x as u8);
    }
}
