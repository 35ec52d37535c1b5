//! Storing request bodies under a location's `upload_store`

use crate::cgi::parser::optional_headers as part_headers;
use crate::errors::{Error, Result};
use crate::filesystem::html_escape;
use crate::server::request::Request;
use crate::server::response::Response;
use crate::server::router::Route;
use crate::server::Handler;

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::str;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Give up on finding a free `name-N.ext` after this many tries
const MAX_SUFFIX: usize = 1000;

/// A handler for POST and PUT uploads
pub struct Uploads {
    generated: AtomicUsize,
}

/// One part of a `multipart/form-data` body
#[derive(Debug, PartialEq, Eq)]
struct Part<'a> {
    filename: Option<String>,
    content: &'a [u8],
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits `body` on `boundary`. Anything before the first delimiter is
/// preamble and anything after the closing one is epilogue.
fn multipart<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<Part<'a>>> {
    let first = format!("--{}", boundary).into_bytes();
    let next = format!("\n--{}", boundary).into_bytes();

    let start = find(body, &first).ok_or(Error::BadRequest("multipart body has no boundary"))?;
    let mut rest = &body[start + first.len()..];
    let mut parts = Vec::new();

    loop {
        if rest.starts_with(b"--") {
            return Ok(parts);
        }

        // Transport padding, then the end of the delimiter line
        let padding = rest.iter().take_while(|&&b| b == b' ' || b == b'\t').count();
        rest = &rest[padding..];
        rest = if rest.starts_with(b"\r\n") {
            &rest[2..]
        }
        else if rest.starts_with(b"\n") {
            &rest[1..]
        }
        else {
            return Err(Error::BadRequest("multipart body has no closing delimiter"));
        };

        let (after, headers) = part_headers(rest)
            .map_err(|_| Error::BadRequest("malformed multipart part headers"))?;
        let end = find(after, &next)
            .ok_or(Error::BadRequest("multipart body has no closing delimiter"))?;

        let mut content = &after[..end];
        if content.last() == Some(&b'\r') {
            content = &content[..content.len() - 1];
        }

        rest = &after[end + next.len()..];

        let disposition = match headers.iter()
            .find(|h| h.name.eq_ignore_ascii_case(b"Content-Disposition"))
        {
            Some(h) => h,
            None => {
                debug!("Skipping multipart part without Content-Disposition");
                continue;
            },
        };
        let filename = str::from_utf8(&disposition.content).ok()
            .and_then(|v| disposition_param(v, "filename"));

        parts.push(Part { filename: filename, content: content });
    }
}

/// A parameter of a `Content-Disposition` value, unquoted
fn disposition_param(value: &str, key: &str) -> Option<String> {
    let mut chars = value.chars().peekable();

    // Skip the disposition type
    while let Some(c) = chars.next() {
        if c == ';' {
            break;
        }
    }

    loop {
        while chars.peek().map_or(false, |c| *c == ' ' || *c == '\t' || *c == ';') {
            chars.next();
        }
        if chars.peek().is_none() {
            return None;
        }

        let name: String = chars.by_ref().take_while(|&c| c != '=').collect();
        let mut param = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '"' => break,
                    '\\' => param.extend(chars.next()),
                    c => param.push(c),
                }
            }
        }
        else {
            while let Some(&c) = chars.peek() {
                if c == ';' {
                    break;
                }
                param.push(c);
                chars.next();
            }
            param = String::from(param.trim_end());
        }

        if name.trim().eq_ignore_ascii_case(key) {
            return Some(param);
        }
    }
}

/// The final path component of a client-supplied name, restricted to
/// characters that are safe on any filesystem. `None` if nothing is left.
fn sanitize(name: &str) -> Option<String> {
    let last = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or("");
    let cleaned: String = last.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        None
    }
    else {
        Some(String::from(cleaned))
    }
}

/// `photo.jpg`, then `photo-1.jpg`, `photo-2.jpg`, …
fn candidate(name: &str, n: usize) -> String {
    if n == 0 {
        return String::from(name);
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}-{}{}", &name[..dot], n, &name[dot..]),
        _ => format!("{}-{}", name, n),
    }
}

/// Creates a file in `store` named after `name` without clobbering
/// anything already there.
fn create_unique(store: &Path, name: &str) -> Result<(String, File)> {
    for n in 0..MAX_SUFFIX {
        let chosen = candidate(name, n);
        match OpenOptions::new().write(true).create_new(true).open(store.join(&chosen)) {
            Ok(file) => return Ok((chosen, file)),
            Err(ref e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(Error::Storage(e)),
        }
    }
    Err(Error::Storage(std::io::Error::new(ErrorKind::AlreadyExists,
                                           format!("no free name for {}", name))))
}

impl Uploads {
    pub fn new() -> Uploads {
        Uploads { generated: AtomicUsize::new(0) }
    }

    fn generated_name(&self) -> String {
        let millis = SystemTime::now().duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let n = self.generated.fetch_add(1, Ordering::Relaxed);
        format!("upload-{}-{}.bin", millis, n)
    }

    fn store(&self, store: &Path, name: &str, content: &[u8]) -> Result<String> {
        let (chosen, mut file) = create_unique(store, name)?;
        file.write_all(content).map_err(Error::Storage)?;
        info!("Stored upload {:?} ({} bytes)", store.join(&chosen), content.len());
        Ok(chosen)
    }

    /// Name for a body that isn't multipart: the last path segment if it
    /// looks like a file name.
    fn raw_name(&self, path: &str) -> String {
        let named = match path.rsplit('/').next() {
            Some(segment) if segment.contains('.') => sanitize(segment),
            _ => None,
        };
        named.unwrap_or_else(|| self.generated_name())
    }
}

impl Handler for Uploads {
    fn handle(&self, req: &Request, route: &Route) -> Result<Response> {
        let store = route.upload_store.as_ref().ok_or(Error::NotFound)?;
        fs::create_dir_all(store).map_err(|e| {
            warn!("Cannot create upload store {:?}: {}", store, e);
            Error::Storage(e)
        })?;

        let content_type = req.headers.get("Content-Type")
            .and_then(|v| str::from_utf8(v).ok())
            .and_then(|v| v.parse::<mime::Mime>().ok());

        let mut stored = Vec::new();
        match content_type {
            Some(ref media) if media.type_() == mime::MULTIPART
                && media.subtype() == mime::FORM_DATA => {
                let boundary = media.get_param(mime::BOUNDARY)
                    .ok_or(Error::BadRequest("multipart body without a boundary"))?;

                for part in multipart(&req.body, boundary.as_str())? {
                    let filename = match part.filename {
                        Some(ref f) if !f.is_empty() => f,
                        _ => continue,
                    };
                    let name = sanitize(filename).unwrap_or_else(|| self.generated_name());
                    stored.push(self.store(store, &name, part.content)?);
                }
            },
            _ => {
                let name = self.raw_name(&req.target.path);
                stored.push(self.store(store, &name, &req.body)?);
            },
        }

        let mut body = String::from(
            "<!doctype html><html><head><title>Created</title></head><body><h1>Created</h1><ul>");
        for name in &stored {
            body.push_str(&format!("<li>{}</li>", html_escape(name)));
        }
        body.push_str("</ul></body></html>");

        Ok(Response::html(201, body))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::parser::parse_str;
    use crate::config::Method;
    use crate::server::router::RoutingTable;

    use tempfile::TempDir;

    const FORM: &[u8] = b"preamble\r\n--XyZ\r\n\
        Content-Disposition: form-data; name=\"note\"\r\n\r\n\
        just a field\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"file\"; filename=\"../../etc/pass wd.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        line one\r\nline two\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"empty\"; filename=\"empty.bin\"\r\n\r\n\
        \r\n\
        --XyZ--\r\nepilogue";

    #[test]
    fn splits_parts() {
        let parts = multipart(FORM, "XyZ").unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], Part { filename: None, content: b"just a field" });
        assert_eq!(parts[1].filename.as_ref().map(|s| s.as_str()), Some("../../etc/pass wd.txt"));
        assert_eq!(parts[1].content, b"line one\r\nline two");
        assert_eq!(parts[2].content, b"");
    }

    #[test]
    fn parts_without_disposition_are_skipped() {
        let body = b"--XyZ\r\n\r\nanonymous\r\n\
            --XyZ\r\nContent-Type: text/plain\r\n\r\nstill anonymous\r\n\
            --XyZ\r\nContent-Disposition: form-data; name=\"f\"; filename=\"kept.txt\"\r\n\r\n\
            kept\r\n--XyZ--\r\n";
        let parts = multipart(body, "XyZ").unwrap();
        assert_eq!(parts, vec![Part { filename: Some(String::from("kept.txt")), content: b"kept" }]);
    }

    #[test]
    fn unterminated_multipart() {
        let body = b"--XyZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nnever ends";
        assert_eq!(multipart(body, "XyZ").unwrap_err().status(), 400);
        assert_eq!(multipart(b"no delimiter at all", "XyZ").unwrap_err().status(), 400);
    }

    #[test]
    fn disposition_params() {
        let v = "form-data; name=\"f\"; filename=\"a;b \\\"c\\\".txt\"";
        assert_eq!(disposition_param(v, "filename"), Some(String::from("a;b \"c\".txt")));
        assert_eq!(disposition_param(v, "name"), Some(String::from("f")));
        assert_eq!(disposition_param("form-data; name=plain", "name"), Some(String::from("plain")));
        assert_eq!(disposition_param("form-data", "filename"), None);
    }

    #[test]
    fn sanitizing() {
        assert_eq!(sanitize("../../etc/passwd"), Some(String::from("passwd")));
        assert_eq!(sanitize("C:\\Users\\me\\photo 1.jpg"), Some(String::from("photo_1.jpg")));
        assert_eq!(sanitize(".hidden"), Some(String::from("hidden")));
        assert_eq!(sanitize(".."), None);
        assert_eq!(candidate("photo.jpg", 2), "photo-2.jpg");
        assert_eq!(candidate("README", 1), "README-1");
    }

    fn upload_route(dir: &TempDir) -> (RoutingTable, String) {
        let store = dir.path().join("store");
        let config = parse_str(&format!(
            "server {{ listen 8080; root {}; location /upload {{ upload_store {}; }} }}",
            dir.path().display(), store.display())).unwrap();
        (RoutingTable::new(&config), store.to_string_lossy().into_owned())
    }

    #[test]
    fn stores_multipart_files() {
        let dir = TempDir::new().unwrap();
        let (table, store) = upload_route(&dir);

        let mut req = Request::for_test(Method::Post, "/upload");
        req.headers.append("Content-Type", "multipart/form-data; boundary=XyZ");
        req.body = Vec::from(FORM);

        let route = table.virtual_host("0.0.0.0", 8080, None).unwrap().route("/upload");
        let uploads = Uploads::new();
        assert_eq!(uploads.handle(&req, route).unwrap().status(), 201);
        assert_eq!(fs::read(Path::new(&store).join("pass_wd.txt")).unwrap(), b"line one\r\nline two");
        assert_eq!(fs::read(Path::new(&store).join("empty.bin")).unwrap(), b"");

        // A second upload of the same name doesn't clobber the first
        assert_eq!(uploads.handle(&req, route).unwrap().status(), 201);
        assert!(Path::new(&store).join("pass_wd-1.txt").exists());
    }

    #[test]
    fn stores_raw_bodies() {
        let dir = TempDir::new().unwrap();
        let (table, store) = upload_route(&dir);
        let uploads = Uploads::new();

        let mut req = Request::for_test(Method::Put, "/upload/notes.txt");
        req.body = Vec::from(&b"raw"[..]);
        let route = table.virtual_host("0.0.0.0", 8080, None).unwrap().route(&req.target.path);
        uploads.handle(&req, route).unwrap();
        assert_eq!(fs::read(Path::new(&store).join("notes.txt")).unwrap(), b"raw");

        let mut req = Request::for_test(Method::Post, "/upload");
        req.body = Vec::from(&b"anonymous"[..]);
        uploads.handle(&req, route).unwrap();
        let generated = fs::read_dir(&store).unwrap()
            .filter_map(|e| e.ok())
            .any(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.starts_with("upload-") && name.ends_with(".bin")
            });
        assert!(generated);
    }
}
