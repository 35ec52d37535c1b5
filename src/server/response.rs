//! Responses and their serialization

use crate::server::Headers;

use httpdate::fmt_http_date;

use std::fs::File;
use std::io::{self, Read, Write};
use std::time::SystemTime;

/// Where the response body comes from
#[derive(Debug)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    /// An open file and the number of bytes to send from it
    File(File, u64),
}

impl Body {
    pub fn len(&self) -> u64 {
        match *self {
            Body::Empty => 0,
            Body::Bytes(ref b) => b.len() as u64,
            Body::File(_, len) => len,
        }
    }
}

/// The response being constructed by a `Handler`
///
/// Nothing touches the wire until `write_to`, so handlers (and the error
/// path) are free to throw a half-built response away.
#[derive(Debug)]
pub struct Response {
    status: u16,
    reason: Option<String>,
    headers: Headers,
    body: Body,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status: status,
            reason: None,
            headers: Headers::new(),
            body: Body::Empty,
        }
    }

    /// A response with an in-memory body of the given media type
    pub fn with_body(status: u16, content_type: &str, body: Vec<u8>) -> Response {
        let mut res = Response::new(status);
        res.headers.append("Content-Type", content_type);
        res.body = Body::Bytes(body);
        res
    }

    pub fn html(status: u16, body: String) -> Response {
        Response::with_body(status, "text/html", body.into_bytes())
    }

    /// A redirect with a small HTML body pointing at `location`
    pub fn redirect(status: u16, location: &str) -> Response {
        let escaped = crate::filesystem::html_escape(location);
        let mut res = Response::html(status, format!(
            "<!doctype html><html><head><title>{code} {reason}</title></head>\
             <body><h1>{reason}</h1><p><a href=\"{href}\">{href}</a></p></body></html>",
            code = status, reason = reason_phrase(status), href = escaped));
        res.headers.append("Location", location);
        res
    }

    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        match self.reason {
            Some(ref r) => r.as_str(),
            None => reason_phrase(self.status),
        }
    }

    pub fn set_reason(&mut self, reason: String) {
        self.reason = Some(reason);
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Writes the status line, headers and (unless `head_only`) the body.
    ///
    /// Framing and connection headers are always ours: whatever a handler
    /// put in `Content-Length`, `Transfer-Encoding`, `Connection`, `Date`
    /// or `Server` is replaced.
    pub fn write_to<W: Write>(mut self, sink: &mut W, head_only: bool, keep_alive: bool)
                              -> io::Result<()>
    {
        for name in &["Content-Length", "Transfer-Encoding", "Connection", "Date", "Server"] {
            self.headers.remove(name);
        }

        write!(sink, "HTTP/1.1 {} {}\r\n", self.status, self.reason())?;
        write!(sink, "Date: {}\r\n", fmt_http_date(SystemTime::now()))?;
        sink.write_all(b"Server: webserv\r\n")?;

        // 1xx and 204 carry no body and no length
        if self.status >= 200 && self.status != 204 {
            write!(sink, "Content-Length: {}\r\n", self.body.len())?;
        }

        for (name, value) in self.headers.iter() {
            write!(sink, "{}: ", name)?;
            sink.write_all(value)?;
            sink.write_all(b"\r\n")?;
        }

        sink.write_all(if keep_alive {
            &b"Connection: keep-alive\r\n"[..]
        }
        else {
            &b"Connection: close\r\n"[..]
        })?;
        sink.write_all(b"\r\n")?;

        if head_only || self.status == 204 {
            return sink.flush();
        }

        match self.body {
            Body::Empty => (),
            Body::Bytes(ref bytes) => sink.write_all(bytes)?,
            Body::File(file, len) => {
                let copied = io::copy(&mut file.take(len), sink)?;
                if copied != len {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof,
                                              "file shrank while being sent"));
                }
            },
        }

        sink.flush()
    }
}

/// Standard reason phrases for the codes this server produces
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        418 => "I'm a teapot",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        200..=299 => "Success",
        300..=399 => "Redirection",
        400..=499 => "Client Error",
        _ => "Server Error",
    }
}

pub mod error_messages {
    use super::{reason_phrase, Response};
    use crate::filesystem::join_under;
    use crate::server::router::Route;

    use std::fs;
    use std::path::PathBuf;

    fn explanation(code: u16) -> &'static str {
        match code {
            400 => "Your request had some kind of bad syntax. Are you using netcat?",
            403 => "You don't have permission to view that file. Sorry.",
            404 => "I couldn't find that file. Sorry.",
            405 => "That method isn't allowed here.",
            408 => "You took too long to send your request.",
            413 => "That request body is bigger than this location accepts.",
            414 => "That request line is far too long.",
            431 => "Those request headers are far too large.",
            500 => "Something went wrong on my side. There's nothing you can do; maybe come back later.",
            501 => "This server doesn't know how to do that.",
            504 => "A script took too long to answer.",
            505 => "This server only speaks HTTP/1.0 and HTTP/1.1.",
            _ => "",
        }
    }

    /// The built-in page for `code`
    pub fn default_page(code: u16) -> Response {
        let reason = reason_phrase(code);
        Response::html(code, format!(
            "<!doctype html><html><head><title>Error</title></head><body><h1>{} {}</h1><p>{}</p></body></html>",
            code, reason, explanation(code)))
    }

    /// The route's custom page for `code` if it has a readable one, and the
    /// built-in page otherwise. The status stays `code` either way.
    pub fn error_page(code: u16, route: Option<&Route>) -> Response {
        route.and_then(|r| custom_page(code, r)).unwrap_or_else(|| default_page(code))
    }

    fn custom_page(code: u16, route: &Route) -> Option<Response> {
        let page = route.error_pages.get(&code)?;

        let path = if page.starts_with('/') {
            join_under(route.root.as_ref()?, page)
        }
        else {
            PathBuf::from(page)
        };

        match fs::read(&path) {
            Ok(body) => {
                let media = mime_guess::from_path(&path).first_or(mime::TEXT_HTML);
                Some(Response::with_body(code, media.as_ref(), body))
            },
            Err(e) => {
                warn!("Error page {:?} for {} unreadable: {}", path, code, e);
                None
            },
        }
    }
}
