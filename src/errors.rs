//! Error handling for the http server

use std::fmt;
use std::io::{self, ErrorKind};

/// A Result for internal operations.
pub type Result<T> = ::std::result::Result<T, Error>;

/// All errors which might arise while serving a single request
///
/// Each one maps onto the HTTP status the client gets back; see
/// `Error::status`.
#[derive(Debug)]
pub enum Error {
    Parse(httparse::Error),
    Io(io::Error),
    BadRequest(&'static str),
    RequestTimeout,
    RequestLineTooLong,
    HeadersTooLarge,
    VersionNotSupported,
    NotImplemented,
    PayloadTooLarge,
    IllegalPercentEncoding,
    PathTraversal,
    PermissionDenied,
    NotFound,
    CgiTimeout,
    CgiFailure(String),
    CgiOutputTooLarge,
    /// Local filesystem trouble while handling an otherwise fine request
    Storage(io::Error),
}

impl Error {
    /// The HTTP status code reported to the client for this error
    pub fn status(&self) -> u16 {
        match *self {
            Error::Parse(httparse::Error::TooManyHeaders) => 431,
            Error::Parse(_) => 400,
            Error::Io(ref e) => match e.kind() {
                ErrorKind::NotFound => 404,
                ErrorKind::PermissionDenied => 403,
                ErrorKind::TimedOut | ErrorKind::WouldBlock => 408,
                _ => 500,
            },
            Error::BadRequest(_) => 400,
            Error::RequestTimeout => 408,
            Error::RequestLineTooLong => 414,
            Error::HeadersTooLarge => 431,
            Error::VersionNotSupported => 505,
            Error::NotImplemented => 501,
            Error::PayloadTooLarge => 413,
            Error::IllegalPercentEncoding => 400,
            Error::PathTraversal => 403,
            Error::PermissionDenied => 403,
            Error::NotFound => 404,
            Error::CgiTimeout => 504,
            Error::CgiFailure(_) => 500,
            Error::CgiOutputTooLarge => 502,
            Error::Storage(ref e) if e.kind() == ErrorKind::PermissionDenied => 403,
            Error::Storage(_) => 500,
        }
    }

    /// Whether the connection can no longer be trusted to be in sync with
    /// the client after this error.
    ///
    /// Framing errors leave unread request bytes (or garbage) on the wire, so
    /// the only safe thing is to answer and hang up.
    pub fn closes_connection(&self) -> bool {
        match *self {
            Error::Parse(_)
            | Error::Io(_)
            | Error::BadRequest(_)
            | Error::RequestTimeout
            | Error::RequestLineTooLong
            | Error::HeadersTooLarge
            | Error::VersionNotSupported
            | Error::PayloadTooLarge => true,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Parse(ref e) => write!(f, "malformed request head: {}", e),
            Error::Io(ref e) => write!(f, "{}", e),
            Error::BadRequest(why) => write!(f, "bad request: {}", why),
            Error::RequestTimeout => f.write_str("client stalled mid-request"),
            Error::RequestLineTooLong => f.write_str("request line too long"),
            Error::HeadersTooLarge => f.write_str("request headers too large"),
            Error::VersionNotSupported => f.write_str("unsupported HTTP version"),
            Error::NotImplemented => f.write_str("not implemented"),
            Error::PayloadTooLarge => f.write_str("request body exceeds limit"),
            Error::IllegalPercentEncoding => f.write_str("illegal percent-encoding"),
            Error::PathTraversal => f.write_str("path escapes document root"),
            Error::PermissionDenied => f.write_str("permission denied"),
            Error::NotFound => f.write_str("not found"),
            Error::CgiTimeout => f.write_str("CGI script timed out"),
            Error::CgiFailure(ref why) => write!(f, "CGI failure: {}", why),
            Error::CgiOutputTooLarge => f.write_str("CGI output too large"),
            Error::Storage(ref e) => write!(f, "storage: {}", e),
        }
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Error {
        Error::Parse(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

#[test]
fn too_many_headers_is_431() {
    assert_eq!(Error::from(httparse::Error::TooManyHeaders).status(), 431);
    assert_eq!(Error::from(httparse::Error::HeaderName).status(), 400);
}

#[test]
fn io_errors_map_by_kind() {
    let missing = io::Error::new(ErrorKind::NotFound, "gone");
    let denied = io::Error::new(ErrorKind::PermissionDenied, "nope");
    let other = io::Error::new(ErrorKind::Other, "boom");

    assert_eq!(Error::from(missing).status(), 404);
    assert_eq!(Error::from(denied).status(), 403);
    assert_eq!(Error::from(other).status(), 500);
}

#[test]
fn handler_errors_keep_the_connection() {
    assert!(!Error::NotFound.closes_connection());
    assert!(!Error::CgiTimeout.closes_connection());
    assert!(!Error::Storage(io::Error::new(ErrorKind::Other, "disk full")).closes_connection());
    assert!(Error::PayloadTooLarge.closes_connection());
}
