//! Server configuration
//!
//! The on-disk format is an nginx-like block grammar; `parser` turns it into
//! the types below. Everything here is plain data: the router flattens it
//! into a lookup structure at startup and never touches it again.

pub mod lexer;
pub mod parser;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Largest `client_max_body_size` we accept: 1 GiB
pub const MAX_BODY_SIZE_CEILING: u64 = 1 << 30;

/// Body size when neither the server nor the location sets one: 1 MiB
pub const DEFAULT_BODY_SIZE: u64 = 1 << 20;

/// A holder for app configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<ServerBlock>,
    pub limits: Limits,
}

impl Config {
    /// Each distinct `(host, port)` pair, in declaration order
    pub fn listen_addresses(&self) -> Vec<(String, u16)> {
        let mut seen = Vec::new();
        for server in &self.servers {
            let addr = (server.host.clone(), server.port);
            if !seen.contains(&addr) {
                seen.push(addr);
            }
        }
        seen
    }
}

/// Knobs that the config file doesn't expose; compiled-in, with a couple of
/// CLI overrides.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Longest request line before we answer 414
    pub max_request_line: usize,
    /// Total size of the header section before we answer 431
    pub max_header_bytes: usize,
    pub max_headers: usize,
    pub keepalive_timeout: Duration,
    pub max_keepalive_requests: usize,
    pub cgi_timeout: Duration,
    /// Most CGI output we buffer before answering 502
    pub cgi_max_output: u64,
    pub workers: usize,
    /// How long to keep draining a client after an early 413
    pub linger_timeout: Duration,
    pub linger_bytes: u64,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_request_line: 8192,
            max_header_bytes: 8192,
            max_headers: 100,
            keepalive_timeout: Duration::from_secs(15),
            max_keepalive_requests: 1000,
            cgi_timeout: Duration::from_secs(5),
            cgi_max_output: MAX_BODY_SIZE_CEILING,
            workers: 256,
            linger_timeout: Duration::from_secs(2),
            linger_bytes: 16 << 20,
        }
    }
}

/// One `server { … }` block
#[derive(Debug, Clone)]
pub struct ServerBlock {
    pub host: String,
    pub port: u16,
    pub default_server: bool,
    pub server_names: Vec<String>,
    pub root: Option<PathBuf>,
    pub index: Vec<String>,
    pub autoindex: bool,
    /// Zero means unlimited
    pub client_max_body_size: u64,
    pub methods: MethodSet,
    pub error_pages: BTreeMap<u16, String>,
    pub locations: Vec<LocationBlock>,
    /// Line of the `server` keyword, for diagnostics
    pub line: usize,
}

impl ServerBlock {
    /// Whether this block catches requests whose Host matches nothing
    pub fn is_default(&self) -> bool {
        self.default_server || self.server_names.is_empty()
    }
}

impl Default for ServerBlock {
    fn default() -> ServerBlock {
        ServerBlock {
            host: String::from("0.0.0.0"),
            port: 80,
            default_server: false,
            server_names: Vec::new(),
            root: None,
            index: vec![String::from("index.html")],
            autoindex: false,
            client_max_body_size: DEFAULT_BODY_SIZE,
            methods: default_methods(),
            error_pages: BTreeMap::new(),
            locations: Vec::new(),
            line: 0,
        }
    }
}

/// One `location … { … }` block
///
/// `None` fields inherit from the enclosing location or server.
#[derive(Debug, Clone)]
pub struct LocationBlock {
    pub pattern: LocationPattern,
    pub methods: Option<MethodSet>,
    pub root: Option<PathBuf>,
    pub index: Option<Vec<String>>,
    pub autoindex: Option<bool>,
    pub redirect: Option<Redirect>,
    pub upload_store: Option<PathBuf>,
    pub client_max_body_size: Option<u64>,
    /// Extension (with its dot) to interpreter; `None` runs the script itself
    pub cgi_handlers: BTreeMap<String, Option<PathBuf>>,
    pub error_pages: BTreeMap<u16, String>,
    pub children: Vec<LocationBlock>,
    pub line: usize,
}

impl LocationBlock {
    pub fn new(pattern: LocationPattern, line: usize) -> LocationBlock {
        LocationBlock {
            pattern: pattern,
            methods: None,
            root: None,
            index: None,
            autoindex: None,
            redirect: None,
            upload_store: None,
            client_max_body_size: None,
            cgi_handlers: BTreeMap::new(),
            error_pages: BTreeMap::new(),
            children: Vec::new(),
            line: line,
        }
    }
}

/// How a location matches request paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationPattern {
    /// `location = /path`
    Exact(String),
    /// `location /path`
    Prefix(String),
    /// `location ~ \.ext$` or `location ~* \.ext$`; `ext` has no dot
    Extension { ext: String, case_insensitive: bool },
}

impl fmt::Display for LocationPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LocationPattern::Exact(ref p) => write!(f, "= {}", p),
            LocationPattern::Prefix(ref p) => f.write_str(p),
            LocationPattern::Extension { ref ext, case_insensitive: false } =>
                write!(f, "~ \\.{}$", ext),
            LocationPattern::Extension { ref ext, case_insensitive: true } =>
                write!(f, "~* \\.{}$", ext),
        }
    }
}

/// A `return CODE [TARGET]` directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub code: u16,
    pub target: Option<String>,
}

impl Redirect {
    pub fn is_redirect(&self) -> bool {
        match self.code {
            301 | 302 | 303 | 307 | 308 => true,
            _ => false,
        }
    }
}

/// The request methods the server knows about
///
/// Ordering follows declaration order, which is also the order methods are
/// listed in `Allow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
}

pub type MethodSet = BTreeSet<Method>;

/// `GET HEAD POST DELETE`
pub fn default_methods() -> MethodSet {
    [Method::Get, Method::Head, Method::Post, Method::Delete].iter().cloned().collect()
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
        }
    }
}

impl FromStr for Method {
    type Err = ();

    /// Method tokens are case-sensitive
    fn from_str(s: &str) -> Result<Method, ()> {
        match s {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            "OPTIONS" => Ok(Method::Options),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renders a method set the way `Allow` wants it: `GET, HEAD, POST`
pub fn allow_header(methods: &MethodSet) -> String {
    methods.iter().map(Method::as_str).collect::<Vec<_>>().join(", ")
}

/// Parses `N`, `Nk`, `Nm` or `Ng` (suffix case-insensitive) into bytes.
///
/// Returns `None` for anything malformed, including negative numbers and
/// values that overflow.
pub fn parse_size(text: &str) -> Option<u64> {
    let (digits, multiplier) = match text.chars().last() {
        Some('k') | Some('K') => (&text[..text.len() - 1], 1u64 << 10),
        Some('m') | Some('M') => (&text[..text.len() - 1], 1u64 << 20),
        Some('g') | Some('G') => (&text[..text.len() - 1], 1u64 << 30),
        Some(_) => (text, 1),
        None => return None,
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    digits.parse::<u64>().ok().and_then(|n| n.checked_mul(multiplier))
}
