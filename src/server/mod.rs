//! Server functionality
//!
//! One accept thread per listening address hands connections to a fixed
//! pool of workers. A worker owns its connection for its whole life and
//! answers requests on it one after another.

pub mod request;
pub mod response;
pub mod router;
pub mod static_files;
pub mod upload;
mod connection;

use crate::cgi::{self, Gateway};
use crate::config::{Config, Limits, Method, Redirect};
use crate::errors::{Error, Result};
use crate::log_util::{ascii_escape, ascii_escape_truncated};
use crate::server::connection::Connection;
use crate::server::request::{parse_head, Framing, Head, Request, Target, Version};
use crate::server::response::{error_messages, Response};
use crate::server::router::{Route, RoutingTable};
use crate::server::static_files::Statics;
use crate::server::upload::Uploads;

use threadpool::ThreadPool;

use std::io::{BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

/// Values which can handle requests
pub trait Handler {
    fn handle(&self, req: &Request, route: &Route) -> Result<Response>;
}

/// HTTP header fields, in the order they arrived
///
/// Lookups ignore ASCII case. A repeated name is kept as separate entries
/// and never merged.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, Vec<u8>)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers { entries: Vec::new() }
    }

    pub fn append<V: Into<Vec<u8>>>(&mut self, name: &str, value: V) {
        self.entries.push((String::from(name), value.into()));
    }

    /// The first value for `name`
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.iter()
            .find(|entry| entry.0.eq_ignore_ascii_case(name))
            .map(|entry| entry.1.as_slice())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.entries.iter()
            .filter(move |entry| entry.0.eq_ignore_ascii_case(name))
            .map(|entry| entry.1.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|entry| !entry.0.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|entry| (entry.0.as_str(), entry.1.as_slice()))
    }
}

/// Everything the workers share
struct Server {
    routes: RoutingTable,
    limits: Limits,
    statics: Statics,
    uploads: Uploads,
    gateway: Gateway,
}

/// What to send back, and whether the connection survives it
struct Answer {
    response: Response,
    close: bool,
}

impl Answer {
    fn new(response: Response) -> Answer {
        Answer { response: response, close: false }
    }

    /// The error page for `e`. The connection closes when the error says so,
    /// or when an unread body is still in the way.
    fn error(e: Error, route: Option<&Route>, body_pending: bool) -> Answer {
        match e {
            Error::Io(_) | Error::Storage(_) | Error::CgiFailure(_) | Error::CgiTimeout =>
                warn!("Request failed: {}", e),
            _ => debug!("Request refused: {}", e),
        }

        Answer {
            close: e.closes_connection() || body_pending,
            response: error_messages::error_page(e.status(), route),
        }
    }
}

/// The response for a location with a `return` directive
fn returned(ret: &Redirect, route: &Route) -> Response {
    match ret.target {
        Some(ref target) if ret.is_redirect() => Response::redirect(ret.code, target),
        Some(ref text) => Response::with_body(ret.code, "text/plain", text.clone().into_bytes()),
        None if ret.code >= 400 => error_messages::error_page(ret.code, Some(route)),
        None => Response::new(ret.code),
    }
}

fn with_allow(mut res: Response, route: &Route) -> Response {
    res.headers_mut().append("Allow", route.allow());
    res
}

fn expects_continue(head: &Head) -> bool {
    head.version == Version::Http11
        && head.headers.get("Expect").map_or(false, |v| v.eq_ignore_ascii_case(b"100-continue"))
}

impl Server {
    fn new(config: &Config) -> Server {
        Server {
            routes: RoutingTable::new(config),
            limits: config.limits.clone(),
            statics: Statics::new(),
            uploads: Uploads::new(),
            gateway: Gateway::new(config.limits.cgi_timeout, config.limits.cgi_max_output),
        }
    }

    /// Serves requests on one connection, accepted on the `listen` address
    /// `addr:port`, until either side is done with it
    fn handle_client(&self, stream: TcpStream, addr: &str, port: u16) {
        let mut conn = match Connection::new(stream, &self.limits) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed connection setup: {}", e);
                return;
            },
        };

        let mut served = 0;
        loop {
            let raw = match conn.read_head(&self.limits) {
                Ok(Some(raw)) => raw,
                Ok(None) => return,
                Err(Error::Io(e)) => {
                    debug!("Connection from {} failed: {}", conn.peer_addr, e);
                    return;
                },
                Err(e) => {
                    warn!("Unreadable request from {}: {}", conn.peer_addr, e);
                    let answer = Answer::error(e, None, true);
                    self.send(conn, answer, false, false);
                    return;
                },
            };
            served += 1;

            let head = match parse_head(&raw, &self.limits) {
                Ok(head) => head,
                Err(e) => {
                    warn!("Malformed request from {}: {} in {}",
                          conn.peer_addr, e, ascii_escape_truncated(&raw, 200));
                    let answer = Answer::error(e, None, true);
                    info!("{} \"{}\" {}", conn.peer_addr,
                          ascii_escape_truncated(&raw, 80), answer.response.status());
                    self.send(conn, answer, false, false);
                    return;
                },
            };

            let keep_alive = head.keep_alive() && served < self.limits.max_keepalive_requests;
            let head_only = head.method == "HEAD";
            let summary = format!("{} {}", ascii_escape(head.method.as_bytes()),
                                  ascii_escape(head.target.as_bytes()));

            let answer = self.answer(&mut conn, head, addr, port);
            info!("{} \"{}\" {}", conn.peer_addr, summary, answer.response.status());

            let keep_alive = keep_alive && !answer.close;
            match self.send(conn, answer, head_only, keep_alive) {
                Some(kept) => conn = kept,
                None => return,
            }
        }
    }

    /// Writes the answer. Hands the connection back if it stays open.
    fn send(&self, mut conn: Connection, answer: Answer, head_only: bool, keep_alive: bool)
            -> Option<Connection>
    {
        let written = {
            let mut out = BufWriter::new(conn.writer());
            answer.response.write_to(&mut out, head_only, keep_alive)
                .and_then(|()| out.flush())
        };

        if let Err(e) = written {
            debug!("Writing response to {}: {}", conn.peer_addr, e);
            return None;
        }

        if keep_alive {
            Some(conn)
        }
        else {
            if answer.close {
                conn.linger_close(&self.limits);
            }
            None
        }
    }

    /// Reads the rest of the request `head` starts and works out the answer
    fn answer(&self, conn: &mut Connection, head: Head, addr: &str, port: u16) -> Answer {
        let framing = match head.framing() {
            Ok(framing) => framing,
            Err(e) => return Answer::error(e, None, true),
        };
        let pending = framing != Framing::Empty;

        let method = match head.method.parse::<Method>() {
            Ok(method) => method,
            Err(()) => return Answer::error(Error::NotImplemented, None, pending),
        };

        let target = match Target::parse(&head.target) {
            Ok(target) => target,
            Err(e) => return Answer::error(e, None, pending),
        };
        if target.asterisk && method != Method::Options {
            return Answer::error(Error::BadRequest("'*' target is only for OPTIONS"), None, pending);
        }

        let host = match head.host(&target) {
            Ok(host) => host,
            Err(e) => return Answer::error(e, None, pending),
        };

        let vhost = match self.routes.virtual_host(addr, port, host.as_deref()) {
            Some(vhost) => vhost,
            None => return Answer::error(Error::NotFound, None, pending),
        };
        let route = if target.asterisk {
            vhost.fallback()
        }
        else {
            vhost.route(&target.path)
        };

        let limit = route.client_max_body_size;
        if let Framing::Length(n) = framing {
            if limit > 0 && n > limit {
                return Answer::error(Error::PayloadTooLarge, Some(route), true);
            }
        }
        if pending && expects_continue(&head) {
            if let Err(e) = conn.send_continue() {
                return Answer::error(Error::Io(e), Some(route), true);
            }
        }

        let body = match conn.read_body(framing, limit) {
            Ok(body) => body,
            Err(e) => return Answer::error(e, Some(route), true),
        };

        let req = Request {
            method: method,
            target: target,
            version: head.version,
            headers: head.headers,
            host: host,
            body: body,
            peer_addr: conn.peer_addr,
            local_addr: conn.local_addr,
        };

        match self.dispatch(&req, route) {
            Ok(res) => Answer::new(res),
            Err(e) => Answer::error(e, Some(route), false),
        }
    }

    /// Location policy first, then whichever handler owns the request
    fn dispatch(&self, req: &Request, route: &Route) -> Result<Response> {
        if req.target.asterisk {
            return Ok(with_allow(Response::new(204), route));
        }

        if let Some(ref ret) = route.redirect {
            return Ok(returned(ret, route));
        }

        if !route.allows(req.method) {
            return Ok(with_allow(error_messages::error_page(405, Some(route)), route));
        }

        match req.method {
            Method::Options => Ok(with_allow(Response::new(204), route)),
            Method::Patch => Err(Error::NotImplemented),
            _ if cgi::locate(&route.cgi_handlers, &req.target.path).is_some() =>
                self.gateway.handle(req, route),
            Method::Post | Method::Put if route.upload_store.is_some() =>
                self.uploads.handle(req, route),
            Method::Put => Err(Error::PermissionDenied),
            Method::Delete => self.statics.delete(req, route),
            Method::Get | Method::Head | Method::Post => self.statics.handle(req, route),
        }
    }
}

/// Binds every configured address and serves until the process exits.
pub fn serve(config: Config) -> Result<()> {
    let mut listeners = Vec::new();
    for (host, port) in config.listen_addresses() {
        let listener = TcpListener::bind((host.as_str(), port)).map_err(|e| {
            error!("Could not bind {}:{}: {}", host, port, e);
            Error::Io(e)
        })?;
        info!("Listening on {}", listener.local_addr()?);
        listeners.push((listener, host, port));
    }

    let workers = config.limits.workers;
    let server = Arc::new(Server::new(&config));
    let pool = ThreadPool::with_name(String::from("worker"), workers);
    info!("Serving with {} workers", workers);

    let mut acceptors = Vec::new();
    for (listener, host, port) in listeners {
        let server = server.clone();
        let pool = pool.clone();
        let acceptor = thread::Builder::new()
            .name(format!("accept {}", listener.local_addr()?))
            .spawn(move || accept_loop(listener, server, pool, host, port))?;
        acceptors.push(acceptor);
    }

    for acceptor in acceptors {
        if acceptor.join().is_err() {
            error!("An accept thread panicked");
        }
    }

    Ok(())
}

fn accept_loop(listener: TcpListener, server: Arc<Server>, pool: ThreadPool,
               host: String, port: u16)
{
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let server = server.clone();
                let host = host.clone();
                pool.execute(move || server.handle_client(stream, &host, port));
            },
            Err(e) => warn!("Failed connection: {}", e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::parser::parse_str;

    use std::fs;
    use std::io::Read;
    use std::net::{Shutdown, SocketAddr};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn headers_ignore_case_and_keep_duplicates() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("content-type", "text/plain");
        headers.append("set-cookie", "b=2");

        assert_eq!(headers.get("CONTENT-TYPE"), Some(&b"text/plain"[..]));
        let cookies: Vec<&[u8]> = headers.get_all("Set-Cookie").collect();
        assert_eq!(cookies, vec![&b"a=1"[..], &b"b=2"[..]]);

        // The value outlives the name it was looked up with
        let value = {
            let name = String::from("Content-Type");
            headers.get(&name)
        };
        assert_eq!(value, Some(&b"text/plain"[..]));

        headers.remove("SET-COOKIE");
        assert!(!headers.contains("Set-Cookie"));
        assert_eq!(headers.iter().count(), 1);
    }

    /// Serves `config` (with `{port}` filled in) on a fresh loopback port
    fn start_with<F: FnOnce(&mut Config)>(config: &str, tweak: F) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = parse_str(&config.replace("{port}", &addr.port().to_string())).unwrap();
        config.limits.keepalive_timeout = Duration::from_secs(2);
        tweak(&mut config);

        let server = Arc::new(Server::new(&config));
        let port = addr.port();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let server = server.clone();
                let stream = stream.unwrap();
                thread::spawn(move || server.handle_client(stream, "127.0.0.1", port));
            }
        });
        addr
    }

    fn start(config: &str) -> SocketAddr {
        start_with(config, |_| ())
    }

    /// Sends `raw`, half-closes, and reads everything the server says
    fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.write_all(raw).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out);
        String::from_utf8_lossy(&out).into_owned()
    }

    fn get(addr: SocketAddr, path: &str) -> String {
        exchange(addr, format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
    }

    fn status(response: &str) -> u16 {
        response.get(9..12).and_then(|s| s.parse().ok()).unwrap_or(0)
    }

    fn body(response: &str) -> &str {
        match response.find("\r\n\r\n") {
            Some(i) => &response[i + 4..],
            None => "",
        }
    }

    fn site() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), "<p>home</p>").unwrap();
        fs::write(dir.path().join("exact"), "unique-marker-42").unwrap();
        fs::write(dir.path().join("404.html"), "custom missing page").unwrap();
        fs::create_dir(dir.path().join("small_limit")).unwrap();
        dir
    }

    fn basic_config(root: &Path) -> String {
        format!(r#"
            server {{
                listen 127.0.0.1:{{port}};
                root {root};
                error_page 404 /404.html;

                location / {{ }}
                location = /exact {{
                    methods GET;
                }}
                location /small_limit {{
                    client_max_body_size 50k;
                    upload_store {root}/uploads;
                }}
                location /old-page {{
                    return 301 /new-page;
                }}
                location /teapot {{
                    return 418 "short and stout";
                }}
                location /unlimited {{
                    client_max_body_size 0;
                    upload_store {root}/uploads;
                }}
            }}
        "#, root = root.display())
    }

    #[test]
    fn serves_static_files() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));

        let res = get(addr, "/");
        assert_eq!(status(&res), 200);
        assert!(res.contains("Content-Length: 11\r\n"));
        assert!(res.contains("Server: webserv\r\n"));
        assert!(res.contains("Date: "));
        assert_eq!(body(&res), "<p>home</p>");

        // Repeated GETs see the same thing
        assert_eq!(body(&get(addr, "/index.html")), body(&get(addr, "/index.html")));
    }

    #[test]
    fn head_has_length_but_no_body() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));
        let res = exchange(addr, b"HEAD /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(status(&res), 200);
        assert!(res.contains("Content-Length: 11\r\n"));
        assert_eq!(body(&res), "");
    }

    #[test]
    fn custom_error_page_keeps_status() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));
        let res = get(addr, "/missing.html");
        assert_eq!(status(&res), 404);
        assert_eq!(body(&res), "custom missing page");
    }

    #[test]
    fn exact_location_and_method_policy() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));

        let res = get(addr, "/exact");
        assert_eq!(status(&res), 200);
        assert!(body(&res).contains("unique-marker-42"));

        let res = exchange(addr, b"POST /exact HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(status(&res), 405);
        assert!(res.contains("\r\nAllow: GET\r\n"));
    }

    #[test]
    fn unknown_methods_are_not_implemented() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));
        let res = exchange(addr, b"PROPFIND / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(status(&res), 501);
        let res = exchange(addr, b"get / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(status(&res), 501);
    }

    #[test]
    fn body_size_limit() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));

        let small = vec![b'a'; 40 * 1024];
        let mut raw = Vec::from(format!("POST /small_limit HTTP/1.1\r\nHost: x\r\n\
                                         Content-Length: {}\r\n\r\n", small.len()).as_bytes());
        raw.extend_from_slice(&small);
        let res = exchange(addr, &raw);
        assert_eq!(status(&res), 201);

        let big = vec![b'a'; 60 * 1024];
        let mut raw = Vec::from(format!("POST /small_limit HTTP/1.1\r\nHost: x\r\n\
                                         Content-Length: {}\r\n\r\n", big.len()).as_bytes());
        raw.extend_from_slice(&big);
        let res = exchange(addr, &raw);
        assert_eq!(status(&res), 413);
        assert!(res.contains("Connection: close\r\n"));
    }

    #[test]
    fn chunked_body_over_limit() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));

        let mut raw = Vec::from(&b"POST /small_limit HTTP/1.1\r\nHost: x\r\n\
                                   Transfer-Encoding: chunked\r\n\r\n"[..]);
        for _ in 0..4 {
            raw.extend_from_slice(b"4000\r\n");
            raw.extend_from_slice(&[b'z'; 0x4000]);
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"0\r\n\r\n");
        assert_eq!(status(&exchange(addr, &raw)), 413);
    }

    #[test]
    fn huge_chunk_without_body_limit() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));
        let res = exchange(addr, b"POST /unlimited HTTP/1.1\r\nHost: x\r\n\
                                   Transfer-Encoding: chunked\r\n\r\n\
                                   ffffffffffffffff\r\nabc\r\n0\r\n\r\n");
        assert_eq!(status(&res), 413);
        assert!(res.contains("Connection: close\r\n"));
    }

    #[test]
    fn chunked_upload() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));
        let res = exchange(addr, b"PUT /small_limit/note.txt HTTP/1.1\r\nHost: x\r\n\
                                   Transfer-Encoding: chunked\r\n\r\n\
                                   5\r\nhello\r\n0\r\n\r\n");
        assert_eq!(status(&res), 201);
        assert_eq!(fs::read(dir.path().join("uploads").join("note.txt")).unwrap(), b"hello");
    }

    #[test]
    fn returns() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));

        let res = get(addr, "/old-page");
        assert_eq!(status(&res), 301);
        assert!(res.contains("\r\nLocation: /new-page\r\n"));

        let res = get(addr, "/teapot");
        assert_eq!(status(&res), 418);
        assert_eq!(body(&res), "short and stout");
    }

    #[test]
    fn traversal_is_contained() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));
        assert_eq!(status(&get(addr, "/../../etc/passwd")), 403);
        assert_eq!(status(&get(addr, "/%2e%2e/%2e%2e/etc/passwd")), 403);
        assert_eq!(status(&get(addr, "/a%00b")), 400);
    }

    #[test]
    fn protocol_errors() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));

        assert_eq!(status(&exchange(addr, b"GET / HTTP/1.1\r\n\r\n")), 400);
        assert_eq!(status(&exchange(addr, b"GET / HTTP/2.0\r\nHost: x\r\n\r\n")), 505);
        assert_eq!(status(&exchange(addr, b"GET / HTTP/1.1\r\nHost: x\r\n folded\r\n\r\n")), 400);
        assert_eq!(status(&exchange(addr, b"POST / HTTP/1.1\r\nHost: x\r\n\
                                            Content-Length: 1\r\nContent-Length: 2\r\n\r\nab")), 400);
        assert_eq!(status(&exchange(addr, b"POST / HTTP/1.1\r\nHost: x\r\n\
                                            Transfer-Encoding: gzip\r\n\r\n")), 501);

        let long = format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", "a".repeat(9000));
        assert_eq!(status(&exchange(addr, long.as_bytes())), 414);
    }

    #[test]
    fn oversized_header_sections() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));

        let big = format!("GET / HTTP/1.1\r\nHost: x\r\nX-Big: {}\r\n\r\n", "a".repeat(9000));
        let res = exchange(addr, big.as_bytes());
        assert_eq!(status(&res), 431);
        assert!(res.contains("Connection: close\r\n"));

        let mut many = String::from("GET / HTTP/1.1\r\nHost: x\r\n");
        for i in 0..150 {
            many.push_str(&format!("X-{}: y\r\n", i));
        }
        many.push_str("\r\n");
        assert_eq!(status(&exchange(addr, many.as_bytes())), 431);
    }

    /// Sends `raw` but keeps the connection open, as a stalled client would
    fn stall(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.write_all(raw).unwrap();

        let mut out = Vec::new();
        let _ = stream.read_to_end(&mut out);
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn stalled_requests_time_out() {
        let dir = site();
        let addr = start_with(&basic_config(dir.path()), |config| {
            config.limits.keepalive_timeout = Duration::from_millis(300);
            config.limits.linger_timeout = Duration::from_millis(300);
        });

        let res = stall(addr, b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(status(&res), 408);
        assert!(res.contains("Connection: close\r\n"));

        let res = stall(addr, b"POST /small_limit HTTP/1.1\r\nHost: x\r\n\
                                Content-Length: 10\r\n\r\nabc");
        assert_eq!(status(&res), 408);
    }

    #[test]
    fn keep_alive_and_pipelining() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));

        let res = exchange(addr, b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n\
                                   GET /missing HTTP/1.1\r\nHost: x\r\n\r\n\
                                   GET /index.html HTTP/1.0\r\n\r\n");
        let statuses: Vec<&str> = res.matches("HTTP/1.1 ").collect();
        assert_eq!(statuses.len(), 3);
        assert!(res.find("200 OK").unwrap() < res.find("404 Not Found").unwrap());
        assert_eq!(res.matches("Connection: keep-alive").count(), 2);
        assert!(res.ends_with("<p>home</p>"));
    }

    #[test]
    fn options() {
        let dir = site();
        let addr = start(&basic_config(dir.path()).replace("methods GET;", "methods GET OPTIONS;"));

        let res = exchange(addr, b"OPTIONS * HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(status(&res), 204);
        assert!(res.contains("\r\nAllow: GET, HEAD, POST, DELETE\r\n"));
        assert!(!res.contains("Content-Length"));

        let res = exchange(addr, b"OPTIONS /exact HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(status(&res), 204);
        assert!(res.contains("\r\nAllow: GET, OPTIONS\r\n"));
    }

    #[test]
    fn virtual_hosts_fall_back_to_default() {
        let one = site();
        let two = TempDir::new().unwrap();
        fs::write(two.path().join("index.html"), "second").unwrap();

        let addr = start(&format!(
            "server {{ listen 127.0.0.1:{{port}}; server_name one.test; root {}; }}\n\
             server {{ listen 127.0.0.1:{{port}} default_server; server_name two.test; root {}; }}",
            one.path().display(), two.path().display()));

        let ask = |host: &str| exchange(addr, format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", host)
                                            .as_bytes());
        assert_eq!(body(&ask("one.test")), "<p>home</p>");
        assert_eq!(body(&ask("ONE.test:8080")), "<p>home</p>");
        assert_eq!(body(&ask("two.test")), "second");
        assert_eq!(body(&ask("nobody.test")), "second");

        let absolute = exchange(addr, b"GET http://one.test/ HTTP/1.1\r\nHost: two.test\r\n\r\n");
        assert_eq!(body(&absolute), "<p>home</p>");
    }

    fn cgi_site(script: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("cgi-bin")).unwrap();
        fs::write(dir.path().join("cgi-bin").join("test.sh"), script).unwrap();
        fs::write(dir.path().join("cgi-bin").join("plain.txt"), "not a script").unwrap();
        fs::write(dir.path().join("outside.sh"), "echo should not run").unwrap();
        dir
    }

    fn cgi_config(root: &Path) -> String {
        format!("server {{ listen 127.0.0.1:{{port}}; root {};\n\
                   location /cgi-bin {{ cgi_handler .sh /bin/sh; }} }}",
                root.display())
    }

    const ECHO: &str = "printf 'Content-Type: text/plain\\r\\n'\n\
                        printf 'Set-Cookie: a=1\\r\\nSet-Cookie: b=2\\r\\n\\r\\n'\n\
                        printf 'QUERY_STRING: %s\\n' \"$QUERY_STRING\"\n\
                        printf 'HTTP_COOKIE: %s\\n' \"$HTTP_COOKIE\"\n\
                        printf 'PATH_INFO: %s\\n' \"$PATH_INFO\"\n\
                        printf 'BODY: '\n\
                        cat\n";

    #[test]
    fn cgi_environment_and_output() {
        let dir = cgi_site(ECHO);
        let addr = start(&cgi_config(dir.path()));

        let res = exchange(addr, b"POST /cgi-bin/test.sh/extra?a=1&b=2 HTTP/1.1\r\nHost: x\r\n\
                                   Cookie: c=3\r\nCookie: d=4\r\nContent-Length: 5\r\n\r\nhello");
        assert_eq!(status(&res), 200);
        assert!(res.contains("\r\nContent-Type: text/plain\r\n"));
        assert!(res.contains("\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n"));

        let text = body(&res);
        assert!(text.contains("QUERY_STRING: a=1&b=2\n"));
        assert!(text.contains("HTTP_COOKIE: c=3; d=4\n"));
        assert!(text.contains("PATH_INFO: /extra\n"));
        assert!(text.ends_with("BODY: hello"));
        assert!(res.contains(&format!("Content-Length: {}\r\n", text.len())));
    }

    #[test]
    fn cgi_only_inside_its_location() {
        let dir = cgi_site(ECHO);
        let addr = start(&cgi_config(dir.path()));

        let res = get(addr, "/outside.sh");
        assert_eq!(status(&res), 200);
        assert_eq!(body(&res), "echo should not run");
        assert_eq!(status(&get(addr, "/cgi-bin/missing.sh")), 404);
        assert_eq!(body(&get(addr, "/cgi-bin/plain.txt")), "not a script");
    }

    #[test]
    fn cgi_failures() {
        let dir = cgi_site("echo 'no headers here'\nexit 3\n");
        let addr = start(&cgi_config(dir.path()));
        assert_eq!(status(&get(addr, "/cgi-bin/test.sh")), 500);
    }

    #[test]
    fn cgi_status_header() {
        let dir = cgi_site("printf 'Status: 404 Gone Fishing\\r\\n'\n\
                            printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
                            printf 'nothing here'\n");
        let addr = start(&cgi_config(dir.path()));

        let res = get(addr, "/cgi-bin/test.sh");
        assert!(res.starts_with("HTTP/1.1 404 Gone Fishing\r\n"));
        assert!(res.contains("\r\nContent-Type: text/plain\r\n"));
        assert!(!res.contains("Status:"));
        assert_eq!(body(&res), "nothing here");
    }

    #[test]
    fn cgi_output_is_capped() {
        let dir = cgi_site("printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
                            i=0\n\
                            while [ $i -lt 200 ]; do printf '0123456789'; i=$((i+1)); done\n");
        let addr = start_with(&cgi_config(dir.path()), |config| {
            config.limits.cgi_max_output = 1000;
        });
        assert_eq!(status(&get(addr, "/cgi-bin/test.sh")), 502);
    }

    #[test]
    fn direct_cgi_needs_execute_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("cgi-bin")).unwrap();
        let script = dir.path().join("cgi-bin").join("noexec.cgi");
        fs::write(&script, "#!/bin/sh\necho should not run\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();

        let addr = start(&format!("server {{ listen 127.0.0.1:{{port}}; root {};\n\
                                     location /cgi-bin {{ cgi_handler .cgi; }} }}",
                                  dir.path().display()));
        assert_eq!(status(&get(addr, "/cgi-bin/noexec.cgi")), 403);
    }

    #[test]
    fn cgi_timeout_kills_script() {
        let dir = cgi_site("sleep 30\n");
        let addr = start_with(&cgi_config(dir.path()), |config| {
            config.limits.cgi_timeout = Duration::from_millis(300);
        });
        assert_eq!(status(&get(addr, "/cgi-bin/test.sh")), 504);
    }

    #[test]
    fn delete_static_file() {
        let dir = site();
        let addr = start(&basic_config(dir.path()));
        fs::write(dir.path().join("doomed.txt"), "x").unwrap();

        let res = exchange(addr, b"DELETE /doomed.txt HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(status(&res), 204);
        assert!(!dir.path().join("doomed.txt").exists());
    }
}
