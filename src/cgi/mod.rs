//! CGI/1.1 script execution
//!
//! One child process per request. The request body goes in on stdin, the
//! document comes back on stdout, and stderr ends up in the debug log.

pub mod parser;

use crate::errors::{Error, Result};
use crate::filesystem::{contained_canonical, join_under};
use crate::log_util::ascii_escape;
use crate::server::request::Request;
use crate::server::response::{Body, Response};
use crate::server::router::Route;
use crate::server::Handler;

use std::collections::BTreeMap;
use std::env;
use std::fs::{self, canonicalize};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// A status line
#[derive(Debug, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason_phrase: Vec<u8>,
}

/// Other headers
#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    pub name: Vec<u8>,
    pub content: Vec<u8>,
}

/// The header portion of a document
#[derive(Debug, PartialEq, Eq)]
pub struct DocumentHeaders {
    pub content_type: Option<Vec<u8>>,
    pub status: Option<Status>,
    pub location: Option<Vec<u8>>,
    pub headers: Vec<Header>,
}

/// Where a request path splits into script and extra path
#[derive(Debug, PartialEq, Eq)]
pub struct ScriptPath<'a> {
    pub script_name: &'a str,
    pub path_info: &'a str,
    pub interpreter: Option<&'a Path>,
}

/// Finds the first path segment whose extension has a handler.
///
/// `/cgi-bin/test.py/extra` with a `.py` handler gives script name
/// `/cgi-bin/test.py` and path info `/extra`.
pub fn locate<'a>(handlers: &'a BTreeMap<String, Option<PathBuf>>, path: &'a str)
                  -> Option<ScriptPath<'a>>
{
    if handlers.is_empty() {
        return None;
    }

    let mut end = 0;
    for segment in path.split('/') {
        let segment_end = end + segment.len();

        if let Some(dot) = segment.rfind('.') {
            if let Some(interpreter) = handlers.get(&segment[dot..]) {
                return Some(ScriptPath {
                    script_name: &path[..segment_end],
                    path_info: &path[segment_end..],
                    interpreter: interpreter.as_ref().map(|p| p.as_path()),
                });
            }
        }

        end = segment_end + 1;
    }

    None
}

/// Runs CGI scripts with a hard wall-clock limit
pub struct Gateway {
    timeout: Duration,
    max_output: u64,
}

impl Gateway {
    pub fn new(timeout: Duration, max_output: u64) -> Gateway {
        Gateway {
            timeout: timeout,
            max_output: max_output,
        }
    }

    fn run(&self, mut command: Command, name: &str, body: &[u8]) -> Result<Vec<u8>> {
        let child = command.spawn()
            .map_err(|e| Error::CgiFailure(format!("could not start {}: {}", name, e)))?;
        let mut guard = ChildGuard { child: child, reaped: false };
        let deadline = Instant::now() + self.timeout;

        if let Some(mut stdin) = guard.child.stdin.take() {
            let body = body.to_vec();
            thread::Builder::new().name(String::from("cgi-stdin")).spawn(move || {
                match stdin.write_all(&body) {
                    Err(ref e) if e.kind() != ErrorKind::BrokenPipe =>
                        debug!("Writing CGI request body: {}", e),
                    _ => (),
                }
            })?;
        }

        if let Some(stderr) = guard.child.stderr.take() {
            let name = String::from(name);
            thread::Builder::new().name(String::from("cgi-stderr")).spawn(move || {
                for line in BufReader::new(stderr).split(b'\n') {
                    match line {
                        Ok(line) => debug!("{} stderr: {}", name, ascii_escape(&line)),
                        Err(_) => break,
                    }
                }
            })?;
        }

        let (tx, rx) = mpsc::channel();
        let max_output = self.max_output;
        if let Some(stdout) = guard.child.stdout.take() {
            thread::Builder::new().name(String::from("cgi-stdout")).spawn(move || {
                let mut output = Vec::new();
                let result = stdout.take(max_output + 1).read_to_end(&mut output).map(|_| output);
                let _ = tx.send(result);
            })?;
        }

        let output = match rx.recv_timeout(self.timeout) {
            Ok(Ok(ref output)) if output.len() as u64 > max_output => {
                warn!("{} wrote more than {} bytes; killing it", name, max_output);
                guard.kill();
                return Err(Error::CgiOutputTooLarge);
            },
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::CgiFailure(format!("reading output: {}", e))),
            Err(RecvTimeoutError::Timeout) => {
                warn!("{} timed out after {:?}; killing its process group", name, self.timeout);
                guard.kill();
                return Err(Error::CgiTimeout);
            },
            Err(RecvTimeoutError::Disconnected) =>
                return Err(Error::CgiFailure(String::from("no output pipe"))),
        };

        let status = guard.wait_until(deadline, name)?;
        if !status.success() {
            return Err(Error::CgiFailure(format!("{} exited with {}", name, status)));
        }

        Ok(output)
    }
}

impl Handler for Gateway {
    fn handle(&self, req: &Request, route: &Route) -> Result<Response> {
        let script = locate(&route.cgi_handlers, &req.target.path).ok_or(Error::NotFound)?;
        let root = route.root.as_ref().ok_or(Error::NotFound)?;
        let root = canonicalize(root).map_err(|_| Error::NotFound)?;

        let filename = contained_canonical(&root, &join_under(&root, script.script_name))
            .map_err(|e| match e {
                Error::Io(_) => Error::NotFound,
                e => e,
            })?;
        let meta = fs::metadata(&filename).map_err(Error::Storage)?;
        if !meta.is_file() {
            return Err(Error::NotFound);
        }

        let mut command = match script.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(&filename);
                c
            },
            None => {
                if meta.permissions().mode() & 0o111 == 0 {
                    warn!("CGI script {:?} is not executable", filename);
                    return Err(Error::PermissionDenied);
                }
                Command::new(&filename)
            },
        };

        if let Some(dir) = filename.parent() {
            command.current_dir(dir);
        }
        command.env_clear()
            .envs(meta_variables(req, &script, &filename, &root))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        debug!("Running CGI script {:?} via {:?}", filename, script.interpreter);
        let output = self.run(command, script.script_name, &req.body)?;
        response_from_document(&output)
    }
}

/// Kills the child's whole process group and reaps it, unless it has
/// already been waited for.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn kill(&mut self) {
        // The child leads its own process group
        unsafe {
            libc::killpg(self.child.id() as libc::pid_t, libc::SIGKILL);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }

    fn wait_until(&mut self, deadline: Instant, name: &str) -> Result<ExitStatus> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.reaped = true;
                return Ok(status);
            }

            if Instant::now() >= deadline {
                warn!("{} closed its output but did not exit in time; killing it", name);
                self.kill();
                return Err(Error::CgiTimeout);
            }

            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill();
        }
    }
}

/// The CGI/1.1 meta-variables for `req`, plus `PATH`.
pub fn meta_variables(req: &Request, script: &ScriptPath, filename: &Path, document_root: &Path)
                      -> Vec<(String, String)>
{
    let mut vars = Vec::new();
    let mut set = |name: &str, value: String| vars.push((String::from(name), value));

    set("PATH", env::var("PATH").unwrap_or_else(|_| String::from("/usr/local/bin:/usr/bin:/bin")));
    set("GATEWAY_INTERFACE", String::from("CGI/1.1"));
    set("REDIRECT_STATUS", String::from("200"));
    set("SERVER_SOFTWARE", String::from("webserv"));
    set("SERVER_PROTOCOL", String::from(req.version.as_str()));
    set("SERVER_NAME", req.host.clone().unwrap_or_else(|| req.local_addr.ip().to_string()));
    set("SERVER_PORT", req.local_addr.port().to_string());
    set("REMOTE_ADDR", req.peer_addr.ip().to_string());
    set("REMOTE_PORT", req.peer_addr.port().to_string());
    set("REQUEST_METHOD", String::from(req.method.as_str()));
    set("REQUEST_URI", req.target.request_uri());
    set("QUERY_STRING", req.target.query.clone().unwrap_or_default());
    set("SCRIPT_NAME", String::from(script.script_name));
    set("SCRIPT_FILENAME", filename.to_string_lossy().into_owned());
    set("DOCUMENT_ROOT", document_root.to_string_lossy().into_owned());
    set("PATH_INFO", String::from(script.path_info));
    if !script.path_info.is_empty() {
        set("PATH_TRANSLATED",
            join_under(document_root, script.path_info).to_string_lossy().into_owned());
    }
    set("CONTENT_LENGTH", req.body.len().to_string());
    if let Some(content_type) = req.headers.get("Content-Type") {
        set("CONTENT_TYPE", String::from_utf8_lossy(content_type).into_owned());
    }

    // One variable per header name; duplicates are folded
    let mut http: Vec<(String, String)> = Vec::new();
    for (name, value) in req.headers.iter() {
        let var = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        // CONTENT_TYPE and CONTENT_LENGTH carry these; HTTP_PROXY is httpoxy
        if var == "HTTP_CONTENT_TYPE" || var == "HTTP_CONTENT_LENGTH" || var == "HTTP_PROXY" {
            continue;
        }
        let value = String::from_utf8_lossy(value);
        match http.iter_mut().find(|entry| entry.0 == var) {
            Some(entry) => {
                entry.1.push_str(if entry.0 == "HTTP_COOKIE" { "; " } else { ", " });
                entry.1.push_str(&value);
            },
            None => http.push((var, value.into_owned())),
        }
    }
    vars.extend(http);

    vars
}

/// Turns the script's stdout into a response
pub fn response_from_document(output: &[u8]) -> Result<Response> {
    let (body, doc) = parser::doc_headers(output)
        .map_err(|_| Error::CgiFailure(String::from("malformed CGI response headers")))?;

    let mut res = match doc.status {
        Some(ref status) if status.code < 100 || status.code > 599 =>
            return Err(Error::CgiFailure(format!("bad CGI status {}", status.code))),
        Some(ref status) => {
            let mut res = Response::new(status.code);
            if !status.reason_phrase.is_empty() {
                res.set_reason(String::from_utf8_lossy(&status.reason_phrase).into_owned());
            }
            res
        },
        None if doc.location.is_some() => Response::new(302),
        None => Response::new(200),
    };

    {
        let headers = res.headers_mut();
        headers.append("Content-Type",
                       doc.content_type.unwrap_or_else(|| Vec::from(&b"text/html"[..])));
        if let Some(location) = doc.location {
            headers.append("Location", location);
        }
        for header in doc.headers {
            headers.append(&String::from_utf8_lossy(&header.name), header.content);
        }
    }

    res.set_body(Body::Bytes(Vec::from(body)));
    Ok(res)
}
