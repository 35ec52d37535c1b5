//! Buffered reads from one client socket
//!
//! Heads and bodies are pulled out of a single buffer, so whatever the
//! client pipelined after one request is still there for the next.

use crate::config::{Limits, MAX_BODY_SIZE_CEILING};
use crate::errors::{Error, Result};
use crate::server::request::Framing;

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::str;
use std::time::Instant;

const READ_CHUNK: usize = 8192;

/// Longest chunk-size or trailer line we put up with
const MAX_CHUNK_LINE: usize = 4096;

pub struct Connection {
    stream: TcpStream,
    buffer: Vec<u8>,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

fn is_timeout(e: &io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
}

/// Index just past the blank line ending the head, if it's all here
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(i) = buf[from..].iter().position(|&b| b == b'\n') {
        let newline = from + i;
        let rest = &buf[newline + 1..];
        if rest.starts_with(b"\n") {
            return Some(newline + 2);
        }
        if rest.starts_with(b"\r\n") {
            return Some(newline + 3);
        }
        from = newline + 1;
    }
    None
}

impl Connection {
    pub fn new(stream: TcpStream, limits: &Limits) -> io::Result<Connection> {
        stream.set_read_timeout(Some(limits.keepalive_timeout))?;
        stream.set_write_timeout(Some(limits.keepalive_timeout))?;

        Ok(Connection {
            peer_addr: stream.peer_addr()?,
            local_addr: stream.local_addr()?,
            stream: stream,
            buffer: Vec::new(),
        })
    }

    /// One read into the buffer. `Ok(0)` means the client hung up.
    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                },
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Fills until at least `n` bytes are buffered
    fn ensure(&mut self, n: usize) -> Result<()> {
        while self.buffer.len() < n {
            match self.fill() {
                Ok(0) => return Err(Error::BadRequest("connection closed mid-body")),
                Ok(_) => (),
                Err(ref e) if is_timeout(e) => return Err(Error::RequestTimeout),
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Reads up to and including the blank line after the header fields.
    ///
    /// `None` means the client went away (or idled out) between requests,
    /// which isn't worth an answer.
    pub fn read_head(&mut self, limits: &Limits) -> Result<Option<Vec<u8>>> {
        let mut started_at = None;

        loop {
            // Stray empty lines between requests are allowed (RFC 7230 §3.5)
            let blank = self.buffer.iter().take_while(|&&b| b == b'\r' || b == b'\n').count();
            self.buffer.drain(..blank);

            match find_head_end(&self.buffer) {
                Some(end) => {
                    check_head_size(&self.buffer[..end], limits)?;
                    return Ok(Some(self.buffer.drain(..end).collect()));
                },
                None => check_head_size(&self.buffer, limits)?,
            }

            let started = !self.buffer.is_empty();
            if started {
                let since = *started_at.get_or_insert_with(Instant::now);
                if since.elapsed() > limits.keepalive_timeout {
                    return Err(Error::RequestTimeout);
                }
            }

            match self.fill() {
                Ok(0) if !started => return Ok(None),
                Ok(0) => return Err(Error::BadRequest("connection closed mid-request")),
                Ok(_) => (),
                Err(ref e) if is_timeout(e) && !started => return Ok(None),
                Err(ref e) if is_timeout(e) => return Err(Error::RequestTimeout),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Reads the body that `framing` announces, refusing to keep more than
    /// `limit` bytes of it. A `limit` of 0 still stops at the hard ceiling.
    pub fn read_body(&mut self, framing: Framing, limit: u64) -> Result<Vec<u8>> {
        let limit = body_cap(limit);
        match framing {
            Framing::Empty => Ok(Vec::new()),
            Framing::Length(n) => {
                if n > limit {
                    return Err(Error::PayloadTooLarge);
                }
                let n = n as usize;
                self.ensure(n)?;
                Ok(self.buffer.drain(..n).collect())
            },
            Framing::Chunked => self.read_chunked(limit),
        }
    }

    fn read_chunked(&mut self, limit: u64) -> Result<Vec<u8>> {
        let mut body = Vec::new();

        loop {
            let line = self.read_line()?;
            let size = chunk_size(&line)?;

            if size == 0 {
                // Trailer fields, discarded
                while !self.read_line()?.is_empty() {}
                return Ok(body);
            }

            if (body.len() as u64).saturating_add(size) > limit {
                return Err(Error::PayloadTooLarge);
            }

            // Bounded by the cap above, so this can't wrap
            let size = size as usize;
            self.ensure(size + 1)?;
            body.extend(self.buffer.drain(..size));

            if self.buffer.starts_with(b"\n") {
                self.buffer.drain(..1);
            }
            else {
                self.ensure(2)?;
                if !self.buffer.starts_with(b"\r\n") {
                    return Err(Error::BadRequest("chunk data not followed by CRLF"));
                }
                self.buffer.drain(..2);
            }
        }
    }

    /// One line, without its line ending
    fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(i) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..i + 1).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(line);
            }

            if self.buffer.len() > MAX_CHUNK_LINE {
                return Err(Error::BadRequest("chunk line too long"));
            }
            self.ensure(self.buffer.len() + 1)?;
        }
    }

    /// Sends an interim `100 Continue`
    pub fn send_continue(&mut self) -> io::Result<()> {
        self.stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
        self.stream.flush()
    }

    #[inline]
    pub fn writer(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Stops sending, then drains whatever the client is still pushing for
    /// a bounded time so it reads our response instead of a reset.
    pub fn linger_close(mut self, limits: &Limits) {
        if self.stream.shutdown(Shutdown::Write).is_err() {
            return;
        }
        let _ = self.stream.set_read_timeout(Some(limits.linger_timeout));

        let deadline = Instant::now() + limits.linger_timeout;
        let mut drained = 0;
        let mut chunk = [0u8; READ_CHUNK];
        while Instant::now() < deadline && drained < limits.linger_bytes {
            match self.stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n as u64,
            }
        }
    }
}

/// 414 or 431 for a (possibly partial) head that is already too big
fn check_head_size(head: &[u8], limits: &Limits) -> Result<()> {
    match head.iter().position(|&b| b == b'\n') {
        None if head.len() > limits.max_request_line + 1 => Err(Error::RequestLineTooLong),
        None => Ok(()),
        Some(line_end) if line_end > limits.max_request_line + 1 => Err(Error::RequestLineTooLong),
        Some(line_end) if head.len() - line_end > limits.max_header_bytes + 3 =>
            Err(Error::HeadersTooLarge),
        Some(_) => Ok(()),
    }
}

fn body_cap(limit: u64) -> u64 {
    if limit == 0 || limit > MAX_BODY_SIZE_CEILING {
        MAX_BODY_SIZE_CEILING
    }
    else {
        limit
    }
}

/// The hex size at the front of a chunk line; extensions are ignored
fn chunk_size(line: &[u8]) -> Result<u64> {
    let digits = line.split(|&b| b == b';').next().unwrap_or(&[]);
    let digits = str::from_utf8(digits)
        .map_err(|_| Error::BadRequest("invalid chunk size"))?
        .trim_matches(|c| c == ' ' || c == '\t');

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::BadRequest("invalid chunk size"));
    }
    u64::from_str_radix(digits, 16).map_err(|_| Error::BadRequest("chunk size overflows"))
}
