// src/conn.rs
//! Per-connection state machine: buffers, request parsing and the
//! two-segment (header block + mapped file) response.
//!
//! A connection is only ever touched by one thread at a time: the
//! dispatcher while it drains or flushes, or the single worker that
//! dequeued it for [`Connection::process`].

use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use tracing::debug;

use crate::config::{READ_BUF_SIZE, WRITE_BUF_SIZE};
use crate::file::{self, MappedFile};
use crate::http::{Method, Status};
use crate::metrics::ServerContext;
use crate::parser::{ParseOutcome, Parser};
use crate::response;

/// Result of one non-blocking read pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Socket drained for now; hand the connection to a worker.
    Ready,
    /// The peer closed its end.
    PeerClosed,
}

/// Result of one non-blocking scatter-write pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Socket buffer full; wait for write readiness.
    Partial,
    /// Response sent and the connection was reset for the next request.
    KeepAlive,
    /// Response sent; close the connection.
    Close,
}

/// What the dispatcher should do once a worker hands the connection back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Next {
    /// Request incomplete: wait for more bytes.
    #[default]
    Read,
    /// A response is staged: wait for write readiness.
    Write,
    /// Tear the connection down.
    Close,
}

pub struct Connection {
    ctx: Arc<ServerContext>,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,

    read_buf: Box<[u8; READ_BUF_SIZE]>,
    read_idx: usize,
    parser: Parser,

    write_buf: Box<[u8; WRITE_BUF_SIZE]>,
    write_idx: usize,
    file: Option<MappedFile>,
    bytes_to_send: usize,
    bytes_sent: usize,

    keep_alive: bool,
    status: Option<Status>,
    next: Next,
}

impl Connection {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            stream: None,
            peer: None,
            read_buf: Box::new([0; READ_BUF_SIZE]),
            read_idx: 0,
            parser: Parser::new(),
            write_buf: Box::new([0; WRITE_BUF_SIZE]),
            write_idx: 0,
            file: None,
            bytes_to_send: 0,
            bytes_sent: 0,
            keep_alive: false,
            status: None,
            next: Next::Read,
        }
    }

    /// Take ownership of a freshly accepted (non-blocking) socket.
    pub fn init(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.reset();
        self.stream = Some(stream);
        self.peer = Some(peer);
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn next(&self) -> Next {
        self.next
    }

    /// Status of the response currently staged, if any.
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Read everything the socket has into the read buffer.
    ///
    /// A full buffer stops the pass without error; `process` answers a
    /// request that cannot fit with 400.
    pub fn drain(&mut self) -> io::Result<Drain> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Drain::PeerClosed);
        };
        if self.read_idx >= READ_BUF_SIZE {
            return Err(io::Error::other("read buffer full"));
        }

        while self.read_idx < READ_BUF_SIZE {
            match stream.read(&mut self.read_buf[self.read_idx..]) {
                Ok(0) => return Ok(Drain::PeerClosed),
                Ok(n) => self.read_idx += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(Drain::Ready)
    }

    /// Worker entry point: parse what has arrived and stage a response.
    pub fn process(&mut self) -> Next {
        self.next = self.process_inner();
        self.next
    }

    fn process_inner(&mut self) -> Next {
        if self.stream.is_none() {
            return Next::Close;
        }

        let status = match self.parser.parse(&self.read_buf[..self.read_idx]) {
            ParseOutcome::Incomplete if self.read_idx < READ_BUF_SIZE => return Next::Read,
            ParseOutcome::Incomplete | ParseOutcome::Invalid => Status::BadRequest,
            ParseOutcome::Complete => {
                self.ctx.metrics.inc_req();
                self.do_request()
            }
        };

        if self.build_response(status) {
            Next::Write
        } else {
            Next::Close
        }
    }

    /// Map the requested file, or pick the error status.
    fn do_request(&mut self) -> Status {
        let head = self.parser.head();
        if head.method != Method::Get {
            return Status::BadRequest;
        }
        match file::resolve(&self.ctx.config.doc_root, &head.url) {
            Ok(mapped) => {
                self.file = Some(mapped);
                Status::Ok
            }
            Err(status) => status,
        }
    }

    /// Fill the write buffer. Falls back to a 500 if the header block does
    /// not fit; returns `false` if not even that fits.
    fn build_response(&mut self, status: Status) -> bool {
        let written = match (status, self.file.as_ref()) {
            (Status::Ok, Some(file)) => {
                self.keep_alive = self.parser.head().keep_alive;
                response::write_file_head(
                    &mut self.write_buf[..],
                    file.content_type(),
                    file.len(),
                    self.keep_alive,
                )
                .map(|len| (Status::Ok, len))
            }
            (status, _) => {
                self.keep_alive = false;
                response::write_error(&mut self.write_buf[..], status).map(|len| (status, len))
            }
        };

        let (status, len) = match written {
            Ok(done) => done,
            Err(_) => {
                self.file = None;
                self.keep_alive = false;
                match response::write_error(&mut self.write_buf[..], Status::InternalError) {
                    Ok(len) => (Status::InternalError, len),
                    Err(_) => return false,
                }
            }
        };

        self.write_idx = len;
        self.bytes_sent = 0;
        self.bytes_to_send = len + self.file.as_ref().map_or(0, MappedFile::len);
        self.status = Some(status);
        debug!(
            peer = ?self.peer,
            url = %self.parser.head().url,
            status = status.code(),
            bytes = self.bytes_to_send,
            "response staged"
        );
        true
    }

    /// Write as much of the staged response as the socket takes.
    pub fn flush(&mut self) -> io::Result<Flush> {
        if self.stream.is_none() {
            return Ok(Flush::Close);
        }
        if self.bytes_to_send == 0 {
            self.reset_for_next_request();
            return Ok(Flush::KeepAlive);
        }

        loop {
            let written = {
                let header = &self.write_buf[..self.write_idx];
                let body = self.file.as_ref().map_or(&[][..], MappedFile::bytes);
                let (header, body) = if self.bytes_sent < header.len() {
                    (&header[self.bytes_sent..], body)
                } else {
                    (&header[..0], &body[self.bytes_sent - header.len()..])
                };
                let iov = [IoSlice::new(header), IoSlice::new(body)];
                match self.stream.as_mut() {
                    Some(stream) => stream.write_vectored(&iov),
                    None => return Ok(Flush::Close),
                }
            };

            match written {
                Ok(0) => {
                    self.file = None;
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(n) => {
                    self.bytes_sent += n;
                    self.ctx.metrics.add_bytes(n);
                    if self.bytes_sent >= self.bytes_to_send {
                        self.file = None;
                        if self.keep_alive {
                            self.reset_for_next_request();
                            return Ok(Flush::KeepAlive);
                        }
                        return Ok(Flush::Close);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Partial),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.file = None;
                    return Err(e);
                }
            }
        }
    }

    fn reset_for_next_request(&mut self) {
        let stream = self.stream.take();
        let peer = self.peer.take();
        self.reset();
        self.stream = stream;
        self.peer = peer;
    }

    /// Give up on the current request; the dispatcher will tear down.
    pub fn abandon(&mut self) {
        self.file = None;
        self.next = Next::Close;
    }

    /// Drop the socket (closing it) and return to the initial state.
    pub fn close(&mut self) {
        self.stream = None;
        self.peer = None;
        self.reset();
    }

    /// Release the mapping and zero every index and buffer in use.
    pub fn reset(&mut self) {
        self.read_buf[..self.read_idx].fill(0);
        self.write_buf[..self.write_idx].fill(0);
        self.read_idx = 0;
        self.write_idx = 0;
        self.parser.reset();
        self.file = None;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
        self.keep_alive = false;
        self.status = None;
        self.next = Next::Read;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::parser::CheckState;
    use std::fs;
    use std::net::TcpListener;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        (client, server, peer)
    }

    fn conn_with_root(files: &[(&str, &[u8])]) -> (Connection, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        for (name, bytes) in files {
            let path = dir.path().join(name);
            fs::write(&path, bytes).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        }
        let ctx = Arc::new(ServerContext::new(Config::new(0, dir.path())));
        (Connection::new(ctx), dir)
    }

    fn assert_fresh(conn: &Connection) {
        assert_eq!(conn.read_idx, 0);
        assert_eq!(conn.write_idx, 0);
        assert!(conn.read_buf.iter().all(|b| *b == 0));
        assert!(conn.write_buf.iter().all(|b| *b == 0));
        assert_eq!(conn.parser.state(), CheckState::RequestLine);
        assert_eq!(conn.parser.cursor(), 0);
        assert_eq!(conn.parser.line_start(), 0);
        assert_eq!(conn.parser.head(), Parser::new().head());
        assert!(conn.file.is_none());
        assert_eq!(conn.bytes_to_send, 0);
        assert_eq!(conn.bytes_sent, 0);
        assert!(!conn.keep_alive);
        assert_eq!(conn.next, Next::Read);
    }

    fn read_response(client: &mut TcpStream, body_len: usize) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = client.read(&mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
            if n == 0 {
                break;
            }
            if let Some(pos) = out.windows(4).position(|w| w == b"\r\n\r\n") {
                if out.len() >= pos + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn serves_file_and_stays_open() {
        let (mut conn, _dir) = conn_with_root(&[("index.html", b"hello etude")]);
        let (mut client, server, peer) = socket_pair();
        conn.init(server, peer);

        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(conn.drain().unwrap(), Drain::Ready);
        assert_eq!(conn.process(), Next::Write);
        assert_eq!(conn.status(), Some(Status::Ok));
        assert_eq!(conn.flush().unwrap(), Flush::KeepAlive);

        let text = read_response(&mut client, 11);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\nhello etude"));

        // Reset left the connection as if freshly accepted (socket kept).
        assert!(conn.raw_fd().is_some());
        assert_fresh(&conn);
    }

    #[test]
    fn missing_file_is_404_and_closes() {
        let (mut conn, _dir) = conn_with_root(&[]);
        let (mut client, server, peer) = socket_pair();
        conn.init(server, peer);

        client
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        conn.drain().unwrap();
        assert_eq!(conn.process(), Next::Write);
        assert_eq!(conn.status(), Some(Status::NotFound));
        assert_eq!(conn.flush().unwrap(), Flush::Close);

        let text = read_response(&mut client, Status::NotFound.canned_body().len());
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with(Status::NotFound.canned_body()));
    }

    #[test]
    fn partial_request_waits_for_more() {
        let (mut conn, _dir) = conn_with_root(&[("a.txt", b"a")]);
        let (mut client, server, peer) = socket_pair();
        conn.init(server, peer);

        client.write_all(b"GET /a.txt HTTP/1.1\r\nHo").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        conn.drain().unwrap();
        assert_eq!(conn.process(), Next::Read);

        client.write_all(b"st: x\r\n\r\n").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        conn.drain().unwrap();
        assert_eq!(conn.process(), Next::Write);
        assert_eq!(conn.status(), Some(Status::Ok));
    }

    #[test]
    fn unsupported_method_is_400() {
        let (mut conn, _dir) = conn_with_root(&[("x", b"x")]);
        let (mut client, server, peer) = socket_pair();
        conn.init(server, peer);

        client
            .write_all(b"FOO /x HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        conn.drain().unwrap();
        assert_eq!(conn.process(), Next::Write);
        assert_eq!(conn.status(), Some(Status::BadRequest));
        assert_eq!(conn.flush().unwrap(), Flush::Close);
    }

    #[test]
    fn oversized_request_is_400() {
        let (mut conn, _dir) = conn_with_root(&[]);
        let (mut client, server, peer) = socket_pair();
        conn.init(server, peer);

        let mut req = b"GET /x HTTP/1.1\r\nX-Fill: ".to_vec();
        req.resize(READ_BUF_SIZE + 10, b'a');
        client.write_all(&req).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(conn.drain().unwrap(), Drain::Ready);
        assert_eq!(conn.process(), Next::Write);
        assert_eq!(conn.status(), Some(Status::BadRequest));
    }

    #[test]
    fn peer_close_is_reported() {
        let (mut conn, _dir) = conn_with_root(&[]);
        let (client, server, peer) = socket_pair();
        conn.init(server, peer);
        drop(client);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(conn.drain().unwrap(), Drain::PeerClosed);

        conn.close();
        assert!(conn.raw_fd().is_none());
        assert_fresh(&conn);
        assert_eq!(conn.process(), Next::Close);
    }
}
