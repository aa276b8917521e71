// src/response.rs
use std::fmt::{self, Write as _};

use crate::http::Status;

/// The formatted text did not fit in the remaining buffer space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

/// Bounded, append-only text builder over a fixed byte buffer.
///
/// An append that would not fit is rejected as a whole: the buffer keeps
/// exactly what it held before the call.
pub struct HeaderBuf<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> HeaderBuf<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn append(&mut self, args: fmt::Arguments<'_>) -> Result<(), Overflow> {
        let mark = self.len;
        if self.write_fmt(args).is_err() {
            self.len = mark;
            return Err(Overflow);
        }
        Ok(())
    }

    pub fn status_line(&mut self, status: Status) -> Result<(), Overflow> {
        self.append(format_args!(
            "HTTP/1.1 {} {}\r\n",
            status.code(),
            status.reason()
        ))
    }

    /// `Date`, `Server`, `Content-Type`, `Content-Length` and `Connection`.
    pub fn headers(
        &mut self,
        content_type: &str,
        content_length: usize,
        keep_alive: bool,
    ) -> Result<(), Overflow> {
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        self.append(format_args!(
            "Date: {date}\r\nServer: etude\r\nContent-Type: {content_type}\r\nContent-Length: {content_length}\r\nConnection: {}\r\n",
            if keep_alive { "keep-alive" } else { "close" }
        ))
    }

    pub fn blank_line(&mut self) -> Result<(), Overflow> {
        self.append(format_args!("\r\n"))
    }

    pub fn content(&mut self, body: &str) -> Result<(), Overflow> {
        self.append(format_args!("{body}"))
    }
}

impl fmt::Write for HeaderBuf<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.len..end].copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}

/// Header block for a mapped file; the body goes out as a second segment.
pub fn write_file_head(
    buf: &mut [u8],
    content_type: &str,
    content_length: usize,
    keep_alive: bool,
) -> Result<usize, Overflow> {
    let mut out = HeaderBuf::new(buf);
    out.status_line(Status::Ok)?;
    out.headers(content_type, content_length, keep_alive)?;
    out.blank_line()?;
    Ok(out.len())
}

/// Complete error response (head plus canned body) in a single segment.
/// Error responses always close the connection.
pub fn write_error(buf: &mut [u8], status: Status) -> Result<usize, Overflow> {
    let body = status.canned_body();
    let mut out = HeaderBuf::new(buf);
    out.status_line(status)?;
    out.headers("text/html", body.len(), false)?;
    out.blank_line()?;
    out.content(body)?;
    Ok(out.len())
}
