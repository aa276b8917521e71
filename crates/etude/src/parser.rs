// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! Two levels: a line scanner that finds the next CRLF starting at the parse
//! cursor, and the request machine (request line, headers, optional body)
//! that consumes the lines. All cursors index into the connection's read
//! buffer, so parsing resumes exactly where it stopped when more bytes
//! arrive.

use memchr::memchr2;

use crate::http::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Headers,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A complete CRLF-terminated line is available.
    Ok,
    /// A bare CR or LF.
    Bad,
    /// The buffer ends mid-line.
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// More bytes are needed.
    Incomplete,
    /// A full request (head and any declared body) is buffered.
    Complete,
    /// The request is syntactically invalid.
    Invalid,
}

/// Everything we keep from a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub url: String,
    pub version: String,
    pub host: Option<String>,
    pub content_length: usize,
    pub keep_alive: bool,
}

#[derive(Debug, Default)]
pub struct Parser {
    state: CheckState,
    checked: usize,
    start_line: usize,
    head: RequestHead,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    /// Next byte the line scanner will examine.
    pub fn cursor(&self) -> usize {
        self.checked
    }

    /// Start of the line currently being assembled.
    pub fn line_start(&self) -> usize {
        self.start_line
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Back to the state of a freshly accepted connection. String capacity
    /// is kept for the next request.
    pub fn reset(&mut self) {
        self.state = CheckState::RequestLine;
        self.checked = 0;
        self.start_line = 0;
        self.head.method = Method::Get;
        self.head.url.clear();
        self.head.version.clear();
        self.head.host = None;
        self.head.content_length = 0;
        self.head.keep_alive = false;
    }

    /// Run the machine over `buf` (all bytes received so far) until it
    /// finishes, fails, or runs out of input.
    pub fn parse(&mut self, buf: &[u8]) -> ParseOutcome {
        loop {
            if self.state == CheckState::Body {
                return match self.checked.checked_add(self.head.content_length) {
                    Some(end) if buf.len() >= end => ParseOutcome::Complete,
                    Some(_) => ParseOutcome::Incomplete,
                    None => ParseOutcome::Invalid,
                };
            }

            match self.parse_line(buf) {
                LineStatus::Open => return ParseOutcome::Incomplete,
                LineStatus::Bad => return ParseOutcome::Invalid,
                LineStatus::Ok => {}
            }

            let line = &buf[self.start_line..self.checked - 2];
            self.start_line = self.checked;

            match self.state {
                CheckState::RequestLine => {
                    if !self.parse_request_line(line) {
                        return ParseOutcome::Invalid;
                    }
                    self.state = CheckState::Headers;
                }
                CheckState::Headers if line.is_empty() => {
                    if self.head.content_length == 0 {
                        return ParseOutcome::Complete;
                    }
                    self.state = CheckState::Body;
                }
                CheckState::Headers => {
                    if !self.parse_header(line) {
                        return ParseOutcome::Invalid;
                    }
                }
                // Checked at the top of the loop.
                CheckState::Body => {}
            }
        }
    }

    /// Scan from the cursor for the end of the current line.
    pub fn parse_line(&mut self, buf: &[u8]) -> LineStatus {
        let Some(off) = buf
            .get(self.checked..)
            .and_then(|rest| memchr2(b'\r', b'\n', rest))
        else {
            self.checked = self.checked.max(buf.len());
            return LineStatus::Open;
        };
        let pos = self.checked + off;

        if buf[pos] == b'\r' {
            if pos + 1 == buf.len() {
                // Stay on the CR so the next call sees what follows it.
                self.checked = pos;
                return LineStatus::Open;
            }
            if buf[pos + 1] == b'\n' {
                self.checked = pos + 2;
                return LineStatus::Ok;
            }
            return LineStatus::Bad;
        }

        if pos > self.start_line && buf[pos - 1] == b'\r' {
            self.checked = pos + 1;
            return LineStatus::Ok;
        }
        LineStatus::Bad
    }

    /// `METHOD SP URL SP HTTP/1.1`
    fn parse_request_line(&mut self, line: &[u8]) -> bool {
        let mut parts = line.split(|b| *b == b' ');
        let (Some(method), Some(url), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };

        if method.is_empty() || !method.iter().all(|b| b.is_ascii_alphabetic()) {
            return false;
        }
        if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
            return false;
        }
        let Some(url) = normalize_url(url) else {
            return false;
        };
        let Ok(url) = std::str::from_utf8(url) else {
            return false;
        };

        self.head.method = Method::from_bytes(method);
        self.head.url.push_str(url);
        self.head.version.push_str("HTTP/1.1");
        true
    }

    fn parse_header(&mut self, line: &[u8]) -> bool {
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            // Not a header we understand; ignore it.
            return true;
        };
        let name = &line[..colon];
        let value = line[colon + 1..].trim_ascii();

        if name.eq_ignore_ascii_case(b"Connection") {
            self.head.keep_alive = value.eq_ignore_ascii_case(b"keep-alive");
        } else if name.eq_ignore_ascii_case(b"Content-Length") {
            if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
                return false;
            }
            let parsed = std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.parse::<usize>().ok());
            match parsed {
                Some(len) => self.head.content_length = len,
                None => return false,
            }
        } else if name.eq_ignore_ascii_case(b"Host") {
            self.head.host = Some(String::from_utf8_lossy(value).into_owned());
        }
        true
    }
}

/// Strip an absolute-form `http://host` prefix; the result must be an
/// origin-form path.
fn normalize_url(url: &[u8]) -> Option<&[u8]> {
    const SCHEME: &[u8] = b"http://";
    let url = if url.len() >= SCHEME.len() && url[..SCHEME.len()].eq_ignore_ascii_case(SCHEME) {
        let rest = &url[SCHEME.len()..];
        &rest[rest.iter().position(|b| *b == b'/')?..]
    } else {
        url
    };
    (url.first() == Some(&b'/')).then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQ: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\nX-Other: 1\r\n\r\n";

    fn parse_all(bytes: &[u8]) -> (ParseOutcome, Parser) {
        let mut parser = Parser::new();
        let outcome = parser.parse(bytes);
        (outcome, parser)
    }

    #[test]
    fn test_parse_basic_request() {
        let (outcome, parser) = parse_all(REQ);
        assert_eq!(outcome, ParseOutcome::Complete);
        let head = parser.head();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.url, "/index.html");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.host.as_deref(), Some("x"));
        assert!(head.keep_alive);
        assert_eq!(head.content_length, 0);
    }

    #[test]
    fn byte_by_byte_matches_one_shot() {
        let (_, whole) = parse_all(REQ);

        let mut parser = Parser::new();
        for end in 1..REQ.len() {
            assert_eq!(parser.parse(&REQ[..end]), ParseOutcome::Incomplete, "at {end}");
        }
        assert_eq!(parser.parse(REQ), ParseOutcome::Complete);
        assert_eq!(parser.head(), whole.head());
    }

    #[test]
    fn arbitrary_split_points_match_one_shot() {
        let req: &[u8] =
            b"GET http://example.com/a/b.txt HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nbody";
        let (_, whole) = parse_all(req);
        assert_eq!(whole.head().url, "/a/b.txt");

        for step in [2usize, 3, 7, 11] {
            let mut parser = Parser::new();
            let mut end = 0;
            let mut outcome = ParseOutcome::Incomplete;
            while end < req.len() {
                end = (end + step).min(req.len());
                outcome = parser.parse(&req[..end]);
            }
            assert_eq!(outcome, ParseOutcome::Complete);
            assert_eq!(parser.head(), whole.head());
        }
    }

    #[test]
    fn body_waits_for_declared_length() {
        let mut parser = Parser::new();
        let req = b"GET /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nab";
        assert_eq!(parser.parse(req), ParseOutcome::Incomplete);
        assert_eq!(parser.state(), CheckState::Body);

        let req = b"GET /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nabcde";
        assert_eq!(parser.parse(req), ParseOutcome::Complete);
    }

    #[test]
    fn huge_content_length_is_invalid_not_complete() {
        let req = b"GET /x HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert_eq!(parse_all(req).0, ParseOutcome::Invalid);

        // Too large to parse at all.
        let req = b"GET /x HTTP/1.1\r\nContent-Length: 99999999999999999999999\r\n\r\n";
        assert_eq!(parse_all(req).0, ParseOutcome::Invalid);
    }

    #[test]
    fn cursor_stays_on_trailing_cr() {
        let mut parser = Parser::new();
        let buf = b"GET / HTTP/1.1\r";
        assert_eq!(parser.parse_line(buf), LineStatus::Open);
        assert_eq!(parser.cursor(), buf.len() - 1);
        assert_eq!(parser.parse_line(b"GET / HTTP/1.1\r\n"), LineStatus::Ok);
    }

    #[test]
    fn unsupported_method_still_parses() {
        let (outcome, parser) = parse_all(b"FOO /x HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, ParseOutcome::Complete);
        assert_eq!(parser.head().method, Method::Unknown);
    }

    #[test]
    fn malformed_requests() {
        for req in [
            &b"GET /x HTTP/1.0\r\n\r\n"[..],
            b"GET  /x HTTP/1.1\r\n\r\n",
            b"GET /x\r\n\r\n",
            b"GET x HTTP/1.1\r\n\r\n",
            b"GET http://host HTTP/1.1\r\n\r\n",
            b"GET /x HTTP/1.1\rX\n\r\n",
            b"GET /x HTTP/1.1\nHost: a\r\n\r\n",
            b"GET /x HTTP/1.1\r\nContent-Length: lots\r\n\r\n",
            b"GET /x HTTP/1.1\r\nContent-Length: +5\r\n\r\nabcde",
            b"GET /x HTTP/1.1\r\nContent-Length: -1\r\n\r\n",
            b"GET /x HTTP/1.1\r\nContent-Length:\r\n\r\n",
            b"G3T /x HTTP/1.1\r\n\r\n",
        ] {
            assert_eq!(
                parse_all(req).0,
                ParseOutcome::Invalid,
                "{}",
                String::from_utf8_lossy(req)
            );
        }
    }

    #[test]
    fn connection_header_values() {
        let (_, p) = parse_all(b"GET / HTTP/1.1\r\nconnection:   Keep-Alive  \r\n\r\n");
        assert!(p.head().keep_alive);
        let (_, p) = parse_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!p.head().keep_alive);
    }

    #[test]
    fn reset_matches_fresh_parser() {
        let (_, mut parser) = parse_all(REQ);
        parser.reset();
        let fresh = Parser::new();
        assert_eq!(parser.state(), fresh.state());
        assert_eq!(parser.cursor(), fresh.cursor());
        assert_eq!(parser.line_start(), fresh.line_start());
        assert_eq!(parser.head(), fresh.head());
    }
}
