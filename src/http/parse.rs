// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP/1.x parser
//!
//! Incremental in the AGAIN style: the caller accumulates bytes and retries
//! the parse; [`Status::Partial`] means more bytes are needed, a complete
//! parse reports how many bytes it consumed so the remainder (the start of a
//! body or a pipelined request) stays in the caller's buffer.

use core::fmt::Display;

/// Represents possible failures while parsing
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid byte in method.
    Method,
    /// Invalid byte in target.
    Target,
    /// Invalid HTTP version.
    Version,
    /// Invalid byte in header name.
    HeaderName,
    /// Invalid byte in header value.
    HeaderValue,
    /// Invalid or missing new line.
    NewLine,
    /// Invalid status line.
    StatusLine,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::Method => "Invalid token in method",
            ParseError::Target => "Invalid token in target",
            ParseError::Version => "Invalid version",
            ParseError::HeaderName => "Invalid token in header name",
            ParseError::HeaderValue => "Invalid token in header value",
            ParseError::NewLine => "Invalid or missing new line",
            ParseError::StatusLine => "Invalid status line",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// Result whose Err variant is `ParseError`
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Outcome of one parse attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Status<T> {
    /// Parsed; the payload knows how many bytes it consumed.
    Complete(T),
    /// The buffer ends mid-element; read more and retry.
    Partial,
}

/// Representation of the requested HTTP Method
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
        }
    }

    /// Safe to retry on another peer without a body replay concern.
    pub fn idempotent(&self) -> bool {
        !matches!(self, Self::Post | Self::Connect)
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Representation of the HTTP version on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

/// One parsed header. Names are lowercased during the parse; values keep
/// their bytes minus surrounding whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// A complete request head.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: Method,
    pub version: Version,
    /// Path portion of the target, percent-encoding untouched.
    pub uri: String,
    /// Query string after `?`, when present.
    pub args: Option<String>,
    pub headers: Vec<Header>,
    /// Bytes consumed through the final CRLF.
    pub consumed: usize,
}

/// A complete response head, as read from an upstream.
#[derive(Debug)]
pub struct ParsedResponse {
    pub version: Version,
    pub code: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub consumed: usize,
}

#[inline]
fn is_target_byte(b: u8) -> bool {
    // printable ASCII; space terminates the target
    (0x21..=0x7e).contains(&b)
}

#[inline]
fn is_token_byte(b: u8) -> bool {
    // RFC 9110 Section 5.6.2 tchar
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
        | b'`' | b'|' | b'~')
        || b.is_ascii_alphanumeric()
}

#[inline]
fn is_value_byte(b: u8) -> bool {
    b == b'\t' || (0x20..=0x7e).contains(&b) || b >= 0x80
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    #[inline]
    fn next(&mut self) -> Option<u8> {
        let b = self.buf.get(self.pos).copied();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    /// Take bytes while `pred` holds; `Partial` surfaces as `None` from the
    /// caller checking [`Self::at_end`].
    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a [u8] {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if !pred(b) {
                break;
            }
            self.pos += 1;
        }
        &self.buf[start..self.pos]
    }

    #[inline]
    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Consume an exact CRLF. `Ok(false)` means the buffer ended first.
    fn crlf(&mut self) -> ParseResult<bool> {
        match self.next() {
            None => Ok(false),
            Some(b'\r') => match self.next() {
                None => Ok(false),
                Some(b'\n') => Ok(true),
                Some(_) => Err(ParseError::NewLine),
            },
            Some(_) => Err(ParseError::NewLine),
        }
    }
}

fn parse_version(cur: &mut Cursor<'_>) -> ParseResult<Status<Version>> {
    const PREFIX: &[u8] = b"HTTP/1.";
    for &expected in PREFIX {
        match cur.next() {
            None => return Ok(Status::Partial),
            Some(b) if b == expected => {}
            Some(_) => return Err(ParseError::Version),
        }
    }
    match cur.next() {
        None => Ok(Status::Partial),
        Some(b'0') => Ok(Status::Complete(Version::H1_0)),
        Some(b'1') => Ok(Status::Complete(Version::H1_1)),
        Some(_) => Err(ParseError::Version),
    }
}

fn parse_headers(cur: &mut Cursor<'_>) -> ParseResult<Status<Vec<Header>>> {
    let mut headers = Vec::new();
    loop {
        if cur.peek() == Some(b'\r') {
            return match cur.crlf()? {
                true => Ok(Status::Complete(headers)),
                false => Ok(Status::Partial),
            };
        }
        if cur.at_end() {
            return Ok(Status::Partial);
        }

        let name = cur.take_while(is_token_byte);
        if name.is_empty() {
            return Err(ParseError::HeaderName);
        }
        match cur.next() {
            None => return Ok(Status::Partial),
            Some(b':') => {}
            Some(_) => return Err(ParseError::HeaderName),
        }
        cur.take_while(|b| b == b' ' || b == b'\t');
        let value = cur.take_while(is_value_byte);
        match cur.crlf()? {
            true => {}
            false => return Ok(Status::Partial),
        }

        // Safety: token bytes and value bytes are checked single-byte ASCII
        // or opaque high bytes; from_utf8_lossy keeps the cheap path for the
        // former and stays correct for the latter.
        headers.push(Header {
            name: String::from_utf8_lossy(name).to_ascii_lowercase(),
            value: String::from_utf8_lossy(value).trim_end().to_owned(),
        });
    }
}

/// Parse a request head.
///
/// # Example
/// ```
/// # use vakt::http::parse::{parse_request, Method, Status, Version};
/// # use vakt::http::parse::ParseError;
/// # fn main() -> Result<(), ParseError> {
/// let parsed = parse_request(b"GET /idx?a=1 HTTP/1.1\r\nHost: a\r\n\r\n")?;
/// let Status::Complete(req) = parsed else { panic!("complete input") };
/// assert_eq!(Method::Get, req.method);
/// assert_eq!("/idx", req.uri);
/// assert_eq!(Some("a=1".to_owned()), req.args);
/// assert_eq!(Version::H1_1, req.version);
/// # Ok(())
/// # }
/// ```
pub fn parse_request(buf: &[u8]) -> ParseResult<Status<ParsedRequest>> {
    let mut cur = Cursor::new(buf);

    // RFC 9112 Section 2.2: ignore empty lines ahead of the request-line
    while cur.peek() == Some(b'\r') || cur.peek() == Some(b'\n') {
        cur.next();
    }

    let method_bytes = cur.take_while(|b| b.is_ascii_uppercase());
    if cur.at_end() {
        return Ok(Status::Partial);
    }
    let method = match method_bytes {
        b"GET" => Method::Get,
        b"HEAD" => Method::Head,
        b"POST" => Method::Post,
        b"PUT" => Method::Put,
        b"DELETE" => Method::Delete,
        b"CONNECT" => Method::Connect,
        b"OPTIONS" => Method::Options,
        b"TRACE" => Method::Trace,
        _ => return Err(ParseError::Method),
    };
    if cur.next() != Some(b' ') {
        return Err(ParseError::Method);
    }

    let target = cur.take_while(is_target_byte);
    if cur.at_end() {
        return Ok(Status::Partial);
    }
    if target.is_empty() || cur.next() != Some(b' ') {
        return Err(ParseError::Target);
    }

    let version = match parse_version(&mut cur)? {
        Status::Complete(v) => v,
        Status::Partial => return Ok(Status::Partial),
    };
    match cur.crlf()? {
        true => {}
        false => return Ok(Status::Partial),
    }

    let headers = match parse_headers(&mut cur)? {
        Status::Complete(h) => h,
        Status::Partial => return Ok(Status::Partial),
    };

    // target bytes are printable ASCII by construction
    let target = String::from_utf8_lossy(target).into_owned();
    let (uri, args) = match target.split_once('?') {
        Some((uri, args)) => (uri.to_owned(), Some(args.to_owned())),
        None => (target, None),
    };

    Ok(Status::Complete(ParsedRequest {
        method,
        version,
        uri,
        args,
        headers,
        consumed: cur.pos,
    }))
}

/// Parse a response head (status line plus headers).
pub fn parse_response(buf: &[u8]) -> ParseResult<Status<ParsedResponse>> {
    let mut cur = Cursor::new(buf);

    let version = match parse_version(&mut cur)? {
        Status::Complete(v) => v,
        Status::Partial => return Ok(Status::Partial),
    };
    if cur.at_end() {
        return Ok(Status::Partial);
    }
    if cur.next() != Some(b' ') {
        return Err(ParseError::StatusLine);
    }

    let digits = cur.take_while(|b| b.is_ascii_digit());
    if cur.at_end() {
        return Ok(Status::Partial);
    }
    if digits.len() != 3 {
        return Err(ParseError::StatusLine);
    }
    let code: u16 = String::from_utf8_lossy(digits)
        .parse()
        .map_err(|_| ParseError::StatusLine)?;

    cur.take_while(|b| b == b' ');
    let reason = cur.take_while(is_value_byte);
    let reason = String::from_utf8_lossy(reason).into_owned();
    match cur.crlf()? {
        true => {}
        false => return Ok(Status::Partial),
    }

    let headers = match parse_headers(&mut cur)? {
        Status::Complete(h) => h,
        Status::Partial => return Ok(Status::Partial),
    };

    Ok(Status::Complete(ParsedResponse {
        version,
        code,
        reason,
        headers,
        consumed: cur.pos,
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    fn complete_request(buf: &[u8]) -> ParsedRequest {
        match parse_request(buf).expect("valid request") {
            Status::Complete(r) => r,
            Status::Partial => panic!("expected a complete parse"),
        }
    }

    #[test]
    fn request_line_and_headers_parse() {
        let req = complete_request(b"GET / HTTP/1.1\r\nHost: a\r\nAccept: */*\r\n\r\n");
        assert_eq!(Method::Get, req.method);
        assert_eq!(Version::H1_1, req.version);
        assert_eq!("/", req.uri);
        assert_eq!(None, req.args);
        assert_eq!(2, req.headers.len());
        assert_eq!("host", req.headers[0].name);
        assert_eq!("a", req.headers[0].value);
    }

    #[test]
    fn header_names_lowercase_and_values_trim() {
        let req = complete_request(b"GET / HTTP/1.0\r\nCoNTent-LENgth:  42  \r\n\r\n");
        assert_eq!("content-length", req.headers[0].name);
        assert_eq!("42", req.headers[0].value);
    }

    #[test]
    fn consumed_excludes_pipelined_bytes() {
        let head = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut buf = head.to_vec();
        buf.extend_from_slice(b"GET /next HTTP/1.1\r\n");
        let req = complete_request(&buf);
        assert_eq!(head.len(), req.consumed);
    }

    #[test]
    fn truncated_input_is_partial_at_every_boundary() {
        let full = b"POST /submit HTTP/1.1\r\nHost: a\r\nContent-Length: 2\r\n\r\n";
        for len in 0..full.len() {
            assert_eq!(
                Ok(Status::Partial),
                parse_request(&full[..len]).map(|s| match s {
                    Status::Complete(_) => Status::Complete(()),
                    Status::Partial => Status::Partial,
                }),
                "prefix of {} bytes must be partial",
                len
            );
        }
    }

    #[test]
    fn bad_method_and_version_are_rejected() {
        assert_eq!(Err(ParseError::Method), parse_request(b"get / HTTP/1.1\r\n\r\n").map(|_| ()));
        assert_eq!(
            Err(ParseError::Version),
            parse_request(b"GET / HTTP/2.0\r\n\r\n").map(|_| ())
        );
        assert_eq!(
            Err(ParseError::NewLine),
            parse_request(b"GET / HTTP/1.1\rX").map(|_| ())
        );
    }

    #[test]
    fn query_string_splits_from_uri() {
        let req = complete_request(b"GET /search?q=rust&x=1 HTTP/1.1\r\n\r\n");
        assert_eq!("/search", req.uri);
        assert_eq!(Some("q=rust&x=1".to_owned()), req.args);
    }

    #[test]
    fn response_status_line_parses() {
        let parsed = parse_response(b"HTTP/1.1 502 Bad Gateway\r\nServer: b\r\n\r\n")
            .expect("valid response");
        let Status::Complete(res) = parsed else {
            panic!("complete input")
        };
        assert_eq!(502, res.code);
        assert_eq!("Bad Gateway", res.reason);
        assert_eq!("server", res.headers[0].name);
    }

    #[test]
    fn response_without_reason_is_accepted() {
        let parsed = parse_response(b"HTTP/1.0 204\r\n\r\n").expect("valid response");
        let Status::Complete(res) = parsed else {
            panic!("complete input")
        };
        assert_eq!(204, res.code);
        assert_eq!("", res.reason);
    }
}
