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

//! Request lifecycle
//!
//! A request is created when the first bytes arrive on a connection,
//! carried through the phase engine, and destroyed when its final filter
//! output drains. Finalization is idempotent: whoever finalizes first sets
//! the status, everyone later is a no-op. The client aborting before the
//! response is complete logs as 499.

use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use log::debug;

use crate::buf::Chain;
use crate::conn::ConnId;
use crate::event::EventHandler;
use crate::http::body::BodyState;
use crate::http::parse::{self, Header, Method, Status, Version};
use crate::http::{filter, phase, status_text};
use crate::upstream::UpstreamCtx;
use crate::worker::Worker;

/// Largest accepted request head.
const MAX_HEADER: usize = 8 * 1024;
/// Internal redirect bound; exceeding it is a loop.
pub const MAX_REDIRECTS: u32 = 10;

/// Parsed request headers plus the fields the engine keys off.
#[derive(Debug, Default)]
pub struct HeadersIn {
    pub headers: Vec<Header>,
    pub host: Option<String>,
    pub content_length: Option<u64>,
    pub te_chunked: bool,
    pub connection_close: bool,
    pub connection_keepalive: bool,
    pub expect_continue: bool,
    pub upgrade: bool,
    pub range: Option<String>,
}

/// Response headers under construction.
#[derive(Debug, Default)]
pub struct HeadersOut {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub chunked: bool,
    /// Extra headers, relayed or module-set, in emission order.
    pub headers: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct Request {
    pub start_ms: u64,
    /// Raw bytes read and not yet consumed by the parser or body reader.
    pub header_buf: BytesMut,
    pub request_line: String,
    pub method: Method,
    pub version: Version,
    pub uri: String,
    pub args: Option<String>,
    pub headers_in: HeadersIn,
    /// Index of the matched virtual server.
    pub server: usize,
    /// Index of the matched location within the server.
    pub location: Option<usize>,
    /// Position in the flat phase handler table.
    pub phase_idx: usize,
    pub redirects: u32,
    pub body: BodyState,
    pub headers_out: HeadersOut,
    /// Filtered output not yet written to the socket.
    pub out: Chain,
    pub upstream: Option<Box<UpstreamCtx>>,
    /// Status recorded for the access log.
    pub status: u16,
    pub header_sent: bool,
    /// The last buffer has passed the filters; nothing more will be queued.
    pub response_complete: bool,
    pub keepalive: bool,
    pub finalized: bool,
}

impl Request {
    pub fn new(now: u64) -> Request {
        Request {
            start_ms: now,
            header_buf: BytesMut::with_capacity(1024),
            request_line: String::new(),
            method: Method::Get,
            version: Version::H1_1,
            uri: String::from("/"),
            args: None,
            headers_in: HeadersIn::default(),
            server: 0,
            location: None,
            phase_idx: 0,
            redirects: 0,
            body: BodyState::None,
            headers_out: HeadersOut::default(),
            out: Chain::new(),
            upstream: None,
            status: 0,
            header_sent: false,
            response_complete: false,
            keepalive: false,
            finalized: false,
        }
    }

    pub fn location_conf<'a>(&self, rt: &'a crate::http::HttpRuntime) -> Option<&'a crate::conf::schema::LocationConf> {
        let server = rt.conf.servers.get(self.server)?;
        server.locations.get(self.location?)
    }

    /// Header value by (lowercase) name.
    pub fn header_in(&self, name: &str) -> Option<&str> {
        self.headers_in
            .headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }
}

/// First touch of an accepted connection: wait for request bytes.
pub fn init_connection(w: &mut Worker, cid: ConnId) {
    let timeout = w.http.conf.client_header_timeout;
    w.arm(cid, false, EventHandler::WaitRequest);
    w.set_timer(cid, false, timeout);
}

/// Readable while the head is incomplete. Reads whatever the socket has,
/// retries the parse, and either runs the phases or re-arms.
pub fn read_headers(w: &mut Worker, cid: ConnId) {
    let timed_out = {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        std::mem::replace(&mut conn.read.timed_out, false)
    };

    w.conns.mark_busy(cid);
    let mut req = match w.conns.get_mut(cid).and_then(|c| c.take_request()) {
        Some(req) => req,
        None => Box::new(Request::new(w.now())),
    };

    if timed_out {
        w.conns.get_mut(cid).expect("checked above").put_request(req);
        finalize(w, cid, 408);
        return;
    }

    let mut eof = false;
    let mut chunk = [0u8; 4096];
    loop {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        let Some(stream) = conn.stream.as_mut() else { return };
        match stream.read(&mut chunk) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => req.header_buf.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("client read failed: {}", e);
                eof = true;
                break;
            }
        }
    }

    match parse::parse_request(&req.header_buf) {
        Ok(Status::Complete(parsed)) => {
            let consumed = parsed.consumed;
            apply_parsed(&mut req, parsed);
            bytes_consumed(&mut req, consumed);
            let Some(conn) = w.conns.get_mut(cid) else { return };
            conn.put_request(req);
            w.del_timer(cid, false);
            // the body reader re-arms the read side if a handler wants it
            w.arm(cid, false, EventHandler::None);
            process_request(w, cid);
        }
        Ok(Status::Partial) => {
            if eof {
                // peer went away; without even a request line there is
                // nothing to answer
                let had_bytes = !req.header_buf.is_empty();
                let Some(conn) = w.conns.get_mut(cid) else { return };
                conn.put_request(req);
                if had_bytes {
                    finalize(w, cid, 400);
                } else {
                    w.close_connection(cid);
                }
                return;
            }
            let too_large = req.header_buf.len() > MAX_HEADER;
            let Some(conn) = w.conns.get_mut(cid) else { return };
            conn.put_request(req);
            if too_large {
                finalize(w, cid, 431);
            } else {
                w.arm(cid, false, EventHandler::ReadHeaders);
            }
        }
        Err(e) => {
            debug!("malformed request: {}", e);
            let Some(conn) = w.conns.get_mut(cid) else { return };
            conn.put_request(req);
            finalize(w, cid, 400);
        }
    }
}

fn apply_parsed(req: &mut Request, parsed: parse::ParsedRequest) {
    req.request_line = format!(
        "{} {}{} {}",
        parsed.method,
        parsed.uri,
        parsed
            .args
            .as_deref()
            .map(|a| format!("?{}", a))
            .unwrap_or_default(),
        parsed.version
    );
    req.method = parsed.method;
    req.version = parsed.version;
    req.uri = parsed.uri;
    req.args = parsed.args;

    let mut hin = HeadersIn {
        headers: parsed.headers,
        ..Default::default()
    };
    for h in &hin.headers {
        match h.name.as_str() {
            "host" => hin.host = Some(h.value.clone()),
            "content-length" => hin.content_length = h.value.parse().ok(),
            "transfer-encoding" => {
                hin.te_chunked = h.value.eq_ignore_ascii_case("chunked");
            }
            "connection" => {
                for token in h.value.split(',') {
                    let token = token.trim();
                    if token.eq_ignore_ascii_case("close") {
                        hin.connection_close = true;
                    } else if token.eq_ignore_ascii_case("keep-alive") {
                        hin.connection_keepalive = true;
                    } else if token.eq_ignore_ascii_case("upgrade") {
                        hin.upgrade = true;
                    }
                }
            }
            "expect" => {
                hin.expect_continue = h.value.eq_ignore_ascii_case("100-continue");
            }
            "range" => hin.range = Some(h.value.clone()),
            _ => {}
        }
    }
    req.headers_in = hin;

    // HTTP/1.1 defaults to keep-alive, 1.0 to close
    req.keepalive = match req.version {
        Version::H1_1 => !req.headers_in.connection_close,
        Version::H1_0 => req.headers_in.connection_keepalive,
    };
}

fn bytes_consumed(req: &mut Request, n: usize) {
    use bytes::Buf as _;
    req.header_buf.advance(n);
}

/// Head is parsed; pick the virtual server and start the phase engine.
fn process_request(w: &mut Worker, cid: ConnId) {
    let (local, host_missing) = {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        let local = conn.local;
        let req = conn.request_mut().expect("request was just stored");
        let missing = req.version == Version::H1_1 && req.headers_in.host.is_none();
        (local, missing)
    };

    if host_missing {
        finalize(w, cid, 400);
        return;
    }

    {
        let host = {
            let conn = w.conns.get(cid).expect("connection exists");
            let req = match &conn.ctx {
                crate::conn::ConnCtx::Http(r) => r,
                _ => return,
            };
            req.headers_in.host.clone()
        };
        let server = w.http.find_server(local, host.as_deref());
        let Some(conn) = w.conns.get_mut(cid) else { return };
        if let Some(req) = conn.request_mut() {
            req.server = server;
        }
    }

    phase::run_phases(w, cid);
}

/// Writable with output pending: push the out chain, then either finish the
/// request or wait for more (from a handler or the upstream relay).
pub fn write_response(w: &mut Worker, cid: ConnId) {
    let timed_out = {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        conn.write.ready = false;
        std::mem::replace(&mut conn.write.timed_out, false)
    };
    if timed_out {
        debug!("client send timed out");
        client_abort(w, cid);
        return;
    }

    let mut req = match w.conns.get_mut(cid).and_then(|c| c.take_request()) {
        Some(req) => req,
        None => return,
    };

    let result = {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        match conn.stream.as_mut() {
            Some(stream) => crate::output::send_chain(stream, &mut req.out, &mut conn.sent),
            None => Ok(true),
        }
    };

    match result {
        Err(e) => {
            debug!("client write failed: {}", e);
            let Some(conn) = w.conns.get_mut(cid) else { return };
            conn.put_request(req);
            client_abort(w, cid);
        }
        Ok(true) => {
            let complete = req.response_complete;
            let has_upstream = req.upstream.is_some();
            let Some(conn) = w.conns.get_mut(cid) else { return };
            conn.put_request(req);
            w.del_timer(cid, true);
            w.arm(cid, true, EventHandler::None);
            if complete {
                finish_request(w, cid);
            } else if has_upstream {
                // downstream drained; the relay may read again
                crate::upstream::downstream_drained(w, cid);
            }
        }
        Ok(false) => {
            let Some(conn) = w.conns.get_mut(cid) else { return };
            conn.put_request(req);
            let timeout = w.http.conf.send_timeout;
            w.arm(cid, true, EventHandler::WriteResponse);
            w.set_timer(cid, true, timeout);
        }
    }
}

/// Queue filtered output and kick the write path within this tick.
pub fn send_output(w: &mut Worker, cid: ConnId, mut chain: Chain) {
    {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        let Some(req) = conn.request_mut() else { return };
        if chain.has_last_buf() {
            req.response_complete = true;
        }
        req.out.append(&mut chain);
    }
    w.arm(cid, true, EventHandler::WriteResponse);
    w.post(cid, true);
    if let Some(conn) = w.conns.get_mut(cid) {
        conn.write.ready = true;
    }
}

/// Hard stop after a mid-response failure: log what we know and close.
/// Used where finalize cannot help because the header is already on the
/// wire.
pub fn terminate(w: &mut Worker, cid: ConnId) {
    log_request(w, cid);
    w.close_connection(cid);
}

/// Client is gone (reset, timeout, abort). 499 in the log, upstream torn
/// down or left draining per policy, connection closed either way.
fn client_abort(w: &mut Worker, cid: ConnId) {
    let already_done = {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        match conn.request_mut() {
            Some(req) => {
                if req.status == 0 || !req.response_complete {
                    req.status = 499;
                }
                req.finalized
            }
            None => true,
        }
    };
    let fetch_continues = if already_done {
        false
    } else {
        crate::upstream::client_aborted(w, cid)
    };
    log_request(w, cid);
    if fetch_continues {
        // the request outlives the socket until the relay finishes
        detach_client(w, cid);
    } else {
        w.close_connection(cid);
    }
}

/// Drop the socket but keep the slot and its request: a continuing
/// upstream drain still needs them. The relay closes the slot when done.
fn detach_client(w: &mut Worker, cid: ConnId) {
    w.del_timer(cid, false);
    w.del_timer(cid, true);
    let Some(conn) = w.conns.get_mut(cid) else { return };
    if let Some(mut stream) = conn.stream.take() {
        let _ = w.poll.registry().deregister(&mut stream);
    }
    conn.read.handler = EventHandler::None;
    conn.read.active = false;
    conn.write.handler = EventHandler::None;
    conn.write.active = false;
}

/// Idempotent request finalization: produce the error/special response if
/// none has been sent, otherwise just tear down.
pub fn finalize(w: &mut Worker, cid: ConnId, status: u16) {
    let (was_finalized, header_sent) = {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        let Some(req) = conn.request_mut() else {
            w.close_connection(cid);
            return;
        };
        let was = req.finalized;
        req.finalized = true;
        if req.status == 0 {
            req.status = status;
        }
        (was, req.header_sent)
    };
    if was_finalized {
        return;
    }

    crate::upstream::abort_fetch(w, cid);

    if status == 499 {
        log_request(w, cid);
        w.close_connection(cid);
        return;
    }

    if header_sent {
        // mid-response failure: nothing valid can follow what was sent
        log_request(w, cid);
        w.close_connection(cid);
        return;
    }

    special_response(w, cid, status);
}

/// Build the canned response for a status and send it through the filters.
fn special_response(w: &mut Worker, cid: ConnId, status: u16) {
    let body = if status >= 400 {
        format!(
            "<html>\r\n<head><title>{code} {text}</title></head>\r\n\
             <body>\r\n<center><h1>{code} {text}</h1></center>\r\n\
             <hr><center>vakt</center>\r\n</body>\r\n</html>\r\n",
            code = status,
            text = status_text(status)
        )
    } else {
        String::new()
    };

    {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        let Some(req) = conn.request_mut() else { return };
        // errors mark the connection for close; 2xx/3xx specials keep it
        if status >= 400 {
            req.keepalive = false;
        }
        req.headers_out.status = status;
        req.headers_out.chunked = false;
        if body.is_empty() {
            req.headers_out.content_length = if status == 204 { None } else { Some(0) };
            req.headers_out.content_type = None;
        } else {
            req.headers_out.content_length = Some(body.len() as u64);
            req.headers_out.content_type = Some("text/html".to_owned());
        }
    }

    if filter::send_header(w, cid).is_err() {
        w.close_connection(cid);
        return;
    }
    filter::send_body_text(w, cid, body.into_bytes(), true);
}

/// LOG phase plus the keep-alive / lingering-close decision.
pub fn finish_request(w: &mut Worker, cid: ConnId) {
    log_request(w, cid);

    let (keepalive, leftover, body_pending) = {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        let Some(req) = conn.request_mut() else {
            w.close_connection(cid);
            return;
        };
        let body_pending = matches!(req.body, BodyState::Reading(_))
            || (matches!(req.body, BodyState::None)
                && (req.headers_in.content_length.unwrap_or(0) > 0 || req.headers_in.te_chunked));
        let keepalive = req.keepalive
            && !w.exiting
            && w.http.conf.keepalive_timeout > 0
            && !body_pending;
        let leftover = std::mem::take(&mut req.header_buf);
        (keepalive, leftover, body_pending)
    };

    if !keepalive {
        if body_pending {
            start_lingering(w, cid);
        } else {
            w.close_connection(cid);
        }
        return;
    }

    // drop the finished request; the connection survives
    let Some(conn) = w.conns.get_mut(cid) else { return };
    conn.ctx = crate::conn::ConnCtx::None;
    conn.sent = 0;
    conn.pool.destroy();

    if !leftover.is_empty() {
        // a pipelined request is already buffered
        let mut req = Box::new(Request::new(w.now()));
        req.header_buf = leftover;
        let Some(conn) = w.conns.get_mut(cid) else { return };
        conn.put_request(req);
        w.arm(cid, false, EventHandler::ReadHeaders);
        w.post(cid, false);
        return;
    }

    let timeout = w.http.conf.keepalive_timeout;
    w.arm(cid, false, EventHandler::Keepalive);
    w.set_timer(cid, false, timeout);
    w.conns.mark_reusable(cid);
}

/// Readable (or timer) on an idle keep-alive connection.
pub fn keepalive_event(w: &mut Worker, cid: ConnId) {
    let (timed_out, eof) = {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        (conn.read.timed_out, conn.read.eof)
    };
    if timed_out || eof {
        w.close_connection(cid);
        return;
    }
    w.conns.mark_busy(cid);
    w.del_timer(cid, false);
    read_headers(w, cid);
}

/// Drain-and-discard before close, so the peer sees our FIN after its data.
fn start_lingering(w: &mut Worker, cid: ConnId) {
    let timeout = w.http.conf.lingering_time;
    if let Some(conn) = w.conns.get_mut(cid) {
        if let Some(stream) = conn.stream.as_mut() {
            let _ = stream.shutdown(std::net::Shutdown::Write);
        }
        conn.ctx = crate::conn::ConnCtx::None;
    }
    w.arm(cid, false, EventHandler::Lingering);
    w.set_timer(cid, false, timeout);
}

pub fn lingering_event(w: &mut Worker, cid: ConnId) {
    let timed_out = {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        conn.read.timed_out
    };
    if timed_out {
        w.close_connection(cid);
        return;
    }

    let mut sink = [0u8; 4096];
    loop {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        let Some(stream) = conn.stream.as_mut() else { return };
        match stream.read(&mut sink) {
            Ok(0) => {
                w.close_connection(cid);
                return;
            }
            Ok(_) => continue,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => {
                w.close_connection(cid);
                return;
            }
        }
    }
}

/// LOG phase: one access-log line per request.
fn log_request(w: &mut Worker, cid: ConnId) {
    let Some(conn) = w.conns.get(cid) else { return };
    let Some(req) = (match &conn.ctx {
        crate::conn::ConnCtx::Http(r) => Some(r),
        _ => None,
    }) else {
        return;
    };
    if req.request_line.is_empty() {
        return; // nothing parsed, nothing to log
    }
    let remote = conn
        .peer
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "-".to_owned());
    let status = if req.status != 0 {
        req.status
    } else {
        req.headers_out.status
    };
    let line = req.request_line.clone();
    let sent = conn.sent;
    w.access_log.write(&remote, &line, status, sent);
}

#[cfg(test)]
mod test {
    use super::*;

    fn parsed(buf: &[u8]) -> Request {
        let mut req = Request::new(0);
        match parse::parse_request(buf).expect("valid head") {
            Status::Complete(p) => {
                let n = p.consumed;
                req.header_buf.extend_from_slice(buf);
                apply_parsed(&mut req, p);
                bytes_consumed(&mut req, n);
            }
            Status::Partial => panic!("head must be complete"),
        }
        req
    }

    #[test]
    fn http11_defaults_to_keepalive() {
        let req = parsed(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert!(req.keepalive);
        assert_eq!("GET / HTTP/1.1", req.request_line);
    }

    #[test]
    fn connection_close_disables_keepalive() {
        let req = parsed(b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n");
        assert!(!req.keepalive);
    }

    #[test]
    fn http10_requires_explicit_keepalive() {
        let req = parsed(b"GET / HTTP/1.0\r\nHost: a\r\n\r\n");
        assert!(!req.keepalive);
        let req = parsed(b"GET / HTTP/1.0\r\nHost: a\r\nConnection: keep-alive\r\n\r\n");
        assert!(req.keepalive);
    }

    #[test]
    fn expect_continue_and_body_length_are_captured() {
        let req = parsed(
            b"POST /up HTTP/1.1\r\nHost: a\r\nContent-Length: 12\r\nExpect: 100-continue\r\n\r\n",
        );
        assert_eq!(Some(12), req.headers_in.content_length);
        assert!(req.headers_in.expect_continue);
    }

    #[test]
    fn pipelined_bytes_stay_in_the_buffer() {
        let req = parsed(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nGET /next");
        assert_eq!(b"GET /next", &req.header_buf[..]);
    }
}
