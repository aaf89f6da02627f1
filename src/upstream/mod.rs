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

//! Upstream engine
//!
//! Drives a proxied request: pick a peer, connect, send the serialized
//! request, parse the response header, then relay the body either through
//! a single bounded buffer (unbuffered mode) or through the pipe with its
//! temp-file overflow (buffered mode), optionally teeing into the cache.
//! Failures before any response byte reaches the client are retried on the
//! next peer under the `proxy_next_upstream` mask; after `header_sent`
//! nothing can be rewound and the request dies with the connection.

use std::io::{ErrorKind, Read};

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, error, warn};

use crate::buf::{Buf, BufTag, Chain};
use crate::conf::schema::{next_upstream, ProxyConf};
use crate::conn::{ConnCtx, ConnId};
use crate::event::EventHandler;
use crate::http::body::BodyState;
use crate::http::parse::{self, Header, Method, Status};
use crate::http::phase::PhaseResult;
use crate::http::{filter, request};
use crate::worker::Worker;

pub mod cache;
pub mod peer;
pub mod pipe;

use cache::{CacheKeyHash, CacheWriter};
use peer::PeerSelector;
use pipe::Pipe;

const UPSTREAM_TAG: BufTag = BufTag("upstream");
/// Largest accepted upstream response head.
const MAX_UPSTREAM_HEADER: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Connecting,
    Sending,
    ReadingHeader,
    Relaying,
    Tunneling,
    Done,
}

/// How the response body ends.
#[derive(Debug)]
enum Framing {
    Length(u64),
    Chunked(ChunkStream),
    UntilClose,
}

/// Minimal chunked decoder for upstream bodies: emits decoded bytes and an
/// end-of-message flag.
#[derive(Debug)]
struct ChunkStream {
    remaining: u64,
    phase: ChunkPhase,
}

#[derive(Debug, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data,
    DataCrlf,
    Done,
}

impl ChunkStream {
    fn new() -> ChunkStream {
        ChunkStream {
            remaining: 0,
            phase: ChunkPhase::Size,
        }
    }

    fn decode(&mut self, input: &mut BytesMut, out: &mut Vec<Bytes>) -> Result<bool, ()> {
        loop {
            match self.phase {
                ChunkPhase::Done => return Ok(true),
                ChunkPhase::Size => {
                    let Some(nl) = input.iter().position(|&b| b == b'\n') else {
                        return Ok(false);
                    };
                    let line = input.split_to(nl + 1);
                    let digits = line
                        .strip_suffix(b"\r\n")
                        .or_else(|| line.strip_suffix(b"\n"))
                        .unwrap_or(&line);
                    let size = std::str::from_utf8(digits)
                        .ok()
                        .and_then(|s| {
                            let s = s.trim();
                            let s = s.split(';').next().unwrap_or(s);
                            u64::from_str_radix(s, 16).ok()
                        })
                        .ok_or(())?;
                    if size == 0 {
                        self.phase = ChunkPhase::Done;
                        if input.starts_with(b"\r\n") {
                            let _ = input.split_to(2);
                        }
                        return Ok(true);
                    }
                    self.remaining = size;
                    self.phase = ChunkPhase::Data;
                }
                ChunkPhase::Data => {
                    if input.is_empty() {
                        return Ok(false);
                    }
                    let take = (input.len() as u64).min(self.remaining) as usize;
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.phase = ChunkPhase::DataCrlf;
                    }
                    out.push(input.split_to(take).freeze());
                }
                ChunkPhase::DataCrlf => {
                    if input.len() < 2 {
                        return Ok(false);
                    }
                    if &input.split_to(2)[..] != b"\r\n" {
                        return Err(());
                    }
                    self.phase = ChunkPhase::Size;
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct UpstreamCtx {
    pub peer_cid: Option<ConnId>,
    pub state: UpstreamState,
    selector_key: (usize, usize),
    current_peer: Option<usize>,
    pub conf: ProxyConf,
    /// Serialized head, kept so a retry can rebuild the chain.
    request_head: Bytes,
    request_chain: Chain,
    recv: BytesMut,
    framing: Option<Framing>,
    pub status: u16,
    pub buffering: bool,
    pub cacheable: bool,
    cache_key: Option<String>,
    cache_lock: Option<CacheKeyHash>,
    cache_writer: Option<CacheWriter>,
    valid_for: u64,
    pub request_sent: bool,
    pub header_sent: bool,
    /// Upstream offered keep-alive; connections close after one exchange
    /// regardless, this only feeds the header logic.
    pub keepalive: bool,
    tries: u32,
    start_ms: u64,
    pipe: Option<Pipe>,
    read_paused: bool,
    client_gone: bool,
    /// Upstream body fully received; the pipe may still hold bytes.
    upstream_done: bool,
    /// The end-of-response marker went through the filters.
    done_sent: bool,
}

impl UpstreamCtx {
    fn new(selector_key: (usize, usize), conf: ProxyConf, now: u64) -> UpstreamCtx {
        UpstreamCtx {
            peer_cid: None,
            state: UpstreamState::Connecting,
            selector_key,
            current_peer: None,
            conf,
            request_head: Bytes::new(),
            request_chain: Chain::new(),
            recv: BytesMut::with_capacity(4096),
            framing: None,
            status: 0,
            buffering: true,
            cacheable: false,
            cache_key: None,
            cache_lock: None,
            cache_writer: None,
            valid_for: 0,
            request_sent: false,
            header_sent: false,
            keepalive: false,
            tries: 0,
            start_ms: now,
            pipe: None,
            read_paused: false,
            client_gone: false,
            upstream_done: false,
            done_sent: false,
        }
    }
}

/// CONTENT handler for `proxy_pass` locations.
pub fn start(w: &mut Worker, client: ConnId) -> PhaseResult {
    // the body must be in hand before anything is sent upstream
    match crate::http::body::read_request_body(w, client) {
        Ok(true) => {}
        Ok(false) => return PhaseResult::Again,
        Err(status) => return PhaseResult::Error(status),
    }

    let setup = {
        let Some(conn) = w.conns.get(client) else {
            return PhaseResult::Done;
        };
        let req = match &conn.ctx {
            ConnCtx::Http(r) => r,
            _ => return PhaseResult::Done,
        };
        if req.upstream.is_some() {
            return PhaseResult::Done; // re-entered while already underway
        }
        let Some(li) = req.location else {
            return PhaseResult::Error(500);
        };
        let location = &w.http.conf.servers[req.server].locations[li];
        let conf = location.proxy.clone().expect("proxy location");
        let key = format!(
            "{}|{}|{}{}",
            req.method,
            req.headers_in.host.as_deref().unwrap_or(""),
            req.uri,
            req.args
                .as_deref()
                .map(|a| format!("?{}", a))
                .unwrap_or_default()
        );
        ((req.server, li), conf, key, req.method)
    };
    let (selector_key, conf, cache_key, method) = setup;

    let mut ctx = Box::new(UpstreamCtx::new(selector_key, conf, w.now()));

    // cache: serve a fresh hit, else maybe become the filler
    if ctx.conf.cache_zone.is_some() && method == Method::Get && w.cache.is_some() {
        let now_unix = cache::unix_now();
        if let Some(entry) = w.cache.as_ref().and_then(|c| c.lookup(&cache_key, now_unix)) {
            debug!("cache hit for \"{}\"", cache_key);
            return serve_from_cache(w, client, entry);
        }
        let hash = cache::hash_key(&cache_key);
        let lock_free = match (&w.cache, ctx.conf.cache_lock) {
            (Some(c), true) => c.try_lock(hash, w.now(), ctx.conf.cache_lock_timeout),
            _ => true,
        };
        if lock_free {
            ctx.cacheable = true;
            ctx.cache_key = Some(cache_key);
            if ctx.conf.cache_lock {
                ctx.cache_lock = Some(hash);
            }
        }
        // losing the lock race falls through to origin, uncached
    }

    {
        let Some(conn) = w.conns.get_mut(client) else {
            return PhaseResult::Done;
        };
        let Some(req) = conn.request_mut() else {
            return PhaseResult::Done;
        };
        req.upstream = Some(ctx);
    }

    connect_peer(w, client);
    PhaseResult::Done
}

fn serve_from_cache(w: &mut Worker, client: ConnId, entry: cache::CachedEntry) -> PhaseResult {
    {
        let Some(conn) = w.conns.get_mut(client) else {
            return PhaseResult::Done;
        };
        let Some(req) = conn.request_mut() else {
            return PhaseResult::Done;
        };
        req.headers_out.status = entry.status;
        req.headers_out.content_length = Some(entry.body_len);
        for h in &entry.headers {
            if h.name == "content-type" {
                req.headers_out.content_type = Some(h.value.clone());
            } else {
                req.headers_out.headers.push((h.name.clone(), h.value.clone()));
            }
        }
        req.finalized = true;
        req.status = entry.status;
    }

    if filter::send_header(w, client).is_err() {
        w.close_connection(client);
        return PhaseResult::Done;
    }
    let mut chain = Chain::new();
    if entry.body_len > 0 {
        let mut buf = Buf::file_range(
            std::rc::Rc::new(entry.file),
            entry.body_offset,
            entry.body_offset + entry.body_len,
            UPSTREAM_TAG,
        );
        buf.flags.last_buf = true;
        chain.push(buf);
    } else {
        let mut marker = Buf::special(UPSTREAM_TAG);
        marker.flags.last_buf = true;
        chain.push(marker);
    }
    let _ = filter::send_body(w, client, chain);
    PhaseResult::Done
}

/// Open a non-blocking connect to the next peer.
fn connect_peer(w: &mut Worker, client: ConnId) {
    let picked = {
        let now = w.now();
        let Some(conn) = w.conns.get_mut(client) else { return };
        let Some(req) = conn.request_mut() else { return };
        let Some(ctx) = req.upstream.as_mut() else { return };
        let key = ctx.selector_key;
        let timeout = ctx.conf.connect_timeout;
        ctx.tries += 1;
        let picked = w.http.selectors.get_mut(&key).and_then(|s| s.get(now));
        match picked {
            Some((idx, addr)) => {
                ctx.current_peer = Some(idx);
                ctx.state = UpstreamState::Connecting;
                Some((addr, timeout))
            }
            None => None,
        }
    };
    let Some((addr, connect_timeout)) = picked else {
        drop_upstream(w, client);
        request::finalize(w, client, 502);
        return;
    };

    debug!("connecting to upstream {}", addr);
    let stream = match mio::net::TcpStream::connect(addr) {
        Ok(s) => s,
        Err(e) => {
            error!("upstream connect failed immediately: {}", e);
            next_peer(w, client, next_upstream::ERROR);
            return;
        }
    };

    let ucid = match w.conns.claim() {
        Ok(cid) => cid,
        Err(_) => {
            warn!("no connection slot for upstream");
            drop_upstream(w, client);
            request::finalize(w, client, 503);
            return;
        }
    };
    let mut stream = stream;
    if w
        .poll
        .registry()
        .register(&mut stream, mio::Token(ucid), mio::Interest::WRITABLE)
        .is_err()
    {
        w.conns.release(ucid);
        drop_upstream(w, client);
        request::finalize(w, client, 500);
        return;
    }

    {
        let Some(uconn) = w.conns.get_mut(ucid) else { return };
        uconn.stream = Some(stream);
        uconn.ctx = ConnCtx::Upstream(client);
        uconn.write.active = true;
    }
    {
        let Some(conn) = w.conns.get_mut(client) else { return };
        if let Some(req) = conn.request_mut() {
            if let Some(ctx) = req.upstream.as_mut() {
                ctx.peer_cid = Some(ucid);
            }
        }
    }
    w.arm(ucid, true, EventHandler::UpstreamConnect);
    w.set_timer(ucid, true, connect_timeout);
}

/// Writable on a connecting upstream socket.
pub fn connect_event(w: &mut Worker, ucid: ConnId) {
    let Some(client) = w.upstream_client(ucid) else {
        w.close_connection(ucid);
        return;
    };
    let timed_out = {
        let Some(conn) = w.conns.get_mut(ucid) else { return };
        std::mem::replace(&mut conn.write.timed_out, false)
    };
    if timed_out {
        debug!("upstream connect timed out");
        next_peer(w, client, next_upstream::TIMEOUT);
        return;
    }

    // a failed non-blocking connect reports through take_error/peer_addr
    let connected = {
        let Some(conn) = w.conns.get_mut(ucid) else { return };
        match conn.stream.as_ref() {
            Some(s) => match s.take_error() {
                Ok(None) => s.peer_addr().is_ok(),
                _ => false,
            },
            None => false,
        }
    };
    if !connected {
        next_peer(w, client, next_upstream::ERROR);
        return;
    }

    create_request(w, client);
    send_request_event(w, ucid);
}

/// Serialize the proxied request head and stage head + body for sending.
fn create_request(w: &mut Worker, client: ConnId) {
    let Some(conn) = w.conns.get_mut(client) else { return };
    let Some(req) = conn.request_mut() else { return };
    let Some(ctx) = req.upstream.as_mut() else { return };

    if ctx.request_head.is_empty() {
        let authority = ctx
            .conf
            .pass
            .strip_prefix("http://")
            .unwrap_or(&ctx.conf.pass)
            .split('/')
            .next()
            .unwrap_or("")
            .to_owned();

        let mut head = BytesMut::with_capacity(512);
        head.put_slice(req.method.as_str().as_bytes());
        head.put_u8(b' ');
        head.put_slice(req.uri.as_bytes());
        if let Some(args) = &req.args {
            head.put_u8(b'?');
            head.put_slice(args.as_bytes());
        }
        head.put_slice(b" HTTP/1.1\r\nHost: ");
        head.put_slice(authority.as_bytes());
        head.put_slice(b"\r\n");
        if req.headers_in.upgrade {
            head.put_slice(b"Connection: upgrade\r\n");
        } else {
            head.put_slice(b"Connection: close\r\n");
        }

        let body_len = match &req.body {
            BodyState::Ready(data) => data.len,
            _ => 0,
        };
        if body_len > 0 {
            head.put_slice(b"Content-Length: ");
            head.put_slice(body_len.to_string().as_bytes());
            head.put_slice(b"\r\n");
        }

        for h in &req.headers_in.headers {
            if matches!(
                h.name.as_str(),
                "host" | "connection" | "keep-alive" | "content-length" | "transfer-encoding"
                    | "expect" | "proxy-connection" | "te"
            ) {
                continue;
            }
            head.put_slice(h.name.as_bytes());
            head.put_slice(b": ");
            head.put_slice(h.value.as_bytes());
            head.put_slice(b"\r\n");
        }
        head.put_slice(b"\r\n");
        ctx.request_head = head.freeze();
    }

    // (re)build the chain: head plus body, freshly windowed
    let mut chain = Chain::new();
    chain.push(Buf::from_bytes(ctx.request_head.clone(), UPSTREAM_TAG));
    if let BodyState::Ready(data) = &req.body {
        if let Some(mem) = &data.mem {
            if !mem.is_empty() {
                chain.push(Buf::from_bytes(mem.clone(), UPSTREAM_TAG));
            }
        }
        if let Some(file) = &data.file {
            chain.push(Buf::file_range(file.clone(), 0, data.len, UPSTREAM_TAG));
        }
    }
    ctx.request_chain = chain;
    ctx.state = UpstreamState::Sending;
    ctx.recv.clear();
    ctx.framing = None;
}

/// Writable with request bytes still to push.
pub fn send_request_event(w: &mut Worker, ucid: ConnId) {
    let Some(client) = w.upstream_client(ucid) else {
        w.close_connection(ucid);
        return;
    };
    let timed_out = {
        let Some(conn) = w.conns.get_mut(ucid) else { return };
        std::mem::replace(&mut conn.write.timed_out, false)
    };
    if timed_out {
        next_peer(w, client, next_upstream::TIMEOUT);
        return;
    }

    let mut req = match w.conns.get_mut(client).and_then(|c| c.take_request()) {
        Some(r) => r,
        None => {
            w.close_connection(ucid);
            return;
        }
    };
    let Some(ctx) = req.upstream.as_mut() else {
        if let Some(c) = w.conns.get_mut(client) {
            c.put_request(req);
        }
        w.close_connection(ucid);
        return;
    };

    let outcome = {
        match w.conns.get_mut(ucid).and_then(|c| c.stream.as_mut()) {
            Some(stream) => {
                let mut sent = 0u64;
                crate::output::send_chain(stream, &mut ctx.request_chain, &mut sent)
            }
            None => Ok(true),
        }
    };

    let (read_timeout, send_timeout) = (ctx.conf.read_timeout, ctx.conf.send_timeout);
    let result = match outcome {
        Ok(true) => {
            ctx.request_sent = true;
            ctx.state = UpstreamState::ReadingHeader;
            Ok(true)
        }
        Ok(false) => Ok(false),
        Err(e) => Err(e),
    };
    let Some(conn) = w.conns.get_mut(client) else { return };
    conn.put_request(req);

    match result {
        Ok(true) => {
            w.del_timer(ucid, true);
            w.arm(ucid, true, EventHandler::None);
            w.arm(ucid, false, EventHandler::UpstreamHeader);
            w.set_timer(ucid, false, read_timeout);
        }
        Ok(false) => {
            w.arm(ucid, true, EventHandler::UpstreamSend);
            w.set_timer(ucid, true, send_timeout);
        }
        Err(e) => {
            debug!("upstream send failed: {}", e);
            next_peer(w, client, next_upstream::ERROR);
        }
    }
}

/// Readable before the response head completes.
pub fn header_event(w: &mut Worker, ucid: ConnId) {
    let Some(client) = w.upstream_client(ucid) else {
        w.close_connection(ucid);
        return;
    };
    let timed_out = {
        let Some(conn) = w.conns.get_mut(ucid) else { return };
        std::mem::replace(&mut conn.read.timed_out, false)
    };
    if timed_out {
        next_peer(w, client, next_upstream::TIMEOUT);
        return;
    }

    let mut req = match w.conns.get_mut(client).and_then(|c| c.take_request()) {
        Some(r) => r,
        None => {
            w.close_connection(ucid);
            return;
        }
    };
    let Some(ctx) = req.upstream.as_mut() else {
        if let Some(c) = w.conns.get_mut(client) {
            c.put_request(req);
        }
        w.close_connection(ucid);
        return;
    };

    // pull bytes
    let mut chunk = [0u8; 4096];
    let mut eof = false;
    loop {
        let Some(stream) = w.conns.get_mut(ucid).and_then(|c| c.stream.as_mut()) else {
            break;
        };
        match stream.read(&mut chunk) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => ctx.recv.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("upstream read failed: {}", e);
                eof = true;
                break;
            }
        }
    }

    let parsed = parse::parse_response(&ctx.recv);
    let Some(conn) = w.conns.get_mut(client) else { return };
    conn.put_request(req);

    match parsed {
        Err(e) => {
            debug!("invalid upstream header: {}", e);
            next_peer(w, client, next_upstream::INVALID_HEADER);
        }
        Ok(Status::Partial) => {
            let too_large = {
                w.conns
                    .get(client)
                    .and_then(|c| match &c.ctx {
                        ConnCtx::Http(r) => r.upstream.as_ref().map(|u| u.recv.len()),
                        _ => None,
                    })
                    .unwrap_or(0)
                    > MAX_UPSTREAM_HEADER
            };
            if eof || too_large {
                next_peer(w, client, next_upstream::INVALID_HEADER);
            }
            // else: stay armed, more bytes will come
        }
        Ok(Status::Complete(response)) => process_header(w, client, ucid, response),
    }
}

/// A full response head arrived: decide retry vs forward, framing, mode.
fn process_header(w: &mut Worker, client: ConnId, ucid: ConnId, response: parse::ParsedResponse) {
    // retry by status, while nothing has been forwarded yet
    let retry_mask = status_retry_bit(response.code);
    let wants_retry = {
        let Some(conn) = w.conns.get(client) else { return };
        let ConnCtx::Http(req) = &conn.ctx else { return };
        let Some(ctx) = req.upstream.as_ref() else { return };
        retry_mask != 0
            && ctx.conf.next_upstream & retry_mask != 0
            && (req.method.idempotent()
                || ctx.conf.next_upstream & next_upstream::NON_IDEMPOTENT != 0)
    };
    if wants_retry {
        debug!("retrying on next peer after upstream {}", response.code);
        next_peer(w, client, retry_mask);
        return;
    }

    let mut forwarded: Vec<Header> = Vec::new();
    let (framing, buffering, tunnel) = {
        let Some(conn) = w.conns.get_mut(client) else { return };
        let Some(req) = conn.request_mut() else { return };
        let Some(ctx) = req.upstream.as_mut() else { return };

        ctx.status = response.code;
        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        let mut buffering = ctx.conf.buffering;

        for h in &response.headers {
            match h.name.as_str() {
                "content-length" => content_length = h.value.parse().ok(),
                "transfer-encoding" => chunked = h.value.eq_ignore_ascii_case("chunked"),
                "connection" => {
                    ctx.keepalive = h.value.eq_ignore_ascii_case("keep-alive");
                }
                "x-accel-buffering" => {
                    buffering = h.value.eq_ignore_ascii_case("yes");
                }
                "keep-alive" | "proxy-authenticate" | "te" | "trailer" | "upgrade" => {}
                _ => forwarded.push(h.clone()),
            }
        }
        ctx.buffering = buffering;

        let tunnel = response.code == 101 && req.headers_in.upgrade;
        let bodyless = response.code == 204
            || response.code == 304
            || req.method == Method::Head
            || (100..200).contains(&response.code);

        let framing = if tunnel {
            Framing::UntilClose
        } else if bodyless {
            Framing::Length(0)
        } else if chunked {
            Framing::Chunked(ChunkStream::new())
        } else if let Some(len) = content_length {
            Framing::Length(len)
        } else {
            Framing::UntilClose
        };

        // client-facing headers
        req.headers_out.status = response.code;
        req.headers_out.content_length = match &framing {
            Framing::Length(len) if !bodyless => Some(*len),
            _ => None,
        };
        if bodyless {
            req.headers_out.content_length = None;
        }
        for h in &forwarded {
            if h.name == "content-type" {
                req.headers_out.content_type = Some(h.value.clone());
            } else {
                req.headers_out
                    .headers
                    .push((h.name.clone(), h.value.clone()));
            }
        }
        req.finalized = true;
        req.status = response.code;

        // cacheability needs a validity window for this status
        if ctx.cacheable {
            let valid = ctx
                .conf
                .cache_valid
                .iter()
                .find(|(code, _)| *code == response.code || *code == 0)
                .map(|(_, ms)| *ms);
            match valid {
                Some(ms) if !tunnel => ctx.valid_for = ms,
                _ => ctx.cacheable = false,
            }
        }

        use bytes::Buf as _;
        ctx.recv.advance(response.consumed);
        (framing, buffering, tunnel)
    };
    let _ = buffering;

    if filter::send_header(w, client).is_err() {
        drop_upstream(w, client);
        w.close_connection(client);
        return;
    }

    {
        let Some(conn) = w.conns.get_mut(client) else { return };
        let Some(req) = conn.request_mut() else { return };
        let Some(ctx) = req.upstream.as_mut() else { return };
        ctx.header_sent = true;
        ctx.framing = Some(framing);
        ctx.state = if tunnel {
            UpstreamState::Tunneling
        } else {
            UpstreamState::Relaying
        };

        if !tunnel {
            if ctx.buffering {
                ctx.pipe = Some(Pipe::new(&ctx.conf));
            }
            if ctx.cacheable {
                let key = ctx.cache_key.clone().unwrap_or_default();
                let writer = w.cache.as_ref().and_then(|c| {
                    c.start_write(&key, ctx.status, &forwarded, ctx.valid_for, cache::unix_now())
                        .map_err(|e| warn!("cannot start cache entry: {}", e))
                        .ok()
                });
                match writer {
                    Some(wr) => ctx.cache_writer = Some(wr),
                    None => ctx.cacheable = false,
                }
            }
        }
    }

    if tunnel {
        // relay upstream→client raw; client bytes flow back via TunnelRead
        w.arm(client, false, EventHandler::TunnelRead);
        w.arm(ucid, false, EventHandler::UpstreamRelay);
        relay_event(w, ucid);
        return;
    }

    w.arm(ucid, false, EventHandler::UpstreamRelay);
    // bytes received along with the header seed the relay
    relay_event(w, ucid);
}

fn status_retry_bit(code: u16) -> u32 {
    match code {
        500 => next_upstream::HTTP_500,
        502 => next_upstream::HTTP_502,
        503 => next_upstream::HTTP_503,
        504 => next_upstream::HTTP_504,
        403 => next_upstream::HTTP_403,
        404 => next_upstream::HTTP_404,
        _ => 0,
    }
}

/// Readable during relay (and the seed call after the header).
pub fn relay_event(w: &mut Worker, ucid: ConnId) {
    let Some(client) = w.upstream_client(ucid) else {
        w.close_connection(ucid);
        return;
    };
    let timed_out = {
        let Some(conn) = w.conns.get_mut(ucid) else { return };
        std::mem::replace(&mut conn.read.timed_out, false)
    };
    if timed_out {
        debug!("upstream read timed out mid-relay");
        abort_relay(w, client, ucid);
        return;
    }

    let mut req = match w.conns.get_mut(client).and_then(|c| c.take_request()) {
        Some(r) => r,
        None => {
            w.close_connection(ucid);
            return;
        }
    };

    let mut decoded: Vec<Bytes> = Vec::new();
    let mut body_done = false;
    let mut upstream_error = false;
    {
        let Some(ctx) = req.upstream.as_mut() else {
            if let Some(c) = w.conns.get_mut(client) {
                c.put_request(req);
            }
            w.close_connection(ucid);
            return;
        };

        // leftover bytes from the header read come first; an empty decode
        // also recognises a zero-length body without touching the socket
        {
            let mut leftover = std::mem::take(&mut ctx.recv);
            match decode(ctx, &mut leftover, &mut decoded) {
                Ok(done) => body_done = done,
                Err(()) => upstream_error = true,
            }
            ctx.recv = leftover;
        }

        let read_size = ctx
            .pipe
            .as_ref()
            .map(|p| p.read_size)
            .unwrap_or(ctx.conf.buffer_size as usize)
            .max(1024);
        let mut chunk = vec![0u8; read_size];
        while !body_done && !upstream_error {
            // backpressure: stop reading when the stage is full; with the
            // client gone nothing is staged, so nothing can fill up
            let can_accept = ctx.client_gone
                || match &ctx.pipe {
                    Some(pipe) => pipe.can_accept(),
                    None => req.out.size() == 0 || decoded.is_empty(),
                };
            if !can_accept {
                ctx.read_paused = true;
                break;
            }
            let Some(stream) = w.conns.get_mut(ucid).and_then(|c| c.stream.as_mut()) else {
                upstream_error = true;
                break;
            };
            match stream.read(&mut chunk) {
                Ok(0) => {
                    match ctx.framing {
                        Some(Framing::UntilClose) => body_done = true,
                        Some(Framing::Length(0)) => body_done = true,
                        _ => upstream_error = true, // truncated
                    }
                    break;
                }
                Ok(n) => {
                    let mut input = BytesMut::from(&chunk[..n]);
                    match decode(ctx, &mut input, &mut decoded) {
                        Ok(done) => {
                            if done {
                                body_done = true;
                                break;
                            }
                        }
                        Err(()) => {
                            upstream_error = true;
                            break;
                        }
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("upstream relay read failed: {}", e);
                    upstream_error = true;
                    break;
                }
            }
        }

        // tee into the cache and stage for the client
        for data in &decoded {
            if let Some(writer) = ctx.cache_writer.as_mut() {
                writer.write_body(data);
            }
        }
        match &mut ctx.pipe {
            // no client to stage for: the cache tee above was the last use
            Some(pipe) if !ctx.client_gone => {
                for data in decoded.drain(..) {
                    pipe.push(data);
                }
            }
            _ => {
                if ctx.client_gone {
                    decoded.clear();
                }
            }
        }
        if body_done {
            ctx.upstream_done = true;
        }
    }

    // stage unbuffered output straight onto the request
    let direct: Vec<Bytes> = decoded;
    let client_gone = req.upstream.as_ref().map(|u| u.client_gone).unwrap_or(false);
    let tunneling = req
        .upstream
        .as_ref()
        .map(|u| u.state == UpstreamState::Tunneling)
        .unwrap_or(false);

    let Some(conn) = w.conns.get_mut(client) else { return };
    conn.put_request(req);

    if !client_gone {
        let mut chain = Chain::new();
        for data in direct {
            chain.push(Buf::from_bytes(data, UPSTREAM_TAG));
        }
        if let Some(mut staged) = take_pipe_chain(w, client) {
            chain.append(&mut staged);
        }
        // the end marker must not overtake bytes still held by the pipe
        if body_done && !tunneling && mark_done_if_drained(w, client) {
            let mut marker = Buf::special(UPSTREAM_TAG);
            marker.flags.last_buf = true;
            marker.flags.flush = true;
            chain.push(marker);
        }
        if !chain.is_empty() {
            let _ = filter::send_body(w, client, chain);
        }
    }

    if upstream_error {
        abort_relay(w, client, ucid);
        return;
    }
    if body_done {
        if tunneling {
            // upstream closed its half: the tunnel is over
            finish_relay(w, client, ucid, true);
            w.close_connection(client);
            return;
        }
        finish_relay(w, client, ucid, true);
        return;
    }

    // keep reading unless paused for backpressure
    let paused = {
        w.conns
            .get(client)
            .and_then(|c| match &c.ctx {
                ConnCtx::Http(r) => r.upstream.as_ref().map(|u| u.read_paused),
                _ => None,
            })
            .unwrap_or(false)
    };
    if !paused {
        let timeout = {
            w.conns
                .get(client)
                .and_then(|c| match &c.ctx {
                    ConnCtx::Http(r) => r.upstream.as_ref().map(|u| u.conf.read_timeout),
                    _ => None,
                })
                .unwrap_or(60_000)
        };
        w.arm(ucid, false, EventHandler::UpstreamRelay);
        w.set_timer(ucid, false, timeout);
    } else {
        w.del_timer(ucid, false);
        w.arm(ucid, false, EventHandler::None);
    }
}

fn decode(
    ctx: &mut UpstreamCtx,
    input: &mut BytesMut,
    out: &mut Vec<Bytes>,
) -> Result<bool, ()> {
    match ctx.framing.as_mut() {
        Some(Framing::Length(remaining)) => {
            let take = (input.len() as u64).min(*remaining) as usize;
            if take > 0 {
                out.push(input.split_to(take).freeze());
                *remaining -= take as u64;
            }
            Ok(*remaining == 0)
        }
        Some(Framing::Chunked(decoder)) => decoder.decode(input, out),
        Some(Framing::UntilClose) => {
            if !input.is_empty() {
                out.push(input.split().freeze());
            }
            Ok(false)
        }
        None => Err(()),
    }
}

/// When the upstream body is complete and nothing remains staged, record
/// that the end marker may be emitted (exactly once).
fn mark_done_if_drained(w: &mut Worker, client: ConnId) -> bool {
    let Some(conn) = w.conns.get_mut(client) else {
        return false;
    };
    let Some(req) = conn.request_mut() else {
        return false;
    };
    let Some(ctx) = req.upstream.as_mut() else {
        return false;
    };
    if ctx.done_sent || !ctx.upstream_done {
        return false;
    }
    let pipe_empty = ctx.pipe.as_ref().map(Pipe::is_drained).unwrap_or(true);
    if pipe_empty {
        ctx.done_sent = true;
    }
    pipe_empty
}

fn take_pipe_chain(w: &mut Worker, client: ConnId) -> Option<Chain> {
    let Some(conn) = w.conns.get_mut(client) else {
        return None;
    };
    let req = conn.request_mut()?;
    let ctx = req.upstream.as_mut()?;
    let busy = ctx.conf.busy_buffers_size as usize;
    // only feed the client while its backlog is reasonable; the pipe holds
    // (and spools) the rest
    if req.out.size() >= busy {
        return None;
    }
    let pipe = ctx.pipe.as_mut()?;
    pipe.drain()
        .map_err(|e| warn!("pipe drain failed: {}", e))
        .ok()
}

/// The client write path drained; pull staged bytes and resume reads.
pub fn downstream_drained(w: &mut Worker, client: ConnId) {
    let mut chain = Chain::new();
    if let Some(mut staged) = take_pipe_chain(w, client) {
        chain.append(&mut staged);
    }
    // a completed relay may only now be able to emit its end marker
    if mark_done_if_drained(w, client) {
        let mut marker = Buf::special(UPSTREAM_TAG);
        marker.flags.last_buf = true;
        marker.flags.flush = true;
        chain.push(marker);
    }
    if !chain.is_empty() {
        let _ = filter::send_body(w, client, chain);
    }

    let resume = {
        let Some(conn) = w.conns.get_mut(client) else { return };
        let Some(req) = conn.request_mut() else { return };
        let Some(ctx) = req.upstream.as_mut() else { return };
        let relaying = matches!(
            ctx.state,
            UpstreamState::Relaying | UpstreamState::Tunneling
        );
        if ctx.read_paused && relaying {
            ctx.read_paused = false;
            ctx.peer_cid
        } else {
            None
        }
    };
    if let Some(ucid) = resume {
        w.arm(ucid, false, EventHandler::UpstreamRelay);
        w.post(ucid, false);
    }
}

/// Client readable while tunnelling: shovel bytes to the upstream.
pub fn tunnel_client_event(w: &mut Worker, client: ConnId) {
    let ucid = {
        w.conns
            .get(client)
            .and_then(|c| match &c.ctx {
                ConnCtx::Http(r) => r.upstream.as_ref().and_then(|u| u.peer_cid),
                _ => None,
            })
    };
    let Some(ucid) = ucid else {
        w.close_connection(client);
        return;
    };

    let mut chunk = [0u8; 4096];
    loop {
        let Some(stream) = w.conns.get_mut(client).and_then(|c| c.stream.as_mut()) else {
            return;
        };
        let n = match stream.read(&mut chunk) {
            Ok(0) => {
                // client hung up; drop both halves of the tunnel
                w.close_connection(ucid);
                w.close_connection(client);
                return;
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => {
                w.close_connection(ucid);
                w.close_connection(client);
                return;
            }
        };

        // write through; tunnels are interactive and small
        let mut chain = Chain::new();
        chain.push(Buf::from_bytes(Bytes::copy_from_slice(&chunk[..n]), UPSTREAM_TAG));
        let Some(ustream) = w.conns.get_mut(ucid).and_then(|c| c.stream.as_mut()) else {
            w.close_connection(client);
            return;
        };
        let mut sent = 0;
        if crate::output::send_chain(ustream, &mut chain, &mut sent).is_err() {
            w.close_connection(ucid);
            w.close_connection(client);
            return;
        }
    }
}

/// Relay ended. On success commit the cache and push the request to its
/// normal finish; on failure after `header_sent` the connection dies.
fn finish_relay(w: &mut Worker, client: ConnId, ucid: ConnId, success: bool) {
    w.close_connection(ucid);

    let Some(conn) = w.conns.get_mut(client) else { return };
    let Some(req) = conn.request_mut() else { return };
    let Some(ctx) = req.upstream.as_mut() else { return };
    ctx.peer_cid = None;
    ctx.state = UpstreamState::Done;

    let now = w.clock.now();
    if let Some(peer) = ctx.current_peer.take() {
        if let Some(selector) = w.http.selectors.get_mut(&ctx.selector_key) {
            selector.free(peer, success, now);
        }
    }
    if let Some(writer) = ctx.cache_writer.take() {
        if success {
            writer.commit();
        } else {
            writer.abort();
        }
    }
    if let Some(hash) = ctx.cache_lock.take() {
        if let Some(cache) = &w.cache {
            cache.unlock(hash);
        }
    }

    let client_gone = ctx.client_gone;
    if client_gone {
        w.close_connection(client);
    }
}

fn abort_relay(w: &mut Worker, client: ConnId, ucid: ConnId) {
    finish_relay(w, client, ucid, false);
    // mid-stream: the client sees a truncated response and a close
    request::terminate(w, client);
}

/// Current peer failed with `ft` before anything reached the client.
/// Retry when the policy, the try budget and the overall timeout allow.
fn next_peer(w: &mut Worker, client: ConnId, ft: u32) {
    let now = w.now();
    let (retry, old_ucid) = {
        let Some(conn) = w.conns.get_mut(client) else { return };
        let Some(req) = conn.request_mut() else { return };
        let Some(ctx) = req.upstream.as_mut() else { return };

        let old_ucid = ctx.peer_cid.take();
        if let Some(peer) = ctx.current_peer.take() {
            if let Some(selector) = w.http.selectors.get_mut(&ctx.selector_key) {
                selector.notify_failure(peer, now);
            }
        }

        let mask_allows = ctx.conf.next_upstream & ft != 0
            && ctx.conf.next_upstream & next_upstream::OFF == 0;
        let tries_left = ctx.conf.next_upstream_tries == 0
            || ctx.tries < ctx.conf.next_upstream_tries;
        let in_time = ctx.conf.next_upstream_timeout == 0
            || now.saturating_sub(ctx.start_ms) < ctx.conf.next_upstream_timeout;
        let idempotent_ok = req.method.idempotent()
            || !ctx.request_sent
            || ctx.conf.next_upstream & next_upstream::NON_IDEMPOTENT != 0;

        (
            !ctx.header_sent && mask_allows && tries_left && in_time && idempotent_ok,
            old_ucid,
        )
    };

    if let Some(ucid) = old_ucid {
        w.close_connection(ucid);
    }

    if retry {
        connect_peer(w, client);
        return;
    }

    let status = if ft == next_upstream::TIMEOUT { 504 } else { 502 };
    drop_upstream(w, client);
    request::finalize(w, client, status);
}

/// Forget the upstream context entirely (pre-response failures).
fn drop_upstream(w: &mut Worker, client: ConnId) {
    let Some(conn) = w.conns.get_mut(client) else { return };
    let Some(req) = conn.request_mut() else { return };
    let Some(mut ctx) = req.upstream.take() else { return };
    if let Some(writer) = ctx.cache_writer.take() {
        writer.abort();
    }
    if let Some(hash) = ctx.cache_lock.take() {
        if let Some(cache) = &w.cache {
            cache.unlock(hash);
        }
    }
}

/// Tear the fetch down unconditionally; used when the request itself is
/// being finalized and no drain policy applies.
pub fn abort_fetch(w: &mut Worker, client: ConnId) {
    let ucid = {
        w.conns
            .get(client)
            .and_then(|c| match &c.ctx {
                ConnCtx::Http(r) => r.upstream.as_ref().and_then(|u| u.peer_cid),
                _ => None,
            })
    };
    if let Some(ucid) = ucid {
        w.close_connection(ucid);
    }
    drop_upstream(w, client);
}

/// The client disappeared mid-proxy. The fetch keeps draining when a cache
/// entry is being filled or `proxy_ignore_client_abort on` asks for it;
/// otherwise the upstream is abandoned. Returns whether the fetch
/// continues, in which case the request must stay alive until the relay
/// finishes.
pub fn client_aborted(w: &mut Worker, client: ConnId) -> bool {
    let (continue_fetch, ucid) = {
        let Some(conn) = w.conns.get_mut(client) else {
            return false;
        };
        let Some(req) = conn.request_mut() else {
            return false;
        };
        let Some(ctx) = req.upstream.as_mut() else {
            return false;
        };
        let filling_cache = ctx.cache_writer.is_some() && ctx.state == UpstreamState::Relaying;
        let keep = filling_cache || ctx.conf.ignore_client_abort;
        if keep {
            ctx.client_gone = true;
        }
        (keep, ctx.peer_cid)
    };
    if continue_fetch {
        // reads continue; output that would have gone to the client is
        // dropped at the staging step
        return true;
    }
    let Some(ucid) = ucid else {
        drop_upstream(w, client);
        return false;
    };
    w.close_connection(ucid);
    drop_upstream(w, client);
    false
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::{ChunkStream, Framing, UpstreamCtx};
    use crate::conf::schema::ProxyConf;

    fn ctx_with(framing: Framing) -> UpstreamCtx {
        let mut ctx = UpstreamCtx::new((0, 0), ProxyConf::default(), 0);
        ctx.framing = Some(framing);
        ctx
    }

    #[test]
    fn length_framing_completes_at_the_declared_size() {
        let mut ctx = ctx_with(Framing::Length(5));
        let mut input = BytesMut::from(&b"hello-and-more"[..]);
        let mut out = Vec::new();
        assert_eq!(Ok(true), super::decode(&mut ctx, &mut input, &mut out));
        assert_eq!(b"hello", &out[0][..]);
        assert_eq!(b"-and-more", &input[..]);
    }

    #[test]
    fn chunked_framing_decodes_and_signals_eof() {
        let mut decoder = ChunkStream::new();
        let mut input = BytesMut::from(&b"4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n"[..]);
        let mut out = Vec::new();
        assert_eq!(Ok(true), decoder.decode(&mut input, &mut out));
        let all: Vec<u8> = out.iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(b"wikipedia".to_vec(), all);
    }

    #[test]
    fn chunk_extensions_are_tolerated() {
        let mut decoder = ChunkStream::new();
        let mut input = BytesMut::from(&b"4;ext=1\r\nwiki\r\n0\r\n\r\n"[..]);
        let mut out = Vec::new();
        assert_eq!(Ok(true), decoder.decode(&mut input, &mut out));
        assert_eq!(b"wiki", &out[0][..]);
    }

    #[test]
    fn until_close_framing_never_completes_by_itself() {
        let mut ctx = ctx_with(Framing::UntilClose);
        let mut input = BytesMut::from(&b"data"[..]);
        let mut out = Vec::new();
        assert_eq!(Ok(false), super::decode(&mut ctx, &mut input, &mut out));
        assert!(input.is_empty());
    }

    #[test]
    fn retry_bits_map_the_gateway_statuses() {
        use crate::conf::schema::next_upstream as ft;
        assert_eq!(ft::HTTP_502, super::status_retry_bit(502));
        assert_eq!(ft::HTTP_404, super::status_retry_bit(404));
        assert_eq!(0, super::status_retry_bit(200));
        assert_eq!(0, super::status_retry_bit(400));
    }
}
