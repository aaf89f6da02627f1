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

//! Request body reader
//!
//! Lazy: nothing is read until a content handler asks. The body accumulates
//! in memory up to `client_body_buffer_size`, spools to a temp file beyond
//! that, and is rejected with 413 when the declared or observed size
//! exceeds `client_max_body_size`. Chunked request framing is decoded here;
//! `Expect: 100-continue` is acknowledged before the first read.

use std::io::{ErrorKind, Read, Seek, Write};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use log::debug;

use crate::conn::ConnId;
use crate::event::EventHandler;
use crate::http::request::{self, Request};
use crate::worker::Worker;

#[derive(Debug, Default)]
pub enum BodyState {
    /// No body or not requested yet.
    #[default]
    None,
    Reading(BodyReader),
    Ready(BodyData),
}

/// The assembled body: either in-memory bytes or a spool file, never a
/// head-in-memory/tail-in-file split — once spooling starts the spool holds
/// everything.
#[derive(Debug, Default)]
pub struct BodyData {
    pub mem: Option<Bytes>,
    pub file: Option<Rc<std::fs::File>>,
    pub len: u64,
}

#[derive(Debug)]
pub struct BodyReader {
    /// Bytes still expected in content-length mode.
    remaining: Option<u64>,
    chunk: Option<ChunkDecoder>,
    data: BytesMut,
    spool: Option<tempfile::NamedTempFile>,
    received: u64,
    max_size: u64,
    buffer_size: u64,
}

#[derive(Debug)]
struct ChunkDecoder {
    phase: ChunkPhase,
    remaining: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data,
    DataCrlf,
    Done,
}

impl BodyReader {
    fn new(req: &Request, max_size: u64, buffer_size: u64) -> BodyReader {
        BodyReader {
            remaining: if req.headers_in.te_chunked {
                None
            } else {
                Some(req.headers_in.content_length.unwrap_or(0))
            },
            chunk: req.headers_in.te_chunked.then(|| ChunkDecoder {
                phase: ChunkPhase::Size,
                remaining: 0,
            }),
            data: BytesMut::new(),
            spool: None,
            received: 0,
            max_size,
            buffer_size,
        }
    }

    /// Feed raw connection bytes. Returns whether the body is complete, or
    /// an HTTP status on framing/limit errors.
    fn feed(&mut self, input: &mut BytesMut) -> Result<bool, u16> {
        match &mut self.chunk {
            None => {
                let want = self.remaining.unwrap_or(0);
                let take = (input.len() as u64).min(want) as usize;
                let bytes = input.split_to(take);
                self.push(bytes.freeze())?;
                self.remaining = Some(want - take as u64);
                Ok(self.remaining == Some(0))
            }
            Some(_) => self.feed_chunked(input),
        }
    }

    fn feed_chunked(&mut self, input: &mut BytesMut) -> Result<bool, u16> {
        loop {
            let decoder = self.chunk.as_mut().expect("chunked mode");
            match decoder.phase {
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
                        .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
                        .ok_or(400u16)?;
                    if size == 0 {
                        decoder.phase = ChunkPhase::Done;
                        // strip the trailing CRLF when it has arrived; a
                        // late one is absorbed by the next head parse
                        if input.starts_with(b"\r\n") {
                            let _ = input.split_to(2);
                        }
                        return Ok(true);
                    }
                    decoder.remaining = size;
                    decoder.phase = ChunkPhase::Data;
                }
                ChunkPhase::Data => {
                    if input.is_empty() {
                        return Ok(false);
                    }
                    let take = (input.len() as u64).min(decoder.remaining) as usize;
                    decoder.remaining -= take as u64;
                    if decoder.remaining == 0 {
                        decoder.phase = ChunkPhase::DataCrlf;
                    }
                    let bytes = input.split_to(take).freeze();
                    self.push(bytes)?;
                }
                ChunkPhase::DataCrlf => {
                    if input.len() < 2 {
                        return Ok(false);
                    }
                    let crlf = input.split_to(2);
                    if &crlf[..] != b"\r\n" {
                        return Err(400);
                    }
                    decoder.phase = ChunkPhase::Size;
                }
            }
        }
    }

    fn push(&mut self, bytes: Bytes) -> Result<(), u16> {
        self.received += bytes.len() as u64;
        if self.max_size > 0 && self.received > self.max_size {
            return Err(413);
        }
        if let Some(spool) = &mut self.spool {
            spool.write_all(&bytes).map_err(|_| 500u16)?;
            return Ok(());
        }
        self.data.extend_from_slice(&bytes);
        if (self.data.len() as u64) > self.buffer_size {
            let mut spool = tempfile::NamedTempFile::new().map_err(|_| 500u16)?;
            spool.write_all(&self.data).map_err(|_| 500u16)?;
            self.data.clear();
            self.spool = Some(spool);
        }
        Ok(())
    }

    fn into_data(
        self,
        pool: &mut crate::pool::Pool,
    ) -> Result<BodyData, u16> {
        let len = self.received;
        match self.spool {
            Some(mut spool) => {
                spool.flush().map_err(|_| 500u16)?;
                spool.rewind().map_err(|_| 500u16)?;
                let file = pool.hold_temp_file(spool).map_err(|_| 500u16)?;
                Ok(BodyData {
                    mem: None,
                    file: Some(file),
                    len,
                })
            }
            None => Ok(BodyData {
                mem: Some(self.data.freeze()),
                file: None,
                len,
            }),
        }
    }
}

/// Entry point for content handlers. `Ok(true)`: the body is in
/// `req.body`. `Ok(false)`: reading continues event-driven; the caller
/// returns AGAIN and is re-entered through the phase engine.
pub fn read_request_body(w: &mut Worker, cid: ConnId) -> Result<bool, u16> {
    let (needs_init, expect_continue) = {
        let Some(conn) = w.conns.get_mut(cid) else {
            return Err(500);
        };
        let Some(req) = conn.request_mut() else {
            return Err(500);
        };
        match req.body {
            BodyState::Ready(_) => return Ok(true),
            BodyState::Reading(_) => (false, false),
            BodyState::None => {
                let has_body =
                    req.headers_in.content_length.unwrap_or(0) > 0 || req.headers_in.te_chunked;
                if !has_body {
                    req.body = BodyState::Ready(BodyData::default());
                    return Ok(true);
                }
                if let Some(declared) = req.headers_in.content_length {
                    let max = w.http.conf.client_max_body_size;
                    if max > 0 && declared > max {
                        return Err(413);
                    }
                }
                (true, req.headers_in.expect_continue)
            }
        }
    };

    if needs_init {
        if expect_continue {
            send_continue(w, cid);
        }
        let max = w.http.conf.client_max_body_size;
        let buffer = w.http.conf.client_body_buffer_size;
        let Some(conn) = w.conns.get_mut(cid) else {
            return Err(500);
        };
        let Some(req) = conn.request_mut() else {
            return Err(500);
        };
        req.body = BodyState::Reading(BodyReader::new(req, max, buffer));
    }

    advance_body(w, cid)
}

/// Readable while the body reader runs.
pub fn read_body_event(w: &mut Worker, cid: ConnId) {
    let timed_out = {
        let Some(conn) = w.conns.get_mut(cid) else { return };
        std::mem::replace(&mut conn.read.timed_out, false)
    };
    if timed_out {
        request::finalize(w, cid, 408);
        return;
    }

    match advance_body(w, cid) {
        Ok(true) => {
            // body complete: resume the suspended content phase
            w.del_timer(cid, false);
            w.arm(cid, false, EventHandler::Continue);
            w.post(cid, false);
        }
        Ok(false) => {}
        Err(status) => request::finalize(w, cid, status),
    }
}

/// Pump: consume buffered surplus, then the socket, into the reader.
fn advance_body(w: &mut Worker, cid: ConnId) -> Result<bool, u16> {
    let mut req = match w.conns.get_mut(cid).and_then(|c| c.take_request()) {
        Some(req) => req,
        None => return Err(500),
    };

    let result = advance_body_inner(w, cid, &mut req);

    let done = matches!(result, Ok(true));
    match w.conns.get_mut(cid) {
        Some(conn) => {
            if done {
                let BodyState::Reading(reader) = std::mem::take(&mut req.body) else {
                    conn.put_request(req);
                    return result;
                };
                match reader.into_data(&mut conn.pool) {
                    Ok(data) => req.body = BodyState::Ready(data),
                    Err(status) => {
                        conn.put_request(req);
                        return Err(status);
                    }
                }
            }
            conn.put_request(req);
        }
        None => return Err(500),
    }

    if let Ok(false) = result {
        let timeout = w.http.conf.client_body_timeout;
        w.arm(cid, false, EventHandler::ReadBody);
        w.set_timer(cid, false, timeout);
    }
    result
}

fn advance_body_inner(w: &mut Worker, cid: ConnId, req: &mut Request) -> Result<bool, u16> {
    let BodyState::Reading(reader) = &mut req.body else {
        return Err(500);
    };

    // surplus bytes read together with the head come first
    if !req.header_buf.is_empty() {
        let mut surplus = std::mem::take(&mut req.header_buf);
        let done = reader.feed(&mut surplus)?;
        req.header_buf = surplus;
        if done {
            return Ok(true);
        }
    }

    let mut chunk = [0u8; 4096];
    loop {
        let Some(conn) = w.conns.get_mut(cid) else {
            return Err(500);
        };
        let Some(stream) = conn.stream.as_mut() else {
            return Err(500);
        };
        match stream.read(&mut chunk) {
            Ok(0) => {
                debug!("client closed mid-body");
                return Err(400);
            }
            Ok(n) => {
                let mut input = BytesMut::from(&chunk[..n]);
                let done = reader.feed(&mut input)?;
                // bytes past the body belong to the next request
                if !input.is_empty() {
                    req.header_buf.extend_from_slice(&input);
                }
                if done {
                    return Ok(true);
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("client body read failed: {}", e);
                return Err(400);
            }
        }
    }
}

/// Acknowledge `Expect: 100-continue` ahead of the body read, outside the
/// filter chain (it is not part of the response proper).
fn send_continue(w: &mut Worker, cid: ConnId) {
    let mut chain = crate::buf::Chain::new();
    let mut buf = crate::buf::Buf::from_bytes(
        Bytes::from_static(b"HTTP/1.1 100 Continue\r\n\r\n"),
        crate::buf::BufTag("http_continue"),
    );
    buf.flags.flush = true;
    chain.push(buf);
    request::send_output(w, cid, chain);
}

#[cfg(test)]
mod test {
    use super::*;

    fn reader(chunked: bool, content_length: Option<u64>, buffer: u64) -> BodyReader {
        let mut req = Request::new(0);
        req.headers_in.te_chunked = chunked;
        req.headers_in.content_length = content_length;
        BodyReader::new(&req, 1024 * 1024, buffer)
    }

    #[test]
    fn content_length_body_completes_at_declared_size() {
        let mut r = reader(false, Some(5), 4096);
        let mut input = BytesMut::from(&b"hell"[..]);
        assert_eq!(Ok(false), r.feed(&mut input));
        let mut input = BytesMut::from(&b"o-extra"[..]);
        assert_eq!(Ok(true), r.feed(&mut input));
        assert_eq!(b"-extra", &input[..], "surplus stays in the buffer");
        assert_eq!(5, r.received);
    }

    #[test]
    fn chunked_body_decodes_frames() {
        let mut r = reader(true, None, 4096);
        let mut input = BytesMut::from(&b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"[..]);
        assert_eq!(Ok(true), r.feed(&mut input));
        assert_eq!(11, r.received);
        assert_eq!(b"hello world", &r.data[..]);
    }

    #[test]
    fn chunked_body_across_split_inputs() {
        let mut r = reader(true, None, 4096);
        let full = b"3\r\nabc\r\n0\r\n\r\n";
        for split in 1..full.len() - 1 {
            let mut r2 = reader(true, None, 4096);
            let mut a = BytesMut::from(&full[..split]);
            let _ = r2.feed(&mut a).expect("first half");
            a.extend_from_slice(&full[split..]);
            assert_eq!(Ok(true), r2.feed(&mut a), "split at {}", split);
        }
        let mut all = BytesMut::from(&full[..]);
        assert_eq!(Ok(true), r.feed(&mut all));
    }

    #[test]
    fn oversize_body_is_rejected_with_413() {
        let mut req = Request::new(0);
        req.headers_in.content_length = Some(100);
        let mut r = BodyReader::new(&req, 8, 4096);
        let mut input = BytesMut::from(&b"123456789"[..]);
        assert_eq!(Err(413), r.feed(&mut input));
    }

    #[test]
    fn body_larger_than_buffer_spools_to_disk() {
        let mut r = reader(false, Some(10), 4);
        let mut input = BytesMut::from(&b"0123456789"[..]);
        assert_eq!(Ok(true), r.feed(&mut input));
        assert!(r.spool.is_some());

        let mut pool = crate::pool::Pool::new();
        let data = r.into_data(&mut pool).expect("spooled data");
        assert_eq!(10, data.len);
        assert!(data.file.is_some());
        let mut contents = String::new();
        let mut file = data.file.expect("file");
        std::io::Read::read_to_string(Rc::get_mut(&mut file).expect("sole handle"), &mut contents)
            .expect("read spool");
        assert_eq!("0123456789", contents);
    }

    #[test]
    fn bad_chunk_size_is_a_protocol_error() {
        let mut r = reader(true, None, 4096);
        let mut input = BytesMut::from(&b"zz\r\n"[..]);
        assert_eq!(Err(400), r.feed(&mut input));
    }
}
