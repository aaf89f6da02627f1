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

//! Filter chains
//!
//! Transforms registered at init and linked so the last registered runs
//! first. Header filters shape `headers_out` and end in the serializer that
//! queues the status line and header block; body filters end in the write
//! filter that hands the chain to the connection. The chunked filter frames
//! bodies of unknown length for HTTP/1.1.

use bytes::{BufMut, Bytes, BytesMut};

use crate::buf::{Buf, BufTag, Chain};
use crate::conn::ConnId;
use crate::http::parse::{Method, Version};
use crate::http::{request, status_text};
use crate::worker::Worker;

pub type HeaderFilter = fn(&mut Worker, ConnId) -> Result<(), u16>;
pub type BodyFilter = fn(&mut Worker, ConnId, Chain) -> Result<Chain, u16>;

const HEADER_TAG: BufTag = BufTag("http_header");
const CHUNK_TAG: BufTag = BufTag("http_chunked");
pub const BODY_TAG: BufTag = BufTag("http_body");

/// Header chain in execution order. Registration happens in reverse: the
/// terminal serializer registers first so everything registered later runs
/// ahead of it.
pub fn default_header_filters() -> Vec<HeaderFilter> {
    let registered: Vec<HeaderFilter> = vec![serialize_header_filter, framing_header_filter];
    registered.into_iter().rev().collect()
}

/// Body chain in execution order, built the same way.
pub fn default_body_filters() -> Vec<BodyFilter> {
    let registered: Vec<BodyFilter> = vec![write_filter, chunked_filter];
    registered.into_iter().rev().collect()
}

/// Run the header chain once. Idempotent via `header_sent`.
pub fn send_header(w: &mut Worker, cid: ConnId) -> Result<(), u16> {
    let already = {
        let Some(conn) = w.conns.get_mut(cid) else {
            return Err(500);
        };
        let Some(req) = conn.request_mut() else {
            return Err(500);
        };
        std::mem::replace(&mut req.header_sent, true)
    };
    if already {
        return Ok(());
    }
    for filter in w.http.header_filters.clone() {
        filter(w, cid)?;
    }
    Ok(())
}

/// Push a chain through the body filters.
pub fn send_body(w: &mut Worker, cid: ConnId, mut chain: Chain) -> Result<(), u16> {
    for filter in w.http.body_filters.clone() {
        chain = filter(w, cid, chain)?;
    }
    Ok(())
}

/// Convenience for handlers producing one in-memory payload.
pub fn send_body_text(w: &mut Worker, cid: ConnId, text: Vec<u8>, last: bool) {
    let mut chain = Chain::new();
    if !text.is_empty() {
        chain.push(Buf::from_bytes(Bytes::from(text), BODY_TAG));
    }
    if last {
        let mut marker = Buf::special(BODY_TAG);
        marker.flags.last_buf = true;
        chain.push(marker);
    }
    let _ = send_body(w, cid, chain);
}

/// Decide framing before serialization: explicit length, chunked for 1.1,
/// or close-delimited for 1.0.
fn framing_header_filter(w: &mut Worker, cid: ConnId) -> Result<(), u16> {
    let Some(conn) = w.conns.get_mut(cid) else {
        return Err(500);
    };
    let Some(req) = conn.request_mut() else {
        return Err(500);
    };

    let status = req.headers_out.status;
    let bodyless = status == 204 || status == 304 || (100..200).contains(&status);
    if bodyless {
        req.headers_out.content_length = None;
        req.headers_out.chunked = false;
        return Ok(());
    }
    if req.headers_out.content_length.is_none() && !req.headers_out.chunked {
        match req.version {
            Version::H1_1 => req.headers_out.chunked = true,
            Version::H1_0 => req.keepalive = false,
        }
    }
    Ok(())
}

/// Terminal header filter: serialize the head and queue it.
fn serialize_header_filter(w: &mut Worker, cid: ConnId) -> Result<(), u16> {
    let server_tokens = w.http.conf.server_tokens;
    let head = {
        let Some(conn) = w.conns.get_mut(cid) else {
            return Err(500);
        };
        let Some(req) = conn.request_mut() else {
            return Err(500);
        };
        let out = &req.headers_out;
        let mut head = BytesMut::with_capacity(256);

        let status = if out.status == 0 { 200 } else { out.status };
        head.put_slice(b"HTTP/1.1 ");
        head.put_slice(status.to_string().as_bytes());
        head.put_u8(b' ');
        head.put_slice(status_text(status).as_bytes());
        head.put_slice(b"\r\n");

        head.put_slice(b"Server: ");
        head.put_slice(if server_tokens {
            b"vakt/0.0.1" as &[u8]
        } else {
            b"vakt"
        });
        head.put_slice(b"\r\n");

        head.put_slice(b"Date: ");
        head.put_slice(
            chrono::Utc::now()
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string()
                .as_bytes(),
        );
        head.put_slice(b"\r\n");

        if let Some(len) = out.content_length {
            head.put_slice(b"Content-Length: ");
            head.put_slice(len.to_string().as_bytes());
            head.put_slice(b"\r\n");
        } else if out.chunked {
            head.put_slice(b"Transfer-Encoding: chunked\r\n");
        }
        if let Some(ct) = &out.content_type {
            head.put_slice(b"Content-Type: ");
            head.put_slice(ct.as_bytes());
            head.put_slice(b"\r\n");
        }
        for (name, value) in &out.headers {
            head.put_slice(name.as_bytes());
            head.put_slice(b": ");
            head.put_slice(value.as_bytes());
            head.put_slice(b"\r\n");
        }
        head.put_slice(if req.keepalive {
            b"Connection: keep-alive\r\n" as &[u8]
        } else {
            b"Connection: close\r\n"
        });
        head.put_slice(b"\r\n");

        if req.status == 0 {
            req.status = status;
        }
        head
    };

    let mut chain = Chain::new();
    let mut buf = Buf::from_staging(head, HEADER_TAG);
    buf.flags.flush = true;
    chain.push(buf);
    request::send_output(w, cid, chain);
    Ok(())
}

/// Frame body buffers for chunked transfer-encoding. Pass-through when the
/// response has explicit framing.
fn chunked_filter(w: &mut Worker, cid: ConnId, chain: Chain) -> Result<Chain, u16> {
    let chunked = {
        let Some(conn) = w.conns.get_mut(cid) else {
            return Err(500);
        };
        let Some(req) = conn.request_mut() else {
            return Err(500);
        };
        req.headers_out.chunked
    };
    if !chunked || chain.is_empty() {
        return Ok(chain);
    }

    let mut framed = Chain::new();
    let mut last = false;
    for buf in chain.iter() {
        if buf.flags.last_buf {
            last = true;
        }
        if buf.is_empty() {
            continue;
        }
        let mut size = BytesMut::with_capacity(18);
        size.put_slice(format!("{:x}\r\n", buf.len()).as_bytes());
        framed.push(Buf::from_staging(size, CHUNK_TAG));
        let mut payload = buf.clone();
        payload.flags.last_buf = false;
        payload.flags.last_in_chain = false;
        framed.push(payload);
        framed.push(Buf::from_bytes(Bytes::from_static(b"\r\n"), CHUNK_TAG));
    }
    if last {
        let mut terminator = Buf::from_bytes(Bytes::from_static(b"0\r\n\r\n"), CHUNK_TAG);
        terminator.flags.last_buf = true;
        terminator.flags.flush = true;
        framed.push(terminator);
    }
    Ok(framed)
}

/// Terminal body filter: suppress HEAD payloads and queue for the writer.
fn write_filter(w: &mut Worker, cid: ConnId, chain: Chain) -> Result<Chain, u16> {
    let head_request = {
        let Some(conn) = w.conns.get_mut(cid) else {
            return Err(500);
        };
        let Some(req) = conn.request_mut() else {
            return Err(500);
        };
        req.method == Method::Head
    };

    let chain = if head_request {
        let mut stripped = Chain::new();
        let last = chain.iter().any(|b| b.flags.last_buf);
        if last {
            let mut marker = Buf::special(BODY_TAG);
            marker.flags.last_buf = true;
            stripped.push(marker);
        }
        stripped
    } else {
        chain
    };

    request::send_output(w, cid, chain);
    Ok(Chain::new())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filters_run_in_reverse_registration_order() {
        let headers = default_header_filters();
        let bodies = default_body_filters();
        // the decorators registered last sit at the front
        assert!(headers[0] == framing_header_filter as HeaderFilter);
        assert!(headers[1] == serialize_header_filter as HeaderFilter);
        assert!(bodies[0] == chunked_filter as BodyFilter);
        assert!(bodies[1] == write_filter as BodyFilter);
    }
}
