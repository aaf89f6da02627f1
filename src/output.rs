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

//! Output chain
//!
//! Advances a buffer chain onto a socket. Adjacent in-memory windows
//! coalesce into one vectored write; in-file windows go through sendfile,
//! merging when they continue the same file contiguously. Partial writes
//! move the per-buffer cursors; drained buffers leave the chain.

use std::io::{self, ErrorKind, IoSlice, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use crate::buf::Chain;

/// Vectored-write batch width.
const MAX_IOVEC: usize = 64;
/// Upper bound for one sendfile call, so one large file cannot starve the
/// rest of the loop.
const SENDFILE_MAX_CHUNK: usize = 512 * 1024;

/// Write as much of `chain` as the socket accepts. `Ok(true)` when the
/// chain fully drained; `Ok(false)` on would-block with bytes remaining.
pub fn send_chain(
    stream: &mut mio::net::TcpStream,
    chain: &mut Chain,
    sent: &mut u64,
) -> io::Result<bool> {
    let mut drained = Vec::new();

    loop {
        // skip leading specials so framing flags never wedge the cursor
        chain.update_sent(0, &mut drained);
        let Some(front) = chain.front() else {
            return Ok(true);
        };

        let wrote = if front.flags.in_file {
            send_file(stream, chain)
        } else {
            send_memory(stream, chain)
        };

        match wrote {
            Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "zero-length write")),
            Ok(n) => {
                *sent += n as u64;
                chain.update_sent(n, &mut drained);
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// One vectored write over the leading run of memory buffers.
fn send_memory(stream: &mut mio::net::TcpStream, chain: &Chain) -> io::Result<usize> {
    let mut slices: Vec<IoSlice<'_>> = Vec::new();
    for buf in chain.iter() {
        if buf.flags.in_file || slices.len() == MAX_IOVEC {
            break;
        }
        if !buf.is_empty() {
            slices.push(IoSlice::new(buf.bytes()));
        }
        if buf.flags.sync {
            break;
        }
    }
    stream.write_vectored(&slices)
}

/// One sendfile call over the leading run of contiguous same-file windows.
fn send_file(stream: &mut mio::net::TcpStream, chain: &Chain) -> io::Result<usize> {
    let mut iter = chain.iter();
    let first = iter.next().expect("caller checked front");
    let range = first.file().expect("front is in-file");

    let mut count = (range.last - range.pos) as usize;
    let mut end = range.last;
    for buf in iter {
        if !buf.flags.in_file {
            break;
        }
        let Some(next) = buf.file() else { break };
        let same_file = std::rc::Rc::ptr_eq(&range.file, &next.file);
        if !same_file || next.pos != end || count >= SENDFILE_MAX_CHUNK {
            break;
        }
        count += (next.last - next.pos) as usize;
        end = next.last;
    }
    count = count.min(SENDFILE_MAX_CHUNK);

    let mut offset = range.pos as i64;
    // Safety: the stream outlives the borrowed fd for the duration of the
    // call.
    let out_fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    nix::sys::sendfile::sendfile(out_fd, range.file.as_fd(), Some(&mut offset), count)
        .map_err(|e| io::Error::from_raw_os_error(e as i32))
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::rc::Rc;

    use bytes::Bytes;

    use crate::buf::{Buf, BufTag, Chain};

    use super::send_chain;

    fn pair() -> (mio::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = std::net::TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        server.set_nonblocking(true).expect("nonblocking");
        (mio::net::TcpStream::from_std(server), client)
    }

    #[test]
    fn memory_bufs_coalesce_into_one_stream() {
        let (mut server, mut client) = pair();
        let mut chain = Chain::new();
        chain.push(Buf::from_bytes(Bytes::from_static(b"hello "), BufTag("t")));
        chain.push(Buf::from_bytes(Bytes::from_static(b"world"), BufTag("t")));

        let mut sent = 0;
        assert!(send_chain(&mut server, &mut chain, &mut sent).expect("send"));
        assert_eq!(11, sent);

        let mut got = [0u8; 11];
        client.read_exact(&mut got).expect("read");
        assert_eq!(b"hello world", &got);
    }

    #[test]
    fn file_ranges_go_through_sendfile() {
        use std::io::Write as _;

        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        tmp.write_all(b"0123456789").expect("write");
        let file = Rc::new(tmp.reopen().expect("reopen"));

        let (mut server, mut client) = pair();
        let mut chain = Chain::new();
        chain.push(Buf::file_range(file.clone(), 2, 5, BufTag("t")));
        // contiguous continuation coalesces into the same sendfile
        chain.push(Buf::file_range(file, 5, 8, BufTag("t")));

        let mut sent = 0;
        assert!(send_chain(&mut server, &mut chain, &mut sent).expect("send"));
        assert_eq!(6, sent);

        let mut got = [0u8; 6];
        client.read_exact(&mut got).expect("read");
        assert_eq!(b"234567", &got);
    }

    #[test]
    fn mixed_chain_preserves_order() {
        use std::io::Write as _;

        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        tmp.write_all(b"FILE").expect("write");
        let file = Rc::new(tmp.reopen().expect("reopen"));

        let (mut server, mut client) = pair();
        let mut chain = Chain::new();
        chain.push(Buf::from_bytes(Bytes::from_static(b"a:"), BufTag("t")));
        chain.push(Buf::file_range(file, 0, 4, BufTag("t")));
        chain.push(Buf::from_bytes(Bytes::from_static(b":z"), BufTag("t")));

        let mut sent = 0;
        assert!(send_chain(&mut server, &mut chain, &mut sent).expect("send"));

        let mut got = [0u8; 8];
        client.read_exact(&mut got).expect("read");
        assert_eq!(b"a:FILE:z", &got);
    }
}
