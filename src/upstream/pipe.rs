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

//! The buffered relay pipe
//!
//! Decouples upstream speed from client speed. Received bytes stage in
//! memory until the unsent backlog reaches `busy_buffers_size`; past that
//! they spool to a temp file (bounded by `max_temp_file_size`, flushed at
//! `temp_file_write_size` granularity) and re-enter the stream as file
//! windows, so ordering is a plain FIFO over mixed buffers. Reading pauses
//! when both the memory budget and the temp file are exhausted.

use std::io::{Seek, Write};
use std::rc::Rc;

use bytes::Bytes;
use log::warn;

use crate::buf::{Buf, BufTag, Chain};
use crate::conf::schema::ProxyConf;

pub const PIPE_TAG: BufTag = BufTag("upstream_pipe");

#[derive(Debug)]
struct TempSpool {
    tmp: tempfile::NamedTempFile,
    reader: Rc<std::fs::File>,
    /// Next append offset.
    write_pos: u64,
    /// Bytes buffered but not yet flushed into a file window.
    pending: Vec<u8>,
    /// Start offset of `pending` once flushed.
    pending_at: u64,
}

/// Staging between the upstream reader and the client writer.
#[derive(Debug)]
pub struct Pipe {
    /// Ordered, undelivered output (memory and file windows mixed).
    out: Chain,
    temp: Option<TempSpool>,
    busy_size: usize,
    max_temp: u64,
    write_size: usize,
    /// Size of each upstream read.
    pub read_size: usize,
    /// Preferred number of in-flight read buffers.
    pub buffer_count: usize,
}

impl Pipe {
    pub fn new(conf: &ProxyConf) -> Pipe {
        Pipe {
            out: Chain::new(),
            temp: None,
            busy_size: conf.busy_buffers_size as usize,
            max_temp: conf.max_temp_file_size,
            write_size: conf.temp_file_write_size as usize,
            read_size: conf.buffers.1 as usize,
            buffer_count: conf.buffers.0,
        }
    }

    /// Undelivered bytes staged in memory windows.
    fn staged_in_memory(&self) -> usize {
        self.out
            .iter()
            .filter(|b| !b.flags.in_file)
            .map(Buf::len)
            .sum()
    }

    fn temp_used(&self) -> u64 {
        self.temp
            .as_ref()
            .map(|t| t.write_pos + t.pending.len() as u64)
            .unwrap_or(0)
    }

    /// Whether another upstream read may be accepted right now.
    pub fn can_accept(&self) -> bool {
        if self.staged_in_memory() < self.busy_size {
            return true;
        }
        self.temp_used() < self.max_temp
    }

    /// Stage one decoded chunk from the upstream.
    pub fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let spooling = self.temp.is_some() || self.staged_in_memory() >= self.busy_size;
        if !spooling {
            self.out.push(Buf::from_bytes(data, PIPE_TAG));
            return;
        }
        if let Err(e) = self.spool(&data) {
            warn!("pipe temp file failed, staying in memory: {}", e);
            self.out.push(Buf::from_bytes(data, PIPE_TAG));
        }
    }

    fn spool(&mut self, data: &[u8]) -> std::io::Result<()> {
        if self.temp.is_none() {
            let tmp = tempfile::NamedTempFile::new()?;
            let reader = Rc::new(tmp.reopen()?);
            self.temp = Some(TempSpool {
                tmp,
                reader,
                write_pos: 0,
                pending: Vec::new(),
                pending_at: 0,
            });
        }
        let temp = self.temp.as_mut().expect("just created");
        temp.pending.extend_from_slice(data);
        if temp.pending.len() >= self.write_size {
            flush_pending(temp, &mut self.out)?;
        }
        Ok(())
    }

    /// Hand every staged buffer to the caller (appended to the client's
    /// out-chain). Pending spool bytes are flushed first so order holds.
    pub fn drain(&mut self) -> std::io::Result<Chain> {
        if let Some(temp) = &mut self.temp {
            flush_pending(temp, &mut self.out)?;
        }
        let mut chain = Chain::new();
        chain.append(&mut self.out);
        Ok(chain)
    }

    /// True when nothing is staged anywhere.
    pub fn is_drained(&self) -> bool {
        self.out.is_empty()
            && self
                .temp
                .as_ref()
                .map(|t| t.pending.is_empty())
                .unwrap_or(true)
    }
}

fn flush_pending(temp: &mut TempSpool, out: &mut Chain) -> std::io::Result<()> {
    if temp.pending.is_empty() {
        return Ok(());
    }
    temp.tmp.as_file_mut().seek(std::io::SeekFrom::Start(temp.write_pos))?;
    temp.tmp.as_file_mut().write_all(&temp.pending)?;
    let start = temp.write_pos;
    temp.write_pos += temp.pending.len() as u64;
    temp.pending.clear();
    temp.pending_at = temp.write_pos;

    let mut buf = Buf::file_range(temp.reader.clone(), start, temp.write_pos, PIPE_TAG);
    buf.flags.temp_file = true;
    out.push(buf);
    Ok(())
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::Pipe;
    use crate::conf::schema::ProxyConf;

    fn small_pipe() -> Pipe {
        let conf = ProxyConf {
            busy_buffers_size: 8,
            temp_file_write_size: 4,
            max_temp_file_size: 1024,
            ..Default::default()
        };
        Pipe::new(&conf)
    }

    fn collect(pipe: &mut Pipe) -> Vec<u8> {
        let chain = pipe.drain().expect("drain");
        let mut all = Vec::new();
        for buf in chain.iter() {
            if buf.flags.in_file {
                use std::io::{Read, Seek, SeekFrom};
                let range = buf.file().expect("file range");
                let mut f = range.file.try_clone().expect("clone");
                f.seek(SeekFrom::Start(range.pos)).expect("seek");
                let mut data = vec![0u8; (range.last - range.pos) as usize];
                f.read_exact(&mut data).expect("read spool");
                all.extend_from_slice(&data);
            } else {
                all.extend_from_slice(buf.bytes());
            }
        }
        all
    }

    #[test]
    fn small_amounts_stay_in_memory() {
        let mut pipe = small_pipe();
        pipe.push(Bytes::from_static(b"abc"));
        pipe.push(Bytes::from_static(b"de"));
        assert!(pipe.temp_used() == 0);
        assert_eq!(b"abcde".to_vec(), collect(&mut pipe));
    }

    #[test]
    fn overflow_spools_to_the_temp_file_in_order() {
        let mut pipe = small_pipe();
        pipe.push(Bytes::from_static(b"12345678")); // fills the memory budget
        pipe.push(Bytes::from_static(b"ABCD")); // spools
        pipe.push(Bytes::from_static(b"EFGH")); // spools
        assert!(pipe.temp_used() > 0);
        assert_eq!(b"12345678ABCDEFGH".to_vec(), collect(&mut pipe));
    }

    #[test]
    fn drain_flushes_sub_granularity_tail() {
        let mut pipe = small_pipe();
        pipe.push(Bytes::from_static(b"12345678"));
        pipe.push(Bytes::from_static(b"x")); // below write_size, stays pending
        assert_eq!(b"12345678x".to_vec(), collect(&mut pipe));
        assert!(pipe.is_drained());
    }

    #[test]
    fn backpressure_when_memory_and_temp_are_full() {
        let conf = ProxyConf {
            busy_buffers_size: 4,
            temp_file_write_size: 2,
            max_temp_file_size: 4,
            ..Default::default()
        };
        let mut pipe = Pipe::new(&conf);
        pipe.push(Bytes::from_static(b"mmmm"));
        assert!(pipe.can_accept(), "temp file still has room");
        pipe.push(Bytes::from_static(b"tttt"));
        assert!(!pipe.can_accept(), "memory and temp both at their caps");

        let _ = pipe.drain().expect("drain");
        assert!(pipe.can_accept(), "drained pipe accepts again");
    }
}
