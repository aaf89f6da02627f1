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

//! Byte windows and buffer chains
//!
//! A [`Buf`] is a window over a contiguous byte region, either in memory or
//! in a file. Memory windows are reference-counted [`Bytes`] handles: several
//! bufs may view the same backing store (the relay sends one view to the
//! client while another is written to a temp file), and the store is freed
//! when the last view drops. A [`Chain`] strings bufs together so payloads
//! compose without copying.

use std::collections::VecDeque;
use std::fs::File;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use bytes::Buf as _;

/// Identity of the module that produced a buffer. Drained buffers are only
/// recycled back to the producer that owns the matching tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufTag(pub &'static str);

impl BufTag {
    /// Tag for buffers nobody reclaims.
    pub const NONE: BufTag = BufTag("");
}

/// Framing and storage flags carried by every buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufFlags {
    /// Data is in memory and the producer may still rewrite it.
    pub temporary: bool,
    /// Data is in read-only memory and must not be changed.
    pub memory: bool,
    /// The backing store may be reused once this window drains.
    pub recycled: bool,
    /// The window is a file range, not memory.
    pub in_file: bool,
    /// Everything buffered so far must reach the socket before more is taken.
    pub flush: bool,
    /// Downstream must not coalesce past this buffer.
    pub sync: bool,
    /// Last buffer of this chain.
    pub last_in_chain: bool,
    /// Last buffer of the whole response.
    pub last_buf: bool,
    /// The file range lives in a temp file owned by the request.
    pub temp_file: bool,
}

/// A byte range inside an open file.
#[derive(Debug, Clone)]
pub struct FileRange {
    /// Shared handle; several bufs may window the same file.
    pub file: Rc<File>,
    /// Offset of the first unsent byte.
    pub pos: u64,
    /// Offset one past the final byte of the window.
    pub last: u64,
}

/// A window over a byte region. Invariant: the memory window is exactly the
/// unsent portion of its region, and a file window has `pos <= last`.
#[derive(Debug, Clone)]
pub struct Buf {
    mem: Bytes,
    file: Option<FileRange>,
    /// Producing module.
    pub tag: BufTag,
    /// Storage and framing flags.
    pub flags: BufFlags,
}

impl Buf {
    /// A memory buffer over frozen bytes.
    pub fn from_bytes(mem: Bytes, tag: BufTag) -> Self {
        Buf {
            mem,
            file: None,
            tag,
            flags: BufFlags {
                memory: true,
                ..Default::default()
            },
        }
    }

    /// A memory buffer taking ownership of a staging buffer's contents.
    pub fn from_staging(mem: BytesMut, tag: BufTag) -> Self {
        let mut buf = Self::from_bytes(mem.freeze(), tag);
        buf.flags.temporary = true;
        buf.flags.memory = false;
        buf
    }

    /// A buffer windowing `pos..last` of `file`.
    pub fn file_range(file: Rc<File>, pos: u64, last: u64, tag: BufTag) -> Self {
        debug_assert!(pos <= last);
        Buf {
            mem: Bytes::new(),
            file: Some(FileRange { file, pos, last }),
            tag,
            flags: BufFlags {
                in_file: true,
                ..Default::default()
            },
        }
    }

    /// A zero-length buffer that only carries framing flags. Used to push
    /// `last_buf` or `flush` through the filter chain without payload.
    pub fn special(tag: BufTag) -> Self {
        let mut buf = Self::from_bytes(Bytes::new(), tag);
        buf.flags.memory = false;
        buf.flags.sync = true;
        buf
    }

    /// Bytes remaining in the window.
    #[inline]
    pub fn len(&self) -> usize {
        match &self.file {
            Some(range) if self.flags.in_file => (range.last - range.pos) as usize,
            _ => self.mem.len(),
        }
    }

    /// Whether the window has drained. Special buffers count as empty even
    /// though their flags still matter.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The in-memory window.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.mem
    }

    /// The file range, when `in_file`.
    #[inline]
    pub fn file(&self) -> Option<&FileRange> {
        self.file.as_ref()
    }

    /// Advance the read cursor by `n` sent bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        if self.flags.in_file {
            if let Some(range) = &mut self.file {
                range.pos += n as u64;
            }
        } else {
            self.mem.advance(n);
        }
    }
}

/// An ordered sequence of buffers. Appending, splitting and re-linking move
/// refcounted handles, never payload bytes.
#[derive(Debug, Default)]
pub struct Chain {
    bufs: VecDeque<Buf>,
}

impl Chain {
    pub fn new() -> Self {
        Chain::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    /// Total unsent payload bytes across the chain.
    pub fn size(&self) -> usize {
        self.bufs.iter().map(Buf::len).sum()
    }

    /// Whether any buffer carries the end-of-response mark.
    pub fn has_last_buf(&self) -> bool {
        self.bufs.iter().any(|b| b.flags.last_buf)
    }

    pub fn push(&mut self, buf: Buf) {
        self.bufs.push_back(buf);
    }

    /// Move all links of `other` onto the tail of this chain.
    pub fn append(&mut self, other: &mut Chain) {
        self.bufs.append(&mut other.bufs);
    }

    pub fn front(&self) -> Option<&Buf> {
        self.bufs.front()
    }

    pub fn pop(&mut self) -> Option<Buf> {
        self.bufs.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buf> {
        self.bufs.iter()
    }

    /// Advance the chain cursor past `sent` bytes, dropping fully drained
    /// buffers into `drained` so producers can recycle them by tag. Special
    /// zero-length buffers ahead of the cursor are dropped as they are passed.
    pub fn update_sent(&mut self, mut sent: usize, drained: &mut Vec<Buf>) {
        while let Some(front) = self.bufs.front_mut() {
            let len = front.len();
            if len == 0 {
                drained.push(self.bufs.pop_front().expect("front exists"));
                continue;
            }
            if sent == 0 {
                break;
            }
            if sent >= len {
                sent -= len;
                front.advance(len);
                drained.push(self.bufs.pop_front().expect("front exists"));
            } else {
                front.advance(sent);
                break;
            }
        }
        debug_assert_eq!(sent, 0, "sent more bytes than the chain holds");
    }
}

impl FromIterator<Buf> for Chain {
    fn from_iter<T: IntoIterator<Item = Buf>>(iter: T) -> Self {
        Chain {
            bufs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mem(data: &'static [u8]) -> Buf {
        Buf::from_bytes(Bytes::from_static(data), BufTag("test"))
    }

    #[test]
    fn buf_window_advances_without_copying_backing_store() {
        let store = Bytes::from_static(b"hello world");
        let mut a = Buf::from_bytes(store.clone(), BufTag("a"));
        let b = Buf::from_bytes(store, BufTag("b"));

        a.advance(6);
        assert_eq!(b"world", a.bytes());
        // the second view still sees the whole region
        assert_eq!(b"hello world", b.bytes());
    }

    #[test]
    fn chain_size_sums_unsent_windows() {
        let mut chain = Chain::new();
        chain.push(mem(b"abc"));
        chain.push(mem(b"defgh"));
        assert_eq!(8, chain.size());
    }

    #[test]
    fn update_sent_drops_drained_bufs_and_advances_partial() {
        let mut chain = Chain::new();
        chain.push(mem(b"abc"));
        chain.push(mem(b"defgh"));

        let mut drained = Vec::new();
        chain.update_sent(5, &mut drained);

        assert_eq!(1, drained.len());
        assert_eq!(1, chain.len());
        assert_eq!(b"fgh", chain.front().expect("buf").bytes());
    }

    #[test]
    fn update_sent_passes_special_bufs() {
        let mut chain = Chain::new();
        let mut last = Buf::special(BufTag("test"));
        last.flags.last_buf = true;
        chain.push(mem(b"abc"));
        chain.push(last);

        let mut drained = Vec::new();
        chain.update_sent(3, &mut drained);

        assert!(chain.is_empty());
        assert_eq!(2, drained.len());
        assert!(drained[1].flags.last_buf);
    }

    #[test]
    fn special_buf_is_empty_but_keeps_flags() {
        let mut buf = Buf::special(BufTag("test"));
        buf.flags.flush = true;
        assert!(buf.is_empty());
        assert!(buf.flags.sync);
        assert!(buf.flags.flush);
    }
}
