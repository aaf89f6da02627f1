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

//! Response cache
//!
//! One file per key under a two-level hex fan-out. Each file is a fixed
//! binary header (key text, validity, status, body length), the stored
//! response headers, then the body. A response being fetched streams
//! through a [`CacheWriter`] beside the relay and is renamed into place on
//! success; partial files never become visible. A corrupt or mismatched
//! file is a miss and is unlinked. The per-key fill lock lives in a shared
//! zone so only one worker fetches a given key at a time; contenders fall
//! through to origin without caching.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};

use crate::cycle::Cycle;
use crate::http::parse::Header;
use crate::shm::ShmZone;

const MAGIC: u32 = 0x7661_6b63; // "vakc"
const VERSION: u32 = 1;
const HEADER_LEN: usize = 48;
/// Slots in the shared fill-lock table; two words per slot.
pub const LOCK_SLOTS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheKeyHash(pub u64);

/// 64-bit FNV-1a; deterministic across processes and restarts.
pub fn hash_key(key: &str) -> CacheKeyHash {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in key.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    CacheKeyHash(hash)
}

#[derive(Debug)]
struct FileHeader {
    valid_until: u64,
    last_modified: u64,
    status: u16,
    key_len: u32,
    hdr_len: u32,
    body_len: u64,
}

impl FileHeader {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&VERSION.to_le_bytes());
        out[8..16].copy_from_slice(&self.valid_until.to_le_bytes());
        out[16..24].copy_from_slice(&self.last_modified.to_le_bytes());
        out[24..26].copy_from_slice(&self.status.to_le_bytes());
        // bytes 26..28 pad the lengths onto word boundaries
        out[28..32].copy_from_slice(&self.key_len.to_le_bytes());
        out[32..36].copy_from_slice(&self.hdr_len.to_le_bytes());
        out[40..48].copy_from_slice(&self.body_len.to_le_bytes());
        out
    }

    fn decode(raw: &[u8; HEADER_LEN]) -> Option<FileHeader> {
        if u32::from_le_bytes(raw[0..4].try_into().ok()?) != MAGIC
            || u32::from_le_bytes(raw[4..8].try_into().ok()?) != VERSION
        {
            return None;
        }
        Some(FileHeader {
            valid_until: u64::from_le_bytes(raw[8..16].try_into().ok()?),
            last_modified: u64::from_le_bytes(raw[16..24].try_into().ok()?),
            status: u16::from_le_bytes(raw[24..26].try_into().ok()?),
            key_len: u32::from_le_bytes(raw[28..32].try_into().ok()?),
            hdr_len: u32::from_le_bytes(raw[32..36].try_into().ok()?),
            body_len: u64::from_le_bytes(raw[40..48].try_into().ok()?),
        })
    }
}

/// A fresh cache hit, ready to serve.
#[derive(Debug)]
pub struct CachedEntry {
    pub file: std::fs::File,
    pub status: u16,
    pub headers: Vec<Header>,
    pub body_offset: u64,
    pub body_len: u64,
}

#[derive(Debug)]
pub struct FileCache {
    pub dir: PathBuf,
    pub zone: String,
    locks: Option<Arc<ShmZone>>,
}

impl FileCache {
    /// Build from the first configured `proxy_cache_path`. The lock zone is
    /// mapped by the master so every worker shares it.
    pub fn from_conf(cycle: &Arc<Cycle>) -> Option<FileCache> {
        Self::with_lock_zone(cycle, None)
    }

    pub fn with_lock_zone(cycle: &Arc<Cycle>, locks: Option<Arc<ShmZone>>) -> Option<FileCache> {
        let path_conf = cycle.conf.http.cache_paths.first()?;
        let dir = cycle.prefix.join(&path_conf.path);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!("cannot create cache directory {}: {}", dir.display(), e);
            return None;
        }
        Some(FileCache {
            dir,
            zone: path_conf.zone.clone(),
            locks,
        })
    }

    /// File path for a key hash: `<dir>/<c>/<bb>/<hex>`.
    pub fn path_for(&self, hash: CacheKeyHash) -> PathBuf {
        let hex = format!("{:016x}", hash.0);
        self.dir
            .join(&hex[15..16])
            .join(&hex[13..15])
            .join(&hex)
    }

    /// Look a key up. Expired, corrupt or colliding entries are misses;
    /// the bad file is unlinked.
    pub fn lookup(&self, key: &str, now_unix: u64) -> Option<CachedEntry> {
        let path = self.path_for(hash_key(key));
        let mut file = std::fs::File::open(&path).ok()?;

        let entry = read_entry(&mut file, key, now_unix);
        match entry {
            Some(entry) => Some(entry),
            None => {
                debug!("stale or corrupt cache file {}", path.display());
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    /// Begin filling an entry. The temp file lives in the cache directory
    /// so the final rename never crosses filesystems.
    pub fn start_write(
        &self,
        key: &str,
        status: u16,
        headers: &[Header],
        valid_for_ms: u64,
        now_unix: u64,
    ) -> std::io::Result<CacheWriter> {
        let final_path = self.path_for(hash_key(key));
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;

        let mut header_block = Vec::new();
        for h in headers {
            header_block.extend_from_slice(h.name.as_bytes());
            header_block.extend_from_slice(b": ");
            header_block.extend_from_slice(h.value.as_bytes());
            header_block.extend_from_slice(b"\r\n");
        }

        let header = FileHeader {
            valid_until: now_unix + valid_for_ms / 1000,
            last_modified: now_unix,
            status,
            key_len: key.len() as u32,
            hdr_len: header_block.len() as u32,
            body_len: 0,
        };
        tmp.write_all(&header.encode())?;
        tmp.write_all(key.as_bytes())?;
        tmp.write_all(&header_block)?;

        Ok(CacheWriter {
            tmp: Some(tmp),
            final_path,
            header,
            body_len: 0,
        })
    }

    /// Try to become the one filler for a key. Non-holders fall through to
    /// origin without caching.
    pub fn try_lock(&self, hash: CacheKeyHash, now_ms: u64, timeout_ms: u64) -> bool {
        let Some(zone) = &self.locks else {
            return true; // no shared zone: single worker, no contention
        };
        let atoms = zone.atoms(LOCK_SLOTS * 2);
        let slot = (hash.0 as usize) % LOCK_SLOTS;
        let key_word = &atoms[slot * 2];
        let deadline_word = &atoms[slot * 2 + 1];

        let held = key_word.load(Ordering::Acquire);
        if held == hash.0 && deadline_word.load(Ordering::Acquire) > now_ms {
            return false; // someone is filling this key
        }
        // empty, expired, or a different key hashed here; take the slot
        if key_word
            .compare_exchange(held, hash.0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            deadline_word.store(now_ms + timeout_ms, Ordering::Release);
            return true;
        }
        false
    }

    pub fn unlock(&self, hash: CacheKeyHash) {
        let Some(zone) = &self.locks else { return };
        let atoms = zone.atoms(LOCK_SLOTS * 2);
        let slot = (hash.0 as usize) % LOCK_SLOTS;
        let _ = atoms[slot * 2].compare_exchange(hash.0, 0, Ordering::AcqRel, Ordering::Relaxed);
        atoms[slot * 2 + 1].store(0, Ordering::Release);
    }
}

fn read_entry(file: &mut std::fs::File, key: &str, now_unix: u64) -> Option<CachedEntry> {
    let mut raw = [0u8; HEADER_LEN];
    file.read_exact(&mut raw).ok()?;
    let header = FileHeader::decode(&raw)?;

    if header.valid_until <= now_unix {
        return None;
    }
    let mut stored_key = vec![0u8; header.key_len as usize];
    file.read_exact(&mut stored_key).ok()?;
    if stored_key != key.as_bytes() {
        return None; // hash collision
    }

    let mut header_block = vec![0u8; header.hdr_len as usize];
    file.read_exact(&mut header_block).ok()?;
    let headers = parse_stored_headers(&header_block)?;

    let body_offset = (HEADER_LEN as u64) + u64::from(header.key_len) + u64::from(header.hdr_len);
    let end = file.seek(SeekFrom::End(0)).ok()?;
    if end != body_offset + header.body_len {
        return None; // truncated
    }
    file.seek(SeekFrom::Start(body_offset)).ok()?;

    Some(CachedEntry {
        file: file.try_clone().ok()?,
        status: header.status,
        headers,
        body_offset,
        body_len: header.body_len,
    })
}

fn parse_stored_headers(block: &[u8]) -> Option<Vec<Header>> {
    let text = std::str::from_utf8(block).ok()?;
    let mut headers = Vec::new();
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(": ")?;
        headers.push(Header {
            name: name.to_owned(),
            value: value.to_owned(),
        });
    }
    Some(headers)
}

/// Streams a response into a pending cache file.
#[derive(Debug)]
pub struct CacheWriter {
    tmp: Option<tempfile::NamedTempFile>,
    final_path: PathBuf,
    header: FileHeader,
    body_len: u64,
}

impl CacheWriter {
    pub fn write_body(&mut self, data: &[u8]) {
        let Some(tmp) = &mut self.tmp else { return };
        if let Err(e) = tmp.write_all(data) {
            warn!("cache write failed, aborting entry: {}", e);
            self.tmp = None;
        } else {
            self.body_len += data.len() as u64;
        }
    }

    /// Seal the entry: fix up the header, rename into place.
    pub fn commit(mut self) {
        let Some(mut tmp) = self.tmp.take() else {
            return;
        };
        self.header.body_len = self.body_len;
        let sealed = tmp
            .as_file_mut()
            .seek(SeekFrom::Start(0))
            .and_then(|_| tmp.as_file_mut().write_all(&self.header.encode()))
            .and_then(|_| tmp.as_file_mut().flush());
        if let Err(e) = sealed {
            warn!("cannot seal cache entry: {}", e);
            return;
        }
        if let Err(e) = tmp.persist(&self.final_path) {
            warn!("cannot publish cache entry {}: {}", self.final_path.display(), e);
        }
    }

    /// Drop the partial file.
    pub fn abort(mut self) {
        self.tmp = None;
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::conf::parse_file;
    use crate::cycle::Cycle;

    fn cache(dir: &Path) -> FileCache {
        let conf_path = dir.join("vakt.conf");
        let mut f = std::fs::File::create(&conf_path).expect("conf");
        f.write_all(
            b"daemon off;\nhttp { proxy_cache_path cache keys_zone=main:1m;\n\
              server { listen 127.0.0.1:0; } }\n",
        )
        .expect("write conf");
        let cycle =
            Arc::new(Cycle::new(dir, Path::new("vakt.conf"), None, &[]).expect("cycle"));
        FileCache::from_conf(&cycle).expect("cache conf present")
    }

    fn headers() -> Vec<Header> {
        vec![Header {
            name: "content-type".to_owned(),
            value: "text/plain".to_owned(),
        }]
    }

    #[test]
    fn committed_entry_is_a_fresh_hit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache(dir.path());

        let mut writer = cache
            .start_write("GET|a|/x", 200, &headers(), 60_000, 1_000)
            .expect("writer");
        writer.write_body(b"hello");
        writer.commit();

        let entry = cache.lookup("GET|a|/x", 1_010).expect("hit");
        assert_eq!(200, entry.status);
        assert_eq!(5, entry.body_len);
        assert_eq!("content-type", entry.headers[0].name);

        let mut body = String::new();
        let mut file = entry.file;
        file.seek(SeekFrom::Start(entry.body_offset)).expect("seek");
        file.read_to_string(&mut body).expect("read");
        assert_eq!("hello", body);
    }

    #[test]
    fn expired_entry_is_a_miss_and_unlinked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache(dir.path());

        let writer = cache
            .start_write("GET|a|/gone", 200, &headers(), 1_000, 1_000)
            .expect("writer");
        writer.commit();

        let path = cache.path_for(hash_key("GET|a|/gone"));
        assert!(path.exists());
        assert!(cache.lookup("GET|a|/gone", 5_000).is_none());
        assert!(!path.exists(), "expired file must be unlinked");
    }

    #[test]
    fn truncated_entry_is_treated_as_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache(dir.path());

        let mut writer = cache
            .start_write("GET|a|/trunc", 200, &headers(), 60_000, 1_000)
            .expect("writer");
        writer.write_body(b"full body");
        writer.commit();

        let path = cache.path_for(hash_key("GET|a|/trunc"));
        let data = std::fs::read(&path).expect("read file");
        std::fs::write(&path, &data[..data.len() - 3]).expect("truncate");

        assert!(cache.lookup("GET|a|/trunc", 1_010).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn aborted_entry_never_becomes_visible() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = cache(dir.path());

        let mut writer = cache
            .start_write("GET|a|/abort", 200, &headers(), 60_000, 1_000)
            .expect("writer");
        writer.write_body(b"partial");
        writer.abort();

        assert!(cache.lookup("GET|a|/abort", 1_010).is_none());
    }

    #[test]
    fn fill_lock_excludes_second_filler_until_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zone = Arc::new(crate::shm::ShmZone::new("cache-locks", LOCK_SLOTS * 16).expect("zone"));
        let conf_path = dir.path().join("vakt.conf");
        std::fs::write(
            &conf_path,
            "daemon off;\nhttp { proxy_cache_path cache keys_zone=main:1m;\nserver { listen 127.0.0.1:0; } }\n",
        )
        .expect("conf");
        let cycle = Arc::new(
            Cycle::new(dir.path(), Path::new("vakt.conf"), None, &[]).expect("cycle"),
        );
        let cache = FileCache::with_lock_zone(&cycle, Some(zone)).expect("cache");

        let key = hash_key("GET|a|/locked");
        assert!(cache.try_lock(key, 1_000, 5_000));
        assert!(!cache.try_lock(key, 2_000, 5_000), "second filler must wait");
        // lock expires with its timeout
        assert!(cache.try_lock(key, 7_000, 5_000));
        cache.unlock(key);
        assert!(cache.try_lock(key, 7_000, 5_000));
    }
}
