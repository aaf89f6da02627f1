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

//! Accept-balancing mutex
//!
//! One worker at a time may have its listeners armed. The lock word is an
//! atomic holding the owner's pid in a shared zone; where shared mappings
//! are unavailable the same interface is served by an `fcntl` record lock on
//! the lock file. A worker under connection pressure (above 7/8 of its slot
//! capacity) sits out for a while instead of contesting.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::shm::ShmZone;

#[derive(Debug)]
pub enum AcceptMutex {
    Shm(ShmLock),
    File(FcntlLock),
}

impl AcceptMutex {
    /// Preferred backend: one atomic word in a pre-fork shared mapping.
    pub fn shared(zone: Arc<ShmZone>) -> AcceptMutex {
        AcceptMutex::Shm(ShmLock { zone })
    }

    /// Fallback backend: record lock on the configured lock file.
    pub fn file(path: &Path) -> std::io::Result<AcceptMutex> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(AcceptMutex::File(FcntlLock { file }))
    }

    pub fn try_lock(&self, pid: u32) -> bool {
        match self {
            AcceptMutex::Shm(lock) => lock.try_lock(pid),
            AcceptMutex::File(lock) => lock.try_lock(),
        }
    }

    pub fn unlock(&self, pid: u32) {
        match self {
            AcceptMutex::Shm(lock) => lock.unlock(pid),
            AcceptMutex::File(lock) => lock.unlock(),
        }
    }
}

#[derive(Debug)]
pub struct ShmLock {
    zone: Arc<ShmZone>,
}

impl ShmLock {
    fn word(&self) -> &std::sync::atomic::AtomicU64 {
        &self.zone.atoms(1)[0]
    }

    fn try_lock(&self, pid: u32) -> bool {
        self.word()
            .compare_exchange(0, pid as u64, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self, pid: u32) {
        let _ = self.word().compare_exchange(
            pid as u64,
            0,
            Ordering::Release,
            Ordering::Relaxed,
        );
    }
}

#[derive(Debug)]
pub struct FcntlLock {
    file: File,
}

impl FcntlLock {
    fn op(&self, lock_type: i32) -> bool {
        let mut fl: nix::libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = lock_type as i16;
        fl.l_whence = nix::libc::SEEK_SET as i16;
        nix::fcntl::fcntl(
            self.file.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETLK(&fl),
        )
        .is_ok()
    }

    fn try_lock(&self) -> bool {
        self.op(nix::libc::F_WRLCK)
    }

    fn unlock(&self) {
        self.op(nix::libc::F_UNLCK);
    }
}

/// Connection-pressure hold-off: positive once active connections exceed
/// 7/8 of capacity, decaying one per tick. While positive the worker does
/// not contest the mutex.
#[inline]
pub fn accept_disabled(capacity: usize, free: usize) -> i64 {
    capacity as i64 / 8 - free as i64
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{accept_disabled, AcceptMutex};
    use crate::shm::ShmZone;

    #[test]
    fn shm_lock_is_exclusive_until_released() {
        let zone = Arc::new(ShmZone::new("accept", 64).expect("zone"));
        let mutex = AcceptMutex::shared(zone);

        assert!(mutex.try_lock(100));
        assert!(!mutex.try_lock(200));
        mutex.unlock(100);
        assert!(mutex.try_lock(200));
    }

    #[test]
    fn unlock_by_non_holder_is_ignored() {
        let zone = Arc::new(ShmZone::new("accept", 64).expect("zone"));
        let mutex = AcceptMutex::shared(zone);

        assert!(mutex.try_lock(100));
        mutex.unlock(200);
        assert!(!mutex.try_lock(200));
    }

    #[test]
    fn file_lock_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mutex = AcceptMutex::file(&dir.path().join("vakt.lock")).expect("lock file");
        assert!(mutex.try_lock(1));
        mutex.unlock(1);
        assert!(mutex.try_lock(1));
    }

    #[test]
    fn pressure_threshold_is_seven_eighths() {
        // all slots free: far below threshold
        assert!(accept_disabled(512, 512) < 0);
        // exactly 1/8 free: at the threshold
        assert_eq!(0, accept_disabled(512, 64));
        // fewer free than 1/8: disabled
        assert!(accept_disabled(512, 63) > 0);
    }
}
