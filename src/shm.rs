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

//! Shared memory zones
//!
//! A named region mapped `MAP_SHARED | MAP_ANONYMOUS` by the master before
//! forking, so every worker sees the same pages. The core only guarantees
//! the mapping exists before handlers run; layout and locking discipline
//! belong to the owning module. The accept mutex and the cache lock table
//! are the two in-tree users, both built on atomics within a zone.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

/// A cross-worker shared memory region. Created once in the master; the
/// mapping survives fork and is unmapped when the last process exits.
#[derive(Debug)]
pub struct ShmZone {
    name: String,
    ptr: NonNull<core::ffi::c_void>,
    size: usize,
}

impl ShmZone {
    /// Map a zero-initialised shared region of at least `size` bytes.
    pub fn new(name: &str, size: usize) -> nix::Result<ShmZone> {
        let len = NonZeroUsize::new(size.max(1)).expect("nonzero mapping");
        // Safety: anonymous mapping, no address hint, no fd aliasing.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
            )?
        };
        Ok(ShmZone {
            name: name.to_owned(),
            ptr,
            size: len.get(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// View the zone as a slice of atomic words. Panics if the zone is too
    /// small for `count` words; callers size their zone at registration.
    pub fn atoms(&self, count: usize) -> &[AtomicU64] {
        assert!(count * std::mem::size_of::<AtomicU64>() <= self.size);
        // Safety: the mapping is page-aligned (stricter than AtomicU64),
        // zero-initialised by the kernel, lives as long as `self`, and
        // atomics are the only access path handed out.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<AtomicU64>(), count) }
    }
}

impl Drop for ShmZone {
    fn drop(&mut self) {
        // Safety: `ptr`/`size` came from mmap_anonymous and are unmapped once.
        unsafe {
            let _ = munmap(self.ptr, self.size);
        }
    }
}

// The zone is only shared across processes, never across threads in one
// process; workers are single-threaded.
unsafe impl Send for ShmZone {}

#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;

    use super::ShmZone;

    #[test]
    fn zone_is_zero_initialised_and_writable() {
        let zone = ShmZone::new("test", 4096).expect("mmap");
        let atoms = zone.atoms(8);
        assert!(atoms.iter().all(|a| a.load(Ordering::Relaxed) == 0));
        atoms[3].store(77, Ordering::Relaxed);
        assert_eq!(77, zone.atoms(8)[3].load(Ordering::Relaxed));
    }

    #[test]
    fn zone_survives_fork_visibility() {
        use nix::sys::wait::waitpid;
        use nix::unistd::{fork, ForkResult};

        let zone = ShmZone::new("fork-test", 4096).expect("mmap");
        // Safety: the child only touches the zone and leaves through _exit,
        // skipping atexit machinery inherited from the test harness.
        match unsafe { fork() }.expect("fork") {
            ForkResult::Child => {
                zone.atoms(1)[0].store(42, Ordering::SeqCst);
                unsafe { nix::libc::_exit(0) };
            }
            ForkResult::Parent { child } => {
                waitpid(child, None).expect("waitpid");
                assert_eq!(42, zone.atoms(1)[0].load(Ordering::SeqCst));
            }
        }
    }
}
