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

//! Process supervision
//!
//! The master forks one process per worker slot and keeps a table entry per
//! child: pid, the master side of its channel, and lifecycle flags. Workers
//! run the event loop and never return; everything below the fork happens in
//! the child.

use std::sync::Arc;

use log::{error, info};
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{fork, ForkResult, Pid};

use crate::cycle::Cycle;
use crate::event::accept::AcceptMutex;
use crate::process::channel::Channel;
use crate::shm::ShmZone;
use crate::worker::Worker;

pub mod channel;
pub mod master;
pub mod signal;

/// One slot of the master's process table.
#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub slot: usize,
    /// Master side of the worker's channel.
    pub channel: Option<Channel>,
    /// Graceful shutdown was requested for this worker.
    pub exiting: bool,
    pub exited: bool,
    /// Respawn if it dies without being asked to.
    pub respawn: bool,
    pub just_spawn: bool,
}

/// Shared mappings created by the master before any fork, so every worker
/// generation sees the same pages.
#[derive(Debug, Default, Clone)]
pub struct SharedZones {
    pub accept: Option<Arc<ShmZone>>,
    pub cache_locks: Option<Arc<ShmZone>>,
}

/// Fork a worker for `slot`. The child configures itself and runs the event
/// loop; the parent gets the table entry.
pub fn spawn_worker(
    cycle: &Arc<Cycle>,
    slot: usize,
    zones: &SharedZones,
    respawn: bool,
) -> nix::Result<Process> {
    let (master_end, worker_end) = Channel::pair()?;
    let zones = zones.clone();

    // Safety: the master is single-threaded; the child only uses
    // async-signal-safe calls until it rebuilds its own state.
    match unsafe { fork()? } {
        ForkResult::Child => {
            drop(master_end);
            worker_process(cycle.clone(), slot, worker_end, zones);
        }
        ForkResult::Parent { child } => {
            info!("started worker {} (pid {})", slot, child);
            Ok(Process {
                pid: child,
                slot,
                channel: Some(master_end),
                exiting: false,
                exited: false,
                respawn,
                just_spawn: true,
            })
        }
    }
}

fn worker_process(cycle: Arc<Cycle>, slot: usize, channel: Channel, zones: SharedZones) -> ! {
    if let Err(e) = signal::unblock() {
        error!("cannot unblock signals in worker: {}", e);
    }
    apply_limits(&cycle, slot);

    // shared-atomic mutex when the master mapped one; else the lock file
    let accept_mutex = match zones.accept {
        Some(zone) => Some(AcceptMutex::shared(zone)),
        None if cycle.conf.events.accept_mutex => match AcceptMutex::file(&cycle.lock_path()) {
            Ok(mutex) => Some(mutex),
            Err(e) => {
                error!("cannot open lock file for accept mutex: {}", e);
                None
            }
        },
        None => None,
    };
    let code = match Worker::new(cycle, slot, Some(channel), accept_mutex, zones.cache_locks) {
        Ok(mut worker) => match worker.run() {
            Ok(()) => 0,
            Err(e) => {
                error!("worker {} failed: {}", slot, e);
                1
            }
        },
        Err(e) => {
            error!("cannot initialise worker {}: {}", slot, e);
            1
        }
    };
    std::process::exit(code);
}

/// Detach from the controlling terminal: fork, session-lead in the child,
/// stdio onto /dev/null. The parent exits 0 so the shell returns.
pub fn daemonize() -> nix::Result<()> {
    use std::os::fd::AsRawFd;

    // Safety: called before any worker exists; the process is
    // single-threaded.
    match unsafe { fork()? } {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    nix::unistd::setsid()?;

    if let Ok(null) = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
    {
        let fd = null.as_raw_fd();
        let _ = nix::unistd::dup2(fd, 0);
        let _ = nix::unistd::dup2(fd, 1);
        let _ = nix::unistd::dup2(fd, 2);
    }
    Ok(())
}

fn apply_limits(cycle: &Arc<Cycle>, slot: usize) {
    let core = &cycle.conf.core;

    if let Some(n) = core.rlimit_nofile {
        if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, n, n) {
            error!("setrlimit(RLIMIT_NOFILE, {}) failed: {}", n, e);
        }
    }
    if let Some(n) = core.rlimit_core {
        if let Err(e) = setrlimit(Resource::RLIMIT_CORE, n, n) {
            error!("setrlimit(RLIMIT_CORE, {}) failed: {}", n, e);
        }
    }
    if let Some(dir) = &core.working_directory {
        if let Err(e) = std::env::set_current_dir(dir) {
            error!("chdir({}) failed: {}", dir.display(), e);
        }
    }
    if !core.cpu_affinity.is_empty() {
        let mask = core.cpu_affinity[slot % core.cpu_affinity.len()];
        let mut cpus = nix::sched::CpuSet::new();
        for cpu in 0..64 {
            if mask & (1 << cpu) != 0 {
                let _ = cpus.set(cpu);
            }
        }
        if let Err(e) = nix::sched::sched_setaffinity(Pid::from_raw(0), &cpus) {
            error!("sched_setaffinity({:#b}) failed: {}", mask, e);
        }
    }
}
