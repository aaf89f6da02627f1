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

//! The master process
//!
//! Spawns the worker pool and then sleeps in `sigsuspend`, acting on signal
//! flags: reload builds a new cycle and retires the old workers gracefully,
//! USR2 execs a new binary with the listen sockets inherited through the
//! `VAKT` variable, CHLD reaps and respawns. The master touches no request
//! traffic; everything it says to workers goes over their channels.

use std::ffi::CString;
use std::sync::Arc;

use log::{error, info, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::cycle::{self, Cycle};
use crate::process::channel::ChannelMsg;
use crate::process::signal::{self, take};
use crate::process::{spawn_worker, Process, SharedZones};
use crate::shm::ShmZone;

pub struct Master {
    cycle: Arc<Cycle>,
    procs: Vec<Process>,
    zones: SharedZones,
    /// argv of this invocation, replayed on binary upgrade.
    os_args: Vec<String>,
    /// Pid of an exec'd new master, while one is running.
    new_binary: Option<Pid>,
    /// Pid file currently carries the `.oldbin` suffix.
    pid_renamed: bool,
    exiting: bool,
    terminating: bool,
}

/// Run the master until shutdown. Returns the process exit code.
pub fn master_main(cycle: Arc<Cycle>, os_args: Vec<String>) -> i32 {
    if let Err(e) = signal::init() {
        error!("cannot install signal handlers: {}", e);
        return 1;
    }
    let suspend_mask = match signal::block() {
        Ok(mask) => mask,
        Err(e) => {
            error!("cannot block signals: {}", e);
            return 1;
        }
    };

    let pid_path = cycle.pid_path();
    if let Err(e) = cycle::create_pid_file(&pid_path, std::process::id() as i32) {
        error!("cannot write pid file {}: {}", pid_path.display(), e);
        return 1;
    }

    let accept = if cycle.conf.events.accept_mutex {
        match ShmZone::new("accept_mutex", 64) {
            Ok(zone) => Some(Arc::new(zone)),
            Err(e) => {
                warn!("cannot map accept mutex zone, falling back to lock file: {}", e);
                None
            }
        }
    } else {
        None
    };
    let cache_locks = if cycle.conf.http.cache_paths.is_empty() {
        None
    } else {
        match ShmZone::new(
            "cache_locks",
            crate::upstream::cache::LOCK_SLOTS * 16,
        ) {
            Ok(zone) => Some(Arc::new(zone)),
            Err(e) => {
                warn!("cannot map cache lock zone: {}", e);
                None
            }
        }
    };

    let mut master = Master {
        cycle,
        procs: Vec::new(),
        zones: SharedZones {
            accept,
            cache_locks,
        },
        os_args,
        new_binary: None,
        pid_renamed: false,
        exiting: false,
        terminating: false,
    };

    master.spawn_all();
    info!("master started (pid {})", std::process::id());

    loop {
        let _ = suspend_mask.suspend();

        if take(&signal::SIG_CHILD) {
            master.reap();
        }
        if take(&signal::SIG_TERMINATE) {
            info!("fast shutdown");
            master.terminating = true;
            master.broadcast(ChannelMsg::Terminate, Some(Signal::SIGTERM));
        }
        if take(&signal::SIG_QUIT) {
            info!("graceful shutdown");
            master.exiting = true;
            master.broadcast(ChannelMsg::Quit, None);
        }
        if take(&signal::SIG_WINCH) {
            info!("graceful shutdown of workers");
            master.broadcast(ChannelMsg::Quit, None);
        }
        if take(&signal::SIG_RELOAD) {
            master.reload();
        }
        if take(&signal::SIG_REOPEN) {
            info!("reopening logs");
            master.cycle.log.reopen();
            master.broadcast(ChannelMsg::Reopen, None);
        }
        if take(&signal::SIG_UPGRADE) {
            master.upgrade();
        }

        if (master.exiting || master.terminating) && master.live_workers() == 0 {
            break;
        }
    }

    let owned_pid = if master.pid_renamed {
        cycle::oldbin_path(&master.cycle.pid_path())
    } else {
        master.cycle.pid_path()
    };
    cycle::delete_pid_file(&owned_pid);
    info!("master exiting");
    0
}

impl Master {
    fn spawn_all(&mut self) {
        for slot in 0..self.cycle.conf.core.worker_processes {
            self.spawn(slot, true);
        }
    }

    fn spawn(&mut self, slot: usize, respawn: bool) {
        match spawn_worker(&self.cycle, slot, &self.zones, respawn) {
            Ok(proc) => {
                self.announce(&proc);
                self.procs.push(proc);
            }
            Err(e) => error!("cannot spawn worker {}: {}", slot, e),
        }
    }

    /// Tell every live worker about a new sibling, passing its channel fd.
    fn announce(&self, new: &Process) {
        let Some(new_channel) = &new.channel else {
            return;
        };
        let msg = ChannelMsg::OpenChannel {
            slot: new.slot as u32,
            pid: new.pid.as_raw(),
        };
        for proc in self.procs.iter().filter(|p| !p.exited) {
            if let Some(ch) = &proc.channel {
                if let Err(e) = ch.send(msg, Some(new_channel.fd())) {
                    warn!("cannot announce worker {} to {}: {}", new.slot, proc.slot, e);
                }
            }
        }
    }

    /// Channel command to all live workers; `fallback` is delivered with
    /// kill(2) when a channel has gone bad.
    fn broadcast(&mut self, msg: ChannelMsg, fallback: Option<Signal>) {
        for proc in self.procs.iter_mut().filter(|p| !p.exited) {
            if matches!(msg, ChannelMsg::Quit | ChannelMsg::Terminate) {
                proc.exiting = true;
            }
            let sent = match &proc.channel {
                Some(ch) => ch.send(msg, None).is_ok(),
                None => false,
            };
            if !sent {
                let signal = fallback.unwrap_or(Signal::SIGQUIT);
                let _ = signal::kill(proc.pid.as_raw(), signal);
            }
        }
    }

    fn live_workers(&self) -> usize {
        self.procs.iter().filter(|p| !p.exited).count()
    }

    /// Collect exited children; respawn the unexpected deaths.
    fn reap(&mut self) {
        loop {
            match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, status)) => self.reaped(pid, status),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    warn!("process {} killed by {:?}", pid, signal);
                    self.reaped(pid, 128);
                }
                Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => return,
                Ok(_) => continue,
                Err(e) => {
                    error!("waitpid failed: {}", e);
                    return;
                }
            }
        }
    }

    fn reaped(&mut self, pid: Pid, status: i32) {
        if Some(pid) == self.new_binary {
            warn!("new binary (pid {}) exited with {}", pid, status);
            self.new_binary = None;
            self.restore_pid_file();
            return;
        }

        let mut respawn_slot = None;
        let mut dead_slot = None;
        for proc in &mut self.procs {
            if proc.pid != pid {
                continue;
            }
            proc.exited = true;
            proc.channel = None;
            dead_slot = Some(proc.slot);
            if status != 0 {
                error!("worker {} (pid {}) exited with code {}", proc.slot, pid, status);
            } else {
                info!("worker {} (pid {}) exited", proc.slot, pid);
            }
            if proc.respawn && !proc.exiting && !self.exiting && !self.terminating {
                respawn_slot = Some(proc.slot);
            }
            break;
        }
        self.procs.retain(|p| !p.exited);
        if let Some(slot) = dead_slot {
            // let the survivors drop their mesh endpoint
            let close = ChannelMsg::CloseChannel {
                slot: slot as u32,
                pid: pid.as_raw(),
            };
            for proc in self.procs.iter().filter(|p| !p.exited) {
                if let Some(ch) = &proc.channel {
                    let _ = ch.send(close, None);
                }
            }
        }
        if let Some(slot) = respawn_slot {
            info!("respawning worker {}", slot);
            self.spawn(slot, true);
        }
    }

    /// Re-read the configuration. On success new workers start on the new
    /// cycle and the old generation drains; on failure nothing changes.
    fn reload(&mut self) {
        info!("reconfiguring");
        let new_cycle = Cycle::with_globals(
            &self.cycle.prefix,
            &self.cycle.conf_path,
            Some(&self.cycle),
            &[],
            self.cycle.global.clone(),
        );
        let new_cycle = match new_cycle {
            Ok(c) => Arc::new(c),
            Err(e) => {
                error!("reload failed, keeping previous configuration: {}", e);
                return;
            }
        };

        // retire the old generation before its replacements are announced
        self.broadcast(ChannelMsg::Quit, None);
        self.cycle = new_cycle;
        self.spawn_all();
        info!("reconfiguration done");
    }

    /// Exec a new master binary; the old one stays alive (and keeps its
    /// workers) until it receives QUIT.
    fn upgrade(&mut self) {
        if self.new_binary.is_some() {
            warn!("binary upgrade already in progress");
            return;
        }
        info!("upgrading binary");

        let pid_path = self.cycle.pid_path();
        let oldbin = cycle::oldbin_path(&pid_path);
        if let Err(e) = std::fs::rename(&pid_path, &oldbin) {
            error!("cannot rename pid file for upgrade: {}", e);
            return;
        }
        self.pid_renamed = true;

        match self.exec_new_binary() {
            Ok(pid) => self.new_binary = Some(pid),
            Err(e) => {
                error!("cannot exec new binary: {}", e);
                self.restore_pid_file();
            }
        }
    }

    fn exec_new_binary(&self) -> nix::Result<Pid> {
        let args: Vec<CString> = self
            .os_args
            .iter()
            .filter_map(|a| CString::new(a.as_str()).ok())
            .collect();
        // only the configured allow-list crosses the exec, plus our own
        // inherited-socket variable
        let mut env: Vec<CString> = Vec::new();
        for entry in &self.cycle.conf.core.env {
            let pair = match entry.split_once('=') {
                Some((name, value)) => Some(format!("{}={}", name, value)),
                None => std::env::var(entry).ok().map(|v| format!("{}={}", entry, v)),
            };
            if let Some(pair) = pair {
                if let Ok(cs) = CString::new(pair) {
                    env.push(cs);
                }
            }
        }
        if let Ok(cs) = CString::new(format!(
            "{}={}",
            cycle::INHERIT_ENV,
            self.cycle.inherit_env_value()
        )) {
            env.push(cs);
        }

        // Safety: single-threaded master; the child execs immediately.
        match unsafe { fork()? } {
            ForkResult::Child => {
                let _ = nix::unistd::execvpe(&args[0], &args, &env);
                // exec failed; nothing sensible left to do in this child
                std::process::exit(1);
            }
            ForkResult::Parent { child } => Ok(child),
        }
    }

    fn restore_pid_file(&mut self) {
        if !self.pid_renamed {
            return;
        }
        let pid_path = self.cycle.pid_path();
        let oldbin = cycle::oldbin_path(&pid_path);
        if let Err(e) = std::fs::rename(&oldbin, &pid_path) {
            error!("cannot restore pid file after failed upgrade: {}", e);
        }
        self.pid_renamed = false;
    }
}
