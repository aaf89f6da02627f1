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

//! Signal handling
//!
//! Handlers do nothing but set a flag; the master consumes the flags in its
//! `sigsuspend` loop, workers check them after `poll` returns `EINTR`. The
//! mapping follows the conventional reverse-proxy protocol: HUP reload,
//! USR1 reopen, USR2 binary upgrade, QUIT graceful, TERM/INT fast, WINCH
//! workers-only shutdown, CHLD reap.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

pub static SIG_RELOAD: AtomicBool = AtomicBool::new(false);
pub static SIG_REOPEN: AtomicBool = AtomicBool::new(false);
pub static SIG_UPGRADE: AtomicBool = AtomicBool::new(false);
pub static SIG_QUIT: AtomicBool = AtomicBool::new(false);
pub static SIG_TERMINATE: AtomicBool = AtomicBool::new(false);
pub static SIG_WINCH: AtomicBool = AtomicBool::new(false);
pub static SIG_CHILD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signo: i32) {
    let Ok(signal) = Signal::try_from(signo) else {
        return;
    };
    let flag = match signal {
        Signal::SIGHUP => &SIG_RELOAD,
        Signal::SIGUSR1 => &SIG_REOPEN,
        Signal::SIGUSR2 => &SIG_UPGRADE,
        Signal::SIGQUIT => &SIG_QUIT,
        Signal::SIGTERM | Signal::SIGINT => &SIG_TERMINATE,
        Signal::SIGWINCH => &SIG_WINCH,
        Signal::SIGCHLD => &SIG_CHILD,
        _ => return,
    };
    flag.store(true, Ordering::SeqCst);
}

/// The signals the master multiplexes on.
pub fn handled_signals() -> [Signal; 8] {
    [
        Signal::SIGHUP,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGWINCH,
        Signal::SIGCHLD,
    ]
}

/// Install the flag-setting handler for every managed signal.
pub fn init() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in handled_signals() {
        // Safety: the handler is async-signal-safe (one atomic store).
        unsafe {
            sigaction(signal, &action)?;
        }
    }
    // writing to a half-closed socket is an error return, not a death
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // Safety: ignoring SIGPIPE has no handler to be unsafe about.
    unsafe {
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

/// Block the managed signals; they are delivered inside `sigsuspend` only.
/// Returns the mask to suspend with (everything unblocked).
pub fn block() -> nix::Result<SigSet> {
    let mut mask = SigSet::empty();
    for signal in handled_signals() {
        mask.add(signal);
    }
    mask.thread_block()?;
    Ok(SigSet::empty())
}

/// Undo [`block`] in a freshly forked worker.
pub fn unblock() -> nix::Result<()> {
    let mut mask = SigSet::empty();
    for signal in handled_signals() {
        mask.add(signal);
    }
    mask.thread_unblock()
}

/// Take (and clear) a flag.
pub fn take(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::SeqCst)
}

/// Map a `-s` argument to the signal delivered to the running master.
pub fn from_cli(name: &str) -> Option<Signal> {
    match name {
        "stop" => Some(Signal::SIGTERM),
        "quit" => Some(Signal::SIGQUIT),
        "reopen" => Some(Signal::SIGUSR1),
        "reload" => Some(Signal::SIGHUP),
        _ => None,
    }
}

pub fn kill(pid: i32, signal: Signal) -> nix::Result<()> {
    nix::sys::signal::kill(Pid::from_raw(pid), signal)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cli_names_map_to_the_documented_signals() {
        assert_eq!(Some(Signal::SIGTERM), from_cli("stop"));
        assert_eq!(Some(Signal::SIGQUIT), from_cli("quit"));
        assert_eq!(Some(Signal::SIGUSR1), from_cli("reopen"));
        assert_eq!(Some(Signal::SIGHUP), from_cli("reload"));
        assert_eq!(None, from_cli("restart"));
    }

    #[test]
    fn take_clears_the_flag() {
        SIG_REOPEN.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(take(&SIG_REOPEN));
        assert!(!take(&SIG_REOPEN));
    }
}
