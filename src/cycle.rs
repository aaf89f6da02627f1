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

//! The cycle
//!
//! A [`Cycle`] is the immutable-after-init snapshot of the configured world:
//! parsed directives, typed configuration, listening sockets, log handles and
//! paths. Reload builds a new cycle from the previous one, inheriting
//! listeners whose addresses survived; the old cycle stays alive behind its
//! `Arc` until the last worker of the old generation drains.
//!
//! Listening sockets are opened without `CLOEXEC` so they survive the exec
//! of a binary upgrade; their numbers travel in the `VAKT` environment
//! variable as a `;`-separated list.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sys::socket::{
    bind, getsockname, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag,
    SockType, SockaddrStorage,
};
use thiserror::Error;

use crate::conf::{parse_file, Conf, ConfError, Directive};
use crate::log::ErrorLog;

/// Name of the environment variable carrying inherited listener fds.
pub const INHERIT_ENV: &str = "VAKT";

/// Listen backlog, as large as the platform allows.
const BACKLOG: i32 = 511;

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Conf(#[from] ConfError),
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: nix::Error,
    },
    #[error("{msg}: {source}")]
    Io {
        msg: String,
        source: std::io::Error,
    },
}

/// One listening socket. The master owns the fd; forked workers share it
/// through fd inheritance and wrap their copy for the event loop.
#[derive(Debug)]
pub struct Listening {
    pub addr: SocketAddr,
    pub socket: std::net::TcpListener,
    /// Came from the previous cycle or the `VAKT` variable rather than a
    /// fresh bind.
    pub inherited: bool,
}

impl Listening {
    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[derive(Debug)]
pub struct Cycle {
    pub tree: Vec<Directive>,
    /// `-g` directives, re-applied on every reload.
    pub global: Vec<Directive>,
    pub conf: Conf,
    pub conf_path: PathBuf,
    pub prefix: PathBuf,
    pub hostname: String,
    pub listening: Vec<Listening>,
    pub log: ErrorLog,
}

impl Cycle {
    /// Parse the configuration and open (or inherit) every listening socket.
    pub fn new(
        prefix: &Path,
        conf_path: &Path,
        prev: Option<&Cycle>,
        inherited: &[RawFd],
    ) -> Result<Cycle, CycleError> {
        Self::with_globals(prefix, conf_path, prev, inherited, Vec::new())
    }

    pub fn with_globals(
        prefix: &Path,
        conf_path: &Path,
        prev: Option<&Cycle>,
        inherited: &[RawFd],
        global: Vec<Directive>,
    ) -> Result<Cycle, CycleError> {
        let conf_path = if conf_path.is_absolute() {
            conf_path.to_owned()
        } else {
            prefix.join(conf_path)
        };
        let tree = parse_file(&conf_path)?;
        let mut merged: Vec<Directive> = global.clone();
        merged.extend(tree.iter().cloned());
        let conf = Conf::build(&merged)?;

        let log = ErrorLog::open(&prefix.join(&conf.core.error_log), conf.core.log_level);

        let mut inherited = resolve_inherited(inherited);
        let mut listening = Vec::new();
        let mut addrs: Vec<SocketAddr> = Vec::new();
        for server in &conf.http.servers {
            for addr in &server.listen {
                if !addrs.contains(addr) {
                    addrs.push(*addr);
                }
            }
        }

        for addr in addrs {
            let listener = take_existing(prev, &mut inherited, addr);
            match listener {
                Some((socket, from)) => listening.push(Listening {
                    addr,
                    socket,
                    inherited: from,
                }),
                None => listening.push(Listening {
                    addr,
                    socket: open_listener(addr)?,
                    inherited: false,
                }),
            }
        }

        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();

        Ok(Cycle {
            tree,
            global,
            conf,
            conf_path,
            prefix: prefix.to_owned(),
            hostname,
            listening,
            log,
        })
    }

    /// Encode the listener fds for the `VAKT` variable of an exec'd binary.
    pub fn inherit_env_value(&self) -> String {
        let mut value = String::new();
        for l in &self.listening {
            value.push_str(&l.fd().to_string());
            value.push(';');
        }
        value
    }

    pub fn pid_path(&self) -> PathBuf {
        self.prefix.join(&self.conf.core.pid_path)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.prefix.join(&self.conf.core.lock_file)
    }
}

/// Parse the `VAKT` environment variable into raw fds.
pub fn inherited_fds() -> Vec<RawFd> {
    let Ok(value) = std::env::var(INHERIT_ENV) else {
        return Vec::new();
    };
    value
        .split(';')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Map inherited fds to their bound addresses so reload and upgrade can
/// match them against the new configuration.
fn resolve_inherited(fds: &[RawFd]) -> Vec<(SocketAddr, std::net::TcpListener)> {
    let mut resolved = Vec::new();
    for &fd in fds {
        let Ok(stored) = getsockname::<SockaddrStorage>(fd) else {
            log::error!("invalid socket {} in {} variable, ignoring", fd, INHERIT_ENV);
            continue;
        };
        let addr = sockaddr_to_std(&stored);
        if let Some(addr) = addr {
            // Safety: the fd came from the parent master via exec and is not
            // owned by anything else in this process.
            let socket = unsafe { std::net::TcpListener::from_raw_fd(fd) };
            let _ = socket.set_nonblocking(true);
            resolved.push((addr, socket));
        }
    }
    resolved
}

fn take_existing(
    prev: Option<&Cycle>,
    inherited: &mut Vec<(SocketAddr, std::net::TcpListener)>,
    addr: SocketAddr,
) -> Option<(std::net::TcpListener, bool)> {
    if let Some(pos) = inherited.iter().position(|(a, _)| *a == addr) {
        return Some((inherited.remove(pos).1, true));
    }
    if let Some(prev) = prev {
        if let Some(l) = prev.listening.iter().find(|l| l.addr == addr) {
            if let Ok(cloned) = l.socket.try_clone() {
                return Some((cloned, true));
            }
        }
    }
    None
}

fn sockaddr_to_std(stored: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(v4) = stored.as_sockaddr_in() {
        return Some(SocketAddr::from((v4.ip(), v4.port())));
    }
    if let Some(v6) = stored.as_sockaddr_in6() {
        return Some(SocketAddr::from((v6.ip(), v6.port())));
    }
    None
}

/// Open a listener the long way: reuse-addr, non-blocking, no close-on-exec
/// (the fd must survive a binary upgrade).
fn open_listener(addr: SocketAddr) -> Result<std::net::TcpListener, CycleError> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let bind_err = |source| CycleError::Bind { addr, source };

    let fd = socket(family, SockType::Stream, SockFlag::SOCK_NONBLOCK, None).map_err(bind_err)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(bind_err)?;
    let storage = SockaddrStorage::from(addr);
    bind(fd.as_raw_fd(), &storage).map_err(bind_err)?;
    listen(&fd, Backlog::new(BACKLOG).expect("valid backlog")).map_err(bind_err)?;

    // Safety: `fd` is an owned, freshly created socket; ownership transfers
    // to the TcpListener.
    Ok(unsafe { std::net::TcpListener::from_raw_fd(std::os::fd::IntoRawFd::into_raw_fd(fd)) })
}

/// Write the master pid, newline-terminated.
pub fn create_pid_file(path: &Path, pid: i32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", pid))
}

pub fn read_pid_file(path: &Path) -> std::io::Result<i32> {
    let contents = std::fs::read_to_string(path)?;
    contents.trim().parse().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid pid in {}", path.display()),
        )
    })
}

pub fn delete_pid_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// The `.oldbin` rename dance around a binary upgrade.
pub fn oldbin_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".oldbin");
    PathBuf::from(os)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn write_conf(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("vakt.conf");
        let mut f = std::fs::File::create(&path).expect("create conf");
        f.write_all(body.as_bytes()).expect("write conf");
        path
    }

    #[test]
    fn cycle_binds_each_listen_address_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_conf(
            dir.path(),
            "daemon off;\nhttp { server { listen 127.0.0.1:0; } server { listen 127.0.0.1:0; } }\n",
        );

        // port 0 yields two distinct sockets; identical addresses collapse
        let cycle = Cycle::new(dir.path(), Path::new("vakt.conf"), None, &[]).expect("cycle");
        assert_eq!(1, cycle.listening.len());
        assert!(!cycle.listening[0].inherited);
    }

    #[test]
    fn reload_inherits_listeners_with_matching_addresses() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_conf(
            dir.path(),
            "daemon off;\nhttp { server { listen 127.0.0.1:18095; } }\n",
        );

        let first = Cycle::new(dir.path(), Path::new("vakt.conf"), None, &[]).expect("cycle");
        let second =
            Cycle::new(dir.path(), Path::new("vakt.conf"), Some(&first), &[]).expect("reload");
        assert!(second.listening[0].inherited);
        assert_eq!(first.listening[0].addr, second.listening[0].addr);
    }

    #[test]
    fn inherit_env_value_lists_fds_semicolon_terminated() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_conf(
            dir.path(),
            "daemon off;\nhttp { server { listen 127.0.0.1:0; } }\n",
        );
        let cycle = Cycle::new(dir.path(), Path::new("vakt.conf"), None, &[]).expect("cycle");
        let value = cycle.inherit_env_value();
        assert_eq!(format!("{};", cycle.listening[0].fd()), value);
    }

    #[test]
    fn pid_file_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vakt.pid");
        create_pid_file(&path, 4242).expect("write pid");
        assert_eq!(4242, read_pid_file(&path).expect("read pid"));
        assert_eq!(
            dir.path().join("vakt.pid.oldbin"),
            oldbin_path(&path)
        );
    }
}
