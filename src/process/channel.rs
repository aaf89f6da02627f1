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

//! Master/worker channel
//!
//! Each worker shares a socketpair with the master. Commands travel as a
//! fixed 16-byte record `{command, pid, slot, fd}`; an `OpenChannel` record
//! additionally carries the announced sibling's channel fd as an
//! `SCM_RIGHTS` control message, building the mesh that lets workers talk
//! to each other directly.

use std::collections::HashMap;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};

const CMD_OPEN: u32 = 1;
const CMD_CLOSE: u32 = 2;
const CMD_QUIT: u32 = 3;
const CMD_TERMINATE: u32 = 4;
const CMD_REOPEN: u32 = 5;

const RECORD_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMsg {
    /// A sibling worker appeared; its channel fd rides along as SCM_RIGHTS.
    OpenChannel { slot: u32, pid: i32 },
    /// A sibling worker is gone.
    CloseChannel { slot: u32, pid: i32 },
    Quit,
    Terminate,
    Reopen,
}

impl ChannelMsg {
    fn encode(&self) -> [u8; RECORD_LEN] {
        let (cmd, pid, slot) = match *self {
            ChannelMsg::OpenChannel { slot, pid } => (CMD_OPEN, pid, slot),
            ChannelMsg::CloseChannel { slot, pid } => (CMD_CLOSE, pid, slot),
            ChannelMsg::Quit => (CMD_QUIT, 0, 0),
            ChannelMsg::Terminate => (CMD_TERMINATE, 0, 0),
            ChannelMsg::Reopen => (CMD_REOPEN, 0, 0),
        };
        let mut record = [0u8; RECORD_LEN];
        record[0..4].copy_from_slice(&cmd.to_le_bytes());
        record[4..8].copy_from_slice(&pid.to_le_bytes());
        record[8..12].copy_from_slice(&slot.to_le_bytes());
        record
    }

    fn decode(record: &[u8]) -> Option<ChannelMsg> {
        if record.len() < RECORD_LEN {
            return None;
        }
        let cmd = u32::from_le_bytes(record[0..4].try_into().ok()?);
        let pid = i32::from_le_bytes(record[4..8].try_into().ok()?);
        let slot = u32::from_le_bytes(record[8..12].try_into().ok()?);
        match cmd {
            CMD_OPEN => Some(ChannelMsg::OpenChannel { slot, pid }),
            CMD_CLOSE => Some(ChannelMsg::CloseChannel { slot, pid }),
            CMD_QUIT => Some(ChannelMsg::Quit),
            CMD_TERMINATE => Some(ChannelMsg::Terminate),
            CMD_REOPEN => Some(ChannelMsg::Reopen),
            _ => None,
        }
    }
}

/// One endpoint of a channel, plus the sibling fds learned from
/// `OpenChannel` announcements.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
    siblings: HashMap<u32, OwnedFd>,
}

impl Channel {
    /// Create the master/worker socketpair. Non-blocking on both ends;
    /// close-on-exec so an upgraded binary starts with a clean table.
    pub fn pair() -> nix::Result<(Channel, Channel)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((Channel::from_fd(a), Channel::from_fd(b)))
    }

    pub fn from_fd(fd: OwnedFd) -> Channel {
        Channel {
            fd,
            siblings: HashMap::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Send a command, attaching `fd` as SCM_RIGHTS for `OpenChannel`.
    pub fn send(&self, msg: ChannelMsg, fd: Option<RawFd>) -> nix::Result<()> {
        let record = msg.encode();
        let iov = [IoSlice::new(&record)];
        let fds;
        let cmsgs: &[ControlMessage] = match fd {
            Some(fd) => {
                fds = [fd];
                &[ControlMessage::ScmRights(&fds)]
            }
            None => &[],
        };
        sendmsg::<()>(self.fd(), &iov, cmsgs, MsgFlags::empty(), None)?;
        Ok(())
    }

    /// Receive one command. `Ok(None)` means nothing is queued; end of file
    /// (the peer closed) surfaces as `EPIPE`.
    pub fn recv(&mut self) -> nix::Result<Option<ChannelMsg>> {
        let mut record = [0u8; RECORD_LEN];
        let mut iov = [IoSliceMut::new(&mut record)];
        let mut cmsg = nix::cmsg_space!([RawFd; 1]);

        let received = match recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        ) {
            Ok(msg) => {
                let mut passed: Option<OwnedFd> = None;
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for fd in fds {
                            // Safety: the kernel installed a fresh fd for us
                            passed = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }
                (msg.bytes, passed)
            }
            Err(nix::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(e),
        };

        let (bytes, passed) = received;
        if bytes == 0 {
            return Err(nix::Error::EPIPE);
        }
        let msg = ChannelMsg::decode(&record).ok_or(nix::Error::EBADMSG)?;
        if let (ChannelMsg::OpenChannel { slot, .. }, Some(fd)) = (&msg, passed) {
            self.siblings.insert(*slot, fd);
        }
        Ok(Some(msg))
    }

    /// Forward a command straight to a sibling worker.
    pub fn send_to_sibling(&self, slot: u32, msg: ChannelMsg) -> nix::Result<()> {
        let Some(fd) = self.siblings.get(&slot) else {
            return Err(nix::Error::ENOENT);
        };
        let record = msg.encode();
        let iov = [IoSlice::new(&record)];
        sendmsg::<()>(fd.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)?;
        Ok(())
    }

    /// Forget a sibling after its `CloseChannel`.
    pub fn close_sibling(&mut self, slot: u32) {
        self.siblings.remove(&slot);
    }
}

#[cfg(test)]
mod test {
    use super::{Channel, ChannelMsg};

    #[test]
    fn commands_round_trip_over_the_pair() {
        let (master, mut worker) = Channel::pair().expect("socketpair");
        master.send(ChannelMsg::Reopen, None).expect("send");
        master.send(ChannelMsg::Quit, None).expect("send");

        assert_eq!(Some(ChannelMsg::Reopen), worker.recv().expect("recv"));
        assert_eq!(Some(ChannelMsg::Quit), worker.recv().expect("recv"));
        assert_eq!(None, worker.recv().expect("no more"));
    }

    #[test]
    fn open_channel_passes_a_usable_fd() {
        let (master, mut worker) = Channel::pair().expect("socketpair");
        let (sibling_master, mut sibling_worker) = Channel::pair().expect("socketpair");

        master
            .send(
                ChannelMsg::OpenChannel { slot: 1, pid: 42 },
                Some(sibling_master.fd()),
            )
            .expect("send with fd");

        assert_eq!(
            Some(ChannelMsg::OpenChannel { slot: 1, pid: 42 }),
            worker.recv().expect("recv")
        );

        // the received fd reaches the sibling's endpoint
        worker
            .send_to_sibling(1, ChannelMsg::Reopen)
            .expect("mesh send");
        assert_eq!(
            Some(ChannelMsg::Reopen),
            sibling_worker.recv().expect("sibling recv")
        );
    }

    #[test]
    fn closed_peer_reports_epipe() {
        let (master, mut worker) = Channel::pair().expect("socketpair");
        drop(master);
        assert_eq!(Err(nix::Error::EPIPE), worker.recv());
    }
}
