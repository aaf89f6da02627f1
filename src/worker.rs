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

//! The worker event loop
//!
//! One `Poll` per worker, no threads. A tick computes the poll timeout from
//! the timer tree, contests the accept mutex when below the connection
//! pressure threshold, polls once, partitions ready events into the accept
//! and regular posted queues, drains them in that order, releases the mutex,
//! and fires expired timers. The poll call is the only place a worker ever
//! blocks; handlers express pending I/O by re-arming their event and
//! returning.

use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::conn::{ConnCtx, ConnId, Connections};
use crate::cycle::Cycle;
use crate::event::accept::{accept_disabled, AcceptMutex};
use crate::event::timer::TimerTree;
use crate::event::{Clock, EventHandler, EventId};
use crate::http::HttpRuntime;
use crate::log::AccessLog;
use crate::process::channel::{Channel, ChannelMsg};
use crate::upstream::cache::FileCache;

/// Poll wait cap when no timer is armed.
const MAX_WAIT: Duration = Duration::from_millis(500);
/// How many connections one accept-ready event may establish per pass.
const SINGLE_ACCEPT: usize = 1;

pub struct Worker {
    pub cycle: Arc<Cycle>,
    pub slot: usize,
    pub poll: Poll,
    pub conns: Connections,
    pub timers: TimerTree,
    pub clock: Clock,
    posted_accept: Vec<EventId>,
    posted: Vec<EventId>,
    accept_mutex: Option<AcceptMutex>,
    accept_mutex_held: bool,
    accept_disabled: i64,
    listeners_enabled: bool,
    channel: Option<Channel>,
    pub http: HttpRuntime,
    pub access_log: AccessLog,
    pub cache: Option<FileCache>,
    /// Graceful shutdown: listeners closed, draining in-flight requests.
    pub exiting: bool,
    /// Leave the loop now.
    pub quit: bool,
}

impl Worker {
    pub fn new(
        cycle: Arc<Cycle>,
        slot: usize,
        channel: Option<Channel>,
        accept_mutex: Option<AcceptMutex>,
        cache_locks: Option<std::sync::Arc<crate::shm::ShmZone>>,
    ) -> io::Result<Worker> {
        let poll = Poll::new()?;
        let capacity = cycle.conf.events.worker_connections;
        let http = HttpRuntime::new(&cycle);
        let access_log = AccessLog::open(
            cycle
                .conf
                .http
                .access_log
                .as_ref()
                .map(|p| cycle.prefix.join(p))
                .as_deref(),
        );
        let cache = FileCache::with_lock_zone(&cycle, cache_locks);

        let mut worker = Worker {
            cycle,
            slot,
            poll,
            conns: Connections::new(capacity),
            timers: TimerTree::new(),
            clock: Clock::new(),
            posted_accept: Vec::new(),
            posted: Vec::new(),
            accept_mutex,
            accept_mutex_held: false,
            accept_disabled: 0,
            listeners_enabled: false,
            channel,
            http,
            access_log,
            cache,
            exiting: false,
            quit: false,
        };

        worker.open_listeners()?;
        worker.open_channel()?;
        if worker.accept_mutex.is_none() {
            worker.enable_listeners()?;
        }
        Ok(worker)
    }

    /// Claim a slot per listening socket so accept readiness flows through
    /// the same event table as everything else.
    fn open_listeners(&mut self) -> io::Result<()> {
        for i in 0..self.cycle.listening.len() {
            let cid = self
                .conns
                .claim()
                .map_err(|_| io::Error::new(ErrorKind::Other, "connection table too small"))?;
            let conn = self.conns.get_mut(cid).expect("claimed slot");
            conn.ctx = ConnCtx::Listener(i);
            conn.read.handler = EventHandler::Accept;
        }
        Ok(())
    }

    fn open_channel(&mut self) -> io::Result<()> {
        let Some(channel) = &self.channel else {
            return Ok(());
        };
        let fd = channel.fd();
        let cid = self
            .conns
            .claim()
            .map_err(|_| io::Error::new(ErrorKind::Other, "connection table too small"))?;
        let conn = self.conns.get_mut(cid).expect("claimed slot");
        conn.ctx = ConnCtx::Channel;
        conn.read.handler = EventHandler::Channel;
        conn.read.active = true;
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(cid), Interest::READABLE)?;
        Ok(())
    }

    fn enable_listeners(&mut self) -> io::Result<()> {
        if self.listeners_enabled || self.exiting {
            return Ok(());
        }
        for cid in self.listener_slots() {
            let lidx = match self.conns.get(cid).map(|c| &c.ctx) {
                Some(&ConnCtx::Listener(i)) => i,
                _ => continue,
            };
            let fd = self.cycle.listening[lidx].fd();
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(cid), Interest::READABLE)?;
            if let Some(conn) = self.conns.get_mut(cid) {
                conn.read.active = true;
            }
        }
        self.listeners_enabled = true;
        Ok(())
    }

    fn disable_listeners(&mut self) -> io::Result<()> {
        if !self.listeners_enabled {
            return Ok(());
        }
        for cid in self.listener_slots() {
            let lidx = match self.conns.get(cid).map(|c| &c.ctx) {
                Some(&ConnCtx::Listener(i)) => i,
                _ => continue,
            };
            let fd = self.cycle.listening[lidx].fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            if let Some(conn) = self.conns.get_mut(cid) {
                conn.read.active = false;
            }
        }
        self.listeners_enabled = false;
        Ok(())
    }

    fn listener_slots(&self) -> Vec<ConnId> {
        self.conns
            .ids()
            .into_iter()
            .filter(|&cid| {
                matches!(
                    self.conns.get(cid).map(|c| &c.ctx),
                    Some(ConnCtx::Listener(_))
                )
            })
            .collect()
    }

    /// Run until told to quit. Only returns cleanly on shutdown.
    pub fn run(&mut self) -> io::Result<()> {
        info!("worker {} started", self.slot);
        let mut events = Events::with_capacity(512);

        while !self.quit {
            self.tick(&mut events)?;

            // signals delivered straight to the worker, not via the channel
            use crate::process::signal;
            if signal::take(&signal::SIG_QUIT) {
                self.begin_exit();
            }
            if signal::take(&signal::SIG_TERMINATE) {
                self.quit = true;
            }
            if signal::take(&signal::SIG_REOPEN) {
                self.cycle.log.reopen();
                self.access_log.reopen();
            }

            if self.exiting && self.active_requests() == 0 {
                debug!("worker {} drained", self.slot);
                self.quit = true;
            }
        }
        info!("worker {} exiting", self.slot);
        Ok(())
    }

    /// One pass of the loop; the poll call inside is the worker's only
    /// suspension point.
    fn tick(&mut self, events: &mut Events) -> io::Result<()> {
        let now = self.clock.now();
        let mut timeout = self
            .timers
            .next_timeout(now)
            .map(Duration::from_millis)
            .unwrap_or(MAX_WAIT)
            .min(MAX_WAIT);

        if self.accept_mutex.is_some() {
            if self.exiting {
                // drained workers never contest
            } else if self.accept_disabled > 0 {
                self.accept_disabled -= 1;
            } else {
                let pid = std::process::id();
                let locked = self
                    .accept_mutex
                    .as_ref()
                    .map(|m| m.try_lock(pid))
                    .unwrap_or(false);
                if locked {
                    self.accept_mutex_held = true;
                    self.enable_listeners()?;
                } else {
                    self.disable_listeners()?;
                }
                timeout = timeout.min(Duration::from_millis(
                    self.cycle.conf.events.accept_mutex_delay,
                ));
            }
        }

        match self.poll.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {
                self.clock.update();
                self.release_accept_mutex();
                return Ok(());
            }
            Err(e) => {
                error!("poll failed: {}", e);
                return Err(e);
            }
        }
        self.clock.update();

        for event in events.iter() {
            let cid = event.token().0;
            let Some(conn) = self.conns.get_mut(cid) else {
                continue;
            };
            let gen = conn.gen;
            let is_listener = matches!(conn.ctx, ConnCtx::Listener(_));

            if event.is_readable() || event.is_read_closed() || event.is_error() {
                conn.read.ready = true;
                if event.is_read_closed() {
                    conn.read.eof = true;
                }
                if event.is_error() {
                    conn.read.error = true;
                }
                if !conn.read.posted {
                    conn.read.posted = true;
                    let id = EventId {
                        cid,
                        write: false,
                        gen,
                    };
                    if is_listener {
                        self.posted_accept.push(id);
                    } else {
                        self.posted.push(id);
                    }
                }
            }

            let Some(conn) = self.conns.get_mut(cid) else {
                continue;
            };
            if event.is_writable() || event.is_write_closed() {
                conn.write.ready = true;
                if event.is_write_closed() {
                    conn.write.error = true;
                }
                if !conn.write.posted {
                    conn.write.posted = true;
                    self.posted.push(EventId {
                        cid,
                        write: true,
                        gen,
                    });
                }
            }
        }

        // accept events run first, then the mutex is released so siblings
        // can take the next tick's connections, then regular events
        self.drain_accept();
        self.release_accept_mutex();
        self.drain_regular();
        self.expire_timers();
        // timer handlers may have posted follow-up work into this tick
        self.drain_regular();
        Ok(())
    }

    fn release_accept_mutex(&mut self) {
        if self.accept_mutex_held {
            if let Some(mutex) = &self.accept_mutex {
                mutex.unlock(std::process::id());
            }
            self.accept_mutex_held = false;
        }
    }

    fn drain_accept(&mut self) {
        while !self.posted_accept.is_empty() {
            let id = self.posted_accept.remove(0);
            self.run_posted(id);
        }
    }

    fn drain_regular(&mut self) {
        // dispatch in enqueue order; handlers may post more work into the
        // same tick
        while !self.posted.is_empty() {
            let id = self.posted.remove(0);
            self.run_posted(id);
        }
    }

    fn run_posted(&mut self, id: EventId) {
        let Some(conn) = self.conns.get_mut(id.cid) else {
            return; // slot released since posting
        };
        if conn.gen != id.gen {
            return; // slot reused since posting
        }
        let ev = if id.write {
            &mut conn.write
        } else {
            &mut conn.read
        };
        ev.posted = false;
        self.run_event(id);
    }

    fn expire_timers(&mut self) {
        let now = self.clock.now();
        while let Some(id) = self.timers.pop_expired(now) {
            let Some(conn) = self.conns.get_mut(id.cid) else {
                continue;
            };
            if conn.gen != id.gen {
                continue;
            }
            let ev = if id.write {
                &mut conn.write
            } else {
                &mut conn.read
            };
            ev.timer = None;
            ev.timed_out = true;
            self.run_event(id);
        }
    }

    /// Dispatch on the event's continuation.
    fn run_event(&mut self, id: EventId) {
        let Some(conn) = self.conns.get(id.cid) else {
            return;
        };
        let handler = if id.write {
            conn.write.handler
        } else {
            conn.read.handler
        };

        match handler {
            EventHandler::None => {}
            EventHandler::Accept => self.accept_event(id.cid),
            EventHandler::Channel => self.channel_event(),
            EventHandler::Continue => crate::http::phase::run_phases(self, id.cid),
            EventHandler::WaitRequest | EventHandler::ReadHeaders => {
                crate::http::request::read_headers(self, id.cid);
            }
            EventHandler::ReadBody => crate::http::body::read_body_event(self, id.cid),
            EventHandler::WriteResponse => crate::http::request::write_response(self, id.cid),
            EventHandler::Keepalive => crate::http::request::keepalive_event(self, id.cid),
            EventHandler::Lingering => crate::http::request::lingering_event(self, id.cid),
            EventHandler::UpstreamConnect => crate::upstream::connect_event(self, id.cid),
            EventHandler::UpstreamSend => crate::upstream::send_request_event(self, id.cid),
            EventHandler::UpstreamHeader => crate::upstream::header_event(self, id.cid),
            EventHandler::UpstreamRelay => crate::upstream::relay_event(self, id.cid),
            EventHandler::TunnelRead => crate::upstream::tunnel_client_event(self, id.cid),
        }
    }

    fn accept_event(&mut self, cid: ConnId) {
        let lidx = match self.conns.get_mut(cid) {
            Some(conn) => {
                conn.read.ready = false;
                match conn.ctx {
                    ConnCtx::Listener(i) => i,
                    _ => return,
                }
            }
            None => return,
        };

        let batch = if self.cycle.conf.events.multi_accept {
            usize::MAX
        } else {
            SINGLE_ACCEPT
        };

        let mut took_batch = true;
        let mut accepted_n = 0;
        while accepted_n < batch {
            let accepted = self.cycle.listening[lidx].socket.accept();
            match accepted {
                Ok((stream, peer)) => {
                    accepted_n += 1;
                    if let Err(e) = self.new_connection(stream, peer) {
                        error!("cannot set up accepted connection: {}", e);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    took_batch = false;
                    break;
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept() failed: {}", e);
                    took_batch = false;
                    break;
                }
            }
        }

        // readiness is edge-triggered: when the batch cap (not the socket)
        // ended the pass, queue another pass for the backlog
        if took_batch && accepted_n > 0 {
            if let Some(conn) = self.conns.get_mut(cid) {
                if !conn.read.posted {
                    conn.read.posted = true;
                    let gen = conn.gen;
                    self.posted_accept.push(EventId {
                        cid,
                        write: false,
                        gen,
                    });
                }
            }
        }
        self.accept_disabled = accept_disabled(self.conns.capacity(), self.conns.free());
    }

    fn new_connection(
        &mut self,
        stream: std::net::TcpStream,
        peer: std::net::SocketAddr,
    ) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        let mut stream = mio::net::TcpStream::from_std(stream);

        let cid = loop {
            match self.conns.claim() {
                Ok(cid) => break cid,
                Err(Some(reusable)) => {
                    debug!("harvesting idle keep-alive connection {}", reusable);
                    self.close_connection(reusable);
                }
                Err(None) => {
                    error!("worker_connections are not enough");
                    return Ok(()); // the socket drops, closing the connection
                }
            }
        };

        self.poll
            .registry()
            .register(&mut stream, Token(cid), Interest::READABLE)?;

        let local = stream.local_addr().ok();
        let conn = self.conns.get_mut(cid).expect("claimed slot");
        conn.stream = Some(stream);
        conn.peer = Some(peer);
        conn.local = local;
        conn.read.active = true;

        crate::http::request::init_connection(self, cid);
        Ok(())
    }

    fn channel_event(&mut self) {
        loop {
            let Some(channel) = &mut self.channel else {
                return;
            };
            match channel.recv() {
                Ok(Some(msg)) => match msg {
                    ChannelMsg::Quit => {
                        info!("worker {} gracefully shutting down", self.slot);
                        self.begin_exit();
                    }
                    ChannelMsg::Terminate => {
                        info!("worker {} terminating", self.slot);
                        self.quit = true;
                    }
                    ChannelMsg::Reopen => {
                        info!("worker {} reopening logs", self.slot);
                        self.cycle.log.reopen();
                        self.access_log.reopen();
                    }
                    ChannelMsg::OpenChannel { slot, pid } => {
                        debug!("worker {}: sibling {} is pid {}", self.slot, slot, pid);
                    }
                    ChannelMsg::CloseChannel { slot, pid } => {
                        debug!("sibling {} (pid {}) left", slot, pid);
                        channel.close_sibling(slot);
                    }
                },
                Ok(None) => break,
                Err(nix::Error::EAGAIN) => break,
                Err(e) => {
                    // master died or closed our end; shut down
                    error!("channel read failed: {}", e);
                    self.quit = true;
                    break;
                }
            }
        }
    }

    /// Enter graceful shutdown: stop accepting, drop idle connections, let
    /// in-flight requests run to completion.
    pub fn begin_exit(&mut self) {
        if self.exiting {
            return;
        }
        let _ = self.disable_listeners();
        self.exiting = true;

        for cid in self.conns.ids() {
            let idle = matches!(
                self.conns.get(cid).map(|c| c.read.handler),
                Some(EventHandler::Keepalive) | Some(EventHandler::WaitRequest)
            );
            if idle {
                self.close_connection(cid);
            }
        }
    }

    fn active_requests(&self) -> usize {
        self.conns
            .ids()
            .iter()
            .filter(|&&cid| {
                matches!(
                    self.conns.get(cid).map(|c| &c.ctx),
                    Some(ConnCtx::Http(_)) | Some(ConnCtx::Upstream(_))
                )
            })
            .count()
    }

    // ---- services used by the protocol handlers ----

    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Arm (or re-arm) the timer backing an in-flight operation.
    pub fn set_timer(&mut self, cid: ConnId, write: bool, after_ms: u64) {
        let now = self.clock.now();
        let Some(conn) = self.conns.get_mut(cid) else {
            return;
        };
        let gen = conn.gen;
        let ev = if write { &mut conn.write } else { &mut conn.read };
        if let Some(key) = ev.timer.take() {
            self.timers.remove(key);
        }
        let key = self
            .timers
            .insert(now + after_ms, EventId { cid, write, gen });
        if let Some(conn) = self.conns.get_mut(cid) {
            let ev = if write { &mut conn.write } else { &mut conn.read };
            ev.timer = Some(key);
            ev.timed_out = false;
        }
    }

    pub fn del_timer(&mut self, cid: ConnId, write: bool) {
        let Some(conn) = self.conns.get_mut(cid) else {
            return;
        };
        let ev = if write { &mut conn.write } else { &mut conn.read };
        if let Some(key) = ev.timer.take() {
            self.timers.remove(key);
        }
    }

    /// Defer an event to later in the current tick.
    pub fn post(&mut self, cid: ConnId, write: bool) {
        let Some(conn) = self.conns.get_mut(cid) else {
            return;
        };
        let gen = conn.gen;
        let ev = if write { &mut conn.write } else { &mut conn.read };
        if !ev.posted {
            ev.posted = true;
            self.posted.push(EventId { cid, write, gen });
        }
    }

    /// Set the continuation and desired readiness for one direction and
    /// push the combined interest set to the poller.
    pub fn arm(&mut self, cid: ConnId, write: bool, handler: EventHandler) {
        let Some(conn) = self.conns.get_mut(cid) else {
            return;
        };
        {
            let ev = if write { &mut conn.write } else { &mut conn.read };
            ev.handler = handler;
            ev.active = !matches!(handler, EventHandler::None);
        }
        let interest = match (conn.read.active, conn.write.active) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        if let (Some(stream), Some(interest)) = (&mut conn.stream, interest) {
            let _ = self
                .poll
                .registry()
                .reregister(stream, Token(cid), interest);
        }
    }

    /// Tear down a connection: cancel timers, let posted events go stale
    /// behind the generation bump, deregister and close the socket, run
    /// pool cleanups.
    pub fn close_connection(&mut self, cid: ConnId) {
        self.del_timer(cid, false);
        self.del_timer(cid, true);
        if let Some(conn) = self.conns.get_mut(cid) {
            if let Some(stream) = &mut conn.stream {
                let _ = self.poll.registry().deregister(stream);
            }
        }
        // dropping the returned stream closes the fd
        let _ = self.conns.release(cid);
    }

    /// The client slot behind an upstream connection.
    pub fn upstream_client(&self, cid: ConnId) -> Option<ConnId> {
        match self.conns.get(cid).map(|c| &c.ctx) {
            Some(&ConnCtx::Upstream(client)) => Some(client),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("slot", &self.slot)
            .field("active", &self.conns.active())
            .field("exiting", &self.exiting)
            .finish()
    }
}
