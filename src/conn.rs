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

//! Connection slots
//!
//! A slab of connection slots sized to `worker_connections`; the mio token
//! of every registered source is its slot key. Idle keep-alive connections
//! queue up for reuse and the oldest is harvested when the slab fills. Each
//! slot carries a generation counter: events queued against a previous
//! occupant of the slot are recognised as stale and dropped.

use std::net::SocketAddr;

use mio::net::TcpStream;
use slab::Slab;

use crate::event::{EventHandler, EventState};
use crate::http::request::Request;
use crate::pool::Pool;

/// Slot index; doubles as the mio token value.
pub type ConnId = usize;

/// What the connection currently is.
#[derive(Debug, Default)]
pub enum ConnCtx {
    #[default]
    None,
    /// Accepting socket; the payload indexes `cycle.listening`.
    Listener(usize),
    /// Master→worker channel endpoint.
    Channel,
    /// Client connection driving an HTTP request.
    Http(Box<Request>),
    /// Proxied backend connection; the payload is the client's slot.
    Upstream(ConnId),
}

#[derive(Debug)]
pub struct Connection {
    pub stream: Option<TcpStream>,
    pub peer: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
    pub read: EventState,
    pub write: EventState,
    pub ctx: ConnCtx,
    pub sent: u64,
    pub pool: Pool,
    /// Present in the reusable (idle keep-alive) queue.
    pub reusable: bool,
    /// Bumped every time the slot is released; stale events check it.
    pub gen: u64,
}

impl Connection {
    fn fresh(gen: u64) -> Self {
        Connection {
            stream: None,
            peer: None,
            local: None,
            read: EventState::new(EventHandler::None),
            write: EventState::new(EventHandler::None),
            ctx: ConnCtx::None,
            sent: 0,
            pool: Pool::new(),
            reusable: false,
            gen,
        }
    }

    /// Mutable request access for HTTP connections.
    pub fn request_mut(&mut self) -> Option<&mut Request> {
        match &mut self.ctx {
            ConnCtx::Http(r) => Some(r),
            _ => None,
        }
    }

    /// Move the request out for processing; restore with [`put_request`].
    pub fn take_request(&mut self) -> Option<Box<Request>> {
        match std::mem::take(&mut self.ctx) {
            ConnCtx::Http(r) => Some(r),
            other => {
                self.ctx = other;
                None
            }
        }
    }

    pub fn put_request(&mut self, r: Box<Request>) {
        self.ctx = ConnCtx::Http(r);
    }
}

/// The preallocated table plus the reusable-connection queue.
#[derive(Debug)]
pub struct Connections {
    slab: Slab<Connection>,
    capacity: usize,
    /// Slot gens survive slot release; indexed by slot, front is oldest.
    reusable: Vec<ConnId>,
    next_gen: u64,
}

impl Connections {
    pub fn new(capacity: usize) -> Self {
        Connections {
            slab: Slab::with_capacity(capacity),
            capacity,
            reusable: Vec::new(),
            next_gen: 1,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn active(&self) -> usize {
        self.slab.len()
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.capacity - self.slab.len()
    }

    /// Claim a slot. When the table is full, the oldest idle keep-alive
    /// connection is reported for harvesting; the caller closes it and
    /// retries. `None` with no harvest candidate means genuine exhaustion.
    pub fn claim(&mut self) -> Result<ConnId, Option<ConnId>> {
        if self.slab.len() >= self.capacity {
            return Err(self.reusable.first().copied());
        }
        let gen = self.next_gen;
        self.next_gen += 1;
        Ok(self.slab.insert(Connection::fresh(gen)))
    }

    pub fn get(&self, cid: ConnId) -> Option<&Connection> {
        self.slab.get(cid)
    }

    pub fn get_mut(&mut self, cid: ConnId) -> Option<&mut Connection> {
        self.slab.get_mut(cid)
    }

    /// Release a slot. The connection's pool runs its cleanups; the stream
    /// (if any) is returned so the caller controls close ordering.
    pub fn release(&mut self, cid: ConnId) -> Option<TcpStream> {
        self.mark_busy(cid);
        let mut conn = self.slab.try_remove(cid)?;
        conn.pool.destroy();
        conn.stream.take()
    }

    /// Enter the idle keep-alive queue (newest at the back).
    pub fn mark_reusable(&mut self, cid: ConnId) {
        if let Some(conn) = self.slab.get_mut(cid) {
            if !conn.reusable {
                conn.reusable = true;
                self.reusable.push(cid);
            }
        }
    }

    /// Leave the idle queue, e.g. when a new request arrives on it.
    pub fn mark_busy(&mut self, cid: ConnId) {
        if let Some(conn) = self.slab.get_mut(cid) {
            if conn.reusable {
                conn.reusable = false;
                self.reusable.retain(|&c| c != cid);
            }
        }
    }

    /// Slots with live connections, for shutdown sweeps.
    pub fn ids(&self) -> Vec<ConnId> {
        self.slab.iter().map(|(k, _)| k).collect()
    }
}

#[cfg(test)]
mod test {
    use super::Connections;

    #[test]
    fn claim_is_bounded_by_capacity() {
        let mut conns = Connections::new(2);
        let a = conns.claim().expect("slot");
        let _b = conns.claim().expect("slot");
        assert_eq!(Err(None), conns.claim());

        conns.release(a);
        assert!(conns.claim().is_ok());
    }

    #[test]
    fn full_table_offers_oldest_reusable_for_harvest() {
        let mut conns = Connections::new(2);
        let a = conns.claim().expect("slot");
        let b = conns.claim().expect("slot");
        conns.mark_reusable(b);
        conns.mark_reusable(a);

        // b went idle first, so b is harvested first
        assert_eq!(Err(Some(b)), conns.claim());
        conns.release(b);
        assert!(conns.claim().is_ok());
    }

    #[test]
    fn generations_distinguish_slot_occupants() {
        let mut conns = Connections::new(1);
        let a = conns.claim().expect("slot");
        let gen_a = conns.get(a).expect("conn").gen;
        conns.release(a);
        let b = conns.claim().expect("slot");
        assert_eq!(a, b, "slab reuses the key");
        assert_ne!(gen_a, conns.get(b).expect("conn").gen);
    }

    #[test]
    fn release_runs_pool_cleanups() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let fired = Rc::new(RefCell::new(false));
        let mut conns = Connections::new(1);
        let cid = conns.claim().expect("slot");
        let flag = fired.clone();
        conns
            .get_mut(cid)
            .expect("conn")
            .pool
            .add_cleanup(move || *flag.borrow_mut() = true);

        conns.release(cid);
        assert!(*fired.borrow());
    }
}
