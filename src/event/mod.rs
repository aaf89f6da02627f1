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

//! Event primitives
//!
//! Each connection slot carries one read and one write [`EventState`]. A
//! handler is not a function pointer but an [`EventHandler`] variant: the
//! explicit continuation the worker dispatches on when the event fires.
//! State that used to live in a closure lives in the Request or the
//! UpstreamCtx instead.

use std::time::Instant;

pub mod accept;
pub mod timer;

use timer::TimerKey;

/// Identifies one event: a slot, a direction, and the slot generation the
/// event was queued under. A mismatch against the slot's current generation
/// marks the event stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId {
    pub cid: usize,
    pub write: bool,
    pub gen: u64,
}

/// The continuation to run when an event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventHandler {
    #[default]
    None,
    /// Listener readable: accept a batch of connections.
    Accept,
    /// Channel endpoint readable: a master command arrived.
    Channel,
    /// Re-enter the phase engine (posted, never armed on a socket).
    Continue,
    /// Client readable while waiting for the first request bytes.
    WaitRequest,
    /// Client readable mid request-line/headers.
    ReadHeaders,
    /// Client readable while the body reader runs.
    ReadBody,
    /// Client writable with response output pending.
    WriteResponse,
    /// Client readable between keep-alive requests.
    Keepalive,
    /// Client readable during lingering close.
    Lingering,
    /// Upstream writable while the connect is in flight.
    UpstreamConnect,
    /// Upstream writable with request bytes left to send.
    UpstreamSend,
    /// Upstream readable before the response header completes.
    UpstreamHeader,
    /// Upstream readable during response relay.
    UpstreamRelay,
    /// Client readable while an Upgrade tunnel is established.
    TunnelRead,
}

/// Per-direction event state on a connection slot.
#[derive(Debug)]
pub struct EventState {
    /// Readiness was reported and not yet consumed.
    pub ready: bool,
    /// Registered with the poller.
    pub active: bool,
    /// Set by timer expiry before the handler runs.
    pub timed_out: bool,
    /// Sitting in a posted queue.
    pub posted: bool,
    /// Peer closed its half.
    pub eof: bool,
    /// Hard error observed on the socket.
    pub error: bool,
    pub handler: EventHandler,
    /// Present iff the event is armed in the timer tree.
    pub timer: Option<TimerKey>,
}

impl EventState {
    pub fn new(handler: EventHandler) -> Self {
        EventState {
            ready: false,
            active: false,
            timed_out: false,
            posted: false,
            eof: false,
            error: false,
            handler,
            timer: None,
        }
    }
}

/// Monotonic clock with a per-tick cache. Handlers read the cached value;
/// only the loop advances it, once per wakeup.
#[derive(Debug)]
pub struct Clock {
    start: Instant,
    cached: u64,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            start: Instant::now(),
            cached: 0,
        }
    }

    /// Refresh the cache from the OS clock.
    pub fn update(&mut self) -> u64 {
        self.cached = self.start.elapsed().as_millis() as u64;
        self.cached
    }

    /// Milliseconds since loop start, as of the last update.
    #[inline]
    pub fn now(&self) -> u64 {
        self.cached
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::{Clock, EventHandler, EventState};

    #[test]
    fn clock_caches_between_updates() {
        let mut clock = Clock::new();
        let first = clock.update();
        assert_eq!(first, clock.now());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(first, clock.now());
        assert!(clock.update() >= first + 5);
    }

    #[test]
    fn fresh_event_state_is_inert() {
        let ev = EventState::new(EventHandler::WaitRequest);
        assert!(!ev.ready && !ev.active && !ev.posted);
        assert!(ev.timer.is_none());
        assert_eq!(EventHandler::WaitRequest, ev.handler);
    }
}
