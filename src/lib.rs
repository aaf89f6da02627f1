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

//! vakt — event-driven HTTP reverse proxy and web server
//!
//! A supervising master forks a fixed pool of single-threaded workers.
//! Each worker runs one mio readiness loop over a slab of connection
//! slots, carries requests through a phase-based HTTP/1.x engine, and
//! proxies to upstreams with buffered or unbuffered relay and an on-disk
//! response cache. Reload swaps in a new configuration cycle without
//! dropping connections; a binary upgrade execs a new master with the
//! listen sockets inherited through the environment.

pub mod buf;
pub mod cli;
pub mod conf;
pub mod conn;
pub mod cycle;
pub mod event;
pub mod http;
pub mod log;
pub mod output;
pub mod pool;
pub mod process;
pub mod shm;
pub mod upstream;
pub mod worker;
