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

//! Peer selection
//!
//! The engine sees peers through the selector capability: get the next one,
//! free it with an outcome, be told about failures. The built-in selector
//! is smooth weighted round-robin with passive health: a peer over
//! `max_fails` within `fail_timeout` sits out until the window expires.

use std::net::{SocketAddr, ToSocketAddrs};

use log::{error, warn};

use crate::conf::schema::{ProxyConf, UpstreamConf};

/// Selector capability used by the upstream engine.
pub trait PeerSelector {
    /// Next peer to try, or `None` when every peer is down.
    fn get(&mut self, now: u64) -> Option<(usize, SocketAddr)>;
    /// Release a previously got peer with its outcome.
    fn free(&mut self, peer: usize, success: bool, now: u64);
    /// Record a failure without releasing (connect-level errors).
    fn notify_failure(&mut self, peer: usize, now: u64);
}

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    weight: i64,
    current_weight: i64,
    max_fails: u32,
    fail_timeout: u64,
    fails: u32,
    checked: u64,
}

/// Smooth weighted round-robin over a fixed peer list.
#[derive(Debug, Default)]
pub struct RoundRobin {
    peers: Vec<Peer>,
}

impl RoundRobin {
    /// Resolve a `proxy_pass` target: an `upstream {}` name or a direct
    /// `host[:port]`. Resolution happens once, at worker init.
    pub fn resolve(proxy: &ProxyConf, upstreams: &[UpstreamConf]) -> RoundRobin {
        let target = proxy
            .pass
            .strip_prefix("http://")
            .unwrap_or(&proxy.pass);

        let mut rr = RoundRobin { peers: Vec::new() };
        if let Some(upstream) = upstreams.iter().find(|u| u.name == target) {
            for server in &upstream.servers {
                match resolve_addr(&server.addr) {
                    Some(addr) => rr.peers.push(Peer {
                        addr,
                        weight: server.weight.max(1) as i64,
                        current_weight: 0,
                        max_fails: server.max_fails,
                        fail_timeout: server.fail_timeout,
                        fails: 0,
                        checked: 0,
                    }),
                    None => error!("cannot resolve upstream server \"{}\"", server.addr),
                }
            }
        } else {
            match resolve_addr(target) {
                Some(addr) => rr.peers.push(Peer {
                    addr,
                    weight: 1,
                    current_weight: 0,
                    max_fails: 1,
                    fail_timeout: 10_000,
                    fails: 0,
                    checked: 0,
                }),
                None => error!("cannot resolve proxy_pass target \"{}\"", target),
            }
        }
        rr
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn usable(&self, i: usize, now: u64) -> bool {
        let p = &self.peers[i];
        p.max_fails == 0 || p.fails < p.max_fails || now.saturating_sub(p.checked) > p.fail_timeout
    }
}

impl PeerSelector for RoundRobin {
    fn get(&mut self, now: u64) -> Option<(usize, SocketAddr)> {
        let mut best: Option<usize> = None;
        let mut total = 0;

        for i in 0..self.peers.len() {
            if !self.usable(i, now) {
                continue;
            }
            self.peers[i].current_weight += self.peers[i].weight;
            total += self.peers[i].weight;
            let better = match best {
                None => true,
                Some(b) => self.peers[i].current_weight > self.peers[b].current_weight,
            };
            if better {
                best = Some(i);
            }
        }

        let best = best?;
        self.peers[best].current_weight -= total;
        Some((best, self.peers[best].addr))
    }

    fn free(&mut self, peer: usize, success: bool, now: u64) {
        let Some(p) = self.peers.get_mut(peer) else {
            return;
        };
        if success {
            p.fails = 0;
        } else {
            p.fails += 1;
            p.checked = now;
            if p.max_fails != 0 && p.fails >= p.max_fails {
                warn!("upstream peer {} down for {}ms", p.addr, p.fail_timeout);
            }
        }
    }

    fn notify_failure(&mut self, peer: usize, now: u64) {
        self.free(peer, false, now);
    }
}

fn resolve_addr(target: &str) -> Option<SocketAddr> {
    let target = target.trim_end_matches('/');
    if let Ok(addr) = target.parse() {
        return Some(addr);
    }
    let with_port = if target.contains(':') {
        target.to_owned()
    } else {
        format!("{}:80", target)
    };
    with_port.to_socket_addrs().ok()?.next()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conf::schema::UpstreamServer;

    fn upstream(weights: &[u32]) -> RoundRobin {
        let conf = UpstreamConf {
            name: "backend".to_owned(),
            servers: weights
                .iter()
                .enumerate()
                .map(|(i, &w)| UpstreamServer {
                    addr: format!("127.0.0.1:{}", 9000 + i),
                    weight: w,
                    max_fails: 1,
                    fail_timeout: 10_000,
                })
                .collect(),
        };
        let proxy = ProxyConf {
            pass: "http://backend".to_owned(),
            ..Default::default()
        };
        RoundRobin::resolve(&proxy, &[conf])
    }

    #[test]
    fn equal_weights_rotate_fairly() {
        let mut rr = upstream(&[1, 1, 1]);
        let picks: Vec<usize> = (0..6).map(|_| rr.get(0).expect("peer").0).collect();
        assert_eq!(2, picks.iter().filter(|&&p| p == 0).count());
        assert_eq!(2, picks.iter().filter(|&&p| p == 1).count());
        assert_eq!(2, picks.iter().filter(|&&p| p == 2).count());
    }

    #[test]
    fn weights_bias_the_rotation_smoothly() {
        let mut rr = upstream(&[5, 1, 1]);
        let picks: Vec<usize> = (0..7).map(|_| rr.get(0).expect("peer").0).collect();
        assert_eq!(5, picks.iter().filter(|&&p| p == 0).count());
        // the heavy peer is not served five times in a row
        assert_ne!(&picks[..5], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn failed_peer_sits_out_until_the_window_passes() {
        let mut rr = upstream(&[1, 1]);
        rr.free(0, false, 1_000);

        for _ in 0..4 {
            let (peer, _) = rr.get(2_000).expect("peer");
            assert_eq!(1, peer, "failed peer must sit out inside the window");
        }
        // window expired: peer 0 participates again
        let picks: Vec<usize> = (0..2).map(|_| rr.get(20_000).expect("peer").0).collect();
        assert!(picks.contains(&0));
    }

    #[test]
    fn direct_address_resolves_to_one_peer() {
        let proxy = ProxyConf {
            pass: "http://127.0.0.1:8081".to_owned(),
            ..Default::default()
        };
        let rr = RoundRobin::resolve(&proxy, &[]);
        assert_eq!(1, rr.len());
    }
}
