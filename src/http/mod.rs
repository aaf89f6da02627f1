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

//! HTTP engine
//!
//! Per-worker runtime built once from the cycle: the ordered phase handler
//! table, the filter chains (populated in registration order, last
//! registered runs first), the virtual-server tree, and one load-balancing
//! selector per proxying location, persistent across requests so rotation
//! is fair.

use std::collections::HashMap;
use std::sync::Arc;

use crate::conf::schema::HttpConf;
use crate::cycle::Cycle;
use crate::upstream::peer::RoundRobin;

pub mod body;
pub mod filter;
pub mod parse;
pub mod phase;
pub mod request;
pub mod static_files;

pub struct HttpRuntime {
    pub conf: HttpConf,
    pub phases: Vec<phase::PhaseEntry>,
    pub header_filters: Vec<filter::HeaderFilter>,
    pub body_filters: Vec<filter::BodyFilter>,
    /// Peer selector per `(server, location)` with a `proxy_pass`.
    pub selectors: HashMap<(usize, usize), RoundRobin>,
}

impl HttpRuntime {
    pub fn new(cycle: &Arc<Cycle>) -> HttpRuntime {
        let conf = cycle.conf.http.clone();
        let mut selectors = HashMap::new();

        for (si, server) in conf.servers.iter().enumerate() {
            for (li, location) in server.locations.iter().enumerate() {
                if let Some(proxy) = &location.proxy {
                    selectors.insert((si, li), RoundRobin::resolve(proxy, &conf.upstreams));
                }
            }
        }

        HttpRuntime {
            conf,
            phases: phase::default_phases(),
            header_filters: filter::default_header_filters(),
            body_filters: filter::default_body_filters(),
            selectors,
        }
    }

    /// Pick the virtual server for a Host header: exact `server_name` match
    /// first, else the first server listening on the connection's address.
    pub fn find_server(&self, local: Option<std::net::SocketAddr>, host: Option<&str>) -> usize {
        if let Some(host) = host {
            let host = host.split(':').next().unwrap_or(host);
            for (i, server) in self.conf.servers.iter().enumerate() {
                if server.server_names.iter().any(|n| n.eq_ignore_ascii_case(host)) {
                    return i;
                }
            }
        }
        if let Some(local) = local {
            for (i, server) in self.conf.servers.iter().enumerate() {
                if server
                    .listen
                    .iter()
                    .any(|a| a.port() == local.port())
                {
                    return i;
                }
            }
        }
        0
    }
}

impl std::fmt::Debug for HttpRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRuntime")
            .field("servers", &self.conf.servers.len())
            .field("phases", &self.phases.len())
            .finish()
    }
}

/// Canonical reason phrase.
/// [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)
pub fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Request Entity Too Large",
        414 => "URI Too Long",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        499 => "Client Closed Request",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

#[cfg(test)]
mod test {
    use super::status_text;

    #[test]
    fn common_codes_have_reason_phrases() {
        assert_eq!("No Content", status_text(204));
        assert_eq!("Request Entity Too Large", status_text(413));
        assert_eq!("Client Closed Request", status_text(499));
        assert_eq!("", status_text(299));
    }
}
