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

//! Typed configuration
//!
//! The directive tree is walked once at startup (and on reload) into plain
//! structs, one per module concern: core process settings, the event loop,
//! and the http server tree. Unknown directives fail the parse; handlers
//! never see raw directives at request time.

use std::net::SocketAddr;
use std::path::PathBuf;

use log::LevelFilter;

use super::{ConfError, Directive};

/// Conditions under which a failed upstream request may be retried on the
/// next peer. Same layout as the classical failure-type mask.
pub mod next_upstream {
    pub const ERROR: u32 = 0x0002;
    pub const TIMEOUT: u32 = 0x0004;
    pub const INVALID_HEADER: u32 = 0x0008;
    pub const HTTP_500: u32 = 0x0010;
    pub const HTTP_502: u32 = 0x0020;
    pub const HTTP_503: u32 = 0x0040;
    pub const HTTP_504: u32 = 0x0080;
    pub const HTTP_403: u32 = 0x0100;
    pub const HTTP_404: u32 = 0x0200;
    pub const NON_IDEMPOTENT: u32 = 0x0400;
    pub const OFF: u32 = 0x8000_0000;
}

#[derive(Debug, Clone)]
pub struct Conf {
    pub core: CoreConf,
    pub events: EventsConf,
    pub http: HttpConf,
}

#[derive(Debug, Clone)]
pub struct CoreConf {
    pub worker_processes: usize,
    pub rlimit_nofile: Option<u64>,
    pub rlimit_core: Option<u64>,
    pub working_directory: Option<PathBuf>,
    /// One CPU mask per worker slot; the list wraps when shorter than the
    /// worker count.
    pub cpu_affinity: Vec<u64>,
    pub pid_path: PathBuf,
    pub lock_file: PathBuf,
    pub error_log: PathBuf,
    pub log_level: LevelFilter,
    pub daemon: bool,
    /// Environment variables preserved for workers and the upgraded binary.
    pub env: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EventsConf {
    pub worker_connections: usize,
    pub accept_mutex: bool,
    pub accept_mutex_delay: u64,
    pub multi_accept: bool,
}

#[derive(Debug, Clone)]
pub struct HttpConf {
    pub access_log: Option<PathBuf>,
    pub keepalive_timeout: u64,
    pub client_header_timeout: u64,
    pub client_body_timeout: u64,
    pub send_timeout: u64,
    pub client_max_body_size: u64,
    pub client_body_buffer_size: u64,
    pub lingering_time: u64,
    pub server_tokens: bool,
    pub servers: Vec<ServerConf>,
    pub upstreams: Vec<UpstreamConf>,
    pub cache_paths: Vec<CachePathConf>,
}

#[derive(Debug, Clone)]
pub struct ServerConf {
    pub listen: Vec<SocketAddr>,
    pub server_names: Vec<String>,
    pub root: Option<PathBuf>,
    pub index: Vec<String>,
    pub locations: Vec<LocationConf>,
}

/// One `location PREFIX { ... }`. Matching is longest-prefix.
#[derive(Debug, Clone)]
pub struct LocationConf {
    pub prefix: String,
    pub root: Option<PathBuf>,
    pub index: Vec<String>,
    pub try_files: Vec<String>,
    pub ret: Option<(u16, Option<String>)>,
    pub proxy: Option<ProxyConf>,
}

#[derive(Debug, Clone)]
pub struct ProxyConf {
    /// `http://host:port` or `http://upstream_name`.
    pub pass: String,
    pub buffering: bool,
    pub buffer_size: u64,
    pub buffers: (usize, u64),
    pub busy_buffers_size: u64,
    pub max_temp_file_size: u64,
    pub temp_file_write_size: u64,
    pub connect_timeout: u64,
    pub send_timeout: u64,
    pub read_timeout: u64,
    pub next_upstream: u32,
    pub next_upstream_tries: u32,
    pub next_upstream_timeout: u64,
    pub cache_zone: Option<String>,
    /// (status, validity ms); status 0 matches any cacheable status.
    pub cache_valid: Vec<(u16, u64)>,
    pub cache_lock: bool,
    pub cache_lock_timeout: u64,
    pub ignore_client_abort: bool,
}

impl Default for ProxyConf {
    fn default() -> Self {
        ProxyConf {
            pass: String::new(),
            buffering: true,
            buffer_size: 4096,
            buffers: (8, 4096),
            busy_buffers_size: 8192,
            max_temp_file_size: 1024 * 1024 * 1024,
            temp_file_write_size: 8192,
            connect_timeout: 60_000,
            send_timeout: 60_000,
            read_timeout: 60_000,
            next_upstream: next_upstream::ERROR | next_upstream::TIMEOUT,
            next_upstream_tries: 0,
            next_upstream_timeout: 0,
            cache_zone: None,
            cache_valid: Vec::new(),
            cache_lock: false,
            cache_lock_timeout: 5_000,
            ignore_client_abort: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConf {
    pub name: String,
    pub servers: Vec<UpstreamServer>,
}

#[derive(Debug, Clone)]
pub struct UpstreamServer {
    pub addr: String,
    pub weight: u32,
    pub max_fails: u32,
    pub fail_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct CachePathConf {
    pub path: PathBuf,
    pub zone: String,
    pub zone_size: u64,
}

impl Conf {
    /// Build the typed configuration from a parsed tree.
    pub fn build(tree: &[Directive]) -> Result<Conf, ConfError> {
        let mut core = CoreConf {
            worker_processes: 1,
            rlimit_nofile: None,
            rlimit_core: None,
            working_directory: None,
            cpu_affinity: Vec::new(),
            pid_path: PathBuf::from("logs/vakt.pid"),
            lock_file: PathBuf::from("logs/vakt.lock"),
            error_log: PathBuf::from("logs/error.log"),
            log_level: LevelFilter::Error,
            daemon: true,
            env: vec!["TZ".to_owned()],
        };
        let mut events = EventsConf {
            worker_connections: 512,
            accept_mutex: true,
            accept_mutex_delay: 500,
            multi_accept: false,
        };
        let mut http = HttpConf {
            access_log: None,
            keepalive_timeout: 75_000,
            client_header_timeout: 60_000,
            client_body_timeout: 60_000,
            send_timeout: 60_000,
            client_max_body_size: 1024 * 1024,
            client_body_buffer_size: 16 * 1024,
            lingering_time: 30_000,
            server_tokens: true,
            servers: Vec::new(),
            upstreams: Vec::new(),
            cache_paths: Vec::new(),
        };

        for d in tree {
            match d.name.as_str() {
                "worker_processes" => {
                    d.expect_args(1)?;
                    core.worker_processes = if d.args[0] == "auto" {
                        std::thread::available_parallelism()
                            .map(usize::from)
                            .unwrap_or(1)
                    } else {
                        d.uint()? as usize
                    };
                }
                "worker_rlimit_nofile" => core.rlimit_nofile = Some(d.uint()?),
                "worker_rlimit_core" => core.rlimit_core = Some(d.size()?),
                "working_directory" => {
                    d.expect_args(1)?;
                    core.working_directory = Some(PathBuf::from(&d.args[0]));
                }
                "worker_cpu_affinity" => {
                    core.cpu_affinity = d
                        .args
                        .iter()
                        .map(|mask| parse_cpu_mask(d, mask))
                        .collect::<Result<_, _>>()?;
                }
                "pid" => {
                    d.expect_args(1)?;
                    core.pid_path = PathBuf::from(&d.args[0]);
                }
                "lock_file" => {
                    d.expect_args(1)?;
                    core.lock_file = PathBuf::from(&d.args[0]);
                }
                "error_log" => {
                    if d.args.is_empty() || d.args.len() > 2 {
                        return Err(syntax(d, "error_log takes a path and an optional level"));
                    }
                    core.error_log = PathBuf::from(&d.args[0]);
                    if let Some(level) = d.args.get(1) {
                        core.log_level = parse_level(d, level)?;
                    }
                }
                "daemon" => core.daemon = d.flag()?,
                "env" => {
                    d.expect_args(1)?;
                    core.env.push(d.args[0].clone());
                }
                "events" => {
                    let block = block_of(d)?;
                    for e in block {
                        match e.name.as_str() {
                            "worker_connections" => {
                                events.worker_connections = e.uint()? as usize;
                            }
                            "accept_mutex" => events.accept_mutex = e.flag()?,
                            "accept_mutex_delay" => events.accept_mutex_delay = e.msec()?,
                            "multi_accept" => events.multi_accept = e.flag()?,
                            _ => return Err(unknown(e)),
                        }
                    }
                }
                "http" => build_http(block_of(d)?, &mut http)?,
                _ => return Err(unknown(d)),
            }
        }

        if http.servers.is_empty() {
            if let Some(http_directive) = tree.iter().find(|d| d.name == "http") {
                return Err(syntax(http_directive, "no \"server\" block defined"));
            }
        }

        Ok(Conf { core, events, http })
    }
}

fn build_http(block: &[Directive], http: &mut HttpConf) -> Result<(), ConfError> {
    for d in block {
        match d.name.as_str() {
            "access_log" => {
                d.expect_args(1)?;
                http.access_log = match d.args[0].as_str() {
                    "off" => None,
                    path => Some(PathBuf::from(path)),
                };
            }
            "keepalive_timeout" => http.keepalive_timeout = d.msec()?,
            "client_header_timeout" => http.client_header_timeout = d.msec()?,
            "client_body_timeout" => http.client_body_timeout = d.msec()?,
            "send_timeout" => http.send_timeout = d.msec()?,
            "client_max_body_size" => http.client_max_body_size = d.size()?,
            "client_body_buffer_size" => http.client_body_buffer_size = d.size()?,
            "lingering_time" => http.lingering_time = d.msec()?,
            "server_tokens" => http.server_tokens = d.flag()?,
            "proxy_cache_path" => http.cache_paths.push(build_cache_path(d)?),
            "upstream" => http.upstreams.push(build_upstream(d)?),
            "server" => http.servers.push(build_server(d)?),
            _ => return Err(unknown(d)),
        }
    }
    Ok(())
}

fn build_server(d: &Directive) -> Result<ServerConf, ConfError> {
    let mut server = ServerConf {
        listen: Vec::new(),
        server_names: Vec::new(),
        root: None,
        index: vec!["index.html".to_owned()],
        locations: Vec::new(),
    };

    if !d.args.is_empty() {
        return Err(syntax(d, "\"server\" takes no arguments"));
    }

    for s in block_of(d)? {
        match s.name.as_str() {
            "listen" => {
                s.expect_args(1)?;
                server.listen.push(parse_listen(s, &s.args[0])?);
            }
            "server_name" => server.server_names.extend(s.args.iter().cloned()),
            "root" => {
                s.expect_args(1)?;
                server.root = Some(PathBuf::from(&s.args[0]));
            }
            "index" => server.index = s.args.clone(),
            "location" => server.locations.push(build_location(s)?),
            _ => return Err(unknown(s)),
        }
    }

    if server.listen.is_empty() {
        return Err(syntax(d, "server has no \"listen\" directive"));
    }
    // longest prefix first, so the matcher can take the first hit
    server
        .locations
        .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
    Ok(server)
}

fn build_location(d: &Directive) -> Result<LocationConf, ConfError> {
    d.expect_args(1)?;
    let mut location = LocationConf {
        prefix: d.args[0].clone(),
        root: None,
        index: Vec::new(),
        try_files: Vec::new(),
        ret: None,
        proxy: None,
    };
    let mut proxy = ProxyConf::default();
    let mut has_proxy = false;

    for l in block_of(d)? {
        match l.name.as_str() {
            "root" => {
                l.expect_args(1)?;
                location.root = Some(PathBuf::from(&l.args[0]));
            }
            "index" => location.index = l.args.clone(),
            "try_files" => {
                if l.args.len() < 2 {
                    return Err(syntax(l, "\"try_files\" takes at least two arguments"));
                }
                location.try_files = l.args.clone();
            }
            "return" => {
                if l.args.is_empty() || l.args.len() > 2 {
                    return Err(syntax(l, "\"return\" takes a code and an optional body"));
                }
                let code: u16 = l.args[0]
                    .parse()
                    .map_err(|_| syntax(l, format!("invalid status \"{}\"", l.args[0])))?;
                location.ret = Some((code, l.args.get(1).cloned()));
            }
            "proxy_pass" => {
                l.expect_args(1)?;
                proxy.pass = l.args[0].clone();
                has_proxy = true;
            }
            "proxy_buffering" => proxy.buffering = l.flag()?,
            "proxy_buffer_size" => proxy.buffer_size = l.size()?,
            "proxy_buffers" => {
                l.expect_args(2)?;
                let count: usize = l.args[0]
                    .parse()
                    .map_err(|_| syntax(l, format!("invalid number \"{}\"", l.args[0])))?;
                let size = super::parse_size(&l.args[1])
                    .ok_or_else(|| syntax(l, format!("invalid size \"{}\"", l.args[1])))?;
                proxy.buffers = (count, size);
            }
            "proxy_busy_buffers_size" => proxy.busy_buffers_size = l.size()?,
            "proxy_max_temp_file_size" => proxy.max_temp_file_size = l.size()?,
            "proxy_temp_file_write_size" => proxy.temp_file_write_size = l.size()?,
            "proxy_connect_timeout" => proxy.connect_timeout = l.msec()?,
            "proxy_send_timeout" => proxy.send_timeout = l.msec()?,
            "proxy_read_timeout" => proxy.read_timeout = l.msec()?,
            "proxy_next_upstream" => proxy.next_upstream = parse_next_upstream(l)?,
            "proxy_next_upstream_tries" => proxy.next_upstream_tries = l.uint()? as u32,
            "proxy_next_upstream_timeout" => proxy.next_upstream_timeout = l.msec()?,
            "proxy_cache" => {
                l.expect_args(1)?;
                proxy.cache_zone = match l.args[0].as_str() {
                    "off" => None,
                    zone => Some(zone.to_owned()),
                };
            }
            "proxy_cache_valid" => {
                if l.args.len() < 2 {
                    return Err(syntax(l, "\"proxy_cache_valid\" takes statuses and a time"));
                }
                let time = super::parse_msec(l.args.last().expect("len checked"))
                    .ok_or_else(|| syntax(l, "invalid time"))?;
                for status in &l.args[..l.args.len() - 1] {
                    let code = match status.as_str() {
                        "any" => 0,
                        s => s
                            .parse()
                            .map_err(|_| syntax(l, format!("invalid status \"{}\"", s)))?,
                    };
                    proxy.cache_valid.push((code, time));
                }
            }
            "proxy_cache_lock" => proxy.cache_lock = l.flag()?,
            "proxy_cache_lock_timeout" => proxy.cache_lock_timeout = l.msec()?,
            "proxy_ignore_client_abort" => proxy.ignore_client_abort = l.flag()?,
            _ => return Err(unknown(l)),
        }
    }

    if has_proxy {
        location.proxy = Some(proxy);
    }
    Ok(location)
}

fn build_upstream(d: &Directive) -> Result<UpstreamConf, ConfError> {
    d.expect_args(1)?;
    let mut upstream = UpstreamConf {
        name: d.args[0].clone(),
        servers: Vec::new(),
    };

    for s in block_of(d)? {
        if s.name != "server" {
            return Err(unknown(s));
        }
        if s.args.is_empty() {
            return Err(syntax(s, "\"server\" takes an address"));
        }
        let mut server = UpstreamServer {
            addr: s.args[0].clone(),
            weight: 1,
            max_fails: 1,
            fail_timeout: 10_000,
        };
        for param in &s.args[1..] {
            let invalid = || syntax(s, format!("invalid parameter \"{}\"", param));
            let (key, value) = param.split_once('=').ok_or_else(invalid)?;
            match key {
                "weight" => server.weight = value.parse().map_err(|_| invalid())?,
                "max_fails" => server.max_fails = value.parse().map_err(|_| invalid())?,
                "fail_timeout" => {
                    server.fail_timeout = super::parse_msec(value).ok_or_else(invalid)?;
                }
                _ => return Err(invalid()),
            }
        }
        upstream.servers.push(server);
    }

    if upstream.servers.is_empty() {
        return Err(syntax(d, "upstream has no servers"));
    }
    Ok(upstream)
}

fn build_cache_path(d: &Directive) -> Result<CachePathConf, ConfError> {
    if d.args.len() != 2 {
        return Err(syntax(d, "\"proxy_cache_path\" takes a path and keys_zone=NAME:SIZE"));
    }
    let spec = d.args[1]
        .strip_prefix("keys_zone=")
        .ok_or_else(|| syntax(d, "expected keys_zone=NAME:SIZE"))?;
    let (zone, size) = spec
        .split_once(':')
        .ok_or_else(|| syntax(d, "expected keys_zone=NAME:SIZE"))?;
    let zone_size = super::parse_size(size).ok_or_else(|| syntax(d, "invalid zone size"))?;
    Ok(CachePathConf {
        path: PathBuf::from(&d.args[0]),
        zone: zone.to_owned(),
        zone_size,
    })
}

fn parse_next_upstream(d: &Directive) -> Result<u32, ConfError> {
    let mut mask = 0;
    for arg in &d.args {
        mask |= match arg.as_str() {
            "error" => next_upstream::ERROR,
            "timeout" => next_upstream::TIMEOUT,
            "invalid_header" => next_upstream::INVALID_HEADER,
            "http_500" => next_upstream::HTTP_500,
            "http_502" => next_upstream::HTTP_502,
            "http_503" => next_upstream::HTTP_503,
            "http_504" => next_upstream::HTTP_504,
            "http_403" => next_upstream::HTTP_403,
            "http_404" => next_upstream::HTTP_404,
            "non_idempotent" => next_upstream::NON_IDEMPOTENT,
            "off" => next_upstream::OFF,
            other => {
                return Err(syntax(d, format!("invalid parameter \"{}\"", other)));
            }
        };
    }
    Ok(mask)
}

fn parse_listen(d: &Directive, arg: &str) -> Result<SocketAddr, ConfError> {
    let addr = if let Ok(port) = arg.parse::<u16>() {
        format!("0.0.0.0:{}", port)
    } else if let Some(port) = arg.strip_prefix("*:") {
        format!("0.0.0.0:{}", port)
    } else {
        arg.to_owned()
    };
    addr.parse()
        .map_err(|_| syntax(d, format!("invalid listen address \"{}\"", arg)))
}

fn parse_cpu_mask(d: &Directive, mask: &str) -> Result<u64, ConfError> {
    if mask.is_empty() || mask.len() > 64 || mask.bytes().any(|b| b != b'0' && b != b'1') {
        return Err(syntax(d, format!("invalid cpu mask \"{}\"", mask)));
    }
    Ok(u64::from_str_radix(mask, 2).expect("validated binary digits"))
}

fn parse_level(d: &Directive, level: &str) -> Result<LevelFilter, ConfError> {
    match level {
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "notice" | "warn" => Ok(LevelFilter::Warn),
        "error" | "crit" | "alert" | "emerg" => Ok(LevelFilter::Error),
        other => Err(syntax(d, format!("invalid log level \"{}\"", other))),
    }
}

fn block_of(d: &Directive) -> Result<&[Directive], ConfError> {
    d.block
        .as_deref()
        .ok_or_else(|| syntax(d, format!("directive \"{}\" has no opening \"{{\"", d.name)))
}

fn unknown(d: &Directive) -> ConfError {
    syntax(d, format!("unknown directive \"{}\"", d.name))
}

fn syntax(d: &Directive, msg: impl Into<String>) -> ConfError {
    ConfError::Syntax {
        file: d.file.clone(),
        line: d.line,
        msg: msg.into(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conf::parser::parse_file;
    use std::io::Write;

    fn build(body: &str) -> Result<Conf, ConfError> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vakt.conf");
        let mut f = std::fs::File::create(&path).expect("create");
        f.write_all(body.as_bytes()).expect("write");
        let tree = parse_file(&path)?;
        Conf::build(&tree)
    }

    #[test]
    fn minimal_server_builds_with_defaults() {
        let conf = build(
            "events { }\nhttp { server { listen 8080; location / { return 204; } } }\n",
        )
        .expect("valid conf");
        assert_eq!(1, conf.core.worker_processes);
        assert_eq!(512, conf.events.worker_connections);
        let server = &conf.http.servers[0];
        assert_eq!("0.0.0.0:8080", server.listen[0].to_string());
        assert_eq!(Some((204, None)), server.locations[0].ret.clone());
    }

    #[test]
    fn locations_sort_longest_prefix_first() {
        let conf = build(
            "http { server { listen 80; location / { return 204; } location /api/v1 { return 200; } location /api { return 201; } } }\n",
        )
        .expect("valid conf");
        let prefixes: Vec<&str> = conf.http.servers[0]
            .locations
            .iter()
            .map(|l| l.prefix.as_str())
            .collect();
        assert_eq!(vec!["/api/v1", "/api", "/"], prefixes);
    }

    #[test]
    fn unknown_directive_is_rejected_with_location() {
        let err = build("events { }\nhttp { server { listen 80; }\nbogus on; }\n")
            .expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.contains("bogus"), "got: {}", msg);
        assert!(msg.contains(":3"), "got: {}", msg);
    }

    #[test]
    fn proxy_settings_build_a_proxy_conf() {
        let conf = build(
            "http { upstream backend { server 127.0.0.1:9000 weight=2 max_fails=3; server 127.0.0.1:9001; }\n\
             server { listen 80; location / { proxy_pass http://backend; proxy_buffering off; \
             proxy_next_upstream error timeout http_502; } } }\n",
        )
        .expect("valid conf");
        let proxy = conf.http.servers[0].locations[0]
            .proxy
            .as_ref()
            .expect("proxy conf");
        assert!(!proxy.buffering);
        assert_eq!(
            next_upstream::ERROR | next_upstream::TIMEOUT | next_upstream::HTTP_502,
            proxy.next_upstream
        );
        assert_eq!(2, conf.http.upstreams[0].servers.len());
        assert_eq!(2, conf.http.upstreams[0].servers[0].weight);
    }

    #[test]
    fn worker_cpu_affinity_parses_binary_masks() {
        let conf = build(
            "worker_cpu_affinity 0001 0010;\nhttp { server { listen 80; } }\n",
        )
        .expect("valid conf");
        assert_eq!(vec![1, 2], conf.core.cpu_affinity);
    }
}
