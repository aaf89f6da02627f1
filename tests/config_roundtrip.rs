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

//! Configuration round-trip properties: a parsed tree dumps to text that
//! re-parses into an equivalent tree, include expansion preserves order,
//! and two parses of an unchanged file build the same typed config.

use std::io::Write;
use std::path::{Path, PathBuf};

use vakt::conf::{dump, parse_file, Conf, Directive};

fn write_file(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    let mut f = std::fs::File::create(&path).expect("create");
    f.write_all(body.as_bytes()).expect("write");
    path
}

fn strip_origin(mut tree: Vec<Directive>) -> Vec<Directive> {
    for d in &mut tree {
        d.file = String::new();
        d.line = 0;
        if let Some(block) = d.block.take() {
            d.block = Some(strip_origin(block));
        }
    }
    tree
}

const FULL_CONF: &str = r#"
worker_processes 2;
pid logs/vakt.pid;
error_log logs/error.log info;
daemon off;

events {
    worker_connections 256;
    accept_mutex on;
    accept_mutex_delay 300ms;
}

http {
    access_log logs/access.log;
    keepalive_timeout 65;
    client_max_body_size 512k;

    upstream backend {
        server 127.0.0.1:9001 weight=2;
        server 127.0.0.1:9002 max_fails=3 fail_timeout=30;
    }

    proxy_cache_path cache keys_zone=main:10m;

    server {
        listen 8080;
        server_name example.test "with space.test";
        root html;

        location / {
            try_files $uri /index.html;
        }
        location /api {
            proxy_pass http://backend;
            proxy_buffering on;
            proxy_next_upstream error timeout http_502;
            proxy_cache main;
            proxy_cache_valid 200 10m;
        }
        location /health {
            return 204;
        }
    }
}
"#;

#[test]
fn dump_reparses_to_an_equivalent_tree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_file(dir.path(), "vakt.conf", FULL_CONF);

    let first = parse_file(&path).expect("parse original");
    let dumped = write_file(dir.path(), "dumped.conf", &dump(&first));
    let second = parse_file(&dumped).expect("parse dump");

    assert_eq!(strip_origin(first), strip_origin(second));
}

#[test]
fn dump_of_dump_is_stable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_file(dir.path(), "vakt.conf", FULL_CONF);

    let first = parse_file(&path).expect("parse original");
    let once = dump(&first);
    let reparsed = parse_file(&write_file(dir.path(), "once.conf", &once)).expect("reparse");
    assert_eq!(once, dump(&reparsed), "dump must be a fixed point");
}

#[test]
fn include_expansion_is_order_preserving() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(dir.path(), "conf.d/10-first.conf", "worker_processes 4;\n");
    write_file(dir.path(), "conf.d/20-second.conf", "daemon off;\n");
    write_file(dir.path(), "conf.d/30-third.conf", "pid run/vakt.pid;\n");
    let main = write_file(
        dir.path(),
        "vakt.conf",
        "include conf.d/*.conf;\nerror_log logs/error.log;\n",
    );

    let tree = parse_file(&main).expect("parse");
    let names: Vec<&str> = tree.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(
        vec!["worker_processes", "daemon", "pid", "error_log"],
        names
    );
}

#[test]
fn unchanged_file_builds_an_equivalent_typed_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_file(dir.path(), "vakt.conf", FULL_CONF);

    let a = Conf::build(&parse_file(&path).expect("first parse")).expect("first build");
    let b = Conf::build(&parse_file(&path).expect("second parse")).expect("second build");

    // the parts reload compares when deciding whether listeners move
    assert_eq!(a.core.worker_processes, b.core.worker_processes);
    assert_eq!(a.events.worker_connections, b.events.worker_connections);
    let listens_a: Vec<_> = a.http.servers.iter().flat_map(|s| s.listen.clone()).collect();
    let listens_b: Vec<_> = b.http.servers.iter().flat_map(|s| s.listen.clone()).collect();
    assert_eq!(listens_a, listens_b);
}

#[test]
fn error_in_included_file_names_file_and_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(
        dir.path(),
        "conf.d/bad.conf",
        "# comment\n# comment\nworker_processes 2\n",
    );
    let main = write_file(dir.path(), "vakt.conf", "include conf.d/bad.conf;\n");

    let err = parse_file(&main).expect_err("must fail");
    let msg = err.to_string();
    assert!(msg.contains("bad.conf"), "got: {}", msg);
    assert!(msg.contains(":3"), "got: {}", msg);
}
