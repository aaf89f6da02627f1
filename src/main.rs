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

use clap::Parser;
use log::error;

use vakt::cli::{Cli, VERSION};
use vakt::conf::{dump, parse_str, Directive};
use vakt::cycle::{self, Cycle};
use vakt::process::{master, signal};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    if cli.version || cli.version_long {
        println!("vakt version vakt/{}", VERSION);
        if cli.version_long {
            println!("built with rustc ({} profile)", build_profile());
        }
        return 0;
    }

    let prefix = cli.prefix();
    let conf_path = cli.conf_path();

    let global: Vec<Directive> = match cli.global.as_deref() {
        Some(text) => match parse_str(text, "command line") {
            Ok(d) => d,
            Err(e) => {
                eprintln!("vakt: invalid -g directives: {}", e);
                return 1;
            }
        },
        None => Vec::new(),
    };

    if let Some(name) = cli.signal.as_deref() {
        return send_signal(&prefix, &conf_path, global, name);
    }

    if cli.test_config || cli.test_dump {
        return test_configuration(&prefix, &conf_path, global, cli.test_dump, cli.quiet);
    }

    let inherited = cycle::inherited_fds();
    let cycle = match Cycle::with_globals(&prefix, &conf_path, None, &inherited, global) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("vakt: {}", e);
            return 1;
        }
    };
    cycle.log.install();

    if cycle.conf.core.daemon {
        if let Err(e) = vakt::process::daemonize() {
            error!("cannot daemonize: {}", e);
            return 1;
        }
    }

    let os_args: Vec<String> = std::env::args().collect();
    master::master_main(std::sync::Arc::new(cycle), os_args)
}

fn test_configuration(
    prefix: &std::path::Path,
    conf_path: &std::path::Path,
    global: Vec<Directive>,
    dump_tree: bool,
    quiet: bool,
) -> i32 {
    match Cycle::with_globals(prefix, conf_path, None, &[], global) {
        Ok(cycle) => {
            if dump_tree {
                print!("{}", dump(&cycle.tree));
            }
            if !quiet {
                eprintln!(
                    "vakt: the configuration file {} syntax is ok",
                    cycle.conf_path.display()
                );
                eprintln!(
                    "vakt: configuration file {} test is successful",
                    cycle.conf_path.display()
                );
            }
            0
        }
        Err(e) => {
            eprintln!("vakt: {}", e);
            eprintln!("vakt: configuration file test failed");
            1
        }
    }
}

/// `-s`: resolve the running master through the pid file, send the signal.
fn send_signal(
    prefix: &std::path::Path,
    conf_path: &std::path::Path,
    global: Vec<Directive>,
    name: &str,
) -> i32 {
    let Some(sig) = signal::from_cli(name) else {
        eprintln!("vakt: invalid option: -s {}", name);
        return 1;
    };

    // only the pid path is needed; do not touch the running master's sockets
    let full_path = if conf_path.is_absolute() {
        conf_path.to_owned()
    } else {
        prefix.join(conf_path)
    };
    let conf = vakt::conf::parse_file(&full_path)
        .and_then(|tree| {
            let mut merged = global;
            merged.extend(tree);
            vakt::conf::Conf::build(&merged)
        });
    let conf = match conf {
        Ok(c) => c,
        Err(e) => {
            eprintln!("vakt: {}", e);
            return 1;
        }
    };
    let pid_path = prefix.join(&conf.core.pid_path);
    let pid = match cycle::read_pid_file(&pid_path) {
        Ok(pid) => pid,
        Err(e) => {
            eprintln!("vakt: cannot read pid file {}: {}", pid_path.display(), e);
            return 1;
        }
    };
    match signal::kill(pid, sig) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("vakt: cannot send signal to process {}: {}", pid, e);
            1
        }
    }
}

fn build_profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}
