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

//! Command line surface

use std::path::PathBuf;

use clap::Parser;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Event-driven HTTP reverse proxy and web server.
#[derive(Debug, Parser)]
#[command(name = "vakt", disable_version_flag = true)]
pub struct Cli {
    /// Show version and exit
    #[arg(short = 'v')]
    pub version: bool,

    /// Show version and build information and exit
    #[arg(short = 'V')]
    pub version_long: bool,

    /// Test the configuration and exit
    #[arg(short = 't')]
    pub test_config: bool,

    /// Test the configuration, dump it and exit
    #[arg(short = 'T')]
    pub test_dump: bool,

    /// Suppress non-error messages during configuration testing
    #[arg(short = 'q')]
    pub quiet: bool,

    /// Set the prefix path
    #[arg(short = 'p', value_name = "PREFIX")]
    pub prefix: Option<PathBuf>,

    /// Use an alternative configuration file
    #[arg(short = 'c', value_name = "FILE")]
    pub conf: Option<PathBuf>,

    /// Set global directives out of the configuration file
    #[arg(short = 'g', value_name = "DIRECTIVES")]
    pub global: Option<String>,

    /// Send a signal to the master process: stop, quit, reopen, reload
    #[arg(short = 's', value_name = "SIGNAL")]
    pub signal: Option<String>,
}

impl Cli {
    pub fn prefix(&self) -> PathBuf {
        self.prefix
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn conf_path(&self) -> PathBuf {
        self.conf
            .clone()
            .unwrap_or_else(|| PathBuf::from("conf/vakt.conf"))
    }
}

#[cfg(test)]
mod test {
    use super::Cli;
    use clap::Parser;

    #[test]
    fn flags_parse_like_the_classic_surface() {
        let cli = Cli::parse_from(["vakt", "-t", "-q", "-p", "/srv", "-c", "my.conf"]);
        assert!(cli.test_config && cli.quiet);
        assert_eq!("/srv", cli.prefix().to_str().expect("utf8"));
        assert_eq!("my.conf", cli.conf_path().to_str().expect("utf8"));
    }

    #[test]
    fn signal_argument_is_captured() {
        let cli = Cli::parse_from(["vakt", "-s", "reload"]);
        assert_eq!(Some("reload"), cli.signal.as_deref());
    }

    #[test]
    fn defaults_point_at_the_prefix_conf() {
        let cli = Cli::parse_from(["vakt"]);
        assert_eq!("conf/vakt.conf", cli.conf_path().to_str().expect("utf8"));
    }
}
