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

//! Error and access logs
//!
//! The error log is a [`log::Log`] sink behind the standard macros. Both
//! logs own their file handle so a reopen signal (USR1) can close and
//! reopen the path after rotation, without dropping lines in between.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::LevelFilter;

/// A log file that can be reopened in place.
#[derive(Debug)]
struct LogFile {
    path: PathBuf,
    file: Option<File>,
}

impl LogFile {
    fn open(path: &Path) -> Self {
        let file = open_append(path);
        LogFile {
            path: path.to_owned(),
            file,
        }
    }

    fn reopen(&mut self) {
        self.file = open_append(&self.path);
    }

    fn write_line(&mut self, line: &str) {
        if let Some(file) = &mut self.file {
            // a failed log write has nowhere to report itself
            let _ = file.write_all(line.as_bytes());
            let _ = file.write_all(b"\n");
        }
    }
}

fn open_append(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}

/// The error log sink. Cloneable handle; the master installs one as the
/// global logger and keeps a handle for reopening.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    inner: Arc<Mutex<LogFile>>,
    level: LevelFilter,
}

impl ErrorLog {
    pub fn open(path: &Path, level: LevelFilter) -> Self {
        ErrorLog {
            inner: Arc::new(Mutex::new(LogFile::open(path))),
            level,
        }
    }

    /// Install as the process-wide logger. Idempotent across reloads; only
    /// the first install wins and later cycles retarget via [`Self::reopen`].
    pub fn install(&self) {
        log::set_max_level(self.level);
        let _ = log::set_boxed_logger(Box::new(self.clone()));
    }

    pub fn reopen(&self) {
        if let Ok(mut file) = self.inner.lock() {
            file.reopen();
        }
    }
}

impl log::Log for ErrorLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} [{}] {}#0: {}",
            chrono::Local::now().format("%Y/%m/%d %H:%M:%S"),
            match record.level() {
                log::Level::Error => "error",
                log::Level::Warn => "warn",
                log::Level::Info => "info",
                log::Level::Debug | log::Level::Trace => "debug",
            },
            std::process::id(),
            record.args()
        );
        if let Ok(mut file) = self.inner.lock() {
            file.write_line(&line);
        }
    }

    fn flush(&self) {}
}

/// The access log. One per worker; the LOG phase writes a line per request.
#[derive(Debug)]
pub struct AccessLog {
    file: Option<LogFile>,
}

impl AccessLog {
    pub fn open(path: Option<&Path>) -> Self {
        AccessLog {
            file: path.map(LogFile::open),
        }
    }

    pub fn reopen(&mut self) {
        if let Some(file) = &mut self.file {
            file.reopen();
        }
    }

    /// `addr - - [time] "request line" status bytes_sent`
    pub fn write(&mut self, remote: &str, request_line: &str, status: u16, sent: u64) {
        let Some(file) = &mut self.file else { return };
        let line = format!(
            "{} - - [{}] \"{}\" {} {}",
            remote,
            chrono::Local::now().format("%d/%b/%Y:%H:%M:%S %z"),
            request_line,
            status,
            sent
        );
        file.write_line(&line);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn access_log_line_has_request_and_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("access.log");
        let mut access = AccessLog::open(Some(&path));
        access.write("127.0.0.1", "GET / HTTP/1.1", 204, 0);

        let contents = std::fs::read_to_string(&path).expect("log written");
        assert!(contents.contains("\"GET / HTTP/1.1\" 204 0"), "got: {}", contents);
    }

    #[test]
    fn reopen_tracks_a_rotated_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("access.log");
        let mut access = AccessLog::open(Some(&path));
        access.write("127.0.0.1", "GET /a HTTP/1.1", 200, 5);

        let rotated = dir.path().join("access.log.1");
        std::fs::rename(&path, &rotated).expect("rotate");
        access.reopen();
        access.write("127.0.0.1", "GET /b HTTP/1.1", 200, 5);

        assert!(std::fs::read_to_string(&rotated)
            .expect("old file")
            .contains("/a"));
        assert!(std::fs::read_to_string(&path)
            .expect("new file")
            .contains("/b"));
    }
}
