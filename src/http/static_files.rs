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

//! Static file content handler
//!
//! Maps the request URI under the location (or server) root, falls back to
//! the index list for directories, and answers with an in-file buffer that
//! the output chain can hand to sendfile. Single byte ranges are honoured
//! with 206/416.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::debug;

use crate::buf::{Buf, BufTag, Chain};
use crate::conn::ConnId;
use crate::http::parse::Method;
use crate::http::filter;
use crate::http::phase::PhaseResult;
use crate::worker::Worker;

const STATIC_TAG: BufTag = BufTag("http_static");

/// Resolve a URI beneath a root. Rejects traversal; keeps encoding as-is.
pub fn map_uri(root: &Path, uri: &str) -> Option<PathBuf> {
    if uri.split('/').any(|seg| seg == "..") {
        return None;
    }
    Some(root.join(uri.trim_start_matches('/')))
}

fn content_type(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => Some("text/html"),
        Some("txt") => Some("text/plain"),
        _ => None,
    }
}

/// Parse a single `bytes=a-b` range against a body of `len` bytes.
/// `None` means serve the whole file; `Some(Err(()))` is unsatisfiable.
fn parse_range(spec: &str, len: u64) -> Option<Result<(u64, u64), ()>> {
    let spec = spec.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None; // multiple ranges are served whole
    }
    let (start, end) = spec.split_once('-')?;
    let result = if start.is_empty() {
        // suffix form: last N bytes
        match end.parse::<u64>() {
            Ok(0) | Err(_) => Err(()),
            Ok(n) => Ok((len.saturating_sub(n), len - 1)),
        }
    } else {
        let start: u64 = match start.parse() {
            Ok(s) => s,
            Err(_) => return Some(Err(())),
        };
        let end: u64 = if end.is_empty() {
            len.saturating_sub(1)
        } else {
            match end.parse() {
                Ok(e) => e,
                Err(_) => return Some(Err(())),
            }
        };
        if start >= len || start > end {
            Err(())
        } else {
            Ok((start, end.min(len - 1)))
        }
    };
    Some(result)
}

/// CONTENT handler for locations without their own producer.
pub fn handler(w: &mut Worker, cid: ConnId) -> PhaseResult {
    let plan = {
        let Some(conn) = w.conns.get(cid) else {
            return PhaseResult::Done;
        };
        let req = match &conn.ctx {
            crate::conn::ConnCtx::Http(r) => r,
            _ => return PhaseResult::Done,
        };
        if req.method != Method::Get && req.method != Method::Head {
            return PhaseResult::Error(405);
        }

        let location = req.location_conf(&w.http);
        let server = &w.http.conf.servers[req.server];
        let root = location
            .and_then(|l| l.root.clone())
            .or_else(|| server.root.clone())
            .unwrap_or_else(|| PathBuf::from("html"));
        let root = if root.is_absolute() {
            root
        } else {
            w.cycle.prefix.join(root)
        };
        let index = location
            .map(|l| l.index.clone())
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| server.index.clone());
        (root, index, req.uri.clone(), req.headers_in.range.clone())
    };
    let (root, index, uri, range) = plan;

    let Some(mut path) = map_uri(&root, &uri) else {
        return PhaseResult::Error(400);
    };

    let mut meta = match std::fs::metadata(&path) {
        Ok(m) => m,
        Err(e) => return PhaseResult::Error(io_status(&e)),
    };
    if meta.is_dir() {
        let found = index.iter().find_map(|name| {
            let candidate = path.join(name);
            std::fs::metadata(&candidate)
                .ok()
                .filter(|m| m.is_file())
                .map(|m| (candidate, m))
        });
        match found {
            Some((candidate, m)) => {
                path = candidate;
                meta = m;
            }
            None => return PhaseResult::Error(403),
        }
    }

    let file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) => return PhaseResult::Error(io_status(&e)),
    };
    let len = meta.len();

    let (status, first, last_excl, content_range) = match range.as_deref().and_then(|r| parse_range(r, len)) {
        None => (200, 0, len, None),
        Some(Ok((a, b))) => (206, a, b + 1, Some(format!("bytes {}-{}/{}", a, b, len))),
        Some(Err(())) => {
            {
                let Some(conn) = w.conns.get_mut(cid) else {
                    return PhaseResult::Done;
                };
                if let Some(req) = conn.request_mut() {
                    req.headers_out
                        .headers
                        .push(("Content-Range".to_owned(), format!("bytes */{}", len)));
                }
            }
            return PhaseResult::Error(416);
        }
    };

    debug!("static file \"{}\" ({} bytes)", path.display(), last_excl - first);
    {
        let Some(conn) = w.conns.get_mut(cid) else {
            return PhaseResult::Done;
        };
        let Some(req) = conn.request_mut() else {
            return PhaseResult::Done;
        };
        req.headers_out.status = status;
        req.headers_out.content_length = Some(last_excl - first);
        req.headers_out.content_type = content_type(&path).map(str::to_owned);
        if let Some(cr) = content_range {
            req.headers_out.headers.push(("Content-Range".to_owned(), cr));
        }
        req.finalized = true;
        req.status = status;
    }

    if filter::send_header(w, cid).is_err() {
        w.close_connection(cid);
        return PhaseResult::Done;
    }

    let mut chain = Chain::new();
    if last_excl > first {
        let mut buf = Buf::file_range(Rc::new(file), first, last_excl, STATIC_TAG);
        buf.flags.last_buf = true;
        chain.push(buf);
    } else {
        let mut marker = Buf::special(STATIC_TAG);
        marker.flags.last_buf = true;
        chain.push(marker);
    }
    let _ = filter::send_body(w, cid, chain);
    PhaseResult::Done
}

fn io_status(e: &std::io::Error) -> u16 {
    match e.kind() {
        std::io::ErrorKind::NotFound => 404,
        std::io::ErrorKind::PermissionDenied => 403,
        _ => 500,
    }
}

#[cfg(test)]
mod test {
    use super::{map_uri, parse_range};
    use std::path::Path;

    #[test]
    fn uri_maps_beneath_the_root() {
        let root = Path::new("/srv/www");
        assert_eq!(
            Some(Path::new("/srv/www/a/b.html").to_path_buf()),
            map_uri(root, "/a/b.html")
        );
        assert_eq!(None, map_uri(root, "/a/../../etc/passwd"));
    }

    #[test]
    fn range_forms_parse_against_length() {
        assert_eq!(Some(Ok((0, 99))), parse_range("bytes=0-99", 1000));
        assert_eq!(Some(Ok((900, 999))), parse_range("bytes=-100", 1000));
        assert_eq!(Some(Ok((500, 999))), parse_range("bytes=500-", 1000));
        // end clamps to the last byte
        assert_eq!(Some(Ok((0, 999))), parse_range("bytes=0-5000", 1000));
    }

    #[test]
    fn unsatisfiable_ranges_are_errors_and_multi_ranges_are_ignored() {
        assert_eq!(Some(Err(())), parse_range("bytes=1000-", 1000));
        assert_eq!(Some(Err(())), parse_range("bytes=5-2", 1000));
        assert_eq!(None, parse_range("bytes=0-1,5-6", 1000));
        assert_eq!(None, parse_range("items=0-1", 1000));
    }
}
