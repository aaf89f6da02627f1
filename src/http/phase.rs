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

//! Phase engine
//!
//! A request walks a fixed, ordered handler table. A handler answers `Ok`
//! (skip to the next phase), `Declined` (next handler of the same phase),
//! `Again` (suspend; the handler arranged re-entry), `Done` (a response is
//! underway), or an error status. The table is built once at init; the LOG
//! phase runs from request finish rather than through the table.

use log::debug;

use crate::conn::ConnId;
use crate::event::EventHandler;
use crate::http::request::{self, MAX_REDIRECTS};
use crate::worker::Worker;

/// The named stages of request processing, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PostRead,
    ServerRewrite,
    FindConfig,
    Rewrite,
    PostRewrite,
    Preaccess,
    Access,
    PostAccess,
    TryFiles,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseResult {
    Ok,
    Declined,
    Again,
    Done,
    Error(u16),
}

pub type PhaseHandler = fn(&mut Worker, ConnId) -> PhaseResult;

#[derive(Clone, Copy)]
pub struct PhaseEntry {
    pub phase: Phase,
    pub handler: PhaseHandler,
}

impl std::fmt::Debug for PhaseEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseEntry").field("phase", &self.phase).finish()
    }
}

/// The built-in handler table. Registration order within a phase is
/// preserved; modules with nothing to do simply register nothing.
pub fn default_phases() -> Vec<PhaseEntry> {
    vec![
        PhaseEntry {
            phase: Phase::PostRead,
            handler: post_read,
        },
        PhaseEntry {
            phase: Phase::FindConfig,
            handler: find_config,
        },
        PhaseEntry {
            phase: Phase::PostRewrite,
            handler: post_rewrite,
        },
        PhaseEntry {
            phase: Phase::PostAccess,
            handler: post_access,
        },
        PhaseEntry {
            phase: Phase::TryFiles,
            handler: try_files,
        },
        PhaseEntry {
            phase: Phase::Content,
            handler: content,
        },
    ]
}

/// Advance the request through the handler table from its saved position.
pub fn run_phases(w: &mut Worker, cid: ConnId) {
    loop {
        let (idx, len) = {
            let Some(conn) = w.conns.get_mut(cid) else { return };
            let Some(req) = conn.request_mut() else { return };
            (req.phase_idx, w.http.phases.len())
        };
        if idx >= len {
            // every content handler declined
            request::finalize(w, cid, 404);
            return;
        }

        let entry = w.http.phases[idx];
        match (entry.handler)(w, cid) {
            PhaseResult::Ok => {
                let next = next_phase_index(&w.http.phases, idx);
                set_phase(w, cid, next);
            }
            PhaseResult::Declined => set_phase(w, cid, idx + 1),
            PhaseResult::Again | PhaseResult::Done => return,
            PhaseResult::Error(status) => {
                request::finalize(w, cid, status);
                return;
            }
        }
    }
}

fn set_phase(w: &mut Worker, cid: ConnId, idx: usize) {
    let Some(conn) = w.conns.get_mut(cid) else { return };
    if let Some(req) = conn.request_mut() {
        req.phase_idx = idx;
    }
}

fn next_phase_index(phases: &[PhaseEntry], current: usize) -> usize {
    let phase = phases[current].phase;
    (current + 1..phases.len())
        .find(|&i| phases[i].phase != phase)
        .unwrap_or(phases.len())
}

/// Rewind to the server-rewrite stage with a replaced URI. Bounded; loops
/// fail the request with 500.
pub fn internal_redirect(w: &mut Worker, cid: ConnId, uri: String) -> PhaseResult {
    let Some(conn) = w.conns.get_mut(cid) else {
        return PhaseResult::Done;
    };
    let Some(req) = conn.request_mut() else {
        return PhaseResult::Done;
    };
    req.redirects += 1;
    if req.redirects > MAX_REDIRECTS {
        debug!("internal redirect cycle at \"{}\"", uri);
        return PhaseResult::Error(500);
    }
    debug!("internal redirect to \"{}\"", uri);
    req.uri = uri;
    req.location = None;
    req.phase_idx = 0;

    // re-enter the engine as a fresh posted event, keeping tick ordering
    w.arm(cid, false, EventHandler::Continue);
    w.post(cid, false);
    PhaseResult::Again
}

// ---- built-in handlers ----

fn post_read(_w: &mut Worker, _cid: ConnId) -> PhaseResult {
    PhaseResult::Declined
}

/// Longest-prefix location match within the chosen virtual server.
fn find_config(w: &mut Worker, cid: ConnId) -> PhaseResult {
    let location = {
        let Some(conn) = w.conns.get(cid) else {
            return PhaseResult::Done;
        };
        let req = match &conn.ctx {
            crate::conn::ConnCtx::Http(r) => r,
            _ => return PhaseResult::Done,
        };
        let Some(server) = w.http.conf.servers.get(req.server) else {
            return PhaseResult::Error(500);
        };
        // locations are sorted longest-prefix-first at build time
        server
            .locations
            .iter()
            .position(|l| req.uri.starts_with(&l.prefix))
    };

    let Some(conn) = w.conns.get_mut(cid) else {
        return PhaseResult::Done;
    };
    if let Some(req) = conn.request_mut() {
        req.location = location;
    }
    PhaseResult::Ok
}

/// Loop detection for internal redirects; the counter itself is advanced by
/// [`internal_redirect`].
fn post_rewrite(w: &mut Worker, cid: ConnId) -> PhaseResult {
    let Some(conn) = w.conns.get(cid) else {
        return PhaseResult::Done;
    };
    let req = match &conn.ctx {
        crate::conn::ConnCtx::Http(r) => r,
        _ => return PhaseResult::Done,
    };
    if req.redirects > MAX_REDIRECTS {
        return PhaseResult::Error(500);
    }
    PhaseResult::Declined
}

fn post_access(_w: &mut Worker, _cid: ConnId) -> PhaseResult {
    PhaseResult::Declined
}

/// `try_files A B ... FALLBACK`: serve the first option that exists on
/// disk, else redirect internally to the fallback (or answer `=code`).
fn try_files(w: &mut Worker, cid: ConnId) -> PhaseResult {
    let plan = {
        let Some(conn) = w.conns.get(cid) else {
            return PhaseResult::Done;
        };
        let req = match &conn.ctx {
            crate::conn::ConnCtx::Http(r) => r,
            _ => return PhaseResult::Done,
        };
        let Some(location) = req.location_conf(&w.http) else {
            return PhaseResult::Declined;
        };
        if location.try_files.is_empty() {
            return PhaseResult::Declined;
        }
        let root = location
            .root
            .clone()
            .or_else(|| w.http.conf.servers[req.server].root.clone());
        Some((
            location.try_files.clone(),
            root,
            req.uri.clone(),
        ))
    };
    let Some((options, root, uri)) = plan else {
        return PhaseResult::Declined;
    };
    let Some(root) = root else {
        return PhaseResult::Error(500);
    };

    for option in &options[..options.len() - 1] {
        let mapped = if option == "$uri" { uri.as_str() } else { option.as_str() };
        let path = crate::http::static_files::map_uri(&root, mapped);
        if path.as_ref().map(|p| p.is_file()).unwrap_or(false) {
            if mapped != uri {
                return internal_redirect(w, cid, mapped.to_owned());
            }
            return PhaseResult::Declined; // current uri resolves; let content serve it
        }
    }

    let fallback = options.last().expect("checked non-empty").clone();
    if let Some(code) = fallback.strip_prefix('=') {
        let status: u16 = code.parse().unwrap_or(500);
        return PhaseResult::Error(status);
    }
    internal_redirect(w, cid, fallback)
}

/// CONTENT: dispatch to the location's producer.
fn content(w: &mut Worker, cid: ConnId) -> PhaseResult {
    let action = {
        let Some(conn) = w.conns.get(cid) else {
            return PhaseResult::Done;
        };
        let req = match &conn.ctx {
            crate::conn::ConnCtx::Http(r) => r,
            _ => return PhaseResult::Done,
        };
        match req.location_conf(&w.http) {
            Some(location) => {
                if let Some((code, text)) = &location.ret {
                    ContentAction::Return(*code, text.clone())
                } else if location.proxy.is_some() {
                    ContentAction::Proxy
                } else {
                    ContentAction::Static
                }
            }
            None => ContentAction::Static,
        }
    };

    match action {
        ContentAction::Return(code, text) => return_handler(w, cid, code, text),
        ContentAction::Proxy => crate::upstream::start(w, cid),
        ContentAction::Static => crate::http::static_files::handler(w, cid),
    }
}

enum ContentAction {
    Return(u16, Option<String>),
    Proxy,
    Static,
}

/// `return CODE [TEXT];`
fn return_handler(w: &mut Worker, cid: ConnId, code: u16, text: Option<String>) -> PhaseResult {
    match text {
        None => {
            request::finalize(w, cid, code);
            PhaseResult::Done
        }
        Some(text) => {
            {
                let Some(conn) = w.conns.get_mut(cid) else {
                    return PhaseResult::Done;
                };
                let Some(req) = conn.request_mut() else {
                    return PhaseResult::Done;
                };
                req.headers_out.status = code;
                req.headers_out.content_length = Some(text.len() as u64);
                req.headers_out.content_type = Some("text/plain".to_owned());
                req.finalized = true;
                req.status = code;
            }
            if crate::http::filter::send_header(w, cid).is_err() {
                w.close_connection(cid);
                return PhaseResult::Done;
            }
            crate::http::filter::send_body_text(w, cid, text.into_bytes(), true);
            PhaseResult::Done
        }
    }
}

#[cfg(test)]
mod test {
    use super::{default_phases, next_phase_index, Phase};

    #[test]
    fn table_is_in_phase_order() {
        let phases = default_phases();
        let order: Vec<Phase> = phases.iter().map(|e| e.phase).collect();
        let mut sorted = order.clone();
        sorted.sort_by_key(|p| *p as usize);
        assert_eq!(sorted, order);
    }

    #[test]
    fn ok_advances_past_the_current_phase() {
        let phases = default_phases();
        // from FindConfig (index 1), Ok lands on PostRewrite
        let next = next_phase_index(&phases, 1);
        assert_eq!(Phase::PostRewrite, phases[next].phase);
    }
}
