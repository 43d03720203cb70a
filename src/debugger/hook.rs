//! Routing of VM break and error callbacks to debugger sessions.
//!
//! The embedding host funnels every VM callback through [`HostHooks`]. A
//! callback first goes to the session already attached to the firing
//! context; failing that, sessions are matched by loaded-file membership
//! (case-insensitive base names) and the first match attaches. Everything
//! here swallows errors: the VM thread must always get a state code back.

use crate::debugger::{basename_lower, DebugSession, DebugState};
use crate::image::ScriptImage;
use crate::vm::{BreakInfo, ErrorReport, ExecutionContext};
use crate::weak_error;
use log::debug;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Process-wide cache of parsed images, keyed by script path. Entries are
/// inserted once and read-only afterwards; images outlive all sessions.
/// Scripts whose image fails validation are cached as `None` so they are
/// not re-parsed on every break.
static IMAGE_CACHE: Lazy<RwLock<HashMap<String, Option<Arc<ScriptImage>>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Parsed image for a script path, loading and validating on first use.
pub fn cached_image(path: &str) -> Option<Arc<ScriptImage>> {
    if let Some(entry) = IMAGE_CACHE.read().unwrap().get(path) {
        return entry.clone();
    }
    let image = weak_error!(ScriptImage::from_file(path), "script image rejected:").map(Arc::new);
    let mut cache = IMAGE_CACHE.write().unwrap();
    cache.entry(path.to_string()).or_insert(image).clone()
}

/// All connected debugger clients. Traversed under its own lock, which is
/// never held across a session rendezvous.
#[derive(Default)]
pub struct ClientRegistry {
    sessions: RwLock<Vec<Arc<DebugSession>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<DebugSession>) {
        self.sessions.write().unwrap().push(session);
    }

    /// Remove by identity; the session's own teardown unblocks the VM.
    pub fn remove(&self, session: &Arc<DebugSession>) {
        self.sessions
            .write()
            .unwrap()
            .retain(|s| !Arc::ptr_eq(s, session));
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<DebugSession>> {
        self.sessions.read().unwrap().clone()
    }
}

/// The adapter the embedding host installs as the VM's break and error
/// callbacks.
#[derive(Clone)]
pub struct HostHooks {
    registry: Arc<ClientRegistry>,
}

impl HostHooks {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        HostHooks { registry }
    }

    /// Per-instruction break callback. Returns the session state as the
    /// VM's continue hint; `Run` when nobody is attached.
    pub fn dispatch_break(
        &self,
        ctx: &Arc<dyn ExecutionContext>,
        info: BreakInfo,
    ) -> DebugState {
        let sessions = self.registry.snapshot();
        if sessions.is_empty() {
            return DebugState::Run;
        }
        let Some(image) = cached_image(&ctx.runtime_filename()) else {
            return DebugState::Run;
        };

        if let Some(session) = self.select_session(&sessions, ctx) {
            return session.break_hook(ctx, &image, info);
        }
        DebugState::Run
    }

    /// Uncaught-error callback.
    pub fn dispatch_error(&self, ctx: &Arc<dyn ExecutionContext>, report: &ErrorReport) {
        let sessions = self.registry.snapshot();
        if sessions.is_empty() {
            return;
        }
        let Some(image) = cached_image(&ctx.runtime_filename()) else {
            return;
        };
        if let Some(session) = self.select_session(&sessions, ctx) {
            session.error_hook(ctx, &image, report);
        }
    }

    /// Sticky attachment first, then file-membership matching.
    fn select_session(
        &self,
        sessions: &[Arc<DebugSession>],
        ctx: &Arc<dyn ExecutionContext>,
    ) -> Option<Arc<DebugSession>> {
        if let Some(session) = sessions.iter().find(|s| s.attached_to(ctx.id())) {
            return Some(session.clone());
        }
        let files: Vec<String> = ctx
            .runtime_files()
            .iter()
            .map(|f| basename_lower(f))
            .collect();
        for session in sessions {
            if files.iter().any(|f| session.knows_file(f)) {
                debug!(target: "session", "attaching client to context {}", ctx.id());
                return Some(session.clone());
            }
        }
        None
    }
}
