//! The per-connection debug session: stepping state machine, breakpoint
//! table, command dispatch and the suspend/resume rendezvous with the VM.
//!
//! A session is driven from two sides. The VM thread enters through
//! [`DebugSession::break_hook`] on every instrumented instruction and may
//! park itself on the session condvar; the connection thread enters through
//! [`DebugSession::dispatch`] with decoded frames and wakes the VM back up.
//! All shared state sits behind one mutex; the lock order is session state
//! first, socket second.

pub mod hook;
pub mod variable;

use crate::image::symbols::{SymbolScope, DISP_MASK, IDENT_FUNCTION};
use crate::image::ScriptImage;
use crate::proto::{CodecError, MessageTag, MessageWriter, PayloadReader};
use crate::vm::{BreakInfo, Cell, ErrorReport, ExecutionContext};
use crate::weak_error;
use bytes::Bytes;
use log::{debug, warn};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard};

/// Session states. `Dead` is terminal; the stepping states are requested by
/// the client and take effect on the next VM break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugState {
    Dead,
    Run,
    Breakpoint,
    Pause,
    StepIn,
    StepOver,
    StepOut,
    Exception,
}

impl DebugState {
    pub fn from_wire(byte: u8) -> Option<Self> {
        Some(match byte as i8 {
            -1 => DebugState::Dead,
            0 => DebugState::Run,
            1 => DebugState::Breakpoint,
            2 => DebugState::Pause,
            3 => DebugState::StepIn,
            4 => DebugState::StepOver,
            5 => DebugState::StepOut,
            6 => DebugState::Exception,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> i8 {
        match self {
            DebugState::Dead => -1,
            DebugState::Run => 0,
            DebugState::Breakpoint => 1,
            DebugState::Pause => 2,
            DebugState::StepIn => 3,
            DebugState::StepOver => 4,
            DebugState::StepOut => 5,
            DebugState::Exception => 6,
        }
    }

    /// True while the VM thread is expected to sit in the rendezvous.
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            DebugState::Breakpoint | DebugState::Pause | DebugState::Exception
        )
    }
}

/// What the connection loop should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Continue,
    Shutdown,
}

/// Write half of the client connection. Split out as a trait so sessions can
/// be exercised without a socket.
pub trait MessageSink: Send {
    fn send(&mut self, frame: Bytes) -> std::io::Result<()>;
}

impl MessageSink for std::net::TcpStream {
    fn send(&mut self, frame: Bytes) -> std::io::Result<()> {
        use std::io::Write;
        self.write_all(&frame)
    }
}

struct SessionState {
    state: DebugState,
    /// Cleared at every hook entry, set by the next resume command. Once
    /// set, further rendezvous attempts in the same hook invocation are
    /// no-ops.
    resume_requested: bool,
    /// True only while a VM thread actually waits on the condvar.
    parked: bool,
    /// Lowercased base names of the files this client debugs.
    files: HashSet<String>,
    /// file -> breakpoint lines.
    break_list: HashMap<String, BTreeSet<u32>>,
    cip: u32,
    frm: Cell,
    last_frm: Cell,
    /// Suppresses repeated stops on one source line.
    last_line: Option<u32>,
    current_line: u32,
    current_file: String,
    image: Option<std::sync::Arc<ScriptImage>>,
    context: Option<std::sync::Arc<dyn ExecutionContext>>,
    /// Sticky attachment to the VM context that first matched.
    attached_ctx: Option<usize>,
    /// Stack snapshot captured by the error hook, valid for one stop.
    exception_frames: Option<Vec<crate::vm::FrameRecord>>,
}

/// One debugger client. Owned by its connection thread, shared with VM
/// threads through the host hook adapter.
pub struct DebugSession {
    inner: Mutex<SessionState>,
    resumed: Condvar,
    sink: Mutex<Box<dyn MessageSink>>,
}

impl DebugSession {
    pub fn new(sink: Box<dyn MessageSink>) -> Self {
        DebugSession {
            inner: Mutex::new(SessionState {
                state: DebugState::Run,
                resume_requested: true,
                parked: false,
                files: HashSet::new(),
                break_list: HashMap::new(),
                cip: 0,
                frm: 0,
                last_frm: 0,
                last_line: None,
                current_line: 0,
                current_file: "N/A".to_string(),
                image: None,
                context: None,
                attached_ctx: None,
                exception_frames: None,
            }),
            resumed: Condvar::new(),
            sink: Mutex::new(sink),
        }
    }

    fn send(&self, frame: Bytes) {
        let mut sink = self.sink.lock().unwrap();
        weak_error!(sink.send(frame), "client send failed:");
    }

    /// Greeting sent right after accept.
    pub fn greet(&self) {
        self.send(MessageWriter::new(MessageTag::StartDebugging).finish());
    }

    pub fn state(&self) -> DebugState {
        self.inner.lock().unwrap().state
    }

    pub fn knows_file(&self, basename: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .iter()
            .any(|f| f == basename || f.contains(basename))
    }

    pub fn attached_to(&self, ctx_id: usize) -> bool {
        self.inner.lock().unwrap().attached_ctx == Some(ctx_id)
    }

    /// Unblock a parked VM thread and mark the session terminal. Called on
    /// disconnect and on `StopDebugging`.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != DebugState::Dead {
            inner.state = DebugState::Dead;
            inner.resume_requested = true;
            self.resumed.notify_one();
        }
    }

    // -----------------------------------------------------------------
    // VM side

    /// The break hook, invoked by the host adapter on every instrumented
    /// instruction of an attached context. May park the calling VM thread.
    /// The returned state doubles as a continue/veto hint for the VM.
    pub fn break_hook(
        &self,
        ctx: &std::sync::Arc<dyn ExecutionContext>,
        image: &std::sync::Arc<ScriptImage>,
        info: BreakInfo,
    ) -> DebugState {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == DebugState::Dead {
            return DebugState::Dead;
        }

        inner.context = Some(ctx.clone());
        inner.image = Some(image.clone());
        inner.attached_ctx = Some(ctx.id());
        inner.cip = info.cip;
        inner.frm = info.frm;
        inner.resume_requested = false;

        // Resolve the stopped file from the innermost scripted frame and
        // canonicalize it against the client's known files.
        let mut current_file = "N/A".to_string();
        for frame in ctx.frames() {
            if !frame.scripted {
                continue;
            }
            current_file = basename_lower(&frame.file);
            if let Some(known) = inner
                .files
                .iter()
                .find(|f| **f == current_file || f.contains(&current_file))
            {
                current_file = known.clone();
            }
            break;
        }
        inner.current_file = current_file;

        let Some(line) = image.lookup_line(info.cip) else {
            return inner.state;
        };
        // Don't break twice on the same source line.
        if inner.last_line == Some(line) {
            return inner.state;
        }
        inner.last_line = Some(line);
        inner.current_line = line;

        // A return past the watched frame turns a step-out into a step-in.
        if inner.state == DebugState::StepOut && info.frm > inner.last_frm {
            inner.state = DebugState::StepIn;
        }

        if inner.state == DebugState::Pause || inner.state == DebugState::StepIn {
            inner = self.rendezvous(inner, "Breakpoint", "N/A");
        } else {
            let hit = inner
                .break_list
                .get(&inner.current_file)
                .map(|lines| lines.contains(&line))
                .unwrap_or(false);
            if hit {
                debug!(target: "session", "breakpoint hit at {}:{line}", inner.current_file);
                inner.state = DebugState::Breakpoint;
                inner = self.rendezvous(inner, "Breakpoint", "N/A");
            }
        }

        // Stepping over only stops at the same or a shallower frame; while
        // inside a sub-function the step watermark is left untouched.
        if inner.state == DebugState::StepOver {
            if info.frm < inner.last_frm {
                return inner.state;
            }
            inner = self.rendezvous(inner, "Breakpoint", "N/A");
            if inner.state == DebugState::Dead {
                return DebugState::Dead;
            }
        }

        inner.last_frm = info.frm;
        inner.state
    }

    /// The error hook: an uncaught runtime error stops the session with the
    /// report message and a captured stack snapshot.
    pub fn error_hook(
        &self,
        ctx: &std::sync::Arc<dyn ExecutionContext>,
        image: &std::sync::Arc<ScriptImage>,
        report: &ErrorReport,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == DebugState::Dead {
            return;
        }
        inner.context = Some(ctx.clone());
        inner.image = Some(image.clone());
        inner.attached_ctx = Some(ctx.id());
        inner.resume_requested = false;
        inner.state = DebugState::Exception;
        inner.exception_frames = Some(report.frames.clone());
        inner = self.rendezvous(inner, "exception", &report.message);
        if inner.state == DebugState::Exception {
            inner.state = DebugState::Breakpoint;
        }
        inner.exception_frames = None;
    }

    /// Publish the stop, then park the calling VM thread until a resume
    /// command arrives. State mutation happens under the session mutex
    /// before the condvar is signalled; we reread it under the same mutex.
    /// A no-op once a resume was already granted in this hook invocation.
    fn rendezvous<'a>(
        &self,
        mut inner: MutexGuard<'a, SessionState>,
        reason: &str,
        text: &str,
    ) -> MutexGuard<'a, SessionState> {
        if inner.resume_requested {
            return inner;
        }
        let frame = MessageWriter::new(MessageTag::HasStopped)
            .put_string(reason)
            .put_string(reason)
            .put_string(text)
            .finish();
        self.send(frame);
        inner.parked = true;
        let mut inner = self
            .resumed
            .wait_while(inner, |state| !state.resume_requested)
            .unwrap();
        inner.parked = false;
        inner
    }

    // -----------------------------------------------------------------
    // client side

    /// Handle one decoded frame. Malformed payloads bubble up and drop the
    /// connection; unknown tags are ignored.
    pub fn dispatch(&self, tag: u8, payload: Bytes) -> Result<DispatchOutcome, CodecError> {
        let mut reader = PayloadReader::new(payload);
        let Some(tag) = MessageTag::from_u8(tag) else {
            debug!(target: "session", "ignoring unknown message tag {tag}");
            return Ok(DispatchOutcome::Continue);
        };
        match tag {
            MessageTag::RequestFile => {
                let file = reader.get_string()?;
                let mut inner = self.inner.lock().unwrap();
                inner.files.insert(basename_lower(&file));
            }
            MessageTag::Pause
            | MessageTag::Continue
            | MessageTag::StepIn
            | MessageTag::StepOver
            | MessageTag::StepOut => {
                let state = reader.get_u8()?;
                self.switch_state(state);
            }
            MessageTag::RequestCallStack => self.send_call_stack(),
            MessageTag::ClearBreakpoints => {
                let file = reader.get_string()?;
                let mut inner = self.inner.lock().unwrap();
                let basename = basename_lower(&file);
                if let Some(lines) = inner.break_list.get_mut(&basename) {
                    lines.clear();
                }
            }
            MessageTag::SetBreakpoint => {
                let file = reader.get_string()?;
                let line = reader.get_i32()?;
                let _id = reader.get_i32()?;
                let basename = basename_lower(&file);
                let mut inner = self.inner.lock().unwrap();
                inner.files.insert(basename.clone());
                inner
                    .break_list
                    .entry(basename)
                    .or_default()
                    .insert(line as u32);
            }
            MessageTag::RequestVariables => {
                let scope = reader.get_string()?;
                self.send_variables(&scope);
            }
            MessageTag::RequestSetVariable => {
                let name = reader.get_string()?;
                let value = reader.get_string()?;
                let index = reader.get_i32()?;
                self.set_variable(&name, &value, index);
            }
            MessageTag::RequestEvaluate => {
                let variable = reader.get_string()?;
                let _frame_id = reader.get_i32()?;
                self.evaluate(&variable);
            }
            MessageTag::Disconnect => {}
            MessageTag::StopDebugging => {
                self.shutdown();
                return Ok(DispatchOutcome::Shutdown);
            }
            other => {
                debug!(target: "session", "ignoring unexpected message {other:?}");
            }
        }
        Ok(DispatchOutcome::Continue)
    }

    /// Apply a client-requested state and wake a parked VM thread. Signals
    /// the condvar exactly once per command.
    fn switch_state(&self, wire_state: u8) {
        let Some(new_state) = DebugState::from_wire(wire_state) else {
            warn!(target: "session", "client sent invalid state {wire_state}");
            return;
        };
        let was_parked;
        {
            let mut inner = self.inner.lock().unwrap();
            was_parked = inner.parked;
            inner.state = new_state;
            inner.resume_requested = true;
            self.resumed.notify_one();
        }
        if was_parked {
            self.send(MessageWriter::new(MessageTag::HasContinued).finish());
        }
    }

    fn send_call_stack(&self) {
        let mut inner = self.inner.lock().unwrap();
        let mut frames: Vec<crate::vm::FrameRecord> = if inner.state == DebugState::Exception {
            let frames = inner.exception_frames.clone().unwrap_or_default();
            // The captured snapshot is good for one walk.
            inner.state = DebugState::Breakpoint;
            frames
        } else if inner.state != DebugState::Run && inner.state != DebugState::Dead {
            match &inner.context {
                Some(ctx) => ctx.frames(),
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };
        frames.retain(|frame| frame.scripted);
        for frame in &mut frames {
            let base = basename_lower(&frame.file);
            frame.file = inner
                .files
                .iter()
                .find(|f| **f == base || f.contains(&base))
                .cloned()
                .unwrap_or(base);
        }

        let mut msg = MessageWriter::new(MessageTag::CallStack).put_i32(frames.len() as i32);
        for frame in &frames {
            msg = msg
                .put_string(&frame.function)
                .put_string(&frame.file)
                .put_i32(frame.line as i32);
        }
        self.send(msg.finish());
    }

    fn send_variables(&self, scope: &str) {
        let inner = self.inner.lock().unwrap();
        let mut vars: Vec<variable::RenderedVariable> = Vec::new();

        let stopped = inner.state != DebugState::Run && inner.state != DebugState::Dead;
        if stopped {
            if let (Some(image), Some(ctx)) = (&inner.image, &inner.context) {
                let cip = inner.cip;
                let frm = inner.frm;
                let local_scope = scope.contains(":%local%");
                let global_scope = scope.contains(":%global%");
                if local_scope || global_scope {
                    let iter_scope = if global_scope {
                        SymbolScope::Global
                    } else {
                        SymbolScope::Local
                    };
                    for mut sym in image.symbol_iterator(iter_scope) {
                        if sym.ident() == IDENT_FUNCTION {
                            continue;
                        }
                        let in_scope = sym.codestart() <= cip && sym.codeend() >= cip;
                        if !in_scope && !global_scope {
                            continue;
                        }
                        // The legacy table mixes storage classes.
                        let local_sym = sym.vclass() & DISP_MASK > 0;
                        if local_scope != local_sym {
                            continue;
                        }
                        vars.push(variable::display_variable(
                            image,
                            ctx.as_ref(),
                            &mut sym,
                            cip,
                            frm,
                            &[],
                            false,
                        ));
                    }
                } else if let Some(mut sym) = image.find_variable(scope, cip) {
                    // A concrete variable: expand array elements into
                    // individually numbered entries.
                    let var = variable::display_variable(
                        image,
                        ctx.as_ref(),
                        &mut sym,
                        cip,
                        frm,
                        &[],
                        true,
                    );
                    match serde_json::from_str::<Value>(&var.value) {
                        Ok(Value::Array(items)) => {
                            for (i, item) in items.iter().enumerate() {
                                vars.push(variable::RenderedVariable {
                                    name: i.to_string(),
                                    value: item.to_string(),
                                    type_name: var.type_name.clone(),
                                });
                            }
                        }
                        _ => vars.push(variable::RenderedVariable {
                            name: "0".to_string(),
                            value: var.value,
                            type_name: var.type_name,
                        }),
                    }
                }
            }
        }

        let mut msg = MessageWriter::new(MessageTag::Variables)
            .put_string(scope)
            .put_i32(vars.len() as i32);
        for var in &vars {
            msg = msg
                .put_string(&var.name)
                .put_string(&var.value)
                .put_string(&var.type_name)
                .put_i32(0);
        }
        self.send(msg.finish());
    }

    fn evaluate(&self, name: &str) {
        let inner = self.inner.lock().unwrap();
        if inner.state == DebugState::Run || inner.state == DebugState::Dead {
            return;
        }
        let (Some(image), Some(ctx)) = (&inner.image, &inner.context) else {
            return;
        };
        let Some(mut sym) = image.find_variable(name, inner.cip) else {
            return;
        };
        let var = variable::display_variable(
            image,
            ctx.as_ref(),
            &mut sym,
            inner.cip,
            inner.frm,
            &[],
            false,
        );
        let msg = MessageWriter::new(MessageTag::Evaluate)
            .put_string(&var.name)
            .put_string(&var.value)
            .put_string(&var.type_name)
            .put_i32(0);
        self.send(msg.finish());
    }

    fn set_variable(&self, name: &str, value: &str, index: i32) {
        let mut success = false;
        {
            let inner = self.inner.lock().unwrap();
            let stopped = inner.state != DebugState::Run && inner.state != DebugState::Dead;
            if stopped {
                if let (Some(image), Some(ctx)) = (&inner.image, &inner.context) {
                    let value = value.replace('"', "");
                    if let Some(mut sym) = image.find_variable(name, inner.cip) {
                        if sym.is_array() {
                            variable::infer_display_type(image, ctx.as_ref(), &mut sym, inner.frm);
                            if sym.vclass() & !DISP_MASK
                                == crate::image::symbols::DISP_STRING
                            {
                                success = variable::set_symbol_string(
                                    ctx.as_ref(),
                                    &sym,
                                    inner.frm,
                                    &value,
                                );
                            }
                        } else if let Some(cell) = parse_cell(&value) {
                            success = variable::set_symbol_value(
                                ctx.as_ref(),
                                &sym,
                                index,
                                inner.frm,
                                cell,
                            );
                        }
                    }
                }
            }
        }
        let msg = MessageWriter::new(MessageTag::SetVariable).put_i32(success as i32);
        self.send(msg.finish());
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        // A VM thread must never stay parked on a vanishing session.
        self.shutdown();
    }
}

/// Integers, then floats (stored as their bit pattern), then booleans.
fn parse_cell(value: &str) -> Option<Cell> {
    if let Ok(int) = value.parse::<i32>() {
        return Some(int);
    }
    if let Ok(float) = value.parse::<f32>() {
        return Some(float.to_bits() as i32);
    }
    match value {
        "true" => Some(1),
        "false" => Some(0),
        _ => None,
    }
}

/// Lowercased final path component; clients and the VM disagree on paths,
/// base names are the common denominator.
pub(crate) fn basename_lower(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_ascii_lowercase()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_state_roundtrip() {
        for byte in [0u8, 1, 2, 3, 4, 5, 6, 0xff] {
            let state = DebugState::from_wire(byte).unwrap();
            assert_eq!(state.to_wire() as u8, byte);
        }
        assert!(DebugState::from_wire(7).is_none());
    }

    #[test]
    fn basenames_are_canonical() {
        assert_eq!(basename_lower("/opt/scripts/Admin.SP"), "admin.sp");
        assert_eq!(basename_lower("C:\\scripts\\Admin.sp"), "admin.sp");
        assert_eq!(basename_lower("plain.sp"), "plain.sp");
    }

    #[test]
    fn parse_cell_accepts_int_float_bool() {
        assert_eq!(parse_cell("42"), Some(42));
        assert_eq!(parse_cell("-7"), Some(-7));
        assert_eq!(parse_cell("1.5"), Some(1.5f32.to_bits() as i32));
        assert_eq!(parse_cell("true"), Some(1));
        assert_eq!(parse_cell("false"), Some(0));
        assert_eq!(parse_cell("banana"), None);
    }
}
