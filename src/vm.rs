//! The seam between the debugger and the embedding script VM.
//!
//! The host process implements [`ExecutionContext`] over its VM bindings and
//! routes the VM's break and error callbacks into
//! [`crate::debugger::hook::HostHooks`]. The debugger only ever touches VM
//! memory through this trait, and only while the VM thread is suspended in
//! the break hook, so implementations need no internal locking beyond
//! whatever the VM itself requires.

/// The native word of the script VM.
pub type Cell = i32;

/// Snapshot passed by the VM on every instrumented instruction.
#[derive(Debug, Clone, Copy)]
pub struct BreakInfo {
    /// Byte offset into the code blob.
    pub cip: u32,
    /// Frame pointer, base for local addressing.
    pub frm: Cell,
}

/// One stack frame as reported by the VM's frame iterator.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub scripted: bool,
    pub function: String,
    pub file: String,
    /// 1-based source line.
    pub line: u32,
}

/// An uncaught runtime error reported by the VM. The frame list is a
/// snapshot taken while the report is live.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub message: String,
    pub frames: Vec<FrameRecord>,
}

/// Memory and metadata access for one running script instance.
///
/// All address arguments are VM-local data addresses (cells relative to the
/// data segment, frame-adjusted by the caller). Accessors return `None` /
/// `false` when the address does not map into the accessible data segment.
pub trait ExecutionContext: Send + Sync {
    /// Stable identity of this context, used for sticky session attachment.
    fn id(&self) -> usize;

    /// Path of the loaded script image.
    fn runtime_filename(&self) -> String;

    /// File names recorded in the runtime's debug info.
    fn runtime_files(&self) -> Vec<String>;

    fn read_cell(&self, addr: Cell) -> Option<Cell>;

    fn write_cell(&self, addr: Cell, value: Cell) -> bool;

    /// Read a zero-terminated string. `None` for a null reference or an
    /// unmapped address.
    fn read_string(&self, addr: Cell) -> Option<String>;

    /// Write a string, truncated to `maxlen` cells including the terminator.
    fn write_string(&self, addr: Cell, maxlen: usize, value: &str) -> bool;

    /// Snapshot of the current call stack, innermost frame first.
    fn frames(&self) -> Vec<FrameRecord>;
}
