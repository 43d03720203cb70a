//! Shared test harness: a synthetic image builder and a scriptable VM
//! context.

#![allow(dead_code)]

use bytes::Bytes;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use pawndbg::debugger::MessageSink;
use pawndbg::vm::{Cell, ExecutionContext, FrameRecord};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const HEADER_SIZE: usize = 24;
const SECTION_ROW_SIZE: usize = 12;
const FILE_MAGIC: u32 = 0x4e57_4150;
pub const VERSION_1_7: u16 = 0x0107;

/// Builds a syntactically valid script image out of named sections.
pub struct ImageBuilder {
    version: u16,
    magic: u32,
    sections: Vec<(String, Vec<u8>)>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        ImageBuilder {
            version: VERSION_1_7,
            magic: FILE_MAGIC,
            sections: Vec::new(),
        }
    }

    pub fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    pub fn magic(mut self, magic: u32) -> Self {
        self.magic = magic;
        self
    }

    pub fn section(mut self, name: &str, data: Vec<u8>) -> Self {
        self.sections.push((name.to_string(), data));
        self
    }

    /// A minimal valid image: `.names`, `.code` and `.data`.
    pub fn minimal() -> Self {
        ImageBuilder::new()
            .section(".names", vec![0])
            .section(".code", code_section(&[0u8; 16]))
            .section(".data", data_section(&[], 0x1000))
    }

    pub fn build(self) -> Vec<u8> {
        self.build_with_compression(false)
    }

    pub fn build_compressed(self) -> Vec<u8> {
        self.build_with_compression(true)
    }

    fn build_with_compression(self, compress: bool) -> Vec<u8> {
        let stringtab = HEADER_SIZE + self.sections.len() * SECTION_ROW_SIZE;

        let mut names = Vec::new();
        let mut name_offsets = Vec::new();
        for (name, _) in &self.sections {
            name_offsets.push(names.len() as u32);
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }
        let dataoffs = stringtab + names.len();

        let mut section_rows = Vec::new();
        let mut data = Vec::new();
        for (i, (_, payload)) in self.sections.iter().enumerate() {
            section_rows.extend_from_slice(&name_offsets[i].to_le_bytes());
            section_rows.extend_from_slice(&((dataoffs + data.len()) as u32).to_le_bytes());
            section_rows.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            data.extend_from_slice(payload);
        }

        let imagesize = (dataoffs + data.len()) as u32;
        let mut image = Vec::new();
        image.extend_from_slice(&self.magic.to_le_bytes());
        image.extend_from_slice(&self.version.to_le_bytes());
        image.push(if compress { 1 } else { 0 });
        // disksize and imagesize are patched below.
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&imagesize.to_le_bytes());
        image.push(self.sections.len() as u8);
        image.extend_from_slice(&(stringtab as u32).to_le_bytes());
        image.extend_from_slice(&(dataoffs as u32).to_le_bytes());
        image.extend_from_slice(&section_rows);
        image.extend_from_slice(&names);

        if compress {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&data).expect("compress section data");
            let compressed = encoder.finish().expect("compress section data");
            image.extend_from_slice(&compressed);
        } else {
            image.extend_from_slice(&data);
        }
        let disksize = image.len() as u32;
        image[7..11].copy_from_slice(&disksize.to_le_bytes());
        image
    }
}

/// `.code` section bytes: header + bytecode blob.
pub fn code_section(code: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(code.len() as u32).to_le_bytes());
    out.push(4); // cellsize
    out.push(13); // codeversion
    out.extend_from_slice(&0u16.to_le_bytes()); // flags
    out.extend_from_slice(&0u32.to_le_bytes()); // main
    out.extend_from_slice(&20u32.to_le_bytes()); // blob offset
    out.extend_from_slice(&0u32.to_le_bytes()); // features
    out.extend_from_slice(code);
    out
}

/// `.data` section bytes.
pub fn data_section(data: &[u8], memsize: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&memsize.to_le_bytes());
    out.extend_from_slice(&12u32.to_le_bytes()); // blob offset
    out.extend_from_slice(data);
    out
}

/// A name table out of zero-terminated strings; returns the section bytes
/// and each string's offset.
pub fn name_table(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
    let mut out = Vec::new();
    let mut offsets = Vec::new();
    for name in names {
        offsets.push(out.len() as u32);
        out.extend_from_slice(name.as_bytes());
        out.push(0);
    }
    (out, offsets)
}

/// `.dbg.info` section bytes.
pub fn dbg_info(num_files: u32, num_lines: u32, num_syms: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&num_files.to_le_bytes());
    out.extend_from_slice(&num_lines.to_le_bytes());
    out.extend_from_slice(&num_syms.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// Rows of `{u32, u32}` pairs (`.dbg.files`, `.dbg.lines`).
pub fn u32_pairs(rows: &[(u32, u32)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (a, b) in rows {
        out.extend_from_slice(&a.to_le_bytes());
        out.extend_from_slice(&b.to_le_bytes());
    }
    out
}

/// One packed legacy debug symbol followed by its dimensions.
pub struct PackedSymbol {
    pub addr: i32,
    pub tagid: i16,
    pub codestart: u32,
    pub codeend: u32,
    pub ident: u8,
    pub vclass: u8,
    pub name: u32,
    pub dims: Vec<u32>,
}

pub fn packed_symbols(symbols: &[PackedSymbol]) -> Vec<u8> {
    let mut out = Vec::new();
    for sym in symbols {
        out.extend_from_slice(&sym.addr.to_le_bytes());
        out.extend_from_slice(&sym.tagid.to_le_bytes());
        out.extend_from_slice(&sym.codestart.to_le_bytes());
        out.extend_from_slice(&sym.codeend.to_le_bytes());
        out.push(sym.ident);
        out.push(sym.vclass);
        out.extend_from_slice(&(sym.dims.len() as u16).to_le_bytes());
        out.extend_from_slice(&sym.name.to_le_bytes());
        for dim in &sym.dims {
            out.extend_from_slice(&0i16.to_le_bytes());
            out.extend_from_slice(&dim.to_le_bytes());
        }
    }
    out
}

/// An RTTI-style table section: 12-byte header plus packed rows.
pub fn rtti_table(row_size: u32, rows: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&12u32.to_le_bytes());
    out.extend_from_slice(&row_size.to_le_bytes());
    out.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    for row in rows {
        assert_eq!(row.len(), row_size as usize);
        out.extend_from_slice(row);
    }
    out
}

/// A `.dbg.locals`/`.dbg.globals` debug-var row.
pub fn debug_var_row(
    address: i32,
    vclass: u8,
    name: u32,
    code_start: u32,
    code_end: u32,
    type_id: u32,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&address.to_le_bytes());
    out.push(vclass);
    out.extend_from_slice(&name.to_le_bytes());
    out.extend_from_slice(&code_start.to_le_bytes());
    out.extend_from_slice(&code_end.to_le_bytes());
    out.extend_from_slice(&type_id.to_le_bytes());
    out
}

// ---------------------------------------------------------------------
// VM context double

static NEXT_CTX_ID: AtomicUsize = AtomicUsize::new(1);

/// In-memory stand-in for a running script instance. Addresses are byte
/// offsets into one flat memory buffer.
pub struct MockVm {
    id: usize,
    pub filename: String,
    pub files: Vec<String>,
    pub memory: Mutex<Vec<u8>>,
    pub frames: Mutex<Vec<FrameRecord>>,
}

impl MockVm {
    pub fn new(filename: &str, files: &[&str], memory_size: usize) -> Self {
        MockVm {
            id: NEXT_CTX_ID.fetch_add(1, Ordering::Relaxed),
            filename: filename.to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
            memory: Mutex::new(vec![0u8; memory_size]),
            frames: Mutex::new(Vec::new()),
        }
    }

    pub fn poke_cell(&self, addr: i32, value: Cell) {
        let mut memory = self.memory.lock().unwrap();
        let addr = addr as usize;
        memory[addr..addr + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn poke_string(&self, addr: i32, value: &str) {
        let mut memory = self.memory.lock().unwrap();
        let addr = addr as usize;
        memory[addr..addr + value.len()].copy_from_slice(value.as_bytes());
        memory[addr + value.len()] = 0;
    }

    pub fn set_frames(&self, frames: Vec<FrameRecord>) {
        *self.frames.lock().unwrap() = frames;
    }
}

/// A scripted frame record.
pub fn scripted_frame(function: &str, file: &str, line: u32) -> FrameRecord {
    FrameRecord {
        scripted: true,
        function: function.to_string(),
        file: file.to_string(),
        line,
    }
}

impl ExecutionContext for MockVm {
    fn id(&self) -> usize {
        self.id
    }

    fn runtime_filename(&self) -> String {
        self.filename.clone()
    }

    fn runtime_files(&self) -> Vec<String> {
        self.files.clone()
    }

    fn read_cell(&self, addr: Cell) -> Option<Cell> {
        if addr < 0 {
            return None;
        }
        let memory = self.memory.lock().unwrap();
        let addr = addr as usize;
        if addr + 4 > memory.len() {
            return None;
        }
        Some(Cell::from_le_bytes([
            memory[addr],
            memory[addr + 1],
            memory[addr + 2],
            memory[addr + 3],
        ]))
    }

    fn write_cell(&self, addr: Cell, value: Cell) -> bool {
        if addr < 0 {
            return false;
        }
        let mut memory = self.memory.lock().unwrap();
        let addr = addr as usize;
        if addr + 4 > memory.len() {
            return false;
        }
        memory[addr..addr + 4].copy_from_slice(&value.to_le_bytes());
        true
    }

    fn read_string(&self, addr: Cell) -> Option<String> {
        if addr < 0 {
            return None;
        }
        let memory = self.memory.lock().unwrap();
        let addr = addr as usize;
        if addr >= memory.len() {
            return None;
        }
        let nul = memory[addr..].iter().position(|&b| b == 0)?;
        String::from_utf8(memory[addr..addr + nul].to_vec()).ok()
    }

    fn write_string(&self, addr: Cell, maxlen: usize, value: &str) -> bool {
        if addr < 0 || maxlen == 0 {
            return false;
        }
        let mut memory = self.memory.lock().unwrap();
        let addr = addr as usize;
        let len = value.len().min(maxlen - 1);
        if addr + len + 1 > memory.len() {
            return false;
        }
        memory[addr..addr + len].copy_from_slice(&value.as_bytes()[..len]);
        memory[addr + len] = 0;
        true
    }

    fn frames(&self) -> Vec<FrameRecord> {
        self.frames.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------
// wire helpers

/// Message sink that captures outbound frames for assertions.
#[derive(Clone, Default)]
pub struct CaptureSink {
    frames: Arc<Mutex<Vec<Bytes>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().unwrap().clone()
    }

    /// Frames with the given tag byte.
    pub fn frames_with_tag(&self, tag: u8) -> Vec<Bytes> {
        self.frames()
            .into_iter()
            .filter(|frame| frame.len() > 4 && frame[4] == tag)
            .collect()
    }

    /// Block until at least one frame with the tag arrived.
    pub fn wait_for_tag(&self, tag: u8, timeout: std::time::Duration) -> bool {
        self.wait_for_tag_count(tag, 1, timeout)
    }

    /// Block until at least `count` frames with the tag arrived.
    pub fn wait_for_tag_count(&self, tag: u8, count: usize, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.frames_with_tag(tag).len() >= count {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        false
    }
}

impl MessageSink for CaptureSink {
    fn send(&mut self, frame: Bytes) -> std::io::Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

/// Strip the length prefix and tag off a built frame, leaving the payload
/// for `DebugSession::dispatch`.
pub fn payload_of(frame: Bytes) -> Bytes {
    frame.slice(5..)
}

/// Write image bytes to a unique temp file and return its path.
pub fn write_temp_image(tag: &str, bytes: &[u8]) -> String {
    let path = std::env::temp_dir().join(format!(
        "pawndbg-test-{tag}-{}.smx",
        std::process::id()
    ));
    std::fs::write(&path, bytes).expect("write temp image");
    path.to_string_lossy().into_owned()
}
