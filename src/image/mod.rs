//! Parser and runtime-type inspector for compiled script images.
//!
//! An image is a sectioned container: a small header, a section table, and
//! named sections holding bytecode, data, export tables and debug/RTTI
//! metadata. [`ScriptImage::open`] validates the whole container up front;
//! afterwards every accessor is a cheap bounds-checked read, so images can be
//! shared read-only between debugger sessions.

pub mod error;
pub mod format;
pub mod rtti;
pub mod symbols;

pub use error::ImageError;
pub use symbols::{Symbol, SymbolIterator, SymbolScope};

use crate::image::format::*;
use crate::image::rtti::{RttiData, TypeTableCounts};
use flate2::read::ZlibDecoder;
use log::debug;
use std::io::Read;
use std::marker::PhantomData;
use std::path::Path;

/// A section table entry with its name resolved.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub dataoffs: u32,
    pub size: u32,
}

/// Typed view over a fixed-row-size section.
#[derive(Debug, Clone, Copy)]
struct Table<T> {
    offset: usize,
    count: usize,
    _row: PhantomData<T>,
}

impl<T: Row> Table<T> {
    fn empty() -> Self {
        Table {
            offset: 0,
            count: 0,
            _row: PhantomData,
        }
    }

    fn new(offset: usize, count: usize) -> Self {
        Table {
            offset,
            count,
            _row: PhantomData,
        }
    }

    fn len(&self) -> usize {
        self.count
    }

    fn get(&self, bytes: &[u8], index: usize) -> Option<T> {
        if index >= self.count {
            return None;
        }
        let start = self.offset + index * T::SIZE;
        Some(T::parse(&bytes[start..start + T::SIZE]))
    }
}

/// An RTTI-style table: a `{header_size, row_size, row_count}` header
/// followed by opaque rows.
#[derive(Debug, Clone, Copy)]
struct RttiTable {
    offset: usize,
    header: RttiTableHeader,
}

impl RttiTable {
    fn row_count(&self) -> u32 {
        self.header.row_count
    }

    fn row<T: Row>(&self, bytes: &[u8], index: u32) -> Option<T> {
        if index >= self.header.row_count {
            return None;
        }
        let start = self.offset
            + self.header.header_size as usize
            + self.header.row_size as usize * index as usize;
        Some(T::parse(&bytes[start..start + T::SIZE]))
    }
}

#[derive(Debug, Clone, Copy)]
struct LegacySymbols {
    offset: usize,
    size: usize,
    packed: bool,
}

/// A validated, possibly-decompressed script image.
pub struct ScriptImage {
    bytes: Vec<u8>,
    version: u16,
    sections: Vec<Section>,

    names_offset: usize,
    names_size: usize,
    debug_names_offset: usize,
    debug_names_size: usize,

    code: CodeHeader,
    code_blob: (usize, usize),
    data: DataHeader,
    data_blob: (usize, usize),

    publics: Table<PublicRow>,
    natives: Table<NativeRow>,
    pubvars: Table<PubvarRow>,
    tags: Table<TagRow>,

    debug_info: Option<DebugInfoHeader>,
    debug_files: Table<DebugFileRow>,
    debug_lines: Table<DebugLineRow>,
    legacy_symbols: Option<LegacySymbols>,

    rtti_data: Option<RttiData>,
    rtti_methods: Option<RttiTable>,
    rtti_natives: Option<RttiTable>,
    rtti_fields: Option<RttiTable>,
    rtti_classdefs: Option<RttiTable>,
    rtti_enums: Option<RttiTable>,
    rtti_enumstructs: Option<RttiTable>,
    rtti_es_fields: Option<RttiTable>,
    dbg_globals: Option<RttiTable>,
    dbg_locals: Option<RttiTable>,
    dbg_methods: Option<RttiTable>,
}

impl ScriptImage {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let bytes = std::fs::read(path.as_ref())
            .map_err(|_| ImageError::BadHeader("unreadable file"))?;
        Self::open(bytes)
    }

    /// Validate a raw container and build the typed views. This is the only
    /// place that reads unvalidated offsets.
    pub fn open(raw: Vec<u8>) -> Result<Self, ImageError> {
        let hdr = FileHeader::parse(&raw).ok_or(ImageError::BadHeader("truncated header"))?;
        if hdr.magic != FILE_MAGIC {
            return Err(ImageError::BadHeader("bad magic"));
        }
        match hdr.version {
            VERSION_1_0 | VERSION_1_1 | VERSION_1_7 => {}
            other => return Err(ImageError::UnsupportedVersion(other)),
        }

        let bytes = match hdr.compression {
            COMPRESSION_NONE => raw,
            COMPRESSION_GZ => inflate_image(&hdr, &raw)?,
            _ => return Err(ImageError::BadHeader("unknown compression type")),
        };

        if hdr.stringtab as usize >= bytes.len() {
            return Err(ImageError::BadHeader("invalid string table"));
        }

        let section_table_end = HEADER_SIZE + hdr.sections as usize * SECTION_ROW_SIZE;
        if section_table_end > bytes.len() {
            return Err(ImageError::BadHeader("invalid section table"));
        }

        let stringtab = hdr.stringtab as usize;
        let dataoffs = hdr.dataoffs as usize;
        let name_space = dataoffs.saturating_sub(stringtab);
        let mut sections = Vec::with_capacity(hdr.sections as usize);
        let mut last_nameoffs = 0usize;
        for i in 0..hdr.sections as usize {
            let row = SectionRow::parse(&bytes[HEADER_SIZE + i * SECTION_ROW_SIZE..]);
            if row.nameoffs as usize >= name_space {
                return Err(ImageError::BadHeader("invalid section name"));
            }
            last_nameoffs = last_nameoffs.max(row.nameoffs as usize);
            let name_start = stringtab + row.nameoffs as usize;
            let name_end = dataoffs.min(bytes.len());
            let name_bytes = &bytes[name_start..name_end];
            let nul = name_bytes
                .iter()
                .position(|&b| b == 0)
                .ok_or(ImageError::BadHeader("malformed section names header"))?;
            let name = std::str::from_utf8(&name_bytes[..nul])
                .map_err(|_| ImageError::BadHeader("malformed section names header"))?
                .to_string();
            sections.push(Section {
                name,
                dataoffs: row.dataoffs,
                size: row.size,
            });
        }

        // The names header region must be terminated even past the last
        // resolved name.
        if !bytes[stringtab + last_nameoffs..dataoffs.min(bytes.len())]
            .iter()
            .any(|&b| b == 0)
        {
            return Err(ImageError::BadHeader("malformed section names header"));
        }

        let mut image = ScriptImage {
            bytes,
            version: hdr.version,
            sections,
            names_offset: 0,
            names_size: 0,
            debug_names_offset: 0,
            debug_names_size: 0,
            code: CodeHeader {
                codesize: 0,
                cellsize: 0,
                codeversion: 0,
                flags: 0,
                main: 0,
                code: 0,
                features: 0,
            },
            code_blob: (0, 0),
            data: DataHeader {
                datasize: 0,
                memsize: 0,
                data: 0,
            },
            data_blob: (0, 0),
            publics: Table::empty(),
            natives: Table::empty(),
            pubvars: Table::empty(),
            tags: Table::empty(),
            debug_info: None,
            debug_files: Table::empty(),
            debug_lines: Table::empty(),
            legacy_symbols: None,
            rtti_data: None,
            rtti_methods: None,
            rtti_natives: None,
            rtti_fields: None,
            rtti_classdefs: None,
            rtti_enums: None,
            rtti_enumstructs: None,
            rtti_es_fields: None,
            dbg_globals: None,
            dbg_locals: None,
            dbg_methods: None,
        };

        image.validate_names()?;
        image.validate_code()?;
        image.validate_data()?;
        image.validate_publics()?;
        image.validate_pubvars()?;
        image.validate_natives()?;
        image.validate_rtti()?;
        image.validate_debug_info()?;
        image.validate_tags()?;

        debug!(target: "image",
            "image validated: {} sections, {} publics, {} natives, {} debug files",
            image.sections.len(),
            image.publics.len(),
            image.natives.len(),
            image.debug_files.len());

        Ok(image)
    }

    fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    fn section_in_bounds(&self, section: &Section) -> bool {
        let dataoffs = section.dataoffs as usize;
        dataoffs < self.bytes.len() && section.size as usize <= self.bytes.len() - dataoffs
    }

    fn validate_names(&mut self) -> Result<(), ImageError> {
        let section = self
            .find_section(SECTION_NAMES)
            .ok_or(ImageError::InvalidSection(SECTION_NAMES))?;
        if !self.section_in_bounds(section) {
            return Err(ImageError::InvalidSection(SECTION_NAMES));
        }
        let offset = section.dataoffs as usize;
        let size = section.size as usize;
        // The name table must be empty or end in a terminator.
        if size != 0 && self.bytes[offset + size - 1] != 0 {
            return Err(ImageError::InvalidSection(SECTION_NAMES));
        }
        self.names_offset = offset;
        self.names_size = size;
        self.debug_names_offset = offset;
        self.debug_names_size = size;
        Ok(())
    }

    fn validate_code(&mut self) -> Result<(), ImageError> {
        let section = self
            .find_section(SECTION_CODE)
            .ok_or(ImageError::InvalidSection(SECTION_CODE))?
            .clone();
        if !self.section_in_bounds(&section) || (section.size as usize) < CodeHeader::SIZE {
            return Err(ImageError::InvalidSection(SECTION_CODE));
        }
        let code = CodeHeader::parse(&self.bytes[section.dataoffs as usize..]);
        if code.codeversion < CODE_VERSION_MINIMUM || code.codeversion > CODE_VERSION_CURRENT {
            return Err(ImageError::UnsupportedVersion(code.codeversion as u16));
        }
        if code.cellsize as usize != CELL_SIZE {
            return Err(ImageError::InvalidSection(SECTION_CODE));
        }
        if code.flags & !CODEFLAG_DEBUG != 0 {
            return Err(ImageError::InvalidSection(SECTION_CODE));
        }
        if code.features & !FEATURE_DIRECT_ARRAYS != 0 {
            return Err(ImageError::UnsupportedVersion(code.codeversion as u16));
        }
        if code.code > section.size || code.codesize > section.size - code.code {
            return Err(ImageError::InvalidSection(SECTION_CODE));
        }
        self.code_blob = (
            section.dataoffs as usize + code.code as usize,
            code.codesize as usize,
        );
        self.code = code;
        Ok(())
    }

    fn validate_data(&mut self) -> Result<(), ImageError> {
        let section = self
            .find_section(SECTION_DATA)
            .ok_or(ImageError::InvalidSection(SECTION_DATA))?
            .clone();
        if !self.section_in_bounds(&section) || (section.size as usize) < DataHeader::SIZE {
            return Err(ImageError::InvalidSection(SECTION_DATA));
        }
        let data = DataHeader::parse(&self.bytes[section.dataoffs as usize..]);
        if data.data > section.size || data.datasize > section.size - data.data {
            return Err(ImageError::InvalidSection(SECTION_DATA));
        }
        self.data_blob = (
            section.dataoffs as usize + data.data as usize,
            data.datasize as usize,
        );
        self.data = data;
        Ok(())
    }

    /// Validate a plain row table: in bounds, size a multiple of the row
    /// size, every name offset inside the name table.
    fn validate_row_table<T: Row>(
        &self,
        name: &'static str,
        name_of: impl Fn(&T) -> u32,
    ) -> Result<Table<T>, ImageError> {
        let section = match self.find_section(name) {
            Some(s) => s,
            None => return Ok(Table::empty()),
        };
        if !self.section_in_bounds(section) || section.size as usize % T::SIZE != 0 {
            return Err(ImageError::InvalidSection(name));
        }
        let table = Table::new(section.dataoffs as usize, section.size as usize / T::SIZE);
        for i in 0..table.len() {
            let row = table.get(&self.bytes, i).expect("index in range");
            if name_of(&row) as usize >= self.names_size {
                return Err(ImageError::InvalidSection(name));
            }
        }
        Ok(table)
    }

    fn validate_publics(&mut self) -> Result<(), ImageError> {
        self.publics = self.validate_row_table(SECTION_PUBLICS, |row: &PublicRow| row.name)?;
        Ok(())
    }

    fn validate_pubvars(&mut self) -> Result<(), ImageError> {
        self.pubvars = self.validate_row_table(SECTION_PUBVARS, |row: &PubvarRow| row.name)?;
        Ok(())
    }

    fn validate_natives(&mut self) -> Result<(), ImageError> {
        self.natives = self.validate_row_table(SECTION_NATIVES, |row: &NativeRow| row.name)?;
        Ok(())
    }

    fn validate_tags(&mut self) -> Result<(), ImageError> {
        self.tags = self.validate_row_table(SECTION_TAGS, |row: &TagRow| row.name)?;
        Ok(())
    }

    /// Load an RTTI-style table and check the header equation
    /// `header_size + row_size * row_count == section.size` with overflow-safe
    /// arithmetic, plus a minimum row size for the typed view.
    fn load_rtti_table(
        &self,
        name: &'static str,
        min_row_size: usize,
    ) -> Result<Option<RttiTable>, ImageError> {
        let section = match self.find_section(name) {
            Some(s) => s,
            None => return Ok(None),
        };
        if !self.section_in_bounds(section) {
            return Err(ImageError::InvalidRtti {
                table: name,
                reason: "section out of bounds",
            });
        }
        if (section.size as usize) < RttiTableHeader::SIZE {
            return Err(ImageError::InvalidRtti {
                table: name,
                reason: "section too small",
            });
        }
        let header = RttiTableHeader::parse(&self.bytes[section.dataoffs as usize..]);
        if section.size < header.header_size {
            return Err(ImageError::InvalidRtti {
                table: name,
                reason: "bad header size",
            });
        }
        let table_size = header
            .row_size
            .checked_mul(header.row_count)
            .and_then(|rows| rows.checked_add(header.header_size))
            .ok_or(ImageError::InvalidRtti {
                table: name,
                reason: "row arithmetic overflow",
            })?;
        if table_size != section.size {
            return Err(ImageError::InvalidRtti {
                table: name,
                reason: "size mismatch",
            });
        }
        if header.row_count > 0 && (header.row_size as usize) < min_row_size {
            return Err(ImageError::InvalidRtti {
                table: name,
                reason: "row size too small",
            });
        }
        Ok(Some(RttiTable {
            offset: section.dataoffs as usize,
            header,
        }))
    }

    fn validate_rtti(&mut self) -> Result<(), ImageError> {
        let section = match self.find_section(SECTION_RTTI_DATA) {
            Some(s) => s.clone(),
            None => return Ok(()),
        };
        if !self.section_in_bounds(&section) {
            return Err(ImageError::InvalidSection(SECTION_RTTI_DATA));
        }
        let start = section.dataoffs as usize;
        self.rtti_data = Some(RttiData::new(
            self.bytes[start..start + section.size as usize].to_vec(),
        ));

        // Method and native tables are mandatory once RTTI data exists.
        self.rtti_methods = self.load_rtti_table(SECTION_RTTI_METHODS, RttiMethodRow::SIZE)?;
        if self.rtti_methods.is_none() {
            return Err(ImageError::InvalidRtti {
                table: SECTION_RTTI_METHODS,
                reason: "missing",
            });
        }
        self.rtti_natives = self.load_rtti_table(SECTION_RTTI_NATIVES, RttiNativeRow::SIZE)?;
        if self.rtti_natives.is_none() {
            return Err(ImageError::InvalidRtti {
                table: SECTION_RTTI_NATIVES,
                reason: "missing",
            });
        }

        self.rtti_enums = self.load_rtti_table(SECTION_RTTI_ENUMS, RttiEnumRow::SIZE)?;
        self.validate_rtti_enums()?;

        self.rtti_es_fields =
            self.load_rtti_table(SECTION_RTTI_ENUMSTRUCT_FIELDS, RttiEsFieldRow::SIZE)?;
        self.rtti_enumstructs =
            self.load_rtti_table(SECTION_RTTI_ENUMSTRUCTS, RttiEnumStructRow::SIZE)?;
        self.validate_rtti_enumstructs()?;

        self.validate_rtti_methods()?;

        self.rtti_fields = self.load_rtti_table(SECTION_RTTI_FIELDS, RttiFieldRow::SIZE)?;
        self.rtti_classdefs = self.load_rtti_table(SECTION_RTTI_CLASSDEFS, RttiClassdefRow::SIZE)?;
        self.validate_rtti_classdefs()?;

        Ok(())
    }

    fn validate_rtti_methods(&self) -> Result<(), ImageError> {
        let Some(methods) = &self.rtti_methods else {
            return Ok(());
        };
        let rtti_size = self.rtti_data.as_ref().map(|d| d.size()).unwrap_or(0);
        for i in 0..methods.row_count() {
            let method: RttiMethodRow = methods.row(&self.bytes, i).expect("index in range");
            if method.name as usize >= self.names_size {
                return Err(ImageError::InvalidRtti {
                    table: SECTION_RTTI_METHODS,
                    reason: "invalid method name",
                });
            }
            if method.signature as usize >= rtti_size {
                return Err(ImageError::InvalidRtti {
                    table: SECTION_RTTI_METHODS,
                    reason: "invalid signature offset",
                });
            }
            if method.pcode_start > method.pcode_end
                || method.pcode_end as usize > self.code_blob.1
            {
                return Err(ImageError::InvalidRtti {
                    table: SECTION_RTTI_METHODS,
                    reason: "invalid code range",
                });
            }
        }
        Ok(())
    }

    fn validate_rtti_enums(&self) -> Result<(), ImageError> {
        let Some(enums) = &self.rtti_enums else {
            return Ok(());
        };
        for i in 0..enums.row_count() {
            let row: RttiEnumRow = enums.row(&self.bytes, i).expect("index in range");
            if row.name as usize >= self.names_size {
                return Err(ImageError::InvalidRtti {
                    table: SECTION_RTTI_ENUMS,
                    reason: "invalid enum name",
                });
            }
        }
        Ok(())
    }

    fn validate_rtti_enumstructs(&self) -> Result<(), ImageError> {
        let Some(enumstructs) = &self.rtti_enumstructs else {
            return Ok(());
        };
        let Some(fields) = &self.rtti_es_fields else {
            return Err(ImageError::InvalidRtti {
                table: SECTION_RTTI_ENUMSTRUCT_FIELDS,
                reason: "missing",
            });
        };
        let counts = self.type_table_counts();
        for i in 0..enumstructs.row_count() {
            let row: RttiEnumStructRow = enumstructs.row(&self.bytes, i).expect("index in range");
            if row.name as usize >= self.names_size {
                return Err(ImageError::InvalidRtti {
                    table: SECTION_RTTI_ENUMSTRUCTS,
                    reason: "invalid enum struct name",
                });
            }
            let stopat = match enumstructs.row::<RttiEnumStructRow>(&self.bytes, i + 1) {
                Some(next) => next.first_field,
                None => fields.row_count(),
            };
            if row.first_field >= stopat {
                return Err(ImageError::InvalidRtti {
                    table: SECTION_RTTI_ENUMSTRUCTS,
                    reason: "invalid fields boundary",
                });
            }
            for j in row.first_field..stopat {
                self.validate_enum_struct_field(&row, j, &counts)?;
            }
        }
        Ok(())
    }

    fn validate_enum_struct_field(
        &self,
        enumstruct: &RttiEnumStructRow,
        index: u32,
        counts: &TypeTableCounts,
    ) -> Result<(), ImageError> {
        let fields = self.rtti_es_fields.as_ref().expect("checked by caller");
        let field: RttiEsFieldRow =
            fields
                .row(&self.bytes, index)
                .ok_or(ImageError::InvalidRtti {
                    table: SECTION_RTTI_ENUMSTRUCT_FIELDS,
                    reason: "invalid field index",
                })?;
        if field.name as usize >= self.names_size {
            return Err(ImageError::InvalidRtti {
                table: SECTION_RTTI_ENUMSTRUCT_FIELDS,
                reason: "invalid field name",
            });
        }
        if field.offset >= enumstruct.size * CELL_SIZE as u32 {
            return Err(ImageError::InvalidRtti {
                table: SECTION_RTTI_ENUMSTRUCT_FIELDS,
                reason: "invalid field offset",
            });
        }
        let valid_type = self
            .rtti_data
            .as_ref()
            .map(|d| d.validate_type(field.type_id, counts))
            .unwrap_or(false);
        if !valid_type {
            return Err(ImageError::InvalidRtti {
                table: SECTION_RTTI_ENUMSTRUCT_FIELDS,
                reason: "invalid field type",
            });
        }
        Ok(())
    }

    fn validate_rtti_classdefs(&self) -> Result<(), ImageError> {
        let Some(classdefs) = &self.rtti_classdefs else {
            return Ok(());
        };
        let Some(fields) = &self.rtti_fields else {
            return Err(ImageError::InvalidRtti {
                table: SECTION_RTTI_FIELDS,
                reason: "missing",
            });
        };
        let counts = self.type_table_counts();
        for i in 0..classdefs.row_count() {
            let row: RttiClassdefRow = classdefs.row(&self.bytes, i).expect("index in range");
            if row.name as usize >= self.names_size {
                return Err(ImageError::InvalidRtti {
                    table: SECTION_RTTI_CLASSDEFS,
                    reason: "invalid classdef name",
                });
            }
            let stopat = match classdefs.row::<RttiClassdefRow>(&self.bytes, i + 1) {
                Some(next) => next.first_field,
                None => fields.row_count(),
            };
            if row.first_field >= stopat {
                return Err(ImageError::InvalidRtti {
                    table: SECTION_RTTI_CLASSDEFS,
                    reason: "invalid fields boundary",
                });
            }
            for j in row.first_field..stopat {
                let field: RttiFieldRow =
                    fields
                        .row(&self.bytes, j)
                        .ok_or(ImageError::InvalidRtti {
                            table: SECTION_RTTI_FIELDS,
                            reason: "invalid field index",
                        })?;
                if field.name as usize >= self.names_size {
                    return Err(ImageError::InvalidRtti {
                        table: SECTION_RTTI_FIELDS,
                        reason: "invalid field name",
                    });
                }
                let valid_type = self
                    .rtti_data
                    .as_ref()
                    .map(|d| d.validate_type(field.type_id, &counts))
                    .unwrap_or(false);
                if !valid_type {
                    return Err(ImageError::InvalidRtti {
                        table: SECTION_RTTI_FIELDS,
                        reason: "invalid field type",
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_debug_info(&mut self) -> Result<(), ImageError> {
        let section = match self.find_section(SECTION_DBG_INFO) {
            Some(s) => s.clone(),
            None => return Ok(()),
        };
        if !self.section_in_bounds(&section) || (section.size as usize) < DebugInfoHeader::SIZE {
            return Err(ImageError::InvalidSection(SECTION_DBG_INFO));
        }
        let info = DebugInfoHeader::parse(&self.bytes[section.dataoffs as usize..]);

        // Pre-RTTI images used a separate debug string table; newer ones
        // reuse `.names`.
        if let Some(strings) = self.find_section(SECTION_DBG_STRINGS).cloned() {
            if !self.section_in_bounds(&strings) {
                return Err(ImageError::InvalidSection(SECTION_DBG_STRINGS));
            }
            let offset = strings.dataoffs as usize;
            let size = strings.size as usize;
            if size != 0 && self.bytes[offset + size - 1] != 0 {
                return Err(ImageError::InvalidSection(SECTION_DBG_STRINGS));
            }
            self.debug_names_offset = offset;
            self.debug_names_size = size;
        }

        let files = self
            .find_section(SECTION_DBG_FILES)
            .cloned()
            .ok_or(ImageError::InvalidSection(SECTION_DBG_FILES))?;
        if !self.section_in_bounds(&files)
            || (files.size as usize) < DebugFileRow::SIZE * info.num_files as usize
        {
            return Err(ImageError::InvalidSection(SECTION_DBG_FILES));
        }
        self.debug_files = Table::new(files.dataoffs as usize, info.num_files as usize);

        let lines = self
            .find_section(SECTION_DBG_LINES)
            .cloned()
            .ok_or(ImageError::InvalidSection(SECTION_DBG_LINES))?;
        if !self.section_in_bounds(&lines)
            || (lines.size as usize) < DebugLineRow::SIZE * info.num_lines as usize
        {
            return Err(ImageError::InvalidSection(SECTION_DBG_LINES));
        }
        self.debug_lines = Table::new(lines.dataoffs as usize, info.num_lines as usize);

        if let Some(symbols) = self.find_section(SECTION_DBG_SYMBOLS).cloned() {
            if !self.section_in_bounds(&symbols) {
                return Err(ImageError::InvalidSection(SECTION_DBG_SYMBOLS));
            }
            // 1.0-era compilers without a .dbg.natives section emitted the
            // naturally-aligned symbol layout.
            let packed =
                !(self.version == VERSION_1_0 && self.find_section(SECTION_DBG_NATIVES).is_none());
            self.legacy_symbols = Some(LegacySymbols {
                offset: symbols.dataoffs as usize,
                size: symbols.size as usize,
                packed,
            });
        } else {
            self.dbg_globals = self.load_rtti_table(SECTION_DBG_GLOBALS, DebugVarRow::SIZE)?;
            self.dbg_locals = self.load_rtti_table(SECTION_DBG_LOCALS, DebugVarRow::SIZE)?;
            self.dbg_methods = self.load_rtti_table(SECTION_DBG_METHODS, DebugMethodRow::SIZE)?;
        }

        self.debug_info = Some(info);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // accessors

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn image_size(&self) -> usize {
        self.bytes.len()
    }

    /// Total memory the VM reserves for this script (data + heap + stack).
    pub fn heap_size(&self) -> u32 {
        self.data.memsize
    }

    pub fn code_header(&self) -> &CodeHeader {
        &self.code
    }

    pub fn code_bytes(&self) -> &[u8] {
        &self.bytes[self.code_blob.0..self.code_blob.0 + self.code_blob.1]
    }

    pub fn data_header(&self) -> &DataHeader {
        &self.data
    }

    pub fn data_bytes(&self) -> &[u8] {
        &self.bytes[self.data_blob.0..self.data_blob.0 + self.data_blob.1]
    }

    pub fn rtti_data(&self) -> Option<&RttiData> {
        self.rtti_data.as_ref()
    }

    pub(crate) fn type_table_counts(&self) -> TypeTableCounts {
        TypeTableCounts {
            enums: self.rtti_enums.map(|t| t.row_count()).unwrap_or(0),
            typedefs: 0,
            typesets: 0,
            classdefs: self.rtti_classdefs.map(|t| t.row_count()).unwrap_or(0),
            enum_structs: self.rtti_enumstructs.map(|t| t.row_count()).unwrap_or(0),
        }
    }

    /// Resolve a zero-terminated string in the `.names` table.
    pub fn name_at(&self, offset: u32) -> Option<&str> {
        str_at(
            &self.bytes,
            self.names_offset,
            self.names_size,
            offset as usize,
        )
    }

    /// Resolve a zero-terminated string in the debug name table.
    pub fn debug_name(&self, offset: u32) -> Option<&str> {
        str_at(
            &self.bytes,
            self.debug_names_offset,
            self.debug_names_size,
            offset as usize,
        )
    }

    pub fn num_publics(&self) -> usize {
        self.publics.len()
    }

    pub fn public(&self, index: usize) -> Option<(u32, &str)> {
        let row = self.publics.get(&self.bytes, index)?;
        Some((row.address, self.name_at(row.name)?))
    }

    pub fn find_public(&self, name: &str) -> Option<usize> {
        self.binary_search_names(self.publics.len(), name, |i| {
            self.publics
                .get(&self.bytes, i)
                .and_then(|row| self.name_at(row.name))
        })
    }

    pub fn num_pubvars(&self) -> usize {
        self.pubvars.len()
    }

    pub fn pubvar(&self, index: usize) -> Option<(u32, &str)> {
        let row = self.pubvars.get(&self.bytes, index)?;
        Some((row.address, self.name_at(row.name)?))
    }

    pub fn find_pubvar(&self, name: &str) -> Option<usize> {
        self.binary_search_names(self.pubvars.len(), name, |i| {
            self.pubvars
                .get(&self.bytes, i)
                .and_then(|row| self.name_at(row.name))
        })
    }

    pub fn num_natives(&self) -> usize {
        self.natives.len()
    }

    pub fn native(&self, index: usize) -> Option<&str> {
        let row = self.natives.get(&self.bytes, index)?;
        self.name_at(row.name)
    }

    /// The native table is unsorted, so lookup is linear.
    pub fn find_native(&self, name: &str) -> Option<usize> {
        (0..self.natives.len()).find(|&i| self.native(i) == Some(name))
    }

    /// Publics and pubvars are emitted sorted by name.
    fn binary_search_names<'a>(
        &self,
        len: usize,
        name: &str,
        name_of: impl Fn(usize) -> Option<&'a str>,
    ) -> Option<usize> {
        let mut low = 0isize;
        let mut high = len as isize - 1;
        while low <= high {
            let mid = ((low + high) / 2) as usize;
            let candidate = name_of(mid)?;
            match candidate.cmp(name) {
                std::cmp::Ordering::Equal => return Some(mid),
                std::cmp::Ordering::Less => low = mid as isize + 1,
                std::cmp::Ordering::Greater => high = mid as isize - 1,
            }
        }
        None
    }

    pub fn tag_name(&self, tag_id: u32) -> Option<&str> {
        for i in 0..self.tags.len() {
            let row = self.tags.get(&self.bytes, i)?;
            if row.tag_id == tag_id {
                return self.name_at(row.name);
            }
        }
        None
    }

    /// Counters of the `.dbg.info` section, when debug info is present.
    pub fn debug_info(&self) -> Option<&DebugInfoHeader> {
        self.debug_info.as_ref()
    }

    pub fn file_count(&self) -> u32 {
        self.debug_files.len() as u32
    }

    pub fn file_name(&self, index: u32) -> Option<&str> {
        let row = self.debug_files.get(&self.bytes, index as usize)?;
        self.debug_name(row.name)
    }

    // ---------------------------------------------------------------------
    // lookup services

    /// File whose address range covers `addr`: the last entry at or below it.
    pub fn lookup_file(&self, addr: u32) -> Option<&str> {
        let index = self.lower_bound(self.debug_files.len(), addr, |i| {
            self.debug_files.get(&self.bytes, i).map(|row| row.addr)
        })?;
        let row = self.debug_files.get(&self.bytes, index)?;
        self.debug_name(row.name)
    }

    /// Source line covering `addr`. The instruction pointer precedes the
    /// line record, hence the +1.
    pub fn lookup_line(&self, addr: u32) -> Option<u32> {
        let index = self.lower_bound(self.debug_lines.len(), addr, |i| {
            self.debug_lines.get(&self.bytes, i).map(|row| row.addr)
        })?;
        let row = self.debug_lines.get(&self.bytes, index)?;
        Some(row.line + 1)
    }

    /// Largest index whose addr is <= the probe, or None if even the first
    /// entry is above it.
    fn lower_bound(
        &self,
        len: usize,
        addr: u32,
        addr_of: impl Fn(usize) -> Option<u32>,
    ) -> Option<usize> {
        let mut high = len as isize;
        let mut low = -1isize;
        while high - low > 1 {
            let mid = ((low + high) / 2) as usize;
            if addr_of(mid)? <= addr {
                low = mid as isize;
            } else {
                high = mid as isize;
            }
        }
        if low < 0 {
            None
        } else {
            Some(low as usize)
        }
    }

    /// Function containing `addr`, from legacy symbols or RTTI methods.
    pub fn lookup_function(&self, addr: u32) -> Option<&str> {
        if self.legacy_symbols.is_some() {
            for sym in self.symbol_iterator(SymbolScope::Local) {
                if sym.ident() == symbols::IDENT_FUNCTION
                    && sym.codestart() <= addr
                    && sym.codeend() > addr
                {
                    return self.debug_name(sym.name_offset());
                }
            }
            return None;
        }
        let methods = self.rtti_methods.as_ref()?;
        for i in 0..methods.row_count() {
            let method: RttiMethodRow = methods.row(&self.bytes, i)?;
            if method.pcode_start <= addr && method.pcode_end > addr {
                return self.name_at(method.name);
            }
        }
        None
    }

    /// Address of the first breakable instruction of `function` in `file`.
    pub fn function_address(&self, function: &str, file: &str) -> Option<u32> {
        let mut fnaddr = None;
        if self.legacy_symbols.is_some() {
            for sym in self.symbol_iterator(SymbolScope::Local) {
                if sym.ident() != symbols::IDENT_FUNCTION {
                    continue;
                }
                if self.debug_name(sym.name_offset()) != Some(function) {
                    continue;
                }
                let addr = sym.addr() as u32;
                if self.lookup_file(addr) == Some(file) {
                    fnaddr = Some(addr);
                    break;
                }
            }
        } else if let Some(methods) = &self.rtti_methods {
            for i in 0..methods.row_count() {
                let method: RttiMethodRow = methods.row(&self.bytes, i)?;
                if self.name_at(method.name) != Some(function) {
                    continue;
                }
                if self.lookup_file(method.pcode_start) == Some(file) {
                    fnaddr = Some(method.pcode_start);
                    break;
                }
            }
        }
        let fnaddr = fnaddr?;

        // The first line record at or after the entry point is where a
        // breakpoint can actually land.
        for i in 0..self.debug_lines.len() {
            let row = self.debug_lines.get(&self.bytes, i)?;
            if row.addr >= fnaddr {
                return Some(row.addr);
            }
        }
        None
    }

    /// Address of the first breakable line at or after `line` in `file`.
    /// A file may appear several times in the file table; each range is
    /// searched in turn.
    pub fn line_address(&self, line: u32, file: &str) -> Option<u32> {
        for i in 0..self.debug_files.len() {
            let row = self.debug_files.get(&self.bytes, i)?;
            if self.debug_name(row.name) != Some(file) {
                continue;
            }
            let bottom = row.addr;
            let top = match self.debug_files.get(&self.bytes, i + 1) {
                Some(next) => next.addr,
                None => u32::MAX,
            };
            for j in 0..self.debug_lines.len() {
                let candidate = self.debug_lines.get(&self.bytes, j)?;
                if candidate.addr < bottom || candidate.addr >= top {
                    continue;
                }
                if candidate.line >= line {
                    return Some(candidate.addr);
                }
            }
        }
        None
    }

    /// Suffix match over the debug file table, for clients that only know a
    /// base name.
    pub fn find_file_by_partial_name(&self, partial: &str) -> Option<&str> {
        for i in 0..self.debug_files.len() {
            let row = self.debug_files.get(&self.bytes, i)?;
            if let Some(filename) = self.debug_name(row.name) {
                if filename.ends_with(partial) {
                    return Some(filename);
                }
            }
        }
        None
    }

    /// Scoped variable lookup: locals visible at `scopeaddr` first, then
    /// globals by name alone.
    pub fn find_variable(&self, name: &str, scopeaddr: u32) -> Option<Symbol> {
        for sym in self.symbol_iterator(SymbolScope::Local) {
            if sym.ident() == symbols::IDENT_FUNCTION {
                continue;
            }
            if sym.codestart() <= scopeaddr
                && sym.codeend() >= scopeaddr
                && self.debug_name(sym.name_offset()) == Some(name)
            {
                return Some(sym);
            }
        }
        self.symbol_iterator(SymbolScope::Global).find(|sym| {
            sym.ident() != symbols::IDENT_FUNCTION
                && self.debug_name(sym.name_offset()) == Some(name)
        })
    }

    /// Iterate debug symbols. With legacy tables both scopes walk the same
    /// mixed table and callers filter by storage class.
    pub fn symbol_iterator(&self, scope: SymbolScope) -> SymbolIterator<'_> {
        if let Some(legacy) = &self.legacy_symbols {
            let buf = &self.bytes[legacy.offset..legacy.offset + legacy.size];
            return SymbolIterator::legacy(self, buf, legacy.packed);
        }
        let table = match scope {
            SymbolScope::Local => self.dbg_locals.as_ref(),
            SymbolScope::Global => self.dbg_globals.as_ref(),
        };
        if table.is_some() {
            SymbolIterator::rtti(self, scope)
        } else {
            SymbolIterator::empty(self)
        }
    }

    pub(crate) fn debug_var_row(&self, scope: SymbolScope, index: u32) -> Option<DebugVarRow> {
        let table = match scope {
            SymbolScope::Local => self.dbg_locals.as_ref()?,
            SymbolScope::Global => self.dbg_globals.as_ref()?,
        };
        table.row(&self.bytes, index)
    }

    pub fn classdef_name(&self, index: u32) -> Option<&str> {
        let row: RttiClassdefRow = self.rtti_classdefs.as_ref()?.row(&self.bytes, index)?;
        self.name_at(row.name)
    }

    pub fn enum_struct_name(&self, index: u32) -> Option<&str> {
        let row: RttiEnumStructRow = self.rtti_enumstructs.as_ref()?.row(&self.bytes, index)?;
        self.name_at(row.name)
    }

    pub fn enum_struct(&self, index: u32) -> Option<RttiEnumStructRow> {
        self.rtti_enumstructs.as_ref()?.row(&self.bytes, index)
    }

    /// Fields of a classdef: the contiguous run from its `first_field` up to
    /// the next classdef's (or the table end).
    pub fn classdef_fields(&self, index: u32) -> Vec<RttiFieldRow> {
        let (Some(classdefs), Some(fields)) = (&self.rtti_classdefs, &self.rtti_fields) else {
            return Vec::new();
        };
        let Some(row) = classdefs.row::<RttiClassdefRow>(&self.bytes, index) else {
            return Vec::new();
        };
        let stopat = match classdefs.row::<RttiClassdefRow>(&self.bytes, index + 1) {
            Some(next) => next.first_field,
            None => fields.row_count(),
        };
        (row.first_field..stopat)
            .filter_map(|i| fields.row(&self.bytes, i))
            .collect()
    }

    /// Fields of an enum-struct, symmetric to [`Self::classdef_fields`].
    pub fn enum_struct_fields(&self, index: u32) -> Vec<RttiEsFieldRow> {
        let (Some(enumstructs), Some(fields)) = (&self.rtti_enumstructs, &self.rtti_es_fields)
        else {
            return Vec::new();
        };
        let Some(row) = enumstructs.row::<RttiEnumStructRow>(&self.bytes, index) else {
            return Vec::new();
        };
        let stopat = match enumstructs.row::<RttiEnumStructRow>(&self.bytes, index + 1) {
            Some(next) => next.first_field,
            None => fields.row_count(),
        };
        (row.first_field..stopat)
            .filter_map(|i| fields.row(&self.bytes, i))
            .collect()
    }
}

/// Inflate the compressed region of a gz container into a fresh buffer of
/// exactly `imagesize` bytes, keeping the uncompressed prefix verbatim.
fn inflate_image(hdr: &FileHeader, raw: &[u8]) -> Result<Vec<u8>, ImageError> {
    let length = raw.len();
    if hdr.disksize as usize > length {
        return Err(ImageError::BadHeader("illegal disk size"));
    }
    let dataoffs = hdr.dataoffs as usize;
    if dataoffs > length || dataoffs < HEADER_SIZE || (hdr.disksize as usize) < dataoffs {
        return Err(ImageError::BadHeader("illegal compressed region"));
    }
    let imagesize = hdr.imagesize as usize;
    if imagesize < dataoffs {
        return Err(ImageError::BadHeader("illegal image size"));
    }

    let mut uncompressed = Vec::new();
    uncompressed
        .try_reserve_exact(imagesize)
        .map_err(|_| ImageError::OutOfMemory)?;
    uncompressed.extend_from_slice(&raw[..dataoffs]);

    let compressed = &raw[dataoffs..hdr.disksize as usize];
    let expected = imagesize - dataoffs;
    let mut decoder = ZlibDecoder::new(compressed).take(expected as u64 + 1);
    decoder
        .read_to_end(&mut uncompressed)
        .map_err(|_| ImageError::BadCompression)?;
    if uncompressed.len() != imagesize {
        return Err(ImageError::BadCompression);
    }
    Ok(uncompressed)
}

fn str_at(bytes: &[u8], table_offset: usize, table_size: usize, offset: usize) -> Option<&str> {
    if offset >= table_size {
        return None;
    }
    let region = &bytes[table_offset + offset..table_offset + table_size];
    let nul = region.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&region[..nul]).ok()
}
