//! Debug symbols in their three container encodings.
//!
//! Old images carry one `.dbg.symbols` table mixing globals and locals, in
//! either the packed or the naturally-aligned row layout. Modern images
//! carry `.dbg.globals`/`.dbg.locals` tables of typed debug variables whose
//! shape comes from an RTTI type id. The three encodings share no layout, so
//! they live behind a tagged variant with one accessor set.

use crate::image::format::{
    PackedDimRow, PackedSymbolRow, Row, UnpackedDimRow, UnpackedSymbolRow,
};
use crate::image::rtti::{cb, Rtti};
use crate::image::ScriptImage;

pub const IDENT_VARIABLE: u8 = 1;
pub const IDENT_REFERENCE: u8 = 2;
pub const IDENT_ARRAY: u8 = 3;
pub const IDENT_REFARRAY: u8 = 4;
pub const IDENT_FUNCTION: u8 = 9;

/// Low nibble of `vclass` is the storage class (0 = global); the upper
/// nibble carries the display type used by the renderer.
pub const DISP_MASK: u8 = 0x0f;
pub const DISP_DEFAULT: u8 = 0x10;
pub const DISP_STRING: u8 = 0x20;
pub const DISP_HEX: u8 = 0x40;
pub const DISP_BOOL: u8 = 0x50;
pub const DISP_FIXED: u8 = 0x60;
pub const DISP_FLOAT: u8 = 0x70;

/// One array dimension. A zero size means the bound is not recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayDim {
    pub tagid: i16,
    pub size: u32,
}

#[derive(Debug, Clone)]
enum SymbolRepr {
    PackedLegacy(PackedSymbolRow),
    UnpackedLegacy(UnpackedSymbolRow),
    Rtti {
        address: i32,
        vclass: u8,
        code_start: u32,
        code_end: u32,
        name: u32,
        type_id: u32,
        ty: Option<Rtti>,
    },
}

/// A debug symbol with a unified view over the three encodings.
#[derive(Debug, Clone)]
pub struct Symbol {
    repr: SymbolRepr,
    dims: Vec<ArrayDim>,
    /// Mutable copy of the row's vclass; the renderer memoizes an inferred
    /// display type here.
    vclass: u8,
    ident: u8,
    dimcount: u16,
}

impl Symbol {
    pub(crate) fn packed(row: PackedSymbolRow, dims: Vec<ArrayDim>) -> Self {
        Symbol {
            vclass: row.vclass,
            ident: row.ident,
            dimcount: row.dimcount,
            repr: SymbolRepr::PackedLegacy(row),
            dims,
        }
    }

    pub(crate) fn unpacked(row: UnpackedSymbolRow, dims: Vec<ArrayDim>) -> Self {
        Symbol {
            vclass: row.vclass,
            ident: row.ident,
            dimcount: row.dimcount,
            repr: SymbolRepr::UnpackedLegacy(row),
            dims,
        }
    }

    /// Build a symbol from a modern debug-var row. Ident, rank and display
    /// type all derive from the decoded type.
    pub(crate) fn rtti(
        address: i32,
        vclass: u8,
        name: u32,
        code_start: u32,
        code_end: u32,
        type_id: u32,
        ty: Option<Rtti>,
    ) -> Self {
        let mut ident = IDENT_VARIABLE;
        let mut dimcount = 0;
        let mut dims = Vec::new();
        let mut vclass = vclass;
        if let Some(ty) = &ty {
            dimcount = ty.rank();
            if dimcount > 0 {
                ident = IDENT_ARRAY;
                dims = ty
                    .fixed_dimensions()
                    .into_iter()
                    .map(|size| ArrayDim { tagid: 0, size })
                    .collect();
            }
            if vclass & !DISP_MASK == 0u8 {
                vclass |= display_type_of(ty);
            }
        }
        Symbol {
            repr: SymbolRepr::Rtti {
                address,
                vclass,
                code_start,
                code_end,
                name,
                type_id,
                ty,
            },
            dims,
            vclass,
            ident,
            dimcount,
        }
    }

    /// Address relative to the data segment, or to the frame for locals.
    pub fn addr(&self) -> i32 {
        match &self.repr {
            SymbolRepr::PackedLegacy(row) => row.addr,
            SymbolRepr::UnpackedLegacy(row) => row.addr,
            SymbolRepr::Rtti { address, .. } => *address,
        }
    }

    /// Legacy tag id; modern symbols carry a type id instead.
    pub fn tagid(&self) -> Option<i16> {
        match &self.repr {
            SymbolRepr::PackedLegacy(row) => Some(row.tagid),
            SymbolRepr::UnpackedLegacy(row) => Some(row.tagid),
            SymbolRepr::Rtti { .. } => None,
        }
    }

    pub fn codestart(&self) -> u32 {
        match &self.repr {
            SymbolRepr::PackedLegacy(row) => row.codestart,
            SymbolRepr::UnpackedLegacy(row) => row.codestart,
            SymbolRepr::Rtti { code_start, .. } => *code_start,
        }
    }

    pub fn codeend(&self) -> u32 {
        match &self.repr {
            SymbolRepr::PackedLegacy(row) => row.codeend,
            SymbolRepr::UnpackedLegacy(row) => row.codeend,
            SymbolRepr::Rtti { code_end, .. } => *code_end,
        }
    }

    pub fn ident(&self) -> u8 {
        self.ident
    }

    pub fn vclass(&self) -> u8 {
        self.vclass
    }

    pub fn set_vclass(&mut self, vclass: u8) {
        self.vclass = vclass;
    }

    pub fn dimcount(&self) -> u16 {
        self.dimcount
    }

    /// Offset into the debug name table.
    pub fn name_offset(&self) -> u32 {
        match &self.repr {
            SymbolRepr::PackedLegacy(row) => row.name,
            SymbolRepr::UnpackedLegacy(row) => row.name,
            SymbolRepr::Rtti { name, .. } => *name,
        }
    }

    pub fn type_id(&self) -> Option<u32> {
        match &self.repr {
            SymbolRepr::Rtti { type_id, .. } => Some(*type_id),
            _ => None,
        }
    }

    /// Decoded type tree, present on modern symbols only.
    pub fn rtti_type(&self) -> Option<&Rtti> {
        match &self.repr {
            SymbolRepr::Rtti { ty, .. } => ty.as_ref(),
            _ => None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.vclass & DISP_MASK != 0
    }

    pub fn is_array(&self) -> bool {
        self.ident == IDENT_ARRAY || self.ident == IDENT_REFARRAY
    }

    pub fn is_reference(&self) -> bool {
        self.ident == IDENT_REFERENCE || self.ident == IDENT_REFARRAY
    }

    pub fn dimensions(&self) -> &[ArrayDim] {
        &self.dims
    }
}

/// Display nibble derived from a type tree: strings for char arrays, float
/// and bool scalars, plain cells otherwise.
fn display_type_of(ty: &Rtti) -> u8 {
    let element = ty.element();
    match element.tag() {
        cb::CHAR8 if ty.rank() > 0 || ty.tag() == cb::ARRAY => DISP_STRING,
        cb::FLOAT32 => DISP_FLOAT,
        cb::BOOL => DISP_BOOL,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Local,
    Global,
}

enum IterRepr<'a> {
    /// Byte cursor over the legacy `.dbg.symbols` stream.
    Legacy {
        buf: &'a [u8],
        pos: usize,
        packed: bool,
    },
    /// Row index over `.dbg.locals` / `.dbg.globals`.
    Rtti { index: u32, scope: SymbolScope },
    Empty,
}

/// Iterator over the active debug-symbol encoding. The legacy table mixes
/// globals and locals; callers filter by storage class.
pub struct SymbolIterator<'a> {
    image: &'a ScriptImage,
    repr: IterRepr<'a>,
}

impl<'a> SymbolIterator<'a> {
    pub(crate) fn legacy(image: &'a ScriptImage, buf: &'a [u8], packed: bool) -> Self {
        SymbolIterator {
            image,
            repr: IterRepr::Legacy {
                buf,
                pos: 0,
                packed,
            },
        }
    }

    pub(crate) fn rtti(image: &'a ScriptImage, scope: SymbolScope) -> Self {
        SymbolIterator {
            image,
            repr: IterRepr::Rtti { index: 0, scope },
        }
    }

    pub(crate) fn empty(image: &'a ScriptImage) -> Self {
        SymbolIterator {
            image,
            repr: IterRepr::Empty,
        }
    }
}

impl Iterator for SymbolIterator<'_> {
    type Item = Symbol;

    fn next(&mut self) -> Option<Symbol> {
        match &mut self.repr {
            IterRepr::Legacy { buf, pos, packed } => {
                if *packed {
                    if *pos + PackedSymbolRow::SIZE > buf.len() {
                        return None;
                    }
                    let row = PackedSymbolRow::parse(&buf[*pos..]);
                    *pos += PackedSymbolRow::SIZE;
                    let mut dims = Vec::with_capacity(row.dimcount as usize);
                    for _ in 0..row.dimcount {
                        if *pos + PackedDimRow::SIZE > buf.len() {
                            return None;
                        }
                        let dim = PackedDimRow::parse(&buf[*pos..]);
                        dims.push(ArrayDim {
                            tagid: dim.tagid,
                            size: dim.size,
                        });
                        *pos += PackedDimRow::SIZE;
                    }
                    Some(Symbol::packed(row, dims))
                } else {
                    if *pos + UnpackedSymbolRow::SIZE > buf.len() {
                        return None;
                    }
                    let row = UnpackedSymbolRow::parse(&buf[*pos..]);
                    *pos += UnpackedSymbolRow::SIZE;
                    let mut dims = Vec::with_capacity(row.dimcount as usize);
                    for _ in 0..row.dimcount {
                        if *pos + UnpackedDimRow::SIZE > buf.len() {
                            return None;
                        }
                        let dim = UnpackedDimRow::parse(&buf[*pos..]);
                        dims.push(ArrayDim {
                            tagid: dim.tagid,
                            size: dim.size,
                        });
                        *pos += UnpackedDimRow::SIZE;
                    }
                    Some(Symbol::unpacked(row, dims))
                }
            }
            IterRepr::Rtti { index, scope } => {
                let row = self.image.debug_var_row(*scope, *index)?;
                *index += 1;
                let ty = self
                    .image
                    .rtti_data()
                    .and_then(|data| data.type_from_type_id(row.type_id));
                Some(Symbol::rtti(
                    row.address,
                    row.vclass,
                    row.name,
                    row.code_start,
                    row.code_end,
                    row.type_id,
                    ty,
                ))
            }
            IterRepr::Empty => None,
        }
    }
}
