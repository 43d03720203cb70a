//! Rendering of script variables into wire-ready `{name, value, type}`
//! triples.
//!
//! Scalars and legacy arrays format into plain strings; RTTI enum-structs
//! and classdefs render as JSON objects by walking their field layouts in
//! script memory. All memory goes through the VM context of the suspended
//! thread, so a failed read renders as a placeholder instead of tearing the
//! session down.

use crate::image::format::CELL_SIZE;
use crate::image::rtti::{cb, Rtti};
use crate::image::symbols::{
    Symbol, DISP_BOOL, DISP_FIXED, DISP_FLOAT, DISP_MASK, DISP_STRING,
};
use crate::image::ScriptImage;
use crate::vm::{Cell, ExecutionContext};
use serde_json::Value;

/// Most indices a variable request may carry.
pub const MAX_DIMS: usize = 3;

/// Bound on nested classdef/enum-struct recursion.
const MAX_STRUCT_DEPTH: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedVariable {
    pub name: String,
    pub value: String,
    pub type_name: String,
}

/// Render a symbol at the current stop. `indices` selects array elements;
/// `noarray` suppresses the generic "Array" type label when the caller
/// expands elements itself.
pub fn display_variable(
    image: &ScriptImage,
    ctx: &dyn ExecutionContext,
    sym: &mut Symbol,
    cip: u32,
    frm: Cell,
    indices: &[u32],
    noarray: bool,
) -> RenderedVariable {
    let mut var = RenderedVariable {
        name: image
            .debug_name(sym.name_offset())
            .unwrap_or("N/A")
            .to_string(),
        value: String::new(),
        type_name: "N/A".to_string(),
    };

    // Structured RTTI types render as JSON objects; a one-dimensional
    // fixed array of them renders as an array of objects. Deeper ranks
    // fall through to the generic array handling below.
    if let Some(ty) = sym.rtti_type().cloned() {
        let json = match ty.tag() {
            cb::CLASSDEF | cb::ENUM_STRUCT => {
                read_structured(image, ctx, sym.addr(), sym.is_local(), frm, &ty, 0)
            }
            cb::FIXED_ARRAY if ty.rank() == 1 => structured_elements(image, ctx, sym, frm, &ty),
            _ => Value::Null,
        };
        if !json.is_null() {
            let element = ty.element();
            if let Some(index) = element.index() {
                let type_name = match element.tag() {
                    cb::CLASSDEF => image.classdef_name(index),
                    _ => image.enum_struct_name(index),
                };
                if let Some(type_name) = type_name {
                    var.type_name = type_name.to_string();
                }
            }
            var.value = json.to_string();
            return var;
        }
    }

    // Visibility before anything touches memory.
    if cip < sym.codestart() || cip > sym.codeend() {
        var.value = "Not in scope.".to_string();
        return var;
    }

    infer_display_type(image, ctx, sym, frm);

    if sym.is_array() {
        let dims = sym.dimensions().to_vec();
        for (dim, &index) in indices.iter().enumerate() {
            if let Some(d) = dims.get(dim) {
                if d.size > 0 && index >= d.size {
                    var.value = "(index out of range)".to_string();
                    return var;
                }
            }
        }

        if indices.is_empty() {
            if sym.vclass() & !DISP_MASK == DISP_STRING {
                var.type_name = "String".to_string();
                var.value = match get_string(ctx, sym, frm) {
                    Some(s) => s,
                    None => "NULL_STRING".to_string(),
                };
            } else if sym.dimcount() == 1 {
                if !noarray {
                    var.type_name = "Array".to_string();
                }
                let len = dims.first().map(|d| d.size).unwrap_or(0);
                let disp = sym.vclass() & !DISP_MASK;
                let mut items = Vec::new();
                for i in 0..len {
                    let Some(value) = get_symbol_value(ctx, sym, i as i32, frm) else {
                        continue;
                    };
                    items.push(match disp {
                        DISP_FLOAT => json_f32(value),
                        DISP_BOOL => Value::Bool(value != 0),
                        _ => Value::from(value),
                    });
                }
                var.value = Value::Array(items).to_string();
            } else {
                var.value = "(multi-dimensional array)".to_string();
            }
            return var;
        }
    } else if !indices.is_empty() {
        var.value = "(invalid index, not an array)".to_string();
        return var;
    }

    // Simple variable or a fully-indexed array element. All but the last
    // index walk the indirection vectors of a multi-dimensional array.
    let idxlevel = indices.len();
    let mut base: i32 = 0;
    let mut readable = true;
    for dim in 0..idxlevel.saturating_sub(1) {
        base += indices[dim] as i32;
        match get_symbol_value(ctx, sym, base, frm) {
            Some(value) => base += value / CELL_SIZE as i32,
            None => {
                readable = false;
                break;
            }
        }
    }
    let last = indices.last().copied().unwrap_or(0) as i32;
    let value = if readable {
        get_symbol_value(ctx, sym, base + last, frm)
    } else {
        None
    };

    if sym.dimcount() as usize != idxlevel {
        var.value = "(invalid number of dimensions)".to_string();
    } else if let Some(value) = value {
        let (text, type_name) = print_value(value, sym.vclass() & !DISP_MASK);
        var.value = text;
        var.type_name = type_name.to_string();
    } else {
        var.value = "(?)".to_string();
    }
    var
}

/// Pick a display type for legacy symbols that carry none: trust the tag
/// name first, then sniff untagged one-dimensional arrays for strings.
/// The result is memoized in the symbol's vclass bits.
pub(crate) fn infer_display_type(
    image: &ScriptImage,
    ctx: &dyn ExecutionContext,
    sym: &mut Symbol,
    frm: Cell,
) {
    if sym.vclass() & !DISP_MASK != 0 {
        return;
    }
    if let Some(tagid) = sym.tagid() {
        if let Some(tagname) = image.tag_name(tagid as u32) {
            if tagname.eq_ignore_ascii_case("bool") {
                sym.set_vclass(sym.vclass() | DISP_BOOL);
            } else if tagname.eq_ignore_ascii_case("float") {
                sym.set_vclass(sym.vclass() | DISP_FLOAT);
            }
        }
    }
    if sym.vclass() & !DISP_MASK == 0 && sym.is_array() && sym.dimcount() == 1 {
        if let Some(s) = get_string(ctx, sym, frm) {
            if looks_like_text(&s) {
                sym.set_vclass(sym.vclass() | DISP_STRING);
            }
        }
    }
}

/// A printable run starting with a letter.
fn looks_like_text(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c >= ' ' || c == '\n' || c == '\r' || c == '\t')
}

/// Read a zero-terminated string variable.
pub fn get_string(ctx: &dyn ExecutionContext, sym: &Symbol, frm: Cell) -> Option<String> {
    let mut base = sym.addr();
    if sym.is_local() {
        base += frm;
    }
    if sym.is_reference() {
        base = ctx.read_cell(base)?;
    }
    ctx.read_string(base)
}

/// Read the cell at `index` of a symbol, following one reference if needed.
pub fn get_symbol_value(
    ctx: &dyn ExecutionContext,
    sym: &Symbol,
    index: i32,
    frm: Cell,
) -> Option<Cell> {
    let mut base = sym.addr();
    if sym.is_local() {
        base += frm;
    }
    if sym.is_reference() {
        base = ctx.read_cell(base)?;
    }
    ctx.read_cell(base + index * CELL_SIZE as i32)
}

/// Write the cell at `index` of a symbol.
pub fn set_symbol_value(
    ctx: &dyn ExecutionContext,
    sym: &Symbol,
    index: i32,
    frm: Cell,
    value: Cell,
) -> bool {
    let mut base = sym.addr();
    if sym.is_local() {
        base += frm;
    }
    if sym.is_reference() {
        match ctx.read_cell(base) {
            Some(target) => base = target,
            None => return false,
        }
    }
    ctx.write_cell(base + index * CELL_SIZE as i32, value)
}

/// Overwrite a string variable, bounded by its first dimension.
pub fn set_symbol_string(
    ctx: &dyn ExecutionContext,
    sym: &Symbol,
    frm: Cell,
    value: &str,
) -> bool {
    let mut base = sym.addr();
    if sym.is_local() {
        base += frm;
    }
    if sym.is_reference() {
        match ctx.read_cell(base) {
            Some(target) => base = target,
            None => return false,
        }
    }
    let maxlen = sym.dimensions().first().map(|d| d.size).unwrap_or(0) as usize;
    ctx.write_string(base, maxlen, value)
}

/// Format a cell per its display type.
pub fn print_value(value: Cell, disptype: u8) -> (String, &'static str) {
    match disptype {
        DISP_FLOAT => (format!("{:.6}", f32::from_bits(value as u32)), "float"),
        DISP_FIXED => {
            const MULTIPLIER: i32 = 1000;
            let ipart = value / MULTIPLIER;
            let frac = (value - MULTIPLIER * ipart).abs();
            (format!("{ipart}.{frac:03}"), "fixed")
        }
        crate::image::symbols::DISP_HEX => (format!("{value:x}"), "hex"),
        DISP_BOOL => {
            let text = match value {
                0 => "false".to_string(),
                1 => "true".to_string(),
                other => format!("{other} (true)"),
            };
            (text, "bool")
        }
        _ => (value.to_string(), "cell"),
    }
}

/// A one-dimensional fixed array of enum-structs or classdefs: one JSON
/// object per element. `Null` when the element type is not structured, so
/// the caller falls back to the plain array path.
fn structured_elements(
    image: &ScriptImage,
    ctx: &dyn ExecutionContext,
    sym: &Symbol,
    frm: Cell,
    ty: &Rtti,
) -> Value {
    let element = ty.element();
    let stride_cells = match element.tag() {
        // Each slot holds a pointer to the object.
        cb::CLASSDEF => 1,
        cb::ENUM_STRUCT => element
            .index()
            .and_then(|i| image.enum_struct(i))
            .map(|es| es.size)
            .unwrap_or(0),
        _ => return Value::Null,
    };
    let count = ty.size().unwrap_or(0);
    if stride_cells == 0 || count == 0 {
        return Value::Null;
    }

    let mut base = sym.addr();
    if sym.is_local() {
        base += frm;
    }
    let mut items = Vec::new();
    for i in 0..count {
        let addr = base + (i * stride_cells) as i32 * CELL_SIZE as i32;
        items.push(read_structured(image, ctx, addr, false, frm, element, 0));
    }
    Value::Array(items)
}

fn json_f32(value: Cell) -> Value {
    serde_json::Number::from_f64(f64::from(f32::from_bits(value as u32)))
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Read an RTTI-typed structure at `addr` into a JSON object.
///
/// Enum-struct fields are laid out contiguously; a classdef variable holds a
/// pointer that is followed exactly once. A field whose read leaves the
/// accessible data segment becomes JSON `null`.
pub fn read_structured(
    image: &ScriptImage,
    ctx: &dyn ExecutionContext,
    addr: Cell,
    local: bool,
    frm: Cell,
    ty: &Rtti,
    depth: u32,
) -> Value {
    if depth > MAX_STRUCT_DEPTH {
        return Value::Null;
    }
    let Some(index) = ty.index() else {
        return Value::Null;
    };

    let mut start = addr;
    if local {
        start += frm;
    }

    let fields_of = |object: &mut serde_json::Map<String, Value>, start: &mut Cell, fields: Vec<(String, u32)>| {
        for (name, type_id) in fields {
            let Some(field_ty) = image
                .rtti_data()
                .and_then(|data| data.type_from_type_id(type_id))
            else {
                break;
            };
            read_field(image, ctx, start, frm, &field_ty, depth, object, name);
        }
    };

    match ty.tag() {
        cb::ENUM_STRUCT => {
            let fields: Vec<_> = image
                .enum_struct_fields(index)
                .into_iter()
                .map(|f| {
                    (
                        image.debug_name(f.name).unwrap_or("N/A").to_string(),
                        f.type_id,
                    )
                })
                .collect();
            if fields.is_empty() {
                return Value::Null;
            }
            let mut object = serde_json::Map::new();
            fields_of(&mut object, &mut start, fields);
            Value::Object(object)
        }
        cb::CLASSDEF => {
            let fields: Vec<_> = image
                .classdef_fields(index)
                .into_iter()
                .map(|f| {
                    (
                        image.debug_name(f.name).unwrap_or("N/A").to_string(),
                        f.type_id,
                    )
                })
                .collect();
            if fields.is_empty() {
                return Value::Null;
            }
            // The variable holds a pointer to the object.
            let Some(mut start) = ctx.read_cell(start) else {
                return Value::Null;
            };
            let mut object = serde_json::Map::new();
            fields_of(&mut object, &mut start, fields);
            Value::Object(object)
        }
        _ => Value::Null,
    }
}

/// Read one structure field at `*start` and advance the cursor past it.
#[allow(clippy::too_many_arguments)]
fn read_field(
    image: &ScriptImage,
    ctx: &dyn ExecutionContext,
    start: &mut Cell,
    frm: Cell,
    field_ty: &Rtti,
    depth: u32,
    object: &mut serde_json::Map<String, Value>,
    name: String,
) {
    let cell = CELL_SIZE as i32;
    match field_ty.tag() {
        // `any` renders as a plain integer.
        cb::ANY | cb::INT32 => {
            object.insert(
                name,
                ctx.read_cell(*start).map(Value::from).unwrap_or(Value::Null),
            );
            *start += cell;
        }
        cb::BOOL => {
            object.insert(
                name,
                ctx.read_cell(*start)
                    .map(|v| Value::Bool(v != 0))
                    .unwrap_or(Value::Null),
            );
            *start += cell;
        }
        cb::CHAR8 => {
            object.insert(
                name,
                ctx.read_cell(*start)
                    .map(|v| Value::from(v as u8))
                    .unwrap_or(Value::Null),
            );
            *start += cell;
        }
        cb::FLOAT32 => {
            object.insert(
                name,
                ctx.read_cell(*start).map(json_f32).unwrap_or(Value::Null),
            );
            *start += cell;
        }
        cb::FIXED_ARRAY => {
            let count = field_ty.size().unwrap_or(0);
            match field_ty.inner().map(|inner| inner.tag()) {
                // A fixed char array is an inline string occupying
                // `count` bytes rounded up to whole cells.
                Some(cb::CHAR8) => {
                    object.insert(
                        name,
                        ctx.read_string(*start)
                            .map(Value::from)
                            .unwrap_or(Value::Null),
                    );
                    *start += round_to_cells(count as i32);
                }
                Some(cb::ENUM_STRUCT) => {
                    let inner = field_ty.inner().expect("tag matched");
                    let es_cells = inner
                        .index()
                        .and_then(|i| image.enum_struct(i))
                        .map(|es| es.size)
                        .unwrap_or(0);
                    let mut items = Vec::new();
                    for i in 0..count {
                        let elem_addr = *start + (i * es_cells) as i32 * cell;
                        items.push(read_structured(
                            image,
                            ctx,
                            elem_addr,
                            false,
                            frm,
                            inner,
                            depth + 1,
                        ));
                    }
                    object.insert(name, Value::Array(items));
                    *start += (count * es_cells) as i32 * cell;
                }
                Some(_) => {
                    let mut items = Vec::new();
                    for i in 0..count {
                        items.push(
                            ctx.read_cell(*start + i as i32 * cell)
                                .map(Value::from)
                                .unwrap_or(Value::Null),
                        );
                    }
                    object.insert(name, Value::Array(items));
                    *start += count as i32 * cell;
                }
                None => {}
            }
        }
        cb::ARRAY => match field_ty.inner().map(|inner| inner.tag()) {
            Some(cb::CHAR8) => {
                // Zero-terminated string; the cursor moves past the
                // terminator, rounded up to the next cell.
                match ctx.read_string(*start) {
                    Some(s) => {
                        *start += round_to_cells(s.len() as i32 + 1);
                        object.insert(name, Value::from(s));
                    }
                    None => {
                        object.insert(name, Value::Null);
                    }
                }
            }
            Some(cb::ENUM_STRUCT) => {
                let inner = field_ty.inner().expect("tag matched");
                let value = read_structured(image, ctx, *start, false, frm, inner, depth + 1);
                let es_cells = inner
                    .index()
                    .and_then(|i| image.enum_struct(i))
                    .map(|es| es.size)
                    .unwrap_or(0);
                object.insert(name, value);
                *start += es_cells as i32 * cell;
            }
            _ => {}
        },
        // References to other type kinds are not expanded in place.
        _ => {}
    }
}

fn round_to_cells(bytes: i32) -> i32 {
    let cell = CELL_SIZE as i32;
    (bytes + cell - 1) / cell * cell
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn print_value_formats() {
        assert_eq!(print_value(42, 0), ("42".to_string(), "cell"));
        assert_eq!(print_value(255, crate::image::symbols::DISP_HEX).0, "ff");
        assert_eq!(print_value(0, DISP_BOOL).0, "false");
        assert_eq!(print_value(1, DISP_BOOL).0, "true");
        assert_eq!(print_value(7, DISP_BOOL).0, "7 (true)");
        assert_eq!(print_value(1500, DISP_FIXED).0, "1.500");
        assert_eq!(print_value(-1500, DISP_FIXED).0, "-1.500");
        assert_eq!(
            print_value(1.5f32.to_bits() as i32, DISP_FLOAT).0,
            "1.500000"
        );
    }

    #[test]
    fn fixed_keeps_three_digit_fraction() {
        assert_eq!(print_value(2005, DISP_FIXED).0, "2.005");
        assert_eq!(print_value(2050, DISP_FIXED).0, "2.050");
    }

    #[test]
    fn text_detection() {
        assert!(looks_like_text("hello world"));
        assert!(looks_like_text("a\tb\r\n"));
        assert!(!looks_like_text("1abc"));
        assert!(!looks_like_text(""));
        assert!(!looks_like_text("a\x01b"));
    }

    #[test]
    fn round_to_cells_steps() {
        assert_eq!(round_to_cells(1), 4);
        assert_eq!(round_to_cells(4), 4);
        assert_eq!(round_to_cells(5), 8);
    }
}
