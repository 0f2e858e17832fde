//! Type-encoding translator.
//!
//! Converts the runtime's compact type encodings (`i`, `@"NSString"`,
//! `{CGPoint=dd}`, `^{Opaque}` ...) into [`TypeDescriptor`]s that carry the
//! native size, alignment and field layout of the type, and back.
//!
//! # Grammar
//!
//! | Code            | Type                                      |
//! |-----------------|-------------------------------------------|
//! | `c C s S i I`   | char, short, int and unsigned variants    |
//! | `l L q Q`       | long (32-bit in encodings), long long     |
//! | `f d D`         | float, double, long double                |
//! | `B v *`         | bool, void, C string                      |
//! | `@ @"Name" @?`  | object, typed object, block               |
//! | `# :`           | class, selector                           |
//! | `^T`            | pointer to `T` (`^?` unknown pointee)     |
//! | `[NT]`          | array of `N` elements                     |
//! | `{name=...}`    | struct (`?` or empty name = anonymous)    |
//! | `(name=...)`    | union                                     |
//! | `bN`            | bitfield of `N` bits, inside structs only |
//!
//! The qualifiers `r n N o O R V` are stripped. Trailing digits after a type
//! (legacy stack offsets in method encodings) are skipped.
//!
//! # Caching
//!
//! Every decoded aggregate is cached by its exact encoding text, so decoding
//! the same encoding twice returns the same `Arc`. Named structs are also
//! cached under their bare `{name}` form so later references to the name
//! resolve to the full layout.

use crate::error::{Error, Result};
use crate::runtime::abi::{Arch, FloatKind, ReturnShape};
use fxhash::FxHashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// What kind of native type a descriptor describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// `v`
    Void,
    /// `c`
    Char,
    /// `C`
    UChar,
    /// `s`
    Short,
    /// `S`
    UShort,
    /// `i`
    Int,
    /// `I`
    UInt,
    /// `l`
    Long,
    /// `L`
    ULong,
    /// `q`
    LongLong,
    /// `Q`
    ULongLong,
    /// `f`
    Float,
    /// `d`
    Double,
    /// `D`
    LongDouble,
    /// `B`
    Bool,
    /// `*`
    CString,
    /// `@`, optionally with the declared class name.
    Object {
        /// Class name from `@"Name"`.
        class_name: Option<String>,
    },
    /// `@?`, optionally with the block's own signature.
    Block {
        /// Signature from `@?<...>`.
        signature: Option<String>,
    },
    /// `#`
    Class,
    /// `:`
    Selector,
    /// `^T`
    Pointer(Arc<TypeDescriptor>),
    /// `?`, only valid as a pointee.
    Unknown,
    /// `[NT]`
    Array {
        /// Element count.
        len: usize,
        /// Element type.
        elem: Arc<TypeDescriptor>,
    },
    /// `{name=...}`
    Struct(StructType),
    /// `(name=...)`
    Union(StructType),
    /// `{name}` whose layout is not known.
    Opaque(Option<String>),
    /// `bN`
    Bitfield(u32),
}

/// Fields of a struct or union.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructType {
    /// `None` for anonymous aggregates.
    pub name: Option<String>,
    /// Fields in declaration order.
    pub fields: Vec<Field>,
}

/// One struct or union field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    /// Quoted field name from the encoding, if present.
    pub name: Option<String>,
    /// Field type.
    pub ty: Arc<TypeDescriptor>,
    /// Byte offset from the start of the aggregate.
    pub offset: usize,
    /// `(shift, width)` inside the 32-bit unit at `offset`, for bitfields.
    pub bits: Option<(u32, u32)>,
}

/// A decoded type with its native layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    kind: TypeKind,
    size: usize,
    align: usize,
    callback_returnable: bool,
}

impl TypeDescriptor {
    fn new(kind: TypeKind, size: usize, align: usize) -> TypeDescriptor {
        // C functions cannot return arrays or types without a layout.
        let callback_returnable = !matches!(
            kind,
            TypeKind::Array { .. } | TypeKind::Opaque(_) | TypeKind::Unknown
        );
        TypeDescriptor {
            kind,
            size,
            align: align.max(1),
            callback_returnable,
        }
    }

    fn scalar(kind: TypeKind, size: usize) -> TypeDescriptor {
        TypeDescriptor::new(kind, size, size)
    }

    /// The kind of type.
    #[must_use]
    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment in bytes.
    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Whether a host callback (a trampoline or block) may return this type
    /// by value. Set when the descriptor is built.
    #[must_use]
    pub fn callback_returnable(&self) -> bool {
        self.callback_returnable
    }

    /// Returns `true` for `v`.
    #[must_use]
    pub fn is_void(&self) -> bool {
        self.kind == TypeKind::Void
    }

    /// Objects, blocks and classes: anything retained by the runtime.
    #[must_use]
    pub fn is_object_like(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Object { .. } | TypeKind::Block { .. } | TypeKind::Class
        )
    }

    /// Struct fields, for structs and unions.
    #[must_use]
    pub fn struct_type(&self) -> Option<&StructType> {
        match &self.kind {
            TypeKind::Struct(st) | TypeKind::Union(st) => Some(st),
            _ => None,
        }
    }

    /// Shape of this type as a return value, for convention selection.
    #[must_use]
    pub fn return_shape(&self) -> ReturnShape {
        match self.kind {
            TypeKind::Struct(_) | TypeKind::Union(_) | TypeKind::Array { .. } => {
                ReturnShape::Aggregate { size: self.size }
            }
            TypeKind::Float => ReturnShape::Float(FloatKind::Single),
            TypeKind::Double => ReturnShape::Float(FloatKind::Double),
            TypeKind::LongDouble => ReturnShape::Float(FloatKind::Extended),
            _ => ReturnShape::Scalar,
        }
    }

    /// Human-readable name for error messages.
    #[must_use]
    pub fn type_name(&self) -> String {
        match &self.kind {
            TypeKind::Struct(st) => match &st.name {
                Some(name) => format!("struct {name}"),
                None => "anonymous struct".to_string(),
            },
            TypeKind::Union(st) => match &st.name {
                Some(name) => format!("union {name}"),
                None => "anonymous union".to_string(),
            },
            TypeKind::Array { len, elem } => format!("{}[{len}]", elem.type_name()),
            _ => encode(self),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

// ============================================================================
// Cache
// ============================================================================

type Cache = RwLock<FxHashMap<String, Arc<TypeDescriptor>>>;

static CACHE: OnceLock<Cache> = OnceLock::new();

fn cache() -> &'static Cache {
    CACHE.get_or_init(|| RwLock::new(FxHashMap::default()))
}

fn cached(encoding: &str) -> Option<Arc<TypeDescriptor>> {
    cache().read().get(encoding).cloned()
}

/// Number of cached encodings.
#[must_use]
pub fn cache_len() -> usize {
    cache().read().len()
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes a single type encoding.
///
/// Trailing text after the first type is an error, except for offset
/// digits.
///
/// # Errors
///
/// - [`Error::UnsupportedEncoding`] for codes the bridge cannot marshal
///   (`T`, `t`, `j`, `A`, unknown letters, `?` outside a pointer)
/// - [`Error::InvalidEncoding`] for malformed input
///
/// # Example
///
/// ```rust
/// use oxbridge::bridge::encoding::{self, TypeKind};
///
/// let point = encoding::decode("{CGPoint=dd}").unwrap();
/// assert_eq!(point.size(), 16);
/// assert!(std::sync::Arc::ptr_eq(&point, &encoding::decode("{CGPoint=dd}").unwrap()));
/// assert!(matches!(point.kind(), TypeKind::Struct(_)));
/// ```
pub fn decode(encoding: &str) -> Result<Arc<TypeDescriptor>> {
    if let Some(hit) = cached(encoding) {
        return Ok(hit);
    }

    let mut parser = Parser::new(encoding);
    let ty = parser.parse_type(false)?;
    parser.skip_offset();
    if parser.pos != parser.bytes.len() {
        return Err(parser.invalid("trailing characters after type"));
    }

    let mut table = cache().write();
    for (text, descriptor) in parser.discovered {
        table.entry(text).or_insert(descriptor);
    }
    Ok(Arc::clone(
        table.entry(encoding.to_string()).or_insert(ty),
    ))
}

/// [`decode`], naming `context` (usually a selector) in unsupported-code
/// errors.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_in_context(encoding: &str, context: &str) -> Result<Arc<TypeDescriptor>> {
    decode(encoding).map_err(|err| err.in_context(context))
}

/// Splits a method encoding into `[return, self, _cmd, args...]`.
///
/// Offset digits between types are dropped.
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] for malformed input.
///
/// # Example
///
/// ```rust
/// use oxbridge::bridge::encoding::split_method_encoding;
///
/// let parts = split_method_encoding("v24@0:8{CGPoint=dd}16").unwrap();
/// assert_eq!(parts, ["v", "@", ":", "{CGPoint=dd}"]);
/// ```
pub fn split_method_encoding(encoding: &str) -> Result<Vec<String>> {
    let bytes = encoding.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let end = end_of_encoding(encoding, start)?;
        parts.push(encoding[start..end].to_string());
        start = end;
        while start < bytes.len() && bytes[start].is_ascii_digit() {
            start += 1;
        }
    }
    Ok(parts)
}

/// Decodes every part of a method encoding.
///
/// # Errors
///
/// See [`decode`] and [`split_method_encoding`].
pub fn decode_method(encoding: &str, context: &str) -> Result<Vec<Arc<TypeDescriptor>>> {
    split_method_encoding(encoding)
        .map_err(|err| err.in_context(context))?
        .iter()
        .map(|part| decode_in_context(part, context))
        .collect()
}

/// Decodes the return type of a method encoding, ignoring the rest.
///
/// # Errors
///
/// See [`decode`] and [`split_method_encoding`].
pub(crate) fn decode_return(method_types: &str) -> Result<Arc<TypeDescriptor>> {
    let end = end_of_encoding(method_types, 0)?;
    decode(&method_types[..end])
}

/// Index one past the type starting at `start`.
fn end_of_encoding(encoding: &str, start: usize) -> Result<usize> {
    let bytes = encoding.as_bytes();
    let invalid = |position: usize, reason: &str| Error::InvalidEncoding {
        encoding: encoding.to_string(),
        position,
        reason: reason.to_string(),
    };

    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        let c = bytes[i];
        if b"([{<".contains(&c) {
            depth += 1;
            i += 1;
        } else if depth > 0 {
            if c == b'"' {
                // Quoted field names may contain anything but a quote.
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    i += 1;
                }
            } else if b")]}>".contains(&c) {
                depth -= 1;
            }
            i += 1;
            if depth == 0 {
                return Ok(i);
            }
        } else if b"*:#?BCDILQSTcdfilqstv".contains(&c) {
            return Ok(i + 1);
        } else if b"^ANORVjnor".contains(&c) {
            i += 1;
        } else if c == b'@' {
            match bytes.get(i + 1) {
                Some(b'?') if bytes.get(i + 2) == Some(&b'<') => i += 2,
                Some(b'?') => return Ok(i + 2),
                Some(b'"') => {
                    let close = encoding[i + 2..]
                        .find('"')
                        .ok_or_else(|| invalid(i, "unterminated class name"))?;
                    return Ok(i + 2 + close + 1);
                }
                _ => return Ok(i + 1),
            }
        } else if c == b'b' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            return Ok(j);
        } else {
            return Err(Error::UnsupportedEncoding {
                code: char::from(c).to_string(),
                context: None,
            });
        }
    }

    if depth > 0 {
        Err(invalid(bytes.len(), "missing closing delimiter"))
    } else {
        Err(invalid(bytes.len(), "unexpected end of encoding"))
    }
}

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
    arch: Arch,
    /// Aggregates decoded along the way, cached once the parse succeeds.
    discovered: Vec<(String, Arc<TypeDescriptor>)>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Parser {
            text,
            bytes: text.as_bytes(),
            pos: 0,
            arch: Arch::current(),
            discovered: Vec::new(),
        }
    }

    fn invalid(&self, reason: &str) -> Error {
        Error::InvalidEncoding {
            encoding: self.text.to_string(),
            position: self.pos,
            reason: reason.to_string(),
        }
    }

    fn unsupported(code: &str) -> Error {
        Error::UnsupportedEncoding {
            code: code.to_string(),
            context: None,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.invalid(&format!("expected '{}'", char::from(byte))))
        }
    }

    fn number(&mut self) -> Option<usize> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        self.text[start..self.pos].parse().ok()
    }

    fn skip_offset(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn quoted(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let start = self.pos;
        while let Some(b) = self.bump() {
            if b == b'"' {
                return Ok(self.text[start..self.pos - 1].to_string());
            }
        }
        Err(self.invalid("unterminated quoted name"))
    }

    /// Parses one type. `pointee` allows `?` and unknown bare structs.
    fn parse_type(&mut self, pointee: bool) -> Result<Arc<TypeDescriptor>> {
        while self.peek().is_some_and(|b| b"rnNoORV".contains(&b)) {
            self.pos += 1;
        }

        let start = self.pos;
        let ptr = self.arch.pointer_size();
        let code = self.bump().ok_or_else(|| self.invalid("unexpected end of encoding"))?;
        let descriptor = match code {
            b'v' => TypeDescriptor::new(TypeKind::Void, 0, 1),
            b'c' => TypeDescriptor::scalar(TypeKind::Char, 1),
            b'C' => TypeDescriptor::scalar(TypeKind::UChar, 1),
            b's' => TypeDescriptor::scalar(TypeKind::Short, 2),
            b'S' => TypeDescriptor::scalar(TypeKind::UShort, 2),
            b'i' => TypeDescriptor::scalar(TypeKind::Int, 4),
            b'I' => TypeDescriptor::scalar(TypeKind::UInt, 4),
            b'l' => TypeDescriptor::scalar(TypeKind::Long, 4),
            b'L' => TypeDescriptor::scalar(TypeKind::ULong, 4),
            b'q' => TypeDescriptor::scalar(TypeKind::LongLong, 8),
            b'Q' => TypeDescriptor::scalar(TypeKind::ULongLong, 8),
            b'f' => TypeDescriptor::scalar(TypeKind::Float, 4),
            b'd' => TypeDescriptor::scalar(TypeKind::Double, 8),
            b'D' => {
                let (size, align) = self.arch.long_double_layout();
                TypeDescriptor::new(TypeKind::LongDouble, size, align)
            }
            b'B' => TypeDescriptor::scalar(TypeKind::Bool, 1),
            b'*' => TypeDescriptor::scalar(TypeKind::CString, ptr),
            b'#' => TypeDescriptor::scalar(TypeKind::Class, ptr),
            b':' => TypeDescriptor::scalar(TypeKind::Selector, ptr),
            b'@' => self.object(ptr)?,
            b'^' => {
                let pointee = self.parse_type(true)?;
                TypeDescriptor::scalar(TypeKind::Pointer(pointee), ptr)
            }
            b'?' if pointee => TypeDescriptor::new(TypeKind::Unknown, 0, 1),
            b'[' => {
                let len = self.number().ok_or_else(|| self.invalid("array without length"))?;
                let elem = self.parse_type(false)?;
                self.expect(b']')?;
                let size = elem.size * len;
                let align = elem.align;
                TypeDescriptor::new(TypeKind::Array { len, elem }, size, align)
            }
            b'{' | b'(' => {
                self.pos = start;
                return self.aggregate(pointee);
            }
            b'b' => {
                self.pos -= 1;
                return Err(self.invalid("bitfield outside a struct"));
            }
            b'T' | b't' | b'j' | b'A' | b'?' => {
                return Err(Self::unsupported(&char::from(code).to_string()));
            }
            other => return Err(Self::unsupported(&char::from(other).to_string())),
        };
        Ok(Arc::new(descriptor))
    }

    fn object(&mut self, ptr: usize) -> Result<TypeDescriptor> {
        let kind = match self.peek() {
            Some(b'?') => {
                self.pos += 1;
                let signature = if self.peek() == Some(b'<') {
                    let open = self.pos;
                    let end = end_of_encoding(self.text, open)?;
                    self.pos = end;
                    Some(self.text[open + 1..end - 1].to_string())
                } else {
                    None
                };
                TypeKind::Block { signature }
            }
            Some(b'"') => {
                let name = self.quoted()?;
                TypeKind::Object {
                    class_name: Some(name),
                }
            }
            _ => TypeKind::Object { class_name: None },
        };
        Ok(TypeDescriptor::scalar(kind, ptr))
    }

    fn aggregate(&mut self, pointee: bool) -> Result<Arc<TypeDescriptor>> {
        let start = self.pos;
        let end = end_of_encoding(self.text, start)?;
        let slice = &self.text[start..end];
        if let Some(hit) = cached(slice) {
            self.pos = end;
            return Ok(hit);
        }

        let union = self.bump() == Some(b'(');
        let close = if union { b')' } else { b'}' };

        let name_start = self.pos;
        while self.peek().is_some_and(|b| b != b'=' && b != close) {
            self.pos += 1;
        }
        let raw_name = &self.text[name_start..self.pos];
        let name = match raw_name {
            "" | "?" => None,
            other => Some(other.to_string()),
        };

        if self.peek() == Some(close) {
            // `{name}`: a reference to a layout seen elsewhere.
            self.pos += 1;
            if !pointee {
                return Err(Self::unsupported(slice));
            }
            return Ok(Arc::new(TypeDescriptor::new(TypeKind::Opaque(name), 0, 1)));
        }
        self.expect(b'=')?;

        let mut fields = Vec::new();
        while self.peek() != Some(close) {
            if self.peek().is_none() {
                return Err(self.invalid("unterminated aggregate"));
            }
            let field_name = if self.peek() == Some(b'"') {
                Some(self.quoted()?)
            } else {
                None
            };
            let ty = if self.peek() == Some(b'b') {
                self.pos += 1;
                let width = self
                    .number()
                    .ok_or_else(|| self.invalid("bitfield without width"))?;
                let width = u32::try_from(width)
                    .ok()
                    .filter(|w| (1..=32).contains(w))
                    .ok_or_else(|| self.invalid("bitfield width must be 1 to 32"))?;
                Arc::new(TypeDescriptor::scalar(TypeKind::Bitfield(width), 4))
            } else {
                self.parse_type(false)?
            };
            fields.push((field_name, ty));
        }
        self.pos += 1;

        let (fields, size, align) = layout(fields, union);
        let st = StructType { name, fields };
        let kind = if union {
            TypeKind::Union(st)
        } else {
            TypeKind::Struct(st)
        };
        let descriptor = Arc::new(TypeDescriptor::new(kind, size, align));

        self.discovered.push((slice.to_string(), Arc::clone(&descriptor)));
        if let Some(name) = descriptor.struct_type().and_then(|st| st.name.as_ref()) {
            let (open, close) = if union { ('(', ')') } else { ('{', '}') };
            self.discovered
                .push((format!("{open}{name}{close}"), Arc::clone(&descriptor)));
        }
        Ok(descriptor)
    }
}

/// Computes field offsets with the host's C layout rules.
///
/// Consecutive bitfields share 32-bit units; a bitfield that does not fit
/// in the current unit starts the next one.
fn layout(
    fields: Vec<(Option<String>, Arc<TypeDescriptor>)>,
    union: bool,
) -> (Vec<Field>, usize, usize) {
    let mut out = Vec::with_capacity(fields.len());
    let mut size = 0usize;
    let mut align = 1usize;
    let mut unit: Option<(usize, u32)> = None;

    for (name, ty) in fields {
        align = align.max(ty.align);
        if let TypeKind::Bitfield(width) = ty.kind {
            if union {
                size = size.max(4);
                out.push(Field {
                    name,
                    ty,
                    offset: 0,
                    bits: Some((0, width)),
                });
                continue;
            }
            let (offset, used) = match unit {
                Some((offset, used)) if used + width <= 32 => (offset, used),
                _ => {
                    let offset = size.next_multiple_of(4);
                    size = offset + 4;
                    (offset, 0)
                }
            };
            unit = Some((offset, used + width));
            out.push(Field {
                name,
                ty,
                offset,
                bits: Some((used, width)),
            });
            continue;
        }

        unit = None;
        let offset = if union {
            size = size.max(ty.size);
            0
        } else {
            let offset = size.next_multiple_of(ty.align);
            size = offset + ty.size;
            offset
        };
        out.push(Field {
            name,
            ty,
            offset,
            bits: None,
        });
    }

    (out, size.next_multiple_of(align), align)
}

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a descriptor. `decode(&encode(t))` is structurally equal to `t`.
///
/// Anonymous aggregates encode with a `?` name; quoted field names are
/// kept.
#[must_use]
pub fn encode(ty: &TypeDescriptor) -> String {
    let mut out = String::new();
    write_encoding(ty, &mut out);
    out
}

fn write_encoding(ty: &TypeDescriptor, out: &mut String) {
    let code = match &ty.kind {
        TypeKind::Void => "v",
        TypeKind::Char => "c",
        TypeKind::UChar => "C",
        TypeKind::Short => "s",
        TypeKind::UShort => "S",
        TypeKind::Int => "i",
        TypeKind::UInt => "I",
        TypeKind::Long => "l",
        TypeKind::ULong => "L",
        TypeKind::LongLong => "q",
        TypeKind::ULongLong => "Q",
        TypeKind::Float => "f",
        TypeKind::Double => "d",
        TypeKind::LongDouble => "D",
        TypeKind::Bool => "B",
        TypeKind::CString => "*",
        TypeKind::Class => "#",
        TypeKind::Selector => ":",
        TypeKind::Unknown => "?",
        TypeKind::Object { class_name } => {
            out.push('@');
            if let Some(name) = class_name {
                out.push('"');
                out.push_str(name);
                out.push('"');
            }
            return;
        }
        TypeKind::Block { signature } => {
            out.push_str("@?");
            if let Some(signature) = signature {
                out.push('<');
                out.push_str(signature);
                out.push('>');
            }
            return;
        }
        TypeKind::Pointer(pointee) => {
            out.push('^');
            write_encoding(pointee, out);
            return;
        }
        TypeKind::Array { len, elem } => {
            out.push('[');
            out.push_str(&len.to_string());
            write_encoding(elem, out);
            out.push(']');
            return;
        }
        TypeKind::Struct(st) => {
            write_aggregate(st, '{', '}', out);
            return;
        }
        TypeKind::Union(st) => {
            write_aggregate(st, '(', ')', out);
            return;
        }
        TypeKind::Opaque(name) => {
            out.push('{');
            out.push_str(name.as_deref().unwrap_or("?"));
            out.push('}');
            return;
        }
        TypeKind::Bitfield(width) => {
            out.push('b');
            out.push_str(&width.to_string());
            return;
        }
    };
    out.push_str(code);
}

fn write_aggregate(st: &StructType, open: char, close: char, out: &mut String) {
    out.push(open);
    out.push_str(st.name.as_deref().unwrap_or("?"));
    out.push('=');
    for field in &st.fields {
        if let Some(name) = &field.name {
            out.push('"');
            out.push_str(name);
            out.push('"');
        }
        write_encoding(&field.ty, out);
    }
    out.push(close);
}

// ============================================================================
// Shape comparison
// ============================================================================

/// Whether a value of type `a` can be passed where `b` is expected.
///
/// Anonymous aggregates match any aggregate with the same field types in the
/// same order. Two named aggregates must also agree on the name. Object
/// class names and block signatures are annotations and never block a
/// match.
#[must_use]
pub fn same_shape(a: &TypeDescriptor, b: &TypeDescriptor) -> bool {
    match (&a.kind, &b.kind) {
        (TypeKind::Struct(x), TypeKind::Struct(y)) | (TypeKind::Union(x), TypeKind::Union(y)) => {
            if let (Some(p), Some(q)) = (&x.name, &y.name) {
                if p != q {
                    return false;
                }
            }
            x.fields.len() == y.fields.len()
                && x.fields.iter().zip(&y.fields).all(|(f, g)| {
                    f.offset == g.offset && f.bits == g.bits && same_shape(&f.ty, &g.ty)
                })
        }
        (TypeKind::Object { .. }, TypeKind::Object { .. })
        | (TypeKind::Block { .. }, TypeKind::Block { .. }) => true,
        (TypeKind::Pointer(p), TypeKind::Pointer(q)) => same_shape(p, q),
        (TypeKind::Array { len: m, elem: p }, TypeKind::Array { len: n, elem: q }) => {
            m == n && same_shape(p, q)
        }
        (TypeKind::Opaque(_), _) | (_, TypeKind::Opaque(_)) => a.size == b.size,
        (x, y) => x == y,
    }
}
