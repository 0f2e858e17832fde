//! Host values and their native representations.
//!
//! [`Value`] is the host side of every conversion. Two directions exist:
//!
//! - **Call boundary**: [`write_value`] and [`read_value`] move a value into
//!   or out of a native buffer laid out as a [`TypeDescriptor`] says.
//! - **Object boundary**: [`ns_from_value`] turns host scalars, text, bytes,
//!   decimals, lists and maps into Foundation objects; [`value_from_ns`]
//!   converts them back.
//!
//! Enumerated values are unwrapped to their underlying value at every
//! boundary before anything else happens.
//!
//! # Text Indexing
//!
//! Text crosses the boundary as UTF-8. Native string lengths and indices
//! count UTF-16 code units, host strings count bytes or chars; the two do
//! not agree for text outside the Basic Multilingual Plane.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use crate::bridge::block::ObjCBlock;
use crate::bridge::class::{ObjCClass, ObjCMetaclass};
use crate::bridge::encoding::{self, TypeDescriptor, TypeKind, same_shape};
use crate::bridge::instance::{ObjCInstance, wrap};
use crate::bridge::method::send_raw;
use crate::bridge::protocol::ObjCProtocol;
use crate::bridge::signature::NativeBuffer;
use crate::error::{Error, Result};
use crate::runtime::autorelease::{autorelease, autoreleasepool};
use crate::runtime::foundation::{self, NS_UTF8_STRING_ENCODING};
use crate::runtime::object::object_get_class;
use crate::runtime::{ObjectPtr, Sel};
use num_bigint::{BigInt, Sign};
use num_traits::Zero;
use std::ffi::{CStr, CString, c_char};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A host function callable from native code.
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// A host value.
#[derive(Clone, Default)]
pub enum Value {
    /// Absence; maps to nil and null.
    #[default]
    None,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point.
    Float(f64),
    /// Text.
    Str(String),
    /// Bytes.
    Bytes(Vec<u8>),
    /// Arbitrary-precision decimal.
    Decimal(Decimal),
    /// Sequence.
    List(Vec<Value>),
    /// Mapping.
    Dict(ValueMap),
    /// Wrapped native object.
    Object(ObjCInstance),
    /// Class.
    Class(ObjCClass),
    /// Metaclass.
    Metaclass(ObjCMetaclass),
    /// Protocol.
    Protocol(ObjCProtocol),
    /// Selector.
    Selector(Sel),
    /// Raw address.
    Pointer(usize),
    /// Struct or union by value.
    Struct(StructValue),
    /// Native block.
    Block(ObjCBlock),
    /// Host function.
    Callable(HostFn),
    /// Member of a host enumeration.
    Enum {
        /// Member name.
        name: String,
        /// Underlying value.
        value: Box<Value>,
    },
}

impl Value {
    /// Wraps a host function.
    pub fn callable<F>(f: F) -> Value
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Value::Callable(Arc::new(f))
    }

    /// An enumeration member.
    pub fn enum_member(name: &str, value: impl Into<Value>) -> Value {
        Value::Enum {
            name: name.to_string(),
            value: Box::new(value.into()),
        }
    }

    /// Strips enumeration members down to their underlying value.
    #[must_use]
    pub fn unwrapped(&self) -> &Value {
        let mut current = self;
        while let Value::Enum { value, .. } = current {
            current = value;
        }
        current
    }

    /// Short type name for error messages.
    #[must_use]
    pub fn type_label(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::UInt(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Decimal(_) => "decimal",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Object(_) => "object",
            Value::Class(_) => "class",
            Value::Metaclass(_) => "metaclass",
            Value::Protocol(_) => "protocol",
            Value::Selector(_) => "selector",
            Value::Pointer(_) => "pointer",
            Value::Struct(_) => "struct",
            Value::Block(_) => "block",
            Value::Callable(_) => "callable",
            Value::Enum { .. } => "enum",
        }
    }

    /// Whether the value can be a mapping key.
    #[must_use]
    pub fn is_hashable(&self) -> bool {
        !matches!(
            self.unwrapped(),
            Value::List(_) | Value::Dict(_) | Value::Struct(_)
        )
    }

    /// Returns `true` for [`Value::None`].
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self.unwrapped(), Value::None)
    }

    /// Integer view of `Bool`, `Int` and in-range `UInt`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self.unwrapped() {
            Value::Bool(b) => Some(i64::from(b)),
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Float view of numeric values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match *self.unwrapped() {
            Value::Float(v) => Some(v),
            Value::Int(v) => Some(v as f64),
            Value::UInt(v) => Some(v as f64),
            _ => None,
        }
    }

    /// Boolean view.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match *self.unwrapped() {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Text view.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self.unwrapped() {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The wrapped object, if any.
    #[must_use]
    pub fn as_object(&self) -> Option<&ObjCInstance> {
        match self.unwrapped() {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// The native pointer behind object-like values; nil otherwise.
    #[must_use]
    pub fn object_ptr(&self) -> ObjectPtr {
        match self.unwrapped() {
            Value::Object(obj) => obj.ptr(),
            Value::Class(class) => class.ptr(),
            Value::Metaclass(meta) => meta.ptr(),
            Value::Protocol(protocol) => protocol.ptr(),
            _ => ObjectPtr::NIL,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self.unwrapped(), other.unwrapped()) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Int(a), Value::UInt(b)) | (Value::UInt(b), Value::Int(a)) => {
                i128::from(*a) == i128::from(*b)
            }
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Metaclass(a), Value::Metaclass(b)) => a == b,
            (Value::Protocol(a), Value::Protocol(b)) => a == b,
            (Value::Selector(a), Value::Selector(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Block(a), Value::Block(b)) => a == b,
            (Value::Callable(a), Value::Callable(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}u"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::Bytes(v) => write!(f, "b{v:?}"),
            Value::Decimal(v) => write!(f, "Decimal({v})"),
            Value::List(v) => f.debug_list().entries(v).finish(),
            Value::Dict(v) => fmt::Debug::fmt(v, f),
            Value::Object(v) => fmt::Debug::fmt(v, f),
            Value::Class(v) => fmt::Debug::fmt(v, f),
            Value::Metaclass(v) => fmt::Debug::fmt(v, f),
            Value::Protocol(v) => fmt::Debug::fmt(v, f),
            Value::Selector(v) => fmt::Debug::fmt(v, f),
            Value::Pointer(v) => write!(f, "Pointer({v:#x})"),
            Value::Struct(v) => fmt::Debug::fmt(v, f),
            Value::Block(v) => fmt::Debug::fmt(v, f),
            Value::Callable(v) => write!(f, "Callable({:p})", Arc::as_ptr(v).cast::<()>()),
            Value::Enum { name, value } => write!(f, "{name}({value:?})"),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => |$v:ident| $make:expr),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from($v: $ty) -> Value {
                    $make
                }
            }
        )*
    };
}

value_from! {
    bool => |v| Value::Bool(v),
    i32 => |v| Value::Int(i64::from(v)),
    i64 => |v| Value::Int(v),
    u32 => |v| Value::UInt(u64::from(v)),
    u64 => |v| Value::UInt(v),
    f32 => |v| Value::Float(f64::from(v)),
    f64 => |v| Value::Float(v),
    &str => |v| Value::Str(v.to_string()),
    String => |v| Value::Str(v),
    Vec<u8> => |v| Value::Bytes(v),
    Vec<Value> => |v| Value::List(v),
    Decimal => |v| Value::Decimal(v),
    ValueMap => |v| Value::Dict(v),
    ObjCInstance => |v| Value::Object(v),
    ObjCClass => |v| Value::Class(v),
    ObjCMetaclass => |v| Value::Metaclass(v),
    ObjCProtocol => |v| Value::Protocol(v),
    Sel => |v| Value::Selector(v),
    StructValue => |v| Value::Struct(v),
    ObjCBlock => |v| Value::Block(v),
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Value {
        value.map_or(Value::None, Into::into)
    }
}

// ============================================================================
// Decimal
// ============================================================================

/// Largest accepted `|scale|` of a [`Decimal`].
pub const MAX_DECIMAL_SCALE: i64 = 4096;

/// Base-10 number: `mantissa * 10^-scale`.
///
/// Equality ignores trailing zeros, so `1.50 == 1.5`; display keeps the
/// scale the value was written with. The scale stays within
/// `±MAX_DECIMAL_SCALE`.
#[derive(Debug, Clone)]
pub struct Decimal {
    mantissa: BigInt,
    scale: i64,
}

impl Decimal {
    /// Builds `mantissa * 10^-scale`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueOutOfRange`] if `|scale|` exceeds
    /// [`MAX_DECIMAL_SCALE`].
    pub fn new(mantissa: BigInt, scale: i64) -> Result<Decimal> {
        if !(-MAX_DECIMAL_SCALE..=MAX_DECIMAL_SCALE).contains(&scale) {
            return Err(Error::ValueOutOfRange {
                value: format!("{mantissa}e{}", scale.saturating_neg()),
                encoding: "NSDecimalNumber".to_string(),
            });
        }
        Ok(Decimal { mantissa, scale })
    }

    /// Unscaled digits.
    #[must_use]
    pub fn mantissa(&self) -> &BigInt {
        &self.mantissa
    }

    /// Power of ten the mantissa is divided by.
    #[must_use]
    pub fn scale(&self) -> i64 {
        self.scale
    }

    fn normalized(&self) -> (BigInt, i64) {
        if self.mantissa.is_zero() {
            return (BigInt::zero(), 0);
        }
        let ten = BigInt::from(10);
        let mut mantissa = self.mantissa.clone();
        let mut scale = self.scale;
        while (&mantissa % &ten).is_zero() {
            mantissa = &mantissa / &ten;
            scale -= 1;
        }
        (mantissa, scale)
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Decimal) -> bool {
        self.normalized() == other.normalized()
    }
}

impl FromStr for Decimal {
    type Err = Error;

    fn from_str(text: &str) -> Result<Decimal> {
        let invalid = || Error::ArgumentType {
            expected: "decimal string".to_string(),
            got: format!("{text:?}"),
        };

        let trimmed = text.trim();
        let (negative, body) = match trimmed.as_bytes().first() {
            Some(b'-') => (true, &trimmed[1..]),
            Some(b'+') => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };
        let (number, exponent) = match body.find(['e', 'E']) {
            Some(at) => {
                let exp: i64 = body[at + 1..].parse().map_err(|_| invalid())?;
                (&body[..at], exp)
            }
            None => (body, 0),
        };
        let (int, frac) = number.split_once('.').unwrap_or((number, ""));
        let digits = format!("{int}{frac}");
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let magnitude = BigInt::parse_bytes(digits.as_bytes(), 10).ok_or_else(invalid)?;
        let mantissa = if negative { -magnitude } else { magnitude };
        let scale = i64::try_from(frac.len())
            .ok()
            .and_then(|places| places.checked_sub(exponent))
            .ok_or_else(|| Error::ValueOutOfRange {
                value: trimmed.to_string(),
                encoding: "NSDecimalNumber".to_string(),
            })?;
        Decimal::new(mantissa, scale)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.mantissa.sign() == Sign::Minus { "-" } else { "" };
        let digits = self.mantissa.magnitude().to_string();
        if self.scale <= 0 {
            let count = usize::try_from(self.scale.unsigned_abs()).map_err(|_| fmt::Error)?;
            let zeros = "0".repeat(count);
            return write!(f, "{sign}{digits}{zeros}");
        }
        let scale = usize::try_from(self.scale).map_err(|_| fmt::Error)?;
        if digits.len() > scale {
            let (int, frac) = digits.split_at(digits.len() - scale);
            write!(f, "{sign}{int}.{frac}")
        } else {
            let zeros = "0".repeat(scale - digits.len());
            write!(f, "{sign}0.{zeros}{digits}")
        }
    }
}

// ============================================================================
// Mappings
// ============================================================================

/// Insertion-ordered mapping with order-insensitive equality.
#[derive(Clone, Default)]
pub struct ValueMap {
    entries: Vec<(Value, Value)>,
}

impl ValueMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> ValueMap {
        ValueMap::default()
    }

    /// Builds a map from pairs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnhashableKey`] for list, map or struct keys.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<ValueMap>
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        let mut map = ValueMap::new();
        for (key, value) in pairs {
            map.insert(key.into(), value.into())?;
        }
        Ok(map)
    }

    /// Inserts a pair, returning the replaced value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnhashableKey`] for list, map or struct keys.
    pub fn insert(&mut self, key: Value, value: Value) -> Result<Option<Value>> {
        if !key.is_hashable() {
            return Err(Error::UnhashableKey(key.type_label().to_string()));
        }
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Ok(Some(std::mem::replace(&mut slot.1, value)));
        }
        self.entries.push((key, value));
        Ok(None)
    }

    /// Looks up a key.
    #[must_use]
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` for an empty map.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &ValueMap) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|w| w == v))
    }
}

impl fmt::Debug for ValueMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

// ============================================================================
// Structs
// ============================================================================

/// A struct or union value: its type plus one value per field.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    ty: Arc<TypeDescriptor>,
    fields: Vec<Value>,
}

impl StructValue {
    /// Builds a struct value.
    ///
    /// # Errors
    ///
    /// - [`Error::ArgumentType`] if `ty` is not a struct or union
    /// - [`Error::SequenceLength`] if the field count is wrong
    pub fn new(ty: Arc<TypeDescriptor>, fields: Vec<Value>) -> Result<StructValue> {
        let Some(st) = ty.struct_type() else {
            return Err(Error::ArgumentType {
                expected: "struct or union type".to_string(),
                got: ty.type_name(),
            });
        };
        if st.fields.len() != fields.len() {
            return Err(Error::SequenceLength {
                type_name: ty.type_name(),
                expected: st.fields.len(),
                got: fields.len(),
            });
        }
        Ok(StructValue { ty, fields })
    }

    /// Struct type.
    #[must_use]
    pub fn ty(&self) -> &Arc<TypeDescriptor> {
        &self.ty
    }

    /// Field values in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    /// Field by position.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.fields.get(index)
    }

    /// Field by name, for encodings that carry field names.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        let index = self.field_index(name)?;
        self.fields.get(index)
    }

    /// Replaces a named field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AttributeNotFound`] for an unknown field name.
    pub fn set_field(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let index = self.field_index(name).ok_or_else(|| Error::AttributeNotFound {
            class: self.ty.type_name(),
            name: name.to_string(),
        })?;
        self.fields[index] = value.into();
        Ok(())
    }

    fn field_index(&self, name: &str) -> Option<usize> {
        self.ty
            .struct_type()?
            .fields
            .iter()
            .position(|f| f.name.as_deref() == Some(name))
    }
}

/// Builds a struct or array value of type `ty` from a sequence.
///
/// Nested lists become nested structs and arrays where the field or element
/// type is an aggregate.
///
/// # Errors
///
/// - [`Error::SequenceLength`] if the lengths differ
/// - [`Error::ArgumentType`] if `ty` is neither a struct nor an array
pub fn compound_value_for_sequence(seq: &[Value], ty: &Arc<TypeDescriptor>) -> Result<Value> {
    let nested = |value: &Value, field_ty: &Arc<TypeDescriptor>| -> Result<Value> {
        match value.unwrapped() {
            Value::List(items) if is_compound(field_ty) => {
                compound_value_for_sequence(items, field_ty)
            }
            other => Ok(other.clone()),
        }
    };

    match ty.kind() {
        TypeKind::Struct(st) => {
            if seq.len() != st.fields.len() {
                return Err(Error::SequenceLength {
                    type_name: ty.type_name(),
                    expected: st.fields.len(),
                    got: seq.len(),
                });
            }
            let fields = seq
                .iter()
                .zip(&st.fields)
                .map(|(value, field)| nested(value, &field.ty))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Struct(StructValue {
                ty: Arc::clone(ty),
                fields,
            }))
        }
        TypeKind::Array { len, elem } => {
            if seq.len() != *len {
                return Err(Error::SequenceLength {
                    type_name: ty.type_name(),
                    expected: *len,
                    got: seq.len(),
                });
            }
            let items = seq
                .iter()
                .map(|value| nested(value, elem))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::List(items))
        }
        _ => Err(Error::ArgumentType {
            expected: "struct or array type".to_string(),
            got: ty.type_name(),
        }),
    }
}

fn is_compound(ty: &TypeDescriptor) -> bool {
    matches!(ty.kind(), TypeKind::Struct(_) | TypeKind::Array { .. })
}

// ============================================================================
// Call boundary
// ============================================================================

/// Storage that must outlive a native call.
#[derive(Default)]
pub struct Temporaries {
    strings: Vec<CString>,
    buffers: Vec<NativeBuffer>,
    blocks: Vec<ObjCBlock>,
}

impl Temporaries {
    /// Whether nothing was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.buffers.is_empty() && self.blocks.is_empty()
    }
}

fn mismatch(ty: &TypeDescriptor, value: &Value) -> Error {
    Error::ArgumentType {
        expected: ty.type_name(),
        got: value.type_label().to_string(),
    }
}

fn unsupported(ty: &TypeDescriptor) -> Error {
    Error::UnsupportedEncoding {
        code: encoding::encode(ty),
        context: None,
    }
}

fn integer(ty: &TypeDescriptor, value: &Value) -> Result<i128> {
    match *value {
        Value::Bool(b) => Ok(i128::from(b)),
        Value::Int(v) => Ok(i128::from(v)),
        Value::UInt(v) => Ok(i128::from(v)),
        ref other => Err(mismatch(ty, other)),
    }
}

fn ranged(ty: &TypeDescriptor, value: &Value, min: i128, max: i128) -> Result<i128> {
    let v = integer(ty, value)?;
    if v < min || v > max {
        return Err(Error::ValueOutOfRange {
            value: v.to_string(),
            encoding: encoding::encode(ty),
        });
    }
    Ok(v)
}

fn float(ty: &TypeDescriptor, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .filter(|_| !matches!(value, Value::Bool(_)))
        .ok_or_else(|| mismatch(ty, value))
}

unsafe fn put<T>(dst: *mut u8, value: T) {
    // SAFETY: callers pass buffers sized for the descriptor
    unsafe { dst.cast::<T>().write_unaligned(value) };
}

unsafe fn get<T: Copy>(src: *const u8) -> T {
    // SAFETY: callers pass buffers sized for the descriptor
    unsafe { src.cast::<T>().read_unaligned() }
}

/// Writes `value` into `dst` as type `ty`.
///
/// Objects created on the way (strings, numbers, collections) are
/// autoreleased into the current pool; anything else that must outlive the
/// call goes into `keep`.
///
/// # Safety
///
/// `dst` must be valid for `ty.size()` bytes of writes.
///
/// # Errors
///
/// - [`Error::ArgumentType`] if the value has the wrong kind
/// - [`Error::ValueOutOfRange`] if an integer does not fit
/// - [`Error::SequenceLength`] for struct or array sequences of the wrong
///   length
/// - [`Error::StructShapeMismatch`] for incompatible struct values
pub unsafe fn write_value(
    ty: &TypeDescriptor,
    value: &Value,
    dst: *mut u8,
    keep: &mut Temporaries,
) -> Result<()> {
    let value = value.unwrapped();
    // SAFETY: dst is valid for ty.size() bytes
    unsafe {
        match ty.kind() {
            TypeKind::Char => put(dst, ranged(ty, value, i8::MIN.into(), i8::MAX.into())? as i8),
            TypeKind::UChar => put(dst, ranged(ty, value, 0, u8::MAX.into())? as u8),
            TypeKind::Short => put(dst, ranged(ty, value, i16::MIN.into(), i16::MAX.into())? as i16),
            TypeKind::UShort => put(dst, ranged(ty, value, 0, u16::MAX.into())? as u16),
            TypeKind::Int | TypeKind::Long => {
                put(dst, ranged(ty, value, i32::MIN.into(), i32::MAX.into())? as i32);
            }
            TypeKind::UInt | TypeKind::ULong => {
                put(dst, ranged(ty, value, 0, u32::MAX.into())? as u32);
            }
            TypeKind::LongLong => {
                put(dst, ranged(ty, value, i64::MIN.into(), i64::MAX.into())? as i64);
            }
            TypeKind::ULongLong => put(dst, ranged(ty, value, 0, u64::MAX.into())? as u64),
            TypeKind::Bool => {
                let flag = match *value {
                    Value::Bool(b) => b,
                    _ => integer(ty, value)? != 0,
                };
                put(dst, u8::from(flag));
            }
            TypeKind::Float => put(dst, float(ty, value)? as f32),
            // long double travels as a double in the low bytes
            TypeKind::Double | TypeKind::LongDouble => put(dst, float(ty, value)?),
            TypeKind::CString => {
                let ptr = match value {
                    Value::None => std::ptr::null(),
                    Value::Pointer(addr) => *addr as *const c_char,
                    Value::Str(text) => keep_c_string(text.as_bytes(), keep)?,
                    Value::Bytes(bytes) => keep_c_string(bytes, keep)?,
                    other => return Err(mismatch(ty, other)),
                };
                put(dst, ptr);
            }
            TypeKind::Selector => {
                let ptr = match value {
                    Value::None => std::ptr::null(),
                    Value::Selector(sel) => sel.as_ptr(),
                    Value::Str(name) => Sel::register(name).as_ptr(),
                    other => return Err(mismatch(ty, other)),
                };
                put(dst, ptr);
            }
            TypeKind::Class => {
                let ptr = match value {
                    Value::None => ObjectPtr::NIL,
                    Value::Class(_) | Value::Metaclass(_) => value.object_ptr(),
                    other => return Err(mismatch(ty, other)),
                };
                put(dst, ptr);
            }
            TypeKind::Object { .. } => {
                if let Value::Callable(_) = value {
                    return Err(Error::ArgumentType {
                        expected: "object (a block needs an '@?<...>' signature)".to_string(),
                        got: value.type_label().to_string(),
                    });
                }
                put(dst, object_for_value(value)?);
            }
            TypeKind::Block { signature } => {
                let ptr = match value {
                    Value::None => std::ptr::null_mut(),
                    Value::Block(block) => block.as_ptr(),
                    Value::Callable(f) => {
                        let signature = signature.as_deref().ok_or_else(|| Error::ArgumentType {
                            expected: "block with a known signature".to_string(),
                            got: "callable".to_string(),
                        })?;
                        let block = ObjCBlock::from_host(signature, Arc::clone(f))?;
                        let ptr = block.as_ptr();
                        keep.blocks.push(block);
                        ptr
                    }
                    other => return Err(mismatch(ty, other)),
                };
                put(dst, ptr);
            }
            TypeKind::Pointer(pointee) => {
                let addr = pointer_for_value(ty, pointee, value, keep)?;
                put(dst, addr);
            }
            TypeKind::Array { len, elem } => {
                let Value::List(items) = value else {
                    return Err(mismatch(ty, value));
                };
                if items.len() != *len {
                    return Err(Error::SequenceLength {
                        type_name: ty.type_name(),
                        expected: *len,
                        got: items.len(),
                    });
                }
                for (index, item) in items.iter().enumerate() {
                    write_value(elem, item, dst.add(index * elem.size()), keep)?;
                }
            }
            TypeKind::Struct(st) | TypeKind::Union(st) => {
                let fields = match value {
                    Value::Struct(sv) => {
                        if !same_shape(&sv.ty, ty) {
                            return Err(Error::StructShapeMismatch {
                                expected: encoding::encode(ty),
                                got: encoding::encode(&sv.ty),
                            });
                        }
                        &sv.fields
                    }
                    Value::List(items) => {
                        if items.len() != st.fields.len() {
                            return Err(Error::SequenceLength {
                                type_name: ty.type_name(),
                                expected: st.fields.len(),
                                got: items.len(),
                            });
                        }
                        items
                    }
                    other => return Err(mismatch(ty, other)),
                };
                for (field, value) in st.fields.iter().zip(fields) {
                    let at = dst.add(field.offset);
                    match field.bits {
                        Some((shift, width)) => {
                            let max = (1i128 << width) - 1;
                            let bits = ranged(&field.ty, value.unwrapped(), 0, max)? as u32;
                            let mask = (((1u64 << width) - 1) as u32) << shift;
                            let unit = get::<u32>(at);
                            put(at, (unit & !mask) | ((bits << shift) & mask));
                        }
                        None => write_value(&field.ty, value, at, keep)?,
                    }
                }
            }
            TypeKind::Void
            | TypeKind::Unknown
            | TypeKind::Opaque(_)
            | TypeKind::Bitfield(_) => return Err(unsupported(ty)),
        }
    }
    Ok(())
}

fn keep_c_string(bytes: &[u8], keep: &mut Temporaries) -> Result<*const c_char> {
    let text = CString::new(bytes).map_err(|_| Error::ArgumentType {
        expected: "string without NUL bytes".to_string(),
        got: "str".to_string(),
    })?;
    let ptr = text.as_ptr();
    keep.strings.push(text);
    Ok(ptr)
}

fn pointer_for_value(
    ty: &TypeDescriptor,
    pointee: &Arc<TypeDescriptor>,
    value: &Value,
    keep: &mut Temporaries,
) -> Result<usize> {
    let addr = match value {
        Value::None => 0,
        Value::Pointer(addr) => *addr,
        Value::Object(obj) => obj.ptr().addr(),
        Value::Bytes(bytes) => {
            let mut buffer = NativeBuffer::new(bytes.len());
            // SAFETY: the buffer holds bytes.len() bytes
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.as_mut_ptr(), bytes.len());
            }
            let addr = buffer.as_ptr() as usize;
            keep.buffers.push(buffer);
            addr
        }
        Value::Str(text) if matches!(pointee.kind(), TypeKind::Char | TypeKind::UChar | TypeKind::Void) => {
            keep_c_string(text.as_bytes(), keep)? as usize
        }
        Value::Struct(_) if is_compound(pointee) || matches!(pointee.kind(), TypeKind::Union(_)) => {
            // By reference: the callee sees a private copy.
            let mut buffer = NativeBuffer::new(pointee.size());
            // SAFETY: the buffer is sized for the pointee
            unsafe { write_value(pointee, value, buffer.as_mut_ptr(), keep)? };
            let addr = buffer.as_ptr() as usize;
            keep.buffers.push(buffer);
            addr
        }
        Value::List(items) if pointee.size() > 0 => {
            // C array of pointee values.
            let stride = pointee.size();
            let mut buffer = NativeBuffer::new(stride * items.len());
            for (index, item) in items.iter().enumerate() {
                // SAFETY: index < items.len(), each slot is `stride` bytes
                unsafe { write_value(pointee, item, buffer.as_mut_ptr().add(index * stride), keep)? };
            }
            let addr = buffer.as_ptr() as usize;
            keep.buffers.push(buffer);
            addr
        }
        other => return Err(mismatch(ty, other)),
    };
    Ok(addr)
}

/// Writes a value into storage that outlives the current call: callback
/// return slots and instance variables.
///
/// Values that would need temporary storage (C strings, by-reference
/// buffers, fresh blocks) are rejected and `dst` is zeroed.
///
/// # Safety
///
/// `dst` must be valid for `ty.size()` bytes of writes.
///
/// # Errors
///
/// See [`write_value`]; also [`Error::ArgumentType`] for values that need
/// temporary storage.
pub unsafe fn write_persistent(ty: &TypeDescriptor, value: &Value, dst: *mut u8) -> Result<()> {
    let mut keep = Temporaries::default();
    // SAFETY: forwarded contract
    unsafe { write_value(ty, value, dst, &mut keep)? };
    if !keep.is_empty() {
        // SAFETY: forwarded contract
        unsafe { std::ptr::write_bytes(dst, 0, ty.size()) };
        return Err(Error::ArgumentType {
            expected: format!("{} without temporary storage", ty.type_name()),
            got: value.type_label().to_string(),
        });
    }
    Ok(())
}

/// Reads a value of type `ty` from `src`.
///
/// Objects are wrapped without taking ownership: the wrapper retains.
///
/// # Safety
///
/// `src` must be valid for `ty.size()` bytes of reads and hold a value of
/// that type.
///
/// # Errors
///
/// Returns [`Error::UnsupportedEncoding`] for types without a host form.
pub unsafe fn read_value(ty: &Arc<TypeDescriptor>, src: *const u8) -> Result<Value> {
    // SAFETY: src is valid for ty.size() bytes
    unsafe {
        Ok(match ty.kind() {
            TypeKind::Void => Value::None,
            TypeKind::Char => Value::Int(get::<i8>(src).into()),
            TypeKind::UChar => Value::UInt(get::<u8>(src).into()),
            TypeKind::Short => Value::Int(get::<i16>(src).into()),
            TypeKind::UShort => Value::UInt(get::<u16>(src).into()),
            TypeKind::Int | TypeKind::Long => Value::Int(get::<i32>(src).into()),
            TypeKind::UInt | TypeKind::ULong => Value::UInt(get::<u32>(src).into()),
            TypeKind::LongLong => Value::Int(get::<i64>(src)),
            TypeKind::ULongLong => Value::UInt(get::<u64>(src)),
            TypeKind::Bool => Value::Bool(get::<u8>(src) != 0),
            TypeKind::Float => Value::Float(get::<f32>(src).into()),
            TypeKind::Double | TypeKind::LongDouble => Value::Float(get::<f64>(src)),
            TypeKind::CString => {
                let ptr = get::<*const c_char>(src);
                if ptr.is_null() {
                    Value::None
                } else {
                    let text = CStr::from_ptr(ptr);
                    match text.to_str() {
                        Ok(s) => Value::Str(s.to_string()),
                        Err(_) => Value::Bytes(text.to_bytes().to_vec()),
                    }
                }
            }
            TypeKind::Object { .. } | TypeKind::Class => wrap(get::<ObjectPtr>(src), false)?,
            TypeKind::Block { .. } => {
                let ptr = get::<*mut crate::runtime::block::BlockLiteral>(src);
                if ptr.is_null() {
                    Value::None
                } else {
                    Value::Block(ObjCBlock::from_ptr(ptr)?)
                }
            }
            TypeKind::Selector => {
                Sel::from_ptr(get::<*const u8>(src)).map_or(Value::None, Value::Selector)
            }
            TypeKind::Pointer(_) => match get::<usize>(src) {
                0 => Value::None,
                addr => Value::Pointer(addr),
            },
            TypeKind::Array { len, elem } => {
                let items = (0..*len)
                    .map(|index| read_value(elem, src.add(index * elem.size())))
                    .collect::<Result<Vec<_>>>()?;
                Value::List(items)
            }
            TypeKind::Struct(st) | TypeKind::Union(st) => {
                let fields = st
                    .fields
                    .iter()
                    .map(|field| {
                        let at = src.add(field.offset);
                        match field.bits {
                            Some((shift, width)) => {
                                let unit = u64::from(get::<u32>(at));
                                Ok(Value::UInt((unit >> shift) & ((1u64 << width) - 1)))
                            }
                            None => read_value(&field.ty, at),
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                Value::Struct(StructValue {
                    ty: Arc::clone(ty),
                    fields,
                })
            }
            TypeKind::Unknown | TypeKind::Opaque(_) | TypeKind::Bitfield(_) => {
                return Err(unsupported(ty));
            }
        })
    }
}

// ============================================================================
// Object boundary
// ============================================================================

fn arg<T>(slot: &mut T) -> *mut u8 {
    (slot as *mut T).cast()
}

fn class_object(class: crate::runtime::Class) -> ObjectPtr {
    class.as_object()
}

fn new_ns_string(text: &str) -> Result<ObjectPtr> {
    let class = class_object(foundation::classes().ns_string);
    let mut bytes = text.as_ptr();
    let mut length = text.len() as u64;
    let mut encoding = NS_UTF8_STRING_ENCODING;
    // SAFETY: alloc takes no arguments; the initializer takes
    // (const void *, NSUInteger, NSUInteger) and returns an object
    unsafe {
        let allocated: ObjectPtr = send_raw(class, "alloc", &[])?;
        let obj: ObjectPtr = send_raw(
            allocated,
            "initWithBytes:length:encoding:",
            &[arg(&mut bytes), arg(&mut length), arg(&mut encoding)],
        )?;
        Ok(autorelease(obj))
    }
}

fn new_ns_number<T: Copy>(selector: &str, mut value: T) -> Result<ObjectPtr> {
    let class = class_object(foundation::classes().ns_number);
    // SAFETY: the numberWith*: factories take one scalar of type T
    unsafe { send_raw(class, selector, &[arg(&mut value)]) }
}

/// Converts a host value to a native object, autoreleased into the current
/// pool. Object-like values pass through unchanged.
///
/// # Errors
///
/// Returns [`Error::ArgumentType`] for values without a Foundation form.
pub(crate) fn object_for_value(value: &Value) -> Result<ObjectPtr> {
    let f = foundation::classes();
    match value.unwrapped() {
        Value::None => Ok(ObjectPtr::NIL),
        Value::Object(_) | Value::Class(_) | Value::Metaclass(_) | Value::Protocol(_) => {
            Ok(value.object_ptr())
        }
        Value::Block(block) => Ok(ObjectPtr::from_addr(block.as_ptr() as usize)),
        Value::Bool(b) => new_ns_number("numberWithBool:", *b),
        Value::Int(v) => new_ns_number("numberWithLongLong:", *v),
        Value::UInt(v) => new_ns_number("numberWithUnsignedLongLong:", *v),
        Value::Float(v) => new_ns_number("numberWithDouble:", *v),
        Value::Str(text) => new_ns_string(text),
        Value::Decimal(decimal) => {
            let mut text = new_ns_string(&decimal.to_string())?;
            // SAFETY: one object argument, returns an object
            unsafe {
                send_raw(
                    class_object(f.ns_decimal_number),
                    "decimalNumberWithString:",
                    &[arg(&mut text)],
                )
            }
        }
        Value::Bytes(bytes) => {
            let mut ptr = bytes.as_ptr();
            let mut length = bytes.len() as u64;
            // SAFETY: (const void *, NSUInteger), returns an object
            unsafe {
                send_raw(
                    class_object(f.ns_data),
                    "dataWithBytes:length:",
                    &[arg(&mut ptr), arg(&mut length)],
                )
            }
        }
        Value::List(items) => {
            // SAFETY: no arguments, returns an object
            let array: ObjectPtr =
                unsafe { send_raw(class_object(f.ns_mutable_array), "array", &[]) }?;
            for item in items {
                let mut element = collection_element(item)?;
                // SAFETY: one object argument, returns void
                unsafe { send_raw::<()>(array, "addObject:", &[arg(&mut element)]) }?;
            }
            Ok(array)
        }
        Value::Dict(map) => {
            // SAFETY: no arguments, returns an object
            let dict: ObjectPtr =
                unsafe { send_raw(class_object(f.ns_mutable_dictionary), "dictionary", &[]) }?;
            for (key, value) in map.iter() {
                let mut key = collection_element(key)?;
                let mut value = collection_element(value)?;
                // SAFETY: two object arguments, returns void
                unsafe {
                    send_raw::<()>(dict, "setObject:forKey:", &[arg(&mut value), arg(&mut key)])
                }?;
            }
            Ok(dict)
        }
        other => Err(Error::ArgumentType {
            expected: "value convertible to an object".to_string(),
            got: other.type_label().to_string(),
        }),
    }
}

fn collection_element(value: &Value) -> Result<ObjectPtr> {
    if value.is_none() {
        return Err(Error::ArgumentType {
            expected: "object (collections cannot hold nil)".to_string(),
            got: "None".to_string(),
        });
    }
    object_for_value(value)
}

/// Converts a host value to a wrapped Foundation object.
///
/// Text becomes `NSString`, booleans and numbers `NSNumber`, decimals
/// `NSDecimalNumber`, bytes `NSData`, lists `NSMutableArray` and maps
/// `NSMutableDictionary`, converting elements recursively. Wrapped objects,
/// classes and protocols are returned as they are; `None` stays `None`.
///
/// # Errors
///
/// Returns [`Error::ArgumentType`] for values without a Foundation form.
///
/// # Example
///
/// ```rust
/// use oxbridge::bridge::value::{Value, ns_from_value, value_from_ns};
///
/// let text = ns_from_value(&Value::from("héllo")).unwrap();
/// assert!(text.as_object().is_some());
/// assert_eq!(value_from_ns(&text).unwrap(), Value::from("héllo"));
/// ```
pub fn ns_from_value(value: &Value) -> Result<Value> {
    autoreleasepool(|| {
        let ptr = object_for_value(value)?;
        wrap(ptr, false)
    })
}

/// Converts Foundation objects back to host values.
///
/// Strings, numbers, decimals, data, arrays and dictionaries convert
/// recursively; other objects and non-object values are returned
/// unchanged.
///
/// # Errors
///
/// - [`Error::UnhashableKey`] if a dictionary key converts to a list or map
/// - errors from the underlying message sends
pub fn value_from_ns(value: &Value) -> Result<Value> {
    match value.unwrapped() {
        Value::Object(obj) => autoreleasepool(|| value_from_ptr(obj.ptr())),
        other => Ok(other.clone()),
    }
}

fn value_from_ptr(ptr: ObjectPtr) -> Result<Value> {
    let Some(class) = object_get_class(ptr) else {
        return Ok(Value::None);
    };
    let f = foundation::classes();

    // SAFETY (all sends below): zero-argument accessors returning the
    // declared scalar or object type, or one NSUInteger / object argument
    unsafe {
        if class.is_subclass_of(f.ns_string) {
            let mut encoding = NS_UTF8_STRING_ENCODING;
            let length: u64 =
                send_raw(ptr, "lengthOfBytesUsingEncoding:", &[arg(&mut encoding)])?;
            let text: *const u8 = send_raw(ptr, "UTF8String", &[])?;
            if text.is_null() || length == 0 {
                return Ok(Value::Str(String::new()));
            }
            let bytes = std::slice::from_raw_parts(text, length as usize);
            return Ok(Value::Str(String::from_utf8_lossy(bytes).into_owned()));
        }

        // NSDecimalNumber is an NSNumber; test it first.
        if class.is_subclass_of(f.ns_decimal_number) {
            let description: ObjectPtr = send_raw(ptr, "description", &[])?;
            let text = match value_from_ptr(description)? {
                Value::Str(text) => text,
                _ => String::new(),
            };
            if text == "NaN" {
                return Ok(Value::Float(f64::NAN));
            }
            return Ok(Value::Decimal(text.parse()?));
        }

        if class.is_subclass_of(f.ns_number) {
            let code: *const c_char = send_raw(ptr, "objCType", &[])?;
            let code = if code.is_null() { b'q' } else { *code.cast::<u8>() };
            return Ok(match code {
                b'B' => Value::Bool(send_raw(ptr, "boolValue", &[])?),
                b'f' | b'd' => Value::Float(send_raw(ptr, "doubleValue", &[])?),
                b'Q' | b'L' | b'I' | b'S' | b'C' => {
                    Value::UInt(send_raw(ptr, "unsignedLongLongValue", &[])?)
                }
                _ => Value::Int(send_raw(ptr, "longLongValue", &[])?),
            });
        }

        if class.is_subclass_of(f.ns_data) {
            let bytes: *const u8 = send_raw(ptr, "bytes", &[])?;
            let length: u64 = send_raw(ptr, "length", &[])?;
            if bytes.is_null() || length == 0 {
                return Ok(Value::Bytes(Vec::new()));
            }
            return Ok(Value::Bytes(
                std::slice::from_raw_parts(bytes, length as usize).to_vec(),
            ));
        }

        if class.is_subclass_of(f.ns_array) {
            return Ok(Value::List(array_values(ptr)?));
        }

        if class.is_subclass_of(f.ns_dictionary) {
            let keys: ObjectPtr = send_raw(ptr, "allKeys", &[])?;
            let count: u64 = send_raw(keys, "count", &[])?;
            let mut map = ValueMap::new();
            for mut index in 0..count {
                let mut key: ObjectPtr = send_raw(keys, "objectAtIndex:", &[arg(&mut index)])?;
                let value: ObjectPtr = send_raw(ptr, "objectForKey:", &[arg(&mut key)])?;
                map.insert(value_from_ptr(key)?, value_from_ptr(value)?)?;
            }
            return Ok(Value::Dict(map));
        }
    }

    wrap(ptr, false)
}

unsafe fn array_values(array: ObjectPtr) -> Result<Vec<Value>> {
    // SAFETY: NSArray accessors
    unsafe {
        let count: u64 = send_raw(array, "count", &[])?;
        (0..count)
            .map(|mut index| {
                let item: ObjectPtr = send_raw(array, "objectAtIndex:", &[arg(&mut index)])?;
                value_from_ptr(item)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::encoding::decode;

    fn write_read(encoding: &str, value: &Value) -> Result<Value> {
        let ty = decode(encoding)?;
        let mut buffer = NativeBuffer::new(ty.size().max(8));
        let mut keep = Temporaries::default();
        unsafe {
            write_value(&ty, value, buffer.as_mut_ptr(), &mut keep)?;
            read_value(&ty, buffer.as_ptr())
        }
    }

    #[test]
    fn test_decimal_parse_and_display() {
        let d: Decimal = "12.50".parse().unwrap();
        assert_eq!(d.scale(), 2);
        assert_eq!(d.to_string(), "12.50");
        assert_eq!(d, "12.5".parse::<Decimal>().unwrap());
        assert_eq!("-0.001".parse::<Decimal>().unwrap().to_string(), "-0.001");
        assert_eq!("1e3".parse::<Decimal>().unwrap().to_string(), "1000");
        assert_eq!("1e3".parse::<Decimal>().unwrap(), "1000".parse::<Decimal>().unwrap());
        assert!("abc".parse::<Decimal>().is_err());
        assert!(".".parse::<Decimal>().is_err());
    }

    #[test]
    fn test_decimal_scale_limits() {
        for text in ["1e-9223372036854775808", "1e9223372036854775807", "1e-4097", "1.5e-4096"] {
            let err = text.parse::<Decimal>().unwrap_err();
            assert!(matches!(err, Error::ValueOutOfRange { .. }), "{text}: {err}");
        }
        assert!(Decimal::new(BigInt::from(1), i64::MIN).is_err());
        assert!(Decimal::new(BigInt::from(1), MAX_DECIMAL_SCALE + 1).is_err());

        let big: Decimal = "1e4096".parse().unwrap();
        let shown = big.to_string();
        assert_eq!(shown.len(), 4097);
        assert!(shown.starts_with('1'));
        let small: Decimal = "1e-4096".parse().unwrap();
        assert_eq!(small.to_string().len(), 4098);
    }

    #[test]
    fn test_map_rejects_unhashable_keys() {
        let mut map = ValueMap::new();
        let err = map
            .insert(Value::List(vec![Value::Int(1)]), Value::Int(2))
            .unwrap_err();
        assert_eq!(err, Error::UnhashableKey("list".into()));
    }

    #[test]
    fn test_map_equality_ignores_order() {
        let a = ValueMap::from_pairs([("one", 1), ("two", 2)]).unwrap();
        let b = ValueMap::from_pairs([("two", 2), ("one", 1)]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_enum_unwrapping() {
        let member = Value::enum_member("Color.Red", 3);
        assert_eq!(write_read("i", &member).unwrap(), Value::Int(3));
        assert_eq!(member, Value::Int(3));
    }

    #[test]
    fn test_integer_ranges() {
        assert!(matches!(
            write_read("c", &Value::Int(200)),
            Err(Error::ValueOutOfRange { .. })
        ));
        assert!(matches!(
            write_read("I", &Value::Int(-1)),
            Err(Error::ValueOutOfRange { .. })
        ));
        assert_eq!(write_read("Q", &Value::UInt(u64::MAX)).unwrap(), Value::UInt(u64::MAX));
        assert_eq!(write_read("s", &Value::Int(-300)).unwrap(), Value::Int(-300));
    }

    #[test]
    fn test_type_mismatch() {
        assert!(matches!(
            write_read("i", &Value::Str("1".into())),
            Err(Error::ArgumentType { .. })
        ));
        assert!(matches!(
            write_read("d", &Value::Bool(true)),
            Err(Error::ArgumentType { .. })
        ));
    }

    #[test]
    fn test_struct_from_sequence() {
        let out = write_read("{ValRect={ValPt=dd}{ValSz=dd}}", &Value::List(vec![
            Value::List(vec![1.0.into(), 2.0.into()]),
            Value::List(vec![3.0.into(), 4.0.into()]),
        ]))
        .unwrap();
        let Value::Struct(rect) = out else { panic!("expected struct") };
        let Some(Value::Struct(origin)) = rect.get(0) else { panic!("expected nested struct") };
        assert_eq!(origin.fields(), [Value::Float(1.0), Value::Float(2.0)]);
    }

    #[test]
    fn test_sequence_length_checked() {
        let err = write_read("{ValPair=ii}", &Value::List(vec![Value::Int(1)])).unwrap_err();
        assert!(matches!(err, Error::SequenceLength { expected: 2, got: 1, .. }));
    }

    #[test]
    fn test_anonymous_struct_matches_named() {
        let anon = compound_value_for_sequence(
            &[Value::Float(1.5), Value::Float(2.5)],
            &decode("{?=dd}").unwrap(),
        )
        .unwrap();
        let out = write_read("{ValNamedPoint=dd}", &anon).unwrap();
        let Value::Struct(sv) = out else { panic!("expected struct") };
        assert_eq!(sv.fields(), [Value::Float(1.5), Value::Float(2.5)]);

        let err = write_read("{ValOtherPoint=dd}", &Value::Struct(sv)).unwrap_err();
        assert!(matches!(err, Error::StructShapeMismatch { .. }));
    }

    #[test]
    fn test_bitfields_round_trip() {
        let ty = decode("{ValFlags=b1b3b4}").unwrap();
        let value = compound_value_for_sequence(&[1.into(), 5.into(), 9.into()], &ty).unwrap();
        let out = write_read("{ValFlags=b1b3b4}", &value).unwrap();
        let Value::Struct(sv) = out else { panic!("expected struct") };
        assert_eq!(sv.fields(), [Value::UInt(1), Value::UInt(5), Value::UInt(9)]);
        assert!(matches!(
            write_read("{ValFlags=b1b3b4}", &Value::List(vec![2.into(), 0.into(), 0.into()])),
            Err(Error::ValueOutOfRange { .. })
        ));
    }

    #[test]
    fn test_named_fields() {
        let ty = decode("{ValNamed=\"width\"d\"height\"d}").unwrap();
        let mut sv = StructValue::new(ty, vec![1.0.into(), 2.0.into()]).unwrap();
        assert_eq!(sv.field("height"), Some(&Value::Float(2.0)));
        sv.set_field("width", 10.0).unwrap();
        assert_eq!(sv.field("width"), Some(&Value::Float(10.0)));
        assert!(sv.set_field("depth", 1.0).is_err());
    }

    #[test]
    fn test_c_strings() {
        assert_eq!(write_read("*", &Value::from("abc")).unwrap(), Value::from("abc"));
        assert_eq!(write_read("*", &Value::None).unwrap(), Value::None);
    }

    #[test]
    fn test_array_values() {
        let out = write_read("[3s]", &Value::List(vec![1.into(), 2.into(), 3.into()])).unwrap();
        assert_eq!(out, Value::List(vec![1.into(), 2.into(), 3.into()]));
    }

    #[test]
    fn test_ns_scalars_round_trip() {
        for value in [
            Value::Bool(true),
            Value::Int(-42),
            Value::UInt(u64::MAX),
            Value::Float(2.5),
            Value::from("ünïcödé ✓"),
            Value::Bytes(vec![0, 1, 2, 255]),
        ] {
            let native = ns_from_value(&value).unwrap();
            assert_eq!(value_from_ns(&native).unwrap(), value);
        }
    }

    #[test]
    fn test_ns_decimal_keeps_digits() {
        let value = Value::Decimal("0.1000000000000000055511151231257827".parse().unwrap());
        let native = ns_from_value(&value).unwrap();
        assert_eq!(value_from_ns(&native).unwrap(), value);
    }

    #[test]
    fn test_ns_dictionary_round_trip() {
        let map = ValueMap::from_pairs([("one", 1), ("two", 2)]).unwrap();
        let native = ns_from_value(&Value::Dict(map.clone())).unwrap();
        assert_eq!(value_from_ns(&native).unwrap(), Value::Dict(map));
    }

    #[test]
    fn test_ns_nested_list() {
        let value = Value::List(vec![
            Value::from("a"),
            Value::List(vec![Value::Int(1), Value::Float(0.5)]),
        ]);
        let native = ns_from_value(&value).unwrap();
        assert_eq!(value_from_ns(&native).unwrap(), value);
    }

    #[test]
    fn test_ns_list_rejects_none() {
        let err = ns_from_value(&Value::List(vec![Value::None])).unwrap_err();
        assert!(matches!(err, Error::ArgumentType { .. }));
    }
}
