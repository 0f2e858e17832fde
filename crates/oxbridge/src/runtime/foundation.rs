//! Foundation classes.
//!
//! The minimal class set the marshaling layer converts to and from:
//!
//! | Class                 | Superclass     | Payload                     |
//! |-----------------------|----------------|-----------------------------|
//! | `NSObject`            | -              | none                        |
//! | `NSString`            | `NSObject`     | UTF-8 text                  |
//! | `NSNumber`            | `NSObject`     | bool, integer or double     |
//! | `NSDecimalNumber`     | `NSNumber`     | base-10 text                |
//! | `NSData`              | `NSObject`     | bytes                       |
//! | `NSArray`             | `NSObject`     | retained elements           |
//! | `NSMutableArray`      | `NSArray`      |                             |
//! | `NSDictionary`        | `NSObject`     | retained key/value pairs    |
//! | `NSMutableDictionary` | `NSDictionary` |                             |
//! | `Protocol`            | `NSObject`     | none (class of protocols)   |
//! | `OXHostValue`         | `NSObject`     | boxed host value            |
//!
//! Payloads live in the object header's [`Storage`] slot; every method
//! below is an ordinary IMP reachable through message sends. The classes are
//! installed on first use of [`classes`], which every public runtime lookup
//! triggers.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use crate::runtime::autorelease::autorelease;
use crate::runtime::class::{Class, Imp, ImpFn, Method, bootstrap_class};
use crate::runtime::message::msg_send;
use crate::runtime::object::{
    ObjectPtr, alloc_instance, dispose, object_get_class, object_is_class, release, retain,
    retain_count,
};
use crate::runtime::{Protocol, Sel};
use std::any::Any;
use std::ffi::{CStr, c_char};
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Per-object payload of the Foundation classes.
#[derive(Default)]
pub enum Storage {
    /// No payload (plain objects, empty collections).
    #[default]
    Empty,
    /// String text plus a lazily built C copy for `UTF8String`.
    String {
        /// Text.
        text: String,
        /// UTF-8 bytes plus a trailing NUL, handed out by `UTF8String`.
        /// Embedded NULs are kept; `lengthOfBytesUsingEncoding:` gives the
        /// full length.
        utf8: Option<Box<[u8]>>,
    },
    /// Number with the type code reported by `objCType`.
    Number {
        /// Value.
        value: Number,
        /// Type code (`B`, `i`, `q`, `Q`, `f`, `d`).
        code: u8,
    },
    /// Decimal number as base-10 text.
    Decimal(String),
    /// Bytes.
    Data(Vec<u8>),
    /// Retained elements.
    Array(Vec<ObjectPtr>),
    /// Retained key/value pairs in insertion order.
    Dictionary(Vec<(ObjectPtr, ObjectPtr)>),
    /// Host value attached by the bridge.
    Host(Box<dyn Any + Send + Sync>),
}

impl Storage {
    /// Releases retained children. Called once, when the owner is disposed.
    pub(crate) fn release_children(&self) {
        match self {
            Storage::Array(items) => items.iter().copied().for_each(release),
            Storage::Dictionary(pairs) => {
                for &(key, value) in pairs {
                    release(key);
                    release(value);
                }
            }
            _ => {}
        }
    }

    /// Unretained copy of everything but host payloads.
    fn snapshot(&self) -> Storage {
        match self {
            Storage::String { text, .. } => Storage::String {
                text: text.clone(),
                utf8: None,
            },
            Storage::Number { value, code } => Storage::Number {
                value: *value,
                code: *code,
            },
            Storage::Decimal(text) => Storage::Decimal(text.clone()),
            Storage::Data(bytes) => Storage::Data(bytes.clone()),
            Storage::Array(items) => Storage::Array(items.clone()),
            Storage::Dictionary(pairs) => Storage::Dictionary(pairs.clone()),
            Storage::Empty | Storage::Host(_) => Storage::Empty,
        }
    }
}

/// Numeric payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Signed(i64),
    /// Unsigned integer.
    Unsigned(u64),
    /// Floating point.
    Float(f64),
}

impl Number {
    fn as_i64(self) -> i64 {
        match self {
            Number::Bool(b) => i64::from(b),
            Number::Signed(v) => v,
            Number::Unsigned(v) => v as i64,
            Number::Float(v) => v as i64,
        }
    }

    fn as_u64(self) -> u64 {
        match self {
            Number::Unsigned(v) => v,
            Number::Float(v) => v as u64,
            other => other.as_i64() as u64,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn as_f64(self) -> f64 {
        match self {
            Number::Bool(b) => f64::from(u8::from(b)),
            Number::Signed(v) => v as f64,
            Number::Unsigned(v) => v as f64,
            Number::Float(v) => v,
        }
    }

    fn equals(self, other: Number) -> bool {
        match (self, other) {
            (Number::Float(_), _) | (_, Number::Float(_)) => self.as_f64() == other.as_f64(),
            (Number::Unsigned(a), b) | (b, Number::Unsigned(a)) => {
                i128::from(a) == b.as_i128()
            }
            (a, b) => a.as_i64() == b.as_i64(),
        }
    }

    fn as_i128(self) -> i128 {
        match self {
            Number::Unsigned(v) => i128::from(v),
            other => i128::from(other.as_i64()),
        }
    }

    fn text(self) -> String {
        match self {
            Number::Bool(b) => u8::from(b).to_string(),
            Number::Signed(v) => v.to_string(),
            Number::Unsigned(v) => v.to_string(),
            Number::Float(v) => v.to_string(),
        }
    }
}

/// `NSRange`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NSRange {
    /// Start, in UTF-16 code units.
    pub location: u64,
    /// Length, in UTF-16 code units.
    pub length: u64,
}

/// `NSNotFound`.
pub const NS_NOT_FOUND: u64 = i64::MAX as u64;

/// `NSUTF8StringEncoding`.
pub const NS_UTF8_STRING_ENCODING: u64 = 4;

/// The installed Foundation classes.
#[derive(Debug, Clone, Copy)]
pub struct Foundation {
    /// `NSObject`, the root class.
    pub ns_object: Class,
    /// `NSString`.
    pub ns_string: Class,
    /// `NSNumber`.
    pub ns_number: Class,
    /// `NSDecimalNumber`.
    pub ns_decimal_number: Class,
    /// `NSData`.
    pub ns_data: Class,
    /// `NSArray`.
    pub ns_array: Class,
    /// `NSMutableArray`.
    pub ns_mutable_array: Class,
    /// `NSDictionary`.
    pub ns_dictionary: Class,
    /// `NSMutableDictionary`.
    pub ns_mutable_dictionary: Class,
    /// `Protocol`, the class of protocol objects.
    pub protocol: Class,
    /// `OXHostValue`, boxes host values attached to native objects.
    pub host_value: Class,
}

static FOUNDATION: OnceLock<Foundation> = OnceLock::new();

/// Returns the Foundation classes, installing them on first call.
pub fn classes() -> &'static Foundation {
    FOUNDATION.get_or_init(install)
}

// ============================================================================
// IMP helpers
// ============================================================================

unsafe fn arg<T: Copy>(args: *const *mut u8, index: usize) -> T {
    // SAFETY: callers pass the declared argument index
    unsafe { (*args.add(index)).cast::<T>().read_unaligned() }
}

unsafe fn put<T>(ret: *mut u8, value: T) {
    if !ret.is_null() {
        // SAFETY: non-null return buffers are sized for the declared type
        unsafe { ret.cast::<T>().write_unaligned(value) };
    }
}

fn with_storage<R>(obj: ObjectPtr, f: impl FnOnce(&mut Storage) -> R) -> R {
    // SAFETY: IMPs only run on live receivers
    let header = unsafe { obj.header() };
    f(&mut header.storage.lock())
}

fn snapshot(obj: ObjectPtr) -> Storage {
    if obj.is_nil() || object_is_class(obj) {
        return Storage::Empty;
    }
    with_storage(obj, |storage| storage.snapshot())
}

/// Allocates an instance carrying `storage`. Returns +1.
fn new_object(class: Class, storage: Storage) -> ObjectPtr {
    match alloc_instance(class) {
        Ok(obj) => {
            with_storage(obj, |slot| *slot = storage);
            obj
        }
        Err(err) => {
            oxbridge_log::error!("cannot allocate {}: {err}", class.name());
            ObjectPtr::NIL
        }
    }
}

fn new_string(text: String) -> ObjectPtr {
    new_object(classes().ns_string, Storage::String { text, utf8: None })
}

fn send_object(receiver: ObjectPtr, selector: &str) -> ObjectPtr {
    let mut out = ObjectPtr::NIL;
    // SAFETY: zero-argument selector returning an object
    let sent = unsafe {
        msg_send(receiver, Sel::register(selector), std::ptr::null(), (&raw mut out).cast())
    };
    match sent {
        Ok(()) => out,
        Err(err) => {
            oxbridge_log::error!("{selector} failed: {err}");
            ObjectPtr::NIL
        }
    }
}

fn string_text(obj: ObjectPtr) -> Option<String> {
    match snapshot(obj) {
        Storage::String { text, .. } => Some(text),
        _ => None,
    }
}

fn number_of(obj: ObjectPtr) -> Number {
    match snapshot(obj) {
        Storage::Number { value, .. } => value,
        Storage::Decimal(text) => Number::Float(text.parse().unwrap_or(f64::NAN)),
        _ => Number::Signed(0),
    }
}

/// Payload equality, used by `isEqual:` and dictionary key lookup.
pub(crate) fn objects_equal(a: ObjectPtr, b: ObjectPtr) -> bool {
    if a == b {
        return true;
    }
    if a.is_nil() || b.is_nil() {
        return false;
    }
    match (snapshot(a), snapshot(b)) {
        (Storage::String { text: x, .. }, Storage::String { text: y, .. }) => x == y,
        (Storage::Number { value: x, .. }, Storage::Number { value: y, .. }) => x.equals(y),
        (Storage::Decimal(x), Storage::Decimal(y)) => x == y,
        (Storage::Data(x), Storage::Data(y)) => x == y,
        (Storage::Array(x), Storage::Array(y)) => {
            x.len() == y.len() && x.iter().zip(&y).all(|(&p, &q)| objects_equal(p, q))
        }
        (Storage::Dictionary(x), Storage::Dictionary(y)) => {
            x.len() == y.len()
                && x.iter().all(|&(key, value)| {
                    y.iter()
                        .find(|&&(other, _)| objects_equal(key, other))
                        .is_some_and(|&(_, other)| objects_equal(value, other))
                })
        }
        _ => false,
    }
}

fn object_hash(obj: ObjectPtr) -> u64 {
    let mut hasher = fxhash::FxHasher64::default();
    match snapshot(obj) {
        Storage::String { text, .. } => text.hash(&mut hasher),
        Storage::Number { value, .. } => {
            let f = value.as_f64();
            if f.fract() == 0.0 {
                value.as_i128().hash(&mut hasher);
            } else {
                f.to_bits().hash(&mut hasher);
            }
        }
        Storage::Decimal(text) => text.hash(&mut hasher),
        Storage::Data(bytes) => bytes.hash(&mut hasher),
        Storage::Array(items) => items.len().hash(&mut hasher),
        Storage::Dictionary(pairs) => pairs.len().hash(&mut hasher),
        Storage::Empty | Storage::Host(_) => obj.addr().hash(&mut hasher),
    }
    hasher.finish()
}

fn description_of(obj: ObjectPtr) -> String {
    if obj.is_nil() {
        return "(null)".to_string();
    }
    if object_is_class(obj) {
        return object_get_class(obj)
            .map_or_else(String::new, |meta| meta.name().to_string());
    }
    match snapshot(obj) {
        Storage::String { text, .. } => text,
        Storage::Number { value, .. } => value.text(),
        Storage::Decimal(text) => text,
        Storage::Data(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            format!("<{hex}>")
        }
        Storage::Array(items) => {
            let parts: Vec<String> = items.into_iter().map(description_of).collect();
            format!("({})", parts.join(", "))
        }
        Storage::Dictionary(pairs) => {
            let parts: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| format!("{} = {};", description_of(k), description_of(v)))
                .collect();
            format!("{{{}}}", parts.join(" "))
        }
        Storage::Empty | Storage::Host(_) => {
            let name = object_get_class(obj).map_or("?", Class::name);
            format!("<{name}: {:#x}>", obj.addr())
        }
    }
}

fn utf16_len(text: &str) -> u64 {
    text.encode_utf16().count() as u64
}

fn is_decimal_text(text: &str) -> bool {
    let body = text.strip_prefix(['+', '-']).unwrap_or(text);
    let (mantissa, exponent) = match body.split_once(['e', 'E']) {
        Some((m, e)) => (m, Some(e)),
        None => (body, None),
    };
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    let mantissa_ok = !(int.is_empty() && frac.is_empty()) && digits(int) && digits(frac);
    let exponent_ok = exponent.is_none_or(|e| {
        let e = e.strip_prefix(['+', '-']).unwrap_or(e);
        !e.is_empty() && digits(e)
    });
    mantissa_ok && exponent_ok
}

// ============================================================================
// NSObject
// ============================================================================

unsafe extern "C" fn obj_alloc(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let obj = match Class::from_object(this) {
        Some(class) => alloc_instance(class).unwrap_or_else(|err| {
            oxbridge_log::error!("alloc failed: {err}");
            ObjectPtr::NIL
        }),
        None => ObjectPtr::NIL,
    };
    // SAFETY: "@@:"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn obj_new(this: ObjectPtr, cmd: Sel, args: *const *mut u8, ret: *mut u8) {
    let mut allocated = ObjectPtr::NIL;
    // SAFETY: same signature as alloc
    unsafe { obj_alloc(this, cmd, args, (&raw mut allocated).cast()) };
    let initialized = send_object(allocated, "init");
    // SAFETY: "@@:"
    unsafe { put(ret, initialized) };
}

unsafe extern "C" fn obj_self(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:" / "#@:"
    unsafe { put(ret, this) };
}

unsafe extern "C" fn obj_dealloc(this: ObjectPtr, _: Sel, _: *const *mut u8, _: *mut u8) {
    // SAFETY: dealloc is only sent once the count reached zero
    unsafe { dispose(this) };
}

unsafe extern "C" fn obj_retain(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:"
    unsafe { put(ret, retain(this)) };
}

unsafe extern "C" fn obj_release(this: ObjectPtr, _: Sel, _: *const *mut u8, _: *mut u8) {
    release(this);
}

unsafe extern "C" fn obj_autorelease(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:"
    unsafe { put(ret, autorelease(this)) };
}

unsafe extern "C" fn obj_retain_count(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    // SAFETY: "Q@:"
    unsafe { put(ret, retain_count(this) as u64) };
}

unsafe extern "C" fn obj_class(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let class = object_get_class(this).map_or(ObjectPtr::NIL, Class::as_object);
    // SAFETY: "#@:"
    unsafe { put(ret, class) };
}

unsafe extern "C" fn obj_is_kind_of(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "B@:#"
    let target: ObjectPtr = unsafe { arg(args, 0) };
    let result = match (object_get_class(this), Class::from_object(target)) {
        (Some(class), Some(target)) => class.is_subclass_of(target),
        _ => false,
    };
    // SAFETY: "B@:#"
    unsafe { put(ret, result) };
}

unsafe extern "C" fn obj_responds_to(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "B@::"
    let raw: *const u8 = unsafe { arg(args, 0) };
    // SAFETY: selector arguments are produced by Sel::as_ptr
    let result = match (unsafe { Sel::from_ptr(raw) }, object_get_class(this)) {
        (Some(sel), Some(class)) => class.responds_to(sel),
        _ => false,
    };
    // SAFETY: "B@::"
    unsafe { put(ret, result) };
}

unsafe extern "C" fn obj_conforms_to(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "B@:@"
    let target: ObjectPtr = unsafe { arg(args, 0) };
    let class = if object_is_class(this) {
        Class::from_object(this)
    } else {
        object_get_class(this)
    };
    let result = match (class, Protocol::from_object(target)) {
        (Some(class), Some(protocol)) => class.conforms_to(protocol),
        _ => false,
    };
    // SAFETY: "B@:@"
    unsafe { put(ret, result) };
}

unsafe extern "C" fn obj_is_equal(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "B@:@"
    let other: ObjectPtr = unsafe { arg(args, 0) };
    // SAFETY: "B@:@"
    unsafe { put(ret, objects_equal(this, other)) };
}

unsafe extern "C" fn obj_hash(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    // SAFETY: "Q@:"
    unsafe { put(ret, object_hash(this)) };
}

unsafe extern "C" fn obj_description(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let text = autorelease(new_string(description_of(this)));
    // SAFETY: "@@:"
    unsafe { put(ret, text) };
}

unsafe extern "C" fn obj_copy(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    // Immutable values copy by retaining.
    // SAFETY: "@@:"
    unsafe { put(ret, retain(this)) };
}

// ============================================================================
// NSString
// ============================================================================

unsafe extern "C" fn str_with_utf8(_: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:r*"
    let raw: *const c_char = unsafe { arg(args, 0) };
    let obj = if raw.is_null() {
        ObjectPtr::NIL
    } else {
        // SAFETY: callers pass NUL-terminated strings
        let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        autorelease(new_string(text))
    };
    // SAFETY: "@@:r*"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn str_init_utf8(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:r*"
    let raw: *const c_char = unsafe { arg(args, 0) };
    let result = if raw.is_null() {
        release(this);
        ObjectPtr::NIL
    } else {
        // SAFETY: callers pass NUL-terminated strings
        let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        with_storage(this, |storage| *storage = Storage::String { text, utf8: None });
        this
    };
    // SAFETY: "@@:r*"
    unsafe { put(ret, result) };
}

unsafe extern "C" fn str_init_bytes(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:r^vQQ"
    let (bytes, length, encoding): (*const u8, u64, u64) =
        unsafe { (arg(args, 0), arg(args, 1), arg(args, 2)) };
    let slice = if bytes.is_null() || length == 0 {
        &[][..]
    } else {
        // SAFETY: caller passes `length` readable bytes
        unsafe { std::slice::from_raw_parts(bytes, length as usize) }
    };
    let text = match encoding {
        NS_UTF8_STRING_ENCODING => std::str::from_utf8(slice).ok().map(str::to_owned),
        // NSASCIIStringEncoding
        1 => slice.is_ascii().then(|| String::from_utf8_lossy(slice).into_owned()),
        _ => None,
    };
    let result = match text {
        Some(text) => {
            with_storage(this, |storage| *storage = Storage::String { text, utf8: None });
            this
        }
        None => {
            release(this);
            ObjectPtr::NIL
        }
    };
    // SAFETY: "@@:r^vQQ"
    unsafe { put(ret, result) };
}

unsafe extern "C" fn str_utf8(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let ptr = with_storage(this, |storage| match storage {
        Storage::String { text, utf8 } => {
            let bytes = utf8.get_or_insert_with(|| {
                let mut bytes = Vec::with_capacity(text.len() + 1);
                bytes.extend_from_slice(text.as_bytes());
                bytes.push(0);
                bytes.into_boxed_slice()
            });
            bytes.as_ptr().cast::<c_char>()
        }
        _ => std::ptr::null(),
    });
    // SAFETY: "r*@:"
    unsafe { put(ret, ptr) };
}

unsafe extern "C" fn str_length(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let length = string_text(this).map_or(0, |text| utf16_len(&text));
    // SAFETY: "Q@:"
    unsafe { put(ret, length) };
}

unsafe extern "C" fn str_length_of_bytes(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "Q@:Q"
    let encoding: u64 = unsafe { arg(args, 0) };
    let length = match (string_text(this), encoding) {
        (Some(text), NS_UTF8_STRING_ENCODING) => text.len() as u64,
        (Some(text), 1) if text.is_ascii() => text.len() as u64,
        _ => 0,
    };
    // SAFETY: "Q@:Q"
    unsafe { put(ret, length) };
}

unsafe extern "C" fn str_character_at(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "S@:Q"
    let index: u64 = unsafe { arg(args, 0) };
    let unit = string_text(this)
        .and_then(|text| text.encode_utf16().nth(index as usize))
        .unwrap_or(0);
    // SAFETY: "S@:Q"
    unsafe { put(ret, unit) };
}

unsafe extern "C" fn str_is_equal(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "B@:@"
    let other: ObjectPtr = unsafe { arg(args, 0) };
    let equal = match (string_text(this), string_text(other)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    // SAFETY: "B@:@"
    unsafe { put(ret, equal) };
}

unsafe extern "C" fn str_substring(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:{_NSRange=QQ}"
    let range: NSRange = unsafe { arg(args, 0) };
    let units: Vec<u16> = string_text(this).unwrap_or_default().encode_utf16().collect();
    let start = (range.location as usize).min(units.len());
    let end = start.saturating_add(range.length as usize).min(units.len());
    let obj = autorelease(new_string(String::from_utf16_lossy(&units[start..end])));
    // SAFETY: "@@:{_NSRange=QQ}"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn str_range_of(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "{_NSRange=QQ}@:@"
    let needle: ObjectPtr = unsafe { arg(args, 0) };
    let text = string_text(this).unwrap_or_default();
    let needle = string_text(needle).unwrap_or_default();
    let range = match text.find(&needle) {
        Some(at) if !needle.is_empty() => NSRange {
            location: utf16_len(&text[..at]),
            length: utf16_len(&needle),
        },
        _ => NSRange {
            location: NS_NOT_FOUND,
            length: 0,
        },
    };
    // SAFETY: "{_NSRange=QQ}@:@"
    unsafe { put(ret, range) };
}

unsafe extern "C" fn str_append(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:@"
    let other: ObjectPtr = unsafe { arg(args, 0) };
    let mut text = string_text(this).unwrap_or_default();
    text.push_str(&string_text(other).unwrap_or_default());
    let obj = autorelease(new_string(text));
    // SAFETY: "@@:@"
    unsafe { put(ret, obj) };
}

// ============================================================================
// NSNumber / NSDecimalNumber
// ============================================================================

fn new_number(value: Number, code: u8) -> ObjectPtr {
    autorelease(new_object(classes().ns_number, Storage::Number { value, code }))
}

macro_rules! number_factory {
    ($name:ident, $ty:ty, $code:literal, |$v:ident| $make:expr) => {
        unsafe extern "C" fn $name(_: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
            // SAFETY: single argument of the declared type
            let $v: $ty = unsafe { arg(args, 0) };
            let obj = new_number($make, $code);
            // SAFETY: returns an object
            unsafe { put(ret, obj) };
        }
    };
}

number_factory!(num_with_bool, bool, b'B', |v| Number::Bool(v));
number_factory!(num_with_int, i32, b'i', |v| Number::Signed(i64::from(v)));
number_factory!(num_with_long_long, i64, b'q', |v| Number::Signed(v));
number_factory!(num_with_unsigned_long_long, u64, b'Q', |v| Number::Unsigned(v));
number_factory!(num_with_float, f32, b'f', |v| Number::Float(f64::from(v)));
number_factory!(num_with_double, f64, b'd', |v| Number::Float(v));

macro_rules! number_accessor {
    ($name:ident, |$n:ident| $value:expr) => {
        unsafe extern "C" fn $name(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
            let $n = number_of(this);
            // SAFETY: return buffer sized for the accessor's type
            unsafe { put(ret, $value) };
        }
    };
}

number_accessor!(num_bool_value, |n| n.as_i64() != 0 || n.as_f64() != 0.0);
number_accessor!(num_int_value, |n| n.as_i64() as i32);
number_accessor!(num_long_long_value, |n| n.as_i64());
number_accessor!(num_unsigned_long_long_value, |n| n.as_u64());
number_accessor!(num_float_value, |n| n.as_f64() as f32);
number_accessor!(num_double_value, |n| n.as_f64());

static TYPE_CODES: [(u8, &CStr); 6] = [
    (b'B', c"B"),
    (b'i', c"i"),
    (b'q', c"q"),
    (b'Q', c"Q"),
    (b'f', c"f"),
    (b'd', c"d"),
];

unsafe extern "C" fn num_objc_type(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let code = match snapshot(this) {
        Storage::Number { code, .. } => code,
        _ => b'd',
    };
    let ptr = TYPE_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map_or(std::ptr::null(), |(_, text)| text.as_ptr());
    // SAFETY: "r*@:"
    unsafe { put(ret, ptr) };
}

unsafe extern "C" fn dec_with_string(_: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:@"
    let source: ObjectPtr = unsafe { arg(args, 0) };
    let text = string_text(source).unwrap_or_default();
    let text = text.trim();
    let text = if is_decimal_text(text) { text.to_string() } else { "NaN".to_string() };
    let obj = autorelease(new_object(classes().ns_decimal_number, Storage::Decimal(text)));
    // SAFETY: "@@:@"
    unsafe { put(ret, obj) };
}

// ============================================================================
// NSData
// ============================================================================

unsafe extern "C" fn data_with_bytes(_: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:r^vQ"
    let (bytes, length): (*const u8, u64) = unsafe { (arg(args, 0), arg(args, 1)) };
    let data = if bytes.is_null() || length == 0 {
        Vec::new()
    } else {
        // SAFETY: caller passes `length` readable bytes
        unsafe { std::slice::from_raw_parts(bytes, length as usize) }.to_vec()
    };
    let obj = autorelease(new_object(classes().ns_data, Storage::Data(data)));
    // SAFETY: "@@:r^vQ"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn data_bytes(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let ptr = with_storage(this, |storage| match storage {
        Storage::Data(bytes) => bytes.as_ptr(),
        _ => std::ptr::null(),
    });
    // SAFETY: "r^v@:"
    unsafe { put(ret, ptr) };
}

unsafe extern "C" fn data_length(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let length = with_storage(this, |storage| match storage {
        Storage::Data(bytes) => bytes.len() as u64,
        _ => 0,
    });
    // SAFETY: "Q@:"
    unsafe { put(ret, length) };
}

// ============================================================================
// NSArray / NSMutableArray
// ============================================================================

fn array_items(obj: ObjectPtr) -> Vec<ObjectPtr> {
    match snapshot(obj) {
        Storage::Array(items) => items,
        _ => Vec::new(),
    }
}

fn new_array(class: Class, items: Vec<ObjectPtr>) -> ObjectPtr {
    for &item in &items {
        retain(item);
    }
    new_object(class, Storage::Array(items))
}

unsafe extern "C" fn array_empty(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let class = Class::from_object(this).unwrap_or(classes().ns_array);
    let obj = autorelease(new_array(class, Vec::new()));
    // SAFETY: "@@:"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn array_with_objects(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:r^@Q"
    let (objects, count): (*const ObjectPtr, u64) = unsafe { (arg(args, 0), arg(args, 1)) };
    let items = if objects.is_null() {
        Vec::new()
    } else {
        // SAFETY: caller passes `count` object pointers
        unsafe { std::slice::from_raw_parts(objects, count as usize) }.to_vec()
    };
    let class = Class::from_object(this).unwrap_or(classes().ns_array);
    let obj = autorelease(new_array(class, items));
    // SAFETY: "@@:r^@Q"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn array_count(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let count = with_storage(this, |storage| match storage {
        Storage::Array(items) => items.len() as u64,
        _ => 0,
    });
    // SAFETY: "Q@:"
    unsafe { put(ret, count) };
}

unsafe extern "C" fn array_object_at(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:Q"
    let index: u64 = unsafe { arg(args, 0) };
    let item = with_storage(this, |storage| match storage {
        Storage::Array(items) => items.get(index as usize).copied(),
        _ => None,
    });
    if item.is_none() {
        oxbridge_log::warn!("objectAtIndex: {index} beyond bounds of {:#x}", this.addr());
    }
    // SAFETY: "@@:Q"
    unsafe { put(ret, item.unwrap_or(ObjectPtr::NIL)) };
}

unsafe extern "C" fn array_copy(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let obj = new_array(classes().ns_array, array_items(this));
    // SAFETY: "@@:"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn array_mutable_copy(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let obj = new_array(classes().ns_mutable_array, array_items(this));
    // SAFETY: "@@:"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn array_add(this: ObjectPtr, _: Sel, args: *const *mut u8, _: *mut u8) {
    // SAFETY: "v@:@"
    let item: ObjectPtr = unsafe { arg(args, 0) };
    retain(item);
    with_storage(this, |storage| match storage {
        Storage::Array(items) => items.push(item),
        other => *other = Storage::Array(vec![item]),
    });
}

unsafe extern "C" fn array_remove_at(this: ObjectPtr, _: Sel, args: *const *mut u8, _: *mut u8) {
    // SAFETY: "v@:Q"
    let index: u64 = unsafe { arg(args, 0) };
    let removed = with_storage(this, |storage| match storage {
        Storage::Array(items) if (index as usize) < items.len() => {
            Some(items.remove(index as usize))
        }
        _ => None,
    });
    if let Some(item) = removed {
        release(item);
    }
}

// ============================================================================
// NSDictionary / NSMutableDictionary
// ============================================================================

fn dictionary_pairs(obj: ObjectPtr) -> Vec<(ObjectPtr, ObjectPtr)> {
    match snapshot(obj) {
        Storage::Dictionary(pairs) => pairs,
        _ => Vec::new(),
    }
}

fn new_dictionary(class: Class, pairs: Vec<(ObjectPtr, ObjectPtr)>) -> ObjectPtr {
    let dict = new_object(class, Storage::Dictionary(Vec::new()));
    for (key, value) in pairs {
        dictionary_insert(dict, key, value);
    }
    dict
}

/// Copies `key`, retains `value`, replacing an equal key's value.
fn dictionary_insert(dict: ObjectPtr, key: ObjectPtr, value: ObjectPtr) {
    let key_copy = send_object(key, "copy");
    retain(value);

    let replaced = with_storage(dict, |storage| {
        if !matches!(storage, Storage::Dictionary(_)) {
            *storage = Storage::Dictionary(Vec::new());
        }
        let Storage::Dictionary(pairs) = storage else {
            return None;
        };
        let existing = pairs.iter().position(|&(k, _)| objects_equal(k, key_copy));
        match existing {
            Some(index) => {
                let old = std::mem::replace(&mut pairs[index].1, value);
                Some((key_copy, old))
            }
            None => {
                pairs.push((key_copy, value));
                None
            }
        }
    });

    if let Some((unused_key, old_value)) = replaced {
        release(unused_key);
        release(old_value);
    }
}

unsafe extern "C" fn dict_empty(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let class = Class::from_object(this).unwrap_or(classes().ns_dictionary);
    let obj = autorelease(new_dictionary(class, Vec::new()));
    // SAFETY: "@@:"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn dict_with_objects(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:r^@r^@Q"
    let (values, keys, count): (*const ObjectPtr, *const ObjectPtr, u64) =
        unsafe { (arg(args, 0), arg(args, 1), arg(args, 2)) };
    let pairs = if values.is_null() || keys.is_null() {
        Vec::new()
    } else {
        // SAFETY: caller passes `count` keys and values
        let (keys, values) = unsafe {
            (
                std::slice::from_raw_parts(keys, count as usize),
                std::slice::from_raw_parts(values, count as usize),
            )
        };
        keys.iter().copied().zip(values.iter().copied()).collect()
    };
    let class = Class::from_object(this).unwrap_or(classes().ns_dictionary);
    let obj = autorelease(new_dictionary(class, pairs));
    // SAFETY: "@@:r^@r^@Q"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn dict_count(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let count = dictionary_pairs(this).len() as u64;
    // SAFETY: "Q@:"
    unsafe { put(ret, count) };
}

unsafe extern "C" fn dict_object_for_key(this: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: "@@:@"
    let key: ObjectPtr = unsafe { arg(args, 0) };
    let value = dictionary_pairs(this)
        .into_iter()
        .find(|&(k, _)| objects_equal(k, key))
        .map_or(ObjectPtr::NIL, |(_, v)| v);
    // SAFETY: "@@:@"
    unsafe { put(ret, value) };
}

unsafe extern "C" fn dict_all_keys(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let keys = dictionary_pairs(this).into_iter().map(|(k, _)| k).collect();
    let obj = autorelease(new_array(classes().ns_array, keys));
    // SAFETY: "@@:"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn dict_all_values(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let values = dictionary_pairs(this).into_iter().map(|(_, v)| v).collect();
    let obj = autorelease(new_array(classes().ns_array, values));
    // SAFETY: "@@:"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn dict_copy(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let obj = new_dictionary(classes().ns_dictionary, dictionary_pairs(this));
    // SAFETY: "@@:"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn dict_mutable_copy(this: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
    let obj = new_dictionary(classes().ns_mutable_dictionary, dictionary_pairs(this));
    // SAFETY: "@@:"
    unsafe { put(ret, obj) };
}

unsafe extern "C" fn dict_set_object(this: ObjectPtr, _: Sel, args: *const *mut u8, _: *mut u8) {
    // SAFETY: "v@:@@"
    let (value, key): (ObjectPtr, ObjectPtr) = unsafe { (arg(args, 0), arg(args, 1)) };
    if key.is_nil() || value.is_nil() {
        oxbridge_log::warn!("setObject:forKey: with nil key or value ignored");
        return;
    }
    dictionary_insert(this, key, value);
}

unsafe extern "C" fn dict_remove_object(this: ObjectPtr, _: Sel, args: *const *mut u8, _: *mut u8) {
    // SAFETY: "v@:@"
    let key: ObjectPtr = unsafe { arg(args, 0) };
    let removed = with_storage(this, |storage| match storage {
        Storage::Dictionary(pairs) => pairs
            .iter()
            .position(|&(k, _)| objects_equal(k, key))
            .map(|index| pairs.remove(index)),
        _ => None,
    });
    if let Some((k, v)) = removed {
        release(k);
        release(v);
    }
}

// ============================================================================
// Host values
// ============================================================================

/// Boxes a host value in an `OXHostValue` instance. Returns +1.
pub fn new_host_value(value: Box<dyn Any + Send + Sync>) -> ObjectPtr {
    new_object(classes().host_value, Storage::Host(value))
}

/// Runs `f` on the host value boxed in `obj`.
///
/// `f` runs under the object's payload lock and must not message `obj`.
pub fn with_host_value<R>(obj: ObjectPtr, f: impl FnOnce(&(dyn Any + Send + Sync)) -> R) -> Option<R> {
    if obj.is_nil() || object_is_class(obj) {
        return None;
    }
    with_storage(obj, |storage| match storage {
        Storage::Host(value) => Some(f(value.as_ref())),
        _ => None,
    })
}

// ============================================================================
// Installation
// ============================================================================

fn add(class: Class, selector: &str, imp: ImpFn, types: &str) {
    class.add_method(Method::new(Sel::register(selector), Imp::Native(imp), types));
}

fn add_class_method(class: Class, selector: &str, imp: ImpFn, types: &str) {
    if let Some(meta) = class.metaclass() {
        add(meta, selector, imp, types);
    }
}

fn install() -> Foundation {
    let ns_object = bootstrap_class(None, "NSObject");
    add_class_method(ns_object, "alloc", obj_alloc, "@@:");
    add_class_method(ns_object, "new", obj_new, "@@:");
    add_class_method(ns_object, "class", obj_self, "#@:");
    add(ns_object, "init", obj_self, "@@:");
    add(ns_object, "dealloc", obj_dealloc, "v@:");
    add(ns_object, "retain", obj_retain, "@@:");
    add(ns_object, "release", obj_release, "v@:");
    add(ns_object, "autorelease", obj_autorelease, "@@:");
    add(ns_object, "retainCount", obj_retain_count, "Q@:");
    add(ns_object, "class", obj_class, "#@:");
    add(ns_object, "isKindOfClass:", obj_is_kind_of, "B@:#");
    add(ns_object, "respondsToSelector:", obj_responds_to, "B@::");
    add(ns_object, "conformsToProtocol:", obj_conforms_to, "B@:@");
    add(ns_object, "isEqual:", obj_is_equal, "B@:@");
    add(ns_object, "hash", obj_hash, "Q@:");
    add(ns_object, "description", obj_description, "@@:");
    add(ns_object, "debugDescription", obj_description, "@@:");
    add(ns_object, "copy", obj_copy, "@@:");

    let ns_string = bootstrap_class(Some(ns_object), "NSString");
    add_class_method(ns_string, "stringWithUTF8String:", str_with_utf8, "@@:r*");
    add(ns_string, "initWithUTF8String:", str_init_utf8, "@@:r*");
    add(ns_string, "initWithBytes:length:encoding:", str_init_bytes, "@@:r^vQQ");
    add(ns_string, "UTF8String", str_utf8, "r*@:");
    add(ns_string, "length", str_length, "Q@:");
    add(ns_string, "lengthOfBytesUsingEncoding:", str_length_of_bytes, "Q@:Q");
    add(ns_string, "characterAtIndex:", str_character_at, "S@:Q");
    add(ns_string, "isEqualToString:", str_is_equal, "B@:@");
    add(ns_string, "substringWithRange:", str_substring, "@@:{_NSRange=QQ}");
    add(ns_string, "rangeOfString:", str_range_of, "{_NSRange=QQ}@:@");
    add(ns_string, "stringByAppendingString:", str_append, "@@:@");

    let ns_number = bootstrap_class(Some(ns_object), "NSNumber");
    add_class_method(ns_number, "numberWithBool:", num_with_bool, "@@:B");
    add_class_method(ns_number, "numberWithInt:", num_with_int, "@@:i");
    add_class_method(ns_number, "numberWithLong:", num_with_long_long, "@@:q");
    add_class_method(ns_number, "numberWithLongLong:", num_with_long_long, "@@:q");
    add_class_method(
        ns_number,
        "numberWithUnsignedLongLong:",
        num_with_unsigned_long_long,
        "@@:Q",
    );
    add_class_method(ns_number, "numberWithFloat:", num_with_float, "@@:f");
    add_class_method(ns_number, "numberWithDouble:", num_with_double, "@@:d");
    add(ns_number, "objCType", num_objc_type, "r*@:");
    add(ns_number, "boolValue", num_bool_value, "B@:");
    add(ns_number, "intValue", num_int_value, "i@:");
    add(ns_number, "longValue", num_long_long_value, "q@:");
    add(ns_number, "longLongValue", num_long_long_value, "q@:");
    add(ns_number, "unsignedLongLongValue", num_unsigned_long_long_value, "Q@:");
    add(ns_number, "floatValue", num_float_value, "f@:");
    add(ns_number, "doubleValue", num_double_value, "d@:");
    add(ns_number, "stringValue", obj_description, "@@:");

    let ns_decimal_number = bootstrap_class(Some(ns_number), "NSDecimalNumber");
    add_class_method(ns_decimal_number, "decimalNumberWithString:", dec_with_string, "@@:@");

    let ns_data = bootstrap_class(Some(ns_object), "NSData");
    add_class_method(ns_data, "dataWithBytes:length:", data_with_bytes, "@@:r^vQ");
    add(ns_data, "bytes", data_bytes, "r^v@:");
    add(ns_data, "length", data_length, "Q@:");

    let ns_array = bootstrap_class(Some(ns_object), "NSArray");
    add_class_method(ns_array, "array", array_empty, "@@:");
    add_class_method(ns_array, "arrayWithObjects:count:", array_with_objects, "@@:r^@Q");
    add(ns_array, "count", array_count, "Q@:");
    add(ns_array, "objectAtIndex:", array_object_at, "@@:Q");
    add(ns_array, "mutableCopy", array_mutable_copy, "@@:");

    let ns_mutable_array = bootstrap_class(Some(ns_array), "NSMutableArray");
    add(ns_mutable_array, "addObject:", array_add, "v@:@");
    add(ns_mutable_array, "removeObjectAtIndex:", array_remove_at, "v@:Q");
    add(ns_mutable_array, "copy", array_copy, "@@:");

    let ns_dictionary = bootstrap_class(Some(ns_object), "NSDictionary");
    add_class_method(ns_dictionary, "dictionary", dict_empty, "@@:");
    add_class_method(
        ns_dictionary,
        "dictionaryWithObjects:forKeys:count:",
        dict_with_objects,
        "@@:r^@r^@Q",
    );
    add(ns_dictionary, "count", dict_count, "Q@:");
    add(ns_dictionary, "objectForKey:", dict_object_for_key, "@@:@");
    add(ns_dictionary, "allKeys", dict_all_keys, "@@:");
    add(ns_dictionary, "allValues", dict_all_values, "@@:");
    add(ns_dictionary, "mutableCopy", dict_mutable_copy, "@@:");

    let ns_mutable_dictionary = bootstrap_class(Some(ns_dictionary), "NSMutableDictionary");
    add(ns_mutable_dictionary, "setObject:forKey:", dict_set_object, "v@:@@");
    add(ns_mutable_dictionary, "removeObjectForKey:", dict_remove_object, "v@:@");
    add(ns_mutable_dictionary, "copy", dict_copy, "@@:");

    let protocol = bootstrap_class(Some(ns_object), "Protocol");
    let host_value = bootstrap_class(Some(ns_object), "OXHostValue");

    oxbridge_log::debug!("foundation classes installed");
    Foundation {
        ns_object,
        ns_string,
        ns_number,
        ns_decimal_number,
        ns_data,
        ns_array,
        ns_mutable_array,
        ns_dictionary,
        ns_mutable_dictionary,
        protocol,
        host_value,
    }
}
