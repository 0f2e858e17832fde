//! Methods and message sends.
//!
//! An [`ObjCMethod`] pairs a selector with its decoded signature. Calling it
//! marshals the arguments, picks the entry point for the return type, sends
//! the message and converts the result.
//!
//! # Call Sequence
//!
//! 1. Check the argument count against the signature
//! 2. Open an autorelease pool for temporaries created during conversion
//! 3. Convert the arguments (errors name the selector, the argument index,
//!    the argument types and the raw encoding)
//! 4. For `init`-family methods, retain the receiver
//! 5. Send through the entry point the return type requires
//! 6. Convert the result while the pool is still open; results of
//!    `alloc`/`new`/`copy`/`mutableCopy`/`init` methods are adopted
//! 7. Close the pool and report any failure raised by host code the send
//!    reached

use crate::bridge::class::ObjCClass;
use crate::bridge::convention;
use crate::bridge::encoding::TypeKind;
use crate::bridge::instance::wrap;
use crate::bridge::signature::{ArgumentFrame, CallSignature, NativeBuffer};
use crate::bridge::value::{Value, read_value};
use crate::error::{Error, Result};
use crate::runtime::abi::{Arch, Convention};
use crate::runtime::autorelease::autoreleasepool;
use crate::runtime::message::{self, Super, msg_send, msg_send_super};
use crate::runtime::object::{release, retain};
use crate::runtime::{Class, Method, ObjectPtr, Sel};
use std::cell::RefCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::Arc;

/// Ownership convention of a method, from its selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodFamily {
    /// `alloc…`
    Alloc,
    /// `new…`
    New,
    /// `copy…`
    Copy,
    /// `mutableCopy…`
    MutableCopy,
    /// `init…`
    Init,
}

impl MethodFamily {
    /// Family of `selector`, matched by prefix at a camel-case boundary.
    ///
    /// ```rust
    /// use oxbridge::bridge::method::MethodFamily;
    ///
    /// assert_eq!(MethodFamily::of("initWithInt:"), Some(MethodFamily::Init));
    /// assert_eq!(MethodFamily::of("copy"), Some(MethodFamily::Copy));
    /// assert_eq!(MethodFamily::of("newton"), None);
    /// assert_eq!(MethodFamily::of("initialize"), None);
    /// ```
    #[must_use]
    pub fn of(selector: &str) -> Option<MethodFamily> {
        const PREFIXES: [(&str, MethodFamily); 5] = [
            ("alloc", MethodFamily::Alloc),
            ("new", MethodFamily::New),
            ("copy", MethodFamily::Copy),
            ("mutableCopy", MethodFamily::MutableCopy),
            ("init", MethodFamily::Init),
        ];
        let name = selector.trim_start_matches('_');
        PREFIXES.iter().find_map(|&(prefix, family)| {
            let rest = name.strip_prefix(prefix)?;
            rest.chars()
                .next()
                .is_none_or(|c| !c.is_ascii_lowercase())
                .then_some(family)
        })
    }
}

// ============================================================================
// Callback failures
// ============================================================================

thread_local! {
    static CALLBACK_ERROR: RefCell<Option<Error>> = const { RefCell::new(None) };
}

/// Records a failure raised by host code running inside a trampoline.
///
/// The first failure wins until the sender collects it.
pub(crate) fn record_callback_error(selector: &str, err: &Error) {
    oxbridge_log::error!("host callback for {selector} failed: {err}");
    CALLBACK_ERROR.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(Error::Callback {
                selector: selector.to_string(),
                message: err.to_string(),
            });
        }
    });
}

pub(crate) fn take_callback_error() -> Option<Error> {
    CALLBACK_ERROR.with(|slot| slot.borrow_mut().take())
}

/// Drops a failure left behind by an earlier send on this thread.
pub(crate) fn discard_stale_callback_error(context: &str) {
    if let Some(stale) = take_callback_error() {
        oxbridge_log::warn!("discarding uncollected callback error before {context}: {stale}");
    }
}

// ============================================================================
// Methods
// ============================================================================

struct MethodInner {
    selector: Sel,
    signature: CallSignature,
    family: Option<MethodFamily>,
    convention: Convention,
}

/// A selector with its decoded signature.
#[derive(Clone)]
pub struct ObjCMethod(Arc<MethodInner>);

impl ObjCMethod {
    /// Builds a method from a selector and a full method encoding.
    ///
    /// # Errors
    ///
    /// Returns encoding errors, naming the selector.
    pub fn new(selector: Sel, encoding: &str) -> Result<ObjCMethod> {
        let signature = CallSignature::for_method(encoding, selector.name())?;
        let convention = convention::select(signature.ret(), Arch::current());
        Ok(ObjCMethod(Arc::new(MethodInner {
            selector,
            family: MethodFamily::of(selector.name()),
            signature,
            convention,
        })))
    }

    pub(crate) fn from_runtime(method: &Method) -> Result<ObjCMethod> {
        ObjCMethod::new(method.selector(), method.types())
    }

    /// Selector.
    #[must_use]
    pub fn selector(&self) -> Sel {
        self.0.selector
    }

    /// Selector name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.0.selector.name()
    }

    /// Raw encoding.
    #[must_use]
    pub fn encoding(&self) -> &str {
        self.0.signature.encoding()
    }

    /// Decoded signature.
    #[must_use]
    pub fn signature(&self) -> &CallSignature {
        &self.0.signature
    }

    /// Ownership family.
    #[must_use]
    pub fn family(&self) -> Option<MethodFamily> {
        self.0.family
    }

    /// Return convention on the host architecture.
    #[must_use]
    pub fn convention(&self) -> Convention {
        self.0.convention
    }

    /// Number of declared arguments.
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.0.signature.args().len()
    }

    /// Binds the method to a receiver.
    #[must_use]
    pub fn bind(&self, receiver: Value) -> BoundMethod {
        BoundMethod {
            receiver,
            method: self.clone(),
        }
    }

    /// Sends the method to `receiver`.
    ///
    /// # Errors
    ///
    /// - [`Error::ArgumentCount`] before anything is sent
    /// - [`Error::Argument`] wrapping conversion failures
    /// - [`Error::NilReceiver`] for a `None` receiver
    /// - [`Error::Callback`] if host code reached by the send failed
    /// - native send errors
    pub fn call(&self, receiver: &Value, args: &[Value]) -> Result<Value> {
        let ptr = receiver_ptr(receiver, self.name())?;
        self.perform(ptr, None, args)
    }

    /// Sends the method to `receiver`, starting lookup at `super_class`.
    ///
    /// # Errors
    ///
    /// See [`ObjCMethod::call`].
    pub fn call_super(&self, super_class: &ObjCClass, receiver: &Value, args: &[Value]) -> Result<Value> {
        let ptr = receiver_ptr(receiver, self.name())?;
        self.perform(ptr, Some(super_class.runtime_class()), args)
    }

    fn perform(&self, receiver: ObjectPtr, super_class: Option<Class>, args: &[Value]) -> Result<Value> {
        let signature = &self.0.signature;
        if args.len() != signature.args().len() {
            return Err(Error::ArgumentCount {
                selector: self.name().to_string(),
                expected: signature.args().len(),
                got: args.len(),
            });
        }

        let owned = self.family().is_some();
        let is_init = self.family() == Some(MethodFamily::Init);

        autoreleasepool(|| {
            let frame = ArgumentFrame::build(signature.args(), args, |index, err| {
                err.with_call_context(
                    self.name(),
                    index,
                    signature.argtypes_string(),
                    signature.encoding(),
                )
            })?;
            let mut ret = signature.return_buffer();
            let ret_ptr = ret
                .as_mut()
                .map_or(std::ptr::null_mut(), NativeBuffer::as_mut_ptr);

            if is_init {
                retain(receiver);
            }
            discard_stale_callback_error(self.name());

            // SAFETY: the frame matches the decoded argument types and the
            // return buffer is sized for the return type
            let sent = unsafe {
                match super_class {
                    None => {
                        let send = message::entry_point(self.convention());
                        send(receiver, self.selector(), frame.as_ptr(), ret_ptr)
                    }
                    Some(super_class) => msg_send_super(
                        Super {
                            receiver,
                            super_class,
                        },
                        self.selector(),
                        frame.as_ptr(),
                        ret_ptr,
                        self.convention(),
                    ),
                }
            };
            if let Err(err) = sent {
                if is_init {
                    release(receiver);
                }
                return Err(err);
            }
            if let Some(err) = take_callback_error() {
                return Err(err);
            }

            let Some(ret) = ret else {
                return Ok(Value::None);
            };
            let ty = signature.ret();
            match ty.kind() {
                TypeKind::Object { .. } if owned => {
                    // SAFETY: the buffer holds an object pointer
                    let ptr = unsafe { ret.as_ptr().cast::<ObjectPtr>().read() };
                    wrap(ptr, true)
                }
                // SAFETY: the buffer holds a value of the return type
                _ => unsafe { read_value(ty, ret.as_ptr()) },
            }
        })
    }
}

fn receiver_ptr(receiver: &Value, selector: &str) -> Result<ObjectPtr> {
    let ptr = receiver.object_ptr();
    if ptr.is_nil() {
        return Err(Error::NilReceiver(selector.to_string()));
    }
    Ok(ptr)
}

impl fmt::Debug for ObjCMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ObjCMethod: {} {}>", self.name(), self.encoding())
    }
}

impl PartialEq for ObjCMethod {
    fn eq(&self, other: &ObjCMethod) -> bool {
        self.selector() == other.selector() && self.encoding() == other.encoding()
    }
}

/// A method bound to its receiver.
#[derive(Debug, Clone)]
pub struct BoundMethod {
    receiver: Value,
    method: ObjCMethod,
}

impl BoundMethod {
    /// The receiver.
    #[must_use]
    pub fn receiver(&self) -> &Value {
        &self.receiver
    }

    /// The method.
    #[must_use]
    pub fn method(&self) -> &ObjCMethod {
        &self.method
    }

    /// Sends the method.
    ///
    /// # Errors
    ///
    /// See [`ObjCMethod::call`].
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        self.method.call(&self.receiver, args)
    }
}

// ============================================================================
// Explicit sends
// ============================================================================

fn explicit_encoding(restype: &str, argtypes: &[&str]) -> String {
    let mut encoding = format!("{restype}@:");
    for ty in argtypes {
        encoding.push_str(ty);
    }
    encoding
}

/// Sends `selector` with an explicit signature.
///
/// `restype` and `argtypes` are type encodings; the implicit `self` and
/// `_cmd` arguments are added.
///
/// # Errors
///
/// See [`ObjCMethod::call`].
///
/// # Example
///
/// ```rust
/// use oxbridge::bridge::method::send_message;
/// use oxbridge::bridge::value::{Value, ns_from_value};
///
/// let text = ns_from_value(&Value::from("hello")).unwrap();
/// let length = send_message(&text, "length", &[], "Q", &[]).unwrap();
/// assert_eq!(length, Value::UInt(5));
/// ```
pub fn send_message(
    receiver: &Value,
    selector: &str,
    args: &[Value],
    restype: &str,
    argtypes: &[&str],
) -> Result<Value> {
    let method = ObjCMethod::new(Sel::register(selector), &explicit_encoding(restype, argtypes))?;
    method.call(receiver, args)
}

/// Sends `selector` to `receiver`, starting lookup at the superclass of
/// `class`.
///
/// For class receivers lookup starts at the superclass's metaclass.
///
/// # Errors
///
/// - [`Error::ClassNotFound`] if `class` is a root class
/// - see [`ObjCMethod::call`]
pub fn send_super(
    class: &ObjCClass,
    receiver: &Value,
    selector: &str,
    args: &[Value],
    restype: &str,
    argtypes: &[&str],
) -> Result<Value> {
    let superclass = class
        .superclass()
        .ok_or_else(|| Error::ClassNotFound(format!("superclass of {}", class.name())))?;
    let method = ObjCMethod::new(Sel::register(selector), &explicit_encoding(restype, argtypes))?;
    let lookup = match receiver.unwrapped() {
        Value::Class(_) => superclass.metaclass().runtime_class(),
        _ => superclass.runtime_class(),
    };
    let ptr = receiver_ptr(receiver, selector)?;
    method.perform(ptr, Some(lookup), args)
}

/// Sends a message whose return type is `R` with pre-built argument
/// buffers.
///
/// # Safety
///
/// `args` must hold one valid pointer per argument of the method and `R`
/// must match its return type.
pub(crate) unsafe fn send_raw<R: Copy>(
    receiver: ObjectPtr,
    selector: &str,
    args: &[*mut u8],
) -> Result<R> {
    let mut ret = MaybeUninit::<R>::zeroed();
    let ret_ptr = if size_of::<R>() == 0 {
        std::ptr::null_mut()
    } else {
        ret.as_mut_ptr().cast()
    };
    // SAFETY: forwarded contract
    unsafe {
        msg_send(receiver, Sel::register(selector), args.as_ptr(), ret_ptr)?;
        Ok(ret.assume_init())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::value::ns_from_value;
    use crate::runtime::foundation;

    #[test]
    fn test_families() {
        assert_eq!(MethodFamily::of("alloc"), Some(MethodFamily::Alloc));
        assert_eq!(MethodFamily::of("allocWithZone:"), Some(MethodFamily::Alloc));
        assert_eq!(MethodFamily::of("new"), Some(MethodFamily::New));
        assert_eq!(MethodFamily::of("mutableCopy"), Some(MethodFamily::MutableCopy));
        assert_eq!(MethodFamily::of("copyWithZone:"), Some(MethodFamily::Copy));
        assert_eq!(MethodFamily::of("_init"), Some(MethodFamily::Init));
        assert_eq!(MethodFamily::of("copyright"), None);
        assert_eq!(MethodFamily::of("description"), None);
    }

    #[test]
    fn test_stale_callback_error_is_not_reported_by_the_next_send() {
        let stale = Error::ClassNotFound("Gone".into());
        record_callback_error("earlier:", &stale);

        let method = ObjCMethod::new(Sel::register("count"), "Q@:").unwrap();
        let array = ns_from_value(&Value::List(vec![Value::Int(1)])).unwrap();
        assert_eq!(method.call(&array, &[]).unwrap(), Value::UInt(1));
        assert!(take_callback_error().is_none());

        record_callback_error("earlier:", &stale);
        discard_stale_callback_error("test");
        assert!(take_callback_error().is_none());
    }

    #[test]
    fn test_argument_count_checked_first() {
        let method = ObjCMethod::new(Sel::register("objectAtIndex:"), "@@:Q").unwrap();
        let array = ns_from_value(&Value::List(vec![Value::Int(1)])).unwrap();
        let err = method.call(&array, &[]).unwrap_err();
        assert_eq!(
            err,
            Error::ArgumentCount {
                selector: "objectAtIndex:".into(),
                expected: 1,
                got: 0
            }
        );
    }

    #[test]
    fn test_argument_errors_carry_context() {
        let array = ns_from_value(&Value::List(vec![Value::Int(1)])).unwrap();
        let err = send_message(&array, "objectAtIndex:", &[Value::from("x")], "@", &["Q"])
            .unwrap_err();
        let Error::Argument { selector, index, argtypes, encoding, .. } = err else {
            panic!("expected argument error, got {err:?}");
        };
        assert_eq!(selector, "objectAtIndex:");
        assert_eq!(index, 0);
        assert_eq!(argtypes, "@, :, Q");
        assert_eq!(encoding, "@@:Q");
    }

    #[test]
    fn test_nil_receiver() {
        let err = send_message(&Value::None, "description", &[], "@", &[]).unwrap_err();
        assert_eq!(err, Error::NilReceiver("description".into()));
    }

    #[test]
    fn test_explicit_send_reads_scalars() {
        let array = ns_from_value(&Value::List(vec![1.into(), 2.into(), 3.into()])).unwrap();
        assert_eq!(send_message(&array, "count", &[], "Q", &[]).unwrap(), Value::UInt(3));
    }

    #[test]
    fn test_send_raw_to_nil_returns_zero() {
        let count: u64 = unsafe { send_raw(ObjectPtr::NIL, "count", &[]) }.unwrap();
        assert_eq!(count, 0);
        foundation::classes();
    }
}
