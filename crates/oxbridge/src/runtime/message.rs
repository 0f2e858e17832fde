//! Message sending.
//!
//! Three entry points, one per return convention. Each looks up the
//! receiver's method through the class's dispatch cache, checks that the
//! caller used the entry point the method's return type requires, and calls
//! the implementation.
//!
//! # Dispatch Algorithm
//!
//! 1. A nil receiver returns immediately without touching the return buffer
//! 2. Load the receiver's `isa` (the metaclass, for class objects)
//! 3. Look up the selector through the class's dispatch cache
//! 4. Validate the calling convention
//! 5. Invoke the implementation
//!
//! Argument buffers are untyped: `args` points at one pointer per declared
//! argument, each addressing the argument's storage. The caller owns all
//! buffers for the duration of the call.

use crate::error::{Error, Result};
use crate::runtime::Sel;
use crate::runtime::abi::Convention;
use crate::runtime::class::{Class, Method};
use crate::runtime::object::{ObjectPtr, object_get_class};

/// A receiver paired with the class where method lookup starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Super {
    /// The object receiving the message.
    pub receiver: ObjectPtr,
    /// Lookup starts at this class (normally the superclass of the caller's
    /// class).
    pub super_class: Class,
}

fn lookup(class: Class, receiver: ObjectPtr, selector: Sel) -> Result<Method> {
    class
        .lookup_for_dispatch(selector)
        .ok_or_else(|| Error::UnrecognizedSelector {
            class: class.name().to_string(),
            selector: selector.name().to_string(),
            receiver: receiver.addr(),
        })
}

unsafe fn dispatch(
    class: Class,
    receiver: ObjectPtr,
    selector: Sel,
    args: *const *mut u8,
    ret: *mut u8,
    used: Convention,
) -> Result<()> {
    let method = lookup(class, receiver, selector)?;
    if method.convention() != used {
        return Err(Error::ConventionMismatch {
            selector: selector.name().to_string(),
            required: method.convention().to_string(),
            used: used.to_string(),
        });
    }
    oxbridge_log::trace!(
        "{} -[{} {}]",
        used,
        class.name(),
        selector.name()
    );
    // SAFETY: forwarded from the public entry points
    unsafe { method.imp().invoke(receiver, selector, args, ret) };
    Ok(())
}

unsafe fn send(
    receiver: ObjectPtr,
    selector: Sel,
    args: *const *mut u8,
    ret: *mut u8,
    used: Convention,
) -> Result<()> {
    if receiver.is_nil() {
        return Ok(());
    }
    let class = object_get_class(receiver).ok_or(Error::Deallocated(receiver.addr()))?;
    // SAFETY: forwarded contract
    unsafe { dispatch(class, receiver, selector, args, ret, used) }
}

/// Sends a message whose return value comes back in registers.
///
/// # Safety
///
/// - `receiver` is nil or a live object
/// - `args` holds one valid pointer per argument of the method's encoding
/// - `ret` is null for void methods, otherwise large enough for the return
///   type
///
/// # Errors
///
/// - [`Error::UnrecognizedSelector`] if no method matches
/// - [`Error::ConventionMismatch`] if the method needs another entry point
pub unsafe fn msg_send(
    receiver: ObjectPtr,
    selector: Sel,
    args: *const *mut u8,
    ret: *mut u8,
) -> Result<()> {
    // SAFETY: forwarded contract
    unsafe { send(receiver, selector, args, ret, Convention::Standard) }
}

/// Sends a message that returns an aggregate through a caller buffer.
///
/// # Safety
///
/// See [`msg_send`]; `ret` must not be null.
///
/// # Errors
///
/// See [`msg_send`].
pub unsafe fn msg_send_stret(
    receiver: ObjectPtr,
    selector: Sel,
    args: *const *mut u8,
    ret: *mut u8,
) -> Result<()> {
    // SAFETY: forwarded contract
    unsafe { send(receiver, selector, args, ret, Convention::StructReturn) }
}

/// Sends a message that returns a float on the x87 stack.
///
/// # Safety
///
/// See [`msg_send`].
///
/// # Errors
///
/// See [`msg_send`].
pub unsafe fn msg_send_fpret(
    receiver: ObjectPtr,
    selector: Sel,
    args: *const *mut u8,
    ret: *mut u8,
) -> Result<()> {
    // SAFETY: forwarded contract
    unsafe { send(receiver, selector, args, ret, Convention::FloatReturn) }
}

/// Sends a message starting lookup at `target.super_class`.
///
/// # Safety
///
/// See [`msg_send`].
///
/// # Errors
///
/// See [`msg_send`].
pub unsafe fn msg_send_super(
    target: Super,
    selector: Sel,
    args: *const *mut u8,
    ret: *mut u8,
    convention: Convention,
) -> Result<()> {
    if target.receiver.is_nil() {
        return Ok(());
    }
    // SAFETY: forwarded contract
    unsafe {
        dispatch(
            target.super_class,
            target.receiver,
            selector,
            args,
            ret,
            convention,
        )
    }
}

/// Picks the entry point function for a convention.
///
/// Returned fresh on every call; callers never share a bound entry point.
#[must_use]
pub fn entry_point(
    convention: Convention,
) -> unsafe fn(ObjectPtr, Sel, *const *mut u8, *mut u8) -> Result<()> {
    match convention {
        Convention::Standard => msg_send,
        Convention::StructReturn => msg_send_stret,
        Convention::FloatReturn => msg_send_fpret,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::abi::{self, Arch};
    use crate::runtime::class::{Imp, allocate_class_pair, register_class_pair};
    use crate::runtime::foundation;
    use crate::runtime::object::{alloc_instance, release};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CLASS_ID: AtomicUsize = AtomicUsize::new(0);

    fn unique(prefix: &str) -> String {
        format!("{prefix}_{}", CLASS_ID.fetch_add(1, Ordering::SeqCst))
    }

    #[repr(C)]
    #[derive(Default, Debug, PartialEq)]
    struct Triple {
        a: i64,
        b: i64,
        c: i64,
    }

    unsafe extern "C" fn add_one(_: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
        unsafe {
            let value = (*args).cast::<i32>().read();
            ret.cast::<i32>().write(value + 1);
        }
    }

    unsafe extern "C" fn triple(_: ObjectPtr, _: Sel, _: *const *mut u8, ret: *mut u8) {
        unsafe { ret.cast::<Triple>().write(Triple { a: 1, b: 2, c: 3 }) };
    }

    fn test_class() -> Class {
        let class = allocate_class_pair(
            Some(foundation::classes().ns_object),
            &unique("MessageTest"),
        )
        .unwrap();
        class.add_method(Method::new(
            Sel::register("addOne:"),
            Imp::Native(add_one),
            "i@:i",
        ));
        class.add_method(Method::new(
            Sel::register("triple"),
            Imp::Native(triple),
            "{Triple=qqq}@:",
        ));
        register_class_pair(class).unwrap();
        class
    }

    #[test]
    fn test_send_with_argument() {
        let obj = alloc_instance(test_class()).unwrap();
        let mut arg = 41i32;
        let args = [(&raw mut arg).cast::<u8>()];
        let mut ret = 0i32;
        unsafe {
            msg_send(obj, Sel::register("addOne:"), args.as_ptr(), (&raw mut ret).cast())
        }
        .unwrap();
        assert_eq!(ret, 42);
        release(obj);
    }

    #[test]
    fn test_nil_receiver_leaves_buffer() {
        let mut ret = 7i32;
        unsafe {
            msg_send(
                ObjectPtr::NIL,
                Sel::register("anything"),
                std::ptr::null(),
                (&raw mut ret).cast(),
            )
        }
        .unwrap();
        assert_eq!(ret, 7);
    }

    #[test]
    fn test_unrecognized_selector() {
        let obj = alloc_instance(test_class()).unwrap();
        let err = unsafe {
            msg_send(obj, Sel::register("noSuchMethod"), std::ptr::null(), std::ptr::null_mut())
        }
        .unwrap_err();
        assert!(matches!(err, Error::UnrecognizedSelector { .. }));
        release(obj);
    }

    #[test]
    fn test_convention_is_enforced() {
        let obj = alloc_instance(test_class()).unwrap();
        let sel = Sel::register("triple");
        let required = abi::return_convention("{Triple=qqq}@:", Arch::current()).unwrap();

        let mut out = Triple::default();
        let ret = (&raw mut out).cast::<u8>();
        let send = entry_point(required);
        unsafe { send(obj, sel, std::ptr::null(), ret) }.unwrap();
        assert_eq!(out, Triple { a: 1, b: 2, c: 3 });

        let wrong = if required == Convention::Standard {
            Convention::StructReturn
        } else {
            Convention::Standard
        };
        let err = unsafe { entry_point(wrong)(obj, sel, std::ptr::null(), ret) }.unwrap_err();
        assert!(matches!(err, Error::ConventionMismatch { .. }));
        release(obj);
    }

    #[test]
    fn test_class_methods_dispatch_through_metaclass() {
        let class = test_class();
        let meta = class.metaclass().unwrap();
        let sel = Sel::register("classAddOne:");
        meta.add_method(Method::new(sel, Imp::Native(add_one), "i@:i"));

        let mut arg = 1i32;
        let args = [(&raw mut arg).cast::<u8>()];
        let mut ret = 0i32;
        unsafe { msg_send(class.as_object(), sel, args.as_ptr(), (&raw mut ret).cast()) }
            .unwrap();
        assert_eq!(ret, 2);
    }

    #[test]
    fn test_super_send_skips_override() {
        let parent = test_class();
        let child = allocate_class_pair(Some(parent), &unique("MessageChild")).unwrap();
        unsafe extern "C" fn add_ten(_: ObjectPtr, _: Sel, args: *const *mut u8, ret: *mut u8) {
            unsafe { ret.cast::<i32>().write((*args).cast::<i32>().read() + 10) };
        }
        let sel = Sel::register("addOne:");
        child.add_method(Method::new(sel, Imp::Native(add_ten), "i@:i"));
        register_class_pair(child).unwrap();

        let obj = alloc_instance(child).unwrap();
        let mut arg = 0i32;
        let args = [(&raw mut arg).cast::<u8>()];
        let mut ret = 0i32;
        unsafe { msg_send(obj, sel, args.as_ptr(), (&raw mut ret).cast()) }.unwrap();
        assert_eq!(ret, 10);

        let target = Super { receiver: obj, super_class: parent };
        unsafe {
            msg_send_super(target, sel, args.as_ptr(), (&raw mut ret).cast(), Convention::Standard)
        }
        .unwrap();
        assert_eq!(ret, 1);
        release(obj);
    }
}
