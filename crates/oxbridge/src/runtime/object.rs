//! Object allocation, reference counting and per-object side tables.
//!
//! # Architecture
//!
//! Every object starts with a [`RawObject`] header followed by its instance
//! variables, laid out by the class at registration time. Classes and
//! protocols embed the same header so they can receive messages, but are
//! flagged immortal: retain and release on them do nothing.
//!
//! When a release drops the count to zero the object is flagged as
//! deallocating, weak references to it are cleared, and it is sent `dealloc`.
//! The root `dealloc` implementation calls [`dispose`], which releases
//! associated objects, drops the Foundation payload and frees the memory.
//!
//! Associated objects and weak references live in process-wide side tables
//! keyed by object address.
//!
//! # Thread Safety
//!
//! The count is atomic. A weak load retains under the weak-table lock, and
//! deallocation re-checks the count under the same lock, so a weak load can
//! never hand out an object that is being torn down.

#![allow(clippy::cast_ptr_alignment)]

use crate::error::{Error, Result};
use crate::runtime::class::{Class, ClassInner, Ivar};
use crate::runtime::foundation::Storage;
use crate::runtime::{Sel, message};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

/// Header flag: retain/release are no-ops (classes, protocols, constants).
pub(crate) const FLAG_IMMORTAL: u32 = 1 << 0;
/// Header flag: the count reached zero and `dealloc` is running.
pub(crate) const FLAG_DEALLOCATING: u32 = 1 << 1;
/// Header flag: the object is a class or metaclass.
pub(crate) const FLAG_CLASS: u32 = 1 << 2;
/// Header flag: the object is a protocol.
pub(crate) const FLAG_PROTOCOL: u32 = 1 << 3;

/// Alignment of every object allocation.
pub(crate) const OBJECT_ALIGN: usize = 16;

/// Size of the header, rounded so the first ivar starts 16-byte aligned.
pub(crate) const HEADER_SIZE: usize =
    (std::mem::size_of::<RawObject>() + OBJECT_ALIGN - 1) & !(OBJECT_ALIGN - 1);

/// Header shared by instances, classes and protocols.
#[repr(C)]
pub(crate) struct RawObject {
    /// Class of the object. Swappable with [`object_set_class`].
    pub(crate) isa: AtomicPtr<ClassInner>,
    pub(crate) flags: AtomicU32,
    pub(crate) refcount: AtomicUsize,
    /// Bytes requested at allocation, needed to free the block.
    pub(crate) alloc_size: usize,
    /// Payload used by the Foundation classes.
    pub(crate) storage: Mutex<Storage>,
}

impl RawObject {
    pub(crate) const fn new(isa: *mut ClassInner, flags: u32) -> Self {
        RawObject {
            isa: AtomicPtr::new(isa),
            flags: AtomicU32::new(flags),
            refcount: AtomicUsize::new(1),
            alloc_size: 0,
            storage: Mutex::new(Storage::Empty),
        }
    }

    fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }
}

/// Address-sized handle to a runtime object.
///
/// `ObjectPtr` is `Copy` and carries no ownership; the runtime's retain count
/// decides the object's lifetime. Null is a valid value and means `nil`.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPtr(*mut RawObject);

// SAFETY: ObjectPtr is Send + Sync because:
// - it is an address; all shared state behind it is atomic or locked
// - lifetime is governed by the atomic retain count, not by the handle
unsafe impl Send for ObjectPtr {}
unsafe impl Sync for ObjectPtr {}

impl ObjectPtr {
    /// The `nil` object.
    pub const NIL: ObjectPtr = ObjectPtr(std::ptr::null_mut());

    /// Returns `true` for `nil`.
    #[must_use]
    pub fn is_nil(self) -> bool {
        self.0.is_null()
    }

    /// Returns the object's address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    /// Rebuilds a handle from an address.
    #[must_use]
    pub fn from_addr(addr: usize) -> ObjectPtr {
        ObjectPtr(addr as *mut RawObject)
    }

    /// Returns the handle as an untyped pointer, for argument buffers.
    #[must_use]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.cast()
    }

    pub(crate) fn from_raw(raw: *mut RawObject) -> ObjectPtr {
        ObjectPtr(raw)
    }

    /// Returns `None` for nil.
    #[must_use]
    pub fn non_nil(self) -> Option<ObjectPtr> {
        if self.is_nil() { None } else { Some(self) }
    }

    /// # Safety
    ///
    /// The object must be live.
    pub(crate) unsafe fn header<'a>(self) -> &'a RawObject {
        // SAFETY: caller guarantees a live object
        unsafe { &*self.0 }
    }
}

impl fmt::Debug for ObjectPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPtr({:#x})", self.addr())
    }
}

impl fmt::Pointer for ObjectPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}

/// Allocates a zeroed instance of `class` with a retain count of one.
///
/// # Errors
///
/// Returns [`Error::NotAClass`] for a metaclass.
pub fn alloc_instance(class: Class) -> Result<ObjectPtr> {
    if class.is_metaclass() {
        return Err(Error::NotAClass(class.addr()));
    }

    let size = class.instance_size().max(HEADER_SIZE);
    let layout = Layout::from_size_align(size, OBJECT_ALIGN)
        .map_err(|_| Error::IvarLayout {
            class: class.name().to_string(),
            ivar: String::new(),
            reason: format!("instance size {size} is not allocatable"),
        })?;

    // SAFETY: layout has a non-zero size (at least HEADER_SIZE)
    let raw = unsafe { std::alloc::alloc_zeroed(layout) }.cast::<RawObject>();
    if raw.is_null() {
        std::alloc::handle_alloc_error(layout);
    }

    let mut header = RawObject::new(class.as_inner_ptr(), 0);
    header.alloc_size = size;
    // SAFETY: raw is a fresh, aligned allocation large enough for the header
    unsafe { raw.write(header) };
    Ok(ObjectPtr(raw))
}

/// Frees an object. Called by the root `dealloc` implementation.
///
/// Releases associated objects and Foundation payloads first.
///
/// # Safety
///
/// `obj` must be an instance (not a class) whose count reached zero, and it
/// must not be used afterwards.
pub unsafe fn dispose(obj: ObjectPtr) {
    if obj.is_nil() {
        return;
    }
    // SAFETY: caller guarantees obj is live until this returns
    let header = unsafe { obj.header() };
    if header.has_flag(FLAG_IMMORTAL) {
        return;
    }

    remove_associated_objects(obj);

    let storage = std::mem::take(&mut *header.storage.lock());
    storage.release_children();
    drop(storage);

    let layout = Layout::from_size_align(header.alloc_size, OBJECT_ALIGN);
    // SAFETY: the header was written by alloc_instance; dropping it in place
    // runs the Mutex/Storage destructors before the block is freed
    unsafe { std::ptr::drop_in_place(obj.0) };
    if let Ok(layout) = layout {
        // SAFETY: same layout that alloc_instance used
        unsafe { std::alloc::dealloc(obj.0.cast(), layout) };
    }
}

/// Increments the retain count and returns `obj`.
///
/// No-op for nil, immortal and deallocating objects.
pub fn retain(obj: ObjectPtr) -> ObjectPtr {
    if obj.is_nil() {
        return obj;
    }
    // SAFETY: callers only pass live objects
    let header = unsafe { obj.header() };
    if header.has_flag(FLAG_IMMORTAL | FLAG_DEALLOCATING) {
        return obj;
    }
    header.refcount.fetch_add(1, Ordering::AcqRel);
    obj
}

/// Decrements the retain count, sending `dealloc` when it reaches zero.
pub fn release(obj: ObjectPtr) {
    if obj.is_nil() {
        return;
    }
    // SAFETY: callers only pass live objects
    let header = unsafe { obj.header() };
    if header.has_flag(FLAG_IMMORTAL | FLAG_DEALLOCATING) {
        return;
    }

    let previous = header.refcount.fetch_sub(1, Ordering::AcqRel);
    if previous == 0 {
        header.refcount.store(0, Ordering::Release);
        oxbridge_log::error!("over-release of object {:#x}", obj.addr());
        return;
    }
    if previous == 1 && begin_dealloc(obj) {
        let sel = Sel::register("dealloc");
        // SAFETY: dealloc takes no arguments and returns void
        let sent = unsafe {
            message::msg_send(obj, sel, std::ptr::null(), std::ptr::null_mut())
        };
        if let Err(err) = sent {
            oxbridge_log::error!("dealloc of {:#x} failed: {err}", obj.addr());
        }
    }
}

/// Returns the current retain count. Immortal objects report `usize::MAX`.
#[must_use]
pub fn retain_count(obj: ObjectPtr) -> usize {
    if obj.is_nil() {
        return 0;
    }
    // SAFETY: callers only pass live objects
    let header = unsafe { obj.header() };
    if header.has_flag(FLAG_IMMORTAL) {
        return usize::MAX;
    }
    header.refcount.load(Ordering::Acquire)
}

/// Returns `true` while `dealloc` is running for `obj`.
#[must_use]
pub fn is_deallocating(obj: ObjectPtr) -> bool {
    // SAFETY: callers only pass live objects
    !obj.is_nil() && unsafe { obj.header() }.has_flag(FLAG_DEALLOCATING)
}

/// Returns `true` if `obj` is a class or metaclass.
#[must_use]
pub fn object_is_class(obj: ObjectPtr) -> bool {
    // SAFETY: callers only pass live objects
    !obj.is_nil() && unsafe { obj.header() }.has_flag(FLAG_CLASS)
}

/// Returns `true` if `obj` is a protocol.
#[must_use]
pub fn object_is_protocol(obj: ObjectPtr) -> bool {
    // SAFETY: callers only pass live objects
    !obj.is_nil() && unsafe { obj.header() }.has_flag(FLAG_PROTOCOL)
}

/// Returns the class of `obj` (the metaclass, for a class object).
#[must_use]
pub fn object_get_class(obj: ObjectPtr) -> Option<Class> {
    if obj.is_nil() {
        return None;
    }
    // SAFETY: callers only pass live objects
    let isa = unsafe { obj.header() }.isa.load(Ordering::Acquire);
    Class::from_inner_ptr(isa)
}

/// Replaces the class of `obj` and returns the previous one.
///
/// Used for runtime subclassing tricks such as observation classes that are
/// swapped in after initialization.
pub fn object_set_class(obj: ObjectPtr, class: Class) -> Option<Class> {
    if obj.is_nil() || object_is_class(obj) {
        return None;
    }
    // SAFETY: callers only pass live objects
    let previous = unsafe { obj.header() }
        .isa
        .swap(class.as_inner_ptr(), Ordering::AcqRel);
    Class::from_inner_ptr(previous)
}

/// Returns a pointer to the storage of `ivar` inside `obj`.
///
/// # Safety
///
/// `obj` must be a live instance of the class declaring `ivar` (or a
/// subclass).
#[must_use]
pub unsafe fn object_ivar_ptr(obj: ObjectPtr, ivar: &Ivar) -> *mut u8 {
    // SAFETY: ivar offsets lie inside the instance allocation
    unsafe { obj.as_ptr().add(ivar.offset()) }
}

/// Reads an object-typed ivar.
///
/// # Safety
///
/// See [`object_ivar_ptr`]; the ivar must be pointer-sized.
#[must_use]
pub unsafe fn object_get_ivar(obj: ObjectPtr, ivar: &Ivar) -> ObjectPtr {
    // SAFETY: forwarded contract
    let slot = unsafe { object_ivar_ptr(obj, ivar) }.cast::<ObjectPtr>();
    // SAFETY: slot is aligned to the ivar's alignment (pointer-sized)
    unsafe { slot.read() }
}

/// Writes an object-typed ivar without retaining.
///
/// # Safety
///
/// See [`object_get_ivar`].
pub unsafe fn object_set_ivar(obj: ObjectPtr, ivar: &Ivar, value: ObjectPtr) {
    // SAFETY: forwarded contract
    let slot = unsafe { object_ivar_ptr(obj, ivar) }.cast::<ObjectPtr>();
    // SAFETY: see object_get_ivar
    unsafe { slot.write(value) };
}

// ============================================================================
// Deallocation and weak references
// ============================================================================

/// Weak table: referent address -> addresses of slots holding it.
static WEAK_TABLE: OnceLock<Mutex<FxHashMap<usize, Vec<usize>>>> =
    OnceLock::new();

fn weak_table() -> &'static Mutex<FxHashMap<usize, Vec<usize>>> {
    WEAK_TABLE.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Marks `obj` deallocating and clears weak slots.
///
/// Returns `false` if a weak load resurrected the object first.
fn begin_dealloc(obj: ObjectPtr) -> bool {
    let mut table = weak_table().lock();
    // SAFETY: the count just reached zero; the object is still allocated
    let header = unsafe { obj.header() };
    if header.refcount.load(Ordering::Acquire) != 0 {
        return false;
    }
    header.flags.fetch_or(FLAG_DEALLOCATING, Ordering::AcqRel);

    if let Some(slots) = table.remove(&obj.addr()) {
        for slot in slots {
            // SAFETY: registered slots stay valid until they are cleared or
            // re-targeted through store_weak
            unsafe { (slot as *mut ObjectPtr).write(ObjectPtr::NIL) };
        }
    }
    true
}

/// Stores `value` into the weak slot at `location`.
///
/// # Safety
///
/// `location` must be valid for reads and writes of an `ObjectPtr` until it
/// is cleared with `store_weak(location, NIL)`.
pub unsafe fn store_weak(location: *mut ObjectPtr, value: ObjectPtr) {
    let mut table = weak_table().lock();
    // SAFETY: caller guarantees location is valid
    let old = unsafe { location.read() };
    if old == value {
        return;
    }

    if !old.is_nil() {
        if let Some(slots) = table.get_mut(&old.addr()) {
            slots.retain(|&slot| slot != location as usize);
            if slots.is_empty() {
                table.remove(&old.addr());
            }
        }
    }

    let value = if value.is_nil() || is_deallocating(value) {
        ObjectPtr::NIL
    } else {
        table
            .entry(value.addr())
            .or_default()
            .push(location as usize);
        value
    };
    // SAFETY: caller guarantees location is valid
    unsafe { location.write(value) };
}

/// Loads a weak slot, returning the referent retained (or nil).
///
/// # Safety
///
/// `location` must be a slot previously written with [`store_weak`].
#[must_use]
pub unsafe fn load_weak_retained(location: *const ObjectPtr) -> ObjectPtr {
    let _table = weak_table().lock();
    // SAFETY: caller guarantees location is valid
    let value = unsafe { location.read() };
    if value.is_nil() {
        return value;
    }
    // SAFETY: the slot is non-nil, so the referent has not finished
    // begin_dealloc, which needs the lock we hold
    let header = unsafe { value.header() };
    if header.has_flag(FLAG_DEALLOCATING) {
        return ObjectPtr::NIL;
    }
    if !header.has_flag(FLAG_IMMORTAL) {
        header.refcount.fetch_add(1, Ordering::AcqRel);
    }
    value
}

// ============================================================================
// Associated objects
// ============================================================================

/// Ownership policy for an associated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum AssociationPolicy {
    /// Weak, unretained reference.
    Assign = 0,
    /// Strong reference, nonatomic.
    RetainNonatomic = 1,
    /// Copied, nonatomic.
    CopyNonatomic = 3,
    /// Strong reference, atomic.
    Retain = 0x301,
    /// Copied, atomic.
    Copy = 0x303,
}

impl AssociationPolicy {
    fn retains(self) -> bool {
        !matches!(self, AssociationPolicy::Assign)
    }

    fn copies(self) -> bool {
        matches!(self, AssociationPolicy::CopyNonatomic | AssociationPolicy::Copy)
    }
}

type AssociationMap = FxHashMap<usize, FxHashMap<usize, (ObjectPtr, AssociationPolicy)>>;

static ASSOCIATIONS: OnceLock<Mutex<AssociationMap>> = OnceLock::new();

fn associations() -> &'static Mutex<AssociationMap> {
    ASSOCIATIONS.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Attaches `value` to `obj` under `key`. Nil removes the association.
///
/// The previous value is released after the table lock is dropped.
pub fn set_associated_object(
    obj: ObjectPtr,
    key: *const u8,
    value: ObjectPtr,
    policy: AssociationPolicy,
) {
    if obj.is_nil() {
        return;
    }

    let stored = if value.is_nil() {
        value
    } else if policy.copies() {
        copy_object(value)
    } else if policy.retains() {
        retain(value)
    } else {
        value
    };

    let previous = {
        let mut table = associations().lock();
        if stored.is_nil() {
            let entry = table.get_mut(&obj.addr());
            let previous = entry.and_then(|map| map.remove(&(key as usize)));
            if table.get(&obj.addr()).is_some_and(FxHashMap::is_empty) {
                table.remove(&obj.addr());
            }
            previous
        } else {
            table
                .entry(obj.addr())
                .or_default()
                .insert(key as usize, (stored, policy))
        }
    };

    if let Some((old, old_policy)) = previous {
        if old_policy.retains() {
            release(old);
        }
    }
}

/// Returns the object attached under `key`, unretained.
#[must_use]
pub fn get_associated_object(obj: ObjectPtr, key: *const u8) -> ObjectPtr {
    associations()
        .lock()
        .get(&obj.addr())
        .and_then(|map| map.get(&(key as usize)))
        .map_or(ObjectPtr::NIL, |(value, _)| *value)
}

fn remove_associated_objects(obj: ObjectPtr) {
    let removed = associations().lock().remove(&obj.addr());
    if let Some(map) = removed {
        for (value, policy) in map.into_values() {
            if policy.retains() {
                release(value);
            }
        }
    }
}

fn copy_object(value: ObjectPtr) -> ObjectPtr {
    let mut copied = ObjectPtr::NIL;
    let ret = (&raw mut copied).cast::<u8>();
    // SAFETY: copy takes no arguments and returns an object
    match unsafe { message::msg_send(value, Sel::register("copy"), std::ptr::null(), ret) } {
        Ok(()) => copied,
        Err(_) => retain(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::foundation;

    fn plain_object() -> ObjectPtr {
        alloc_instance(foundation::classes().ns_object).unwrap()
    }

    #[test]
    fn test_header_size_is_aligned() {
        assert_eq!(HEADER_SIZE % OBJECT_ALIGN, 0);
        assert!(HEADER_SIZE >= std::mem::size_of::<RawObject>());
    }

    #[test]
    fn test_retain_release_counts() {
        let obj = plain_object();
        assert_eq!(retain_count(obj), 1);
        retain(obj);
        assert_eq!(retain_count(obj), 2);
        release(obj);
        assert_eq!(retain_count(obj), 1);
        release(obj);
    }

    #[test]
    fn test_nil_is_inert() {
        assert_eq!(retain(ObjectPtr::NIL), ObjectPtr::NIL);
        release(ObjectPtr::NIL);
        assert_eq!(retain_count(ObjectPtr::NIL), 0);
        assert!(object_get_class(ObjectPtr::NIL).is_none());
    }

    #[test]
    fn test_weak_slot_cleared_on_dealloc() {
        let obj = plain_object();
        let mut slot = ObjectPtr::NIL;
        unsafe { store_weak(&raw mut slot, obj) };

        let loaded = unsafe { load_weak_retained(&raw const slot) };
        assert_eq!(loaded, obj);
        release(loaded);

        release(obj);
        assert!(slot.is_nil());
        assert!(unsafe { load_weak_retained(&raw const slot) }.is_nil());
    }

    #[test]
    fn test_weak_slot_retarget() {
        let a = plain_object();
        let b = plain_object();
        let mut slot = ObjectPtr::NIL;

        unsafe {
            store_weak(&raw mut slot, a);
            store_weak(&raw mut slot, b);
        }
        release(a);
        assert_eq!(slot, b);

        unsafe { store_weak(&raw mut slot, ObjectPtr::NIL) };
        release(b);
        assert!(slot.is_nil());
    }

    #[test]
    fn test_associated_object_retained_and_released() {
        let owner = plain_object();
        let value = plain_object();
        let key = "associationTestKey".as_ptr();

        set_associated_object(owner, key, value, AssociationPolicy::Retain);
        assert_eq!(retain_count(value), 2);
        assert_eq!(get_associated_object(owner, key), value);

        release(owner);
        assert_eq!(retain_count(value), 1);
        release(value);
    }

    #[test]
    fn test_associated_object_replace() {
        let owner = plain_object();
        let first = plain_object();
        let second = plain_object();
        let key = "associationReplaceKey".as_ptr();

        set_associated_object(owner, key, first, AssociationPolicy::RetainNonatomic);
        set_associated_object(owner, key, second, AssociationPolicy::RetainNonatomic);
        assert_eq!(retain_count(first), 1);
        assert_eq!(retain_count(second), 2);

        set_associated_object(owner, key, ObjectPtr::NIL, AssociationPolicy::Assign);
        assert_eq!(retain_count(second), 1);
        assert!(get_associated_object(owner, key).is_nil());

        for obj in [owner, first, second] {
            release(obj);
        }
    }

    #[test]
    fn test_class_objects_are_immortal() {
        let class_obj = foundation::classes().ns_object.as_object();
        assert!(object_is_class(class_obj));
        retain(class_obj);
        release(class_obj);
        release(class_obj);
        assert_eq!(retain_count(class_obj), usize::MAX);
    }
}
