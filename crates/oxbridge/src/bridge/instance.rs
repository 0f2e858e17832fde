//! Wrapped native objects and the identity registry.
//!
//! Every native object seen by the host is represented by exactly one live
//! [`ObjCInstance`]. The registry maps object addresses to weak references
//! to their wrappers; [`wrap`] returns the cached wrapper when one is alive
//! and creates (and records) a new one otherwise.
//!
//! # Ownership
//!
//! A wrapper holds exactly one strong native reference:
//!
//! - wrapping a borrowed pointer retains it
//! - wrapping an owned pointer (a `+1` result from an `alloc`, `new`, `copy`,
//!   `mutableCopy` or `init` method) adopts the caller's reference, or
//!   releases it again when a wrapper already exists
//! - dropping the last handle to a wrapper autoreleases the object, or
//!   releases it immediately when no pool is in place
//!
//! Class and protocol pointers never produce instance wrappers; they wrap to
//! [`Value::Class`], [`Value::Metaclass`] or [`Value::Protocol`].

use crate::bridge::class::{BoundPartial, ObjCClass, ObjCMetaclass, descriptor, lookup_attribute};
use crate::bridge::encoding::{self, TypeDescriptor, TypeKind};
use crate::bridge::method::BoundMethod;
use crate::bridge::protocol::ObjCProtocol;
use crate::bridge::value::{Value, object_for_value, read_value, value_from_ns, write_persistent};
use crate::error::{Error, Result};
use crate::runtime::autorelease::{self, autorelease};
use crate::runtime::foundation::{self, new_host_value, with_host_value};
use crate::runtime::object::{
    AssociationPolicy, get_associated_object, object_get_class, object_get_ivar, object_is_class,
    object_is_protocol, object_ivar_ptr, object_set_ivar, release, retain, retain_count,
    set_associated_object,
};
use crate::runtime::class::Ivar;
use crate::runtime::{Class, ObjectPtr, Sel};
use fxhash::FxHashMap;
use parking_lot::{ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

// ============================================================================
// Wrapper kinds
// ============================================================================

/// Specialized behavior a wrapper is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    /// Plain object.
    Object,
    /// `NSString` and subclasses.
    String,
    /// `NSArray`.
    Array,
    /// `NSMutableArray`.
    MutableArray,
    /// `NSDictionary`.
    Dictionary,
    /// `NSMutableDictionary`.
    MutableDictionary,
    /// Caller-defined tag.
    Custom(&'static str),
}

struct KindRegistry {
    explicit: FxHashMap<String, InstanceKind>,
    /// Class address -> kind, for every class already walked.
    memo: FxHashMap<usize, InstanceKind>,
}

static KINDS: OnceLock<RwLock<KindRegistry>> = OnceLock::new();

fn kinds() -> &'static RwLock<KindRegistry> {
    KINDS.get_or_init(|| {
        let explicit = [
            ("NSString", InstanceKind::String),
            ("NSArray", InstanceKind::Array),
            ("NSMutableArray", InstanceKind::MutableArray),
            ("NSDictionary", InstanceKind::Dictionary),
            ("NSMutableDictionary", InstanceKind::MutableDictionary),
        ]
        .into_iter()
        .map(|(name, kind)| (name.to_string(), kind))
        .collect();
        RwLock::new(KindRegistry {
            explicit,
            memo: FxHashMap::default(),
        })
    })
}

/// Makes wrappers of `class_name` and its subclasses use `kind`.
///
/// Earlier lookups are forgotten, so the mapping applies to every wrapper
/// created afterwards.
pub fn register_type_for_objcclass(class_name: &str, kind: InstanceKind) {
    let mut reg = kinds().write();
    reg.explicit.insert(class_name.to_string(), kind);
    reg.memo.clear();
}

/// Wrapper kind for instances of `class`.
///
/// Walks the superclass chain to the first registered class and memoizes
/// the answer for every class visited.
#[must_use]
pub fn kind_for_class(class: Class) -> InstanceKind {
    if let Some(kind) = kinds().read().memo.get(&class.addr()) {
        return *kind;
    }

    let mut reg = kinds().write();
    let mut visited = Vec::new();
    let mut current = Some(class);
    let mut kind = InstanceKind::Object;
    while let Some(c) = current {
        if let Some(found) = reg.memo.get(&c.addr()) {
            kind = *found;
            break;
        }
        visited.push(c.addr());
        if let Some(found) = reg.explicit.get(c.name()) {
            kind = *found;
            break;
        }
        current = c.superclass();
    }
    for addr in visited {
        reg.memo.insert(addr, kind);
    }
    kind
}

// ============================================================================
// Registry
// ============================================================================

type Registry = ReentrantMutex<RefCell<FxHashMap<usize, Weak<InstanceInner>>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| ReentrantMutex::new(RefCell::new(FxHashMap::default())))
}

/// Number of live wrappers.
#[must_use]
pub fn live_wrappers() -> usize {
    let guard = registry().lock();
    let map = guard.borrow();
    map.values().filter(|w| w.strong_count() > 0).count()
}

/// Forgets the wrapper of an object whose memory is about to be freed, so
/// a later object at the same address gets a fresh one.
pub(crate) fn evict(ptr: ObjectPtr) {
    let guard = registry().lock();
    guard.borrow_mut().remove(&ptr.addr());
}

struct InstanceInner {
    ptr: ObjectPtr,
    class_name: &'static str,
    kind: InstanceKind,
    /// Whether this wrapper still holds its native reference.
    owns: AtomicBool,
    #[cfg(feature = "wrapper_backtrace")]
    created_at: backtrace::Backtrace,
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        {
            let guard = registry().lock();
            let mut map = guard.borrow_mut();
            // A newer wrapper may already sit under this address.
            if map
                .get(&self.ptr.addr())
                .is_some_and(|entry| entry.strong_count() == 0)
            {
                map.remove(&self.ptr.addr());
            }
        }

        if self.owns.swap(false, Ordering::AcqRel) {
            oxbridge_log::trace!("dropping wrapper for {} {:#x}", self.class_name, self.ptr.addr());
            if autorelease::is_active() {
                autorelease(self.ptr);
            } else {
                release(self.ptr);
            }
        }
    }
}

/// A wrapped native object.
///
/// Cloning shares the wrapper; the native reference is released when the
/// last clone is dropped.
#[derive(Clone)]
pub struct ObjCInstance(Arc<InstanceInner>);

/// Result of an attribute lookup.
#[derive(Debug, Clone)]
pub enum Attribute {
    /// A property value or host attribute.
    Value(Value),
    /// A method bound to its receiver.
    Method(BoundMethod),
    /// A keyword method family bound to its receiver.
    Partial(BoundPartial),
}

/// Wraps a native pointer.
///
/// `owned` says whether the caller hands over a reference (`+1` results
/// from `alloc`, `new`, `copy`, `mutableCopy` and `init` methods).
///
/// # Errors
///
/// - [`Error::Deallocated`] if the object has no class
/// - [`Error::NotAClass`] / [`Error::NotAProtocol`] for corrupt class or
///   protocol pointers
///
/// # Example
///
/// ```rust
/// use oxbridge::bridge::instance::wrap;
/// use oxbridge::bridge::value::Value;
/// use oxbridge::runtime::{ObjectPtr, foundation, object};
///
/// assert_eq!(wrap(ObjectPtr::NIL, false).unwrap(), Value::None);
///
/// let obj = object::alloc_instance(foundation::classes().ns_object).unwrap();
/// let first = wrap(obj, true).unwrap();
/// let second = wrap(obj, false).unwrap();
/// assert_eq!(first, second);
/// assert_eq!(object::retain_count(obj), 1);
/// ```
pub fn wrap(ptr: ObjectPtr, owned: bool) -> Result<Value> {
    if ptr.is_nil() {
        return Ok(Value::None);
    }
    if object_is_class(ptr) {
        let class = Class::from_object(ptr).ok_or(Error::NotAClass(ptr.addr()))?;
        return Ok(if class.is_metaclass() {
            Value::Metaclass(ObjCMetaclass::from_class(class))
        } else {
            Value::Class(ObjCClass::from_class(class))
        });
    }
    if object_is_protocol(ptr) {
        return Ok(Value::Protocol(ObjCProtocol::from_ptr(ptr)?));
    }

    let class = object_get_class(ptr).ok_or(Error::Deallocated(ptr.addr()))?;
    let class_name = class.name();

    let mut extra_release = false;
    let mut stale = None;
    let wrapper = {
        let guard = registry().lock();
        let cached = guard.borrow().get(&ptr.addr()).and_then(Weak::upgrade);
        match cached {
            Some(existing)
                if existing.owns.load(Ordering::Acquire)
                    && (existing.class_name == class_name
                        || class_name.ends_with(&format!("_{}", existing.class_name))) =>
            {
                extra_release = owned;
                ObjCInstance(existing)
            }
            cached => {
                // The new wrapper takes over a stale wrapper's reference.
                let inherited = cached
                    .as_ref()
                    .is_some_and(|old| old.owns.swap(false, Ordering::AcqRel));
                match &cached {
                    Some(old) if !inherited => oxbridge_log::debug!(
                        "replacing released wrapper for {} {:#x}",
                        old.class_name,
                        ptr.addr()
                    ),
                    Some(old) => oxbridge_log::warn!(
                        "evicting stale wrapper for {:#x}: was {}, now {}",
                        ptr.addr(),
                        old.class_name,
                        class_name
                    ),
                    None => {}
                }
                if inherited {
                    extra_release = owned;
                } else if !owned {
                    retain(ptr);
                }
                stale = cached;

                let inner = Arc::new(InstanceInner {
                    ptr,
                    class_name,
                    kind: kind_for_class(class),
                    owns: AtomicBool::new(true),
                    #[cfg(feature = "wrapper_backtrace")]
                    created_at: backtrace::Backtrace::new_unresolved(),
                });
                guard
                    .borrow_mut()
                    .insert(ptr.addr(), Arc::downgrade(&inner));
                oxbridge_log::debug!("wrapped {} {:#x}", class_name, ptr.addr());
                ObjCInstance(inner)
            }
        }
    };

    // Dropped outside the registry borrow; it may release native objects.
    drop(stale);
    if extra_release {
        release(ptr);
    }
    Ok(Value::Object(wrapper))
}

fn attribute_key(name: &str) -> *const u8 {
    Sel::register(&format!("oxbridge.attr.{name}")).as_ptr()
}

impl ObjCInstance {
    /// Native pointer.
    #[must_use]
    pub fn ptr(&self) -> ObjectPtr {
        self.0.ptr
    }

    /// Class name recorded when the wrapper was created.
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        self.0.class_name
    }

    /// Wrapper kind.
    #[must_use]
    pub fn kind(&self) -> InstanceKind {
        self.0.kind
    }

    /// Current class of the object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Deallocated`] if the object has no class.
    pub fn class(&self) -> Result<ObjCClass> {
        self.runtime_class().map(ObjCClass::from_class)
    }

    fn runtime_class(&self) -> Result<Class> {
        object_get_class(self.ptr()).ok_or(Error::Deallocated(self.ptr().addr()))
    }

    /// Looks up an attribute.
    ///
    /// Order: property getter (skipped for names ending in `_`), keyword
    /// method family, method, host attribute. Method names map to
    /// selectors by replacing every `_` with `:` when the name ends in `_`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AttributeNotFound`] when nothing matches.
    pub fn get(&self, name: &str) -> Result<Attribute> {
        let class = self.runtime_class()?;
        let receiver = Value::Object(self.clone());
        if let Some(found) = lookup_attribute(descriptor(class), &receiver, name)? {
            return Ok(found);
        }
        if let Some(value) = self.host_attribute(name) {
            return Ok(Attribute::Value(value));
        }
        Err(Error::AttributeNotFound {
            class: class.name().to_string(),
            name: name.to_string(),
        })
    }

    /// Reads an attribute that must be a value (a property or a host
    /// attribute).
    ///
    /// # Errors
    ///
    /// - [`Error::AttributeNotFound`] when nothing matches
    /// - [`Error::ArgumentType`] when the name is a method
    pub fn value(&self, name: &str) -> Result<Value> {
        match self.get(name)? {
            Attribute::Value(value) => Ok(value),
            _ => Err(Error::ArgumentType {
                expected: format!("value attribute '{name}'"),
                got: "method".to_string(),
            }),
        }
    }

    /// Assigns an attribute.
    ///
    /// Properties go through their setter; any other name is stored as a
    /// host attribute attached to the native object and released with it.
    ///
    /// # Errors
    ///
    /// Returns conversion or send errors from the property setter.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let class = self.runtime_class()?;
        if let Some(access) = descriptor(class).property(name)? {
            if let Some(setter) = access.setter {
                setter.call(&Value::Object(self.clone()), &[value])?;
                return Ok(());
            }
            return Err(Error::InvalidDefinition {
                name: name.to_string(),
                reason: "property is read-only".to_string(),
            });
        }

        let key = attribute_key(name);
        if value.is_none() {
            set_associated_object(self.ptr(), key, ObjectPtr::NIL, AssociationPolicy::RetainNonatomic);
            return Ok(());
        }
        let boxed = new_host_value(Box::new(value));
        set_associated_object(self.ptr(), key, boxed, AssociationPolicy::RetainNonatomic);
        release(boxed);
        Ok(())
    }

    fn host_attribute(&self, name: &str) -> Option<Value> {
        let boxed = get_associated_object(self.ptr(), attribute_key(name));
        if boxed.is_nil() {
            return None;
        }
        with_host_value(boxed, |any| any.downcast_ref::<Value>().cloned()).flatten()
    }

    /// Calls a method by name.
    ///
    /// # Errors
    ///
    /// - [`Error::MethodNotFound`] if no method matches
    /// - argument and send errors from [`BoundMethod::call`]
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        let class = self.runtime_class()?;
        let selector = crate::bridge::class::selector_for(name);
        let method = descriptor(class)
            .resolve(&selector)?
            .ok_or_else(|| Error::MethodNotFound {
                class: class.name().to_string(),
                selector: selector.clone(),
            })?;
        method.call(&Value::Object(self.clone()), args)
    }

    /// Keyword method family starting with `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MethodNotFound`] if no selector starts with `base`.
    pub fn partial(&self, base: &str) -> Result<BoundPartial> {
        let class = self.runtime_class()?;
        descriptor(class).partial(&Value::Object(self.clone()), base)
    }

    fn find_ivar(&self, name: &str) -> Result<(Ivar, Arc<TypeDescriptor>)> {
        let class = self.runtime_class()?;
        let ivar = class.ivar(name).ok_or_else(|| Error::AttributeNotFound {
            class: class.name().to_string(),
            name: name.to_string(),
        })?;
        let ty = encoding::decode_in_context(ivar.types(), name)?;
        Ok((ivar, ty))
    }

    /// Reads an instance variable.
    ///
    /// # Errors
    ///
    /// - [`Error::AttributeNotFound`] if the class has no such ivar
    /// - encoding errors for its declared type
    pub fn ivar(&self, name: &str) -> Result<Value> {
        let (ivar, ty) = self.find_ivar(name)?;
        // SAFETY: the ivar belongs to the object's class chain
        unsafe { read_value(&ty, object_ivar_ptr(self.ptr(), &ivar)) }
    }

    /// Writes an instance variable. Object ivars hold strong references:
    /// the new value is retained and the old one released.
    ///
    /// # Errors
    ///
    /// See [`ObjCInstance::ivar`]; also conversion errors.
    pub fn set_ivar(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let (ivar, ty) = self.find_ivar(name)?;
        let value = value.into();
        // SAFETY: the ivar belongs to the object's class chain
        let slot = unsafe { object_ivar_ptr(self.ptr(), &ivar) };
        if matches!(ty.kind(), TypeKind::Object { .. }) {
            let new = object_for_value(&value)?;
            retain(new);
            // SAFETY: object ivars are pointer sized
            let old = unsafe { object_get_ivar(self.ptr(), &ivar) };
            // SAFETY: as above
            unsafe { object_set_ivar(self.ptr(), &ivar, new) };
            release(old);
            return Ok(());
        }
        // SAFETY: the slot is sized for the ivar's type
        unsafe { write_persistent(&ty, &value, slot) }
    }

    /// Gives up the wrapper's native reference now.
    ///
    /// Later drops do nothing. Calling this twice is a no-op.
    pub fn release(&self) {
        if self.0.owns.swap(false, Ordering::AcqRel) {
            self.forget();
            release(self.ptr());
        }
    }

    /// Hands the wrapper's native reference to the current autorelease pool.
    pub fn autorelease(&self) {
        if self.0.owns.swap(false, Ordering::AcqRel) {
            self.forget();
            autorelease(self.ptr());
        }
    }

    /// Drops the registry entry of a wrapper that no longer holds a
    /// reference, so a later `wrap` of the address builds a new one.
    fn forget(&self) {
        let guard = registry().lock();
        let mut map = guard.borrow_mut();
        if map
            .get(&self.ptr().addr())
            .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), Arc::as_ptr(&self.0)))
        {
            map.remove(&self.ptr().addr());
        }
    }

    /// Whether the wrapper still holds its native reference.
    #[must_use]
    pub fn owns_reference(&self) -> bool {
        self.0.owns.load(Ordering::Acquire)
    }

    /// Native retain count.
    #[must_use]
    pub fn retain_count(&self) -> usize {
        retain_count(self.ptr())
    }

    /// `isKindOfClass:`.
    #[must_use]
    pub fn is_kind_of(&self, class: &ObjCClass) -> bool {
        self.runtime_class()
            .is_ok_and(|own| own.is_subclass_of(class.runtime_class()))
    }

    /// `conformsToProtocol:`.
    #[must_use]
    pub fn conforms_to(&self, protocol: &ObjCProtocol) -> bool {
        self.runtime_class()
            .is_ok_and(|own| own.conforms_to(protocol.runtime_protocol()))
    }

    /// The object's `description`.
    ///
    /// # Errors
    ///
    /// Returns send errors.
    pub fn description(&self) -> Result<String> {
        let text = self.call("description", &[])?;
        Ok(match value_from_ns(&text)? {
            Value::Str(text) => text,
            _ => String::new(),
        })
    }

    /// Where the wrapper was created.
    #[cfg(feature = "wrapper_backtrace")]
    #[must_use]
    pub fn created_at(&self) -> String {
        let mut trace = self.0.created_at.clone();
        trace.resolve();
        format!("{trace:?}")
    }
}

impl PartialEq for ObjCInstance {
    fn eq(&self, other: &ObjCInstance) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ObjCInstance {}

impl Hash for ObjCInstance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr().addr().hash(state);
    }
}

impl fmt::Debug for ObjCInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ObjCInstance: {} at {:#x}>", self.class_name(), self.ptr().addr())
    }
}

impl TryFrom<Value> for ObjCInstance {
    type Error = Error;

    fn try_from(value: Value) -> Result<ObjCInstance> {
        match value.unwrapped() {
            Value::Object(obj) => Ok(obj.clone()),
            other => Err(Error::ArgumentType {
                expected: "object".to_string(),
                got: other.type_label().to_string(),
            }),
        }
    }
}

/// Wraps a host value as a Foundation object, or returns wrapped objects as
/// they are.
///
/// # Errors
///
/// See [`crate::bridge::value::ns_from_value`].
pub fn objc_instance(value: &Value) -> Result<ObjCInstance> {
    foundation::classes();
    let converted = crate::runtime::autorelease::autoreleasepool(|| {
        let ptr = object_for_value(value)?;
        wrap(ptr, false)
    })?;
    ObjCInstance::try_from(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::object::alloc_instance;

    fn new_object() -> ObjectPtr {
        alloc_instance(foundation::classes().ns_object).unwrap()
    }

    #[test]
    fn test_nil_wraps_to_none() {
        assert_eq!(wrap(ObjectPtr::NIL, false).unwrap(), Value::None);
        assert_eq!(wrap(ObjectPtr::NIL, true).unwrap(), Value::None);
    }

    #[test]
    fn test_class_pointer_wraps_to_class() {
        let ns_object = foundation::classes().ns_object;
        assert!(matches!(wrap(ns_object.as_object(), false).unwrap(), Value::Class(_)));
        let meta = ns_object.metaclass().unwrap();
        assert!(matches!(wrap(meta.as_object(), false).unwrap(), Value::Metaclass(_)));
    }

    #[test]
    fn test_borrowed_wrap_retains_once() {
        let obj = new_object();
        let a = wrap(obj, false).unwrap();
        assert_eq!(retain_count(obj), 2);
        let b = wrap(obj, false).unwrap();
        assert_eq!(retain_count(obj), 2);
        assert_eq!(a, b);
        drop(b);
        drop(a);
        assert_eq!(retain_count(obj), 1);
        release(obj);
    }

    #[test]
    fn test_owned_wrap_compensates() {
        let obj = new_object();
        let a = wrap(obj, true).unwrap();
        assert_eq!(retain_count(obj), 1);
        retain(obj);
        let b = wrap(obj, true).unwrap();
        assert_eq!(a, b);
        assert_eq!(retain_count(obj), 1);
    }

    #[test]
    fn test_release_forgets_the_registry_entry() {
        let obj = new_object();
        retain(obj);
        let first = wrap(obj, true).unwrap();
        first.as_object().unwrap().release();

        let second = wrap(obj, false).unwrap();
        assert_ne!(first, second);
        assert!(second.as_object().unwrap().owns_reference());
        assert_eq!(retain_count(obj), 2);
        drop(second);
        drop(first);
        assert_eq!(retain_count(obj), 1);
        release(obj);
    }

    #[test]
    fn test_manual_release_disarms_drop() {
        let obj = new_object();
        retain(obj);
        let value = wrap(obj, true).unwrap();
        let instance = value.as_object().unwrap().clone();
        assert_eq!(instance.retain_count(), 2);
        instance.release();
        assert!(!instance.owns_reference());
        assert_eq!(retain_count(obj), 1);
        drop(instance);
        drop(value);
        assert_eq!(retain_count(obj), 1);
        release(obj);
    }

    #[test]
    fn test_drop_in_pool_defers_release() {
        let obj = new_object();
        retain(obj);
        let value = wrap(obj, true).unwrap();
        crate::runtime::autorelease::autoreleasepool(|| {
            drop(value);
            assert_eq!(retain_count(obj), 2);
        });
        assert_eq!(retain_count(obj), 1);
        release(obj);
    }

    #[test]
    fn test_kinds_follow_superclasses() {
        let f = foundation::classes();
        assert_eq!(kind_for_class(f.ns_mutable_array), InstanceKind::MutableArray);
        assert_eq!(kind_for_class(f.ns_number), InstanceKind::Object);
        assert_eq!(kind_for_class(f.ns_string), InstanceKind::String);
    }

    #[test]
    fn test_host_attributes() {
        let obj = new_object();
        let value = wrap(obj, true).unwrap();
        let instance = value.as_object().unwrap();
        instance.set("tag", "hello").unwrap();
        assert_eq!(instance.value("tag").unwrap(), Value::from("hello"));
        instance.set("tag", 5).unwrap();
        assert_eq!(instance.value("tag").unwrap(), Value::Int(5));
        assert!(matches!(
            instance.get("missing"),
            Err(Error::AttributeNotFound { .. })
        ));
    }
}
