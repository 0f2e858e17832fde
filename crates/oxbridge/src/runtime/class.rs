//! Classes, metaclasses and their method, ivar and property tables.
//!
//! # Architecture
//!
//! Classes are created in pairs: [`allocate_class_pair`] builds the class and
//! its metaclass, members are added, and [`register_class_pair`] publishes the
//! class under its name. Until registration the class can gain instance
//! variables; afterwards its instance layout is fixed.
//!
//! Class data is leaked and never freed. A [`Class`] is a copyable pointer to
//! it. The data begins with an object header whose `isa` points at the
//! metaclass, so a class can receive messages (class methods).
//!
//! Metaclass chain: a metaclass's superclass is the superclass's metaclass,
//! the root metaclass's superclass is the root class, and every metaclass's
//! `isa` is the root metaclass.
//!
//! # Thread Safety
//!
//! Every table sits behind a `parking_lot::RwLock`. The dispatch cache is
//! discarded whenever any class gains a method, tracked by a global
//! generation counter.

use crate::error::{Error, Result};
use crate::runtime::abi::{self, Arch, Convention};
use crate::runtime::object::{
    FLAG_CLASS, FLAG_IMMORTAL, HEADER_SIZE, ObjectPtr, RawObject,
};
use crate::runtime::{Protocol, Sel};
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::RwLock;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Method implementation with a C-compatible signature.
///
/// Arguments: receiver, selector, a pointer to an array of argument pointers
/// (one per declared argument), and a pointer to return value storage (null
/// for void methods).
pub type ImpFn = unsafe extern "C" fn(
    receiver: ObjectPtr,
    cmd: Sel,
    args: *const *mut u8,
    ret: *mut u8,
);

/// Method implementation backed by a host closure (a trampoline).
pub type ImpClosure =
    dyn Fn(ObjectPtr, Sel, *const *mut u8, *mut u8) + Send + Sync;

/// A method implementation.
#[derive(Clone)]
pub enum Imp {
    /// Plain function pointer.
    Native(ImpFn),
    /// Closure capturing host state.
    Closure(Arc<ImpClosure>),
}

impl Imp {
    /// Wraps a closure.
    pub fn from_fn<F>(f: F) -> Imp
    where
        F: Fn(ObjectPtr, Sel, *const *mut u8, *mut u8) + Send + Sync + 'static,
    {
        Imp::Closure(Arc::new(f))
    }

    /// Calls the implementation.
    ///
    /// # Safety
    ///
    /// `args` must hold one valid pointer per declared argument and `ret`
    /// must be large enough for the declared return type.
    pub unsafe fn invoke(
        &self,
        receiver: ObjectPtr,
        cmd: Sel,
        args: *const *mut u8,
        ret: *mut u8,
    ) {
        match self {
            // SAFETY: forwarded contract
            Imp::Native(f) => unsafe { f(receiver, cmd, args, ret) },
            Imp::Closure(f) => f(receiver, cmd, args, ret),
        }
    }

    /// Identity of the implementation, for diagnostics and comparisons.
    #[must_use]
    pub fn addr(&self) -> usize {
        match self {
            Imp::Native(f) => *f as usize,
            Imp::Closure(f) => Arc::as_ptr(f).cast::<()>() as usize,
        }
    }
}

impl fmt::Debug for Imp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Imp::Native(_) => write!(f, "Imp::Native({:#x})", self.addr()),
            Imp::Closure(_) => write!(f, "Imp::Closure({:#x})", self.addr()),
        }
    }
}

/// A method: selector, implementation and type encoding.
#[derive(Clone, Debug)]
pub struct Method {
    selector: Sel,
    imp: Imp,
    types: Arc<str>,
    convention: Convention,
}

impl Method {
    /// Creates a method. The return convention is derived from `types`.
    #[must_use]
    pub fn new(selector: Sel, imp: Imp, types: &str) -> Method {
        let convention = abi::return_convention(types, Arch::current())
            .unwrap_or(Convention::Standard);
        Method {
            selector,
            imp,
            types: Arc::from(types),
            convention,
        }
    }

    /// Returns the selector.
    #[must_use]
    pub fn selector(&self) -> Sel {
        self.selector
    }

    /// Returns the implementation.
    #[must_use]
    pub fn imp(&self) -> &Imp {
        &self.imp
    }

    /// Returns the full type encoding, e.g. `"@@:i"`.
    #[must_use]
    pub fn types(&self) -> &str {
        &self.types
    }

    /// Returns the entry point a caller must use to send this method.
    #[must_use]
    pub fn convention(&self) -> Convention {
        self.convention
    }
}

/// An instance variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ivar {
    name: Arc<str>,
    types: Arc<str>,
    offset: usize,
    size: usize,
}

impl Ivar {
    /// Ivar name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type encoding.
    #[must_use]
    pub fn types(&self) -> &str {
        &self.types
    }

    /// Byte offset from the start of the object.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

/// A declared property and its attribute list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    name: Arc<str>,
    attributes: Vec<(String, String)>,
}

impl Property {
    /// Creates a property from `(attribute, value)` pairs such as
    /// `("T", "@\"NSString\"")`, `("&", "")`, `("V", "_name")`.
    #[must_use]
    pub fn new(name: &str, attributes: Vec<(String, String)>) -> Property {
        Property {
            name: Arc::from(name),
            attributes,
        }
    }

    /// Property name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of one attribute, if present.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute string in runtime format, e.g. `T@"NSString",&,V_name`.
    #[must_use]
    pub fn attribute_string(&self) -> String {
        self.attributes
            .iter()
            .map(|(k, v)| format!("{k}{v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Class data. Leaked; lives for the whole process.
#[repr(C)]
pub(crate) struct ClassInner {
    header: RawObject,
    name: &'static str,
    superclass: Option<Class>,
    is_meta: bool,
    /// For a class, its metaclass; for a metaclass, its class.
    pair: OnceLock<Class>,
    methods: RwLock<FxHashMap<Sel, Method>>,
    ivars: RwLock<Vec<Ivar>>,
    instance_size: AtomicUsize,
    properties: RwLock<Vec<Property>>,
    protocols: RwLock<Vec<Protocol>>,
    registered: AtomicBool,
    method_list_copies: AtomicUsize,
    cache: RwLock<(u64, FxHashMap<Sel, Method>)>,
}

/// A runtime class or metaclass.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Class(NonNull<ClassInner>);

// SAFETY: Class is Send + Sync because:
// - ClassInner is leaked and never freed
// - every mutable table is behind a lock or atomic
unsafe impl Send for Class {}
unsafe impl Sync for Class {}

/// Bumped whenever any class gains a method.
static METHOD_GENERATION: AtomicU64 = AtomicU64::new(0);

struct ClassRegistry {
    /// Registered classes by name.
    named: FxHashMap<&'static str, Class>,
    /// Names of allocated but unregistered pairs.
    pending: FxHashSet<&'static str>,
    /// Addresses of every class and metaclass ever created.
    addresses: FxHashSet<usize>,
}

static REGISTRY: OnceLock<RwLock<ClassRegistry>> = OnceLock::new();

fn registry() -> &'static RwLock<ClassRegistry> {
    REGISTRY.get_or_init(|| {
        RwLock::new(ClassRegistry {
            named: FxHashMap::default(),
            pending: FxHashSet::default(),
            addresses: FxHashSet::default(),
        })
    })
}

fn leak_inner(
    name: &'static str,
    superclass: Option<Class>,
    is_meta: bool,
    instance_size: usize,
) -> Class {
    let inner = Box::leak(Box::new(ClassInner {
        header: RawObject::new(std::ptr::null_mut(), FLAG_CLASS | FLAG_IMMORTAL),
        name,
        superclass,
        is_meta,
        pair: OnceLock::new(),
        methods: RwLock::new(FxHashMap::default()),
        ivars: RwLock::new(Vec::new()),
        instance_size: AtomicUsize::new(instance_size),
        properties: RwLock::new(Vec::new()),
        protocols: RwLock::new(Vec::new()),
        registered: AtomicBool::new(false),
        method_list_copies: AtomicUsize::new(0),
        cache: RwLock::new((0, FxHashMap::default())),
    }));
    Class(NonNull::from(inner))
}

fn create_pair(reg: &mut ClassRegistry, superclass: Option<Class>, name: &str) -> Class {
    let name: &'static str = Box::leak(name.to_owned().into_boxed_str());
    let instance_size = superclass.map_or(HEADER_SIZE, Class::instance_size);

    let class = leak_inner(name, superclass, false, instance_size);
    // The root metaclass inherits from the root class.
    let meta_super = match superclass {
        Some(superclass) => superclass.metaclass(),
        None => Some(class),
    };
    let metaclass = leak_inner(name, meta_super, true, 0);
    let root_meta = match superclass {
        Some(superclass) => superclass.root_class().metaclass().unwrap_or(metaclass),
        None => metaclass,
    };

    class.inner().header.isa.store(metaclass.as_inner_ptr(), Ordering::Release);
    metaclass.inner().header.isa.store(root_meta.as_inner_ptr(), Ordering::Release);
    let _ = class.inner().pair.set(metaclass);
    let _ = metaclass.inner().pair.set(class);

    reg.addresses.insert(class.addr());
    reg.addresses.insert(metaclass.addr());
    class
}

/// Creates and registers a Foundation class during bootstrap.
///
/// Skips the name check; bootstrap runs before any user class exists.
pub(crate) fn bootstrap_class(superclass: Option<Class>, name: &str) -> Class {
    let mut reg = registry().write();
    let class = create_pair(&mut reg, superclass, name);
    class.inner().registered.store(true, Ordering::Release);
    if let Some(meta) = class.metaclass() {
        meta.inner().registered.store(true, Ordering::Release);
    }
    reg.named.insert(class.inner().name, class);
    class
}

/// Creates a new class (and metaclass) deriving from `superclass`.
///
/// The class is not visible to [`get_class`] until it is registered.
///
/// # Errors
///
/// - [`Error::ClassAlreadyExists`] if the name is taken, registered or not
/// - [`Error::NotAClass`] if `superclass` is a metaclass
pub fn allocate_class_pair(superclass: Option<Class>, name: &str) -> Result<Class> {
    crate::runtime::foundation::classes();
    if let Some(superclass) = superclass {
        if superclass.is_metaclass() {
            return Err(Error::NotAClass(superclass.addr()));
        }
    }

    let mut reg = registry().write();
    if reg.named.contains_key(name) || reg.pending.contains(name) {
        return Err(Error::ClassAlreadyExists(name.to_string()));
    }
    let class = create_pair(&mut reg, superclass, name);
    reg.pending.insert(class.inner().name);
    Ok(class)
}

/// Publishes a class allocated with [`allocate_class_pair`].
///
/// # Errors
///
/// Returns [`Error::ClassAlreadyRegistered`] if it already is, or
/// [`Error::NotAClass`] for a metaclass.
pub fn register_class_pair(class: Class) -> Result<()> {
    if class.is_metaclass() {
        return Err(Error::NotAClass(class.addr()));
    }
    let mut reg = registry().write();
    if class.inner().registered.swap(true, Ordering::AcqRel) {
        return Err(Error::ClassAlreadyRegistered(class.name().to_string()));
    }
    if let Some(meta) = class.metaclass() {
        meta.inner().registered.store(true, Ordering::Release);
    }
    reg.pending.remove(class.name());
    reg.named.insert(class.inner().name, class);
    Ok(())
}

/// Looks up a registered class by name.
#[must_use]
pub fn get_class(name: &str) -> Option<Class> {
    crate::runtime::foundation::classes();
    registry().read().named.get(name).copied()
}

/// Looks up a metaclass by class name.
#[must_use]
pub fn get_metaclass(name: &str) -> Option<Class> {
    get_class(name).and_then(Class::metaclass)
}

/// Returns `true` if `name` is taken by a registered or pending class.
#[must_use]
pub fn class_name_in_use(name: &str) -> bool {
    let reg = registry().read();
    reg.named.contains_key(name) || reg.pending.contains(name)
}

/// Returns every registered class.
#[must_use]
pub fn all_classes() -> Vec<Class> {
    crate::runtime::foundation::classes();
    registry().read().named.values().copied().collect()
}

impl Class {
    fn inner(&self) -> &'static ClassInner {
        // SAFETY: ClassInner is leaked and never freed
        unsafe { &*self.0.as_ptr() }
    }

    pub(crate) fn as_inner_ptr(self) -> *mut ClassInner {
        self.0.as_ptr()
    }

    pub(crate) fn from_inner_ptr(ptr: *mut ClassInner) -> Option<Class> {
        NonNull::new(ptr).map(Class)
    }

    /// Converts an object pointer to a class if it is one.
    #[must_use]
    pub fn from_object(obj: ObjectPtr) -> Option<Class> {
        if !registry().read().addresses.contains(&obj.addr()) {
            return None;
        }
        Class::from_inner_ptr(obj.as_ptr().cast())
    }

    /// The class as a message receiver.
    #[must_use]
    pub fn as_object(self) -> ObjectPtr {
        ObjectPtr::from_raw(self.0.as_ptr().cast())
    }

    /// Class address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Class name (metaclasses share the name of their class).
    #[must_use]
    pub fn name(self) -> &'static str {
        self.inner().name
    }

    /// Superclass, or `None` for a root class.
    #[must_use]
    pub fn superclass(self) -> Option<Class> {
        self.inner().superclass
    }

    /// Returns `true` for a metaclass.
    #[must_use]
    pub fn is_metaclass(self) -> bool {
        self.inner().is_meta
    }

    /// Metaclass of a class, or `None` if `self` is already a metaclass.
    #[must_use]
    pub fn metaclass(self) -> Option<Class> {
        if self.is_metaclass() {
            None
        } else {
            self.inner().pair.get().copied()
        }
    }

    /// The class a metaclass belongs to.
    #[must_use]
    pub fn instance_class(self) -> Option<Class> {
        if self.is_metaclass() {
            self.inner().pair.get().copied()
        } else {
            None
        }
    }

    /// Root of the class chain (`self` for a root class).
    #[must_use]
    pub fn root_class(self) -> Class {
        let mut root = self.instance_class().unwrap_or(self);
        while let Some(superclass) = root.superclass() {
            root = superclass;
        }
        root
    }

    /// Returns `true` once the pair is registered.
    #[must_use]
    pub fn is_registered(self) -> bool {
        self.inner().registered.load(Ordering::Acquire)
    }

    /// Size of an instance in bytes, header included.
    #[must_use]
    pub fn instance_size(self) -> usize {
        self.inner().instance_size.load(Ordering::Acquire)
    }

    /// Returns `true` if `self` is `other` or inherits from it.
    #[must_use]
    pub fn is_subclass_of(self, other: Class) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if class == other {
                return true;
            }
            current = class.superclass();
        }
        false
    }

    // ------------------------------------------------------------------
    // Methods
    // ------------------------------------------------------------------

    /// Adds or replaces a method on this class.
    ///
    /// Returns `true` if the selector was new to this class.
    pub fn add_method(self, method: Method) -> bool {
        let added = self
            .inner()
            .methods
            .write()
            .insert(method.selector, method)
            .is_none();
        METHOD_GENERATION.fetch_add(1, Ordering::AcqRel);
        added
    }

    /// Copies this class's own methods (not inherited ones).
    ///
    /// Each call is counted; see [`Class::method_list_copies`].
    #[must_use]
    pub fn copy_method_list(self) -> Vec<Method> {
        self.inner().method_list_copies.fetch_add(1, Ordering::Relaxed);
        self.inner().methods.read().values().cloned().collect()
    }

    /// Number of times [`Class::copy_method_list`] ran for this class.
    #[must_use]
    pub fn method_list_copies(self) -> usize {
        self.inner().method_list_copies.load(Ordering::Relaxed)
    }

    /// Finds a method on this class only.
    #[must_use]
    pub fn own_method(self, selector: Sel) -> Option<Method> {
        self.inner().methods.read().get(&selector).cloned()
    }

    /// Finds a method on this class or its superclasses, uncached.
    #[must_use]
    pub fn instance_method(self, selector: Sel) -> Option<Method> {
        let mut current = Some(self);
        while let Some(class) = current {
            if let Some(method) = class.own_method(selector) {
                return Some(method);
            }
            current = class.superclass();
        }
        None
    }

    /// Finds a class method (a method of the metaclass chain).
    #[must_use]
    pub fn class_method(self, selector: Sel) -> Option<Method> {
        self.metaclass()?.instance_method(selector)
    }

    /// Cached lookup used by message dispatch.
    pub(crate) fn lookup_for_dispatch(self, selector: Sel) -> Option<Method> {
        let generation = METHOD_GENERATION.load(Ordering::Acquire);
        {
            let cache = self.inner().cache.read();
            if cache.0 == generation {
                if let Some(method) = cache.1.get(&selector) {
                    return Some(method.clone());
                }
            }
        }

        let method = self.instance_method(selector)?;
        let mut cache = self.inner().cache.write();
        if cache.0 != generation {
            cache.1.clear();
            cache.0 = generation;
        }
        cache.1.insert(selector, method.clone());
        Some(method)
    }

    /// Returns `true` if instances respond to `selector`.
    #[must_use]
    pub fn responds_to(self, selector: Sel) -> bool {
        self.lookup_for_dispatch(selector).is_some()
    }

    // ------------------------------------------------------------------
    // Ivars
    // ------------------------------------------------------------------

    /// Adds an instance variable. Only allowed before registration.
    ///
    /// # Errors
    ///
    /// - [`Error::ClassAlreadyRegistered`] after registration
    /// - [`Error::IvarLayout`] for duplicates, metaclasses or bad alignment
    pub fn add_ivar(self, name: &str, size: usize, align: usize, types: &str) -> Result<()> {
        let layout_error = |reason: &str| Error::IvarLayout {
            class: self.name().to_string(),
            ivar: name.to_string(),
            reason: reason.to_string(),
        };

        if self.is_registered() {
            return Err(Error::ClassAlreadyRegistered(self.name().to_string()));
        }
        if self.is_metaclass() {
            return Err(layout_error("metaclasses have no ivars"));
        }
        if !align.is_power_of_two() || align > crate::runtime::object::OBJECT_ALIGN {
            return Err(layout_error("unsupported alignment"));
        }

        if self.ivar(name).is_some() {
            return Err(layout_error("duplicate ivar name"));
        }
        let mut ivars = self.inner().ivars.write();
        if ivars.iter().any(|ivar| &*ivar.name == name) {
            return Err(layout_error("duplicate ivar name"));
        }

        let start = self.instance_size();
        let offset = (start + align - 1) & !(align - 1);
        ivars.push(Ivar {
            name: Arc::from(name),
            types: Arc::from(types),
            offset,
            size,
        });
        self.inner()
            .instance_size
            .store(offset + size.max(1), Ordering::Release);
        Ok(())
    }

    /// Finds an ivar on this class or its superclasses.
    #[must_use]
    pub fn ivar(self, name: &str) -> Option<Ivar> {
        let mut current = Some(self);
        while let Some(class) = current {
            if let Some(ivar) = class
                .inner()
                .ivars
                .read()
                .iter()
                .find(|ivar| &*ivar.name == name)
            {
                return Some(ivar.clone());
            }
            current = class.superclass();
        }
        None
    }

    /// This class's own ivars in declaration order.
    #[must_use]
    pub fn ivars(self) -> Vec<Ivar> {
        self.inner().ivars.read().clone()
    }

    // ------------------------------------------------------------------
    // Properties and protocols
    // ------------------------------------------------------------------

    /// Declares a property. Replaces an existing one with the same name.
    pub fn add_property(self, property: Property) {
        let mut properties = self.inner().properties.write();
        properties.retain(|p| p.name != property.name);
        properties.push(property);
    }

    /// Finds a property on this class or its superclasses.
    #[must_use]
    pub fn property(self, name: &str) -> Option<Property> {
        let mut current = Some(self);
        while let Some(class) = current {
            if let Some(found) = class
                .inner()
                .properties
                .read()
                .iter()
                .find(|p| &*p.name == name)
            {
                return Some(found.clone());
            }
            current = class.superclass();
        }
        None
    }

    /// This class's own properties.
    #[must_use]
    pub fn properties(self) -> Vec<Property> {
        self.inner().properties.read().clone()
    }

    /// Adopts a protocol.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolAlreadyAdopted`] if this class already lists it.
    pub fn add_protocol(self, protocol: Protocol) -> Result<()> {
        let mut protocols = self.inner().protocols.write();
        if protocols.contains(&protocol) {
            return Err(Error::ProtocolAlreadyAdopted {
                class: self.name().to_string(),
                protocol: protocol.name().to_string(),
            });
        }
        protocols.push(protocol);
        Ok(())
    }

    /// Protocols adopted directly by this class.
    #[must_use]
    pub fn protocols(self) -> Vec<Protocol> {
        self.inner().protocols.read().clone()
    }

    /// Returns `true` if this class or a superclass adopts `protocol`,
    /// directly or through protocol inheritance.
    #[must_use]
    pub fn conforms_to(self, protocol: Protocol) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if class
                .protocols()
                .into_iter()
                .any(|adopted| adopted.conforms_to(protocol))
            {
                return true;
            }
            current = class.superclass();
        }
        false
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_metaclass() { "Metaclass" } else { "Class" };
        write!(f, "{kind}({} @ {:#x})", self.name(), self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::foundation;
    use std::sync::atomic::AtomicUsize;

    static CLASS_ID: AtomicUsize = AtomicUsize::new(0);

    fn unique(prefix: &str) -> String {
        format!("{prefix}_{}", CLASS_ID.fetch_add(1, Ordering::SeqCst))
    }

    unsafe extern "C" fn noop(_: ObjectPtr, _: Sel, _: *const *mut u8, _: *mut u8) {}

    #[test]
    fn test_pair_and_metaclass_chain() {
        let root = foundation::classes().ns_object;
        let name = unique("ClassPairTest");
        let class = allocate_class_pair(Some(root), &name).unwrap();
        register_class_pair(class).unwrap();

        let meta = class.metaclass().unwrap();
        assert!(meta.is_metaclass());
        assert_eq!(meta.instance_class(), Some(class));
        assert_eq!(meta.superclass(), root.metaclass());

        let root_meta = root.metaclass().unwrap();
        assert_eq!(root_meta.superclass(), Some(root));
        assert_eq!(object_class_of(meta), Some(root_meta));
    }

    fn object_class_of(class: Class) -> Option<Class> {
        crate::runtime::object::object_get_class(class.as_object())
    }

    #[test]
    fn test_duplicate_names_rejected_before_registration() {
        let name = unique("PendingName");
        let root = foundation::classes().ns_object;
        let _class = allocate_class_pair(Some(root), &name).unwrap();
        assert!(get_class(&name).is_none());
        assert_eq!(
            allocate_class_pair(Some(root), &name).unwrap_err(),
            Error::ClassAlreadyExists(name.clone())
        );
    }

    #[test]
    fn test_ivar_layout() {
        let root = foundation::classes().ns_object;
        let class = allocate_class_pair(Some(root), &unique("IvarLayout")).unwrap();
        class.add_ivar("flag", 1, 1, "c").unwrap();
        class.add_ivar("value", 8, 8, "q").unwrap();

        let flag = class.ivar("flag").unwrap();
        let value = class.ivar("value").unwrap();
        assert_eq!(flag.offset(), root.instance_size());
        assert_eq!(value.offset() % 8, 0);
        assert!(value.offset() > flag.offset());
        assert_eq!(class.instance_size(), value.offset() + 8);

        assert!(class.add_ivar("flag", 1, 1, "c").is_err());
        register_class_pair(class).unwrap();
        assert_eq!(
            class.add_ivar("late", 4, 4, "i").unwrap_err(),
            Error::ClassAlreadyRegistered(class.name().to_string())
        );
    }

    #[test]
    fn test_method_lookup_walks_superclasses() {
        let root = foundation::classes().ns_object;
        let parent = allocate_class_pair(Some(root), &unique("LookupParent")).unwrap();
        let sel = Sel::register("lookupParentOnly");
        parent.add_method(Method::new(sel, Imp::Native(noop), "v@:"));
        register_class_pair(parent).unwrap();

        let child = allocate_class_pair(Some(parent), &unique("LookupChild")).unwrap();
        register_class_pair(child).unwrap();

        assert!(child.own_method(sel).is_none());
        assert!(child.instance_method(sel).is_some());
        assert!(child.responds_to(sel));
    }

    #[test]
    fn test_dispatch_cache_sees_new_methods() {
        let root = foundation::classes().ns_object;
        let class = allocate_class_pair(Some(root), &unique("CacheRefresh")).unwrap();
        register_class_pair(class).unwrap();

        let sel = Sel::register("addedLater");
        assert!(!class.responds_to(sel));
        class.add_method(Method::new(sel, Imp::Native(noop), "v@:"));
        assert!(class.responds_to(sel));
    }

    #[test]
    fn test_copy_method_list_is_counted() {
        let root = foundation::classes().ns_object;
        let class = allocate_class_pair(Some(root), &unique("CountedList")).unwrap();
        class.add_method(Method::new(Sel::register("one"), Imp::Native(noop), "v@:"));
        assert_eq!(class.method_list_copies(), 0);
        assert_eq!(class.copy_method_list().len(), 1);
        assert_eq!(class.method_list_copies(), 1);
    }

    #[test]
    fn test_property_attribute_string() {
        let property = Property::new(
            "name",
            vec![
                ("T".into(), "@\"NSString\"".into()),
                ("&".into(), String::new()),
                ("V".into(), "_name".into()),
            ],
        );
        assert_eq!(property.attribute_string(), "T@\"NSString\",&,V_name");
        assert_eq!(property.attribute("V"), Some("_name"));
        assert_eq!(property.attribute("W"), None);
    }
}
