//! Class descriptors and method resolution.
//!
//! Each runtime class gets one [`ClassDescriptor`], created on first use and
//! never freed. It caches, under a per-class re-entrant lock:
//!
//! - the class's own method table, copied from the runtime once
//! - resolved selectors, including misses, so a second lookup never walks
//!   the superclass chain again
//! - property accessor pairs
//! - the keyword index used by [`BoundPartial`]
//!
//! # Resolution
//!
//! 1. Return a memoized answer if there is one
//! 2. Load the class's method table if that has not happened yet
//! 3. Look the selector up in the table
//! 4. On a miss, resolve on the superclass
//! 5. Memoize the answer at this class
//!
//! The method table is trusted once loaded. Methods added to the runtime
//! afterwards are only seen after [`ObjCClass::flush_method_cache`].
//!
//! Locks are always taken subclass first, and never held across a message
//! send.

use crate::bridge::instance::Attribute;
use crate::bridge::method::ObjCMethod;
use crate::bridge::protocol::ObjCProtocol;
use crate::bridge::value::Value;
use crate::error::{Error, Result};
use crate::runtime::class::{get_class, get_metaclass};
use crate::runtime::{Class, ObjectPtr, foundation};
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::{ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Maps an attribute name to a selector: `initWithX_y_` -> `initWithX:y:`.
///
/// Names that do not end in `_` are used as they are.
#[must_use]
pub fn selector_for(name: &str) -> String {
    if name.ends_with('_') {
        name.replace('_', ":")
    } else {
        name.to_string()
    }
}

pub(crate) fn setter_name(property: &str) -> String {
    let mut chars = property.chars();
    match chars.next() {
        Some(first) => format!("set{}{}:", first.to_ascii_uppercase(), chars.as_str()),
        None => "set:".to_string(),
    }
}

// ============================================================================
// Keyword index
// ============================================================================

/// Selectors sharing a base name, keyed by their keyword sets.
///
/// The first argument has the empty keyword, so `initWithX:y:` is filed
/// under `{"", "y"}` and a zero-argument `initWithX` under `{}`.
#[derive(Debug, Clone, Default)]
pub struct PartialIndex {
    entries: BTreeMap<BTreeSet<String>, (String, Vec<String>)>,
}

impl PartialIndex {
    fn insert(&mut self, selector: &str) {
        let (keys, order) = match selector.strip_suffix(':') {
            Some(body) => {
                let order: Vec<String> = body.split(':').skip(1).map(str::to_string).collect();
                let mut keys: BTreeSet<String> = order.iter().cloned().collect();
                keys.insert(String::new());
                (keys, order)
            }
            None => (BTreeSet::new(), Vec::new()),
        };
        let replaced = self.entries.insert(keys, (selector.to_string(), order));
        if let Some((previous, _)) = replaced.filter(|(previous, _)| previous != selector) {
            oxbridge_log::debug!("keyword method {selector} replaces {previous}: same keyword set");
        }
    }

    /// Only a zero-argument method shares this base name.
    fn is_plain(&self) -> bool {
        self.entries.len() == 1 && self.entries.contains_key(&BTreeSet::new())
    }

    fn known(&self) -> Vec<String> {
        self.entries
            .keys()
            .map(|keys| {
                let inner: Vec<String> = keys.iter().map(|k| format!("{k:?}")).collect();
                format!("{{{}}}", inner.join(", "))
            })
            .collect()
    }

    /// Selectors in the index.
    pub fn selectors(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(selector, _)| selector.as_str())
    }
}

fn base_name(selector: &str) -> &str {
    selector.split(':').next().unwrap_or(selector)
}

// ============================================================================
// Descriptors
// ============================================================================

/// Getter and optional setter of a property.
#[derive(Debug, Clone)]
pub(crate) struct PropertyAccess {
    pub(crate) getter: ObjCMethod,
    pub(crate) setter: Option<ObjCMethod>,
}

#[derive(Default)]
struct ClassCache {
    loaded: bool,
    methods: FxHashMap<String, crate::runtime::Method>,
    resolved: FxHashMap<String, Option<ObjCMethod>>,
    properties: FxHashMap<String, Option<PropertyAccess>>,
    forced_properties: FxHashSet<String>,
    partials: FxHashMap<String, PartialIndex>,
    misses: usize,
}

impl ClassCache {
    fn flush(&mut self) {
        self.loaded = false;
        self.methods.clear();
        self.resolved.clear();
        self.properties.clear();
        self.partials.clear();
    }
}

/// Cached view of one runtime class.
pub struct ClassDescriptor {
    class: Class,
    cache: ReentrantMutex<RefCell<ClassCache>>,
}

static DESCRIPTORS: OnceLock<RwLock<FxHashMap<usize, &'static ClassDescriptor>>> = OnceLock::new();

fn descriptors() -> &'static RwLock<FxHashMap<usize, &'static ClassDescriptor>> {
    DESCRIPTORS.get_or_init(|| RwLock::new(FxHashMap::default()))
}

/// Descriptor for `class`, created on first use.
pub(crate) fn descriptor(class: Class) -> &'static ClassDescriptor {
    if let Some(found) = descriptors().read().get(&class.addr()) {
        return found;
    }
    let mut map = descriptors().write();
    map.entry(class.addr()).or_insert_with(|| {
        Box::leak(Box::new(ClassDescriptor {
            class,
            cache: ReentrantMutex::new(RefCell::new(ClassCache::default())),
        }))
    })
}

fn for_each_subclass(class: Class, mut f: impl FnMut(&ClassDescriptor)) {
    let all: Vec<&'static ClassDescriptor> = descriptors().read().values().copied().collect();
    for desc in all {
        if desc.class.is_subclass_of(class) {
            f(desc);
        }
    }
}

impl ClassDescriptor {
    fn ensure_loaded(&self) {
        let guard = self.cache.lock();
        if guard.borrow().loaded {
            return;
        }

        let inherited = self
            .class
            .superclass()
            .map(|superclass| descriptor(superclass).partials_snapshot())
            .unwrap_or_default();
        let methods = self.class.copy_method_list();

        let mut cache = guard.borrow_mut();
        cache.partials = inherited;
        for method in methods {
            let selector = method.selector().name();
            cache
                .partials
                .entry(base_name(selector).to_string())
                .or_default()
                .insert(selector);
            cache.methods.insert(selector.to_string(), method);
        }
        cache.loaded = true;
        oxbridge_log::debug!(
            "loaded {} methods for {}",
            cache.methods.len(),
            self.class.name()
        );
    }

    fn partials_snapshot(&self) -> FxHashMap<String, PartialIndex> {
        self.ensure_loaded();
        let guard = self.cache.lock();
        let snapshot = guard.borrow().partials.clone();
        snapshot
    }

    /// Resolves a selector on this class or its superclasses.
    pub(crate) fn resolve(&self, selector: &str) -> Result<Option<ObjCMethod>> {
        let guard = self.cache.lock();
        if let Some(hit) = guard.borrow().resolved.get(selector) {
            return Ok(hit.clone());
        }

        self.ensure_loaded();
        let own = {
            let mut cache = guard.borrow_mut();
            cache.misses += 1;
            cache.methods.get(selector).cloned()
        };
        let found = match own {
            Some(method) => Some(ObjCMethod::from_runtime(&method)?),
            None => match self.class.superclass() {
                Some(superclass) => descriptor(superclass).resolve(selector)?,
                None => None,
            },
        };

        guard
            .borrow_mut()
            .resolved
            .insert(selector.to_string(), found.clone());
        Ok(found)
    }

    fn is_forced(&self, name: &str) -> bool {
        let mut current = Some(self.class);
        while let Some(class) = current {
            let desc = descriptor(class);
            let guard = desc.cache.lock();
            if guard.borrow().forced_properties.contains(name) {
                return true;
            }
            drop(guard);
            current = class.superclass();
        }
        false
    }

    /// Property accessors for `name`, if `name` is a property.
    ///
    /// A name is a property when the runtime declares it, when both `name`
    /// and `setName:` exist, or when it was declared with
    /// [`ObjCClass::declare_property`] on this class or a superclass.
    pub(crate) fn property(&self, name: &str) -> Result<Option<PropertyAccess>> {
        let guard = self.cache.lock();
        if let Some(hit) = guard.borrow().properties.get(name) {
            return Ok(hit.clone());
        }
        let access = self.find_property(name)?;
        guard
            .borrow_mut()
            .properties
            .insert(name.to_string(), access.clone());
        Ok(access)
    }

    fn find_property(&self, name: &str) -> Result<Option<PropertyAccess>> {
        if name.is_empty() || name.contains(':') {
            return Ok(None);
        }
        let declared = self.class.property(name);
        let getter_name = declared
            .as_ref()
            .and_then(|p| p.attribute("G"))
            .unwrap_or(name)
            .to_string();
        let Some(getter) = self.resolve(&getter_name)? else {
            return Ok(None);
        };
        if getter.arg_count() != 0 || getter.signature().ret().is_void() {
            return Ok(None);
        }

        let readonly = declared.as_ref().is_some_and(|p| p.attribute("R").is_some());
        let setter = if readonly {
            None
        } else {
            let setter_name = declared
                .as_ref()
                .and_then(|p| p.attribute("S"))
                .map_or_else(|| setter_name(name), str::to_string);
            self.resolve(&setter_name)?.filter(|m| m.arg_count() == 1)
        };

        let is_property = declared.is_some() || setter.is_some() || self.is_forced(name);
        Ok(is_property.then_some(PropertyAccess { getter, setter }))
    }

    fn partial_index(&self, base: &str) -> Option<PartialIndex> {
        self.ensure_loaded();
        let guard = self.cache.lock();
        let index = guard.borrow().partials.get(base).cloned();
        index
    }

    pub(crate) fn partial(&'static self, receiver: &Value, base: &str) -> Result<BoundPartial> {
        let index = self.partial_index(base).ok_or_else(|| Error::MethodNotFound {
            class: self.class.name().to_string(),
            selector: base.to_string(),
        })?;
        Ok(BoundPartial {
            receiver: receiver.clone(),
            class: self,
            base: base.to_string(),
            index,
        })
    }
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassDescriptor({})", self.class.name())
    }
}

/// Two-phase attribute lookup shared by instances and classes.
pub(crate) fn lookup_attribute(
    desc: &'static ClassDescriptor,
    receiver: &Value,
    name: &str,
) -> Result<Option<Attribute>> {
    if !name.ends_with('_') {
        if let Some(access) = desc.property(name)? {
            return access.getter.call(receiver, &[]).map(|v| Some(Attribute::Value(v)));
        }
        if let Some(index) = desc.partial_index(name) {
            if !index.is_plain() {
                return Ok(Some(Attribute::Partial(BoundPartial {
                    receiver: receiver.clone(),
                    class: desc,
                    base: name.to_string(),
                    index,
                })));
            }
        }
    }
    let selector = selector_for(name);
    Ok(desc
        .resolve(&selector)?
        .map(|method| Attribute::Method(method.bind(receiver.clone()))))
}

// ============================================================================
// Keyword calls
// ============================================================================

/// Methods sharing a base name, bound to a receiver.
///
/// ```rust
/// use oxbridge::bridge::class::ObjCClass;
/// use oxbridge::bridge::value::Value;
///
/// let string = ObjCClass::named("NSString").unwrap();
/// let text = Value::from("hello");
/// let partial = string.partial("stringWithUTF8String").unwrap();
/// let made = partial.call(Some(text), &[]).unwrap();
/// assert!(made.as_object().is_some());
/// ```
#[derive(Debug, Clone)]
pub struct BoundPartial {
    receiver: Value,
    class: &'static ClassDescriptor,
    base: String,
    index: PartialIndex,
}

impl BoundPartial {
    /// Base name.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Candidate selectors.
    pub fn selectors(&self) -> impl Iterator<Item = &str> {
        self.index.selectors()
    }

    /// Calls the selector whose keywords are exactly those given.
    ///
    /// `first` is the argument after the base name; keyword arguments may
    /// come in any order and are passed in selector order.
    ///
    /// # Errors
    ///
    /// - [`Error::NoPartialMatch`] listing the known keyword sets
    /// - see [`ObjCMethod::call`]
    pub fn call(&self, first: Option<Value>, kwargs: &[(&str, Value)]) -> Result<Value> {
        let mut keys: BTreeSet<String> = kwargs.iter().map(|(k, _)| (*k).to_string()).collect();
        if first.is_some() {
            keys.insert(String::new());
        }
        let no_match = || Error::NoPartialMatch {
            base: self.base.clone(),
            keywords: kwargs.iter().map(|(k, _)| (*k).to_string()).collect(),
            known: self.index.known(),
        };

        let (selector, order) = self.index.entries.get(&keys).ok_or_else(no_match)?;
        let mut args = Vec::with_capacity(order.len() + 1);
        args.extend(first);
        for keyword in order {
            let value = kwargs
                .iter()
                .find(|(k, _)| k == keyword)
                .map(|(_, v)| v.clone())
                .ok_or_else(no_match)?;
            args.push(value);
        }

        let method = self
            .class
            .resolve(selector)?
            .ok_or_else(|| Error::MethodNotFound {
                class: self.class.class.name().to_string(),
                selector: selector.clone(),
            })?;
        method.call(&self.receiver, &args)
    }
}

// ============================================================================
// Classes and metaclasses
// ============================================================================

/// A runtime class.
#[derive(Clone, Copy)]
pub struct ObjCClass(&'static ClassDescriptor);

impl ObjCClass {
    /// Looks a class up by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassNotFound`] for unknown names.
    pub fn named(name: &str) -> Result<ObjCClass> {
        foundation::classes();
        get_class(name)
            .map(ObjCClass::from_class)
            .ok_or_else(|| Error::ClassNotFound(name.to_string()))
    }

    /// Wraps a class pointer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAClass`] for anything but a (non-meta) class.
    pub fn from_ptr(ptr: ObjectPtr) -> Result<ObjCClass> {
        match Class::from_object(ptr) {
            Some(class) if !class.is_metaclass() => Ok(ObjCClass::from_class(class)),
            _ => Err(Error::NotAClass(ptr.addr())),
        }
    }

    pub(crate) fn from_class(class: Class) -> ObjCClass {
        ObjCClass(descriptor(class))
    }

    /// Class name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.0.class.name()
    }

    /// Class object pointer.
    #[must_use]
    pub fn ptr(&self) -> ObjectPtr {
        self.0.class.as_object()
    }

    /// Underlying runtime class.
    #[must_use]
    pub fn runtime_class(&self) -> Class {
        self.0.class
    }

    /// Superclass, `None` for root classes.
    #[must_use]
    pub fn superclass(&self) -> Option<ObjCClass> {
        self.0.class.superclass().map(ObjCClass::from_class)
    }

    /// Metaclass.
    #[must_use]
    pub fn metaclass(&self) -> ObjCMetaclass {
        // Every registered class has a metaclass pair.
        let meta = self.0.class.metaclass().unwrap_or(self.0.class);
        ObjCMetaclass(descriptor(meta))
    }

    /// Protocols adopted directly by this class.
    #[must_use]
    pub fn protocols(&self) -> Vec<ObjCProtocol> {
        self.0
            .class
            .protocols()
            .into_iter()
            .map(ObjCProtocol::from_protocol)
            .collect()
    }

    /// Whether this class is `other` or inherits from it.
    #[must_use]
    pub fn is_subclass_of(&self, other: &ObjCClass) -> bool {
        self.0.class.is_subclass_of(other.0.class)
    }

    /// Whether this class or a superclass adopts `protocol`.
    #[must_use]
    pub fn conforms_to(&self, protocol: &ObjCProtocol) -> bool {
        self.0.class.conforms_to(protocol.runtime_protocol())
    }

    /// Resolves an instance method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MethodNotFound`] if nothing matches.
    pub fn instance_method(&self, name: &str) -> Result<ObjCMethod> {
        let selector = selector_for(name);
        self.0.resolve(&selector)?.ok_or_else(|| Error::MethodNotFound {
            class: self.name().to_string(),
            selector,
        })
    }

    /// Resolves a class method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MethodNotFound`] if nothing matches.
    pub fn class_method(&self, name: &str) -> Result<ObjCMethod> {
        let selector = selector_for(name);
        self.metaclass()
            .0
            .resolve(&selector)?
            .ok_or_else(|| Error::MethodNotFound {
                class: self.name().to_string(),
                selector,
            })
    }

    /// Calls a class method.
    ///
    /// # Errors
    ///
    /// See [`ObjCMethod::call`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use oxbridge::bridge::class::ObjCClass;
    ///
    /// let object = ObjCClass::named("NSObject").unwrap().call("new", &[]).unwrap();
    /// assert_eq!(object.as_object().unwrap().retain_count(), 1);
    /// ```
    pub fn call(&self, name: &str, args: &[crate::bridge::value::Value]) -> Result<Value> {
        self.class_method(name)?.call(&Value::Class(*self), args)
    }

    /// Looks up a class-level attribute: class property, keyword family or
    /// class method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AttributeNotFound`] when nothing matches.
    pub fn get(&self, name: &str) -> Result<Attribute> {
        lookup_attribute(self.metaclass().0, &Value::Class(*self), name)?.ok_or_else(|| {
            Error::AttributeNotFound {
                class: self.name().to_string(),
                name: name.to_string(),
            }
        })
    }

    /// Keyword family of class methods starting with `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MethodNotFound`] if no selector starts with `base`.
    pub fn partial(&self, base: &str) -> Result<BoundPartial> {
        self.metaclass().0.partial(&Value::Class(*self), base)
    }

    /// Whether instances treat `name` as a property.
    ///
    /// # Errors
    ///
    /// Returns encoding errors from the accessor methods.
    pub fn is_property(&self, name: &str) -> Result<bool> {
        Ok(self.0.property(name)?.is_some())
    }

    /// Makes instances (of this class and subclasses) read `name` as a
    /// property even without a `setName:` mutator.
    pub fn declare_property(&self, name: &str) {
        {
            let guard = self.0.cache.lock();
            guard.borrow_mut().forced_properties.insert(name.to_string());
        }
        for_each_subclass(self.0.class, |desc| {
            let guard = desc.cache.lock();
            guard.borrow_mut().properties.remove(name);
        });
    }

    /// Discards cached method tables, resolutions, properties and keyword
    /// indexes of this class, its metaclass and all their subclasses.
    pub fn flush_method_cache(&self) {
        let mut flushed = 0;
        for root in [Some(self.0.class), self.0.class.metaclass()].into_iter().flatten() {
            for_each_subclass(root, |desc| {
                let guard = desc.cache.lock();
                guard.borrow_mut().flush();
                flushed += 1;
            });
        }
        oxbridge_log::debug!("flushed method caches of {} ({flushed} classes)", self.name());
    }

    /// How often this class's method table was copied from the runtime.
    #[must_use]
    pub fn method_table_loads(&self) -> usize {
        self.0.class.method_list_copies()
    }

    /// Resolutions that missed the memo table at this class.
    #[must_use]
    pub fn resolution_misses(&self) -> usize {
        let guard = self.0.cache.lock();
        let misses = guard.borrow().misses;
        misses
    }
}

impl PartialEq for ObjCClass {
    fn eq(&self, other: &ObjCClass) -> bool {
        self.0.class == other.0.class
    }
}

impl Eq for ObjCClass {}

impl Hash for ObjCClass {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.class.hash(state);
    }
}

impl fmt::Debug for ObjCClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ObjCClass: {}>", self.name())
    }
}

/// A runtime metaclass: the class of a class object.
#[derive(Clone, Copy)]
pub struct ObjCMetaclass(&'static ClassDescriptor);

impl ObjCMetaclass {
    /// Looks up the metaclass of the class named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassNotFound`] for unknown names.
    pub fn named(name: &str) -> Result<ObjCMetaclass> {
        foundation::classes();
        get_metaclass(name)
            .map(ObjCMetaclass::from_class)
            .ok_or_else(|| Error::ClassNotFound(name.to_string()))
    }

    /// Wraps a metaclass pointer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAMetaclass`] for anything but a metaclass.
    pub fn from_ptr(ptr: ObjectPtr) -> Result<ObjCMetaclass> {
        match Class::from_object(ptr) {
            Some(class) if class.is_metaclass() => Ok(ObjCMetaclass::from_class(class)),
            _ => Err(Error::NotAMetaclass(ptr.addr())),
        }
    }

    pub(crate) fn from_class(class: Class) -> ObjCMetaclass {
        ObjCMetaclass(descriptor(class))
    }

    /// Name (same as the class's).
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.0.class.name()
    }

    /// Metaclass object pointer.
    #[must_use]
    pub fn ptr(&self) -> ObjectPtr {
        self.0.class.as_object()
    }

    /// Underlying runtime class.
    #[must_use]
    pub fn runtime_class(&self) -> Class {
        self.0.class
    }

    /// The class this is the metaclass of.
    #[must_use]
    pub fn instance_class(&self) -> Option<ObjCClass> {
        self.0.class.instance_class().map(ObjCClass::from_class)
    }
}

impl PartialEq for ObjCMetaclass {
    fn eq(&self, other: &ObjCMetaclass) -> bool {
        self.0.class == other.0.class
    }
}

impl Eq for ObjCMetaclass {}

impl fmt::Debug for ObjCMetaclass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ObjCMetaclass: {}>", self.name())
    }
}
