//! Runtime protocols.
//!
//! Protocols are allocated, filled with method descriptions, properties and
//! base protocols, then registered. After registration they are immutable.
//! Like classes they embed an object header, so a protocol can be passed
//! wherever an object is expected.
//!
//! Protocols never take part in dispatch; they only answer conformance
//! questions.

use crate::error::{Error, Result};
use crate::runtime::Sel;
use crate::runtime::class::{ClassInner, Property};
use crate::runtime::object::{FLAG_IMMORTAL, FLAG_PROTOCOL, ObjectPtr, RawObject};
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::RwLock;
use std::fmt;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// A method signature declared by a protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDescription {
    /// Selector.
    pub selector: Sel,
    /// Full type encoding.
    pub types: String,
    /// Required (`true`) or optional.
    pub required: bool,
    /// Instance method (`true`) or class method.
    pub instance: bool,
}

#[repr(C)]
pub(crate) struct ProtocolInner {
    header: RawObject,
    name: &'static str,
    methods: RwLock<Vec<MethodDescription>>,
    properties: RwLock<Vec<Property>>,
    bases: RwLock<Vec<Protocol>>,
    registered: AtomicBool,
}

/// A runtime protocol.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Protocol(NonNull<ProtocolInner>);

// SAFETY: Protocol is Send + Sync because:
// - ProtocolInner is leaked and never freed
// - mutable parts are behind RwLock / atomics
unsafe impl Send for Protocol {}
unsafe impl Sync for Protocol {}

struct ProtocolRegistry {
    named: FxHashMap<&'static str, Protocol>,
    pending: FxHashSet<&'static str>,
    addresses: FxHashSet<usize>,
}

static REGISTRY: OnceLock<RwLock<ProtocolRegistry>> = OnceLock::new();

fn registry() -> &'static RwLock<ProtocolRegistry> {
    REGISTRY.get_or_init(|| {
        RwLock::new(ProtocolRegistry {
            named: FxHashMap::default(),
            pending: FxHashSet::default(),
            addresses: FxHashSet::default(),
        })
    })
}

/// Allocates an unregistered protocol.
///
/// # Errors
///
/// Returns [`Error::ProtocolAlreadyExists`] if the name is taken.
pub fn allocate_protocol(name: &str) -> Result<Protocol> {
    let protocol_class = crate::runtime::foundation::classes().protocol;

    let mut reg = registry().write();
    if reg.named.contains_key(name) || reg.pending.contains(name) {
        return Err(Error::ProtocolAlreadyExists(name.to_string()));
    }
    let name: &'static str = Box::leak(name.to_owned().into_boxed_str());
    let isa: *mut ClassInner = protocol_class.as_inner_ptr();
    let inner = Box::leak(Box::new(ProtocolInner {
        header: RawObject::new(isa, FLAG_PROTOCOL | FLAG_IMMORTAL),
        name,
        methods: RwLock::new(Vec::new()),
        properties: RwLock::new(Vec::new()),
        bases: RwLock::new(Vec::new()),
        registered: AtomicBool::new(false),
    }));
    let protocol = Protocol(NonNull::from(inner));
    reg.pending.insert(name);
    reg.addresses.insert(protocol.addr());
    Ok(protocol)
}

/// Publishes a protocol. Further mutation is rejected.
///
/// # Errors
///
/// Returns [`Error::ProtocolAlreadyExists`] if it was registered before.
pub fn register_protocol(protocol: Protocol) -> Result<()> {
    let mut reg = registry().write();
    if protocol.inner().registered.swap(true, Ordering::AcqRel) {
        return Err(Error::ProtocolAlreadyExists(protocol.name().to_string()));
    }
    reg.pending.remove(protocol.name());
    reg.named.insert(protocol.inner().name, protocol);
    Ok(())
}

/// Looks up a registered protocol.
#[must_use]
pub fn get_protocol(name: &str) -> Option<Protocol> {
    crate::runtime::foundation::classes();
    registry().read().named.get(name).copied()
}

/// Returns `true` if `name` is taken by a registered or pending protocol.
#[must_use]
pub fn protocol_name_in_use(name: &str) -> bool {
    let reg = registry().read();
    reg.named.contains_key(name) || reg.pending.contains(name)
}

impl Protocol {
    fn inner(&self) -> &'static ProtocolInner {
        // SAFETY: ProtocolInner is leaked and never freed
        unsafe { &*self.0.as_ptr() }
    }

    fn check_mutable(self) -> Result<()> {
        if self.is_registered() {
            Err(Error::InvalidDefinition {
                name: self.name().to_string(),
                reason: "protocol is already registered".to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Converts an object pointer to a protocol if it is one.
    #[must_use]
    pub fn from_object(obj: ObjectPtr) -> Option<Protocol> {
        if !registry().read().addresses.contains(&obj.addr()) {
            return None;
        }
        NonNull::new(obj.as_ptr().cast::<ProtocolInner>()).map(Protocol)
    }

    /// The protocol as an object.
    #[must_use]
    pub fn as_object(self) -> ObjectPtr {
        ObjectPtr::from_raw(self.0.as_ptr().cast())
    }

    /// Protocol address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Protocol name.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.inner().name
    }

    /// Returns `true` once registered.
    #[must_use]
    pub fn is_registered(self) -> bool {
        self.inner().registered.load(Ordering::Acquire)
    }

    /// Declares a method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDefinition`] after registration.
    pub fn add_method_description(
        self,
        selector: Sel,
        types: &str,
        required: bool,
        instance: bool,
    ) -> Result<()> {
        self.check_mutable()?;
        let mut methods = self.inner().methods.write();
        methods.retain(|m| !(m.selector == selector && m.instance == instance));
        methods.push(MethodDescription {
            selector,
            types: types.to_string(),
            required,
            instance,
        });
        Ok(())
    }

    /// Declares a property.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDefinition`] after registration.
    pub fn add_property(self, property: Property) -> Result<()> {
        self.check_mutable()?;
        self.inner().properties.write().push(property);
        Ok(())
    }

    /// Adds a base protocol.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDefinition`] after registration.
    pub fn add_protocol(self, base: Protocol) -> Result<()> {
        self.check_mutable()?;
        self.inner().bases.write().push(base);
        Ok(())
    }

    /// Declared methods.
    #[must_use]
    pub fn method_descriptions(self) -> Vec<MethodDescription> {
        self.inner().methods.read().clone()
    }

    /// Finds a method description here or in base protocols.
    #[must_use]
    pub fn method_description(self, selector: Sel, instance: bool) -> Option<MethodDescription> {
        if let Some(found) = self
            .inner()
            .methods
            .read()
            .iter()
            .find(|m| m.selector == selector && m.instance == instance)
        {
            return Some(found.clone());
        }
        self.protocols()
            .into_iter()
            .find_map(|base| base.method_description(selector, instance))
    }

    /// Declared properties.
    #[must_use]
    pub fn properties(self) -> Vec<Property> {
        self.inner().properties.read().clone()
    }

    /// Directly extended protocols.
    #[must_use]
    pub fn protocols(self) -> Vec<Protocol> {
        self.inner().bases.read().clone()
    }

    /// Returns `true` if `self` is `other` or extends it.
    #[must_use]
    pub fn conforms_to(self, other: Protocol) -> bool {
        self == other || self.protocols().into_iter().any(|base| base.conforms_to(other))
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Protocol({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static PROTOCOL_ID: AtomicUsize = AtomicUsize::new(0);

    fn unique(prefix: &str) -> String {
        format!("{prefix}_{}", PROTOCOL_ID.fetch_add(1, Ordering::SeqCst))
    }

    #[test]
    fn test_register_and_lookup() {
        let name = unique("Greeter");
        let protocol = allocate_protocol(&name).unwrap();
        assert!(get_protocol(&name).is_none());
        assert!(protocol_name_in_use(&name));
        register_protocol(protocol).unwrap();
        assert_eq!(get_protocol(&name), Some(protocol));
        assert_eq!(Protocol::from_object(protocol.as_object()), Some(protocol));
    }

    #[test]
    fn test_duplicate_name() {
        let name = unique("Dup");
        let _first = allocate_protocol(&name).unwrap();
        assert_eq!(
            allocate_protocol(&name).unwrap_err(),
            Error::ProtocolAlreadyExists(name)
        );
    }

    #[test]
    fn test_immutable_after_registration() {
        let protocol = allocate_protocol(&unique("Frozen")).unwrap();
        let sel = Sel::register("frozenMethod");
        protocol.add_method_description(sel, "v@:", true, true).unwrap();
        register_protocol(protocol).unwrap();
        assert!(protocol.add_method_description(sel, "v@:", false, true).is_err());
        assert!(protocol.method_description(sel, true).unwrap().required);
    }

    #[test]
    fn test_inherited_conformance() {
        let base = allocate_protocol(&unique("Base")).unwrap();
        let sel = Sel::register("baseMethod:");
        base.add_method_description(sel, "v@:@", true, true).unwrap();
        register_protocol(base).unwrap();

        let derived = allocate_protocol(&unique("Derived")).unwrap();
        derived.add_protocol(base).unwrap();
        register_protocol(derived).unwrap();

        assert!(derived.conforms_to(base));
        assert!(!base.conforms_to(derived));
        assert!(derived.method_description(sel, true).is_some());
        assert!(derived.method_description(sel, false).is_none());
    }
}
