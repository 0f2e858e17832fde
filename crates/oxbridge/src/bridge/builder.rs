//! Defining classes and protocols at run time.
//!
//! [`ClassBuilder`] collects members, validates every signature, and only
//! then allocates the class pair, so a bad encoding never leaves a
//! half-built class behind. Host methods are installed as trampolines that
//! convert the native arguments, call the host function and convert the
//! result back.
//!
//! # Ownership of Results
//!
//! A trampoline's object result follows the family of its selector:
//!
//! - `init…`: the receiver is consumed and the result returned retained;
//!   on failure the receiver is released and nil returned
//! - `alloc…`, `new…`, `copy…`, `mutableCopy…`: the result is returned
//!   retained
//! - anything else: the result is retained and autoreleased
//!
//! # Teardown
//!
//! A class with a teardown hook or with object-typed storage gets a
//! synthesized `dealloc` that runs the hook, then clears storage in
//! declaration order, then sends `dealloc` to the superclass.

use crate::bridge::class::{ObjCClass, setter_name};
use crate::bridge::encoding::{self, TypeDescriptor, TypeKind};
use crate::bridge::instance::{ObjCInstance, evict, objc_instance, wrap};
use crate::bridge::method::{MethodFamily, record_callback_error};
use crate::bridge::protocol::ObjCProtocol;
use crate::bridge::signature::CallSignature;
use crate::bridge::value::{Value, read_value, write_persistent};
use crate::config::config;
use crate::error::{Error, Result};
use crate::runtime::autorelease::{autorelease, autoreleasepool};
use crate::runtime::class::{allocate_class_pair, register_class_pair};
use crate::runtime::message::{Super, msg_send_super};
use crate::runtime::object::{
    load_weak_retained, object_ivar_ptr, release, retain, store_weak,
};
use crate::runtime::protocol::{allocate_protocol, register_protocol};
use crate::runtime::{Class, Convention, Imp, Ivar, Method, ObjectPtr, Property, Sel};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Host implementation of a method: receiver and converted arguments in,
/// result out. Void methods return [`Value::None`].
pub type HostMethod = Arc<dyn Fn(&Value, &[Value]) -> Result<Value> + Send + Sync>;

/// User teardown logic, run first in the synthesized `dealloc`.
pub type DeallocHook = Arc<dyn Fn(&ObjCInstance) -> Result<()> + Send + Sync>;

/// How a property stores its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyStorage {
    /// Retains the new object and releases the old one.
    Strong,
    /// Zeroing weak reference.
    Weak,
    /// Plain bytes: scalars, structs, classes, blocks and pointers.
    Copy,
}

enum Member {
    Method {
        selector: String,
        encoding: String,
        func: HostMethod,
        class_side: bool,
    },
    Raw {
        selector: String,
        encoding: String,
        imp: Imp,
        class_side: bool,
    },
    Ivar {
        name: String,
        encoding: String,
    },
    Property {
        name: String,
        encoding: String,
        weak: bool,
    },
}

fn check_selector(selector: &str, signature: &CallSignature) -> Result<()> {
    let keywords = selector.matches(':').count();
    if keywords != signature.args().len() {
        return Err(Error::InvalidDefinition {
            name: selector.to_string(),
            reason: format!(
                "selector takes {keywords} arguments but the encoding declares {}",
                signature.args().len()
            ),
        });
    }
    Ok(())
}

fn property_attributes(encoding: &str, storage: PropertyStorage, ivar: Option<&str>) -> Vec<(String, String)> {
    let mut attributes = vec![("T".to_string(), encoding.to_string())];
    match storage {
        PropertyStorage::Strong => attributes.push(("&".to_string(), String::new())),
        PropertyStorage::Weak => attributes.push(("W".to_string(), String::new())),
        PropertyStorage::Copy => {}
    }
    attributes.push(("N".to_string(), String::new()));
    if let Some(ivar) = ivar {
        attributes.push(("V".to_string(), ivar.to_string()));
    }
    attributes
}

fn storage_for(ty: &TypeDescriptor, weak: bool, name: &str) -> Result<PropertyStorage> {
    let is_object = matches!(ty.kind(), TypeKind::Object { .. });
    match (is_object, weak) {
        (true, false) => Ok(PropertyStorage::Strong),
        (true, true) => Ok(PropertyStorage::Weak),
        (false, false) => Ok(PropertyStorage::Copy),
        (false, true) => Err(Error::InvalidDefinition {
            name: name.to_string(),
            reason: format!("weak property of non-object type {}", ty.type_name()),
        }),
    }
}

/// Registers under `name`, or `name_2`, `name_3`, ... when renaming is on.
fn allocate_renamed<T>(
    name: &str,
    auto_rename: bool,
    kind: &str,
    mut allocate: impl FnMut(&str) -> Result<T>,
) -> Result<T> {
    let mut attempt = 1usize;
    loop {
        let candidate = if attempt == 1 {
            name.to_string()
        } else {
            format!("{name}_{attempt}")
        };
        match allocate(&candidate) {
            Ok(found) => {
                if attempt > 1 {
                    oxbridge_log::info!("{kind} '{name}' exists, using '{candidate}'");
                }
                return Ok(found);
            }
            Err(Error::ClassAlreadyExists(_) | Error::ProtocolAlreadyExists(_)) if auto_rename => {
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ============================================================================
// Trampolines
// ============================================================================

struct Trampoline {
    selector: String,
    signature: CallSignature,
    family: Option<MethodFamily>,
    func: HostMethod,
}

impl Trampoline {
    fn invoke(&self, receiver: ObjectPtr, args: *const *mut u8, ret: *mut u8) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run(receiver, args, ret)));
        let err = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(_) => Error::Callback {
                selector: self.selector.clone(),
                message: "host method panicked".to_string(),
            },
        };
        if !ret.is_null() {
            // SAFETY: the sender sized ret for the return type
            unsafe { std::ptr::write_bytes(ret, 0, self.signature.ret().size()) };
        }
        if self.family == Some(MethodFamily::Init) {
            release(receiver);
        }
        record_callback_error(&self.selector, &err);
    }

    fn run(&self, receiver: ObjectPtr, args: *const *mut u8, ret: *mut u8) -> Result<()> {
        let result = autoreleasepool(|| -> Result<Value> {
            let this = wrap(receiver, false)?;
            let values = self
                .signature
                .args()
                .iter()
                .enumerate()
                // SAFETY: the sender passes one pointer per declared argument
                .map(|(index, ty)| unsafe { read_value(ty, *args.add(index)) })
                .collect::<Result<Vec<_>>>()?;
            (self.func)(&this, &values)
        })?;

        let ty = self.signature.ret();
        if ret.is_null() || ty.is_void() {
            return Ok(());
        }
        // SAFETY: the sender sized ret for the return type
        unsafe { write_persistent(ty, &result, ret)? };

        if matches!(ty.kind(), TypeKind::Object { .. }) {
            // SAFETY: an object pointer was just written
            let ptr = unsafe { ret.cast::<ObjectPtr>().read() };
            match self.family {
                Some(MethodFamily::Init) => {
                    retain(ptr);
                    release(receiver);
                }
                Some(_) => {
                    retain(ptr);
                }
                None => {
                    autorelease(retain(ptr));
                }
            }
        }
        Ok(())
    }
}

fn getter_imp(ivar: Ivar, storage: PropertyStorage) -> Imp {
    Imp::from_fn(move |receiver, _, _, ret| {
        if ret.is_null() {
            return;
        }
        // SAFETY: accessors are only installed on the class owning the ivar
        let slot = unsafe { object_ivar_ptr(receiver, &ivar) };
        // SAFETY: ret is sized for the property type, which is the ivar type
        unsafe {
            match storage {
                PropertyStorage::Strong => {
                    ret.cast::<ObjectPtr>().write(slot.cast::<ObjectPtr>().read());
                }
                PropertyStorage::Weak => {
                    let value = load_weak_retained(slot.cast::<ObjectPtr>());
                    ret.cast::<ObjectPtr>().write(autorelease(value));
                }
                PropertyStorage::Copy => std::ptr::copy_nonoverlapping(slot, ret, ivar.size()),
            }
        }
    })
}

fn setter_imp(ivar: Ivar, storage: PropertyStorage) -> Imp {
    Imp::from_fn(move |receiver, _, args, _| {
        // SAFETY: setters take exactly one argument
        let src = unsafe { *args };
        // SAFETY: accessors are only installed on the class owning the ivar
        let slot = unsafe { object_ivar_ptr(receiver, &ivar) };
        // SAFETY: the argument and the slot both hold the property type
        unsafe {
            match storage {
                PropertyStorage::Strong => {
                    let new = retain(src.cast::<ObjectPtr>().read());
                    let old = slot.cast::<ObjectPtr>().read();
                    slot.cast::<ObjectPtr>().write(new);
                    release(old);
                }
                PropertyStorage::Weak => {
                    store_weak(slot.cast::<ObjectPtr>(), src.cast::<ObjectPtr>().read());
                }
                PropertyStorage::Copy => std::ptr::copy_nonoverlapping(src, slot, ivar.size()),
            }
        }
    })
}

enum Cleanup {
    Release(Ivar),
    ClearWeak(Ivar),
}

struct Teardown {
    class_name: &'static str,
    superclass: Class,
    hook: Option<DeallocHook>,
    cleanups: Vec<Cleanup>,
}

impl Teardown {
    fn run(&self, receiver: ObjectPtr) {
        if let Some(hook) = &self.hook {
            let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
                let instance = objc_instance(&wrap(receiver, false)?)?;
                let result = hook(&instance);
                // The wrap could not retain a deallocating object.
                instance.release();
                result
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    oxbridge_log::error!("dealloc hook of {} failed: {err}", self.class_name);
                }
                Err(_) => oxbridge_log::error!("dealloc hook of {} panicked", self.class_name),
            }
            evict(receiver);
        }

        for cleanup in &self.cleanups {
            // SAFETY: the ivars belong to this class and the object is still
            // allocated until the root dealloc runs
            unsafe {
                match cleanup {
                    Cleanup::Release(ivar) => {
                        let slot = object_ivar_ptr(receiver, ivar).cast::<ObjectPtr>();
                        let old = slot.read();
                        slot.write(ObjectPtr::NIL);
                        release(old);
                    }
                    Cleanup::ClearWeak(ivar) => {
                        store_weak(object_ivar_ptr(receiver, ivar).cast(), ObjectPtr::NIL);
                    }
                }
            }
        }

        let target = Super {
            receiver,
            super_class: self.superclass,
        };
        // SAFETY: dealloc takes no arguments and returns void
        let sent = unsafe {
            msg_send_super(
                target,
                Sel::register("dealloc"),
                std::ptr::null(),
                std::ptr::null_mut(),
                Convention::Standard,
            )
        };
        if let Err(err) = sent {
            oxbridge_log::error!("superclass dealloc of {} failed: {err}", self.class_name);
        }
    }
}

// ============================================================================
// Class builder
// ============================================================================

/// Builds and registers a new class.
///
/// # Example
///
/// ```rust
/// use oxbridge::bridge::builder::ClassBuilder;
/// use oxbridge::bridge::class::ObjCClass;
/// use oxbridge::bridge::instance::objc_instance;
/// use oxbridge::bridge::value::Value;
///
/// let base = ObjCClass::named("NSObject").unwrap();
/// let class = ClassBuilder::new("DocCounter", &base)
///     .property("counter", "q")
///     .method("twice:", "q@:q", |_, args| Ok(Value::Int(args[0].as_i64().unwrap_or(0) * 2)))
///     .register()
///     .unwrap();
///
/// let obj = objc_instance(&class.call("new", &[]).unwrap()).unwrap();
/// assert_eq!(obj.value("counter").unwrap(), Value::Int(0));
/// obj.set("counter", 21).unwrap();
/// let counter = obj.value("counter").unwrap();
/// assert_eq!(obj.call("twice:", &[counter]).unwrap(), Value::Int(42));
/// ```
pub struct ClassBuilder {
    name: String,
    superclass: ObjCClass,
    auto_rename: Option<bool>,
    protocols: Vec<ObjCProtocol>,
    members: Vec<Member>,
    dealloc: Option<DeallocHook>,
}

impl ClassBuilder {
    /// Starts a class named `name` inheriting from `superclass`.
    #[must_use]
    pub fn new(name: &str, superclass: &ObjCClass) -> ClassBuilder {
        ClassBuilder {
            name: name.to_string(),
            superclass: *superclass,
            auto_rename: None,
            protocols: Vec::new(),
            members: Vec::new(),
            dealloc: None,
        }
    }

    /// Overrides the process-wide rename policy for this class.
    #[must_use]
    pub fn auto_rename(mut self, enabled: bool) -> Self {
        self.auto_rename = Some(enabled);
        self
    }

    /// Adopts a protocol. Adopting the same protocol twice fails at
    /// registration.
    #[must_use]
    pub fn protocol(mut self, protocol: &ObjCProtocol) -> Self {
        self.protocols.push(*protocol);
        self
    }

    /// Adds an instance method implemented by `f`.
    ///
    /// `encoding` is the full method encoding including the receiver and
    /// selector, e.g. `i@:ii`.
    #[must_use]
    pub fn method<F>(self, selector: &str, encoding: &str, f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.host_method(selector, encoding, Arc::new(f), false)
    }

    /// Adds a class method implemented by `f`. The receiver is the class.
    #[must_use]
    pub fn class_method<F>(self, selector: &str, encoding: &str, f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.host_method(selector, encoding, Arc::new(f), true)
    }

    fn host_method(mut self, selector: &str, encoding: &str, func: HostMethod, class_side: bool) -> Self {
        self.members.push(Member::Method {
            selector: selector.to_string(),
            encoding: encoding.to_string(),
            func,
            class_side,
        });
        self
    }

    /// Adds a method without argument conversion. The implementation sees
    /// the raw receiver, selector, argument pointers and return slot.
    #[must_use]
    pub fn raw_method(mut self, selector: &str, encoding: &str, imp: Imp) -> Self {
        self.members.push(Member::Raw {
            selector: selector.to_string(),
            encoding: encoding.to_string(),
            imp,
            class_side: false,
        });
        self
    }

    /// Class-side variant of [`ClassBuilder::raw_method`].
    #[must_use]
    pub fn raw_class_method(mut self, selector: &str, encoding: &str, imp: Imp) -> Self {
        self.members.push(Member::Raw {
            selector: selector.to_string(),
            encoding: encoding.to_string(),
            imp,
            class_side: true,
        });
        self
    }

    /// Adds an instance variable. Object ivars hold strong references and
    /// are released at teardown.
    #[must_use]
    pub fn ivar(mut self, name: &str, encoding: &str) -> Self {
        self.members.push(Member::Ivar {
            name: name.to_string(),
            encoding: encoding.to_string(),
        });
        self
    }

    /// Adds a property with a backing ivar `_name`, a `name` getter and a
    /// `setName:` setter. Object properties are strong.
    #[must_use]
    pub fn property(mut self, name: &str, encoding: &str) -> Self {
        self.members.push(Member::Property {
            name: name.to_string(),
            encoding: encoding.to_string(),
            weak: false,
        });
        self
    }

    /// Adds a weak object property, cleared when its referent deallocates.
    #[must_use]
    pub fn weak_property(mut self, name: &str, encoding: &str) -> Self {
        self.members.push(Member::Property {
            name: name.to_string(),
            encoding: encoding.to_string(),
            weak: true,
        });
        self
    }

    /// Sets teardown logic. It runs before property cleanup and the
    /// superclass `dealloc`.
    #[must_use]
    pub fn dealloc<F>(mut self, f: F) -> Self
    where
        F: Fn(&ObjCInstance) -> Result<()> + Send + Sync + 'static,
    {
        self.dealloc = Some(Arc::new(f));
        self
    }

    /// Validates the members, then creates and registers the class.
    ///
    /// # Errors
    ///
    /// - encoding errors for any member
    /// - [`Error::InvalidDefinition`] for selectors that do not match their
    ///   encoding, weak non-object properties, unreturnable result types or
    ///   a `dealloc` declared as a plain method
    /// - [`Error::ClassAlreadyExists`] unless auto-rename is on
    /// - [`Error::ProtocolAlreadyAdopted`] for a repeated protocol
    /// - [`Error::IvarLayout`] for ivars the runtime rejects
    pub fn register(self) -> Result<ObjCClass> {
        let auto_rename = self.auto_rename.unwrap_or_else(|| config().auto_rename);
        let prepared = self
            .members
            .iter()
            .map(prepare)
            .collect::<Result<Vec<_>>>()?;

        let superclass = self.superclass.runtime_class();
        let class = allocate_renamed(&self.name, auto_rename, "class", |candidate| {
            allocate_class_pair(Some(superclass), candidate)
        })?;
        let metaclass = class.metaclass().ok_or_else(|| Error::InvalidDefinition {
            name: class.name().to_string(),
            reason: "class has no metaclass".to_string(),
        })?;

        for protocol in &self.protocols {
            class.add_protocol(protocol.runtime_protocol())?;
        }

        let mut cleanups = Vec::new();
        for (member, prepared) in self.members.into_iter().zip(prepared) {
            match (member, prepared) {
                (
                    Member::Method {
                        selector,
                        encoding,
                        func,
                        class_side,
                    },
                    Prepared::Signature(signature),
                ) => {
                    let target = if class_side { metaclass } else { class };
                    let trampoline = Arc::new(Trampoline {
                        family: MethodFamily::of(&selector),
                        selector: selector.clone(),
                        signature,
                        func,
                    });
                    let imp = Imp::from_fn(move |receiver, _, args, ret| {
                        trampoline.invoke(receiver, args, ret);
                    });
                    target.add_method(Method::new(Sel::register(&selector), imp, &encoding));
                }
                (
                    Member::Raw {
                        selector,
                        encoding,
                        imp,
                        class_side,
                    },
                    _,
                ) => {
                    let target = if class_side { metaclass } else { class };
                    target.add_method(Method::new(Sel::register(&selector), imp, &encoding));
                }
                (Member::Ivar { name, encoding }, Prepared::Type(ty)) => {
                    let ivar = add_ivar(class, &name, &encoding, &ty)?;
                    if matches!(ty.kind(), TypeKind::Object { .. }) {
                        cleanups.push(Cleanup::Release(ivar));
                    }
                }
                (
                    Member::Property {
                        name,
                        encoding,
                        weak,
                    },
                    Prepared::Type(ty),
                ) => {
                    let storage = storage_for(&ty, weak, &name)?;
                    let ivar_name = format!("_{name}");
                    let ivar = add_ivar(class, &ivar_name, &encoding, &ty)?;
                    class.add_method(Method::new(
                        Sel::register(&name),
                        getter_imp(ivar.clone(), storage),
                        &format!("{encoding}@:"),
                    ));
                    class.add_method(Method::new(
                        Sel::register(&setter_name(&name)),
                        setter_imp(ivar.clone(), storage),
                        &format!("v@:{encoding}"),
                    ));
                    class.add_property(Property::new(
                        &name,
                        property_attributes(&encoding, storage, Some(&ivar_name)),
                    ));
                    match storage {
                        PropertyStorage::Strong => cleanups.push(Cleanup::Release(ivar)),
                        PropertyStorage::Weak => cleanups.push(Cleanup::ClearWeak(ivar)),
                        PropertyStorage::Copy => {}
                    }
                }
                _ => {
                    return Err(Error::InvalidDefinition {
                        name: class.name().to_string(),
                        reason: "member preparation out of step".to_string(),
                    });
                }
            }
        }

        if self.dealloc.is_some() || !cleanups.is_empty() {
            let teardown = Arc::new(Teardown {
                class_name: class.name(),
                superclass,
                hook: self.dealloc,
                cleanups,
            });
            let imp = Imp::from_fn(move |receiver, _, _, _| teardown.run(receiver));
            class.add_method(Method::new(Sel::register("dealloc"), imp, "v@:"));
        }

        register_class_pair(class)?;
        oxbridge_log::info!(
            "registered class {} ({} protocols) inheriting from {}",
            class.name(),
            self.protocols.len(),
            superclass.name()
        );
        Ok(ObjCClass::from_class(class))
    }
}

enum Prepared {
    Signature(CallSignature),
    Type(Arc<TypeDescriptor>),
}

fn prepare(member: &Member) -> Result<Prepared> {
    match member {
        Member::Method {
            selector, encoding, ..
        } => {
            if selector == "dealloc" {
                return Err(Error::InvalidDefinition {
                    name: selector.clone(),
                    reason: "teardown is declared with ClassBuilder::dealloc".to_string(),
                });
            }
            let signature = CallSignature::for_method(encoding, selector)?;
            check_selector(selector, &signature)?;
            if !signature.ret().callback_returnable() {
                return Err(Error::UnsupportedEncoding {
                    code: encoding::encode(signature.ret()),
                    context: Some(format!("return value of {selector}")),
                });
            }
            Ok(Prepared::Signature(signature))
        }
        Member::Raw {
            selector, encoding, ..
        } => {
            let signature = CallSignature::for_method(encoding, selector)?;
            check_selector(selector, &signature)?;
            Ok(Prepared::Signature(signature))
        }
        Member::Ivar { name, encoding } | Member::Property { name, encoding, .. } => {
            let ty = encoding::decode_in_context(encoding, name)?;
            if let Member::Property { weak, .. } = member {
                storage_for(&ty, *weak, name)?;
            }
            Ok(Prepared::Type(ty))
        }
    }
}

fn add_ivar(class: Class, name: &str, encoding: &str, ty: &TypeDescriptor) -> Result<Ivar> {
    class.add_ivar(name, ty.size(), ty.align(), encoding)?;
    class.ivar(name).ok_or_else(|| Error::IvarLayout {
        class: class.name().to_string(),
        ivar: name.to_string(),
        reason: "ivar missing after it was added".to_string(),
    })
}

// ============================================================================
// Protocol builder
// ============================================================================

struct MethodSpec {
    selector: String,
    encoding: String,
    required: bool,
    instance: bool,
}

/// Builds and registers a new protocol. Protocols carry signatures only.
pub struct ProtocolBuilder {
    name: String,
    auto_rename: Option<bool>,
    bases: Vec<ObjCProtocol>,
    methods: Vec<MethodSpec>,
    properties: Vec<(String, String)>,
}

impl ProtocolBuilder {
    /// Starts a protocol named `name`.
    #[must_use]
    pub fn new(name: &str) -> ProtocolBuilder {
        ProtocolBuilder {
            name: name.to_string(),
            auto_rename: None,
            bases: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// Overrides the process-wide rename policy for this protocol.
    #[must_use]
    pub fn auto_rename(mut self, enabled: bool) -> Self {
        self.auto_rename = Some(enabled);
        self
    }

    /// Extends `base`.
    #[must_use]
    pub fn extends(mut self, base: &ObjCProtocol) -> Self {
        self.bases.push(*base);
        self
    }

    fn describe(mut self, selector: &str, encoding: &str, required: bool, instance: bool) -> Self {
        self.methods.push(MethodSpec {
            selector: selector.to_string(),
            encoding: encoding.to_string(),
            required,
            instance,
        });
        self
    }

    /// Declares a required instance method.
    #[must_use]
    pub fn method(self, selector: &str, encoding: &str) -> Self {
        self.describe(selector, encoding, true, true)
    }

    /// Declares an optional instance method.
    #[must_use]
    pub fn optional_method(self, selector: &str, encoding: &str) -> Self {
        self.describe(selector, encoding, false, true)
    }

    /// Declares a required class method.
    #[must_use]
    pub fn class_method(self, selector: &str, encoding: &str) -> Self {
        self.describe(selector, encoding, true, false)
    }

    /// Declares a property.
    #[must_use]
    pub fn property(mut self, name: &str, encoding: &str) -> Self {
        self.properties.push((name.to_string(), encoding.to_string()));
        self
    }

    /// Validates the declarations, then creates and registers the protocol.
    ///
    /// # Errors
    ///
    /// - encoding errors
    /// - [`Error::InvalidDefinition`] for selectors that do not match their
    ///   encoding
    /// - [`Error::ProtocolAlreadyExists`] unless auto-rename is on
    pub fn register(self) -> Result<ObjCProtocol> {
        let auto_rename = self.auto_rename.unwrap_or_else(|| config().auto_rename);
        for desc in &self.methods {
            let signature = CallSignature::for_method(&desc.encoding, &desc.selector)?;
            check_selector(&desc.selector, &signature)?;
        }
        let mut properties = Vec::with_capacity(self.properties.len());
        for (name, encoding) in &self.properties {
            let ty = encoding::decode_in_context(encoding, name)?;
            let storage = storage_for(&ty, false, name)?;
            properties.push(Property::new(name, property_attributes(encoding, storage, None)));
        }

        let protocol = allocate_renamed(&self.name, auto_rename, "protocol", allocate_protocol)?;
        for base in &self.bases {
            protocol.add_protocol(base.runtime_protocol())?;
        }
        for desc in &self.methods {
            protocol.add_method_description(
                Sel::register(&desc.selector),
                &desc.encoding,
                desc.required,
                desc.instance,
            )?;
        }
        for property in properties {
            protocol.add_property(property)?;
        }
        register_protocol(protocol)?;
        oxbridge_log::info!(
            "registered protocol {} ({} methods)",
            protocol.name(),
            self.methods.len()
        );
        Ok(ObjCProtocol::from_protocol(protocol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns_object() -> ObjCClass {
        ObjCClass::named("NSObject").unwrap()
    }

    #[test]
    fn test_duplicate_class_name() {
        ClassBuilder::new("BuilderUnitDup", &ns_object())
            .auto_rename(false)
            .register()
            .unwrap();
        let err = ClassBuilder::new("BuilderUnitDup", &ns_object())
            .auto_rename(false)
            .register()
            .unwrap_err();
        assert_eq!(err, Error::ClassAlreadyExists("BuilderUnitDup".into()));

        let renamed = ClassBuilder::new("BuilderUnitDup", &ns_object())
            .auto_rename(true)
            .register()
            .unwrap();
        assert_eq!(renamed.name(), "BuilderUnitDup_2");
    }

    #[test]
    fn test_selector_must_match_encoding() {
        let err = ClassBuilder::new("BuilderUnitArity", &ns_object())
            .method("add:", "i@:ii", |_, _| Ok(Value::Int(0)))
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition { .. }));
        // Nothing was allocated, so the name is still free.
        assert!(ObjCClass::named("BuilderUnitArity").is_err());
    }

    #[test]
    fn test_weak_scalar_rejected() {
        let err = ClassBuilder::new("BuilderUnitWeak", &ns_object())
            .weak_property("count", "i")
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition { .. }));
    }

    #[test]
    fn test_host_method_round_trip() {
        let class = ClassBuilder::new("BuilderUnitAdder", &ns_object())
            .method("add:to:", "i@:ii", |_, args| {
                Ok(Value::Int(args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0)))
            })
            .class_method("answer", "q@:", |_, _| Ok(Value::Int(42)))
            .register()
            .unwrap();

        assert_eq!(class.call("answer", &[]).unwrap(), Value::Int(42));
        let obj = objc_instance(&class.call("new", &[]).unwrap()).unwrap();
        assert_eq!(obj.call("add:to:", &[2.into(), 3.into()]).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_failing_method_reports_callback_error() {
        let class = ClassBuilder::new("BuilderUnitFails", &ns_object())
            .method("explode", "v@:", |_, _| {
                Err(Error::ArgumentType {
                    expected: "nothing".into(),
                    got: "something".into(),
                })
            })
            .register()
            .unwrap();
        let obj = objc_instance(&class.call("new", &[]).unwrap()).unwrap();
        let err = obj.call("explode", &[]).unwrap_err();
        assert!(matches!(err, Error::Callback { ref selector, .. } if selector == "explode"));
    }

    #[test]
    fn test_scalar_property_defaults_to_zero() {
        let class = ClassBuilder::new("BuilderUnitCounter", &ns_object())
            .property("counter", "i")
            .register()
            .unwrap();
        let obj = objc_instance(&class.call("new", &[]).unwrap()).unwrap();
        assert_eq!(obj.value("counter").unwrap(), Value::Int(0));
        obj.set("counter", 7).unwrap();
        assert_eq!(obj.value("counter").unwrap(), Value::Int(7));
        assert!(class.is_property("counter").unwrap());
    }

    #[test]
    fn test_protocol_builder() {
        let base = ProtocolBuilder::new("BuilderUnitBase")
            .method("ping", "v@:")
            .register()
            .unwrap();
        let derived = ProtocolBuilder::new("BuilderUnitDerived")
            .extends(&base)
            .optional_method("pong:", "v@:@")
            .property("title", "@")
            .register()
            .unwrap();
        assert!(derived.conforms_to(&base));

        let err = ProtocolBuilder::new("BuilderUnitBase")
            .auto_rename(false)
            .register()
            .unwrap_err();
        assert_eq!(err, Error::ProtocolAlreadyExists("BuilderUnitBase".into()));
        let renamed = ProtocolBuilder::new("BuilderUnitBase")
            .auto_rename(true)
            .register()
            .unwrap();
        assert_eq!(renamed.name(), "BuilderUnitBase_2");
    }

    #[test]
    fn test_repeated_protocol_rejected() {
        let proto = ProtocolBuilder::new("BuilderUnitTwice").register().unwrap();
        let err = ClassBuilder::new("BuilderUnitTwiceClass", &ns_object())
            .protocol(&proto)
            .protocol(&proto)
            .register()
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolAlreadyAdopted { .. }));
    }
}
