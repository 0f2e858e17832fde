//! Protocol descriptors.

use crate::error::{Error, Result};
use crate::runtime::foundation;
use crate::runtime::protocol::get_protocol;
use crate::runtime::{ObjectPtr, Protocol};
use std::fmt;

/// A registered runtime protocol.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjCProtocol(Protocol);

impl ObjCProtocol {
    /// Looks a protocol up by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolNotFound`] for unknown names.
    pub fn named(name: &str) -> Result<ObjCProtocol> {
        foundation::classes();
        get_protocol(name)
            .map(ObjCProtocol)
            .ok_or_else(|| Error::ProtocolNotFound(name.to_string()))
    }

    /// Wraps a protocol pointer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAProtocol`] for anything else.
    pub fn from_ptr(ptr: ObjectPtr) -> Result<ObjCProtocol> {
        Protocol::from_object(ptr)
            .map(ObjCProtocol)
            .ok_or(Error::NotAProtocol(ptr.addr()))
    }

    pub(crate) fn from_protocol(protocol: Protocol) -> ObjCProtocol {
        ObjCProtocol(protocol)
    }

    /// Protocol name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Protocol object pointer.
    #[must_use]
    pub fn ptr(&self) -> ObjectPtr {
        self.0.as_object()
    }

    /// Underlying runtime protocol.
    #[must_use]
    pub fn runtime_protocol(&self) -> Protocol {
        self.0
    }

    /// Protocols this one extends directly.
    #[must_use]
    pub fn protocols(&self) -> Vec<ObjCProtocol> {
        self.0.protocols().into_iter().map(ObjCProtocol).collect()
    }

    /// Whether this protocol is `other` or extends it, directly or not.
    #[must_use]
    pub fn conforms_to(&self, other: &ObjCProtocol) -> bool {
        self.0.conforms_to(other.0)
    }
}

impl fmt::Debug for ObjCProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ObjCProtocol: {}>", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::protocol::{allocate_protocol, register_protocol};

    #[test]
    fn test_lookup_and_conformance() {
        let base = allocate_protocol("ProtoDescBase").unwrap();
        register_protocol(base).unwrap();
        let derived = allocate_protocol("ProtoDescDerived").unwrap();
        derived.add_protocol(base).unwrap();
        register_protocol(derived).unwrap();

        let base = ObjCProtocol::named("ProtoDescBase").unwrap();
        let derived = ObjCProtocol::named("ProtoDescDerived").unwrap();
        assert!(derived.conforms_to(&base));
        assert!(!base.conforms_to(&derived));
        assert_eq!(derived.protocols(), vec![base]);
        assert_eq!(ObjCProtocol::from_ptr(derived.ptr()).unwrap(), derived);
    }

    #[test]
    fn test_missing_protocol() {
        assert_eq!(
            ObjCProtocol::named("ProtoDescMissing").unwrap_err(),
            Error::ProtocolNotFound("ProtoDescMissing".into())
        );
        let obj = foundation::classes().ns_object.as_object();
        assert!(matches!(ObjCProtocol::from_ptr(obj), Err(Error::NotAProtocol(_))));
    }
}
