//! The host side of the bridge.
//!
//! A call like `obj.call("add:to:", &[a, b])` flows through:
//!
//! 1. [`class`]: resolve the selector on the receiver's class (memoized)
//! 2. [`encoding`] and [`signature`]: decode the method's types
//! 3. [`convention`]: pick the entry point for the return type
//! 4. [`value`]: convert the arguments
//! 5. the native send
//! 6. [`value`] and [`instance`]: convert the result, wrapping objects
//!
//! The other direction is covered by [`builder`] (classes and protocols
//! with host-implemented methods) and [`block`] (host callables as blocks).
//!
//! # Thread Safety
//!
//! Every entry point can be called from any thread. The identity registry
//! has one process-wide re-entrant lock; each class descriptor has its own.
//! No lock is held across a message send.

pub mod block;
pub mod builder;
pub mod class;
pub mod convention;
pub mod encoding;
pub mod instance;
pub mod method;
pub mod protocol;
pub mod signature;
pub mod value;

pub use block::ObjCBlock;
pub use builder::{ClassBuilder, PropertyStorage, ProtocolBuilder};
pub use class::{BoundPartial, ObjCClass, ObjCMetaclass};
pub use encoding::{TypeDescriptor, TypeKind, decode, encode};
pub use instance::{Attribute, InstanceKind, ObjCInstance, objc_instance, register_type_for_objcclass, wrap};
pub use method::{BoundMethod, MethodFamily, ObjCMethod, send_message, send_super};
pub use protocol::ObjCProtocol;
pub use value::{
    Decimal, MAX_DECIMAL_SCALE, StructValue, Value, ValueMap, compound_value_for_sequence, ns_from_value,
    value_from_ns,
};
