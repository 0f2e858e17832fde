//! In-process Objective-C style object runtime.
//!
//! This is the native side the bridge talks to: selectors, classes and
//! metaclasses, reference-counted objects, protocols, message sending with
//! per-convention entry points, autorelease pools, blocks, and the handful of
//! Foundation classes the marshaling layer needs.
//!
//! # Architecture
//!
//! - [`selector`]: selector interning
//! - [`class`]: class pairs, methods, ivars, properties
//! - [`object`]: allocation, retain/release, weak references, associated
//!   objects
//! - [`protocol`]: protocol definition and conformance
//! - [`message`]: `msg_send` and its struct-return / float-return variants
//! - [`abi`]: calling-convention rules and type sizes
//! - [`autorelease`]: per-thread autorelease pools
//! - [`block`]: block layout, copy and release
//! - [`foundation`]: `NSObject`, `NSString`, `NSNumber` and friends
//!
//! Everything registered here lives for the whole process; only instances
//! are ever freed.
//!
//! # Example
//!
//! ```rust
//! use oxbridge::runtime::{Sel, foundation, message, object};
//!
//! let class = foundation::classes().ns_object;
//! let obj = object::alloc_instance(class).unwrap();
//!
//! let mut count = 0u64;
//! unsafe {
//!     message::msg_send(
//!         obj,
//!         Sel::register("retainCount"),
//!         std::ptr::null(),
//!         (&raw mut count).cast(),
//!     )
//! }
//! .unwrap();
//! assert_eq!(count, 1);
//! object::release(obj);
//! ```

pub mod abi;
pub mod autorelease;
pub mod block;
pub mod class;
pub mod foundation;
pub mod message;
pub mod object;
pub mod protocol;
pub mod selector;

pub use abi::{Arch, Convention};
pub use class::{Class, Imp, ImpFn, Ivar, Method, Property};
pub use object::ObjectPtr;
pub use protocol::Protocol;
pub use selector::Sel;
