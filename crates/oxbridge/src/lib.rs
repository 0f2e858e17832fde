//! `oxbridge`: a dynamic bridge to an Objective-C style object runtime
//!
//! `oxbridge` lets host code drive a reference-counted, message-sending
//! object runtime without compile-time bindings. It provides:
//!
//! - **Dynamic Calls** by selector, with argument and result marshaling
//!   built at run time from type-encoding strings
//! - **Object Identity**: one wrapper per native object, with retain and
//!   release handled at the boundary
//! - **Class Definition** at run time, with methods, properties and ivars
//!   implemented by host closures
//! - **ABI Rules** for struct and floating-point returns per architecture
//!
//! # Architecture
//!
//! - **Bridge Layer** ([`bridge`]): encodings, resolution caches, the
//!   identity registry, builders and value conversion
//! - **Runtime Layer** ([`runtime`]): the in-process object runtime the
//!   bridge talks to
//! - **Ambient**: [`error`] and [`config`], logging through `oxbridge-log`
//!
//! # Example
//!
//! ```rust
//! use oxbridge::bridge::{ObjCClass, Value, objc_instance};
//!
//! let class = ObjCClass::named("NSMutableArray").unwrap();
//! let array = objc_instance(&class.call("array", &[]).unwrap()).unwrap();
//! array.call("addObject:", &[Value::from("hello")]).unwrap();
//! assert_eq!(array.call("count", &[]).unwrap(), Value::UInt(1));
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod runtime;

// Re-export commonly used types
pub use bridge::{
    ClassBuilder, ObjCBlock, ObjCClass, ObjCInstance, ObjCMetaclass, ObjCMethod, ObjCProtocol,
    ProtocolBuilder, Value,
};
pub use config::{BridgeConfig, config};
pub use error::{Error, Result};
