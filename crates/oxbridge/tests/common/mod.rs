// Common test utilities for integration tests
//
// This module provides shared helper functions and test fixtures
// for use across all integration tests.

#![allow(dead_code)]

use oxbridge::bridge::{ObjCClass, ObjCInstance, Value, objc_instance};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

static NAME_ID: AtomicUsize = AtomicUsize::new(0);

/// Returns a class name no other test in this binary uses.
pub fn unique_name(prefix: &str) -> String {
    let id = NAME_ID.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}_{id}")
}

/// Looks up a Foundation class
pub fn class(name: &str) -> ObjCClass {
    ObjCClass::named(name).expect("Foundation class missing")
}

/// The root class
pub fn ns_object() -> ObjCClass {
    class("NSObject")
}

/// Sends `new` to `class` and unwraps the instance
pub fn new_instance(class: &ObjCClass) -> ObjCInstance {
    let value = class.call("new", &[]).expect("new failed");
    objc_instance(&value).expect("new returned a non-object")
}

/// An empty `NSMutableArray`
pub fn mutable_array() -> ObjCInstance {
    let value = class("NSMutableArray").call("array", &[]).expect("array failed");
    objc_instance(&value).expect("array returned a non-object")
}

/// Counts drops of the values it hands out
#[derive(Clone, Default)]
pub struct DropCounter(Arc<AtomicUsize>);

impl DropCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that bumps this counter when dropped
    pub fn token(&self) -> DropToken {
        DropToken(Arc::clone(&self.0))
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct DropToken(Arc<AtomicUsize>);

impl Drop for DropToken {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A host callable that keeps `token` alive until the value is dropped
pub fn callable_holding(token: DropToken) -> Value {
    Value::callable(move |_| {
        let _ = &token;
        Ok(Value::None)
    })
}

/// Argument helper for integer parameters
pub fn int_arg(value: &Value) -> i64 {
    value.as_i64().unwrap_or_default()
}
