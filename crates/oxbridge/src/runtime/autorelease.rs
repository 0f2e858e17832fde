//! Thread-local autorelease pools.
//!
//! Each thread keeps a stack of pools. [`autorelease`] adds an object to
//! the innermost pool; popping the pool releases every object in it, in the
//! order they were added. Objects autoreleased while a pool drains go into
//! the same pool and are drained in the same pop.

use crate::runtime::object::{ObjectPtr, release};
use std::cell::RefCell;
use std::marker::PhantomData;

thread_local! {
    static POOLS: RefCell<Vec<Vec<ObjectPtr>>> = const { RefCell::new(Vec::new()) };
}

/// Pushes a new pool and returns its depth token.
pub fn push() -> usize {
    POOLS.with(|pools| {
        let mut pools = pools.borrow_mut();
        pools.push(Vec::new());
        pools.len()
    })
}

/// Drains and pops the pool created by the matching [`push`].
///
/// Pools above `token` that were never popped are drained too.
pub fn pop(token: usize) {
    loop {
        // Release outside the borrow: dealloc may autorelease more objects.
        let batch = POOLS.with(|pools| {
            let mut pools = pools.borrow_mut();
            if pools.len() < token {
                return None;
            }
            let top = pools.last_mut()?;
            if top.is_empty() {
                pools.pop();
                return Some(Vec::new());
            }
            Some(std::mem::take(top))
        });

        match batch {
            None => return,
            Some(batch) => {
                for obj in batch {
                    release(obj);
                }
            }
        }
    }
}

/// Returns `true` if the current thread has a pool in place.
#[must_use]
pub fn is_active() -> bool {
    POOLS.with(|pools| !pools.borrow().is_empty())
}

/// Number of objects waiting in the innermost pool.
#[must_use]
pub fn pending() -> usize {
    POOLS.with(|pools| pools.borrow().last().map_or(0, Vec::len))
}

/// Adds `obj` to the innermost pool. Without a pool the object leaks.
pub fn autorelease(obj: ObjectPtr) -> ObjectPtr {
    if obj.is_nil() {
        return obj;
    }
    let added = POOLS.with(|pools| match pools.borrow_mut().last_mut() {
        Some(pool) => {
            pool.push(obj);
            true
        }
        None => false,
    });
    if !added {
        oxbridge_log::warn!(
            "object {:#x} autoreleased with no pool in place - just leaking",
            obj.addr()
        );
    }
    obj
}

/// RAII guard around [`push`] / [`pop`]. Not `Send`: pools are per thread.
pub struct AutoreleasePool {
    token: usize,
    _not_send: PhantomData<*const ()>,
}

impl AutoreleasePool {
    /// Pushes a pool that drains when the guard drops.
    #[must_use]
    pub fn new() -> Self {
        AutoreleasePool {
            token: push(),
            _not_send: PhantomData,
        }
    }
}

impl Default for AutoreleasePool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AutoreleasePool {
    fn drop(&mut self) {
        pop(self.token);
    }
}

/// Runs `f` inside a fresh pool.
pub fn autoreleasepool<T>(f: impl FnOnce() -> T) -> T {
    let _pool = AutoreleasePool::new();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::foundation;
    use crate::runtime::object::{alloc_instance, retain, retain_count};

    #[test]
    fn test_pool_releases_on_drop() {
        let obj = alloc_instance(foundation::classes().ns_object).unwrap();
        retain(obj);
        autoreleasepool(|| {
            autorelease(obj);
            assert_eq!(retain_count(obj), 2);
            assert_eq!(pending(), 1);
        });
        assert_eq!(retain_count(obj), 1);
        crate::runtime::object::release(obj);
    }

    #[test]
    fn test_nested_pools() {
        let obj = alloc_instance(foundation::classes().ns_object).unwrap();
        retain(obj);
        retain(obj);
        autoreleasepool(|| {
            autorelease(obj);
            autoreleasepool(|| {
                autorelease(obj);
            });
            assert_eq!(retain_count(obj), 2);
        });
        assert_eq!(retain_count(obj), 1);
        crate::runtime::object::release(obj);
    }

    #[test]
    fn test_active_flag() {
        assert!(!is_active());
        let pool = AutoreleasePool::new();
        assert!(is_active());
        drop(pool);
        assert!(!is_active());
    }
}
