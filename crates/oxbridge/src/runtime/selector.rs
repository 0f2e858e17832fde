//! Selector interning.
//!
//! Every selector name maps to exactly one [`Sel`] for the life of the
//! process. The name is leaked into a `'static` allocation so a `Sel` is a
//! single pointer that can travel through argument buffers like any other
//! pointer-sized value.
//!
//! # Thread Safety
//!
//! The registry is a `parking_lot::RwLock` over an `FxHashMap`. Lookups of
//! already interned names take the read lock only.

use fxhash::FxHashMap;
use parking_lot::RwLock;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Interned selector data. Never freed.
#[repr(C)]
struct SelectorData {
    name: &'static str,
    hash: u64,
}

/// Opaque, interned method name.
///
/// Two selectors are equal exactly when their names are equal, and equality
/// is a pointer comparison.
///
/// # Example
///
/// ```rust
/// use oxbridge::runtime::Sel;
///
/// let a = Sel::register("initWithInt:");
/// let b = Sel::register("initWithInt:");
/// assert_eq!(a, b);
/// assert_eq!(a.name(), "initWithInt:");
/// assert_eq!(a.arg_count(), 1);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Sel(NonNull<SelectorData>);

// SAFETY: Sel is Send + Sync because:
// - SelectorData is immutable after creation
// - the allocation is leaked and lives for the whole process
unsafe impl Send for Sel {}
unsafe impl Sync for Sel {}

static REGISTRY: OnceLock<RwLock<FxHashMap<&'static str, Sel>>> =
    OnceLock::new();

fn registry() -> &'static RwLock<FxHashMap<&'static str, Sel>> {
    REGISTRY.get_or_init(|| RwLock::new(FxHashMap::default()))
}

fn hash_name(name: &str) -> u64 {
    let mut hasher = fxhash::FxHasher64::default();
    name.hash(&mut hasher);
    hasher.finish()
}

impl Sel {
    /// Returns the selector for `name`, interning it on first use.
    #[must_use]
    pub fn register(name: &str) -> Sel {
        if let Some(sel) = registry().read().get(name) {
            return *sel;
        }

        let mut selectors = registry().write();
        // Another thread may have interned it between the two locks.
        if let Some(sel) = selectors.get(name) {
            return *sel;
        }

        let name: &'static str = Box::leak(name.to_owned().into_boxed_str());
        let data = Box::leak(Box::new(SelectorData {
            name,
            hash: hash_name(name),
        }));
        let sel = Sel(NonNull::from(data));
        selectors.insert(name, sel);
        sel
    }

    /// Returns the selector for `name` only if it was interned before.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Sel> {
        registry().read().get(name).copied()
    }

    /// Returns the selector name.
    #[must_use]
    pub fn name(self) -> &'static str {
        // SAFETY: the pointer came from Box::leak and is never freed
        unsafe { self.0.as_ref() }.name
    }

    /// Returns the number of arguments the selector takes (one per colon).
    #[must_use]
    pub fn arg_count(self) -> usize {
        self.name().bytes().filter(|&b| b == b':').count()
    }

    /// Returns the address used when the selector is passed as an argument.
    #[must_use]
    pub fn as_ptr(self) -> *const u8 {
        self.0.as_ptr().cast()
    }

    /// Rebuilds a selector from a pointer produced by [`Sel::as_ptr`].
    ///
    /// Returns `None` for null.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a value previously returned by `as_ptr`.
    #[must_use]
    pub unsafe fn from_ptr(ptr: *const u8) -> Option<Sel> {
        NonNull::new(ptr.cast_mut().cast::<SelectorData>()).map(Sel)
    }
}

impl Hash for Sel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // SAFETY: see Sel::name
        state.write_u64(unsafe { self.0.as_ref() }.hash);
    }
}

impl fmt::Debug for Sel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sel({})", self.name())
    }
}

impl fmt::Display for Sel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_interning_is_pointer_equal() {
        let a = Sel::register("selectorTestInterning");
        let b = Sel::register("selectorTestInterning");
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn test_lookup_before_register() {
        assert!(Sel::lookup("selectorTestNeverRegistered:").is_none());
        let sel = Sel::register("selectorTestRegisteredLater:");
        assert_eq!(Sel::lookup("selectorTestRegisteredLater:"), Some(sel));
    }

    #[test]
    fn test_pointer_round_trip() {
        let sel = Sel::register("initWithObjects:count:");
        let back = unsafe { Sel::from_ptr(sel.as_ptr()) };
        assert_eq!(back, Some(sel));
        assert_eq!(unsafe { Sel::from_ptr(std::ptr::null()) }, None);
        assert_eq!(sel.arg_count(), 2);
    }

    #[test]
    fn test_concurrent_register() {
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(|| Sel::register("selectorTestConcurrent:")))
            .collect();

        let sels: Vec<Sel> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(sels.windows(2).all(|w| w[0] == w[1]));
    }
}
