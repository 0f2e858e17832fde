//! Calling-convention selection.
//!
//! Picks the message-send entry point for a return type. The choice is a
//! pure function of the return type's shape and the architecture; the entry
//! point itself is fetched fresh for every send.

use crate::bridge::encoding::TypeDescriptor;
use crate::error::Result;
use crate::runtime::abi::{self, Arch, Convention};
use crate::runtime::{ObjectPtr, Sel, message};

/// Entry point used to send a message.
pub type SendFn = unsafe fn(ObjectPtr, Sel, *const *mut u8, *mut u8) -> Result<()>;

/// Convention required to return `ret` on `arch`.
///
/// # Example
///
/// ```rust
/// use oxbridge::bridge::{convention, encoding};
/// use oxbridge::runtime::{Arch, Convention};
///
/// let big = encoding::decode("{Big=qqq}").unwrap();
/// let small = encoding::decode("{Small=ii}").unwrap();
/// assert_eq!(convention::select(&big, Arch::X86_64), Convention::StructReturn);
/// assert_eq!(convention::select(&small, Arch::X86_64), Convention::Standard);
/// ```
#[must_use]
pub fn select(ret: &TypeDescriptor, arch: Arch) -> Convention {
    let convention = abi::classify(ret.return_shape(), arch);
    oxbridge_log::trace!("{ret} on {arch:?} returns via {convention}");
    convention
}

/// Entry point for `ret` on the host architecture.
#[must_use]
pub fn entry_point_for(ret: &TypeDescriptor) -> (Convention, SendFn) {
    let convention = select(ret, Arch::current());
    (convention, message::entry_point(convention))
}
