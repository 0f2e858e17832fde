//! Blocks in both directions.
//!
//! Host callables become heap blocks whose invoke function converts the
//! native arguments, calls the callable and writes the result back. The
//! callable stays alive for as long as any heap copy of its block: the copy
//! helper records it in a keep-alive table keyed by the heap block's
//! address, and the dispose helper removes it.
//!
//! Native blocks wrapped with [`ObjCBlock::from_ptr`] are copied (retained)
//! and released when the wrapper goes away; [`ObjCBlock::call`] invokes them
//! with marshaled arguments.

use crate::bridge::method::{discard_stale_callback_error, record_callback_error, take_callback_error};
use crate::bridge::signature::{ArgumentFrame, CallSignature, NativeBuffer};
use crate::bridge::value::{HostFn, Value, read_value, write_persistent};
use crate::error::{Error, Result};
use crate::runtime::autorelease::autoreleasepool;
use crate::runtime::block::{
    BLOCK_HAS_COPY_DISPOSE, BLOCK_HAS_SIGNATURE, BlockDescriptor, BlockLiteral, block_copy,
    block_release, block_signature, invoke_block,
};
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::ffi::CString;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};

struct HostCallable {
    func: HostFn,
    signature: CallSignature,
}

#[repr(C)]
struct HostBlock {
    literal: BlockLiteral,
    callable: *const HostCallable,
}

static KEEP_ALIVE: OnceLock<Mutex<FxHashMap<usize, Arc<HostCallable>>>> = OnceLock::new();

fn keep_alive() -> &'static Mutex<FxHashMap<usize, Arc<HostCallable>>> {
    KEEP_ALIVE.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Number of host callables kept alive by heap blocks.
#[must_use]
pub fn live_host_blocks() -> usize {
    keep_alive().lock().len()
}

static DESCRIPTORS: OnceLock<Mutex<FxHashMap<String, &'static BlockDescriptor>>> = OnceLock::new();

/// One descriptor per signature, never freed: heap blocks read their
/// descriptor until the very end of their release.
fn descriptor_for(signature: &str) -> Result<&'static BlockDescriptor> {
    let mut map = DESCRIPTORS
        .get_or_init(|| Mutex::new(FxHashMap::default()))
        .lock();
    if let Some(found) = map.get(signature) {
        return Ok(found);
    }
    let text = CString::new(signature).map_err(|_| Error::InvalidEncoding {
        encoding: signature.to_string(),
        position: 0,
        reason: "NUL byte in block signature".to_string(),
    })?;
    let descriptor: &'static BlockDescriptor = Box::leak(Box::new(BlockDescriptor {
        reserved: 0,
        size: size_of::<HostBlock>(),
        copy_helper: Some(copy_host_block),
        dispose_helper: Some(dispose_host_block),
        signature: Box::leak(text.into_boxed_c_str()).as_ptr(),
    }));
    map.insert(signature.to_string(), descriptor);
    Ok(descriptor)
}

unsafe extern "C" fn copy_host_block(dst: *mut BlockLiteral, src: *const BlockLiteral) {
    // SAFETY: both blocks were built by ObjCBlock::from_host
    let callable = unsafe { (*src.cast::<HostBlock>()).callable };
    // SAFETY: the source block's callable is alive: it is either the
    // creating Arc or an entry of the keep-alive table
    let callable = unsafe {
        Arc::increment_strong_count(callable);
        Arc::from_raw(callable)
    };
    keep_alive().lock().insert(dst as usize, callable);
}

unsafe extern "C" fn dispose_host_block(block: *mut BlockLiteral) {
    let removed = keep_alive().lock().remove(&(block as usize));
    // Dropped unlocked: the callable may own objects whose release
    // disposes other blocks.
    drop(removed);
}

unsafe extern "C" fn invoke_host_block(block: *mut BlockLiteral, args: *const *mut u8, ret: *mut u8) {
    // SAFETY: only blocks built by ObjCBlock::from_host use this invoke
    let callable = unsafe { &*(*block.cast::<HostBlock>()).callable };
    let signature = &callable.signature;

    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
        let values = signature
            .args()
            .iter()
            .enumerate()
            // SAFETY: the caller passes one pointer per declared argument
            .map(|(index, ty)| unsafe { read_value(ty, *args.add(index)) })
            .collect::<Result<Vec<_>>>()?;
        let result = (callable.func)(&values)?;
        if !ret.is_null() && !signature.ret().is_void() {
            // SAFETY: the caller sized ret for the return type
            unsafe { write_persistent(signature.ret(), &result, ret) }?;
        }
        Ok(())
    }));

    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(_) => Error::Callback {
            selector: signature.encoding().to_string(),
            message: "host callable panicked".to_string(),
        },
    };
    if !ret.is_null() {
        // SAFETY: the caller sized ret for the return type
        unsafe { std::ptr::write_bytes(ret, 0, signature.ret().size()) };
    }
    record_callback_error(&format!("block {}", signature.encoding()), &err);
}

struct BlockInner {
    ptr: *mut BlockLiteral,
    signature: Option<CallSignature>,
}

// SAFETY: heap blocks are reference counted atomically and never mutated
// after the copy
unsafe impl Send for BlockInner {}
unsafe impl Sync for BlockInner {}

impl Drop for BlockInner {
    fn drop(&mut self) {
        // SAFETY: we own one reference from block_copy
        unsafe { block_release(self.ptr) };
    }
}

/// A heap block.
#[derive(Clone)]
pub struct ObjCBlock(Arc<BlockInner>);

impl ObjCBlock {
    /// Wraps a native block, copying it to the heap (or retaining it).
    ///
    /// # Safety
    ///
    /// `ptr` must be a valid block.
    ///
    /// # Errors
    ///
    /// Returns encoding errors if the block's signature cannot be decoded.
    pub unsafe fn from_ptr(ptr: *mut BlockLiteral) -> Result<ObjCBlock> {
        // SAFETY: caller guarantees a valid block
        let signature = match unsafe { block_signature(ptr) } {
            Some(text) => Some(CallSignature::for_block(text)?),
            None => None,
        };
        // SAFETY: caller guarantees a valid block
        let copied = unsafe { block_copy(ptr) };
        Ok(ObjCBlock(Arc::new(BlockInner {
            ptr: copied,
            signature,
        })))
    }

    /// Builds a heap block from a host callable.
    ///
    /// `encoding` is the block signature, e.g. `i@?ii` for a block taking
    /// two ints and returning one.
    ///
    /// # Errors
    ///
    /// - encoding errors
    /// - [`Error::UnsupportedEncoding`] if the return type cannot be
    ///   returned from a callback
    ///
    /// # Example
    ///
    /// ```rust
    /// use oxbridge::bridge::block::ObjCBlock;
    /// use oxbridge::bridge::value::Value;
    ///
    /// let add = ObjCBlock::from_callable("i@?ii", |args| {
    ///     Ok(Value::Int(args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0)))
    /// })
    /// .unwrap();
    /// assert_eq!(add.call(&[Value::Int(2), Value::Int(3)]).unwrap(), Value::Int(5));
    /// ```
    pub fn from_callable<F>(encoding: &str, f: F) -> Result<ObjCBlock>
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        ObjCBlock::from_host(encoding, Arc::new(f))
    }

    pub(crate) fn from_host(encoding: &str, func: HostFn) -> Result<ObjCBlock> {
        let signature = CallSignature::for_block(encoding)?;
        if !signature.ret().callback_returnable() {
            return Err(Error::UnsupportedEncoding {
                code: signature.ret().to_string(),
                context: Some(format!("block return of {encoding}")),
            });
        }
        let descriptor = descriptor_for(encoding)?;
        let callable = Arc::new(HostCallable {
            func,
            signature: signature.clone(),
        });
        let stack = HostBlock {
            literal: BlockLiteral::new(
                BLOCK_HAS_COPY_DISPOSE | BLOCK_HAS_SIGNATURE,
                invoke_host_block,
                descriptor,
            ),
            callable: Arc::as_ptr(&callable),
        };
        // SAFETY: the descriptor size covers the whole HostBlock
        let heap = unsafe { block_copy((&raw const stack).cast::<BlockLiteral>()) };
        drop(callable);
        if heap.is_null() {
            return Err(Error::InvalidDefinition {
                name: encoding.to_string(),
                reason: "block copy failed".to_string(),
            });
        }
        oxbridge_log::trace!("host block {encoding} at {:#x}", heap as usize);
        Ok(ObjCBlock(Arc::new(BlockInner {
            ptr: heap,
            signature: Some(signature),
        })))
    }

    /// Block pointer.
    #[must_use]
    pub fn as_ptr(&self) -> *mut BlockLiteral {
        self.0.ptr
    }

    /// Decoded signature, if the block carries one.
    #[must_use]
    pub fn signature(&self) -> Option<&CallSignature> {
        self.0.signature.as_ref()
    }

    /// Invokes the block.
    ///
    /// # Errors
    ///
    /// - [`Error::ArgumentType`] if the block has no signature
    /// - [`Error::ArgumentCount`] / [`Error::Argument`] for bad arguments
    /// - [`Error::Callback`] if a host callable behind the block failed
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        let signature = self.signature().ok_or_else(|| Error::ArgumentType {
            expected: "block with a signature".to_string(),
            got: "block".to_string(),
        })?;
        if args.len() != signature.args().len() {
            return Err(Error::ArgumentCount {
                selector: format!("block {}", signature.encoding()),
                expected: signature.args().len(),
                got: args.len(),
            });
        }

        autoreleasepool(|| {
            let frame = ArgumentFrame::build(signature.args(), args, |index, err| {
                err.with_call_context(
                    "block",
                    index,
                    signature.argtypes_string(),
                    signature.encoding(),
                )
            })?;
            let mut ret = signature.return_buffer();
            let ret_ptr = ret
                .as_mut()
                .map_or(std::ptr::null_mut(), NativeBuffer::as_mut_ptr);
            discard_stale_callback_error("block call");
            // SAFETY: the frame and return buffer match the signature
            unsafe { invoke_block(self.as_ptr(), frame.as_ptr(), ret_ptr) };
            if let Some(err) = take_callback_error() {
                return Err(err);
            }
            match ret {
                None => Ok(Value::None),
                // SAFETY: the block wrote a value of the return type
                Some(buffer) => unsafe { read_value(signature.ret(), buffer.as_ptr()) },
            }
        })
    }
}

impl PartialEq for ObjCBlock {
    fn eq(&self, other: &ObjCBlock) -> bool {
        self.0.ptr == other.0.ptr
    }
}

impl fmt::Debug for ObjCBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signature = self.signature().map_or("?", CallSignature::encoding);
        write!(f, "<ObjCBlock: {signature} at {:#x}>", self.0.ptr as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_host_block_round_trip() {
        let block = ObjCBlock::from_callable("d@?dd", |args| {
            let a = args[0].as_f64().unwrap_or_default();
            let b = args[1].as_f64().unwrap_or_default();
            Ok(Value::Float(a * b))
        })
        .unwrap();
        assert_eq!(block.call(&[1.5.into(), 4.0.into()]).unwrap(), Value::Float(6.0));
    }

    #[test]
    fn test_keep_alive_follows_copies() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Token;
        impl Drop for Token {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let token = Token;
        let block = ObjCBlock::from_callable("v@?", move |_| {
            let _ = &token;
            Ok(Value::None)
        })
        .unwrap();
        let again = unsafe { ObjCBlock::from_ptr(block.as_ptr()) }.unwrap();
        drop(block);
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);
        again.call(&[]).unwrap();
        drop(again);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_failure_surfaces() {
        let block = ObjCBlock::from_callable("i@?i", |_| {
            Err(Error::ArgumentType {
                expected: "nothing".into(),
                got: "something".into(),
            })
        })
        .unwrap();
        let err = block.call(&[Value::Int(1)]).unwrap_err();
        assert!(matches!(err, Error::Callback { .. }));
    }

    #[test]
    fn test_panics_do_not_cross() {
        let block = ObjCBlock::from_callable("v@?", |_| panic!("boom")).unwrap();
        assert!(matches!(block.call(&[]), Err(Error::Callback { .. })));
    }

    #[test]
    fn test_array_returns_rejected() {
        let err = ObjCBlock::from_callable("[4i]@?", |_| Ok(Value::None)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedEncoding { .. }));
    }

    #[test]
    fn test_arity_checked() {
        let block = ObjCBlock::from_callable("v@?i", |_| Ok(Value::None)).unwrap();
        assert!(matches!(block.call(&[]), Err(Error::ArgumentCount { .. })));
    }
}
