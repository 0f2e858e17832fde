//! Block (closure) objects.
//!
//! A block is a small header followed by captured state:
//!
//! ```text
//! +-----------+-------+----------+--------+------------+---------
//! | isa       | flags | reserved | invoke | descriptor | captures
//! +-----------+-------+----------+--------+------------+---------
//! ```
//!
//! Blocks start life on the stack (or as globals). [`block_copy`] moves a
//! stack block to the heap, running the descriptor's copy helper so the
//! captures can take ownership of what they reference; [`block_release`]
//! drops a heap reference and runs the dispose helper on the last one.
//!
//! The invoke function in this runtime takes the block plus untyped
//! argument and return buffers, the same convention as method IMPs.

use std::alloc::Layout;
use std::ffi::{CStr, c_char};
use std::sync::atomic::{AtomicI32, Ordering};

/// Block has copy and dispose helpers.
pub const BLOCK_HAS_COPY_DISPOSE: i32 = 1 << 25;
/// Helpers are C++ constructors/destructors.
pub const BLOCK_HAS_CTOR: i32 = 1 << 26;
/// Global block: never copied, never freed.
pub const BLOCK_IS_GLOBAL: i32 = 1 << 28;
/// Invoke returns an aggregate through a hidden pointer.
pub const BLOCK_HAS_STRET: i32 = 1 << 29;
/// Descriptor carries a type signature.
pub const BLOCK_HAS_SIGNATURE: i32 = 1 << 30;
/// Heap block owned by a reference count.
pub const BLOCK_NEEDS_FREE: i32 = 1 << 24;
/// Reference count bits (logical count times two).
pub const BLOCK_REFCOUNT_MASK: i32 = 0xfffe;

/// Invoke function.
pub type BlockInvoke =
    unsafe extern "C" fn(block: *mut BlockLiteral, args: *const *mut u8, ret: *mut u8);

/// Copy helper: `dst` is the new heap block, `src` the original.
pub type BlockCopyHelper = unsafe extern "C" fn(dst: *mut BlockLiteral, src: *const BlockLiteral);

/// Dispose helper, run before a heap block is freed.
pub type BlockDisposeHelper = unsafe extern "C" fn(block: *mut BlockLiteral);

/// Block descriptor.
///
/// The helper fields are only read when [`BLOCK_HAS_COPY_DISPOSE`] is set,
/// the signature only with [`BLOCK_HAS_SIGNATURE`].
#[repr(C)]
#[derive(Debug)]
pub struct BlockDescriptor {
    /// Always zero.
    pub reserved: usize,
    /// Size of the whole block, captures included.
    pub size: usize,
    /// Copy helper.
    pub copy_helper: Option<BlockCopyHelper>,
    /// Dispose helper.
    pub dispose_helper: Option<BlockDisposeHelper>,
    /// NUL-terminated type encoding, e.g. `v@?i`.
    pub signature: *const c_char,
}

// SAFETY: descriptors are immutable and usually 'static
unsafe impl Send for BlockDescriptor {}
unsafe impl Sync for BlockDescriptor {}

/// Block header.
#[repr(C)]
#[derive(Debug)]
pub struct BlockLiteral {
    /// One of the block class markers.
    pub isa: *const u8,
    /// Flag bits and reference count.
    pub flags: AtomicI32,
    /// Unused.
    pub reserved: i32,
    /// Entry point.
    pub invoke: BlockInvoke,
    /// Size, helpers and signature.
    pub descriptor: *const BlockDescriptor,
}

static STACK_BLOCK: u8 = 0;
static MALLOC_BLOCK: u8 = 0;
static GLOBAL_BLOCK: u8 = 0;

/// `isa` for blocks on the stack.
#[must_use]
pub fn stack_block_isa() -> *const u8 {
    &raw const STACK_BLOCK
}

/// `isa` for heap blocks.
#[must_use]
pub fn malloc_block_isa() -> *const u8 {
    &raw const MALLOC_BLOCK
}

/// `isa` for global blocks.
#[must_use]
pub fn global_block_isa() -> *const u8 {
    &raw const GLOBAL_BLOCK
}

impl BlockLiteral {
    /// Builds a stack block header.
    #[must_use]
    pub fn new(flags: i32, invoke: BlockInvoke, descriptor: *const BlockDescriptor) -> Self {
        BlockLiteral {
            isa: stack_block_isa(),
            flags: AtomicI32::new(flags & !(BLOCK_NEEDS_FREE | BLOCK_REFCOUNT_MASK)),
            reserved: 0,
            invoke,
            descriptor,
        }
    }

    fn flags(&self) -> i32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Returns `true` for heap blocks.
    #[must_use]
    pub fn is_heap(&self) -> bool {
        self.flags() & BLOCK_NEEDS_FREE != 0
    }

    /// Logical reference count of a heap block (zero for others).
    #[must_use]
    pub fn ref_count(&self) -> i32 {
        (self.flags() & BLOCK_REFCOUNT_MASK) >> 1
    }
}

/// Returns the signature of a block, if it carries one.
///
/// # Safety
///
/// `block` must be null or a valid block.
#[must_use]
pub unsafe fn block_signature<'a>(block: *const BlockLiteral) -> Option<&'a str> {
    if block.is_null() {
        return None;
    }
    // SAFETY: caller guarantees a valid block
    let literal = unsafe { &*block };
    if literal.flags() & BLOCK_HAS_SIGNATURE == 0 || literal.descriptor.is_null() {
        return None;
    }
    // SAFETY: HAS_SIGNATURE promises a valid descriptor
    let signature = unsafe { (*literal.descriptor).signature };
    if signature.is_null() {
        return None;
    }
    // SAFETY: signature is NUL-terminated and lives as long as the descriptor
    unsafe { CStr::from_ptr(signature) }.to_str().ok()
}

/// Calls a block.
///
/// # Safety
///
/// `args` and `ret` must match the block's signature.
pub unsafe fn invoke_block(block: *mut BlockLiteral, args: *const *mut u8, ret: *mut u8) {
    if block.is_null() {
        return;
    }
    // SAFETY: caller guarantees a valid block and matching buffers
    unsafe { ((*block).invoke)(block, args, ret) };
}

/// Copies a block to the heap, or retains it if it already lives there.
///
/// Global blocks are returned unchanged.
///
/// # Safety
///
/// `block` must be null or a valid block whose descriptor size covers the
/// whole literal.
pub unsafe fn block_copy(block: *const BlockLiteral) -> *mut BlockLiteral {
    if block.is_null() {
        return std::ptr::null_mut();
    }
    // SAFETY: caller guarantees a valid block
    let literal = unsafe { &*block };
    let flags = literal.flags();

    if flags & BLOCK_IS_GLOBAL != 0 {
        return block.cast_mut();
    }
    if flags & BLOCK_NEEDS_FREE != 0 {
        let _ = literal
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                if f & BLOCK_REFCOUNT_MASK == BLOCK_REFCOUNT_MASK {
                    None
                } else {
                    Some(f + 2)
                }
            });
        return block.cast_mut();
    }

    // SAFETY: non-global blocks always carry a descriptor
    let descriptor = unsafe { &*literal.descriptor };
    let size = descriptor.size.max(std::mem::size_of::<BlockLiteral>());
    let Ok(layout) = Layout::from_size_align(size, 16) else {
        return std::ptr::null_mut();
    };
    // SAFETY: non-zero size
    let dst = unsafe { std::alloc::alloc(layout) }.cast::<BlockLiteral>();
    if dst.is_null() {
        std::alloc::handle_alloc_error(layout);
    }
    // SAFETY: dst is fresh and at least `size` bytes; block spans `size`
    unsafe {
        std::ptr::copy_nonoverlapping(block.cast::<u8>(), dst.cast::<u8>(), descriptor.size);
        (*dst).isa = malloc_block_isa();
        (*dst).flags.store(
            (flags & !BLOCK_REFCOUNT_MASK) | BLOCK_NEEDS_FREE | 2,
            Ordering::Release,
        );
    }
    if flags & BLOCK_HAS_COPY_DISPOSE != 0 {
        if let Some(copy) = descriptor.copy_helper {
            // SAFETY: both blocks are valid and share a layout
            unsafe { copy(dst, block) };
        }
    }
    dst
}

/// Drops one reference to a heap block, freeing it on the last one.
///
/// Stack and global blocks are ignored.
///
/// # Safety
///
/// `block` must be null or a valid block; a heap block must not be used
/// after its last release.
pub unsafe fn block_release(block: *mut BlockLiteral) {
    if block.is_null() {
        return;
    }
    // SAFETY: caller guarantees a valid block
    let literal = unsafe { &*block };
    let flags = literal.flags();
    if flags & BLOCK_IS_GLOBAL != 0 || flags & BLOCK_NEEDS_FREE == 0 {
        return;
    }

    let previous = literal.flags.fetch_sub(2, Ordering::AcqRel);
    if previous & BLOCK_REFCOUNT_MASK != 2 {
        return;
    }

    // SAFETY: heap blocks always carry a descriptor
    let descriptor = unsafe { &*literal.descriptor };
    if previous & BLOCK_HAS_COPY_DISPOSE != 0 {
        if let Some(dispose) = descriptor.dispose_helper {
            // SAFETY: last reference; captures are still intact
            unsafe { dispose(block) };
        }
    }
    let size = descriptor.size.max(std::mem::size_of::<BlockLiteral>());
    if let Ok(layout) = Layout::from_size_align(size, 16) {
        // SAFETY: allocated by block_copy with this layout
        unsafe { std::alloc::dealloc(block.cast(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[repr(C)]
    struct AddBlock {
        literal: BlockLiteral,
        offset: i32,
    }

    static COPIES: AtomicUsize = AtomicUsize::new(0);
    static DISPOSALS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn add_invoke(block: *mut BlockLiteral, args: *const *mut u8, ret: *mut u8) {
        unsafe {
            let block = &*block.cast::<AddBlock>();
            let x = (*args).cast::<i32>().read();
            ret.cast::<i32>().write(x + block.offset);
        }
    }

    unsafe extern "C" fn add_copy(_: *mut BlockLiteral, _: *const BlockLiteral) {
        COPIES.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn add_dispose(_: *mut BlockLiteral) {
        DISPOSALS.fetch_add(1, Ordering::SeqCst);
    }

    static SIGNATURE: &[u8] = b"i@?i\0";

    static DESCRIPTOR: BlockDescriptor = BlockDescriptor {
        reserved: 0,
        size: std::mem::size_of::<AddBlock>(),
        copy_helper: Some(add_copy),
        dispose_helper: Some(add_dispose),
        signature: SIGNATURE.as_ptr().cast(),
    };

    fn stack_block(offset: i32) -> AddBlock {
        AddBlock {
            literal: BlockLiteral::new(
                BLOCK_HAS_COPY_DISPOSE | BLOCK_HAS_SIGNATURE,
                add_invoke,
                &raw const DESCRIPTOR,
            ),
            offset,
        }
    }

    #[test]
    fn test_invoke_and_signature() {
        let mut block = stack_block(5);
        let ptr = (&raw mut block).cast::<BlockLiteral>();
        let mut x = 10i32;
        let args = [(&raw mut x).cast::<u8>()];
        let mut ret = 0i32;
        unsafe { invoke_block(ptr, args.as_ptr(), (&raw mut ret).cast()) };
        assert_eq!(ret, 15);
        assert_eq!(unsafe { block_signature(ptr) }, Some("i@?i"));
    }

    #[test]
    fn test_copy_release_runs_helpers() {
        let copies = COPIES.load(Ordering::SeqCst);
        let disposals = DISPOSALS.load(Ordering::SeqCst);

        let block = stack_block(1);
        let heap = unsafe { block_copy((&raw const block).cast()) };
        assert!(unsafe { &*heap }.is_heap());
        assert_eq!(unsafe { &*heap }.ref_count(), 1);
        assert_eq!(COPIES.load(Ordering::SeqCst), copies + 1);

        let again = unsafe { block_copy(heap) };
        assert_eq!(again, heap);
        assert_eq!(unsafe { &*heap }.ref_count(), 2);

        unsafe { block_release(heap) };
        assert_eq!(DISPOSALS.load(Ordering::SeqCst), disposals);
        unsafe { block_release(heap) };
        assert_eq!(DISPOSALS.load(Ordering::SeqCst), disposals + 1);
    }

    #[test]
    fn test_global_blocks_are_untouched() {
        let mut block = stack_block(0);
        block.literal.isa = global_block_isa();
        block.literal.flags.store(BLOCK_IS_GLOBAL, Ordering::SeqCst);
        let ptr = (&raw mut block).cast::<BlockLiteral>();
        assert_eq!(unsafe { block_copy(ptr) }, ptr);
        unsafe { block_release(ptr) };
        assert!(!block.literal.is_heap());
    }
}
