//! Memory allocator abstraction.
//!
//! Containers that own buffers (the copy-on-write array in particular)
//! allocate through the [`Allocator`] trait rather than a concrete
//! allocator. The interface differs from the standard library's in three
//! ways that concurrent structures need:
//!
//! - **Sized delete**: `free` receives the allocation size, so sized-
//!   delete allocators skip their size lookup. Allocators that do not
//!   exploit it may ignore it, but the caller must still pass the exact
//!   original request.
//! - **In-place reallocation**: `realloc` takes `may_move`; when false
//!   the allocator must resize in place or fail with the original block
//!   left intact. Structures that publish interior pointers rely on
//!   this.
//! - **Deferred release**: `free` takes `defer`. A deferred release may
//!   be delayed (batched behind safe memory reclamation, for example)
//!   but must complete no later than the allocator's next flush.
//!   [`DeferredAllocator`] is the reference implementation of that
//!   contract.

use alloc::alloc::{alloc, dealloc, realloc as raw_realloc, Layout};
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;

/// A memory allocator for concurrent data structures.
///
/// # Safety
///
/// Implementations must return memory aligned for any primitive type,
/// preserve contents up to `min(old_size, new_size)` across `realloc`,
/// and only release memory they themselves handed out.
pub trait Allocator {
    /// Allocate `size` bytes. Returns `None` on exhaustion.
    fn malloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Resize an existing block.
    ///
    /// When `may_move` is false the allocator must resize in place or
    /// return `None`; in the failure case the original block remains
    /// valid and untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator and `old_size` must be the
    /// size it was last allocated or resized to.
    fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        may_move: bool,
    ) -> Option<NonNull<u8>>;

    /// Release a block.
    ///
    /// With `defer` set the release may be delayed but must complete no
    /// later than the allocator's next flush; with `defer` unset the
    /// memory is returned immediately.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator, `size` must match the
    /// original request, and the block must not be touched afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, defer: bool);
}

/// [`Allocator`] over the Rust global allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalAllocator;

const ALIGN: usize = core::mem::align_of::<usize>() * 2;

#[inline]
fn layout_for(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, ALIGN).ok()
}

impl Allocator for GlobalAllocator {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return NonNull::new(ALIGN as *mut u8);
        }

        let layout = layout_for(size)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr)
    }

    fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        may_move: bool,
    ) -> Option<NonNull<u8>> {
        if old_size == 0 {
            return self.malloc(new_size);
        }
        if new_size == 0 {
            // SAFETY: ptr was allocated by us at old_size.
            unsafe { self.free(ptr, old_size, false) };
            return NonNull::new(ALIGN as *mut u8);
        }

        if !may_move {
            // The global allocator offers no grow-in-place entry point;
            // shrinks keep the block, grows must fail with the block
            // intact.
            return if new_size <= old_size { Some(ptr) } else { None };
        }

        let old_layout = layout_for(old_size)?;
        // SAFETY: ptr was allocated with old_layout, new_size is non-zero.
        let new_ptr = unsafe { raw_realloc(ptr.as_ptr(), old_layout, new_size) };
        NonNull::new(new_ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, _defer: bool) {
        if size == 0 {
            return;
        }

        if let Some(layout) = layout_for(size) {
            dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// An allocator wrapper that batches deferred releases.
///
/// `free(.., defer = true)` parks the block on a pending list instead of
/// releasing it; [`flush`](DeferredAllocator::flush) (or drop) releases
/// everything pending. Callers running safe memory reclamation flush
/// once their grace period has elapsed.
///
/// Not `Sync`: the pending list belongs to the single owner driving
/// reclamation.
pub struct DeferredAllocator<A: Allocator = GlobalAllocator> {
    inner: A,
    pending: UnsafeCell<Vec<(NonNull<u8>, usize)>>,
}

impl Default for DeferredAllocator<GlobalAllocator> {
    fn default() -> Self {
        Self::new(GlobalAllocator)
    }
}

impl<A: Allocator> DeferredAllocator<A> {
    /// Wrap `inner` with an empty pending list.
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            pending: UnsafeCell::new(Vec::new()),
        }
    }

    /// Number of blocks awaiting release.
    pub fn pending(&self) -> usize {
        // SAFETY: !Sync, sole owner.
        unsafe { (*self.pending.get()).len() }
    }

    /// Release every deferred block immediately.
    pub fn flush(&self) {
        // SAFETY: !Sync, sole owner; entries were handed to free().
        unsafe {
            let pending = &mut *self.pending.get();
            for (ptr, size) in pending.drain(..) {
                self.inner.free(ptr, size, false);
            }
        }
    }
}

impl<A: Allocator> Allocator for DeferredAllocator<A> {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.inner.malloc(size)
    }

    fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        may_move: bool,
    ) -> Option<NonNull<u8>> {
        self.inner.realloc(ptr, old_size, new_size, may_move)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, defer: bool) {
        if defer {
            (*self.pending.get()).push((ptr, size));
        } else {
            self.inner.free(ptr, size, false);
        }
    }
}

impl<A: Allocator> Drop for DeferredAllocator<A> {
    fn drop(&mut self) {
        self.flush();
    }
}
