//! Copy-on-write publication array.
//!
//! A single-writer, multi-reader dynamic array. Readers always see the
//! last committed snapshot; the writer accumulates edits either in
//! place past the committed count (appends) or in a shadow transaction
//! buffer (removals, growth that cannot happen in place), and makes
//! them visible with one [`commit`](Array::commit).
//!
//! Buffers displaced by a commit are released through the allocator
//! with `defer = true`: a reader that captured the old buffer may still
//! be iterating it, so the allocator must hold the release until the
//! caller's reclamation period has passed (see
//! [`DeferredAllocator`](crate::malloc::DeferredAllocator)).
//!
//! In-place growth of the published buffer uses
//! `realloc(.., may_move = false)`: readers hold the buffer pointer, so
//! a moving resize is never acceptable for `active`.

use core::cell::Cell;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::malloc::{Allocator, GlobalAllocator};

/// Buffer header; the value slots follow inline.
#[repr(C)]
struct Header {
    n_committed: AtomicUsize,
    capacity: usize,
}

#[inline]
const fn values_offset<T>() -> usize {
    let header = size_of::<Header>();
    let align = align_of::<T>();
    (header + align - 1) / align * align
}

#[inline]
const fn buffer_bytes<T>(capacity: usize) -> usize {
    values_offset::<T>() + capacity * size_of::<T>()
}

#[inline]
unsafe fn values_ptr<T>(buffer: *mut Header) -> *mut T {
    (buffer as *mut u8).add(values_offset::<T>()) as *mut T
}

/// Single-writer, multi-reader copy-on-write array.
///
/// `T` is expected to be a small copyable value, typically a pointer,
/// compared by equality for [`put_unique`](Array::put_unique) and
/// [`remove`](Array::remove).
pub struct Array<T, A: Allocator = GlobalAllocator> {
    active: AtomicPtr<Header>,
    transaction: Cell<*mut Header>,
    n_entries: Cell<usize>,
    allocator: A,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send, A: Allocator + Send> Send for Array<T, A> {}
unsafe impl<T: Send, A: Allocator + Sync> Sync for Array<T, A> {}

impl<T: Copy + PartialEq> Array<T> {
    /// Create an array with the global allocator.
    pub fn new(capacity: usize) -> Option<Self> {
        Self::with_allocator(GlobalAllocator, capacity)
    }
}

impl<T: Copy + PartialEq, A: Allocator> Array<T, A> {
    /// Create an array with `capacity` committed-zero slots.
    pub fn with_allocator(allocator: A, capacity: usize) -> Option<Self> {
        let capacity = capacity.max(1);
        let buffer = alloc_buffer::<T, A>(&allocator, capacity)?;
        Some(Self {
            active: AtomicPtr::new(buffer.as_ptr()),
            transaction: Cell::new(ptr::null_mut()),
            n_entries: Cell::new(0),
            allocator,
            _marker: PhantomData,
        })
    }

    /// Number of committed entries, as seen by a reader.
    ///
    /// Wait-free; callable from any thread.
    pub fn length(&self) -> usize {
        let active = self.active.load(Ordering::Acquire);
        crate::pr::fence_load();
        // SAFETY: active is always a live buffer.
        unsafe { (*active).n_committed.load(Ordering::Acquire) }
    }

    /// The current committed snapshot as a raw slice.
    ///
    /// The pointed-to buffer stays valid only as long as the caller's
    /// reclamation contract keeps displaced buffers alive across its
    /// read.
    pub fn buffer(&self) -> (*const T, usize) {
        let active = self.active.load(Ordering::Acquire);
        crate::pr::fence_load();
        unsafe {
            let n = (*active).n_committed.load(Ordering::Acquire);
            (values_ptr::<T>(active) as *const T, n)
        }
    }

    /// Iterate the committed snapshot captured at call time. Commits
    /// that land mid-iteration publish a different buffer and are not
    /// observed.
    pub fn iter(&self) -> Iter<'_, T> {
        let (values, len) = self.buffer();
        Iter {
            values,
            len,
            index: 0,
            _marker: PhantomData,
        }
    }

    /// Total entries in the working set, including uncommitted edits.
    /// Writer-side bookkeeping; not meaningful to readers.
    pub fn entries(&self) -> usize {
        self.n_entries.get()
    }

    /// Append `value` to the working set. Invisible until commit.
    ///
    /// Returns false when an allocation was needed and failed; the
    /// working set is unchanged in that case.
    ///
    /// # Safety
    ///
    /// Single writer: no other mutating call may run concurrently.
    pub unsafe fn put(&self, value: T) -> bool {
        let n = self.n_entries.get();
        let transaction = self.transaction.get();

        let target = if transaction.is_null() {
            let active = self.active.load(Ordering::Relaxed);
            if n == (*active).capacity {
                match self.grow_active(active, n) {
                    Some(target) => target,
                    None => return false,
                }
            } else {
                active
            }
        } else {
            if n == (*transaction).capacity {
                match self.grow_transaction(transaction, n) {
                    Some(t) => t,
                    None => return false,
                }
            } else {
                transaction
            }
        };

        values_ptr::<T>(target).add(n).write(value);
        self.n_entries.set(n + 1);
        true
    }

    /// Append `value` unless it is already present in the working set.
    ///
    /// Returns 0 on append, 1 if present, −1 on allocation failure.
    ///
    /// # Safety
    ///
    /// Single writer.
    pub unsafe fn put_unique(&self, value: T) -> i32 {
        let transaction = self.transaction.get();
        let scan = if transaction.is_null() {
            self.active.load(Ordering::Relaxed)
        } else {
            transaction
        };

        let values = values_ptr::<T>(scan);
        for i in 0..self.n_entries.get() {
            if *values.add(i) == value {
                return 1;
            }
        }

        if self.put(value) {
            0
        } else {
            -1
        }
    }

    /// Remove `value` from the working set by swapping the last entry
    /// into its slot; ordering is not preserved. Returns false when the
    /// value is absent or a needed allocation failed.
    ///
    /// # Safety
    ///
    /// Single writer.
    pub unsafe fn remove(&self, value: T) -> bool {
        let n = self.n_entries.get();
        let transaction = self.transaction.get();

        if !transaction.is_null() {
            let values = values_ptr::<T>(transaction);
            for i in 0..n {
                if *values.add(i) == value {
                    values.add(i).write(*values.add(n - 1));
                    self.n_entries.set(n - 1);
                    return true;
                }
            }
            return false;
        }

        let active = self.active.load(Ordering::Relaxed);
        let values = values_ptr::<T>(active);
        let committed = (*active).n_committed.load(Ordering::Relaxed);

        for i in 0..n {
            if *values.add(i) != value {
                continue;
            }

            if i >= committed {
                // Still invisible to readers; unpublish in place.
                values.add(i).write(*values.add(n - 1));
                self.n_entries.set(n - 1);
                return true;
            }

            // Committed entry: edits must go through a shadow copy.
            let shadow = match alloc_buffer::<T, A>(&self.allocator, (*active).capacity) {
                Some(s) => s.as_ptr(),
                None => return false,
            };
            let shadow_values = values_ptr::<T>(shadow);
            ptr::copy_nonoverlapping(values as *const T, shadow_values, n);
            shadow_values.add(i).write(*shadow_values.add(n - 1));
            self.transaction.set(shadow);
            self.n_entries.set(n - 1);
            return true;
        }

        false
    }

    /// Publish the working set to readers.
    ///
    /// With no pending transaction this only advances the committed
    /// count of the already-published buffer. Otherwise the transaction
    /// buffer becomes `active` and the old buffer is released through
    /// the allocator with `defer = true`.
    ///
    /// # Safety
    ///
    /// Single writer. The allocator's deferred path must keep displaced
    /// buffers alive until no reader can hold them.
    pub unsafe fn commit(&self) -> bool {
        let n = self.n_entries.get();
        let transaction = self.transaction.get();

        if transaction.is_null() {
            let active = self.active.load(Ordering::Relaxed);
            crate::pr::fence_store();
            (*active).n_committed.store(n, Ordering::Release);
            return true;
        }

        (*transaction).n_committed.store(n, Ordering::Relaxed);
        crate::pr::fence_store();

        let previous = self.active.swap(transaction, Ordering::AcqRel);
        self.transaction.set(ptr::null_mut());

        let bytes = buffer_bytes::<T>((*previous).capacity);
        self.allocator.free(
            NonNull::new_unchecked(previous as *mut u8),
            bytes,
            true,
        );
        true
    }

    /// Release the array's buffers. With `defer` set the releases go
    /// through the allocator's deferred path.
    ///
    /// # Safety
    ///
    /// Single writer; no reader may touch the array afterwards.
    pub unsafe fn deinit(&self, defer: bool) {
        let active = self.active.swap(ptr::null_mut(), Ordering::AcqRel);
        if !active.is_null() {
            let bytes = buffer_bytes::<T>((*active).capacity);
            self.allocator
                .free(NonNull::new_unchecked(active as *mut u8), bytes, defer);
        }

        let transaction = self.transaction.replace(ptr::null_mut());
        if !transaction.is_null() {
            let bytes = buffer_bytes::<T>((*transaction).capacity);
            self.allocator
                .free(NonNull::new_unchecked(transaction as *mut u8), bytes, defer);
        }
    }

    /// Grow the published buffer in place, or fall back to cloning into
    /// a transaction of doubled capacity. Returns the buffer to append
    /// into.
    unsafe fn grow_active(&self, active: *mut Header, n: usize) -> Option<*mut Header> {
        let capacity = (*active).capacity;
        let grown = capacity * 2;

        // Readers hold this pointer: the resize must not move it.
        let resized = self.allocator.realloc(
            NonNull::new_unchecked(active as *mut u8),
            buffer_bytes::<T>(capacity),
            buffer_bytes::<T>(grown),
            false,
        );
        if resized.is_some() {
            (*active).capacity = grown;
            return Some(active);
        }

        let shadow = alloc_buffer::<T, A>(&self.allocator, grown)?.as_ptr();
        ptr::copy_nonoverlapping(
            values_ptr::<T>(active) as *const T,
            values_ptr::<T>(shadow),
            n,
        );
        self.transaction.set(shadow);
        Some(shadow)
    }

    /// Grow the unpublished transaction buffer; moving is fine here.
    unsafe fn grow_transaction(&self, transaction: *mut Header, _n: usize) -> Option<*mut Header> {
        let capacity = (*transaction).capacity;
        let grown = capacity * 2;

        let resized = self.allocator.realloc(
            NonNull::new_unchecked(transaction as *mut u8),
            buffer_bytes::<T>(capacity),
            buffer_bytes::<T>(grown),
            true,
        )?;

        let moved = resized.as_ptr() as *mut Header;
        (*moved).capacity = grown;
        self.transaction.set(moved);
        Some(moved)
    }
}

fn alloc_buffer<T, A: Allocator>(allocator: &A, capacity: usize) -> Option<NonNull<Header>> {
    let raw = allocator.malloc(buffer_bytes::<T>(capacity))?;
    let header = raw.as_ptr() as *mut Header;
    // SAFETY: freshly allocated, properly sized.
    unsafe {
        header.write(Header {
            n_committed: AtomicUsize::new(0),
            capacity,
        });
        Some(NonNull::new_unchecked(header))
    }
}

impl<T, A: Allocator> Drop for Array<T, A> {
    fn drop(&mut self) {
        let active = self.active.load(Ordering::Relaxed);
        if !active.is_null() {
            // SAFETY: exclusive access in drop; buffers came from the
            // allocator.
            unsafe {
                let bytes = buffer_bytes::<T>((*active).capacity);
                self.allocator
                    .free(NonNull::new_unchecked(active as *mut u8), bytes, false);
            }
        }

        let transaction = self.transaction.get();
        if !transaction.is_null() {
            unsafe {
                let bytes = buffer_bytes::<T>((*transaction).capacity);
                self.allocator
                    .free(NonNull::new_unchecked(transaction as *mut u8), bytes, false);
            }
        }
    }
}

/// Snapshot iterator over the committed entries.
pub struct Iter<'a, T> {
    values: *const T,
    len: usize,
    index: usize,
    _marker: PhantomData<&'a T>,
}

impl<'a, T: Copy> Iterator for Iter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.index >= self.len {
            return None;
        }
        // SAFETY: index < committed count of the captured buffer.
        let value = unsafe { *self.values.add(self.index) };
        self.index += 1;
        Some(value)
    }
}
