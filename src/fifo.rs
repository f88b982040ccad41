//! Michael–Scott FIFO queues.
//!
//! Both queues keep a perpetual stub node so `head` and `tail` are never
//! null; the queue is empty exactly when `head.next` is null. Dequeue
//! rotates the stub: the displaced head node becomes garbage owned by
//! the caller, and the node that carried the dequeued value becomes the
//! new stub.
//!
//! - [`SpscFifo`]: wait-free single-producer/single-consumer queue with
//!   a producer-side recycle path for displaced stubs.
//! - [`MpmcFifo`]: the full multi-producer/multi-consumer algorithm,
//!   with per-pointer generation counters travelling under double-width
//!   CAS to defeat ABA. Only available on targets with
//!   [`crate::pr::HAS_WIDE_CAS`].

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A node in the SPSC FIFO. One node is permanently resident as the
/// stub; its value slot is empty.
#[repr(C)]
pub struct FifoEntry<T> {
    next: AtomicPtr<FifoEntry<T>>,
    value: UnsafeCell<Option<T>>,
}

impl<T> FifoEntry<T> {
    /// Create a detached entry with an empty value slot.
    pub fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(None),
        }
    }
}

impl<T> Default for FifoEntry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-producer, single-consumer FIFO.
///
/// The producer owns `tail` and the recycle cursor; the consumer owns
/// `head`. Enqueue and dequeue are both wait-free.
pub struct SpscFifo<T> {
    head: AtomicPtr<FifoEntry<T>>,
    garbage: UnsafeCell<*mut FifoEntry<T>>,
    tail: AtomicPtr<FifoEntry<T>>,
}

impl<T> SpscFifo<T> {
    /// Create a queue around a caller-supplied stub node.
    ///
    /// # Safety
    ///
    /// `stub` must be valid, detached, and must outlive the queue; it is
    /// only returned to the caller through [`recycle`](Self::recycle) or
    /// after the queue is abandoned.
    pub unsafe fn new(stub: *mut FifoEntry<T>) -> Self {
        (*stub).next.store(ptr::null_mut(), Ordering::Relaxed);
        Self {
            head: AtomicPtr::new(stub),
            garbage: UnsafeCell::new(stub),
            tail: AtomicPtr::new(stub),
        }
    }

    /// Whether the queue is empty. Stable only from the consumer side.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        // SAFETY: head always points at the resident stub.
        unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }

    /// Enqueue `value` carried by `entry`. Producer only.
    ///
    /// # Safety
    ///
    /// Must be called from the single producer thread; `entry` must be
    /// valid and detached (freshly allocated or recycled).
    pub unsafe fn enqueue(&self, entry: *mut FifoEntry<T>, value: T) {
        *(*entry).value.get() = Some(value);
        (*entry).next.store(ptr::null_mut(), Ordering::Relaxed);
        crate::pr::fence_store();

        let tail = self.tail.load(Ordering::Relaxed);
        (*tail).next.store(entry, Ordering::Release);
        self.tail.store(entry, Ordering::Release);
    }

    /// Dequeue the oldest value, or `None` when empty. Consumer only.
    ///
    /// # Safety
    ///
    /// Must be called from the single consumer thread.
    pub unsafe fn dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let entry = (*head).next.load(Ordering::Acquire);
        if entry.is_null() {
            return None;
        }
        crate::pr::fence_load();

        let value = (*(*entry).value.get()).take();
        self.head.store(entry, Ordering::Release);
        value
    }

    /// Return a displaced stub for reuse, or `None` if none are free.
    /// Producer only.
    ///
    /// Dequeued-past nodes stay chained between the recycle cursor and
    /// the current head; this hands them back one at a time.
    ///
    /// # Safety
    ///
    /// Must be called from the single producer thread.
    pub unsafe fn recycle(&self) -> Option<*mut FifoEntry<T>> {
        let garbage = *self.garbage.get();
        if garbage == self.head.load(Ordering::Acquire) {
            return None;
        }

        *self.garbage.get() = (*garbage).next.load(Ordering::Relaxed);
        Some(garbage)
    }
}

unsafe impl<T: Send> Send for SpscFifo<T> {}
unsafe impl<T: Send> Sync for SpscFifo<T> {}

// ============================================================================
// MPMC variant
// ============================================================================

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use mpmc::{MpmcFifo, MpmcFifoEntry};

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
mod mpmc {
    use crate::pr::wide::AtomicPair;
    use core::cell::UnsafeCell;
    use core::marker::PhantomData;

    /// A node in the MPMC FIFO. The `next` link carries its own
    /// generation so helper CASes on stale snapshots fail.
    #[repr(C)]
    pub struct MpmcFifoEntry<T> {
        next: AtomicPair,
        value: UnsafeCell<Option<T>>,
    }

    impl<T> MpmcFifoEntry<T> {
        /// Create a detached entry with an empty value slot.
        pub fn new() -> Self {
            Self {
                next: AtomicPair::new(0, 0),
                value: UnsafeCell::new(None),
            }
        }
    }

    impl<T> Default for MpmcFifoEntry<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Multi-producer, multi-consumer FIFO.
    ///
    /// Head and tail are `(pointer, generation)` pairs updated by
    /// double-width CAS; generations advance on every swing so a
    /// recycled node cannot satisfy a stale comparison.
    pub struct MpmcFifo<T> {
        head: AtomicPair,
        tail: AtomicPair,
        _marker: PhantomData<*mut MpmcFifoEntry<T>>,
    }

    impl<T> MpmcFifo<T> {
        /// Create a queue around a caller-supplied stub node.
        ///
        /// # Safety
        ///
        /// `stub` must be valid and detached. Nodes handed back through
        /// the garbage out-parameter of [`dequeue`](Self::dequeue) must
        /// survive until safe memory reclamation has run.
        pub unsafe fn new(stub: *mut MpmcFifoEntry<T>) -> Self {
            (*stub).next.store(0, 0);
            Self {
                head: AtomicPair::new(stub as u64, 0),
                tail: AtomicPair::new(stub as u64, 0),
                _marker: PhantomData,
            }
        }

        /// Whether the queue is momentarily empty.
        #[inline]
        pub fn is_empty(&self) -> bool {
            let (head, _) = self.head.load();
            // SAFETY: head always points at a resident node.
            unsafe { (*(head as *mut MpmcFifoEntry<T>)).next.load().0 == 0 }
        }

        /// Enqueue `value` carried by `entry`.
        ///
        /// # Safety
        ///
        /// `entry` must be valid and detached (freshly allocated,
        /// recycled garbage, or otherwise out of any queue).
        pub unsafe fn enqueue(&self, entry: *mut MpmcFifoEntry<T>, value: T) {
            *(*entry).value.get() = Some(value);
            (*entry).next.store(0, 0);
            crate::pr::fence_store();

            loop {
                let tail = self.tail.load();
                let tail_ptr = tail.0 as *mut MpmcFifoEntry<T>;
                let next = (*tail_ptr).next.load();

                if self.tail.load() != tail {
                    continue;
                }

                if next.0 != 0 {
                    // Tail is lagging; help it along.
                    let _ = self.tail.cas(tail, (next.0, tail.1.wrapping_add(1)));
                    continue;
                }

                if (*tail_ptr)
                    .next
                    .cas(next, (entry as u64, next.1.wrapping_add(1)))
                {
                    let _ = self.tail.cas(tail, (entry as u64, tail.1.wrapping_add(1)));
                    return;
                }

                crate::pr::stall();
            }
        }

        /// One-shot enqueue. Returns false if the linking CAS loses.
        ///
        /// # Safety
        ///
        /// As for [`enqueue`](Self::enqueue).
        pub unsafe fn try_enqueue(&self, entry: *mut MpmcFifoEntry<T>, value: T) -> bool {
            *(*entry).value.get() = Some(value);
            (*entry).next.store(0, 0);
            crate::pr::fence_store();

            let tail = self.tail.load();
            let tail_ptr = tail.0 as *mut MpmcFifoEntry<T>;
            let next = (*tail_ptr).next.load();

            if self.tail.load() != tail || next.0 != 0 {
                return false;
            }

            if (*tail_ptr)
                .next
                .cas(next, (entry as u64, next.1.wrapping_add(1)))
            {
                let _ = self.tail.cas(tail, (entry as u64, tail.1.wrapping_add(1)));
                true
            } else {
                false
            }
        }

        /// Dequeue the oldest value. The displaced head node is written
        /// to `garbage`; the caller owns its reclamation (after SMR).
        ///
        /// # Safety
        ///
        /// `garbage` receives a node other threads may still be
        /// reading; it must not be freed or reused until reclamation is
        /// safe.
        pub unsafe fn dequeue(&self, garbage: &mut *mut MpmcFifoEntry<T>) -> Option<T> {
            loop {
                let head = self.head.load();
                let tail = self.tail.load();
                let head_ptr = head.0 as *mut MpmcFifoEntry<T>;
                let next = (*head_ptr).next.load();

                if self.head.load() != head {
                    continue;
                }

                let next_ptr = next.0 as *mut MpmcFifoEntry<T>;
                if next_ptr.is_null() {
                    return None;
                }

                if head.0 == tail.0 {
                    // Tail still points at the stub; help before
                    // consuming past it.
                    let _ = self.tail.cas(tail, (next.0, tail.1.wrapping_add(1)));
                    continue;
                }

                if self.head.cas(head, (next.0, head.1.wrapping_add(1))) {
                    crate::pr::fence_load();
                    let value = (*(*next_ptr).value.get()).take();
                    *garbage = head_ptr;
                    return value;
                }

                crate::pr::stall();
            }
        }

        /// One-shot dequeue. Returns `None` on emptiness or contention.
        ///
        /// # Safety
        ///
        /// As for [`dequeue`](Self::dequeue).
        pub unsafe fn try_dequeue(&self, garbage: &mut *mut MpmcFifoEntry<T>) -> Option<T> {
            let head = self.head.load();
            let tail = self.tail.load();
            let head_ptr = head.0 as *mut MpmcFifoEntry<T>;
            let next = (*head_ptr).next.load();

            if self.head.load() != head {
                return None;
            }

            let next_ptr = next.0 as *mut MpmcFifoEntry<T>;
            if next_ptr.is_null() {
                return None;
            }

            if head.0 == tail.0 {
                let _ = self.tail.cas(tail, (next.0, tail.1.wrapping_add(1)));
                return None;
            }

            if self.head.cas(head, (next.0, head.1.wrapping_add(1))) {
                crate::pr::fence_load();
                let value = (*(*next_ptr).value.get()).take();
                *garbage = head_ptr;
                value
            } else {
                None
            }
        }
    }

    unsafe impl<T: Send> Send for MpmcFifo<T> {}
    unsafe impl<T: Send> Sync for MpmcFifo<T> {}
}
