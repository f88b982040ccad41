//! Hazard-pointer protected FIFO.
//!
//! The Michael–Scott queue with its classical reclamation scheme: each
//! dequeue protects both the head and its successor before touching
//! either, and the displaced head node is retired into an embedded
//! [`hp::Domain`](crate::hp::Domain) rather than handed to the caller.
//!
//! This is the multi-producer/multi-consumer queue to reach for when no
//! external reclamation regime exists; [`crate::fifo::MpmcFifo`] is the
//! variant for callers who manage node lifetime themselves.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::hp::{Domain, RecordRef};

/// Pending retirements per thread before a scan is forced.
const RECLAIM_THRESHOLD: usize = 64;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: UnsafeCell<Option<T>>,
}

impl<T> Node<T> {
    fn new(value: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(value),
        }))
    }
}

unsafe fn drop_node<T>(p: *mut (), _ctx: *mut ()) {
    drop(Box::from_raw(p as *mut Node<T>));
}

/// A lock-free FIFO with built-in safe memory reclamation.
pub struct HpFifo<T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    domain: Domain,
}

unsafe impl<T: Send> Send for HpFifo<T> {}
unsafe impl<T: Send> Sync for HpFifo<T> {}

impl<T> Default for HpFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HpFifo<T> {
    /// Create an empty queue; the stub node is allocated here.
    pub fn new() -> Self {
        let stub = Node::new(None);
        Self {
            head: AtomicPtr::new(stub),
            tail: AtomicPtr::new(stub),
            // Two slots: dequeue protects head and head.next at once.
            domain: Domain::new(2, RECLAIM_THRESHOLD, drop_node::<T>),
        }
    }

    /// Whether the queue is momentarily empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        // SAFETY: head always points at the resident stub.
        unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }

    /// Register the calling thread, recycling an unregistered hazard
    /// record when one is free.
    pub fn register(&self) -> HpFifoRef<'_, T> {
        let record = self
            .domain
            .recycle()
            .unwrap_or_else(|| self.domain.register());
        HpFifoRef { fifo: self, record }
    }
}

impl<T> Drop for HpFifo<T> {
    fn drop(&mut self) {
        // Exclusive access: free the stub and any resident nodes.
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            unsafe {
                let node = Box::from_raw(cursor);
                cursor = node.next.load(Ordering::Relaxed);
            }
        }
    }
}

/// A registered thread's handle to an [`HpFifo`].
pub struct HpFifoRef<'a, T> {
    fifo: &'a HpFifo<T>,
    record: RecordRef<'a>,
}

impl<'a, T> HpFifoRef<'a, T> {
    /// Enqueue `value`.
    pub fn enqueue(&self, value: T) {
        let node = Node::new(Some(value));
        crate::pr::fence_store();

        loop {
            let tail = self.fifo.tail.load(Ordering::Acquire);
            self.record.publish_fence(0, tail as *mut ());
            if self.fifo.tail.load(Ordering::SeqCst) != tail {
                continue;
            }

            // SAFETY: tail is protected and was revalidated.
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                if unsafe {
                    (*tail)
                        .next
                        .compare_exchange(ptr::null_mut(), node, Ordering::SeqCst, Ordering::Relaxed)
                        .is_ok()
                } {
                    let _ = self.fifo.tail.compare_exchange(
                        tail,
                        node,
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                    );
                    break;
                }
            } else {
                // Help the lagging tail along.
                let _ = self.fifo.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                );
            }

            crate::pr::stall();
        }

        self.record.clear();
    }

    /// Dequeue the oldest value, or `None` when empty. The displaced
    /// stub is retired through the hazard domain.
    pub fn dequeue(&self) -> Option<T> {
        loop {
            let head = self.fifo.head.load(Ordering::Acquire);
            self.record.publish_fence(0, head as *mut ());
            if self.fifo.head.load(Ordering::SeqCst) != head {
                continue;
            }

            let tail = self.fifo.tail.load(Ordering::Acquire);
            // SAFETY: head is protected and was revalidated.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if next.is_null() {
                self.record.clear();
                return None;
            }

            // The successor must be protected too: after our head CAS
            // it becomes the stub another dequeuer may retire.
            self.record.publish_fence(1, next as *mut ());
            if self.fifo.head.load(Ordering::SeqCst) != head {
                continue;
            }

            if head == tail {
                let _ = self.fifo.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                );
                continue;
            }

            if self
                .fifo
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: winning the CAS makes this thread the unique
                // consumer of next's value slot.
                let value = unsafe { (*(*next).value.get()).take() };
                self.record.clear();
                unsafe {
                    self.record
                        .retire_and_maybe_reclaim(head as *mut (), ptr::null_mut());
                }
                return value;
            }

            crate::pr::stall();
        }
    }

    /// Drain this thread's retired nodes as far as possible.
    pub fn flush(&self) {
        self.record.purge();
    }
}
