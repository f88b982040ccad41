//! Hazard-pointer protected stack.
//!
//! A Treiber stack that owns its nodes and reclaims them through an
//! embedded [`hp::Domain`](crate::hp::Domain): poppers protect the head
//! with a fenced publication before dereferencing it, so a node is
//! never freed while a racing pop can still read its link.
//!
//! Threads obtain a handle with [`register`](HpStack::register); the
//! handle carries the thread's hazard record and is the only way to
//! pop.

use alloc::boxed::Box;
use core::mem::ManuallyDrop;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::hp::{Domain, RecordRef};

/// Pending retirements per thread before a scan is forced.
const RECLAIM_THRESHOLD: usize = 64;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: ManuallyDrop<T>,
}

unsafe fn drop_node<T>(p: *mut (), _ctx: *mut ()) {
    // The value was moved out at pop; only the allocation remains.
    drop(Box::from_raw(p as *mut Node<T>));
}

/// A lock-free stack with built-in safe memory reclamation.
pub struct HpStack<T> {
    head: AtomicPtr<Node<T>>,
    domain: Domain,
}

unsafe impl<T: Send> Send for HpStack<T> {}
unsafe impl<T: Send> Sync for HpStack<T> {}

impl<T> Default for HpStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HpStack<T> {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            domain: Domain::new(1, RECLAIM_THRESHOLD, drop_node::<T>),
        }
    }

    /// Whether the stack is momentarily empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Register the calling thread, recycling an unregistered hazard
    /// record when one is free.
    pub fn register(&self) -> HpStackRef<'_, T> {
        let record = self
            .domain
            .recycle()
            .unwrap_or_else(|| self.domain.register());
        HpStackRef { stack: self, record }
    }
}

impl<T> Drop for HpStack<T> {
    fn drop(&mut self) {
        // Exclusive access: resident nodes still carry live values.
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            unsafe {
                let mut node = Box::from_raw(cursor);
                cursor = node.next.load(Ordering::Relaxed);
                ManuallyDrop::drop(&mut node.value);
            }
        }
        // The embedded domain frees already-retired allocations.
    }
}

/// A registered thread's handle to an [`HpStack`].
pub struct HpStackRef<'a, T> {
    stack: &'a HpStack<T>,
    record: RecordRef<'a>,
}

impl<'a, T> HpStackRef<'a, T> {
    /// Push `value`. Allocation is the only failure mode and it panics,
    /// matching `Box`.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: ManuallyDrop::new(value),
        }));

        let mut head = self.stack.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: node is unpublished until the CAS lands.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            crate::pr::fence_store();

            match self.stack.head.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(witness) => head = witness,
            }

            crate::pr::stall();
        }
    }

    /// Pop the most recently pushed value, or `None` when empty. The
    /// node is retired through the hazard domain.
    pub fn pop(&self) -> Option<T> {
        loop {
            let head = self.stack.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }

            // Publish before the dereference; revalidate to make sure
            // the publication landed while the node was still
            // reachable.
            self.record.publish_fence(0, head as *mut ());
            if self.stack.head.load(Ordering::SeqCst) != head {
                continue;
            }

            // SAFETY: protected and revalidated.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if self
                .stack
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                self.record.clear();
                // SAFETY: the CAS made this pop the node's unique
                // owner; racing pops may still read its link, which is
                // exactly what retirement defers the free for.
                let value = unsafe { ptr::read(&(*head).value) };
                unsafe {
                    self.record
                        .retire_and_maybe_reclaim(head as *mut (), ptr::null_mut());
                }
                return Some(ManuallyDrop::into_inner(value));
            }

            crate::pr::stall();
        }
    }

    /// Drain this thread's retired nodes as far as possible.
    pub fn flush(&self) {
        self.record.purge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo_round_trip() {
        let stack = HpStack::new();
        let handle = stack.register();

        handle.push(1);
        handle.push(2);
        handle.push(3);
        assert!(!stack.is_empty());

        assert_eq!(handle.pop(), Some(3));
        assert_eq!(handle.pop(), Some(2));
        assert_eq!(handle.pop(), Some(1));
        assert_eq!(handle.pop(), None);
        handle.flush();
    }

    #[test]
    fn test_resident_values_dropped_with_stack() {
        use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
        use std::sync::Arc;

        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, StdOrdering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let stack = HpStack::new();
            let handle = stack.register();
            for _ in 0..5 {
                handle.push(Tracked(Arc::clone(&drops)));
            }
            drop(handle.pop());
            assert_eq!(drops.load(StdOrdering::SeqCst), 1);
        }
        assert_eq!(drops.load(StdOrdering::SeqCst), 5);
    }

    #[test]
    fn test_register_recycles_records() {
        let stack: HpStack<u32> = HpStack::new();
        {
            let first = stack.register();
            first.push(1);
        }
        // The dropped handle's record comes back instead of growing
        // the domain.
        let second = stack.register();
        assert_eq!(second.pop(), Some(1));
        second.flush();
    }

    #[test]
    fn test_concurrent_push_pop_with_reclamation() {
        use std::collections::HashSet;
        use std::sync::{Arc, Mutex};

        const THREADS: usize = 4;
        const PER_THREAD: usize = 2000;

        let stack: Arc<HpStack<usize>> = Arc::new(HpStack::new());
        let popped = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = alloc::vec::Vec::new();
        for t in 0..THREADS {
            let stack = Arc::clone(&stack);
            let popped = Arc::clone(&popped);
            handles.push(std::thread::spawn(move || {
                let handle = stack.register();
                let mut local = alloc::vec::Vec::new();

                // Interleave pushes with pops so nodes retire while
                // other threads race on the head.
                for i in 0..PER_THREAD {
                    handle.push(t * PER_THREAD + i);
                    if i % 3 == 0 {
                        if let Some(v) = handle.pop() {
                            local.push(v);
                        }
                    }
                }
                while let Some(v) = handle.pop() {
                    local.push(v);
                }
                handle.flush();

                let mut popped = popped.lock().unwrap();
                for v in local {
                    assert!(popped.insert(v), "value {} popped twice", v);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert!(stack.is_empty());
        assert_eq!(popped.lock().unwrap().len(), THREADS * PER_THREAD);
    }
}
