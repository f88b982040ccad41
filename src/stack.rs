//! Treiber stacks.
//!
//! Intrusive lock-free LIFO in two flavors:
//!
//! - [`Stack`]: unique-producer/multi-consumer shape on a single head
//!   word. Reclamation of popped entries is the caller's problem; run
//!   hazard pointers ([`crate::hp`]) or epochs ([`crate::epoch`]) between
//!   pop and reuse, or use [`crate::hp_stack`] which packages the two.
//! - [`GenStack`]: multi-producer/multi-consumer, pairing the head with
//!   a generation counter advanced on every pop under one double-width
//!   CAS. Only available on targets with [`crate::pr::HAS_WIDE_CAS`].
//!
//! An entry may sit in at most one stack at a time.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A node in a lock-free stack.
#[repr(C)]
pub struct StackEntry<T> {
    /// Link to the entry below this one.
    pub next: AtomicPtr<StackEntry<T>>,
    data: T,
}

impl<T> StackEntry<T> {
    /// Create a detached entry.
    #[inline]
    pub fn new(data: T) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            data,
        }
    }

    /// Borrow the payload.
    #[inline]
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Mutably borrow the payload.
    #[inline]
    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// Consume the entry, returning the payload.
    #[inline]
    pub fn into_data(self) -> T {
        self.data
    }
}

/// Lock-free LIFO, unique-producer/multi-consumer reclamation contract.
#[repr(C)]
pub struct Stack<T> {
    head: AtomicPtr<StackEntry<T>>,
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stack<T> {
    /// Create an empty stack.
    #[inline]
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Whether the stack is currently empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Push an entry.
    ///
    /// # Safety
    ///
    /// `entry` must be valid, not in any stack, and either freshly
    /// allocated or protected by safe memory reclamation.
    pub unsafe fn push(&self, entry: *mut StackEntry<T>) {
        debug_assert!(!entry.is_null());

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            (*entry).next.store(head, Ordering::Relaxed);
            crate::pr::fence_store();

            match self
                .head
                .compare_exchange_weak(head, entry, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(witness) => head = witness,
            }

            crate::pr::stall();
        }
    }

    /// Push with a single CAS attempt. Returns false under contention.
    ///
    /// # Safety
    ///
    /// As for [`push`](Stack::push).
    pub unsafe fn try_push(&self, entry: *mut StackEntry<T>) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        (*entry).next.store(head, Ordering::Relaxed);
        crate::pr::fence_store();

        self.head
            .compare_exchange(head, entry, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Pop the most recently pushed entry, or `None` when empty.
    ///
    /// # Safety
    ///
    /// The returned entry must not be reused or freed until safe memory
    /// reclamation has run; a concurrent popper may still be reading it.
    pub unsafe fn pop(&self) -> Option<*mut StackEntry<T>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }
            crate::pr::fence_load();

            let next = (*head).next.load(Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return Some(head),
                Err(witness) => head = witness,
            }

            crate::pr::stall();
        }
    }

    /// Pop with a single CAS attempt. Returns `None` on emptiness or
    /// contention.
    ///
    /// # Safety
    ///
    /// As for [`pop`](Stack::pop).
    pub unsafe fn try_pop(&self) -> Option<*mut StackEntry<T>> {
        let head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }
        crate::pr::fence_load();

        let next = (*head).next.load(Ordering::Relaxed);
        self.head
            .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed)
            .ok()
            .map(|_| head)
    }

    /// Detach the entire chain with one fetch-and-store, returning its
    /// head. Entries stay linked through `next`.
    ///
    /// # Safety
    ///
    /// As for [`pop`](Stack::pop), applied to every entry in the chain.
    pub unsafe fn pop_all(&self) -> Option<*mut StackEntry<T>> {
        let head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        if head.is_null() {
            None
        } else {
            Some(head)
        }
    }

    /// Push during a single-producer/no-consumer window: plain pointer
    /// writes, no read-modify-write.
    ///
    /// # Safety
    ///
    /// No other thread may touch the stack for the duration of the
    /// window.
    pub unsafe fn push_spnc(&self, entry: *mut StackEntry<T>) {
        let head = self.head.load(Ordering::Relaxed);
        (*entry).next.store(head, Ordering::Relaxed);
        self.head.store(entry, Ordering::Relaxed);
    }

    /// Pop during a no-producer/single-consumer window.
    ///
    /// # Safety
    ///
    /// No other thread may touch the stack for the duration of the
    /// window.
    pub unsafe fn pop_npsc(&self) -> Option<*mut StackEntry<T>> {
        let head = self.head.load(Ordering::Relaxed);
        if head.is_null() {
            return None;
        }
        self.head
            .store((*head).next.load(Ordering::Relaxed), Ordering::Relaxed);
        Some(head)
    }
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

// ============================================================================
// Generation-counter MPMC variant
// ============================================================================

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub use gen_stack::GenStack;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
mod gen_stack {
    use super::StackEntry;
    use crate::pr::wide::AtomicPair;
    use core::marker::PhantomData;
    use core::ptr;
    use core::sync::atomic::Ordering;

    /// Lock-free LIFO safe for multi-producer/multi-consumer reuse.
    ///
    /// The head pointer travels with a generation counter bumped on
    /// every successful pop; a popper whose head was recycled in the
    /// interim fails its double-width CAS on the stale generation, which
    /// closes the ABA window without external reclamation.
    pub struct GenStack<T> {
        state: AtomicPair,
        _marker: PhantomData<*mut StackEntry<T>>,
    }

    impl<T> Default for GenStack<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<T> GenStack<T> {
        /// Create an empty stack.
        pub const fn new() -> Self {
            Self {
                state: AtomicPair::new(0, 0),
                _marker: PhantomData,
            }
        }

        /// Whether the stack is currently empty.
        #[inline]
        pub fn is_empty(&self) -> bool {
            self.state.load().0 == 0
        }

        /// Generation counter value; increments once per successful pop.
        #[inline]
        pub fn generation(&self) -> u64 {
            self.state.load().1
        }

        /// Push an entry.
        ///
        /// # Safety
        ///
        /// `entry` must be valid and not in any stack. Unlike
        /// [`Stack::push`](super::Stack::push), the entry may be a
        /// recycled pop result; the generation counter carries the ABA
        /// burden.
        pub unsafe fn push(&self, entry: *mut StackEntry<T>) {
            debug_assert!(!entry.is_null());

            let mut snap = self.state.load();
            loop {
                (*entry)
                    .next
                    .store(snap.0 as *mut StackEntry<T>, Ordering::Relaxed);
                crate::pr::fence_store();

                let (ok, witness) = self.state.cas_value(snap, (entry as u64, snap.1));
                if ok {
                    return;
                }
                snap = witness;
                crate::pr::stall();
            }
        }

        /// Pop the most recently pushed entry, or `None` when empty.
        pub unsafe fn pop(&self) -> Option<*mut StackEntry<T>> {
            let mut snap = self.state.load();
            loop {
                let head = snap.0 as *mut StackEntry<T>;
                if head.is_null() {
                    return None;
                }
                crate::pr::fence_load();

                let next = (*head).next.load(Ordering::Relaxed);
                let (ok, witness) = self
                    .state
                    .cas_value(snap, (next as u64, snap.1.wrapping_add(1)));
                if ok {
                    return Some(head);
                }
                snap = witness;
                crate::pr::stall();
            }
        }

        /// Pop with a single CAS attempt.
        pub unsafe fn try_pop(&self) -> Option<*mut StackEntry<T>> {
            let snap = self.state.load();
            let head = snap.0 as *mut StackEntry<T>;
            if head.is_null() {
                return None;
            }
            crate::pr::fence_load();

            let next = (*head).next.load(Ordering::Relaxed);
            if self
                .state
                .cas(snap, (next as u64, snap.1.wrapping_add(1)))
            {
                Some(head)
            } else {
                None
            }
        }

        /// Detach the entire chain, returning its head.
        ///
        /// The generation still advances so in-flight poppers fail
        /// cleanly.
        pub unsafe fn pop_all(&self) -> Option<*mut StackEntry<T>> {
            let mut snap = self.state.load();
            loop {
                let head = snap.0 as *mut StackEntry<T>;
                if head.is_null() {
                    return None;
                }

                let (ok, witness) = self.state.cas_value(snap, (0, snap.1.wrapping_add(1)));
                if ok {
                    return Some(head);
                }
                snap = witness;
                crate::pr::stall();
            }
        }
    }

    unsafe impl<T: Send> Send for GenStack<T> {}
    unsafe impl<T: Send> Sync for GenStack<T> {}

    // Pointer <-> u64 packing relies on pointers being 64 bits wide here.
    static_assertions::const_assert_eq!(core::mem::size_of::<*mut ()>(), 8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    #[test]
    fn test_new_stack_is_empty() {
        let stack: Stack<i32> = Stack::new();
        assert!(stack.is_empty());
        unsafe {
            assert!(stack.pop().is_none());
            assert!(stack.try_pop().is_none());
        }
    }

    #[test]
    fn test_lifo_order() {
        let stack: Stack<char> = Stack::new();

        let a = Box::into_raw(Box::new(StackEntry::new('a')));
        let b = Box::into_raw(Box::new(StackEntry::new('b')));
        let c = Box::into_raw(Box::new(StackEntry::new('c')));

        unsafe {
            stack.push(a);
            stack.push(b);
            stack.push(c);

            assert_eq!(*(*stack.pop().unwrap()).data(), 'c');
            assert_eq!(*(*stack.pop().unwrap()).data(), 'b');
            assert_eq!(*(*stack.pop().unwrap()).data(), 'a');
            assert!(stack.pop().is_none());

            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
            drop(Box::from_raw(c));
        }
    }

    #[test]
    fn test_try_variants_uncontended() {
        let stack: Stack<i32> = Stack::new();
        let e = Box::into_raw(Box::new(StackEntry::new(7)));

        unsafe {
            assert!(stack.try_push(e));
            let popped = stack.try_pop().unwrap();
            assert_eq!(*(*popped).data(), 7);
            drop(Box::from_raw(popped));
        }
    }

    #[test]
    fn test_pop_all_preserves_chain() {
        let stack: Stack<i32> = Stack::new();
        let e1 = Box::into_raw(Box::new(StackEntry::new(1)));
        let e2 = Box::into_raw(Box::new(StackEntry::new(2)));

        unsafe {
            stack.push(e1);
            stack.push(e2);

            let chain = stack.pop_all().unwrap();
            assert!(stack.is_empty());
            assert_eq!(*(*chain).data(), 2);
            let next = (*chain).next.load(Ordering::Relaxed);
            assert_eq!(*(*next).data(), 1);

            drop(Box::from_raw(e1));
            drop(Box::from_raw(e2));
        }
    }

    #[test]
    fn test_relaxed_window_variants() {
        let stack: Stack<i32> = Stack::new();
        let e1 = Box::into_raw(Box::new(StackEntry::new(1)));
        let e2 = Box::into_raw(Box::new(StackEntry::new(2)));

        unsafe {
            stack.push_spnc(e1);
            stack.push_spnc(e2);

            assert_eq!(*(*stack.pop_npsc().unwrap()).data(), 2);
            assert_eq!(*(*stack.pop_npsc().unwrap()).data(), 1);
            assert!(stack.pop_npsc().is_none());

            drop(Box::from_raw(e1));
            drop(Box::from_raw(e2));
        }
    }

    #[test]
    fn test_concurrent_push_pop_multiset() {
        use std::sync::Arc;

        const THREADS: usize = 4;
        const PER_THREAD: usize = 500;

        let stack: Arc<Stack<usize>> = Arc::new(Stack::new());
        let mut handles = Vec::new();

        for t in 0..THREADS {
            let stack = Arc::clone(&stack);
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let e = Box::into_raw(Box::new(StackEntry::new(t * PER_THREAD + i)));
                    unsafe { stack.push(e) };
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Entries pushed equals entries popped, each exactly once.
        let mut seen = alloc::vec![false; THREADS * PER_THREAD];
        unsafe {
            while let Some(e) = stack.pop() {
                let v = *(*e).data();
                assert!(!seen[v], "entry {} popped twice", v);
                seen[v] = true;
                drop(Box::from_raw(e));
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    mod gen_tests {
        use super::super::{GenStack, StackEntry};
        use alloc::boxed::Box;

        #[test]
        fn test_gen_lifo_and_generation() {
            let stack: GenStack<i32> = GenStack::new();
            let e1 = Box::into_raw(Box::new(StackEntry::new(1)));
            let e2 = Box::into_raw(Box::new(StackEntry::new(2)));

            unsafe {
                stack.push(e1);
                stack.push(e2);
                assert_eq!(stack.generation(), 0);

                assert_eq!(*(*stack.pop().unwrap()).data(), 2);
                assert_eq!(stack.generation(), 1);
                assert_eq!(*(*stack.pop().unwrap()).data(), 1);
                assert_eq!(stack.generation(), 2);
                assert!(stack.pop().is_none());

                drop(Box::from_raw(e1));
                drop(Box::from_raw(e2));
            }
        }

        #[test]
        fn test_gen_immediate_reuse() {
            // Popped entries go straight back in; the generation keeps
            // concurrent CASes honest, and sequentially the multiset is
            // preserved.
            let stack: GenStack<i32> = GenStack::new();
            let e = Box::into_raw(Box::new(StackEntry::new(9)));

            unsafe {
                stack.push(e);
                let popped = stack.pop().unwrap();
                stack.push(popped);
                let again = stack.pop().unwrap();
                assert_eq!(again, e);
                assert_eq!(stack.generation(), 2);
                drop(Box::from_raw(again));
            }
        }

        #[test]
        fn test_gen_pop_all() {
            let stack: GenStack<i32> = GenStack::new();
            let e1 = Box::into_raw(Box::new(StackEntry::new(1)));
            let e2 = Box::into_raw(Box::new(StackEntry::new(2)));

            unsafe {
                stack.push(e1);
                stack.push(e2);

                let chain = stack.pop_all().unwrap();
                assert!(stack.is_empty());
                assert_eq!(*(*chain).data(), 2);
                assert_eq!(stack.generation(), 1);

                drop(Box::from_raw(e1));
                drop(Box::from_raw(e2));
            }
        }
    }
}
