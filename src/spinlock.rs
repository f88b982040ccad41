//! Spinlocks.
//!
//! The busy-waiting kernels the blocking primitives build on:
//!
//! - [`FasLock`]: one fetch-and-store word. Fastest uncontended path,
//!   no fairness.
//! - [`TicketLock`]: FIFO-fair; threads acquire in arrival order.
//! - [`McsLock`]: queue lock; each waiter spins on its own node, so
//!   contention stays off the lock word entirely.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::backoff::Backoff;

// ============================================================================
// Fetch-and-store lock
// ============================================================================

/// A fetch-and-store spinlock.
#[repr(C)]
pub struct FasLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

impl<T> FasLock<T> {
    /// Create an unlocked lock.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// One-shot acquisition.
    #[inline]
    pub fn try_lock(&self) -> Option<FasLockGuard<'_, T>> {
        if self.locked.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(FasLockGuard { lock: self })
        }
    }

    /// Acquire, spinning on a local load between exchange attempts.
    #[inline]
    pub fn lock(&self) -> FasLockGuard<'_, T> {
        let mut backoff = Backoff::new();
        while self.locked.swap(true, Ordering::SeqCst) {
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
        FasLockGuard { lock: self }
    }

    /// Whether the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

unsafe impl<T: Send> Send for FasLock<T> {}
unsafe impl<T: Send> Sync for FasLock<T> {}

/// RAII guard for [`FasLock`].
pub struct FasLockGuard<'a, T: ?Sized> {
    lock: &'a FasLock<T>,
}

impl<T: ?Sized> Deref for FasLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for FasLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for FasLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ============================================================================
// Ticket lock
// ============================================================================

/// A FIFO ticket lock.
#[repr(C)]
pub struct TicketLock<T: ?Sized> {
    next_ticket: AtomicUsize,
    now_serving: AtomicUsize,
    data: UnsafeCell<T>,
}

impl<T> TicketLock<T> {
    /// Create an unlocked lock.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicUsize::new(0),
            now_serving: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// One-shot acquisition: takes a ticket only when it would be
    /// served immediately.
    pub fn try_lock(&self) -> Option<TicketLockGuard<'_, T>> {
        let serving = self.now_serving.load(Ordering::Acquire);
        if self
            .next_ticket
            .compare_exchange(serving, serving + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Some(TicketLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire in FIFO order.
    pub fn lock(&self) -> TicketLockGuard<'_, T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            crate::pr::stall();
        }
        TicketLockGuard { lock: self }
    }
}

unsafe impl<T: Send> Send for TicketLock<T> {}
unsafe impl<T: Send> Sync for TicketLock<T> {}

/// RAII guard for [`TicketLock`].
pub struct TicketLockGuard<'a, T: ?Sized> {
    lock: &'a TicketLock<T>,
}

impl<T: ?Sized> Deref for TicketLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for TicketLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for TicketLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::Release);
    }
}

// ============================================================================
// MCS queue lock
// ============================================================================

/// A waiter's queue node for [`McsLock`]. One per acquisition; must
/// stay alive and in place until the matching guard drops.
#[repr(C)]
pub struct McsNode {
    next: AtomicPtr<McsNode>,
    locked: AtomicBool,
}

impl McsNode {
    /// Create a detached node.
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            locked: AtomicBool::new(false),
        }
    }
}

impl Default for McsNode {
    fn default() -> Self {
        Self::new()
    }
}

/// A Mellor-Crummey–Scott queue lock. FIFO-fair; each waiter spins on
/// its own node's flag.
#[repr(C)]
pub struct McsLock<T: ?Sized> {
    tail: AtomicPtr<McsNode>,
    data: UnsafeCell<T>,
}

impl<T> McsLock<T> {
    /// Create an unlocked lock.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, enqueueing `node` as this thread's waiter
    /// slot.
    ///
    /// # Safety
    ///
    /// `node` must be detached and must not move or be reused until the
    /// returned guard drops.
    pub unsafe fn lock<'a>(&'a self, node: &'a McsNode) -> McsLockGuard<'a, T> {
        node.next.store(ptr::null_mut(), Ordering::Relaxed);
        node.locked.store(true, Ordering::Relaxed);

        let predecessor = self
            .tail
            .swap(node as *const McsNode as *mut McsNode, Ordering::SeqCst);
        if !predecessor.is_null() {
            (*predecessor)
                .next
                .store(node as *const McsNode as *mut McsNode, Ordering::Release);
            while node.locked.load(Ordering::Acquire) {
                crate::pr::stall();
            }
        }

        crate::pr::fence_load();
        McsLockGuard { lock: self, node }
    }

    /// One-shot acquisition: succeeds only when the queue is empty.
    ///
    /// # Safety
    ///
    /// As for [`lock`](Self::lock).
    pub unsafe fn try_lock<'a>(&'a self, node: &'a McsNode) -> Option<McsLockGuard<'a, T>> {
        node.next.store(ptr::null_mut(), Ordering::Relaxed);
        node.locked.store(true, Ordering::Relaxed);

        if self
            .tail
            .compare_exchange(
                ptr::null_mut(),
                node as *const McsNode as *mut McsNode,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            crate::pr::fence_load();
            Some(McsLockGuard { lock: self, node })
        } else {
            None
        }
    }
}

unsafe impl<T: Send> Send for McsLock<T> {}
unsafe impl<T: Send> Sync for McsLock<T> {}

/// RAII guard for [`McsLock`].
pub struct McsLockGuard<'a, T: ?Sized> {
    lock: &'a McsLock<T>,
    node: &'a McsNode,
}

impl<T: ?Sized> Deref for McsLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for McsLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for McsLockGuard<'_, T> {
    fn drop(&mut self) {
        let node_ptr = self.node as *const McsNode as *mut McsNode;
        let mut successor = self.node.next.load(Ordering::Acquire);

        if successor.is_null() {
            // No visible successor; if the tail is still us, the queue
            // empties here.
            if self
                .lock
                .tail
                .compare_exchange(node_ptr, ptr::null_mut(), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            // A successor is mid-enqueue; wait for its link.
            loop {
                successor = self.node.next.load(Ordering::Acquire);
                if !successor.is_null() {
                    break;
                }
                crate::pr::stall();
            }
        }

        crate::pr::fence_store();
        // SAFETY: a linked successor stays alive until its own guard
        // drops.
        unsafe { (*successor).locked.store(false, Ordering::Release) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fas_round_trip() {
        let lock = FasLock::new(0);
        {
            let mut g = lock.lock();
            *g = 42;
            assert!(lock.is_locked());
            assert!(lock.try_lock().is_none());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.try_lock().unwrap(), 42);
    }

    #[test]
    fn test_ticket_round_trip() {
        let lock = TicketLock::new(0);
        {
            let mut g = lock.lock();
            *g = 7;
            assert!(lock.try_lock().is_none());
        }
        assert_eq!(*lock.try_lock().unwrap(), 7);
    }

    #[test]
    fn test_mcs_round_trip() {
        let lock = McsLock::new(0);
        let node = McsNode::new();
        unsafe {
            let mut g = lock.lock(&node);
            *g = 9;
        }
        let node2 = McsNode::new();
        unsafe {
            assert_eq!(*lock.lock(&node2), 9);
        }
    }

    #[test]
    fn test_mcs_try_lock_contended() {
        let lock = McsLock::new(0);
        let n1 = McsNode::new();
        let n2 = McsNode::new();
        unsafe {
            let g = lock.lock(&n1);
            assert!(lock.try_lock(&n2).is_none());
            drop(g);
            assert!(lock.try_lock(&n2).is_some());
        }
    }

    #[test]
    fn test_fas_mutual_exclusion() {
        use std::sync::Arc;

        let lock = Arc::new(FasLock::new(0u64));
        let mut handles = alloc::vec::Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..2000 {
                    let mut g = lock.lock();
                    let snapshot = *g;
                    *g = snapshot + 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    fn test_ticket_mutual_exclusion() {
        use std::sync::Arc;

        let lock = Arc::new(TicketLock::new(0u64));
        let mut handles = alloc::vec::Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..2000 {
                    let mut g = lock.lock();
                    let snapshot = *g;
                    *g = snapshot + 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    fn test_mcs_mutual_exclusion() {
        use std::sync::Arc;

        let lock = Arc::new(McsLock::new(0u64));
        let mut handles = alloc::vec::Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..2000 {
                    let node = McsNode::new();
                    unsafe {
                        let mut g = lock.lock(&node);
                        let snapshot = *g;
                        *g = snapshot + 1;
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let node = McsNode::new();
        unsafe {
            assert_eq!(*lock.lock(&node), 8000);
        }
    }
}
