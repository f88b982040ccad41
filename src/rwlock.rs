//! Centralized reader-writer lock.
//!
//! Writer presence and reader count live in two separate words. Writers
//! serialize on the `writer` word with fetch-and-store, then drain
//! readers; readers increment optimistically and back out if a writer
//! slipped in. Write-biased: a spinning writer blocks new readers from
//! establishing themselves.
//!
//! [`RecursiveRwLock`] layers writer re-entrancy on the same state by
//! storing a caller-supplied thread id in the writer word with a depth
//! counter.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::backoff::Backoff;

/// A centralized reader-writer lock.
#[repr(C)]
pub struct RwLock<T: ?Sized> {
    writer: AtomicU32,
    n_readers: AtomicU32,
    data: UnsafeCell<T>,
}

impl<T> RwLock<T> {
    /// Create an unlocked lock.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            writer: AtomicU32::new(0),
            n_readers: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Whether a writer currently holds or is acquiring the lock.
    #[inline]
    pub fn is_write_locked(&self) -> bool {
        self.writer.load(Ordering::Acquire) != 0
    }

    /// Current reader count.
    #[inline]
    pub fn reader_count(&self) -> u32 {
        self.n_readers.load(Ordering::Relaxed)
    }

    /// Acquire the write side, spinning as needed.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let mut backoff = Backoff::new();

        // Serialize against other writers.
        while self.writer.swap(1, Ordering::SeqCst) != 0 {
            while self.writer.load(Ordering::Relaxed) != 0 {
                backoff.spin();
            }
        }

        // Drain readers that were established before we arrived.
        crate::pr::fence_load();
        backoff.reset();
        while self.n_readers.load(Ordering::Acquire) != 0 {
            backoff.spin();
        }
        crate::pr::fence_full();

        RwLockWriteGuard { lock: self }
    }

    /// One-shot write acquisition.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        if self
            .writer
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        crate::pr::fence_load();
        if self.n_readers.load(Ordering::Acquire) != 0 {
            self.writer.store(0, Ordering::Release);
            return None;
        }

        crate::pr::fence_full();
        Some(RwLockWriteGuard { lock: self })
    }

    /// Acquire the read side, spinning as needed.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let mut backoff = Backoff::new();

        loop {
            while self.writer.load(Ordering::Acquire) != 0 {
                backoff.spin();
            }

            self.n_readers.fetch_add(1, Ordering::SeqCst);
            crate::pr::fence_load();
            if self.writer.load(Ordering::Acquire) == 0 {
                return RwLockReadGuard { lock: self };
            }

            // A writer moved in between our check and increment; back
            // out and wait for it.
            self.n_readers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// One-shot read acquisition.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        if self.writer.load(Ordering::Acquire) != 0 {
            return None;
        }

        self.n_readers.fetch_add(1, Ordering::SeqCst);
        crate::pr::fence_load();
        if self.writer.load(Ordering::Acquire) == 0 {
            Some(RwLockReadGuard { lock: self })
        } else {
            self.n_readers.fetch_sub(1, Ordering::SeqCst);
            None
        }
    }
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

/// RAII read guard.
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.n_readers.fetch_sub(1, Ordering::Release);
    }
}

/// RAII write guard.
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<'a, T> RwLockWriteGuard<'a, T> {
    /// Downgrade to a read guard without opening a writer window: the
    /// reader count is raised before the writer word clears.
    pub fn downgrade(self) -> RwLockReadGuard<'a, T> {
        let lock = self.lock;
        lock.n_readers.fetch_add(1, Ordering::SeqCst);
        core::mem::forget(self);

        crate::pr::fence_full();
        lock.writer.store(0, Ordering::Release);
        RwLockReadGuard { lock }
    }
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        crate::pr::fence_full();
        self.lock.writer.store(0, Ordering::Release);
    }
}

// ============================================================================
// Recursive writer variant
// ============================================================================

/// A centralized rwlock whose write side is re-entrant for the same
/// caller-supplied thread id.
///
/// The writer word holds the owning id; a matching id bumps the depth
/// counter instead of spinning. Ids must be non-zero and unique per
/// thread.
#[repr(C)]
pub struct RecursiveRwLock<T: ?Sized> {
    writer: AtomicU32,
    n_readers: AtomicU32,
    depth: UnsafeCell<u32>,
    data: UnsafeCell<T>,
}

impl<T> RecursiveRwLock<T> {
    /// Create an unlocked lock.
    pub const fn new(data: T) -> Self {
        Self {
            writer: AtomicU32::new(0),
            n_readers: AtomicU32::new(0),
            depth: UnsafeCell::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire or re-enter the write side as thread `tid`.
    ///
    /// # Safety
    ///
    /// `tid` must be non-zero and unique to the calling thread. Nested
    /// guards alias the protected data; the caller must not hold
    /// references from an outer guard across mutation through an inner
    /// one.
    pub unsafe fn write(&self, tid: u32) -> RecursiveWriteGuard<'_, T> {
        debug_assert!(tid != 0);
        let mut backoff = Backoff::new();

        if self.writer.load(Ordering::Acquire) != tid {
            while self
                .writer
                .compare_exchange(0, tid, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                backoff.spin();
            }

            crate::pr::fence_load();
            backoff.reset();
            while self.n_readers.load(Ordering::Acquire) != 0 {
                backoff.spin();
            }
            crate::pr::fence_full();
        }

        *self.depth.get() += 1;
        RecursiveWriteGuard { lock: self }
    }

    /// Acquire the read side.
    pub fn read(&self) -> RecursiveReadGuard<'_, T> {
        let mut backoff = Backoff::new();

        loop {
            while self.writer.load(Ordering::Acquire) != 0 {
                backoff.spin();
            }

            self.n_readers.fetch_add(1, Ordering::SeqCst);
            crate::pr::fence_load();
            if self.writer.load(Ordering::Acquire) == 0 {
                return RecursiveReadGuard { lock: self };
            }

            self.n_readers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

unsafe impl<T: Send> Send for RecursiveRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RecursiveRwLock<T> {}

/// RAII guard for the recursive write side.
pub struct RecursiveWriteGuard<'a, T: ?Sized> {
    lock: &'a RecursiveRwLock<T>,
}

impl<T: ?Sized> Deref for RecursiveWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RecursiveWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RecursiveWriteGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: only the owning writer reaches this.
        unsafe {
            let depth = self.lock.depth.get();
            *depth -= 1;
            if *depth == 0 {
                crate::pr::fence_full();
                self.lock.writer.store(0, Ordering::Release);
            }
        }
    }
}

/// RAII guard for the recursive read side.
pub struct RecursiveReadGuard<'a, T: ?Sized> {
    lock: &'a RecursiveRwLock<T>,
}

impl<T: ?Sized> Deref for RecursiveReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RecursiveReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.n_readers.fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_round_trip() {
        let lock = RwLock::new(0);
        {
            let mut w = lock.write();
            *w = 42;
            assert!(lock.is_write_locked());
        }
        assert!(!lock.is_write_locked());
        assert_eq!(*lock.read(), 42);
    }

    #[test]
    fn test_readers_share() {
        let lock = RwLock::new(7);
        let g1 = lock.read();
        let g2 = lock.read();
        assert_eq!(lock.reader_count(), 2);
        assert_eq!(*g1 + *g2, 14);
    }

    #[test]
    fn test_try_variants_respect_holders() {
        let lock = RwLock::new(0);

        let r = lock.read();
        assert!(lock.try_write().is_none());
        drop(r);

        let w = lock.try_write().unwrap();
        assert!(lock.try_read().is_none());
        assert!(lock.try_write().is_none());
        drop(w);

        assert!(lock.try_read().is_some());
    }

    #[test]
    fn test_downgrade_holds_continuity() {
        let lock = RwLock::new(0);
        let mut w = lock.write();
        *w = 9;

        let r = w.downgrade();
        assert_eq!(*r, 9);
        assert_eq!(lock.reader_count(), 1);
        assert!(!lock.is_write_locked());

        // Another reader can join; a writer cannot.
        assert!(lock.try_read().is_some());
        assert!(lock.try_write().is_none());
    }

    #[test]
    fn test_writer_excludes_under_contention() {
        use std::sync::Arc;

        let lock = Arc::new(RwLock::new(0u64));
        let mut handles = alloc::vec::Vec::new();

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let mut w = lock.write();
                    let snapshot = *w;
                    *w = snapshot + 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 4000);
    }

    #[test]
    fn test_recursive_reentry() {
        let lock = RecursiveRwLock::new(0);
        unsafe {
            let mut outer = lock.write(1);
            *outer = 1;
            {
                let mut inner = lock.write(1);
                *inner += 1;
            }
            // Outer still holds the lock after the inner release.
            assert_eq!(lock.writer.load(Ordering::Relaxed), 1);
            *outer += 1;
        }
        assert_eq!(*lock.read(), 3);
        assert_eq!(lock.writer.load(Ordering::Relaxed), 0);
    }
}
