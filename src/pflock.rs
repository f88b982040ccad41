//! Phase-fair reader-writer lock.
//!
//! Alternates strict reader and writer phases so neither role starves:
//! writers are ticketed FIFO among themselves, and a waiting writer
//! holds back only the readers that arrive after it. Any thread is
//! overtaken at most once per role between request and acquisition.
//!
//! State is four 32-bit counters. `rin`/`rout` count reader arrivals
//! and departures in steps of [`RINC`], leaving the low byte of `rin`
//! free for the writer-present and phase-identity bits. `win`/`wout`
//! are the writer ticket dispenser and completion counter.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// Reader increment; arrivals step `rin` by this so the writer bits
/// below survive.
const RINC: u32 = 0x100;
/// Both writer bits packed into `rin`.
const WBITS: u32 = 0x3;
/// Writer-present bit.
const PRES: u32 = 0x2;
/// Phase-identity bit; alternates with the writer ticket parity.
const PHID: u32 = 0x1;
/// Mask clearing the writer bits from `rin`.
const RMASK: u32 = !WBITS;

/// A phase-fair reader-writer lock.
#[repr(C)]
pub struct PfLock<T: ?Sized> {
    rin: AtomicU32,
    rout: AtomicU32,
    win: AtomicU32,
    wout: AtomicU32,
    data: UnsafeCell<T>,
}

impl<T> PfLock<T> {
    /// Create an unlocked lock.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            rin: AtomicU32::new(0),
            rout: AtomicU32::new(0),
            win: AtomicU32::new(0),
            wout: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the read side.
    pub fn read(&self) -> PfLockReadGuard<'_, T> {
        // Register arrival; the captured writer bits tell us whether a
        // write phase is pending or active.
        let w = self.rin.fetch_add(RINC, Ordering::SeqCst) & WBITS;

        if w != 0 {
            // Wait for that writer's phase to end. The bits change on
            // write-unlock (cleared) or on the next writer's arrival
            // (different phase id), either of which opens a read phase
            // that includes us.
            while (self.rin.load(Ordering::Acquire) & WBITS) == w {
                crate::pr::stall();
            }
        }

        crate::pr::fence_load();
        PfLockReadGuard { lock: self }
    }

    /// Acquire the write side.
    pub fn write(&self) -> PfLockWriteGuard<'_, T> {
        // Writers are strictly ticketed among themselves.
        let ticket = self.win.fetch_add(1, Ordering::SeqCst);
        while self.wout.load(Ordering::Acquire) != ticket {
            crate::pr::stall();
        }

        // Announce the write phase to incoming readers and capture the
        // reader ticket at announcement time.
        let readers = self
            .rin
            .fetch_add((ticket & PHID) | PRES, Ordering::SeqCst)
            & RMASK;

        // Drain the readers that were already inside.
        while self.rout.load(Ordering::Acquire) != readers {
            crate::pr::stall();
        }

        crate::pr::fence_full();
        PfLockWriteGuard { lock: self }
    }
}

unsafe impl<T: Send> Send for PfLock<T> {}
unsafe impl<T: Send + Sync> Sync for PfLock<T> {}

/// RAII read guard.
pub struct PfLockReadGuard<'a, T: ?Sized> {
    lock: &'a PfLock<T>,
}

impl<T: ?Sized> Deref for PfLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for PfLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.rout.fetch_add(RINC, Ordering::SeqCst);
    }
}

/// RAII write guard.
pub struct PfLockWriteGuard<'a, T: ?Sized> {
    lock: &'a PfLock<T>,
}

impl<T: ?Sized> Deref for PfLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for PfLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for PfLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        crate::pr::fence_full();
        // Migrate to a read phase: clear the writer bits first so
        // blocked readers release, then retire the ticket so the next
        // writer may queue its own phase.
        self.lock.rin.fetch_and(RMASK, Ordering::SeqCst);
        self.lock.wout.fetch_add(1, Ordering::SeqCst);
    }
}
