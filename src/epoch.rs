//! Epoch-based safe memory reclamation.
//!
//! The coarse-grained alternative to hazard pointers ([`crate::hp`]):
//! readers mark critical-section entry and exit against their record,
//! and retired objects wait out a full grace period (two global epoch
//! advances) before destruction. Cheaper per-read than hazard
//! publication, at the cost of reclamation stalling whenever any reader
//! lingers in a section.
//!
//! The epoch counter is per-[`Epoch`] instance; independent structures
//! can run independent reclamation regimes.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Epoch buckets a record cycles through; one full grace period spans
/// two advances, the third bucket is the one being refilled.
const BUCKETS: usize = 3;

struct Deferred {
    pointer: *mut u8,
    free_fn: unsafe fn(*mut u8),
}

/// A registered thread's reclamation record.
#[repr(C)]
pub struct EpochRecord {
    epoch: AtomicUsize,
    active: AtomicUsize,
    next: AtomicPtr<EpochRecord>,
    garbage: [UnsafeCell<Vec<Deferred>>; BUCKETS],
}

impl EpochRecord {
    fn new() -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            garbage: [
                UnsafeCell::new(Vec::new()),
                UnsafeCell::new(Vec::new()),
                UnsafeCell::new(Vec::new()),
            ],
        }
    }
}

/// A reclamation domain: global epoch plus the registered records.
pub struct Epoch {
    epoch: AtomicUsize,
    records: AtomicPtr<EpochRecord>,
}

impl Epoch {
    /// Create a domain at epoch zero.
    pub const fn new() -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            records: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Current global epoch.
    #[inline]
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    /// Register the calling thread.
    pub fn register(&self) -> EpochGuard<'_> {
        let record = Box::into_raw(Box::new(EpochRecord::new()));

        let mut head = self.records.load(Ordering::Relaxed);
        loop {
            // SAFETY: unpublished until the CAS lands.
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            match self.records.compare_exchange_weak(
                head,
                record,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(witness) => head = witness,
            }
        }

        EpochGuard {
            domain: self,
            record,
            _marker: PhantomData,
        }
    }

    /// Advance the global epoch if every active record has observed the
    /// current one. Returns whether the advance happened.
    pub fn try_advance(&self) -> bool {
        let global = self.epoch.load(Ordering::Acquire);

        let mut cursor = self.records.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: records live as long as the domain.
            let record = unsafe { &*cursor };
            if record.active.load(Ordering::Acquire) != 0
                && record.epoch.load(Ordering::Acquire) != global
            {
                return false;
            }
            cursor = record.next.load(Ordering::Acquire);
        }

        self.epoch
            .compare_exchange(
                global,
                global.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Epoch {
    fn drop(&mut self) {
        // Exclusive access: no section can be active, every deferred
        // object is reclaimable.
        let mut cursor = *self.records.get_mut();
        while !cursor.is_null() {
            unsafe {
                let record = Box::from_raw(cursor);
                cursor = record.next.load(Ordering::Relaxed);
                for bucket in &record.garbage {
                    for deferred in (*bucket.get()).drain(..) {
                        (deferred.free_fn)(deferred.pointer);
                    }
                }
            }
        }
    }
}

unsafe impl Send for Epoch {}
unsafe impl Sync for Epoch {}

/// A thread's handle into an [`Epoch`] domain.
pub struct EpochGuard<'a> {
    domain: &'a Epoch,
    record: *mut EpochRecord,
    _marker: PhantomData<*mut ()>,
}

impl<'a> EpochGuard<'a> {
    #[inline]
    fn record(&self) -> &EpochRecord {
        // SAFETY: the record outlives the guard.
        unsafe { &*self.record }
    }

    /// Enter a read-side critical section. Sections nest.
    pub fn enter(&self) {
        let record = self.record();
        let global = self.domain.epoch.load(Ordering::Acquire);
        record.epoch.store(global, Ordering::Relaxed);
        record.active.fetch_add(1, Ordering::SeqCst);
        crate::pr::fence_load();
    }

    /// Leave the innermost critical section.
    pub fn leave(&self) {
        crate::pr::fence_store();
        self.record().active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Defer destruction of `pointer` until a grace period passes.
    ///
    /// # Safety
    ///
    /// `pointer` must come from `Box<T>` and be unlinked from every
    /// shared structure.
    pub unsafe fn defer_free<T>(&self, pointer: *mut T) {
        let record = self.record();
        let bucket = record.epoch.load(Ordering::Relaxed) % BUCKETS;
        (*record.garbage[bucket].get()).push(Deferred {
            pointer: pointer as *mut u8,
            free_fn: |p| drop(Box::from_raw(p as *mut T)),
        });
    }

    /// Destroy deferred objects that have aged a full grace period,
    /// nudging the global epoch along first. Returns the number
    /// destroyed.
    pub fn reclaim(&self) -> usize {
        self.domain.try_advance();

        let record = self.record();
        let current = self.domain.epoch.load(Ordering::Acquire);
        record.epoch.store(current, Ordering::Relaxed);

        // The bucket two epochs behind is beyond any straggler:
        // current + 1 ≡ current - 2 (mod 3).
        let expired = current.wrapping_add(1) % BUCKETS;
        // SAFETY: buckets belong to the owning thread.
        let bucket = unsafe { &mut *record.garbage[expired].get() };
        let count = bucket.len();
        for deferred in bucket.drain(..) {
            // SAFETY: aged past the grace period.
            unsafe { (deferred.free_fn)(deferred.pointer) };
        }

        if count > 0 {
            log::trace!("epoch reclaim: destroyed {} at epoch {}", count, current);
        }
        count
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.record().active.load(Ordering::Relaxed),
            0,
            "guard dropped inside a critical section"
        );
    }
}
