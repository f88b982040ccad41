//! Hazard-pointer safe memory reclamation.
//!
//! Threads register a [`Record`] with a [`Domain`] and publish the
//! pointers they are about to dereference into the record's slots. An
//! object retired into the domain is destroyed only once a scan of
//! every registered record finds no slot holding it.
//!
//! # Publication contract
//!
//! A producer makes a reference reachable by writing the pointer into
//! the target structure; the consumer must execute
//! [`publish_fence`](RecordRef::publish_fence), a store-load
//! serialization, *before* its first dereference. Plain
//! [`publish`](RecordRef::publish) carries no ordering and is only
//! correct when the caller provides the serialization itself.
//!
//! # Progress
//!
//! `publish`, `clear`, and `retire` are wait-free. `reclaim` is
//! lock-free in the number of records and pending objects. `purge`
//! repeats `reclaim` until it stops making progress and is therefore
//! unbounded.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::{Cell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Capacity hint for the per-record scan cache.
pub const HAZARD_CACHE: usize = 512;

/// Destructor invoked on a retired object once it is unreachable.
/// Receives the object pointer and the opaque context captured at
/// retire time. Must not fail.
pub type Destructor = unsafe fn(*mut (), *mut ());

const STATE_USED: usize = 1;
const STATE_FREE: usize = 0;

struct Retired {
    pointer: *mut (),
    context: *mut (),
}

/// A per-thread hazard record.
///
/// Owned by the registering thread until unregistered, at which point
/// it becomes recyclable by any other thread.
pub struct Record {
    state: AtomicUsize,
    next: AtomicPtr<Record>,
    slots: Box<[AtomicPtr<()>]>,
    pending: UnsafeCell<Vec<Retired>>,
    n_peak: Cell<usize>,
    n_reclaimed: Cell<u64>,
}

impl Record {
    fn new(degree: usize) -> Self {
        let mut slots = Vec::with_capacity(degree);
        slots.resize_with(degree, || AtomicPtr::new(ptr::null_mut()));
        Self {
            state: AtomicUsize::new(STATE_USED),
            next: AtomicPtr::new(ptr::null_mut()),
            slots: slots.into_boxed_slice(),
            pending: UnsafeCell::new(Vec::new()),
            n_peak: Cell::new(0),
            n_reclaimed: Cell::new(0),
        }
    }
}

/// A hazard-pointer domain: the set of records scanned by reclamation.
pub struct Domain {
    degree: usize,
    threshold: usize,
    destructor: Destructor,
    records: AtomicPtr<Record>,
    n_free: AtomicUsize,
    n_subscribers: AtomicUsize,
}

unsafe impl Send for Domain {}
unsafe impl Sync for Domain {}

impl Domain {
    /// Create a domain.
    ///
    /// `degree` is the number of publication slots per record and is
    /// fixed for the domain's lifetime. `threshold` is the pending-
    /// object count at which [`retire_and_maybe_reclaim`]
    /// (RecordRef::retire_and_maybe_reclaim) triggers a scan.
    pub fn new(degree: usize, threshold: usize, destructor: Destructor) -> Self {
        Self {
            degree,
            threshold,
            destructor,
            records: AtomicPtr::new(ptr::null_mut()),
            n_free: AtomicUsize::new(0),
            n_subscribers: AtomicUsize::new(0),
        }
    }

    /// Publication slots per record.
    #[inline]
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Number of registered records currently in the free state.
    #[inline]
    pub fn free_records(&self) -> usize {
        self.n_free.load(Ordering::Acquire)
    }

    /// Total records ever registered into the domain.
    #[inline]
    pub fn subscribers(&self) -> usize {
        self.n_subscribers.load(Ordering::Acquire)
    }

    /// Register a fresh record for the calling thread.
    pub fn register(&self) -> RecordRef<'_> {
        let record = Box::into_raw(Box::new(Record::new(self.degree)));

        let mut head = self.records.load(Ordering::Relaxed);
        loop {
            // SAFETY: record is unpublished until the CAS below lands.
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

        self.n_subscribers.fetch_add(1, Ordering::SeqCst);
        RecordRef {
            domain: self,
            record,
        }
    }

    /// Adopt a previously unregistered record, or `None` when none are
    /// free. Supports elastic thread populations without unbounded
    /// record growth.
    pub fn recycle(&self) -> Option<RecordRef<'_>> {
        let mut cursor = self.records.load(Ordering::Acquire);

        while !cursor.is_null() {
            // SAFETY: records are never freed while the domain lives.
            let record = unsafe { &*cursor };
            if record.state.load(Ordering::Acquire) == STATE_FREE
                && record
                    .state
                    .compare_exchange(STATE_FREE, STATE_USED, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
            {
                self.n_free.fetch_sub(1, Ordering::SeqCst);
                return Some(RecordRef {
                    domain: self,
                    record: cursor,
                });
            }
            cursor = record.next.load(Ordering::Acquire);
        }

        None
    }

    /// Snapshot every pointer currently published by a used record.
    fn collect_hazards(&self, cache: &mut Vec<*mut ()>) {
        cache.clear();
        let mut cursor = self.records.load(Ordering::Acquire);

        while !cursor.is_null() {
            // SAFETY: records are never freed while the domain lives.
            let record = unsafe { &*cursor };
            for slot in record.slots.iter() {
                // A record that flips to free mid-scan has cleared its
                // slots; stop reading it.
                if record.state.load(Ordering::Acquire) == STATE_FREE {
                    break;
                }
                let p = slot.load(Ordering::Acquire);
                if !p.is_null() {
                    cache.push(p);
                }
            }
            cursor = record.next.load(Ordering::Acquire);
        }
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        // Exclusive access: no slot can be published anymore, so every
        // pending object is unreachable and destroyed here; the records
        // themselves follow.
        let mut cursor = *self.records.get_mut();
        while !cursor.is_null() {
            unsafe {
                let record = Box::from_raw(cursor);
                cursor = record.next.load(Ordering::Relaxed);
                for retired in (*record.pending.get()).drain(..) {
                    (self.destructor)(retired.pointer, retired.context);
                }
            }
        }
    }
}

/// A thread's handle to its registered record.
///
/// Not `Send`: the record belongs to the registering thread until the
/// handle is dropped (which unregisters it).
pub struct RecordRef<'d> {
    domain: &'d Domain,
    record: *mut Record,
}

impl<'d> RecordRef<'d> {
    #[inline]
    fn record(&self) -> &Record {
        // SAFETY: the record outlives the handle.
        unsafe { &*self.record }
    }

    /// Publish `p` into `slot` with no ordering.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range for the domain's degree.
    #[inline]
    pub fn publish(&self, slot: usize, p: *mut ()) {
        self.record().slots[slot].store(p, Ordering::Relaxed);
    }

    /// Publish `p` into `slot` with store-load serialization: after
    /// this returns, a load of the protected structure observes any
    /// producer store that preceded the installation of `p`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range.
    #[inline]
    pub fn publish_fence(&self, slot: usize, p: *mut ()) {
        cfg_if::cfg_if! {
            if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
                // On TSO a locked exchange serializes the store buffer.
                self.record().slots[slot].swap(p, Ordering::SeqCst);
            } else {
                self.record().slots[slot].store(p, Ordering::SeqCst);
                crate::pr::fence_full();
            }
        }
    }

    /// Clear every publication slot.
    #[inline]
    pub fn clear(&self) {
        for slot in self.record().slots.iter() {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// Current pending-object count.
    #[inline]
    pub fn pending(&self) -> usize {
        // SAFETY: pending belongs to the owning thread.
        unsafe { (*self.record().pending.get()).len() }
    }

    /// Highest pending-object count observed.
    #[inline]
    pub fn peak(&self) -> usize {
        self.record().n_peak.get()
    }

    /// Total objects destroyed through this record.
    #[inline]
    pub fn reclaimed(&self) -> u64 {
        self.record().n_reclaimed.get()
    }

    /// Append `(p, ctx)` to the pending list without scanning.
    ///
    /// # Safety
    ///
    /// `p` must be unlinked from every shared structure: no thread may
    /// install it anew after this call.
    pub unsafe fn retire(&self, p: *mut (), ctx: *mut ()) {
        let pending = &mut *self.record().pending.get();
        pending.push(Retired {
            pointer: p,
            context: ctx,
        });

        let record = self.record();
        if pending.len() > record.n_peak.get() {
            record.n_peak.set(pending.len());
        }
    }

    /// Retire `(p, ctx)`, then scan if the pending count has reached
    /// the domain threshold.
    ///
    /// # Safety
    ///
    /// As for [`retire`](Self::retire).
    pub unsafe fn retire_and_maybe_reclaim(&self, p: *mut (), ctx: *mut ()) {
        self.retire(p, ctx);
        if self.pending() >= self.domain.threshold {
            self.reclaim();
        }
    }

    /// Scan the domain and destroy every pending object no record
    /// protects. Returns the number destroyed.
    pub fn reclaim(&self) -> usize {
        let mut cache = Vec::with_capacity(HAZARD_CACHE);
        self.domain.collect_hazards(&mut cache);

        // SAFETY: pending belongs to the owning thread; the hazard
        // snapshot was taken after every retired object became
        // unreachable.
        let pending = unsafe { &mut *self.record().pending.get() };
        let before = pending.len();
        let destructor = self.domain.destructor;

        pending.retain(|retired| {
            if cache.contains(&retired.pointer) {
                return true;
            }
            // SAFETY: unreachable and unprotected.
            unsafe { destructor(retired.pointer, retired.context) };
            false
        });

        let destroyed = before - pending.len();
        if destroyed > 0 {
            let record = self.record();
            record
                .n_reclaimed
                .set(record.n_reclaimed.get() + destroyed as u64);
            log::trace!(
                "hp reclaim: destroyed {} of {} pending, {} deferred",
                destroyed,
                before,
                pending.len()
            );
        }
        destroyed
    }

    /// Repeat [`reclaim`](Self::reclaim) until a pass destroys nothing.
    pub fn purge(&self) {
        while self.pending() > 0 {
            if self.reclaim() == 0 {
                break;
            }
            crate::pr::stall();
        }
    }

    /// Unregister the record, returning it to the domain's free pool.
    /// Equivalent to dropping the handle.
    pub fn unregister(self) {}
}

impl Drop for RecordRef<'_> {
    fn drop(&mut self) {
        self.clear();
        crate::pr::fence_store();
        self.record().state.store(STATE_FREE, Ordering::Release);
        self.domain.n_free.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize as StdAtomicUsize;

    unsafe fn counting_destructor(p: *mut (), ctx: *mut ()) {
        let counter = &*(ctx as *const StdAtomicUsize);
        counter.fetch_add(1, Ordering::SeqCst);
        drop(Box::from_raw(p as *mut u64));
    }

    fn retired_u64(v: u64) -> *mut () {
        Box::into_raw(Box::new(v)) as *mut ()
    }

    #[test]
    fn test_register_and_recycle() {
        let domain = Domain::new(2, 4, counting_destructor);
        assert_eq!(domain.degree(), 2);

        let record = domain.register();
        assert_eq!(domain.subscribers(), 1);
        assert_eq!(domain.free_records(), 0);
        drop(record);
        assert_eq!(domain.free_records(), 1);

        let recycled = domain.recycle().expect("free record available");
        assert_eq!(domain.free_records(), 0);
        assert_eq!(domain.subscribers(), 1);
        drop(recycled);

        assert!(domain.recycle().is_some());
    }

    #[test]
    fn test_protected_object_survives_reclaim() {
        let counter = StdAtomicUsize::new(0);
        let ctx = &counter as *const StdAtomicUsize as *mut ();

        let domain = Domain::new(1, 64, counting_destructor);
        let reader = domain.register();
        let writer = domain.register();

        let p = retired_u64(42);
        reader.publish_fence(0, p);

        unsafe { writer.retire(p, ctx) };
        writer.reclaim();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(writer.pending(), 1);

        reader.clear();
        writer.reclaim();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(writer.pending(), 0);
        assert_eq!(writer.reclaimed(), 1);
    }

    #[test]
    fn test_threshold_triggers_scan() {
        let counter = StdAtomicUsize::new(0);
        let ctx = &counter as *const StdAtomicUsize as *mut ();

        let domain = Domain::new(1, 3, counting_destructor);
        let record = domain.register();

        unsafe {
            record.retire_and_maybe_reclaim(retired_u64(1), ctx);
            record.retire_and_maybe_reclaim(retired_u64(2), ctx);
            assert_eq!(counter.load(Ordering::SeqCst), 0);

            record.retire_and_maybe_reclaim(retired_u64(3), ctx);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(record.peak(), 3);
    }

    #[test]
    fn test_unregistered_record_slots_ignored() {
        let counter = StdAtomicUsize::new(0);
        let ctx = &counter as *const StdAtomicUsize as *mut ();

        let domain = Domain::new(1, 64, counting_destructor);
        let reader = domain.register();
        let writer = domain.register();

        let p = retired_u64(7);
        reader.publish_fence(0, p);
        // Unregistering clears the publication; the object is fair
        // game immediately after.
        drop(reader);

        unsafe { writer.retire(p, ctx) };
        writer.reclaim();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_purge_drains() {
        let counter = StdAtomicUsize::new(0);
        let ctx = &counter as *const StdAtomicUsize as *mut ();

        let domain = Domain::new(1, 1024, counting_destructor);
        let record = domain.register();

        unsafe {
            for v in 0..10 {
                record.retire(retired_u64(v), ctx);
            }
        }
        assert_eq!(record.pending(), 10);

        record.purge();
        assert_eq!(record.pending(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_domain_drop_destroys_remaining() {
        static DROPS: StdAtomicUsize = StdAtomicUsize::new(0);
        let ctx = &DROPS as *const StdAtomicUsize as *mut ();

        {
            let domain = Domain::new(1, 1024, counting_destructor);
            let record = domain.register();
            unsafe {
                record.retire(retired_u64(1), ctx);
                record.retire(retired_u64(2), ctx);
            }
            drop(record);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_protection_race() {
        use std::sync::Arc;

        // A writer retires objects while a reader protects and releases
        // them; nothing protected may be destroyed while published.
        let counter = Arc::new(StdAtomicUsize::new(0));
        let domain = Arc::new(Domain::new(1, 8, counting_destructor));

        let reader_domain = Arc::clone(&domain);
        let shared = Arc::new(core::sync::atomic::AtomicPtr::new(ptr::null_mut::<u64>()));

        let publisher = {
            let shared = Arc::clone(&shared);
            let counter = Arc::clone(&counter);
            let domain = Arc::clone(&domain);
            std::thread::spawn(move || {
                let writer = domain.register();
                let ctx = Arc::as_ptr(&counter) as *mut ();
                for v in 0..200u64 {
                    let fresh = Box::into_raw(Box::new(v));
                    let old = shared.swap(fresh, Ordering::SeqCst);
                    if !old.is_null() {
                        unsafe {
                            writer.retire_and_maybe_reclaim(old as *mut (), ctx);
                        }
                    }
                }
                let last = shared.swap(ptr::null_mut(), Ordering::SeqCst);
                if !last.is_null() {
                    unsafe { writer.retire(last as *mut (), ctx) };
                }
                // Objects the reader still protects stay pending; the
                // domain destroys them on drop.
                writer.purge();
            })
        };

        let consumer = std::thread::spawn(move || {
            let record = reader_domain.register();
            for _ in 0..500 {
                let p = shared.load(Ordering::Acquire);
                if p.is_null() {
                    continue;
                }
                record.publish_fence(0, p as *mut ());
                // Validate the protection is still current before
                // dereferencing.
                if shared.load(Ordering::SeqCst) == p {
                    let v = unsafe { *p };
                    assert!(v < 200);
                }
                record.clear();
            }
        });

        publisher.join().unwrap();
        consumer.join().unwrap();

        // Whatever the racing purge left behind is destroyed when the
        // last domain handle drops; only then is the count exact.
        drop(domain);
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }
}
