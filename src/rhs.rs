//! Robin-Hood hash set.
//!
//! Open addressing with linear probing where displacement is decided by
//! probe distance: an inserting entry evicts any resident that sits
//! closer to its home slot, which keeps probe chains short and variance
//! low.
//!
//! Single-writer, multi-reader. Structural moves are ordered so a
//! reader probing mid-displacement sees an entry duplicated for a
//! moment, never absent: shifts copy into the destination slot before
//! the source is overwritten, and the trailing empty slot is consumed
//! before any hole opens inside a probe chain.
//!
//! Removed entries and superseded bucket arrays are parked on internal
//! garbage lists; [`purge`](RobinHoodSet::purge) releases them once the
//! caller knows no reader is left in the structure.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::hash::{Hash, Hasher};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

const DEFAULT_CAPACITY: usize = 16;

struct Entry<T> {
    hash: u64,
    value: T,
}

struct Buckets<T> {
    slots: Box<[AtomicPtr<Entry<T>>]>,
}

impl<T> Buckets<T> {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || AtomicPtr::new(ptr::null_mut()));
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Probe distance of an entry found at `index`.
    #[inline]
    fn distance(&self, index: usize, hash: u64) -> usize {
        let home = (hash as usize) & self.mask();
        index.wrapping_sub(home) & self.mask()
    }
}

/// FNV-1a, the probing hash.
#[derive(Default)]
struct FnvHasher {
    state: u64,
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut state = if self.state == 0 {
            0xcbf29ce484222325
        } else {
            self.state
        };
        for &byte in bytes {
            state ^= byte as u64;
            state = state.wrapping_mul(0x100000001b3);
        }
        self.state = state;
    }
}

/// A single-writer, concurrently-readable Robin-Hood hash set.
pub struct RobinHoodSet<T> {
    buckets: AtomicPtr<Buckets<T>>,
    n_entries: AtomicUsize,
    removed: UnsafeCell<Vec<*mut Entry<T>>>,
    superseded: UnsafeCell<Vec<*mut Buckets<T>>>,
}

unsafe impl<T: Send + Sync> Send for RobinHoodSet<T> {}
unsafe impl<T: Send + Sync> Sync for RobinHoodSet<T> {}

impl<T: Hash + Eq> Default for RobinHoodSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Hash + Eq> RobinHoodSet<T> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty set with at least `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(DEFAULT_CAPACITY);
        Self {
            buckets: AtomicPtr::new(Box::into_raw(Box::new(Buckets::new(capacity)))),
            n_entries: AtomicUsize::new(0),
            removed: UnsafeCell::new(Vec::new()),
            superseded: UnsafeCell::new(Vec::new()),
        }
    }

    fn hash_of(value: &T) -> u64 {
        let mut hasher = FnvHasher::default();
        value.hash(&mut hasher);
        hasher.finish()
    }

    /// Number of resident entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.n_entries.load(Ordering::Acquire)
    }

    /// Whether the set is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Membership probe. Safe for any thread.
    pub fn contains(&self, value: &T) -> bool {
        let hash = Self::hash_of(value);
        // SAFETY: the bucket array is only released by purge/drop,
        // which the caller's reclamation discipline orders after reads.
        let buckets = unsafe { &*self.buckets.load(Ordering::Acquire) };
        crate::pr::fence_load();

        let mask = buckets.mask();
        let mut index = (hash as usize) & mask;

        for probe in 0..buckets.slots.len() {
            let entry_ptr = buckets.slots[index].load(Ordering::Acquire);
            if entry_ptr.is_null() {
                return false;
            }

            // SAFETY: entries outlive their visibility in any array.
            let entry = unsafe { &*entry_ptr };
            if entry.hash == hash && entry.value == *value {
                return true;
            }
            // Robin-Hood invariant: anything homed closer would have
            // displaced the resident by now.
            if buckets.distance(index, entry.hash) < probe {
                return false;
            }

            index = (index + 1) & mask;
        }
        false
    }

    /// Insert `value`. Returns false when already present or when the
    /// grown bucket array could not be allocated.
    ///
    /// # Safety
    ///
    /// Single writer.
    pub unsafe fn insert(&self, value: T) -> bool {
        if self.contains(&value) {
            return false;
        }

        let n = self.n_entries.load(Ordering::Relaxed);
        let buckets = &*self.buckets.load(Ordering::Relaxed);
        if (n + 1) * 2 > buckets.slots.len() {
            self.grow(buckets.slots.len() * 2);
        }

        let hash = Self::hash_of(&value);
        let entry = Box::into_raw(Box::new(Entry { hash, value }));

        let buckets = &*self.buckets.load(Ordering::Relaxed);
        Self::place(buckets, entry);
        self.n_entries.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Robin-Hood placement with reader-safe right shifts.
    unsafe fn place(buckets: &Buckets<T>, entry: *mut Entry<T>) {
        let mask = buckets.mask();
        let hash = (*entry).hash;
        let mut index = (hash as usize) & mask;
        let mut distance = 0;

        // Find the insertion point: the first slot that is empty or
        // holds a resident closer to home than we are.
        loop {
            let resident = buckets.slots[index].load(Ordering::Relaxed);
            if resident.is_null() {
                crate::pr::fence_store();
                buckets.slots[index].store(entry, Ordering::Release);
                return;
            }
            if buckets.distance(index, (*resident).hash) < distance {
                break;
            }
            index = (index + 1) & mask;
            distance += 1;
        }

        // Locate the cluster's trailing empty slot.
        let mut end = index;
        loop {
            end = (end + 1) & mask;
            if buckets.slots[end].load(Ordering::Relaxed).is_null() {
                break;
            }
        }

        // Shift the cluster right, tail first: every store lands in its
        // destination before the source is overwritten, so a concurrent
        // probe sees duplicates, never gaps.
        crate::pr::fence_store();
        let mut dst = end;
        while dst != index {
            let src = dst.wrapping_sub(1) & mask;
            let moving = buckets.slots[src].load(Ordering::Relaxed);
            buckets.slots[dst].store(moving, Ordering::Release);
            dst = src;
        }
        buckets.slots[index].store(entry, Ordering::Release);
    }

    /// Remove `value`. Returns false when absent. The entry's memory is
    /// parked until [`purge`](Self::purge) or drop.
    ///
    /// # Safety
    ///
    /// Single writer.
    pub unsafe fn remove(&self, value: &T) -> bool {
        let hash = Self::hash_of(value);
        let buckets = &*self.buckets.load(Ordering::Relaxed);
        let mask = buckets.mask();
        let mut index = (hash as usize) & mask;

        for probe in 0..buckets.slots.len() {
            let entry_ptr = buckets.slots[index].load(Ordering::Relaxed);
            if entry_ptr.is_null() {
                return false;
            }

            let entry = &*entry_ptr;
            if entry.hash == hash && entry.value == *value {
                self.backward_shift(buckets, index);
                (*self.removed.get()).push(entry_ptr);
                self.n_entries.fetch_sub(1, Ordering::SeqCst);
                return true;
            }
            if buckets.distance(index, entry.hash) < probe {
                return false;
            }

            index = (index + 1) & mask;
        }
        false
    }

    /// Close the hole at `index` by sliding successors back toward
    /// their homes until a slot is empty or at distance zero.
    unsafe fn backward_shift(&self, buckets: &Buckets<T>, mut index: usize) {
        let mask = buckets.mask();

        loop {
            let next = (index + 1) & mask;
            let successor = buckets.slots[next].load(Ordering::Relaxed);

            if successor.is_null() || buckets.distance(next, (*successor).hash) == 0 {
                buckets.slots[index].store(ptr::null_mut(), Ordering::Release);
                return;
            }

            // Copy before erasing: the successor is momentarily in two
            // slots, which readers tolerate.
            buckets.slots[index].store(successor, Ordering::Release);
            index = next;
        }
    }

    /// Rehash into a bucket array of `capacity` slots; the superseded
    /// array is parked for [`purge`](Self::purge).
    unsafe fn grow(&self, capacity: usize) {
        let old = self.buckets.load(Ordering::Relaxed);
        let fresh = Box::into_raw(Box::new(Buckets::new(capacity)));

        for slot in (*old).slots.iter() {
            let entry = slot.load(Ordering::Relaxed);
            if !entry.is_null() {
                Self::place(&*fresh, entry);
            }
        }

        crate::pr::fence_store();
        self.buckets.store(fresh, Ordering::Release);
        (*self.superseded.get()).push(old);
    }

    /// Release removed entries and superseded bucket arrays.
    ///
    /// # Safety
    ///
    /// No reader may be inside the set: a concurrent probe could still
    /// hold a superseded array or a removed entry.
    pub unsafe fn purge(&self) {
        for entry in (*self.removed.get()).drain(..) {
            drop(Box::from_raw(entry));
        }
        for buckets in (*self.superseded.get()).drain(..) {
            drop(Box::from_raw(buckets));
        }
    }
}

impl<T> Drop for RobinHoodSet<T> {
    fn drop(&mut self) {
        unsafe {
            let buckets = Box::from_raw(self.buckets.load(Ordering::Relaxed));
            for slot in buckets.slots.iter() {
                let entry = slot.load(Ordering::Relaxed);
                if !entry.is_null() {
                    drop(Box::from_raw(entry));
                }
            }
            for entry in (*self.removed.get()).drain(..) {
                drop(Box::from_raw(entry));
            }
            for superseded in (*self.superseded.get()).drain(..) {
                drop(Box::from_raw(superseded));
            }
        }
    }
}
