//! Bounded ring buffers.
//!
//! Power-of-two circular buffers:
//!
//! - [`SpscRing`]: single-producer/single-consumer, one slot sacrificed
//!   to tell full from empty, plain head/tail indices.
//! - [`MpmcRing`]: multi-producer/multi-consumer with a per-slot
//!   sequence word; producers and consumers reserve slots by CAS on the
//!   shared indices and hand off through the sequence.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Single-producer, single-consumer ring.
pub struct SpscRing<T, const N: usize> {
    buffer: [UnsafeCell<MaybeUninit<T>>; N],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl<T, const N: usize> SpscRing<T, N> {
    /// Create an empty ring.
    ///
    /// # Panics
    ///
    /// Panics unless `N` is a nonzero power of two.
    pub fn new() -> Self {
        assert!(N > 0 && N.is_power_of_two());
        Self {
            buffer: core::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Usable capacity; one slot distinguishes full from empty.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    /// Whether the ring is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Enqueue, handing `value` back on a full ring.
    ///
    /// # Safety
    ///
    /// Producer thread only.
    pub unsafe fn enqueue(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) & (N - 1);

        if next == self.head.load(Ordering::Acquire) {
            return Err(value);
        }

        (*self.buffer[tail].get()).write(value);
        crate::pr::fence_store();
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Dequeue, or `None` when empty.
    ///
    /// # Safety
    ///
    /// Consumer thread only.
    pub unsafe fn dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }

        crate::pr::fence_load();
        let value = (*self.buffer[head].get()).assume_init_read();
        self.head.store((head + 1) & (N - 1), Ordering::Release);
        Some(value)
    }
}

impl<T, const N: usize> Default for SpscRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<T: Send, const N: usize> Send for SpscRing<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for SpscRing<T, N> {}

impl<T, const N: usize> Drop for SpscRing<T, N> {
    fn drop(&mut self) {
        // Exclusive access: drain the resident values.
        let mut head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        while head != tail {
            unsafe { (*self.buffer[head].get()).assume_init_drop() };
            head = (head + 1) & (N - 1);
        }
    }
}

// ============================================================================
// MPMC variant
// ============================================================================

struct MpmcSlot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Multi-producer, multi-consumer bounded ring.
///
/// Each slot carries a sequence word: `index` means free for the
/// producer of that index, `index + 1` means occupied for the matching
/// consumer. Reservation is a CAS on the shared index; the sequence
/// store publishes the slot.
pub struct MpmcRing<T> {
    slots: Box<[MpmcSlot<T>]>,
    mask: usize,
    enqueue_index: AtomicUsize,
    dequeue_index: AtomicUsize,
}

impl<T> MpmcRing<T> {
    /// Create an empty ring of `capacity` slots.
    ///
    /// # Panics
    ///
    /// Panics unless `capacity` is a nonzero power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity.is_power_of_two());

        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(MpmcSlot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }

        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            enqueue_index: AtomicUsize::new(0),
            dequeue_index: AtomicUsize::new(0),
        }
    }

    /// Slot count.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Enqueue, handing `value` back on a full ring.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let mut index = self.enqueue_index.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[index & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);

            if sequence == index {
                match self.enqueue_index.compare_exchange_weak(
                    index,
                    index + 1,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // Reserved: fill and publish.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(index + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(witness) => index = witness,
                }
            } else if sequence < index {
                // The slot still holds a value a full lap behind.
                return Err(value);
            } else {
                index = self.enqueue_index.load(Ordering::Relaxed);
            }

            crate::pr::stall();
        }
    }

    /// Dequeue, or `None` when empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut index = self.dequeue_index.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[index & self.mask];
            let sequence = slot.sequence.load(Ordering::Acquire);

            if sequence == index + 1 {
                match self.dequeue_index.compare_exchange_weak(
                    index,
                    index + 1,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        crate::pr::fence_load();
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        // Free the slot for the producer one lap ahead.
                        slot.sequence
                            .store(index + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(witness) => index = witness,
                }
            } else if sequence <= index {
                return None;
            } else {
                index = self.dequeue_index.load(Ordering::Relaxed);
            }

            crate::pr::stall();
        }
    }
}

unsafe impl<T: Send> Send for MpmcRing<T> {}
unsafe impl<T: Send> Sync for MpmcRing<T> {}

impl<T> Drop for MpmcRing<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spsc_fill_and_drain() {
        let ring: SpscRing<i32, 4> = SpscRing::new();
        assert_eq!(ring.capacity(), 3);

        unsafe {
            assert!(ring.enqueue(1).is_ok());
            assert!(ring.enqueue(2).is_ok());
            assert!(ring.enqueue(3).is_ok());
            assert_eq!(ring.enqueue(4), Err(4));

            assert_eq!(ring.dequeue(), Some(1));
            assert_eq!(ring.dequeue(), Some(2));
            assert_eq!(ring.dequeue(), Some(3));
            assert_eq!(ring.dequeue(), None);
        }
    }

    #[test]
    fn test_spsc_wrap_around() {
        let ring: SpscRing<i32, 4> = SpscRing::new();
        unsafe {
            for lap in 0..10 {
                ring.enqueue(lap * 2).unwrap();
                ring.enqueue(lap * 2 + 1).unwrap();
                assert_eq!(ring.dequeue(), Some(lap * 2));
                assert_eq!(ring.dequeue(), Some(lap * 2 + 1));
            }
            assert!(ring.is_empty());
        }
    }

    #[test]
    fn test_spsc_drop_drains() {
        let ring: SpscRing<alloc::string::String, 8> = SpscRing::new();
        unsafe {
            ring.enqueue(alloc::string::String::from("resident")).unwrap();
        }
        // Dropping must release the resident element.
    }

    #[test]
    fn test_mpmc_basics() {
        let ring: MpmcRing<i32> = MpmcRing::new(4);
        assert_eq!(ring.capacity(), 4);
        assert!(ring.dequeue().is_none());

        for v in 0..4 {
            assert!(ring.enqueue(v).is_ok());
        }
        assert_eq!(ring.enqueue(99), Err(99));

        for v in 0..4 {
            assert_eq!(ring.dequeue(), Some(v));
        }
        assert!(ring.dequeue().is_none());
    }

    #[test]
    fn test_mpmc_threaded_multiset() {
        use std::collections::HashSet;
        use std::sync::{Arc, Mutex};

        const PRODUCERS: usize = 2;
        const CONSUMERS: usize = 2;
        const PER_PRODUCER: usize = 2000;

        let ring: Arc<MpmcRing<usize>> = Arc::new(MpmcRing::new(64));
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = alloc::vec::Vec::new();
        for p in 0..PRODUCERS {
            let ring = Arc::clone(&ring);
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut v = p * PER_PRODUCER + i;
                    loop {
                        match ring.enqueue(v) {
                            Ok(()) => break,
                            Err(back) => {
                                v = back;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }
        for _ in 0..CONSUMERS {
            let ring = Arc::clone(&ring);
            let seen = Arc::clone(&seen);
            handles.push(std::thread::spawn(move || {
                let mut local = alloc::vec::Vec::new();
                while local.len() < PER_PRODUCER {
                    if let Some(v) = ring.dequeue() {
                        local.push(v);
                    } else {
                        std::thread::yield_now();
                    }
                }
                let mut seen = seen.lock().unwrap();
                for v in local {
                    assert!(seen.insert(v), "value {} dequeued twice", v);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(seen.lock().unwrap().len(), PRODUCERS * PER_PRODUCER);
    }
}
