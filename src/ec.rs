//! Event counts.
//!
//! An event count is a monotonically increasing counter that threads can
//! wait on cheaply: waiters spin briefly, then advertise themselves by
//! setting a flag bit inside the counter word, then park on a futex.
//! Producers pay a single fetch-and-add when no waiter is present and
//! one extra wake call when the flag was up.
//!
//! Two widths with different flag placements:
//!
//! - [`Ec32`]: the flag is the most significant bit; the value is the
//!   low 31 bits.
//! - [`Ec64`]: the flag is the *least* significant bit and the value is
//!   `counter >> 1`. That keeps the flag inside the low four bytes of
//!   the word, so a 32-bit futex primitive can address it on
//!   little-endian targets.
//!
//! Platform bindings (clock, futex wait/wake) and tunables arrive
//! through an [`EcOps`] vector; [`EcMode`] binds the vector with the
//! single-producer flag. On x86 targets, single-producer increments take
//! a non-atomic read-modify-write fast path: the instruction cannot be
//! split by preemption and total store order guarantees the producer's
//! next load observes a concurrently-set flag.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use static_assertions::const_assert_eq;

/// Default busy-wait iterations before a waiter escalates to the futex.
pub const BUSY_LOOP_ITER: u32 = 100;

/// Default first futex sleep, in nanoseconds (~2 ms).
pub const INITIAL_WAIT_NS: u64 = 2_000_000;

/// Wall-time horizon after which waiters sleep without timeout: past
/// one second, the producer is architecturally guaranteed to observe
/// the flag on its next increment, so no wakeup can be lost.
const ESCALATION_NS: u64 = 1_000_000_000;

/// Sentinel for "no deadline".
pub const FOREVER: u64 = u64::MAX;

const FLAG32: u32 = 1 << 31;
const VALUE32: u32 = FLAG32 - 1;
const FLAG64: u64 = 1;

/// Platform operations vector for event counts.
///
/// `wait32`/`wait64` park the caller while the word still equals the
/// expected value, waking on change, timeout (relative nanoseconds;
/// `None` is unbounded), or spuriously. `wake32`/`wake64` wake all
/// parked waiters for the word.
pub struct EcOps {
    /// Monotonic clock, nanoseconds.
    pub gettime: fn() -> u64,
    /// Futex-style wait on a 32-bit word.
    pub wait32: fn(&AtomicU32, u32, Option<u64>),
    /// Futex-style wait on a 64-bit word (typically its low half).
    pub wait64: fn(&AtomicU64, u64, Option<u64>),
    /// Wake all waiters on a 32-bit word.
    pub wake32: fn(&AtomicU32),
    /// Wake all waiters on a 64-bit word.
    pub wake64: fn(&AtomicU64),
    /// Spin iterations before the first sleep.
    pub busy_loop_iter: u32,
    /// First sleep duration, nanoseconds.
    pub initial_wait_ns: u64,
    /// Numerator for the geometric sleep scale.
    pub wait_scale_factor: u32,
    /// Right-shift applied to the scaled sleep multiplier.
    pub wait_shift_count: u32,
}

/// An ops vector bound to a producer discipline.
pub struct EcMode {
    /// Platform bindings and tunables.
    pub ops: &'static EcOps,
    /// Whether exactly one thread increments this event count.
    pub single_producer: bool,
}

impl EcMode {
    /// Mode for a single incrementing thread.
    pub const fn single_producer(ops: &'static EcOps) -> Self {
        Self {
            ops,
            single_producer: true,
        }
    }

    /// Mode for concurrent incrementers.
    pub const fn multi_producer(ops: &'static EcOps) -> Self {
        Self {
            ops,
            single_producer: false,
        }
    }
}

/// Absolute deadline for a wait: now plus `timeout_ns`, or [`FOREVER`].
pub fn deadline(mode: &EcMode, timeout_ns: Option<u64>) -> u64 {
    match timeout_ns {
        None => FOREVER,
        Some(t) => (mode.ops.gettime)().saturating_add(t),
    }
}

#[inline]
fn scaled_wait_ns(ops: &EcOps, sleeps: u32) -> u64 {
    let multiplier =
        ((sleeps as u64).saturating_mul(ops.wait_scale_factor as u64)) >> ops.wait_shift_count;
    ops.initial_wait_ns.saturating_mul(multiplier.max(1))
}

// ============================================================================
// 32-bit event count
// ============================================================================

/// A 32-bit event count; flag in the sign bit, value in the low 31.
#[repr(transparent)]
pub struct Ec32 {
    counter: AtomicU32,
}

const_assert_eq!(core::mem::size_of::<Ec32>(), 4);

impl Ec32 {
    /// Create an event count at `value`.
    pub const fn new(value: u32) -> Self {
        Self {
            counter: AtomicU32::new(value & VALUE32),
        }
    }

    /// Current value; never exceeds `i32::MAX as u32`.
    #[inline]
    pub fn value(&self) -> u32 {
        self.counter.load(Ordering::Acquire) & VALUE32
    }

    /// Whether some waiter has advertised itself since the last wake.
    #[inline]
    pub fn has_waiters(&self) -> bool {
        self.counter.load(Ordering::Acquire) & FLAG32 != 0
    }

    /// Increment by one.
    #[inline]
    pub fn inc(&self, mode: &EcMode) {
        self.add(mode, 1);
    }

    /// Add `delta`, returning the previous value. Wakes waiters when
    /// the flag was observed set.
    pub fn add(&self, mode: &EcMode, delta: u32) -> u32 {
        crate::pr::fence_store();

        let old = if mode.single_producer {
            sp::xadd32(&self.counter, delta)
        } else {
            self.counter.fetch_add(delta, Ordering::SeqCst)
        };

        if old & FLAG32 != 0 {
            self.wake(mode.ops);
        }
        old & VALUE32
    }

    fn wake(&self, ops: &EcOps) {
        // Drop the flag before waking; late sleepers re-raise it.
        self.counter.fetch_and(VALUE32, Ordering::SeqCst);
        (ops.wake32)(&self.counter);
    }

    /// Wait until the value moves away from `old_value`, the absolute
    /// `deadline_ns` passes (−1), or forever if [`FOREVER`].
    pub fn wait(&self, mode: &EcMode, old_value: u32, deadline_ns: u64) -> i32 {
        self.wait_pred(mode, old_value, |_| 0, deadline_ns)
    }

    /// As [`wait`](Self::wait), but `pred` runs before every futex
    /// call. A non-zero return short-circuits the wait and is returned
    /// verbatim; the predicate may tighten or extend the per-iteration
    /// deadline through its argument.
    pub fn wait_pred<F>(
        &self,
        mode: &EcMode,
        old_value: u32,
        mut pred: F,
        deadline_ns: u64,
    ) -> i32
    where
        F: FnMut(&mut u64) -> i32,
    {
        let ops = mode.ops;
        if self.value() != old_value {
            return 0;
        }

        for _ in 0..ops.busy_loop_iter {
            crate::pr::stall();
            if self.value() != old_value {
                return 0;
            }
        }

        let start = (ops.gettime)();
        let flagged = old_value | FLAG32;
        let mut sleeps = 0u32;

        loop {
            // Raise the flag while the value still holds; any witness
            // with a different value means we are done.
            let witness = match self.counter.compare_exchange(
                old_value,
                flagged,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => flagged,
                Err(w) => w,
            };
            if witness & VALUE32 != old_value {
                return 0;
            }

            let now = (ops.gettime)();
            if now >= deadline_ns {
                return -1;
            }

            sleeps = sleeps.saturating_add(1);
            let mut iter_deadline = if now.saturating_sub(start) >= ESCALATION_NS {
                log::trace!("ec32 waiter escalating to unbounded sleep");
                FOREVER
            } else {
                now.saturating_add(scaled_wait_ns(ops, sleeps))
            };
            if iter_deadline > deadline_ns {
                iter_deadline = deadline_ns;
            }

            let verdict = pred(&mut iter_deadline);
            if verdict != 0 {
                return verdict;
            }

            let timeout = if iter_deadline == FOREVER {
                None
            } else {
                Some(iter_deadline.saturating_sub(now))
            };
            (ops.wait32)(&self.counter, flagged, timeout);

            if self.value() != old_value {
                return 0;
            }
        }
    }
}

// ============================================================================
// 64-bit event count
// ============================================================================

/// A 64-bit event count; flag in bit zero, value in the upper 63.
#[repr(transparent)]
pub struct Ec64 {
    counter: AtomicU64,
}

const_assert_eq!(core::mem::size_of::<Ec64>(), 8);
const_assert_eq!(core::mem::align_of::<Ec64>() % core::mem::align_of::<AtomicU32>(), 0);

impl Ec64 {
    /// Create an event count at `value`.
    pub const fn new(value: u64) -> Self {
        Self {
            counter: AtomicU64::new(value << 1),
        }
    }

    /// Current value; never exceeds `i64::MAX as u64`.
    #[inline]
    pub fn value(&self) -> u64 {
        self.counter.load(Ordering::Acquire) >> 1
    }

    /// Whether some waiter has advertised itself since the last wake.
    #[inline]
    pub fn has_waiters(&self) -> bool {
        self.counter.load(Ordering::Acquire) & FLAG64 != 0
    }

    /// Increment by one.
    #[inline]
    pub fn inc(&self, mode: &EcMode) {
        self.add(mode, 1);
    }

    /// Add `delta`, returning the previous value. Wakes waiters when
    /// the flag was observed set.
    pub fn add(&self, mode: &EcMode, delta: u64) -> u64 {
        crate::pr::fence_store();

        // The value lives above the flag bit: a logical delta is a
        // word delta of twice that.
        let word_delta = delta << 1;
        let old = if mode.single_producer {
            sp::xadd64(&self.counter, word_delta)
        } else {
            self.counter.fetch_add(word_delta, Ordering::SeqCst)
        };

        if old & FLAG64 != 0 {
            self.wake(mode.ops);
        }
        old >> 1
    }

    fn wake(&self, ops: &EcOps) {
        self.counter.fetch_and(!FLAG64, Ordering::SeqCst);
        (ops.wake64)(&self.counter);
    }

    /// Wait until the value moves away from `old_value`; see
    /// [`Ec32::wait`].
    pub fn wait(&self, mode: &EcMode, old_value: u64, deadline_ns: u64) -> i32 {
        self.wait_pred(mode, old_value, |_| 0, deadline_ns)
    }

    /// See [`Ec32::wait_pred`].
    pub fn wait_pred<F>(
        &self,
        mode: &EcMode,
        old_value: u64,
        mut pred: F,
        deadline_ns: u64,
    ) -> i32
    where
        F: FnMut(&mut u64) -> i32,
    {
        let ops = mode.ops;
        if self.value() != old_value {
            return 0;
        }

        for _ in 0..ops.busy_loop_iter {
            crate::pr::stall();
            if self.value() != old_value {
                return 0;
            }
        }

        let start = (ops.gettime)();
        let unflagged = old_value << 1;
        let flagged = unflagged | FLAG64;
        let mut sleeps = 0u32;

        loop {
            let witness = match self.counter.compare_exchange(
                unflagged,
                flagged,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => flagged,
                Err(w) => w,
            };
            if witness >> 1 != old_value {
                return 0;
            }

            let now = (ops.gettime)();
            if now >= deadline_ns {
                return -1;
            }

            sleeps = sleeps.saturating_add(1);
            let mut iter_deadline = if now.saturating_sub(start) >= ESCALATION_NS {
                log::trace!("ec64 waiter escalating to unbounded sleep");
                FOREVER
            } else {
                now.saturating_add(scaled_wait_ns(ops, sleeps))
            };
            if iter_deadline > deadline_ns {
                iter_deadline = deadline_ns;
            }

            let verdict = pred(&mut iter_deadline);
            if verdict != 0 {
                return verdict;
            }

            let timeout = if iter_deadline == FOREVER {
                None
            } else {
                Some(iter_deadline.saturating_sub(now))
            };
            (ops.wait64)(&self.counter, flagged, timeout);

            if self.value() != old_value {
                return 0;
            }
        }
    }
}

// ============================================================================
// Single-producer increment fast path
// ============================================================================

mod sp {
    use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
            /// Unlocked exchange-add: a single instruction, so it
            /// cannot be torn by preemption, and TSO orders it before
            /// the producer's next load of the flag.
            #[inline]
            pub(super) fn xadd32(counter: &AtomicU32, delta: u32) -> u32 {
                let mut prev = delta;
                // SAFETY: the single-producer contract rules out
                // concurrent modification of the value bits.
                unsafe {
                    core::arch::asm!(
                        "xadd dword ptr [{ptr}], {prev:e}",
                        ptr = in(reg) counter.as_ptr(),
                        prev = inout(reg) prev,
                        options(nostack),
                    );
                }
                prev
            }
        } else {
            #[inline]
            pub(super) fn xadd32(counter: &AtomicU32, delta: u32) -> u32 {
                counter.fetch_add(delta, Ordering::SeqCst)
            }
        }
    }

    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            #[inline]
            pub(super) fn xadd64(counter: &AtomicU64, delta: u64) -> u64 {
                let mut prev = delta;
                // SAFETY: as for xadd32.
                unsafe {
                    core::arch::asm!(
                        "xadd qword ptr [{ptr}], {prev}",
                        ptr = in(reg) counter.as_ptr(),
                        prev = inout(reg) prev,
                        options(nostack),
                    );
                }
                prev
            }
        } else {
            #[inline]
            pub(super) fn xadd64(counter: &AtomicU64, delta: u64) -> u64 {
                counter.fetch_add(delta, Ordering::SeqCst)
            }
        }
    }
}

// ============================================================================
// Default Linux bindings
// ============================================================================

/// Futex and monotonic-clock bindings for Linux.
#[cfg(target_os = "linux")]
pub mod linux {
    use super::{EcMode, EcOps, BUSY_LOOP_ITER, INITIAL_WAIT_NS};
    use core::ptr;
    use core::sync::atomic::{AtomicU32, AtomicU64};

    fn monotonic_ns() -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid out-parameter.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        (ts.tv_sec as u64).saturating_mul(1_000_000_000) + ts.tv_nsec as u64
    }

    unsafe fn futex_wait_raw(addr: *const u32, expected: u32, timeout_ns: Option<u64>) {
        let ts;
        let ts_ptr = match timeout_ns {
            Some(ns) => {
                ts = libc::timespec {
                    tv_sec: (ns / 1_000_000_000) as libc::time_t,
                    tv_nsec: (ns % 1_000_000_000) as libc::c_long,
                };
                &ts as *const libc::timespec
            }
            None => ptr::null(),
        };

        // Spurious returns (EINTR, EAGAIN) are fine; the caller
        // revalidates the counter.
        libc::syscall(
            libc::SYS_futex,
            addr,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
        );
    }

    unsafe fn futex_wake_raw(addr: *const u32) {
        libc::syscall(
            libc::SYS_futex,
            addr,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            i32::MAX,
        );
    }

    /// The futex-addressable half of a 64-bit word: the half holding
    /// the flag bit and the low value bits.
    #[inline]
    fn flag_half(word: &AtomicU64) -> *const u32 {
        let base = word.as_ptr() as *const u32;
        if cfg!(target_endian = "little") {
            base
        } else {
            // The least significant bytes sit at the high address.
            base.wrapping_add(1)
        }
    }

    fn wait32(word: &AtomicU32, expected: u32, timeout_ns: Option<u64>) {
        unsafe { futex_wait_raw(word.as_ptr(), expected, timeout_ns) };
    }

    fn wake32(word: &AtomicU32) {
        unsafe { futex_wake_raw(word.as_ptr()) };
    }

    fn wait64(word: &AtomicU64, expected: u64, timeout_ns: Option<u64>) {
        unsafe { futex_wait_raw(flag_half(word), expected as u32, timeout_ns) };
    }

    fn wake64(word: &AtomicU64) {
        unsafe { futex_wake_raw(flag_half(word)) };
    }

    /// Default platform vector.
    pub static OPS: EcOps = EcOps {
        gettime: monotonic_ns,
        wait32,
        wait64,
        wake32,
        wake64,
        busy_loop_iter: BUSY_LOOP_ITER,
        initial_wait_ns: INITIAL_WAIT_NS,
        wait_scale_factor: 8,
        wait_shift_count: 2,
    };

    /// Single-producer mode over [`OPS`].
    pub static SP: EcMode = EcMode::single_producer(&OPS);

    /// Multi-producer mode over [`OPS`].
    pub static MP: EcMode = EcMode::multi_producer(&OPS);
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::linux::{MP, SP};
    use super::*;

    #[test]
    fn test_value_and_flag_layout() {
        let ec32 = Ec32::new(5);
        assert_eq!(ec32.value(), 5);
        assert!(!ec32.has_waiters());

        let ec64 = Ec64::new(5);
        assert_eq!(ec64.value(), 5);
        assert!(!ec64.has_waiters());
        // Flag occupies bit zero: the stored word is the value shifted.
        assert_eq!(ec64.counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_add_returns_previous() {
        let ec = Ec32::new(0);
        assert_eq!(ec.add(&MP, 3), 0);
        assert_eq!(ec.add(&SP, 4), 3);
        assert_eq!(ec.value(), 7);

        let ec = Ec64::new(1);
        assert_eq!(ec.add(&MP, 2), 1);
        assert_eq!(ec.add(&SP, 2), 3);
        assert_eq!(ec.value(), 5);
    }

    #[test]
    fn test_wait_returns_immediately_on_stale_value() {
        let ec = Ec32::new(9);
        assert_eq!(ec.wait(&MP, 3, FOREVER), 0);

        let ec = Ec64::new(9);
        assert_eq!(ec.wait(&MP, 3, FOREVER), 0);
    }

    #[test]
    fn test_wait_times_out() {
        let ec = Ec32::new(0);
        let d = deadline(&MP, Some(5_000_000));
        assert_eq!(ec.wait(&MP, 0, d), -1);
        // The advertised flag stays up until the next increment.
        assert!(ec.has_waiters());

        ec.inc(&MP);
        assert!(!ec.has_waiters());
    }

    #[test]
    fn test_wait_pred_short_circuits_verbatim() {
        let ec = Ec64::new(0);
        let verdict = ec.wait_pred(&MP, 0, |_| 42, FOREVER);
        assert_eq!(verdict, 42);
    }

    #[test]
    fn test_wait_pred_can_tighten_deadline() {
        let ec = Ec32::new(0);
        let mut calls = 0;
        let verdict = ec.wait_pred(
            &MP,
            0,
            |iter_deadline| {
                calls += 1;
                // Force an immediate-return sleep each iteration and
                // give up on the third pass.
                *iter_deadline = 0;
                if calls >= 3 {
                    -7
                } else {
                    0
                }
            },
            FOREVER,
        );
        assert_eq!(verdict, -7);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_producer_wakes_waiter() {
        use std::sync::Arc;

        for mode in [&SP, &MP] {
            let ec = Arc::new(Ec32::new(0));

            let waiter = {
                let ec = Arc::clone(&ec);
                std::thread::spawn(move || {
                    let rc = ec.wait(&MP, 0, FOREVER);
                    assert_eq!(rc, 0);
                    assert_eq!(ec.value(), 1);
                })
            };

            // Let the waiter spin past its busy loop and park.
            std::thread::sleep(std::time::Duration::from_millis(20));
            ec.inc(mode);
            waiter.join().unwrap();
        }
    }

    #[test]
    fn test_producer_wakes_waiter_64() {
        use std::sync::Arc;

        let ec = Arc::new(Ec64::new(0));
        let waiter = {
            let ec = Arc::clone(&ec);
            std::thread::spawn(move || {
                let rc = ec.wait(&MP, 0, FOREVER);
                assert_eq!(rc, 0);
                assert!(ec.value() >= 1);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        ec.inc(&MP);
        waiter.join().unwrap();
    }

    #[test]
    fn test_flagged_sleeper_observed_by_producer() {
        use std::sync::Arc;

        let ec = Arc::new(Ec32::new(0));
        let waiter = {
            let ec = Arc::clone(&ec);
            std::thread::spawn(move || ec.wait(&MP, 0, FOREVER))
        };

        // Wait until the sleeper has advertised itself, then bump.
        while !ec.has_waiters() {
            std::thread::yield_now();
        }
        ec.inc(&MP);
        assert_eq!(waiter.join().unwrap(), 0);
    }
}
