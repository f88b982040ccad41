//! # lockstep
//!
//! Lock-free, wait-free, and fine-grained blocking synchronization
//! primitives built on a portable atomic substrate: hazard-pointer
//! reclamation, Treiber stacks, Michael–Scott queues, phase-fair and
//! packed reader-writer locks, copy-on-write publication arrays, and
//! futex-backed event counts.
//!
//! ## Module organization
//!
//! ### Foundation
//! - [`cc`] - Bit manipulation utilities
//! - [`malloc`] - Memory allocator abstraction
//!
//! ### Core primitives
//! - [`pr`] - Atomic operations, fences, and the double-width CAS
//!   capability
//!
//! ### Building blocks
//! - [`mod@backoff`] - Exponential backoff for contention management
//! - [`stack`] - Treiber stacks (UPMC and generation-counter MPMC)
//! - [`bitmap`] - Concurrent bitmap
//! - [`ring`] - Bounded ring buffers
//! - [`pflock`] - Phase-fair reader-writer lock
//! - [`ec`] - Futex-backed event counts
//!
//! ### Memory reclamation
//! - [`hp`] - Hazard pointers
//! - [`epoch`] - Epoch-based reclamation
//!
//! ### Publication structures
//! - [`mod@array`] - Copy-on-write publication array
//! - [`rhs`] - Robin-Hood hash set
//!
//! ### Locks
//! - [`spinlock`] - Fetch-and-store, ticket, and MCS locks
//! - [`rwlock`] - Centralized reader-writer lock
//! - [`swlock`] - Packed single-word reader-writer lock with latch
//!
//! ### Composites
//! - [`barrier`] - Centralized execution barrier
//! - [`fifo`] - Michael–Scott FIFO queues
//! - [`hp_stack`] - Hazard-protected stack
//! - [`hp_fifo`] - Hazard-protected FIFO
//!
//! ## Reclamation contract
//!
//! The raw containers ([`stack`], [`fifo`]) store caller-owned nodes by
//! reference and return them on pop/dequeue; under multi-consumer use
//! the caller must run safe memory reclamation before freeing or
//! reusing a returned node. The `hp_`-prefixed composites package that
//! discipline; [`mod@array`] defers displaced buffers through its
//! allocator instead.

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// =============================================================================
// Tier 0: Foundation
// =============================================================================

/// Bit manipulation utilities.
pub mod cc;

/// Memory allocator abstraction.
pub mod malloc;

// =============================================================================
// Tier 1: Core primitives
// =============================================================================

/// Atomic operations, fences, and the double-width CAS capability.
pub mod pr;

// =============================================================================
// Tier 2: Building blocks
// =============================================================================

/// Exponential backoff for contention management.
pub mod backoff;

/// Treiber stacks.
pub mod stack;

/// Concurrent bitmap.
pub mod bitmap;

/// Bounded ring buffers.
pub mod ring;

/// Phase-fair reader-writer lock.
pub mod pflock;

/// Futex-backed event counts.
pub mod ec;

// =============================================================================
// Tier 3: Memory reclamation and publication structures
// =============================================================================

/// Hazard-pointer safe memory reclamation.
pub mod hp;

/// Epoch-based safe memory reclamation.
pub mod epoch;

/// Copy-on-write publication array.
pub mod array;

/// Robin-Hood hash set.
pub mod rhs;

// =============================================================================
// Tier 4: Locks
// =============================================================================

/// Spinlocks: fetch-and-store, ticket, and MCS.
pub mod spinlock;

/// Centralized reader-writer lock.
pub mod rwlock;

/// Packed single-word reader-writer lock with latch.
pub mod swlock;

// =============================================================================
// Tier 5: Composites
// =============================================================================

/// Centralized execution barrier.
pub mod barrier;

/// Michael–Scott FIFO queues.
pub mod fifo;

/// Hazard-pointer protected stack.
pub mod hp_stack;

/// Hazard-pointer protected FIFO.
pub mod hp_fifo;

// =============================================================================
// Re-exports
// =============================================================================

pub use cc::{ctz, ffs, popcount};
pub use malloc::Allocator;
pub use pr::HAS_WIDE_CAS;
