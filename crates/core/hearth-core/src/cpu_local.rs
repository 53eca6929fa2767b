//! Per-CPU storage and simulated CPU identity.
//!
//! Provides [`CpuLocal`] indexed by CPU ID. The machine is hosted, so a
//! CPU ID is a slot in a global pool that host threads bind to:
//!
//! - a hart thread binds to its hart's slot for as long as it runs;
//! - a process's kernel thread re-binds to whichever hart switched it in;
//! - any other thread (a test's main thread, the tick clock) lazily claims
//!   a *detached* slot the first time it asks for its CPU ID and hands it
//!   back when the thread exits.
//!
//! A CPU ID is therefore stable for the whole time a thread of control
//! runs, and two threads never run on the same ID at once.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::id::CpuId;

/// Maximum number of CPU IDs that may exist at once (harts of every live
/// machine plus detached threads).
pub const MAX_CPUS: usize = 256;

/// Per-CPU storage. Wraps `[T; MAX_CPUS]`, indexed by current CPU ID.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` wrapping the given array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns a reference to the current CPU's instance.
    pub fn get(&self) -> &T {
        &self.data[current_cpu_id().as_usize()]
    }

    /// Returns a reference to a specific CPU's instance.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is not below [`MAX_CPUS`].
    pub fn get_for(&self, cpu: CpuId) -> &T {
        &self.data[cpu.as_usize()]
    }
}

// SAFETY: CpuLocal<T> is designed for per-CPU access. Each CPU ID is used
// by at most one running thread at a time, so each slot is only touched
// by its own CPU.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}

// ---------------------------------------------------------------------------
// Slot pool
// ---------------------------------------------------------------------------

static SLOTS: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

/// Claims a free CPU ID from the global pool.
///
/// The slot's interrupt and lock-tracking state is reset before it is
/// handed out. Returns `None` when every slot is in use.
pub fn claim_cpu_slot() -> Option<CpuId> {
    for (i, slot) in SLOTS.iter().enumerate() {
        if slot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            #[allow(clippy::cast_possible_truncation)]
            let id = CpuId::new(i as u32);
            crate::intr::reset_cpu(id);
            #[cfg(debug_assertions)]
            crate::sync::lockdep::reset_cpu(id);
            return Some(id);
        }
    }
    None
}

/// Returns a CPU ID to the pool.
pub fn release_cpu_slot(id: CpuId) {
    SLOTS[id.as_usize()].store(false, Ordering::Release);
}

/// Returns the number of slots currently claimed.
pub fn claimed_cpu_slots() -> usize {
    SLOTS.iter().filter(|s| s.load(Ordering::Relaxed)).count()
}

// ---------------------------------------------------------------------------
// Thread binding
// ---------------------------------------------------------------------------

/// A detached slot owned by the current thread, returned on thread exit.
struct DetachedSlot(Cell<Option<CpuId>>);

impl Drop for DetachedSlot {
    fn drop(&mut self) {
        if let Some(id) = self.0.get() {
            release_cpu_slot(id);
        }
    }
}

thread_local! {
    static BOUND: Cell<Option<CpuId>> = const { Cell::new(None) };
    static DETACHED: DetachedSlot = const { DetachedSlot(Cell::new(None)) };
}

/// Binds the calling thread to `id` until it is re-bound or unbound.
pub fn bind_current(id: CpuId) {
    BOUND.with(|b| b.set(Some(id)));
}

/// Drops the calling thread's binding. It falls back to its detached slot.
pub fn unbind_current() {
    BOUND.with(|b| b.set(None));
}

/// Returns the binding of the calling thread, if any.
pub fn bound_cpu_id() -> Option<CpuId> {
    BOUND.with(Cell::get)
}

/// Returns the current CPU ID.
///
/// # Panics
///
/// Panics if the calling thread is unbound and the slot pool is exhausted.
#[inline]
pub fn current_cpu_id() -> CpuId {
    if let Some(id) = bound_cpu_id() {
        return id;
    }
    DETACHED.with(|d| {
        if let Some(id) = d.0.get() {
            return id;
        }
        let Some(id) = claim_cpu_slot() else {
            panic!("cpu_local: all {MAX_CPUS} cpu slots are in use");
        };
        d.0.set(Some(id));
        id
    })
}
