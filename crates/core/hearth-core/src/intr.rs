//! Simulated interrupt enable state and nesting.
//!
//! Each CPU has an interrupt-enable flag plus a nesting pair: a depth
//! counter and the enable state seen by the outermost [`push_off`]. The
//! matching [`pop_off`] only re-enables interrupts once the depth drops
//! back to zero, so nested lock acquisitions on one CPU never turn
//! interrupts back on early.
//!
//! On the hosted machine "interrupts" are a flag: the trap layer only
//! delivers a pending timer tick to a CPU whose flag is set.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::cpu_local::{CpuLocal, MAX_CPUS};
use crate::id::CpuId;

struct IrqState {
    enabled: AtomicBool,
    depth: AtomicU32,
    intena: AtomicBool,
}

impl IrqState {
    const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            depth: AtomicU32::new(0),
            intena: AtomicBool::new(false),
        }
    }
}

static IRQ: CpuLocal<IrqState> = CpuLocal::new([const { IrqState::new() }; MAX_CPUS]);

/// Enables interrupts on the current CPU.
#[inline]
pub fn intr_on() {
    IRQ.get().enabled.store(true, Ordering::Relaxed);
}

/// Disables interrupts on the current CPU.
#[inline]
pub fn intr_off() {
    IRQ.get().enabled.store(false, Ordering::Relaxed);
}

/// Returns whether interrupts are enabled on the current CPU.
#[inline]
pub fn intr_get() -> bool {
    IRQ.get().enabled.load(Ordering::Relaxed)
}

/// Disables interrupts and bumps the nesting depth.
///
/// The first `push_off` of a nest records whether interrupts were on.
pub fn push_off() {
    let old = intr_get();
    intr_off();
    let st = IRQ.get();
    if st.depth.load(Ordering::Relaxed) == 0 {
        st.intena.store(old, Ordering::Relaxed);
    }
    st.depth.fetch_add(1, Ordering::Relaxed);
}

/// Undoes one [`push_off`].
///
/// # Panics
///
/// Panics if interrupts are enabled or there is no matching `push_off`.
pub fn pop_off() {
    let st = IRQ.get();
    if intr_get() {
        panic!("pop_off: interruptible");
    }
    let depth = st.depth.load(Ordering::Relaxed);
    if depth == 0 {
        panic!("pop_off: unbalanced");
    }
    st.depth.store(depth - 1, Ordering::Relaxed);
    if depth == 1 && st.intena.load(Ordering::Relaxed) {
        intr_on();
    }
}

/// Returns the current CPU's nesting depth (number of net held spin locks).
#[inline]
pub fn depth() -> u32 {
    IRQ.get().depth.load(Ordering::Relaxed)
}

/// Returns the enable state recorded by the outermost `push_off`.
pub fn saved_enable() -> bool {
    IRQ.get().intena.load(Ordering::Relaxed)
}

/// Overwrites the enable state recorded by the outermost `push_off`.
///
/// A thread of control that is switched out and later resumed on another
/// CPU carries its own saved state across with this.
pub fn set_saved_enable(on: bool) {
    IRQ.get().intena.store(on, Ordering::Relaxed);
}

/// Returns `cpu` to "interrupts off, nothing nested".
pub(crate) fn reset_cpu(cpu: CpuId) {
    let st = IRQ.get_for(cpu);
    st.enabled.store(false, Ordering::Relaxed);
    st.depth.store(0, Ordering::Relaxed);
    st.intena.store(false, Ordering::Relaxed);
}
