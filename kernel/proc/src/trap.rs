//! Clock interrupt and the trap-layer hooks.

use hearth_core::intr::{intr_get, intr_on};

use crate::kernel::Kernel;
use crate::sleep::Channel;

impl Kernel {
    /// Handles one clock tick: advances the tick counter, wakes tick
    /// sleepers and marks a timer interrupt pending on every hart.
    pub fn clock_intr(&self) {
        let mut ticks = self.ticks_lock().lock();
        *ticks += 1;
        self.wakeup(Channel::Ticks);
        drop(ticks);
        for cpu in self.cpus() {
            cpu.raise_timer();
        }
    }

    /// Returns the number of ticks since boot.
    pub fn ticks(&self) -> u64 {
        *self.ticks_lock().lock()
    }

    /// Preemption hook: if a timer interrupt is pending on this hart and a
    /// process is running with interrupts enabled, give up the hart.
    pub fn on_timer_interrupt(&self) {
        if !intr_get() || self.current_slot().is_none() {
            return;
        }
        if self.mycpu().take_timer() {
            self.yield_now();
        }
    }

    /// Work done on every entry from user mode: interrupts back on, and a
    /// killed process exits instead of making its call.
    pub fn usertrap_entry(&self, slot: usize) {
        intr_on();
        if self.killed(slot) {
            self.exit(-1);
        }
    }

    /// Work done on every return to user mode of the process in `slot`:
    /// a killed process exits, a halted kernel or a pending timer takes
    /// the hart away.
    pub fn usertrap(&self, slot: usize) {
        intr_on();
        if self.killed(slot) {
            self.exit(-1);
        }
        if self.halted() {
            self.yield_now();
        }
        self.on_timer_interrupt();
        if self.killed(slot) {
            self.exit(-1);
        }
    }
}
