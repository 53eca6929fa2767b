//! Per-hart scheduling.
//!
//! Each hart runs [`Kernel::scheduler`], which asks the active [`Policy`]
//! to pick and run processes. A process returns control to its hart
//! through [`Kernel::sched`], always with its own PCB lock held; the
//! scheduler side releases it.

pub mod policy;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use hearth_core::cpu_local::{bind_current, unbind_current};
use hearth_core::id::CpuId;
use hearth_core::intr::{self, intr_get, intr_off, intr_on};
use hearth_core::ktrace;
use hearth_core::sync::SpinLockGuard;

pub use policy::{Fcfs, Policy, RoundRobin};

use crate::context::{Context, switch};
use crate::kernel::Kernel;
use crate::proc::{ProcInner, ProcState};

const NO_PROC: usize = usize::MAX;

/// Per-hart state.
pub struct Cpu {
    id: CpuId,
    /// Slot of the process running here, or `NO_PROC`.
    proc: AtomicUsize,
    /// The hart's scheduler loop.
    context: Context,
    /// A timer interrupt is pending.
    timer: AtomicBool,
}

impl Cpu {
    pub(crate) fn new(id: CpuId) -> Self {
        Self {
            id,
            proc: AtomicUsize::new(NO_PROC),
            context: Context::new(),
            timer: AtomicBool::new(false),
        }
    }

    /// Returns the hart's CPU id.
    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Returns the slot of the process running on this hart.
    pub fn current(&self) -> Option<usize> {
        match self.proc.load(Ordering::Acquire) {
            NO_PROC => None,
            slot => Some(slot),
        }
    }

    fn set_current(&self, slot: Option<usize>) {
        self.proc.store(slot.unwrap_or(NO_PROC), Ordering::Release);
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    /// Marks a timer interrupt pending and wakes the hart if it idles.
    pub fn raise_timer(&self) {
        self.timer.store(true, Ordering::Release);
        self.ring();
    }

    /// Consumes a pending timer interrupt.
    pub fn take_timer(&self) -> bool {
        self.timer.swap(false, Ordering::AcqRel)
    }

    /// Wakes the hart from wait-for-interrupt.
    pub fn ring(&self) {
        self.context.ring();
    }
}

/// A host thread attached as one of a kernel's harts.
///
/// Created by [`Kernel::attach_hart`]; detaches on drop.
pub struct Hart<'a> {
    kernel: &'a Kernel,
    cpu: &'a Cpu,
}

impl Hart<'_> {
    /// Returns the hart's descriptor.
    pub fn cpu(&self) -> &Cpu {
        self.cpu
    }

    /// Runs the scheduler loop until the kernel halts.
    pub fn run(&self) {
        self.kernel.scheduler();
    }

    /// Makes one scheduling decision with the active policy. Returns
    /// whether any process ran.
    pub fn schedule_once(&self) -> bool {
        intr_on();
        self.cpu.take_timer();
        let ran = self.kernel.policy().scheduler().schedule(self.kernel, self.cpu);
        intr_off();
        ran
    }
}

impl Drop for Hart<'_> {
    fn drop(&mut self) {
        intr_off();
        unbind_current();
    }
}

impl Kernel {
    /// Binds the calling thread to hart `index` and enters its scheduler
    /// context.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range or another thread already runs
    /// that hart.
    pub fn attach_hart(&self, index: usize) -> Hart<'_> {
        let cpu = &self.cpus()[index];
        bind_current(cpu.id());
        cpu.context().enter();
        Hart { kernel: self, cpu }
    }

    /// The per-hart scheduler loop. Returns once the kernel is halted.
    pub fn scheduler(&self) {
        let cpu = self.mycpu();
        cpu.set_current(None);
        loop {
            // A hart with nothing to run must still take interrupts, or
            // the wakeup it waits for might never be delivered.
            intr_on();
            cpu.take_timer();
            if self.halted() {
                break;
            }
            if !self.policy().scheduler().schedule(self, cpu) {
                // wait for interrupt
                thread::park_timeout(self.config().tick);
            }
        }
        intr_off();
    }

    /// Runs the process in `slot` on `cpu` until it switches back.
    ///
    /// Called by policies with the process's lock held; returns the lock.
    ///
    /// # Panics
    ///
    /// Panics if the process is not runnable.
    pub fn switch_in<'a>(
        &self,
        cpu: &Cpu,
        slot: usize,
        mut guard: SpinLockGuard<'a, ProcInner>,
    ) -> SpinLockGuard<'a, ProcInner> {
        if guard.state != ProcState::Runnable {
            panic!(
                "switch-in: pid {} not runnable ({})",
                guard.pid, guard.state
            );
        }
        let Some(to) = guard.kstack.as_ref().map(|k| k.context().clone()) else {
            panic!("switch-in: pid {} has no kernel stack", guard.pid);
        };
        guard.state = ProcState::Running;
        cpu.set_current(Some(slot));
        ktrace!("sched {}: run pid {} ({})", cpu.id(), guard.pid, guard.name);

        let lock = SpinLockGuard::leak(guard);
        // SAFETY: the PCB lock is the one lock held on this hart; the
        // process releases it on its side of the switch.
        unsafe { switch(cpu.context(), &to) };

        cpu.set_current(None);
        // SAFETY: the process switched back with its lock held on this hart.
        unsafe { lock.assume_locked() }
    }

    /// Switches from the running process back to its hart's scheduler.
    ///
    /// The caller holds its own PCB lock and nothing else, and has already
    /// moved its state off `Running`. Returns the lock once the process is
    /// switched in again, possibly on another hart.
    ///
    /// # Panics
    ///
    /// Panics if any of those conditions do not hold.
    pub(crate) fn sched<'a>(&self, guard: SpinLockGuard<'a, ProcInner>) -> SpinLockGuard<'a, ProcInner> {
        let cpu = self.mycpu();
        if intr::depth() != 1 {
            panic!("sched locks");
        }
        if guard.state == ProcState::Running {
            panic!("sched running");
        }
        if intr_get() {
            panic!("sched interruptible");
        }
        let Some(from) = guard.kstack.as_ref().map(|k| k.context().clone()) else {
            panic!("sched: pid {} has no kernel stack", guard.pid);
        };

        // Interrupt-enable state belongs to this thread of control, not
        // to the hart it happens to be on.
        let intena = intr::saved_enable();
        let lock = SpinLockGuard::leak(guard);
        // SAFETY: our PCB lock is the only lock held; the scheduler
        // releases it after the switch.
        unsafe { switch(&from, cpu.context()) };
        intr::set_saved_enable(intena);
        // SAFETY: whichever hart switched us back in holds our lock.
        unsafe { lock.assume_locked() }
    }

    /// Gives up the hart for one scheduling round.
    pub fn yield_now(&self) {
        let (_, p) = self.myproc();
        let mut g = p.lock();
        g.state = ProcState::Runnable;
        drop(self.sched(g));
    }
}
