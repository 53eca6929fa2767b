//! Scheduling policies.
//!
//! A policy is asked, once per scheduler-loop pass, to find runnable
//! processes and run them through [`Kernel::switch_in`]. The two built-in
//! policies deliberately differ in how much they do per pass: round-robin
//! sweeps the whole table, FCFS runs a single process.

use hearth_core::sync::SpinLockGuard;

use super::Cpu;
use crate::config::PolicyKind;
use crate::kernel::Kernel;
use crate::proc::{ProcInner, ProcState};

/// A scheduling policy.
pub trait Policy: Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Runs zero or more runnable processes on `cpu`. Returns whether any
    /// process ran.
    fn schedule(&self, kernel: &Kernel, cpu: &Cpu) -> bool;
}

/// Round-robin: one pass over the table in slot order, running every
/// process found runnable.
pub struct RoundRobin;

impl Policy for RoundRobin {
    fn name(&self) -> &'static str {
        "rr"
    }

    fn schedule(&self, kernel: &Kernel, cpu: &Cpu) -> bool {
        let mut found = false;
        for (slot, p) in kernel.procs().iter() {
            if kernel.halted() {
                break;
            }
            let guard = p.lock();
            if guard.state == ProcState::Runnable {
                drop(kernel.switch_in(cpu, slot, guard));
                found = true;
            }
        }
        found
    }
}

/// First-come first-served: run the runnable process with the earliest
/// creation stamp, and only that one.
///
/// The candidate's lock stays held while the rest of the table is
/// scanned, so it cannot be taken by another hart in between. Locks are
/// always taken in slot order, which keeps concurrent scans deadlock-free.
pub struct Fcfs;

impl Policy for Fcfs {
    fn name(&self) -> &'static str {
        "fcfs"
    }

    fn schedule(&self, kernel: &Kernel, cpu: &Cpu) -> bool {
        if kernel.halted() {
            return false;
        }
        let mut earliest: Option<(usize, SpinLockGuard<'_, ProcInner>)> = None;
        for (slot, p) in kernel.procs().iter() {
            let guard = p.lock();
            if guard.state != ProcState::Runnable {
                continue;
            }
            let earlier = earliest
                .as_ref()
                .is_none_or(|(_, best)| guard.created < best.created);
            if earlier {
                // Replacing the candidate releases its lock.
                earliest = Some((slot, guard));
            }
        }
        match earliest {
            Some((slot, guard)) => {
                drop(kernel.switch_in(cpu, slot, guard));
                true
            }
            None => false,
        }
    }
}

static ROUND_ROBIN: RoundRobin = RoundRobin;
static FCFS: Fcfs = Fcfs;

impl PolicyKind {
    /// Returns the policy implementation.
    pub fn scheduler(self) -> &'static dyn Policy {
        match self {
            Self::RoundRobin => &ROUND_ROBIN,
            Self::Fcfs => &FCFS,
        }
    }
}
