//! The kernel instance: harts, process table, clock and collaborators.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use hearth_core::cpu_local::{claim_cpu_slot, current_cpu_id, release_cpu_slot};
use hearth_core::id::CpuId;
use hearth_core::intr::{pop_off, push_off};
use hearth_core::sync::SpinLock;
use hearth_core::{kfatal, kinfo, kwarn};

use crate::config::{KernelConfig, PolicyKind};
use crate::error::{BootError, KernelPanic};
use crate::file::{FileSystem, SimFiles};
use crate::mm::{MemoryManager, SimMemory};
use crate::proc::{Proc, ProcTable};
use crate::sched::Cpu;

/// Attempts to take a PCB lock during best-effort teardown.
const TEARDOWN_SPINS: usize = 10_000;

/// Counters describing a running kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStats {
    /// Clock ticks since boot.
    pub ticks: u64,
    /// Successful process allocations.
    pub allocs: u64,
    /// Slots returned to `Unused`.
    pub reaps: u64,
    /// Slots currently in use.
    pub live: usize,
    /// Free physical memory in bytes.
    pub free_memory: usize,
}

/// A kernel instance.
///
/// Created through [`Machine::boot`](crate::Machine::boot) or, for tests
/// that drive harts by hand, [`Kernel::sim`].
pub struct Kernel {
    config: KernelConfig,
    cpus: Box<[Cpu]>,
    procs: ProcTable,
    ticks: SpinLock<u64>,
    uchan: SpinLock<()>,
    mm: Arc<dyn MemoryManager>,
    fs: Arc<dyn FileSystem>,
    policy: AtomicU8,
    initproc: OnceLock<usize>,
    halted: AtomicBool,
    fatal: OnceLock<KernelPanic>,
}

impl Kernel {
    /// Creates a kernel with the given collaborators. Claims one CPU slot
    /// per hart; no hart runs until something enters its scheduler loop.
    ///
    /// # Errors
    ///
    /// Returns [`BootError::Config`] for an invalid configuration and
    /// [`BootError::NoCpuSlots`] if the host has no free CPU slots left.
    pub fn new(
        config: KernelConfig,
        mm: Arc<dyn MemoryManager>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Arc<Self>, BootError> {
        config.validate()?;
        let mut ids = Vec::with_capacity(config.ncpu);
        for _ in 0..config.ncpu {
            if let Some(id) = claim_cpu_slot() {
                ids.push(id);
            } else {
                ids.into_iter().for_each(release_cpu_slot);
                return Err(BootError::NoCpuSlots);
            }
        }
        let kernel = Arc::new(Self {
            cpus: ids.into_iter().map(Cpu::new).collect(),
            procs: ProcTable::new(config.nproc),
            ticks: SpinLock::named("time", 0),
            uchan: SpinLock::named("uchan", ()),
            mm,
            fs,
            policy: AtomicU8::new(config.policy.code()),
            initproc: OnceLock::new(),
            halted: AtomicBool::new(false),
            fatal: OnceLock::new(),
            config,
        });
        kinfo!(
            "kernel: {} harts, {} process slots, policy {}",
            kernel.cpus.len(),
            kernel.procs.len(),
            kernel.policy()
        );
        Ok(kernel)
    }

    /// Creates a kernel backed by [`SimMemory`] and [`SimFiles`].
    ///
    /// # Errors
    ///
    /// See [`Kernel::new`].
    pub fn sim(config: KernelConfig) -> Result<Arc<Self>, BootError> {
        let mm = Arc::new(SimMemory::new(config.npages));
        Self::new(config, mm, Arc::new(SimFiles::new()))
    }

    /// Returns the boot configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Returns the process table.
    pub fn procs(&self) -> &ProcTable {
        &self.procs
    }

    /// Returns the memory manager.
    pub fn mm(&self) -> &dyn MemoryManager {
        &*self.mm
    }

    /// Returns the file system.
    pub fn fs(&self) -> &dyn FileSystem {
        &*self.fs
    }

    /// Returns the hart descriptors.
    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    pub(crate) fn ticks_lock(&self) -> &SpinLock<u64> {
        &self.ticks
    }

    /// Condition lock for sleeps on user channels.
    pub(crate) fn uchan_lock(&self) -> &SpinLock<()> {
        &self.uchan
    }

    /// Returns the descriptor of the hart the caller runs on, if it is one
    /// of this kernel's harts.
    pub fn mycpu_opt(&self) -> Option<&Cpu> {
        let id = current_cpu_id();
        self.cpus.iter().find(|c| c.id() == id)
    }

    /// Returns the descriptor of the hart the caller runs on.
    ///
    /// # Panics
    ///
    /// Panics if the caller is not running on one of this kernel's harts.
    pub fn mycpu(&self) -> &Cpu {
        match self.mycpu_opt() {
            Some(cpu) => cpu,
            None => panic!("mycpu: cpu {} is not a hart", current_cpu_id()),
        }
    }

    /// Returns the slot of the process running on this hart, if any.
    pub fn current_slot(&self) -> Option<usize> {
        push_off();
        let slot = self.mycpu_opt().and_then(Cpu::current);
        pop_off();
        slot
    }

    /// Returns the process running on this hart.
    ///
    /// # Panics
    ///
    /// Panics if no process is running here.
    pub fn myproc(&self) -> (usize, &Proc) {
        match self.current_slot() {
            Some(slot) => (slot, self.procs.get(slot)),
            None => panic!("myproc: no process on cpu {}", current_cpu_id()),
        }
    }

    /// Returns the slot of the first user process, once created.
    pub fn initproc(&self) -> Option<usize> {
        self.initproc.get().copied()
    }

    pub(crate) fn set_initproc(&self, slot: usize) -> bool {
        self.initproc.set(slot).is_ok()
    }

    /// Returns the active scheduling policy.
    pub fn policy(&self) -> PolicyKind {
        PolicyKind::from_code(self.policy.load(Ordering::Relaxed)).unwrap_or_default()
    }

    /// Switches the scheduling policy. Harts pick it up on their next pass.
    pub fn set_policy(&self, kind: PolicyKind) {
        let old = self.policy.swap(kind.code(), Ordering::Relaxed);
        if old != kind.code() {
            kinfo!("sched: policy switched to {kind}");
        }
    }

    /// Stops every hart at its next scheduling decision.
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            kinfo!("kernel: halting");
        }
        for cpu in self.cpus.iter() {
            cpu.ring();
        }
    }

    /// Returns whether the kernel has been halted.
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Records a fatal panic and halts. Only the first one is kept.
    pub fn fatal(&self, cpu: Option<CpuId>, message: String) {
        let panic = KernelPanic { cpu, message };
        kfatal!("{panic}");
        let _ = self.fatal.set(panic);
        self.halt();
    }

    /// Returns the fatal panic that halted the kernel, if any.
    pub fn fatal_error(&self) -> Option<&KernelPanic> {
        self.fatal.get()
    }

    /// Halts and retires every kernel stack.
    ///
    /// Call once no hart is inside its scheduler loop any more.
    pub fn power_off(&self) {
        self.halt();
        self.retire_all();
    }

    /// Retires the kernel stack of every slot. A PCB lock that stays held
    /// (only possible after a fatal panic) is skipped with a warning.
    pub(crate) fn retire_all(&self) {
        for (slot, p) in self.procs.iter() {
            let guard = (0..TEARDOWN_SPINS).find_map(|_| {
                let g = p.lock_ref().try_lock();
                if g.is_none() {
                    core::hint::spin_loop();
                }
                g
            });
            match guard {
                Some(g) => {
                    if let Some(kstack) = g.kstack.as_ref() {
                        kstack.retire();
                    }
                }
                None => kwarn!("power-off: slot {slot} is locked, kernel stack left parked"),
            }
        }
    }

    /// Returns current counters.
    pub fn stats(&self) -> KernelStats {
        let ticks = *self.ticks.lock();
        KernelStats {
            ticks,
            allocs: self.procs.allocs(),
            reaps: self.procs.reaps(),
            live: self.procs.live(),
            free_memory: self.mm.free_memory(),
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        for cpu in self.cpus.iter() {
            release_cpu_slot(cpu.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    #[test]
    fn rejects_invalid_config() {
        let config = KernelConfig {
            ncpu: 0,
            ..KernelConfig::default()
        };
        assert_eq!(
            Kernel::sim(config).err(),
            Some(BootError::Config(ConfigError::NoHarts))
        );
    }

    #[test]
    fn claims_and_releases_cpu_slots() {
        let kernel = Kernel::sim(KernelConfig {
            ncpu: 2,
            ..KernelConfig::default()
        })
        .unwrap();
        let ids: Vec<_> = kernel.cpus().iter().map(Cpu::id).collect();
        assert_ne!(ids[0], ids[1]);
        // The test thread is not one of the kernel's harts.
        assert!(kernel.mycpu_opt().is_none());
        assert_eq!(kernel.current_slot(), None);
        drop(kernel);
        let again = claim_cpu_slot().unwrap();
        release_cpu_slot(again);
    }

    #[test]
    fn policy_switch_is_visible() {
        let kernel = Kernel::sim(KernelConfig::default()).unwrap();
        assert_eq!(kernel.policy(), PolicyKind::RoundRobin);
        kernel.set_policy(PolicyKind::Fcfs);
        assert_eq!(kernel.policy(), PolicyKind::Fcfs);
    }

    #[test]
    fn first_fatal_is_kept() {
        let kernel = Kernel::sim(KernelConfig::default()).unwrap();
        kernel.fatal(None, "first".into());
        kernel.fatal(Some(CpuId::new(1)), "second".into());
        assert!(kernel.halted());
        assert_eq!(kernel.fatal_error().unwrap().message, "first");
    }

    #[test]
    fn fresh_stats() {
        let kernel = Kernel::sim(KernelConfig {
            npages: 16,
            ..KernelConfig::default()
        })
        .unwrap();
        let stats = kernel.stats();
        assert_eq!(stats.ticks, 0);
        assert_eq!(stats.live, 0);
        assert_eq!(stats.free_memory, 16 * crate::config::PAGE_SIZE);
    }
}
