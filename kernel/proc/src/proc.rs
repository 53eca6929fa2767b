//! Process control blocks and the process table.
//!
//! Every PCB field the scheduler or other processes look at lives in
//! [`ProcInner`] behind the PCB's own spin lock. Fields only the owning
//! process touches while it runs (trap frame, address space, open files)
//! live in [`ProcData`] and need no lock: nobody else reads them except
//! while the process is being built or torn down, when it cannot run.
//!
//! Parent links are slot indices in a separate array guarded by the
//! table-wide `wait_lock`, which is always taken before any PCB lock.

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use hearth_core::id::Pid;
use hearth_core::sync::{SpinLock, SpinLockGuard};

use crate::config::{MAXNAME, NOFILE};
use crate::context::KernelStack;
use crate::file::{FileId, InodeId};
use crate::mm::{AddressSpaceId, Frame};
use crate::sleep::Channel;
use crate::trapframe::TrapFrame;
use crate::user::Program;

/// Lock name shared by every PCB lock (one lockdep class).
pub const PROC_LOCK: &str = "proc";

/// Process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcState {
    /// Free slot.
    #[default]
    Unused,
    /// Allocated, still being built.
    Used,
    /// Blocked on a channel.
    Sleeping,
    /// Ready to run.
    Runnable,
    /// Running on some hart.
    Running,
    /// Exited, waiting to be reaped by its parent.
    Zombie,
}

impl ProcState {
    /// Returns the name shown in process listings.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unused => "UNUSED",
            Self::Used => "USED",
            Self::Sleeping => "SLEEPING",
            Self::Runnable => "RUNNABLE",
            Self::Running => "RUNNING",
            Self::Zombie => "ZOMBIE",
        }
    }
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PCB fields guarded by the PCB lock.
#[derive(Default)]
pub struct ProcInner {
    /// Lifecycle state.
    pub state: ProcState,
    /// Channel slept on; `Some` only while [`ProcState::Sleeping`].
    pub chan: Option<Channel>,
    /// Set by `kill`; the process exits at its next checkpoint.
    pub killed: bool,
    /// Exit status for the parent's `wait`.
    pub xstate: i32,
    /// Process id.
    pub pid: Pid,
    /// Scheduling priority, `PRIO_MIN..=PRIO_MAX`.
    pub priority: i32,
    /// Creation stamp; strictly increasing across allocations.
    pub created: u64,
    /// Name for debugging.
    pub name: String,
    /// Kernel stack; `Some` from allocation until the slot is freed.
    pub kstack: Option<KernelStack>,
}

impl ProcInner {
    /// Stores a name, truncated to `MAXNAME` bytes on a character boundary.
    pub fn set_name(&mut self, name: &str) {
        let mut end = name.len().min(MAXNAME);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        self.name.clear();
        self.name.push_str(&name[..end]);
    }
}

/// PCB fields private to the owning process.
#[derive(Default)]
pub struct ProcData {
    /// Page backing the trap frame.
    pub trapframe_page: Option<Frame>,
    /// Saved user registers.
    pub trapframe: TrapFrame,
    /// User address space.
    pub space: Option<AddressSpaceId>,
    /// Size of user memory in bytes.
    pub size: usize,
    /// Open files.
    pub ofile: [Option<FileId>; NOFILE],
    /// Current directory.
    pub cwd: Option<InodeId>,
    /// The user program the process runs.
    pub program: Option<Program>,
}

/// A process control block.
pub struct Proc {
    inner: SpinLock<ProcInner>,
    data: UnsafeCell<ProcData>,
}

// SAFETY: `inner` is lock-protected. `data` is only touched by the owning
// process while it runs, or by a thread holding `inner` while the slot is
// `Used` or `Zombie` and so cannot run.
unsafe impl Sync for Proc {}

impl Default for Proc {
    fn default() -> Self {
        Self::new()
    }
}

impl Proc {
    /// Creates an unused slot.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::named(PROC_LOCK, ProcInner::default()),
            data: UnsafeCell::new(ProcData::default()),
        }
    }

    /// Acquires the PCB lock.
    pub fn lock(&self) -> SpinLockGuard<'_, ProcInner> {
        self.inner.lock()
    }

    /// Returns the PCB lock itself.
    pub fn lock_ref(&self) -> &SpinLock<ProcInner> {
        &self.inner
    }

    /// Returns the owner-private fields.
    ///
    /// # Safety
    ///
    /// The caller must be the process itself, running, or must hold the
    /// PCB lock while the slot is `Used` or `Zombie`. No other reference
    /// returned by this method may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        // SAFETY: upheld by the caller.
        unsafe { &mut *self.data.get() }
    }
}

/// One row of a process listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    /// Process id.
    pub pid: Pid,
    /// Scheduling priority.
    pub priority: i32,
    /// Name.
    pub name: String,
    /// State.
    pub state: ProcState,
}

/// A formatted process listing.
pub struct Listing<'a>(pub &'a [ProcInfo]);

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<6}{:<10}{:<17}STATE", "PID", "PRIORITY", "NAME")?;
        for p in self.0 {
            writeln!(f, "{:<6}{:<10}{:<17}{}", p.pid.as_u32(), p.priority, p.name, p.state)?;
        }
        Ok(())
    }
}

/// The fixed-size process table.
pub struct ProcTable {
    procs: Box<[Proc]>,
    /// Parent slot of each slot. Guards every parent/child relationship
    /// and is always acquired before any PCB lock.
    pub(crate) wait_lock: SpinLock<Box<[Option<usize>]>>,
    next_pid: SpinLock<u32>,
    next_stamp: AtomicU64,
    allocs: AtomicU64,
    reaps: AtomicU64,
}

impl ProcTable {
    /// Creates a table of `nproc` unused slots.
    pub fn new(nproc: usize) -> Self {
        Self {
            procs: (0..nproc).map(|_| Proc::new()).collect(),
            wait_lock: SpinLock::named("wait_lock", vec![None; nproc].into_boxed_slice()),
            next_pid: SpinLock::named("pid", 1),
            next_stamp: AtomicU64::new(1),
            allocs: AtomicU64::new(0),
            reaps: AtomicU64::new(0),
        }
    }

    /// Returns the number of slots.
    pub fn len(&self) -> usize {
        self.procs.len()
    }

    /// Returns whether the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    /// Returns the PCB in `slot`.
    pub fn get(&self, slot: usize) -> &Proc {
        &self.procs[slot]
    }

    /// Iterates over `(slot, pcb)` pairs in table order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Proc)> {
        self.procs.iter().enumerate()
    }

    /// Hands out the next process id.
    pub(crate) fn alloc_pid(&self) -> Pid {
        let mut next = self.next_pid.lock();
        let pid = Pid::new(*next);
        *next += 1;
        pid
    }

    /// Hands out the next creation stamp.
    pub(crate) fn next_stamp(&self) -> u64 {
        self.next_stamp.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn count_alloc(&self) {
        self.allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_reap(&self) {
        self.reaps.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of successful allocations so far.
    pub fn allocs(&self) -> u64 {
        self.allocs.load(Ordering::Relaxed)
    }

    /// Returns the number of slots returned to `Unused` so far.
    pub fn reaps(&self) -> u64 {
        self.reaps.load(Ordering::Relaxed)
    }

    /// Returns the slot of the live process with `pid`, with its lock held.
    pub fn find_pid(&self, pid: Pid) -> Option<(usize, SpinLockGuard<'_, ProcInner>)> {
        self.iter().find_map(|(slot, p)| {
            let guard = p.lock();
            (guard.state != ProcState::Unused && guard.pid == pid).then_some((slot, guard))
        })
    }

    /// Returns a listing row for every slot that is not `Unused`.
    pub fn snapshot(&self) -> Vec<ProcInfo> {
        self.iter()
            .filter_map(|(_, p)| {
                let guard = p.lock();
                (guard.state != ProcState::Unused).then(|| ProcInfo {
                    pid: guard.pid,
                    priority: guard.priority,
                    name: guard.name.clone(),
                    state: guard.state,
                })
            })
            .collect()
    }

    /// Returns the number of slots that are not `Unused`.
    pub fn live(&self) -> usize {
        self.iter()
            .filter(|(_, p)| p.lock().state != ProcState::Unused)
            .count()
    }
}
