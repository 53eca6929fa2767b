//! Process management for the Hearth kernel.
//!
//! A fixed table of process control blocks, a scheduler loop per hart
//! with pluggable policies, sleep/wakeup, and the process lifecycle
//! (`fork`, `exit`, `wait`, `kill`). Memory and files are reached through
//! the [`MemoryManager`] and [`FileSystem`] traits.
//!
//! Harts and kernel stacks are host threads. [`Machine::boot`] starts a
//! complete machine; tests that need to step the scheduler by hand create
//! a [`Kernel`] and attach themselves as a hart with
//! [`Kernel::attach_hart`].
//!
//! Lock order, outermost first:
//! `wait_lock`, `time`, `uchan`, `sleeplock` → `proc` → `pid`, `ftable`
//! → `itable`, `vm` → `kmem`.

pub mod config;
pub mod context;
pub mod error;
pub mod file;
pub mod kernel;
mod lifecycle;
pub mod machine;
pub mod mm;
pub mod proc;
pub mod sched;
pub mod sleep;
pub mod sleeplock;
pub mod syscall;
mod trap;
pub mod trapframe;
pub mod user;

pub use config::{KernelConfig, PolicyKind};
pub use error::{AllocError, BootError, ConfigError, ForkError, KernelPanic, MemError, PriorityError};
pub use file::{FileSystem, OpenFlags, SimFiles};
pub use kernel::{Kernel, KernelStats};
pub use machine::Machine;
pub use mm::{MemoryManager, SimMemory};
pub use proc::{Listing, ProcInfo, ProcState};
pub use sched::{Cpu, Fcfs, Hart, Policy, RoundRobin};
pub use sleep::Channel;
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use syscall::PRIO_NONE;
pub use user::{Program, User};
