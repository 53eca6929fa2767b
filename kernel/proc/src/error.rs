//! Kernel error types.
//!
//! Everything here is recoverable: resource exhaustion is unwound locally
//! and reported to the caller. Broken invariants are not errors, they are
//! panics that halt the machine (see [`KernelPanic`]).

use core::fmt;
use std::io;

use hearth_core::id::CpuId;

/// Process allocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Every process slot is in use.
    TableFull,
    /// The page allocator could not back the new process.
    OutOfMemory,
    /// The host refused to create a kernel stack thread.
    NoKernelStack,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableFull => f.write_str("process table full"),
            Self::OutOfMemory => f.write_str("out of memory for a new process"),
            Self::NoKernelStack => f.write_str("could not create a kernel stack"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Memory-management collaborator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// No free physical page.
    OutOfMemory,
    /// The user address range is not mapped.
    BadAddress,
    /// The address-space handle does not exist.
    NoSuchSpace,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of physical memory"),
            Self::BadAddress => f.write_str("bad user address"),
            Self::NoSuchSpace => f.write_str("no such address space"),
        }
    }
}

impl std::error::Error for MemError {}

/// Fork errors. The parent is unaffected by any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
    /// No child PCB could be allocated.
    Alloc(AllocError),
    /// Duplicating the parent's address space failed.
    Copy(MemError),
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc(e) => write!(f, "fork: {e}"),
            Self::Copy(e) => write!(f, "fork: address space copy failed: {e}"),
        }
    }
}

impl std::error::Error for ForkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Alloc(e) => Some(e),
            Self::Copy(e) => Some(e),
        }
    }
}

impl From<AllocError> for ForkError {
    fn from(e: AllocError) -> Self {
        Self::Alloc(e)
    }
}

/// Priority query/update errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityError {
    /// No live process has the pid.
    NoSuchProcess,
    /// The requested priority is outside `PRIO_MIN..=PRIO_MAX`.
    OutOfRange(i32),
}

impl fmt::Display for PriorityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchProcess => f.write_str("no such process"),
            Self::OutOfRange(p) => write!(f, "priority {p} out of range"),
        }
    }
}

impl std::error::Error for PriorityError {}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `ncpu` is zero.
    NoHarts,
    /// `ncpu` exceeds the per-machine limit.
    TooManyHarts(usize),
    /// `nproc` is zero or exceeds the table limit.
    TableSize(usize),
    /// `npages` is zero or too large to index.
    PageCount(usize),
    /// The tick period is zero.
    ZeroTick,
    /// The policy name is not recognised.
    UnknownPolicy(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHarts => f.write_str("at least one hart is required"),
            Self::TooManyHarts(n) => write!(f, "{n} harts exceeds the limit"),
            Self::TableSize(n) => write!(f, "process table size {n} is out of range"),
            Self::PageCount(n) => write!(f, "page count {n} is out of range"),
            Self::ZeroTick => f.write_str("tick period must be non-zero"),
            Self::UnknownPolicy(name) => write!(f, "unknown scheduling policy `{name}`"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Boot errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootError {
    /// The configuration was rejected.
    Config(ConfigError),
    /// Not enough free CPU slots for the requested harts.
    NoCpuSlots,
    /// A hart or clock thread could not be started.
    Spawn(io::ErrorKind),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid configuration: {e}"),
            Self::NoCpuSlots => f.write_str("no free cpu slots"),
            Self::Spawn(kind) => write!(f, "could not start a hart thread: {kind}"),
        }
    }
}

impl std::error::Error for BootError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for BootError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// A fatal kernel panic, recorded when an invariant broke on some CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPanic {
    /// The CPU the panic happened on, if it was a hart.
    pub cpu: Option<CpuId>,
    /// The panic message.
    pub message: String,
}

impl fmt::Display for KernelPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cpu {
            Some(cpu) => write!(f, "kernel panic on cpu {cpu}: {}", self.message),
            None => write!(f, "kernel panic: {}", self.message),
        }
    }
}

impl std::error::Error for KernelPanic {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(AllocError::TableFull.to_string(), "process table full");
        assert_eq!(MemError::BadAddress.to_string(), "bad user address");
        assert_eq!(
            ForkError::Copy(MemError::OutOfMemory).to_string(),
            "fork: address space copy failed: out of physical memory"
        );
        assert_eq!(
            ForkError::from(AllocError::TableFull).to_string(),
            "fork: process table full"
        );
        assert_eq!(PriorityError::OutOfRange(40).to_string(), "priority 40 out of range");
        assert_eq!(
            BootError::from(ConfigError::NoHarts).to_string(),
            "invalid configuration: at least one hart is required"
        );
    }

    #[test]
    fn kernel_panic_names_cpu() {
        let p = KernelPanic {
            cpu: Some(CpuId::new(2)),
            message: "sched locks".into(),
        };
        assert_eq!(p.to_string(), "kernel panic on cpu 2: sched locks");
    }

    #[test]
    fn fork_error_has_source() {
        use std::error::Error;
        assert!(ForkError::Alloc(AllocError::OutOfMemory).source().is_some());
    }
}
