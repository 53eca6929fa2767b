//! Kernel configuration and fixed limits.

use core::fmt;
use core::str::FromStr;
use core::time::Duration;

use hearth_core::static_assert;

use crate::error::ConfigError;

/// Largest process table a kernel may be configured with.
pub const NPROC_MAX: usize = 64;
/// Open files per process.
pub const NOFILE: usize = 16;
/// Most harts a single machine may have.
pub const NCPU_MAX: usize = 16;
/// Bytes per physical page.
pub const PAGE_SIZE: usize = 4096;
/// Host stack size reserved for each process's kernel stack.
pub const KSTACK_SIZE: usize = 256 * 1024;
/// Longest process name kept in a PCB (bytes).
pub const MAXNAME: usize = 15;

/// Most favourable scheduling priority.
pub const PRIO_MIN: i32 = -20;
/// Least favourable scheduling priority.
pub const PRIO_MAX: i32 = 19;
/// Priority of a freshly allocated process.
pub const PRIO_DEFAULT: i32 = 0;

static_assert!(NOFILE >= 3, "stdio needs three descriptors");
static_assert!(PRIO_MIN < PRIO_DEFAULT && PRIO_DEFAULT < PRIO_MAX);
static_assert!(NCPU_MAX < hearth_core::cpu_local::MAX_CPUS);

/// Which built-in scheduling policy the harts run.
///
/// The numeric code is the process-wide configuration value; it can be
/// changed while the machine runs with
/// [`Kernel::set_policy`](crate::Kernel::set_policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PolicyKind {
    /// Sweep the whole table in index order every pass.
    #[default]
    RoundRobin = 0,
    /// Run the runnable process with the earliest creation stamp.
    Fcfs = 1,
}

impl PolicyKind {
    /// Returns the configuration code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decodes a configuration code.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::RoundRobin),
            1 => Some(Self::Fcfs),
            _ => None,
        }
    }

    /// Returns the short name used in config files and logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::RoundRobin => "rr",
            Self::Fcfs => "fcfs",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PolicyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rr" | "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "fcfs" | "fifo" => Ok(Self::Fcfs),
            _ => Err(ConfigError::UnknownPolicy(s.to_owned())),
        }
    }
}

/// Boot-time kernel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of harts (scheduler loops).
    pub ncpu: usize,
    /// Process table capacity.
    pub nproc: usize,
    /// Physical pages handed to the page allocator.
    pub npages: usize,
    /// Initial scheduling policy.
    pub policy: PolicyKind,
    /// Timer tick period.
    pub tick: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ncpu: 3,
            nproc: NPROC_MAX,
            npages: 1024,
            policy: PolicyKind::RoundRobin,
            tick: Duration::from_millis(1),
        }
    }
}

impl KernelConfig {
    /// Checks the configuration against the fixed limits.
    ///
    /// # Errors
    ///
    /// Returns the first limit the configuration breaks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ncpu == 0 {
            return Err(ConfigError::NoHarts);
        }
        if self.ncpu > NCPU_MAX {
            return Err(ConfigError::TooManyHarts(self.ncpu));
        }
        if self.nproc == 0 || self.nproc > NPROC_MAX {
            return Err(ConfigError::TableSize(self.nproc));
        }
        if self.npages == 0 || u32::try_from(self.npages).map_or(true, |n| n == u32::MAX) {
            return Err(ConfigError::PageCount(self.npages));
        }
        if self.tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        Ok(())
    }
}
