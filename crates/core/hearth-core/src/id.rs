//! Type-safe identifiers for kernel resources.
//!
//! These newtypes keep process ids, CPU ids and file descriptor numbers
//! from being mixed up at compile time.

use core::fmt;

/// Process identifier.
///
/// Pid 0 is never handed out; a free process slot carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// The pid of a slot that does not hold a process.
    pub const NONE: Self = Self(0);

    /// Creates a new `Pid`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `true` for [`Pid::NONE`].
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CPU identifier: an index into the slot pool of [`crate::cpu_local`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// Creates a new `CpuId`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the value as `usize` (convenience for indexing).
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File descriptor number, an index into a process's open-file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Fd(u32);

impl Fd {
    /// Standard input.
    pub const STDIN: Self = Self(0);
    /// Standard output.
    pub const STDOUT: Self = Self(1);
    /// Standard error.
    pub const STDERR: Self = Self(2);

    /// Creates a new `Fd`.
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the value as `usize` (convenience for indexing).
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_none_is_zero() {
        assert!(Pid::NONE.is_none());
        assert!(!Pid::new(1).is_none());
        assert_eq!(Pid::default(), Pid::NONE);
    }

    #[test]
    fn pid_display_and_ordering() {
        assert_eq!(format!("{}", Pid::new(12)), "12");
        assert!(Pid::new(3) < Pid::new(4));
    }

    #[test]
    fn cpu_id_indexing() {
        let id = CpuId::new(7);
        assert_eq!(id.as_u32(), 7);
        assert_eq!(id.as_usize(), 7);
        assert_eq!(id.to_string(), "7");
    }

    #[test]
    fn fd_constants() {
        assert_eq!(Fd::STDIN.as_usize(), 0);
        assert_eq!(Fd::STDOUT.as_usize(), 1);
        assert_eq!(Fd::STDERR.as_u32(), 2);
    }
}
