//! Synchronization primitives.
//!
//! [`SpinLock`] is the only lock in this crate. The blocking-capable lock
//! needs the process table to sleep on, so it lives with the scheduler.

#[cfg(debug_assertions)]
pub mod lockdep;
pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
