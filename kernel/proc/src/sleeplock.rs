//! Long-term locks that sleep instead of spinning.
//!
//! A [`SleepLock`] may be held across `sleep` and `yield`, so it suits
//! work that blocks. Only processes can take one.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use hearth_core::id::Pid;
use hearth_core::sync::SpinLock;

use crate::kernel::Kernel;
use crate::sleep::Channel;

struct SleepState {
    locked: bool,
    /// Holder, for diagnostics and `holding`.
    pid: Pid,
}

/// A blocking mutual exclusion lock.
pub struct SleepLock<T> {
    lk: SpinLock<SleepState>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialised by the `locked` flag.
unsafe impl<T: Send> Send for SleepLock<T> {}
unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// Creates an unlocked sleep lock.
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            lk: SpinLock::named(
                "sleeplock",
                SleepState {
                    locked: false,
                    pid: Pid::NONE,
                },
            ),
            name,
            data: UnsafeCell::new(value),
        }
    }

    /// Returns the lock's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn channel(&self) -> Channel {
        Channel::Lock(core::ptr::from_ref(self).cast::<()>().addr())
    }

    /// Acquires the lock, sleeping while another process holds it.
    ///
    /// # Panics
    ///
    /// Panics if no process is running on this hart.
    pub fn lock<'a>(&'a self, kernel: &'a Kernel) -> SleepLockGuard<'a, T> {
        let mut g = self.lk.lock();
        while g.locked {
            g = kernel.sleep(self.channel(), g);
        }
        g.locked = true;
        g.pid = kernel.getpid();
        drop(g);
        SleepLockGuard { lock: self, kernel }
    }

    /// Returns whether the running process holds the lock.
    ///
    /// # Panics
    ///
    /// Panics if no process is running on this hart.
    pub fn holding(&self, kernel: &Kernel) -> bool {
        let g = self.lk.lock();
        g.locked && g.pid == kernel.getpid()
    }

    /// Returns whether any process holds the lock.
    pub fn is_locked(&self) -> bool {
        self.lk.lock().locked
    }

    /// Returns a mutable reference to the data; no locking is needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the lock, returning the data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// Guard of a held [`SleepLock`]; releasing wakes the waiters.
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
    kernel: &'a Kernel,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        let mut g = self.lock.lk.lock();
        g.locked = false;
        g.pid = Pid::NONE;
        self.kernel.wakeup(self.lock.channel());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlocked_access_without_processes() {
        let mut lock = SleepLock::new("buf", vec![1, 2]);
        assert_eq!(lock.name(), "buf");
        assert!(!lock.is_locked());
        lock.get_mut().push(3);
        assert_eq!(lock.into_inner(), vec![1, 2, 3]);
    }

    #[test]
    fn channels_are_per_lock() {
        let a = SleepLock::new("a", ());
        let b = SleepLock::new("b", ());
        assert_ne!(a.channel(), b.channel());
        assert_eq!(a.channel(), a.channel());
    }

    #[test]
    #[should_panic(expected = "no process")]
    fn holding_outside_a_process_panics() {
        let kernel = Kernel::sim(crate::config::KernelConfig::default()).unwrap();
        let lock = SleepLock::new("buf", ());
        let _ = lock.holding(&kernel);
    }
}
