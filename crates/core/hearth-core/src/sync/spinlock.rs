//! Spin-based mutual exclusion lock.
//!
//! Uses test-and-test-and-set (TTAS) to reduce cache-line contention.
//! Each lock remembers the CPU holding it. Acquiring a lock the current
//! CPU already holds, or releasing one it does not hold, is fatal.
//! Holding a lock keeps interrupts off on the holding CPU via
//! [`push_off`]/[`pop_off`].
//!
//! Two unsafe escape hatches exist for the one lock that crosses a
//! context switch (a process's own PCB lock): [`SpinLockGuard::leak`]
//! keeps the lock held while dropping the guard object, and
//! [`SpinLock::assume_locked`] / [`SpinLock::force_unlock`] pick the held
//! lock up again on the other side of the switch.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::cpu_local::current_cpu_id;
use crate::intr::{pop_off, push_off};

/// Name given to locks created with [`SpinLock::new`]. Such locks are not
/// tracked by lockdep.
pub const UNNAMED: &str = "<unnamed>";

/// A spin-based mutual exclusion lock.
///
/// Const-constructable so it can be placed in `static` items.
pub struct SpinLock<T> {
    locked: AtomicBool,
    /// Holding CPU ID plus one; zero while free.
    holder: AtomicU32,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: The SpinLock ensures exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from different threads.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

#[inline]
fn holder_tag() -> u32 {
    current_cpu_id().as_u32() + 1
}

impl<T> SpinLock<T> {
    /// Creates a new unlocked, unnamed `SpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self::named(UNNAMED, value)
    }

    /// Creates a new unlocked `SpinLock` with a name for diagnostics and
    /// lock-order tracking. Locks sharing a name share a lockdep class.
    pub const fn named(name: &'static str, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicU32::new(0),
            name,
            data: UnsafeCell::new(value),
        }
    }

    /// Returns the lock's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns whether the current CPU holds this lock.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.holder.load(Ordering::Relaxed) == holder_tag()
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Returns a [`SpinLockGuard`] that releases the lock when dropped.
    ///
    /// # Panics
    ///
    /// Panics if the current CPU already holds the lock.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        if self.holding() {
            panic!(
                "acquire: lock `{}` already held by cpu {}",
                self.name,
                current_cpu_id()
            );
        }
        push_off();

        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }

            // TTAS: spin on a read (shared cache line) until it looks free.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        self.acquired();
        SpinLockGuard::new(self)
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `None` if the lock is held, including by this CPU.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        push_off();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.acquired();
            Some(SpinLockGuard::new(self))
        } else {
            pop_off();
            None
        }
    }

    /// Returns a mutable reference to the underlying data without acquiring the lock.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other code is concurrently accessing the data.
    pub unsafe fn force_get(&self) -> &mut T {
        // SAFETY: upheld by the caller.
        unsafe { &mut *self.data.get() }
    }

    /// Re-materialises a guard for a lock the current CPU already holds.
    ///
    /// # Safety
    ///
    /// The current CPU must hold the lock, and no other guard for it may be
    /// live on this thread of control (the previous one was
    /// [leaked](SpinLockGuard::leak) or belongs to a thread that is parked
    /// in a context switch).
    pub unsafe fn assume_locked(&self) -> SpinLockGuard<'_, T> {
        crate::assert_unsafe_precondition!(
            self.holding(),
            "assume_locked: lock `{}` not held by cpu {}",
            self.name,
            current_cpu_id()
        );
        SpinLockGuard::new(self)
    }

    /// Releases a lock the current CPU holds without going through a guard.
    ///
    /// # Safety
    ///
    /// Same as [`assume_locked`](Self::assume_locked): the guard that
    /// acquired the lock must not be used to release it again.
    pub unsafe fn force_unlock(&self) {
        self.release();
    }

    fn acquired(&self) {
        self.holder.store(holder_tag(), Ordering::Relaxed);
        #[cfg(debug_assertions)]
        super::lockdep::lock_acquired(self.name);
    }

    fn release(&self) {
        if !self.holding() {
            panic!(
                "release: lock `{}` not held by cpu {}",
                self.name,
                current_cpu_id()
            );
        }
        #[cfg(debug_assertions)]
        super::lockdep::lock_released(self.name);
        self.holder.store(0, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard that releases the [`SpinLock`] when dropped.
///
/// Not `Send`: a lock belongs to the CPU that took it.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    fn new(lock: &'a SpinLock<T>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }

    /// Returns a reference to the underlying [`SpinLock`].
    pub fn lock_ref(&self) -> &'a SpinLock<T> {
        self.lock
    }

    /// Releases the lock and returns a reference to it for re-acquisition.
    pub fn unlock(guard: Self) -> &'a SpinLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }

    /// Forgets the guard while leaving the lock held by the current CPU.
    ///
    /// The lock must later be released through
    /// [`SpinLock::assume_locked`] or [`SpinLock::force_unlock`], possibly
    /// by another thread of control running on the same CPU.
    pub fn leak(guard: Self) -> &'a SpinLock<T> {
        let lock = guard.lock;
        core::mem::forget(guard);
        lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intr;
    use std::sync::Arc;

    #[test]
    fn lock_unlock() {
        let lock = SpinLock::new(42);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 42);
            assert!(lock.holding());
        }
        assert!(!lock.holding());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn try_lock_fails_when_held() {
        let lock = SpinLock::new(10);
        let _guard = lock.lock();
        assert!(lock.try_lock().is_none());
        assert_eq!(intr::depth(), 1, "failed try_lock must not leak a push_off");
    }

    #[test]
    fn mutate_through_guard() {
        let lock = SpinLock::named("test.mutate", String::from("hello"));
        lock.lock().push_str(", world");
        assert_eq!(lock.lock().as_str(), "hello, world");
        assert_eq!(lock.name(), "test.mutate");
    }

    #[test]
    fn holding_disables_interrupts() {
        intr::intr_on();
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(!intr::intr_get());
        let lock2 = SpinLock::new(());
        let guard2 = lock2.lock();
        drop(guard2);
        assert!(!intr::intr_get(), "outer lock still held");
        drop(guard);
        assert!(intr::intr_get());
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn reacquire_on_same_cpu_is_fatal() {
        let lock = SpinLock::named("test.reacquire", 0);
        let _a = lock.lock();
        let _b = lock.lock();
    }

    #[test]
    #[should_panic(expected = "not held")]
    fn force_unlock_of_free_lock_is_fatal() {
        let lock = SpinLock::new(0);
        // SAFETY: deliberately violated; release checks the holder first.
        unsafe { lock.force_unlock() };
    }

    #[test]
    fn leak_then_assume_locked() {
        let lock = SpinLock::new(5);
        let guard = lock.lock();
        let lock_ref = SpinLockGuard::leak(guard);
        assert!(lock_ref.holding());
        assert_eq!(intr::depth(), 1);
        // SAFETY: this CPU holds the lock and the original guard was leaked.
        let mut guard = unsafe { lock_ref.assume_locked() };
        *guard += 1;
        drop(guard);
        assert!(!lock.holding());
        assert_eq!(intr::depth(), 0);
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn unlock_returns_lock_for_reacquire() {
        let lock = SpinLock::new(1);
        let guard = lock.lock();
        let again = SpinLockGuard::unlock(guard);
        assert!(!again.holding());
        assert_eq!(*again.lock(), 1);
    }

    #[test]
    fn contended_counter() {
        const THREADS: usize = 8;
        const ITERS: usize = 2_000;

        let lock = Arc::new(SpinLock::named("test.counter", 0usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..ITERS {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), THREADS * ITERS);
    }
}
