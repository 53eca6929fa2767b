//! Sleep and wakeup.
//!
//! A process sleeps on a [`Channel`] while holding the lock that guards
//! the condition it waits for. It takes its own PCB lock before dropping
//! the condition lock, and `wakeup` needs that PCB lock to change the
//! state, so a wakeup issued after the condition changed can never slip
//! in between the check and the sleep.

use hearth_core::ktrace;
use hearth_core::sync::SpinLockGuard;

use crate::kernel::Kernel;
use crate::proc::ProcState;

/// What a sleeping process waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Any child of the process in this slot changed state.
    Proc(usize),
    /// The tick counter advanced.
    Ticks,
    /// A sleep lock at this address was released.
    Lock(usize),
    /// Any kernel object, by address.
    Addr(usize),
    /// A user-chosen value.
    User(u64),
}

impl Channel {
    /// Returns the channel identified by the address of `obj`.
    pub fn of<T: ?Sized>(obj: &T) -> Self {
        Self::Addr(core::ptr::from_ref(obj).cast::<()>().addr())
    }
}

impl Kernel {
    /// Atomically releases `guard`'s lock and sleeps on `chan`;
    /// reacquires the lock when woken.
    ///
    /// Callers re-check their condition after this returns: a wakeup only
    /// means something may have changed.
    ///
    /// # Panics
    ///
    /// Panics if no process runs on this hart, or if `guard` holds no
    /// lock other than the caller's own PCB lock.
    pub fn sleep<'a, T>(&self, chan: Channel, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let (slot, p) = self.myproc();

        // Our PCB lock first: once we hold it, no wakeup can run on us
        // until `sched` has switched away.
        let mut pg = p.lock();
        let lk = SpinLockGuard::unlock(guard);

        pg.chan = Some(chan);
        pg.state = ProcState::Sleeping;
        ktrace!("sleep: slot {slot} on {chan:?}");

        let mut pg = self.sched(pg);

        pg.chan = None;
        drop(pg);
        lk.lock()
    }

    /// Makes every process sleeping on `chan` runnable, except the caller.
    ///
    /// Must not be called with a PCB lock held.
    pub fn wakeup(&self, chan: Channel) {
        let me = self.current_slot();
        for (slot, p) in self.procs().iter() {
            if Some(slot) == me {
                continue;
            }
            let mut g = p.lock();
            if g.state == ProcState::Sleeping && g.chan == Some(chan) {
                g.state = ProcState::Runnable;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_of_is_address_identity() {
        let a = 1u32;
        let b = 2u32;
        assert_eq!(Channel::of(&a), Channel::of(&a));
        assert_ne!(Channel::of(&a), Channel::of(&b));
        assert_ne!(Channel::Proc(1), Channel::Lock(1));
    }

    #[test]
    fn wakeup_only_touches_matching_sleepers() {
        use crate::config::KernelConfig;
        use hearth_core::id::Pid;

        let kernel = Kernel::sim(KernelConfig::default()).unwrap();
        let table = kernel.procs();
        let setup = [
            (0, ProcState::Sleeping, Some(Channel::Ticks)),
            (1, ProcState::Sleeping, Some(Channel::User(9))),
            (2, ProcState::Runnable, None),
        ];
        for (slot, state, chan) in setup {
            let mut g = table.get(slot).lock();
            g.state = state;
            g.chan = chan;
            g.pid = Pid::new(u32::try_from(slot).unwrap() + 1);
        }
        kernel.wakeup(Channel::Ticks);
        assert_eq!(table.get(0).lock().state, ProcState::Runnable);
        assert_eq!(table.get(1).lock().state, ProcState::Sleeping);
        assert_eq!(table.get(2).lock().state, ProcState::Runnable);
        for slot in 0..3 {
            let mut g = table.get(slot).lock();
            g.state = ProcState::Unused;
            g.chan = None;
        }
    }
}
