//! The user-mode view of a process.
//!
//! A user program is a closure run on the process's kernel stack. It
//! reaches the kernel only through [`User`], whose methods behave like
//! system call stubs: each one enters the kernel through the trap path,
//! stores the result in the trap frame's `a0` and passes the user-return
//! checkpoint (kill, halt, preemption) on the way out.

use std::sync::Arc;

use hearth_core::id::Pid;
use hearth_core::ktrace;

use crate::file::OpenFlags;
use crate::kernel::Kernel;
use crate::proc::ProcInfo;
use crate::sleep::Channel;
use crate::syscall::Sysno;

/// A user program. Its return value is the process's exit status.
pub type Program = Arc<dyn Fn(&User) -> i32 + Send + Sync>;

/// Handle a running user program uses to make system calls.
pub struct User {
    kernel: Arc<Kernel>,
    slot: usize,
}

impl User {
    pub(crate) fn new(kernel: Arc<Kernel>, slot: usize) -> Self {
        Self { kernel, slot }
    }

    /// Returns the kernel.
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Returns the process's table slot.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Enters the kernel for `num`, runs `f` and stores its result in
    /// `a0`.
    fn trap(&self, num: Sysno, f: impl FnOnce(&Arc<Kernel>) -> i64) -> i64 {
        // SAFETY: we are the running process; the reference is dropped
        // before anything that could switch.
        unsafe { self.kernel.procs().get(self.slot).data_mut() }.trapframe.a7 = num as u64;
        self.kernel.usertrap_entry(self.slot);
        let ret = f(&self.kernel);
        ktrace!("syscall: slot {} {num} -> {ret}", self.slot);
        // SAFETY: as above.
        unsafe { self.kernel.procs().get(self.slot).data_mut() }
            .trapframe
            .set_return(ret);
        self.kernel.usertrap(self.slot);
        ret
    }

    /// Returns the trap frame's `a0`: the last system call's result, and
    /// `0` in a freshly forked child.
    pub fn a0(&self) -> i64 {
        // SAFETY: we are the running process.
        unsafe { self.kernel.procs().get(self.slot).data_mut() }
            .trapframe
            .ret()
    }

    /// A user-return checkpoint without a system call, as taken after an
    /// interrupt: exit if killed, give up the hart on a pending timer.
    pub fn checkpoint(&self) {
        self.kernel.usertrap(self.slot);
    }

    /// `fork()`: starts a child running `child`. Returns the child's pid,
    /// or `-1`.
    pub fn fork<F>(&self, child: F) -> i64
    where
        F: Fn(&User) -> i32 + Send + Sync + 'static,
    {
        let program: Program = Arc::new(child);
        self.trap(Sysno::Fork, move |k| k.sys_fork(program))
    }

    /// `exit(status)`.
    pub fn exit(&self, status: i32) -> ! {
        self.kernel.usertrap_entry(self.slot);
        self.kernel.sys_exit(status)
    }

    /// `wait(0)`: reaps a child, returning its pid and exit status.
    pub fn wait(&self) -> Option<(Pid, i32)> {
        let mut reaped = None;
        self.trap(Sysno::Wait, |k| match k.wait(None) {
            Some((pid, status)) => {
                reaped = Some((pid, status));
                i64::from(pid.as_u32())
            }
            None => -1,
        });
        reaped
    }

    /// `wait(addr)`: reaps a child and stores its status at user address
    /// `addr`. Returns the pid, or `-1`.
    pub fn wait_into(&self, addr: usize) -> i64 {
        self.trap(Sysno::Wait, |k| k.sys_wait(Some(addr)))
    }

    /// Reads an `i32` from user memory.
    pub fn load_i32(&self, addr: usize) -> Option<i32> {
        // SAFETY: we are the running process.
        let space = unsafe { self.kernel.procs().get(self.slot).data_mut() }.space?;
        let mut buf = [0u8; 4];
        self.kernel.mm().copy_in(space, addr, &mut buf).ok()?;
        Some(i32::from_ne_bytes(buf))
    }

    /// `kill(pid)`: `0` or `-1`.
    pub fn kill(&self, pid: Pid) -> i64 {
        self.trap(Sysno::Kill, |k| k.sys_kill(i64::from(pid.as_u32())))
    }

    /// `getpid()`.
    pub fn getpid(&self) -> Pid {
        let pid = self.trap(Sysno::Getpid, |k| k.sys_getpid());
        Pid::new(u32::try_from(pid).unwrap_or(0))
    }

    /// `sleep(n)`: `0`, or `-1` if killed while sleeping.
    pub fn sleep(&self, ticks: i64) -> i64 {
        self.trap(Sysno::Sleep, |k| k.sys_sleep(ticks))
    }

    /// `uptime()`.
    pub fn uptime(&self) -> i64 {
        self.trap(Sysno::Uptime, |k| k.sys_uptime())
    }

    /// `sbrk(n)`: the old break, or `-1`.
    pub fn sbrk(&self, n: i64) -> i64 {
        self.trap(Sysno::Sbrk, |k| k.sys_sbrk(n))
    }

    /// `getpriority(pid)`: the priority, or `-21` if there is no such process.
    pub fn getpriority(&self, pid: Pid) -> i64 {
        self.trap(Sysno::Getpriority, |k| {
            k.sys_getpriority(i64::from(pid.as_u32()))
        })
    }

    /// `nice(pid, priority)`: `0` or `-1`.
    pub fn nice(&self, pid: Pid, priority: i32) -> i64 {
        self.trap(Sysno::Nice, |k| {
            k.sys_nice(i64::from(pid.as_u32()), i64::from(priority))
        })
    }

    /// `ps()`: prints the listing and also returns it.
    pub fn ps(&self) -> Vec<ProcInfo> {
        let mut rows = Vec::new();
        self.trap(Sysno::Ps, |k| {
            let n = k.sys_ps();
            rows = k.ps();
            n
        });
        rows
    }

    /// `freemem()`.
    pub fn freemem(&self) -> i64 {
        self.trap(Sysno::Freemem, |k| k.sys_freemem())
    }

    /// `pagesize()`.
    pub fn pagesize(&self) -> i64 {
        self.trap(Sysno::Pagesize, |k| k.sys_pagesize())
    }

    /// `open(path, flags)`: a descriptor or `-1`.
    pub fn open(&self, path: &str, flags: OpenFlags) -> i64 {
        self.trap(Sysno::Open, |k| k.sys_open(path, flags))
    }

    /// `close(fd)`: `0` or `-1`.
    pub fn close(&self, fd: i64) -> i64 {
        self.trap(Sysno::Close, |k| k.sys_close(fd))
    }

    /// `yield()`.
    pub fn yield_now(&self) {
        self.trap(Sysno::Yield, |k| {
            k.yield_now();
            0
        });
    }

    /// Sleeps on user channel `chan` until `ready` returns true.
    ///
    /// `ready` is evaluated under the user-channel lock, the same lock
    /// [`User::notify`] holds while changing state, so a notification can
    /// never be missed. Returns `-1` if killed while waiting.
    pub fn wait_until(&self, chan: u64, ready: impl Fn() -> bool) -> i64 {
        self.trap(Sysno::SleepOn, |k| {
            let (slot, _) = k.myproc();
            let mut g = k.uchan_lock().lock();
            while !ready() {
                if k.killed(slot) {
                    return -1;
                }
                g = k.sleep(Channel::User(chan), g);
            }
            0
        })
    }

    /// Runs `update` under the user-channel lock, then wakes every process
    /// waiting on `chan`.
    pub fn notify(&self, chan: u64, update: impl FnOnce()) {
        self.trap(Sysno::Wakeup, |k| {
            let g = k.uchan_lock().lock();
            update();
            k.wakeup(Channel::User(chan));
            drop(g);
            0
        });
    }

    /// Returns whether this process has been killed.
    pub fn killed(&self) -> bool {
        self.kernel.killed(self.slot)
    }
}
