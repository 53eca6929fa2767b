//! System calls.
//!
//! Each `sys_*` returns the value a user program sees in `a0`. Failures
//! are the sentinel `-1`, except `getpriority`, whose valid results cover
//! negative numbers and which reports "no such process" as
//! [`PRIO_NONE`].

use core::fmt;
use std::sync::Arc;

use hearth_core::id::{Fd, Pid};
use hearth_core::kdebug;

use crate::config::{NOFILE, PAGE_SIZE, PRIO_MIN};
use crate::file::OpenFlags;
use crate::kernel::Kernel;
use crate::sleep::Channel;
use crate::user::Program;

/// `getpriority` result for a pid with no live process.
pub const PRIO_NONE: i64 = PRIO_MIN as i64 - 1;

/// System call numbers, as placed in `a7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Sysno {
    /// Create a child process.
    Fork = 1,
    /// Terminate the caller.
    Exit = 2,
    /// Reap a child.
    Wait = 3,
    /// Mark a process killed.
    Kill = 6,
    /// Caller's pid.
    Getpid = 11,
    /// Grow or shrink user memory.
    Sbrk = 12,
    /// Sleep for a number of ticks.
    Sleep = 13,
    /// Ticks since boot.
    Uptime = 14,
    /// Open a file.
    Open = 15,
    /// Close a descriptor.
    Close = 21,
    /// Print the process listing.
    Ps = 22,
    /// Query a process's priority.
    Getpriority = 23,
    /// Set a process's priority.
    Nice = 24,
    /// Free physical memory in bytes.
    Freemem = 25,
    /// Page size in bytes.
    Pagesize = 26,
    /// Give up the hart.
    Yield = 27,
    /// Sleep on a user channel.
    SleepOn = 28,
    /// Wake a user channel.
    Wakeup = 29,
}

impl Sysno {
    /// Returns the call's name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fork => "fork",
            Self::Exit => "exit",
            Self::Wait => "wait",
            Self::Kill => "kill",
            Self::Getpid => "getpid",
            Self::Sbrk => "sbrk",
            Self::Sleep => "sleep",
            Self::Uptime => "uptime",
            Self::Open => "open",
            Self::Close => "close",
            Self::Ps => "ps",
            Self::Getpriority => "getpriority",
            Self::Nice => "nice",
            Self::Freemem => "freemem",
            Self::Pagesize => "pagesize",
            Self::Yield => "yield",
            Self::SleepOn => "sleepon",
            Self::Wakeup => "wakeup",
        }
    }
}

impl fmt::Display for Sysno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Converts a user-supplied pid argument.
fn arg_pid(raw: i64) -> Option<Pid> {
    u32::try_from(raw).ok().filter(|&p| p != 0).map(Pid::new)
}

impl Kernel {
    /// `fork()`: the child's pid, or `-1`.
    pub fn sys_fork(self: &Arc<Self>, program: Program) -> i64 {
        match self.fork(program) {
            Ok(pid) => i64::from(pid.as_u32()),
            Err(e) => {
                kdebug!("{e}");
                -1
            }
        }
    }

    /// `exit(status)`.
    pub fn sys_exit(&self, status: i32) -> ! {
        self.exit(status)
    }

    /// `wait(addr)`: the reaped child's pid, or `-1`.
    pub fn sys_wait(&self, addr: Option<usize>) -> i64 {
        self.wait(addr).map_or(-1, |(pid, _)| i64::from(pid.as_u32()))
    }

    /// `kill(pid)`: `0`, or `-1` if no such process.
    pub fn sys_kill(&self, pid: i64) -> i64 {
        match arg_pid(pid) {
            Some(pid) if self.kill(pid) => 0,
            _ => -1,
        }
    }

    /// `getpid()`.
    pub fn sys_getpid(&self) -> i64 {
        i64::from(self.getpid().as_u32())
    }

    /// `sbrk(n)`: the old size of user memory, or `-1`.
    pub fn sys_sbrk(&self, n: i64) -> i64 {
        let Ok(n) = isize::try_from(n) else {
            return -1;
        };
        match self.growproc(n) {
            Ok(old) => i64::try_from(old).unwrap_or(-1),
            Err(_) => -1,
        }
    }

    /// `sleep(n)`: waits `n` ticks; `-1` if killed meanwhile.
    pub fn sys_sleep(&self, n: i64) -> i64 {
        let n = u64::try_from(n).unwrap_or(0);
        let (slot, _) = self.myproc();
        let mut ticks = self.ticks_lock().lock();
        let ticks0 = *ticks;
        while *ticks - ticks0 < n {
            if self.killed(slot) {
                return -1;
            }
            ticks = self.sleep(Channel::Ticks, ticks);
        }
        0
    }

    /// `uptime()`: ticks since boot.
    pub fn sys_uptime(&self) -> i64 {
        i64::try_from(self.ticks()).unwrap_or(i64::MAX)
    }

    /// `getpriority(pid)`: the priority, or [`PRIO_NONE`].
    pub fn sys_getpriority(&self, pid: i64) -> i64 {
        arg_pid(pid)
            .and_then(|pid| self.getpriority(pid))
            .map_or(PRIO_NONE, i64::from)
    }

    /// `nice(pid, priority)`: sets an absolute priority; `0`, or `-1` for
    /// an unknown pid or out-of-range priority.
    pub fn sys_nice(&self, pid: i64, priority: i64) -> i64 {
        let (Some(pid), Ok(priority)) = (arg_pid(pid), i32::try_from(priority)) else {
            return -1;
        };
        match self.setpriority(pid, priority) {
            Ok(_) => 0,
            Err(e) => {
                kdebug!("nice: pid {pid}: {e}");
                -1
            }
        }
    }

    /// `ps()`: prints the listing; the number of live processes.
    pub fn sys_ps(&self) -> i64 {
        self.procdump();
        i64::try_from(self.procs().live()).unwrap_or(i64::MAX)
    }

    /// `freemem()`: free physical memory in bytes.
    pub fn sys_freemem(&self) -> i64 {
        i64::try_from(self.mm().free_memory()).unwrap_or(i64::MAX)
    }

    /// `pagesize()`.
    pub fn sys_pagesize(&self) -> i64 {
        PAGE_SIZE as i64
    }

    /// `open(path, flags)`: a new descriptor, or `-1` if the file table or
    /// the caller's descriptor table is full.
    pub fn sys_open(&self, path: &str, flags: OpenFlags) -> i64 {
        let Some(file) = self.fs().open(path, flags) else {
            return -1;
        };
        let (_, p) = self.myproc();
        // SAFETY: we are the running process.
        let data = unsafe { p.data_mut() };
        match data.ofile.iter().position(Option::is_none) {
            Some(fd) => {
                data.ofile[fd] = Some(file);
                fd as i64
            }
            None => {
                self.fs().close(file);
                -1
            }
        }
    }

    /// `close(fd)`: `0`, or `-1` for a descriptor that is not open.
    pub fn sys_close(&self, fd: i64) -> i64 {
        let Some(fd) = u32::try_from(fd).ok().map(Fd::new) else {
            return -1;
        };
        if fd.as_usize() >= NOFILE {
            return -1;
        }
        let (_, p) = self.myproc();
        // SAFETY: we are the running process.
        let data = unsafe { p.data_mut() };
        match data.ofile[fd.as_usize()].take() {
            Some(file) => {
                self.fs().close(file);
                0
            }
            None => -1,
        }
    }
}
