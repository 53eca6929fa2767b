//! Process lifecycle: allocation, fork, exit, wait, kill, priorities.

use std::sync::Arc;

use hearth_core::id::Pid;
use hearth_core::sync::SpinLockGuard;
use hearth_core::{kdebug, kinfo, kprint};

use crate::config::{PAGE_SIZE, PRIO_DEFAULT, PRIO_MAX, PRIO_MIN};
use crate::context::KernelStack;
use crate::error::{AllocError, ForkError, MemError, PriorityError};
use crate::kernel::Kernel;
use crate::proc::{Listing, ProcInfo, ProcInner, ProcState};
use crate::sleep::Channel;
use crate::trapframe::TrapFrame;
use crate::user::{Program, User};

impl Kernel {
    /// Finds an unused slot and builds a process in it: pid, creation
    /// stamp, trap frame page, empty address space and a kernel stack
    /// whose first switch-in lands in `forkret`.
    ///
    /// Returns with the new PCB's lock held and its state `Used`.
    pub(crate) fn allocproc(
        self: &Arc<Self>,
    ) -> Result<(usize, SpinLockGuard<'_, ProcInner>), AllocError> {
        let (slot, mut g) = self
            .procs()
            .iter()
            .find_map(|(slot, p)| {
                let g = p.lock();
                (g.state == ProcState::Unused).then_some((slot, g))
            })
            .ok_or(AllocError::TableFull)?;

        g.pid = self.procs().alloc_pid();
        g.state = ProcState::Used;
        g.priority = PRIO_DEFAULT;
        g.created = self.procs().next_stamp();
        g.killed = false;
        g.xstate = 0;
        g.chan = None;

        // SAFETY: the slot is `Used` and we hold its lock.
        let data = unsafe { self.procs().get(slot).data_mut() };
        match self.mm().alloc_page() {
            Ok(frame) => data.trapframe_page = Some(frame),
            Err(_) => {
                self.freeproc(slot, &mut g);
                return Err(AllocError::OutOfMemory);
            }
        }
        data.trapframe = TrapFrame::default();
        match self.mm().create() {
            Ok(space) => data.space = Some(space),
            Err(_) => {
                self.freeproc(slot, &mut g);
                return Err(AllocError::OutOfMemory);
            }
        }

        let kernel = Arc::clone(self);
        let reporter = Arc::downgrade(self);
        let stack = KernelStack::spawn(
            format!("kstack-{}", g.pid),
            move || kernel.forkret(slot),
            move |cpu, message| {
                if let Some(kernel) = reporter.upgrade() {
                    kernel.fatal(cpu, message);
                }
            },
        );
        match stack {
            Ok(stack) => g.kstack = Some(stack),
            Err(_) => {
                self.freeproc(slot, &mut g);
                return Err(AllocError::NoKernelStack);
            }
        }
        self.procs().count_alloc();
        Ok((slot, g))
    }

    /// Releases everything a slot owns and marks it `Unused`.
    ///
    /// The caller holds the slot's lock, and the process is not running.
    pub(crate) fn freeproc(&self, slot: usize, g: &mut ProcInner) {
        // SAFETY: the caller holds the lock of a process that cannot run.
        let data = unsafe { self.procs().get(slot).data_mut() };
        if let Some(frame) = data.trapframe_page.take() {
            self.mm().free_page(frame);
        }
        if let Some(space) = data.space.take() {
            self.mm().destroy(space);
        }
        for file in data.ofile.iter_mut().filter_map(Option::take) {
            self.fs().close(file);
        }
        if let Some(cwd) = data.cwd.take() {
            self.fs().iput(cwd);
        }
        data.trapframe = TrapFrame::default();
        data.size = 0;
        data.program = None;

        if let Some(kstack) = g.kstack.take() {
            kstack.retire();
            self.procs().count_reap();
        }
        g.pid = Pid::NONE;
        g.name.clear();
        g.chan = None;
        g.killed = false;
        g.xstate = 0;
        g.priority = PRIO_DEFAULT;
        g.created = 0;
        g.state = ProcState::Unused;
    }

    /// Builds a runnable-to-be process with one page of user memory and
    /// the root directory as its working directory. The slot is left
    /// `Used`; the caller links it and calls [`make_runnable`](Self::make_runnable).
    fn create_process(
        self: &Arc<Self>,
        name: &str,
        program: Program,
    ) -> Result<(usize, Pid), AllocError> {
        let (slot, mut g) = self.allocproc()?;
        // SAFETY: the slot is `Used` and we hold its lock.
        let data = unsafe { self.procs().get(slot).data_mut() };
        let Some(space) = data.space else {
            self.freeproc(slot, &mut g);
            return Err(AllocError::OutOfMemory);
        };
        match self.mm().grow(space, 0, PAGE_SIZE) {
            Ok(size) => data.size = size,
            Err(_) => {
                self.freeproc(slot, &mut g);
                return Err(AllocError::OutOfMemory);
            }
        }
        data.trapframe.epc = 0;
        data.trapframe.sp = PAGE_SIZE as u64;
        data.cwd = Some(self.fs().root());
        data.program = Some(program);
        g.set_name(name);
        Ok((slot, g.pid))
    }

    fn make_runnable(&self, slot: usize) {
        self.procs().get(slot).lock().state = ProcState::Runnable;
    }

    /// Creates the first user process. It adopts every orphan and must
    /// never exit.
    ///
    /// # Errors
    ///
    /// Returns an [`AllocError`] if the process could not be built.
    ///
    /// # Panics
    ///
    /// Panics if the first process already exists.
    pub fn userinit(self: &Arc<Self>, program: Program) -> Result<Pid, AllocError> {
        if self.initproc().is_some() {
            panic!("userinit: init already exists");
        }
        let (slot, pid) = self.create_process("initcode", program)?;
        if !self.set_initproc(slot) {
            panic!("userinit: init already exists");
        }
        self.make_runnable(slot);
        kinfo!("userinit: init is pid {pid}");
        Ok(pid)
    }

    /// Creates a process outside `fork`, as a child of init (or with no
    /// parent if init does not exist yet).
    ///
    /// # Errors
    ///
    /// Returns an [`AllocError`] if the process could not be built.
    pub fn spawn(self: &Arc<Self>, name: &str, program: Program) -> Result<Pid, AllocError> {
        let (slot, pid) = self.create_process(name, program)?;
        {
            let mut parents = self.procs().wait_lock.lock();
            parents[slot] = self.initproc();
        }
        self.make_runnable(slot);
        kdebug!("spawn: pid {pid} ({name})");
        Ok(pid)
    }

    /// Creates a child of the running process that runs `program`.
    ///
    /// The child gets a copy of the parent's memory and trap frame (with
    /// `a0` cleared, so it sees `0` as fork's return value), references
    /// to the parent's open files and directory, its name and priority.
    ///
    /// # Errors
    ///
    /// Returns [`ForkError`] on exhaustion; the parent is unaffected.
    pub fn fork(self: &Arc<Self>, program: Program) -> Result<Pid, ForkError> {
        let (pslot, p) = self.myproc();
        // Read before allocproc: holding our own lock while it scans the
        // table would nest PCB locks out of slot order.
        let (name, priority, ppid) = {
            let g = p.lock();
            (g.name.clone(), g.priority, g.pid)
        };

        let (cslot, mut cg) = self.allocproc()?;
        // SAFETY: we are the running parent; the child is `Used` and locked.
        let (pdata, cdata) = unsafe { (p.data_mut(), self.procs().get(cslot).data_mut()) };

        let copied = match (pdata.space, cdata.space) {
            (Some(from), Some(to)) => self.mm().copy(from, to, pdata.size),
            _ => Err(MemError::NoSuchSpace),
        };
        if let Err(e) = copied {
            self.freeproc(cslot, &mut cg);
            return Err(ForkError::Copy(e));
        }
        cdata.size = pdata.size;
        cdata.trapframe = pdata.trapframe;
        cdata.trapframe.a0 = 0;

        for (child, parent) in cdata.ofile.iter_mut().zip(pdata.ofile.iter()) {
            *child = parent.map(|f| self.fs().dup(f));
        }
        cdata.cwd = pdata.cwd.map(|ip| self.fs().idup(ip));
        cdata.program = Some(program);

        cg.set_name(&name);
        cg.priority = priority;
        let pid = cg.pid;
        drop(cg);

        {
            let mut parents = self.procs().wait_lock.lock();
            parents[cslot] = Some(pslot);
        }
        self.make_runnable(cslot);
        kdebug!("fork: pid {ppid} -> {pid}");
        Ok(pid)
    }

    /// Hands every child of `slot` to init, waking init if any were
    /// adopted. The caller holds `wait_lock`.
    pub(crate) fn reparent(&self, slot: usize, parents: &mut [Option<usize>]) {
        let init = self.initproc();
        let mut adopted = false;
        for parent in parents.iter_mut().filter(|p| **p == Some(slot)) {
            *parent = init;
            adopted = true;
        }
        if let (true, Some(init)) = (adopted, init) {
            self.wakeup(Channel::Proc(init));
        }
    }

    /// Terminates the running process. It stays a zombie until its parent
    /// reaps it.
    ///
    /// # Panics
    ///
    /// Panics if called by init, or if the zombie is ever switched in.
    pub fn exit(&self, status: i32) -> ! {
        let (slot, p) = self.myproc();
        if Some(slot) == self.initproc() {
            panic!("init exiting");
        }

        {
            // SAFETY: we are the running process.
            let data = unsafe { p.data_mut() };
            for file in data.ofile.iter_mut().filter_map(Option::take) {
                self.fs().close(file);
            }
            if let Some(cwd) = data.cwd.take() {
                self.fs().iput(cwd);
            }
        }

        let mut parents = self.procs().wait_lock.lock();
        self.reparent(slot, &mut parents);
        // The parent might be sleeping in wait().
        if let Some(parent) = parents[slot] {
            self.wakeup(Channel::Proc(parent));
        }

        let mut g = p.lock();
        g.xstate = status;
        g.state = ProcState::Zombie;
        kdebug!("exit: pid {} status {status}", g.pid);
        drop(parents);

        // Never resumed: the parent retires this stack when it reaps us.
        let _g = self.sched(g);
        panic!("zombie exit");
    }

    /// Waits for a child to exit and reaps it, returning its pid and exit
    /// status. The status is also stored at user address `addr`, if given.
    ///
    /// Returns `None` if the caller has no children, has been killed, or
    /// `addr` is not writable.
    pub fn wait(&self, addr: Option<usize>) -> Option<(Pid, i32)> {
        let (slot, p) = self.myproc();
        let mut parents = self.procs().wait_lock.lock();
        loop {
            let mut havekids = false;
            for child in 0..parents.len() {
                if parents[child] != Some(slot) {
                    continue;
                }
                havekids = true;
                let mut cg = self.procs().get(child).lock();
                if cg.state != ProcState::Zombie {
                    continue;
                }
                let pid = cg.pid;
                let xstate = cg.xstate;
                if let Some(addr) = addr {
                    // SAFETY: we are the running process.
                    let space = unsafe { p.data_mut() }.space;
                    let written = space
                        .ok_or(MemError::NoSuchSpace)
                        .and_then(|s| self.mm().copy_out(s, addr, &xstate.to_ne_bytes()));
                    if written.is_err() {
                        return None;
                    }
                }
                self.freeproc(child, &mut cg);
                drop(cg);
                parents[child] = None;
                kdebug!("wait: reaped pid {pid} status {xstate}");
                return Some((pid, xstate));
            }

            if !havekids || self.killed(slot) {
                return None;
            }
            parents = self.sleep(Channel::Proc(slot), parents);
        }
    }

    /// Marks the process with `pid` killed. It exits the next time it
    /// passes a user-return checkpoint; a sleeper is woken to get there.
    ///
    /// Returns whether such a process exists.
    pub fn kill(&self, pid: Pid) -> bool {
        let Some((_, mut g)) = self.procs().find_pid(pid) else {
            return false;
        };
        g.killed = true;
        if g.state == ProcState::Sleeping {
            g.state = ProcState::Runnable;
        }
        kdebug!("kill: pid {pid}");
        true
    }

    /// Marks the process in `slot` killed.
    pub fn setkilled(&self, slot: usize) {
        self.procs().get(slot).lock().killed = true;
    }

    /// Returns whether the process in `slot` has been killed.
    pub fn killed(&self, slot: usize) -> bool {
        self.procs().get(slot).lock().killed
    }

    /// Grows (or shrinks, for negative `n`) the running process's memory
    /// by `n` bytes. Returns the old size.
    ///
    /// # Errors
    ///
    /// Returns the memory manager's error; the size is unchanged.
    pub fn growproc(&self, n: isize) -> Result<usize, MemError> {
        let (_, p) = self.myproc();
        // SAFETY: we are the running process.
        let data = unsafe { p.data_mut() };
        let space = data.space.ok_or(MemError::NoSuchSpace)?;
        let old = data.size;
        let new = old.checked_add_signed(n).ok_or(MemError::BadAddress)?;
        data.size = if new > old {
            self.mm().grow(space, old, new)?
        } else {
            self.mm().shrink(space, old, new)
        };
        Ok(old)
    }

    /// Returns the pid of the running process.
    pub fn getpid(&self) -> Pid {
        let (_, p) = self.myproc();
        p.lock().pid
    }

    /// Returns the priority of the process with `pid`.
    pub fn getpriority(&self, pid: Pid) -> Option<i32> {
        self.procs().find_pid(pid).map(|(_, g)| g.priority)
    }

    /// Sets the priority of the process with `pid`, returning the old one.
    ///
    /// # Errors
    ///
    /// [`PriorityError::OutOfRange`] outside `PRIO_MIN..=PRIO_MAX`,
    /// [`PriorityError::NoSuchProcess`] if no live process has `pid`.
    pub fn setpriority(&self, pid: Pid, priority: i32) -> Result<i32, PriorityError> {
        if !(PRIO_MIN..=PRIO_MAX).contains(&priority) {
            return Err(PriorityError::OutOfRange(priority));
        }
        let (_, mut g) = self
            .procs()
            .find_pid(pid)
            .ok_or(PriorityError::NoSuchProcess)?;
        Ok(core::mem::replace(&mut g.priority, priority))
    }

    /// Returns a listing row for every live process.
    pub fn ps(&self) -> Vec<ProcInfo> {
        self.procs().snapshot()
    }

    /// Prints the process listing to the console.
    pub fn procdump(&self) {
        let rows = self.ps();
        kprint!("{}", Listing(&rows));
    }

    /// First code a new process runs once switched in. Releases the PCB
    /// lock the scheduler took, runs the user program and exits with its
    /// status.
    fn forkret(self: Arc<Self>, slot: usize) {
        let p = self.procs().get(slot);
        // SAFETY: the hart that switched us in holds our lock, and the
        // guard it took was leaked on its side of the switch.
        unsafe { p.lock_ref().force_unlock() };

        // SAFETY: we are the running process.
        let program = unsafe { p.data_mut() }.program.clone();
        let user = User::new(Arc::clone(&self), slot);
        // Deliver anything that arrived before the first run.
        user.checkpoint();
        let status = program.map_or(0, |program| program(&user));
        drop(user);
        self.exit(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    fn kernel(nproc: usize, npages: usize) -> Arc<Kernel> {
        Kernel::sim(KernelConfig {
            ncpu: 1,
            nproc,
            npages,
            ..KernelConfig::default()
        })
        .unwrap()
    }

    fn noop() -> Program {
        Arc::new(|_: &User| 0)
    }

    #[test]
    fn allocproc_assigns_increasing_pids_and_stamps() {
        let k = kernel(4, 64);
        let (a, ga) = k.allocproc().unwrap();
        let (pid_a, stamp_a) = (ga.pid, ga.created);
        assert_eq!(ga.state, ProcState::Used);
        drop(ga);
        let (b, gb) = k.allocproc().unwrap();
        assert_ne!(a, b);
        assert!(gb.pid.as_u32() > pid_a.as_u32());
        assert!(gb.created > stamp_a);
        drop(gb);
        k.power_off();
    }

    #[test]
    fn table_full_is_recoverable() {
        let k = kernel(2, 64);
        let _a = k.spawn("a", noop()).unwrap();
        let _b = k.spawn("b", noop()).unwrap();
        assert_eq!(k.spawn("c", noop()), Err(AllocError::TableFull));
        assert_eq!(k.procs().live(), 2);
        k.power_off();
    }

    #[test]
    fn out_of_memory_releases_partial_state() {
        // Enough for the trap frame page and address space root, not for
        // the first user page.
        let k = kernel(4, 2);
        assert_eq!(k.spawn("big", noop()), Err(AllocError::OutOfMemory));
        assert_eq!(k.procs().live(), 0);
        assert_eq!(k.mm().free_memory(), 2 * PAGE_SIZE);
        assert_eq!(k.procs().allocs(), k.procs().reaps());
        k.power_off();
    }

    #[test]
    fn spawned_process_is_runnable_and_listed() {
        let k = kernel(4, 64);
        let pid = k.spawn("worker-with-long-name", noop()).unwrap();
        let rows = k.ps();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pid, pid);
        assert_eq!(rows[0].name, "worker-with-lon");
        assert_eq!(rows[0].state, ProcState::Runnable);
        assert_eq!(rows[0].priority, PRIO_DEFAULT);
        k.power_off();
    }

    #[test]
    fn kill_marks_and_wakes() {
        let k = kernel(4, 64);
        let pid = k.spawn("sleeper", noop()).unwrap();
        let (slot, mut g) = k.procs().find_pid(pid).unwrap();
        g.state = ProcState::Sleeping;
        g.chan = Some(Channel::User(1));
        drop(g);
        assert!(k.kill(pid));
        assert!(k.killed(slot));
        assert_eq!(k.procs().get(slot).lock().state, ProcState::Runnable);
        assert!(!k.kill(Pid::new(999)));
        k.power_off();
    }

    #[test]
    fn priorities_are_range_checked() {
        let k = kernel(4, 64);
        let pid = k.spawn("p", noop()).unwrap();
        assert_eq!(k.getpriority(pid), Some(PRIO_DEFAULT));
        assert_eq!(k.setpriority(pid, -5), Ok(PRIO_DEFAULT));
        assert_eq!(k.getpriority(pid), Some(-5));
        assert_eq!(
            k.setpriority(pid, PRIO_MAX + 1),
            Err(PriorityError::OutOfRange(PRIO_MAX + 1))
        );
        assert_eq!(
            k.setpriority(Pid::new(77), 0),
            Err(PriorityError::NoSuchProcess)
        );
        assert_eq!(k.getpriority(Pid::new(77)), None);
        k.power_off();
    }

    #[test]
    #[should_panic(expected = "init already exists")]
    fn second_userinit_is_fatal() {
        let k = kernel(4, 64);
        k.userinit(noop()).unwrap();
        let _ = k.userinit(noop());
    }

    #[test]
    fn reparent_hands_children_to_init() {
        let k = kernel(4, 64);
        let init = k.userinit(noop()).unwrap();
        let (init_slot, _) = k.procs().find_pid(init).unwrap();
        let mut parents = k.procs().wait_lock.lock();
        parents[2] = Some(1);
        parents[3] = Some(1);
        k.reparent(1, &mut parents);
        assert_eq!(parents[2], Some(init_slot));
        assert_eq!(parents[3], Some(init_slot));
        drop(parents);
        k.power_off();
    }
}
