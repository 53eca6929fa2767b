//! End-to-end tests on a booted machine: real hart threads, a ticking
//! clock and user programs driving the kernel through system calls.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use hearth_core::id::Pid;
use hearth_core::sync::SpinLock;
use hearth_proc::error::{BootError, ConfigError, KernelPanic};
use hearth_proc::file::{FileId, InodeId};
use hearth_proc::{
    FileSystem, KernelConfig, Machine, MemoryManager, OpenFlags, PolicyKind, ProcState, SimFiles,
    SimMemory, User,
};

const SCENARIO_TIMEOUT: Duration = Duration::from_secs(30);

fn config(ncpu: usize, nproc: usize) -> KernelConfig {
    KernelConfig {
        ncpu,
        nproc,
        npages: 256,
        ..KernelConfig::default()
    }
}

fn boot(ncpu: usize, nproc: usize) -> Machine {
    Machine::boot(config(ncpu, nproc)).unwrap()
}

fn pid_of(raw: i64) -> Pid {
    Pid::new(u32::try_from(raw).unwrap())
}

/// Runs `scenario` as init and returns what it produced. Init then keeps
/// reaping orphans until the machine shuts down.
fn run_init<T, F>(machine: &Machine, scenario: F) -> T
where
    T: Send + 'static,
    F: Fn(&User) -> T + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel();
    machine
        .userinit(Arc::new(move |u: &User| -> i32 {
            let _ = tx.send(scenario(u));
            loop {
                if u.wait().is_none() {
                    u.sleep(1);
                }
            }
        }))
        .unwrap();
    rx.recv_timeout(SCENARIO_TIMEOUT)
        .expect("init scenario did not finish")
}

/// Waits for a process to bring the kernel down, then shuts the machine
/// down and returns the recorded panic.
fn await_fatal(machine: Machine) -> KernelPanic {
    let deadline = Instant::now() + SCENARIO_TIMEOUT;
    while machine.kernel().fatal_error().is_none() {
        assert!(Instant::now() < deadline, "panic was not reported");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(machine.kernel().halted());
    machine.shutdown().unwrap_err()
}

#[test]
fn fork_exit_wait_reports_status() {
    let m = boot(3, 16);
    let (child, reaped, a0) = run_init(&m, |u| {
        let child = u.fork(|c| if c.a0() == 0 { 42 } else { 1 });
        let a0 = u.a0();
        (child, u.wait(), a0)
    });
    assert!(child > 0);
    assert_eq!(a0, child, "parent sees the child's pid in a0");
    assert_eq!(reaped, Some((pid_of(child), 42)));

    let stats = m.kernel().stats();
    assert_eq!(stats.allocs, stats.reaps + stats.live as u64);
    assert_eq!(stats.live, 1);
    m.shutdown().unwrap();
}

#[test]
fn wait_without_children_fails() {
    let m = boot(2, 8);
    let (plain, into) = run_init(&m, |u| (u.wait(), u.wait_into(0)));
    assert_eq!(plain, None);
    assert_eq!(into, -1);
    m.shutdown().unwrap();
}

#[test]
fn wait_stores_status_in_user_memory() {
    let m = boot(2, 8);
    let (child, ret, stored, bad, later) = run_init(&m, |u| {
        let child = u.fork(|_| 9);
        let ret = u.wait_into(64);
        let stored = u.load_i32(64);
        // An unmapped address fails and leaves the zombie for later.
        let other = u.fork(|_| 3);
        let bad = u.wait_into(1 << 20);
        let later = u.wait();
        (child, ret, stored, bad, later.map(|(pid, s)| (i64::from(pid.as_u32()) == other, s)))
    });
    assert_eq!(ret, child);
    assert_eq!(stored, Some(9));
    assert_eq!(bad, -1);
    assert_eq!(later, Some((true, 3)));
    m.shutdown().unwrap();
}

#[test]
fn orphans_are_reparented_to_init() {
    const CHAN: u64 = 11;
    let m = boot(3, 16);
    let go = Arc::new(AtomicBool::new(false));
    let (middle, first, grandchild, second) = run_init(&m, move |u| {
        let release = Arc::clone(&go);
        let middle = u.fork(move |mid| {
            let release = Arc::clone(&release);
            let grandchild = mid.fork(move |g| {
                g.wait_until(CHAN, || release.load(Ordering::Acquire));
                5
            });
            // Exit without waiting: the grandchild is orphaned.
            i32::try_from(grandchild).unwrap_or(-1)
        });
        let first = u.wait();
        u.notify(CHAN, || go.store(true, Ordering::Release));
        let second = u.wait();
        (middle, first, first.map(|(_, status)| status), second)
    });
    assert_eq!(first.map(|(pid, _)| pid), Some(pid_of(middle)));
    let grandchild = grandchild.unwrap();
    assert!(grandchild > 0);
    assert_eq!(second, Some((pid_of(i64::from(grandchild)), 5)));
    m.shutdown().unwrap();
}

#[test]
fn killed_sleeper_exits_with_minus_one() {
    const CHAN: u64 = 3;
    let m = boot(2, 8);
    let (killed, unknown, reaped, child) = run_init(&m, |u| {
        let child = u.fork(|c| {
            c.wait_until(CHAN, || false);
            0
        });
        u.sleep(2);
        let killed = u.kill(pid_of(child));
        let unknown = u.kill(Pid::new(9999));
        (killed, unknown, u.wait(), child)
    });
    assert_eq!(killed, 0);
    assert_eq!(unknown, -1);
    assert_eq!(reaped, Some((pid_of(child), -1)));
    m.shutdown().unwrap();
}

#[test]
fn priority_is_inherited_and_range_checked() {
    let m = boot(2, 8);
    let (set, inherited, missing, rejected, mine) = run_init(&m, |u| {
        let me = u.getpid();
        let set = u.nice(me, 5);
        u.fork(|c| i32::try_from(c.getpriority(c.getpid())).unwrap_or(i32::MIN));
        let inherited = u.wait().map(|(_, status)| status);
        (
            set,
            inherited,
            u.getpriority(Pid::new(4242)),
            u.nice(me, 40),
            u.getpriority(me),
        )
    });
    assert_eq!(set, 0);
    assert_eq!(inherited, Some(5));
    assert_eq!(missing, hearth_proc::PRIO_NONE);
    assert_eq!(rejected, -1);
    assert_eq!(mine, 5);
    m.shutdown().unwrap();
}

#[test]
fn full_table_recovers_after_reaping() {
    const CHAN: u64 = 21;
    let m = boot(2, 4);
    let go = Arc::new(AtomicBool::new(false));
    let (forked, reaped, again, free_before, free_after) = run_init(&m, move |u| {
        let free_before = u.freemem();
        let mut forked = 0;
        loop {
            let release = Arc::clone(&go);
            let pid = u.fork(move |c| {
                c.wait_until(CHAN, || release.load(Ordering::Acquire));
                0
            });
            if pid < 0 {
                break;
            }
            forked += 1;
        }
        u.notify(CHAN, || go.store(true, Ordering::Release));
        let mut reaped = 0;
        while u.wait().is_some() {
            reaped += 1;
        }
        let again = u.fork(|_| 0);
        u.wait();
        (forked, reaped, again, free_before, u.freemem())
    });
    assert_eq!(forked, 3, "init holds the fourth slot");
    assert_eq!(reaped, 3);
    assert!(again > 0);
    assert_eq!(free_before, free_after);
    m.shutdown().unwrap();
}

#[test]
fn open_files_are_shared_with_children() {
    let files = Arc::new(SimFiles::new());
    let memory = Arc::new(SimMemory::new(256));
    let fs: Arc<dyn FileSystem> = files.clone();
    let mm: Arc<dyn MemoryManager> = memory.clone();
    let m = Machine::boot_with(config(2, 8), mm, fs).unwrap();

    let file = FileId::new(0);
    let root = InodeId::new(0);
    let seen = Arc::new(Mutex::new(None));
    let probe = Arc::clone(&files);
    let in_child = Arc::clone(&seen);
    let report = run_init(&m, move |u| {
        let fd = u.open("/console", OpenFlags::READ | OpenFlags::WRITE);
        let before = (probe.file_refs(file), probe.inode_refs(root));
        let (files, seen) = (Arc::clone(&probe), Arc::clone(&in_child));
        u.fork(move |_| {
            *seen.lock().unwrap() = Some((files.file_refs(file), files.inode_refs(root)));
            0
        });
        u.wait();
        let after = (probe.file_refs(file), probe.inode_refs(root));
        let closed = u.close(fd);
        (fd, before, after, closed, probe.file_refs(file), u.close(fd))
    });

    let (fd, before, after, closed, refs_after_close, close_again) = report;
    assert_eq!(fd, 0);
    assert_eq!(before, (1, 1));
    assert_eq!(*seen.lock().unwrap(), Some((2, 2)));
    assert_eq!(after, (1, 1));
    assert_eq!(closed, 0);
    assert_eq!(refs_after_close, 0);
    assert_eq!(close_again, -1);
    assert_eq!(files.open_files(), 0);
    m.shutdown().unwrap();
    assert!(memory.free_pages() < memory.total_pages(), "init is never reaped");
}

#[test]
fn no_wakeup_is_lost_under_contention() {
    const PAIRS: u64 = 3;
    const ROUNDS: usize = 200;
    let m = boot(3, 16);
    let statuses = run_init(&m, |u| {
        for pair in 0..PAIRS {
            let turn = Arc::new(AtomicU64::new(0));
            for parity in 0..2u64 {
                let turn = Arc::clone(&turn);
                u.fork(move |c| {
                    for _ in 0..ROUNDS {
                        if c.wait_until(pair, || turn.load(Ordering::Acquire) % 2 == parity) < 0 {
                            return 1;
                        }
                        c.notify(pair, || {
                            turn.fetch_add(1, Ordering::AcqRel);
                        });
                    }
                    0
                });
            }
        }
        let mut statuses = Vec::new();
        while let Some((_, status)) = u.wait() {
            statuses.push(status);
        }
        statuses
    });
    assert_eq!(statuses, vec![0; 6]);
    m.shutdown().unwrap();
}

#[test]
fn timer_preempts_a_spinning_process() {
    // One hart: init only runs again if the spinner is preempted.
    let m = boot(1, 8);
    let (spinner, reaped, slept) = run_init(&m, |u| {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let spinner = u.fork(move |c| {
            while !flag.load(Ordering::Acquire) {
                c.checkpoint();
            }
            0
        });
        let slept = u.sleep(3);
        stop.store(true, Ordering::Release);
        (spinner, u.wait(), slept)
    });
    assert_eq!(slept, 0);
    assert_eq!(reaped, Some((pid_of(spinner), 0)));
    m.shutdown().unwrap();
}

#[test]
fn sleep_waits_for_ticks() {
    let m = boot(2, 8);
    let (before, slept, after) = run_init(&m, |u| {
        let before = u.uptime();
        let slept = u.sleep(5);
        (before, slept, u.uptime())
    });
    assert_eq!(slept, 0);
    assert!(after - before >= 5);
    m.shutdown().unwrap();
}

#[test]
fn sbrk_grows_and_shrinks_memory() {
    let m = boot(2, 8);
    let r = run_init(&m, |u| {
        let page = u.pagesize();
        let free0 = u.freemem();
        let old = u.sbrk(page);
        let grown = u.sbrk(0);
        let free1 = u.freemem();
        let huge = u.sbrk(1 << 40);
        let back = u.sbrk(-page);
        (page, free0, old, grown, free1, huge, back, u.sbrk(0), u.freemem())
    });
    let (page, free0, old, grown, free1, huge, back, size, free2) = r;
    assert_eq!(page, 4096);
    assert_eq!(old, page);
    assert_eq!(grown, 2 * page);
    assert_eq!(free0 - free1, page);
    assert_eq!(huge, -1);
    assert_eq!(back, 2 * page);
    assert_eq!(size, page);
    assert_eq!(free2, free0);
    m.shutdown().unwrap();
}

#[test]
fn ps_lists_live_processes() {
    const CHAN: u64 = 5;
    let m = boot(2, 8);
    let (killed, rows, child) = run_init(&m, |u| {
        let child = u.fork(|c| {
            c.wait_until(CHAN, || false);
            0
        });
        let mut rows = u.ps();
        for _ in 0..1000 {
            if rows.iter().any(|r| r.state == ProcState::Sleeping) {
                break;
            }
            u.sleep(1);
            rows = u.ps();
        }
        let killed = u.kill(pid_of(child));
        u.wait();
        (killed, rows, child)
    });
    assert_eq!(killed, 0);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].name, "initcode");
    assert_eq!(rows[0].state, ProcState::Running);
    assert_eq!(rows[1].pid, pid_of(child));
    assert_eq!(rows[1].name, "initcode", "children inherit the name");
    assert_eq!(rows[1].state, ProcState::Sleeping);
    m.shutdown().unwrap();
}

#[test]
fn fcfs_machine_runs_a_fork_tree() {
    let m = Machine::boot(KernelConfig {
        policy: PolicyKind::Fcfs,
        ..config(2, 16)
    })
    .unwrap();
    let total = run_init(&m, |u| {
        for i in 1..=5 {
            u.fork(move |c| {
                let grandchild = c.fork(move |_| i);
                let inner = c.wait().map_or(0, |(_, s)| s);
                if grandchild > 0 { inner * 10 } else { -1 }
            });
        }
        let mut total = 0;
        while let Some((_, status)) = u.wait() {
            total += status;
        }
        total
    });
    assert_eq!(total, 150);
    assert_eq!(m.kernel().policy(), PolicyKind::Fcfs);
    m.shutdown().unwrap();
}

#[test]
fn process_panic_halts_the_machine() {
    let m = boot(2, 8);
    m.userinit(Arc::new(|u: &User| -> i32 {
        u.fork(|_| panic!("boom"));
        loop {
            if u.wait().is_none() {
                u.sleep(1);
            }
        }
    }))
    .unwrap();

    let err = await_fatal(m);
    assert_eq!(err.message, "boom");
    assert!(err.cpu.is_some());
}

#[test]
fn switching_away_with_a_second_lock_held_is_fatal() {
    let m = boot(2, 8);
    m.userinit(Arc::new(|u: &User| -> i32 {
        u.fork(|c| {
            let extra = SpinLock::new(0u32);
            let _held = extra.lock();
            c.yield_now();
            0
        });
        loop {
            if u.wait().is_none() {
                u.sleep(1);
            }
        }
    }))
    .unwrap();

    let err = await_fatal(m);
    assert_eq!(err.message, "sched locks");
    assert!(err.cpu.is_some());
}

#[test]
fn init_returning_is_fatal() {
    let m = boot(1, 4);
    m.userinit(Arc::new(|_: &User| 0)).unwrap();
    assert_eq!(await_fatal(m).message, "init exiting");
}

#[test]
fn invalid_config_is_rejected_at_boot() {
    let err = Machine::boot(KernelConfig {
        nproc: 0,
        ..KernelConfig::default()
    })
    .err();
    assert_eq!(err, Some(BootError::Config(ConfigError::TableSize(0))));
}
