//! Workloads run by the simulator's init process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;

use clap::ValueEnum;
use hearth_core::id::Pid;
use hearth_proc::{Program, User};
use serde::Serialize;

/// User channel the ping-pong pairs wait on.
const PINGPONG_CHAN: u64 = 1;
/// User channel sleepers block on until killed.
const SLEEP_CHAN: u64 = 2;

/// Ticks a spin workload lets its spinners compete for.
const SPIN_TICKS: i64 = 20;

/// A built-in workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Workload {
    /// A binary tree of forks `size` levels deep; each leaf exits 1 and
    /// every inner process exits with the sum of its children.
    ForkTree,
    /// Two processes hand a counter back and forth `size` times.
    PingPong,
    /// `size` sleepers that init kills; each exits -1.
    Killer,
    /// `size` busy processes that only leave the hart on timer ticks.
    Spin,
}

impl Workload {
    /// Runs the workload in the calling process and returns the exit
    /// statuses init collected.
    pub fn run(self, u: &User, size: usize) -> Vec<i32> {
        match self {
            Self::ForkTree => vec![fork_tree(u, size)],
            Self::PingPong => ping_pong(u, size),
            Self::Killer => killer(u, size),
            Self::Spin => spin(u, size),
        }
    }
}

/// Builds an init program that runs `workload`, sends its statuses over
/// `done` and then reaps orphans until the machine halts.
pub fn init(workload: Workload, size: usize, done: Sender<Vec<i32>>) -> Program {
    Arc::new(move |u: &User| -> i32 {
        let statuses = workload.run(u, size);
        let _ = done.send(statuses);
        reap_forever(u)
    })
}

/// Init's idle loop.
pub fn reap_forever(u: &User) -> ! {
    loop {
        if u.wait().is_none() {
            u.sleep(1);
        }
    }
}

fn reap_all(u: &User) -> Vec<i32> {
    let mut statuses = Vec::new();
    while let Some((_, status)) = u.wait() {
        statuses.push(status);
    }
    statuses
}

fn fork_tree(u: &User, depth: usize) -> i32 {
    if depth == 0 {
        return 1;
    }
    for _ in 0..2 {
        // A full table just prunes the tree.
        u.fork(move |c| fork_tree(c, depth - 1));
    }
    reap_all(u).into_iter().sum()
}

fn ping_pong(u: &User, rounds: usize) -> Vec<i32> {
    let turn = Arc::new(AtomicU64::new(0));
    for parity in 0..2u64 {
        let turn = Arc::clone(&turn);
        u.fork(move |c| {
            for _ in 0..rounds {
                if c.wait_until(PINGPONG_CHAN, || turn.load(Ordering::Acquire) % 2 == parity) < 0 {
                    return -1;
                }
                c.notify(PINGPONG_CHAN, || {
                    turn.fetch_add(1, Ordering::AcqRel);
                });
            }
            0
        });
    }
    reap_all(u)
}

fn killer(u: &User, count: usize) -> Vec<i32> {
    let pids: Vec<i64> = (0..count)
        .map(|_| {
            u.fork(|c| {
                c.wait_until(SLEEP_CHAN, || false);
                0
            })
        })
        .filter(|&pid| pid > 0)
        .collect();
    u.sleep(2);
    for pid in pids {
        if let Ok(pid) = u32::try_from(pid) {
            u.kill(Pid::new(pid));
        }
    }
    reap_all(u)
}

fn spin(u: &User, count: usize) -> Vec<i32> {
    let stop = Arc::new(AtomicBool::new(false));
    for _ in 0..count {
        let stop = Arc::clone(&stop);
        u.fork(move |c| {
            let mut slices = 0;
            let mut last = c.uptime();
            while !stop.load(Ordering::Acquire) {
                c.checkpoint();
                let now = c.uptime();
                if now != last {
                    slices += 1;
                    last = now;
                }
            }
            slices
        });
    }
    u.sleep(SPIN_TICKS);
    stop.store(true, Ordering::Release);
    reap_all(u)
}
