//! Hearth machine simulator.
//!
//! Boots a simulated multi-hart machine, runs a workload as its init
//! process and reports what happened.
//!
//! Pipeline: load config → apply overrides → boot → run init → collect
//!           statuses → power off → report.

mod cli;
mod config;
mod workloads;

use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use hearth_core::id::Pid;
use hearth_core::log::{self, LogLevel};
use hearth_proc::{KernelStats, Machine, ProcInfo, ProcState, User};
use serde::Serialize;

use crate::config::SimConfig;
use crate::workloads::Workload;

/// Channel the `ps` children sleep on.
const PS_CHAN: u64 = 7;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let mut config = SimConfig::load(cli.config.as_deref())?;
    config.apply_overrides(&cli);
    install_sinks(config.log_level()?);

    match cli.command {
        cli::Command::Run(ref args) => cmd_run(&config, args, cli.json),
        cli::Command::Ps(ref args) => cmd_ps(&config, args, cli.json),
        cli::Command::Config => cmd_config(&config),
    }
}

// ===========================================================================
// Console
// ===========================================================================

fn print_sink(args: fmt::Arguments<'_>) {
    print!("{args}");
}

fn log_sink(level: LogLevel, args: fmt::Arguments<'_>) {
    eprintln!("[{}] {args}", level.name());
}

fn install_sinks(level: LogLevel) {
    log::set_max_level(level);
    // SAFETY: both sinks only write to the host's stdio.
    unsafe {
        log::set_print_fn(print_sink);
        log::set_log_fn(log_sink);
    }
}

// ===========================================================================
// Reports
// ===========================================================================

/// One process listing row.
#[derive(Serialize)]
struct ProcRow {
    pid: u32,
    priority: i32,
    name: String,
    state: &'static str,
}

impl From<&ProcInfo> for ProcRow {
    fn from(info: &ProcInfo) -> Self {
        Self {
            pid: info.pid.as_u32(),
            priority: info.priority,
            name: info.name.clone(),
            state: info.state.as_str(),
        }
    }
}

/// Outcome of `hearth-sim run`.
#[derive(Serialize)]
struct RunReport {
    workload: Workload,
    size: usize,
    policy: String,
    cpus: usize,
    statuses: Vec<i32>,
    elapsed_ms: u128,
    ticks: u64,
    allocs: u64,
    reaps: u64,
    live: usize,
    free_memory: usize,
    processes: Vec<ProcRow>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:?} (size {}) on {} harts, policy {}",
            self.workload, self.size, self.cpus, self.policy
        )?;
        writeln!(f, "  exit statuses: {:?}", self.statuses)?;
        writeln!(f, "  elapsed:       {} ms ({} ticks)", self.elapsed_ms, self.ticks)?;
        writeln!(
            f,
            "  processes:     {} allocated, {} reaped, {} live",
            self.allocs, self.reaps, self.live
        )?;
        write!(f, "  free memory:   {} bytes", self.free_memory)
    }
}

fn emit<T: Serialize + fmt::Display>(report: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{report}");
    }
    Ok(())
}

// ===========================================================================
// Commands
// ===========================================================================

/// Waits for init to report back, giving up on a kernel panic or timeout.
fn await_init<T>(machine: &Machine, rx: &mpsc::Receiver<T>, timeout: Duration) -> Result<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.recv_timeout(Duration::from_millis(10)) {
            Ok(value) => return Ok(value),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => bail!("init exited without reporting"),
        }
        if let Some(panic) = machine.kernel().fatal_error() {
            bail!("{panic}");
        }
        if Instant::now() >= deadline {
            bail!("workload did not finish within {} s", timeout.as_secs());
        }
    }
}

fn cmd_run(config: &SimConfig, args: &cli::RunArgs, json: bool) -> Result<()> {
    let kernel_config = config.kernel_config()?;
    let machine = Machine::boot(kernel_config.clone()).context("booting")?;

    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    machine.userinit(workloads::init(args.workload, args.size, tx))?;
    let statuses = await_init(&machine, &rx, config.timeout())?;
    let elapsed = start.elapsed();

    let KernelStats {
        ticks,
        allocs,
        reaps,
        live,
        free_memory,
    } = machine.kernel().stats();
    let processes = machine.kernel().ps().iter().map(ProcRow::from).collect();
    machine.shutdown()?;

    let report = RunReport {
        workload: args.workload,
        size: args.size,
        policy: kernel_config.policy.to_string(),
        cpus: kernel_config.ncpu,
        statuses,
        elapsed_ms: elapsed.as_millis(),
        ticks,
        allocs,
        reaps,
        live,
        free_memory,
        processes,
    };
    emit(&report, json)
}

fn cmd_ps(config: &SimConfig, args: &cli::PsArgs, json: bool) -> Result<()> {
    let machine = Machine::boot(config.kernel_config()?).context("booting")?;
    let children = args.children;

    let (tx, rx) = mpsc::channel();
    machine.userinit(Arc::new(move |u: &User| -> i32 {
        for i in 0..children {
            let pid = u.fork(|c| {
                c.wait_until(PS_CHAN, || false);
                0
            });
            // Spread the children over a few priorities.
            if let Ok(pid) = u32::try_from(pid) {
                let prio = i32::try_from(i % 5).unwrap_or(0) * 4 - 8;
                u.nice(Pid::new(pid), prio);
            }
        }
        // Let every child reach its sleep before listing.
        for _ in 0..1000 {
            let rows = u.kernel().ps();
            if rows.iter().skip(1).all(|r| r.state == ProcState::Sleeping) {
                break;
            }
            u.sleep(1);
        }
        // The system call prints the listing on the console.
        let rows = if json { u.kernel().ps() } else { u.ps() };
        let _ = tx.send(rows);
        workloads::reap_forever(u)
    }))?;
    let rows = await_init(&machine, &rx, config.timeout())?;
    machine.shutdown()?;

    if json {
        let rows: Vec<ProcRow> = rows.iter().map(ProcRow::from).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    }
    Ok(())
}

fn cmd_config(config: &SimConfig) -> Result<()> {
    config.kernel_config()?;
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
