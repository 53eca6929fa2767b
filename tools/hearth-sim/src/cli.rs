//! Command-line interface definitions for hearth-sim.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::workloads::Workload;

/// Simulated multi-hart kernel.
#[derive(Parser)]
#[command(name = "hearth-sim", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Number of harts (overrides the config file).
    #[arg(long, global = true)]
    pub cpus: Option<usize>,

    /// Process table size (overrides the config file).
    #[arg(long, global = true)]
    pub nproc: Option<usize>,

    /// Scheduling policy: `rr` or `fcfs` (overrides the config file).
    #[arg(long, short = 'p', global = true)]
    pub policy: Option<String>,

    /// Kernel log level: fatal, error, warn, info, debug or trace.
    #[arg(long, short = 'l', global = true)]
    pub log_level: Option<String>,

    /// Print results as JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Boot a machine, run a workload as init and report the outcome.
    Run(RunArgs),
    /// Boot a machine with a few sleeping processes and list them.
    Ps(PsArgs),
    /// Print the resolved configuration.
    Config,
}

/// Arguments for the `run` subcommand.
#[derive(Parser)]
pub struct RunArgs {
    /// Workload to run.
    #[arg(value_enum)]
    pub workload: Workload,

    /// Workload size: tree depth, rounds or process count.
    #[arg(long, short = 'n', default_value_t = 3)]
    pub size: usize,
}

/// Arguments for the `ps` subcommand.
#[derive(Parser)]
pub struct PsArgs {
    /// Number of child processes to create.
    #[arg(long, default_value_t = 4)]
    pub children: usize,
}
