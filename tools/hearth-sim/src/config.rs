//! Simulator configuration: a TOML file plus command-line overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use hearth_core::log::LogLevel;
use hearth_proc::{KernelConfig, PolicyKind};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

/// The whole configuration file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Machine shape.
    pub kernel: KernelSection,
    /// Run control.
    pub run: RunSection,
}

/// The `[kernel]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelSection {
    /// Number of harts.
    pub ncpu: usize,
    /// Process table size.
    pub nproc: usize,
    /// Physical pages.
    pub npages: usize,
    /// Scheduling policy name.
    pub policy: String,
    /// Timer tick period in milliseconds.
    pub tick_ms: u64,
}

impl Default for KernelSection {
    fn default() -> Self {
        let config = KernelConfig::default();
        Self {
            ncpu: config.ncpu,
            nproc: config.nproc,
            npages: config.npages,
            policy: config.policy.name().to_owned(),
            tick_ms: u64::try_from(config.tick.as_millis()).unwrap_or(1),
        }
    }
}

/// The `[run]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSection {
    /// How long to wait for a workload before giving up, in seconds.
    pub timeout_secs: u64,
    /// Kernel log level.
    pub log_level: String,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            log_level: "warn".to_owned(),
        }
    }
}

impl SimConfig {
    /// Loads `path`, or the defaults if no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses a configuration document.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Applies the command-line overrides.
    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(ncpu) = cli.cpus {
            self.kernel.ncpu = ncpu;
        }
        if let Some(nproc) = cli.nproc {
            self.kernel.nproc = nproc;
        }
        if let Some(policy) = &cli.policy {
            self.kernel.policy.clone_from(policy);
        }
        if let Some(level) = &cli.log_level {
            self.run.log_level.clone_from(level);
        }
    }

    /// Builds and validates the kernel configuration.
    pub fn kernel_config(&self) -> Result<KernelConfig> {
        let k = &self.kernel;
        let config = KernelConfig {
            ncpu: k.ncpu,
            nproc: k.nproc,
            npages: k.npages,
            policy: k.policy.parse::<PolicyKind>()?,
            tick: Duration::from_millis(k.tick_ms),
        };
        config.validate()?;
        Ok(config)
    }

    /// Returns the configured log level.
    pub fn log_level(&self) -> Result<LogLevel> {
        Ok(self.run.log_level.parse::<LogLevel>()?)
    }

    /// Returns the workload timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.run.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_match_kernel_defaults() {
        let config = SimConfig::default().kernel_config().unwrap();
        assert_eq!(config, KernelConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = SimConfig::parse(
            r#"
            [kernel]
            ncpu = 2
            policy = "fcfs"
            "#,
        )
        .unwrap();
        let kernel = config.kernel_config().unwrap();
        assert_eq!(kernel.ncpu, 2);
        assert_eq!(kernel.policy, PolicyKind::Fcfs);
        assert_eq!(kernel.nproc, KernelConfig::default().nproc);
        assert_eq!(config.run, RunSection::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(SimConfig::parse("[kernel]\nharts = 2\n").is_err());
    }

    #[test]
    fn bad_values_fail_validation() {
        let config = SimConfig::parse("[kernel]\npolicy = \"lottery\"\n").unwrap();
        let err = config.kernel_config().unwrap_err();
        assert!(err.to_string().contains("lottery"));

        let config = SimConfig::parse("[kernel]\nncpu = 0\n").unwrap();
        assert!(config.kernel_config().is_err());

        let config = SimConfig::parse("[run]\nlog_level = \"loud\"\n").unwrap();
        assert!(config.log_level().is_err());
    }

    #[test]
    fn command_line_overrides_file() {
        let cli = Cli::parse_from([
            "hearth-sim",
            "--cpus",
            "1",
            "--policy",
            "fcfs",
            "--log-level",
            "debug",
            "config",
        ]);
        let mut config = SimConfig::parse("[kernel]\nncpu = 4\n").unwrap();
        config.apply_overrides(&cli);
        assert_eq!(config.kernel.ncpu, 1);
        assert_eq!(config.kernel.policy, "fcfs");
        assert_eq!(config.log_level().unwrap(), LogLevel::Debug);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = SimConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(SimConfig::parse(&text).unwrap(), config);
    }
}
