//! A running machine: one host thread per hart plus a clock.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use hearth_core::{kinfo, kwarn};

use crate::config::KernelConfig;
use crate::context::{is_retirement, panic_message};
use crate::error::{AllocError, BootError, KernelPanic};
use crate::file::FileSystem;
use crate::kernel::Kernel;
use crate::mm::MemoryManager;
use crate::user::Program;

use hearth_core::id::Pid;

/// How long shutdown waits for harts to leave their scheduler loops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A booted machine.
///
/// Dropping the machine shuts it down; use [`Machine::shutdown`] to learn
/// whether it halted on a kernel panic.
pub struct Machine {
    kernel: Arc<Kernel>,
    harts: Vec<JoinHandle<()>>,
    clock: Option<JoinHandle<()>>,
    clock_stop: Arc<AtomicBool>,
    stopped: bool,
}

fn hart_main(kernel: &Kernel, index: usize) {
    let cpu = kernel.cpus()[index].id();
    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        let hart = kernel.attach_hart(index);
        hart.run();
    }));
    if let Err(payload) = run {
        if !is_retirement(payload.as_ref()) {
            kernel.fatal(Some(cpu), panic_message(payload.as_ref()));
        }
    }
}

fn clock_main(kernel: &Kernel, stop: &AtomicBool) {
    let tick = kernel.config().tick;
    while !stop.load(Ordering::Acquire) && !kernel.halted() {
        thread::sleep(tick);
        kernel.clock_intr();
    }
}

impl Machine {
    /// Boots a machine with simulated memory and files.
    ///
    /// # Errors
    ///
    /// Returns [`BootError`] if the configuration is invalid or host
    /// threads could not be started.
    pub fn boot(config: KernelConfig) -> Result<Self, BootError> {
        Self::start(Kernel::sim(config)?)
    }

    /// Boots a machine with the given collaborators.
    ///
    /// # Errors
    ///
    /// See [`Machine::boot`].
    pub fn boot_with(
        config: KernelConfig,
        mm: Arc<dyn MemoryManager>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self, BootError> {
        Self::start(Kernel::new(config, mm, fs)?)
    }

    fn start(kernel: Arc<Kernel>) -> Result<Self, BootError> {
        let mut machine = Self {
            kernel: Arc::clone(&kernel),
            harts: Vec::with_capacity(kernel.cpus().len()),
            clock: None,
            clock_stop: Arc::new(AtomicBool::new(false)),
            stopped: false,
        };
        for index in 0..kernel.cpus().len() {
            let k = Arc::clone(&kernel);
            let hart = thread::Builder::new()
                .name(format!("hart{index}"))
                .spawn(move || hart_main(&k, index))
                .map_err(|e| BootError::Spawn(e.kind()))?;
            machine.harts.push(hart);
        }
        let k = Arc::clone(&kernel);
        let stop = Arc::clone(&machine.clock_stop);
        let clock = thread::Builder::new()
            .name("clock".into())
            .spawn(move || clock_main(&k, &stop))
            .map_err(|e| BootError::Spawn(e.kind()))?;
        machine.clock = Some(clock);
        kinfo!("machine: {} harts up", machine.harts.len());
        Ok(machine)
    }

    /// Returns the kernel.
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Creates the first process (see [`Kernel::userinit`]).
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if it could not be built.
    pub fn userinit(&self, program: Program) -> Result<Pid, AllocError> {
        self.kernel.userinit(program)
    }

    /// Stops the harts without tearing anything down.
    pub fn halt(&self) {
        self.kernel.halt();
    }

    /// Halts the machine, waits for the harts and retires every process.
    ///
    /// # Errors
    ///
    /// Returns the kernel panic that halted the machine, if any.
    pub fn shutdown(mut self) -> Result<(), KernelPanic> {
        self.stop();
        match self.kernel.fatal_error() {
            Some(panic) => Err(panic.clone()),
            None => Ok(()),
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.kernel.halt();
        self.clock_stop.store(true, Ordering::Release);

        // A hart whose process panicked never gets its CPU back, so stop
        // waiting as soon as a panic is on record.
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.harts.iter().all(JoinHandle::is_finished) {
            if self.kernel.fatal_error().is_some() || Instant::now() >= deadline {
                kwarn!("machine: harts did not stop, leaving them parked");
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        for hart in core::mem::take(&mut self.harts) {
            if hart.is_finished() {
                let _ = hart.join();
            }
        }
        if let Some(clock) = self.clock.take() {
            let _ = clock.join();
        }
        self.kernel.retire_all();
        kinfo!("machine: powered off");
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.stop();
    }
}
