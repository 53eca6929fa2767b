//! Per-core context switch.
//!
//! A [`Context`] is one resumable thread of control: a hart's scheduler
//! loop or a process's kernel stack. Each is backed by its own host
//! thread, and on every CPU exactly one context is running at a time.
//! [`switch`] hands the current CPU to another context and parks the
//! caller until some CPU hands control back; the resumed side re-binds
//! itself to the CPU that resumed it.
//!
//! A context that will never run again (a reaped zombie, every process at
//! power-off) is [retired](Context::retire): it unwinds out of `switch`
//! with a private payload that [`KernelStack`] catches at the top of its
//! thread.

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering, fence};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};

use hearth_core::cpu_local::{bind_current, current_cpu_id, unbind_current};
use hearth_core::id::CpuId;

use crate::config::KSTACK_SIZE;

const PARKED: u8 = 0;
const GRANTED: u8 = 1;
const RUNNING: u8 = 2;
const RETIRED: u8 = 3;

/// Unwind payload of a retired context.
struct Retired;

struct Inner {
    state: AtomicU8,
    cpu: AtomicU32,
    thread: OnceLock<Thread>,
}

/// A saved thread of control. Cloning yields another handle to the same one.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a parked context with no owning thread yet.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(PARKED),
                cpu: AtomicU32::new(0),
                thread: OnceLock::new(),
            }),
        }
    }

    /// Claims this context for the calling thread and marks it running.
    ///
    /// Used by a hart entering its scheduler loop.
    ///
    /// # Panics
    ///
    /// Panics if another thread already owns the context.
    pub fn enter(&self) {
        let me = thread::current();
        let owner = self.inner.thread.get_or_init(|| me.clone());
        assert_eq!(owner.id(), me.id(), "context entered from a foreign thread");
        self.inner.state.store(RUNNING, Ordering::Release);
    }

    /// Returns whether the context has been retired.
    pub fn is_retired(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == RETIRED
    }

    /// Wakes the owning thread if it is idling (e.g. a hart in wait-for-interrupt).
    pub fn ring(&self) {
        // Pairs with the fence in `park`: either we see the owner's
        // registration or the owner sees our state change.
        fence(Ordering::SeqCst);
        if let Some(t) = self.inner.thread.get() {
            t.unpark();
        }
    }

    /// Marks the context as never to run again and wakes its thread so it
    /// can unwind.
    pub fn retire(&self) {
        self.inner.state.store(RETIRED, Ordering::Release);
        self.ring();
    }

    /// Hands `cpu` to this context.
    fn grant(&self, cpu: CpuId) {
        self.inner.cpu.store(cpu.as_u32(), Ordering::Relaxed);
        match self.inner.state.compare_exchange(
            PARKED,
            GRANTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => self.ring(),
            Err(RETIRED) => panic!("switch: target context is retired"),
            Err(_) => panic!("switch: target context is already running"),
        }
    }

    /// Blocks the owning thread until the context is granted a CPU.
    fn park(&self) {
        let me = thread::current();
        self.inner.thread.get_or_init(|| me);
        fence(Ordering::SeqCst);
        loop {
            match self.inner.state.compare_exchange(
                GRANTED,
                RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(RETIRED) => {
                    unbind_current();
                    panic::resume_unwind(Box::new(Retired));
                }
                Err(_) => thread::park(),
            }
        }
        bind_current(CpuId::new(self.inner.cpu.load(Ordering::Relaxed)));
    }
}

/// Suspends the current thread of control into `from` and resumes `to` on
/// the current CPU. Returns when some CPU switches back to `from`, possibly
/// a different one than it left on.
///
/// # Safety
///
/// `from` must be the context running on this thread. Callers must hold
/// exactly one spin lock, the PCB lock of the process being switched in
/// or out, with interrupts disabled by it. That lock is released by the
/// thread of control on the other side.
pub unsafe fn switch(from: &Context, to: &Context) {
    hearth_core::assert_unsafe_precondition!(
        matches!(from.inner.state.load(Ordering::Acquire), RUNNING | RETIRED),
        "switch: `from` is not the running context"
    );
    let cpu = current_cpu_id();
    // `from` must read as parked before `to` can run and switch straight
    // back. A context retired while running stays retired and unwinds in
    // `park` once the CPU is handed on.
    let _ = from.inner.state.compare_exchange(
        RUNNING,
        PARKED,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    to.grant(cpu);
    from.park();
}

/// Returns whether an unwind payload is a retirement rather than a panic.
pub fn is_retirement(payload: &(dyn Any + Send)) -> bool {
    payload.is::<Retired>()
}

/// Extracts the message of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

/// A process's kernel stack: a host thread that sleeps until its context
/// is first switched in, then runs its entry function.
pub struct KernelStack {
    context: Context,
    thread: Option<JoinHandle<()>>,
}

impl KernelStack {
    /// Creates the stack thread.
    ///
    /// `on_panic` runs on the stack thread if `entry` panics; retirement
    /// is not a panic and ends the thread quietly.
    ///
    /// # Errors
    ///
    /// Returns the host error if the thread could not be created.
    pub fn spawn<F, P>(name: String, entry: F, on_panic: P) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
        P: FnOnce(Option<CpuId>, String) + Send + 'static,
    {
        let context = Context::new();
        let ctx = context.clone();
        let thread = thread::Builder::new()
            .name(name)
            .stack_size(KSTACK_SIZE)
            .spawn(move || {
                let run = panic::catch_unwind(AssertUnwindSafe(|| {
                    ctx.park();
                    entry();
                }));
                if let Err(payload) = run {
                    if !is_retirement(payload.as_ref()) {
                        let cpu = hearth_core::cpu_local::bound_cpu_id();
                        on_panic(cpu, panic_message(payload.as_ref()));
                    }
                }
                unbind_current();
            })?;
        Ok(Self {
            context,
            thread: Some(thread),
        })
    }

    /// Returns the stack's context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Retires the stack's context; its thread unwinds and exits.
    pub fn retire(&self) {
        self.context.retire();
    }

    /// Returns whether the stack thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        // A stack that goes away must not leave a thread parked forever.
        if !self.context.is_retired() {
            self.context.retire();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::cpu_local::{claim_cpu_slot, release_cpu_slot};
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn wait_finished(stack: &KernelStack) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !stack.is_finished() {
            assert!(Instant::now() < deadline, "stack thread did not exit");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn ping_pong_between_contexts() {
        let cpu = claim_cpu_slot().unwrap();
        bind_current(cpu);
        let main = Context::new();
        main.enter();

        let trace = Arc::new(Mutex::new(Vec::new()));
        let back = main.clone();
        let t = Arc::clone(&trace);
        let (tx, rx) = mpsc::channel::<Context>();
        let stack = KernelStack::spawn(
            "ctx-test".into(),
            move || {
                let me = rx.recv().unwrap();
                for i in 0..3 {
                    t.lock().unwrap().push(format!("stack {i} on {}", current_cpu_id()));
                    // SAFETY: test contexts hold no spin locks.
                    unsafe { switch(&me, &back) };
                }
            },
            |_, msg| panic!("unexpected panic: {msg}"),
        )
        .unwrap();
        tx.send(stack.context().clone()).unwrap();

        for i in 0..3 {
            // SAFETY: as above.
            unsafe { switch(&main, stack.context()) };
            trace.lock().unwrap().push(format!("main {i}"));
        }
        assert_eq!(current_cpu_id(), cpu);
        let trace = trace.lock().unwrap().clone();
        assert_eq!(
            trace,
            vec![
                format!("stack 0 on {cpu}"),
                "main 0".to_string(),
                format!("stack 1 on {cpu}"),
                "main 1".to_string(),
                format!("stack 2 on {cpu}"),
                "main 2".to_string(),
            ]
        );

        stack.retire();
        wait_finished(&stack);
        unbind_current();
        release_cpu_slot(cpu);
    }

    #[test]
    fn retire_before_first_run_ends_thread() {
        let (tx, rx) = mpsc::channel();
        let stack = KernelStack::spawn(
            "ctx-retire".into(),
            move || tx.send(()).unwrap(),
            |_, msg| panic!("unexpected panic: {msg}"),
        )
        .unwrap();
        stack.retire();
        wait_finished(&stack);
        assert!(rx.try_recv().is_err(), "entry must never run");
        assert!(stack.context().is_retired());
    }

    #[test]
    fn grant_racing_first_park_is_observed() {
        for i in 0..200 {
            let (tx, rx) = mpsc::channel();
            let stack = KernelStack::spawn(
                format!("ctx-race-{i}"),
                move || tx.send(current_cpu_id()).unwrap(),
                |_, msg| panic!("unexpected panic: {msg}"),
            )
            .unwrap();
            stack.context().grant(CpuId::new(0));
            let on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(on, CpuId::new(0));
            wait_finished(&stack);
        }
    }

    #[test]
    fn entry_panic_is_reported() {
        let cpu = claim_cpu_slot().unwrap();
        bind_current(cpu);
        let main = Context::new();
        main.enter();

        let (tx, rx) = mpsc::channel();
        let stack = KernelStack::spawn(
            "ctx-panic".into(),
            || panic!("boom"),
            move |cpu, msg| tx.send((cpu, msg)).unwrap(),
        )
        .unwrap();
        let target = stack.context().clone();
        // The stack never switches back, so hand it the CPU from a helper
        // thread bound to the same slot and leave `main` parked.
        let helper = thread::spawn(move || {
            bind_current(cpu);
            let ctx = Context::new();
            ctx.enter();
            ctx.inner.state.store(PARKED, Ordering::Release);
            target.grant(cpu);
        });
        helper.join().unwrap();
        let (on, msg) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(on, Some(cpu));
        assert_eq!(msg, "boom");
        unbind_current();
        release_cpu_slot(cpu);
    }

    #[test]
    fn panic_message_formats() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(5u8);
        assert!(!is_retirement(other.as_ref()));
        assert!(is_retirement(&Retired));
    }
}
