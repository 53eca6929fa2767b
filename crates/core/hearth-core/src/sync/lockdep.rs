//! Runtime lock dependency tracking (lockdep).
//!
//! Records "class A was held when class B was acquired" as a directed edge
//! in a dependency graph. Every new edge triggers a DFS looking for a path
//! back; a cycle means two code paths take the same locks in opposite
//! orders, which can deadlock two CPUs even if it has not happened yet.
//! That is fatal.
//!
//! A lock class is a lock *name*: all PCB locks are called `proc` and
//! form one class, so "wait lock before any PCB lock" is a single edge.
//! Nesting two locks of the same class (a policy scanning PCBs while
//! holding the best candidate) adds no edge. Unnamed locks are skipped.
//!
//! Only compiled with `debug_assertions`.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, AtomicU64, AtomicUsize, Ordering};

use crate::cpu_local::{CpuLocal, MAX_CPUS};
use crate::id::CpuId;

/// Maximum distinct lock classes.
const MAX_CLASSES: usize = 128;

/// Maximum nesting depth tracked per CPU.
const MAX_HELD: usize = 32;

/// Packed adjacency bitset words.
const GRAPH_WORDS: usize = MAX_CLASSES * MAX_CLASSES / 64;

/// Identifies a lock class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockClassId(u16);

impl LockClassId {
    /// Sentinel value meaning "not tracked".
    pub const NONE: Self = Self(u16::MAX);

    fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Global state (lock-free)
// ---------------------------------------------------------------------------

/// Registered class name, stored as raw parts so it can live in a static.
struct ClassName {
    ptr: AtomicPtr<u8>,
    len: AtomicUsize,
}

impl ClassName {
    const fn empty() -> Self {
        Self {
            ptr: AtomicPtr::new(core::ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    fn get(&self) -> &'static str {
        let ptr = self.ptr.load(Ordering::Acquire);
        if ptr.is_null() {
            return "<unknown>";
        }
        let len = self.len.load(Ordering::Relaxed);
        // SAFETY: ptr/len were taken from a `&'static str` in `class_of`.
        unsafe { core::str::from_utf8_unchecked(core::slice::from_raw_parts(ptr, len)) }
    }

    fn set(&self, name: &'static str) {
        self.len.store(name.len(), Ordering::Relaxed);
        self.ptr.store(name.as_ptr().cast_mut(), Ordering::Release);
    }
}

static CLASSES: [ClassName; MAX_CLASSES] = [const { ClassName::empty() }; MAX_CLASSES];

static CLASS_COUNT: AtomicU16 = AtomicU16::new(0);

/// Bit `(a * MAX_CLASSES + b)` is set when class `a` was held while class
/// `b` was acquired.
static GRAPH: [AtomicU64; GRAPH_WORDS] = [const { AtomicU64::new(0) }; GRAPH_WORDS];

#[inline]
fn graph_test(from: usize, to: usize) -> bool {
    let bit = from * MAX_CLASSES + to;
    GRAPH[bit / 64].load(Ordering::Relaxed) & (1u64 << (bit % 64)) != 0
}

#[inline]
fn graph_set(from: usize, to: usize) {
    let bit = from * MAX_CLASSES + to;
    GRAPH[bit / 64].fetch_or(1u64 << (bit % 64), Ordering::Relaxed);
}

/// Raw spin protecting registration and graph mutation (NOT a SpinLock,
/// which would track itself).
static GRAPH_LOCK: AtomicBool = AtomicBool::new(false);

fn acquire_graph_lock() {
    while GRAPH_LOCK
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        while GRAPH_LOCK.load(Ordering::Relaxed) {
            core::hint::spin_loop();
        }
    }
}

fn release_graph_lock() {
    GRAPH_LOCK.store(false, Ordering::Release);
}

// ---------------------------------------------------------------------------
// Per-CPU held-lock stack
// ---------------------------------------------------------------------------

struct HeldLocks {
    stack: [LockClassId; MAX_HELD],
    depth: usize,
}

impl HeldLocks {
    const fn new() -> Self {
        Self {
            stack: [LockClassId::NONE; MAX_HELD],
            depth: 0,
        }
    }

    fn push(&mut self, class: LockClassId) {
        // Past MAX_HELD we stop tracking rather than crash in debug code.
        if self.depth < MAX_HELD {
            self.stack[self.depth] = class;
            self.depth += 1;
        }
    }

    fn pop(&mut self, class: LockClassId) {
        // Usually LIFO; a PCB lock handed across a context switch may not be.
        if let Some(i) = (0..self.depth).rev().find(|&i| self.stack[i] == class) {
            self.stack.copy_within(i + 1..self.depth, i);
            self.depth -= 1;
        }
    }

    fn held(&self) -> &[LockClassId] {
        &self.stack[..self.depth]
    }
}

static HELD: CpuLocal<UnsafeCell<HeldLocks>> =
    CpuLocal::new([const { UnsafeCell::new(HeldLocks::new()) }; MAX_CPUS]);

/// Per-CPU reentrancy guard.
static IN_LOCKDEP: CpuLocal<AtomicBool> = CpuLocal::new([const { AtomicBool::new(false) }; MAX_CPUS]);

// ---------------------------------------------------------------------------
// Class registration
// ---------------------------------------------------------------------------

#[allow(clippy::cast_possible_truncation)]
fn find_class(name: &str, count: usize) -> Option<LockClassId> {
    CLASSES[..count]
        .iter()
        .position(|c| c.get() == name)
        .map(|i| LockClassId(i as u16))
}

/// Returns the class for `name`, registering it on first use.
///
/// Unnamed locks and a full class table yield [`LockClassId::NONE`].
pub fn class_of(name: &'static str) -> LockClassId {
    if name == super::spinlock::UNNAMED {
        return LockClassId::NONE;
    }

    let count = CLASS_COUNT.load(Ordering::Acquire) as usize;
    if let Some(id) = find_class(name, count) {
        return id;
    }

    acquire_graph_lock();
    let count = CLASS_COUNT.load(Ordering::Acquire) as usize;
    let id = if let Some(id) = find_class(name, count) {
        id
    } else if count >= MAX_CLASSES {
        LockClassId::NONE
    } else {
        CLASSES[count].set(name);
        #[allow(clippy::cast_possible_truncation)]
        let count16 = count as u16;
        CLASS_COUNT.store(count16 + 1, Ordering::Release);
        LockClassId(count16)
    };
    release_graph_lock();
    id
}

// ---------------------------------------------------------------------------
// Lock acquire / release hooks
// ---------------------------------------------------------------------------

/// Called after a lock named `name` was acquired on the current CPU.
///
/// # Panics
///
/// Panics if the acquisition closes a cycle in the dependency graph.
pub fn lock_acquired(name: &'static str) {
    let class = class_of(name);
    if class == LockClassId::NONE {
        return;
    }

    let in_lockdep = IN_LOCKDEP.get();
    if in_lockdep
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    // SAFETY: inside the reentrancy guard, and only the thread running on
    // this CPU touches its held-lock stack.
    let held = unsafe { &mut *HELD.get().get() };

    let mut violation = None;
    for &h in held.held() {
        if h == LockClassId::NONE || h == class || graph_test(h.index(), class.index()) {
            continue;
        }
        acquire_graph_lock();
        if !graph_test(h.index(), class.index()) {
            graph_set(h.index(), class.index());
            if has_path(class, h) {
                violation = Some(h);
            }
        }
        release_graph_lock();
        if violation.is_some() {
            break;
        }
    }

    held.push(class);
    let depth = held.depth;
    in_lockdep.store(false, Ordering::Release);

    if let Some(h) = violation {
        panic!(
            "lockdep: potential deadlock detected!\n\
             Held: \"{}\" | Acquiring: \"{}\"\n\
             Held-lock stack depth: {}",
            class_name(h),
            class_name(class),
            depth,
        );
    }
}

/// Called before a lock named `name` is released on the current CPU.
pub fn lock_released(name: &'static str) {
    let class = class_of(name);
    if class == LockClassId::NONE {
        return;
    }

    let in_lockdep = IN_LOCKDEP.get();
    if in_lockdep
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        return;
    }
    // SAFETY: same reasoning as in `lock_acquired`.
    let held = unsafe { &mut *HELD.get().get() };
    held.pop(class);
    in_lockdep.store(false, Ordering::Release);
}

/// Clears the held-lock stack of a CPU slot that is being handed out anew.
pub(crate) fn reset_cpu(cpu: CpuId) {
    // SAFETY: the slot was just claimed; no thread runs on it yet.
    unsafe { (*HELD.get_for(cpu).get()).depth = 0 };
    IN_LOCKDEP.get_for(cpu).store(false, Ordering::Relaxed);
}

/// Returns the number of lock classes the current CPU holds.
pub fn held_depth() -> usize {
    // SAFETY: read of this CPU's own stack.
    unsafe { (*HELD.get().get()).depth }
}

// ---------------------------------------------------------------------------
// Cycle detection (DFS)
// ---------------------------------------------------------------------------

/// Returns `true` if there is a path from `src` to `dst` in the graph.
#[allow(clippy::cast_possible_truncation)]
fn has_path(src: LockClassId, dst: LockClassId) -> bool {
    let count = CLASS_COUNT.load(Ordering::Acquire) as usize;
    let mut visited = [0u64; MAX_CLASSES / 64];
    let mut stack = [0u16; MAX_CLASSES];
    let mut sp = 1;
    stack[0] = src.0;

    while sp > 0 {
        sp -= 1;
        let node = stack[sp] as usize;
        if node == dst.index() {
            return true;
        }
        let (word, bit) = (node / 64, 1u64 << (node % 64));
        if visited[word] & bit != 0 {
            continue;
        }
        visited[word] |= bit;

        for next in 0..count {
            let seen = visited[next / 64] & (1u64 << (next % 64)) != 0;
            if !seen && graph_test(node, next) && sp < MAX_CLASSES {
                stack[sp] = next as u16;
                sp += 1;
            }
        }
    }
    false
}

fn class_name(id: LockClassId) -> &'static str {
    if id.index() < CLASS_COUNT.load(Ordering::Acquire) as usize {
        CLASSES[id.index()].get()
    } else {
        "<unknown>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SpinLock;

    // The graph is global and shared by every test thread, so each test
    // uses class names nobody else uses.

    #[test]
    fn same_name_same_class() {
        let a = class_of("ld.same");
        let b = class_of("ld.same");
        assert_eq!(a, b);
        assert_ne!(a, class_of("ld.other"));
        assert_eq!(class_of(crate::sync::spinlock::UNNAMED), LockClassId::NONE);
    }

    #[test]
    fn consistent_ordering_is_accepted() {
        let outer = SpinLock::named("ld.consistent.outer", ());
        let inner = SpinLock::named("ld.consistent.inner", ());
        for _ in 0..3 {
            let _o = outer.lock();
            let _i = inner.lock();
        }
    }

    #[test]
    fn same_class_nesting_adds_no_edge() {
        let a = SpinLock::named("ld.proc-like", 1);
        let b = SpinLock::named("ld.proc-like", 2);
        {
            let _a = a.lock();
            let _b = b.lock();
        }
        let _b = b.lock();
        let _a = a.lock();
    }

    #[test]
    fn held_stack_tracks_nesting() {
        let a = SpinLock::named("ld.depth.a", ());
        let b = SpinLock::named("ld.depth.b", ());
        let base = held_depth();
        let ga = a.lock();
        let gb = b.lock();
        assert_eq!(held_depth(), base + 2);
        drop(ga);
        assert_eq!(held_depth(), base + 1);
        drop(gb);
        assert_eq!(held_depth(), base);
    }

    #[test]
    #[should_panic(expected = "lockdep: potential deadlock detected")]
    fn inverted_ordering_is_fatal() {
        let table = SpinLock::named("ld.inverted.table", ());
        let entry = SpinLock::named("ld.inverted.entry", ());
        {
            let _t = table.lock();
            let _e = entry.lock();
        }
        let _e = entry.lock();
        let _t = table.lock();
    }

    #[test]
    #[should_panic(expected = "lockdep: potential deadlock detected")]
    fn transitive_cycle_is_fatal() {
        let a = SpinLock::named("ld.cycle.a", ());
        let b = SpinLock::named("ld.cycle.b", ());
        let c = SpinLock::named("ld.cycle.c", ());
        {
            let _a = a.lock();
            let _b = b.lock();
        }
        {
            let _b = b.lock();
            let _c = c.lock();
        }
        let _c = c.lock();
        let _a = a.lock();
    }
}
