//! Core types and synchronization primitives for the Hearth kernel.
//!
//! This crate holds the pieces every other kernel crate leans on:
//! type-safe identifiers, per-CPU storage, interrupt nesting, spin locks
//! with lock-order checking, and the leveled kernel log.
//!
//! The machine is hosted. A "CPU" is a slot in a global pool that host
//! threads bind to (see [`cpu_local`]), so everything here runs under a
//! plain `cargo test` without a kernel target.

#![warn(missing_docs)]

pub mod cpu_local;
pub mod id;
pub mod intr;
pub mod log;
pub mod safety;
pub mod static_assert;
pub mod sync;
