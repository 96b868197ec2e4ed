//! # vmk - cooperative thread runtime
//!
//! A small kernel that multiplexes prioritized logical threads onto one
//! processor. Exactly one logical thread runs at a time; control moves only
//! when the running thread blocks, yields, terminates, or is preempted by a
//! higher priority thread it readied. A periodic tick drives sleep and mutex
//! timeouts and round-robin among threads of equal priority.
//!
//! ## Architecture
//!
//! **Scheduler**: pure bookkeeping over thread control blocks, four ready
//! queues (`Idle` < `Low` < `Normal` < `High`), per-reason wait queues, and
//! mutexes with priority-ordered waiters.
//!
//! **Runtime**: the public operations. Each runs inside the critical section
//! and may block the caller or switch to another thread before returning.
//!
//! **Machine**: the host seam. A port supplies execution contexts that can be
//! created, switched between, and retired; see `vm-posix`.
//!
//! **Interrupts**: host threads raise ticks and I/O completions on an
//! [`InterruptLine`]; they are delivered when the running thread leaves the
//! critical section, or by the idle thread.
//!
//! ## Module Overview
//!
//! - [`config`] - runtime sizing and trace hook
//! - [`critical`] - the non-reentrant critical section
//! - [`error`] - status codes
//! - [`irq`] - the pending interrupt line
//! - [`machine`] - the host context trait
//! - [`mutex`] - mutex records
//! - [`runtime`] - the runtime handle and its operations
//! - [`scheduler`] - ready and wait queues, tick processing, mutex handoff
//! - [`thread`] - thread control blocks and their vocabulary types

#![forbid(unsafe_code)]

pub mod config;
pub mod critical;
pub mod error;
pub mod irq;
pub mod machine;
pub mod mutex;
pub mod runtime;
pub mod scheduler;
pub mod thread;

pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use error::{VmError, VmResult};
pub use irq::{Interrupt, InterruptLine};
pub use machine::{ContextEntry, Machine, Retired};
pub use mutex::MutexId;
pub use runtime::{IoCompletion, Runtime, ThreadEntry};
pub use scheduler::Scheduler;
pub use thread::{Priority, StackSegment, ThreadId, ThreadState, Timeout, WaitReason};
pub use vmm::{PoolId, PoolStats};
