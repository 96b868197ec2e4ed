//! Pending interrupt line.
//!
//! Host threads (the alarm, I/O completion callbacks) never touch kernel
//! state. They raise an [`Interrupt`] on the line; the running logical thread
//! delivers pending interrupts when it leaves a critical section, and the
//! idle thread sleeps on the line until something is raised.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::thread::ThreadId;

/// An asynchronous notification waiting for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// One timer quantum elapsed.
    Tick,
    /// An asynchronous operation issued by `thread` finished.
    IoComplete { thread: ThreadId, result: i32 },
}

#[derive(Default)]
struct Line {
    pending: Mutex<VecDeque<Interrupt>>,
    raised: Condvar,
}

/// Clonable handle to the interrupt line.
#[derive(Clone, Default)]
pub struct InterruptLine {
    inner: Arc<Line>,
}

impl InterruptLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `irq` for delivery and wakes a halted idle thread.
    pub fn raise(&self, irq: Interrupt) {
        self.inner.pending.lock().push_back(irq);
        self.inner.raised.notify_one();
    }

    /// Takes the oldest pending interrupt.
    pub fn take(&self) -> Option<Interrupt> {
        self.inner.pending.lock().pop_front()
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Blocks until an interrupt is pending.
    pub fn halt(&self) {
        let mut pending = self.inner.pending.lock();
        while pending.is_empty() {
            self.inner.raised.wait(&mut pending);
        }
    }
}

impl std::fmt::Debug for InterruptLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptLine")
            .field("pending", &self.pending())
            .finish()
    }
}
