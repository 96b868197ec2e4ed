//! Thread control blocks.
//!
//! A [`Tcb`] is pure bookkeeping: identity, priority, lifecycle state, what the
//! thread waits for, the mutexes it holds, and its stack segment. The
//! execution context is opaque (`C`) and only materialized at activation.

use std::collections::BTreeSet;
use std::fmt;

use crate::mutex::MutexId;

/// Thread identifier, assigned from 1 upwards and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Scheduling priority. `Idle` is reserved for the idle thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    Normal = 2,
    High = 3,
}

impl Priority {
    /// Number of priority levels.
    pub const LEVELS: usize = 4;

    /// All levels, highest first.
    pub const DESCENDING: [Priority; Self::LEVELS] =
        [Priority::High, Priority::Normal, Priority::Low, Priority::Idle];

    /// Index into per-priority queues.
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created or terminated; may be activated or deleted.
    Dead,
    /// On a ready queue.
    Ready,
    /// Holding the processor.
    Running,
    /// On a wait queue.
    Waiting,
}

/// Why a thread is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Io,
    Mutex,
    Sleep,
    Memory,
}

impl WaitReason {
    pub const COUNT: usize = 4;

    pub const fn index(self) -> usize {
        match self {
            Self::Io => 0,
            Self::Mutex => 1,
            Self::Sleep => 2,
            Self::Memory => 3,
        }
    }
}

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Never block.
    Immediate,
    /// Block until woken by an event.
    Infinite,
    /// Block for at most this many ticks.
    Ticks(u64),
}

impl Timeout {
    /// Folds `Ticks(0)` into `Immediate`.
    pub const fn normalized(self) -> Self {
        match self {
            Self::Ticks(0) => Self::Immediate,
            other => other,
        }
    }
}

impl From<u64> for Timeout {
    fn from(ticks: u64) -> Self {
        Timeout::Ticks(ticks).normalized()
    }
}

/// Stack segment carved from the system pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSegment {
    pub addr: usize,
    pub size: usize,
}

/// Thread control block.
pub struct Tcb<C> {
    id: ThreadId,
    name: String,
    priority: Priority,
    state: ThreadState,
    pub(crate) waiting_for: Option<WaitReason>,
    pub(crate) ticks_left: u64,
    pub(crate) infinite: bool,
    pub(crate) result: i32,
    pub(crate) held: BTreeSet<MutexId>,
    pub(crate) wanted: Option<MutexId>,
    pub(crate) context: Option<C>,
    stack: Option<StackSegment>,
}

impl<C> Tcb<C> {
    pub(crate) fn new(
        id: ThreadId,
        name: String,
        priority: Priority,
        stack: Option<StackSegment>,
    ) -> Self {
        Self {
            id,
            name,
            priority,
            state: ThreadState::Dead,
            waiting_for: None,
            ticks_left: 0,
            infinite: false,
            result: 0,
            held: BTreeSet::new(),
            wanted: None,
            context: None,
            stack,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn waiting_for(&self) -> Option<WaitReason> {
        self.waiting_for
    }

    /// Last asynchronous result delivered to this thread.
    pub fn result(&self) -> i32 {
        self.result
    }

    pub fn stack(&self) -> Option<StackSegment> {
        self.stack
    }

    /// Mutexes currently owned, in id order.
    pub fn held(&self) -> impl Iterator<Item = MutexId> + '_ {
        self.held.iter().copied()
    }

    pub fn wanted(&self) -> Option<MutexId> {
        self.wanted
    }

    pub fn is_dead(&self) -> bool {
        self.state == ThreadState::Dead
    }

    /// Checks whether the thread already owns the mutex it waits for.
    pub fn owns_wanted(&self) -> bool {
        self.wanted.is_some_and(|id| self.held.contains(&id))
    }

    pub(crate) fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    pub(crate) fn take_stack(&mut self) -> Option<StackSegment> {
        self.stack.take()
    }

    /// Arms the wait countdown.
    pub(crate) fn arm(&mut self, reason: WaitReason, timeout: Timeout) {
        self.waiting_for = Some(reason);
        match timeout.normalized() {
            Timeout::Ticks(n) => {
                self.ticks_left = n;
                self.infinite = false;
            }
            Timeout::Infinite | Timeout::Immediate => {
                self.ticks_left = 0;
                self.infinite = true;
            }
        }
    }

    /// Clears every wait field.
    pub(crate) fn disarm(&mut self) {
        self.waiting_for = None;
        self.ticks_left = 0;
        self.infinite = false;
    }

    /// Counts one tick down. Returns true once a timed wait has expired.
    pub(crate) fn count_down(&mut self) -> bool {
        if self.infinite {
            return false;
        }
        self.ticks_left = self.ticks_left.saturating_sub(1);
        self.ticks_left == 0
    }
}

impl<C> fmt::Debug for Tcb<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("waiting_for", &self.waiting_for)
            .field("held", &self.held)
            .finish()
    }
}
