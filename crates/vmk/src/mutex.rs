//! Mutex bookkeeping: owner plus per-priority waiter lists.

use std::collections::VecDeque;
use std::fmt;

use crate::thread::{Priority, ThreadId};

/// Mutex identifier, assigned from 1 upwards and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutexId(pub u32);

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutex#{}", self.0)
    }
}

/// A non-recursive mutex. Locked iff it has an owner.
#[derive(Debug, Clone)]
pub struct Mutex {
    id: MutexId,
    owner: Option<ThreadId>,
    waiters: [VecDeque<ThreadId>; Priority::LEVELS],
}

impl Mutex {
    pub(crate) fn new(id: MutexId) -> Self {
        Self {
            id,
            owner: None,
            waiters: Default::default(),
        }
    }

    pub fn id(&self) -> MutexId {
        self.id
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn set_owner(&mut self, owner: Option<ThreadId>) {
        self.owner = owner;
    }

    pub(crate) fn add_waiter(&mut self, thread: ThreadId, priority: Priority) {
        self.waiters[priority.index()].push_back(thread);
    }

    /// Pops the first waiter of the highest non-empty priority list.
    pub(crate) fn next_owner(&mut self) -> Option<ThreadId> {
        self.waiters
            .iter_mut()
            .rev()
            .find_map(|level| level.pop_front())
    }

    /// Removes `thread` from the waiter lists. Returns false if absent.
    pub(crate) fn stop_waiting(&mut self, thread: ThreadId) -> bool {
        for level in self.waiters.iter_mut() {
            if let Some(pos) = level.iter().position(|t| *t == thread) {
                level.remove(pos);
                return true;
            }
        }
        false
    }
}
