//! Canonical record identifiers shared across the workspace.

/// Scheduler related record identifiers.
pub mod sched {
    /// A different thread was switched in. Payload: `from`, `to` (u32 each).
    pub const NEXT: u8 = 1;
    /// The idle thread was switched in.
    pub const IDLE: u8 = 2;
    /// Timer tick processed. Payload: tick count (u64).
    pub const TICK: u8 = 3;
    /// Running thread preempted by a higher priority wake-up.
    pub const PREEMPT: u8 = 4;
}

/// Thread lifecycle record identifiers. Payload starts with the thread id.
pub mod thread {
    pub const CREATE: u8 = 16;
    pub const ACTIVATE: u8 = 17;
    pub const TERMINATE: u8 = 18;
    pub const DELETE: u8 = 19;
    pub const SLEEP: u8 = 20;
    pub const WAKE: u8 = 21;
    /// I/O result delivered. Payload: thread id, result (i32).
    pub const IO_DONE: u8 = 22;
}

/// Mutex record identifiers. Payload starts with the mutex id.
pub mod mutex {
    pub const CREATE: u8 = 32;
    pub const DELETE: u8 = 33;
    pub const ACQUIRE: u8 = 34;
    pub const BLOCK: u8 = 35;
    pub const RELEASE: u8 = 36;
    /// Ownership handed to a waiter. Payload: mutex id, new owner id.
    pub const HANDOFF: u8 = 37;
    pub const TIMEOUT: u8 = 38;
}

/// Memory pool record identifiers. Payload starts with the pool id.
pub mod mem {
    pub const POOL_CREATE: u8 = 48;
    pub const POOL_DELETE: u8 = 49;
    /// Payload: pool id, address (u64), size (u64).
    pub const ALLOC: u8 = 50;
    /// Payload: pool id, address (u64).
    pub const FREE: u8 = 51;
    /// A thread blocked on an exhausted pool. Payload: pool id, thread id.
    pub const WAIT: u8 = 52;
}

/// Returns the symbolic name of a record identifier.
pub fn name(record_type: u8) -> &'static str {
    match record_type {
        sched::NEXT => "SCHED_NEXT",
        sched::IDLE => "SCHED_IDLE",
        sched::TICK => "SCHED_TICK",
        sched::PREEMPT => "SCHED_PREEMPT",
        thread::CREATE => "THREAD_CREATE",
        thread::ACTIVATE => "THREAD_ACTIVATE",
        thread::TERMINATE => "THREAD_TERMINATE",
        thread::DELETE => "THREAD_DELETE",
        thread::SLEEP => "THREAD_SLEEP",
        thread::WAKE => "THREAD_WAKE",
        thread::IO_DONE => "THREAD_IO_DONE",
        mutex::CREATE => "MUTEX_CREATE",
        mutex::DELETE => "MUTEX_DELETE",
        mutex::ACQUIRE => "MUTEX_ACQUIRE",
        mutex::BLOCK => "MUTEX_BLOCK",
        mutex::RELEASE => "MUTEX_RELEASE",
        mutex::HANDOFF => "MUTEX_HANDOFF",
        mutex::TIMEOUT => "MUTEX_TIMEOUT",
        mem::POOL_CREATE => "POOL_CREATE",
        mem::POOL_DELETE => "POOL_DELETE",
        mem::ALLOC => "POOL_ALLOC",
        mem::FREE => "POOL_FREE",
        mem::WAIT => "POOL_WAIT",
        _ => "USER",
    }
}
