//! Priority ready queues, reason-indexed wait queues, and the mutex table.
//!
//! ## Scheduling Policy
//!
//! 1. Ready queues are FIFO per priority; [`Scheduler::pick_next`] pops the
//!    front of the highest non-empty queue.
//! 2. The idle thread sits alone at [`Priority::Idle`] and is always ready
//!    when not running, so a pick never finds every queue empty.
//! 3. Each tick re-queues the running thread at the back of its level, which
//!    yields round-robin among equals.
//!
//! The scheduler is plain data. It never switches contexts itself: callers
//! (the runtime) act on the [`Switch`] it returns.

use std::collections::{BTreeMap, VecDeque};

use log::trace;

use crate::error::{VmError, VmResult};
use crate::mutex::{Mutex, MutexId};
use crate::thread::{
    Priority, StackSegment, Tcb, ThreadId, ThreadState, Timeout, WaitReason,
};

/// Scheduling decision produced by [`Scheduler::pick_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub from: Option<ThreadId>,
    pub to: ThreadId,
}

impl Switch {
    /// True when the chosen thread is not the one already running.
    pub fn is_switch(&self) -> bool {
        self.from != Some(self.to)
    }
}

/// Threads readied by a tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    /// Sleepers whose countdown expired, and mutex waiters that already own
    /// their mutex.
    pub woken: Vec<ThreadId>,
    /// Mutex waiters whose countdown expired without ownership.
    pub timed_out: Vec<(ThreadId, MutexId)>,
}

/// What a termination changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    /// State the thread was in before it became dead.
    pub previous: ThreadState,
    /// Mutexes handed from the terminated thread to a waiter.
    pub handoffs: Vec<(MutexId, ThreadId)>,
    /// A handoff target outranks the running thread.
    pub preempt: bool,
}

/// Thread and mutex registries plus the ready and wait queues.
pub struct Scheduler<C> {
    threads: BTreeMap<ThreadId, Tcb<C>>,
    mutexes: BTreeMap<MutexId, Mutex>,
    ready: [VecDeque<ThreadId>; Priority::LEVELS],
    waiting: [Vec<ThreadId>; WaitReason::COUNT],
    current: Option<ThreadId>,
    next_thread: u32,
    next_mutex: u32,
    ticks: u64,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self {
            threads: BTreeMap::new(),
            mutexes: BTreeMap::new(),
            ready: Default::default(),
            waiting: Default::default(),
            current: None,
            next_thread: 1,
            next_mutex: 1,
            ticks: 0,
        }
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self::default()
    }

    // Thread registry

    /// Registers a dead thread and returns its id.
    pub fn add_thread(
        &mut self,
        prefix: &str,
        priority: Priority,
        stack: Option<StackSegment>,
    ) -> ThreadId {
        let id = ThreadId(self.next_thread);
        self.next_thread += 1;
        let name = format!("{prefix}-{}", id.0);
        self.threads.insert(id, Tcb::new(id, name, priority, stack));
        id
    }

    /// Drops a dead thread from the registry.
    pub fn remove_thread(&mut self, id: ThreadId) -> VmResult<Tcb<C>> {
        if !self.thread(id)?.is_dead() {
            return Err(VmError::InvalidState);
        }
        self.threads.remove(&id).ok_or(VmError::InvalidId)
    }

    pub fn thread(&self, id: ThreadId) -> VmResult<&Tcb<C>> {
        self.threads.get(&id).ok_or(VmError::InvalidId)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> VmResult<&mut Tcb<C>> {
        self.threads.get_mut(&id).ok_or(VmError::InvalidId)
    }

    pub fn threads(&self) -> impl Iterator<Item = &Tcb<C>> {
        self.threads.values()
    }

    fn tcb(&self, id: ThreadId) -> &Tcb<C> {
        self.threads.get(&id).expect("scheduler registry invariant broken")
    }

    fn tcb_mut(&mut self, id: ThreadId) -> &mut Tcb<C> {
        self.threads
            .get_mut(&id)
            .expect("scheduler registry invariant broken")
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    /// Priority of the running thread (`Idle` before bootstrap).
    pub fn current_priority(&self) -> Priority {
        self.current
            .map(|id| self.tcb(id).priority())
            .unwrap_or(Priority::Idle)
    }

    /// Makes `id` the running thread without a switch (bootstrap only).
    pub fn adopt(&mut self, id: ThreadId) -> VmResult<()> {
        self.thread_mut(id)?.set_state(ThreadState::Running);
        self.current = Some(id);
        Ok(())
    }

    pub fn set_context(&mut self, id: ThreadId, context: C) -> VmResult<()> {
        self.thread_mut(id)?.context = Some(context);
        Ok(())
    }

    pub fn take_context(&mut self, id: ThreadId) -> Option<C> {
        self.threads.get_mut(&id).and_then(|tcb| tcb.context.take())
    }

    pub fn context(&self, id: ThreadId) -> Option<&C> {
        self.threads.get(&id).and_then(|tcb| tcb.context.as_ref())
    }

    // Ready queues

    /// Appends `id` to the ready queue of its priority.
    pub fn make_ready(&mut self, id: ThreadId) {
        let tcb = self.tcb_mut(id);
        tcb.set_state(ThreadState::Ready);
        let level = tcb.priority().index();
        self.ready[level].push_back(id);
    }

    fn unlink_ready(&mut self, id: ThreadId) -> bool {
        for queue in self.ready.iter_mut() {
            if let Some(pos) = queue.iter().position(|t| *t == id) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    /// Puts the running thread back at the tail of its ready queue.
    pub fn requeue_current(&mut self) {
        if let Some(id) = self.current {
            if self.tcb(id).state() == ThreadState::Running {
                self.make_ready(id);
            }
        }
    }

    /// Checks whether `id` has a higher priority than the running thread.
    pub fn outranks_current(&self, id: ThreadId) -> bool {
        self.tcb(id).priority() > self.current_priority()
    }

    /// Pops the next thread to run and marks it running.
    ///
    /// # Panics
    ///
    /// If every ready queue is empty, which means the idle thread is missing.
    pub fn pick_next(&mut self) -> Switch {
        let to = Priority::DESCENDING
            .iter()
            .find_map(|p| self.ready[p.index()].pop_front())
            .expect("ready queues empty: idle thread invariant broken");
        self.tcb_mut(to).set_state(ThreadState::Running);
        let from = self.current.replace(to);
        trace!("schedule {:?} -> {}", from, to);
        Switch { from, to }
    }

    pub fn ready_len(&self, priority: Priority) -> usize {
        self.ready[priority.index()].len()
    }

    // Wait queues

    /// Moves `id` onto the wait queue for `reason`.
    pub fn block(&mut self, id: ThreadId, reason: WaitReason, timeout: Timeout) {
        let tcb = self.tcb_mut(id);
        tcb.arm(reason, timeout);
        tcb.set_state(ThreadState::Waiting);
        self.waiting[reason.index()].push(id);
    }

    /// Removes `id` from its wait queue and clears its wait fields.
    pub fn stop_waiting(&mut self, id: ThreadId) {
        let tcb = self.tcb_mut(id);
        let reason = tcb.waiting_for;
        tcb.disarm();
        if let Some(reason) = reason {
            self.waiting[reason.index()].retain(|t| *t != id);
        }
    }

    /// Removes `id` from its wait queue and readies it.
    pub fn wake(&mut self, id: ThreadId) {
        self.stop_waiting(id);
        self.make_ready(id);
    }

    pub fn waiting_len(&self, reason: WaitReason) -> usize {
        self.waiting[reason.index()].len()
    }

    // Time

    pub fn tick_count(&self) -> u64 {
        self.ticks
    }

    /// Advances time by one tick.
    ///
    /// Sleepers count down and are readied at zero. Mutex waiters count down
    /// and are readied once they own their mutex or time out; a timed-out
    /// waiter also leaves the mutex's waiter list so a later release cannot
    /// hand it ownership. The running thread is *not* re-queued here.
    pub fn tick(&mut self) -> TickReport {
        self.ticks += 1;
        let mut report = TickReport {
            tick: self.ticks,
            ..TickReport::default()
        };

        let sleepers = std::mem::take(&mut self.waiting[WaitReason::Sleep.index()]);
        for id in sleepers {
            if self.tcb_mut(id).count_down() {
                self.tcb_mut(id).disarm();
                self.make_ready(id);
                report.woken.push(id);
            } else {
                self.waiting[WaitReason::Sleep.index()].push(id);
            }
        }

        let mutex_waiters = std::mem::take(&mut self.waiting[WaitReason::Mutex.index()]);
        for id in mutex_waiters {
            let expired = self.tcb_mut(id).count_down();
            if self.tcb(id).owns_wanted() {
                self.tcb_mut(id).disarm();
                self.make_ready(id);
                report.woken.push(id);
            } else if expired {
                let tcb = self.tcb_mut(id);
                let wanted = tcb.wanted.take();
                tcb.disarm();
                if let Some(mutex) = wanted {
                    if let Some(m) = self.mutexes.get_mut(&mutex) {
                        m.stop_waiting(id);
                    }
                    report.timed_out.push((id, mutex));
                }
                self.make_ready(id);
            } else {
                self.waiting[WaitReason::Mutex.index()].push(id);
            }
        }

        report
    }

    // Mutexes

    pub fn create_mutex(&mut self) -> MutexId {
        let id = MutexId(self.next_mutex);
        self.next_mutex += 1;
        self.mutexes.insert(id, Mutex::new(id));
        id
    }

    pub fn delete_mutex(&mut self, id: MutexId) -> VmResult<()> {
        if self.mutex(id)?.is_locked() {
            return Err(VmError::InvalidState);
        }
        self.mutexes.remove(&id);
        Ok(())
    }

    pub fn mutex(&self, id: MutexId) -> VmResult<&Mutex> {
        self.mutexes.get(&id).ok_or(VmError::InvalidId)
    }

    fn mutex_mut(&mut self, id: MutexId) -> VmResult<&mut Mutex> {
        self.mutexes.get_mut(&id).ok_or(VmError::InvalidId)
    }

    /// Takes `id` for `thread` if it is free.
    ///
    /// Returns `Ok(false)` when another thread owns it and `InvalidState`
    /// when `thread` already does.
    pub fn try_lock(&mut self, id: MutexId, thread: ThreadId) -> VmResult<bool> {
        let mutex = self.mutex_mut(id)?;
        match mutex.owner() {
            Some(owner) if owner == thread => Err(VmError::InvalidState),
            Some(_) => Ok(false),
            None => {
                mutex.set_owner(Some(thread));
                self.tcb_mut(thread).held.insert(id);
                Ok(true)
            }
        }
    }

    /// Queues `thread` on the waiter list of `id` and blocks it.
    pub fn wait_for_mutex(&mut self, id: MutexId, thread: ThreadId, timeout: Timeout) -> VmResult<()> {
        let priority = self.thread(thread)?.priority();
        self.mutex_mut(id)?.add_waiter(thread, priority);
        self.tcb_mut(thread).wanted = Some(id);
        self.block(thread, WaitReason::Mutex, timeout);
        Ok(())
    }

    /// Settles a finished mutex wait. Returns true if `thread` now owns `id`.
    pub fn finish_mutex_wait(&mut self, id: MutexId, thread: ThreadId) -> bool {
        self.tcb_mut(thread).wanted = None;
        match self.mutexes.get_mut(&id) {
            Some(mutex) => {
                mutex.stop_waiting(thread);
                mutex.owner() == Some(thread)
            }
            None => false,
        }
    }

    /// Releases `id` held by `thread` and hands it to the next waiter.
    ///
    /// Returns the new owner, which is already on its ready queue.
    pub fn release(&mut self, id: MutexId, thread: ThreadId) -> VmResult<Option<ThreadId>> {
        let mutex = self.mutex(id)?;
        if mutex.owner() != Some(thread) {
            return Err(VmError::InvalidState);
        }
        Ok(self.hand_over(id, thread))
    }

    fn hand_over(&mut self, id: MutexId, from: ThreadId) -> Option<ThreadId> {
        self.tcb_mut(from).held.remove(&id);
        let mutex = self
            .mutexes
            .get_mut(&id)
            .expect("mutex registry invariant broken");
        mutex.set_owner(None);
        let next = mutex.next_owner()?;
        mutex.set_owner(Some(next));

        let tcb = self.tcb_mut(next);
        tcb.held.insert(id);
        tcb.wanted = None;
        self.wake(next);
        trace!("{id} handed from {from} to {next}");
        Some(next)
    }

    // Termination

    /// Marks `id` dead, hands its mutexes over, and unlinks it from every
    /// scheduler queue. The memory wait queue lives in the pool registry and
    /// is the caller's to clean.
    pub fn terminate(&mut self, id: ThreadId) -> VmResult<Termination> {
        let previous = self.thread(id)?.state();
        if previous == ThreadState::Dead {
            return Err(VmError::InvalidState);
        }

        match previous {
            ThreadState::Ready => {
                self.unlink_ready(id);
            }
            ThreadState::Waiting => {
                if let Some(mutex) = self.tcb_mut(id).wanted.take() {
                    if let Some(m) = self.mutexes.get_mut(&mutex) {
                        m.stop_waiting(id);
                    }
                }
                self.stop_waiting(id);
            }
            ThreadState::Running | ThreadState::Dead => {}
        }
        self.tcb_mut(id).set_state(ThreadState::Dead);

        let held: Vec<MutexId> = self.tcb(id).held.iter().copied().collect();
        let mut handoffs = Vec::new();
        for mutex in held {
            if let Some(next) = self.hand_over(mutex, id) {
                handoffs.push((mutex, next));
            }
        }
        let preempt = previous != ThreadState::Running
            && handoffs.iter().any(|(_, next)| self.outranks_current(*next));

        Ok(Termination {
            previous,
            handoffs,
            preempt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot() -> (Scheduler<()>, ThreadId, ThreadId) {
        let mut sched = Scheduler::new();
        let main = sched.add_thread("vm-thread", Priority::Normal, None);
        let idle = sched.add_thread("vm-thread", Priority::Idle, None);
        sched.adopt(main).unwrap();
        sched.make_ready(idle);
        (sched, main, idle)
    }

    fn spawn(sched: &mut Scheduler<()>, priority: Priority) -> ThreadId {
        let id = sched.add_thread("vm-thread", priority, None);
        sched.make_ready(id);
        id
    }

    #[test]
    fn ids_and_names() {
        let (mut sched, main, idle) = boot();
        assert_eq!((main, idle), (ThreadId(1), ThreadId(2)));
        let t = sched.add_thread("vm-thread", Priority::Low, None);
        assert_eq!(sched.thread(t).unwrap().name(), "vm-thread-3");
        assert_eq!(sched.thread(t).unwrap().state(), ThreadState::Dead);
    }

    #[test]
    fn highest_priority_first() {
        let (mut sched, main, _) = boot();
        let low = spawn(&mut sched, Priority::Low);
        let high = spawn(&mut sched, Priority::High);

        sched.requeue_current();
        assert_eq!(sched.pick_next(), Switch { from: Some(main), to: high });
        sched.terminate(high).unwrap();
        assert_eq!(sched.pick_next().to, main);
        sched.terminate(main).unwrap();
        assert_eq!(sched.pick_next().to, low);
    }

    #[test]
    fn equal_priorities_rotate_on_tick() {
        let (mut sched, main, _) = boot();
        let a = spawn(&mut sched, Priority::Normal);
        let b = spawn(&mut sched, Priority::Normal);

        let mut order = Vec::new();
        for _ in 0..6 {
            sched.tick();
            sched.requeue_current();
            order.push(sched.pick_next().to);
        }
        assert_eq!(order, vec![a, b, main, a, b, main]);
    }

    #[test]
    fn same_thread_pick_is_not_a_switch() {
        let (mut sched, _, _) = boot();
        sched.requeue_current();
        assert!(!sched.pick_next().is_switch());
    }

    #[test]
    fn sleeper_wakes_after_countdown() {
        let (mut sched, _, _) = boot();
        let t = spawn(&mut sched, Priority::Low);
        assert_eq!(sched.pick_next().to, t);
        sched.block(t, WaitReason::Sleep, Timeout::Ticks(2));

        assert!(sched.tick().woken.is_empty());
        assert_eq!(sched.tick().woken, vec![t]);
        assert_eq!(sched.thread(t).unwrap().state(), ThreadState::Ready);
        assert_eq!(sched.thread(t).unwrap().waiting_for(), None);
        assert_eq!(sched.waiting_len(WaitReason::Sleep), 0);
        assert_eq!(sched.tick_count(), 2);
    }

    #[test]
    fn trylock_and_self_acquire() {
        let (mut sched, main, _) = boot();
        let other = spawn(&mut sched, Priority::Low);
        let m = sched.create_mutex();

        assert_eq!(sched.try_lock(m, main), Ok(true));
        assert_eq!(sched.try_lock(m, other), Ok(false));
        assert_eq!(sched.try_lock(m, main), Err(VmError::InvalidState));
        assert_eq!(sched.try_lock(MutexId(99), main), Err(VmError::InvalidId));
    }

    #[test]
    fn release_hands_to_highest_waiter() {
        let (mut sched, main, _) = boot();
        let low = sched.add_thread("vm-thread", Priority::Low, None);
        let high = sched.add_thread("vm-thread", Priority::High, None);
        let m = sched.create_mutex();
        sched.try_lock(m, main).unwrap();

        sched.wait_for_mutex(m, low, Timeout::Infinite).unwrap();
        sched.wait_for_mutex(m, high, Timeout::Infinite).unwrap();

        assert_eq!(sched.release(m, main), Ok(Some(high)));
        assert_eq!(sched.mutex(m).unwrap().owner(), Some(high));
        assert!(sched.thread(high).unwrap().held().any(|id| id == m));
        assert!(sched.outranks_current(high));
        assert_eq!(sched.thread(high).unwrap().state(), ThreadState::Ready);
        assert!(sched.finish_mutex_wait(m, high));
        assert_eq!(sched.thread(main).unwrap().held().count(), 0);
    }

    #[test]
    fn release_by_non_owner_is_rejected() {
        let (mut sched, main, _) = boot();
        let m = sched.create_mutex();
        assert_eq!(sched.release(m, main), Err(VmError::InvalidState));
        assert_eq!(sched.release(MutexId(42), main), Err(VmError::InvalidId));
    }

    #[test]
    fn mutex_timeout_unlinks_waiter() {
        let (mut sched, main, _) = boot();
        let t = sched.add_thread("vm-thread", Priority::High, None);
        let m = sched.create_mutex();
        sched.try_lock(m, main).unwrap();
        sched.wait_for_mutex(m, t, Timeout::Ticks(1)).unwrap();

        let report = sched.tick();
        assert_eq!(report.timed_out, vec![(t, m)]);
        assert_eq!(sched.mutex(m).unwrap().waiter_count(), 0);

        // A release after the timeout leaves the mutex unlocked.
        assert_eq!(sched.release(m, main), Ok(None));
        assert!(!sched.mutex(m).unwrap().is_locked());
        assert!(!sched.finish_mutex_wait(m, t));
    }

    #[test]
    fn delete_locked_mutex_is_refused() {
        let (mut sched, main, _) = boot();
        let m = sched.create_mutex();
        sched.try_lock(m, main).unwrap();
        assert_eq!(sched.delete_mutex(m), Err(VmError::InvalidState));
        sched.release(m, main).unwrap();
        sched.delete_mutex(m).unwrap();
        assert_eq!(sched.mutex(m).unwrap_err(), VmError::InvalidId);
    }

    #[test]
    fn terminate_waiting_thread_unlinks_everywhere() {
        let (mut sched, main, _) = boot();
        let t = sched.add_thread("vm-thread", Priority::Low, None);
        let m = sched.create_mutex();
        sched.try_lock(m, main).unwrap();
        sched.wait_for_mutex(m, t, Timeout::Infinite).unwrap();

        let report = sched.terminate(t).unwrap();
        assert_eq!(report.previous, ThreadState::Waiting);
        assert_eq!(sched.mutex(m).unwrap().waiter_count(), 0);
        assert_eq!(sched.waiting_len(WaitReason::Mutex), 0);
        assert_eq!(sched.terminate(t), Err(VmError::InvalidState));
    }

    #[test]
    fn terminate_holder_preempts_for_higher_waiter() {
        let (mut sched, main, _) = boot();
        let holder = spawn(&mut sched, Priority::Low);
        let waiter = sched.add_thread("vm-thread", Priority::High, None);
        let m = sched.create_mutex();
        sched.try_lock(m, holder).unwrap();
        sched.wait_for_mutex(m, waiter, Timeout::Infinite).unwrap();

        let report = sched.terminate(holder).unwrap();
        assert_eq!(report.handoffs, vec![(m, waiter)]);
        assert!(report.preempt);
        assert_eq!(sched.mutex(m).unwrap().owner(), Some(waiter));
        assert_eq!(sched.ready_len(Priority::Low), 0);

        sched.requeue_current();
        assert_eq!(sched.pick_next().to, waiter);
        let _ = main;
    }

    #[test]
    fn remove_requires_dead() {
        let (mut sched, main, _) = boot();
        assert_eq!(sched.remove_thread(main).unwrap_err(), VmError::InvalidState);
        let t = sched.add_thread("vm-thread", Priority::Low, None);
        assert!(sched.remove_thread(t).is_ok());
        assert_eq!(sched.thread(t).unwrap_err(), VmError::InvalidId);
    }
}
