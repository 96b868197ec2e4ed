//! The runtime: thread, mutex, pool, and interrupt operations.
//!
//! Every operation follows the same shape: validate, enter the critical
//! section, mutate scheduler or pool state, optionally block the caller or
//! preempt it in favour of a higher priority thread, leave the section.
//! Leaving the section delivers pending interrupts, so each runtime call is
//! also a point where ticks and I/O completions take effect.

use std::any::Any;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use vmm::{PoolError, PoolId, PoolRegistry, PoolStats};
use vms::records::{mem, mutex as mutex_rec, sched, thread as thread_rec};
use vms::{PayloadBuilder, TraceHook};

use crate::config::RuntimeConfig;
use crate::critical::CriticalSection;
use crate::error::{VmError, VmResult};
use crate::irq::{Interrupt, InterruptLine};
use crate::machine::{ContextEntry, Machine, Retired};
use crate::mutex::MutexId;
use crate::scheduler::Scheduler;
use crate::thread::{Priority, StackSegment, ThreadId, ThreadState, Timeout, WaitReason};

/// Body of a logical thread. Re-run on every activation.
pub type ThreadEntry<M> = Arc<dyn Fn(&Runtime<M>) + Send + Sync + 'static>;

/// Kernel state guarded by the critical section.
struct Core<M: Machine> {
    sched: Scheduler<M::Context>,
    pools: PoolRegistry<ThreadId>,
    entries: BTreeMap<ThreadId, ThreadEntry<M>>,
    main: ThreadId,
    idle: ThreadId,
    system_pool: PoolId,
    shared_pool: PoolId,
    stopped: bool,
}

struct Shared<M: Machine> {
    core: Mutex<Core<M>>,
    machine: M,
    line: InterruptLine,
    config: RuntimeConfig,
    prefix: String,
    trace: Option<TraceHook>,
    // Backing storage whose addresses the system and shared pools hand out.
    _heap: Box<[u8]>,
    _shared: Box<[u8]>,
}

/// Handle to a running runtime. Cheap to clone.
pub struct Runtime<M: Machine> {
    shared: Arc<Shared<M>>,
}

impl<M: Machine> Clone for Runtime<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Token handed to the issuer of an asynchronous operation.
///
/// Completing it raises an I/O interrupt for the waiting thread; it may be
/// moved to and completed from any host thread.
#[derive(Debug)]
pub struct IoCompletion {
    thread: ThreadId,
    line: InterruptLine,
}

impl IoCompletion {
    /// Thread waiting for the result.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Delivers `result` to the waiting thread.
    pub fn complete(self, result: i32) {
        self.line.raise(Interrupt::IoComplete {
            thread: self.thread,
            result,
        });
    }
}

/// Critical section held by a runtime operation.
///
/// Dropping it leaves the section and then delivers pending interrupts.
struct Masked<'a, M: Machine> {
    rt: &'a Runtime<M>,
    cs: Option<CriticalSection<'a, Core<M>>>,
}

impl<'a, M: Machine> Masked<'a, M> {
    /// Runs the scheduler; returns once the caller is running again.
    fn schedule_next(&mut self) {
        let cs = self.cs.take().expect("critical section held");
        self.cs = Some(self.rt.switch_next(cs));
    }

    /// Re-queues the caller and reschedules if `candidate` outranks it.
    fn preempt_for(&mut self, candidate: ThreadId) {
        if self.sched.outranks_current(candidate) {
            self.rt.emit(self, sched::PREEMPT, PayloadBuilder::new().u32(candidate.0));
            self.sched.requeue_current();
            self.schedule_next();
        }
    }

    fn current(&self) -> ThreadId {
        self.sched
            .current()
            .expect("runtime invariant broken: no running thread")
    }
}

impl<M: Machine> Deref for Masked<'_, M> {
    type Target = Core<M>;

    fn deref(&self) -> &Core<M> {
        self.cs.as_ref().expect("critical section held")
    }
}

impl<M: Machine> DerefMut for Masked<'_, M> {
    fn deref_mut(&mut self) -> &mut Core<M> {
        self.cs.as_mut().expect("critical section held")
    }
}

impl<M: Machine> Drop for Masked<'_, M> {
    fn drop(&mut self) {
        if let Some(cs) = self.cs.take() {
            drop(cs);
            if !thread::panicking() {
                self.rt.unmask();
            }
        }
    }
}

impl<M: Machine> Runtime<M> {
    /// Boots the runtime on the calling host thread.
    ///
    /// The caller becomes the main thread (priority `Normal`, running). The
    /// system and shared pools are created and the idle thread is activated.
    pub fn start(config: RuntimeConfig, machine: M) -> VmResult<Self> {
        config.validate().inspect_err(|_| warn!("rejected config {config:?}"))?;

        let heap = vec![0u8; config.heap_size].into_boxed_slice();
        let shared_mem = vec![0u8; config.shared_size].into_boxed_slice();

        let mut pools = PoolRegistry::new(config.alignment)?;
        let system_pool = pools.create(heap.as_ptr() as usize, heap.len())?;
        let shared_pool = pools.create(shared_mem.as_ptr() as usize, shared_mem.len())?;

        let prefix = config.thread_prefix();
        let mut sched = Scheduler::new();
        let main = sched.add_thread(&prefix, Priority::Normal, None);
        let main_context = machine.adopt_current(&format!("{prefix}-{}", main.0)).map_err(|err| {
            error!("cannot adopt the main host thread: {err}");
            VmError::Failure
        })?;
        sched.set_context(main, main_context)?;
        sched.adopt(main)?;

        let idle_stack = StackSegment {
            addr: pools.allocate(system_pool, config.idle_stack_size)?,
            size: config.idle_stack_size,
        };
        let idle = sched.add_thread(&prefix, Priority::Idle, Some(idle_stack));

        let mut entries: BTreeMap<ThreadId, ThreadEntry<M>> = BTreeMap::new();
        entries.insert(idle, Arc::new(|rt: &Runtime<M>| rt.idle_loop()));

        let trace = config.trace_hook.clone();
        let rt = Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    sched,
                    pools,
                    entries,
                    main,
                    idle,
                    system_pool,
                    shared_pool,
                    stopped: false,
                }),
                machine,
                line: InterruptLine::new(),
                config,
                prefix,
                trace,
                _heap: heap,
                _shared: shared_mem,
            }),
        };

        rt.thread_activate(idle)?;
        debug!(
            "runtime started: main {main}, idle {idle}, tick {} ms",
            rt.shared.config.tick_ms
        );
        Ok(rt)
    }

    /// Retires every context except the main thread's.
    ///
    /// Must be called from the main thread; the runtime rejects every later
    /// operation with `InvalidState`.
    pub fn shutdown(&self) -> VmResult<()> {
        let mut m = self.enter()?;
        if m.sched.current() != Some(m.main) {
            warn!("shutdown outside the main thread");
            return Err(VmError::InvalidState);
        }
        m.stopped = true;

        let main = m.main;
        let others: Vec<ThreadId> = m
            .sched
            .threads()
            .map(|tcb| tcb.id())
            .filter(|id| *id != main)
            .collect();
        let contexts: Vec<M::Context> = others
            .into_iter()
            .filter_map(|id| m.sched.take_context(id))
            .collect();
        drop(m);

        debug!("runtime shutting down, retiring {} contexts", contexts.len());
        for context in contexts {
            self.shared.machine.retire(context);
        }
        Ok(())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn machine(&self) -> &M {
        &self.shared.machine
    }

    /// The thread that called [`start`](Self::start).
    pub fn main_thread(&self) -> ThreadId {
        self.lock().main
    }

    pub fn idle_thread(&self) -> ThreadId {
        self.lock().idle
    }

    /// Pool backing thread stacks.
    pub fn system_pool(&self) -> PoolId {
        self.lock().system_pool
    }

    /// Pool backing I/O staging buffers.
    pub fn shared_pool(&self) -> PoolId {
        self.lock().shared_pool
    }

    // Threads

    /// Creates a dead thread whose stack is taken from the system pool,
    /// waiting for memory if the pool is momentarily exhausted.
    pub fn thread_create<F>(&self, entry: F, stack_size: usize, priority: Priority) -> VmResult<ThreadId>
    where
        F: Fn(&Runtime<M>) + Send + Sync + 'static,
    {
        if stack_size == 0 || priority == Priority::Idle {
            warn!("thread_create rejected: stack {stack_size}, priority {priority:?}");
            return Err(VmError::InvalidParameter);
        }
        let mut m = self.enter()?;
        let pool = m.system_pool;
        let addr = self.allocate_blocking(&mut m, pool, stack_size)?;
        let id = m.sched.add_thread(
            &self.shared.prefix,
            priority,
            Some(StackSegment {
                addr,
                size: stack_size,
            }),
        );
        m.entries.insert(id, Arc::new(entry));
        self.emit(
            &m,
            thread_rec::CREATE,
            PayloadBuilder::new().u32(id.0).u8(priority as u8),
        );
        debug!("{id} created, priority {priority:?}, stack {stack_size} at {addr:#x}");
        Ok(id)
    }

    /// Materializes a context for a dead thread and readies it.
    pub fn thread_activate(&self, id: ThreadId) -> VmResult<()> {
        let mut m = self.enter()?;
        let tcb = m.sched.thread(id)?;
        if !tcb.is_dead() {
            return Err(VmError::InvalidState);
        }
        let name = tcb.name().to_owned();
        let stack_size = tcb.stack().map_or(0, |stack| stack.size);
        let entry = m.entries.get(&id).cloned().ok_or(VmError::InvalidState)?;

        if let Some(stale) = m.sched.take_context(id) {
            self.shared.machine.retire(stale);
        }
        let context = self
            .shared
            .machine
            .create_context(&name, stack_size, self.wrap_entry(id, entry))
            .map_err(|err| {
                error!("cannot create context for {id}: {err}");
                VmError::InsufficientResources
            })?;
        m.sched.set_context(id, context)?;
        m.sched.make_ready(id);

        self.emit(&m, thread_rec::ACTIVATE, PayloadBuilder::new().u32(id.0));
        debug!("{id} activated");
        m.preempt_for(id);
        Ok(())
    }

    /// Terminates a thread that is not dead.
    ///
    /// Held mutexes go to their highest priority waiters and the thread
    /// leaves every queue. Terminating the calling thread does not return.
    pub fn thread_terminate(&self, id: ThreadId) -> VmResult<()> {
        let mut m = self.enter()?;
        if id == m.main {
            warn!("{id} is the main thread and cannot be terminated");
            return Err(VmError::InvalidState);
        }
        if id == m.idle {
            warn!("{id} is the idle thread and cannot be terminated");
            return Err(VmError::InvalidState);
        }
        let report = m.sched.terminate(id)?;
        m.pools.cancel_wait(id);
        self.emit(&m, thread_rec::TERMINATE, PayloadBuilder::new().u32(id.0));
        for (mutex, owner) in &report.handoffs {
            self.emit(
                &m,
                mutex_rec::HANDOFF,
                PayloadBuilder::new().u32(mutex.0).u32(owner.0),
            );
        }
        debug!("{id} terminated (was {:?})", report.previous);

        if report.previous == ThreadState::Running {
            m.schedule_next();
        } else if report.preempt {
            m.sched.requeue_current();
            m.schedule_next();
        }
        Ok(())
    }

    /// Reclaims a dead thread's stack and context.
    pub fn thread_delete(&self, id: ThreadId) -> VmResult<()> {
        let mut m = self.enter()?;
        if id == m.main || id == m.idle {
            warn!("{id} is a system thread and cannot be deleted");
            return Err(VmError::InvalidState);
        }
        let mut tcb = m.sched.remove_thread(id)?;
        m.entries.remove(&id);
        if let Some(context) = tcb.context.take() {
            self.shared.machine.retire(context);
        }
        self.emit(&m, thread_rec::DELETE, PayloadBuilder::new().u32(id.0));
        debug!("{id} deleted");

        if let Some(stack) = tcb.take_stack() {
            let pool = m.system_pool;
            self.free(&mut m, pool, stack.addr)?;
        }
        Ok(())
    }

    /// Id of the running thread.
    pub fn current_thread(&self) -> ThreadId {
        self.lock()
            .sched
            .current()
            .expect("runtime invariant broken: no running thread")
    }

    pub fn thread_state(&self, id: ThreadId) -> VmResult<ThreadState> {
        Ok(self.lock().sched.thread(id)?.state())
    }

    pub fn thread_priority(&self, id: ThreadId) -> VmResult<Priority> {
        Ok(self.lock().sched.thread(id)?.priority())
    }

    /// Blocks the caller for `timeout` ticks.
    ///
    /// `Immediate` yields to the other threads of the caller's priority;
    /// `Infinite` is rejected.
    pub fn sleep(&self, timeout: Timeout) -> VmResult<()> {
        let timeout = timeout.normalized();
        if timeout == Timeout::Infinite {
            return Err(VmError::InvalidParameter);
        }
        let mut m = self.enter()?;
        let me = m.current();
        match timeout {
            Timeout::Ticks(ticks) => {
                m.sched.block(me, WaitReason::Sleep, timeout);
                self.emit(&m, thread_rec::SLEEP, PayloadBuilder::new().u32(me.0).u64(ticks));
            }
            _ => m.sched.requeue_current(),
        }
        m.schedule_next();
        Ok(())
    }

    // Mutexes

    pub fn mutex_create(&self) -> VmResult<MutexId> {
        let mut m = self.enter()?;
        let id = m.sched.create_mutex();
        self.emit(&m, mutex_rec::CREATE, PayloadBuilder::new().u32(id.0));
        Ok(id)
    }

    /// Deletes an unlocked mutex.
    pub fn mutex_delete(&self, id: MutexId) -> VmResult<()> {
        let mut m = self.enter()?;
        m.sched.delete_mutex(id)?;
        self.emit(&m, mutex_rec::DELETE, PayloadBuilder::new().u32(id.0));
        Ok(())
    }

    /// Current owner, if locked.
    pub fn mutex_query(&self, id: MutexId) -> VmResult<Option<ThreadId>> {
        Ok(self.lock().sched.mutex(id)?.owner())
    }

    /// Acquires a mutex, waiting at most `timeout`.
    ///
    /// `Immediate` fails at once when the mutex is held, including by the
    /// caller; a wait that ends without ownership fails with `Failure`.
    /// Blocking on a mutex the caller already owns is `InvalidState`.
    pub fn mutex_acquire(&self, id: MutexId, timeout: Timeout) -> VmResult<()> {
        let mut m = self.enter()?;
        let me = m.current();
        let timeout = timeout.normalized();
        match m.sched.try_lock(id, me) {
            Ok(true) => {
                self.emit(&m, mutex_rec::ACQUIRE, PayloadBuilder::new().u32(id.0).u32(me.0));
                return Ok(());
            }
            Ok(false) => {}
            Err(VmError::InvalidState) if timeout == Timeout::Immediate => {
                trace!("{me} already holds {id}");
                return Err(VmError::Failure);
            }
            Err(err) => return Err(err),
        }

        if timeout == Timeout::Immediate {
            trace!("{me} missed {id}");
            return Err(VmError::Failure);
        }

        m.sched.wait_for_mutex(id, me, timeout)?;
        self.emit(&m, mutex_rec::BLOCK, PayloadBuilder::new().u32(id.0).u32(me.0));
        m.schedule_next();

        if m.sched.finish_mutex_wait(id, me) {
            self.emit(&m, mutex_rec::ACQUIRE, PayloadBuilder::new().u32(id.0).u32(me.0));
            Ok(())
        } else {
            self.emit(&m, mutex_rec::TIMEOUT, PayloadBuilder::new().u32(id.0).u32(me.0));
            Err(VmError::Failure)
        }
    }

    /// Releases a mutex held by the caller, handing it to the highest
    /// priority waiter.
    pub fn mutex_release(&self, id: MutexId) -> VmResult<()> {
        let mut m = self.enter()?;
        let me = m.current();
        let next = m.sched.release(id, me)?;
        self.emit(&m, mutex_rec::RELEASE, PayloadBuilder::new().u32(id.0).u32(me.0));
        if let Some(next) = next {
            self.emit(&m, mutex_rec::HANDOFF, PayloadBuilder::new().u32(id.0).u32(next.0));
            m.preempt_for(next);
        }
        Ok(())
    }

    // Memory pools

    /// Registers a pool over `[base, base + size)`. The runtime never
    /// dereferences pool addresses.
    pub fn pool_create(&self, base: usize, size: usize) -> VmResult<PoolId> {
        let mut m = self.enter()?;
        let id = m.pools.create(base, size)?;
        self.emit(
            &m,
            mem::POOL_CREATE,
            PayloadBuilder::new().u32(id.0).u64(base as u64).u64(size as u64),
        );
        Ok(id)
    }

    /// Deletes a pool with no outstanding allocations and no blocked
    /// allocators.
    pub fn pool_delete(&self, id: PoolId) -> VmResult<()> {
        let mut m = self.enter()?;
        m.pools.delete(id).inspect_err(|err| warn!("pool_delete: {err}"))?;
        self.emit(&m, mem::POOL_DELETE, PayloadBuilder::new().u32(id.0));
        Ok(())
    }

    /// Allocates without blocking.
    pub fn pool_allocate(&self, id: PoolId, size: usize) -> VmResult<usize> {
        let mut m = self.enter()?;
        let addr = m.pools.allocate(id, size)?;
        self.emit(
            &m,
            mem::ALLOC,
            PayloadBuilder::new().u32(id.0).u64(addr as u64).u64(size as u64),
        );
        Ok(addr)
    }

    /// Allocates, waiting while the pool is exhausted.
    ///
    /// A request larger than the whole pool fails with
    /// `InsufficientResources` instead of waiting forever.
    pub fn pool_allocate_blocking(&self, id: PoolId, size: usize) -> VmResult<usize> {
        let mut m = self.enter()?;
        self.allocate_blocking(&mut m, id, size)
    }

    /// Frees an allocation and wakes the highest priority thread waiting on
    /// the pool.
    pub fn pool_deallocate(&self, id: PoolId, addr: usize) -> VmResult<()> {
        let mut m = self.enter()?;
        self.free(&mut m, id, addr)
    }

    /// Free bytes in a pool.
    pub fn pool_query(&self, id: PoolId) -> VmResult<usize> {
        Ok(self.lock().pools.query(id)?)
    }

    pub fn pool_stats(&self, id: PoolId) -> VmResult<PoolStats> {
        Ok(self.lock().pools.stats(id)?)
    }

    // Interrupts and time

    /// Raises and delivers a timer tick. Call from a logical thread; host
    /// threads raise ticks through [`interrupt_line`](Self::interrupt_line).
    pub fn tick(&self) -> VmResult<()> {
        self.shared.line.raise(Interrupt::Tick);
        self.poll()
    }

    /// Raises and delivers an I/O completion for `thread`.
    pub fn io_complete(&self, thread: ThreadId, result: i32) -> VmResult<()> {
        self.shared
            .line
            .raise(Interrupt::IoComplete { thread, result });
        self.poll()
    }

    /// Handle host threads use to raise interrupts.
    pub fn interrupt_line(&self) -> InterruptLine {
        self.shared.line.clone()
    }

    /// Delivers pending interrupts.
    pub fn poll(&self) -> VmResult<()> {
        drop(self.enter()?);
        Ok(())
    }

    pub fn tick_count(&self) -> u64 {
        self.lock().sched.tick_count()
    }

    /// Tick period in milliseconds.
    pub fn tick_ms(&self) -> u32 {
        self.shared.config.tick_ms
    }

    // Asynchronous I/O

    /// Starts an asynchronous operation and waits for its result.
    ///
    /// `issue` runs inside the critical section and must only start the
    /// operation (it must not call back into the runtime). The operation
    /// reports through the [`IoCompletion`] it receives.
    pub fn await_io<F>(&self, issue: F) -> VmResult<i32>
    where
        F: FnOnce(IoCompletion),
    {
        let mut m = self.enter()?;
        let me = m.current();
        issue(IoCompletion {
            thread: me,
            line: self.shared.line.clone(),
        });
        m.sched.block(me, WaitReason::Io, Timeout::Infinite);
        m.schedule_next();
        Ok(m.sched.thread(me)?.result())
    }

    /// Takes an I/O staging buffer from the shared pool, waiting if none is
    /// free.
    pub fn io_buffer_acquire(&self) -> VmResult<usize> {
        let mut m = self.enter()?;
        let pool = m.shared_pool;
        self.allocate_blocking(&mut m, pool, self.shared.config.io_buffer_size)
    }

    pub fn io_buffer_release(&self, addr: usize) -> VmResult<()> {
        let mut m = self.enter()?;
        let pool = m.shared_pool;
        self.free(&mut m, pool, addr)
    }

    // Internals

    fn lock(&self) -> CriticalSection<'_, Core<M>> {
        CriticalSection::enter(&self.shared.core)
    }

    fn enter(&self) -> VmResult<Masked<'_, M>> {
        let cs = self.lock();
        let stopped = cs.stopped;
        let masked = Masked {
            rt: self,
            cs: Some(cs),
        };
        if stopped {
            return Err(VmError::InvalidState);
        }
        Ok(masked)
    }

    /// Picks the next thread and switches to it; returns the re-entered
    /// section once the caller runs again.
    fn switch_next<'a>(&'a self, mut cs: CriticalSection<'a, Core<M>>) -> CriticalSection<'a, Core<M>> {
        let switch = cs.sched.pick_next();
        if !switch.is_switch() {
            return cs;
        }
        let record = if switch.to == cs.idle {
            sched::IDLE
        } else {
            sched::NEXT
        };
        self.emit(
            &cs,
            record,
            PayloadBuilder::new()
                .u32(switch.from.map_or(0, |id| id.0))
                .u32(switch.to.0),
        );

        let to = cs
            .sched
            .context(switch.to)
            .cloned()
            .expect("runtime invariant broken: ready thread without context");
        let from = switch
            .from
            .and_then(|id| cs.sched.context(id).cloned())
            .expect("runtime invariant broken: running thread without context");
        drop(cs);
        debug_assert!(!CriticalSection::<Core<M>>::is_active());

        self.shared.machine.switch(&from, &to);
        self.lock()
    }

    /// Delivers pending interrupts until the line is empty.
    fn unmask(&self) {
        while let Some(irq) = self.shared.line.take() {
            let cs = self.lock();
            if cs.stopped {
                return;
            }
            drop(self.dispatch(cs, irq));
        }
    }

    fn dispatch<'a>(
        &'a self,
        mut cs: CriticalSection<'a, Core<M>>,
        irq: Interrupt,
    ) -> CriticalSection<'a, Core<M>> {
        match irq {
            Interrupt::Tick => {
                let report = cs.sched.tick();
                self.emit(&cs, sched::TICK, PayloadBuilder::new().u64(report.tick));
                for id in &report.woken {
                    self.emit(&cs, thread_rec::WAKE, PayloadBuilder::new().u32(id.0));
                }
                for (id, mutex) in &report.timed_out {
                    trace!("{id} timed out on {mutex}");
                }
                cs.sched.requeue_current();
                self.switch_next(cs)
            }
            Interrupt::IoComplete { thread, result } => {
                let waiting = matches!(
                    cs.sched.thread(thread),
                    Ok(tcb) if tcb.state() == ThreadState::Waiting
                        && tcb.waiting_for() == Some(WaitReason::Io)
                );
                if !waiting {
                    trace!("dropping I/O result {result} for {thread}");
                    return cs;
                }
                if let Ok(tcb) = cs.sched.thread_mut(thread) {
                    tcb.result = result;
                }
                cs.sched.wake(thread);
                self.emit(
                    &cs,
                    thread_rec::IO_DONE,
                    PayloadBuilder::new().u32(thread.0).i32(result),
                );
                if cs.sched.outranks_current(thread) {
                    self.emit(&cs, sched::PREEMPT, PayloadBuilder::new().u32(thread.0));
                    cs.sched.requeue_current();
                    return self.switch_next(cs);
                }
                cs
            }
        }
    }

    fn allocate_blocking(&self, m: &mut Masked<'_, M>, pool: PoolId, size: usize) -> VmResult<usize> {
        if size == 0 {
            return Err(VmError::InvalidParameter);
        }
        loop {
            match m.pools.allocate(pool, size) {
                Ok(addr) => {
                    self.emit(
                        m,
                        mem::ALLOC,
                        PayloadBuilder::new().u32(pool.0).u64(addr as u64).u64(size as u64),
                    );
                    return Ok(addr);
                }
                Err(PoolError::Exhausted { .. }) => {
                    if !m.pools.can_ever_fit(pool, size)? {
                        warn!("{size} bytes can never fit {pool}");
                        return Err(VmError::InsufficientResources);
                    }
                    let me = m.current();
                    let level = m.sched.thread(me)?.priority().index();
                    m.pools.wait(me, level, pool);
                    m.sched.block(me, WaitReason::Memory, Timeout::Infinite);
                    self.emit(m, mem::WAIT, PayloadBuilder::new().u32(pool.0).u32(me.0));
                    trace!("{me} waits for {size} bytes of {pool}");
                    m.schedule_next();
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn free(&self, m: &mut Masked<'_, M>, pool: PoolId, addr: usize) -> VmResult<()> {
        m.pools.deallocate(pool, addr)?;
        self.emit(m, mem::FREE, PayloadBuilder::new().u32(pool.0).u64(addr as u64));
        if let Some(waiter) = m.pools.wake_next(pool) {
            m.sched.wake(waiter);
            m.preempt_for(waiter);
        }
        Ok(())
    }

    /// Wraps a thread body so that returning, or panicking, terminates the
    /// thread exactly once.
    fn wrap_entry(&self, id: ThreadId, entry: ThreadEntry<M>) -> ContextEntry {
        let rt = self.clone();
        Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                rt.unmask();
                entry(&rt);
            }));
            match outcome {
                Ok(()) => rt.exit_current(),
                Err(payload) if payload.is::<Retired>() => {
                    trace!("{id} retired");
                }
                Err(payload) => {
                    error!("{id} panicked: {}", panic_message(payload.as_ref()));
                    rt.exit_current();
                }
            }
        })
    }

    /// Terminates the calling thread after its body returned and hands the
    /// processor on without parking.
    fn exit_current(&self) {
        let mut cs = self.lock();
        if cs.stopped {
            return;
        }
        let Some(me) = cs.sched.current() else {
            return;
        };
        match cs.sched.terminate(me) {
            Ok(report) => {
                for (mutex, owner) in &report.handoffs {
                    self.emit(
                        &cs,
                        mutex_rec::HANDOFF,
                        PayloadBuilder::new().u32(mutex.0).u32(owner.0),
                    );
                }
            }
            Err(err) => {
                error!("{me} cannot exit: {err}");
                return;
            }
        }
        cs.pools.cancel_wait(me);
        self.emit(&cs, thread_rec::TERMINATE, PayloadBuilder::new().u32(me.0));
        debug!("{me} returned");

        let next = cs.sched.pick_next();
        let to = cs
            .sched
            .context(next.to)
            .cloned()
            .expect("runtime invariant broken: ready thread without context");
        drop(cs);
        debug_assert!(!CriticalSection::<Core<M>>::is_active());
        self.shared.machine.hand_off(&to);
    }

    fn idle_loop(&self) {
        loop {
            self.shared.line.halt();
            self.unmask();
        }
    }

    fn emit(&self, core: &Core<M>, record: u8, payload: PayloadBuilder) {
        if let Some(hook) = &self.shared.trace {
            let _ = hook(record, &payload.finish(), core.sched.tick_count());
        }
    }
}

impl<M: Machine> std::fmt::Debug for Runtime<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.shared.config)
            .field("pending", &self.shared.line.pending())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
