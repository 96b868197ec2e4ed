//! Pools as seen through the runtime: blocking allocation, stacks, I/O buffers.

mod common;

use common::{config, tick_when, Log, STACK};
use vm_posix::PosixRuntime;
use vmk::{Priority, ThreadState, Timeout, VmError};

const REGION: usize = 0x10_0000;

#[test]
fn blocked_allocation_completes_after_free() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let log = Log::default();
    let pool = rt.pool_create(REGION, 512).unwrap();

    let first = rt.pool_allocate(pool, 512).unwrap();
    assert_eq!(rt.pool_allocate(pool, 64), Err(VmError::InsufficientResources));

    let waiter = {
        let log = log.clone();
        rt.thread_create(
            move |rt| {
                let addr = rt.pool_allocate_blocking(pool, 512).unwrap();
                log.push(format!("got {addr:#x}"));
                rt.pool_deallocate(pool, addr).unwrap();
            },
            STACK,
            Priority::Normal,
        )
        .unwrap()
    };
    rt.thread_activate(waiter).unwrap();
    rt.sleep(Timeout::Immediate).unwrap();
    assert_eq!(rt.thread_state(waiter), Ok(ThreadState::Waiting));

    rt.pool_deallocate(pool, first).unwrap();
    assert_eq!(rt.thread_state(waiter), Ok(ThreadState::Ready));
    rt.sleep(Timeout::Immediate).unwrap();

    assert_eq!(log.entries(), [format!("got {REGION:#x}")]);
    assert_eq!(rt.pool_query(pool), Ok(512));
    rt.pool_delete(pool).unwrap();
    rt.shutdown().unwrap();
}

#[test]
fn pool_with_blocked_allocators_cannot_be_deleted() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let log = Log::default();
    let pool = rt.pool_create(REGION, 512).unwrap();
    let first = rt.pool_allocate(pool, 512).unwrap();

    let spawn = |name: &'static str| {
        let log = log.clone();
        rt.thread_create(
            move |rt| {
                let got = rt.pool_allocate_blocking(pool, 512);
                log.push(format!("{name} {got:?}"));
                if let Ok(addr) = got {
                    rt.pool_deallocate(pool, addr).unwrap();
                }
            },
            STACK,
            Priority::Low,
        )
        .unwrap()
    };
    let b = spawn("b");
    let c = spawn("c");
    rt.thread_activate(b).unwrap();
    rt.thread_activate(c).unwrap();

    let ticker = tick_when(&rt.handle(), c, ThreadState::Waiting);
    rt.sleep(Timeout::Ticks(1)).unwrap();
    ticker.join().unwrap();
    assert_eq!(rt.thread_state(b), Ok(ThreadState::Waiting));
    assert_eq!(rt.thread_state(c), Ok(ThreadState::Waiting));

    rt.pool_deallocate(pool, first).unwrap();
    assert_eq!(rt.thread_state(b), Ok(ThreadState::Ready));
    assert_eq!(rt.pool_delete(pool), Err(VmError::InvalidState));

    let ticker = tick_when(&rt.handle(), c, ThreadState::Dead);
    rt.sleep(Timeout::Ticks(1)).unwrap();
    ticker.join().unwrap();

    assert_eq!(
        log.entries(),
        [format!("b Ok({REGION})"), format!("c Ok({REGION})")]
    );
    assert_eq!(rt.pool_query(pool), Ok(512));
    rt.pool_delete(pool).unwrap();
    rt.shutdown().unwrap();
}

#[test]
fn terminated_waiter_leaves_the_memory_queue() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let log = Log::default();
    let pool = rt.pool_create(REGION, 512).unwrap();
    let first = rt.pool_allocate(pool, 512).unwrap();

    let waiter = {
        let log = log.clone();
        rt.thread_create(
            move |rt| {
                let got = rt.pool_allocate_blocking(pool, 256);
                log.push(format!("woke {got:?}"));
            },
            STACK,
            Priority::Low,
        )
        .unwrap()
    };
    rt.thread_activate(waiter).unwrap();

    let ticker = tick_when(&rt.handle(), waiter, ThreadState::Waiting);
    rt.sleep(Timeout::Ticks(1)).unwrap();
    ticker.join().unwrap();
    assert_eq!(rt.thread_state(waiter), Ok(ThreadState::Waiting));

    rt.thread_terminate(waiter).unwrap();
    assert_eq!(rt.thread_state(waiter), Ok(ThreadState::Dead));

    rt.pool_deallocate(pool, first).unwrap();
    assert_eq!(rt.thread_state(waiter), Ok(ThreadState::Dead));
    rt.sleep(Timeout::Immediate).unwrap();

    assert!(log.entries().is_empty());
    assert_eq!(rt.pool_query(pool), Ok(512));
    rt.pool_delete(pool).unwrap();
    rt.thread_delete(waiter).unwrap();
    rt.shutdown().unwrap();
}

#[test]
fn request_larger_than_pool_never_blocks() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let pool = rt.pool_create(REGION, 1024).unwrap();

    assert_eq!(
        rt.pool_allocate_blocking(pool, 2048),
        Err(VmError::InsufficientResources)
    );
    assert_eq!(rt.pool_allocate_blocking(pool, 0), Err(VmError::InvalidParameter));

    let addr = rt.pool_allocate(pool, 100).unwrap();
    assert_eq!(rt.pool_query(pool), Ok(896));
    assert_eq!(rt.pool_delete(pool), Err(VmError::InvalidState));
    assert_eq!(rt.pool_deallocate(pool, addr + 64), Err(VmError::InvalidParameter));

    rt.pool_deallocate(pool, addr).unwrap();
    let stats = rt.pool_stats(pool).unwrap();
    assert_eq!(stats.free_bytes, 1024);
    rt.pool_delete(pool).unwrap();
    assert_eq!(rt.pool_query(pool), Err(VmError::InvalidId));
    rt.shutdown().unwrap();
}

#[test]
fn thread_stacks_come_from_the_system_pool() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let system = rt.system_pool();
    let before = rt.pool_query(system).unwrap();

    let t = rt.thread_create(|_| {}, STACK, Priority::High).unwrap();
    assert_eq!(rt.pool_query(system), Ok(before - STACK));

    rt.thread_activate(t).unwrap();
    rt.thread_delete(t).unwrap();
    assert_eq!(rt.pool_query(system), Ok(before));

    assert_eq!(
        rt.thread_create(|_| {}, 1 << 24, Priority::Normal),
        Err(VmError::InsufficientResources)
    );
    rt.shutdown().unwrap();
}

#[test]
fn io_buffers_use_the_shared_pool() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let shared = rt.shared_pool();
    let total = rt.pool_query(shared).unwrap();

    let a = rt.io_buffer_acquire().unwrap();
    let b = rt.io_buffer_acquire().unwrap();
    assert_ne!(a, b);
    assert_eq!(rt.pool_query(shared), Ok(total - 2 * rt.config().io_buffer_size));

    rt.io_buffer_release(a).unwrap();
    rt.io_buffer_release(b).unwrap();
    assert_eq!(rt.pool_query(shared), Ok(total));
    rt.shutdown().unwrap();
}
