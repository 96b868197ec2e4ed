//! Thread lifecycle and scheduling order.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{config, tick_when, Log, STACK};
use vm_posix::PosixRuntime;
use vmk::{Priority, ThreadId, ThreadState, Timeout, VmError};

#[test]
fn higher_priority_runs_first() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let log = Log::default();

    let normal = {
        let log = log.clone();
        rt.thread_create(move |_| log.push("n1"), STACK, Priority::Normal)
            .unwrap()
    };
    let high = {
        let log = log.clone();
        rt.thread_create(move |_| log.push("high"), STACK, Priority::High)
            .unwrap()
    };

    rt.thread_activate(normal).unwrap();
    assert_eq!(rt.thread_state(normal), Ok(ThreadState::Ready));
    rt.thread_activate(high).unwrap();
    log.push("main");

    assert_eq!(log.entries(), ["high", "n1", "main"]);
    assert_eq!(rt.thread_state(high), Ok(ThreadState::Dead));
    assert_eq!(rt.thread_state(normal), Ok(ThreadState::Dead));
    rt.shutdown().unwrap();
}

#[test]
fn equal_priorities_rotate_on_tick() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let log = Log::default();

    let spawn = |tag: &'static str| {
        let log = log.clone();
        rt.thread_create(
            move |rt| {
                for i in 0..3 {
                    log.push(format!("{tag}{i}"));
                    rt.tick().unwrap();
                }
            },
            STACK,
            Priority::Normal,
        )
        .unwrap()
    };
    let a = spawn("a");
    let b = spawn("b");
    rt.thread_activate(a).unwrap();
    rt.thread_activate(b).unwrap();

    while rt.thread_state(a) != Ok(ThreadState::Dead) || rt.thread_state(b) != Ok(ThreadState::Dead) {
        rt.sleep(Timeout::Immediate).unwrap();
    }

    assert_eq!(log.entries(), ["a0", "b0", "a1", "b1", "a2", "b2"]);
    assert_eq!(rt.tick_count(), 6);
    rt.shutdown().unwrap();
}

#[test]
fn sleeper_wakes_after_its_ticks() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let log = Log::default();

    let sleeper = {
        let log = log.clone();
        rt.thread_create(
            move |rt| {
                rt.sleep(Timeout::Ticks(2)).unwrap();
                log.push(format!("woke at {}", rt.tick_count()));
            },
            STACK,
            Priority::High,
        )
        .unwrap()
    };
    rt.thread_activate(sleeper).unwrap();
    assert_eq!(rt.thread_state(sleeper), Ok(ThreadState::Waiting));

    rt.tick().unwrap();
    assert!(log.entries().is_empty());
    rt.tick().unwrap();

    assert_eq!(log.entries(), ["woke at 2"]);
    assert_eq!(rt.thread_state(sleeper), Ok(ThreadState::Dead));
    rt.shutdown().unwrap();
}

#[test]
fn alarm_drives_sleep() {
    let cfg = vmk::RuntimeConfig::builder()
        .heap_size(1 << 20)
        .idle_stack_size(STACK)
        .tick_ms(5)
        .build();
    let rt = PosixRuntime::boot_with_alarm(cfg).unwrap();
    assert!(rt.alarm().is_some());

    rt.sleep(Timeout::Ticks(3)).unwrap();

    assert!(rt.tick_count() >= 3);
    rt.shutdown().unwrap();
}

#[test]
fn lower_priority_runs_while_main_sleeps() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let log = Log::default();

    let low = {
        let log = log.clone();
        rt.thread_create(move |_| log.push("low"), STACK, Priority::Low)
            .unwrap()
    };
    rt.thread_activate(low).unwrap();
    assert!(log.entries().is_empty());

    let ticker = tick_when(&rt.handle(), low, ThreadState::Dead);
    rt.sleep(Timeout::Ticks(1)).unwrap();
    ticker.join().unwrap();

    assert_eq!(log.entries(), ["low"]);
    rt.shutdown().unwrap();
}

#[test]
fn lifecycle_rejections() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let main = rt.main_thread();

    assert_eq!(
        rt.thread_create(|_| {}, 0, Priority::Normal),
        Err(VmError::InvalidParameter)
    );
    assert_eq!(
        rt.thread_create(|_| {}, STACK, Priority::Idle),
        Err(VmError::InvalidParameter)
    );
    assert_eq!(rt.thread_activate(ThreadId(999)), Err(VmError::InvalidId));
    assert_eq!(rt.thread_state(ThreadId(999)), Err(VmError::InvalidId));

    let t = rt.thread_create(|_| {}, STACK, Priority::Low).unwrap();
    assert_eq!(rt.thread_state(t), Ok(ThreadState::Dead));
    assert_eq!(rt.thread_terminate(t), Err(VmError::InvalidState));

    rt.thread_activate(t).unwrap();
    assert_eq!(rt.thread_activate(t), Err(VmError::InvalidState));
    assert_eq!(rt.thread_delete(t), Err(VmError::InvalidState));

    rt.thread_terminate(t).unwrap();
    assert_eq!(rt.thread_state(t), Ok(ThreadState::Dead));
    rt.thread_delete(t).unwrap();
    assert_eq!(rt.thread_state(t), Err(VmError::InvalidId));

    assert_eq!(rt.thread_delete(main), Err(VmError::InvalidState));
    assert_eq!(rt.thread_terminate(main), Err(VmError::InvalidState));
    assert_eq!(rt.sleep(Timeout::Infinite), Err(VmError::InvalidParameter));
    assert_eq!(rt.current_thread(), main);

    let idle = rt.idle_thread();
    assert_eq!(rt.thread_terminate(idle), Err(VmError::InvalidState));
    assert_eq!(rt.thread_delete(idle), Err(VmError::InvalidState));
    assert_eq!(rt.thread_state(idle), Ok(ThreadState::Ready));

    // The idle thread still has to deliver the tick that wakes main.
    let ticker = tick_when(&rt.handle(), main, ThreadState::Waiting);
    rt.sleep(Timeout::Ticks(1)).unwrap();
    ticker.join().unwrap();
    assert_eq!(rt.current_thread(), main);
    rt.shutdown().unwrap();
}

#[test]
fn reactivation_reruns_entry() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let t = {
        let runs = Arc::clone(&runs);
        rt.thread_create(
            move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
            },
            STACK,
            Priority::High,
        )
        .unwrap()
    };
    rt.thread_activate(t).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(rt.thread_state(t), Ok(ThreadState::Dead));

    rt.thread_activate(t).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    rt.shutdown().unwrap();
}

#[test]
fn self_termination_does_not_return() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let log = Log::default();

    let t = {
        let log = log.clone();
        rt.thread_create(
            move |rt| {
                log.push("before");
                let me = rt.current_thread();
                let _ = rt.thread_terminate(me);
                log.push("after");
            },
            STACK,
            Priority::High,
        )
        .unwrap()
    };
    rt.thread_activate(t).unwrap();

    assert_eq!(log.entries(), ["before"]);
    assert_eq!(rt.thread_state(t), Ok(ThreadState::Dead));
    rt.thread_delete(t).unwrap();
    assert_eq!(log.entries(), ["before"]);
    rt.shutdown().unwrap();
}

#[test]
fn panicking_entry_terminates_thread() {
    let rt = PosixRuntime::boot(config()).unwrap();

    let t = rt
        .thread_create(|_| panic!("boom"), STACK, Priority::High)
        .unwrap();
    rt.thread_activate(t).unwrap();

    assert_eq!(rt.thread_state(t), Ok(ThreadState::Dead));
    rt.thread_delete(t).unwrap();
    rt.shutdown().unwrap();
}

#[test]
fn shutdown_rejects_later_calls() {
    let rt = PosixRuntime::boot(config()).unwrap();
    let handle = rt.handle();

    let parked = rt
        .thread_create(|rt| { let _ = rt.sleep(Timeout::Ticks(1_000)); }, STACK, Priority::High)
        .unwrap();
    rt.thread_activate(parked).unwrap();
    let never_ran = rt.thread_create(|_| {}, STACK, Priority::Low).unwrap();
    rt.thread_activate(never_ran).unwrap();

    rt.shutdown().unwrap();
    assert_eq!(handle.mutex_create(), Err(VmError::InvalidState));
    assert_eq!(handle.poll(), Err(VmError::InvalidState));
}
