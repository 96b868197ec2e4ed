//! Helpers shared by the runtime scenarios.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use vm_posix::PosixHandle;
use vmk::{Interrupt, RuntimeConfig, ThreadId, ThreadState};

pub const STACK: usize = 16 * 1024;

pub fn config() -> RuntimeConfig {
    RuntimeConfig::builder()
        .name("test")
        .heap_size(1 << 20)
        .idle_stack_size(STACK)
        .build()
}

/// Ordered record of what the logical threads did.
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

/// Raises one tick from a host thread once `id` reaches `state`.
///
/// Lets the main thread sleep for a tick while lower priority threads run,
/// without an alarm.
pub fn tick_when(rt: &PosixHandle, id: ThreadId, state: ThreadState) -> JoinHandle<()> {
    let rt = rt.clone();
    thread::spawn(move || {
        while rt.thread_state(id) != Ok(state) {
            thread::sleep(Duration::from_millis(1));
        }
        rt.interrupt_line().raise(Interrupt::Tick);
    })
}
