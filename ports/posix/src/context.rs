//! Host-thread backed execution contexts.
//!
//! Every logical thread owns a dedicated host thread that stays parked on its
//! [`Baton`] whenever it is not the running logical thread. Switching gives the
//! target's baton a `Run` signal and parks the caller on its own.

use std::fmt;
use std::io;
use std::panic;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use vmk::{ContextEntry, Machine, Retired};

/// Smallest host stack handed to the OS, whatever the logical stack size.
pub const MIN_HOST_STACK: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Parked,
    Run,
    Exit,
}

/// Per-context wakeup slot.
#[derive(Debug)]
struct Baton {
    signal: Mutex<Signal>,
    changed: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            signal: Mutex::new(Signal::Parked),
            changed: Condvar::new(),
        }
    }

    fn give(&self, signal: Signal) {
        let mut slot = self.signal.lock();
        // Exit is final.
        if *slot != Signal::Exit {
            *slot = signal;
        }
        self.changed.notify_all();
    }

    /// Parks until the baton is given. `Run` is consumed, `Exit` sticks.
    fn wait(&self) -> Signal {
        let mut slot = self.signal.lock();
        while *slot == Signal::Parked {
            self.changed.wait(&mut slot);
        }
        let signal = *slot;
        if signal == Signal::Run {
            *slot = Signal::Parked;
        }
        signal
    }
}

/// Handle to one hosted context.
#[derive(Clone)]
pub struct PosixContext {
    name: Arc<str>,
    baton: Arc<Baton>,
    host: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PosixContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the context owns a host thread (false for the adopted main
    /// thread).
    pub fn is_spawned(&self) -> bool {
        self.host.lock().is_some()
    }
}

impl fmt::Debug for PosixContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PosixContext")
            .field("name", &self.name)
            .field("signal", &*self.baton.signal.lock())
            .finish()
    }
}

/// [`Machine`] backed by parked host threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixMachine;

impl PosixMachine {
    pub fn new() -> Self {
        Self
    }
}

impl Machine for PosixMachine {
    type Context = PosixContext;

    fn adopt_current(&self, name: &str) -> io::Result<PosixContext> {
        trace!("adopting host thread {:?} as {name}", thread::current().name());
        Ok(PosixContext {
            name: name.into(),
            baton: Arc::new(Baton::new()),
            host: Arc::new(Mutex::new(None)),
        })
    }

    fn create_context(
        &self,
        name: &str,
        stack_size: usize,
        entry: ContextEntry,
    ) -> io::Result<PosixContext> {
        let baton = Arc::new(Baton::new());
        let parked = Arc::clone(&baton);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .stack_size(stack_size.max(MIN_HOST_STACK))
            .spawn(move || {
                if parked.wait() == Signal::Exit {
                    return;
                }
                entry();
            })?;

        Ok(PosixContext {
            name: name.into(),
            baton,
            host: Arc::new(Mutex::new(Some(handle))),
        })
    }

    fn switch(&self, from: &PosixContext, to: &PosixContext) {
        trace!("switch {} -> {}", from.name, to.name);
        to.baton.give(Signal::Run);
        if from.baton.wait() == Signal::Exit {
            panic::resume_unwind(Box::new(Retired));
        }
    }

    fn hand_off(&self, to: &PosixContext) {
        trace!("hand off -> {}", to.name);
        to.baton.give(Signal::Run);
    }

    fn retire(&self, context: PosixContext) {
        context.baton.give(Signal::Exit);
        let handle = context.host.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("host thread of {} ended with a panic", context.name);
            }
        }
        trace!("retired {}", context.name);
    }
}
