//! Hosted machine for the vm runtime.
//!
//! [`PosixMachine`] backs each logical thread with a parked host thread and
//! [`Alarm`] raises the periodic tick. [`PosixRuntime`] boots both together:
//!
//! ```no_run
//! use vm_posix::PosixRuntime;
//! use vmk::{Priority, RuntimeConfig, Timeout};
//!
//! let rt = PosixRuntime::boot_with_alarm(RuntimeConfig::default())?;
//! let worker = rt.thread_create(|rt| {
//!     rt.sleep(Timeout::Ticks(10)).ok();
//! }, 16 * 1024, Priority::Normal)?;
//! rt.thread_activate(worker)?;
//! rt.shutdown()?;
//! # Ok::<(), vmk::VmError>(())
//! ```

use std::ops::Deref;

use log::error;
use vmk::{Runtime, RuntimeConfig, VmError, VmResult};
use vms::{stdout_backend, TraceConfig, TraceHook, Tracer};

pub mod alarm;
pub mod context;

pub use alarm::Alarm;
pub use context::{PosixContext, PosixMachine, MIN_HOST_STACK};

/// Runtime handle over the hosted machine.
pub type PosixHandle = Runtime<PosixMachine>;

/// A booted runtime plus its optional alarm.
///
/// Dereferences to the [`Runtime`] so every operation is available directly.
#[derive(Debug)]
pub struct PosixRuntime {
    runtime: PosixHandle,
    alarm: Option<Alarm>,
}

impl PosixRuntime {
    /// Boots on the calling host thread without an alarm; ticks are raised
    /// only through [`Runtime::tick`] or the interrupt line.
    pub fn boot(config: RuntimeConfig) -> VmResult<Self> {
        let runtime = Runtime::start(config, PosixMachine::new())?;
        Ok(Self {
            runtime,
            alarm: None,
        })
    }

    /// Boots and starts an alarm at the configured tick period.
    pub fn boot_with_alarm(config: RuntimeConfig) -> VmResult<Self> {
        let mut booted = Self::boot(config)?;
        let alarm = Alarm::start(booted.runtime.interrupt_line(), booted.runtime.tick_ms())
            .map_err(|err| {
                error!("cannot start the alarm: {err}");
                VmError::InsufficientResources
            })?;
        booted.alarm = Some(alarm);
        Ok(booted)
    }

    /// Cloneable runtime handle, e.g. for capturing in thread entries.
    pub fn handle(&self) -> PosixHandle {
        self.runtime.clone()
    }

    pub fn alarm(&self) -> Option<&Alarm> {
        self.alarm.as_ref()
    }

    /// Stops the alarm and retires every logical thread except main.
    pub fn shutdown(mut self) -> VmResult<()> {
        if let Some(mut alarm) = self.alarm.take() {
            alarm.stop();
        }
        self.runtime.shutdown()
    }
}

impl Deref for PosixRuntime {
    type Target = PosixHandle;

    fn deref(&self) -> &PosixHandle {
        &self.runtime
    }
}

/// Trace hook that prints one line per record to stdout.
pub fn stdout_trace_hook() -> TraceHook {
    Tracer::new(TraceConfig::default(), stdout_backend())
        .into_handle()
        .hook()
}
