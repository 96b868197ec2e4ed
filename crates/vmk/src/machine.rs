//! Host machine seam.
//!
//! The kernel needs exactly one thing from the host: execution contexts that
//! can be created from an entry point and switched between. Ports implement
//! [`Machine`]; `vm-posix` backs every context with a parked host thread.

use std::io;

/// Code a fresh context runs once it is first switched to.
pub type ContextEntry = Box<dyn FnOnce() + Send + 'static>;

/// Unwind payload raised inside a parked context when it is retired.
///
/// A machine resumes a retired context by unwinding its stack with this
/// payload (`std::panic::resume_unwind`), so every frame of the logical
/// thread is dropped. The runtime's thread wrapper swallows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired;

/// Execution contexts provided by the host.
///
/// At most one context runs at a time. Control moves only through
/// [`switch`](Machine::switch) and [`hand_off`](Machine::hand_off).
pub trait Machine: Send + Sync + 'static {
    /// Cheap handle to one context.
    type Context: Clone + Send + Sync + 'static;

    /// Wraps the calling host thread as a context that is already running.
    fn adopt_current(&self, name: &str) -> io::Result<Self::Context>;

    /// Creates a suspended context that runs `entry` when first switched to.
    fn create_context(
        &self,
        name: &str,
        stack_size: usize,
        entry: ContextEntry,
    ) -> io::Result<Self::Context>;

    /// Suspends `from` (the caller) and resumes `to`. Returns once `from`
    /// is resumed again; unwinds with [`Retired`] if it is retired instead.
    fn switch(&self, from: &Self::Context, to: &Self::Context);

    /// Resumes `to` without suspending the caller, whose context must never
    /// run kernel code again.
    fn hand_off(&self, to: &Self::Context);

    /// Tears down a context that is not running and waits until its host
    /// resources are gone.
    fn retire(&self, context: Self::Context);
}
