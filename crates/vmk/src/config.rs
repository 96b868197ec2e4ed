//! Runtime configuration.

use std::fmt;

use vms::TraceHook;

use crate::error::{VmError, VmResult};

/// Configuration for [`Runtime::start`](crate::Runtime::start).
///
/// Sizes the system pool (thread stacks) and the shared pool (I/O staging
/// buffers), sets the tick period, and optionally installs a trace hook.
#[derive(Clone)]
pub struct RuntimeConfig {
    pub name: &'static str,
    pub tick_ms: u32,
    pub heap_size: usize,
    pub shared_size: usize,
    pub alignment: usize,
    pub idle_stack_size: usize,
    pub io_buffer_size: usize,
    pub trace_hook: Option<TraceHook>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "vm",
            tick_ms: 10,
            heap_size: 16 * 1024 * 1024,
            shared_size: 64 * 1024,
            alignment: vmm::DEFAULT_ALIGNMENT,
            idle_stack_size: 64 * 1024,
            io_buffer_size: 512,
            trace_hook: None,
        }
    }
}

impl RuntimeConfig {
    /// Creates a new runtime configuration builder.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Checks the sizes against each other.
    pub fn validate(&self) -> VmResult<()> {
        let sizes_ok = self.tick_ms > 0
            && self.heap_size > 0
            && self.shared_size > 0
            && self.idle_stack_size > 0
            && self.io_buffer_size > 0;
        if !sizes_ok || !self.alignment.is_power_of_two() {
            return Err(VmError::InvalidParameter);
        }
        if self.idle_stack_size > self.heap_size || self.io_buffer_size > self.shared_size {
            return Err(VmError::InvalidParameter);
        }
        Ok(())
    }

    /// Prefix of logical thread names.
    pub fn thread_prefix(&self) -> String {
        format!("{}-thread", self.name)
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("name", &self.name)
            .field("tick_ms", &self.tick_ms)
            .field("heap_size", &self.heap_size)
            .field("shared_size", &self.shared_size)
            .field("alignment", &self.alignment)
            .field("idle_stack_size", &self.idle_stack_size)
            .field("io_buffer_size", &self.io_buffer_size)
            .field("trace_hook", &self.trace_hook.is_some())
            .finish()
    }
}

/// Builder for ergonomic runtime configuration construction.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Sets the prefix used for host thread names.
    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    /// Sets the timer period in milliseconds.
    pub fn tick_ms(mut self, ms: u32) -> Self {
        self.config.tick_ms = ms;
        self
    }

    /// Sets the system pool size.
    pub fn heap_size(mut self, bytes: usize) -> Self {
        self.config.heap_size = bytes;
        self
    }

    /// Sets the shared pool size.
    pub fn shared_size(mut self, bytes: usize) -> Self {
        self.config.shared_size = bytes;
        self
    }

    /// Sets the allocation granularity (power of two).
    pub fn alignment(mut self, bytes: usize) -> Self {
        self.config.alignment = bytes;
        self
    }

    pub fn idle_stack_size(mut self, bytes: usize) -> Self {
        self.config.idle_stack_size = bytes;
        self
    }

    pub fn io_buffer_size(mut self, bytes: usize) -> Self {
        self.config.io_buffer_size = bytes;
        self
    }

    /// Installs a trace hook.
    pub fn trace_hook(mut self, hook: TraceHook) -> Self {
        self.config.trace_hook = Some(hook);
        self
    }

    /// Builds the runtime configuration.
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}
