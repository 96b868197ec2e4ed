//! Tests for RuntimeConfig builder and validation.

use std::sync::Arc;

use vmk::{RuntimeConfig, VmError};

#[test]
fn runtime_config_builder() {
    let config = RuntimeConfig::builder()
        .name("bench")
        .tick_ms(5)
        .heap_size(1 << 20)
        .shared_size(8192)
        .alignment(32)
        .idle_stack_size(4096)
        .io_buffer_size(256)
        .build();

    assert_eq!(config.name, "bench");
    assert_eq!(config.tick_ms, 5);
    assert_eq!(config.heap_size, 1 << 20);
    assert_eq!(config.shared_size, 8192);
    assert_eq!(config.alignment, 32);
    assert_eq!(config.idle_stack_size, 4096);
    assert_eq!(config.io_buffer_size, 256);
    assert!(config.trace_hook.is_none());
    assert_eq!(config.validate(), Ok(()));
}

#[test]
fn runtime_config_default() {
    let config = RuntimeConfig::default();

    assert_eq!(config.name, "vm");
    assert_eq!(config.tick_ms, 10);
    assert_eq!(config.shared_size, 64 * 1024);
    assert_eq!(config.alignment, vmm::DEFAULT_ALIGNMENT);
    assert_eq!(config.thread_prefix(), "vm-thread");
}

#[test]
fn zero_tick_rejected() {
    let config = RuntimeConfig::builder().tick_ms(0).build();
    assert_eq!(config.validate(), Err(VmError::InvalidParameter));
    assert_eq!(VmError::InvalidParameter.code(), 2);
}

#[test]
fn io_buffer_must_fit_shared_pool() {
    let config = RuntimeConfig::builder()
        .shared_size(1024)
        .io_buffer_size(2048)
        .build();
    assert_eq!(config.validate(), Err(VmError::InvalidParameter));
}

#[test]
fn trace_hook_shows_in_debug() {
    let (hook, _backend) = vms::memory_hook();
    let config = RuntimeConfig::builder()
        .trace_hook(Arc::clone(&hook))
        .build();

    let debug = format!("{config:?}");
    assert!(debug.contains("trace_hook: true"));
}
