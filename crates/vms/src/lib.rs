//! Runtime trace records with pluggable backends.
//!
//! The kernel and memory subsystems describe what they do as small binary
//! *records*: a one-byte record identifier (see [`records`]), the tick at
//! which it happened, and a little-endian payload built with
//! [`PayloadBuilder`]. A [`Tracer`] numbers the records and hands them to a
//! [`TraceBackend`]; the runtime only ever sees the type-erased
//! [`TraceHook`].

use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use thiserror::Error;

mod payload;

pub mod records;

pub use payload::PayloadBuilder;

/// Maximum payload length for a single record.
const DEFAULT_MAX_RECORD_LEN: usize = 64;

/// Configuration for the tracer.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub max_record_len: usize,
    pub include_tick: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            include_tick: true,
        }
    }
}

/// A single trace record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub seq: u32,
    pub record_type: u8,
    pub tick: Option<u64>,
    pub payload: Vec<u8>,
}

impl TraceRecord {
    /// Renders the record as one human readable line (without newline).
    pub fn to_line(&self) -> String {
        let mut line = format!("#{:06} {:<16}", self.seq, records::name(self.record_type));
        if let Some(tick) = self.tick {
            let _ = write!(line, " t={tick}");
        }
        if !self.payload.is_empty() {
            line.push_str(" [");
            for (i, byte) in self.payload.iter().enumerate() {
                if i > 0 {
                    line.push(' ');
                }
                let _ = write!(line, "{byte:02x}");
            }
            line.push(']');
        }
        line
    }
}

/// Errors that can occur while emitting trace data.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("backend error: {0}")]
    Backend(#[from] io::Error),
}

/// Backend trait that consumes finished records.
pub trait TraceBackend: Send + Sync {
    fn write_record(&self, record: &TraceRecord) -> Result<(), TraceError>;
}

/// Backend that writes one text line per record to any `Write` implementation.
pub struct WriterBackend<W: Write + Send + 'static> {
    writer: Arc<Mutex<W>>,
}

impl<W: Write + Send + 'static> WriterBackend<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }
}

impl<W: Write + Send + 'static> TraceBackend for WriterBackend<W> {
    fn write_record(&self, record: &TraceRecord) -> Result<(), TraceError> {
        let mut guard = self.writer.lock().unwrap();
        writeln!(guard, "{}", record.to_line()).map_err(TraceError::from)
    }
}

/// Backend that keeps every record in memory; handy for tests and post-mortems.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    records: Arc<Mutex<Vec<TraceRecord>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything recorded so far.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Returns the record identifiers in emission order.
    pub fn record_types(&self) -> Vec<u8> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|record| record.record_type)
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

impl TraceBackend for MemoryBackend {
    fn write_record(&self, record: &TraceRecord) -> Result<(), TraceError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Record sequencer in front of a backend.
pub struct Tracer<B: TraceBackend> {
    backend: B,
    cfg: TraceConfig,
    seq: u32,
}

#[derive(Clone)]
pub struct TracerHandle<B: TraceBackend> {
    inner: Arc<Mutex<Tracer<B>>>,
}

impl<B: TraceBackend> Tracer<B> {
    pub fn new(cfg: TraceConfig, backend: B) -> Self {
        Self {
            backend,
            cfg,
            seq: 0,
        }
    }

    pub fn into_handle(self) -> TracerHandle<B> {
        TracerHandle {
            inner: Arc::new(Mutex::new(self)),
        }
    }

    pub fn record(
        &mut self,
        record_type: u8,
        payload: &[u8],
        tick: u64,
    ) -> Result<TraceRecord, TraceError> {
        if payload.len() > self.cfg.max_record_len {
            return Err(TraceError::PayloadTooLarge(payload.len()));
        }

        self.seq = self.seq.wrapping_add(1);
        let record = TraceRecord {
            seq: self.seq,
            record_type,
            tick: self.cfg.include_tick.then_some(tick),
            payload: payload.to_vec(),
        };

        self.backend.write_record(&record)?;
        Ok(record)
    }
}

impl<B: TraceBackend + 'static> TracerHandle<B> {
    pub fn emit(&self, record_type: u8, payload: &[u8], tick: u64) -> Result<TraceRecord, TraceError> {
        let mut guard = self.inner.lock().unwrap();
        guard.record(record_type, payload, tick)
    }

    pub fn hook(&self) -> TraceHook {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |record_type, payload, tick| {
            let mut guard = inner.lock().unwrap();
            guard.record(record_type, payload, tick).map(|_| ())
        })
    }
}

/// Type-erased sink the runtime emits records into: `(record, payload, tick)`.
pub type TraceHook = Arc<dyn Fn(u8, &[u8], u64) -> Result<(), TraceError> + Send + Sync>;

/// Convenience backend that writes record lines to stdout.
pub fn stdout_backend() -> WriterBackend<io::Stdout> {
    WriterBackend::new(io::stdout())
}

/// Builds a hook over a fresh [`MemoryBackend`] and returns both.
pub fn memory_hook() -> (TraceHook, MemoryBackend) {
    let backend = MemoryBackend::new();
    let handle = Tracer::new(TraceConfig::default(), backend.clone()).into_handle();
    (handle.hook(), backend)
}
