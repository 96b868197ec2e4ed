//! Periodic tick source.
//!
//! A host thread raises [`Interrupt::Tick`] on the runtime's interrupt line
//! once per period. Deadlines are absolute (monotonic clock), so a late
//! wakeup shortens the next sleep instead of accumulating drift.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use vmk::{Interrupt, InterruptLine};

/// Ticker thread; stops when dropped.
#[derive(Debug)]
pub struct Alarm {
    period: Duration,
    running: Arc<AtomicBool>,
    raised: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl Alarm {
    /// Starts raising ticks on `line` every `tick_ms` milliseconds.
    pub fn start(line: InterruptLine, tick_ms: u32) -> std::io::Result<Self> {
        let period = Duration::from_millis(u64::from(tick_ms.max(1)));
        let running = Arc::new(AtomicBool::new(true));
        let raised = Arc::new(AtomicU64::new(0));

        let flag = Arc::clone(&running);
        let count = Arc::clone(&raised);
        let handle = thread::Builder::new()
            .name("vm-alarm".into())
            .spawn(move || {
                let mut next_tick = Instant::now();
                while flag.load(Ordering::Relaxed) {
                    next_tick += period;
                    let now = Instant::now();
                    if next_tick > now {
                        thread::sleep(next_tick - now);
                    }
                    if !flag.load(Ordering::Relaxed) {
                        break;
                    }
                    line.raise(Interrupt::Tick);
                    count.fetch_add(1, Ordering::Relaxed);
                }
            })?;

        debug!("alarm started, period {period:?}");
        Ok(Self {
            period,
            running,
            raised,
            handle: Some(handle),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks raised so far.
    pub fn raised(&self) -> u64 {
        self.raised.load(Ordering::Relaxed)
    }

    /// Stops the ticker and waits for its thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("alarm thread panicked");
            }
            debug!("alarm stopped after {} ticks", self.raised());
        }
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.stop();
    }
}
