//! Dining Philosophers on the vm runtime.
//!
//! Every philosopher is a logical thread; every fork is a runtime mutex. The
//! main thread prints the table status every few ticks until the run time
//! elapses or Ctrl-C is pressed, then shuts the runtime down.

mod table;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use log::{info, Level, LevelFilter, Log, Metadata, Record};
use vm_posix::{stdout_trace_hook, PosixRuntime};
use vmk::{Priority, RuntimeConfig, Timeout};

use crate::table::{Phase, Table};

#[derive(Parser, Debug)]
#[command(author, version, about = "Dining philosophers on the vm cooperative runtime")]
struct Opts {
    /// Number of philosophers (and forks).
    #[arg(short = 'n', long, default_value_t = 5)]
    philosophers: usize,

    /// Tick period in milliseconds.
    #[arg(long, default_value_t = 10)]
    tick_ms: u32,

    /// Ticks spent thinking before getting hungry.
    #[arg(long, default_value_t = 20)]
    think: u64,

    /// Ticks spent eating.
    #[arg(long, default_value_t = 10)]
    eat: u64,

    /// Stop after this many seconds; 0 runs until Ctrl-C.
    #[arg(short, long, default_value_t = 0)]
    seconds: u64,

    /// Print runtime trace records to stdout.
    #[arg(long)]
    trace: bool,

    /// Log runtime internals.
    #[arg(short, long)]
    verbose: bool,
}

/// Minimal stderr logger.
struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR".red(),
            Level::Warn => "WARN ".yellow(),
            Level::Info => "INFO ".green(),
            Level::Debug => "DEBUG".cyan(),
            Level::Trace => "TRACE".dimmed(),
        };
        eprintln!("{level} {}: {}", record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

fn main() -> Result<()> {
    let opts = Opts::parse();
    if !(2..=16).contains(&opts.philosophers) {
        bail!("between 2 and 16 philosophers can sit at the table");
    }

    log::set_logger(&LOGGER).context("installing the logger")?;
    log::set_max_level(if opts.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("installing the Ctrl-C handler")?;
    }

    let mut config = RuntimeConfig::builder().name("dpp").tick_ms(opts.tick_ms);
    if opts.trace {
        config = config.trace_hook(stdout_trace_hook());
    }
    let rt = PosixRuntime::boot_with_alarm(config.build()).context("booting the runtime")?;

    println!("\n{}", "Dining Philosophers".bold());
    println!("{} philosophers, tick {} ms, Ctrl-C to stop\n", opts.philosophers, opts.tick_ms);

    let table = Table::set(&rt, opts.philosophers, opts.think, opts.eat)?;
    for n in 0..table.seats() {
        let seat = Arc::clone(&table);
        let id = rt.thread_create(
            move |rt| {
                if let Err(err) = seat.dine(rt, n) {
                    log::error!("philosopher {n} left the table: {err}");
                }
            },
            32 * 1024,
            Priority::Normal,
        )?;
        rt.thread_activate(id)?;
    }

    let status_every = (1000 / u64::from(opts.tick_ms.max(1))).max(1);
    let deadline = opts.seconds * 1000 / u64::from(opts.tick_ms.max(1));
    while !stop.load(Ordering::SeqCst) {
        rt.sleep(Timeout::Ticks(status_every))?;
        print_status(&table, rt.tick_count());
        if deadline > 0 && rt.tick_count() >= deadline {
            break;
        }
    }

    let system = rt.pool_stats(rt.system_pool())?;
    rt.shutdown()?;

    info!(
        "system pool: {} of {} bytes in use, low water {} free",
        system.used_bytes, system.size, system.min_free_bytes
    );
    println!("\n{} {} meals served", "Done:".bold(), table.total_meals());
    Ok(())
}

fn print_status(table: &Table, tick: u64) {
    let phases: Vec<String> = (0..table.seats())
        .map(|n| match table.phase(n) {
            Phase::Eating => format!("{n}").green().to_string(),
            Phase::Hungry => format!("{n}").yellow().to_string(),
            Phase::Thinking => "-".to_string(),
        })
        .collect();
    let meals: Vec<String> = (0..table.seats()).map(|n| format!("{:3}", table.meals(n))).collect();
    println!(
        "{} tick {tick:>6} | table [{}] | meals [{}]",
        "status".bold(),
        phases.join(" "),
        meals.join(" ")
    );
}
