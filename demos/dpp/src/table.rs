//! Philosophers and the forks between them.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use colored::{ColoredString, Colorize};
use log::debug;
use vm_posix::PosixHandle;
use vmk::{MutexId, Timeout, VmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Thinking = 0,
    Hungry = 1,
    Eating = 2,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Phase::Hungry,
            2 => Phase::Eating,
            _ => Phase::Thinking,
        }
    }

    pub fn label(self) -> ColoredString {
        match self {
            Phase::Thinking => "THINKING".blue(),
            Phase::Hungry => "HUNGRY".yellow(),
            Phase::Eating => "EATING".green(),
        }
    }
}

/// Shared view of every philosopher, read by the status printer.
#[derive(Debug)]
pub struct Table {
    forks: Vec<MutexId>,
    phases: Vec<AtomicU8>,
    meals: Vec<AtomicU32>,
    think_ticks: u64,
    eat_ticks: u64,
}

impl Table {
    /// Lays out one fork mutex per seat.
    pub fn set(rt: &PosixHandle, seats: usize, think_ticks: u64, eat_ticks: u64) -> VmResult<Arc<Self>> {
        let forks = (0..seats)
            .map(|_| rt.mutex_create())
            .collect::<VmResult<Vec<_>>>()?;
        Ok(Arc::new(Self {
            forks,
            phases: (0..seats).map(|_| AtomicU8::new(Phase::Thinking as u8)).collect(),
            meals: (0..seats).map(|_| AtomicU32::new(0)).collect(),
            think_ticks,
            eat_ticks,
        }))
    }

    pub fn seats(&self) -> usize {
        self.forks.len()
    }

    pub fn phase(&self, n: usize) -> Phase {
        Phase::from_u8(self.phases[n].load(Ordering::Relaxed))
    }

    pub fn meals(&self, n: usize) -> u32 {
        self.meals[n].load(Ordering::Relaxed)
    }

    pub fn total_meals(&self) -> u32 {
        (0..self.seats()).map(|n| self.meals(n)).sum()
    }

    /// Forks of seat `n`, lower id first so no cycle of waiters can form.
    fn forks_of(&self, n: usize) -> (MutexId, MutexId) {
        let left = self.forks[n];
        let right = self.forks[(n + 1) % self.seats()];
        if left < right {
            (left, right)
        } else {
            (right, left)
        }
    }

    fn enter(&self, n: usize, phase: Phase) {
        self.phases[n].store(phase as u8, Ordering::Relaxed);
        println!("philosopher {n} {}", phase.label());
    }

    /// Body of philosopher `n`; loops until the runtime retires it.
    pub fn dine(&self, rt: &PosixHandle, n: usize) -> VmResult<()> {
        // Staggered thinking keeps the philosophers out of lockstep.
        let think = self.think_ticks + n as u64;
        let eat = self.eat_ticks + (n as u64 % 3);
        let (first, second) = self.forks_of(n);
        loop {
            self.enter(n, Phase::Thinking);
            rt.sleep(Timeout::Ticks(think))?;

            self.enter(n, Phase::Hungry);
            rt.mutex_acquire(first, Timeout::Infinite)?;
            rt.mutex_acquire(second, Timeout::Infinite)?;

            self.enter(n, Phase::Eating);
            self.meals[n].fetch_add(1, Ordering::Relaxed);
            rt.sleep(Timeout::Ticks(eat))?;

            rt.mutex_release(second)?;
            rt.mutex_release(first)?;
            debug!("philosopher {n} released {first} and {second}");
        }
    }
}
