//! Keeps termination signals from landing inside a critical section.
//!
//! Every operation that takes the segment lock first enters a process-wide
//! gate. Once [`install`] has run, a termination signal closes the gate,
//! waits for the threads already inside to leave, and only then exits the
//! process. New operations see the closed gate and fail with
//! `PoolError::Terminating`. So do operations still waiting for the lock: they
//! poll the gate between timed waits and leave without ever holding it.

use std::process;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use libc::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use once_cell::sync::OnceCell;
use signal_hook::iterator::Signals;
use tracing::info;

use crate::errors::{PoolError, Result};

const DRAIN_POLL: Duration = Duration::from_millis(1);

static GATE: SectionGate = SectionGate::new();
static INSTALLED: OnceCell<()> = OnceCell::new();

pub(crate) struct SectionGate {
    closing: AtomicBool,
    inside: AtomicUsize,
}

pub(crate) struct Section<'a> {
    gate: &'a SectionGate,
}

impl SectionGate {
    pub(crate) const fn new() -> SectionGate {
        SectionGate {
            closing: AtomicBool::new(false),
            inside: AtomicUsize::new(0),
        }
    }

    pub(crate) fn enter(&self) -> Result<Section<'_>> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(PoolError::Terminating);
        }
        self.inside.fetch_add(1, Ordering::SeqCst);
        // Re-check after announcing ourselves: the closer may have sampled
        // `inside` between the first load and the increment.
        if self.closing.load(Ordering::SeqCst) {
            self.inside.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::Terminating);
        }
        Ok(Section { gate: self })
    }

    pub(crate) fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn occupancy(&self) -> usize {
        self.inside.load(Ordering::SeqCst)
    }

    /// Closes the gate and returns once nobody is inside.
    pub(crate) fn close_and_drain(&self) {
        self.close();
        while self.occupancy() != 0 {
            thread::sleep(DRAIN_POLL);
        }
    }
}

impl Section<'_> {
    pub(crate) fn closing(&self) -> bool {
        self.gate.closing.load(Ordering::SeqCst)
    }
}

impl Drop for Section<'_> {
    fn drop(&mut self) {
        self.gate.inside.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) fn enter() -> Result<Section<'static>> {
    GATE.enter()
}

/// Routes SIGHUP, SIGINT, SIGQUIT and SIGTERM through the gate. Only the first
/// call in a process does anything.
pub fn install() -> Result<()> {
    INSTALLED.get_or_try_init(|| {
        let mut signals = Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
        thread::Builder::new()
            .name("slotpool-signals".into())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!(signal, "termination requested, draining critical sections");
                    GATE.close_and_drain();
                    process::exit(128 + signal);
                }
            })?;
        Ok::<(), PoolError>(())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sections_are_counted() {
        let gate = SectionGate::new();
        let first = gate.enter().unwrap();
        let second = gate.enter().unwrap();
        assert_eq!(gate.occupancy(), 2);
        drop(first);
        drop(second);
        assert_eq!(gate.occupancy(), 0);
    }

    #[test]
    fn closed_gate_refuses_entry() {
        let gate = SectionGate::new();
        gate.close();
        assert!(matches!(gate.enter(), Err(PoolError::Terminating)));
        assert_eq!(gate.occupancy(), 0);
    }

    #[test]
    fn drain_waits_for_open_sections() {
        let gate: &'static SectionGate = Box::leak(Box::new(SectionGate::new()));
        let section = gate.enter().unwrap();
        let left = Arc::new(AtomicBool::new(false));

        let worker = {
            let left = left.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                left.store(true, Ordering::SeqCst);
                drop(section);
            })
        };
        gate.close_and_drain();
        assert!(left.load(Ordering::SeqCst));
        assert!(gate.enter().is_err());
        worker.join().unwrap();
    }

    #[test]
    fn open_sections_see_the_gate_close() {
        let gate = SectionGate::new();
        let section = gate.enter().unwrap();
        assert!(!section.closing());
        gate.close();
        assert!(section.closing());
        drop(section);
        assert_eq!(gate.occupancy(), 0);
    }
}
