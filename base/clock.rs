// This file is part of Dashcam, an automotive dual-camera trip recorder.
// Copyright (C) 2024 The Dashcam Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: MIT

//! Clock interface and implementations for testability.
//!
//! Components that care about time (clip rotation, notify cooldowns, log
//! rate limiting, orphan trip recovery) take a `Clocks` implementation so
//! tests can advance time without sleeping.

use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use jiff::Timestamp;
use tracing::warn;

use crate::shutdown::ShutdownError;

/// Abstract interface to the system clocks.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time.
    fn realtime(&self) -> Timestamp;

    /// Gets the time since an arbitrary epoch from a monotonic clock.
    fn monotonic(&self) -> Duration;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);
}

/// Calls `f` until it succeeds, sleeping 1 s between attempts, bailing out
/// only on shutdown.
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown_rx: &crate::shutdown::Receiver,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Result<T, ShutdownError>
where
    C: Clocks,
    E: Into<crate::Error>,
{
    loop {
        let e = match f() {
            Ok(t) => return Ok(t),
            Err(e) => e.into(),
        };
        shutdown_rx.check()?;
        warn!(err = %e.chain(), "sleeping for 1 s after error");
        clocks.sleep(Duration::from_secs(1));
    }
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

fn boot_instant() -> Instant {
    static BOOT: OnceLock<Instant> = OnceLock::new();
    *BOOT.get_or_init(Instant::now)
}

impl Clocks for RealClocks {
    fn realtime(&self) -> Timestamp {
        Timestamp::now()
    }

    fn monotonic(&self) -> Duration {
        boot_instant().elapsed()
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long);
    }
}

/// Logs a warning if the guarded scope outlives one second.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Duration,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic() - self.start;
        if elapsed.as_secs() >= 1 {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing. `sleep` advances time without blocking.
#[derive(Clone)]
pub struct SimulatedClocks(std::sync::Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: Timestamp,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot: Timestamp) -> Self {
        SimulatedClocks(std::sync::Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(Duration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> Timestamp {
        let uptime = *self.0.uptime.lock().unwrap();
        self.0.boot + jiff::SignedDuration::try_from(uptime).unwrap()
    }

    fn monotonic(&self) -> Duration {
        *self.0.uptime.lock().unwrap()
    }

    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock().unwrap();
        *l += how_long;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advances_on_sleep() {
        let c = SimulatedClocks::new(Timestamp::UNIX_EPOCH);
        let t0 = c.realtime();
        c.sleep(Duration::from_secs(90));
        assert_eq!((c.realtime() - t0).get_seconds(), 90);
        assert_eq!(c.monotonic(), Duration::from_secs(90));
    }

    #[test]
    fn real_monotonic_is_nondecreasing() {
        let c = RealClocks::default();
        let a = c.monotonic();
        let b = c.monotonic();
        assert!(b >= a);
    }
}
