// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Clock interface and implementations for testability.
//!
//! Only a monotonic clock is abstracted; wall-clock times (file mtimes and
//! the like) come straight from the metadata store.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Abstract interface to a monotonic clock. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Returns the time elapsed since some fixed but arbitrary epoch.
    fn monotonic(&self) -> Duration;
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

impl Clocks for RealClocks {
    fn monotonic(&self) -> Duration {
        process_epoch().elapsed()
    }
}

/// Simulated clock for testing; advances only via [`SimulatedClocks::advance`].
#[derive(Clone)]
pub struct SimulatedClocks(Arc<Mutex<Duration>>);

impl SimulatedClocks {
    pub fn new() -> Self {
        SimulatedClocks(Arc::new(Mutex::new(Duration::ZERO)))
    }

    pub fn advance(&self, by: Duration) {
        let mut l = self.0.lock().unwrap();
        *l += by;
    }
}

impl Default for SimulatedClocks {
    fn default() -> Self {
        Self::new()
    }
}

impl Clocks for SimulatedClocks {
    fn monotonic(&self) -> Duration {
        *self.0.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advances() {
        let c = SimulatedClocks::new();
        let t0 = c.monotonic();
        c.advance(Duration::from_secs(3));
        assert_eq!(c.monotonic() - t0, Duration::from_secs(3));
    }

    #[test]
    fn real_is_monotonic() {
        let c = RealClocks {};
        let a = c.monotonic();
        let b = c.monotonic();
        assert!(b >= a);
    }
}
