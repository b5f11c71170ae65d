// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-handle streaming observability.
//!
//! Every open file registers here; adapters report delivered bytes and the
//! reader's buffered offset, and operators read back a snapshot (path,
//! throughput, progress). Throughput is an exponentially-weighted moving
//! average so short stalls don't zero it out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base::clock::Clocks;
use base::FastHashMap;
use uuid::Uuid;

/// EWMA time constant: weight decays to 1/e over this horizon.
const RATE_TAU: Duration = Duration::from_secs(5);

struct ActiveStream {
    path: String,
    bytes_read: u64,
    buffered_offset: u64,
    rate: f64,
    last_update: Duration,
}

#[derive(Clone, Debug)]
pub struct StreamStats {
    pub id: Uuid,
    pub path: String,
    pub bytes_read: u64,
    pub buffered_offset: u64,
    pub bytes_per_second: f64,
}

/// Thread-safe registry of active streams. Constructed once at startup and
/// passed by reference; there is deliberately no global instance.
pub struct StreamTracker {
    clocks: Arc<dyn Clocks>,
    streams: Mutex<FastHashMap<Uuid, ActiveStream>>,
}

impl StreamTracker {
    pub fn new(clocks: Arc<dyn Clocks>) -> Self {
        StreamTracker {
            clocks,
            streams: Mutex::new(FastHashMap::default()),
        }
    }

    /// Registers a stream and returns its opaque ID.
    pub fn add(&self, path: &str) -> Uuid {
        let id = Uuid::new_v4();
        let now = self.clocks.monotonic();
        self.streams.lock().unwrap().insert(
            id,
            ActiveStream {
                path: path.to_owned(),
                bytes_read: 0,
                buffered_offset: 0,
                rate: 0.0,
                last_update: now,
            },
        );
        id
    }

    /// Records `delta` freshly delivered bytes.
    pub fn update_progress(&self, id: Uuid, delta: u64) {
        let now = self.clocks.monotonic();
        let mut l = self.streams.lock().unwrap();
        let Some(s) = l.get_mut(&id) else { return };
        s.bytes_read += delta;
        let dt = now.saturating_sub(s.last_update);
        if dt > Duration::ZERO {
            let instantaneous = delta as f64 / dt.as_secs_f64();
            let alpha = 1.0 - (-dt.as_secs_f64() / RATE_TAU.as_secs_f64()).exp();
            s.rate += alpha * (instantaneous - s.rate);
            s.last_update = now;
        }
    }

    pub fn update_buffered_offset(&self, id: Uuid, offset: u64) {
        let mut l = self.streams.lock().unwrap();
        if let Some(s) = l.get_mut(&id) {
            s.buffered_offset = s.buffered_offset.max(offset);
        }
    }

    pub fn remove(&self, id: Uuid) {
        self.streams.lock().unwrap().remove(&id);
    }

    pub fn snapshot(&self) -> Vec<StreamStats> {
        let l = self.streams.lock().unwrap();
        l.iter()
            .map(|(id, s)| StreamStats {
                id: *id,
                path: s.path.clone(),
                bytes_read: s.bytes_read,
                buffered_offset: s.buffered_offset,
                bytes_per_second: s.rate,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;

    #[test]
    fn add_update_remove() {
        let clocks = SimulatedClocks::new();
        let t = StreamTracker::new(Arc::new(clocks.clone()));
        let id = t.add("/movies/a.mkv");
        clocks.advance(Duration::from_secs(1));
        t.update_progress(id, 1_000_000);
        t.update_buffered_offset(id, 2_000_000);
        let stats = t.snapshot();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].path, "/movies/a.mkv");
        assert_eq!(stats[0].bytes_read, 1_000_000);
        assert_eq!(stats[0].buffered_offset, 2_000_000);
        assert!(stats[0].bytes_per_second > 0.0);
        t.remove(id);
        assert!(t.snapshot().is_empty());
    }

    #[test]
    fn rate_converges_to_steady_throughput() {
        let clocks = SimulatedClocks::new();
        let t = StreamTracker::new(Arc::new(clocks.clone()));
        let id = t.add("/f");
        // 1 MiB/s for 30 s.
        for _ in 0..30 {
            clocks.advance(Duration::from_secs(1));
            t.update_progress(id, 1 << 20);
        }
        let rate = t.snapshot()[0].bytes_per_second;
        assert!(
            (rate - (1 << 20) as f64).abs() < (1 << 20) as f64 * 0.05,
            "rate {rate} should be near 1 MiB/s"
        );
    }

    #[test]
    fn buffered_offset_is_monotonic() {
        let clocks = SimulatedClocks::new();
        let t = StreamTracker::new(Arc::new(clocks));
        let id = t.add("/f");
        t.update_buffered_offset(id, 100);
        t.update_buffered_offset(id, 50);
        assert_eq!(t.snapshot()[0].buffered_offset, 100);
    }
}
