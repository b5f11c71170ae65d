// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Strategic sampling verifier.
//!
//! Checking every segment of a large file is wasteful; missing articles
//! cluster at the start (propagation failures) and end (takedowns), so the
//! sample always covers both plus a random spread of the middle.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::index::sample as sample_indices;
use tokio::task::JoinSet;
use tracing::debug;

use base::{err, Error};
use metadata::SegmentDesc;

use crate::pool::ArticlePool;

/// Always-checked deterministic prefix and suffix.
const PREFIX_SAMPLES: usize = 3;
const SUFFIX_SAMPLES: usize = 2;

const MIN_SAMPLES: usize = 5;
/// Cap so huge files don't take minutes to verify.
const MAX_SAMPLES: usize = 55;

/// At most this many missing IDs are reported back.
const MISSING_ID_CAP: usize = 50;

#[derive(Clone, Debug)]
pub struct ValidationConfig {
    /// Percentage of segments to sample, before min/max clamping.
    pub sample_percent: f64,
    /// Fetch a body probe instead of a stat; catches providers that index
    /// an article but can no longer serve it.
    pub deep: bool,
    pub max_workers: usize,
    pub per_segment_timeout: Duration,
    /// Stop at the first missing segment instead of aggregating.
    pub fail_fast: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            sample_percent: 5.0,
            deep: false,
            max_workers: 10,
            per_segment_timeout: Duration::from_secs(10),
            fail_fast: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub total_checked: usize,
    pub missing_count: usize,
    /// Capped at [`MISSING_ID_CAP`] entries.
    pub missing_ids: Vec<String>,
}

impl ValidationReport {
    pub fn is_healthy(&self) -> bool {
        self.missing_count == 0
    }
}

/// Picks the indices to check: first [`PREFIX_SAMPLES`], last
/// [`SUFFIX_SAMPLES`], and a random middle sample to reach the target
/// count.
fn select_samples(n: usize, sample_percent: f64) -> Vec<usize> {
    if n == 0 {
        return vec![];
    }
    let target = ((n as f64 * sample_percent / 100.0).round() as usize)
        .clamp(MIN_SAMPLES, MAX_SAMPLES)
        .min(n);
    if target >= n {
        return (0..n).collect();
    }
    let mut picked: Vec<usize> = (0..PREFIX_SAMPLES.min(n)).collect();
    picked.extend(n.saturating_sub(SUFFIX_SAMPLES)..n);
    picked.sort_unstable();
    picked.dedup();
    let middle_lo = PREFIX_SAMPLES.min(n);
    let middle_hi = n.saturating_sub(SUFFIX_SAMPLES);
    if picked.len() < target && middle_lo < middle_hi {
        let want = (target - picked.len()).min(middle_hi - middle_lo);
        let mut rng = rand::thread_rng();
        for i in sample_indices(&mut rng, middle_hi - middle_lo, want) {
            picked.push(middle_lo + i);
        }
        picked.sort_unstable();
        picked.dedup();
    }
    picked
}

async fn check_one(
    pool: Arc<dyn ArticlePool>,
    seg: SegmentDesc,
    deep: bool,
    timeout: Duration,
) -> Result<bool, Error> {
    let fut = async {
        if deep {
            let mut probe = Vec::new();
            match pool.body(&seg.message_id, &seg.groups, &mut probe).await {
                Ok(()) => Ok(!probe.is_empty()),
                Err(crate::pool::FetchError::NotFound { .. }) => Ok(false),
                Err(e) => Err(err!(Unavailable, msg("probe failed"), source(e))),
            }
        } else {
            match pool.stat(&seg.message_id, &seg.groups).await {
                Ok(present) => Ok(present),
                Err(crate::pool::FetchError::NotFound { .. }) => Ok(false),
                Err(e) => Err(err!(Unavailable, msg("stat failed"), source(e))),
            }
        }
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(err!(
            DeadlineExceeded,
            msg("segment {} check timed out", seg.message_id)
        )),
    }
}

/// Checks availability of a sampled subset of `segments`.
///
/// Check errors (timeouts, pool trouble) propagate; a clean run returns the
/// aggregate report. In `fail_fast` mode the report is returned as soon as
/// the first missing segment is seen.
pub async fn validate(
    pool: Arc<dyn ArticlePool>,
    segments: &[SegmentDesc],
    config: &ValidationConfig,
) -> Result<ValidationReport, Error> {
    let samples = select_samples(segments.len(), config.sample_percent);
    debug!(
        segments = segments.len(),
        sampled = samples.len(),
        deep = config.deep,
        "validating"
    );
    let mut tasks = JoinSet::new();
    let mut report = ValidationReport::default();
    let mut first_err = None;
    let mut samples = samples.into_iter();
    let mut in_flight = 0usize;
    loop {
        while in_flight < config.max_workers.max(1) {
            let Some(i) = samples.next() else { break };
            let pool = pool.clone();
            let seg = segments[i].clone();
            let deep = config.deep;
            let timeout = config.per_segment_timeout;
            let id = seg.message_id.clone();
            tasks.spawn(async move { (id, check_one(pool, seg, deep, timeout).await) });
            in_flight += 1;
        }
        let Some(joined) = tasks.join_next().await else {
            break;
        };
        in_flight -= 1;
        let (id, result) = joined.map_err(|e| err!(Internal, msg("check task failed"), source(e)))?;
        report.total_checked += 1;
        match result {
            Ok(true) => {}
            Ok(false) => {
                report.missing_count += 1;
                if report.missing_ids.len() < MISSING_ID_CAP {
                    report.missing_ids.push(id);
                }
                if config.fail_fast {
                    tasks.abort_all();
                    return Ok(report);
                }
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(report),
    }
}
