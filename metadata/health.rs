// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hooks into the health repository.
//!
//! The repository itself (persistence, repair scheduling) lives outside this
//! crate; the filesystem layer only reports through this trait.

use tracing::debug;

/// Receives corruption reports and rename notifications from the filesystem
/// layer.
pub trait HealthReporter: Send + Sync + 'static {
    /// Records that `path` served corrupt or missing data. `no_retry` marks
    /// permanent failures (article missing from every provider).
    fn record_corruption(&self, path: &str, source_nzb: Option<&str>, no_retry: bool);

    /// Drops any health record for `path` (called when a rename claims the
    /// destination path).
    fn drop_record(&self, path: &str);

    /// Resolves "pending repair" records under `dir` (called after a rename
    /// into a library directory, when so configured).
    fn resolve_pending_repair(&self, dir: &str);
}

/// Discards all reports; the default when no health repository is wired up.
pub struct NoopHealth;

impl HealthReporter for NoopHealth {
    fn record_corruption(&self, path: &str, _source_nzb: Option<&str>, no_retry: bool) {
        debug!(path, no_retry, "corruption reported (no health repository)");
    }

    fn drop_record(&self, _path: &str) {}

    fn resolve_pending_repair(&self, _dir: &str) {}
}
