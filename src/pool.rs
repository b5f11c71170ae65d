// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The connection-pool seam.
//!
//! Transport (NNTP sessions, provider selection, reconnects) lives behind
//! [`ArticlePool`]; this crate only distinguishes the error classes that
//! change its own behavior. Readers obtain the pool through a [`PoolGetter`]
//! on every download attempt and never hold a reference across attempts, so
//! the pool can be hot-swapped on configuration reload.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// Error from a pool operation.
#[derive(Debug)]
pub enum FetchError {
    /// The article is missing from every configured provider. Permanent;
    /// never retried.
    NotFound { message_id: String },

    /// The operation was cancelled from the consumer side.
    Cancelled,

    /// The consumer went away mid-transfer.
    ClosedPipe,

    /// Timeouts, disconnects, throttling: anything worth another attempt.
    Transient(base::Error),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::NotFound { message_id } => {
                write!(f, "article {message_id} not found in any provider")
            }
            FetchError::Cancelled => f.write_str("cancelled"),
            FetchError::ClosedPipe => f.write_str("closed pipe"),
            FetchError::Transient(e) => write!(f, "transient pool error: {}", e.chain()),
        }
    }
}

impl std::error::Error for FetchError {}

/// A multi-provider article source.
#[async_trait]
pub trait ArticlePool: Send + Sync + 'static {
    /// Appends the decoded body of the article to `out`.
    async fn body(
        &self,
        message_id: &str,
        groups: &[String],
        out: &mut Vec<u8>,
    ) -> Result<(), FetchError>;

    /// Checks whether any provider has the article, without transferring the
    /// body.
    async fn stat(&self, message_id: &str, groups: &[String]) -> Result<bool, FetchError>;
}

/// Produces the current pool; called once per download attempt.
pub type PoolGetter = Arc<dyn Fn() -> Arc<dyn ArticlePool> + Send + Sync>;

/// Wraps a fixed pool in a [`PoolGetter`].
pub fn static_pool(pool: Arc<dyn ArticlePool>) -> PoolGetter {
    Arc::new(move || pool.clone())
}

/// Stand-in pool used when no provider transport is wired up: every
/// operation fails transiently. The filesystem stays browsable; reads
/// error.
pub struct UnconfiguredPool;

#[async_trait]
impl ArticlePool for UnconfiguredPool {
    async fn body(
        &self,
        message_id: &str,
        _groups: &[String],
        _out: &mut Vec<u8>,
    ) -> Result<(), FetchError> {
        Err(FetchError::Transient(base::err!(
            Unavailable,
            msg("no providers configured; cannot fetch {message_id}")
        )))
    }

    async fn stat(&self, message_id: &str, _groups: &[String]) -> Result<bool, FetchError> {
        Err(FetchError::Transient(base::err!(
            Unavailable,
            msg("no providers configured; cannot stat {message_id}")
        )))
    }
}
