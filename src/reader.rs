// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Concurrent download management for one mapped byte range.
//!
//! A [`RangedReader`] owns a [`SegmentRange`] and a bounded pool of download
//! workers. Workers fetch article bodies in parallel and may complete out of
//! order; the consumer side always delivers bytes in strict file order by
//! draining segments sequentially. Each worker downloads into a scratch
//! buffer and hands the finished body to the segment in a single call, so
//! the pool connection is released before the segment is touched.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base::shutdown;
use rand::Rng as _;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::pool::{FetchError, PoolGetter};
use crate::segment::{Segment, SegmentRange};

pub const DEFAULT_WORKERS: usize = 15;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(15);
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// How long [`RangedReader::close`] waits for workers before giving up and
/// releasing resources anyway.
const CLOSE_DEADLINE: Duration = Duration::from_secs(30);

/// A permanent failure observed while delivering bytes.
///
/// `bytes_read` counts bytes already delivered to the consumer before the
/// failure: zero means the content is wholly unavailable, nonzero means
/// partial content.
#[derive(Debug)]
pub struct DataCorruption {
    pub message_id: String,
    pub bytes_read: u64,
    /// True when the article is missing from every provider; false when
    /// retries were merely exhausted.
    pub no_retry: bool,
}

impl fmt::Display for DataCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "data corruption at article {} after {} bytes (no_retry={})",
            self.message_id, self.bytes_read, self.no_retry
        )
    }
}

impl std::error::Error for DataCorruption {}

/// Error from [`RangedReader::read`] and the cipher layers above it.
#[derive(Debug)]
pub enum ReadError {
    Corruption(DataCorruption),
    Cancelled,
    Internal(base::Error),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Corruption(c) => fmt::Display::fmt(c, f),
            ReadError::Cancelled => f.write_str("read cancelled"),
            ReadError::Internal(e) => write!(f, "{}", e.chain()),
        }
    }
}

impl std::error::Error for ReadError {}

/// Byte source delivering one mapped (and possibly decrypted) range in file
/// order. Implemented by [`RangedReader`] and the cipher wrappers.
#[async_trait::async_trait]
pub trait RangeRead: Send {
    /// Reads some bytes into `out`; `Ok(0)` is end of range.
    async fn read(&mut self, out: &mut [u8]) -> Result<usize, ReadError>;

    /// Releases workers and buffers. Idempotent.
    async fn close(&mut self);

    /// Begins downloading before the first read, to cut time-to-first-byte.
    fn start(&mut self) {}

    /// Exclusive upper bound of the file region covered by dispatched
    /// downloads; the reader can deliver up to here without new fetches.
    fn buffered_offset(&self) -> u64 {
        0
    }
}

pub struct RangedReader {
    range: Arc<SegmentRange>,
    pool_getter: PoolGetter,
    max_workers: usize,
    bytes_read: u64,
    buffered_offset: Arc<AtomicU64>,
    /// Dropping this cancels the manager and all workers.
    cancel: Option<shutdown::Sender>,
    cancel_rx: shutdown::Receiver,
    manager: Option<tokio::task::JoinHandle<()>>,
    closed: bool,
}

impl RangedReader {
    pub fn new(range: SegmentRange, pool_getter: PoolGetter, max_workers: usize) -> Self {
        let (cancel, cancel_rx) = shutdown::channel();
        RangedReader {
            range: Arc::new(range),
            pool_getter,
            max_workers: max_workers.max(DEFAULT_WORKERS),
            bytes_read: 0,
            buffered_offset: Arc::new(AtomicU64::new(0)),
            cancel: Some(cancel),
            cancel_rx,
            manager: None,
            closed: false,
        }
    }

    /// Spawns the download manager if it isn't running yet. Called from
    /// `start` and from the first `read`, whichever comes first.
    fn ensure_started(&mut self) {
        if self.manager.is_some() || self.closed {
            return;
        }
        let segments = self.range.snapshot();
        if segments.is_empty() {
            return;
        }
        debug!(
            segments = segments.len(),
            start = self.range.start(),
            end = self.range.end(),
            "starting download manager"
        );
        self.manager = Some(tokio::spawn(download_manager(
            segments,
            self.pool_getter.clone(),
            self.max_workers,
            self.cancel_rx.clone(),
            self.buffered_offset.clone(),
        )));
    }
}

#[async_trait::async_trait]
impl RangeRead for RangedReader {
    async fn read(&mut self, out: &mut [u8]) -> Result<usize, ReadError> {
        if self.closed {
            return Err(ReadError::Cancelled);
        }
        if out.is_empty() {
            return Ok(0);
        }
        self.ensure_started();
        loop {
            let Some(seg) = self.range.get() else {
                return Ok(0);
            };
            match seg.read(out).await {
                Ok(0) => {
                    if self.range.next().is_none() {
                        return Ok(0);
                    }
                }
                Ok(n) => {
                    self.bytes_read += n as u64;
                    return Ok(n);
                }
                Err(e) => {
                    return Err(match &*e {
                        FetchError::NotFound { message_id } => {
                            ReadError::Corruption(DataCorruption {
                                message_id: message_id.clone(),
                                bytes_read: self.bytes_read,
                                no_retry: true,
                            })
                        }
                        FetchError::Transient(_) => ReadError::Corruption(DataCorruption {
                            message_id: seg.message_id().to_owned(),
                            bytes_read: self.bytes_read,
                            no_retry: false,
                        }),
                        FetchError::Cancelled | FetchError::ClosedPipe => ReadError::Cancelled,
                    });
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Cancel first, then unblock anything waiting on a segment.
        drop(self.cancel.take());
        self.range.close_with_error(FetchError::ClosedPipe);
        if let Some(manager) = self.manager.take() {
            if tokio::time::timeout(CLOSE_DEADLINE, manager).await.is_err() {
                warn!(
                    "download workers did not drain within {CLOSE_DEADLINE:?}; \
                     releasing resources anyway"
                );
            }
        }
        self.range.clear();
    }

    fn start(&mut self) {
        self.ensure_started();
    }

    fn buffered_offset(&self) -> u64 {
        self.buffered_offset.load(Ordering::Acquire)
    }
}

impl Drop for RangedReader {
    fn drop(&mut self) {
        // Dropping the sender cancels the manager; segments are closed so
        // workers writing to them bail out promptly.
        self.range.close_with_error(FetchError::ClosedPipe);
    }
}

/// Dispatches one download task per segment, bounded by `max_workers`
/// concurrent tasks. Ordering on the consumer side comes from the segment
/// sequence, not from task completion order.
async fn download_manager(
    segments: Vec<Arc<Segment>>,
    pool_getter: PoolGetter,
    max_workers: usize,
    cancel_rx: shutdown::Receiver,
    buffered_offset: Arc<AtomicU64>,
) {
    let sem = Arc::new(Semaphore::new(max_workers));
    let mut tasks = JoinSet::new();
    for seg in segments {
        let permit = tokio::select! {
            _ = cancel_rx.as_future() => break,
            p = sem.clone().acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        buffered_offset.fetch_max(seg.file_end() + 1, Ordering::AcqRel);
        let pool_getter = pool_getter.clone();
        let cancel_rx = cancel_rx.clone();
        tasks.spawn(async move {
            let _permit = permit;
            download_segment(seg, pool_getter, cancel_rx).await;
        });
    }
    while tasks.join_next().await.is_some() {}
}

/// Downloads one segment with retry. Transient errors back off with jitter;
/// cancellation, missing articles, and consumer-side shutdown do not retry.
async fn download_segment(seg: Arc<Segment>, pool_getter: PoolGetter, cancel_rx: shutdown::Receiver) {
    let Some(mut writer) = seg.writer() else {
        return;
    };
    let mut delay = BACKOFF_BASE;
    for attempt in 1..=MAX_ATTEMPTS {
        match attempt_fetch(&seg, &pool_getter, &cancel_rx).await {
            Ok(body) => {
                // Single handoff: the pool connection was released when
                // `body` returned, before the segment buffer is touched.
                if writer.write_all(&body).is_err() {
                    return;
                }
                writer.close();
                return;
            }
            Err(e) if !e.is_retryable() || attempt == MAX_ATTEMPTS => {
                if !matches!(e, FetchError::Cancelled | FetchError::ClosedPipe) {
                    warn!(
                        message_id = seg.message_id(),
                        attempt, err = %e, "segment download failed permanently"
                    );
                }
                writer.close_with_error(e);
                return;
            }
            Err(e) => {
                debug!(
                    message_id = seg.message_id(),
                    attempt, err = %e, "segment download failed; retrying"
                );
                let jittered = {
                    let ms = delay.as_millis() as u64;
                    Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms))
                };
                tokio::time::sleep(jittered).await;
                delay = (delay * 2).min(BACKOFF_MAX);
            }
        }
    }
}

async fn attempt_fetch(
    seg: &Segment,
    pool_getter: &PoolGetter,
    cancel_rx: &shutdown::Receiver,
) -> Result<Vec<u8>, FetchError> {
    if cancel_rx.check().is_err() {
        return Err(FetchError::Cancelled);
    }
    let pool = (pool_getter)();
    let mut buf = Vec::new();
    let r = tokio::select! {
        biased;
        _ = cancel_rx.as_future() => Err(FetchError::Cancelled),
        r = pool.body(seg.message_id(), seg.groups(), &mut buf) => r,
    };
    r.map(|()| buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper;
    use crate::pool::static_pool;
    use crate::testutil::{self, MockPool};

    async fn read_all(r: &mut RangedReader) -> Result<Vec<u8>, ReadError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 300];
        loop {
            match r.read(&mut buf).await? {
                0 => return Ok(out),
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    #[tokio::test]
    async fn delivers_in_file_order() {
        testutil::init();
        let (pool, content) = MockPool::with_file(3000, 1000);
        let meta = metadata::testutil::sample_meta(3000, 1000);
        let range = mapper::select(0, 2999, &meta);
        let mut r = RangedReader::new(range, static_pool(Arc::new(pool)), 4);
        assert_eq!(read_all(&mut r).await.unwrap(), content);
        r.close().await;
    }

    #[tokio::test]
    async fn ranged_read_spans_segments() {
        testutil::init();
        let (pool, content) = MockPool::with_file(3000, 1000);
        let meta = metadata::testutil::sample_meta(3000, 1000);
        let range = mapper::select(500, 1499, &meta);
        let mut r = RangedReader::new(range, static_pool(Arc::new(pool)), 4);
        assert_eq!(read_all(&mut r).await.unwrap(), &content[500..1500]);
        r.close().await;
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        testutil::init();
        let (pool, content) = MockPool::with_file(2000, 1000);
        pool.fail_transiently("<seg-1@test>", 3);
        let meta = metadata::testutil::sample_meta(2000, 1000);
        let range = mapper::select(0, 1999, &meta);
        let mut r = RangedReader::new(range, static_pool(Arc::new(pool)), 4);
        assert_eq!(read_all(&mut r).await.unwrap(), content);
        r.close().await;
    }

    #[tokio::test]
    async fn missing_article_is_partial_content() {
        testutil::init();
        let (pool, content) = MockPool::with_file(3000, 1000);
        pool.remove("<seg-2@test>");
        let meta = metadata::testutil::sample_meta(3000, 1000);
        let range = mapper::select(0, 2999, &meta);
        let mut r = RangedReader::new(range, static_pool(Arc::new(pool)), 4);
        let mut delivered = Vec::new();
        let mut buf = [0u8; 300];
        let err = loop {
            match r.read(&mut buf).await {
                Ok(0) => panic!("expected a corruption error"),
                Ok(n) => delivered.extend_from_slice(&buf[..n]),
                Err(e) => break e,
            }
        };
        match err {
            ReadError::Corruption(c) => {
                assert_eq!(c.bytes_read, 2000);
                assert!(c.no_retry);
                assert_eq!(c.message_id, "<seg-2@test>");
            }
            other => panic!("unexpected {other}"),
        }
        // Everything delivered before the failure was correct.
        assert_eq!(delivered, &content[..2000]);
        r.close().await;
    }

    #[tokio::test]
    async fn missing_first_article_reports_zero_bytes() {
        testutil::init();
        let (pool, _content) = MockPool::with_file(3000, 1000);
        pool.remove("<seg-0@test>");
        let meta = metadata::testutil::sample_meta(3000, 1000);
        let range = mapper::select(0, 2999, &meta);
        let mut r = RangedReader::new(range, static_pool(Arc::new(pool)), 4);
        match read_all(&mut r).await.unwrap_err() {
            ReadError::Corruption(c) => assert_eq!(c.bytes_read, 0),
            other => panic!("unexpected {other}"),
        }
        r.close().await;
    }

    #[tokio::test]
    async fn exhausted_retries_report_retryable_corruption() {
        testutil::init();
        let (pool, _content) = MockPool::with_file(1000, 1000);
        pool.fail_transiently("<seg-0@test>", 100);
        let meta = metadata::testutil::sample_meta(1000, 1000);
        let range = mapper::select(0, 999, &meta);
        let mut r = RangedReader::new(range, static_pool(Arc::new(pool)), 4);
        match read_all(&mut r).await.unwrap_err() {
            ReadError::Corruption(c) => assert!(!c.no_retry),
            other => panic!("unexpected {other}"),
        }
        r.close().await;
    }

    #[tokio::test]
    async fn empty_range_is_immediate_eof() {
        testutil::init();
        let (pool, _content) = MockPool::with_file(1000, 1000);
        let meta = metadata::testutil::sample_meta(1000, 1000);
        let range = mapper::select(5000, 6000, &meta);
        let mut r = RangedReader::new(range, static_pool(Arc::new(pool)), 4);
        assert_eq!(read_all(&mut r).await.unwrap(), Vec::<u8>::new());
        r.close().await;
    }

    #[tokio::test]
    async fn buffered_offset_advances() {
        testutil::init();
        let (pool, _content) = MockPool::with_file(3000, 1000);
        let meta = metadata::testutil::sample_meta(3000, 1000);
        let range = mapper::select(0, 2999, &meta);
        let mut r = RangedReader::new(range, static_pool(Arc::new(pool)), 4);
        assert_eq!(r.buffered_offset(), 0);
        let _ = read_all(&mut r).await.unwrap();
        assert_eq!(r.buffered_offset(), 3000);
        r.close().await;
    }

    #[tokio::test]
    async fn close_cancels_stalled_download() {
        testutil::init();
        let (pool, _content) = MockPool::with_file(2000, 1000);
        pool.stall("<seg-0@test>");
        let meta = metadata::testutil::sample_meta(2000, 1000);
        let range = mapper::select(0, 1999, &meta);
        let mut r = RangedReader::new(range, static_pool(Arc::new(pool)), 4);
        r.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The worker is blocked in `body`; close must cancel it and return
        // well before the 30 s deadline.
        tokio::time::timeout(Duration::from_secs(5), r.close())
            .await
            .expect("close should not wait for the stalled fetch");
        // After close, reads fail rather than block.
        let mut buf = [0u8; 16];
        assert!(matches!(
            r.read(&mut buf).await.unwrap_err(),
            ReadError::Cancelled
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        testutil::init();
        let (pool, _content) = MockPool::with_file(1000, 1000);
        let meta = metadata::testutil::sample_meta(1000, 1000);
        let range = mapper::select(0, 999, &meta);
        let mut r = RangedReader::new(range, static_pool(Arc::new(pool)), 4);
        r.close().await;
        r.close().await;
    }
}
