// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory segments and ordered segment ranges.
//!
//! A [`Segment`] is the producer/consumer meeting point for one article: a
//! download worker fills its buffer through a [`SegmentWriter`], and the
//! ranged reader consumes the trimmed usable region in file order. The whole
//! body is buffered before the consumer sees any of it; this releases the
//! network connection as soon as the transfer ends, so an out-of-order
//! completion can never block holding a connection another worker needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::pool::FetchError;

/// Floor for the lazily-allocated body buffer; typical Usenet articles
/// decode to ~700 KiB.
const MIN_BUFFER_CAPACITY: usize = 768 << 10;

#[derive(Default)]
struct SegmentState {
    buf: Vec<u8>,
    allocated: bool,
    /// Producer finished (successfully or with `err`). Signaled once.
    ready: bool,
    /// Segment shut down; further reads/writes fail with "closed pipe".
    closed: bool,
    /// First-write-wins download error.
    err: Option<Arc<FetchError>>,
    /// Consumer cursor within the usable region.
    read_pos: u64,
}

struct SegmentInner {
    state: Mutex<SegmentState>,
    ready_tx: watch::Sender<bool>,
}

impl SegmentInner {
    fn signal_ready(&self) {
        self.ready_tx.send_replace(true);
    }
}

/// One article of a mapped range.
///
/// `start`/`end` are the trimmed usable region within the decoded body
/// (inclusive); `file_start`/`file_end` are the logical file offsets that
/// region covers.
pub struct Segment {
    message_id: String,
    groups: Vec<String>,
    start: u64,
    end: u64,
    size: u64,
    file_start: u64,
    file_end: u64,
    writer_taken: AtomicBool,
    inner: Arc<SegmentInner>,
}

impl Segment {
    pub fn new(
        message_id: String,
        groups: Vec<String>,
        start: u64,
        end: u64,
        size: u64,
        file_start: u64,
        file_end: u64,
    ) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Segment {
            message_id,
            groups,
            start,
            end,
            size,
            file_start,
            file_end,
            writer_taken: AtomicBool::new(false),
            inner: Arc::new(SegmentInner {
                state: Mutex::new(SegmentState::default()),
                ready_tx,
            }),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Bytes this segment contributes to the file.
    pub fn usable(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn file_start(&self) -> u64 {
        self.file_start
    }

    pub fn file_end(&self) -> u64 {
        self.file_end
    }

    /// Obtains the producer handle. Returns `None` if it was already taken;
    /// there is exactly one producer per segment lifetime.
    pub fn writer(&self) -> Option<SegmentWriter> {
        if self.writer_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(SegmentWriter {
            inner: self.inner.clone(),
            capacity_hint: self.size as usize,
        })
    }

    /// Reads from the usable region into `out`, first discarding the
    /// leading `start` bytes of the body. Blocks until the producer finishes
    /// or the segment is closed. `Ok(0)` means the usable region is
    /// exhausted.
    ///
    /// A stored download error is returned on every call, even between
    /// successful reads.
    pub async fn read(&self, out: &mut [u8]) -> Result<usize, Arc<FetchError>> {
        let mut rx = self.inner.ready_tx.subscribe();
        loop {
            {
                let mut st = self.inner.state.lock().unwrap();
                if let Some(e) = &st.err {
                    return Err(e.clone());
                }
                if st.closed {
                    return Err(Arc::new(FetchError::ClosedPipe));
                }
                if st.ready {
                    let total = self.usable();
                    if st.read_pos >= total {
                        return Ok(0);
                    }
                    let from = (self.start + st.read_pos) as usize;
                    if from >= st.buf.len() {
                        // Short body: the provider delivered fewer bytes than
                        // the metadata promised.
                        return Err(Arc::new(FetchError::Transient(base::err!(
                            DataLoss,
                            msg(
                                "article {} body is {} bytes, expected at least {}",
                                self.message_id,
                                st.buf.len(),
                                self.end + 1
                            )
                        ))));
                    }
                    let avail = (st.buf.len() - from).min((total - st.read_pos) as usize);
                    let n = avail.min(out.len());
                    out[..n].copy_from_slice(&st.buf[from..from + n]);
                    st.read_pos += n as u64;
                    return Ok(n);
                }
            }
            if rx.changed().await.is_err() {
                return Err(Arc::new(FetchError::ClosedPipe));
            }
        }
    }

    /// Shuts the segment down and releases its buffer. Idempotent; safe
    /// against a concurrent producer, whose writes will fail with "closed
    /// pipe" from then on.
    pub fn close(&self) {
        let mut st = self.inner.state.lock().unwrap();
        st.closed = true;
        st.buf = Vec::new();
        drop(st);
        self.inner.signal_ready();
    }

    /// Like [`close`](Self::close) but also stores `err` (first-write-wins)
    /// so blocked or future readers observe it.
    pub fn close_with_error(&self, err: Arc<FetchError>) {
        let mut st = self.inner.state.lock().unwrap();
        if st.err.is_none() {
            st.err = Some(err);
        }
        st.closed = true;
        st.buf = Vec::new();
        drop(st);
        self.inner.signal_ready();
    }
}

/// Producer handle for one segment.
pub struct SegmentWriter {
    inner: Arc<SegmentInner>,
    capacity_hint: usize,
}

impl SegmentWriter {
    /// Appends `data` to the body buffer, allocating it on first use. Never
    /// blocks.
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), FetchError> {
        let mut st = self.inner.state.lock().unwrap();
        if st.closed || st.ready {
            return Err(FetchError::ClosedPipe);
        }
        if !st.allocated {
            st.buf.reserve(self.capacity_hint.max(MIN_BUFFER_CAPACITY));
            st.allocated = true;
        }
        st.buf.extend_from_slice(data);
        Ok(())
    }

    /// Marks the body complete and wakes the consumer. Idempotent.
    pub fn close(&mut self) {
        let mut st = self.inner.state.lock().unwrap();
        st.ready = true;
        drop(st);
        self.inner.signal_ready();
    }

    /// Marks the download failed. The error is first-write-wins and is
    /// observed by the consumer on every subsequent read.
    pub fn close_with_error(&mut self, err: FetchError) {
        let mut st = self.inner.state.lock().unwrap();
        if st.err.is_none() {
            st.err = Some(Arc::new(err));
        }
        st.ready = true;
        drop(st);
        self.inner.signal_ready();
    }
}

struct RangeInner {
    segments: Vec<Arc<Segment>>,
    current: usize,
}

/// Ordered segments covering one requested byte range.
pub struct SegmentRange {
    inner: Mutex<RangeInner>,
    start: u64,
    end: u64,
}

impl SegmentRange {
    pub fn new(segments: Vec<Arc<Segment>>, start: u64, end: u64) -> Self {
        debug_assert!(segments.windows(2).all(|w| w[0].file_end < w[1].file_start));
        SegmentRange {
            inner: Mutex::new(RangeInner {
                segments,
                current: 0,
            }),
            start,
            end,
        }
    }

    pub fn empty(start: u64, end: u64) -> Self {
        Self::new(Vec::new(), start, end)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current segment, without advancing.
    pub fn get(&self) -> Option<Arc<Segment>> {
        let l = self.inner.lock().unwrap();
        l.segments.get(l.current).cloned()
    }

    /// Closes the current segment (releasing its buffer), advances, and
    /// returns the new current segment.
    pub fn next(&self) -> Option<Arc<Segment>> {
        let mut l = self.inner.lock().unwrap();
        if let Some(cur) = l.segments.get(l.current) {
            cur.close();
        }
        l.current += 1;
        l.segments.get(l.current).cloned()
    }

    pub fn get_segment(&self, i: usize) -> Option<Arc<Segment>> {
        self.inner.lock().unwrap().segments.get(i).cloned()
    }

    /// All segments, for the download manager.
    pub fn snapshot(&self) -> Vec<Arc<Segment>> {
        self.inner.lock().unwrap().segments.clone()
    }

    /// Applies `err` to every segment (used on reader cancellation, to
    /// unblock anything waiting on a body).
    pub fn close_with_error(&self, err: FetchError) {
        let err = Arc::new(err);
        let l = self.inner.lock().unwrap();
        for s in &l.segments {
            s.close_with_error(err.clone());
        }
    }

    /// Closes everything and drops the segment references.
    pub fn clear(&self) {
        let mut l = self.inner.lock().unwrap();
        for s in &l.segments {
            s.close();
        }
        l.segments = Vec::new();
        l.current = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(usable: u64) -> Segment {
        Segment::new(
            "<a@test>".to_owned(),
            vec![],
            0,
            usable - 1,
            usable,
            0,
            usable - 1,
        )
    }

    #[tokio::test]
    async fn read_after_write() {
        let s = seg(5);
        let mut w = s.writer().unwrap();
        w.write_all(b"hello").unwrap();
        w.close();
        let mut buf = [0u8; 8];
        assert_eq!(s.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(s.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trims_start_and_end() {
        // Body "xxhelloyy" with usable region [2, 6].
        let s = Segment::new("<a@test>".to_owned(), vec![], 2, 6, 9, 0, 4);
        let mut w = s.writer().unwrap();
        w.write_all(b"xxhelloyy").unwrap();
        w.close();
        let mut buf = [0u8; 16];
        assert_eq!(s.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(s.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_blocks_until_ready() {
        let s = Arc::new(seg(3));
        let mut w = s.writer().unwrap();
        let s2 = s.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let n = s2.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });
        tokio::task::yield_now().await;
        w.write_all(b"abc").unwrap();
        w.close();
        assert_eq!(reader.await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn error_is_sticky() {
        let s = seg(3);
        let mut w = s.writer().unwrap();
        w.close_with_error(FetchError::NotFound {
            message_id: "<a@test>".to_owned(),
        });
        // First-write-wins: a later close with a different error changes nothing.
        s.close_with_error(Arc::new(FetchError::Cancelled));
        let mut buf = [0u8; 4];
        for _ in 0..2 {
            match &*s.read(&mut buf).await.unwrap_err() {
                FetchError::NotFound { message_id } => assert_eq!(message_id, "<a@test>"),
                other => panic!("unexpected error {other}"),
            }
        }
    }

    #[tokio::test]
    async fn closed_segment_rejects_io() {
        let s = seg(3);
        let mut w = s.writer().unwrap();
        s.close();
        s.close(); // idempotent
        assert!(matches!(
            w.write_all(b"abc").unwrap_err(),
            FetchError::ClosedPipe
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(
            &*s.read(&mut buf).await.unwrap_err(),
            FetchError::ClosedPipe
        ));
    }

    #[test]
    fn writer_handed_out_once() {
        let s = seg(1);
        assert!(s.writer().is_some());
        assert!(s.writer().is_none());
    }

    #[tokio::test]
    async fn range_next_closes_previous() {
        let a = Arc::new(seg(2));
        let b = Arc::new(Segment::new(
            "<b@test>".to_owned(),
            vec![],
            0,
            1,
            2,
            2,
            3,
        ));
        let r = SegmentRange::new(vec![a.clone(), b.clone()], 0, 3);
        assert_eq!(r.get().unwrap().message_id(), "<a@test>");
        let next = r.next().unwrap();
        assert_eq!(next.message_id(), "<b@test>");
        // `a` is now closed.
        let mut w = a.writer().unwrap();
        assert!(w.write_all(b"xy").is_err());
        assert!(r.next().is_none());
    }

    #[tokio::test]
    async fn range_close_with_error_unblocks_reader() {
        let a = Arc::new(seg(2));
        let r = Arc::new(SegmentRange::new(vec![a.clone()], 0, 1));
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 2];
            a.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        r.close_with_error(FetchError::ClosedPipe);
        assert!(matches!(
            &*reader.await.unwrap().unwrap_err(),
            FetchError::ClosedPipe
        ));
    }
}
