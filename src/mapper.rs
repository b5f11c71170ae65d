// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Pure translation of a logical byte range into a [`SegmentRange`].
//!
//! No I/O and no state: after a seek invalidates a reader, the mapper is
//! simply re-run for the new range.

use std::sync::Arc;

use metadata::SegmentDesc;

use crate::segment::{Segment, SegmentRange};

/// Supplies segment descriptors in file order.
pub trait SegmentLoader {
    fn segment_count(&self) -> usize;
    fn segment(&self, i: usize) -> Option<SegmentDesc>;
}

impl SegmentLoader for [SegmentDesc] {
    fn segment_count(&self) -> usize {
        self.len()
    }
    fn segment(&self, i: usize) -> Option<SegmentDesc> {
        self.get(i).cloned()
    }
}

impl SegmentLoader for metadata::FileMetadata {
    fn segment_count(&self) -> usize {
        self.segments.len()
    }
    fn segment(&self, i: usize) -> Option<SegmentDesc> {
        self.segments.get(i).cloned()
    }
}

/// Selects the segments covering `[start, end]` (inclusive).
///
/// A request past the end of the data yields an empty range; one partially
/// past the end is clipped to the last segment.
pub fn select<L: SegmentLoader + ?Sized>(start: u64, end: u64, loader: &L) -> SegmentRange {
    select_from_index(start, end, loader, 0, 0)
}

/// Like [`select`], but skips ahead: segment `start_index` is known to begin
/// at logical offset `start_file_pos`. With an offset index of cumulative
/// usable lengths this makes a seek O(1) instead of a rescan. Negative
/// `start_index` is clamped to 0. The result is identical to a full scan
/// when `start_index == 0 && start_file_pos == 0`.
pub fn select_from_index<L: SegmentLoader + ?Sized>(
    start: u64,
    end: u64,
    loader: &L,
    start_index: isize,
    start_file_pos: u64,
) -> SegmentRange {
    if end < start {
        return SegmentRange::empty(start, end);
    }
    let mut logical = start_file_pos;
    let mut out = Vec::new();
    for i in start_index.max(0) as usize..loader.segment_count() {
        let Some(d) = loader.segment(i) else { break };
        let usable = d.usable();
        if usable == 0 {
            continue;
        }
        let seg_lo = logical;
        let seg_hi = logical + usable - 1;
        logical += usable;
        if seg_hi < start {
            continue;
        }
        if seg_lo > end {
            break;
        }
        let skip = start.saturating_sub(seg_lo);
        let take_hi = (end - seg_lo).min(usable - 1);
        out.push(Arc::new(Segment::new(
            d.message_id,
            d.groups,
            d.start + skip,
            d.start + take_hi,
            d.size,
            seg_lo + skip,
            seg_lo + take_hi,
        )));
        if seg_hi >= end {
            break;
        }
    }
    SegmentRange::new(out, start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descs(sizes: &[u64]) -> Vec<SegmentDesc> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &s)| SegmentDesc {
                message_id: format!("<seg-{i}@test>"),
                groups: vec![],
                start: 0,
                end: s - 1,
                size: s,
            })
            .collect()
    }

    fn covered(r: &SegmentRange) -> Vec<(String, u64, u64)> {
        (0..r.len())
            .map(|i| {
                let s = r.get_segment(i).unwrap();
                (s.message_id().to_owned(), s.file_start(), s.file_end())
            })
            .collect()
    }

    #[test]
    fn whole_file() {
        let d = descs(&[1000, 1000, 1000]);
        let r = select(0, 2999, &d[..]);
        assert_eq!(
            covered(&r),
            vec![
                ("<seg-0@test>".to_owned(), 0, 999),
                ("<seg-1@test>".to_owned(), 1000, 1999),
                ("<seg-2@test>".to_owned(), 2000, 2999),
            ]
        );
        // No gaps, no overlaps, usable bytes sum to the request length.
        let total: u64 = (0..r.len())
            .map(|i| r.get_segment(i).unwrap().usable())
            .sum();
        assert_eq!(total, 3000);
    }

    #[test]
    fn spans_boundary_with_trim() {
        let d = descs(&[1000, 1000, 1000]);
        let r = select(500, 1499, &d[..]);
        assert_eq!(r.len(), 2);
        let a = r.get_segment(0).unwrap();
        assert_eq!((a.file_start(), a.file_end(), a.usable()), (500, 999, 500));
        let b = r.get_segment(1).unwrap();
        assert_eq!((b.file_start(), b.file_end(), b.usable()), (1000, 1499, 500));
    }

    #[test]
    fn honors_internal_offsets() {
        // Usable regions [10, 109] within 120-byte bodies: 100 usable each.
        let d: Vec<SegmentDesc> = (0..2)
            .map(|i| SegmentDesc {
                message_id: format!("<seg-{i}@test>"),
                groups: vec![],
                start: 10,
                end: 109,
                size: 120,
            })
            .collect();
        let r = select(150, 199, &d[..]);
        assert_eq!(r.len(), 1);
        let s = r.get_segment(0).unwrap();
        assert_eq!(s.message_id(), "<seg-1@test>");
        // Logical 150 is usable byte 50 of segment 1, i.e. body offset 60.
        assert_eq!((s.file_start(), s.file_end()), (150, 199));
        assert_eq!(s.usable(), 50);
    }

    #[test]
    fn single_byte_at_boundary_picks_owning_segment() {
        let d = descs(&[1000, 1000, 1000]);
        let r = select(1000, 1000, &d[..]);
        assert_eq!(r.len(), 1);
        assert_eq!(r.get_segment(0).unwrap().message_id(), "<seg-1@test>");
        let r = select(999, 999, &d[..]);
        assert_eq!(r.get_segment(0).unwrap().message_id(), "<seg-0@test>");
    }

    #[test]
    fn past_end_is_empty() {
        let d = descs(&[1000, 1000]);
        assert!(select(2000, 2999, &d[..]).is_empty());
        assert!(select(5000, 5000, &d[..]).is_empty());
    }

    #[test]
    fn partially_past_end_is_clipped() {
        let d = descs(&[1000, 1000]);
        let r = select(1500, 9999, &d[..]);
        assert_eq!(r.len(), 1);
        let s = r.get_segment(0).unwrap();
        assert_eq!((s.file_start(), s.file_end()), (1500, 1999));
    }

    #[test]
    fn zero_usable_segments_excluded() {
        let mut d = descs(&[1000, 1000]);
        d.insert(
            1,
            SegmentDesc {
                message_id: "<empty@test>".to_owned(),
                groups: vec![],
                start: 5,
                end: 4,
                size: 10,
            },
        );
        let r = select(0, 1999, &d[..]);
        assert_eq!(r.len(), 2);
        assert_eq!(r.get_segment(1).unwrap().message_id(), "<seg-1@test>");
    }

    #[test]
    fn from_index_matches_full_scan() {
        let d = descs(&[700, 300, 1000, 500]);
        let full = select(1100, 2200, &d[..]);
        // Segment 2 begins at logical offset 1000.
        let skipped = select_from_index(1100, 2200, &d[..], 2, 1000);
        assert_eq!(covered(&full), covered(&skipped));
        // Negative start index is clamped.
        let clamped = select_from_index(1100, 2200, &d[..], -3, 0);
        assert_eq!(covered(&full), covered(&clamped));
    }
}
