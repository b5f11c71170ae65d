// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Metadata describing virtual files: which articles make up each file, how
//! big it is, and how (if at all) its contents are encrypted.
//!
//! The [`MetadataStore`] trait is the seam between the filesystem layer and
//! whatever holds this metadata; [`store::DiskStore`] is the standard
//! JSON-sidecar implementation, and [`testutil::MemStore`] backs tests.

use serde::{Deserialize, Serialize};

pub mod health;
pub mod store;
pub mod testutil;

pub use store::{DiskStore, MetadataStore};

/// Health of a virtual file, as recorded in its metadata document.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Healthy,
    Partial,
    Corrupted,
}

/// How a file's plaintext is recovered from the joined article bodies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Encryption {
    None,

    /// XSalsa20 with an scrypt-derived key. Two layouts exist historically:
    /// `whole_file = true` encrypts everything; otherwise only the first and
    /// last 750000 bytes are encrypted (small files end-to-end).
    Stream {
        /// Password for key derivation. When absent, the globally configured
        /// default applies.
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        salt: Option<String>,
        /// 24-byte per-file nonce.
        nonce: Vec<u8>,
        #[serde(default)]
        whole_file: bool,
    },

    /// AES-CBC with a 128/192/256-bit key and a 16-byte IV.
    AesCbc { key: Vec<u8>, iv: Vec<u8> },
}

/// One article of a virtual file.
///
/// `start`/`end` delimit the usable region within the decoded article body:
/// `start` bytes of leading overhead are skipped and `end` is the inclusive
/// offset of the last byte that belongs to the file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentDesc {
    pub message_id: String,

    /// Newsgroups the article was posted to, if known. Purely a hint for the
    /// connection pool.
    #[serde(default)]
    pub groups: Vec<String>,

    pub start: u64,
    pub end: u64,

    /// Decoded size of the whole article body.
    pub size: u64,
}

impl SegmentDesc {
    /// Number of bytes this segment contributes to the file.
    pub fn usable(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }
}

/// Everything known about one virtual file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Logical (plaintext) size in bytes.
    pub file_size: u64,

    pub mtime: jiff::Timestamp,

    pub status: FileStatus,

    pub encryption: Encryption,

    /// In file order.
    pub segments: Vec<SegmentDesc>,

    /// Path of the `.nzb` document this file was imported from, for health
    /// reporting and optional source deletion.
    #[serde(default)]
    pub source_nzb: Option<String>,
}

impl FileMetadata {
    /// Size of the stored (possibly encrypted) byte stream, i.e. the sum of
    /// the segments' usable bytes.
    pub fn stored_size(&self) -> u64 {
        self.segments.iter().map(SegmentDesc::usable).sum()
    }
}

/// A directory listing entry as returned by the filesystem facade.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub mode: u32,
}

/// Stat result for one path.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mtime: jiff::Timestamp,
    pub is_dir: bool,
    pub status: FileStatus,
}

/// Returns the parent of a normalized virtual path (`/a/b` -> `/a`,
/// `/a` -> `/`).
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Returns the final component of a normalized virtual path.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Normalizes a virtual path: leading `/`, no trailing `/` (except the root
/// itself), empty components removed.
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for component in path.split('/') {
        if component.is_empty() || component == "." {
            continue;
        }
        out.push('/');
        out.push_str(component);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_usable() {
        let s = SegmentDesc {
            message_id: "a@b".to_owned(),
            groups: vec![],
            start: 10,
            end: 19,
            size: 25,
        };
        assert_eq!(s.usable(), 10);
        let empty = SegmentDesc { start: 5, end: 4, ..s };
        assert_eq!(empty.usable(), 0);
    }

    #[test]
    fn path_helpers() {
        assert_eq!(normalize("a/b/"), "/a/b");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("//x//y"), "/x/y");
        assert_eq!(parent("/a/b"), "/a");
        assert_eq!(parent("/a"), "/");
        assert_eq!(file_name("/a/b.mkv"), "b.mkv");
    }

    #[test]
    fn metadata_round_trips_through_json() {
        let m = FileMetadata {
            file_size: 3000,
            mtime: jiff::Timestamp::UNIX_EPOCH,
            status: FileStatus::Healthy,
            encryption: Encryption::AesCbc {
                key: vec![0u8; 32],
                iv: vec![0u8; 16],
            },
            segments: vec![SegmentDesc {
                message_id: "a@b".to_owned(),
                groups: vec!["alt.binaries.test".to_owned()],
                start: 0,
                end: 2999,
                size: 3100,
            }],
            source_nzb: Some("/imports/a.nzb".to_owned()),
        };
        let s = serde_json::to_string(&m).unwrap();
        assert_eq!(serde_json::from_str::<FileMetadata>(&s).unwrap(), m);
    }
}
