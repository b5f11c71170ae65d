// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory metadata store and helpers shared by tests across the
//! workspace.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use base::{err, Error};

use crate::health::HealthReporter;
use crate::{parent, Encryption, FileMetadata, FileStatus, MetadataStore, SegmentDesc};

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests.
pub fn init() {
    INIT.call_once(base::tracing_setup::install_for_tests);
}

/// Builds metadata for an unencrypted file of `file_size` bytes split into
/// segments of `segment_size` usable bytes each, with message IDs
/// `<seg-0@test>`, `<seg-1@test>`, ...
pub fn sample_meta(file_size: u64, segment_size: u64) -> FileMetadata {
    let mut segments = Vec::new();
    let mut off = 0;
    let mut i = 0;
    while off < file_size {
        let usable = segment_size.min(file_size - off);
        segments.push(SegmentDesc {
            message_id: format!("<seg-{i}@test>"),
            groups: vec![],
            start: 0,
            end: usable - 1,
            size: usable,
        });
        off += usable;
        i += 1;
    }
    FileMetadata {
        file_size,
        mtime: jiff::Timestamp::UNIX_EPOCH,
        status: FileStatus::Healthy,
        encryption: Encryption::None,
        segments,
        source_nzb: None,
    }
}

#[derive(Default)]
struct MemInner {
    files: BTreeMap<String, FileMetadata>,
    dirs: BTreeSet<String>,
}

/// An in-memory [`MetadataStore`].
#[derive(Default)]
pub struct MemStore(Mutex<MemInner>);

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(path: &str, meta: FileMetadata) -> Self {
        let s = Self::new();
        s.write_file(path, &meta).unwrap();
        s
    }
}

impl MetadataStore for MemStore {
    fn read_file(&self, path: &str) -> Result<Option<FileMetadata>, Error> {
        Ok(self.0.lock().unwrap().files.get(path).cloned())
    }

    fn file_exists(&self, path: &str) -> Result<bool, Error> {
        Ok(self.0.lock().unwrap().files.contains_key(path))
    }

    fn directory_exists(&self, path: &str) -> Result<bool, Error> {
        Ok(path == "/" || self.0.lock().unwrap().dirs.contains(path))
    }

    fn list_directory(&self, path: &str) -> Result<Vec<String>, Error> {
        let l = self.0.lock().unwrap();
        Ok(l.dirs
            .iter()
            .filter(|d| parent(d) == path)
            .map(|d| crate::file_name(d).to_owned())
            .collect())
    }

    fn list_files(&self, path: &str) -> Result<Vec<(String, FileMetadata)>, Error> {
        let l = self.0.lock().unwrap();
        Ok(l.files
            .iter()
            .filter(|(p, _)| parent(p) == path)
            .map(|(p, m)| (crate::file_name(p).to_owned(), m.clone()))
            .collect())
    }

    fn delete_file(&self, path: &str, _also_delete_source: bool) -> Result<(), Error> {
        match self.0.lock().unwrap().files.remove(path) {
            Some(_) => Ok(()),
            None => Err(err!(NotFound, msg("no metadata for {path}"))),
        }
    }

    fn delete_directory(&self, path: &str) -> Result<(), Error> {
        let mut l = self.0.lock().unwrap();
        if l.files.keys().any(|p| parent(p) == path) || l.dirs.iter().any(|d| parent(d) == path) {
            return Err(err!(FailedPrecondition, msg("directory {path} not empty")));
        }
        if !l.dirs.remove(path) {
            return Err(err!(NotFound, msg("no directory {path}")));
        }
        Ok(())
    }

    fn write_file(&self, path: &str, meta: &FileMetadata) -> Result<(), Error> {
        let mut l = self.0.lock().unwrap();
        let mut dir = parent(path);
        while dir != "/" {
            l.dirs.insert(dir.to_owned());
            dir = parent(dir);
        }
        l.files.insert(path.to_owned(), meta.clone());
        Ok(())
    }

    fn rename_directory(&self, from: &str, to: &str) -> Result<(), Error> {
        let mut l = self.0.lock().unwrap();
        let prefix = format!("{from}/");
        let moved_files: Vec<_> = l
            .files
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in moved_files {
            let meta = l.files.remove(&p).unwrap();
            l.files.insert(format!("{to}{}", &p[from.len()..]), meta);
        }
        let moved_dirs: Vec<_> = l
            .dirs
            .iter()
            .filter(|d| *d == from || d.starts_with(&prefix))
            .cloned()
            .collect();
        for d in moved_dirs {
            l.dirs.remove(&d);
            l.dirs.insert(format!("{to}{}", &d[from.len()..]));
        }
        Ok(())
    }

    fn update_status(&self, path: &str, status: FileStatus) -> Result<(), Error> {
        let mut l = self.0.lock().unwrap();
        match l.files.get_mut(path) {
            Some(m) => {
                m.status = status;
                Ok(())
            }
            None => Err(err!(NotFound, msg("no metadata for {path}"))),
        }
    }

    fn create_directory(&self, path: &str) -> Result<(), Error> {
        let mut l = self.0.lock().unwrap();
        let mut dir = path;
        while dir != "/" {
            l.dirs.insert(dir.to_owned());
            dir = parent(dir);
        }
        Ok(())
    }
}

/// A [`HealthReporter`] that remembers every call, for assertions.
#[derive(Default)]
pub struct RecordingHealth {
    pub corruptions: Mutex<Vec<(String, bool)>>,
    pub dropped: Mutex<Vec<String>>,
    pub resolved: Mutex<Vec<String>>,
}

impl HealthReporter for RecordingHealth {
    fn record_corruption(&self, path: &str, _source_nzb: Option<&str>, no_retry: bool) {
        self.corruptions
            .lock()
            .unwrap()
            .push((path.to_owned(), no_retry));
    }

    fn drop_record(&self, path: &str) {
        self.dropped.lock().unwrap().push(path.to_owned());
    }

    fn resolve_pending_repair(&self, dir: &str) {
        self.resolved.lock().unwrap().push(dir.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_basics() {
        init();
        let s = MemStore::new();
        s.write_file("/a/b/c.mkv", &sample_meta(100, 50)).unwrap();
        assert!(s.directory_exists("/a").unwrap());
        assert!(s.directory_exists("/a/b").unwrap());
        assert_eq!(s.list_directory("/a").unwrap(), vec!["b".to_owned()]);
        assert_eq!(s.list_files("/a/b").unwrap()[0].0, "c.mkv");
        s.delete_file("/a/b/c.mkv", false).unwrap();
        s.delete_file("/a/b/c.mkv", false).unwrap_err();
    }

    #[test]
    fn mem_store_rename_directory() {
        init();
        let s = MemStore::new();
        s.write_file("/old/x/a.mkv", &sample_meta(10, 10)).unwrap();
        s.rename_directory("/old", "/new").unwrap();
        assert!(s.file_exists("/new/x/a.mkv").unwrap());
        assert!(!s.directory_exists("/old").unwrap());
        assert!(s.directory_exists("/new/x").unwrap());
    }

    #[test]
    fn sample_meta_shape() {
        let m = sample_meta(3000, 1000);
        assert_eq!(m.segments.len(), 3);
        assert_eq!(m.stored_size(), 3000);
        let m = sample_meta(2500, 1000);
        assert_eq!(m.segments.len(), 3);
        assert_eq!(m.segments[2].usable(), 500);
    }
}
