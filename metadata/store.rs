// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The metadata store interface and its on-disk implementation.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use base::{bail, err, Error, ErrorKind, ResultExt as _};
use tracing::warn;

use crate::{FileMetadata, FileStatus};

/// Extension appended to a virtual path to form its sidecar document.
const SIDECAR_SUFFIX: &str = ".nzb.json";

/// Resolves virtual paths to file metadata and directory listings.
///
/// All paths are normalized virtual paths (`/`-rooted, no trailing slash).
/// Implementations must be cheap enough to call on every cache miss; the
/// filesystem facade caches on top.
pub trait MetadataStore: Send + Sync + 'static {
    /// Returns the metadata for the file at `path`, or `None` if no such
    /// file exists. A directory at `path` also yields `None`.
    fn read_file(&self, path: &str) -> Result<Option<FileMetadata>, Error>;

    fn file_exists(&self, path: &str) -> Result<bool, Error>;

    fn directory_exists(&self, path: &str) -> Result<bool, Error>;

    /// Child directory names of `path`, in store order.
    fn list_directory(&self, path: &str) -> Result<Vec<String>, Error>;

    /// Child files of `path` with their metadata, in store order.
    fn list_files(&self, path: &str) -> Result<Vec<(String, FileMetadata)>, Error>;

    /// Removes the file's metadata. With `also_delete_source`, the source
    /// `.nzb` document named by the metadata is removed too.
    fn delete_file(&self, path: &str, also_delete_source: bool) -> Result<(), Error>;

    fn delete_directory(&self, path: &str) -> Result<(), Error>;

    /// Writes (or overwrites) the file's metadata, creating parent
    /// directories as needed. Used by rename.
    fn write_file(&self, path: &str, meta: &FileMetadata) -> Result<(), Error>;

    fn rename_directory(&self, from: &str, to: &str) -> Result<(), Error>;

    fn update_status(&self, path: &str, status: FileStatus) -> Result<(), Error>;

    fn create_directory(&self, path: &str) -> Result<(), Error>;
}

/// On-disk store: one JSON sidecar per virtual file under a root directory,
/// real directories for virtual directories.
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self, Error> {
        let root = root.into();
        if !root.is_dir() {
            bail!(
                FailedPrecondition,
                msg("metadata root {} is not a directory", root.display())
            );
        }
        Ok(DiskStore { root })
    }

    /// Maps a virtual path to the real path of its sidecar document.
    fn sidecar(&self, path: &str) -> PathBuf {
        let mut p = self.real(path).into_os_string();
        p.push(SIDECAR_SUFFIX);
        PathBuf::from(p)
    }

    fn real(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn read_sidecar(&self, real: &Path) -> Result<Option<FileMetadata>, Error> {
        let bytes = match fs::read(real) {
            Ok(b) => b,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(err!(
                    Unavailable,
                    msg("unable to read {}", real.display()),
                    source(e)
                ))
            }
        };
        let meta = serde_json::from_slice(&bytes).map_err(|e| {
            err!(
                DataLoss,
                msg("corrupt metadata document {}", real.display()),
                source(e)
            )
        })?;
        Ok(Some(meta))
    }
}

impl MetadataStore for DiskStore {
    fn read_file(&self, path: &str) -> Result<Option<FileMetadata>, Error> {
        self.read_sidecar(&self.sidecar(path))
    }

    fn file_exists(&self, path: &str) -> Result<bool, Error> {
        Ok(self.sidecar(path).is_file())
    }

    fn directory_exists(&self, path: &str) -> Result<bool, Error> {
        Ok(self.real(path).is_dir())
    }

    fn list_directory(&self, path: &str) -> Result<Vec<String>, Error> {
        let real = self.real(path);
        let mut out = Vec::new();
        let iter = fs::read_dir(&real)
            .map_err(|e| err!(NotFound, msg("unable to list {}", real.display()), source(e)))?;
        for entry in iter {
            let entry = entry.err_kind(ErrorKind::Unavailable)?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(n) => {
                    warn!("skipping non-UTF-8 entry {n:?} in {}", real.display());
                    continue;
                }
            };
            if entry.file_type().err_kind(ErrorKind::Unavailable)?.is_dir() {
                out.push(name);
            }
        }
        Ok(out)
    }

    fn list_files(&self, path: &str) -> Result<Vec<(String, FileMetadata)>, Error> {
        let real = self.real(path);
        let mut out = Vec::new();
        let iter = fs::read_dir(&real)
            .map_err(|e| err!(NotFound, msg("unable to list {}", real.display()), source(e)))?;
        for entry in iter {
            let entry = entry.err_kind(ErrorKind::Unavailable)?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            let Some(stem) = name.strip_suffix(SIDECAR_SUFFIX) else {
                continue;
            };
            match self.read_sidecar(&entry.path()) {
                Ok(Some(meta)) => out.push((stem.to_owned(), meta)),
                Ok(None) => {}
                Err(e) => warn!(err = %e.chain(), "skipping unreadable metadata entry"),
            }
        }
        Ok(out)
    }

    fn delete_file(&self, path: &str, also_delete_source: bool) -> Result<(), Error> {
        let sidecar = self.sidecar(path);
        let source = if also_delete_source {
            self.read_sidecar(&sidecar)?.and_then(|m| m.source_nzb)
        } else {
            None
        };
        fs::remove_file(&sidecar)
            .map_err(|e| err!(NotFound, msg("unable to remove {path}"), source(e)))?;
        if let Some(nzb) = source {
            if let Err(e) = fs::remove_file(&nzb) {
                warn!(%nzb, err = %e, "unable to remove source nzb");
            }
        }
        Ok(())
    }

    fn delete_directory(&self, path: &str) -> Result<(), Error> {
        let real = self.real(path);
        fs::remove_dir(&real)
            .map_err(|e| err!(FailedPrecondition, msg("unable to remove {path}"), source(e)))
    }

    fn write_file(&self, path: &str, meta: &FileMetadata) -> Result<(), Error> {
        let sidecar = self.sidecar(path);
        if let Some(parent) = sidecar.parent() {
            fs::create_dir_all(parent).err_kind(ErrorKind::Unavailable)?;
        }
        let json = serde_json::to_vec_pretty(meta).err_kind(ErrorKind::Internal)?;
        fs::write(&sidecar, json)
            .map_err(|e| err!(Unavailable, msg("unable to write {path}"), source(e)))
    }

    fn rename_directory(&self, from: &str, to: &str) -> Result<(), Error> {
        fs::rename(self.real(from), self.real(to))
            .map_err(|e| err!(Unavailable, msg("unable to rename {from} to {to}"), source(e)))
    }

    fn update_status(&self, path: &str, status: FileStatus) -> Result<(), Error> {
        let mut meta = self
            .read_file(path)?
            .ok_or_else(|| err!(NotFound, msg("no metadata for {path}")))?;
        meta.status = status;
        self.write_file(path, &meta)
    }

    fn create_directory(&self, path: &str) -> Result<(), Error> {
        fs::create_dir_all(self.real(path)).err_kind(ErrorKind::Unavailable)
    }
}
