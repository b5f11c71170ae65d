// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The read-only virtual filesystem facade consumed by the WebDAV and FUSE
//! adapters.
//!
//! A thin layer over the metadata store plus the virtual-file factory: it
//! caches stat/listing/negative results, enforces the read-only and
//! category-directory policies, and translates everything into
//! [`base::Error`] kinds the adapters map onto HTTP statuses and errnos.

use std::sync::Arc;

use base::{bail, err, Error};
use metadata::health::HealthReporter;
use metadata::{DirEntry, FileInfo, FileStatus, MetadataStore};
use tracing::{debug, info};

pub mod cache;
pub mod file;
pub mod tracker;

use cache::{CacheConfig, MetadataCache};
use file::{CorruptedFileError, Shared, VirtualFile};
use tracker::StreamTracker;

use crate::crypt;
use crate::pool::PoolGetter;
use crate::reader::DEFAULT_WORKERS;

/// Request-scoped flags and headers, carried explicitly from the adapter to
/// the file handle rather than through an ambient context.
#[derive(Clone, Debug, Default)]
pub struct ReqContext {
    /// HTTP `Range` as `(start, inclusive end)`; `None` end = unbounded.
    pub range: Option<(u64, Option<u64>)>,
    /// The operation is a COPY (refused; clients must MOVE).
    pub is_copy: bool,
    /// Request origin, for logging only.
    pub origin: Option<String>,
}

/// A configured passthrough directory. Client tools managing a media library
/// routinely try to delete or rename these; both are refused (removal
/// pretends to succeed) so the category layout survives.
#[derive(Clone, Debug)]
pub struct Category {
    pub name: String,
    pub dir: String,
}

pub struct Config {
    pub categories: Vec<Category>,
    /// Hide entries whose metadata status is CORRUPTED from listings.
    pub hide_corrupted: bool,
    pub max_download_workers: usize,
    pub max_range_size: Option<u64>,
    pub cipher_defaults: crypt::Defaults,
    pub delete_source_nzb_on_removal: bool,
    /// Resolve "pending repair" health records when a file is moved under
    /// `library_dir`.
    pub resolve_repair_on_import: bool,
    pub library_dir: Option<String>,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            categories: Vec::new(),
            hide_corrupted: true,
            max_download_workers: DEFAULT_WORKERS,
            max_range_size: None,
            cipher_defaults: crypt::Defaults::default(),
            delete_source_nzb_on_removal: false,
            resolve_repair_on_import: false,
            library_dir: None,
            cache: CacheConfig::default(),
        }
    }
}

pub struct Filesystem {
    shared: Arc<Shared>,
    cache: MetadataCache,
    categories: Vec<String>,
    hide_corrupted: bool,
    delete_source_nzb: bool,
    resolve_repair_on_import: bool,
    library_dir: Option<String>,
}

fn dir_info(name: &str) -> FileInfo {
    FileInfo {
        name: name.to_owned(),
        size: 0,
        mtime: jiff::Timestamp::UNIX_EPOCH,
        is_dir: true,
        status: FileStatus::Healthy,
    }
}

fn file_info(name: &str, meta: &metadata::FileMetadata) -> FileInfo {
    FileInfo {
        name: name.to_owned(),
        size: meta.file_size,
        mtime: meta.mtime,
        is_dir: false,
        status: meta.status,
    }
}

impl Filesystem {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        pool_getter: PoolGetter,
        health: Arc<dyn HealthReporter>,
        tracker: Arc<StreamTracker>,
        config: Config,
    ) -> Self {
        let categories = config
            .categories
            .iter()
            .map(|c| metadata::normalize(&c.dir))
            .collect();
        Filesystem {
            shared: Arc::new(Shared {
                store,
                health,
                tracker,
                pool_getter,
                cipher_defaults: config.cipher_defaults,
                max_workers: config.max_download_workers.max(1),
                max_range_size: config.max_range_size,
            }),
            cache: MetadataCache::new(&config.cache),
            categories,
            hide_corrupted: config.hide_corrupted,
            delete_source_nzb: config.delete_source_nzb_on_removal,
            resolve_repair_on_import: config.resolve_repair_on_import,
            library_dir: config.library_dir.map(|d| metadata::normalize(&d)),
        }
    }

    pub fn tracker(&self) -> Arc<StreamTracker> {
        self.shared.tracker.clone()
    }

    fn is_category(&self, path: &str) -> bool {
        self.categories.iter().any(|c| c == path)
    }

    /// Resolves `path` to stat info, consulting the positive then negative
    /// cache before the store.
    pub fn stat(&self, path: &str) -> Result<FileInfo, Error> {
        let path = metadata::normalize(path);
        if path == "/" {
            return Ok(dir_info("/"));
        }
        if let Some(info) = self.cache.get_stat(&path) {
            return Ok(info);
        }
        if self.cache.is_negative(&path) {
            bail!(NotFound, msg("{path} not found (cached)"));
        }
        if let Some(meta) = self.shared.store.read_file(&path)? {
            let info = file_info(metadata::file_name(&path), &meta);
            self.cache.set_stat(&path, info.clone());
            return Ok(info);
        }
        if self.shared.store.directory_exists(&path)? {
            let info = dir_info(metadata::file_name(&path));
            self.cache.set_stat(&path, info.clone());
            return Ok(info);
        }
        self.cache.set_negative(&path);
        bail!(NotFound, msg("{path} not found"))
    }

    /// Opens a file for reading. COPY semantics are refused so catalog
    /// tools fall back to MOVE; a file already marked corrupted fails here
    /// rather than on the first read.
    pub fn open(&self, path: &str, ctx: &ReqContext) -> Result<Arc<VirtualFile>, Error> {
        let path = metadata::normalize(path);
        if ctx.is_copy {
            bail!(PermissionDenied, msg("copying is not permitted; use move"));
        }
        if self.cache.is_negative(&path) {
            bail!(NotFound, msg("{path} not found (cached)"));
        }
        let Some(meta) = self.shared.store.read_file(&path)? else {
            if self.shared.store.directory_exists(&path)? {
                bail!(PermissionDenied, msg("{path} is a directory"));
            }
            self.cache.set_negative(&path);
            bail!(NotFound, msg("{path} not found"));
        };
        if meta.status == FileStatus::Corrupted {
            return Err(err!(
                DataLoss,
                msg("{path} is marked corrupted"),
                source(CorruptedFileError {
                    total_expected: meta.file_size,
                    message_id: String::new(),
                })
            ));
        }
        debug!(%path, origin = ?ctx.origin, "open");
        Ok(Arc::new(VirtualFile::new(
            path,
            Arc::new(meta),
            self.shared.clone(),
            ctx.range,
        )))
    }

    /// Lists a directory: subdirectories first, then files, in store order.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, Error> {
        let path = metadata::normalize(path);
        if let Some(entries) = self.cache.get_dir(&path) {
            return Ok(entries);
        }
        if path != "/" && !self.shared.store.directory_exists(&path)? {
            bail!(NotFound, msg("{path} not found"));
        }
        let mut entries = Vec::new();
        for name in self.shared.store.list_directory(&path)? {
            entries.push(DirEntry {
                name,
                is_dir: true,
                mode: 0o755,
            });
        }
        for (name, meta) in self.shared.store.list_files(&path)? {
            if self.hide_corrupted && meta.status == FileStatus::Corrupted {
                continue;
            }
            entries.push(DirEntry {
                name,
                is_dir: false,
                mode: 0o644,
            });
        }
        self.cache.set_dir(&path, entries.clone());
        Ok(entries)
    }

    /// Removes a file or (empty) directory. Category directories pretend to
    /// be removed so media managers don't error out; the root refuses.
    pub fn remove(&self, path: &str) -> Result<(), Error> {
        let path = metadata::normalize(path);
        if path == "/" {
            bail!(PermissionDenied, msg("refusing to remove the root"));
        }
        if self.is_category(&path) {
            info!(%path, "ignoring removal of category directory");
            return Ok(());
        }
        if self.shared.store.file_exists(&path)? {
            self.shared.store.delete_file(&path, self.delete_source_nzb)?;
        } else if self.shared.store.directory_exists(&path)? {
            self.shared.store.delete_directory(&path)?;
        } else {
            bail!(NotFound, msg("{path} not found"));
        }
        self.cache.invalidate_prefix(&path);
        self.cache.invalidate(metadata::parent(&path));
        Ok(())
    }

    /// `remove_all` delegates to [`remove`](Self::remove): no recursive
    /// deletion happens through the filesystem surface.
    pub fn remove_all(&self, path: &str) -> Result<(), Error> {
        self.remove(path)
    }

    /// Renames a file or directory. For files this re-homes the metadata
    /// document and pokes the health collaborator; WebDAV MOVE is the only
    /// catalog operation clients get (COPY is refused at open).
    pub fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        let from = metadata::normalize(from);
        let to = metadata::normalize(to);
        if from == "/" || to == "/" {
            bail!(PermissionDenied, msg("refusing to rename the root"));
        }
        if self.is_category(&from) || self.is_category(&to) {
            bail!(
                PermissionDenied,
                msg("category directories cannot be renamed")
            );
        }
        if let Some(meta) = self.shared.store.read_file(&from)? {
            self.shared.store.write_file(&to, &meta)?;
            self.shared.store.delete_file(&from, false)?;
            self.shared.health.drop_record(&to);
            if self.resolve_repair_on_import {
                if let Some(lib) = &self.library_dir {
                    let dest_dir = metadata::parent(&to);
                    if dest_dir == lib || dest_dir.starts_with(&format!("{lib}/")) {
                        self.shared.health.resolve_pending_repair(dest_dir);
                    }
                }
            }
        } else if self.shared.store.directory_exists(&from)? {
            self.shared.store.rename_directory(&from, &to)?;
        } else {
            bail!(NotFound, msg("{from} not found"));
        }
        info!(%from, %to, "renamed");
        self.cache.invalidate_prefix(&from);
        self.cache.invalidate_prefix(&to);
        self.cache.invalidate(metadata::parent(&from));
        self.cache.invalidate(metadata::parent(&to));
        Ok(())
    }

    /// Creates a directory; the parent must exist.
    pub fn mkdir(&self, path: &str) -> Result<(), Error> {
        let path = metadata::normalize(path);
        let parent = metadata::parent(&path);
        if parent != "/" && !self.shared.store.directory_exists(parent)? {
            bail!(NotFound, msg("parent of {path} not found"));
        }
        self.mkdir_all(&path)
    }

    /// Creates a directory and any missing parents.
    pub fn mkdir_all(&self, path: &str) -> Result<(), Error> {
        let path = metadata::normalize(path);
        if path == "/" {
            return Ok(());
        }
        self.shared.store.create_directory(&path)?;
        self.cache.invalidate(&path);
        self.cache.invalidate(metadata::parent(&path));
        Ok(())
    }
}
