// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Runtime configuration file (TOML).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use base::{err, Error};

fn default_workers() -> usize {
    crate::reader::DEFAULT_WORKERS
}

fn default_port() -> u16 {
    8080
}

fn default_prefix() -> String {
    "/webdav/".to_owned()
}

/// Top-level configuration file object.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub streaming: StreamingConfig,

    pub webdav: Option<WebdavConfig>,

    pub fuse: Option<FuseConfig>,

    pub metadata: MetadataConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub categories: Vec<CategoryConfig>,

    #[serde(default)]
    pub cipher: CipherConfig,

    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// List entries whose metadata marks them corrupted instead of hiding
    /// them.
    #[serde(default)]
    pub show_corrupted_files: bool,
}

#[derive(Debug, Deserialize)]
pub struct StreamingConfig {
    /// Concurrent article downloads per open range.
    #[serde(default = "default_workers")]
    pub max_download_workers: usize,

    /// Rough ceiling on in-flight segment buffers, applied by shrinking the
    /// worker count.
    #[serde(default)]
    pub max_cache_size_mb: Option<u64>,

    /// Largest range a single reader covers; longer requests re-map as the
    /// position advances.
    #[serde(default)]
    pub max_range_size: Option<u64>,

    /// Read size used when streaming HTTP response bodies.
    #[serde(default)]
    pub streaming_chunk_size: Option<usize>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            max_download_workers: default_workers(),
            max_cache_size_mb: None,
            max_range_size: None,
            streaming_chunk_size: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WebdavConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Deserialize)]
pub struct FuseConfig {
    pub mount_path: PathBuf,

    pub uid: Option<u32>,
    pub gid: Option<u32>,

    /// Size string, e.g. `128K` or `4M`.
    pub readahead: Option<String>,

    #[serde(default)]
    pub allow_other: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct MetadataConfig {
    /// Directory holding the metadata documents.
    #[serde(default)]
    pub root_path: PathBuf,

    /// Also delete the imported `.nzb` when a file is removed.
    #[serde(default)]
    pub delete_source_nzb_on_removal: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct HealthConfig {
    /// Library root used to recognize imports for repair resolution.
    pub library_dir: Option<String>,

    #[serde(default)]
    pub resolve_repair_on_import: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CategoryConfig {
    pub name: String,
    pub dir: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct CipherConfig {
    /// Applied when per-file metadata omits stream-cipher credentials.
    pub rclone_password: Option<String>,
    pub rclone_salt: Option<String>,
}

impl ConfigFile {
    /// Effective download worker count: the configured workers, shrunk if a
    /// memory budget demands it (each worker holds roughly one segment
    /// buffer, conservatively sized at 768 KiB).
    pub fn effective_workers(&self) -> usize {
        let workers = self.streaming.max_download_workers.max(1);
        match self.streaming.max_cache_size_mb {
            Some(mb) => {
                let budget = (mb << 20) / (768 << 10);
                workers.min((budget as usize).max(1))
            }
            None => workers,
        }
    }

    pub fn readahead_bytes(&self) -> Result<Option<u64>, Error> {
        let Some(fuse) = &self.fuse else { return Ok(None) };
        let Some(s) = &fuse.readahead else {
            return Ok(None);
        };
        let n = base::strutil::decode_size(s)
            .map_err(|()| err!(InvalidArgument, msg("bad readahead size {s:?}")))?;
        Ok(Some(n as u64))
    }
}

pub fn read_config(path: &Path) -> Result<ConfigFile, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| err!(NotFound, msg("unable to read {}", path.display()), source(e)))?;
    toml::from_str(&raw)
        .map_err(|e| err!(InvalidArgument, msg("unable to parse {}", path.display()), source(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config() {
        let c: ConfigFile = toml::from_str(
            r#"
            [metadata]
            root_path = "/var/lib/nzbfs/metadata"
            "#,
        )
        .unwrap();
        assert_eq!(c.streaming.max_download_workers, 15);
        assert!(c.webdav.is_none());
        assert_eq!(c.effective_workers(), 15);
    }

    #[test]
    fn full_config() {
        let c: ConfigFile = toml::from_str(
            r#"
            show_corrupted_files = true
            worker_threads = 4

            [streaming]
            max_download_workers = 30
            max_cache_size_mb = 6
            max_range_size = 33554432
            streaming_chunk_size = 131072

            [webdav]
            port = 9999
            username = "user"
            password = "pass"
            prefix = "/dav/"
            debug = true

            [fuse]
            mount_path = "/mnt/nzb"
            uid = 1000
            gid = 1000
            readahead = "128K"

            [metadata]
            root_path = "/data/meta"
            delete_source_nzb_on_removal = true

            [health]
            library_dir = "/library"
            resolve_repair_on_import = true

            [[categories]]
            name = "movies"
            dir = "/movies"

            [[categories]]
            name = "tv"
            dir = "/tv"

            [cipher]
            rclone_password = "hunter2"
            rclone_salt = "salty"
            "#,
        )
        .unwrap();
        assert_eq!(c.webdav.as_ref().unwrap().port, 9999);
        assert_eq!(c.categories.len(), 2);
        assert_eq!(c.readahead_bytes().unwrap(), Some(128 << 10));
        // 6 MiB budget / 768 KiB per worker = 8 workers, below the 30 asked.
        assert_eq!(c.effective_workers(), 8);
        assert_eq!(c.streaming.max_range_size, Some(32 << 20));
    }

    #[test]
    fn bad_readahead_rejected() {
        let c: ConfigFile = toml::from_str(
            r#"
            [metadata]
            root_path = "/data/meta"
            [fuse]
            mount_path = "/mnt/nzb"
            readahead = "128Q"
            "#,
        )
        .unwrap();
        c.readahead_bytes().unwrap_err();
    }
}
