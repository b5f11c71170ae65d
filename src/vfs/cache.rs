// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! TTL + LRU cache in front of the metadata store.
//!
//! Three maps: positive stat results, directory listings, and negative
//! ("path does not exist") entries. Media managers stat the same paths in
//! tight loops; the negative cache in particular keeps those from hammering
//! the store. Expired entries are dropped on read; capacity eviction is
//! least-recently-used. One lock guards all three maps: the LRU list
//! reorders on every read, so point lookups need exclusive access anyway.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use metadata::{DirEntry, FileInfo};

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub stat_capacity: usize,
    pub stat_ttl: Duration,
    pub dir_capacity: usize,
    pub dir_ttl: Duration,
    pub negative_capacity: usize,
    pub negative_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            stat_capacity: 10_000,
            stat_ttl: Duration::from_secs(30),
            dir_capacity: 1_000,
            dir_ttl: Duration::from_secs(60),
            negative_capacity: 5_000,
            negative_ttl: Duration::from_secs(10),
        }
    }
}

struct Entry<V> {
    value: V,
    expires: Instant,
}

struct Caches {
    stat: LruCache<String, Entry<FileInfo>>,
    dir: LruCache<String, Entry<Vec<DirEntry>>>,
    negative: LruCache<String, Entry<()>>,
}

pub struct MetadataCache {
    inner: Mutex<Caches>,
    stat_ttl: Duration,
    dir_ttl: Duration,
    negative_ttl: Duration,
}

fn cap(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap()
}

fn get_fresh<'a, V>(
    cache: &'a mut LruCache<String, Entry<V>>,
    key: &str,
    now: Instant,
) -> Option<&'a V> {
    let fresh = match cache.peek(key) {
        Some(e) => e.expires > now,
        None => return None,
    };
    if !fresh {
        cache.pop(key);
        return None;
    }
    // `get` (not `peek`) so the hit refreshes the entry's LRU position.
    Some(&cache.get(key).unwrap().value)
}

impl MetadataCache {
    pub fn new(config: &CacheConfig) -> Self {
        MetadataCache {
            inner: Mutex::new(Caches {
                stat: LruCache::new(cap(config.stat_capacity)),
                dir: LruCache::new(cap(config.dir_capacity)),
                negative: LruCache::new(cap(config.negative_capacity)),
            }),
            stat_ttl: config.stat_ttl,
            dir_ttl: config.dir_ttl,
            negative_ttl: config.negative_ttl,
        }
    }

    pub fn get_stat(&self, path: &str) -> Option<FileInfo> {
        let mut l = self.inner.lock().unwrap();
        get_fresh(&mut l.stat, path, Instant::now()).cloned()
    }

    /// Stores a positive stat entry, atomically evicting any negative entry
    /// for the same path.
    pub fn set_stat(&self, path: &str, info: FileInfo) {
        let mut l = self.inner.lock().unwrap();
        l.negative.pop(path);
        let expires = Instant::now() + self.stat_ttl;
        l.stat.put(
            path.to_owned(),
            Entry {
                value: info,
                expires,
            },
        );
    }

    pub fn get_dir(&self, path: &str) -> Option<Vec<DirEntry>> {
        let mut l = self.inner.lock().unwrap();
        get_fresh(&mut l.dir, path, Instant::now()).cloned()
    }

    pub fn set_dir(&self, path: &str, entries: Vec<DirEntry>) {
        let mut l = self.inner.lock().unwrap();
        let expires = Instant::now() + self.dir_ttl;
        l.dir.put(
            path.to_owned(),
            Entry {
                value: entries,
                expires,
            },
        );
    }

    pub fn is_negative(&self, path: &str) -> bool {
        let mut l = self.inner.lock().unwrap();
        get_fresh(&mut l.negative, path, Instant::now()).is_some()
    }

    pub fn set_negative(&self, path: &str) {
        let mut l = self.inner.lock().unwrap();
        let expires = Instant::now() + self.negative_ttl;
        l.negative.put(
            path.to_owned(),
            Entry {
                value: (),
                expires,
            },
        );
    }

    /// Removes `path` from all three maps.
    pub fn invalidate(&self, path: &str) {
        let mut l = self.inner.lock().unwrap();
        l.stat.pop(path);
        l.dir.pop(path);
        l.negative.pop(path);
    }

    /// Removes `prefix` itself and everything under `prefix + "/"` from all
    /// three maps.
    pub fn invalidate_prefix(&self, prefix: &str) {
        fn drop_matching<V>(cache: &mut LruCache<String, Entry<V>>, prefix: &str, pfx: &str) {
            let keys: Vec<String> = cache
                .iter()
                .map(|(k, _)| k)
                .filter(|k| k.as_str() == prefix || k.starts_with(pfx))
                .cloned()
                .collect();
            for k in keys {
                cache.pop(&k);
            }
        }
        let pfx = format!("{prefix}/");
        let mut l = self.inner.lock().unwrap();
        drop_matching(&mut l.stat, prefix, &pfx);
        drop_matching(&mut l.dir, prefix, &pfx);
        drop_matching(&mut l.negative, prefix, &pfx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str) -> FileInfo {
        FileInfo {
            name: name.to_owned(),
            size: 1,
            mtime: jiff::Timestamp::UNIX_EPOCH,
            is_dir: false,
            status: metadata::FileStatus::Healthy,
        }
    }

    fn cache() -> MetadataCache {
        MetadataCache::new(&CacheConfig::default())
    }

    #[test]
    fn set_then_invalidate_misses() {
        let c = cache();
        c.set_stat("/a", info("a"));
        assert!(c.get_stat("/a").is_some());
        c.invalidate("/a");
        assert!(c.get_stat("/a").is_none());
    }

    #[test]
    fn positive_set_clears_negative_atomically() {
        let c = cache();
        c.set_negative("/a");
        assert!(c.is_negative("/a"));
        c.set_stat("/a", info("a"));
        assert!(!c.is_negative("/a"));
        assert!(c.get_stat("/a").is_some());
    }

    #[test]
    fn entries_expire() {
        let c = MetadataCache::new(&CacheConfig {
            stat_ttl: Duration::from_millis(10),
            ..CacheConfig::default()
        });
        c.set_stat("/a", info("a"));
        assert!(c.get_stat("/a").is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(c.get_stat("/a").is_none());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let c = MetadataCache::new(&CacheConfig {
            stat_capacity: 2,
            ..CacheConfig::default()
        });
        c.set_stat("/a", info("a"));
        c.set_stat("/b", info("b"));
        assert!(c.get_stat("/a").is_some()); // refresh /a
        c.set_stat("/c", info("c"));
        assert!(c.get_stat("/b").is_none());
        assert!(c.get_stat("/a").is_some());
        assert!(c.get_stat("/c").is_some());
    }

    #[test]
    fn prefix_invalidation_spares_siblings() {
        let c = cache();
        c.set_stat("/movies/a.mkv", info("a.mkv"));
        c.set_stat("/movies2/b.mkv", info("b.mkv"));
        c.set_dir("/movies", vec![]);
        c.set_negative("/movies/missing.mkv");
        c.invalidate_prefix("/movies");
        assert!(c.get_stat("/movies/a.mkv").is_none());
        assert!(c.get_dir("/movies").is_none());
        assert!(!c.is_negative("/movies/missing.mkv"));
        assert!(c.get_stat("/movies2/b.mkv").is_some());
    }
}
