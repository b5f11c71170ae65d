// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Test helpers for the root crate: a scriptable article pool and
//! deterministic file content.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use metadata::FileMetadata;

use crate::pool::{ArticlePool, FetchError};

pub fn init() {
    metadata::testutil::init();
}

/// Deterministic pseudo-random content, stable across runs.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31).wrapping_add(7) % 251) as u8).collect()
}

#[derive(Default)]
struct MockInner {
    articles: HashMap<String, Vec<u8>>,
    missing: HashSet<String>,
    transient_failures: HashMap<String, u32>,
    stalled: HashSet<String>,
}

/// An [`ArticlePool`] serving scripted bodies, with per-article failure
/// injection.
#[derive(Default)]
pub struct MockPool(Mutex<MockInner>);

impl MockPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a pool holding the articles described by `meta`, with the
    /// usable regions taken from `stored` (the file's stored byte stream)
    /// and filler around them.
    pub fn for_meta(meta: &FileMetadata, stored: &[u8]) -> Self {
        let pool = Self::new();
        let mut off = 0usize;
        for d in &meta.segments {
            let usable = d.usable() as usize;
            let mut body = vec![0xAAu8; d.start as usize];
            body.extend_from_slice(&stored[off..off + usable]);
            body.resize((d.size as usize).max(body.len()), 0xBB);
            pool.insert(&d.message_id, body);
            off += usable;
        }
        pool
    }

    /// Unencrypted file of `size` bytes in `segment_size`-byte segments,
    /// matching `metadata::testutil::sample_meta(size, segment_size)`.
    /// Returns the pool and the plaintext.
    pub fn with_file(size: u64, segment_size: u64) -> (Self, Vec<u8>) {
        let content = pattern(size as usize);
        let meta = metadata::testutil::sample_meta(size, segment_size);
        (Self::for_meta(&meta, &content), content)
    }

    pub fn insert(&self, message_id: &str, body: Vec<u8>) {
        self.0
            .lock()
            .unwrap()
            .articles
            .insert(message_id.to_owned(), body);
    }

    /// Marks the article missing from every provider.
    pub fn remove(&self, message_id: &str) {
        self.0.lock().unwrap().missing.insert(message_id.to_owned());
    }

    /// The next `n` fetches of the article fail with a transient error.
    pub fn fail_transiently(&self, message_id: &str, n: u32) {
        self.0
            .lock()
            .unwrap()
            .transient_failures
            .insert(message_id.to_owned(), n);
    }

    /// Fetches of the article hang until cancelled.
    pub fn stall(&self, message_id: &str) {
        self.0.lock().unwrap().stalled.insert(message_id.to_owned());
    }
}

#[async_trait]
impl ArticlePool for MockPool {
    async fn body(
        &self,
        message_id: &str,
        _groups: &[String],
        out: &mut Vec<u8>,
    ) -> Result<(), FetchError> {
        let body = {
            let mut l = self.0.lock().unwrap();
            if l.stalled.contains(message_id) {
                None
            } else {
                if let Some(n) = l.transient_failures.get_mut(message_id) {
                    if *n > 0 {
                        *n -= 1;
                        return Err(FetchError::Transient(base::err!(
                            Unavailable,
                            msg("scripted transient failure for {message_id}")
                        )));
                    }
                }
                if l.missing.contains(message_id) {
                    return Err(FetchError::NotFound {
                        message_id: message_id.to_owned(),
                    });
                }
                match l.articles.get(message_id) {
                    Some(b) => Some(b.clone()),
                    None => {
                        return Err(FetchError::NotFound {
                            message_id: message_id.to_owned(),
                        })
                    }
                }
            }
        };
        match body {
            Some(b) => {
                out.extend_from_slice(&b);
                Ok(())
            }
            None => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn stat(&self, message_id: &str, _groups: &[String]) -> Result<bool, FetchError> {
        let l = self.0.lock().unwrap();
        Ok(!l.missing.contains(message_id) && l.articles.contains_key(message_id))
    }
}
