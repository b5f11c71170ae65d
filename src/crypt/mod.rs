// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Decryption layers over the plain ranged reader.
//!
//! Both ciphers wrap a [`FetchFn`] that opens a plain reader over the
//! *stored* byte stream; they expose the same [`RangeRead`] shape as the
//! reader they wrap, so the virtual file treats encrypted and plain files
//! uniformly.

use std::sync::Arc;

use base::{bail, Error};
use metadata::Encryption;

use crate::reader::RangeRead;

pub mod cbc;
pub mod stream;

/// Opens a plain (non-decrypted) reader over the stored bytes
/// `[start, end]` inclusive.
pub type FetchFn = Arc<dyn Fn(u64, u64) -> Box<dyn RangeRead> + Send + Sync>;

/// Globally configured credentials, applied when per-file metadata omits
/// them.
#[derive(Clone, Default)]
pub struct Defaults {
    pub password: Option<String>,
    pub salt: Option<String>,
}

/// Builds the reader chain for `[start, end]` of the plaintext.
///
/// Key material is validated here, synchronously; key derivation and the
/// first fetch happen on the first read so stat-only opens stay cheap.
pub fn open_reader(
    encryption: &Encryption,
    defaults: &Defaults,
    stored_size: u64,
    start: u64,
    end: u64,
    fetch: FetchFn,
) -> Result<Box<dyn RangeRead>, Error> {
    match encryption {
        Encryption::None => Ok(fetch(start, end)),
        Encryption::Stream {
            password,
            salt,
            nonce,
            whole_file,
        } => {
            let password = match password.as_ref().or(defaults.password.as_ref()) {
                Some(p) => p.clone(),
                None => bail!(
                    FailedPrecondition,
                    msg("stream-encrypted file has no password and no default is configured")
                ),
            };
            let salt = salt
                .as_ref()
                .or(defaults.salt.as_ref())
                .cloned()
                .unwrap_or_default();
            let reader = stream::StreamReader::new(
                password,
                salt,
                nonce,
                *whole_file,
                stored_size,
                start,
                end,
                fetch,
            )?;
            Ok(Box::new(reader))
        }
        Encryption::AesCbc { key, iv } => {
            let reader = cbc::CbcReader::new(key, iv, stored_size, start, end, fetch)?;
            Ok(Box::new(reader))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mapper;
    use crate::pool::static_pool;
    use crate::reader::{RangedReader, ReadError};
    use crate::testutil::MockPool;
    use metadata::FileMetadata;

    /// A `FetchFn` over a mock pool holding `stored` as described by `meta`.
    pub(crate) fn fetch_fn(meta: FileMetadata, stored: &[u8]) -> FetchFn {
        let pool = static_pool(Arc::new(MockPool::for_meta(&meta, stored)));
        let meta = Arc::new(meta);
        Arc::new(move |s, e| {
            let range = mapper::select(s, e, &*meta);
            Box::new(RangedReader::new(range, pool.clone(), 4)) as Box<dyn RangeRead>
        })
    }

    pub(crate) async fn read_to_end(r: &mut dyn RangeRead) -> Result<Vec<u8>, ReadError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 257];
        loop {
            match r.read(&mut buf).await? {
                0 => break,
                n => out.extend_from_slice(&buf[..n]),
            }
        }
        r.close().await;
        Ok(out)
    }
}
