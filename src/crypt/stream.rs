// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Whole-file / head+tail stream decryption (XSalsa20, scrypt-derived key).
//!
//! Two layouts exist in the wild. The newer one encrypts only the first and
//! last [`ENCRYPTED_REGION`] bytes (files no larger than twice that are
//! encrypted end-to-end); the older one encrypts the whole file. The tail
//! region's keystream continues where the head's left off, as if the two
//! encrypted regions were concatenated.
//!
//! Decryption is the same XOR as encryption. Key derivation and the first
//! fetch are deferred to the first read, so metadata-only operations never
//! pay the scrypt cost.

use async_trait::async_trait;
use cipher::{KeyIvInit as _, StreamCipher as _, StreamCipherSeek as _};
use salsa20::XSalsa20;

use base::{err, Error, ErrorKind, ResultExt as _};

use super::FetchFn;
use crate::reader::{RangeRead, ReadError};

/// Bytes encrypted at each end of a large file.
pub const ENCRYPTED_REGION: u64 = 750_000;

const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// scrypt cost parameters: N=2^15, r=8, p=1.
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

pub(crate) fn derive_key(password: &str, salt: &str) -> Result<[u8; KEY_LEN], Error> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .err_kind(ErrorKind::Internal)?;
    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(password.as_bytes(), salt.as_bytes(), &params, &mut key)
        .err_kind(ErrorKind::Internal)?;
    Ok(key)
}

/// One contiguous piece of the requested range, entirely inside or outside
/// an encrypted region.
struct Piece {
    start: u64,
    end: u64,
    /// Keystream offset of `start`, or `None` for plaintext passthrough.
    keystream_off: Option<u64>,
    reader: Option<Box<dyn RangeRead>>,
    cipher: Option<XSalsa20>,
}

pub struct StreamReader {
    password: String,
    salt: String,
    nonce: [u8; NONCE_LEN],
    key: Option<[u8; KEY_LEN]>,
    pieces: Vec<Piece>,
    cur: usize,
    fetch: FetchFn,
}

impl StreamReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        password: String,
        salt: String,
        nonce: &[u8],
        whole_file: bool,
        stored_size: u64,
        start: u64,
        end: u64,
        fetch: FetchFn,
    ) -> Result<Self, Error> {
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| err!(InvalidArgument, msg("nonce must be {NONCE_LEN} bytes")))?;
        let mut pieces = Vec::with_capacity(3);
        for (r_start, r_end, keystream_base) in regions(stored_size, whole_file) {
            let lo = r_start.max(start);
            let hi = r_end.min(end);
            if lo > hi {
                continue;
            }
            pieces.push(Piece {
                start: lo,
                end: hi,
                keystream_off: keystream_base.map(|b| b + (lo - r_start)),
                reader: None,
                cipher: None,
            });
        }
        Ok(StreamReader {
            password,
            salt,
            nonce,
            key: None,
            pieces,
            cur: 0,
            fetch,
        })
    }
}

/// The encrypted/plaintext layout of the stored stream:
/// `(start, end, keystream offset of start or None)`.
fn regions(stored_size: u64, whole_file: bool) -> Vec<(u64, u64, Option<u64>)> {
    if stored_size == 0 {
        return vec![];
    }
    let k = ENCRYPTED_REGION;
    if whole_file || stored_size <= 2 * k {
        return vec![(0, stored_size - 1, Some(0))];
    }
    vec![
        (0, k - 1, Some(0)),
        (k, stored_size - k - 1, None),
        (stored_size - k, stored_size - 1, Some(k)),
    ]
}

#[async_trait]
impl RangeRead for StreamReader {
    async fn read(&mut self, out: &mut [u8]) -> Result<usize, ReadError> {
        loop {
            let Some(piece) = self.pieces.get_mut(self.cur) else {
                return Ok(0);
            };
            if piece.reader.is_none() {
                piece.reader = Some((self.fetch)(piece.start, piece.end));
                if let Some(off) = piece.keystream_off {
                    if self.key.is_none() {
                        let password = self.password.clone();
                        let salt = self.salt.clone();
                        let key = tokio::task::spawn_blocking(move || derive_key(&password, &salt))
                            .await
                            .map_err(|e| {
                                ReadError::Internal(err!(
                                    Internal,
                                    msg("key derivation task failed"),
                                    source(e)
                                ))
                            })?
                            .map_err(ReadError::Internal)?;
                        self.key = Some(key);
                    }
                    let key = self.key.as_ref().unwrap();
                    let mut cipher = XSalsa20::new(key.into(), (&self.nonce).into());
                    cipher.seek(off);
                    piece.cipher = Some(cipher);
                }
            }
            let n = piece.reader.as_mut().unwrap().read(out).await?;
            if n == 0 {
                piece.reader.as_mut().unwrap().close().await;
                piece.reader = None;
                piece.cipher = None;
                self.cur += 1;
                continue;
            }
            if let Some(cipher) = &mut piece.cipher {
                cipher.apply_keystream(&mut out[..n]);
            }
            return Ok(n);
        }
    }

    async fn close(&mut self) {
        for piece in &mut self.pieces {
            if let Some(r) = &mut piece.reader {
                r.close().await;
            }
            piece.reader = None;
            piece.cipher = None;
        }
        self.cur = self.pieces.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::tests::{fetch_fn, read_to_end};
    use crate::testutil;
    use cipher::{KeyIvInit as _, StreamCipher as _, StreamCipherSeek as _};

    /// Encrypts `plain` in place with the layout used by [`StreamReader`].
    fn encrypt(plain: &mut [u8], password: &str, salt: &str, nonce: &[u8; 24], whole: bool) {
        let key = derive_key(password, salt).unwrap();
        for (start, end, base) in regions(plain.len() as u64, whole) {
            let Some(base) = base else { continue };
            let mut c = XSalsa20::new((&key).into(), nonce.into());
            c.seek(base);
            c.apply_keystream(&mut plain[start as usize..=end as usize]);
        }
    }

    fn reader(
        stored: &[u8],
        whole: bool,
        nonce: &[u8; 24],
        start: u64,
        end: u64,
    ) -> StreamReader {
        let meta = metadata::testutil::sample_meta(stored.len() as u64, 400_000);
        StreamReader::new(
            "hunter2".to_owned(),
            "salty".to_owned(),
            nonce,
            whole,
            stored.len() as u64,
            start,
            end,
            fetch_fn(meta, stored),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn whole_file_round_trip() {
        testutil::init();
        let nonce = [7u8; 24];
        let plain = testutil::pattern(10_000);
        let mut stored = plain.clone();
        encrypt(&mut stored, "hunter2", "salty", &nonce, true);
        assert_ne!(stored, plain);
        let mut r = reader(&stored, true, &nonce, 0, 9_999);
        assert_eq!(read_to_end(&mut r).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn head_tail_layout_round_trip() {
        testutil::init();
        let nonce = [9u8; 24];
        let size = 1_600_000usize; // > 2 * ENCRYPTED_REGION
        let plain = testutil::pattern(size);
        let mut stored = plain.clone();
        encrypt(&mut stored, "hunter2", "salty", &nonce, false);
        // The middle passes through unchanged.
        assert_eq!(
            &stored[ENCRYPTED_REGION as usize..size - ENCRYPTED_REGION as usize],
            &plain[ENCRYPTED_REGION as usize..size - ENCRYPTED_REGION as usize],
        );
        let mut r = reader(&stored, false, &nonce, 0, size as u64 - 1);
        assert_eq!(read_to_end(&mut r).await.unwrap(), plain);
    }

    #[tokio::test]
    async fn ranged_read_across_region_boundary() {
        testutil::init();
        let nonce = [1u8; 24];
        let size = 1_600_000usize;
        let plain = testutil::pattern(size);
        let mut stored = plain.clone();
        encrypt(&mut stored, "hunter2", "salty", &nonce, false);
        // 1000 bytes straddling the head/middle boundary.
        let start = ENCRYPTED_REGION - 500;
        let end = ENCRYPTED_REGION + 499;
        let mut r = reader(&stored, false, &nonce, start, end);
        assert_eq!(
            read_to_end(&mut r).await.unwrap(),
            &plain[start as usize..=end as usize]
        );
        // 1000 bytes inside the tail region.
        let start = size as u64 - 1000;
        let mut r = reader(&stored, false, &nonce, start, size as u64 - 1);
        assert_eq!(
            read_to_end(&mut r).await.unwrap(),
            &plain[start as usize..]
        );
    }

    #[tokio::test]
    async fn plaintext_middle_skips_key_derivation() {
        testutil::init();
        let nonce = [2u8; 24];
        let size = 1_600_000usize;
        let plain = testutil::pattern(size);
        let mut stored = plain.clone();
        encrypt(&mut stored, "wrong-password-never-derived", "s", &nonce, false);
        // Reading only the plaintext middle must not touch the key, so a
        // reader configured with a bogus password still succeeds.
        let meta = metadata::testutil::sample_meta(size as u64, 400_000);
        let mut r = StreamReader::new(
            "bogus".to_owned(),
            String::new(),
            &nonce,
            false,
            size as u64,
            800_000,
            800_999,
            fetch_fn(meta, &stored),
        )
        .unwrap();
        assert_eq!(
            read_to_end(&mut r).await.unwrap(),
            &plain[800_000..=800_999]
        );
    }

    #[test]
    fn bad_nonce_rejected_at_open() {
        let meta = metadata::testutil::sample_meta(100, 100);
        let stored = testutil::pattern(100);
        let err = StreamReader::new(
            "p".to_owned(),
            String::new(),
            &[0u8; 12],
            true,
            100,
            0,
            99,
            fetch_fn(meta, &stored),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
