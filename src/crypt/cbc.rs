// This file is part of nzbfs, a Usenet-backed streaming filesystem.
// Copyright (C) 2025 The nzbfs Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Seekable AES-CBC decryption.
//!
//! CBC block N is chained to ciphertext block N-1, so opening at an
//! arbitrary offset costs one extra 16-byte fetch: the previous ciphertext
//! block *is* the IV. Block 0 uses the original IV from the metadata.
//!
//! The plaintext size is approximated as the ciphertext size. That is an
//! upper bound (up to one block of padding is unknowable without
//! decrypting); callers must not rely on it for exact end-of-file
//! positioning, and the final block's padding bytes are delivered as-is.

use async_trait::async_trait;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, KeyIvInit as _};

use base::{bail, err, Error};

use super::FetchFn;
use crate::reader::{RangeRead, ReadError};

const BLOCK: usize = 16;

/// Decrypt granularity: how many blocks are decrypted per refill.
const BUF_BLOCKS: usize = 64;

enum Dec {
    Aes128(cbc::Decryptor<aes::Aes128>),
    Aes192(cbc::Decryptor<aes::Aes192>),
    Aes256(cbc::Decryptor<aes::Aes256>),
}

impl Dec {
    fn new(key: &[u8], iv: &[u8; BLOCK]) -> Result<Self, Error> {
        let r = match key.len() {
            16 => cbc::Decryptor::new_from_slices(key, iv).map(Dec::Aes128),
            24 => cbc::Decryptor::new_from_slices(key, iv).map(Dec::Aes192),
            32 => cbc::Decryptor::new_from_slices(key, iv).map(Dec::Aes256),
            n => bail!(
                InvalidArgument,
                msg("AES key must be 16, 24, or 32 bytes, not {n}")
            ),
        };
        r.map_err(|e| err!(InvalidArgument, msg("bad key/IV"), source(e)))
    }

    fn decrypt_block(&mut self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Dec::Aes128(d) => d.decrypt_block_mut(block),
            Dec::Aes192(d) => d.decrypt_block_mut(block),
            Dec::Aes256(d) => d.decrypt_block_mut(block),
        }
    }
}

struct State {
    reader: Box<dyn RangeRead>,
    dec: Dec,
    /// Ciphertext bytes not yet forming a decrypted block.
    raw: Vec<u8>,
    /// Decrypted bytes not yet delivered.
    pending: Vec<u8>,
    pending_off: usize,
    /// Plaintext bytes still to discard for sub-block alignment.
    skip: usize,
    /// Next plaintext offset to deliver.
    pos: u64,
    done: bool,
}

pub struct CbcReader {
    key: Vec<u8>,
    iv: [u8; BLOCK],
    stored_size: u64,
    start: u64,
    end: u64,
    fetch: FetchFn,
    state: Option<State>,
}

impl CbcReader {
    /// Validates key material synchronously; no I/O happens until the first
    /// read.
    pub fn new(
        key: &[u8],
        iv: &[u8],
        stored_size: u64,
        start: u64,
        end: u64,
        fetch: FetchFn,
    ) -> Result<Self, Error> {
        if !matches!(key.len(), 16 | 24 | 32) {
            bail!(
                InvalidArgument,
                msg("AES key must be 16, 24, or 32 bytes, not {}", key.len())
            );
        }
        let iv: [u8; BLOCK] = iv
            .try_into()
            .map_err(|_| err!(InvalidArgument, msg("IV must be {BLOCK} bytes")))?;
        Ok(CbcReader {
            key: key.to_vec(),
            iv,
            stored_size,
            start,
            end: end.min(stored_size.saturating_sub(1)),
            fetch,
            state: None,
        })
    }

    /// Recovers the IV for the block containing `self.start` and opens the
    /// ciphertext fetch at that block boundary.
    async fn open_state(&mut self) -> Result<(), ReadError> {
        let block = self.start / BLOCK as u64;
        let remainder = (self.start % BLOCK as u64) as usize;
        let iv = if block == 0 {
            self.iv
        } else {
            let at = (block - 1) * BLOCK as u64;
            let mut r = (self.fetch)(at, at + BLOCK as u64 - 1);
            let mut iv = [0u8; BLOCK];
            let mut got = 0;
            while got < BLOCK {
                match r.read(&mut iv[got..]).await? {
                    0 => {
                        r.close().await;
                        return Err(ReadError::Internal(err!(
                            DataLoss,
                            msg("short read recovering CBC IV at offset {at}")
                        )));
                    }
                    n => got += n,
                }
            }
            r.close().await;
            iv
        };
        // Fetch whole blocks through the one containing `end`.
        let fetch_end = ((self.end / BLOCK as u64 + 1) * BLOCK as u64 - 1)
            .min(self.stored_size.saturating_sub(1));
        let reader = (self.fetch)(block * BLOCK as u64, fetch_end);
        let dec = Dec::new(&self.key, &iv).map_err(ReadError::Internal)?;
        self.state = Some(State {
            reader,
            dec,
            raw: Vec::new(),
            pending: Vec::new(),
            pending_off: 0,
            skip: remainder,
            pos: self.start,
            done: false,
        });
        Ok(())
    }
}

#[async_trait]
impl RangeRead for CbcReader {
    async fn read(&mut self, out: &mut [u8]) -> Result<usize, ReadError> {
        if out.is_empty() || self.start > self.end || self.stored_size == 0 {
            return Ok(0);
        }
        if self.state.is_none() {
            self.open_state().await?;
        }
        let st = self.state.as_mut().unwrap();
        loop {
            let avail = st.pending.len() - st.pending_off;
            if avail > 0 {
                if st.pos > self.end {
                    return Ok(0);
                }
                let n = avail
                    .min(out.len())
                    .min((self.end - st.pos + 1) as usize);
                out[..n].copy_from_slice(&st.pending[st.pending_off..st.pending_off + n]);
                st.pending_off += n;
                st.pos += n as u64;
                if st.pending_off == st.pending.len() {
                    st.pending.clear();
                    st.pending_off = 0;
                }
                return Ok(n);
            }
            if st.done {
                return Ok(0);
            }
            let mut chunk = [0u8; BLOCK * BUF_BLOCKS];
            let n = st.reader.read(&mut chunk).await?;
            if n == 0 {
                st.done = true;
                if !st.raw.is_empty() {
                    return Err(ReadError::Internal(err!(
                        DataLoss,
                        msg(
                            "ciphertext ends with a {}-byte partial block",
                            st.raw.len()
                        )
                    )));
                }
                continue;
            }
            st.raw.extend_from_slice(&chunk[..n]);
            let nblocks = (st.raw.len() / BLOCK).min(BUF_BLOCKS);
            if nblocks == 0 {
                continue;
            }
            for i in 0..nblocks {
                st.dec.decrypt_block(&mut st.raw[i * BLOCK..(i + 1) * BLOCK]);
            }
            st.pending.extend(st.raw.drain(..nblocks * BLOCK));
            if st.skip > 0 {
                let s = st.skip.min(st.pending.len());
                st.pending_off = s;
                st.skip -= s;
                if st.pending_off == st.pending.len() {
                    st.pending.clear();
                    st.pending_off = 0;
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut st) = self.state.take() {
            st.reader.close().await;
        }
    }
}
