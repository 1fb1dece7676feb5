// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Fwpatch Contributors 2025.

//! LZMA re-encoder for relocated blocks.
//!
//! Blocks that must survive firmware reset are re-encoded with plain LZMA1
//! and expanded at boot by the decoder already resident in the firmware.
//! That decoder consumes a raw stream with fixed parameters, so the encode
//! side strips the 13-byte alone-format header (5 bytes of properties plus
//! the 8-byte unknown-size field) before the bytes go into the image.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::Write;

use sha1::{Digest, Sha1};
use xz2::stream::{LzmaOptions, Stream};
use xz2::write::XzEncoder;

use crate::error::{Error, Result};

/// The resident decoder's dictionary is carved out of a small RAM pool.
const DICT_SIZE: u32 = 16 * 1024;
const PRESET: u32 = 6;

/// Alone-format header: properties byte, dictionary size, unknown length.
pub const HEADER_LEN: usize = 13;

fn codec(err: impl std::fmt::Display) -> Error {
    Error::Codec(format!("lzma: {err}"))
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut opts = LzmaOptions::new_preset(PRESET).map_err(|e| codec(e))?;
    opts.dict_size(DICT_SIZE);
    let stream = Stream::new_lzma_encoder(&opts).map_err(|e| codec(e))?;
    let mut encoder = XzEncoder::new_stream(Vec::new(), stream);
    encoder.write_all(data).map_err(|e| codec(e))?;
    let out = encoder.finish().map_err(|e| codec(e))?;
    if out.len() < HEADER_LEN {
        return Err(codec("encoder produced no alone-format header"));
    }
    Ok(out[HEADER_LEN..].to_vec())
}

/// Content-keyed memo for compressed output.
///
/// The placement heuristic repeatedly compresses a growing prefix of the
/// scratch region and the boot-data blocks; keying by content hash makes
/// those repeated queries O(1) after the first encode. One cache lives for
/// one run, owned by the placement engine, so reruns start cold.
#[derive(Default)]
pub struct CompressCache {
    map: HashMap<[u8; 20], Vec<u8>>,
    hits: usize,
    misses: usize,
}

impl CompressCache {
    pub fn new() -> CompressCache {
        CompressCache::default()
    }

    fn key(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    pub fn compress(&mut self, data: &[u8]) -> Result<&[u8]> {
        match self.map.entry(Self::key(data)) {
            Entry::Occupied(entry) => {
                self.hits += 1;
                Ok(entry.into_mut().as_slice())
            }
            Entry::Vacant(entry) => {
                self.misses += 1;
                Ok(entry.insert(compress(data)?).as_slice())
            }
        }
    }

    pub fn compressed_len(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.compress(data)?.len())
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }
}
