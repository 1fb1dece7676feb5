// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Fwpatch Contributors 2025.

//! Failure taxonomy for a patch run.
//!
//! `InsufficientSpace` is the one variant expected during normal operation;
//! the placement fallback chain consumes it. Everything else aborts the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The input image is not the stock image all patch offsets were
    /// reverse-engineered against.
    #[error("{name} image fingerprint mismatch: got {actual}, expected {expected}")]
    InvalidStockImage {
        name: &'static str,
        actual: String,
        expected: String,
    },

    #[error("cannot resolve symbol: {0}")]
    MissingSymbol(String),

    #[error("{region}: access of {len} bytes at 0x{offset:08X} exceeds region length 0x{region_len:08X}")]
    OutOfRange {
        region: &'static str,
        offset: usize,
        len: usize,
        region_len: usize,
    },

    /// A checked write landed at or past the stock-firmware boundary without
    /// novel-code authorization.
    #[error("{region}: write at 0x{offset:08X} crosses the stock boundary 0x{stock_end:08X}")]
    StockRegionViolation {
        region: &'static str,
        offset: usize,
        stock_end: usize,
    },

    #[error("need {needed} bytes, only {available} free")]
    InsufficientSpace { needed: usize, available: usize },

    /// A reference fix-up found an address that no move ever recorded.
    #[error("address 0x{addr:08X} at offset 0x{offset:08X} was never relocated")]
    UnknownRelocation { addr: u32, offset: usize },

    /// Malformed compressed block, or an instruction that does not fit its
    /// addressing range.
    #[error("codec: {0}")]
    Codec(String),

    #[error("boot data table is full ({capacity} entries)")]
    RwDataCapacity { capacity: usize },

    /// Bad collaborator artifact: wrong-length novel-code binary,
    /// unparseable symbol file, and the like.
    #[error("invalid patch artifact: {0}")]
    InvalidPatch(String),
}

pub type Result<T> = core::result::Result<T, Error>;
