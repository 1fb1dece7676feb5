// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Fwpatch Contributors 2025.

//! Alignment helpers shared by the placement engine and the table writer.

/// Flash page granularity; the external image may only shrink in whole pages.
pub const PAGE_SIZE: usize = 4096;

/// Word granularity for relocated data.
pub const WORD_SIZE: usize = 4;

pub fn round_down_word(val: usize) -> usize {
    val / WORD_SIZE * WORD_SIZE
}

pub fn round_up_word(val: usize) -> usize {
    val.div_ceil(WORD_SIZE) * WORD_SIZE
}

pub fn round_up_page(val: usize) -> usize {
    val.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Ceiling page rounding over a signed offset. The external shrink offset is
/// non-positive, so this rounds it toward zero.
pub fn round_up_page_i64(val: i64) -> i64 {
    let page = PAGE_SIZE as i64;
    (val + page - 1).div_euclid(page) * page
}
