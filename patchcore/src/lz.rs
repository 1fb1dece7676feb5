// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Fwpatch Contributors 2025.

//! The device's boot-time block decompressor.
//!
//! The boot ROM expands a handful of compressed blocks into RAM before the
//! firmware proper starts. The format is a byte-oriented LZ variant: each
//! opcode byte packs a literal-run length, a back-reference offset high
//! code, and a back-reference length. This implementation reproduces the
//! device routine bit-exactly; it is decode-only (re-encoding goes through
//! the firmware's resident LZMA decoder instead, see [`crate::lzma`]).
//!
//! Opcode byte layout, LSB first:
//! - bits 0..2: literal run code; 0 means an extension byte follows
//!   (`byte + 3`), then one is subtracted (a code never means "zero runs").
//! - bits 2..4: offset high code; 3 means the real high byte follows the
//!   offset low byte in the stream.
//! - bits 4..8: back-reference length code; 0xF adds a following extension
//!   byte. A non-zero final code emits `code + 2` bytes, each copied from
//!   `out[out.len() - offset]` at the moment of emission, so a reference
//!   shorter than its run legally replays bytes it just produced.
//!
//! There is no end marker; the caller's declared block length bounds the
//! input.

use crate::error::{Error, Result};

fn take(data: &[u8], index: &mut usize) -> Result<u8> {
    let b = data
        .get(*index)
        .copied()
        .ok_or_else(|| Error::Codec(format!("compressed block truncated at byte {}", *index)))?;
    *index += 1;
    Ok(b)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut index = 0;
    let mut out = Vec::with_capacity(data.len() * 2);

    while index < data.len() {
        let opcode = take(data, &mut index)?;

        let mut direct_len = (opcode & 0x03) as usize;
        let offset_hi_code = ((opcode >> 2) & 0x03) as usize;
        let mut pattern_len = (opcode >> 4) as usize;

        if direct_len == 0 {
            direct_len = take(data, &mut index)? as usize + 3;
        }
        direct_len -= 1;

        if pattern_len == 0xF {
            pattern_len += take(data, &mut index)? as usize;
        }

        for _ in 0..direct_len {
            let b = take(data, &mut index)?;
            out.push(b);
        }

        if pattern_len > 0 {
            let offset_lo = take(data, &mut index)? as usize;
            let offset_hi = if offset_hi_code == 0x3 {
                take(data, &mut index)? as usize
            } else {
                offset_hi_code
            };
            let offset = offset_lo + offset_hi * 256;

            if offset == 0 || offset > out.len() {
                return Err(Error::Codec(format!(
                    "back-reference offset {offset} outside the {} bytes emitted so far",
                    out.len()
                )));
            }

            for _ in 0..pattern_len + 2 {
                let b = out[out.len() - offset];
                out.push(b);
            }
        }
    }

    Ok(out)
}
