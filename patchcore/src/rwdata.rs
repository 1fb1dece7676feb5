// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Fwpatch Contributors 2025.

//! The boot-time compressed-block table.
//!
//! At reset the firmware walks a table of 16-byte descriptors, each handing
//! a compressed block to the decompression routine to expand into RAM. A
//! descriptor holds, little-endian: a function pointer relative to its own
//! slot, a data offset relative to its second field, the block length stored
//! doubled, and the RAM destination. One trailing word after the last
//! descriptor chains to the next initialization routine.
//!
//! Parsing decodes every block (retiring the source bytes and the table
//! region itself so free-space accounting can reuse neither), after which
//! blocks can be edited or appended — destinations are positional references
//! elsewhere in code, so existing entries never reorder. Writing re-encodes
//! every block with the resident LZMA decoder's framing and lays the table
//! back down.

use crate::error::{Error, Result};
use crate::lz;
use crate::lzma::CompressCache;
use crate::region::Region;

pub const ENTRY_LEN: usize = 16;

pub struct Block {
    /// Decoded bytes, mutable until the table is rewritten.
    pub data: Vec<u8>,
    /// RAM address the device expands this block to.
    pub dest: u32,
}

pub struct RwData {
    table_start: usize,
    /// Absolute address of the device's decompression routine; every stock
    /// descriptor must point at it.
    decomp_fn: u32,
    /// Absolute target of the trailing continuation word.
    continuation: u32,
    capacity: usize,
    stock_entries: usize,
    blocks: Vec<Block>,
}

impl RwData {
    /// Empty table that never existed in the stock image (devices without
    /// boot-time compressed data, and tests).
    pub fn new(table_start: usize, decomp_fn: u32, continuation: u32, capacity: usize) -> RwData {
        RwData {
            table_start,
            decomp_fn,
            continuation,
            capacity,
            stock_entries: 0,
            blocks: Vec::new(),
        }
    }

    /// Scan `table_len / 16` descriptors at `table_start`, decode every
    /// block, and claim the consumed source bytes and the table region.
    pub fn parse(
        region: &mut Region,
        table_start: usize,
        table_len: usize,
        decomp_fn: u32,
        capacity: usize,
    ) -> Result<RwData> {
        let entries = table_len / ENTRY_LEN;
        let mut blocks = Vec::with_capacity(entries);

        for i in 0..entries {
            let entry_off = table_start + i * ENTRY_LEN;
            let entry_addr = region.base.wrapping_add(entry_off as u32);

            let fn_abs = entry_addr.wrapping_add(region.read_u32_le(entry_off)?);
            if fn_abs != decomp_fn {
                return Err(Error::Codec(format!(
                    "boot table entry {i} names routine 0x{fn_abs:08X}, expected 0x{decomp_fn:08X}"
                )));
            }

            let src_abs = entry_addr
                .wrapping_add(4)
                .wrapping_add(region.read_u32_le(entry_off + 4)?);
            let src_off = src_abs.wrapping_sub(region.base) as usize;
            let len = (region.read_u32_le(entry_off + 8)? >> 1) as usize;
            let dest = region.read_u32_le(entry_off + 12)?;

            let packed = region.read(src_off, len)?.to_vec();
            let data = lz::decompress(&packed)?;
            // The source bytes are void once decoded.
            region.clear_range(src_off, src_off + len)?;

            blocks.push(Block { data, dest });
        }

        let slot_off = table_start + entries * ENTRY_LEN;
        let continuation = region
            .base
            .wrapping_add(slot_off as u32)
            .wrapping_add(region.read_u32_le(slot_off)?);

        // Claim the table region so free-space scans do not reuse it.
        region.clear_range(table_start, slot_off + 4)?;

        Ok(RwData {
            table_start,
            decomp_fn,
            continuation,
            capacity,
            stock_entries: entries,
            blocks,
        })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [Block] {
        &mut self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Append one more block for the device to expand at boot.
    pub fn append(&mut self, data: Vec<u8>, dest: u32) -> Result<()> {
        if self.blocks.len() >= self.capacity {
            return Err(Error::RwDataCapacity {
                capacity: self.capacity,
            });
        }
        self.blocks.push(Block { data, dest });
        Ok(())
    }

    /// Sum of the blocks' compressed sizes — the table's projected footprint
    /// in internal flash, O(1) per repeated query through the cache.
    pub fn compressed_len(&self, cache: &mut CompressCache) -> Result<usize> {
        let mut total = 0;
        for block in &self.blocks {
            total += cache.compressed_len(&block.data)?;
        }
        Ok(total)
    }

    /// Re-encode every block and lay the table back down at its original
    /// start, payloads at `data_offset` (default: right after the table).
    /// The word at `backpatch_offset` is pointed at the first byte past the
    /// rewritten table so code outside it can find its end. Returns the
    /// bytes the caller's write cursor must advance: payload bytes plus any
    /// growth of the table beyond its stock extent.
    pub fn write_table_and_data(
        &mut self,
        region: &mut Region,
        cache: &mut CompressCache,
        backpatch_offset: usize,
        data_offset: Option<usize>,
    ) -> Result<usize> {
        let table_bytes = self.blocks.len() * ENTRY_LEN + 4;
        let data_start = data_offset.unwrap_or(self.table_start + table_bytes);
        let mut data_pos = data_start;

        for (i, block) in self.blocks.iter().enumerate() {
            let packed = cache.compress(&block.data)?.to_vec();
            let entry_off = self.table_start + i * ENTRY_LEN;
            let entry_addr = region.base.wrapping_add(entry_off as u32);
            let data_addr = region.base.wrapping_add(data_pos as u32);

            region.write_u32_le(entry_off, self.decomp_fn.wrapping_sub(entry_addr))?;
            region.write_u32_le(
                entry_off + 4,
                data_addr.wrapping_sub(entry_addr.wrapping_add(4)),
            )?;
            region.write_u32_le(entry_off + 8, (packed.len() as u32) << 1)?;
            region.write_u32_le(entry_off + 12, block.dest)?;

            region.write_novel(data_pos, &packed)?;
            data_pos += packed.len();
        }

        let slot_off = self.table_start + self.blocks.len() * ENTRY_LEN;
        let slot_addr = region.base.wrapping_add(slot_off as u32);
        region.write_u32_le(slot_off, self.continuation.wrapping_sub(slot_addr))?;

        let end_addr = slot_addr.wrapping_add(4);
        region.write_u32_le(backpatch_offset, end_addr)?;

        let stock_bytes = self.stock_entries * ENTRY_LEN + 4;
        Ok((data_pos - data_start) + table_bytes.saturating_sub(stock_bytes))
    }
}
