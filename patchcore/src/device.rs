// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Fwpatch Contributors 2025.

//! The placement engine.
//!
//! One `Device` owns the three regions, the relocation ledger, and the
//! write cursors for a single patch run. Data evicted from the external
//! image is routed to the cheapest destination that can hold it:
//!
//! 1. the scratch RAM pool, compressed, when the marginal compressed cost
//!    fits internal flash and the bytes-saved-per-compressed-byte ratio
//!    clears the admission threshold;
//! 2. internal flash, raw;
//! 3. the external image itself, shifted toward its logical start by the
//!    accumulated shrink offset.
//!
//! Operations have a strict temporal order: a reference can only be fixed
//! up after the move that recorded its target, so the run executes its
//! hand-ordered sequence exactly once. `InsufficientSpace` is consumed by
//! the fallback chain above; any other error aborts the run with no partial
//! output.

use crate::config::{verify_image, DeviceConfig, HashWindow};
use crate::crypt;
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::lzma::CompressCache;
use crate::patch::PatchableRegion;
use crate::region::Region;
use crate::rwdata::RwData;
use crate::util::{round_up_page_i64, round_up_word};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    Applying,
    Finalizing,
    Done,
    Failed,
}

/// What a finished run reports back.
#[derive(Debug)]
pub struct RunSummary {
    pub internal_used: usize,
    pub internal_free: usize,
    pub scratch_used: usize,
    pub scratch_free: usize,
    pub external_len: usize,
}

pub struct Device {
    pub config: DeviceConfig,
    pub internal: Region,
    pub external: Region,
    pub scratch: Region,
    pub ledger: Ledger,
    pub rwdata: RwData,
    cache: CompressCache,
    phase: Phase,
    /// Next free internal-flash offset.
    int_pos: usize,
    /// How far the external image's logical end has moved; non-positive
    /// until finalization page-rounds it.
    ext_offset: i64,
    /// Next free scratch offset.
    scratch_pos: usize,
    ratio_threshold: f64,
}

impl Device {
    /// Verify both stock images, build the regions, and decode the boot
    /// data table. All fixed offsets assume exactly these images, so a
    /// fingerprint mismatch is fatal here.
    pub fn new(
        config: &DeviceConfig,
        internal_image: Vec<u8>,
        external_image: Vec<u8>,
        ratio_threshold: f64,
    ) -> Result<Device> {
        verify_image("internal", &internal_image, HashWindow::Full, config.int_sha1)?;
        verify_image(
            "external",
            &external_image,
            config.ext_hash_window,
            config.ext_sha1,
        )?;

        let mut internal = Region::new("internal", internal_image, config.int_base);
        internal.stock_end = Some(config.int_stock_end);

        let mut external = Region::new("external", external_image, config.ext_base);
        external.stock_end = Some(config.ext_len);
        external.enc_end = config.ext_enc_len;

        let scratch = Region::zeroed("scratch", config.scratch_len, config.scratch_base);

        let rwdata = RwData::parse(
            &mut internal,
            config.rwdata_offset,
            config.rwdata_len,
            config.rwdata_decomp_fn,
            config.rwdata_capacity,
        )?;

        Ok(Device::from_parts(
            config.clone(),
            internal,
            external,
            scratch,
            rwdata,
            ratio_threshold,
        ))
    }

    /// Assemble a device from already-built parts, skipping verification.
    pub fn from_parts(
        config: DeviceConfig,
        internal: Region,
        external: Region,
        scratch: Region,
        rwdata: RwData,
        ratio_threshold: f64,
    ) -> Device {
        let int_pos = internal.stock_end.unwrap_or(internal.len());
        Device {
            config,
            internal,
            external,
            scratch,
            ledger: Ledger::new(),
            rwdata,
            cache: CompressCache::new(),
            phase: Phase::Init,
            int_pos,
            ext_offset: 0,
            scratch_pos: 0,
            ratio_threshold,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn int_pos(&self) -> usize {
        self.int_pos
    }

    pub fn ext_offset(&self) -> i64 {
        self.ext_offset
    }

    pub fn scratch_pos(&self) -> usize {
        self.scratch_pos
    }

    pub fn cache(&self) -> &CompressCache {
        &self.cache
    }

    fn ensure_applying(&mut self) -> Result<()> {
        match self.phase {
            Phase::Init => {
                self.phase = Phase::Applying;
                Ok(())
            }
            Phase::Applying => Ok(()),
            phase => Err(Error::InvalidPatch(format!(
                "patch operation in {phase:?} phase"
            ))),
        }
    }

    /// Splice the compiled novel code past the stock boundary. The image
    /// must be a full internal-flash build; the write cursor lands after
    /// the last meaningful byte.
    pub fn install_novel_code(&mut self, image: &[u8]) -> Result<usize> {
        self.ensure_applying()?;
        if image.len() != self.internal.len() {
            return Err(Error::InvalidPatch(format!(
                "novel-code image is {} bytes, expected {}",
                image.len(),
                self.internal.len()
            )));
        }
        let stock_end = self.internal.stock_end.unwrap_or(0);
        self.internal.write_novel(stock_end, &image[stock_end..])?;
        let used = image[stock_end..]
            .iter()
            .rposition(|b| *b != 0)
            .map(|i| stock_end + i + 1)
            .unwrap_or(stock_end);
        self.int_pos = round_up_word(used);
        Ok(used - stock_end)
    }

    /// Grow the internal image (256 KiB builds).
    pub fn extend_internal(&mut self, n: usize) {
        self.internal.extend(n);
    }

    /// Account external bytes reclaimed outside the routing helpers
    /// (deleted assets, in-place compression savings).
    pub fn reclaim_external(&mut self, bytes: usize) {
        self.ext_offset -= bytes as i64;
    }

    /// Internal flash still available for raw placements: capacity behind
    /// the cursor, minus the compressed footprint already committed to
    /// scratch, minus the boot table's projected compressed footprint.
    pub fn internal_free(&mut self) -> Result<usize> {
        let scratch_committed = if self.scratch_pos == 0 {
            0
        } else {
            self.cache
                .compressed_len(&self.scratch.bytes()[..self.scratch_pos])?
        };
        let projected = self.rwdata.compressed_len(&mut self.cache)?;
        Ok(self
            .internal
            .len()
            .saturating_sub(self.int_pos + scratch_committed + projected))
    }

    fn apply_refs(&mut self, refs: &[usize]) -> Result<()> {
        self.internal.apply_ledger(&self.ledger, refs)
    }

    /// Move `size` external bytes to internal flash. Fails with
    /// `InsufficientSpace` when the remaining internal budget cannot take
    /// them; on success the source is erased, the mapping recorded, `refs`
    /// rewritten, and the cursor advanced word-aligned.
    pub fn move_to_primary(
        &mut self,
        src_offset: usize,
        size: usize,
        refs: &[usize],
    ) -> Result<u32> {
        self.ensure_applying()?;
        let free = self.internal_free()?;
        if free < size {
            return Err(Error::InsufficientSpace {
                needed: size,
                available: free,
            });
        }
        let dst = self.int_pos;
        let bytes = self.external.read(src_offset, size)?.to_vec();
        self.internal.write_novel(dst, &bytes)?;
        self.external.clear_range(src_offset, src_offset + size)?;
        self.ledger.record_range(
            self.external.base.wrapping_add(src_offset as u32),
            self.internal.base.wrapping_add(dst as u32),
            size,
        );
        self.apply_refs(refs)?;
        self.int_pos += round_up_word(size);
        Ok(self.internal.base.wrapping_add(dst as u32))
    }

    /// Relocate within the external image by the accumulated shrink offset.
    /// Always placeable — external capacity is the one resource this pass
    /// never runs out of — but reclaims no internal space.
    pub fn move_to_secondary(
        &mut self,
        src_offset: usize,
        size: usize,
        refs: &[usize],
    ) -> Result<u32> {
        self.ensure_applying()?;
        let delta = self.ext_offset;
        let Device {
            external, ledger, ..
        } = self;
        external.move_range(src_offset, delta, size, ledger)?;
        self.apply_refs(refs)?;
        let new_off = (src_offset as i64 + delta) as u32;
        Ok(self.external.base.wrapping_add(new_off))
    }

    /// Primary placement with the external shift as fallback.
    pub fn route(&mut self, src_offset: usize, size: usize, refs: &[usize]) -> Result<u32> {
        match self.move_to_primary(src_offset, size, refs) {
            Err(Error::InsufficientSpace { .. }) => {
                self.move_to_secondary(src_offset, size, refs)
            }
            result => result,
        }
    }

    /// Compression-aware placement. Tentatively appends the bytes to the
    /// scratch pool and prices the move by the marginal compressed cost of
    /// the grown prefix. Reverts the copy and falls back when the cost does
    /// not fit internal flash or the savings ratio is below the admission
    /// threshold; otherwise commits, retiring the external source.
    pub fn route_compressible(
        &mut self,
        src_offset: usize,
        size: usize,
        refs: &[usize],
    ) -> Result<u32> {
        self.ensure_applying()?;
        let pos = self.scratch_pos;
        if pos + size > self.scratch.len() {
            return self.route(src_offset, size, refs);
        }

        let bytes = self.external.read(src_offset, size)?.to_vec();
        self.scratch.write_novel(pos, &bytes)?;

        let before = self.cache.compressed_len(&self.scratch.bytes()[..pos])?;
        let after = self
            .cache
            .compressed_len(&self.scratch.bytes()[..pos + size])?;
        let delta = after.saturating_sub(before);

        let free = self.internal_free()?;
        if delta > free {
            self.scratch.clear_range(pos, pos + size)?;
            return self.move_to_secondary(src_offset, size, refs);
        }

        let ratio = if delta == 0 {
            f64::INFINITY
        } else {
            size as f64 / delta as f64
        };
        if ratio < self.ratio_threshold {
            self.scratch.clear_range(pos, pos + size)?;
            return self.route(src_offset, size, refs);
        }

        self.external.clear_range(src_offset, src_offset + size)?;
        self.ledger.record_range(
            self.external.base.wrapping_add(src_offset as u32),
            self.scratch.base.wrapping_add(pos as u32),
            size,
        );
        self.apply_refs(refs)?;
        let aligned = round_up_word(size);
        self.scratch_pos = pos + aligned;
        self.ext_offset -= aligned as i64;
        Ok(self.scratch.base.wrapping_add(pos as u32))
    }

    /// Rewrite, via the ledger, every stored address in the decoded boot
    /// blocks that falls inside the given external range.
    pub fn rwdata_lookup(&mut self, ext_offset: usize, size: usize) -> Result<()> {
        let lo = self.external.base.wrapping_add(ext_offset as u32);
        let Device { rwdata, ledger, .. } = self;
        for block in rwdata.blocks_mut() {
            let mut i = 0;
            while i + 4 <= block.data.len() {
                let val = u32::from_le_bytes([
                    block.data[i],
                    block.data[i + 1],
                    block.data[i + 2],
                    block.data[i + 3],
                ]);
                if val.wrapping_sub(lo) < size as u32 {
                    let new = ledger
                        .lookup(val)
                        .ok_or(Error::UnknownRelocation { addr: val, offset: i })?;
                    block.data[i..i + 4].copy_from_slice(&new.to_le_bytes());
                }
                i += 4;
            }
        }
        Ok(())
    }

    /// Zero every stored address in the decoded boot blocks that falls
    /// inside the given external range — for data deleted outright, so
    /// stale pointers neither survive nor hurt compressibility.
    pub fn rwdata_erase(&mut self, ext_offset: usize, size: usize) -> Result<()> {
        let lo = self.external.base.wrapping_add(ext_offset as u32);
        for block in self.rwdata.blocks_mut() {
            let mut i = 0;
            while i + 4 <= block.data.len() {
                let val = u32::from_le_bytes([
                    block.data[i],
                    block.data[i + 1],
                    block.data[i + 2],
                    block.data[i + 3],
                ]);
                if val.wrapping_sub(lo) < size as u32 {
                    block.data[i..i + 4].fill(0);
                }
                i += 4;
            }
        }
        Ok(())
    }

    /// Run the keystream over the external image's enciphered window with
    /// the key material stored in internal flash. Involutory: decrypts the
    /// stock image, re-encrypts the patched one.
    pub fn crypt(&mut self) -> Result<usize> {
        let mut key = [0u8; crypt::KEY_LEN];
        key.copy_from_slice(self.internal.read(self.config.key_offset, crypt::KEY_LEN)?);
        let mut nonce = [0u8; crypt::NONCE_LEN];
        nonce.copy_from_slice(
            self.internal
                .read(self.config.nonce_offset, crypt::NONCE_LEN)?,
        );
        Ok(crypt::crypt(&mut self.external, &key, &nonce))
    }

    /// Flush the boot table, page-round the accumulated shrink, patch the
    /// cached external-length word, and truncate the external image.
    pub fn finalize(&mut self) -> Result<RunSummary> {
        self.ensure_applying()?;
        self.phase = Phase::Finalizing;
        match self.finalize_inner() {
            Ok(summary) => {
                self.phase = Phase::Done;
                Ok(summary)
            }
            Err(err) => {
                self.phase = Phase::Failed;
                Err(err)
            }
        }
    }

    fn finalize_inner(&mut self) -> Result<RunSummary> {
        if self.scratch_pos > 0 {
            let blob = self.scratch.bytes()[..self.scratch_pos].to_vec();
            self.rwdata.append(blob, self.scratch.base)?;
        }

        let Device {
            rwdata,
            internal,
            cache,
            config,
            int_pos,
            ..
        } = self;
        let written =
            rwdata.write_table_and_data(internal, cache, config.rwdata_backpatch, Some(*int_pos))?;
        *int_pos += written;

        // Keep the trailing encrypted/plaintext boundary page-aligned.
        self.ext_offset = round_up_page_i64(self.ext_offset);
        if self.ext_offset != 0 {
            self.internal
                .add(self.config.ext_len_field, self.ext_offset, 4)?;
            self.external.shrink((-self.ext_offset) as usize)?;
        }

        Ok(RunSummary {
            internal_used: self.int_pos,
            internal_free: self.internal.len().saturating_sub(self.int_pos),
            scratch_used: self.scratch_pos,
            scratch_free: self.scratch.len().saturating_sub(self.scratch_pos),
            external_len: self.external.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceKind;

    fn test_config(int_len: usize, ext_len: usize, scratch_len: usize) -> DeviceConfig {
        DeviceConfig {
            kind: DeviceKind::Mk1,
            name: "test",
            int_base: 0x0800_0000,
            int_len,
            int_stock_end: 0x100,
            int_sha1: "",
            ext_base: 0x9000_0000,
            ext_len,
            ext_enc_len: 0,
            ext_sha1: "",
            ext_hash_window: HashWindow::Full,
            scratch_base: 0x2400_0000,
            scratch_len,
            key_offset: 0,
            nonce_offset: 0x10,
            rwdata_offset: 0x80,
            rwdata_len: 0,
            rwdata_capacity: 4,
            rwdata_decomp_fn: 0x0800_0041,
            rwdata_backpatch: 0x40,
            ext_len_field: 0x60,
            reset_vector: 0x4,
            ram_base: 0x0200_0000,
            ram_len: 0x2_0000,
        }
    }

    fn test_device(config: DeviceConfig, ratio_threshold: f64) -> Device {
        let mut internal = Region::new("internal", vec![0; config.int_len], config.int_base);
        internal.stock_end = Some(config.int_stock_end);
        let mut external = Region::new(
            "external",
            (0..config.ext_len).map(|i| (i % 251) as u8).collect(),
            config.ext_base,
        );
        external.stock_end = Some(config.ext_len);
        let scratch = Region::zeroed("scratch", config.scratch_len, config.scratch_base);
        let rwdata = RwData::new(
            config.rwdata_offset,
            config.rwdata_decomp_fn,
            0x0800_0061,
            config.rwdata_capacity,
        );
        Device::from_parts(config, internal, external, scratch, rwdata, ratio_threshold)
    }

    #[test]
    fn primary_move_relocates_and_fixes_references() {
        let mut device = test_device(test_config(0x400, 0x400, 0), 1.4);
        let src = device.external.read(0x10, 0x40).unwrap().to_vec();
        // A stock word referencing byte 4 of the block about to move.
        device.internal.write_u32_le(0x20, 0x9000_0014).unwrap();

        let new_addr = device.move_to_primary(0x10, 0x40, &[0x20]).unwrap();
        assert_eq!(new_addr, 0x0800_0100);
        assert_eq!(device.internal.read(0x100, 0x40).unwrap(), src.as_slice());
        assert!(device.external.read(0x10, 0x40).unwrap().iter().all(|b| *b == 0));
        assert_eq!(device.internal.read_u32_le(0x20).unwrap(), 0x0800_0104);
        assert_eq!(device.int_pos(), 0x140);
    }

    #[test]
    fn primary_move_respects_the_budget() {
        let mut device = test_device(test_config(0x400, 0x400, 0), 1.4);
        assert!(matches!(
            device.move_to_primary(0, 0x400, &[]),
            Err(Error::InsufficientSpace { needed: 0x400, .. })
        ));
    }

    #[test]
    fn route_falls_back_to_the_external_shift() {
        let mut device = test_device(test_config(0x400, 0x400, 0), 1.4);
        device.reclaim_external(0x20);
        let src = device.external.read(0x40, 0x320).unwrap().to_vec();

        let new_addr = device.route(0x40, 0x320, &[]).unwrap();
        assert_eq!(new_addr, 0x9000_0020);
        assert_eq!(device.external.read(0x20, 0x320).unwrap(), src.as_slice());
        // The unoverlapped source tail is retired.
        assert!(device.external.read(0x340, 0x20).unwrap().iter().all(|b| *b == 0));
        assert_eq!(device.ledger.lookup(0x9000_0040), Some(0x9000_0020));
    }

    #[test]
    fn compressible_data_is_parked_in_scratch() {
        let mut device = test_device(test_config(0x400, 0x400, 0x200), 1.4);
        device.external.fill(0x10, 0x110, 0xAA).unwrap();
        device.internal.write_u32_le(0x20, 0x9000_0010).unwrap();

        let new_addr = device.route_compressible(0x10, 0x100, &[0x20]).unwrap();
        assert_eq!(new_addr, 0x2400_0000);
        assert!(device.scratch.read(0, 0x100).unwrap().iter().all(|b| *b == 0xAA));
        assert!(device.external.read(0x10, 0x100).unwrap().iter().all(|b| *b == 0));
        assert_eq!(device.internal.read_u32_le(0x20).unwrap(), 0x2400_0000);
        assert_eq!(device.scratch_pos(), 0x100);
        assert_eq!(device.ext_offset(), -0x100);
    }

    #[test]
    fn poor_ratio_falls_back_to_raw_placement() {
        let mut device = test_device(test_config(0x400, 0x400, 0x200), 1e9);
        device.external.fill(0x10, 0x110, 0xAA).unwrap();
        let src = device.external.read(0x10, 0x100).unwrap().to_vec();

        let new_addr = device.route_compressible(0x10, 0x100, &[]).unwrap();
        // Reverted: scratch untouched, data raw in internal flash.
        assert!(device.scratch.bytes().iter().all(|b| *b == 0));
        assert_eq!(device.scratch_pos(), 0);
        assert_eq!(new_addr, 0x0800_0100);
        assert_eq!(device.internal.read(0x100, 0x100).unwrap(), src.as_slice());
    }

    #[test]
    fn fallback_matches_plain_route_when_the_budget_is_full() {
        // No internal budget at all: the marginal cost can never fit.
        let mut config = test_config(0x100, 0x400, 0x200);
        config.int_stock_end = 0x100;

        let mut by_heuristic = test_device(config.clone(), 1.4);
        let mut by_route = test_device(config, 1.4);

        let a = by_heuristic.route_compressible(0x40, 0x80, &[]).unwrap();
        let b = by_route.route(0x40, 0x80, &[]).unwrap();

        assert_eq!(a, b);
        assert_eq!(by_heuristic.external.bytes(), by_route.external.bytes());
        assert!(by_heuristic.scratch.bytes().iter().all(|b| *b == 0));
        assert_eq!(by_heuristic.scratch_pos(), 0);
    }

    #[test]
    fn boot_blocks_are_scanned_for_retired_addresses() {
        let mut device = test_device(test_config(0x400, 0x400, 0), 1.4);
        device
            .rwdata
            .append(0x9000_0014u32.to_le_bytes().to_vec(), 0x0200_0000)
            .unwrap();
        device
            .rwdata
            .append(0x9000_0214u32.to_le_bytes().to_vec(), 0x0200_1000)
            .unwrap();

        device.move_to_primary(0x10, 0x20, &[]).unwrap();
        device.rwdata_lookup(0x10, 0x20).unwrap();
        assert_eq!(device.rwdata.blocks()[0].data, 0x0800_0104u32.to_le_bytes());

        device.rwdata_erase(0x210, 0x20).unwrap();
        assert_eq!(device.rwdata.blocks()[1].data, [0u8; 4]);
    }

    #[test]
    fn finalize_rounds_patches_and_truncates() {
        let mut device = test_device(test_config(0x400, 0x2000, 0x200), 1.4);
        device.external.fill(0x10, 0x110, 0xAA).unwrap();
        device.route_compressible(0x10, 0x100, &[]).unwrap();
        device.reclaim_external(5000);

        let int_pos_before = device.int_pos();
        let summary = device.finalize().unwrap();

        // -0x100 - 5000, page-rounded toward zero.
        assert_eq!(device.ext_offset(), -4096);
        assert_eq!(summary.external_len, 0x2000 - 4096);
        assert_eq!(device.internal.read_u32_le(0x60).unwrap(), 0xFFFF_F000);

        // The scratch pool became one more boot block, flushed behind the
        // write cursor.
        assert_eq!(device.rwdata.len(), 1);
        assert_eq!(device.rwdata.blocks()[0].dest, 0x2400_0000);
        assert!(summary.internal_used > int_pos_before);
        assert_eq!(device.phase(), Phase::Done);

        // The run is sealed.
        assert!(matches!(
            device.move_to_primary(0, 4, &[]),
            Err(Error::InvalidPatch(_))
        ));
    }

    #[test]
    fn novel_code_is_spliced_and_measured() {
        let mut device = test_device(test_config(0x400, 0x400, 0), 1.4);
        assert_eq!(device.phase(), Phase::Init);
        let mut image = vec![0u8; 0x400];
        image[0x100..0x10A].fill(0xC3);

        assert_eq!(device.install_novel_code(&image).unwrap(), 0x0A);
        assert_eq!(device.phase(), Phase::Applying);
        assert_eq!(device.int_pos(), 0x10C);
        assert_eq!(device.internal.read(0x100, 10).unwrap(), &[0xC3; 10]);

        assert!(matches!(
            device.install_novel_code(&[0u8; 4]),
            Err(Error::InvalidPatch(_))
        ));
    }
}
