// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Fwpatch Contributors 2025.

//! End-to-end run over synthetic images: verify the stock fingerprints,
//! apply one symbol patch, move one block into internal flash, finalize,
//! and check the output image against an independently constructed golden
//! copy.

use std::collections::HashMap;

use patchcore::config::{verify_image, HashWindow};
use patchcore::util::round_up_word;
use patchcore::{
    sha1_hex, Device, DeviceConfig, DeviceKind, Error, PatchValue, PatchableRegion, Phase,
    Region, Result, RwData, SymbolOracle,
};

const INT_BASE: u32 = 0x0800_0000;
const EXT_BASE: u32 = 0x9000_0000;
const INT_LEN: usize = 0x800;
const EXT_LEN: usize = 0x2000;
const STOCK_END: usize = 0x200;
const RESET_VECTOR: usize = 0x4;

struct MapOracle(HashMap<&'static str, u32>);

impl SymbolOracle for MapOracle {
    fn resolve(&self, name: &str) -> Result<u32> {
        self.0
            .get(name)
            .copied()
            .ok_or_else(|| Error::MissingSymbol(name.to_string()))
    }
}

fn config() -> DeviceConfig {
    DeviceConfig {
        kind: DeviceKind::Mk1,
        name: "synthetic",
        int_base: INT_BASE,
        int_len: INT_LEN,
        int_stock_end: STOCK_END,
        int_sha1: "",
        ext_base: EXT_BASE,
        ext_len: EXT_LEN,
        ext_enc_len: 0,
        ext_sha1: "",
        ext_hash_window: HashWindow::Full,
        scratch_base: 0x2400_0000,
        scratch_len: 0,
        key_offset: 0x40,
        nonce_offset: 0x50,
        rwdata_offset: 0x100,
        rwdata_len: 0,
        rwdata_capacity: 4,
        rwdata_decomp_fn: INT_BASE + 0x41,
        rwdata_backpatch: 0x80,
        ext_len_field: 0x90,
        reset_vector: RESET_VECTOR,
        ram_base: 0x0200_0000,
        ram_len: 0x2_0000,
    }
}

fn stock_internal() -> Vec<u8> {
    (0..INT_LEN)
        .map(|i| if i < STOCK_END { (i % 241) as u8 } else { 0 })
        .collect()
}

fn stock_external() -> Vec<u8> {
    (0..EXT_LEN).map(|i| (i % 199) as u8).collect()
}

fn device() -> Device {
    let cfg = config();
    let mut internal = Region::new("internal", stock_internal(), INT_BASE);
    internal.stock_end = Some(STOCK_END);
    let mut external = Region::new("external", stock_external(), EXT_BASE);
    external.stock_end = Some(EXT_LEN);
    let scratch = Region::zeroed("scratch", cfg.scratch_len, cfg.scratch_base);
    let rwdata = RwData::new(
        cfg.rwdata_offset,
        cfg.rwdata_decomp_fn,
        INT_BASE + 0x61,
        cfg.rwdata_capacity,
    );
    Device::from_parts(cfg, internal, external, scratch, rwdata, 1.4)
}

#[test]
fn full_run_matches_the_golden_image() {
    // Stock fingerprints, captured the way a device table would hold them.
    let golden_int_sha1 = sha1_hex(&stock_internal());
    let golden_ext_sha1 = sha1_hex(&stock_external());
    verify_image("internal", &stock_internal(), HashWindow::Full, &golden_int_sha1).unwrap();
    verify_image("external", &stock_external(), HashWindow::Full, &golden_ext_sha1).unwrap();
    assert!(matches!(
        verify_image("internal", &stock_external(), HashWindow::Full, &golden_int_sha1),
        Err(Error::InvalidStockImage { .. })
    ));

    let mut dev = device();
    let oracle = MapOracle(HashMap::from([("bootloader", INT_BASE + 0x501)]));

    // One literal symbol patch at the reset vector.
    dev.internal
        .replace(RESET_VECTOR, PatchValue::Symbol("bootloader"), &oracle)
        .unwrap();

    // One 64-byte block into the primary region.
    let moved = dev.external.read(0x300, 64).unwrap().to_vec();
    let new_addr = dev.move_to_primary(0x300, 64, &[]).unwrap();
    assert_eq!(new_addr, INT_BASE + STOCK_END as u32);

    let int_pos = dev.int_pos();
    let summary = dev.finalize().unwrap();
    assert_eq!(dev.phase(), Phase::Done);

    // Independently constructed golden output.
    let mut golden = Region::new("golden", stock_internal(), INT_BASE);
    golden
        .write_u32_le(RESET_VECTOR, INT_BASE + 0x501)
        .unwrap();
    golden.write_novel(STOCK_END, &moved).unwrap();
    // The boot table flush: descriptorless table (continuation word only)
    // at the table offset, end-of-table backpatch, no payload bytes.
    let slot_addr = INT_BASE + 0x100;
    golden
        .write_u32_le(0x100, (INT_BASE + 0x61).wrapping_sub(slot_addr))
        .unwrap();
    golden.write_u32_le(0x80, slot_addr + 4).unwrap();

    assert_eq!(sha1_hex(dev.internal.bytes()), sha1_hex(golden.bytes()));

    // The cursor obeys the word-rounding rule and the summary reports it.
    assert_eq!(int_pos, STOCK_END + round_up_word(64));
    assert_eq!(summary.internal_used, int_pos);
    assert_eq!(summary.internal_free, INT_LEN - int_pos);

    // Nothing shrank, so the external image kept its stock length.
    assert_eq!(summary.external_len, EXT_LEN);
}

#[test]
fn a_missing_move_surfaces_as_unknown_relocation() {
    let mut dev = device();
    dev.internal.write_u32_le(0x20, EXT_BASE + 0x700).unwrap();
    // No move ever recorded that address.
    assert!(matches!(
        dev.internal.apply_ledger(&dev.ledger, &[0x20]),
        Err(Error::UnknownRelocation { .. })
    ));
}
