// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Fwpatch Contributors 2025.

//! Device variants.
//!
//! Every supported device model is one entry in a static table: stock image
//! fingerprints, the fixed offsets reverse-engineered against those exact
//! images, and region geometry. All patch offsets are only meaningful
//! against the verified stock layout, which is why a fingerprint mismatch is
//! fatal rather than a warning.

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::symbols::AddressWindow;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// Original clock-and-platformer model.
    Mk1,
    /// Later adventure model.
    Mk2,
}

/// Which part of an image the stock fingerprint covers.
#[derive(Copy, Clone, Debug)]
pub enum HashWindow {
    Full,
    /// Everything but a trailing save area that the factory leaves mutable.
    AllButTrailing(usize),
    /// A fixed `[start, end)` window.
    Range(usize, usize),
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub name: &'static str,

    pub int_base: u32,
    pub int_len: usize,
    pub int_stock_end: usize,
    pub int_sha1: &'static str,

    pub ext_base: u32,
    pub ext_len: usize,
    pub ext_enc_len: usize,
    pub ext_sha1: &'static str,
    pub ext_hash_window: HashWindow,

    /// Fast-but-small RAM pool relocated data can be parked in, compressed,
    /// to be expanded at boot. Zero length on models without one.
    pub scratch_base: u32,
    pub scratch_len: usize,

    pub key_offset: usize,
    pub nonce_offset: usize,

    pub rwdata_offset: usize,
    pub rwdata_len: usize,
    pub rwdata_capacity: usize,
    /// Boot decompression routine every stock table entry points at.
    pub rwdata_decomp_fn: u32,
    /// Word that code outside the table reads to find the table's end.
    pub rwdata_backpatch: usize,

    /// Cached "length of the external image" word patched when the external
    /// region shrinks.
    pub ext_len_field: usize,

    /// Reset-time vector the custom bootloader hooks.
    pub reset_vector: usize,

    pub ram_base: u32,
    pub ram_len: u32,
}

pub const DEVICES: &[DeviceConfig] = &[
    DeviceConfig {
        kind: DeviceKind::Mk1,
        name: "mk1",
        int_base: 0x0800_0000,
        int_len: 0x2_0000,
        int_stock_end: 0x1_8100,
        int_sha1: "efa04c387ad7b40549e15799b471a6e1cd234c76",
        ext_base: 0x9000_0000,
        ext_len: 0x10_0000,
        ext_enc_len: 0xF_E000,
        ext_sha1: "eea70bb171afece163fb4b293c5364ddb90637ae",
        ext_hash_window: HashWindow::AllButTrailing(8192),
        scratch_base: 0x240F_2124,
        scratch_len: 0x2410_0000 - 0x240F_2124,
        key_offset: 0x1_06F4,
        nonce_offset: 0x1_06E4,
        rwdata_offset: 0x1_80A4,
        rwdata_len: 36,
        rwdata_capacity: 8,
        rwdata_decomp_fn: 0x0800_1693,
        rwdata_backpatch: 0x1_80A0,
        ext_len_field: 0x1_06EC,
        reset_vector: 0x4,
        ram_base: 0x0200_0000,
        ram_len: 0x2_0000,
    },
    DeviceConfig {
        kind: DeviceKind::Mk2,
        name: "mk2",
        int_base: 0x0800_0000,
        int_len: 0x2_0000,
        int_stock_end: 0x1_B3E0,
        int_sha1: "ac14bcea6e4ff68c88fd2302c021025a2fb47940",
        ext_base: 0x9000_0000,
        ext_len: 0x40_0000,
        ext_enc_len: 0x32_54A0,
        ext_sha1: "1c1c0ed66d07324e560dcd9e86a322ec5e4c1e96",
        ext_hash_window: HashWindow::Range(0x2_0000, 0x32_54A0),
        scratch_base: 0x240F_2124,
        scratch_len: 0,
        key_offset: 0x1_65A4,
        nonce_offset: 0x1_6590,
        rwdata_offset: 0x1_B390,
        rwdata_len: 20,
        rwdata_capacity: 4,
        rwdata_decomp_fn: 0x0800_17AD,
        rwdata_backpatch: 0x1_B38C,
        ext_len_field: 0x1_658C,
        reset_vector: 0x4,
        ram_base: 0x0200_0000,
        ram_len: 0x2_0000,
    },
];

pub fn by_name(name: &str) -> Option<&'static DeviceConfig> {
    DEVICES.iter().find(|c| c.name == name)
}

pub fn by_kind(kind: DeviceKind) -> &'static DeviceConfig {
    // The table covers every enum variant.
    DEVICES
        .iter()
        .find(|c| c.kind == kind)
        .unwrap_or(&DEVICES[0])
}

impl DeviceConfig {
    /// Address windows a novel-code symbol may legally resolve into.
    pub fn symbol_windows(&self) -> Vec<AddressWindow> {
        vec![
            AddressWindow {
                start: self.ram_base,
                len: self.ram_len,
            },
            AddressWindow {
                start: self.int_base,
                len: self.int_len as u32,
            },
        ]
    }
}

pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(40);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Check an input image against its stock fingerprint. A mismatch means the
/// caller is holding the wrong file, and every fixed offset would land on
/// the wrong bytes.
pub fn verify_image(
    name: &'static str,
    data: &[u8],
    window: HashWindow,
    expected: &str,
) -> Result<()> {
    let hashed = match window {
        HashWindow::Full => data,
        HashWindow::AllButTrailing(n) => &data[..data.len().saturating_sub(n)],
        HashWindow::Range(start, end) => data
            .get(start..end)
            .ok_or_else(|| Error::InvalidPatch(format!("{name} image shorter than {end} bytes")))?,
    };
    let actual = sha1_hex(hashed);
    if actual != expected {
        return Err(Error::InvalidStockImage {
            name,
            actual,
            expected: expected.to_string(),
        });
    }
    Ok(())
}
