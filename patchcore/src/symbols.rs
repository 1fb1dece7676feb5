// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Fwpatch Contributors 2025.

//! Name-to-address oracle for novel-code symbols.
//!
//! The novel code spliced past the stock boundary is built separately; its
//! ELF is the single source of truth for where each routine landed. The
//! engine only ever needs `resolve(name) -> address`, so that seam is a
//! trait and the goblin-backed implementation stays at the edge.

use std::collections::HashMap;

use goblin::elf::Elf;

use crate::error::{Error, Result};

pub trait SymbolOracle {
    fn resolve(&self, name: &str) -> Result<u32>;
}

/// Address window a resolved symbol is allowed to fall in. Anything outside
/// the device's RAM and flash ranges is a build mismatch, not a usable
/// address.
#[derive(Copy, Clone, Debug)]
pub struct AddressWindow {
    pub start: u32,
    pub len: u32,
}

impl AddressWindow {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr <= self.start.wrapping_add(self.len)
    }
}

pub struct ElfSymbols {
    map: HashMap<String, u32>,
    windows: Vec<AddressWindow>,
}

impl ElfSymbols {
    pub fn parse(bytes: &[u8], windows: Vec<AddressWindow>) -> Result<ElfSymbols> {
        let elf =
            Elf::parse(bytes).map_err(|e| Error::InvalidPatch(format!("symbol ELF: {e}")))?;

        let mut map = HashMap::new();
        for sym in elf.syms.iter() {
            if let Some(name) = elf.strtab.get_at(sym.st_name) {
                if !name.is_empty() {
                    map.insert(name.to_string(), sym.st_value as u32);
                }
            }
        }

        Ok(ElfSymbols { map, windows })
    }
}

impl SymbolOracle for ElfSymbols {
    fn resolve(&self, name: &str) -> Result<u32> {
        let addr = *self
            .map
            .get(name)
            .ok_or_else(|| Error::MissingSymbol(name.to_string()))?;
        if addr == 0 || !self.windows.iter().any(|w| w.contains(addr)) {
            return Err(Error::MissingSymbol(format!(
                "{name} resolves to invalid address 0x{addr:08X}"
            )));
        }
        Ok(addr)
    }
}
