// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Fwpatch Contributors 2025.

//! Relocation and patch-primitive engine for repacking a pair of
//! reverse-engineered handheld firmware images.
//!
//! The engine works on memory images after the fact — there is no object
//! graph to link. Three byte-addressable [`Region`]s (internal flash,
//! external flash, a small scratch RAM pool) are mutated by low-level patch
//! primitives while a global [`Ledger`] keeps every surviving reference
//! consistent with wherever its target actually ended up. The [`Device`]
//! placement engine routes evicted data among the regions with a
//! compression-ratio heuristic and drives the stream cipher covering the
//! external image.
//!
//! Everything is a deterministic, single-threaded batch transform: a run
//! either completes or aborts with a typed [`Error`], never partial output.

pub mod config;
pub mod crypt;
pub mod device;
pub mod error;
pub mod ledger;
pub mod lz;
pub mod lzma;
pub mod patch;
pub mod region;
pub mod rwdata;
pub mod symbols;
pub mod util;

pub use config::{by_kind, by_name, sha1_hex, DeviceConfig, DeviceKind, HashWindow};
pub use device::{Device, Phase, RunSummary};
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use lzma::CompressCache;
pub use patch::{NoSymbols, PatchValue, PatchableRegion};
pub use region::Region;
pub use rwdata::RwData;
pub use symbols::{AddressWindow, ElfSymbols, SymbolOracle};
