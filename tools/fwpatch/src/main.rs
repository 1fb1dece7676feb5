// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Fwpatch Contributors 2025.

//! Firmware patch driver
//!
//! Verifies a pair of stock images against their known-good fingerprints,
//! decrypts the external image, splices compiled novel code past the stock
//! boundary, hooks the reset vector into it, and writes the repacked
//! binaries. All the interesting work happens in `patchcore`; this binary
//! is file plumbing and reporting.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;

use patchcore::{by_name, Device, ElfSymbols, PatchValue, PatchableRegion};

#[derive(Parser, Debug)]
#[command(name = "fwpatch")]
#[command(about = "Patch and repack a pair of stock firmware images")]
struct Args {
    /// Stock internal flash dump
    #[arg(long, default_value = "internal_flash_backup.bin")]
    int_firmware: PathBuf,

    /// Stock external flash dump
    #[arg(long, default_value = "flash_backup.bin")]
    ext_firmware: PathBuf,

    /// Compiled novel code, padded to the full internal image length
    #[arg(long)]
    patch: Option<PathBuf>,

    /// ELF matching --patch, used to resolve novel-code symbols
    #[arg(long)]
    elf: Option<PathBuf>,

    /// Patched internal image
    #[arg(long, default_value = "internal_flash_patched.bin")]
    int_output: PathBuf,

    /// Patched external image
    #[arg(long, default_value = "external_flash_patched.bin")]
    ext_output: PathBuf,

    /// Device model
    #[arg(long, default_value = "mk1")]
    device: String,

    /// Re-encrypt the external image for the on-the-fly decryption unit
    #[arg(long)]
    encrypt: bool,

    /// Grow the internal image from 128 KiB to 256 KiB
    #[arg(long)]
    extended: bool,

    /// Bytes-saved-per-compressed-byte a block must clear to be parked in
    /// the compressed scratch pool instead of stored raw
    #[arg(long, default_value_t = 1.4)]
    compression_ratio: f64,

    /// Also write the decrypted external image (debugging convenience)
    #[arg(long)]
    decrypt_out: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let Some(config) = by_name(&args.device) else {
        bail!("unknown device model `{}`", args.device);
    };

    let internal_image = fs::read(&args.int_firmware)
        .with_context(|| format!("read {}", args.int_firmware.display()))?;
    let external_image = fs::read(&args.ext_firmware)
        .with_context(|| format!("read {}", args.ext_firmware.display()))?;

    println!("Verifying stock images for {}", config.name);
    let mut device = Device::new(config, internal_image, external_image, args.compression_ratio)
        .context("stock image verification")?;

    let ciphered = device.crypt().context("decrypt external image")?;
    println!("Deciphered {ciphered} bytes of the external image");

    if let Some(path) = &args.decrypt_out {
        fs::write(path, device.external.bytes())
            .with_context(|| format!("write {}", path.display()))?;
        println!("Wrote decrypted snapshot to {}", path.display());
    }

    if let Some(patch_path) = &args.patch {
        let patch_image =
            fs::read(patch_path).with_context(|| format!("read {}", patch_path.display()))?;
        let novel = device
            .install_novel_code(&patch_image)
            .context("splice novel code")?;
        println!("Spliced {novel} bytes of novel code");

        let elf_path = args
            .elf
            .as_ref()
            .context("--patch requires --elf for symbol resolution")?;
        let elf_bytes =
            fs::read(elf_path).with_context(|| format!("read {}", elf_path.display()))?;
        let symbols = ElfSymbols::parse(&elf_bytes, config.symbol_windows())
            .context("parse novel-code ELF")?;

        // Route reset through the novel bootloader before the stock handler.
        device
            .internal
            .replace(
                config.reset_vector,
                PatchValue::Symbol("bootloader"),
                &symbols,
            )
            .context("hook reset vector")?;
        println!("Reset vector hooked into the novel bootloader");
    }

    if args.extended {
        device.extend_internal(0x2_0000);
    }

    let summary = device.finalize().context("finalize")?;

    if args.encrypt {
        device.crypt().context("re-encrypt external image")?;
        println!("Re-enciphered the external image");
    }

    fs::write(&args.int_output, device.internal.bytes())
        .with_context(|| format!("write {}", args.int_output.display()))?;
    fs::write(&args.ext_output, device.external.bytes())
        .with_context(|| format!("write {}", args.ext_output.display()))?;

    println!("{}", "Binary patching complete!".green());
    println!(
        "    Internal firmware used:  {} bytes ({} free)",
        summary.internal_used, summary.internal_free
    );
    println!(
        "    Compressed memory used:  {} bytes ({} free)",
        summary.scratch_used, summary.scratch_free
    );
    println!("    External firmware used:  {} bytes", summary.external_len);

    Ok(())
}
