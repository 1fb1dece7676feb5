// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Fwpatch Contributors 2025.

//! Software model of the on-the-fly decryption unit.
//!
//! The external image is stream-ciphered with AES-128 in a counter mode
//! keyed to the mapped address: each 16-byte block's counter is the block's
//! device address shifted right by 4, packed into the tail of a fixed IV
//! built from the byte-reversed nonce. The construction is XOR-based, so
//! applying it twice with the same key and nonce is the identity — the same
//! routine decrypts the stock image and re-encrypts the patched one.
//!
//! Only bytes before the region's `enc_end` are covered; everything after
//! is stored plaintext.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::region::Region;

pub const KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 8;

const BLOCK_LEN: usize = 16;

fn nonce_to_iv(nonce: &[u8; NONCE_LEN]) -> [u8; BLOCK_LEN] {
    let mut iv = [0u8; BLOCK_LEN];
    for (i, b) in nonce.iter().rev().enumerate() {
        iv[i] = *b;
    }
    // Fixed suffix; the counter blends into bytes 12..16 per block.
    iv[10] = 0x71;
    iv[11] = 0x23;
    iv[12] = 0x20;
    iv
}

/// Cipher (or decipher) the enciphered window of `region` in place.
/// Returns the number of bytes covered.
pub fn crypt(region: &mut Region, key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN]) -> usize {
    let mut key = *key;
    key.reverse();
    let cipher = Aes128::new(GenericArray::from_slice(&key));
    let iv = nonce_to_iv(nonce);

    let end = region.enc_end.min(region.len());
    let mut offset = 0;
    while offset < end {
        let mut block = iv;
        let counter = region.base.wrapping_add(offset as u32) >> 4;
        block[12] = (((counter >> 24) as u8) & 0x0F) | (block[12] & 0xF0);
        block[13] = (counter >> 16) as u8;
        block[14] = (counter >> 8) as u8;
        block[15] = counter as u8;

        let mut keystream = GenericArray::clone_from_slice(&block);
        cipher.encrypt_block(&mut keystream);

        let n = (end - offset).min(BLOCK_LEN);
        for i in 0..n {
            region.data[offset + i] ^= keystream[BLOCK_LEN - 1 - i];
        }
        offset += BLOCK_LEN;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypt_is_an_involution() {
        let key = [0x11u8; KEY_LEN];
        let nonce = [0x22u8; NONCE_LEN];
        let plain: Vec<u8> = (0..256u32).map(|i| i as u8).collect();

        let mut region = Region::new("external", plain.clone(), 0x9000_0000);
        region.enc_end = 256;

        assert_eq!(crypt(&mut region, &key, &nonce), 256);
        assert_ne!(region.bytes(), plain.as_slice());
        crypt(&mut region, &key, &nonce);
        assert_eq!(region.bytes(), plain.as_slice());
    }

    #[test]
    fn bytes_past_the_enciphered_window_are_untouched() {
        let key = [0u8; KEY_LEN];
        let nonce = [0u8; NONCE_LEN];
        let mut region = Region::new("external", vec![0xAB; 64], 0x9000_0000);
        region.enc_end = 32;

        crypt(&mut region, &key, &nonce);
        assert!(region.bytes()[..32].iter().any(|b| *b != 0xAB));
        assert!(region.bytes()[32..].iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn keystream_depends_on_the_mapped_address() {
        let key = [3u8; KEY_LEN];
        let nonce = [4u8; NONCE_LEN];
        let mut a = Region::new("external", vec![0; 16], 0x9000_0000);
        a.enc_end = 16;
        let mut b = Region::new("external", vec![0; 16], 0x9000_0100);
        b.enc_end = 16;

        crypt(&mut a, &key, &nonce);
        crypt(&mut b, &key, &nonce);
        assert_ne!(a.bytes(), b.bytes());
    }
}
