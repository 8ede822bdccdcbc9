// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! CRC-64/WE, the checksum behind every integrity check in canboot.
//!
//! Polynomial `0x42F0E1EBA9EA3693`, MSB first, seed and result inverted.
//! Because both ends are inverted, passing a previous result as `seed`
//! continues the computation: `crc64(b, crc64(a, 0)) == crc64(a ++ b, 0)`.

use crc::{Crc, CRC_64_WE};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_WE);

/// Compute CRC-64/WE over `bytes`, continuing from `seed` (0 to start fresh).
pub fn crc64(bytes: &[u8], seed: u64) -> u64 {
    let mut digest = CRC64.digest_with_initial(!seed);
    digest.update(bytes);
    digest.finalize()
}
