// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! CAN bit-timing computation for bxCAN-style controllers.
//!
//! A bit is `1 + bs1 + bs2` time quanta, each quantum `prescaler` clock
//! cycles long. The search favours the largest quanta count that divides the
//! clock/bit-rate ratio, then places the sample point near 7/8 of the bit.

use crate::config::STANDARD_BITRATES;

const MAX_PRESCALER: u32 = 1024;
const MAX_SAMPLE_POINT_PERMILLE: u32 = 900;

/// Register-level timing for one bit rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingParams {
    pub prescaler: u16,
    pub bs1: u8,
    pub bs2: u8,
    pub sjw: u8,
}

impl TimingParams {
    /// Value for the bxCAN BTR register (mode bits left clear).
    pub fn btr(&self) -> u32 {
        ((self.sjw as u32 - 1) << 24)
            | ((self.bs2 as u32 - 1) << 20)
            | ((self.bs1 as u32 - 1) << 16)
            | (self.prescaler as u32 - 1)
    }

    pub fn quanta_per_bit(&self) -> u32 {
        1 + self.bs1 as u32 + self.bs2 as u32
    }

    pub fn sample_point_permille(&self) -> u32 {
        1000 * (1 + self.bs1 as u32) / self.quanta_per_bit()
    }

    /// Bit rate these parameters produce from `clock_hz`.
    pub fn bitrate(&self, clock_hz: u32) -> u32 {
        clock_hz / (self.prescaler as u32 * self.quanta_per_bit())
    }
}

/// Compute timing for `bitrate` from a peripheral clock of `clock_hz`.
///
/// Returns `None` when no integer prescaler in `1..=1024` combined with a
/// sample point inside the tolerance band exists. The bus must not be brought
/// up at that rate.
pub fn compute_timing(clock_hz: u32, bitrate: u32) -> Option<TimingParams> {
    if bitrate == 0 {
        return None;
    }

    let max_quanta_per_bit: u32 = if bitrate >= 1_000_000 { 10 } else { 17 };
    let prescaler_bs = clock_hz / bitrate;

    // Largest bs1 + bs2 whose bit length divides the ratio
    let mut bs1_bs2_sum = max_quanta_per_bit - 1;
    while prescaler_bs % (1 + bs1_bs2_sum) != 0 {
        if bs1_bs2_sum <= 2 {
            return None;
        }
        bs1_bs2_sum -= 1;
    }

    let prescaler = prescaler_bs / (1 + bs1_bs2_sum);
    if !(1..=MAX_PRESCALER).contains(&prescaler) {
        return None;
    }

    let min_sample_point: u32 = if bitrate >= 1_000_000 { 750 } else { 850 };
    let sample_point = |bs1: u32| 1000 * (1 + bs1) / (1 + bs1_bs2_sum);

    // Closest integer split to a 7/8 sample point
    let mut bs1 = (7 * bs1_bs2_sum - 1 + 4) / 8;
    if sample_point(bs1) >= MAX_SAMPLE_POINT_PERMILLE {
        bs1 -= 1;
    }
    if sample_point(bs1) < min_sample_point {
        bs1 += 1;
    }
    if !(min_sample_point..MAX_SAMPLE_POINT_PERMILLE).contains(&sample_point(bs1)) {
        return None;
    }

    let bs2 = bs1_bs2_sum - bs1;
    if bs1 == 0 || bs2 == 0 {
        return None;
    }

    Some(TimingParams {
        prescaler: prescaler as u16,
        bs1: bs1 as u8,
        bs2: bs2 as u8,
        sjw: 1,
    })
}

/// True for one of the standard bit rates.
pub fn bitrate_valid(bitrate: u32) -> bool {
    STANDARD_BITRATES.contains(&bitrate)
}
