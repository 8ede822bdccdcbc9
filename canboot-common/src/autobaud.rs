// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Bit-rate discovery by listening.
//!
//! The controller is held in silent mode at one standard rate at a time. Any
//! frame received proves the rate; otherwise the next lower rate is tried
//! after the switch interval, wrapping from the lowest to the highest.
//!
//! This is pure logic: the caller reconfigures the bus when told to switch
//! and reports whether a frame arrived since the last switch.

use crate::config::STANDARD_BITRATES;

/// Result of one [`Autobaud::update`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AutobaudStep {
    /// Still listening at the current rate.
    Waiting,
    /// Switch the bus to this rate (silent) and keep listening.
    Switched(u32),
    /// Traffic seen at this rate. Terminal.
    Confirmed(u32),
}

#[derive(Clone, Debug)]
pub struct Autobaud {
    index: usize,
    last_switch_us: u64,
    switch_interval_us: u64,
    confirmed: bool,
}

impl Autobaud {
    /// Start at `initial_bitrate`. An unknown rate starts at the highest one.
    ///
    /// The caller brings the bus up (silent) at [`current_bitrate`](Self::current_bitrate).
    pub fn start(initial_bitrate: u32, now_us: u64, switch_interval_us: u64) -> Self {
        let index = STANDARD_BITRATES
            .iter()
            .position(|&rate| rate == initial_bitrate)
            .unwrap_or(STANDARD_BITRATES.len() - 1);

        Self {
            index,
            last_switch_us: now_us,
            switch_interval_us,
            confirmed: false,
        }
    }

    pub fn current_bitrate(&self) -> u32 {
        STANDARD_BITRATES[self.index]
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Advance the search. `frame_seen` reports reception since the last call.
    pub fn update(&mut self, now_us: u64, frame_seen: bool) -> AutobaudStep {
        if self.confirmed {
            return AutobaudStep::Confirmed(self.current_bitrate());
        }

        if frame_seen {
            self.confirmed = true;
            return AutobaudStep::Confirmed(self.current_bitrate());
        }

        if now_us.wrapping_sub(self.last_switch_us) >= self.switch_interval_us {
            return AutobaudStep::Switched(self.advance(now_us));
        }

        AutobaudStep::Waiting
    }

    /// Step to the next lower rate right away, restarting the switch interval.
    ///
    /// Used when the current rate cannot be configured on this clock.
    pub fn advance(&mut self, now_us: u64) -> u32 {
        self.last_switch_us = now_us;
        self.index = match self.index {
            0 => STANDARD_BITRATES.len() - 1,
            i => i - 1,
        };
        self.current_bitrate()
    }
}
