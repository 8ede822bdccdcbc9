// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Common logic for canboot, a CAN bus bootloader.
//!
//! Everything in this crate is hardware independent so it can be tested on the host:
//! - CRC-64/WE integrity primitive
//! - Shared mailbox carried across resets between application and bootloader
//! - Application descriptor and redundant parameter blocks
//! - Bus bit timing and autobaud
//! - Chunked firmware update state machine
//! - UAVCAN v0 node used as the bus transport
//! - The bootloader control loop tying all of the above together
//!
//! Features:
//! - Default: `no_std`
//! - `std`: host builds (error trait impls)
//! - `defmt`: logging and `defmt::Format` derives for embedded targets

#![cfg_attr(not(any(feature = "std", test)), no_std)]

#[macro_use]
mod fmt;

pub mod autobaud;
pub mod bit_timing;
pub mod bootloader;
pub mod config;
pub mod crc64;
pub mod descriptor;
pub mod flash;
pub mod mailbox;
pub mod node;
pub mod uavcan;
pub mod update;

// Re-export commonly used types
pub use bootloader::{pre_init, Bootloader, EarlyBoot, Exit, JumpInfo};
pub use crc64::crc64;
pub use flash::{AppFlash, FlashError};
pub use mailbox::{CanbusInfo, Mailbox, MailboxMessage, SharedRegion};
pub use node::{BusEvent, NodeHealth, NodeMode, NodeTransport};
