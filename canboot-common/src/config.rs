// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Bootloader constants shared by the application and the bootloader images.
//!
//! Memory addresses are not listed here: they come from the linker script of
//! the image being built.

// --- Shared mailbox ---

pub const MAILBOX_MAGIC: u32 = 0xDEAD_BEEF;

/// Header: crc64 (8) + magic (4) + kind (1).
pub const MAILBOX_HEADER_SIZE: usize = 13;

/// Largest payload (FirmwareUpdate).
pub const MAILBOX_MAX_PAYLOAD: usize = 207;

pub const MAILBOX_SIZE: usize = MAILBOX_HEADER_SIZE + MAILBOX_MAX_PAYLOAD;

// --- Application descriptor ---

pub const APP_DESCRIPTOR_SIGNATURE: [u8; 8] = [0x40, 0xA2, 0xE4, 0xF1, 0x64, 0x68, 0x91, 0x06];

/// Descriptors are placed on this alignment by the application linker script.
pub const APP_DESCRIPTOR_ALIGN: usize = 8;

pub const APP_PARAMETERS_FMT: u8 = 2;

// --- Firmware file path ---

/// Longest remote path accepted for an image (UAVCAN `file.Path`).
pub const MAX_PATH_LEN: usize = 200;

// --- Bus ---

/// Standard bit rates, ascending. Autobaud walks this list downward.
pub const STANDARD_BITRATES: [u32; 4] = [125_000, 250_000, 500_000, 1_000_000];

/// Bit rate autobaud starts from when nothing hints at the bus speed.
pub const DEFAULT_BITRATE: u32 = 1_000_000;

pub const AUTOBAUD_SWITCH_INTERVAL_US: u64 = 1_000_000;

/// Node id used when neither the mailbox nor the parameters provide one.
pub const FALLBACK_NODE_ID: u8 = 125;

pub const NODE_STATUS_PERIOD_US: u64 = 1_000_000;

// --- Timing ---

pub const DEFAULT_BOOT_DELAY_MS: u32 = 3000;

/// Delay between a restart request and the reset, lets the response go out.
pub const RESTART_DEBOUNCE_US: u64 = 1000;

pub const FILE_READ_TIMEOUT_US: u64 = 500_000;

/// Resends of an unanswered file read request before the update is abandoned.
pub const MAX_FILE_READ_RETRIES: u8 = 10;

// Compile-time layout checks
const _: () = assert!(MAILBOX_SIZE == 220);
const _: () = assert!(MAILBOX_MAX_PAYLOAD == 5 + 1 + MAX_PATH_LEN + 1);
