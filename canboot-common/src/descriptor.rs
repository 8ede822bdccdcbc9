// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Application descriptor and redundant parameter blocks.
//!
//! The application embeds an [`AppDescriptor`] on an 8-byte boundary. It names
//! the image size and CRC, and points at up to two [`ParameterBlock`]s that act
//! as a double buffer: the valid block with the newest index wins.
//!
//! Descriptor layout (little-endian, packed):
//!
//! | offset | size | field                                        |
//! |--------|------|----------------------------------------------|
//! | 0      | 8    | signature                                    |
//! | 8      | 8    | image_crc                                    |
//! | 16     | 4    | image_size                                   |
//! | 20     | 4    | vcs_commit                                   |
//! | 24     | 1    | major_version                                |
//! | 25     | 1    | minor_version                                |
//! | 26     | 1    | parameters_fmt (bits 0-6), ignore_crc64 (7)  |
//! | 27     | 4    | parameters[0] address (0 = none)             |
//! | 31     | 4    | parameters[1] address (0 = none)             |

use crate::config::{APP_DESCRIPTOR_ALIGN, APP_DESCRIPTOR_SIGNATURE, APP_PARAMETERS_FMT};
use crate::crc64::crc64;

pub const DESCRIPTOR_LEN: usize = 35;
pub const PARAMETER_BLOCK_LEN: usize = 15;

const CRC_FIELD: usize = 8;
const SIZE_FIELD: usize = 16;
const IGNORE_CRC_BIT: u8 = 0x80;

/// Metadata record found inside a flashed image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppDescriptor {
    /// Where the descriptor was found, relative to the start of the image.
    pub offset: u32,
    pub image_crc: u64,
    pub image_size: u32,
    pub vcs_commit: u32,
    pub major_version: u8,
    pub minor_version: u8,
    pub parameters_fmt: u8,
    pub parameters_ignore_crc64: bool,
    pub parameters: [u32; 2],
}

impl AppDescriptor {
    /// Decode a descriptor from `bytes`, which must start with the signature.
    pub fn from_bytes(offset: u32, bytes: &[u8]) -> Option<Self> {
        let b = bytes.get(..DESCRIPTOR_LEN)?;
        if b[..8] != APP_DESCRIPTOR_SIGNATURE {
            return None;
        }
        Some(Self {
            offset,
            image_crc: u64::from_le_bytes(b[8..16].try_into().ok()?),
            image_size: u32::from_le_bytes(b[16..20].try_into().ok()?),
            vcs_commit: u32::from_le_bytes(b[20..24].try_into().ok()?),
            major_version: b[24],
            minor_version: b[25],
            parameters_fmt: b[26] & !IGNORE_CRC_BIT,
            parameters_ignore_crc64: b[26] & IGNORE_CRC_BIT != 0,
            parameters: [
                u32::from_le_bytes(b[27..31].try_into().ok()?),
                u32::from_le_bytes(b[31..35].try_into().ok()?),
            ],
        })
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut b = [0u8; DESCRIPTOR_LEN];
        b[..8].copy_from_slice(&APP_DESCRIPTOR_SIGNATURE);
        b[8..16].copy_from_slice(&self.image_crc.to_le_bytes());
        b[16..20].copy_from_slice(&self.image_size.to_le_bytes());
        b[20..24].copy_from_slice(&self.vcs_commit.to_le_bytes());
        b[24] = self.major_version;
        b[25] = self.minor_version;
        b[26] = (self.parameters_fmt & !IGNORE_CRC_BIT)
            | if self.parameters_ignore_crc64 { IGNORE_CRC_BIT } else { 0 };
        b[27..31].copy_from_slice(&self.parameters[0].to_le_bytes());
        b[31..35].copy_from_slice(&self.parameters[1].to_le_bytes());
        b
    }

    fn crc_field_offset(&self) -> usize {
        self.offset as usize + CRC_FIELD
    }
}

/// Scan `image` on the descriptor alignment for the signature. First match wins.
///
/// `None` is the normal outcome for a blank or foreign image.
pub fn find_descriptor(image: &[u8]) -> Option<AppDescriptor> {
    if image.len() < DESCRIPTOR_LEN {
        return None;
    }
    (0..=image.len() - DESCRIPTOR_LEN)
        .step_by(APP_DESCRIPTOR_ALIGN)
        .find(|&i| image[i..i + 8] == APP_DESCRIPTOR_SIGNATURE)
        .and_then(|i| AppDescriptor::from_bytes(i as u32, &image[i..]))
}

/// CRC of the first `image_size` bytes of `image`, with the descriptor's own
/// CRC field read as eight zero bytes.
pub fn compute_image_crc(image: &[u8], descriptor_offset: u32, image_size: u32) -> Option<u64> {
    let crc_field = descriptor_offset as usize + CRC_FIELD;
    let size = image_size as usize;
    if size > image.len() || descriptor_offset as usize + DESCRIPTOR_LEN > size {
        return None;
    }

    let crc = crc64(&image[..crc_field], 0);
    let crc = crc64(&[0u8; 8], crc);
    Some(crc64(&image[crc_field + 8..size], crc))
}

/// True when the image CRC matches and the image fits in `image` (the reserved region).
pub fn validate_image(descriptor: &AppDescriptor, image: &[u8]) -> bool {
    match compute_image_crc(image, descriptor.offset, descriptor.image_size) {
        Some(crc) => crc == descriptor.image_crc,
        None => false,
    }
}

/// Persistent settings written by the application, kept in two copies.
///
/// Layout: param_idx (u8), boot_delay_sec (u8), canbus_baudrate (u32),
/// canbus_local_node_id (u8), crc64 (u64) over the preceding 7 bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ParameterBlock {
    pub param_idx: u8,
    pub boot_delay_sec: u8,
    pub canbus_baudrate: u32,
    pub canbus_local_node_id: u8,
    pub crc64: u64,
}

impl ParameterBlock {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let b = bytes.get(..PARAMETER_BLOCK_LEN)?;
        Some(Self {
            param_idx: b[0],
            boot_delay_sec: b[1],
            canbus_baudrate: u32::from_le_bytes(b[2..6].try_into().ok()?),
            canbus_local_node_id: b[6],
            crc64: u64::from_le_bytes(b[7..15].try_into().ok()?),
        })
    }

    pub fn to_bytes(&self) -> [u8; PARAMETER_BLOCK_LEN] {
        let mut b = [0u8; PARAMETER_BLOCK_LEN];
        b[0] = self.param_idx;
        b[1] = self.boot_delay_sec;
        b[2..6].copy_from_slice(&self.canbus_baudrate.to_le_bytes());
        b[6] = self.canbus_local_node_id;
        b[7..15].copy_from_slice(&self.crc64.to_le_bytes());
        b
    }

    pub fn compute_crc(&self) -> u64 {
        crc64(&self.to_bytes()[..PARAMETER_BLOCK_LEN - 8], 0)
    }

    /// Return the block with its CRC filled in.
    pub fn sealed(mut self) -> Self {
        self.crc64 = self.compute_crc();
        self
    }

    pub fn crc_valid(&self) -> bool {
        self.compute_crc() == self.crc64
    }
}

/// True when index `candidate` was written after `current`.
///
/// Indices are an 8-bit counter that wraps, so "newer" means the forward
/// distance from `current` is less than half the counter range.
pub fn is_newer(candidate: u8, current: u8) -> bool {
    let distance = candidate.wrapping_sub(current);
    distance != 0 && distance < 0x80
}

/// Select the authoritative parameter block referenced by `descriptor`.
///
/// `region` is the memory the block addresses point into, starting at
/// `base_address`. Blocks outside it, with a bad CRC, or from a different
/// format version are ignored.
pub fn get_parameters(
    descriptor: &AppDescriptor,
    region: &[u8],
    base_address: u32,
) -> Option<ParameterBlock> {
    if descriptor.parameters_fmt != APP_PARAMETERS_FMT {
        return None;
    }

    let mut selected: Option<ParameterBlock> = None;
    for &addr in &descriptor.parameters {
        let Some(block) = resolve_block(region, base_address, addr) else {
            continue;
        };
        if !descriptor.parameters_ignore_crc64 && !block.crc_valid() {
            continue;
        }
        match selected {
            Some(current) if !is_newer(block.param_idx, current.param_idx) => {}
            _ => selected = Some(block),
        }
    }
    selected
}

fn resolve_block(region: &[u8], base_address: u32, addr: u32) -> Option<ParameterBlock> {
    if addr == 0 {
        return None;
    }
    let offset = addr.checked_sub(base_address)? as usize;
    ParameterBlock::from_bytes(region.get(offset..)?)
}

/// Fill in `image_size` and `image_crc` of the descriptor embedded in `image`.
///
/// This is the post-link step an application build runs so the bootloader
/// can validate the image. The whole slice is taken as the image.
pub fn stamp_image(image: &mut [u8]) -> Option<AppDescriptor> {
    let mut descriptor = find_descriptor(image)?;
    let start = descriptor.offset as usize;

    descriptor.image_size = u32::try_from(image.len()).ok()?;
    image[start + SIZE_FIELD..start + SIZE_FIELD + 4]
        .copy_from_slice(&descriptor.image_size.to_le_bytes());

    descriptor.image_crc = compute_image_crc(image, descriptor.offset, descriptor.image_size)?;
    let crc_field = descriptor.crc_field_offset();
    image[crc_field..crc_field + 8].copy_from_slice(&descriptor.image_crc.to_le_bytes());

    Some(descriptor)
}
