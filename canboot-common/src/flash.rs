// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Application flash region: the primitives the bootloader needs from the
//! platform, and the verified write built on top of them.

use core::fmt;

/// Failure reported by a flash primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Address outside the application region or not half-word aligned.
    OutOfBounds,
    /// The controller reported a programming or erase error.
    Controller,
    /// A programmed half-word did not read back as written.
    Verify,
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::OutOfBounds => f.write_str("flash access out of bounds"),
            FlashError::Controller => f.write_str("flash controller error"),
            FlashError::Verify => f.write_str("flash read-back mismatch"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FlashError {}

/// The flash region reserved for the application image.
///
/// Offsets are relative to the start of the region.
pub trait AppFlash {
    /// Absolute address of offset 0 (used to resolve pointers stored in the image).
    fn base_address(&self) -> u32;

    /// Memory-mapped view of the whole region.
    fn contents(&self) -> &[u8];

    fn page_size(&self) -> u32;

    /// Erase page number `page` (0 is the first page of the region).
    fn erase_page(&mut self, page: u32) -> Result<(), FlashError>;

    /// Program one half-word at a 2-aligned `offset` of an erased location.
    fn program_half_word(&mut self, offset: u32, half_word: u16) -> Result<(), FlashError>;

    fn size(&self) -> u32 {
        self.contents().len() as u32
    }

    fn page_of(&self, offset: u32) -> u32 {
        offset / self.page_size()
    }
}

/// Program `data` at `offset` half-word by half-word, checking each one reads back.
///
/// A trailing odd byte is padded with the erased value `0xFF`.
pub fn write_verified<F: AppFlash + ?Sized>(
    flash: &mut F,
    offset: u32,
    data: &[u8],
) -> Result<(), FlashError> {
    if offset % 2 != 0 {
        return Err(FlashError::OutOfBounds);
    }
    let end = offset as usize + data.len().div_ceil(2) * 2;
    if end > flash.contents().len() {
        return Err(FlashError::OutOfBounds);
    }

    for (i, pair) in data.chunks(2).enumerate() {
        let bytes = [pair[0], pair.get(1).copied().unwrap_or(0xFF)];
        let half_word = u16::from_le_bytes(bytes);
        let at = offset + (i as u32) * 2;

        flash.program_half_word(at, half_word)?;

        let written = &flash.contents()[at as usize..at as usize + 2];
        if written != bytes {
            return Err(FlashError::Verify);
        }
    }

    Ok(())
}
