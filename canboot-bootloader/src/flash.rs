// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Application flash region backed by the STM32F3 flash controller.
//!
//! The controller erases 2 KiB pages and programs 16-bit half-words.
//! Every operation unlocks the controller, waits for BSY to clear, checks
//! the error flags and locks it again.

use canboot_common::{AppFlash, FlashError};

use crate::boot::MemoryLayout;

const PAGE_SIZE: u32 = 2048;

const FLASH_BASE: u32 = 0x4002_2000;
const FLASH_KEYR: *mut u32 = (FLASH_BASE + 0x04) as *mut u32;
const FLASH_SR: *mut u32 = (FLASH_BASE + 0x0C) as *mut u32;
const FLASH_CR: *mut u32 = (FLASH_BASE + 0x10) as *mut u32;
const FLASH_AR: *mut u32 = (FLASH_BASE + 0x14) as *mut u32;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;

const SR_BSY: u32 = 1 << 0;
const SR_PGERR: u32 = 1 << 2;
const SR_WRPRTERR: u32 = 1 << 4;
const SR_EOP: u32 = 1 << 5;

const CR_PG: u32 = 1 << 0;
const CR_PER: u32 = 1 << 1;
const CR_STRT: u32 = 1 << 6;
const CR_LOCK: u32 = 1 << 7;

pub struct AppRegion {
    start: u32,
    len: u32,
}

impl AppRegion {
    pub fn new(layout: &MemoryLayout) -> Self {
        Self {
            start: layout.app_start,
            len: layout.app_end - layout.app_start,
        }
    }
}

impl AppFlash for AppRegion {
    fn base_address(&self) -> u32 {
        self.start
    }

    fn contents(&self) -> &[u8] {
        // Memory mapped flash, read-only through this slice
        unsafe { core::slice::from_raw_parts(self.start as *const u8, self.len as usize) }
    }

    fn page_size(&self) -> u32 {
        PAGE_SIZE
    }

    fn erase_page(&mut self, page: u32) -> Result<(), FlashError> {
        if (page + 1) * PAGE_SIZE > self.len {
            return Err(FlashError::OutOfBounds);
        }
        let address = self.start + page * PAGE_SIZE;
        unsafe {
            unlock();
            wait_ready();
            FLASH_CR.write_volatile(FLASH_CR.read_volatile() | CR_PER);
            FLASH_AR.write_volatile(address);
            FLASH_CR.write_volatile(FLASH_CR.read_volatile() | CR_STRT);
            let result = finish();
            FLASH_CR.write_volatile(FLASH_CR.read_volatile() & !CR_PER);
            lock();
            result
        }
    }

    fn program_half_word(&mut self, offset: u32, half_word: u16) -> Result<(), FlashError> {
        if offset % 2 != 0 || offset + 2 > self.len {
            return Err(FlashError::OutOfBounds);
        }
        let address = (self.start + offset) as *mut u16;
        unsafe {
            unlock();
            wait_ready();
            FLASH_CR.write_volatile(FLASH_CR.read_volatile() | CR_PG);
            address.write_volatile(half_word);
            let result = finish();
            FLASH_CR.write_volatile(FLASH_CR.read_volatile() & !CR_PG);
            lock();
            result
        }
    }
}

unsafe fn unlock() {
    if FLASH_CR.read_volatile() & CR_LOCK != 0 {
        FLASH_KEYR.write_volatile(KEY1);
        FLASH_KEYR.write_volatile(KEY2);
    }
}

unsafe fn lock() {
    FLASH_CR.write_volatile(FLASH_CR.read_volatile() | CR_LOCK);
}

/// Wait for an idle controller and clear stale status flags.
unsafe fn wait_ready() {
    while FLASH_SR.read_volatile() & SR_BSY != 0 {}
    FLASH_SR.write_volatile(SR_EOP | SR_PGERR | SR_WRPRTERR);
}

/// Wait for the running operation and report its status.
unsafe fn finish() -> Result<(), FlashError> {
    while FLASH_SR.read_volatile() & SR_BSY != 0 {}
    let sr = FLASH_SR.read_volatile();
    FLASH_SR.write_volatile(SR_EOP | SR_PGERR | SR_WRPRTERR);
    if sr & (SR_PGERR | SR_WRPRTERR) != 0 {
        defmt::warn!("flash: error, SR=0x{:02x}", sr);
        return Err(FlashError::Controller);
    }
    Ok(())
}
