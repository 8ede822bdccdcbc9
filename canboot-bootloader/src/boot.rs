// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Memory layout, the shared RAM mailbox region and the jump into the application.

use canboot_common::config::MAILBOX_SIZE;
use canboot_common::{JumpInfo, SharedRegion};

unsafe extern "C" {
    static __app_start: u32;
    static __app_end: u32;
    static __app_bl_shared: u32;
}

macro_rules! linker_addr {
    ($sym:ident) => {
        unsafe { &$sym as *const u32 as u32 }
    };
}

pub struct MemoryLayout {
    pub app_start: u32,
    pub app_end: u32,
    pub shared: u32,
}

impl MemoryLayout {
    pub fn from_linker() -> Self {
        Self {
            app_start: linker_addr!(__app_start),
            app_end: linker_addr!(__app_end),
            shared: linker_addr!(__app_bl_shared),
        }
    }
}

/// Mailbox storage in the RAM section the startup code does not initialise.
///
/// Every access is volatile: the contents are written by a previous run,
/// possibly by the application.
pub struct SharedRam {
    base: *mut u8,
}

impl SharedRam {
    /// The linker script guarantees the region holds `MAILBOX_SIZE` bytes.
    pub fn new(layout: &MemoryLayout) -> Self {
        Self {
            base: layout.shared as *mut u8,
        }
    }
}

impl SharedRegion for SharedRam {
    fn read(&self, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= MAILBOX_SIZE);
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = unsafe { self.base.add(offset + i).read_volatile() };
        }
    }

    fn write(&mut self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= MAILBOX_SIZE);
        for (i, byte) in data.iter().enumerate() {
            unsafe { self.base.add(offset + i).write_volatile(*byte) };
        }
    }
}

/// # Safety
/// `jump` must come from a validated vector table at `app_start`.
pub unsafe fn jump_to_app(app_start: u32, jump: JumpInfo) -> ! {
    prepare_for_app_handoff();
    relocate_vector_table(app_start);
    jump_to_firmware(jump.stack_pointer, jump.entry_point);
}

/// Leave the core the way the application expects it after reset.
/// Clocks stay configured; the application switches them itself.
unsafe fn prepare_for_app_handoff() {
    cortex_m::interrupt::disable();

    const SYST_CSR: *mut u32 = 0xE000_E010 as *mut u32;
    SYST_CSR.write_volatile(0);

    // 82 interrupt lines on the F302, three 32-bit banks
    const NVIC_ICER: *mut u32 = 0xE000_E180 as *mut u32;
    const NVIC_ICPR: *mut u32 = 0xE000_E280 as *mut u32;
    for bank in 0..3 {
        NVIC_ICER.add(bank).write_volatile(0xFFFF_FFFF);
        NVIC_ICPR.add(bank).write_volatile(0xFFFF_FFFF);
    }

    // Pulse the CAN reset so the application finds the controller untouched
    const RCC_APB1RSTR: *mut u32 = 0x4002_1010 as *mut u32;
    const CANRST: u32 = 1 << 25;
    let rst = RCC_APB1RSTR.read_volatile();
    RCC_APB1RSTR.write_volatile(rst | CANRST);
    RCC_APB1RSTR.write_volatile(rst & !CANRST);

    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

unsafe fn relocate_vector_table(app_start: u32) {
    const SCB_VTOR: *mut u32 = 0xE000_ED08 as *mut u32;
    SCB_VTOR.write_volatile(app_start);

    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

unsafe fn jump_to_firmware(initial_sp: u32, reset_vector: u32) -> ! {
    core::arch::asm!(
        "msr msp, {sp}",
        "cpsie i",
        "bx {reset}",
        sp = in(reg) initial_sp,
        reset = in(reg) reset_vector,
        options(noreturn)
    );
}
