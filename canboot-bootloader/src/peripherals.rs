// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Peripheral initialization for the bootloader.

use cortex_m::peripheral::{DCB, DWT};
use stm32f3xx_hal::{can::Can, pac, prelude::*};

use crate::can_driver::BxCanDriver;

const HSE_HZ: u32 = 8_000_000;
const SYSCLK_HZ: u32 = 72_000_000;
/// APB1 clock feeding the CAN controller.
const PCLK1_HZ: u32 = 36_000_000;

pub struct Peripherals {
    pub can: BxCanDriver,
    pub clock: MonoClock,
    /// Input clock of the CAN bit timing logic.
    pub can_clock_hz: u32,
}

pub fn init() -> Peripherals {
    let dp = unsafe { pac::Peripherals::steal() };
    let mut cp = unsafe { cortex_m::Peripherals::steal() };

    let mut flash = dp.FLASH.constrain();
    let mut rcc = dp.RCC.constrain();
    let clocks = rcc
        .cfgr
        .use_hse(HSE_HZ.Hz())
        .sysclk(SYSCLK_HZ.Hz())
        .pclk1(PCLK1_HZ.Hz())
        .freeze(&mut flash.acr);

    let mut gpioa = dp.GPIOA.split(&mut rcc.ahb);
    let rx = gpioa
        .pa11
        .into_af_push_pull::<9>(&mut gpioa.moder, &mut gpioa.otyper, &mut gpioa.afrh);
    let tx = gpioa
        .pa12
        .into_af_push_pull::<9>(&mut gpioa.moder, &mut gpioa.otyper, &mut gpioa.afrh);
    let can = Can::new(dp.CAN, tx, rx, &mut rcc.apb1);

    Peripherals {
        can: BxCanDriver::new(can),
        clock: MonoClock::new(&mut cp.DCB, &mut cp.DWT, clocks.sysclk().raw()),
        can_clock_hz: clocks.pclk1().raw(),
    }
}

/// Microsecond clock extended from the 32-bit DWT cycle counter.
///
/// The counter wraps every minute at 72 MHz; `now_us` must be called more
/// often than that to notice each wrap, which the main loop does.
pub struct MonoClock {
    cycles_per_us: u64,
    last: u32,
    wraps: u64,
}

impl MonoClock {
    fn new(dcb: &mut DCB, dwt: &mut DWT, sysclk_hz: u32) -> Self {
        dcb.enable_trace();
        dwt.enable_cycle_counter();
        Self {
            cycles_per_us: (sysclk_hz / 1_000_000).max(1) as u64,
            last: DWT::cycle_count(),
            wraps: 0,
        }
    }

    pub fn now_us(&mut self) -> u64 {
        let now = DWT::cycle_count();
        if now < self.last {
            self.wraps += 1;
        }
        self.last = now;
        ((self.wraps << 32) | now as u64) / self.cycles_per_us
    }
}
