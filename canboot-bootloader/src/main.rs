// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! canboot: CAN bus bootloader for STM32F302 with UAVCAN v0 firmware update.

#![no_std]
#![no_main]

mod boot;
mod can_driver;
mod flash;
mod peripherals;

use canboot_common::uavcan::{NodeInfo, UavcanNode};
use canboot_common::{pre_init, AppFlash, Bootloader, EarlyBoot, Exit, Mailbox};
use cortex_m_rt::entry;
use defmt_rtt as _;
use panic_probe as _;

defmt::timestamp!("{=u64:us}", { 0 });

#[entry]
fn main() -> ! {
    let layout = boot::MemoryLayout::from_linker();
    let flash = flash::AppRegion::new(&layout);
    let mut mailbox = Mailbox::new(boot::SharedRam::new(&layout));

    // Nothing is initialised yet: a plain boot request leaves right away
    let retained = match pre_init(&mut mailbox, &flash) {
        EarlyBoot::Jump(jump) => unsafe { boot::jump_to_app(flash.base_address(), jump) },
        EarlyBoot::Continue(retained) => retained,
    };

    defmt::println!(
        "Bootloader init, mailbox: {}",
        retained.as_ref().map(|m| m.kind())
    );

    let mut p = peripherals::init();
    let node = UavcanNode::new(p.can, node_info());
    let now = p.clock.now_us();
    let mut bootloader = Bootloader::new(node, flash, mailbox, retained, p.can_clock_hz, now);

    loop {
        match bootloader.service(p.clock.now_us()) {
            Some(Exit::Jump(jump)) => {
                defmt::println!("Jumping to application...");
                let app_start = bootloader.flash().base_address();
                unsafe { boot::jump_to_app(app_start, jump) }
            }
            Some(Exit::Reset) => cortex_m::peripheral::SCB::sys_reset(),
            None => {}
        }
    }
}

/// 96-bit factory programmed device id.
const DEVICE_UID: *const [u8; 12] = 0x1FFF_F7AC as *const [u8; 12];

fn node_info() -> NodeInfo {
    let uid = unsafe { DEVICE_UID.read_volatile() };
    NodeInfo {
        software_major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        software_minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        ..NodeInfo::default()
    }
    .with_unique_id(&uid)
}
