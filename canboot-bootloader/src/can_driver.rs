// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! bxCAN controller behind the `CanDriver` seam of the UAVCAN node.

use bxcan::filter::Mask32;
use bxcan::{Data, ExtendedId, Fifo, Frame, Id};
use canboot_common::bit_timing::TimingParams;
use canboot_common::uavcan::{CanDriver, CanFrame, TxStatus};
use stm32f3xx_hal::can::Can;
use stm32f3xx_hal::gpio::gpioa::{PA11, PA12};
use stm32f3xx_hal::gpio::{PushPull, AF9};

/// HAL CAN instance on PA12 (TX) and PA11 (RX).
pub type CanInstance = Can<PA12<AF9<PushPull>>, PA11<AF9<PushPull>>>;

pub struct BxCanDriver {
    can: bxcan::Can<CanInstance>,
}

impl BxCanDriver {
    /// Take the controller, accept every frame into FIFO 0, leave it disabled
    /// until the first `configure`.
    pub fn new(instance: CanInstance) -> Self {
        let mut can = bxcan::Can::builder(instance)
            .set_automatic_retransmit(true)
            .leave_disabled();
        can.modify_filters()
            .enable_bank(0, Fifo::Fifo0, Mask32::accept_all());
        Self { can }
    }
}

impl CanDriver for BxCanDriver {
    fn configure(&mut self, timing: TimingParams, silent: bool) {
        self.can
            .modify_config()
            .set_bit_timing(timing.btr())
            .set_loopback(false)
            .set_silent(silent)
            .leave_disabled();
        // Synchronises to the bus in the background
        if let Err(nb::Error::Other(never)) = self.can.enable_non_blocking() {
            match never {}
        }
    }

    fn transmit(&mut self, frame: &CanFrame) -> TxStatus {
        let (Some(id), Some(data)) = (ExtendedId::new(frame.id), Data::new(frame.data())) else {
            defmt::warn!("can: dropping malformed frame 0x{:08x}", frame.id);
            return TxStatus::Queued;
        };
        match self.can.transmit(&Frame::new_data(id, data)) {
            Ok(None) => TxStatus::Queued,
            Ok(Some(displaced)) => TxStatus::Displaced(to_can_frame(&displaced)),
            Err(nb::Error::WouldBlock) => TxStatus::Busy,
            Err(nb::Error::Other(never)) => match never {},
        }
    }

    fn receive(&mut self) -> Option<CanFrame> {
        let frame = match self.can.receive() {
            Ok(frame) => frame,
            Err(nb::Error::WouldBlock) => return None,
            Err(nb::Error::Other(_)) => {
                defmt::warn!("can: rx overrun");
                return None;
            }
        };

        Some(to_can_frame(&frame))
    }
}

/// Remote frames come out with an empty payload.
fn to_can_frame(frame: &Frame) -> CanFrame {
    let (id, extended) = match frame.id() {
        Id::Standard(id) => (id.as_raw() as u32, false),
        Id::Extended(id) => (id.as_raw(), true),
    };
    let payload = frame.data().map_or(&[][..], |d| &d[..]);
    let mut data = [0u8; 8];
    data[..payload.len()].copy_from_slice(payload);
    CanFrame {
        id,
        extended,
        len: payload.len() as u8,
        data,
    }
}
