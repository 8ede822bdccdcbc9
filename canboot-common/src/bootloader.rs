// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Bootloader control flow.
//!
//! [`pre_init`] runs first, before clocks or the bus are touched, and takes the
//! fast path into the application when it asked for a plain boot. Otherwise
//! [`Bootloader`] owns the bus node, the application flash and the mailbox,
//! and [`Bootloader::service`] is polled forever from the main loop.
//! Leaving the bootloader is reported to the caller as an [`Exit`]; the
//! platform performs the actual jump or reset.

use crate::autobaud::{Autobaud, AutobaudStep};
use crate::bit_timing::{bitrate_valid, compute_timing};
use crate::config::{
    AUTOBAUD_SWITCH_INTERVAL_US, DEFAULT_BITRATE, DEFAULT_BOOT_DELAY_MS, FALLBACK_NODE_ID,
    RESTART_DEBOUNCE_US, STANDARD_BITRATES,
};
use crate::descriptor::{
    find_descriptor, get_parameters, validate_image, AppDescriptor, ParameterBlock,
};
use crate::flash::AppFlash;
use crate::mailbox::{CanbusInfo, FirmwareUpdateRequest, Mailbox, MailboxMessage, SharedRegion};
use crate::node::{BeginUpdateStatus, BusEvent, NodeHealth, NodeMode, NodeTransport, ServiceRequest};
use crate::update::{BeginError, ChunkResponse, FirmwareUpdate, UpdateEvent};

/// First two words of the application vector table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JumpInfo {
    pub stack_pointer: u32,
    pub entry_point: u32,
}

impl JumpInfo {
    /// Read the vector table at the start of `image`.
    ///
    /// `None` when either word is erased or zero: there is nothing to jump to.
    pub fn read(image: &[u8]) -> Option<Self> {
        let words = image.get(..8)?;
        let stack_pointer = u32::from_le_bytes([words[0], words[1], words[2], words[3]]);
        let entry_point = u32::from_le_bytes([words[4], words[5], words[6], words[7]]);
        let plausible = |w: u32| w != 0 && w != 0xFFFF_FFFF;
        if plausible(stack_pointer) && plausible(entry_point) {
            Some(Self {
                stack_pointer,
                entry_point,
            })
        } else {
            None
        }
    }
}

/// An application image that passed every check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ValidApp {
    pub descriptor: AppDescriptor,
    pub params: Option<ParameterBlock>,
    pub jump: JumpInfo,
}

/// Vector table, descriptor and CRC check of the flashed image.
pub fn check_app<F: AppFlash + ?Sized>(flash: &F) -> Option<ValidApp> {
    let image = flash.contents();
    let jump = JumpInfo::read(image)?;
    let descriptor = find_descriptor(image)?;
    if !validate_image(&descriptor, image) {
        return None;
    }
    let params = get_parameters(&descriptor, image, flash.base_address());
    Some(ValidApp {
        descriptor,
        params,
        jump,
    })
}

/// Decision taken before any peripheral is initialised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EarlyBoot {
    /// The application asked for a plain boot: jump without further checks.
    Jump(JumpInfo),
    /// Run the bootloader, with whatever the mailbox carried.
    Continue(Option<MailboxMessage>),
}

/// Consume the mailbox and decide whether to take the fast path.
///
/// Only the vector table is checked here; the image CRC was verified by
/// the bootloader run that wrote the boot message.
pub fn pre_init<R, F>(mailbox: &mut Mailbox<R>, flash: &F) -> EarlyBoot
where
    R: SharedRegion,
    F: AppFlash + ?Sized,
{
    let retained = mailbox.check_and_retrieve();
    if let Some(MailboxMessage::Boot(_)) = retained {
        if let Some(jump) = JumpInfo::read(flash.contents()) {
            return EarlyBoot::Jump(jump);
        }
    }
    EarlyBoot::Continue(retained)
}

/// How control leaves the bootloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Exit {
    /// Hand over to the application.
    Jump(JumpInfo),
    /// System reset requested over the bus.
    Reset,
}

#[derive(Clone, Debug)]
enum BusState {
    /// Listening silently while searching for the bit rate.
    Probing(Autobaud),
    /// Running at `bitrate`. `confirmed` once a frame has been received.
    Online { bitrate: u32, confirmed: bool },
}

pub struct Bootloader<T, F, R>
where
    T: NodeTransport,
    F: AppFlash,
    R: SharedRegion,
{
    transport: T,
    flash: F,
    mailbox: Mailbox<R>,
    clock_hz: u32,
    bus: BusState,
    update: FirmwareUpdate,
    app: Option<ValidApp>,
    boot_delay_us: u64,
    boot_deadline_us: Option<u64>,
    restart_requested_us: Option<u64>,
    pending_update: Option<FirmwareUpdateRequest>,
}

impl<T, F, R> Bootloader<T, F, R>
where
    T: NodeTransport,
    F: AppFlash,
    R: SharedRegion,
{
    /// Validate the image, pick node id and bit rate, and bring up the bus.
    ///
    /// `retained` is the message [`pre_init`] took out of the mailbox. Its bus
    /// settings take precedence over the application parameters.
    pub fn new(
        mut transport: T,
        flash: F,
        mailbox: Mailbox<R>,
        retained: Option<MailboxMessage>,
        clock_hz: u32,
        now_us: u64,
    ) -> Self {
        let app = check_app(&flash);
        match &app {
            Some(app) => info!(
                "app valid: v{}.{} ({} bytes)",
                app.descriptor.major_version,
                app.descriptor.minor_version,
                app.descriptor.image_size
            ),
            None => warn!("no valid app"),
        }

        let hint = retained.as_ref().map(MailboxMessage::canbus_info).unwrap_or_default();
        let params = app.as_ref().and_then(|a| a.params);

        let node_id = [hint.local_node_id, params.map_or(0, |p| p.canbus_local_node_id)]
            .into_iter()
            .find(|&id| (1..=127).contains(&id))
            .unwrap_or(FALLBACK_NODE_ID);
        transport.set_node_id(node_id);

        let bitrate = [hint.baudrate, params.map_or(0, |p| p.canbus_baudrate)]
            .into_iter()
            .find(|&rate| bitrate_valid(rate));

        let boot_delay_us = match params {
            Some(p) => p.boot_delay_sec as u64 * 1_000_000,
            None => DEFAULT_BOOT_DELAY_MS as u64 * 1000,
        };
        let boot_deadline_us = app.as_ref().map(|_| now_us + boot_delay_us);

        let pending_update = match retained {
            Some(MailboxMessage::FirmwareUpdate(request)) => Some(request),
            _ => None,
        };

        let bus = bring_up(&mut transport, bitrate, clock_hz, now_us);
        transport.set_mode(NodeMode::Maintenance);

        Self {
            transport,
            flash,
            mailbox,
            clock_hz,
            bus,
            update: FirmwareUpdate::new(),
            app,
            boot_delay_us,
            boot_deadline_us,
            restart_requested_us: None,
            pending_update,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn mailbox(&self) -> &Mailbox<R> {
        &self.mailbox
    }

    pub fn app(&self) -> Option<&ValidApp> {
        self.app.as_ref()
    }

    pub fn update_in_progress(&self) -> bool {
        self.update.in_progress()
    }

    pub fn boot_delay_us(&self) -> u64 {
        self.boot_delay_us
    }

    pub fn boot_deadline_us(&self) -> Option<u64> {
        self.boot_deadline_us
    }

    /// Bit rate the bus currently runs at, once known.
    pub fn bitrate(&self) -> Option<u32> {
        match self.bus {
            BusState::Probing(_) => None,
            BusState::Online { bitrate, .. } => Some(bitrate),
        }
    }

    /// Bit rate proven by received traffic, 0 while unconfirmed.
    pub fn confirmed_bitrate(&self) -> u32 {
        match self.bus {
            BusState::Online {
                bitrate,
                confirmed: true,
            } => bitrate,
            _ => 0,
        }
    }

    /// One iteration of the main loop.
    pub fn service(&mut self, now_us: u64) -> Option<Exit> {
        while let Some(event) = self.transport.poll_event(now_us) {
            if let Some(exit) = self.handle_event(event, now_us) {
                return Some(exit);
            }
        }

        self.service_bus(now_us);

        if self.bitrate().is_some() {
            if let Some(request) = self.pending_update.take() {
                info!("update requested by app");
                let source = request.source_node_id;
                if let Err(e) = self.begin_update(source, &request.path, now_us) {
                    warn!("cannot start update: {}", e);
                }
            }
        }

        let event = self
            .update
            .poll(&mut self.flash, &mut self.transport, now_us);
        if let UpdateEvent::Failed(_) = event {
            self.app = None;
        }

        self.report_status();

        if let Some(requested) = self.restart_requested_us {
            if now_us.wrapping_sub(requested) > RESTART_DEBOUNCE_US {
                // Keep the bus settings so the next run skips autobaud
                self.mailbox
                    .finalize_and_write(&MailboxMessage::CanbusInfo(self.canbus_info()));
                info!("restarting");
                return Some(Exit::Reset);
            }
        }

        match self.boot_deadline_us {
            Some(deadline) if !self.update.in_progress() && now_us >= deadline => {
                self.attempt_boot()
            }
            _ => None,
        }
    }

    fn canbus_info(&self) -> CanbusInfo {
        CanbusInfo {
            local_node_id: self.transport.node_id(),
            baudrate: self.confirmed_bitrate(),
        }
    }

    fn handle_event(&mut self, event: BusEvent, now_us: u64) -> Option<Exit> {
        match event {
            BusEvent::RestartRequested => {
                self.restart_requested_us.get_or_insert(now_us);
                None
            }
            BusEvent::BeginFirmwareUpdate {
                request,
                source_node_id,
                path,
            } => {
                self.on_begin_request(request, source_node_id, &path, now_us);
                None
            }
            BusEvent::FileReadResponse {
                transfer_id,
                error,
                data,
                eof,
            } => {
                let response = ChunkResponse {
                    transfer_id,
                    error,
                    data: &data,
                    eof,
                };
                match self
                    .update
                    .on_chunk(&mut self.flash, &mut self.transport, response, now_us)
                {
                    UpdateEvent::Complete { .. } => {
                        let exit = self.attempt_boot();
                        if exit.is_none() {
                            // The vector table was just programmed over an image that
                            // fails its check: blank it again
                            if let Err(e) = self.flash.erase_page(0) {
                                warn!("cannot erase page 0: {}", e);
                            }
                        }
                        exit
                    }
                    UpdateEvent::Failed(_) => {
                        self.app = None;
                        None
                    }
                    _ => None,
                }
            }
        }
    }

    fn on_begin_request(
        &mut self,
        request: ServiceRequest,
        source_node_id: u8,
        path: &str,
        now_us: u64,
    ) {
        // 0 designates the requesting node as file server
        let source = match source_node_id {
            0 => request.node_id,
            id => id,
        };
        let status = match self.begin_update(source, path, now_us) {
            Ok(()) => BeginUpdateStatus::Ok,
            Err(BeginError::InProgress) => BeginUpdateStatus::InProgress,
            Err(e) => {
                warn!("cannot start update: {}", e);
                BeginUpdateStatus::Unknown
            }
        };
        self.transport.respond_begin_firmware_update(request, status);
    }

    fn begin_update(
        &mut self,
        source_node_id: u8,
        path: &str,
        now_us: u64,
    ) -> Result<(), BeginError> {
        self.update
            .begin(&mut self.flash, &mut self.transport, source_node_id, path, now_us)?;
        self.app = None;
        self.boot_deadline_us = None;
        Ok(())
    }

    fn service_bus(&mut self, now_us: u64) {
        let frame_seen = self.transport.take_frame_seen();
        match &mut self.bus {
            BusState::Probing(autobaud) => match autobaud.update(now_us, frame_seen) {
                AutobaudStep::Waiting => {}
                AutobaudStep::Switched(_) => {
                    probe(&mut self.transport, autobaud, self.clock_hz, now_us)
                }
                AutobaudStep::Confirmed(bitrate) => {
                    if let Some(timing) = compute_timing(self.clock_hz, bitrate) {
                        info!("autobaud: {} bit/s", bitrate);
                        self.transport.start_bus(bitrate, timing, false);
                        self.bus = BusState::Online {
                            bitrate,
                            confirmed: true,
                        };
                    }
                }
            },
            BusState::Online { confirmed, .. } => *confirmed |= frame_seen,
        }
    }

    fn report_status(&mut self) {
        let (mode, health) = if self.update.in_progress() {
            (NodeMode::SoftwareUpdate, NodeHealth::Ok)
        } else if self.app.is_some() {
            (NodeMode::Maintenance, NodeHealth::Ok)
        } else {
            (NodeMode::Maintenance, NodeHealth::Critical)
        };
        self.transport.set_mode(mode);
        self.transport.set_health(health);
    }

    /// Re-validate the image and leave for it, or disarm the boot timer.
    fn attempt_boot(&mut self) -> Option<Exit> {
        self.app = check_app(&self.flash);
        let Some(app) = self.app else {
            warn!("boot aborted: image invalid");
            self.boot_deadline_us = None;
            return None;
        };

        self.mailbox
            .finalize_and_write(&MailboxMessage::Boot(self.canbus_info()));
        info!("booting app at {=u32:#x}", app.jump.entry_point);
        Some(Exit::Jump(app.jump))
    }
}

/// Start the bus at a known rate, or start autobaud when there is none.
fn bring_up<T: NodeTransport>(
    transport: &mut T,
    bitrate: Option<u32>,
    clock_hz: u32,
    now_us: u64,
) -> BusState {
    if let Some(bitrate) = bitrate {
        if let Some(timing) = compute_timing(clock_hz, bitrate) {
            info!("bus at {} bit/s", bitrate);
            transport.start_bus(bitrate, timing, false);
            return BusState::Online {
                bitrate,
                confirmed: false,
            };
        }
        warn!("no bit timing for {} bit/s", bitrate);
    }

    let mut autobaud = Autobaud::start(DEFAULT_BITRATE, now_us, AUTOBAUD_SWITCH_INTERVAL_US);
    probe(transport, &mut autobaud, clock_hz, now_us);
    BusState::Probing(autobaud)
}

/// Listen at the autobaud rate, skipping rates the clock cannot produce.
fn probe<T: NodeTransport>(transport: &mut T, autobaud: &mut Autobaud, clock_hz: u32, now_us: u64) {
    for _ in 0..STANDARD_BITRATES.len() {
        let bitrate = autobaud.current_bitrate();
        if let Some(timing) = compute_timing(clock_hz, bitrate) {
            debug!("autobaud: trying {} bit/s", bitrate);
            transport.start_bus(bitrate, timing, true);
            return;
        }
        autobaud.advance(now_us);
    }
    warn!("autobaud: no usable bit rate");
}
