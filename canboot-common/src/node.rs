// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Bus node interface seen by the bootloader.
//!
//! The transport is polled: incoming requests and responses are handed out
//! one at a time by [`NodeTransport::poll_event`], in arrival order.

use heapless::{String, Vec};

use crate::bit_timing::TimingParams;
use crate::config::MAX_PATH_LEN;
use crate::update::FileReadClient;

/// Largest data field of a file read response.
pub const MAX_CHUNK_LEN: usize = 256;

/// Operating mode advertised in node status.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeMode {
    Operational = 0,
    Initialization = 1,
    Maintenance = 2,
    SoftwareUpdate = 3,
    Offline = 7,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeHealth {
    Ok = 0,
    Warning = 1,
    Error = 2,
    Critical = 3,
}

/// Answer to a begin-firmware-update request.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BeginUpdateStatus {
    Ok = 0,
    InvalidMode = 1,
    InProgress = 2,
    Unknown = 255,
}

/// Identifies a service request so it can be answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceRequest {
    /// Node that sent the request.
    pub node_id: u8,
    pub transfer_id: u8,
}

/// Something the bus delivered since the last poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    /// A restart was requested and acknowledged.
    RestartRequested,
    /// Must be answered with [`NodeTransport::respond_begin_firmware_update`].
    BeginFirmwareUpdate {
        request: ServiceRequest,
        /// File server, 0 for "the requester".
        source_node_id: u8,
        path: String<MAX_PATH_LEN>,
    },
    FileReadResponse {
        transfer_id: u8,
        error: i16,
        data: Vec<u8, MAX_CHUNK_LEN>,
        eof: bool,
    },
}

/// A node on the field bus.
pub trait NodeTransport: FileReadClient {
    /// (Re)start the controller at `bitrate`. A silent node only listens.
    fn start_bus(&mut self, bitrate: u32, timing: TimingParams, silent: bool);

    /// True if any frame was received since the last call.
    fn take_frame_seen(&mut self) -> bool;

    /// Service the bus and return the next pending event.
    fn poll_event(&mut self, now_us: u64) -> Option<BusEvent>;

    fn set_node_id(&mut self, node_id: u8);

    fn node_id(&self) -> u8;

    fn set_mode(&mut self, mode: NodeMode);

    fn set_health(&mut self, health: NodeHealth);

    fn respond_begin_firmware_update(&mut self, request: ServiceRequest, status: BeginUpdateStatus);
}
