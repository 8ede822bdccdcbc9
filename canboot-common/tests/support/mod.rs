// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;

use canboot_common::bit_timing::TimingParams;
use canboot_common::config::APP_PARAMETERS_FMT;
use canboot_common::descriptor::{stamp_image, AppDescriptor, ParameterBlock};
use canboot_common::node::{
    BeginUpdateStatus, BusEvent, NodeHealth, NodeMode, NodeTransport, ServiceRequest,
};
use canboot_common::uavcan::{CanDriver, CanFrame, TxStatus};
use canboot_common::update::FileReadClient;
use canboot_common::{AppFlash, FlashError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const APP_BASE: u32 = 0x0800_4000;
pub const PAGE_SIZE: u32 = 2048;
pub const APP_PAGES: usize = 24;

pub const STACK_TOP: u32 = 0x2000_3F00;
pub const ENTRY_POINT: u32 = 0x0800_4101;

pub const DESCRIPTOR_OFFSET: usize = 0x100;
pub const PARAMS_OFFSETS: [usize; 2] = [0x180, 0x1A0];

pub const CLOCK_HZ: u32 = 36_000_000;

// =============================================================================
// Deterministic randomness
// =============================================================================

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_bytes<R: Rng>(rng: &mut R, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

// =============================================================================
// Flash
// =============================================================================

/// NOR-like flash: erase sets 0xFF, programming can only clear bits.
pub struct SimFlash {
    pub mem: Vec<u8>,
    pub erased_pages: Vec<u32>,
    pub programmed: usize,
    /// Program calls at this offset report a controller error.
    pub fail_program_at: Option<u32>,
    /// Program calls at this offset store a wrong value.
    pub corrupt_at: Option<u32>,
}

impl SimFlash {
    pub fn new() -> Self {
        Self {
            mem: vec![0xFF; APP_PAGES * PAGE_SIZE as usize],
            erased_pages: Vec::new(),
            programmed: 0,
            fail_program_at: None,
            corrupt_at: None,
        }
    }

    pub fn with_image(image: &[u8]) -> Self {
        let mut flash = Self::new();
        flash.mem[..image.len()].copy_from_slice(image);
        flash
    }
}

impl AppFlash for SimFlash {
    fn base_address(&self) -> u32 {
        APP_BASE
    }

    fn contents(&self) -> &[u8] {
        &self.mem
    }

    fn page_size(&self) -> u32 {
        PAGE_SIZE
    }

    fn erase_page(&mut self, page: u32) -> Result<(), FlashError> {
        let start = (page * PAGE_SIZE) as usize;
        if start >= self.mem.len() {
            return Err(FlashError::OutOfBounds);
        }
        self.mem[start..start + PAGE_SIZE as usize].fill(0xFF);
        self.erased_pages.push(page);
        Ok(())
    }

    fn program_half_word(&mut self, offset: u32, half_word: u16) -> Result<(), FlashError> {
        if offset % 2 != 0 || offset as usize + 2 > self.mem.len() {
            return Err(FlashError::OutOfBounds);
        }
        if self.fail_program_at == Some(offset) {
            return Err(FlashError::Controller);
        }
        let value = if self.corrupt_at == Some(offset) {
            half_word ^ 0x0101
        } else {
            half_word
        };
        let at = offset as usize;
        let bytes = value.to_le_bytes();
        self.mem[at] &= bytes[0];
        self.mem[at + 1] &= bytes[1];
        self.programmed += 1;
        Ok(())
    }
}

// =============================================================================
// Application images
// =============================================================================

pub fn param_address(index: usize) -> u32 {
    APP_BASE + PARAMS_OFFSETS[index] as u32
}

/// Random image with a vector table, a descriptor and the given parameter blocks,
/// stamped with its size and CRC.
pub fn app_image_with_params(
    len: usize,
    seed: u64,
    blocks: [Option<ParameterBlock>; 2],
) -> Vec<u8> {
    let mut image = random_bytes(&mut seeded(seed), len);
    image[0..4].copy_from_slice(&STACK_TOP.to_le_bytes());
    image[4..8].copy_from_slice(&ENTRY_POINT.to_le_bytes());

    let mut parameters = [0u32; 2];
    for (i, block) in blocks.iter().enumerate() {
        if let Some(block) = block {
            let at = PARAMS_OFFSETS[i];
            image[at..at + 15].copy_from_slice(&block.to_bytes());
            parameters[i] = param_address(i);
        }
    }

    let descriptor = AppDescriptor {
        offset: DESCRIPTOR_OFFSET as u32,
        image_crc: 0,
        image_size: 0,
        vcs_commit: 0x00C0_FFEE,
        major_version: 1,
        minor_version: 2,
        parameters_fmt: APP_PARAMETERS_FMT,
        parameters_ignore_crc64: false,
        parameters,
    };
    image[DESCRIPTOR_OFFSET..DESCRIPTOR_OFFSET + 35].copy_from_slice(&descriptor.to_bytes());

    stamp_image(&mut image).expect("descriptor present");
    image
}

pub fn app_image(len: usize, seed: u64) -> Vec<u8> {
    app_image_with_params(len, seed, [None, None])
}

pub fn params(param_idx: u8, boot_delay_sec: u8, baudrate: u32, node_id: u8) -> ParameterBlock {
    ParameterBlock {
        param_idx,
        boot_delay_sec,
        canbus_baudrate: baudrate,
        canbus_local_node_id: node_id,
        crc64: 0,
    }
    .sealed()
}

// =============================================================================
// File read client
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub server_node_id: u8,
    pub offset: u32,
    pub path: String,
    pub transfer_id: u8,
}

#[derive(Default)]
pub struct RecordingClient {
    pub requests: Vec<ReadRequest>,
    next_transfer_id: u8,
}

impl RecordingClient {
    pub fn last(&self) -> &ReadRequest {
        self.requests.last().expect("a request was sent")
    }
}

impl FileReadClient for RecordingClient {
    fn request_chunk(&mut self, server_node_id: u8, offset: u32, path: &str) -> u8 {
        let transfer_id = self.next_transfer_id;
        self.next_transfer_id = (transfer_id + 1) & 0x1F;
        self.requests.push(ReadRequest {
            server_node_id,
            offset,
            path: path.to_string(),
            transfer_id,
        });
        transfer_id
    }
}

// =============================================================================
// Node transport
// =============================================================================

/// Transport fed by the test: queued events are handed out in order.
pub struct ScriptedTransport {
    pub client: RecordingClient,
    pub events: VecDeque<BusEvent>,
    pub frame_seen: bool,
    pub bus_starts: Vec<(u32, TimingParams, bool)>,
    pub begin_responses: Vec<(ServiceRequest, BeginUpdateStatus)>,
    pub node_id: u8,
    pub mode: Option<NodeMode>,
    pub health: Option<NodeHealth>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            client: RecordingClient::default(),
            events: VecDeque::new(),
            frame_seen: false,
            bus_starts: Vec::new(),
            begin_responses: Vec::new(),
            node_id: 0,
            mode: None,
            health: None,
        }
    }

    pub fn last_bus_start(&self) -> (u32, bool) {
        let (bitrate, _, silent) = *self.bus_starts.last().expect("bus started");
        (bitrate, silent)
    }
}

impl FileReadClient for ScriptedTransport {
    fn request_chunk(&mut self, server_node_id: u8, offset: u32, path: &str) -> u8 {
        self.client.request_chunk(server_node_id, offset, path)
    }
}

impl NodeTransport for ScriptedTransport {
    fn start_bus(&mut self, bitrate: u32, timing: TimingParams, silent: bool) {
        self.bus_starts.push((bitrate, timing, silent));
    }

    fn take_frame_seen(&mut self) -> bool {
        std::mem::take(&mut self.frame_seen)
    }

    fn poll_event(&mut self, _now_us: u64) -> Option<BusEvent> {
        self.events.pop_front()
    }

    fn set_node_id(&mut self, node_id: u8) {
        self.node_id = node_id;
    }

    fn node_id(&self) -> u8 {
        self.node_id
    }

    fn set_mode(&mut self, mode: NodeMode) {
        self.mode = Some(mode);
    }

    fn set_health(&mut self, health: NodeHealth) {
        self.health = Some(health);
    }

    fn respond_begin_firmware_update(
        &mut self,
        request: ServiceRequest,
        status: BeginUpdateStatus,
    ) {
        self.begin_responses.push((request, status));
    }
}

// =============================================================================
// CAN driver
// =============================================================================

/// Driver whose bus is two queues the test inspects and fills.
#[derive(Default)]
pub struct LoopbackDriver {
    pub rx: VecDeque<CanFrame>,
    pub tx: Vec<CanFrame>,
    pub configs: Vec<(TimingParams, bool)>,
    /// Number of mailboxes free before transmit starts failing, unlimited when `None`.
    pub tx_slots: Option<usize>,
    /// Pending frames the next transmissions push out of their mailbox, in order.
    pub displace: VecDeque<CanFrame>,
}

impl CanDriver for LoopbackDriver {
    fn configure(&mut self, timing: TimingParams, silent: bool) {
        self.configs.push((timing, silent));
    }

    fn transmit(&mut self, frame: &CanFrame) -> TxStatus {
        match &mut self.tx_slots {
            Some(0) => return TxStatus::Busy,
            Some(n) => *n -= 1,
            None => {}
        }
        self.tx.push(*frame);
        match self.displace.pop_front() {
            Some(pending) => TxStatus::Displaced(pending),
            None => TxStatus::Queued,
        }
    }

    fn receive(&mut self) -> Option<CanFrame> {
        self.rx.pop_front()
    }
}
