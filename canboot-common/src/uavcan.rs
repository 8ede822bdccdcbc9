// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Minimal UAVCAN v0 node over a CAN controller.
//!
//! Covers what a bootloader needs and nothing more:
//! - NodeStatus broadcast
//! - GetNodeInfo, RestartNode and file.BeginFirmwareUpdate servers
//! - file.Read client
//!
//! Wire format summary (29-bit extended ids):
//!
//! ```text
//! message:  prio[28:24] type_id[23:8]                      0[7] src[6:0]
//! service:  prio[28:24] type_id[23:16] req[15] dst[14:8]   1[7] src[6:0]
//! tail:     SOT[7] EOT[6] toggle[5] transfer_id[4:0]
//! ```
//!
//! Transfers longer than seven bytes are split across frames and prefixed
//! with a CRC-16/CCITT-FALSE seeded with the data type signature.

use crc::{Crc, CRC_16_IBM_3740};
use heapless::{Deque, String, Vec};

use crate::bit_timing::TimingParams;
use crate::config::{MAX_PATH_LEN, NODE_STATUS_PERIOD_US};
use crate::node::{
    BeginUpdateStatus, BusEvent, NodeHealth, NodeMode, NodeTransport, ServiceRequest,
    MAX_CHUNK_LEN,
};
use crate::update::FileReadClient;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

pub const PRIORITY_HIGH: u8 = 8;
pub const PRIORITY_MEDIUM: u8 = 16;
pub const PRIORITY_LOW: u8 = 24;

// --- Data types ---

pub const NODE_STATUS_ID: u16 = 341;
pub const NODE_STATUS_SIGNATURE: u64 = 0x0F08_68D0_C1A7_C6F1;

pub const GET_NODE_INFO_ID: u16 = 1;
pub const GET_NODE_INFO_SIGNATURE: u64 = 0xEE46_8A81_21C4_6A9E;

pub const RESTART_NODE_ID: u16 = 5;
pub const RESTART_NODE_SIGNATURE: u64 = 0x569E_0539_4A30_17F0;
pub const RESTART_MAGIC: u64 = 0xAC_CE55_1B1E;

pub const BEGIN_FIRMWARE_UPDATE_ID: u16 = 40;
pub const BEGIN_FIRMWARE_UPDATE_SIGNATURE: u64 = 0xB7D7_25DF_7272_4126;

pub const FILE_READ_ID: u16 = 48;
pub const FILE_READ_SIGNATURE: u64 = 0x8DCD_CA93_9F33_F678;

/// Largest transfer payload handled, a file.Read response plus its CRC.
pub const MAX_TRANSFER_LEN: usize = 2 + 2 + MAX_CHUNK_LEN;

const RX_SESSIONS: usize = 4;
const TX_QUEUE_LEN: usize = 64;
const NODE_NAME_MAX: usize = 80;

/// Raw CAN frame as exchanged with the controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    pub len: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    /// Extended frame with up to 8 bytes of `data`, the rest is dropped.
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        let len = data.len().min(8);
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(&data[..len]);
        Self {
            id,
            extended: true,
            len: len as u8,
            data: buf,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Result of handing a frame to the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxStatus {
    Queued,
    /// Queued in place of a lower priority pending frame, which must be sent again.
    Displaced(CanFrame),
    /// Every mailbox is busy, nothing was queued.
    Busy,
}

/// CAN controller used by [`UavcanNode`].
pub trait CanDriver {
    /// Reinitialise the controller with `timing`. Silent mode never drives the bus.
    fn configure(&mut self, timing: TimingParams, silent: bool);

    fn transmit(&mut self, frame: &CanFrame) -> TxStatus;

    fn receive(&mut self) -> Option<CanFrame>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferKind {
    Message,
    Request,
    Response,
}

/// Decoded 29-bit UAVCAN v0 frame id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanId {
    pub priority: u8,
    pub kind: TransferKind,
    pub data_type_id: u16,
    pub source_node_id: u8,
    /// 0 for messages.
    pub destination_node_id: u8,
}

impl CanId {
    pub fn message(priority: u8, data_type_id: u16, source_node_id: u8) -> Self {
        Self {
            priority,
            kind: TransferKind::Message,
            data_type_id,
            source_node_id,
            destination_node_id: 0,
        }
    }

    pub fn service(
        priority: u8,
        service_id: u8,
        request: bool,
        source_node_id: u8,
        destination_node_id: u8,
    ) -> Self {
        Self {
            priority,
            kind: if request {
                TransferKind::Request
            } else {
                TransferKind::Response
            },
            data_type_id: service_id as u16,
            source_node_id,
            destination_node_id,
        }
    }

    pub fn to_raw(&self) -> u32 {
        let prio = ((self.priority & 0x1F) as u32) << 24;
        let src = (self.source_node_id & 0x7F) as u32;
        match self.kind {
            TransferKind::Message => prio | ((self.data_type_id as u32) << 8) | src,
            TransferKind::Request | TransferKind::Response => {
                let request = (self.kind == TransferKind::Request) as u32;
                prio | ((self.data_type_id as u32 & 0xFF) << 16)
                    | (request << 15)
                    | (((self.destination_node_id & 0x7F) as u32) << 8)
                    | (1 << 7)
                    | src
            }
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        let priority = ((raw >> 24) & 0x1F) as u8;
        let source_node_id = (raw & 0x7F) as u8;
        if raw & (1 << 7) == 0 {
            return Self::message(priority, ((raw >> 8) & 0xFFFF) as u16, source_node_id);
        }
        Self::service(
            priority,
            ((raw >> 16) & 0xFF) as u8,
            raw & (1 << 15) != 0,
            source_node_id,
            ((raw >> 8) & 0x7F) as u8,
        )
    }
}

/// Last byte of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TailByte {
    pub start_of_transfer: bool,
    pub end_of_transfer: bool,
    pub toggle: bool,
    pub transfer_id: u8,
}

impl TailByte {
    pub fn from_u8(byte: u8) -> Self {
        Self {
            start_of_transfer: byte & 0x80 != 0,
            end_of_transfer: byte & 0x40 != 0,
            toggle: byte & 0x20 != 0,
            transfer_id: byte & 0x1F,
        }
    }

    pub fn to_u8(self) -> u8 {
        ((self.start_of_transfer as u8) << 7)
            | ((self.end_of_transfer as u8) << 6)
            | ((self.toggle as u8) << 5)
            | (self.transfer_id & 0x1F)
    }
}

/// CRC of a multi-frame transfer.
pub fn transfer_crc(signature: u64, payload: &[u8]) -> u16 {
    let mut digest = CRC16.digest();
    digest.update(&signature.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

/// Split a transfer into frames.
pub fn frames(id: CanId, transfer_id: u8, signature: u64, payload: &[u8]) -> Frames<'_> {
    let crc = (payload.len() > 7).then(|| transfer_crc(signature, payload).to_le_bytes());
    Frames {
        raw_id: id.to_raw(),
        transfer_id,
        crc,
        payload,
        pos: 0,
        toggle: false,
        done: false,
    }
}

/// Iterator over the frames of one outgoing transfer.
pub struct Frames<'a> {
    raw_id: u32,
    transfer_id: u8,
    crc: Option<[u8; 2]>,
    payload: &'a [u8],
    pos: usize,
    toggle: bool,
    done: bool,
}

impl Frames<'_> {
    fn prefix_len(&self) -> usize {
        if self.crc.is_some() {
            2
        } else {
            0
        }
    }

    fn byte_at(&self, i: usize) -> u8 {
        match self.crc {
            Some(crc) if i < 2 => crc[i],
            _ => self.payload[i - self.prefix_len()],
        }
    }
}

impl Iterator for Frames<'_> {
    type Item = CanFrame;

    fn next(&mut self) -> Option<CanFrame> {
        if self.done {
            return None;
        }

        let total = self.prefix_len() + self.payload.len();
        let take = (total - self.pos).min(7);
        let mut data = [0u8; 8];
        for (k, slot) in data[..take].iter_mut().enumerate() {
            *slot = self.byte_at(self.pos + k);
        }

        let tail = TailByte {
            start_of_transfer: self.pos == 0,
            end_of_transfer: self.pos + take == total,
            toggle: self.toggle,
            transfer_id: self.transfer_id,
        };
        data[take] = tail.to_u8();

        self.pos += take;
        self.toggle = !self.toggle;
        self.done = tail.end_of_transfer;
        Some(CanFrame::new_extended(self.raw_id, &data[..take + 1]))
    }
}

/// A completely received transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxTransfer {
    pub id: CanId,
    pub transfer_id: u8,
    pub payload: Vec<u8, MAX_TRANSFER_LEN>,
}

#[derive(Clone, Debug)]
struct RxSession {
    source_node_id: u8,
    data_type_id: u16,
    kind: TransferKind,
    transfer_id: u8,
    toggle: bool,
    buf: Vec<u8, MAX_TRANSFER_LEN>,
}

impl RxSession {
    fn matches(&self, id: &CanId) -> bool {
        self.source_node_id == id.source_node_id
            && self.data_type_id == id.data_type_id
            && self.kind == id.kind
    }
}

/// Rebuilds transfers from frames, one session per source and data type.
#[derive(Clone, Debug, Default)]
pub struct Reassembler<const N: usize> {
    sessions: Vec<RxSession, N>,
}

impl<const N: usize> Reassembler<N> {
    pub const fn new() -> Self {
        Self {
            sessions: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.sessions.clear();
    }

    /// Feed one frame of data type `signature`. Returns the transfer it completes.
    pub fn accept(&mut self, id: CanId, data: &[u8], signature: u64) -> Option<RxTransfer> {
        let (&tail, body) = data.split_last()?;
        let tail = TailByte::from_u8(tail);
        let existing = self.sessions.iter().position(|s| s.matches(&id));

        if tail.start_of_transfer {
            if let Some(i) = existing {
                self.sessions.swap_remove(i);
            }
            if tail.end_of_transfer {
                return Some(RxTransfer {
                    id,
                    transfer_id: tail.transfer_id,
                    payload: Vec::from_slice(body).ok()?,
                });
            }
            if tail.toggle {
                return None;
            }
            if self.sessions.is_full() {
                self.sessions.remove(0);
            }
            let session = RxSession {
                source_node_id: id.source_node_id,
                data_type_id: id.data_type_id,
                kind: id.kind,
                transfer_id: tail.transfer_id,
                toggle: false,
                buf: Vec::from_slice(body).ok()?,
            };
            let _ = self.sessions.push(session);
            return None;
        }

        let i = existing?;
        let session = &mut self.sessions[i];
        // Duplicate or foreign frame
        if tail.transfer_id != session.transfer_id || tail.toggle == session.toggle {
            return None;
        }
        session.toggle = tail.toggle;
        if session.buf.extend_from_slice(body).is_err() {
            self.sessions.swap_remove(i);
            return None;
        }
        if !tail.end_of_transfer {
            return None;
        }

        let session = self.sessions.swap_remove(i);
        let (crc, payload) = session.buf.split_at_checked(2)?;
        if u16::from_le_bytes([crc[0], crc[1]]) != transfer_crc(signature, payload) {
            debug!("uavcan: bad transfer crc from {}", id.source_node_id);
            return None;
        }
        Some(RxTransfer {
            id,
            transfer_id: session.transfer_id,
            payload: Vec::from_slice(payload).ok()?,
        })
    }
}

/// Identity reported by GetNodeInfo.
#[derive(Clone, Copy, Debug)]
pub struct NodeInfo {
    pub name: &'static str,
    pub software_major: u8,
    pub software_minor: u8,
    pub vcs_commit: u32,
    pub hardware_major: u8,
    pub hardware_minor: u8,
    pub unique_id: [u8; 16],
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            name: "canboot",
            software_major: 0,
            software_minor: 1,
            vcs_commit: 0,
            hardware_major: 0,
            hardware_minor: 0,
            unique_id: [0; 16],
        }
    }
}

impl NodeInfo {
    /// Fill `unique_id` from a device serial number, zero-padded to 16 bytes.
    pub fn with_unique_id(mut self, uid: &[u8]) -> Self {
        let len = uid.len().min(self.unique_id.len());
        self.unique_id = [0; 16];
        self.unique_id[..len].copy_from_slice(&uid[..len]);
        self
    }
}

/// UAVCAN v0 node implementing [`NodeTransport`] on top of a [`CanDriver`].
pub struct UavcanNode<D: CanDriver> {
    driver: D,
    info: NodeInfo,
    node_id: u8,
    mode: NodeMode,
    health: NodeHealth,
    silent: bool,
    frame_seen: bool,
    next_status_us: u64,
    status_transfer_id: u8,
    read_transfer_id: u8,
    rx: Reassembler<RX_SESSIONS>,
    tx: Deque<CanFrame, TX_QUEUE_LEN>,
}

impl<D: CanDriver> UavcanNode<D> {
    /// New node, silent until [`NodeTransport::start_bus`] says otherwise.
    pub fn new(driver: D, info: NodeInfo) -> Self {
        Self {
            driver,
            info,
            node_id: 0,
            mode: NodeMode::Initialization,
            health: NodeHealth::Ok,
            silent: true,
            frame_seen: false,
            next_status_us: 0,
            status_transfer_id: 0,
            read_transfer_id: 0,
            rx: Reassembler::new(),
            tx: Deque::new(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    pub fn health(&self) -> NodeHealth {
        self.health
    }

    fn node_status_payload(&self, now_us: u64) -> [u8; 7] {
        let uptime = (now_us / 1_000_000) as u32;
        let mut p = [0u8; 7];
        p[..4].copy_from_slice(&uptime.to_le_bytes());
        p[4] = ((self.health as u8) << 6) | ((self.mode as u8 & 0x07) << 3);
        p
    }

    fn send(&mut self, id: CanId, transfer_id: u8, signature: u64, payload: &[u8]) {
        if self.silent || self.node_id == 0 {
            return;
        }
        for frame in frames(id, transfer_id, signature, payload) {
            if self.tx.push_back(frame).is_err() {
                warn!("uavcan: tx queue full");
                break;
            }
        }
        self.flush();
    }

    fn flush(&mut self) {
        while let Some(frame) = self.tx.front().copied() {
            match self.driver.transmit(&frame) {
                TxStatus::Busy => break,
                TxStatus::Queued => {
                    self.tx.pop_front();
                }
                TxStatus::Displaced(pending) => {
                    self.tx.pop_front();
                    // Back to the head so its transfer stays in order
                    if self.tx.push_front(pending).is_err() {
                        warn!("uavcan: displaced frame lost");
                    }
                }
            }
        }
    }

    fn respond(&mut self, request: &RxTransfer, signature: u64, payload: &[u8]) {
        let id = CanId::service(
            request.id.priority,
            request.id.data_type_id as u8,
            false,
            self.node_id,
            request.id.source_node_id,
        );
        self.send(id, request.transfer_id, signature, payload);
    }

    fn publish_status(&mut self, now_us: u64) {
        let payload = self.node_status_payload(now_us);
        let id = CanId::message(PRIORITY_LOW, NODE_STATUS_ID, self.node_id);
        let tid = self.status_transfer_id;
        self.status_transfer_id = (tid + 1) & 0x1F;
        self.send(id, tid, NODE_STATUS_SIGNATURE, &payload);
    }

    fn handle_frame(&mut self, frame: &CanFrame, now_us: u64) -> Option<BusEvent> {
        let id = CanId::from_raw(frame.id);
        if id.kind == TransferKind::Message || id.destination_node_id != self.node_id {
            return None;
        }

        let signature = match (id.kind, id.data_type_id) {
            (TransferKind::Request, GET_NODE_INFO_ID) => GET_NODE_INFO_SIGNATURE,
            (TransferKind::Request, RESTART_NODE_ID) => RESTART_NODE_SIGNATURE,
            (TransferKind::Request, BEGIN_FIRMWARE_UPDATE_ID) => BEGIN_FIRMWARE_UPDATE_SIGNATURE,
            (TransferKind::Response, FILE_READ_ID) => FILE_READ_SIGNATURE,
            _ => return None,
        };
        let transfer = self.rx.accept(id, frame.data(), signature)?;

        match (id.kind, id.data_type_id) {
            (TransferKind::Request, GET_NODE_INFO_ID) => {
                let mut payload: Vec<u8, 128> = Vec::new();
                self.encode_node_info(now_us, &mut payload);
                self.respond(&transfer, GET_NODE_INFO_SIGNATURE, &payload);
                None
            }
            (TransferKind::Request, RESTART_NODE_ID) => {
                let mut magic = [0u8; 8];
                let n = transfer.payload.len().min(5);
                magic[..n].copy_from_slice(&transfer.payload[..n]);
                let accepted = n == 5 && u64::from_le_bytes(magic) == RESTART_MAGIC;
                self.respond(&transfer, RESTART_NODE_SIGNATURE, &[(accepted as u8) << 7]);
                accepted.then_some(BusEvent::RestartRequested)
            }
            (TransferKind::Request, BEGIN_FIRMWARE_UPDATE_ID) => {
                let request = ServiceRequest {
                    node_id: id.source_node_id,
                    transfer_id: transfer.transfer_id,
                };
                match decode_begin_request(&transfer.payload) {
                    Some((source_node_id, path)) => Some(BusEvent::BeginFirmwareUpdate {
                        request,
                        source_node_id,
                        path,
                    }),
                    None => {
                        self.respond_begin_firmware_update(request, BeginUpdateStatus::Unknown);
                        None
                    }
                }
            }
            (TransferKind::Response, FILE_READ_ID) => {
                let (head, data) = transfer.payload.split_at_checked(2)?;
                let data: Vec<u8, MAX_CHUNK_LEN> = Vec::from_slice(data).ok()?;
                Some(BusEvent::FileReadResponse {
                    transfer_id: transfer.transfer_id,
                    error: i16::from_le_bytes([head[0], head[1]]),
                    eof: data.len() < MAX_CHUNK_LEN,
                    data,
                })
            }
            _ => None,
        }
    }

    fn encode_node_info<const N: usize>(&self, now_us: u64, out: &mut Vec<u8, N>) {
        let info = &self.info;
        let name = &info.name.as_bytes()[..info.name.len().min(NODE_NAME_MAX)];
        let _ = out.extend_from_slice(&self.node_status_payload(now_us));
        // SoftwareVersion: flags bit 0 marks vcs_commit as present
        let _ = out.extend_from_slice(&[info.software_major, info.software_minor, 0x01]);
        let _ = out.extend_from_slice(&info.vcs_commit.to_le_bytes());
        let _ = out.extend_from_slice(&0u64.to_le_bytes());
        // HardwareVersion with an empty certificate
        let _ = out.extend_from_slice(&[info.hardware_major, info.hardware_minor]);
        let _ = out.extend_from_slice(&info.unique_id);
        let _ = out.push(0);
        let _ = out.extend_from_slice(name);
    }
}

fn decode_begin_request(payload: &[u8]) -> Option<(u8, String<MAX_PATH_LEN>)> {
    let (&source_node_id, path) = payload.split_first()?;
    let text = core::str::from_utf8(path).ok()?;
    let mut stored = String::new();
    stored.push_str(text).ok()?;
    Some((source_node_id, stored))
}

impl<D: CanDriver> FileReadClient for UavcanNode<D> {
    fn request_chunk(&mut self, server_node_id: u8, offset: u32, path: &str) -> u8 {
        let mut payload: Vec<u8, { 5 + MAX_PATH_LEN }> = Vec::new();
        let _ = payload.extend_from_slice(&(offset as u64).to_le_bytes()[..5]);
        let path = &path.as_bytes()[..path.len().min(MAX_PATH_LEN)];
        let _ = payload.extend_from_slice(path);

        let tid = self.read_transfer_id;
        self.read_transfer_id = (tid + 1) & 0x1F;
        let id = CanId::service(
            PRIORITY_MEDIUM,
            FILE_READ_ID as u8,
            true,
            self.node_id,
            server_node_id,
        );
        self.send(id, tid, FILE_READ_SIGNATURE, &payload);
        tid
    }
}

impl<D: CanDriver> NodeTransport for UavcanNode<D> {
    fn start_bus(&mut self, bitrate: u32, timing: TimingParams, silent: bool) {
        debug!("uavcan: bus at {} bit/s, silent={}", bitrate, silent);
        self.driver.configure(timing, silent);
        self.silent = silent;
        self.frame_seen = false;
        self.rx.reset();
        self.tx.clear();
    }

    fn take_frame_seen(&mut self) -> bool {
        core::mem::take(&mut self.frame_seen)
    }

    fn poll_event(&mut self, now_us: u64) -> Option<BusEvent> {
        self.flush();

        if !self.silent && now_us >= self.next_status_us {
            self.next_status_us = now_us + NODE_STATUS_PERIOD_US;
            self.publish_status(now_us);
        }

        while let Some(frame) = self.driver.receive() {
            self.frame_seen = true;
            if self.silent || !frame.extended || frame.len == 0 {
                continue;
            }
            if let Some(event) = self.handle_frame(&frame, now_us) {
                return Some(event);
            }
        }
        None
    }

    fn set_node_id(&mut self, node_id: u8) {
        self.node_id = node_id & 0x7F;
    }

    fn node_id(&self) -> u8 {
        self.node_id
    }

    fn set_mode(&mut self, mode: NodeMode) {
        self.mode = mode;
    }

    fn set_health(&mut self, health: NodeHealth) {
        self.health = health;
    }

    fn respond_begin_firmware_update(
        &mut self,
        request: ServiceRequest,
        status: BeginUpdateStatus,
    ) {
        let id = CanId::service(
            PRIORITY_MEDIUM,
            BEGIN_FIRMWARE_UPDATE_ID as u8,
            false,
            self.node_id,
            request.node_id,
        );
        self.send(id, request.transfer_id, BEGIN_FIRMWARE_UPDATE_SIGNATURE, &[status as u8]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_byte_bits() {
        let tail = TailByte {
            start_of_transfer: true,
            end_of_transfer: false,
            toggle: true,
            transfer_id: 5,
        };
        assert_eq!(tail.to_u8(), 0b1010_0101);
        assert_eq!(TailByte::from_u8(0b1010_0101), tail);
    }

    #[test]
    fn test_service_id_layout() {
        let id = CanId::service(PRIORITY_MEDIUM, FILE_READ_ID as u8, true, 42, 10);
        assert_eq!(id.to_raw(), (16 << 24) | (48 << 16) | (1 << 15) | (10 << 8) | (1 << 7) | 42);
        assert_eq!(CanId::from_raw(id.to_raw()), id);
    }
}
