// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Shared mailbox: one typed message carried across a reset between the
//! application and the bootloader.
//!
//! Layout (little-endian, packed):
//!
//! | offset | size | field   |
//! |--------|------|---------|
//! | 0      | 8    | crc64   |
//! | 8      | 4    | magic   |
//! | 12     | 1    | kind    |
//! | 13     | len  | payload |
//!
//! The CRC covers `magic ++ kind ++ payload`, with `len` fixed by `kind`.
//! Reading is destructive: [`Mailbox::check_and_retrieve`] clears the region
//! whatever it found, so a message is consumed at most once.

use heapless::String;

use crate::config::{MAILBOX_HEADER_SIZE, MAILBOX_MAGIC, MAILBOX_SIZE, MAX_PATH_LEN};
use crate::crc64::crc64;

const CRC_OFFSET: usize = 0;
const MAGIC_OFFSET: usize = 8;
const KIND_OFFSET: usize = 12;
const PAYLOAD_OFFSET: usize = MAILBOX_HEADER_SIZE;

const CANBUS_INFO_LEN: usize = 5;
const PATH_FIELD_LEN: usize = MAX_PATH_LEN + 1;

/// Memory that survives a reset, seen as a byte range.
///
/// Implementations on real hardware must perform the accesses in call order
/// (volatile), so the write ordering of [`Mailbox::finalize_and_write`] holds.
pub trait SharedRegion {
    fn read(&self, offset: usize, buf: &mut [u8]);
    fn write(&mut self, offset: usize, data: &[u8]);
}

impl<const N: usize> SharedRegion for [u8; N] {
    fn read(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self[offset..offset + buf.len()]);
    }

    fn write(&mut self, offset: usize, data: &[u8]) {
        self[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// Message type stored in the header.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageKind {
    Boot = 0,
    FirmwareUpdate = 1,
    BootInfo = 2,
    CanbusInfo = 3,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageKind::Boot),
            1 => Some(MessageKind::FirmwareUpdate),
            2 => Some(MessageKind::BootInfo),
            3 => Some(MessageKind::CanbusInfo),
            _ => None,
        }
    }

    /// Exact payload length covered by the CRC for this kind.
    pub const fn payload_len(self) -> usize {
        match self {
            MessageKind::Boot => CANBUS_INFO_LEN,
            MessageKind::FirmwareUpdate => CANBUS_INFO_LEN + 1 + PATH_FIELD_LEN,
            MessageKind::BootInfo => CANBUS_INFO_LEN + 4,
            MessageKind::CanbusInfo => CANBUS_INFO_LEN,
        }
    }
}

/// Bus settings handed over between images.
///
/// A zero node id or bit rate means "unknown".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanbusInfo {
    pub local_node_id: u8,
    pub baudrate: u32,
}

impl CanbusInfo {
    fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.local_node_id;
        buf[1..5].copy_from_slice(&self.baudrate.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            local_node_id: buf[0],
            baudrate: u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
        }
    }
}

/// Application asks the bootloader to fetch a new image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareUpdateRequest {
    pub canbus_info: CanbusInfo,
    pub source_node_id: u8,
    pub path: String<MAX_PATH_LEN>,
}

/// Bootloader tells the application about the board it runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootInfo {
    pub canbus_info: CanbusInfo,
    /// Address of the board's hardware description table, opaque to the bootloader.
    pub hw_info_addr: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailboxMessage {
    Boot(CanbusInfo),
    FirmwareUpdate(FirmwareUpdateRequest),
    BootInfo(BootInfo),
    CanbusInfo(CanbusInfo),
}

impl MailboxMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            MailboxMessage::Boot(_) => MessageKind::Boot,
            MailboxMessage::FirmwareUpdate(_) => MessageKind::FirmwareUpdate,
            MailboxMessage::BootInfo(_) => MessageKind::BootInfo,
            MailboxMessage::CanbusInfo(_) => MessageKind::CanbusInfo,
        }
    }

    /// Bus settings carried by the message, every kind has them.
    pub fn canbus_info(&self) -> CanbusInfo {
        match self {
            MailboxMessage::Boot(info) | MailboxMessage::CanbusInfo(info) => *info,
            MailboxMessage::FirmwareUpdate(req) => req.canbus_info,
            MailboxMessage::BootInfo(info) => info.canbus_info,
        }
    }

    fn encode_payload(&self, buf: &mut [u8]) {
        match self {
            MailboxMessage::Boot(info) | MailboxMessage::CanbusInfo(info) => info.encode(buf),
            MailboxMessage::FirmwareUpdate(req) => {
                req.canbus_info.encode(buf);
                buf[5] = req.source_node_id;
                let path = &mut buf[6..6 + PATH_FIELD_LEN];
                path.fill(0);
                path[..req.path.len()].copy_from_slice(req.path.as_bytes());
            }
            MailboxMessage::BootInfo(info) => {
                info.canbus_info.encode(buf);
                buf[5..9].copy_from_slice(&info.hw_info_addr.to_le_bytes());
            }
        }
    }

    fn decode_payload(kind: MessageKind, buf: &[u8]) -> Option<Self> {
        let canbus_info = CanbusInfo::decode(buf);
        let msg = match kind {
            MessageKind::Boot => MailboxMessage::Boot(canbus_info),
            MessageKind::CanbusInfo => MailboxMessage::CanbusInfo(canbus_info),
            MessageKind::FirmwareUpdate => {
                let field = &buf[6..6 + PATH_FIELD_LEN];
                let len = field.iter().position(|&b| b == 0)?;
                let text = core::str::from_utf8(&field[..len]).ok()?;
                let mut path = String::new();
                path.push_str(text).ok()?;
                MailboxMessage::FirmwareUpdate(FirmwareUpdateRequest {
                    canbus_info,
                    source_node_id: buf[5],
                    path,
                })
            }
            MessageKind::BootInfo => MailboxMessage::BootInfo(BootInfo {
                canbus_info,
                hw_info_addr: u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]),
            }),
        };
        Some(msg)
    }
}

/// The shared mailbox, owned by whoever runs the single control flow.
pub struct Mailbox<R: SharedRegion> {
    region: R,
}

impl<R: SharedRegion> Mailbox<R> {
    pub const fn new(region: R) -> Self {
        Self { region }
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut R {
        &mut self.region
    }

    /// Validate and decode the stored message without consuming it.
    pub fn peek(&self) -> Option<MailboxMessage> {
        let mut buf = [0u8; MAILBOX_SIZE];
        self.region.read(0, &mut buf[..MAILBOX_HEADER_SIZE]);

        let magic = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if magic != MAILBOX_MAGIC {
            return None;
        }

        let kind = MessageKind::from_u8(buf[KIND_OFFSET])?;
        let end = PAYLOAD_OFFSET + kind.payload_len();
        self.region.read(PAYLOAD_OFFSET, &mut buf[PAYLOAD_OFFSET..end]);

        let mut stored = [0u8; 8];
        stored.copy_from_slice(&buf[CRC_OFFSET..MAGIC_OFFSET]);
        if crc64(&buf[MAGIC_OFFSET..end], 0) != u64::from_le_bytes(stored) {
            return None;
        }

        MailboxMessage::decode_payload(kind, &buf[PAYLOAD_OFFSET..end])
    }

    /// Return the stored message if it is valid, then clear the region.
    pub fn check_and_retrieve(&mut self) -> Option<MailboxMessage> {
        let msg = self.peek();
        self.clear();
        msg
    }

    /// Store `msg`. The magic is written last, after payload and CRC,
    /// so an interrupted write never reads back as valid.
    pub fn finalize_and_write(&mut self, msg: &MailboxMessage) {
        let kind = msg.kind();
        let end = PAYLOAD_OFFSET + kind.payload_len();

        let mut buf = [0u8; MAILBOX_SIZE];
        buf[MAGIC_OFFSET..KIND_OFFSET].copy_from_slice(&MAILBOX_MAGIC.to_le_bytes());
        buf[KIND_OFFSET] = kind as u8;
        msg.encode_payload(&mut buf[PAYLOAD_OFFSET..end]);
        let crc = crc64(&buf[MAGIC_OFFSET..end], 0);
        buf[CRC_OFFSET..MAGIC_OFFSET].copy_from_slice(&crc.to_le_bytes());

        // Invalidate whatever was there before touching the body
        self.region.write(MAGIC_OFFSET, &[0; 4]);
        self.region.write(KIND_OFFSET, &buf[KIND_OFFSET..end]);
        self.region.write(CRC_OFFSET, &buf[CRC_OFFSET..MAGIC_OFFSET]);
        self.region.write(MAGIC_OFFSET, &buf[MAGIC_OFFSET..KIND_OFFSET]);
    }

    /// Zero the whole region.
    pub fn clear(&mut self) {
        self.region.write(0, &[0u8; MAILBOX_SIZE]);
    }
}
