// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Chunked firmware update state machine.
//!
//! Pure logic: flash access and chunk requests go through [`AppFlash`] and
//! [`FileReadClient`], and time is passed in, so the whole transfer can be
//! driven from tests.
//!
//! ```text
//!   Idle ──begin──> InProgress ──eof──> Idle (Complete, image ready to validate)
//!                      │
//!                      └──error / bounds / retries──> Idle (Failed, image invalid)
//! ```
//!
//! The image is invalidated before the first chunk arrives: page 0 is erased
//! on `begin`, and the vector table words are held back and programmed only
//! after the last chunk. An interrupted transfer never looks bootable.

use core::fmt;

use heapless::String;

use crate::config::{FILE_READ_TIMEOUT_US, MAX_FILE_READ_RETRIES, MAX_PATH_LEN};
use crate::flash::{write_verified, AppFlash, FlashError};

/// Bytes at the start of the image programmed last (initial SP and reset vector).
pub const HELD_BACK_LEN: usize = 8;

/// Issues "read file chunk" requests on the bus.
pub trait FileReadClient {
    /// Ask `server_node_id` for the bytes of `path` starting at `offset`.
    ///
    /// Returns the transfer id the response will carry.
    fn request_chunk(&mut self, server_node_id: u8, offset: u32, path: &str) -> u8;
}

/// One response to a chunk request.
#[derive(Clone, Copy, Debug)]
pub struct ChunkResponse<'a> {
    pub transfer_id: u8,
    /// Remote error code, 0 on success.
    pub error: i16,
    pub data: &'a [u8],
    pub eof: bool,
}

/// Why `begin` refused to start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BeginError {
    /// A transfer is already running; it is left untouched.
    InProgress,
    PathTooLong,
    /// Invalidating the current image failed.
    Flash(FlashError),
}

impl fmt::Display for BeginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BeginError::InProgress => f.write_str("update already in progress"),
            BeginError::PathTooLong => f.write_str("file path too long"),
            BeginError::Flash(e) => write!(f, "cannot invalidate image: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BeginError {}

/// Why a running transfer was abandoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateFailure {
    /// The file server answered with this error code.
    Transport(i16),
    /// The chunk would land past the end of the application region.
    OutOfBounds,
    /// A non-final chunk had an odd length, the next one could not be programmed.
    Misaligned,
    Flash(FlashError),
    /// No response after the maximum number of resends.
    RetriesExhausted,
}

impl fmt::Display for UpdateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateFailure::Transport(code) => write!(f, "file server error {}", code),
            UpdateFailure::OutOfBounds => f.write_str("image larger than application region"),
            UpdateFailure::Misaligned => f.write_str("odd-length chunk before end of file"),
            UpdateFailure::Flash(e) => write!(f, "flash: {}", e),
            UpdateFailure::RetriesExhausted => f.write_str("no response from file server"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for UpdateFailure {}

/// Outcome of feeding the state machine a response or a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UpdateEvent {
    /// Nothing in progress, or a stale response was dropped.
    Ignored,
    /// Still waiting for the outstanding response.
    Waiting,
    /// Chunk stored, next chunk requested at `offset`.
    Requested { offset: u32 },
    /// Response timed out, the same chunk was requested again.
    Resent { offset: u32, attempt: u8 },
    /// Last chunk stored. The image must be validated before it is trusted.
    Complete { image_size: u32 },
    /// Transfer abandoned, image left invalid.
    Failed(UpdateFailure),
}

#[derive(Clone, Debug)]
struct Transfer {
    source_node_id: u8,
    path: String<MAX_PATH_LEN>,
    offset: u32,
    transfer_id: u8,
    retries: u8,
    last_request_us: u64,
    /// Pages `0..erased_pages` are erased and safe to program.
    erased_pages: u32,
    held_back: [u8; HELD_BACK_LEN],
}

impl Transfer {
    fn request<C: FileReadClient>(&mut self, client: &mut C, now_us: u64) {
        self.transfer_id = client.request_chunk(self.source_node_id, self.offset, &self.path);
        self.last_request_us = now_us;
    }
}

/// Firmware update driven by file-read responses.
#[derive(Clone, Debug)]
pub struct FirmwareUpdate {
    transfer: Option<Transfer>,
    timeout_us: u64,
    max_retries: u8,
}

impl Default for FirmwareUpdate {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareUpdate {
    pub const fn new() -> Self {
        Self::with_retry_policy(FILE_READ_TIMEOUT_US, MAX_FILE_READ_RETRIES)
    }

    pub const fn with_retry_policy(timeout_us: u64, max_retries: u8) -> Self {
        Self {
            transfer: None,
            timeout_us,
            max_retries,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.transfer.is_some()
    }

    /// Offset of the outstanding request, if a transfer is running.
    pub fn offset(&self) -> Option<u32> {
        self.transfer.as_ref().map(|t| t.offset)
    }

    /// Node serving the file, if a transfer is running.
    pub fn source_node_id(&self) -> Option<u8> {
        self.transfer.as_ref().map(|t| t.source_node_id)
    }

    /// Start fetching `path` from `source_node_id`.
    ///
    /// Invalidates the current image and sends the first request.
    pub fn begin<F, C>(
        &mut self,
        flash: &mut F,
        client: &mut C,
        source_node_id: u8,
        path: &str,
        now_us: u64,
    ) -> Result<(), BeginError>
    where
        F: AppFlash + ?Sized,
        C: FileReadClient,
    {
        if self.transfer.is_some() {
            return Err(BeginError::InProgress);
        }

        let mut stored = String::new();
        stored.push_str(path).map_err(|_| BeginError::PathTooLong)?;

        flash.erase_page(0).map_err(BeginError::Flash)?;

        let mut transfer = Transfer {
            source_node_id,
            path: stored,
            offset: 0,
            transfer_id: 0,
            retries: 0,
            last_request_us: now_us,
            erased_pages: 1,
            held_back: [0xFF; HELD_BACK_LEN],
        };
        transfer.request(client, now_us);

        info!("update: begin from node {}", source_node_id);
        self.transfer = Some(transfer);
        Ok(())
    }

    /// Handle a chunk response.
    pub fn on_chunk<F, C>(
        &mut self,
        flash: &mut F,
        client: &mut C,
        response: ChunkResponse<'_>,
        now_us: u64,
    ) -> UpdateEvent
    where
        F: AppFlash + ?Sized,
        C: FileReadClient,
    {
        let Some(transfer) = self.transfer.as_mut() else {
            return UpdateEvent::Ignored;
        };
        if response.transfer_id != transfer.transfer_id {
            debug!("update: dropped response for transfer {}", response.transfer_id);
            return UpdateEvent::Ignored;
        }

        match store_chunk(flash, transfer, &response) {
            Err(failure) => self.fail(flash, failure),
            Ok(()) if response.eof || response.data.is_empty() => {
                let image_size = transfer.offset + response.data.len() as u32;
                let held_len = (image_size as usize).min(HELD_BACK_LEN);
                let held_back = transfer.held_back;
                if let Err(e) = write_verified(flash, 0, &held_back[..held_len]) {
                    return self.fail(flash, UpdateFailure::Flash(e));
                }
                info!("update: complete, {} bytes", image_size);
                self.transfer = None;
                UpdateEvent::Complete { image_size }
            }
            Ok(()) => {
                transfer.offset += response.data.len() as u32;
                transfer.retries = 0;
                transfer.request(client, now_us);
                UpdateEvent::Requested {
                    offset: transfer.offset,
                }
            }
        }
    }

    /// Resend on timeout, abort once the retry ceiling is reached.
    pub fn poll<F, C>(&mut self, flash: &mut F, client: &mut C, now_us: u64) -> UpdateEvent
    where
        F: AppFlash + ?Sized,
        C: FileReadClient,
    {
        let Some(transfer) = self.transfer.as_mut() else {
            return UpdateEvent::Ignored;
        };
        if now_us.wrapping_sub(transfer.last_request_us) <= self.timeout_us {
            return UpdateEvent::Waiting;
        }
        if transfer.retries >= self.max_retries {
            return self.fail(flash, UpdateFailure::RetriesExhausted);
        }

        transfer.retries += 1;
        transfer.request(client, now_us);
        warn!(
            "update: resend offset {} (attempt {})",
            transfer.offset,
            transfer.retries
        );
        UpdateEvent::Resent {
            offset: transfer.offset,
            attempt: transfer.retries,
        }
    }

    /// Drop the transfer and leave the image invalid.
    fn fail<F: AppFlash + ?Sized>(&mut self, flash: &mut F, failure: UpdateFailure) -> UpdateEvent {
        warn!("update: failed: {}", failure);
        self.transfer = None;
        if let Err(e) = flash.erase_page(0) {
            warn!("update: cannot erase page 0: {}", e);
        }
        UpdateEvent::Failed(failure)
    }
}

/// Erase what the chunk needs and program it, holding back the vector words.
fn store_chunk<F: AppFlash + ?Sized>(
    flash: &mut F,
    transfer: &mut Transfer,
    response: &ChunkResponse<'_>,
) -> Result<(), UpdateFailure> {
    if response.error != 0 {
        return Err(UpdateFailure::Transport(response.error));
    }

    let data = response.data;
    if data.is_empty() {
        return Ok(());
    }

    let offset = transfer.offset;
    let end = offset as usize + data.len();
    if end > flash.size() as usize {
        return Err(UpdateFailure::OutOfBounds);
    }
    if data.len() % 2 != 0 && !response.eof {
        return Err(UpdateFailure::Misaligned);
    }

    let last_page = flash.page_of((end + end % 2) as u32 - 1);
    while transfer.erased_pages <= last_page {
        flash
            .erase_page(transfer.erased_pages)
            .map_err(UpdateFailure::Flash)?;
        transfer.erased_pages += 1;
    }

    // Bytes inside the vector table wait for the end of the transfer
    let split = HELD_BACK_LEN.saturating_sub(offset as usize).min(data.len());
    let (held, rest) = data.split_at(split);
    if !held.is_empty() {
        let at = offset as usize;
        transfer.held_back[at..at + held.len()].copy_from_slice(held);
    }

    if !rest.is_empty() {
        write_verified(flash, offset + split as u32, rest).map_err(UpdateFailure::Flash)?;
    }
    Ok(())
}
