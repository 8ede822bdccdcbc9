// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Scenario tests for the bootloader control loop.

mod support;

use canboot_common::bootloader::check_app;
use canboot_common::config::{FALLBACK_NODE_ID, MAILBOX_SIZE};
use canboot_common::mailbox::FirmwareUpdateRequest;
use canboot_common::node::{BeginUpdateStatus, ServiceRequest};
use canboot_common::{
    pre_init, BusEvent, Bootloader, CanbusInfo, EarlyBoot, Exit, JumpInfo, Mailbox, MailboxMessage,
    NodeHealth, NodeMode,
};
use support::{
    app_image, app_image_with_params, params, ScriptedTransport, SimFlash, CLOCK_HZ, ENTRY_POINT,
    STACK_TOP,
};

type Loader = Bootloader<ScriptedTransport, SimFlash, [u8; MAILBOX_SIZE]>;

const SERVER: u8 = 10;
const STEP: u64 = 100_000;

fn loader(flash: SimFlash, retained: Option<MailboxMessage>) -> Loader {
    Bootloader::new(
        ScriptedTransport::new(),
        flash,
        Mailbox::new([0u8; MAILBOX_SIZE]),
        retained,
        CLOCK_HZ,
        0,
    )
}

fn app_jump() -> JumpInfo {
    JumpInfo {
        stack_pointer: STACK_TOP,
        entry_point: ENTRY_POINT,
    }
}

/// Poll from `from` up to `until` in fixed steps, stopping at the first exit.
fn run(loader: &mut Loader, from: u64, until: u64) -> Option<(u64, Exit)> {
    let mut now = from;
    while now <= until {
        if let Some(exit) = loader.service(now) {
            return Some((now, exit));
        }
        now += STEP;
    }
    None
}

fn retained_boot_message(loader: &Loader) -> Option<MailboxMessage> {
    loader.mailbox().peek()
}

fn begin_event(source_node_id: u8, path: &str) -> BusEvent {
    BusEvent::BeginFirmwareUpdate {
        request: ServiceRequest {
            node_id: SERVER,
            transfer_id: 3,
        },
        source_node_id,
        path: path.try_into().unwrap(),
    }
}

/// Answer the last file read request with the matching slice of `image`.
fn push_chunk(loader: &mut Loader, image: &[u8]) {
    let request = loader.transport().client.last().clone();
    let start = request.offset as usize;
    let end = (start + 256).min(image.len());
    loader.transport_mut().events.push_back(BusEvent::FileReadResponse {
        transfer_id: request.transfer_id,
        error: 0,
        data: heapless::Vec::from_slice(&image[start..end]).unwrap(),
        eof: end - start < 256,
    });
}

// =============================================================================
// pre_init
// =============================================================================

#[test]
fn test_boot_message_takes_fast_path() {
    let flash = SimFlash::with_image(&app_image(2048, 1));
    let mut mailbox = Mailbox::new([0u8; MAILBOX_SIZE]);
    mailbox.finalize_and_write(&MailboxMessage::Boot(CanbusInfo::default()));

    assert_eq!(pre_init(&mut mailbox, &flash), EarlyBoot::Jump(app_jump()));
    assert_eq!(mailbox.peek(), None);
}

#[test]
fn test_boot_message_with_blank_flash_continues() {
    let flash = SimFlash::new();
    let mut mailbox = Mailbox::new([0u8; MAILBOX_SIZE]);
    let msg = MailboxMessage::Boot(CanbusInfo::default());
    mailbox.finalize_and_write(&msg);

    assert_eq!(pre_init(&mut mailbox, &flash), EarlyBoot::Continue(Some(msg)));
}

#[test]
fn test_other_messages_continue_with_message() {
    let flash = SimFlash::with_image(&app_image(2048, 2));
    let mut mailbox = Mailbox::new([0u8; MAILBOX_SIZE]);
    let msg = MailboxMessage::CanbusInfo(CanbusInfo {
        local_node_id: 5,
        baudrate: 250_000,
    });
    mailbox.finalize_and_write(&msg);

    assert_eq!(pre_init(&mut mailbox, &flash), EarlyBoot::Continue(Some(msg)));
    assert_eq!(pre_init(&mut mailbox, &flash), EarlyBoot::Continue(None));
}

#[test]
fn test_jump_info_rejects_erased_or_zero_words() {
    assert_eq!(JumpInfo::read(&[0xFF; 8]), None);
    assert_eq!(JumpInfo::read(&[0; 8]), None);
    assert_eq!(JumpInfo::read(&[1, 0, 0, 0]), None);
    let mut words = [0u8; 8];
    words[..4].copy_from_slice(&STACK_TOP.to_le_bytes());
    words[4..].copy_from_slice(&ENTRY_POINT.to_le_bytes());
    assert_eq!(JumpInfo::read(&words), Some(app_jump()));
}

// =============================================================================
// Initialisation
// =============================================================================

#[test]
fn test_no_hints_starts_autobaud() {
    let bl = loader(SimFlash::with_image(&app_image(2048, 3)), None);

    assert_eq!(bl.transport().last_bus_start(), (1_000_000, true));
    assert_eq!(bl.transport().node_id, FALLBACK_NODE_ID);
    assert_eq!(bl.bitrate(), None);
    assert_eq!(bl.boot_deadline_us(), Some(3_000_000));
}

#[test]
fn test_parameters_provide_bus_settings_and_delay() {
    let image = app_image_with_params(2048, 4, [Some(params(1, 1, 250_000, 33)), None]);
    let bl = loader(SimFlash::with_image(&image), None);

    assert_eq!(bl.transport().last_bus_start(), (250_000, false));
    assert_eq!(bl.transport().node_id, 33);
    assert_eq!(bl.bitrate(), Some(250_000));
    assert_eq!(bl.boot_deadline_us(), Some(1_000_000));
}

#[test]
fn test_mailbox_hint_overrides_parameters() {
    let image = app_image_with_params(2048, 5, [Some(params(1, 1, 250_000, 33)), None]);
    let hint = MailboxMessage::CanbusInfo(CanbusInfo {
        local_node_id: 7,
        baudrate: 125_000,
    });
    let bl = loader(SimFlash::with_image(&image), Some(hint));

    assert_eq!(bl.transport().last_bus_start(), (125_000, false));
    assert_eq!(bl.transport().node_id, 7);
}

#[test]
fn test_rate_without_timing_falls_back_to_autobaud() {
    let hint = MailboxMessage::CanbusInfo(CanbusInfo {
        local_node_id: 7,
        baudrate: 500_000,
    });
    let bl = loader(SimFlash::new(), Some(hint));

    assert_eq!(bl.transport().bus_starts.len(), 1);
    assert_eq!(bl.transport().last_bus_start(), (1_000_000, true));
}

#[test]
fn test_invalid_app_arms_no_timer() {
    let bl = loader(SimFlash::new(), None);
    assert!(bl.app().is_none());
    assert_eq!(bl.boot_deadline_us(), None);
}

// =============================================================================
// Autobaud
// =============================================================================

#[test]
fn test_autobaud_skips_rates_without_timing() {
    let mut bl = loader(SimFlash::new(), None);
    run(&mut bl, 0, 1_000_000);

    let starts: Vec<(u32, bool)> = bl.transport().bus_starts.iter().map(|s| (s.0, s.2)).collect();
    assert_eq!(starts, vec![(1_000_000, true), (250_000, true)]);
}

#[test]
fn test_autobaud_confirms_on_traffic() {
    let mut bl = loader(SimFlash::new(), None);
    run(&mut bl, 0, 1_000_000);
    bl.transport_mut().frame_seen = true;
    bl.service(1_050_000);

    assert_eq!(bl.transport().last_bus_start(), (250_000, false));
    assert_eq!(bl.bitrate(), Some(250_000));
    assert_eq!(bl.confirmed_bitrate(), 250_000);
}

// =============================================================================
// Boot timer
// =============================================================================

#[test]
fn test_valid_app_boots_after_delay() {
    let mut bl = loader(SimFlash::with_image(&app_image(4096, 6)), None);

    let (at, exit) = run(&mut bl, 0, 10_000_000).expect("boots");
    assert_eq!(at, 3_000_000);
    assert_eq!(exit, Exit::Jump(app_jump()));
    // Autobaud never heard anything, the rate is reported as unknown
    assert_eq!(
        retained_boot_message(&bl),
        Some(MailboxMessage::Boot(CanbusInfo {
            local_node_id: FALLBACK_NODE_ID,
            baudrate: 0,
        }))
    );
}

#[test]
fn test_boot_message_carries_confirmed_rate() {
    let image = app_image_with_params(4096, 7, [Some(params(1, 2, 1_000_000, 12)), None]);
    let mut bl = loader(SimFlash::with_image(&image), None);
    bl.transport_mut().frame_seen = true;

    let (at, _) = run(&mut bl, 0, 10_000_000).expect("boots");
    assert_eq!(at, 2_000_000);
    assert_eq!(
        retained_boot_message(&bl),
        Some(MailboxMessage::Boot(CanbusInfo {
            local_node_id: 12,
            baudrate: 1_000_000,
        }))
    );
}

#[test]
fn test_invalid_app_never_boots() {
    let mut bl = loader(SimFlash::new(), None);
    assert_eq!(run(&mut bl, 0, 30_000_000), None);
    assert_eq!(bl.transport().mode, Some(NodeMode::Maintenance));
    assert_eq!(bl.transport().health, Some(NodeHealth::Critical));
}

#[test]
fn test_boot_revalidates_image() {
    let mut bl = loader(SimFlash::with_image(&app_image(4096, 8)), None);
    assert!(bl.app().is_some());
    assert_eq!(bl.transport().health, None);

    bl.service(0);
    assert_eq!(bl.transport().health, Some(NodeHealth::Ok));

    bl.flash_mut().mem[1000] ^= 0xFF;
    assert_eq!(run(&mut bl, STEP, 10_000_000), None);
    assert_eq!(bl.boot_deadline_us(), None);
    assert_eq!(bl.transport().health, Some(NodeHealth::Critical));
    assert_eq!(retained_boot_message(&bl), None);
}

// =============================================================================
// Restart
// =============================================================================

#[test]
fn test_restart_is_debounced_and_keeps_bus_settings() {
    let hint = MailboxMessage::CanbusInfo(CanbusInfo {
        local_node_id: 9,
        baudrate: 250_000,
    });
    let mut bl = loader(SimFlash::new(), Some(hint));
    bl.transport_mut().frame_seen = true;
    bl.service(0);

    bl.transport_mut().events.push_back(BusEvent::RestartRequested);
    assert_eq!(bl.service(5_000), None);
    assert_eq!(bl.service(6_000), None);
    assert_eq!(bl.service(6_001), Some(Exit::Reset));
    assert_eq!(
        bl.mailbox().peek(),
        Some(MailboxMessage::CanbusInfo(CanbusInfo {
            local_node_id: 9,
            baudrate: 250_000,
        }))
    );
}

// =============================================================================
// Firmware update
// =============================================================================

#[test]
fn test_begin_request_from_bus() {
    let mut bl = loader(SimFlash::with_image(&app_image(4096, 9)), None);
    bl.transport_mut().events.push_back(begin_event(0, "app.bin"));
    bl.service(0);

    let request = ServiceRequest {
        node_id: SERVER,
        transfer_id: 3,
    };
    assert_eq!(bl.transport().begin_responses, vec![(request, BeginUpdateStatus::Ok)]);
    // Source 0 means the requester serves the file
    let read = bl.transport().client.last();
    assert_eq!((read.server_node_id, read.offset, read.path.as_str()), (SERVER, 0, "app.bin"));
    assert!(bl.update_in_progress());
    assert_eq!(bl.transport().mode, Some(NodeMode::SoftwareUpdate));
    assert!(check_app(bl.flash()).is_none());
    assert_eq!(bl.boot_deadline_us(), None);
}

#[test]
fn test_second_begin_reports_in_progress() {
    let mut bl = loader(SimFlash::new(), None);
    bl.transport_mut().events.push_back(begin_event(20, "a.bin"));
    bl.transport_mut().events.push_back(begin_event(21, "b.bin"));
    bl.service(0);

    let statuses: Vec<BeginUpdateStatus> =
        bl.transport().begin_responses.iter().map(|r| r.1).collect();
    assert_eq!(statuses, vec![BeginUpdateStatus::Ok, BeginUpdateStatus::InProgress]);
    assert_eq!(bl.transport().client.requests.len(), 1);
    assert_eq!(bl.transport().client.last().server_node_id, 20);
}

#[test]
fn test_complete_update_boots_new_image() {
    let image = app_image(3000, 10);
    let mut bl = loader(SimFlash::new(), None);
    bl.transport_mut().frame_seen = true;
    bl.service(0);
    assert_eq!(bl.confirmed_bitrate(), 1_000_000);

    bl.transport_mut().events.push_back(begin_event(SERVER, "new.bin"));
    bl.service(1_000);

    let mut now = 1_000;
    let exit = loop {
        now += 1_000;
        push_chunk(&mut bl, &image);
        if let Some(exit) = bl.service(now) {
            break exit;
        }
        assert!(now < 1_000_000, "update did not finish");
    };

    assert_eq!(exit, Exit::Jump(app_jump()));
    assert_eq!(&bl.flash().mem[..image.len()], &image[..]);
    assert_eq!(
        retained_boot_message(&bl),
        Some(MailboxMessage::Boot(CanbusInfo {
            local_node_id: FALLBACK_NODE_ID,
            baudrate: 1_000_000,
        }))
    );
}

#[test]
fn test_completed_image_failing_check_is_left_unbootable() {
    let mut image = app_image(3000, 77);
    image[2000] ^= 0x01;
    let mut bl = loader(SimFlash::new(), None);
    bl.transport_mut().events.push_back(begin_event(SERVER, "bad.bin"));
    bl.service(0);

    let mut now = 0;
    while bl.update_in_progress() {
        now += 1_000;
        push_chunk(&mut bl, &image);
        assert_eq!(bl.service(now), None);
        assert!(now < 1_000_000, "update did not finish");
    }

    assert_eq!(JumpInfo::read(&bl.flash().mem), None);
    assert_eq!(&bl.flash().mem[2048..image.len()], &image[2048..]);
    assert!(bl.app().is_none());
    assert_eq!(bl.boot_deadline_us(), None);
    assert_eq!(bl.transport().health, Some(NodeHealth::Critical));

    // A stale boot request must not reach the corrupted image either
    let mut mailbox = Mailbox::new([0u8; MAILBOX_SIZE]);
    let msg = MailboxMessage::Boot(CanbusInfo::default());
    mailbox.finalize_and_write(&msg);
    assert_eq!(pre_init(&mut mailbox, bl.flash()), EarlyBoot::Continue(Some(msg)));
}

#[test]
fn test_update_timeout_leaves_node_in_maintenance() {
    let mut bl = loader(SimFlash::with_image(&app_image(4096, 11)), None);
    bl.transport_mut().events.push_back(begin_event(SERVER, "lost.bin"));

    // Ten resends at 500 ms, then abort
    assert_eq!(run(&mut bl, 0, 20_000_000), None);
    assert!(!bl.update_in_progress());
    assert_eq!(bl.transport().client.requests.len(), 11);
    assert_eq!(bl.transport().mode, Some(NodeMode::Maintenance));
    assert_eq!(bl.transport().health, Some(NodeHealth::Critical));
    assert!(check_app(bl.flash()).is_none());
}

#[test]
fn test_pending_update_from_mailbox_starts_when_online() {
    let request = MailboxMessage::FirmwareUpdate(FirmwareUpdateRequest {
        canbus_info: CanbusInfo {
            local_node_id: 20,
            baudrate: 1_000_000,
        },
        source_node_id: SERVER,
        path: "from-app.bin".try_into().unwrap(),
    });
    let mut bl = loader(SimFlash::with_image(&app_image(4096, 12)), Some(request));
    assert_eq!(bl.transport().node_id, 20);
    assert!(!bl.update_in_progress());

    bl.service(0);
    assert!(bl.update_in_progress());
    let read = bl.transport().client.last();
    assert_eq!((read.server_node_id, read.path.as_str()), (SERVER, "from-app.bin"));
}
