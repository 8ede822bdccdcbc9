// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Checks of the firmware linker script against the shared constants.

use canboot_common::config::MAILBOX_SIZE;

const LINKER_SCRIPT: &str = include_str!("../../linker_scripts/bootloader_stm32f302k8.x");

/// `LENGTH` of a `MEMORY` region, in bytes. Handles the `K` suffix and `- N`.
fn region_length(name: &str) -> usize {
    let line = LINKER_SCRIPT
        .lines()
        .map(str::trim)
        .find(|l| l.split_whitespace().next() == Some(name))
        .expect("region declared");
    let expr = line.split("LENGTH =").nth(1).expect("region has a length");
    expr.split('-')
        .map(|term| {
            let term = term.trim();
            match term.strip_suffix('K') {
                Some(k) => k.parse::<usize>().expect("number") * 1024,
                None => term.parse::<usize>().expect("number"),
            }
        })
        .reduce(|a, b| a - b)
        .expect("non-empty length")
}

// =============================================================================
// Shared RAM
// =============================================================================

#[test]
fn test_shared_region_holds_mailbox() {
    assert!(region_length("SHARED") >= MAILBOX_SIZE);
}

#[test]
fn test_link_fails_if_shared_region_shrinks() {
    let assertion = format!("ASSERT(LENGTH(SHARED) >= {}", MAILBOX_SIZE);
    assert!(LINKER_SCRIPT.contains(&assertion));
}

#[test]
fn test_shared_region_sits_above_ram() {
    assert_eq!(region_length("RAM") + region_length("SHARED"), 16 * 1024);
}
