// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use fluxion_fota::package::{ForceErrorCase, read_sidecar};
use fluxion_fota::{
    FotaError, PackageBuilder, SlotId, SlotState, UpdateResult, encode_multi_package,
};
use fluxion_fota_integration_tests::{Harness, download};
use std::fs;

fn body_for(slot: SlotId, len: usize) -> Vec<u8> {
    // Distinct fill byte per slot so bleed between images is visible
    let fill = b'a' + slot.index() as u8;
    vec![fill; len]
}

#[test]
fn test_every_package_lands_in_its_slot() {
    let harness = Harness::new().with_trusted_element_version("3.0");
    let mut engine = harness.engine();

    // Declared lengths deliberately out of slot order and uneven
    let order = [
        (SlotId::Modem, 9000),
        (SlotId::Application, 17),
        (SlotId::Bootloader, 4096),
        (SlotId::TrustedElement, 1),
    ];
    let packages: Vec<Vec<u8>> = order
        .iter()
        .map(|&(slot, len)| {
            PackageBuilder::new(slot, format!("2.{}", slot.index()))
                .build(&body_for(slot, len))
                .unwrap()
        })
        .collect();
    let stream = encode_multi_package(&packages).unwrap();

    let targets = download(&mut engine, SlotId::Modem, &stream).unwrap();

    assert_eq!(targets.len(), order.len());
    for (slot, len) in order {
        assert_eq!(engine.state(slot), SlotState::Downloaded, "{slot}");
        let image = engine.pending_image_path(slot).unwrap();
        assert_eq!(fs::read(image).unwrap(), body_for(slot, len), "{slot}");
        assert_eq!(
            engine.get_pending_version(slot),
            format!("2.{}", slot.index())
        );
        let metadata = read_sidecar(image).unwrap();
        assert_eq!(metadata.slot(), Some(slot));
    }
}

#[test]
fn test_one_bad_crc_rolls_back_whole_batch() {
    let harness = Harness::new();
    let mut engine = harness.engine();
    let good = PackageBuilder::new(SlotId::Bootloader, "1.1")
        .build(b"boot")
        .unwrap();
    let bad = PackageBuilder::new(SlotId::Modem, "1.1")
        .crc(0)
        .build(b"modem")
        .unwrap();
    let stream = encode_multi_package(&[good, bad]).unwrap();

    let err = download(&mut engine, SlotId::Bootloader, &stream).unwrap_err();

    assert_eq!(err.result(), UpdateResult::IntegrityFailure);
    for slot in [SlotId::Bootloader, SlotId::Modem] {
        assert_eq!(engine.state(slot), SlotState::Idle);
        assert_eq!(engine.result(slot), UpdateResult::IntegrityFailure);
        assert!(!engine.slot(slot).paths.image.exists());
    }
}

#[test]
fn test_forced_out_of_memory_rejects_batch() {
    let harness = Harness::new();
    let mut engine = harness.engine();
    let stream = PackageBuilder::new(SlotId::TrustedElement, "1.1")
        .force_error(ForceErrorCase::OutOfMemory)
        .build(b"tee")
        .unwrap();

    let err = download(&mut engine, SlotId::TrustedElement, &stream).unwrap_err();

    assert!(matches!(err, FotaError::OutOfMemory { .. }));
    assert_eq!(engine.state(SlotId::TrustedElement), SlotState::Idle);
    assert_eq!(engine.result(SlotId::TrustedElement), UpdateResult::OutOfMemory);
}

#[test]
fn test_zero_package_count_is_invalid() {
    let harness = Harness::new();
    let mut engine = harness.engine();
    let mut stream = b"MULTIPKG".to_vec();
    stream.extend_from_slice(&1u16.to_be_bytes());
    stream.extend_from_slice(&0u16.to_be_bytes());

    let err = download(&mut engine, SlotId::Modem, &stream).unwrap_err();

    assert_eq!(err.result(), UpdateResult::UnsupportedPackageType);
    assert_eq!(engine.state(SlotId::Modem), SlotState::Idle);
}

#[test]
fn test_unknown_magic_is_unsupported() {
    let harness = Harness::new();
    let mut engine = harness.engine();
    let mut stream = PackageBuilder::new(SlotId::Modem, "1.0")
        .build(b"modem")
        .unwrap();
    stream[..8].copy_from_slice(b"FOTA_GPU");

    let err = download(&mut engine, SlotId::Modem, &stream).unwrap_err();

    assert_eq!(err.result(), UpdateResult::UnsupportedPackageType);
    assert_eq!(engine.result(SlotId::Modem), UpdateResult::UnsupportedPackageType);
}

#[test]
fn test_package_for_downloaded_slot_is_conflicting_state() {
    let harness = Harness::new();
    let mut engine = harness.engine();
    let modem = PackageBuilder::new(SlotId::Modem, "1.0")
        .build(b"modem v1")
        .unwrap();
    download(&mut engine, SlotId::Modem, &modem).unwrap();

    let boot = PackageBuilder::new(SlotId::Bootloader, "1.0")
        .build(b"boot")
        .unwrap();
    let modem_again = PackageBuilder::new(SlotId::Modem, "1.1")
        .build(b"modem v2")
        .unwrap();
    let stream = encode_multi_package(&[boot, modem_again]).unwrap();

    let err = download(&mut engine, SlotId::Bootloader, &stream).unwrap_err();

    assert!(matches!(
        err,
        FotaError::ConflictingState {
            slot: SlotId::Modem,
            ..
        }
    ));
    assert_eq!(engine.state(SlotId::Bootloader), SlotState::Idle);
    assert_eq!(engine.get_pending_version(SlotId::Modem), "1.0");
    let image = engine.pending_image_path(SlotId::Modem).unwrap();
    assert_eq!(fs::read(image).unwrap(), b"modem v1");
}
