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

use fluxion_fota::{
    FotaError, PackageBuilder, SlotId, SlotState, UpdateResult, encode_multi_package,
};
use fluxion_fota_integration_tests::{Harness, download};

#[test]
fn test_legacy_application_package_is_downloaded() {
    let harness = Harness::new();
    let mut engine = harness.engine();
    let stream = PackageBuilder::new(SlotId::Application, "2.0")
        .build(b"application image v2")
        .unwrap();

    let targets = download(&mut engine, SlotId::Application, &stream).unwrap();

    assert_eq!(targets, vec![SlotId::Application]);
    assert_eq!(engine.state(SlotId::Application), SlotState::Downloaded);
    assert_eq!(engine.result(SlotId::Application), UpdateResult::Initial);
    let pending = engine.pending_image_path(SlotId::Application).unwrap();
    assert_eq!(std::fs::read(pending).unwrap(), b"application image v2");
    assert_eq!(engine.get_pending_version(SlotId::Application), "2.0");
}

#[test]
fn test_crc_mismatch_rejects_package() {
    let harness = Harness::new();
    let mut engine = harness.engine();
    let stream = PackageBuilder::new(SlotId::Application, "2.0")
        .crc(0x1234_5678)
        .build(b"application image v2")
        .unwrap();

    let err = download(&mut engine, SlotId::Application, &stream).unwrap_err();

    assert!(matches!(err, FotaError::IntegrityFailure(_)));
    assert_eq!(engine.state(SlotId::Application), SlotState::Idle);
    assert_eq!(engine.result(SlotId::Application), UpdateResult::IntegrityFailure);
    assert!(engine.pending_image_path(SlotId::Application).is_none());
    assert!(!engine.slot(SlotId::Application).paths.image.exists());
}

#[test]
fn test_linked_pair_clears_and_regains_conflict() {
    let harness = Harness::new().with_trusted_element_version("1.0");
    let mut engine = harness.engine();
    let app = PackageBuilder::new(SlotId::Application, "1.4")
        .link(SlotId::TrustedElement)
        .build(b"app")
        .unwrap();
    let tee = PackageBuilder::new(SlotId::TrustedElement, "1.2")
        .build(b"tee")
        .unwrap();
    let stream = encode_multi_package(&[app, tee]).unwrap();

    let targets = download(&mut engine, SlotId::Application, &stream).unwrap();

    assert_eq!(targets, vec![SlotId::Application, SlotId::TrustedElement]);
    assert_eq!(engine.linked(SlotId::Application), &[SlotId::TrustedElement]);
    assert!(engine.conflicting(SlotId::Application).is_empty());

    engine.reset(SlotId::TrustedElement);

    assert_eq!(
        engine.conflicting(SlotId::Application),
        &[SlotId::TrustedElement]
    );
    assert_eq!(
        harness.publisher.last_conflicting(SlotId::Application),
        Some(vec![SlotId::TrustedElement])
    );
}

#[test]
fn test_upgrade_with_conflict_is_dependency_error() {
    let harness = Harness::new().with_trusted_element_version("1.0");
    let mut engine = harness.engine();
    let stream = PackageBuilder::new(SlotId::Application, "1.4")
        .link(SlotId::TrustedElement)
        .build(b"app")
        .unwrap();
    download(&mut engine, SlotId::Application, &stream).unwrap();
    let before: Vec<_> = SlotId::ALL
        .iter()
        .map(|&slot| (engine.state(slot), engine.result(slot)))
        .collect();
    harness.publisher.clear();

    let err = engine.perform_upgrade(SlotId::Application, &[]).unwrap_err();

    assert_eq!(err.result(), UpdateResult::DependencyError);
    match err {
        FotaError::DependencyError { slot, blocking } => {
            assert_eq!(slot, SlotId::Application);
            assert_eq!(blocking, vec![SlotId::TrustedElement]);
        }
        other => panic!("expected DependencyError, got {other:?}"),
    }
    let after: Vec<_> = SlotId::ALL
        .iter()
        .map(|&slot| (engine.state(slot), engine.result(slot)))
        .collect();
    assert_eq!(before, after);
    assert!(harness.publisher.events().is_empty());
    assert!(harness.activator.requests().is_empty());
}

