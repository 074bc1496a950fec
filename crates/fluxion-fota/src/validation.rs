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

//! Integrity and provenance checks for staged images

use crate::checksum::crc32_file;
use crate::error::{FotaError, Result};
use crate::package::{ForceErrorCase, PACKAGE_HEADER_VERSION, PackageMetadata};
use crate::slot::{SlotId, SlotRecord};
use std::path::Path;

/// Validates the staged image of a slot record.
///
/// Never mutates the record; the caller turns the error into a result code.
pub fn validate(record: &SlotRecord) -> Result<()> {
    let metadata = record.metadata.as_ref().ok_or_else(|| {
        FotaError::UnsupportedPackageType(format!("no package metadata for {}", record.id))
    })?;
    let image = record.pending_image_path.as_deref().ok_or_else(|| {
        FotaError::IntegrityFailure(format!("no staged image for {}", record.id))
    })?;
    validate_image(record.id, metadata, image)
}

/// Checks, in order: magic, header version, CRC over `image`, force-error hook
pub fn validate_image(slot: SlotId, metadata: &PackageMetadata, image: &Path) -> Result<()> {
    if metadata.magic != *slot.magic() {
        return Err(FotaError::UnsupportedPackageType(format!(
            "magic {:?} does not belong to {slot}",
            String::from_utf8_lossy(&metadata.magic)
        )));
    }

    if metadata.header_version != PACKAGE_HEADER_VERSION {
        return Err(FotaError::UnsupportedPackageType(format!(
            "header version {} not supported",
            metadata.header_version
        )));
    }

    let actual = crc32_file(image).map_err(|e| {
        FotaError::IntegrityFailure(format!(
            "cannot compute checksum of {}: {e}",
            image.display()
        ))
    })?;
    if actual != metadata.crc {
        return Err(FotaError::IntegrityFailure(format!(
            "crc mismatch for {slot}: expected {:#010x}, got {actual:#010x}",
            metadata.crc
        )));
    }

    if metadata.force_error() == ForceErrorCase::OutOfMemory {
        return Err(FotaError::OutOfMemory { slot });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PackageBuilder;
    use crate::slot::UpdateResult;
    use std::fs;
    use tempfile::tempdir;

    fn staged(dir: &Path, body: &[u8]) -> std::path::PathBuf {
        let path = dir.join("image.img");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_valid_image() {
        let dir = tempdir().unwrap();
        let image = staged(dir.path(), b"firmware");
        let metadata = PackageBuilder::new(SlotId::Modem, "2.3")
            .metadata(b"firmware")
            .unwrap();

        validate_image(SlotId::Modem, &metadata, &image).unwrap();
    }

    #[test]
    fn test_magic_must_match_slot() {
        let dir = tempdir().unwrap();
        let image = staged(dir.path(), b"firmware");
        let metadata = PackageBuilder::new(SlotId::Modem, "2.3")
            .metadata(b"firmware")
            .unwrap();

        let err = validate_image(SlotId::Bootloader, &metadata, &image).unwrap_err();
        assert_eq!(err.result(), UpdateResult::UnsupportedPackageType);
    }

    #[test]
    fn test_header_version_checked() {
        let dir = tempdir().unwrap();
        let image = staged(dir.path(), b"firmware");
        let metadata = PackageBuilder::new(SlotId::Modem, "2.3")
            .header_version(4)
            .metadata(b"firmware")
            .unwrap();

        let err = validate_image(SlotId::Modem, &metadata, &image).unwrap_err();
        assert_eq!(err.result(), UpdateResult::UnsupportedPackageType);
    }

    #[test]
    fn test_crc_mismatch() {
        let dir = tempdir().unwrap();
        let image = staged(dir.path(), b"firmware");
        let metadata = PackageBuilder::new(SlotId::Modem, "2.3")
            .crc(0xDEAD_BEEF)
            .metadata(b"firmware")
            .unwrap();

        let err = validate_image(SlotId::Modem, &metadata, &image).unwrap_err();
        assert_eq!(err.result(), UpdateResult::IntegrityFailure);
        assert!(err.to_string().contains("0xdeadbeef"));
    }

    #[test]
    fn test_missing_image_is_integrity_failure() {
        let dir = tempdir().unwrap();
        let metadata = PackageMetadata::new(SlotId::Modem, "2.3");

        let err = validate_image(SlotId::Modem, &metadata, &dir.path().join("gone")).unwrap_err();
        assert_eq!(err.result(), UpdateResult::IntegrityFailure);
    }

    #[test]
    fn test_forced_out_of_memory() {
        let dir = tempdir().unwrap();
        let image = staged(dir.path(), b"firmware");
        let metadata = PackageBuilder::new(SlotId::TrustedElement, "2.3")
            .force_error(ForceErrorCase::OutOfMemory)
            .metadata(b"firmware")
            .unwrap();

        let err = validate_image(SlotId::TrustedElement, &metadata, &image).unwrap_err();
        assert_eq!(err.result(), UpdateResult::OutOfMemory);
    }

    #[test]
    fn test_validate_record_without_metadata() {
        let record = SlotRecord::new(SlotId::Modem, Path::new("/data"), None);
        let err = validate(&record).unwrap_err();
        assert_eq!(err.result(), UpdateResult::UnsupportedPackageType);
    }
}
