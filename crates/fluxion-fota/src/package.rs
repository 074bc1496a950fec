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

//! Package framing: metadata header, multi-package envelope and unpacking.
//!
//! Wire layout (all integers big-endian):
//!
//! ```text
//! envelope: magic[8]="MULTIPKG" | header_version:u16 | package_count:u16 | length[count]:u32
//! package:  magic[8] | header_version:u16 | force_error_case:u16 | crc32:u32
//!           | linked[8]:u8 (0xFF = unused) | version_len:u8 | version[version_len] | body
//! ```
//!
//! A stream that does not start with the envelope is a single legacy package.

use crate::error::{FotaError, Result};
use crate::slot::{SLOT_COUNT, SlotId, SlotPaths};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const PACKAGE_HEADER_VERSION: u16 = 3;
pub const MULTI_PACKAGE_MAGIC: &[u8; 8] = b"MULTIPKG";
pub const MULTI_PACKAGE_HEADER_VERSION: u16 = 1;
pub const MAX_LINKED_SLOTS: usize = 8;
pub const LINKED_UNUSED: u8 = 0xFF;
pub const MAX_VERSION_LEN: usize = 32;
/// Metadata bytes preceding the version string
pub const METADATA_FIXED_SIZE: usize = 8 + 2 + 2 + 4 + MAX_LINKED_SLOTS + 1;

const ENVELOPE_PEEK_SIZE: usize = 10;
const COPY_CHUNK_SIZE: usize = 8 * 1024;

#[cfg(unix)]
const IMAGE_MODE: u32 = 0o700;

/// Test hook carried in the header, selects a simulated failure path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForceErrorCase {
    #[default]
    None,
    /// Validation reports resource exhaustion
    OutOfMemory,
    /// Apply step fails
    FailedUpdate,
    /// Apply defers; a delayed job concludes with success
    DelayedSuccess,
    /// Apply defers; a delayed job concludes with failure
    DelayedFailedUpdate,
    /// Perform-upgrade concludes with success without activating anything
    SetSuccessInPerformUpgrade,
    /// Perform-upgrade concludes with failure
    SetFailureInPerformUpgrade,
    /// Apply parks the slot in updating until reset
    DoNothing,
}

impl ForceErrorCase {
    pub fn from_code(code: u16) -> Option<Self> {
        let case = match code {
            0 => Self::None,
            1 => Self::OutOfMemory,
            2 => Self::FailedUpdate,
            3 => Self::DelayedSuccess,
            4 => Self::DelayedFailedUpdate,
            5 => Self::SetSuccessInPerformUpgrade,
            6 => Self::SetFailureInPerformUpgrade,
            7 => Self::DoNothing,
            _ => return None,
        };
        Some(case)
    }

    pub fn code(self) -> u16 {
        match self {
            Self::None => 0,
            Self::OutOfMemory => 1,
            Self::FailedUpdate => 2,
            Self::DelayedSuccess => 3,
            Self::DelayedFailedUpdate => 4,
            Self::SetSuccessInPerformUpgrade => 5,
            Self::SetFailureInPerformUpgrade => 6,
            Self::DoNothing => 7,
        }
    }
}

/// Parsed package header, all fields in host order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageMetadata {
    pub magic: [u8; 8],
    pub header_version: u16,
    pub force_error_case: u16,
    pub crc: u32,
    pub linked: [u8; MAX_LINKED_SLOTS],
    pub version: String,
}

impl PackageMetadata {
    pub fn new(slot: SlotId, version: &str) -> Self {
        Self {
            magic: *slot.magic(),
            header_version: PACKAGE_HEADER_VERSION,
            force_error_case: ForceErrorCase::None.code(),
            crc: 0,
            linked: [LINKED_UNUSED; MAX_LINKED_SLOTS],
            version: version.to_string(),
        }
    }

    /// Slot addressed by the magic, if any
    pub fn slot(&self) -> Option<SlotId> {
        SlotId::from_magic(&self.magic)
    }

    /// Size of the header on the wire
    pub fn encoded_len(&self) -> usize {
        METADATA_FIXED_SIZE + self.version.len()
    }

    pub fn force_error(&self) -> ForceErrorCase {
        ForceErrorCase::from_code(self.force_error_case).unwrap_or_else(|| {
            warn!(
                "Ignoring unknown force-error case {} in {} package",
                self.force_error_case,
                String::from_utf8_lossy(&self.magic)
            );
            ForceErrorCase::None
        })
    }

    /// Linked slots in declaration order.
    ///
    /// Stops at the first unused entry; out-of-range indices, self links and
    /// repeats are dropped.
    pub fn linked_slots(&self) -> Vec<SlotId> {
        let own = self.slot();
        let mut slots = Vec::with_capacity(SLOT_COUNT);

        for &raw in self.linked.iter().take_while(|&&raw| raw != LINKED_UNUSED) {
            let Some(slot) = SlotId::from_index(usize::from(raw)) else {
                warn!("Skipping out-of-range linked slot index {raw}");
                continue;
            };
            if Some(slot) == own {
                debug!("Skipping self link of {slot}");
                continue;
            }
            if !slots.contains(&slot) {
                slots.push(slot);
            }
        }

        slots
    }

    /// Major version by convention: the leading digit of the version string
    pub fn major_version(&self) -> Option<u32> {
        major_version(&self.version)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(header_error)?;
        let header_version = reader.read_u16::<BigEndian>().map_err(header_error)?;
        let force_error_case = reader.read_u16::<BigEndian>().map_err(header_error)?;
        let crc = reader.read_u32::<BigEndian>().map_err(header_error)?;
        let mut linked = [0u8; MAX_LINKED_SLOTS];
        reader.read_exact(&mut linked).map_err(header_error)?;

        let version_len = usize::from(reader.read_u8().map_err(header_error)?);
        if version_len == 0 || version_len > MAX_VERSION_LEN {
            return Err(FotaError::UnsupportedPackageType(format!(
                "version string length {version_len} outside 1..={MAX_VERSION_LEN}"
            )));
        }
        let mut raw_version = vec![0u8; version_len];
        reader.read_exact(&mut raw_version).map_err(header_error)?;
        let version = String::from_utf8(raw_version).map_err(|_| {
            FotaError::UnsupportedPackageType("version string is not UTF-8".to_string())
        })?;

        Ok(Self {
            magic,
            header_version,
            force_error_case,
            crc,
            linked,
            version,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let version_len = u8::try_from(self.version.len())
            .ok()
            .filter(|&len| len > 0 && usize::from(len) <= MAX_VERSION_LEN)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("version string length {} not encodable", self.version.len()),
                )
            })?;

        writer.write_all(&self.magic)?;
        writer.write_u16::<BigEndian>(self.header_version)?;
        writer.write_u16::<BigEndian>(self.force_error_case)?;
        writer.write_u32::<BigEndian>(self.crc)?;
        writer.write_all(&self.linked)?;
        writer.write_u8(version_len)?;
        writer.write_all(self.version.as_bytes())
    }
}

pub fn major_version(version: &str) -> Option<u32> {
    version.chars().next().and_then(|c| c.to_digit(10))
}

fn header_error(e: io::Error) -> FotaError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FotaError::UnsupportedPackageType("truncated package header".to_string())
    } else {
        FotaError::Io(e)
    }
}

/// Reads the multi-package envelope if present.
///
/// Returns the declared package lengths, or `None` after rewinding the
/// reader to where it started when the stream is a single legacy package.
pub fn read_envelope<R: Read + Seek>(reader: &mut R) -> Result<Option<Vec<u32>>> {
    let start = reader.stream_position()?;
    let mut peek = [0u8; ENVELOPE_PEEK_SIZE];

    let is_multi = match reader.read_exact(&mut peek) {
        Ok(()) => {
            &peek[..8] == MULTI_PACKAGE_MAGIC
                && u16::from_be_bytes([peek[8], peek[9]]) == MULTI_PACKAGE_HEADER_VERSION
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e.into()),
    };

    if !is_multi {
        reader.seek(SeekFrom::Start(start))?;
        return Ok(None);
    }

    let count = usize::from(reader.read_u16::<BigEndian>().map_err(header_error)?);
    if count == 0 || count > SLOT_COUNT {
        return Err(FotaError::UnsupportedPackageType(format!(
            "multi-package count {count} outside 1..={SLOT_COUNT}"
        )));
    }

    let mut lengths = Vec::with_capacity(count);
    for index in 0..count {
        let length = reader.read_u32::<BigEndian>().map_err(header_error)?;
        if length == 0 {
            return Err(FotaError::UnsupportedPackageType(format!(
                "package {index} declares zero length"
            )));
        }
        lengths.push(length);
    }

    Ok(Some(lengths))
}

/// One package split out of a stream, body held in a temp file
#[derive(Debug)]
pub struct UnpackedPackage {
    pub slot: SlotId,
    pub metadata: PackageMetadata,
    pub image: NamedTempFile,
}

/// Splits a stream into per-slot images.
///
/// `total_len == 0` reads a legacy package until end of stream. Every temp
/// file lives in `temp_dir` so that committing is a rename; on error all of
/// them are dropped, which removes them.
pub fn unpack<R: Read + Seek>(
    reader: &mut R,
    total_len: u64,
    temp_dir: &Path,
) -> Result<Vec<UnpackedPackage>> {
    let envelope = read_envelope(reader)?;
    let multi = envelope.is_some();
    let declared: Vec<Option<u64>> = match envelope {
        Some(lengths) => lengths.into_iter().map(|len| Some(u64::from(len))).collect(),
        None => vec![(total_len > 0).then_some(total_len)],
    };

    let mut packages: Vec<UnpackedPackage> = Vec::with_capacity(declared.len());

    for (index, declared_len) in declared.into_iter().enumerate() {
        let metadata = PackageMetadata::read_from(reader)?;

        if metadata.header_version != PACKAGE_HEADER_VERSION {
            return Err(FotaError::UnsupportedPackageType(format!(
                "package {index} has header version {}, expected {PACKAGE_HEADER_VERSION}",
                metadata.header_version
            )));
        }

        let slot = metadata.slot().ok_or_else(|| {
            FotaError::UnsupportedPackageType(format!(
                "package {index} has unknown magic {:?}",
                String::from_utf8_lossy(&metadata.magic)
            ))
        })?;

        if packages.iter().any(|p| p.slot == slot) {
            return Err(FotaError::UnsupportedPackageType(format!(
                "stream carries more than one package for {slot}"
            )));
        }

        let body_len = match declared_len {
            Some(len) => Some(len.checked_sub(metadata.encoded_len() as u64).ok_or_else(|| {
                FotaError::UnsupportedPackageType(format!(
                    "package {index} length {len} shorter than its header"
                ))
            })?),
            None => None,
        };

        let mut image = tempfile::Builder::new()
            .prefix(".fota-")
            .suffix(".part")
            .tempfile_in(temp_dir)
            .map_err(FotaError::NotEnoughSpace)?;

        let copied = copy_body(reader, image.as_file_mut(), body_len)?;
        if let Some(expected) = body_len
            && copied != expected
        {
            return Err(FotaError::UnsupportedPackageType(format!(
                "package {index} for {slot} truncated: {copied} of {expected} bytes"
            )));
        }

        debug!(
            "Unpacked {slot} package v{} ({copied} bytes, multi={multi})",
            metadata.version
        );
        packages.push(UnpackedPackage {
            slot,
            metadata,
            image,
        });
    }

    if multi {
        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? > 0 {
            warn!("Ignoring trailing bytes after the last declared package");
        }
    }

    Ok(packages)
}

/// Copies up to `limit` bytes (or until EOF); write failures mean no space
fn copy_body<R: Read, W: Write>(reader: &mut R, writer: &mut W, limit: Option<u64>) -> Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut copied: u64 = 0;

    loop {
        let want = match limit {
            Some(limit) if copied >= limit => break,
            Some(limit) => usize::try_from(limit - copied).map_or(buf.len(), |left| left.min(buf.len())),
            None => buf.len(),
        };

        let read = match reader.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        writer
            .write_all(&buf[..read])
            .map_err(FotaError::NotEnoughSpace)?;
        copied += read as u64;
    }

    writer.flush().map_err(FotaError::NotEnoughSpace)?;
    Ok(copied)
}

/// Renames an unpacked image into place and restricts it to the owner
pub fn commit_image(image: NamedTempFile, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    image.persist(target).map_err(|e| FotaError::Io(e.error))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(IMAGE_MODE))?;
    }

    Ok(())
}

/// Stores the header next to a pending image so it survives a restart
pub fn write_sidecar(image: &Path, metadata: &PackageMetadata) -> Result<()> {
    let path = SlotPaths::sidecar_for(image);
    let temp_path = path.with_extension("tmp");
    let mut encoded = Vec::with_capacity(metadata.encoded_len());
    metadata.write_to(&mut encoded)?;

    fs::write(&temp_path, &encoded)?;
    fs::rename(&temp_path, &path)?;
    Ok(())
}

pub fn read_sidecar(image: &Path) -> Result<PackageMetadata> {
    let bytes = fs::read(SlotPaths::sidecar_for(image))?;
    PackageMetadata::read_from(&mut bytes.as_slice())
}

/// Removes a pending image and its sidecar, ignoring files already gone
pub fn remove_image(image: &Path) {
    for path in [image.to_path_buf(), SlotPaths::sidecar_for(image)] {
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {e}", path.display()),
        }
    }
}

/// Builds a single package in wire format
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    slot: SlotId,
    version: String,
    linked: Vec<SlotId>,
    force_error: ForceErrorCase,
    header_version: u16,
    crc: Option<u32>,
}

impl PackageBuilder {
    pub fn new(slot: SlotId, version: impl Into<String>) -> Self {
        Self {
            slot,
            version: version.into(),
            linked: Vec::new(),
            force_error: ForceErrorCase::None,
            header_version: PACKAGE_HEADER_VERSION,
            crc: None,
        }
    }

    pub fn link(mut self, slot: SlotId) -> Self {
        self.linked.push(slot);
        self
    }

    pub fn force_error(mut self, case: ForceErrorCase) -> Self {
        self.force_error = case;
        self
    }

    pub fn header_version(mut self, header_version: u16) -> Self {
        self.header_version = header_version;
        self
    }

    /// Overrides the computed CRC
    pub fn crc(mut self, crc: u32) -> Self {
        self.crc = Some(crc);
        self
    }

    pub fn metadata(&self, body: &[u8]) -> Result<PackageMetadata> {
        if self.linked.len() > MAX_LINKED_SLOTS {
            return Err(FotaError::UnsupportedPackageType(format!(
                "at most {MAX_LINKED_SLOTS} linked slots, got {}",
                self.linked.len()
            )));
        }

        let mut linked = [LINKED_UNUSED; MAX_LINKED_SLOTS];
        for (entry, slot) in linked.iter_mut().zip(&self.linked) {
            // SLOT_COUNT is far below LINKED_UNUSED
            *entry = slot.index() as u8;
        }

        Ok(PackageMetadata {
            magic: *self.slot.magic(),
            header_version: self.header_version,
            force_error_case: self.force_error.code(),
            crc: self.crc.unwrap_or_else(|| crc32fast::hash(body)),
            linked,
            version: self.version.clone(),
        })
    }

    pub fn build(&self, body: &[u8]) -> Result<Vec<u8>> {
        let metadata = self.metadata(body)?;
        let mut out = Vec::with_capacity(metadata.encoded_len() + body.len());
        metadata
            .write_to(&mut out)
            .map_err(|e| FotaError::UnsupportedPackageType(e.to_string()))?;
        out.extend_from_slice(body);
        Ok(out)
    }
}

/// Wraps already encoded packages into a multi-package envelope
pub fn encode_multi_package(packages: &[Vec<u8>]) -> Result<Vec<u8>> {
    if packages.is_empty() || packages.len() > SLOT_COUNT {
        return Err(FotaError::UnsupportedPackageType(format!(
            "multi-package must hold 1..={SLOT_COUNT} packages, got {}",
            packages.len()
        )));
    }

    let mut out = Vec::new();
    out.extend_from_slice(MULTI_PACKAGE_MAGIC);
    out.write_u16::<BigEndian>(MULTI_PACKAGE_HEADER_VERSION)?;
    // Bounded by SLOT_COUNT above
    out.write_u16::<BigEndian>(packages.len() as u16)?;
    for package in packages {
        let len = u32::try_from(package.len()).map_err(|_| {
            FotaError::UnsupportedPackageType("package larger than 4 GiB".to_string())
        })?;
        out.write_u32::<BigEndian>(len)?;
    }
    for package in packages {
        out.extend_from_slice(package);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn read_image(package: &UnpackedPackage) -> Vec<u8> {
        fs::read(package.image.path()).unwrap()
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let bytes = PackageBuilder::new(SlotId::Application, "2.0")
            .link(SlotId::TrustedElement)
            .crc(0x0102_0304)
            .build(b"")
            .unwrap();

        assert_eq!(&bytes[..8], b"FOTA_APP");
        assert_eq!(&bytes[8..10], &[0x00, 0x03]);
        assert_eq!(&bytes[10..12], &[0x00, 0x00]);
        assert_eq!(&bytes[12..16], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(bytes[16], 1);
        assert!(bytes[17..24].iter().all(|&b| b == LINKED_UNUSED));
        assert_eq!(bytes[24], 3);
        assert_eq!(&bytes[25..], b"2.0");
    }

    #[test]
    fn test_unpack_legacy_package() {
        let dir = tempdir().unwrap();
        let body = b"application image body".to_vec();
        let stream = PackageBuilder::new(SlotId::Application, "2.0")
            .build(&body)
            .unwrap();

        let packages = unpack(&mut Cursor::new(stream), 0, dir.path()).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].slot, SlotId::Application);
        assert_eq!(packages[0].metadata.version, "2.0");
        assert_eq!(packages[0].metadata.crc, crc32fast::hash(&body));
        assert_eq!(read_image(&packages[0]), body);
    }

    #[test]
    fn test_unpack_legacy_with_total_length() {
        let dir = tempdir().unwrap();
        let stream = PackageBuilder::new(SlotId::Modem, "1.1")
            .build(b"modem")
            .unwrap();
        let total = stream.len() as u64;

        let packages = unpack(&mut Cursor::new(stream), total, dir.path()).unwrap();
        assert_eq!(read_image(&packages[0]), b"modem");
    }

    #[test]
    fn test_unpack_multi_package_keeps_boundaries() {
        let dir = tempdir().unwrap();
        let tee = PackageBuilder::new(SlotId::TrustedElement, "1.4")
            .build(&[0xAA; 5000])
            .unwrap();
        let app = PackageBuilder::new(SlotId::Application, "1.9")
            .link(SlotId::TrustedElement)
            .build(&[0x55; 17])
            .unwrap();
        let stream = encode_multi_package(&[tee, app]).unwrap();

        let packages = unpack(&mut Cursor::new(stream), 0, dir.path()).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].slot, SlotId::TrustedElement);
        assert_eq!(read_image(&packages[0]), vec![0xAA; 5000]);
        assert_eq!(packages[1].slot, SlotId::Application);
        assert_eq!(read_image(&packages[1]), vec![0x55; 17]);
        assert_eq!(packages[1].metadata.linked_slots(), vec![SlotId::TrustedElement]);
    }

    #[test]
    fn test_envelope_rejects_zero_count() {
        let mut stream = MULTI_PACKAGE_MAGIC.to_vec();
        stream.extend_from_slice(&MULTI_PACKAGE_HEADER_VERSION.to_be_bytes());
        stream.extend_from_slice(&0u16.to_be_bytes());

        let err = read_envelope(&mut Cursor::new(stream)).unwrap_err();
        assert!(matches!(err, FotaError::UnsupportedPackageType(_)));
    }

    #[test]
    fn test_envelope_rejects_count_above_slot_count() {
        let mut stream = MULTI_PACKAGE_MAGIC.to_vec();
        stream.extend_from_slice(&MULTI_PACKAGE_HEADER_VERSION.to_be_bytes());
        stream.extend_from_slice(&5u16.to_be_bytes());
        stream.extend_from_slice(&[0, 0, 0, 30].repeat(5));

        assert!(read_envelope(&mut Cursor::new(stream)).is_err());
    }

    #[test]
    fn test_envelope_rejects_zero_length() {
        let mut stream = MULTI_PACKAGE_MAGIC.to_vec();
        stream.extend_from_slice(&MULTI_PACKAGE_HEADER_VERSION.to_be_bytes());
        stream.extend_from_slice(&2u16.to_be_bytes());
        stream.extend_from_slice(&40u32.to_be_bytes());
        stream.extend_from_slice(&0u32.to_be_bytes());

        let err = read_envelope(&mut Cursor::new(stream)).unwrap_err();
        assert!(err.to_string().contains("package 1 declares zero length"));
    }

    #[test]
    fn test_envelope_wrong_version_rewinds() {
        let mut stream = MULTI_PACKAGE_MAGIC.to_vec();
        stream.extend_from_slice(&9u16.to_be_bytes());
        let mut cursor = Cursor::new(stream);

        assert_eq!(read_envelope(&mut cursor).unwrap(), None);
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_short_stream_is_legacy_then_rejected() {
        let dir = tempdir().unwrap();
        let err = unpack(&mut Cursor::new(b"FOTA".to_vec()), 0, dir.path()).unwrap_err();
        assert!(matches!(err, FotaError::UnsupportedPackageType(_)));
    }

    #[test]
    fn test_rejects_bad_header_version() {
        let dir = tempdir().unwrap();
        let stream = PackageBuilder::new(SlotId::Application, "2.0")
            .header_version(2)
            .build(b"body")
            .unwrap();

        let err = unpack(&mut Cursor::new(stream), 0, dir.path()).unwrap_err();
        assert!(matches!(err, FotaError::UnsupportedPackageType(_)));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_unknown_magic() {
        let dir = tempdir().unwrap();
        let mut stream = PackageBuilder::new(SlotId::Application, "2.0")
            .build(b"body")
            .unwrap();
        stream[..8].copy_from_slice(b"SOMEGPU!");

        let err = unpack(&mut Cursor::new(stream), 0, dir.path()).unwrap_err();
        assert!(err.to_string().contains("unknown magic"));
    }

    #[test]
    fn test_rejects_zero_length_version() {
        let mut header = PackageBuilder::new(SlotId::Modem, "1")
            .build(b"")
            .unwrap();
        header[24] = 0;
        header.truncate(25);

        let err = PackageMetadata::read_from(&mut header.as_slice()).unwrap_err();
        assert!(matches!(err, FotaError::UnsupportedPackageType(_)));
    }

    #[test]
    fn test_truncated_multi_package_cleans_up() {
        let dir = tempdir().unwrap();
        let tee = PackageBuilder::new(SlotId::TrustedElement, "1.0")
            .build(&[1; 64])
            .unwrap();
        let modem = PackageBuilder::new(SlotId::Modem, "1.0")
            .build(&[2; 64])
            .unwrap();
        let mut stream = encode_multi_package(&[tee, modem]).unwrap();
        stream.truncate(stream.len() - 10);

        let err = unpack(&mut Cursor::new(stream), 0, dir.path()).unwrap_err();
        assert!(err.to_string().contains("truncated"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_duplicate_slot_in_batch() {
        let dir = tempdir().unwrap();
        let first = PackageBuilder::new(SlotId::Modem, "1.0").build(b"a").unwrap();
        let second = PackageBuilder::new(SlotId::Modem, "1.1").build(b"b").unwrap();
        let stream = encode_multi_package(&[first, second]).unwrap();

        assert!(unpack(&mut Cursor::new(stream), 0, dir.path()).is_err());
    }

    #[test]
    fn test_linked_slots_sentinel_and_range() {
        let mut metadata = PackageMetadata::new(SlotId::Application, "1.0");
        metadata.linked = [2, 0, 9, 1, 2, LINKED_UNUSED, 3, 3];
        // 0 is a self link, 9 out of range, second 2 a repeat, 3 after the sentinel
        assert_eq!(
            metadata.linked_slots(),
            vec![SlotId::Bootloader, SlotId::TrustedElement]
        );
    }

    #[test]
    fn test_force_error_codes() {
        for code in 0..8 {
            assert_eq!(ForceErrorCase::from_code(code).unwrap().code(), code);
        }
        let mut metadata = PackageMetadata::new(SlotId::Modem, "1.0");
        metadata.force_error_case = 42;
        assert_eq!(metadata.force_error(), ForceErrorCase::None);
    }

    #[test]
    fn test_major_version() {
        assert_eq!(major_version("2.0"), Some(2));
        assert_eq!(major_version("9"), Some(9));
        assert_eq!(major_version("v1.0"), None);
        assert_eq!(major_version(""), None);
    }

    #[test]
    fn test_commit_and_sidecar() {
        let dir = tempdir().unwrap();
        let stream = PackageBuilder::new(SlotId::Bootloader, "5.2")
            .link(SlotId::Modem)
            .build(b"boot")
            .unwrap();
        let mut packages = unpack(&mut Cursor::new(stream), 0, dir.path()).unwrap();
        let package = packages.remove(0);
        let target = dir.path().join("staged").join("bootloader.img");

        commit_image(package.image, &target).unwrap();
        write_sidecar(&target, &package.metadata).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"boot");
        assert_eq!(read_sidecar(&target).unwrap(), package.metadata);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&target).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        remove_image(&target);
        assert!(!target.exists());
        assert!(!SlotPaths::sidecar_for(&target).exists());
    }

    #[test]
    fn test_encode_multi_package_bounds() {
        assert!(encode_multi_package(&[]).is_err());
        let packages = vec![vec![0u8; 30]; SLOT_COUNT + 1];
        assert!(encode_multi_package(&packages).is_err());
    }
}
