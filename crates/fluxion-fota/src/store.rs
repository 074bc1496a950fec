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

//! State persistence for the slot table.
//!
//! Record layout (integers big-endian):
//!
//! ```text
//! results[SLOT_COUNT]:u8 | states[SLOT_COUNT]:u8 | severity:u8
//! last_state_change:i64 | update_deadline:i64 (0 = unset)
//! current_version: len:u32 + bytes          (application slot only)
//! pending_path[SLOT_COUNT]: len:u32 + bytes (len 0 = absent)
//! ```

use crate::error::{FotaError, Result};
use crate::slot::{SLOT_COUNT, Severity, SlotId, SlotState, UpdateResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Snapshot of everything that survives a restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    pub results: [UpdateResult; SLOT_COUNT],
    pub states: [SlotState; SLOT_COUNT],
    pub severity: Severity,
    pub last_state_change: DateTime<Utc>,
    pub update_deadline: Option<DateTime<Utc>>,
    /// Installed version of the application slot; other slots are not persisted
    pub current_version: Option<String>,
    pub pending_paths: [Option<PathBuf>; SLOT_COUNT],
}

impl Default for PersistedRecord {
    fn default() -> Self {
        Self {
            results: [UpdateResult::Initial; SLOT_COUNT],
            states: [SlotState::Idle; SLOT_COUNT],
            severity: Severity::default(),
            last_state_change: DateTime::<Utc>::default(),
            update_deadline: None,
            current_version: None,
            pending_paths: Default::default(),
        }
    }
}

impl PersistedRecord {
    /// Defaults used when a record exists but cannot be parsed.
    ///
    /// Older agents left a file the new image cannot read right after an
    /// application upgrade, so the application slot reports success.
    pub fn after_unreadable_file() -> Self {
        let mut record = Self::default();
        record.results[SlotId::Application.index()] = UpdateResult::Success;
        record
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        for result in self.results {
            out.write_u8(result as u8)?;
        }
        for state in self.states {
            out.write_u8(state as u8)?;
        }
        out.write_u8(self.severity as u8)?;
        out.write_i64::<BigEndian>(self.last_state_change.timestamp())?;
        out.write_i64::<BigEndian>(self.update_deadline.map_or(0, |t| t.timestamp()))?;
        write_bytes(&mut out, self.current_version.as_deref().unwrap_or("").as_bytes())?;
        for path in &self.pending_paths {
            write_bytes(&mut out, &path.as_deref().map(path_to_bytes).unwrap_or_default())?;
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut record = Self::default();

        for result in &mut record.results {
            let raw = cursor.read_u8().map_err(structural)?;
            *result = UpdateResult::from_u8(raw)
                .ok_or_else(|| FotaError::Persistence(format!("unknown result code {raw}")))?;
        }
        for state in &mut record.states {
            let raw = cursor.read_u8().map_err(structural)?;
            *state = SlotState::from_u8(raw)
                .ok_or_else(|| FotaError::Persistence(format!("unknown state code {raw}")))?;
        }
        let raw = cursor.read_u8().map_err(structural)?;
        record.severity = Severity::from_u8(raw)
            .ok_or_else(|| FotaError::Persistence(format!("unknown severity {raw}")))?;

        let changed = cursor.read_i64::<BigEndian>().map_err(structural)?;
        record.last_state_change = DateTime::from_timestamp(changed, 0)
            .ok_or_else(|| FotaError::Persistence(format!("timestamp {changed} out of range")))?;
        let deadline = cursor.read_i64::<BigEndian>().map_err(structural)?;
        record.update_deadline = match deadline {
            0 => None,
            secs => Some(DateTime::from_timestamp(secs, 0).ok_or_else(|| {
                FotaError::Persistence(format!("deadline {secs} out of range"))
            })?),
        };

        let version = read_bytes(&mut cursor)?;
        record.current_version = if version.is_empty() {
            None
        } else {
            Some(String::from_utf8(version).map_err(|_| {
                FotaError::Persistence("current version is not UTF-8".to_string())
            })?)
        };

        for path in &mut record.pending_paths {
            let raw = read_bytes(&mut cursor)?;
            *path = (!raw.is_empty()).then(|| bytes_to_path(raw)).transpose()?;
        }

        if cursor.position() != bytes.len() as u64 {
            return Err(FotaError::Persistence(format!(
                "{} trailing bytes after record",
                bytes.len() as u64 - cursor.position()
            )));
        }

        Ok(record)
    }
}

fn structural(e: io::Error) -> FotaError {
    FotaError::Persistence(format!("truncated record: {e}"))
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string too long"))?;
    out.write_u32::<BigEndian>(len)?;
    out.extend_from_slice(bytes);
    Ok(())
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<BigEndian>().map_err(structural)? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(FotaError::Persistence(format!(
            "string of {len} bytes exceeds the {remaining} left"
        )));
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).map_err(structural)?;
    Ok(buf)
}

#[cfg(unix)]
fn path_to_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_to_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn bytes_to_path(bytes: Vec<u8>) -> Result<PathBuf> {
    use std::os::unix::ffi::OsStringExt;
    Ok(PathBuf::from(std::ffi::OsString::from_vec(bytes)))
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: Vec<u8>) -> Result<PathBuf> {
    String::from_utf8(bytes)
        .map(PathBuf::from)
        .map_err(|_| FotaError::Persistence("pending path is not UTF-8".to_string()))
}

/// Where a loaded record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// No record on disk, never initialized
    Missing,
    Loaded,
    /// A record exists but could not be read
    Unreadable,
}

/// On-disk location of the persisted record
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loads the record; never fails, structural errors fall back to defaults
    pub fn load(&self) -> (PersistedRecord, LoadSource) {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(
                    "State record not found at {}, using defaults",
                    self.path.display()
                );
                return (PersistedRecord::default(), LoadSource::Missing);
            }
            Err(e) => {
                warn!(
                    "Cannot read state record {}: {e}; resetting to defaults",
                    self.path.display()
                );
                return (PersistedRecord::after_unreadable_file(), LoadSource::Unreadable);
            }
        };

        match PersistedRecord::decode(&bytes) {
            Ok(record) => {
                info!(
                    "Loaded state record: states={:?} results={:?}",
                    record.states, record.results
                );
                (record, LoadSource::Loaded)
            }
            Err(e) => {
                warn!(
                    "State record {} is corrupted ({e}); resetting to defaults",
                    self.path.display()
                );
                (PersistedRecord::after_unreadable_file(), LoadSource::Unreadable)
            }
        }
    }

    /// Atomic write (temp file + rename); a half-written temp file is removed
    pub fn save(&self, record: &PersistedRecord) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");

        if let Err(e) = write_atomically(&self.path, &temp_path, record) {
            error!("Failed to persist state to {}: {e}", self.path.display());
            if temp_path.exists()
                && let Err(cleanup) = fs::remove_file(&temp_path)
            {
                warn!("Failed to remove {}: {cleanup}", temp_path.display());
            }
            return Err(FotaError::Persistence(e.to_string()));
        }

        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Deleted state record {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FotaError::Persistence(format!(
                "cannot delete {}: {e}",
                self.path.display()
            ))),
        }
    }
}

fn write_atomically(path: &Path, temp_path: &Path, record: &PersistedRecord) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(temp_path, record.encode()?)?;
    fs::rename(temp_path, path)
}
