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

//! Slot table: one record per independently updatable component.
//!
//! The slot set is fixed at compile time. `SLOT_COUNT` sizes both the
//! per-package length table of the multi-package envelope and the table here.

use crate::config::{FotaConfig, SlotConfig};
use crate::error::FotaError;
use crate::install::{self, ApplyFn, CheckFn};
use crate::jobs::DelayedJob;
use crate::package::PackageMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const SLOT_COUNT: usize = 4;

/// Physical component addressed by a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotId {
    /// Main application image (the running agent itself)
    Application,
    /// Secure / trusted element firmware
    TrustedElement,
    Bootloader,
    Modem,
}

impl SlotId {
    pub const ALL: [SlotId; SLOT_COUNT] = [
        Self::Application,
        Self::TrustedElement,
        Self::Bootloader,
        Self::Modem,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Application => 0,
            Self::TrustedElement => 1,
            Self::Bootloader => 2,
            Self::Modem => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// 8-byte package magic identifying this slot on the wire
    pub fn magic(self) -> &'static [u8; 8] {
        match self {
            Self::Application => b"FOTA_APP",
            Self::TrustedElement => b"FOTA_TEE",
            Self::Bootloader => b"FOTABOOT",
            Self::Modem => b"FOTAMODM",
        }
    }

    pub fn from_magic(magic: &[u8; 8]) -> Option<Self> {
        Self::ALL.into_iter().find(|slot| slot.magic() == magic)
    }

    /// Config / CLI name (kebab-case)
    pub fn name(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::TrustedElement => "trusted-element",
            Self::Bootloader => "bootloader",
            Self::Modem => "modem",
        }
    }

    pub fn is_primary(self) -> bool {
        matches!(self, Self::Application)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SlotId {
    type Err = FotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|slot| slot.name() == lowered)
            .ok_or_else(|| {
                FotaError::Config(format!(
                    "Unknown slot: '{}'. Supported slots: {}",
                    s,
                    Self::ALL
                        .iter()
                        .map(|slot| slot.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

/// Per-slot lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SlotState {
    #[default]
    Idle = 0,
    Downloading = 1,
    Downloaded = 2,
    Updating = 3,
}

impl SlotState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Downloading),
            2 => Some(Self::Downloaded),
            3 => Some(Self::Updating),
            _ => None,
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Updating => "updating",
        };
        f.write_str(name)
    }
}

/// Outcome of the last terminal transition, as observed by the remote manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum UpdateResult {
    #[default]
    Initial = 0,
    Success = 1,
    NotEnoughSpace = 2,
    OutOfMemory = 3,
    ConnectionLost = 4,
    IntegrityFailure = 5,
    UnsupportedPackageType = 6,
    InvalidUri = 7,
    Failed = 8,
    UnsupportedProtocol = 9,
    UpdateCancelled = 10,
    Deferred = 11,
    ConflictingState = 12,
    DependencyError = 13,
}

impl UpdateResult {
    pub fn from_u8(value: u8) -> Option<Self> {
        let result = match value {
            0 => Self::Initial,
            1 => Self::Success,
            2 => Self::NotEnoughSpace,
            3 => Self::OutOfMemory,
            4 => Self::ConnectionLost,
            5 => Self::IntegrityFailure,
            6 => Self::UnsupportedPackageType,
            7 => Self::InvalidUri,
            8 => Self::Failed,
            9 => Self::UnsupportedProtocol,
            10 => Self::UpdateCancelled,
            11 => Self::Deferred,
            12 => Self::ConflictingState,
            13 => Self::DependencyError,
            _ => return None,
        };
        Some(result)
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for UpdateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", *self as u8)
    }
}

/// Manager-visible urgency of a pending update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Severity {
    Critical = 0,
    #[default]
    Major = 1,
    Minor = 2,
}

impl Severity {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Critical),
            1 => Some(Self::Major),
            2 => Some(Self::Minor),
            _ => None,
        }
    }
}

/// Behaviour used to verify and apply a staged image.
///
/// Selected once per slot when the table is built.
#[derive(Debug, Clone, Copy)]
pub enum SlotKind {
    /// Application image, activated by re-executing the process
    Primary { check: CheckFn, apply: ApplyFn },
    /// Add-on image installed next to the running application
    Secondary { check: CheckFn, apply: ApplyFn },
}

impl SlotKind {
    pub fn for_slot(slot: SlotId) -> Self {
        if slot.is_primary() {
            Self::Primary {
                check: install::check_primary,
                apply: install::apply_primary,
            }
        } else {
            Self::Secondary {
                check: install::check_secondary,
                apply: install::apply_secondary,
            }
        }
    }

    pub fn check(&self) -> CheckFn {
        match self {
            Self::Primary { check, .. } | Self::Secondary { check, .. } => *check,
        }
    }

    pub fn apply(&self) -> ApplyFn {
        match self {
            Self::Primary { apply, .. } | Self::Secondary { apply, .. } => *apply,
        }
    }
}

/// File locations owned by one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPaths {
    /// Raw stream as received through open/write
    pub download: PathBuf,
    /// Unpacked image waiting for perform-upgrade
    pub image: PathBuf,
    /// Where an applied secondary image ends up
    pub installed: PathBuf,
}

impl SlotPaths {
    pub fn new(data_dir: &Path, slot: SlotId, forced_image_path: Option<&Path>) -> Self {
        Self {
            download: data_dir.join(format!("{}.download", slot.name())),
            image: forced_image_path
                .map(Path::to_path_buf)
                .unwrap_or_else(|| data_dir.join(format!("{}.img", slot.name()))),
            installed: data_dir.join("installed").join(format!("{}.bin", slot.name())),
        }
    }

    /// Metadata sidecar stored next to a pending image
    pub fn sidecar_for(image: &Path) -> PathBuf {
        let mut name = image.as_os_str().to_owned();
        name.push(".meta");
        PathBuf::from(name)
    }
}

#[derive(Debug)]
pub struct SlotRecord {
    pub id: SlotId,
    pub kind: SlotKind,
    pub state: SlotState,
    pub result: UpdateResult,
    /// Staged file: the raw download while downloading, the unpacked image afterwards
    pub pending_image_path: Option<PathBuf>,
    /// Last successfully parsed package header for this slot
    pub metadata: Option<PackageMetadata>,
    pub current_version: String,
    /// Administrative override of the image location (test tooling)
    pub forced_image_path: Option<PathBuf>,
    pub paths: SlotPaths,
    pub linked: Vec<SlotId>,
    pub conflicting: Vec<SlotId>,
    pub(crate) stream: Option<File>,
    pub(crate) job: Option<DelayedJob>,
}

impl SlotRecord {
    pub fn new(id: SlotId, data_dir: &Path, overrides: Option<&SlotConfig>) -> Self {
        let forced_image_path = overrides.and_then(|o| o.forced_image_path.clone());
        let current_version = overrides
            .and_then(|o| o.current_version.clone())
            .unwrap_or_else(|| crate::config::DEFAULT_VERSION.to_string());

        Self {
            id,
            kind: SlotKind::for_slot(id),
            state: SlotState::Idle,
            result: UpdateResult::Initial,
            pending_image_path: None,
            metadata: None,
            current_version,
            paths: SlotPaths::new(data_dir, id, forced_image_path.as_deref()),
            forced_image_path,
            linked: Vec::new(),
            conflicting: Vec::new(),
            stream: None,
            job: None,
        }
    }

    /// Version of the staged package, empty when nothing is staged
    pub fn pending_version(&self) -> &str {
        match (self.state, &self.metadata) {
            (SlotState::Downloaded | SlotState::Updating, Some(metadata)) => &metadata.version,
            _ => "",
        }
    }

    pub fn has_scheduled_job(&self) -> bool {
        self.job.is_some()
    }

    /// True when nothing about this slot needs to survive a restart
    pub fn is_pristine(&self) -> bool {
        self.state == SlotState::Idle
            && self.result == UpdateResult::Initial
            && self.pending_image_path.is_none()
    }
}

/// Fixed-size table of slot records, indexed by `SlotId`
#[derive(Debug)]
pub struct SlotTable {
    records: [SlotRecord; SLOT_COUNT],
}

impl SlotTable {
    pub fn new(config: &FotaConfig) -> Self {
        Self {
            records: SlotId::ALL
                .map(|id| SlotRecord::new(id, &config.data_dir, config.slot_overrides(id))),
        }
    }

    pub fn get(&self, slot: SlotId) -> &SlotRecord {
        &self.records[slot.index()]
    }

    pub fn get_mut(&mut self, slot: SlotId) -> &mut SlotRecord {
        &mut self.records[slot.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlotRecord> {
        self.records.iter()
    }

    pub fn in_state(&self, state: SlotState) -> Vec<SlotId> {
        self.records
            .iter()
            .filter(|record| record.state == state)
            .map(|record| record.id)
            .collect()
    }

    pub fn state(&self, slot: SlotId) -> SlotState {
        self.get(slot).state
    }
}
