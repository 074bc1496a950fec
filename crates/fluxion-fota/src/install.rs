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

//! Check and apply steps for primary and secondary slots

use crate::error::{FotaError, Result};
use crate::package::{ForceErrorCase, PackageMetadata, remove_image};
use crate::slot::{SlotRecord, UpdateResult};
use crate::validation;
use std::fs;
use tracing::info;

/// Verifies a staged image right before it is applied
pub type CheckFn = fn(&SlotRecord) -> Result<()>;

/// Decides how a checked image is applied; touches nothing on disk
pub type ApplyFn = fn(&SlotRecord) -> Result<ApplyOutcome>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Conclude with success right away (secondary images are installed then)
    Completed,
    /// Re-execute into the staged image once the activation delay passes
    Activate { delayed_result: Option<UpdateResult> },
    /// Result is concluded later by a delayed job
    Delayed(UpdateResult),
    /// Slot stays in updating until reset
    Parked,
}

fn staged_metadata(record: &SlotRecord) -> Result<&PackageMetadata> {
    record.metadata.as_ref().ok_or_else(|| FotaError::UpdateFailed {
        slot: record.id,
        reason: "no package metadata".to_string(),
    })
}

fn forced_failure(record: &SlotRecord) -> FotaError {
    FotaError::UpdateFailed {
        slot: record.id,
        reason: "failure forced by package".to_string(),
    }
}

pub fn check_primary(record: &SlotRecord) -> Result<()> {
    validation::validate(record)?;

    #[cfg(unix)]
    if let Some(image) = record.pending_image_path.as_deref() {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(image)?.permissions().mode();
        if mode & 0o100 == 0 {
            return Err(FotaError::UpdateFailed {
                slot: record.id,
                reason: format!("{} is not executable", image.display()),
            });
        }
    }

    Ok(())
}

pub fn check_secondary(record: &SlotRecord) -> Result<()> {
    validation::validate(record)
}

pub fn apply_primary(record: &SlotRecord) -> Result<ApplyOutcome> {
    match staged_metadata(record)?.force_error() {
        ForceErrorCase::FailedUpdate | ForceErrorCase::SetFailureInPerformUpgrade => {
            Err(forced_failure(record))
        }
        ForceErrorCase::SetSuccessInPerformUpgrade => Ok(ApplyOutcome::Completed),
        ForceErrorCase::DelayedSuccess => Ok(ApplyOutcome::Activate {
            delayed_result: Some(UpdateResult::Success),
        }),
        ForceErrorCase::DelayedFailedUpdate => Ok(ApplyOutcome::Activate {
            delayed_result: Some(UpdateResult::Failed),
        }),
        ForceErrorCase::DoNothing => Ok(ApplyOutcome::Parked),
        ForceErrorCase::None | ForceErrorCase::OutOfMemory => {
            Ok(ApplyOutcome::Activate {
                delayed_result: None,
            })
        }
    }
}

pub fn apply_secondary(record: &SlotRecord) -> Result<ApplyOutcome> {
    match staged_metadata(record)?.force_error() {
        ForceErrorCase::FailedUpdate | ForceErrorCase::SetFailureInPerformUpgrade => {
            Err(forced_failure(record))
        }
        ForceErrorCase::DelayedSuccess => Ok(ApplyOutcome::Delayed(UpdateResult::Success)),
        ForceErrorCase::DelayedFailedUpdate => Ok(ApplyOutcome::Delayed(UpdateResult::Failed)),
        ForceErrorCase::DoNothing => Ok(ApplyOutcome::Parked),
        ForceErrorCase::SetSuccessInPerformUpgrade
        | ForceErrorCase::None
        | ForceErrorCase::OutOfMemory => Ok(ApplyOutcome::Completed),
    }
}

/// Moves a staged secondary image to its installed location
pub fn install_secondary(record: &mut SlotRecord) -> Result<()> {
    let Some(image) = record
        .pending_image_path
        .clone()
        .filter(|image| image.exists())
    else {
        return Err(FotaError::UpdateFailed {
            slot: record.id,
            reason: "staged image is gone".to_string(),
        });
    };

    let installed = record.paths.installed.clone();
    if let Some(parent) = installed.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&image, &installed)?;
    remove_image(&image);

    info!(
        "Installed {} image {} at {}",
        record.id,
        record.pending_version(),
        installed.display()
    );
    Ok(())
}
