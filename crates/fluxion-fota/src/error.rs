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

//! Error types for the FOTA engine

use crate::slot::{SlotId, SlotState, UpdateResult};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FotaError {
    #[error("unsupported package type: {0}")]
    UnsupportedPackageType(String),

    #[error("integrity check failed: {0}")]
    IntegrityFailure(String),

    #[error("out of memory while handling {slot} image")]
    OutOfMemory { slot: SlotId },

    #[error("not enough space: {0}")]
    NotEnoughSpace(#[source] std::io::Error),

    #[error("slot {slot} already holds a staged image ({state})")]
    ConflictingState { slot: SlotId, state: SlotState },

    #[error("upgrade of {slot} blocked by {blocking:?}")]
    DependencyError { slot: SlotId, blocking: Vec<SlotId> },

    #[error("slot {slot} is {state}, operation not allowed")]
    InvalidState { slot: SlotId, state: SlotState },

    #[error("update of {slot} failed: {reason}")]
    UpdateFailed { slot: SlotId, reason: String },

    #[error("activation failed: {0}")]
    Activation(String),

    #[error("state persistence error: {0}")]
    Persistence(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FotaError {
    /// Result code reported to the remote manager for this error.
    pub fn result(&self) -> UpdateResult {
        match self {
            Self::UnsupportedPackageType(_) => UpdateResult::UnsupportedPackageType,
            Self::IntegrityFailure(_) => UpdateResult::IntegrityFailure,
            Self::OutOfMemory { .. } => UpdateResult::OutOfMemory,
            Self::NotEnoughSpace(_) => UpdateResult::NotEnoughSpace,
            Self::ConflictingState { .. } => UpdateResult::ConflictingState,
            Self::DependencyError { .. } => UpdateResult::DependencyError,
            Self::InvalidState { .. }
            | Self::UpdateFailed { .. }
            | Self::Activation(_)
            | Self::Persistence(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::Io(_) => UpdateResult::Failed,
        }
    }
}

pub type Result<T> = std::result::Result<T, FotaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_mapping() {
        assert_eq!(
            FotaError::IntegrityFailure("crc".to_string()).result(),
            UpdateResult::IntegrityFailure
        );
        assert_eq!(
            FotaError::ConflictingState {
                slot: SlotId::Modem,
                state: SlotState::Downloaded,
            }
            .result(),
            UpdateResult::ConflictingState
        );
        assert_eq!(
            FotaError::DependencyError {
                slot: SlotId::Application,
                blocking: vec![SlotId::TrustedElement],
            }
            .result(),
            UpdateResult::DependencyError
        );
        assert_eq!(
            FotaError::Io(std::io::Error::other("boom")).result(),
            UpdateResult::Failed
        );
    }

    #[test]
    fn test_display_names_slot() {
        let err = FotaError::OutOfMemory {
            slot: SlotId::Bootloader,
        };
        assert_eq!(err.to_string(), "out of memory while handling bootloader image");
    }
}
