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

//! One-shot jobs owned by a slot record.
//!
//! A job is cancelled by dropping it from the record; the engine only runs
//! jobs still present when their deadline passes.

use crate::slot::UpdateResult;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    /// Re-execute into the staged application image
    Activate {
        image: PathBuf,
        delayed_result: Option<UpdateResult>,
    },
    /// Conclude an update whose result arrives late
    Conclude(UpdateResult),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedJob {
    pub due: Instant,
    pub action: JobAction,
}

impl DelayedJob {
    pub fn after(delay: Duration, action: JobAction) -> Self {
        Self {
            due: Instant::now() + delay,
            action,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.due <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_due() {
        let job = DelayedJob::after(
            Duration::from_secs(3),
            JobAction::Conclude(UpdateResult::Success),
        );
        let now = Instant::now();
        assert!(!job.is_due(now));
        assert!(job.is_due(now + Duration::from_secs(4)));
    }
}
