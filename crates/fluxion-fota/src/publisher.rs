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

//! Manager-facing view of slot state

use crate::slot::{SlotId, SlotState, UpdateResult};
use tracing::info;

/// Receives every state, result and cross-slot change the engine makes
pub trait StatePublisher {
    fn set_state_and_result(&mut self, slot: SlotId, state: SlotState, result: UpdateResult);

    fn set_linked(&mut self, slot: SlotId, linked: &[SlotId]);

    fn set_conflicting(&mut self, slot: SlotId, conflicting: &[SlotId]);
}

/// Publisher that only logs, used when no management client is attached
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

impl StatePublisher for LogPublisher {
    fn set_state_and_result(&mut self, slot: SlotId, state: SlotState, result: UpdateResult) {
        info!("[{slot}] state={state} result={result}");
    }

    fn set_linked(&mut self, slot: SlotId, linked: &[SlotId]) {
        info!("[{slot}] linked={linked:?}");
    }

    fn set_conflicting(&mut self, slot: SlotId, conflicting: &[SlotId]) {
        info!("[{slot}] conflicting={conflicting:?}");
    }
}
