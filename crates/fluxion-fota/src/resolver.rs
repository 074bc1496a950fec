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

//! Cross-slot dependency and conflict resolution.
//!
//! A slot's linked set comes from its package metadata. A linked slot that is
//! not itself downloaded blocks the upgrade and lands in the conflicting set.
//! An application package whose major version is above the installed trusted
//! element's major version is blocked by the trusted element as well.

use crate::package::major_version;
use crate::slot::{SlotId, SlotState, SlotTable};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub linked: Vec<SlotId>,
    pub conflicting: Vec<SlotId>,
}

/// Linked and conflicting sets for one slot, insertion ordered, no repeats
pub fn resolve(table: &SlotTable, slot: SlotId) -> Resolution {
    let record = table.get(slot);
    let Some(metadata) = record.metadata.as_ref() else {
        return Resolution::default();
    };

    let linked = metadata.linked_slots();
    let mut conflicting: Vec<SlotId> = linked
        .iter()
        .copied()
        .filter(|&other| table.state(other) != SlotState::Downloaded)
        .collect();

    if slot == SlotId::Application
        && !conflicting.contains(&SlotId::TrustedElement)
        && requires_newer_trusted_element(table, metadata.major_version())
    {
        conflicting.push(SlotId::TrustedElement);
    }

    debug!("Resolved {slot}: linked={linked:?} conflicting={conflicting:?}");
    Resolution {
        linked,
        conflicting,
    }
}

fn requires_newer_trusted_element(table: &SlotTable, app_major: Option<u32>) -> bool {
    let installed = &table.get(SlotId::TrustedElement).current_version;
    match (app_major, major_version(installed)) {
        (Some(app), Some(tee)) => app > tee,
        (None, _) => {
            warn!("Application package version has no leading major digit");
            false
        }
        (_, None) => {
            warn!("Installed trusted element version {installed:?} has no leading major digit");
            false
        }
    }
}

/// Resolutions for every slot currently in `Downloaded`
pub fn resolve_downloaded(table: &SlotTable) -> Vec<(SlotId, Resolution)> {
    table
        .in_state(SlotState::Downloaded)
        .into_iter()
        .map(|slot| (slot, resolve(table, slot)))
        .collect()
}
