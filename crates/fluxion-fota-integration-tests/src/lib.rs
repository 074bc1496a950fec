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

//! Fixtures shared by the FOTA scenario tests

use fluxion_fota::{
    ActivationRequest, Activator, Engine, FotaConfig, SlotConfig, SlotId, SlotState,
    StartupOptions, StatePublisher, UpdateResult,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Everything the engine told the manager-facing layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Published {
    State(SlotId, SlotState, UpdateResult),
    Linked(SlotId, Vec<SlotId>),
    Conflicting(SlotId, Vec<SlotId>),
}

#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<Published>>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<Published> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Last conflicting set published for `slot`
    pub fn last_conflicting(&self, slot: SlotId) -> Option<Vec<SlotId>> {
        self.events.lock().iter().rev().find_map(|event| match event {
            Published::Conflicting(s, set) if *s == slot => Some(set.clone()),
            _ => None,
        })
    }
}

impl StatePublisher for RecordingPublisher {
    fn set_state_and_result(&mut self, slot: SlotId, state: SlotState, result: UpdateResult) {
        self.events
            .lock()
            .push(Published::State(slot, state, result));
    }

    fn set_linked(&mut self, slot: SlotId, linked: &[SlotId]) {
        self.events
            .lock()
            .push(Published::Linked(slot, linked.to_vec()));
    }

    fn set_conflicting(&mut self, slot: SlotId, conflicting: &[SlotId]) {
        self.events
            .lock()
            .push(Published::Conflicting(slot, conflicting.to_vec()));
    }
}

/// Records activation requests instead of re-executing the test binary
#[derive(Debug, Clone, Default)]
pub struct RecordingActivator {
    requests: Arc<Mutex<Vec<ActivationRequest>>>,
}

impl RecordingActivator {
    pub fn requests(&self) -> Vec<ActivationRequest> {
        self.requests.lock().clone()
    }
}

impl Activator for RecordingActivator {
    fn activate(&mut self, request: &ActivationRequest) -> fluxion_fota::Result<()> {
        self.requests.lock().push(request.clone());
        Ok(())
    }
}

/// A data directory plus the recorders attached to every engine built on it
#[derive(Debug)]
pub struct Harness {
    pub dir: TempDir,
    pub config: FotaConfig,
    pub publisher: RecordingPublisher,
    pub activator: RecordingActivator,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = FotaConfig::with_data_dir(dir.path());
        Self {
            dir,
            config,
            publisher: RecordingPublisher::default(),
            activator: RecordingActivator::default(),
        }
    }

    /// Sets the version the trusted element is installed at
    pub fn with_trusted_element_version(mut self, version: &str) -> Self {
        self.config.slots.push(SlotConfig {
            slot: SlotId::TrustedElement,
            current_version: Some(version.to_owned()),
            forced_image_path: None,
        });
        self
    }

    /// Starts (or restarts) an engine on this data directory
    pub fn engine(&self) -> Engine {
        self.engine_with(StartupOptions::default())
    }

    pub fn engine_with(&self, startup: StartupOptions) -> Engine {
        Engine::new(
            self.config.clone(),
            Box::new(self.activator.clone()),
            Box::new(self.publisher.clone()),
            startup,
        )
        .expect("Failed to start engine")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Streams `bytes` into `slot` in small chunks and finishes the download
pub fn download(
    engine: &mut Engine,
    slot: SlotId,
    bytes: &[u8],
) -> fluxion_fota::Result<Vec<SlotId>> {
    engine.open(slot)?;
    for chunk in bytes.chunks(512) {
        engine.write(slot, chunk)?;
    }
    engine.finish(slot)
}

/// A point past every delay the default config schedules
pub fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}
