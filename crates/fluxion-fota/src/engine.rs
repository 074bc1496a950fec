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

//! Update sequencer.
//!
//! Drives the per-slot state machine (idle, downloading, downloaded,
//! updating) and multi-slot upgrades. Every state-affecting operation ends
//! with a snapshot written through the [`StateStore`]; a failed write is
//! logged and the in-memory state stays authoritative.
//!
//! The engine is single-owner and synchronous. Delayed work (activation of a
//! new application image, late results) is kept as a one-shot job on the
//! slot record and run by whoever drives [`Engine::run_due_jobs`].

use crate::activation::{ActivationRequest, Activator};
use crate::config::FotaConfig;
use crate::error::{FotaError, Result};
use crate::install::{self, ApplyOutcome};
use crate::jobs::{DelayedJob, JobAction};
use crate::package::{self, PackageMetadata, read_sidecar, remove_image, write_sidecar};
use crate::publisher::StatePublisher;
use crate::resolver;
use crate::slot::{Severity, SlotId, SlotRecord, SlotState, SlotTable, UpdateResult};
use crate::store::{LoadSource, PersistedRecord, StateStore};
use crate::validation;
use chrono::{DateTime, SubsecRound, Utc};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Options the agent was started with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupOptions {
    /// Result handed over by the image that activated this process
    pub delayed_result: Option<UpdateResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Every target concluded before returning
    Completed,
    /// At least one target waits for activation, a late result or a reset
    Pending,
}

/// Image committed to a slot's pending location, not yet marked downloaded
struct StagedImage {
    slot: SlotId,
    image: PathBuf,
    metadata: PackageMetadata,
}

pub struct Engine {
    config: FotaConfig,
    table: SlotTable,
    store: StateStore,
    severity: Severity,
    last_state_change: DateTime<Utc>,
    update_deadline: Option<DateTime<Utc>>,
    activator: Box<dyn Activator + Send>,
    publisher: Box<dyn StatePublisher + Send>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("table", &self.table)
            .field("store", &self.store)
            .field("severity", &self.severity)
            .field("last_state_change", &self.last_state_change)
            .field("update_deadline", &self.update_deadline)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Builds the slot table and restores whatever survived the last run
    pub fn new(
        config: FotaConfig,
        activator: Box<dyn Activator + Send>,
        publisher: Box<dyn StatePublisher + Send>,
        startup: StartupOptions,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let store = StateStore::new(config.state_path());
        let (record, source) = store.load();

        let mut engine = Self {
            table: SlotTable::new(&config),
            store,
            severity: record.severity,
            last_state_change: record.last_state_change,
            update_deadline: record.update_deadline,
            config,
            activator,
            publisher,
        };

        engine.restore(&record, startup);
        engine.refresh_conflicts();
        if source != LoadSource::Missing || engine.needs_record() {
            engine.persist_logged();
        }
        for slot in SlotId::ALL {
            engine.publish_state(slot);
        }

        Ok(engine)
    }

    fn restore(&mut self, record: &PersistedRecord, startup: StartupOptions) {
        if let Some(version) = &record.current_version {
            self.table.get_mut(SlotId::Application).current_version = version.clone();
        }

        for slot in SlotId::ALL {
            let index = slot.index();
            let entry = self.table.get_mut(slot);
            entry.state = record.states[index];
            entry.result = record.results[index];
            entry.pending_image_path = record.pending_paths[index].clone();

            if matches!(entry.state, SlotState::Downloaded | SlotState::Updating)
                && let Some(image) = entry.pending_image_path.as_deref()
            {
                match read_sidecar(image) {
                    Ok(metadata) => entry.metadata = Some(metadata),
                    Err(e) => warn!("No package metadata for {slot} at {}: {e}", image.display()),
                }
            }
        }

        for slot in SlotId::ALL {
            match self.table.state(slot) {
                SlotState::Idle => {
                    if let Some(stale) = self.table.get_mut(slot).pending_image_path.take() {
                        warn!("Removing stale image {} of idle {slot}", stale.display());
                        remove_image(&stale);
                    }
                }
                SlotState::Downloading => {
                    debug!("{slot} has a partial download, waiting for open() to resume");
                }
                SlotState::Downloaded => {
                    let entry = self.table.get_mut(slot);
                    let intact = entry.metadata.is_some()
                        && entry.pending_image_path.as_deref().is_some_and(Path::exists);
                    if !intact {
                        warn!("Staged image of {slot} is gone, dropping to idle");
                        if let Some(image) = entry.pending_image_path.take() {
                            remove_image(&image);
                        }
                        entry.metadata = None;
                        entry.state = SlotState::Idle;
                    }
                }
                SlotState::Updating if slot.is_primary() => match startup.delayed_result {
                    Some(result) => {
                        let delay = self.config.delayed_result_delay();
                        info!("{slot} activated, concluding with {result} in {delay:?}");
                        self.table.get_mut(slot).job =
                            Some(DelayedJob::after(delay, JobAction::Conclude(result)));
                    }
                    None => {
                        info!("{slot} activated, update succeeded");
                        self.conclude(slot, UpdateResult::Success);
                    }
                },
                SlotState::Updating => {
                    warn!("Install of {slot} was interrupted by a restart");
                    self.conclude(slot, UpdateResult::Failed);
                }
            }
        }
    }

    // Lifecycle callbacks

    /// Starts (or resumes) receiving a stream on `slot`
    pub fn open(&mut self, slot: SlotId) -> Result<()> {
        let record = self.table.get_mut(slot);
        let download = record.paths.download.clone();
        let state = record.state;

        match state {
            SlotState::Idle => match File::create(&download) {
                Ok(file) => {
                    record.stream = Some(file);
                    record.pending_image_path = Some(download);
                    record.metadata = None;
                    info!("Opened download for {slot}");
                    self.set_state(slot, SlotState::Downloading, UpdateResult::Initial);
                }
                Err(e) => {
                    error!("Cannot create {}: {e}", download.display());
                    self.set_state(slot, SlotState::Idle, UpdateResult::NotEnoughSpace);
                    self.persist_logged();
                    return Err(FotaError::NotEnoughSpace(e));
                }
            },
            SlotState::Downloading if record.stream.is_some() => {
                debug!("Download for {slot} already open");
                return Ok(());
            }
            SlotState::Downloading => match OpenOptions::new().append(true).open(&download) {
                Ok(file) => {
                    let received = file.metadata().map(|m| m.len()).unwrap_or_default();
                    info!("Resuming download for {slot} at {received} bytes");
                    record.stream = Some(file);
                    record.pending_image_path = Some(download);
                }
                Err(e) => {
                    warn!("Cannot resume download for {slot}: {e}");
                    record.pending_image_path = None;
                    remove_file_logged(&download);
                    self.set_state(slot, SlotState::Idle, UpdateResult::Failed);
                    self.persist_logged();
                    return Err(FotaError::Io(e));
                }
            },
            SlotState::Downloaded | SlotState::Updating => {
                return Err(FotaError::InvalidState { slot, state });
            }
        }

        self.persist_logged();
        Ok(())
    }

    /// Appends a chunk of the stream and flushes it
    pub fn write(&mut self, slot: SlotId, bytes: &[u8]) -> Result<()> {
        let record = self.table.get_mut(slot);
        let state = record.state;
        let Some(stream) = record
            .stream
            .as_mut()
            .filter(|_| state == SlotState::Downloading)
        else {
            return Err(FotaError::InvalidState { slot, state });
        };

        if let Err(e) = append(stream, bytes) {
            error!("Write to {slot} download failed: {e}");
            self.abort_download(slot, UpdateResult::NotEnoughSpace);
            return Err(FotaError::NotEnoughSpace(e));
        }
        Ok(())
    }

    /// Closes the stream and unpacks it; returns the slots that became downloaded
    pub fn finish(&mut self, slot: SlotId) -> Result<Vec<SlotId>> {
        let record = self.table.get_mut(slot);
        if record.state != SlotState::Downloading {
            return Err(FotaError::InvalidState {
                slot,
                state: record.state,
            });
        }
        if let Some(stream) = record.stream.take()
            && let Err(e) = stream.sync_all()
        {
            warn!("Failed to sync {slot} download: {e}");
        }
        record.pending_image_path = None;
        let download = record.paths.download.clone();

        let staged = self.stage_download(slot, &download);
        remove_file_logged(&download);

        match staged {
            Ok(staged) => {
                let targets: Vec<SlotId> = staged.iter().map(|s| s.slot).collect();
                for StagedImage {
                    slot: target,
                    image,
                    metadata,
                } in staged
                {
                    info!(
                        "Staged {target} v{} at {}",
                        metadata.version,
                        image.display()
                    );
                    let record = self.table.get_mut(target);
                    record.pending_image_path = Some(image);
                    record.metadata = Some(metadata);
                    self.set_state(target, SlotState::Downloaded, UpdateResult::Initial);
                }
                if !targets.contains(&slot) {
                    self.table.get_mut(slot).metadata = None;
                    self.set_state(slot, SlotState::Idle, UpdateResult::Initial);
                }
                self.refresh_conflicts();
                self.persist_logged();
                Ok(targets)
            }
            Err(e) => {
                error!("Download on {slot} rejected: {e}");
                self.table.get_mut(slot).metadata = None;
                self.set_state(slot, SlotState::Idle, e.result());
                self.persist_logged();
                Err(e)
            }
        }
    }

    /// Unpacks, commits and validates a finished stream as one batch
    fn stage_download(&mut self, streaming: SlotId, download: &Path) -> Result<Vec<StagedImage>> {
        let mut file = File::open(download)?;
        let packages = package::unpack(&mut file, 0, &self.config.data_dir)?;

        for unpacked in &packages {
            let state = self.table.state(unpacked.slot);
            let busy = match state {
                SlotState::Idle => false,
                SlotState::Downloading => unpacked.slot != streaming,
                SlotState::Downloaded | SlotState::Updating => true,
            };
            if busy {
                warn!("Package for {} refused, slot is {state}", unpacked.slot);
                return Err(FotaError::ConflictingState {
                    slot: unpacked.slot,
                    state,
                });
            }
        }

        let mut staged = Vec::with_capacity(packages.len());
        for unpacked in packages {
            let image = self.table.get(unpacked.slot).paths.image.clone();
            if let Err(e) = package::commit_image(unpacked.image, &image) {
                discard(&staged);
                return Err(e);
            }
            staged.push(StagedImage {
                slot: unpacked.slot,
                image,
                metadata: unpacked.metadata,
            });
        }

        for entry in &staged {
            if let Err(e) = validation::validate_image(entry.slot, &entry.metadata, &entry.image) {
                warn!("Image for {} failed validation: {e}", entry.slot);
                discard(&staged);
                if entry.slot != streaming {
                    self.table.get_mut(entry.slot).result = e.result();
                    self.publish_state(entry.slot);
                }
                return Err(e);
            }
        }

        for entry in &staged {
            if let Err(e) = write_sidecar(&entry.image, &entry.metadata) {
                discard(&staged);
                return Err(e);
            }
        }

        Ok(staged)
    }

    fn abort_download(&mut self, slot: SlotId, result: UpdateResult) {
        let record = self.table.get_mut(slot);
        record.stream = None;
        record.pending_image_path = None;
        let download = record.paths.download.clone();
        remove_file_logged(&download);
        self.set_state(slot, SlotState::Idle, result);
        self.persist_logged();
    }

    /// Drops everything staged for `slot` and returns it to idle
    pub fn reset(&mut self, slot: SlotId) {
        let record = self.table.get_mut(slot);
        record.stream = None;
        if let Some(job) = record.job.take() {
            info!("Cancelled pending {:?} for {slot}", job.action);
        }
        if let Some(image) = record.pending_image_path.take() {
            remove_image(&image);
        }
        record.metadata = None;
        let download = record.paths.download.clone();
        remove_file_logged(&download);

        info!("Reset {slot}");
        self.set_state(slot, SlotState::Idle, UpdateResult::Initial);

        if let Err(e) = self.store.delete() {
            warn!("{e}");
        }
        self.refresh_conflicts();
        if self.needs_record() {
            self.persist_logged();
        }
    }

    /// Applies `slot` together with `requested` slots, or its linked slots
    pub fn perform_upgrade(
        &mut self,
        slot: SlotId,
        requested: &[SlotId],
    ) -> Result<UpgradeOutcome> {
        let record = self.table.get(slot);
        if record.state != SlotState::Downloaded {
            return Err(FotaError::InvalidState {
                slot,
                state: record.state,
            });
        }

        let mut targets = vec![slot];
        let extra = if requested.is_empty() {
            record.linked.as_slice()
        } else {
            requested
        };
        for &other in extra {
            if !targets.contains(&other) {
                targets.push(other);
            }
        }

        let mut blocking = Vec::new();
        for &target in &targets {
            let record = self.table.get(target);
            if record.state != SlotState::Downloaded && !blocking.contains(&target) {
                blocking.push(target);
            }
            for &other in &record.conflicting {
                if !blocking.contains(&other) {
                    blocking.push(other);
                }
            }
        }
        if !blocking.is_empty() {
            warn!("Upgrade of {slot} blocked by {blocking:?}");
            return Err(FotaError::DependencyError { slot, blocking });
        }

        info!("Upgrading {targets:?}");
        for &target in &targets {
            self.set_state(target, SlotState::Updating, UpdateResult::Initial);
        }
        self.persist_logged();

        let mut first_error = None;
        for &target in &targets {
            let record = self.table.get(target);
            let check = record.kind.check();
            if let Err(e) = check(record) {
                error!("Check of {target} failed: {e}");
                self.table.get_mut(target).result = e.result();
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            for &target in &targets {
                let result = self.table.get(target).result;
                self.set_state(target, SlotState::Downloaded, result);
            }
            self.persist_logged();
            return Err(e);
        }

        // Nothing is concluded or scheduled until every target applied cleanly
        let mut outcomes = Vec::with_capacity(targets.len());
        for &target in &targets {
            let record = self.table.get(target);
            let apply = record.kind.apply();
            match apply(record) {
                Ok(outcome) => outcomes.push((target, outcome)),
                Err(e) => {
                    error!("Apply of {target} failed: {e}");
                    for &other in &targets {
                        if other != target {
                            self.set_state(other, SlotState::Downloaded, UpdateResult::Initial);
                        }
                    }
                    self.set_state(target, SlotState::Downloaded, e.result());
                    self.refresh_conflicts();
                    self.persist_logged();
                    return Err(e);
                }
            }
        }

        let mut pending = false;
        for (target, outcome) in outcomes {
            match outcome {
                ApplyOutcome::Completed => self.conclude(target, UpdateResult::Success),
                ApplyOutcome::Activate { delayed_result } => {
                    let delay = self.config.activation_delay();
                    let record = self.table.get_mut(target);
                    let image = record
                        .pending_image_path
                        .clone()
                        .unwrap_or_else(|| record.paths.image.clone());
                    info!("Activating {} in {delay:?}", image.display());
                    record.job = Some(DelayedJob::after(
                        delay,
                        JobAction::Activate {
                            image,
                            delayed_result,
                        },
                    ));
                    pending = true;
                }
                ApplyOutcome::Delayed(result) => {
                    let delay = self.config.delayed_result_delay();
                    info!("{target} reports its result in {delay:?}");
                    self.table.get_mut(target).job =
                        Some(DelayedJob::after(delay, JobAction::Conclude(result)));
                    pending = true;
                }
                ApplyOutcome::Parked => {
                    info!("{target} deferred until reset");
                    self.set_state(target, SlotState::Updating, UpdateResult::Deferred);
                    pending = true;
                }
            }
        }

        self.refresh_conflicts();
        self.persist_logged();
        Ok(if pending {
            UpgradeOutcome::Pending
        } else {
            UpgradeOutcome::Completed
        })
    }

    /// Terminal transition out of `Updating`
    fn conclude(&mut self, slot: SlotId, result: UpdateResult) {
        let record = self.table.get_mut(slot);
        record.job = None;

        let mut result = result;
        if result.is_success()
            && !slot.is_primary()
            && let Err(e) = install::install_secondary(record)
        {
            error!("Install of {slot} failed: {e}");
            result = UpdateResult::Failed;
        }

        if result.is_success() {
            match record.metadata.take() {
                Some(metadata) => {
                    info!(
                        "{slot} updated: {} -> {}",
                        record.current_version, metadata.version
                    );
                    record.current_version = metadata.version;
                }
                None => warn!("{slot} concluded without package metadata, version unchanged"),
            }
            if let Some(image) = record.pending_image_path.take() {
                remove_image(&image);
            }
            self.set_state(slot, SlotState::Idle, UpdateResult::Success);
        } else {
            let retryable = record
                .pending_image_path
                .as_deref()
                .is_some_and(Path::exists);
            if !retryable {
                record.pending_image_path = None;
                record.metadata = None;
            }
            let state = if retryable {
                SlotState::Downloaded
            } else {
                SlotState::Idle
            };
            warn!("{slot} update concluded with {result}");
            self.set_state(slot, state, result);
        }
    }

    // Delayed jobs

    /// Earliest deadline of any scheduled job
    pub fn next_deadline(&self) -> Option<Instant> {
        self.table
            .iter()
            .filter_map(|record| record.job.as_ref().map(|job| job.due))
            .min()
    }

    pub fn has_pending_jobs(&self) -> bool {
        self.table.iter().any(SlotRecord::has_scheduled_job)
    }

    /// Runs every job due at `now`; returns how many ran
    pub fn run_due_jobs(&mut self, now: Instant) -> usize {
        let mut fired = 0;

        for slot in SlotId::ALL {
            let record = self.table.get_mut(slot);
            if !record.job.as_ref().is_some_and(|job| job.is_due(now)) {
                continue;
            }
            let Some(job) = record.job.take() else {
                continue;
            };
            fired += 1;

            debug!("Running delayed job for {slot}: {:?}", job.action);
            match job.action {
                JobAction::Activate {
                    image,
                    delayed_result,
                } => self.activate(slot, image, delayed_result),
                JobAction::Conclude(result) => self.conclude(slot, result),
            }
        }

        if fired > 0 {
            self.refresh_conflicts();
            self.persist_logged();
        }
        fired
    }

    fn activate(&mut self, slot: SlotId, image: PathBuf, delayed_result: Option<UpdateResult>) {
        if let Err(e) = self.persist() {
            error!("Not activating {slot}, state could not be saved: {e}");
            self.conclude(slot, UpdateResult::Failed);
            return;
        }

        let request = ActivationRequest {
            image,
            delayed_result,
        };
        match self.activator.activate(&request) {
            Ok(()) => info!("Handed over to {}", request.image.display()),
            Err(e) => {
                error!("Activation of {slot} failed: {e}");
                self.conclude(slot, e.result());
            }
        }
    }

    // Cross-slot sets

    /// Recomputes linked/conflicting sets and publishes the ones that changed
    fn refresh_conflicts(&mut self) {
        let resolutions = resolver::resolve_downloaded(&self.table);

        for slot in SlotId::ALL {
            let resolution = resolutions
                .iter()
                .find(|(resolved, _)| *resolved == slot)
                .map(|(_, resolution)| resolution.clone());
            let record = self.table.get_mut(slot);
            let resolution = match resolution {
                Some(resolution) => resolution,
                None if record.state == SlotState::Updating => continue,
                None => resolver::Resolution::default(),
            };

            if record.linked != resolution.linked {
                record.linked = resolution.linked;
                self.publisher.set_linked(slot, &record.linked);
            }
            if record.conflicting != resolution.conflicting {
                record.conflicting = resolution.conflicting;
                debug!("{slot} conflicting set now {:?}", record.conflicting);
                self.publisher.set_conflicting(slot, &record.conflicting);
            }
        }
    }

    // Getters and setters

    pub fn get_current_version(&self, slot: SlotId) -> &str {
        &self.table.get(slot).current_version
    }

    pub fn get_pending_version(&self, slot: SlotId) -> &str {
        self.table.get(slot).pending_version()
    }

    pub fn state(&self, slot: SlotId) -> SlotState {
        self.table.get(slot).state
    }

    pub fn result(&self, slot: SlotId) -> UpdateResult {
        self.table.get(slot).result
    }

    pub fn linked(&self, slot: SlotId) -> &[SlotId] {
        &self.table.get(slot).linked
    }

    pub fn conflicting(&self, slot: SlotId) -> &[SlotId] {
        &self.table.get(slot).conflicting
    }

    pub fn pending_image_path(&self, slot: SlotId) -> Option<&Path> {
        self.table.get(slot).pending_image_path.as_deref()
    }

    pub fn slot(&self, slot: SlotId) -> &SlotRecord {
        self.table.get(slot)
    }

    pub fn config(&self) -> &FotaConfig {
        &self.config
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn set_severity(&mut self, severity: Severity) {
        self.severity = severity;
        self.persist_logged();
    }

    pub fn update_deadline(&self) -> Option<DateTime<Utc>> {
        self.update_deadline
    }

    pub fn set_update_deadline(&mut self, deadline: Option<DateTime<Utc>>) {
        self.update_deadline = deadline.map(|d| d.trunc_subsecs(0));
        self.persist_logged();
    }

    pub fn last_state_change(&self) -> DateTime<Utc> {
        self.last_state_change
    }

    // Internals

    fn set_state(&mut self, slot: SlotId, state: SlotState, result: UpdateResult) {
        let record = self.table.get_mut(slot);
        if record.state != state {
            info!("{slot}: {} -> {state}", record.state);
            self.last_state_change = Utc::now().trunc_subsecs(0);
        }
        record.state = state;
        record.result = result;
        self.publisher.set_state_and_result(slot, state, result);
    }

    fn publish_state(&mut self, slot: SlotId) {
        let record = self.table.get(slot);
        self.publisher
            .set_state_and_result(slot, record.state, record.result);
    }

    fn needs_record(&self) -> bool {
        self.severity != Severity::default()
            || self.update_deadline.is_some()
            || self.table.iter().any(|record| !record.is_pristine())
    }

    fn snapshot(&self) -> PersistedRecord {
        let mut record = PersistedRecord {
            severity: self.severity,
            last_state_change: self.last_state_change,
            update_deadline: self.update_deadline,
            current_version: Some(self.table.get(SlotId::Application).current_version.clone()),
            ..PersistedRecord::default()
        };
        for slot in self.table.iter() {
            let index = slot.id.index();
            record.states[index] = slot.state;
            record.results[index] = slot.result;
            record.pending_paths[index] = slot.pending_image_path.clone();
        }
        record
    }

    fn persist(&self) -> Result<()> {
        self.store.save(&self.snapshot())
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            warn!("Keeping state in memory only: {e}");
        }
    }
}

fn append(stream: &mut File, bytes: &[u8]) -> io::Result<()> {
    stream.write_all(bytes)?;
    stream.flush()
}

fn discard(staged: &[StagedImage]) {
    for entry in staged {
        remove_image(&entry.image);
    }
}

fn remove_file_logged(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {e}", path.display()),
    }
}
