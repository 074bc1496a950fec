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

//! FluxION FOTA - multi-slot firmware delivery for remotely managed devices
//!
//! A single stream carries one or several firmware packages. The engine splits
//! it into per-slot images (application, trusted element, bootloader, modem),
//! validates them, keeps each slot's lifecycle state across restarts and
//! sequences upgrades that depend on each other.

pub mod activation;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod error;
pub mod install;
pub mod jobs;
pub mod package;
pub mod publisher;
pub mod resolver;
pub mod slot;
pub mod store;
pub mod validation;

pub use activation::{ActivationRequest, Activator, ExecActivator};
pub use config::{FotaConfig, SlotConfig};
pub use engine::{Engine, StartupOptions, UpgradeOutcome};
pub use error::{FotaError, Result};
pub use package::{ForceErrorCase, PackageBuilder, PackageMetadata, encode_multi_package};
pub use publisher::{LogPublisher, StatePublisher};
pub use slot::{SLOT_COUNT, Severity, SlotId, SlotState, UpdateResult};
