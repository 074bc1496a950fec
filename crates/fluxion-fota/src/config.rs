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

//! Configuration module for the FOTA engine

use crate::error::{FotaError, Result};
use crate::slot::SlotId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/data/fota_config.json";
pub const DEFAULT_VERSION: &str = "1.0.0";
const STATE_FILE_NAME: &str = "fota_state.bin";

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data/fota")
}

fn default_1000() -> u64 {
    1000
}

fn default_3() -> u64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FotaConfig {
    /// Directory holding downloads, staged images and the state record
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Persisted state record (defaults to `<data_dir>/fota_state.bin`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,

    /// Delay between acknowledging perform-upgrade and re-executing the new image
    #[serde(default = "default_1000")]
    pub activation_delay_ms: u64,

    /// How long a re-executed image takes to report its delayed self-check result
    #[serde(default = "default_3")]
    pub delayed_result_secs: u64,

    /// Per-slot overrides
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotConfig {
    pub slot: SlotId,

    /// Version considered installed at first start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,

    /// Forced location for the staged image (test tooling)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_image_path: Option<PathBuf>,
}

impl Default for FotaConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            state_file: None,
            activation_delay_ms: 1000,
            delayed_result_secs: 3,
            slots: Vec::new(),
        }
    }
}

impl FotaConfig {
    /// Config rooted at `data_dir` with every other field defaulted
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(STATE_FILE_NAME))
    }

    pub fn activation_delay(&self) -> Duration {
        Duration::from_millis(self.activation_delay_ms)
    }

    pub fn delayed_result_delay(&self) -> Duration {
        Duration::from_secs(self.delayed_result_secs)
    }

    pub fn slot_overrides(&self, slot: SlotId) -> Option<&SlotConfig> {
        self.slots.iter().find(|entry| entry.slot == slot)
    }

    pub fn validate(&self) -> Result<()> {
        for (index, entry) in self.slots.iter().enumerate() {
            if self.slots[..index].iter().any(|other| other.slot == entry.slot) {
                return Err(FotaError::Config(format!(
                    "slot {} configured more than once",
                    entry.slot
                )));
            }
            if entry
                .current_version
                .as_deref()
                .is_some_and(str::is_empty)
            {
                return Err(FotaError::Config(format!(
                    "slot {} has an empty current_version",
                    entry.slot
                )));
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<FotaConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: FotaConfig = serde_json::from_str(&content)
            .map_err(|e| FotaError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    } else {
        // Create with defaults
        let config = FotaConfig::default();
        save_config(path, &config)?;
        Ok(config)
    }
}

pub fn save_config(path: &Path, config: &FotaConfig) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(config)?;

    // Atomic write
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;

    Ok(())
}
