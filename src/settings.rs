//! Persisted provisioner settings.
//!
//! This module provides:
//! - `ProvisionerSettings`: target device, flash baudrate and tool locations
//! - Persistence to a JSON file in the data directory
//!
//! The baudrate is validated whenever it is set or loaded, so a bad value is
//! reported at configuration time rather than when a flash starts.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::config::{validate_baudrate, Device, DEFAULT_BAUDRATE, DEFAULT_KTOOL};
use crate::error::ProvisionResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerSettings {
    #[serde(default = "default_device")]
    pub device: Device,

    /// Flash baudrate; one of `config::VALID_BAUDRATES`.
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// Where releases are downloaded and extracted.
    #[serde(default = "default_resources_dir")]
    pub resources_dir: PathBuf,

    #[serde(default = "default_ktool_path")]
    pub ktool_path: PathBuf,
}

fn default_device() -> Device {
    Device::M5stickv
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}

fn default_resources_dir() -> PathBuf {
    PathBuf::from("resources")
}

fn default_ktool_path() -> PathBuf {
    PathBuf::from(DEFAULT_KTOOL)
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            device: default_device(),
            baudrate: default_baudrate(),
            resources_dir: default_resources_dir(),
            ktool_path: default_ktool_path(),
        }
    }
}

impl ProvisionerSettings {
    /// Set the flash baudrate, rejecting values outside the allowed set.
    pub fn set_baudrate(&mut self, baudrate: u32) -> ProvisionResult<()> {
        self.baudrate = validate_baudrate(baudrate)?;
        Ok(())
    }

    pub fn validate(&self) -> ProvisionResult<()> {
        validate_baudrate(self.baudrate)?;
        Ok(())
    }

    pub fn has_non_default_settings(&self) -> bool {
        *self != Self::default()
    }
}

/// Settings file name stored in the data directory.
const SETTINGS_FILENAME: &str = "settings.json";

/// Manages persistence of settings to a JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            settings_file_path: data_dir.join(SETTINGS_FILENAME),
        }
    }

    /// Load settings from disk, returning defaults if the file doesn't exist
    /// or is empty.
    pub fn load(&self) -> ProvisionResult<ProvisionerSettings> {
        if !self.settings_file_path.exists() {
            debug!(target: "settings", "No settings file, using defaults");
            return Ok(ProvisionerSettings::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)?;
        if contents.trim().is_empty() {
            return Ok(ProvisionerSettings::default());
        }

        let settings: ProvisionerSettings = serde_json::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, settings: &ProvisionerSettings) -> ProvisionResult<()> {
        settings.validate()?;

        if let Some(parent) = self.settings_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(settings)?;
        fs::write(&self.settings_file_path, contents)?;

        if settings.has_non_default_settings() {
            info!(target: "settings", "Saved non-default settings: {:?}", settings);
        }
        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}
