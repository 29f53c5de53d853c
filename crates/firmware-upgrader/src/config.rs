// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Firmware Upgrader.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Configuration module for the upgrader

use crate::error::{Result, UpgraderError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/data/firmware_upgrader.json";

fn default_70() -> u64 {
    70
}

fn default_20() -> u64 {
    20
}

fn default_5() -> u64 {
    5
}

fn default_10() -> u32 {
    10
}

fn default_300() -> u64 {
    300
}

fn default_8() -> usize {
    8
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/data/firmware_upgrader.db")
}

fn default_checksum_file() -> String {
    "/etc/openwisp/firmware_checksum".to_owned()
}

fn default_remote_upload_dir() -> String {
    "/tmp".to_owned()
}

fn default_ssh_binary() -> String {
    "ssh".to_owned()
}

fn default_scp_binary() -> String {
    "scp".to_owned()
}

fn default_control_dir() -> PathBuf {
    PathBuf::from("/tmp/firmware-upgrader-ssh")
}

/// Fixed delays and limits of the upgrade protocol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradeTimings {
    /// How long to wait for the reflash process before giving up on it
    #[serde(default = "default_70")]
    pub upgrade_timeout_secs: u64,

    /// Pause after the reflash wait so the device can reboot
    #[serde(default = "default_20")]
    pub settle_delay_secs: u64,

    /// Pause between reconnection attempts
    #[serde(default = "default_5")]
    pub retry_delay_secs: u64,

    /// Reconnection attempts before the device is declared unreachable
    #[serde(default = "default_10")]
    pub reconnect_attempts: u32,

    /// Upper bound for any single exec/upload on a live connection
    #[serde(default = "default_300")]
    pub command_timeout_secs: u64,
}

impl UpgradeTimings {
    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_secs(self.upgrade_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for UpgradeTimings {
    fn default() -> Self {
        Self {
            upgrade_timeout_secs: 70,
            settle_delay_secs: 20,
            retry_delay_secs: 5,
            reconnect_attempts: 10,
            command_timeout_secs: 300,
        }
    }
}

/// OpenSSH client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_ssh_binary")]
    pub binary: String,

    #[serde(default = "default_scp_binary")]
    pub scp_binary: String,

    /// Private key passed with `-i` (optional, agent keys are used otherwise)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,

    #[serde(default = "default_10_u64")]
    pub connect_timeout_secs: u64,

    /// Directory holding the control master sockets
    #[serde(default = "default_control_dir")]
    pub control_dir: PathBuf,

    #[serde(default)]
    pub strict_host_key_checking: bool,
}

fn default_10_u64() -> u64 {
    10
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: default_ssh_binary(),
            scp_binary: default_scp_binary(),
            identity_file: None,
            connect_timeout_secs: 10,
            control_dir: default_control_dir(),
            strict_host_key_checking: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgraderConfig {
    #[serde(default)]
    pub timings: UpgradeTimings,

    /// Device sessions allowed to run at the same time within one batch
    #[serde(default = "default_8")]
    pub max_concurrent_sessions: usize,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Where the device keeps the checksum of its installed image
    #[serde(default = "default_checksum_file")]
    pub checksum_file: String,

    /// Scratch directory on the device receiving uploaded images
    #[serde(default = "default_remote_upload_dir")]
    pub remote_upload_dir: String,

    #[serde(default)]
    pub ssh: SshSettings,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        Self {
            timings: UpgradeTimings::default(),
            max_concurrent_sessions: 8,
            database_path: default_database_path(),
            checksum_file: default_checksum_file(),
            remote_upload_dir: default_remote_upload_dir(),
            ssh: SshSettings::default(),
        }
    }
}

impl UpgraderConfig {
    fn validate(self) -> Result<Self> {
        if self.max_concurrent_sessions == 0 {
            return Err(UpgraderError::Config(
                "max_concurrent_sessions must be at least 1".to_owned(),
            ));
        }
        if self.timings.reconnect_attempts == 0 {
            return Err(UpgraderError::Config(
                "reconnect_attempts must be at least 1".to_owned(),
            ));
        }
        if !self.checksum_file.starts_with('/') {
            return Err(UpgraderError::Config(format!(
                "checksum_file must be an absolute path, got {}",
                self.checksum_file
            )));
        }
        Ok(self)
    }
}

/// Read the config at `path`, falling back to defaults without touching the filesystem
pub fn read_config(path: &Path) -> Result<UpgraderConfig> {
    if !path.exists() {
        return Ok(UpgraderConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    let config: UpgraderConfig = serde_json::from_str(&content)
        .map_err(|e| UpgraderError::Config(format!("Failed to parse config: {e}")))?;
    config.validate()
}

pub fn load_config(path: &Path) -> Result<UpgraderConfig> {
    if path.exists() {
        read_config(path)
    } else {
        // Create with defaults
        let config = UpgraderConfig::default();
        save_config(path, &config)?;
        Ok(config)
    }
}

pub fn save_config(path: &Path, config: &UpgraderConfig) -> Result<()> {
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
