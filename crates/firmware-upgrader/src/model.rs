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

//! Records shared between the store, the coordinator and the upgrade sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub type CategoryId = i64;
pub type BuildId = i64;
pub type ImageId = i64;
pub type DeviceId = i64;
pub type OperationId = i64;
pub type BatchId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A published firmware version within a category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub category_id: CategoryId,
    pub version: String,
    #[serde(default)]
    pub changelog: String,
}

impl Build {
    /// Human readable label, e.g. `WiFi Hotspot v1.2`
    pub fn label(&self, category: &Category) -> String {
        format!("{} v{}", category.name, self.version)
    }
}

/// A firmware binary for one device type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareImage {
    pub id: ImageId,
    pub build_id: BuildId,
    /// Local path of the image file
    pub file: PathBuf,
    pub image_type: String,
    /// Device models this image can be flashed on
    pub boards: Vec<String>,
}

impl FirmwareImage {
    /// Derive the image type from its file name by dropping the leading prefix
    ///
    /// `openwrt-ar71xx-generic-tl-wdr4300-v1-squashfs-sysupgrade.bin` becomes
    /// `ar71xx-generic-tl-wdr4300-v1-squashfs-sysupgrade.bin`.
    pub fn infer_type(file_name: &str) -> Option<String> {
        let (_, rest) = file_name.split_once('-')?;
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_owned())
        }
    }

    pub fn supports(&self, model: &str) -> bool {
        self.boards.iter().any(|b| b == model)
    }

    /// File name used on the device scratch directory
    pub fn file_name(&self) -> String {
        self.file
            .file_name()
            .map_or_else(|| format!("image-{}.bin", self.id), |n| n.to_string_lossy().into_owned())
    }
}

/// How the upgrader reaches a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConnection {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    /// Name of the upgrade strategy for this device family
    pub update_strategy: String,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Hardware model, matched against image boards
    pub model: String,
    pub connection: Option<DeviceConnection>,
}

/// Which image a device runs, and whether its installation was confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFirmware {
    pub device_id: DeviceId,
    pub image_id: ImageId,
    pub installed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradeStatus {
    InProgress,
    Success,
    Failed,
    Aborted,
}

impl UpgradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown upgrade status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchStatus {
    InProgress,
    Success,
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

/// One upgrade attempt of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeOperation {
    pub id: OperationId,
    pub device_id: DeviceId,
    pub image_id: ImageId,
    pub status: UpgradeStatus,
    pub log: String,
    pub batch_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUpgradeOperation {
    pub id: BatchId,
    pub build_id: BuildId,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Percentage of a batch's operations, or "N/A" for an empty batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate(Option<f64>);

impl Rate {
    fn of(count: u32, total: u32) -> Self {
        if total == 0 {
            return Self(None);
        }
        let permille = f64::from(count) / f64::from(total) * 1000.0;
        Self(Some(permille.round() / 10.0))
    }

    pub fn value(self) -> Option<f64> {
        self.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{value:.1}%"),
            None => f.write_str("N/A"),
        }
    }
}

/// Counts derived from a batch's operations at read time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: u32,
    pub in_progress: u32,
    pub success: u32,
    pub failed: u32,
    pub aborted: u32,
}

impl BatchSummary {
    pub fn from_statuses(statuses: impl IntoIterator<Item = UpgradeStatus>) -> Self {
        let mut summary = Self::default();
        for status in statuses {
            summary.total += 1;
            match status {
                UpgradeStatus::InProgress => summary.in_progress += 1,
                UpgradeStatus::Success => summary.success += 1,
                UpgradeStatus::Failed => summary.failed += 1,
                UpgradeStatus::Aborted => summary.aborted += 1,
            }
        }
        summary
    }

    pub fn completed(&self) -> u32 {
        self.total - self.in_progress
    }

    pub fn progress_report(&self) -> String {
        format!("{} out of {}", self.completed(), self.total)
    }

    pub fn success_rate(&self) -> Rate {
        Rate::of(self.success, self.total)
    }

    pub fn failed_rate(&self) -> Rate {
        Rate::of(self.failed, self.total)
    }

    pub fn aborted_rate(&self) -> Rate {
        Rate::of(self.aborted, self.total)
    }

    /// Terminal batch status, `None` while any operation is still running
    ///
    /// Aborted operations count as success: the device already had the image.
    pub fn terminal_status(&self) -> Option<BatchStatus> {
        if self.in_progress > 0 {
            None
        } else if self.failed > 0 {
            Some(BatchStatus::Failed)
        } else {
            Some(BatchStatus::Success)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::repeat_n;

    #[test]
    fn test_infer_type() {
        assert_eq!(
            FirmwareImage::infer_type("openwrt-ar71xx-generic-tl-wdr4300-v1-squashfs-sysupgrade.bin")
                .as_deref(),
            Some("ar71xx-generic-tl-wdr4300-v1-squashfs-sysupgrade.bin")
        );
        assert_eq!(FirmwareImage::infer_type("firmware.bin"), None);
        assert_eq!(FirmwareImage::infer_type("openwrt-"), None);
    }

    #[test]
    fn test_status_string_forms() {
        for status in [
            UpgradeStatus::InProgress,
            UpgradeStatus::Success,
            UpgradeStatus::Failed,
            UpgradeStatus::Aborted,
        ] {
            assert_eq!(status.as_str().parse::<UpgradeStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&UpgradeStatus::InProgress).unwrap(),
            "\"in-progress\""
        );
        assert!("done".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn test_empty_batch_rates_not_applicable() {
        let summary = BatchSummary::from_statuses([]);
        assert_eq!(summary.success_rate().to_string(), "N/A");
        assert_eq!(summary.failed_rate().to_string(), "N/A");
        assert_eq!(summary.aborted_rate().to_string(), "N/A");
        assert_eq!(summary.terminal_status(), Some(BatchStatus::Success));
        assert_eq!(summary.progress_report(), "0 out of 0");
    }

    #[test]
    fn test_success_with_aborted_operations() {
        let statuses = repeat_n(UpgradeStatus::Success, 7).chain(repeat_n(UpgradeStatus::Aborted, 3));
        let summary = BatchSummary::from_statuses(statuses);

        assert_eq!(summary.terminal_status(), Some(BatchStatus::Success));
        assert_eq!(summary.success_rate().value(), Some(70.0));
        assert_eq!(summary.aborted_rate().value(), Some(30.0));
        assert_eq!(summary.failed_rate().value(), Some(0.0));
        assert_eq!(summary.failed_rate().to_string(), "0.0%");
    }

    #[test]
    fn test_single_failure_fails_batch() {
        let statuses = repeat_n(UpgradeStatus::Success, 9).chain([UpgradeStatus::Failed]);
        let summary = BatchSummary::from_statuses(statuses);
        assert_eq!(summary.terminal_status(), Some(BatchStatus::Failed));
        assert_eq!(summary.failed_rate().to_string(), "10.0%");
    }

    #[test]
    fn test_rate_rounds_to_one_decimal() {
        let statuses = [
            UpgradeStatus::Success,
            UpgradeStatus::Failed,
            UpgradeStatus::Failed,
        ];
        let summary = BatchSummary::from_statuses(statuses);
        assert_eq!(summary.success_rate().value(), Some(33.3));
        assert_eq!(summary.failed_rate().value(), Some(66.7));
    }

    #[test]
    fn test_in_progress_batch_not_terminal() {
        let summary =
            BatchSummary::from_statuses([UpgradeStatus::Failed, UpgradeStatus::InProgress]);
        assert_eq!(summary.terminal_status(), None);
        assert_eq!(summary.progress_report(), "1 out of 2");
    }
}
