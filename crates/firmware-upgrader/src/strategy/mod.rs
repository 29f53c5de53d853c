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

//! Upgrade strategies, one per device OS family

pub mod openwrt;

use crate::config::{UpgradeTimings, UpgraderConfig};
use crate::log::UpgradeLog;
use crate::model::{FirmwareImage, UpgradeStatus};
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

pub use openwrt::OpenWrt;

/// Protocol steps of an upgrade session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    ChecksumCheck,
    Uploading,
    Testing,
    Reflashing,
    Reconnecting,
    Confirmed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connect",
            Self::ChecksumCheck => "checksum check",
            Self::Uploading => "upload",
            Self::Testing => "image test",
            Self::Reflashing => "reflash",
            Self::Reconnecting => "reconnect",
            Self::Confirmed => "confirmation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{step} failed: {source}")]
    Transport {
        step: SessionState,
        #[source]
        source: TransportError,
    },

    #[error("device rejected the image: {0}")]
    ImageRejected(String),

    #[error("device not reachable after upgrade ({attempts} attempts), manual recovery may be required")]
    UnreachableAfterUpgrade { attempts: u32 },

    #[error("cannot read firmware image: {0}")]
    LocalImage(#[from] std::io::Error),
}

#[derive(Debug)]
pub enum SessionOutcome {
    Success,
    /// The device already runs the image
    Aborted,
    Failed(SessionError),
}

impl SessionOutcome {
    pub fn status(&self) -> UpgradeStatus {
        match self {
            Self::Success => UpgradeStatus::Success,
            Self::Aborted => UpgradeStatus::Aborted,
            Self::Failed(_) => UpgradeStatus::Failed,
        }
    }

    /// Whether the device ends up running the target image
    pub fn firmware_installed(&self) -> bool {
        matches!(self, Self::Success | Self::Aborted)
    }
}

/// Parameters shared by every session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub checksum_file: String,
    pub remote_upload_dir: String,
    pub timings: UpgradeTimings,
}

impl From<&UpgraderConfig> for SessionSettings {
    fn from(config: &UpgraderConfig) -> Self {
        Self {
            checksum_file: config.checksum_file.clone(),
            remote_upload_dir: config.remote_upload_dir.clone(),
            timings: config.timings.clone(),
        }
    }
}

#[async_trait]
pub trait UpgradeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drive one device to a terminal outcome, logging every decision
    async fn upgrade(
        &self,
        transport: &mut dyn Transport,
        image: &FirmwareImage,
        log: &mut UpgradeLog,
    ) -> SessionOutcome;
}

/// Resolve the strategy configured on a device connection
pub fn for_name(name: &str, settings: &SessionSettings) -> Option<Box<dyn UpgradeStrategy>> {
    match name.to_lowercase().as_str() {
        "openwrt" | "openwrt-ssh" => Some(Box::new(OpenWrt::new(settings.clone()))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_lookup() {
        let settings = SessionSettings::from(&UpgraderConfig::default());
        assert_eq!(for_name("openwrt", &settings).unwrap().name(), "openwrt");
        assert_eq!(for_name("OpenWrt-SSH", &settings).unwrap().name(), "openwrt");
        assert!(for_name("routeros", &settings).is_none());
    }

    #[test]
    fn test_outcome_status() {
        assert_eq!(SessionOutcome::Success.status(), UpgradeStatus::Success);
        assert_eq!(SessionOutcome::Aborted.status(), UpgradeStatus::Aborted);
        let failed = SessionOutcome::Failed(SessionError::ImageRejected("bad".to_owned()));
        assert_eq!(failed.status(), UpgradeStatus::Failed);
        assert!(!failed.firmware_installed());
        assert!(SessionOutcome::Aborted.firmware_installed());
    }
}
