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

//! Runs one upgrade operation to completion and persists its outcome

use crate::error::{Result, UpgraderError};
use crate::log::UpgradeLog;
use crate::model::{DeviceFirmware, DeviceId, ImageId, OperationId, UpgradeOperation, UpgradeStatus};
use crate::store::{OperationLogSink, UpgradeStore};
use crate::strategy::{self, SessionSettings};
use crate::transport::Connector;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct OperationRunner {
    store: Arc<dyn UpgradeStore>,
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
}

impl fmt::Debug for OperationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRunner")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl OperationRunner {
    pub fn new(
        store: Arc<dyn UpgradeStore>,
        connector: Arc<dyn Connector>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            store,
            connector,
            settings,
        }
    }

    /// Run an in-progress operation and record its terminal status
    ///
    /// Only store failures are returned as errors. Everything that goes wrong
    /// on the device ends up in the operation status and log.
    pub async fn run(&self, operation_id: OperationId) -> Result<UpgradeStatus> {
        let operation = self.store.operation(operation_id)?;
        let device = self.store.device(operation.device_id)?;
        let image = self.store.image(operation.image_id)?;

        let sink = Arc::new(OperationLogSink::new(self.store.clone(), operation_id));
        let mut log = UpgradeLog::with_sink(sink);

        let Some(connection) = device.connection.clone() else {
            log.push("No device connection available");
            return self.finish(&operation, UpgradeStatus::Failed);
        };

        // the oldest in-progress operation of a device wins
        let concurrent = self.store.in_progress_operations(device.id)?;
        if concurrent.iter().any(|&id| id < operation_id) {
            log.push("Another upgrade operation is in progress, aborting...");
            return self.finish(&operation, UpgradeStatus::Aborted);
        }

        let Some(strategy) = strategy::for_name(&connection.update_strategy, &self.settings) else {
            log.push(format!(
                "Unknown update strategy '{}'",
                connection.update_strategy
            ));
            return self.finish(&operation, UpgradeStatus::Failed);
        };

        info!(
            operation = operation_id,
            device = device.id,
            image = image.id,
            strategy = strategy.name(),
            "Starting upgrade of {}",
            device.name
        );
        let mut transport = self.connector.transport(&device, &connection);
        let outcome = strategy.upgrade(&mut *transport, &image, &mut log).await;

        // the device outcome is final, a failed assignment update must not hide it
        if outcome.firmware_installed()
            && let Err(e) = self.store.save_device_firmware(&DeviceFirmware {
                device_id: device.id,
                image_id: image.id,
                installed: true,
            })
        {
            warn!(
                operation = operation_id,
                device = device.id,
                "Could not mark firmware as installed: {e}"
            );
            log.push(format!("Could not mark firmware as installed: {e}"));
        }
        self.finish(&operation, outcome.status())
    }

    fn finish(&self, operation: &UpgradeOperation, status: UpgradeStatus) -> Result<UpgradeStatus> {
        self.store.set_operation_status(operation.id, status)?;
        match status {
            UpgradeStatus::Failed => warn!(
                operation = operation.id,
                device = operation.device_id,
                "Upgrade operation failed"
            ),
            UpgradeStatus::InProgress | UpgradeStatus::Success | UpgradeStatus::Aborted => info!(
                operation = operation.id,
                device = operation.device_id,
                %status,
                "Upgrade operation finished"
            ),
        }
        Ok(status)
    }

    /// Assign `image_id` to a device and upgrade it outside of any batch
    pub async fn upgrade_device(
        &self,
        device_id: DeviceId,
        image_id: ImageId,
    ) -> Result<UpgradeOperation> {
        let device = self.store.device(device_id)?;
        let image = self.store.image(image_id)?;
        if !image.supports(&device.model) {
            return Err(UpgraderError::BoardMismatch {
                device: device.id,
                model: device.model,
                image: image.id,
            });
        }

        self.store.save_device_firmware(&DeviceFirmware {
            device_id,
            image_id,
            installed: false,
        })?;
        let operation = self.store.create_operation(device_id, image_id, None)?;
        self.run(operation.id).await?;
        self.store.operation(operation.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::sha256_file;
    use crate::config::UpgraderConfig;
    use crate::model::{Device, DeviceConnection, FirmwareImage};
    use crate::simulator::{DeviceBehavior, SimulatedDevice, SimulatedFleet};
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    const MODEL: &str = "TP-Link WDR4300";

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        fleet: Arc<SimulatedFleet>,
        runner: OperationRunner,
        image: FirmwareImage,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("openwrt-ath79-generic-sysupgrade.bin");
        std::fs::write(&file, b"firmware 2.0").unwrap();

        let store = Arc::new(MemoryStore::new());
        let category = store.add_category("Routers", "").unwrap();
        let build = store.add_build(category.id, "2.0", "").unwrap();
        let image = store
            .add_image(build.id, &file, None, &[MODEL.to_owned()])
            .unwrap();

        let fleet = Arc::new(SimulatedFleet::new());
        let runner = OperationRunner::new(
            store.clone(),
            fleet.clone(),
            SessionSettings::from(&UpgraderConfig::default()),
        );
        Fixture {
            _dir: dir,
            store,
            fleet,
            runner,
            image,
        }
    }

    fn add_device(store: &MemoryStore, strategy: Option<&str>) -> Device {
        let connection = strategy.map(|s| DeviceConnection {
            address: "192.0.2.10".to_owned(),
            port: 22,
            username: "root".to_owned(),
            update_strategy: s.to_owned(),
        });
        store.add_device("ap", MODEL, connection.as_ref()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_upgrade_marks_firmware_installed() {
        let f = fixture();
        let device = add_device(&f.store, Some("openwrt"));

        let operation = f.runner.upgrade_device(device.id, f.image.id).await.unwrap();

        assert_eq!(operation.status, UpgradeStatus::Success);
        assert!(operation.log.contains("Connection established"));
        assert!(operation.log.contains("Upgrade completed successfully."));
        let firmware = f.store.device_firmware(device.id).unwrap().unwrap();
        assert!(firmware.installed);
        assert_eq!(firmware.image_id, f.image.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_checksum_aborts_and_marks_installed() {
        let f = fixture();
        let device = add_device(&f.store, Some("openwrt"));
        let checksum = sha256_file(&f.image.file).unwrap();
        f.fleet.insert(
            device.id,
            SimulatedDevice::default().with_checksum("/etc/openwisp/firmware_checksum", &checksum),
        );

        let operation = f.runner.upgrade_device(device.id, f.image.id).await.unwrap();

        assert_eq!(operation.status, UpgradeStatus::Aborted);
        assert!(f.store.device_firmware(device.id).unwrap().unwrap().installed);
        assert!(f.fleet.device(device.id).state().uploads.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_without_connection_fails() {
        let f = fixture();
        let device = add_device(&f.store, None);

        let operation = f.runner.upgrade_device(device.id, f.image.id).await.unwrap();

        assert_eq!(operation.status, UpgradeStatus::Failed);
        assert!(operation.log.ends_with("No device connection available"));
        assert!(!f.store.device_firmware(device.id).unwrap().unwrap().installed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_operation_aborts_newer_one() {
        let f = fixture();
        let device = add_device(&f.store, Some("openwrt"));
        let older = f.store.create_operation(device.id, f.image.id, None).unwrap();
        let newer = f.store.create_operation(device.id, f.image.id, None).unwrap();

        let status = f.runner.run(newer.id).await.unwrap();

        assert_eq!(status, UpgradeStatus::Aborted);
        let stored = f.store.operation(newer.id).unwrap();
        assert!(stored.log.contains("Another upgrade operation is in progress, aborting..."));
        assert_eq!(f.store.operation(older.id).unwrap().status, UpgradeStatus::InProgress);
        assert_eq!(f.fleet.device(device.id).state().connect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_strategy_fails() {
        let f = fixture();
        let device = add_device(&f.store, Some("routeros"));

        let operation = f.runner.upgrade_device(device.id, f.image.id).await.unwrap();

        assert_eq!(operation.status, UpgradeStatus::Failed);
        assert!(operation.log.contains("Unknown update strategy 'routeros'"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_image_keeps_firmware_pending() {
        let f = fixture();
        let device = add_device(&f.store, Some("openwrt"));
        f.fleet.insert(
            device.id,
            SimulatedDevice::new(DeviceBehavior {
                reject_image: true,
                ..DeviceBehavior::default()
            }),
        );

        let operation = f.runner.upgrade_device(device.id, f.image.id).await.unwrap();

        assert_eq!(operation.status, UpgradeStatus::Failed);
        assert!(!f.store.device_firmware(device.id).unwrap().unwrap().installed);
        assert_eq!(f.fleet.device(device.id).state().reflashes, 0);
    }

    #[tokio::test]
    async fn test_board_mismatch_rejected() {
        let f = fixture();
        let device = f.store.add_device("switch", "Ubiquiti EdgeSwitch", None).unwrap();

        let err = f.runner.upgrade_device(device.id, f.image.id).await.unwrap_err();

        assert!(matches!(err, UpgraderError::BoardMismatch { .. }));
        assert!(f.store.device_firmware(device.id).unwrap().is_none());
    }
}
