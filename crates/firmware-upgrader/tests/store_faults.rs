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

//! Batches and operations on top of a store that fails on demand

use firmware_upgrader::config::UpgraderConfig;
use firmware_upgrader::model::{
    BatchId, BatchStatus, BatchUpgradeOperation, Build, BuildId, Category, CategoryId, Device,
    DeviceConnection, DeviceFirmware, DeviceId, FirmwareImage, ImageId, OperationId,
    UpgradeOperation, UpgradeStatus,
};
use firmware_upgrader::simulator::{DeviceBehavior, SimulatedDevice, SimulatedFleet};
use firmware_upgrader::{BatchCoordinator, MemoryStore, Result, UpgradeStore, UpgraderError};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tempfile::TempDir;

const MODEL: &str = "TP-Link WDR4300";

/// Memory store whose reads and writes can be made to fail
#[derive(Debug, Default)]
struct FaultyStore {
    inner: MemoryStore,
    /// Number of upcoming `batch_operations` calls that fail
    failing_batch_reads: AtomicU32,
    fail_installed_flag: AtomicBool,
}

impl FaultyStore {
    fn fault(what: &str) -> UpgraderError {
        UpgraderError::Store(format!("{what}: disk I/O error"))
    }
}

impl UpgradeStore for FaultyStore {
    fn add_category(&self, name: &str, description: &str) -> Result<Category> {
        self.inner.add_category(name, description)
    }

    fn category(&self, id: CategoryId) -> Result<Category> {
        self.inner.category(id)
    }

    fn add_build(&self, category_id: CategoryId, version: &str, changelog: &str) -> Result<Build> {
        self.inner.add_build(category_id, version, changelog)
    }

    fn build(&self, id: BuildId) -> Result<Build> {
        self.inner.build(id)
    }

    fn add_image(
        &self,
        build_id: BuildId,
        file: &Path,
        image_type: Option<&str>,
        boards: &[String],
    ) -> Result<FirmwareImage> {
        self.inner.add_image(build_id, file, image_type, boards)
    }

    fn image(&self, id: ImageId) -> Result<FirmwareImage> {
        self.inner.image(id)
    }

    fn build_images(&self, build_id: BuildId) -> Result<Vec<FirmwareImage>> {
        self.inner.build_images(build_id)
    }

    fn add_device(
        &self,
        name: &str,
        model: &str,
        connection: Option<&DeviceConnection>,
    ) -> Result<Device> {
        self.inner.add_device(name, model, connection)
    }

    fn device(&self, id: DeviceId) -> Result<Device> {
        self.inner.device(id)
    }

    fn devices(&self) -> Result<Vec<Device>> {
        self.inner.devices()
    }

    fn device_firmware(&self, device_id: DeviceId) -> Result<Option<DeviceFirmware>> {
        self.inner.device_firmware(device_id)
    }

    fn device_firmwares(&self) -> Result<Vec<DeviceFirmware>> {
        self.inner.device_firmwares()
    }

    fn save_device_firmware(&self, firmware: &DeviceFirmware) -> Result<()> {
        if firmware.installed && self.fail_installed_flag.load(Ordering::SeqCst) {
            return Err(Self::fault("save_device_firmware"));
        }
        self.inner.save_device_firmware(firmware)
    }

    fn create_batch(&self, build_id: BuildId) -> Result<BatchUpgradeOperation> {
        self.inner.create_batch(build_id)
    }

    fn batch(&self, id: BatchId) -> Result<BatchUpgradeOperation> {
        self.inner.batch(id)
    }

    fn set_batch_status(&self, id: BatchId, status: BatchStatus) -> Result<()> {
        self.inner.set_batch_status(id, status)
    }

    fn create_operation(
        &self,
        device_id: DeviceId,
        image_id: ImageId,
        batch_id: Option<BatchId>,
    ) -> Result<UpgradeOperation> {
        self.inner.create_operation(device_id, image_id, batch_id)
    }

    fn operation(&self, id: OperationId) -> Result<UpgradeOperation> {
        self.inner.operation(id)
    }

    fn batch_operations(&self, batch_id: BatchId) -> Result<Vec<UpgradeOperation>> {
        let failing = self
            .failing_batch_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Self::fault("batch_operations"));
        }
        self.inner.batch_operations(batch_id)
    }

    fn append_operation_log(&self, id: OperationId, line: &str) -> Result<()> {
        self.inner.append_operation_log(id, line)
    }

    fn set_operation_status(&self, id: OperationId, status: UpgradeStatus) -> Result<()> {
        self.inner.set_operation_status(id, status)
    }

    fn in_progress_operations(&self, device_id: DeviceId) -> Result<Vec<OperationId>> {
        self.inner.in_progress_operations(device_id)
    }
}

struct Setup {
    _dir: TempDir,
    store: Arc<FaultyStore>,
    fleet: Arc<SimulatedFleet>,
    coordinator: BatchCoordinator,
    build: Build,
    image: FirmwareImage,
}

fn setup() -> Setup {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("openwrt-ath79-generic-tl-wdr4300-v1-squashfs-sysupgrade.bin");
    std::fs::write(&file, b"firmware 2.0").unwrap();

    let store = Arc::new(FaultyStore::default());
    let category = store.add_category("WiFi Hotspot", "").unwrap();
    let build = store.add_build(category.id, "2.0", "").unwrap();
    let image = store
        .add_image(build.id, &file, None, &[MODEL.to_owned()])
        .unwrap();

    let fleet = Arc::new(SimulatedFleet::new());
    let config = UpgraderConfig::default();
    let coordinator = BatchCoordinator::new(store.clone(), fleet.clone(), &config);
    Setup {
        _dir: dir,
        store,
        fleet,
        coordinator,
        build,
        image,
    }
}

fn add_device(setup: &Setup, name: &str, behavior: DeviceBehavior) -> Device {
    let connection = DeviceConnection {
        address: format!("{name}.lan"),
        port: 22,
        username: "root".to_owned(),
        update_strategy: "openwrt".to_owned(),
    };
    let device = setup
        .store
        .add_device(name, MODEL, Some(&connection))
        .unwrap();
    setup.fleet.insert(device.id, SimulatedDevice::new(behavior));
    device
}

#[tokio::test(start_paused = true)]
async fn test_progress_read_failure_does_not_cancel_sessions() {
    let setup = setup();
    add_device(
        &setup,
        "offline",
        DeviceBehavior {
            unreachable: true,
            ..DeviceBehavior::default()
        },
    );
    let slow = add_device(
        &setup,
        "slow",
        DeviceBehavior {
            reflash_hangs: true,
            ..DeviceBehavior::default()
        },
    );
    // the progress report after the first finished session
    setup.store.failing_batch_reads.store(1, Ordering::SeqCst);

    let report = setup.coordinator.start(setup.build.id, true).await.unwrap();

    assert_eq!(report.status, BatchStatus::Failed);
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.success, 1);
    assert_eq!(report.summary.failed, 1);
    let slow_device = setup.fleet.device(slow.id);
    let state = slow_device.state();
    assert_eq!(state.reflashes, 1);
    assert!(state.reflash_terminated);
    drop(state);

    let operations = setup.store.batch_operations(report.batch_id).unwrap();
    assert!(operations.iter().all(|o| o.status.is_terminal()));
    assert_eq!(
        setup.store.batch(report.batch_id).unwrap().status,
        BatchStatus::Failed
    );

    // the build is not blocked by a batch stuck in progress
    let next = setup.coordinator.start(setup.build.id, true).await.unwrap();
    assert_ne!(next.batch_id, report.batch_id);
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_batch_is_closed_as_failed() {
    let setup = setup();
    add_device(&setup, "ap", DeviceBehavior::default());
    setup.store.failing_batch_reads.store(u32::MAX, Ordering::SeqCst);

    let prepared = setup.coordinator.prepare(setup.build.id, true).unwrap();
    let batch_id = prepared.batch.id;
    let err = setup.coordinator.execute(prepared).await.unwrap_err();

    assert!(matches!(err, UpgraderError::Store(_)));
    assert_eq!(setup.store.batch(batch_id).unwrap().status, BatchStatus::Failed);
    setup.store.failing_batch_reads.store(0, Ordering::SeqCst);
    let operation = setup.store.batch_operations(batch_id).unwrap().remove(0);
    assert_eq!(operation.status, UpgradeStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn test_installed_flag_failure_keeps_device_outcome() {
    let setup = setup();
    let device = add_device(&setup, "ap", DeviceBehavior::default());
    setup.store.fail_installed_flag.store(true, Ordering::SeqCst);

    let operation = setup
        .coordinator
        .runner()
        .upgrade_device(device.id, setup.image.id)
        .await
        .unwrap();

    assert_eq!(operation.status, UpgradeStatus::Success);
    assert!(operation.log.contains("Upgrade completed successfully."));
    assert!(operation.log.contains("Could not mark firmware as installed"));
    assert!(setup.store.in_progress_operations(device.id).unwrap().is_empty());
    let firmware = setup.store.device_firmware(device.id).unwrap().unwrap();
    assert!(!firmware.installed);
    assert_eq!(setup.fleet.device(device.id).state().reflashes, 1);
}
