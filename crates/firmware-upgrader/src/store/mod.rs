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

//! Persistence of builds, devices and upgrade operations

pub mod memory;
pub mod sqlite;

use crate::error::Result;
use crate::log::{LogLine, LogSink};
use crate::model::{
    BatchId, BatchStatus, BatchSummary, BatchUpgradeOperation, Build, BuildId, Category,
    CategoryId, Device, DeviceConnection, DeviceFirmware, DeviceId, FirmwareImage, ImageId,
    OperationId, UpgradeOperation, UpgradeStatus,
};
use std::path::Path;
use std::sync::Arc;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Backing store used by the coordinator and the upgrade sessions
///
/// `create_batch` must be atomic: it fails with `BatchInProgress` when the
/// build already has a batch in progress, without creating a record.
pub trait UpgradeStore: Send + Sync {
    fn add_category(&self, name: &str, description: &str) -> Result<Category>;
    fn category(&self, id: CategoryId) -> Result<Category>;

    fn add_build(&self, category_id: CategoryId, version: &str, changelog: &str) -> Result<Build>;
    fn build(&self, id: BuildId) -> Result<Build>;

    /// Register an image, inferring its type from the file name when `image_type` is empty
    fn add_image(
        &self,
        build_id: BuildId,
        file: &Path,
        image_type: Option<&str>,
        boards: &[String],
    ) -> Result<FirmwareImage>;
    fn image(&self, id: ImageId) -> Result<FirmwareImage>;
    fn build_images(&self, build_id: BuildId) -> Result<Vec<FirmwareImage>>;

    fn add_device(
        &self,
        name: &str,
        model: &str,
        connection: Option<&DeviceConnection>,
    ) -> Result<Device>;
    fn device(&self, id: DeviceId) -> Result<Device>;
    fn devices(&self) -> Result<Vec<Device>>;

    fn device_firmware(&self, device_id: DeviceId) -> Result<Option<DeviceFirmware>>;
    fn device_firmwares(&self) -> Result<Vec<DeviceFirmware>>;
    fn save_device_firmware(&self, firmware: &DeviceFirmware) -> Result<()>;

    fn create_batch(&self, build_id: BuildId) -> Result<BatchUpgradeOperation>;
    fn batch(&self, id: BatchId) -> Result<BatchUpgradeOperation>;
    fn set_batch_status(&self, id: BatchId, status: BatchStatus) -> Result<()>;

    fn create_operation(
        &self,
        device_id: DeviceId,
        image_id: ImageId,
        batch_id: Option<BatchId>,
    ) -> Result<UpgradeOperation>;
    fn operation(&self, id: OperationId) -> Result<UpgradeOperation>;
    fn batch_operations(&self, batch_id: BatchId) -> Result<Vec<UpgradeOperation>>;
    fn append_operation_log(&self, id: OperationId, line: &str) -> Result<()>;
    fn set_operation_status(&self, id: OperationId, status: UpgradeStatus) -> Result<()>;
    /// Ids of in-progress operations of a device
    fn in_progress_operations(&self, device_id: DeviceId) -> Result<Vec<OperationId>>;

    fn batch_summary(&self, batch_id: BatchId) -> Result<BatchSummary> {
        let operations = self.batch_operations(batch_id)?;
        Ok(BatchSummary::from_statuses(
            operations.iter().map(|o| o.status),
        ))
    }
}

pub(crate) fn resolve_image_type(file: &Path, image_type: Option<&str>) -> Option<String> {
    match image_type {
        Some(t) if !t.is_empty() => Some(t.to_owned()),
        _ => file
            .file_name()
            .and_then(|n| FirmwareImage::infer_type(&n.to_string_lossy())),
    }
}

/// Appends session log lines to the operation record as they are written
pub struct OperationLogSink {
    store: Arc<dyn UpgradeStore>,
    operation_id: OperationId,
}

impl OperationLogSink {
    pub fn new(store: Arc<dyn UpgradeStore>, operation_id: OperationId) -> Self {
        Self {
            store,
            operation_id,
        }
    }
}

impl std::fmt::Debug for OperationLogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationLogSink")
            .field("operation_id", &self.operation_id)
            .finish_non_exhaustive()
    }
}

impl LogSink for OperationLogSink {
    fn append(&self, line: &LogLine) {
        if let Err(e) = self
            .store
            .append_operation_log(self.operation_id, &line.to_string())
        {
            tracing::warn!(
                operation = self.operation_id,
                "Failed to persist log line: {e}"
            );
        }
    }
}
