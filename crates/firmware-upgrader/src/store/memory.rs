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

//! Volatile store for simulations and tests

use super::{UpgradeStore, resolve_image_type};
use crate::error::{Result, UpgraderError};
use crate::model::{
    BatchId, BatchStatus, BatchUpgradeOperation, Build, BuildId, Category, CategoryId, Device,
    DeviceConnection, DeviceFirmware, DeviceId, FirmwareImage, ImageId, OperationId,
    UpgradeOperation, UpgradeStatus,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    categories: BTreeMap<CategoryId, Category>,
    builds: BTreeMap<BuildId, Build>,
    images: BTreeMap<ImageId, FirmwareImage>,
    devices: BTreeMap<DeviceId, Device>,
    firmwares: BTreeMap<DeviceId, DeviceFirmware>,
    batches: BTreeMap<BatchId, BatchUpgradeOperation>,
    operations: BTreeMap<OperationId, UpgradeOperation>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UpgradeStore for MemoryStore {
    fn add_category(&self, name: &str, description: &str) -> Result<Category> {
        let mut t = self.tables.lock();
        let category = Category {
            id: t.next_id(),
            name: name.to_owned(),
            description: description.to_owned(),
        };
        t.categories.insert(category.id, category.clone());
        Ok(category)
    }

    fn category(&self, id: CategoryId) -> Result<Category> {
        self.tables
            .lock()
            .categories
            .get(&id)
            .cloned()
            .ok_or_else(|| UpgraderError::Store(format!("category {id} not found")))
    }

    fn add_build(&self, category_id: CategoryId, version: &str, changelog: &str) -> Result<Build> {
        let mut t = self.tables.lock();
        if !t.categories.contains_key(&category_id) {
            return Err(UpgraderError::Store(format!(
                "category {category_id} not found"
            )));
        }
        if t
            .builds
            .values()
            .any(|b| b.category_id == category_id && b.version == version)
        {
            return Err(UpgraderError::Store(format!(
                "build {version} already exists in category {category_id}"
            )));
        }
        let build = Build {
            id: t.next_id(),
            category_id,
            version: version.to_owned(),
            changelog: changelog.to_owned(),
        };
        t.builds.insert(build.id, build.clone());
        Ok(build)
    }

    fn build(&self, id: BuildId) -> Result<Build> {
        self.tables
            .lock()
            .builds
            .get(&id)
            .cloned()
            .ok_or(UpgraderError::BuildNotFound(id))
    }

    fn add_image(
        &self,
        build_id: BuildId,
        file: &Path,
        image_type: Option<&str>,
        boards: &[String],
    ) -> Result<FirmwareImage> {
        let image_type = resolve_image_type(file, image_type).ok_or_else(|| {
            UpgraderError::Store(format!(
                "could not determine image type of {}",
                file.display()
            ))
        })?;
        let mut t = self.tables.lock();
        if !t.builds.contains_key(&build_id) {
            return Err(UpgraderError::BuildNotFound(build_id));
        }
        if t
            .images
            .values()
            .any(|i| i.build_id == build_id && i.image_type == image_type)
        {
            return Err(UpgraderError::Store(format!(
                "build {build_id} already has an image of type {image_type}"
            )));
        }
        let image = FirmwareImage {
            id: t.next_id(),
            build_id,
            file: file.to_path_buf(),
            image_type,
            boards: boards.to_vec(),
        };
        t.images.insert(image.id, image.clone());
        Ok(image)
    }

    fn image(&self, id: ImageId) -> Result<FirmwareImage> {
        self.tables
            .lock()
            .images
            .get(&id)
            .cloned()
            .ok_or(UpgraderError::ImageNotFound(id))
    }

    fn build_images(&self, build_id: BuildId) -> Result<Vec<FirmwareImage>> {
        Ok(self
            .tables
            .lock()
            .images
            .values()
            .filter(|i| i.build_id == build_id)
            .cloned()
            .collect())
    }

    fn add_device(
        &self,
        name: &str,
        model: &str,
        connection: Option<&DeviceConnection>,
    ) -> Result<Device> {
        let mut t = self.tables.lock();
        let device = Device {
            id: t.next_id(),
            name: name.to_owned(),
            model: model.to_owned(),
            connection: connection.cloned(),
        };
        t.devices.insert(device.id, device.clone());
        Ok(device)
    }

    fn device(&self, id: DeviceId) -> Result<Device> {
        self.tables
            .lock()
            .devices
            .get(&id)
            .cloned()
            .ok_or(UpgraderError::DeviceNotFound(id))
    }

    fn devices(&self) -> Result<Vec<Device>> {
        Ok(self.tables.lock().devices.values().cloned().collect())
    }

    fn device_firmware(&self, device_id: DeviceId) -> Result<Option<DeviceFirmware>> {
        Ok(self.tables.lock().firmwares.get(&device_id).cloned())
    }

    fn device_firmwares(&self) -> Result<Vec<DeviceFirmware>> {
        Ok(self.tables.lock().firmwares.values().cloned().collect())
    }

    fn save_device_firmware(&self, firmware: &DeviceFirmware) -> Result<()> {
        self.tables
            .lock()
            .firmwares
            .insert(firmware.device_id, firmware.clone());
        Ok(())
    }

    fn create_batch(&self, build_id: BuildId) -> Result<BatchUpgradeOperation> {
        let mut t = self.tables.lock();
        if t
            .batches
            .values()
            .any(|b| b.build_id == build_id && b.status == BatchStatus::InProgress)
        {
            return Err(UpgraderError::BatchInProgress(build_id));
        }
        let now = Utc::now();
        let batch = BatchUpgradeOperation {
            id: t.next_id(),
            build_id,
            status: BatchStatus::InProgress,
            created_at: now,
            modified_at: now,
        };
        t.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    fn batch(&self, id: BatchId) -> Result<BatchUpgradeOperation> {
        self.tables
            .lock()
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| UpgraderError::Store(format!("batch {id} not found")))
    }

    fn set_batch_status(&self, id: BatchId, status: BatchStatus) -> Result<()> {
        let mut t = self.tables.lock();
        let batch = t
            .batches
            .get_mut(&id)
            .ok_or_else(|| UpgraderError::Store(format!("batch {id} not found")))?;
        batch.status = status;
        batch.modified_at = Utc::now();
        Ok(())
    }

    fn create_operation(
        &self,
        device_id: DeviceId,
        image_id: ImageId,
        batch_id: Option<BatchId>,
    ) -> Result<UpgradeOperation> {
        let mut t = self.tables.lock();
        let now = Utc::now();
        let operation = UpgradeOperation {
            id: t.next_id(),
            device_id,
            image_id,
            status: UpgradeStatus::InProgress,
            log: String::new(),
            batch_id,
            created_at: now,
            modified_at: now,
        };
        t.operations.insert(operation.id, operation.clone());
        Ok(operation)
    }

    fn operation(&self, id: OperationId) -> Result<UpgradeOperation> {
        self.tables
            .lock()
            .operations
            .get(&id)
            .cloned()
            .ok_or(UpgraderError::OperationNotFound(id))
    }

    fn batch_operations(&self, batch_id: BatchId) -> Result<Vec<UpgradeOperation>> {
        Ok(self
            .tables
            .lock()
            .operations
            .values()
            .filter(|o| o.batch_id == Some(batch_id))
            .cloned()
            .collect())
    }

    fn append_operation_log(&self, id: OperationId, line: &str) -> Result<()> {
        let mut t = self.tables.lock();
        let operation = t
            .operations
            .get_mut(&id)
            .ok_or(UpgraderError::OperationNotFound(id))?;
        if !operation.log.is_empty() {
            operation.log.push('\n');
        }
        operation.log.push_str(line);
        operation.modified_at = Utc::now();
        Ok(())
    }

    fn set_operation_status(&self, id: OperationId, status: UpgradeStatus) -> Result<()> {
        let mut t = self.tables.lock();
        let operation = t
            .operations
            .get_mut(&id)
            .ok_or(UpgraderError::OperationNotFound(id))?;
        operation.status = status;
        operation.modified_at = Utc::now();
        Ok(())
    }

    fn in_progress_operations(&self, device_id: DeviceId) -> Result<Vec<OperationId>> {
        Ok(self
            .tables
            .lock()
            .operations
            .values()
            .filter(|o| o.device_id == device_id && o.status == UpgradeStatus::InProgress)
            .map(|o| o.id)
            .collect())
    }
}
