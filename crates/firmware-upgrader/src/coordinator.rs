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

//! Batch upgrades of every device eligible for a build
//!
//! A batch is created atomically (at most one in progress per build), then
//! one session per target runs with bounded concurrency. The batch status is
//! only decided once every session has reported back.

use crate::config::UpgraderConfig;
use crate::error::{Result, UpgraderError};
use crate::model::{
    BatchId, BatchStatus, BatchSummary, BatchUpgradeOperation, BuildId, Device, DeviceFirmware,
    DeviceId, FirmwareImage, OperationId, UpgradeStatus,
};
use crate::operation::OperationRunner;
use crate::store::UpgradeStore;
use crate::strategy::SessionSettings;
use crate::transport::Connector;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// A device and the image it should be flashed with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub device: Device,
    pub image: FirmwareImage,
}

/// A batch whose operations were created but not run yet
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub batch: BatchUpgradeOperation,
    pub operations: Vec<OperationId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub summary: BatchSummary,
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch {}: {} ({}, success {}, failed {}, aborted {})",
            self.batch_id,
            self.status,
            self.summary.progress_report(),
            self.summary.success_rate(),
            self.summary.failed_rate(),
            self.summary.aborted_rate()
        )
    }
}

pub struct BatchCoordinator {
    store: Arc<dyn UpgradeStore>,
    runner: OperationRunner,
    max_concurrent_sessions: usize,
}

impl fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("runner", &self.runner)
            .field("max_concurrent_sessions", &self.max_concurrent_sessions)
            .finish_non_exhaustive()
    }
}

impl BatchCoordinator {
    pub fn new(
        store: Arc<dyn UpgradeStore>,
        connector: Arc<dyn Connector>,
        config: &UpgraderConfig,
    ) -> Self {
        let runner = OperationRunner::new(store.clone(), connector, SessionSettings::from(config));
        Self {
            store,
            runner,
            max_concurrent_sessions: config.max_concurrent_sessions.max(1),
        }
    }

    pub fn runner(&self) -> &OperationRunner {
        &self.runner
    }

    /// Devices a batch for `build_id` would upgrade
    ///
    /// Related devices run an image of the build's category and have an
    /// image of the same type in the build, unless that image is already
    /// installed. Firmwareless devices have no assignment at all and a model
    /// listed in the boards of one of the build's images.
    pub fn resolve_targets(
        &self,
        build_id: BuildId,
        include_firmwareless: bool,
    ) -> Result<Vec<Target>> {
        let build = self.store.build(build_id)?;
        let images = self.store.build_images(build_id)?;
        let firmwares = self.store.device_firmwares()?;

        let mut targets = Vec::new();
        for firmware in &firmwares {
            let current = match self.store.image(firmware.image_id) {
                Ok(image) => image,
                Err(UpgraderError::ImageNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if current.build_id == build_id && firmware.installed {
                continue;
            }
            if self.store.build(current.build_id)?.category_id != build.category_id {
                continue;
            }
            let Some(image) = images.iter().find(|i| i.image_type == current.image_type) else {
                continue;
            };
            targets.push(Target {
                device: self.store.device(firmware.device_id)?,
                image: image.clone(),
            });
        }

        if include_firmwareless {
            let assigned: HashSet<DeviceId> = firmwares.iter().map(|f| f.device_id).collect();
            for device in self.store.devices()? {
                if assigned.contains(&device.id) {
                    continue;
                }
                if let Some(image) = images.iter().find(|i| i.supports(&device.model)) {
                    targets.push(Target {
                        device,
                        image: image.clone(),
                    });
                }
            }
        }

        Ok(targets)
    }

    /// Create the batch and its operations
    ///
    /// Fails with `BatchInProgress` without touching anything when the build
    /// already has a running batch. A batch without targets is completed
    /// right away.
    pub fn prepare(&self, build_id: BuildId, include_firmwareless: bool) -> Result<PreparedBatch> {
        let targets = self.resolve_targets(build_id, include_firmwareless)?;
        let build = self.store.build(build_id)?;
        let label = match self.store.category(build.category_id) {
            Ok(category) => build.label(&category),
            Err(_) => format!("build {build_id}"),
        };
        let batch = self.store.create_batch(build_id)?;
        info!(
            batch = batch.id,
            build = build_id,
            targets = targets.len(),
            "Batch upgrade of {label} created"
        );

        if targets.is_empty() {
            self.store.set_batch_status(batch.id, BatchStatus::Success)?;
            let batch = self.store.batch(batch.id)?;
            return Ok(PreparedBatch {
                batch,
                operations: Vec::new(),
            });
        }

        match self.create_operations(batch.id, &targets) {
            Ok(operations) => Ok(PreparedBatch { batch, operations }),
            Err(e) => {
                self.close_failed(batch.id);
                Err(e)
            }
        }
    }

    /// Best effort, so the build is not left with a batch stuck in progress
    fn close_failed(&self, batch_id: BatchId) {
        if let Err(e) = self.store.set_batch_status(batch_id, BatchStatus::Failed) {
            warn!(batch = batch_id, "Failed to close batch: {e}");
        }
    }

    fn create_operations(&self, batch_id: BatchId, targets: &[Target]) -> Result<Vec<OperationId>> {
        let mut operations = Vec::with_capacity(targets.len());
        for target in targets {
            self.store.save_device_firmware(&DeviceFirmware {
                device_id: target.device.id,
                image_id: target.image.id,
                installed: false,
            })?;
            let operation =
                self.store
                    .create_operation(target.device.id, target.image.id, Some(batch_id))?;
            operations.push(operation.id);
        }
        Ok(operations)
    }

    /// Run the operations of a prepared batch and decide its final status
    pub async fn execute(&self, prepared: PreparedBatch) -> Result<BatchReport> {
        let batch_id = prepared.batch.id;
        if prepared.batch.status != BatchStatus::InProgress {
            return Ok(BatchReport {
                batch_id,
                status: prepared.batch.status,
                summary: self.store.batch_summary(batch_id)?,
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_sessions));
        let mut sessions = JoinSet::new();
        for operation_id in prepared.operations {
            let runner = self.runner.clone();
            let semaphore = semaphore.clone();
            sessions.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (operation_id, runner.run(operation_id).await)
            });
        }

        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok((operation_id, Ok(status))) => {
                    debug!(batch = batch_id, operation = operation_id, %status, "Session finished");
                }
                Ok((operation_id, Err(e))) => {
                    error!(batch = batch_id, operation = operation_id, "Session error: {e}");
                }
                Err(e) => error!(batch = batch_id, "Session task aborted: {e}"),
            }
            // sessions keep running whatever happens to the progress report
            match self.store.batch_summary(batch_id) {
                Ok(summary) => {
                    info!(batch = batch_id, "Batch progress: {}", summary.progress_report());
                }
                Err(e) => warn!(batch = batch_id, "Could not read batch progress: {e}"),
            }
        }

        if let Err(e) = self.fail_unfinished(batch_id) {
            warn!(batch = batch_id, "Could not fail unfinished operations: {e}");
        }
        let summary = match self.store.batch_summary(batch_id) {
            Ok(summary) => summary,
            Err(e) => {
                self.close_failed(batch_id);
                return Err(e);
            }
        };
        let status = summary.terminal_status().unwrap_or(BatchStatus::Failed);
        self.store.set_batch_status(batch_id, status)?;

        let report = BatchReport {
            batch_id,
            status,
            summary,
        };
        match status {
            BatchStatus::Failed => warn!(batch = batch_id, "Batch upgrade finished: {report}"),
            BatchStatus::InProgress | BatchStatus::Success => {
                info!(batch = batch_id, "Batch upgrade finished: {report}");
            }
        }
        Ok(report)
    }

    /// Operations whose session died without a verdict are failed
    fn fail_unfinished(&self, batch_id: BatchId) -> Result<()> {
        for operation in self.store.batch_operations(batch_id)? {
            if operation.status.is_terminal() {
                continue;
            }
            self.store
                .append_operation_log(operation.id, "Upgrade session terminated unexpectedly")?;
            self.store
                .set_operation_status(operation.id, UpgradeStatus::Failed)?;
        }
        Ok(())
    }

    /// Prepare and run a batch, returning once every session is done
    pub async fn start(&self, build_id: BuildId, include_firmwareless: bool) -> Result<BatchReport> {
        let prepared = self.prepare(build_id, include_firmwareless)?;
        self.execute(prepared).await
    }

    /// Prepare a batch and run it in the background
    ///
    /// Conflicts are reported immediately; the returned handle resolves to
    /// the final report.
    pub fn dispatch(
        self: &Arc<Self>,
        build_id: BuildId,
        include_firmwareless: bool,
    ) -> Result<(BatchId, JoinHandle<Result<BatchReport>>)> {
        let prepared = self.prepare(build_id, include_firmwareless)?;
        let batch_id = prepared.batch.id;
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move { coordinator.execute(prepared).await });
        Ok((batch_id, handle))
    }
}
