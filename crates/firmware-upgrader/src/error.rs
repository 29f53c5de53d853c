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

//! Error types for the upgrader crate

use crate::model::{BuildId, DeviceId, ImageId, OperationId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpgraderError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("a batch upgrade for build {0} is already in progress")]
    BatchInProgress(BuildId),

    #[error("build {0} not found")]
    BuildNotFound(BuildId),

    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    #[error("firmware image {0} not found")]
    ImageNotFound(ImageId),

    #[error("upgrade operation {0} not found")]
    OperationNotFound(OperationId),

    #[error("device {device} (model {model}) is not supported by image {image}")]
    BoardMismatch {
        device: DeviceId,
        model: String,
        image: ImageId,
    },
}

pub type Result<T> = std::result::Result<T, UpgraderError>;
