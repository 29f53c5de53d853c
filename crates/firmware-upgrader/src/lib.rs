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

//! Firmware Upgrader - Remote firmware upgrades for fleets of OpenWrt devices
//!
//! A batch upgrade resolves every device eligible for a build, then drives
//! one upgrade session per device: connect, compare checksums, upload, test
//! the image, reflash from a detached process and confirm the device comes
//! back. Status and log of every operation are persisted as they progress.

pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod inventory;
pub mod log;
pub mod model;
pub mod operation;
pub mod simulator;
pub mod store;
pub mod strategy;
pub mod transport;

pub use config::UpgraderConfig;
pub use coordinator::{BatchCoordinator, BatchReport};
pub use error::{Result, UpgraderError};
pub use operation::OperationRunner;
pub use store::{MemoryStore, SqliteStore, UpgradeStore};
