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

//! JSON inventory import
//!
//! Seeds a store with categories, builds, images and devices. Devices may
//! reference the image they currently run by category, version and image type.

use crate::error::{Result, UpgraderError};
use crate::model::{DeviceConnection, DeviceFirmware, FirmwareImage};
use crate::store::UpgradeStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub categories: Vec<CategoryEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub builds: Vec<BuildEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEntry {
    pub version: String,
    #[serde(default)]
    pub changelog: String,
    #[serde(default)]
    pub images: Vec<ImageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Relative paths are resolved against the inventory file's directory
    pub file: PathBuf,
    /// Inferred from the file name when missing
    #[serde(default, rename = "type")]
    pub image_type: Option<String>,
    #[serde(default)]
    pub boards: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub connection: Option<DeviceConnection>,
    #[serde(default)]
    pub firmware: Option<FirmwareRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareRef {
    pub category: String,
    pub version: String,
    #[serde(rename = "type")]
    pub image_type: String,
    #[serde(default = "default_installed")]
    pub installed: bool,
}

fn default_installed() -> bool {
    true
}

/// Counts of imported records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub categories: usize,
    pub builds: usize,
    pub images: usize,
    pub devices: usize,
}

pub fn load_inventory(path: &Path) -> Result<Inventory> {
    let content = std::fs::read_to_string(path)?;
    let mut inventory: Inventory = serde_json::from_str(&content)?;
    if let Some(base) = path.parent() {
        for image in inventory
            .categories
            .iter_mut()
            .flat_map(|c| c.builds.iter_mut())
            .flat_map(|b| b.images.iter_mut())
        {
            if image.file.is_relative() {
                image.file = base.join(&image.file);
            }
        }
    }
    Ok(inventory)
}

pub fn import_inventory(store: &dyn UpgradeStore, inventory: &Inventory) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    let mut images: HashMap<(&str, &str, String), FirmwareImage> = HashMap::new();

    for entry in &inventory.categories {
        let category = store.add_category(&entry.name, &entry.description)?;
        summary.categories += 1;
        for build_entry in &entry.builds {
            let build = store.add_build(category.id, &build_entry.version, &build_entry.changelog)?;
            summary.builds += 1;
            for image_entry in &build_entry.images {
                let image = store.add_image(
                    build.id,
                    &image_entry.file,
                    image_entry.image_type.as_deref(),
                    &image_entry.boards,
                )?;
                summary.images += 1;
                images.insert(
                    (
                        entry.name.as_str(),
                        build_entry.version.as_str(),
                        image.image_type.clone(),
                    ),
                    image,
                );
            }
        }
    }

    for entry in &inventory.devices {
        let device = store.add_device(&entry.name, &entry.model, entry.connection.as_ref())?;
        summary.devices += 1;
        let Some(firmware) = &entry.firmware else {
            continue;
        };
        let key = (
            firmware.category.as_str(),
            firmware.version.as_str(),
            firmware.image_type.clone(),
        );
        let image = images.get(&key).ok_or_else(|| {
            UpgraderError::Config(format!(
                "device {} references unknown image {} v{} ({})",
                entry.name, firmware.category, firmware.version, firmware.image_type
            ))
        })?;
        store.save_device_firmware(&DeviceFirmware {
            device_id: device.id,
            image_id: image.id,
            installed: firmware.installed,
        })?;
    }

    tracing::info!(
        categories = summary.categories,
        builds = summary.builds,
        images = summary.images,
        devices = summary.devices,
        "Inventory imported"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    const INVENTORY: &str = r#"{
        "categories": [{
            "name": "Routers",
            "builds": [
                {"version": "1.0", "images": [{"file": "v1/openwrt-ath79-wdr4300-sysupgrade.bin", "boards": ["TP-Link WDR4300"]}]},
                {"version": "2.0", "images": [{"file": "/srv/v2/openwrt-ath79-wdr4300-sysupgrade.bin", "boards": ["TP-Link WDR4300"]}]}
            ]
        }],
        "devices": [
            {
                "name": "ap-1",
                "model": "TP-Link WDR4300",
                "connection": {"address": "10.0.0.1", "update_strategy": "openwrt"},
                "firmware": {"category": "Routers", "version": "1.0", "type": "ath79-wdr4300-sysupgrade.bin"}
            },
            {"name": "ap-2", "model": "TP-Link WDR4300"}
        ]
    }"#;

    #[test]
    fn test_import_inventory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.json");
        std::fs::write(&path, INVENTORY).unwrap();

        let inventory = load_inventory(&path).unwrap();
        let images: Vec<_> = inventory.categories[0]
            .builds
            .iter()
            .map(|b| b.images[0].file.clone())
            .collect();
        assert_eq!(images[0], dir.path().join("v1/openwrt-ath79-wdr4300-sysupgrade.bin"));
        assert_eq!(images[1], PathBuf::from("/srv/v2/openwrt-ath79-wdr4300-sysupgrade.bin"));

        let store = MemoryStore::new();
        let summary = import_inventory(&store, &inventory).unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                categories: 1,
                builds: 2,
                images: 2,
                devices: 2,
            }
        );

        let devices = store.devices().unwrap();
        let connection = devices[0].connection.as_ref().unwrap();
        assert_eq!(connection.port, 22);
        assert_eq!(connection.username, "root");
        let firmware = store.device_firmware(devices[0].id).unwrap().unwrap();
        assert!(firmware.installed);
        assert!(store.device_firmware(devices[1].id).unwrap().is_none());
    }

    #[test]
    fn test_unknown_firmware_reference() {
        let inventory: Inventory = serde_json::from_str(
            r#"{"devices": [{"name": "ap", "model": "x", "firmware": {"category": "Routers", "version": "9.9", "type": "x.bin"}}]}"#,
        )
        .unwrap();
        let err = import_inventory(&MemoryStore::new(), &inventory).unwrap_err();
        assert!(matches!(err, UpgraderError::Config(_)));
    }
}
