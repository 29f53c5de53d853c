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

//! SQLite backed store
//!
//! The "one in-progress batch per build" rule is a partial unique index, so
//! concurrent triggers cannot both create a batch.

use super::{UpgradeStore, resolve_image_type};
use crate::error::{Result, UpgraderError};
use crate::model::{
    BatchId, BatchStatus, BatchUpgradeOperation, Build, BuildId, Category, CategoryId, Device,
    DeviceConnection, DeviceFirmware, DeviceId, FirmwareImage, ImageId, OperationId,
    UpgradeOperation, UpgradeStatus,
};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{OptionalExtension, Row, params};
use std::path::{Path, PathBuf};

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS categories (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        name         TEXT NOT NULL,
        description  TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE IF NOT EXISTS builds (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        category_id  INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
        version      TEXT NOT NULL,
        changelog    TEXT NOT NULL DEFAULT '',
        created_at   TEXT NOT NULL,
        UNIQUE (category_id, version)
    );

    CREATE TABLE IF NOT EXISTS firmware_images (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        build_id     INTEGER NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
        file         TEXT NOT NULL,
        image_type   TEXT NOT NULL,
        boards       TEXT NOT NULL,
        UNIQUE (build_id, image_type)
    );

    CREATE TABLE IF NOT EXISTS devices (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        name         TEXT NOT NULL,
        model        TEXT NOT NULL,
        connection   TEXT
    );

    CREATE TABLE IF NOT EXISTS device_firmware (
        device_id    INTEGER PRIMARY KEY REFERENCES devices(id) ON DELETE CASCADE,
        image_id     INTEGER NOT NULL REFERENCES firmware_images(id) ON DELETE CASCADE,
        installed    BOOLEAN NOT NULL DEFAULT 0,
        modified_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS batch_operations (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        build_id     INTEGER NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
        status       TEXT NOT NULL,
        created_at   TEXT NOT NULL,
        modified_at  TEXT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_batch_single_in_progress
        ON batch_operations(build_id) WHERE status = 'in-progress';

    CREATE TABLE IF NOT EXISTS upgrade_operations (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id    INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        image_id     INTEGER NOT NULL REFERENCES firmware_images(id) ON DELETE CASCADE,
        status       TEXT NOT NULL,
        log          TEXT NOT NULL DEFAULT '',
        batch_id     INTEGER REFERENCES batch_operations(id) ON DELETE CASCADE,
        created_at   TEXT NOT NULL,
        modified_at  TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_operations_batch
        ON upgrade_operations(batch_id);
    CREATE INDEX IF NOT EXISTS idx_operations_device_status
        ON upgrade_operations(device_id, status);
";

impl ToSql for UpgradeStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for UpgradeStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for BatchStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for BatchStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<FirmwareImage> {
    Ok(FirmwareImage {
        id: row.get(0)?,
        build_id: row.get(1)?,
        file: PathBuf::from(row.get::<_, String>(2)?),
        image_type: row.get(3)?,
        boards: json_column(row, 4)?,
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let connection: Option<String> = row.get(3)?;
    let connection = connection
        .map(|c| serde_json::from_str::<DeviceConnection>(&c))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        model: row.get(2)?,
        connection,
    })
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<UpgradeOperation> {
    Ok(UpgradeOperation {
        id: row.get(0)?,
        device_id: row.get(1)?,
        image_id: row.get(2)?,
        status: row.get(3)?,
        log: row.get(4)?,
        batch_id: row.get(5)?,
        created_at: row.get(6)?,
        modified_at: row.get(7)?,
    })
}

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<BatchUpgradeOperation> {
    Ok(BatchUpgradeOperation {
        id: row.get(0)?,
        build_id: row.get(1)?,
        status: row.get(2)?,
        created_at: row.get(3)?,
        modified_at: row.get(4)?,
    })
}

const IMAGE_COLUMNS: &str = "id, build_id, file, image_type, boards";
const OPERATION_COLUMNS: &str =
    "id, device_id, image_id, status, log, batch_id, created_at, modified_at";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("Database schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl UpgradeStore for SqliteStore {
    fn add_category(&self, name: &str, description: &str) -> Result<Category> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO categories (name, description) VALUES (?1, ?2)",
            params![name, description],
        )?;
        Ok(Category {
            id: conn.last_insert_rowid(),
            name: name.to_owned(),
            description: description.to_owned(),
        })
    }

    fn category(&self, id: CategoryId) -> Result<Category> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, name, description FROM categories WHERE id = ?1",
                [id],
                |row| {
                    Ok(Category {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| UpgraderError::Store(format!("category {id} not found")))
    }

    fn add_build(&self, category_id: CategoryId, version: &str, changelog: &str) -> Result<Build> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO builds (category_id, version, changelog, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![category_id, version, changelog, Utc::now()],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                UpgraderError::Store(format!(
                    "build {version} already exists in category {category_id}"
                ))
            } else {
                e.into()
            }
        })?;
        Ok(Build {
            id: conn.last_insert_rowid(),
            category_id,
            version: version.to_owned(),
            changelog: changelog.to_owned(),
        })
    }

    fn build(&self, id: BuildId) -> Result<Build> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, category_id, version, changelog FROM builds WHERE id = ?1",
                [id],
                |row| {
                    Ok(Build {
                        id: row.get(0)?,
                        category_id: row.get(1)?,
                        version: row.get(2)?,
                        changelog: row.get(3)?,
                    })
                },
            )
            .optional()?
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
        let boards_json = serde_json::to_string(boards)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO firmware_images (build_id, file, image_type, boards)
             VALUES (?1, ?2, ?3, ?4)",
            params![build_id, file.to_string_lossy(), image_type, boards_json],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                UpgraderError::Store(format!(
                    "build {build_id} already has an image of type {image_type} or does not exist"
                ))
            } else {
                e.into()
            }
        })?;
        Ok(FirmwareImage {
            id: conn.last_insert_rowid(),
            build_id,
            file: file.to_path_buf(),
            image_type,
            boards: boards.to_vec(),
        })
    }

    fn image(&self, id: ImageId) -> Result<FirmwareImage> {
        self.conn
            .lock()
            .query_row(
                &format!("SELECT {IMAGE_COLUMNS} FROM firmware_images WHERE id = ?1"),
                [id],
                image_from_row,
            )
            .optional()?
            .ok_or(UpgraderError::ImageNotFound(id))
    }

    fn build_images(&self, build_id: BuildId) -> Result<Vec<FirmwareImage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IMAGE_COLUMNS} FROM firmware_images WHERE build_id = ?1 ORDER BY id"
        ))?;
        let images = stmt
            .query_map([build_id], image_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }

    fn add_device(
        &self,
        name: &str,
        model: &str,
        connection: Option<&DeviceConnection>,
    ) -> Result<Device> {
        let connection_json = connection.map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO devices (name, model, connection) VALUES (?1, ?2, ?3)",
            params![name, model, connection_json],
        )?;
        Ok(Device {
            id: conn.last_insert_rowid(),
            name: name.to_owned(),
            model: model.to_owned(),
            connection: connection.cloned(),
        })
    }

    fn device(&self, id: DeviceId) -> Result<Device> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, name, model, connection FROM devices WHERE id = ?1",
                [id],
                device_from_row,
            )
            .optional()?
            .ok_or(UpgraderError::DeviceNotFound(id))
    }

    fn devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name, model, connection FROM devices ORDER BY id")?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(devices)
    }

    fn device_firmware(&self, device_id: DeviceId) -> Result<Option<DeviceFirmware>> {
        let firmware = self
            .conn
            .lock()
            .query_row(
                "SELECT device_id, image_id, installed FROM device_firmware WHERE device_id = ?1",
                [device_id],
                |row| {
                    Ok(DeviceFirmware {
                        device_id: row.get(0)?,
                        image_id: row.get(1)?,
                        installed: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(firmware)
    }

    fn device_firmwares(&self) -> Result<Vec<DeviceFirmware>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT device_id, image_id, installed FROM device_firmware ORDER BY device_id",
        )?;
        let firmwares = stmt
            .query_map([], |row| {
                Ok(DeviceFirmware {
                    device_id: row.get(0)?,
                    image_id: row.get(1)?,
                    installed: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(firmwares)
    }

    fn save_device_firmware(&self, firmware: &DeviceFirmware) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO device_firmware (device_id, image_id, installed, modified_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device_id) DO UPDATE SET
                image_id = ?2,
                installed = ?3,
                modified_at = ?4",
            params![
                firmware.device_id,
                firmware.image_id,
                firmware.installed,
                Utc::now()
            ],
        )?;
        Ok(())
    }

    fn create_batch(&self, build_id: BuildId) -> Result<BatchUpgradeOperation> {
        let conn = self.conn.lock();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO batch_operations (build_id, status, created_at, modified_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![build_id, BatchStatus::InProgress, now],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                UpgraderError::BatchInProgress(build_id)
            } else {
                e.into()
            }
        })?;
        Ok(BatchUpgradeOperation {
            id: conn.last_insert_rowid(),
            build_id,
            status: BatchStatus::InProgress,
            created_at: now,
            modified_at: now,
        })
    }

    fn batch(&self, id: BatchId) -> Result<BatchUpgradeOperation> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, build_id, status, created_at, modified_at
                 FROM batch_operations WHERE id = ?1",
                [id],
                batch_from_row,
            )
            .optional()?
            .ok_or_else(|| UpgraderError::Store(format!("batch {id} not found")))
    }

    fn set_batch_status(&self, id: BatchId, status: BatchStatus) -> Result<()> {
        let updated = self.conn.lock().execute(
            "UPDATE batch_operations SET status = ?2, modified_at = ?3 WHERE id = ?1",
            params![id, status, Utc::now()],
        )?;
        if updated == 0 {
            return Err(UpgraderError::Store(format!("batch {id} not found")));
        }
        Ok(())
    }

    fn create_operation(
        &self,
        device_id: DeviceId,
        image_id: ImageId,
        batch_id: Option<BatchId>,
    ) -> Result<UpgradeOperation> {
        let conn = self.conn.lock();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO upgrade_operations
                (device_id, image_id, status, log, batch_id, created_at, modified_at)
             VALUES (?1, ?2, ?3, '', ?4, ?5, ?5)",
            params![device_id, image_id, UpgradeStatus::InProgress, batch_id, now],
        )?;
        Ok(UpgradeOperation {
            id: conn.last_insert_rowid(),
            device_id,
            image_id,
            status: UpgradeStatus::InProgress,
            log: String::new(),
            batch_id,
            created_at: now,
            modified_at: now,
        })
    }

    fn operation(&self, id: OperationId) -> Result<UpgradeOperation> {
        self.conn
            .lock()
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM upgrade_operations WHERE id = ?1"),
                [id],
                operation_from_row,
            )
            .optional()?
            .ok_or(UpgraderError::OperationNotFound(id))
    }

    fn batch_operations(&self, batch_id: BatchId) -> Result<Vec<UpgradeOperation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM upgrade_operations WHERE batch_id = ?1 ORDER BY id"
        ))?;
        let operations = stmt
            .query_map([batch_id], operation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    fn append_operation_log(&self, id: OperationId, line: &str) -> Result<()> {
        let updated = self.conn.lock().execute(
            "UPDATE upgrade_operations
             SET log = CASE WHEN log = '' THEN ?2 ELSE log || char(10) || ?2 END,
                 modified_at = ?3
             WHERE id = ?1",
            params![id, line, Utc::now()],
        )?;
        if updated == 0 {
            return Err(UpgraderError::OperationNotFound(id));
        }
        Ok(())
    }

    fn set_operation_status(&self, id: OperationId, status: UpgradeStatus) -> Result<()> {
        let updated = self.conn.lock().execute(
            "UPDATE upgrade_operations SET status = ?2, modified_at = ?3 WHERE id = ?1",
            params![id, status, Utc::now()],
        )?;
        if updated == 0 {
            return Err(UpgraderError::OperationNotFound(id));
        }
        Ok(())
    }

    fn in_progress_operations(&self, device_id: DeviceId) -> Result<Vec<OperationId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM upgrade_operations WHERE device_id = ?1 AND status = ?2 ORDER BY id",
        )?;
        let ids = stmt
            .query_map(params![device_id, UpgradeStatus::InProgress], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded() -> (SqliteStore, Build, FirmwareImage, Device) {
        let store = SqliteStore::open_in_memory().unwrap();
        let category = store.add_category("WiFi Hotspot", "").unwrap();
        let build = store.add_build(category.id, "1.0", "first").unwrap();
        let image = store
            .add_image(
                build.id,
                Path::new("/images/openwrt-ath79-generic-sysupgrade.bin"),
                None,
                &["TP-Link WDR4300".to_owned()],
            )
            .unwrap();
        let device = store
            .add_device(
                "ap-1",
                "TP-Link WDR4300",
                Some(&DeviceConnection {
                    address: "10.0.0.1".to_owned(),
                    port: 22,
                    username: "root".to_owned(),
                    update_strategy: "openwrt".to_owned(),
                }),
            )
            .unwrap();
        (store, build, image, device)
    }

    #[test]
    fn test_records_roundtrip() {
        let (store, build, image, device) = seeded();

        assert_eq!(store.build(build.id).unwrap(), build);
        assert_eq!(store.image(image.id).unwrap(), image);
        assert_eq!(store.build_images(build.id).unwrap(), vec![image.clone()]);
        assert_eq!(store.device(device.id).unwrap(), device);
        assert!(matches!(
            store.build(999),
            Err(UpgraderError::BuildNotFound(999))
        ));
    }

    #[test]
    fn test_partial_index_allows_one_in_progress_batch() {
        let (store, build, _, _) = seeded();

        let batch = store.create_batch(build.id).unwrap();
        assert!(matches!(
            store.create_batch(build.id),
            Err(UpgraderError::BatchInProgress(_))
        ));

        store.set_batch_status(batch.id, BatchStatus::Failed).unwrap();
        let next = store.create_batch(build.id).unwrap();
        assert_ne!(next.id, batch.id);
        assert_eq!(store.batch(batch.id).unwrap().status, BatchStatus::Failed);
    }

    #[test]
    fn test_device_firmware_upsert() {
        let (store, _, image, device) = seeded();
        assert!(store.device_firmware(device.id).unwrap().is_none());

        let mut firmware = DeviceFirmware {
            device_id: device.id,
            image_id: image.id,
            installed: false,
        };
        store.save_device_firmware(&firmware).unwrap();
        firmware.installed = true;
        store.save_device_firmware(&firmware).unwrap();

        assert_eq!(store.device_firmwares().unwrap(), vec![firmware]);
    }

    #[test]
    fn test_operation_status_and_log() {
        let (store, build, image, device) = seeded();
        let batch = store.create_batch(build.id).unwrap();
        let op = store
            .create_operation(device.id, image.id, Some(batch.id))
            .unwrap();

        store.append_operation_log(op.id, "Connecting").unwrap();
        store.append_operation_log(op.id, "Connected").unwrap();
        assert_eq!(store.in_progress_operations(device.id).unwrap(), vec![op.id]);

        store
            .set_operation_status(op.id, UpgradeStatus::Aborted)
            .unwrap();
        let stored = store.operation(op.id).unwrap();
        assert_eq!(stored.log, "Connecting\nConnected");
        assert_eq!(stored.status, UpgradeStatus::Aborted);
        assert_eq!(stored.batch_id, Some(batch.id));

        let summary = store.batch_summary(batch.id).unwrap();
        assert_eq!(summary.aborted, 1);
        assert_eq!(summary.progress_report(), "1 out of 1");
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("upgrader.db");
        let store = SqliteStore::open(&path).unwrap();
        store.add_category("Routers", "").unwrap();
        assert!(path.exists());
    }
}
