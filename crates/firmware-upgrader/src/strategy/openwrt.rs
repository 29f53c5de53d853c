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

//! OpenWrt upgrades through `sysupgrade`
//!
//! connect -> checksum check -> upload -> `sysupgrade --test` -> reflash in a
//! detached worker -> reconnect and record the new checksum.

use super::{SessionError, SessionOutcome, SessionSettings, SessionState, UpgradeStrategy};
use crate::checksum::sha256_file_async;
use crate::log::UpgradeLog;
use crate::model::FirmwareImage;
use crate::transport::{Transport, TransportError, shell_quote};
use async_trait::async_trait;
use std::path::Path;
use tokio::time::sleep;

enum Halt {
    AlreadyUpToDate,
    Failed(SessionError),
}

impl From<SessionError> for Halt {
    fn from(e: SessionError) -> Self {
        Self::Failed(e)
    }
}

type Step = Result<SessionState, Halt>;

#[derive(Debug, Clone)]
pub struct OpenWrt {
    settings: SessionSettings,
}

impl OpenWrt {
    pub fn new(settings: SessionSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl UpgradeStrategy for OpenWrt {
    fn name(&self) -> &'static str {
        "openwrt"
    }

    async fn upgrade(
        &self,
        transport: &mut dyn Transport,
        image: &FirmwareImage,
        log: &mut UpgradeLog,
    ) -> SessionOutcome {
        let remote_path = Path::new(&self.settings.remote_upload_dir)
            .join(image.file_name())
            .display()
            .to_string();
        let session = Session {
            settings: &self.settings,
            transport,
            image,
            log,
            remote_path,
            checksum: None,
        };
        session.run().await
    }
}

struct Session<'a> {
    settings: &'a SessionSettings,
    transport: &'a mut dyn Transport,
    image: &'a FirmwareImage,
    log: &'a mut UpgradeLog,
    remote_path: String,
    checksum: Option<String>,
}

impl Session<'_> {
    async fn run(mut self) -> SessionOutcome {
        let peer = self.transport.peer();
        let mut state = SessionState::Connecting;
        loop {
            tracing::debug!(%peer, %state, "Upgrade session step");
            let step = match state {
                SessionState::Connecting => self.connect().await,
                SessionState::ChecksumCheck => self.compare_checksum().await,
                SessionState::Uploading => self.upload().await,
                SessionState::Testing => self.test_image().await,
                SessionState::Reflashing => self.reflash().await,
                SessionState::Reconnecting => self.reconnect().await,
                SessionState::Confirmed => return SessionOutcome::Success,
            };
            state = match step {
                Ok(next) => next,
                Err(Halt::AlreadyUpToDate) => {
                    self.transport.disconnect().await;
                    return SessionOutcome::Aborted;
                }
                Err(Halt::Failed(e)) => {
                    self.log.push(e.to_string());
                    self.transport.disconnect().await;
                    if matches!(e, SessionError::UnreachableAfterUpgrade { .. }) {
                        tracing::error!(%peer, "Device unreachable after reflash: {e}");
                    } else {
                        tracing::warn!(%peer, "Upgrade failed: {e}");
                    }
                    return SessionOutcome::Failed(e);
                }
            };
        }
    }

    fn transport_error(step: SessionState) -> impl FnOnce(TransportError) -> Halt {
        move |source| Halt::Failed(SessionError::Transport { step, source })
    }

    async fn connect(&mut self) -> Step {
        self.log
            .push(format!("Connecting to device {}...", self.transport.peer()));
        self.transport
            .connect()
            .await
            .map_err(Self::transport_error(SessionState::Connecting))?;
        self.log.push("Connection established");
        Ok(SessionState::ChecksumCheck)
    }

    async fn compare_checksum(&mut self) -> Step {
        let checksum = sha256_file_async(self.image.file.clone())
            .await
            .map_err(SessionError::LocalImage)?;
        self.log.push(format!("Image checksum: {checksum}"));

        let checksum_file = shell_quote(&self.settings.checksum_file);
        let test = self
            .transport
            .exec_command(&format!("test -f {checksum_file}"), &[0, 1])
            .await
            .map_err(Self::transport_error(SessionState::ChecksumCheck))?;

        if test.exit_code == 0 {
            self.log.push("Image checksum file found");
            let current = self
                .transport
                .exec_command(&format!("cat {checksum_file}"), &[0])
                .await
                .map_err(Self::transport_error(SessionState::ChecksumCheck))?;
            if current.output.trim() == checksum {
                self.log.push(
                    "Firmware already upgraded previously. Identical checksum found in the \
                     filesystem, no need to upgrade, aborting operation...",
                );
                return Err(Halt::AlreadyUpToDate);
            }
            self.log
                .push("Checksum different, proceeding with the upload of the new image...");
        } else {
            self.log
                .push("Image checksum file not found, proceeding with the upload of the new image...");
        }

        self.checksum = Some(checksum);
        Ok(SessionState::Uploading)
    }

    async fn upload(&mut self) -> Step {
        self.log.push(format!(
            "Uploading {} to {}...",
            self.image.file.display(),
            self.remote_path
        ));
        self.transport
            .upload(&self.image.file, &self.remote_path)
            .await
            .map_err(Self::transport_error(SessionState::Uploading))?;
        self.log.push("Upload completed");
        Ok(SessionState::Testing)
    }

    async fn test_image(&mut self) -> Step {
        let command = format!("sysupgrade --test {}", shell_quote(&self.remote_path));
        match self.transport.exec_command(&command, &[0]).await {
            Ok(_) => {
                self.log.push(
                    "Sysupgrade test passed successfully, proceeding with the upgrade operation...",
                );
                Ok(SessionState::Reflashing)
            }
            Err(TransportError::Command { output, exit_code, .. }) => {
                let detail = if output.is_empty() {
                    format!("exit code {exit_code}")
                } else {
                    output
                };
                Err(SessionError::ImageRejected(detail).into())
            }
            Err(e) => Err(Self::transport_error(SessionState::Testing)(e)),
        }
    }

    /// Flash from a detached worker, the connection may hang while the device reboots
    async fn reflash(&mut self) -> Step {
        let settings = self.settings;
        let timings = &settings.timings;
        self.transport.disconnect().await;

        let command = format!("sysupgrade -v -c {}", shell_quote(&self.remote_path));
        let mut worker = self
            .transport
            .spawn_detached(&command)
            .map_err(Self::transport_error(SessionState::Reflashing))?;
        tracing::debug!(
            peer = %self.transport.peer(),
            pid = ?worker.id(),
            "Reflash worker started"
        );
        self.log.push("Upgrade operation in progress...");

        if !worker.wait_timeout(timings.upgrade_timeout()).await {
            self.log.push(format!(
                "Upgrade command still running after {} seconds",
                timings.upgrade_timeout_secs
            ));
        }
        self.log.push(format!(
            "SSH connection closed, will wait {} seconds before attempting to reconnect...",
            timings.settle_delay_secs
        ));
        sleep(timings.settle_delay()).await;

        if worker.is_alive() {
            worker.terminate().await;
            self.log.push("Upgrade process was hanging and has been terminated");
        }
        Ok(SessionState::Reconnecting)
    }

    async fn reconnect(&mut self) -> Step {
        let settings = self.settings;
        let timings = &settings.timings;
        let attempts = timings.reconnect_attempts;

        for attempt in 1..=attempts {
            self.log
                .push(format!("Trying to reconnect to device (attempt n.{attempt})..."));
            match self.transport.connect().await {
                Ok(()) => return self.record_checksum().await,
                Err(e) if e.is_transient() => {
                    if attempt < attempts {
                        self.log.push(format!(
                            "Device not reachable yet, retrying in {} seconds...",
                            timings.retry_delay_secs
                        ));
                        sleep(timings.retry_delay()).await;
                    }
                }
                Err(e) => return Err(Self::transport_error(SessionState::Reconnecting)(e)),
            }
        }

        self.log
            .push("Giving up, device not reachable anymore after upgrade");
        Err(SessionError::UnreachableAfterUpgrade { attempts }.into())
    }

    async fn record_checksum(&mut self) -> Step {
        let settings = self.settings;
        let checksum_file = &settings.checksum_file;
        self.log
            .push(format!("Connected! Writing checksum file to {checksum_file}"));

        let checksum = self.checksum.clone().unwrap_or_default();
        let dir = Path::new(checksum_file)
            .parent()
            .map_or_else(|| "/".to_owned(), |p| p.display().to_string());
        self.transport
            .exec_command(&format!("mkdir -p {}", shell_quote(&dir)), &[0])
            .await
            .map_err(Self::transport_error(SessionState::Confirmed))?;
        let command = format!(
            "printf '%s' {} > {}",
            shell_quote(&checksum),
            shell_quote(checksum_file)
        );
        self.transport
            .exec_command(&command, &[0])
            .await
            .map_err(Self::transport_error(SessionState::Confirmed))?;
        self.transport.disconnect().await;

        self.log.push("Upgrade completed successfully.");
        Ok(SessionState::Confirmed)
    }
}
