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

//! In-process simulated devices
//!
//! Understands the handful of shell commands the OpenWrt strategy issues and
//! models a reboot as a number of refused connections after a reflash. Used for
//! dry runs and throughout the test suite.

use crate::model::{Device, DeviceConnection, DeviceId};
use crate::transport::{CommandOutput, Connector, DetachedProcess, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How a simulated device reacts
#[derive(Debug, Clone, Default)]
pub struct DeviceBehavior {
    /// Refuse every connection
    pub unreachable: bool,
    /// Fail every upload
    pub fail_upload: bool,
    /// `sysupgrade --test` rejects the image
    pub reject_image: bool,
    /// Connections refused after a reflash before the device is back
    pub reboot_refusals: u32,
    /// The reflash worker never exits on its own
    pub reflash_hangs: bool,
    /// Reject credentials once the device has been reflashed
    pub reject_auth_after_reboot: bool,
}

#[derive(Debug, Default)]
pub struct DeviceState {
    pub behavior: DeviceBehavior,
    pub files: HashMap<String, String>,
    pub uploads: Vec<String>,
    pub commands: Vec<String>,
    pub connect_attempts: u32,
    pub reflashes: u32,
    pub reflash_terminated: bool,
    pending_refusals: u32,
    rebooted: bool,
    connected: bool,
}

/// Undo shell quoting of a single word
fn unquote(word: &str) -> String {
    let word = word.trim();
    match word.strip_prefix('\'').and_then(|w| w.strip_suffix('\'')) {
        Some(inner) => inner.replace(r"'\''", "'"),
        None => word.to_owned(),
    }
}

impl DeviceState {
    fn run(&mut self, command: &str) -> CommandOutput {
        self.commands.push(command.to_owned());
        let ok = |output: String| CommandOutput {
            output,
            exit_code: 0,
        };

        if let Some(path) = command.strip_prefix("test -f ") {
            let exit_code = i32::from(!self.files.contains_key(&unquote(path)));
            return CommandOutput {
                output: String::new(),
                exit_code,
            };
        }
        if let Some(path) = command.strip_prefix("cat ") {
            let path = unquote(path);
            return match self.files.get(&path) {
                Some(content) => ok(content.clone()),
                None => CommandOutput {
                    output: format!("cat: can't open '{path}': No such file or directory"),
                    exit_code: 1,
                },
            };
        }
        if command.starts_with("mkdir -p ") {
            return ok(String::new());
        }
        if let Some(rest) = command.strip_prefix("sysupgrade --test ") {
            let path = unquote(rest);
            let present = self.uploads.iter().any(|u| *u == path);
            if self.behavior.reject_image || !present {
                return CommandOutput {
                    output: "Image check 'platform_check_image' failed.".to_owned(),
                    exit_code: 1,
                };
            }
            return ok(String::new());
        }
        if let Some(rest) = command.strip_prefix("printf '%s' ")
            && let Some((content, path)) = rest.split_once(" > ")
        {
            self.files.insert(unquote(path), unquote(content));
            return ok(String::new());
        }

        CommandOutput {
            output: format!("sh: {command}: not found"),
            exit_code: 127,
        }
    }
}

/// Handle to one simulated device
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    pub fn new(behavior: DeviceBehavior) -> Self {
        let device = Self::default();
        device.state.lock().behavior = behavior;
        device
    }

    /// Pretend an image with `checksum` is already installed
    pub fn with_checksum(self, checksum_file: &str, checksum: &str) -> Self {
        self.state
            .lock()
            .files
            .insert(checksum_file.to_owned(), checksum.to_owned());
        self
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, DeviceState> {
        self.state.lock()
    }

    pub fn transport(&self, peer: impl Into<String>) -> SimulatedTransport {
        SimulatedTransport {
            device: self.clone(),
            peer: peer.into(),
            occupancy: None,
            open: false,
        }
    }
}

/// Open connections across a fleet
#[derive(Debug, Default)]
struct Occupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct SimulatedTransport {
    device: SimulatedDevice,
    peer: String,
    occupancy: Option<Arc<Occupancy>>,
    open: bool,
}

impl SimulatedTransport {
    fn opened(&mut self) {
        if !self.open {
            self.open = true;
            if let Some(occupancy) = &self.occupancy {
                occupancy.enter();
            }
        }
    }

    fn closed(&mut self) {
        if self.open {
            self.open = false;
            if let Some(occupancy) = &self.occupancy {
                occupancy.leave();
            }
        }
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.closed();
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        {
            let mut state = self.device.state.lock();
            state.connect_attempts += 1;
            if state.behavior.unreachable {
                return Err(TransportError::Refused(self.peer.clone()));
            }
            if state.pending_refusals > 0 {
                state.pending_refusals -= 1;
                return Err(TransportError::Refused(self.peer.clone()));
            }
            if state.rebooted && state.behavior.reject_auth_after_reboot {
                return Err(TransportError::Auth(self.peer.clone()));
            }
            state.connected = true;
        }
        self.opened();
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.device.state.lock().connected = false;
        self.closed();
    }

    async fn exec_command(
        &mut self,
        command: &str,
        exit_codes: &[i32],
    ) -> Result<CommandOutput, TransportError> {
        let mut state = self.device.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        let result = state.run(command);
        if exit_codes.contains(&result.exit_code) {
            Ok(result)
        } else {
            Err(TransportError::Command {
                command: command.to_owned(),
                exit_code: result.exit_code,
                output: result.output,
            })
        }
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        // the local image must be readable even though nothing is transferred
        tokio::fs::metadata(local).await?;
        let mut state = self.device.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.behavior.fail_upload {
            return Err(TransportError::Upload {
                path: remote.to_owned(),
                reason: "No space left on device".to_owned(),
            });
        }
        state.uploads.push(remote.to_owned());
        Ok(())
    }

    fn spawn_detached(&self, command: &str) -> Result<Box<dyn DetachedProcess>, TransportError> {
        let mut state = self.device.state.lock();
        state.commands.push(command.to_owned());
        state.reflashes += 1;
        state.rebooted = true;
        state.connected = false;
        state.pending_refusals = state.behavior.reboot_refusals;
        Ok(Box::new(SimulatedProcess {
            device: self.device.clone(),
            alive: state.behavior.reflash_hangs,
        }))
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

#[derive(Debug)]
struct SimulatedProcess {
    device: SimulatedDevice,
    alive: bool,
}

#[async_trait]
impl DetachedProcess for SimulatedProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait_timeout(&mut self, timeout: Duration) -> bool {
        if self.alive {
            tokio::time::sleep(timeout).await;
        }
        !self.alive
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    async fn terminate(&mut self) {
        self.alive = false;
        self.device.state.lock().reflash_terminated = true;
    }
}

/// A fleet of simulated devices keyed by device id
///
/// Devices that were never registered behave like healthy routers.
#[derive(Debug, Default)]
pub struct SimulatedFleet {
    devices: Mutex<HashMap<DeviceId, SimulatedDevice>>,
    occupancy: Arc<Occupancy>,
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device_id: DeviceId, device: SimulatedDevice) {
        self.devices.lock().insert(device_id, device);
    }

    pub fn device(&self, device_id: DeviceId) -> SimulatedDevice {
        self.devices.lock().entry(device_id).or_default().clone()
    }

    /// Most connections that were open at the same time
    pub fn peak_connections(&self) -> usize {
        self.occupancy.peak.load(Ordering::SeqCst)
    }
}

impl Connector for SimulatedFleet {
    fn transport(&self, device: &Device, connection: &DeviceConnection) -> Box<dyn Transport> {
        let mut transport = self
            .device(device.id)
            .transport(format!("{}:{}", connection.address, connection.port));
        transport.occupancy = Some(self.occupancy.clone());
        Box::new(transport)
    }
}
