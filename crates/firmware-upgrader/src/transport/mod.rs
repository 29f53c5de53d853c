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

//! Device transports
//!
//! Upgrade strategies only see the capabilities below; whether they talk to an
//! OpenSSH client or to the in-process simulator is decided by the `Connector`.

pub mod process;
pub mod ssh;

use crate::model::{Device, DeviceConnection};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused by {0}")]
    Refused(String),

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error("host {0} is unreachable")]
    Unreachable(String),

    #[error("authentication failed for {0}")]
    Auth(String),

    #[error("ssh error: {0}")]
    Ssh(String),

    #[error("not connected")]
    NotConnected,

    #[error("command `{command}` exited with code {exit_code}: {output}")]
    Command {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("command `{command}` did not finish within {timeout_secs}s")]
    CommandTimeout { command: String, timeout_secs: u64 },

    #[error("upload of {path} failed: {reason}")]
    Upload { path: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors expected while a device is rebooting
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Refused(_) | Self::Timeout(_) | Self::Unreachable(_)
        )
    }
}

/// Quote `value` as a single POSIX shell word
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: i32,
}

/// Live connection to one device
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the connection, never fails
    async fn disconnect(&mut self);

    /// Run `command`, failing unless its exit code is one of `exit_codes`
    async fn exec_command(
        &mut self,
        command: &str,
        exit_codes: &[i32],
    ) -> Result<CommandOutput, TransportError>;

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Run `command` on the device from a separate OS process with its own connection
    fn spawn_detached(&self, command: &str) -> Result<Box<dyn DetachedProcess>, TransportError>;

    /// Label used in logs
    fn peer(&self) -> String;
}

/// A worker running outside of the upgrader process
///
/// Only liveness is observable. The outcome of the remote command is inferred
/// from whether the device comes back.
#[async_trait]
pub trait DetachedProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Wait for exit, returns false if still running after `timeout`
    async fn wait_timeout(&mut self, timeout: Duration) -> bool;

    fn is_alive(&mut self) -> bool;

    /// Stop the worker, escalating to SIGKILL if needed
    async fn terminate(&mut self);
}

/// Opens transports for devices
pub trait Connector: Send + Sync {
    fn transport(&self, device: &Device, connection: &DeviceConnection) -> Box<dyn Transport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/fw.bin"), "'/tmp/fw.bin'");
        assert_eq!(shell_quote("/tmp/my fw;reboot.bin"), "'/tmp/my fw;reboot.bin'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_transient_errors() {
        assert!(TransportError::Refused("ap".to_owned()).is_transient());
        assert!(TransportError::Unreachable("ap".to_owned()).is_transient());
        assert!(!TransportError::Auth("ap".to_owned()).is_transient());
        assert!(!TransportError::NotConnected.is_transient());
    }
}
