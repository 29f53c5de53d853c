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

//! Transport over the system OpenSSH client
//!
//! `connect` starts a control master, later commands and uploads are
//! multiplexed over its socket. Detached commands open their own connection so
//! they survive the master being closed.

use super::process::ChildProcess;
use super::{CommandOutput, Connector, DetachedProcess, Transport, TransportError, shell_quote};
use crate::config::SshSettings;
use crate::model::{Device, DeviceConnection};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Exit code used by ssh for its own failures
const SSH_ERROR_EXIT: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshConnector {
    settings: SshSettings,
    command_timeout: Duration,
}

impl SshConnector {
    pub fn new(settings: SshSettings, command_timeout: Duration) -> Self {
        Self {
            settings,
            command_timeout,
        }
    }
}

impl Connector for SshConnector {
    fn transport(&self, device: &Device, connection: &DeviceConnection) -> Box<dyn Transport> {
        Box::new(SshTransport::new(
            self.settings.clone(),
            connection.clone(),
            device.id,
            self.command_timeout,
        ))
    }
}

#[derive(Debug)]
pub struct SshTransport {
    settings: SshSettings,
    connection: DeviceConnection,
    control_path: PathBuf,
    command_timeout: Duration,
    connected: bool,
}

impl SshTransport {
    pub fn new(
        settings: SshSettings,
        connection: DeviceConnection,
        device_id: i64,
        command_timeout: Duration,
    ) -> Self {
        let control_path = settings.control_dir.join(format!("device-{device_id}.sock"));
        Self {
            settings,
            connection,
            control_path,
            command_timeout,
            connected: false,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.connection.username, self.connection.address)
    }

    fn common_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
        ];
        if !self.settings.strict_host_key_checking {
            // host keys are regenerated when a device is reflashed
            options.extend([
                "-o".to_owned(),
                "StrictHostKeyChecking=no".to_owned(),
                "-o".to_owned(),
                "UserKnownHostsFile=/dev/null".to_owned(),
            ]);
        }
        if let Some(identity) = &self.settings.identity_file {
            options.push("-i".to_owned());
            options.push(identity.display().to_string());
        }
        options
    }

    fn ssh(&self) -> Command {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(self.common_options())
            .arg("-p")
            .arg(self.connection.port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn control_option(&self) -> String {
        format!("ControlPath={}", self.control_path.display())
    }

    async fn run(&self, mut cmd: Command, label: &str) -> Result<std::process::Output, TransportError> {
        let timeout_secs = self.command_timeout.as_secs();
        match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(TransportError::CommandTimeout {
                command: label.to_owned(),
                timeout_secs,
            }),
        }
    }
}

/// Map ssh diagnostics to transport errors
fn classify_ssh_error(peer: &str, stderr: &str) -> TransportError {
    let lower = stderr.to_lowercase();
    if lower.contains("connection refused") {
        TransportError::Refused(peer.to_owned())
    } else if lower.contains("timed out") {
        TransportError::Timeout(peer.to_owned())
    } else if lower.contains("no route to host")
        || lower.contains("network is unreachable")
        || lower.contains("could not resolve hostname")
        || lower.contains("connection reset")
        || lower.contains("connection closed")
    {
        TransportError::Unreachable(peer.to_owned())
    } else if lower.contains("permission denied") || lower.contains("host key verification failed")
    {
        TransportError::Auth(peer.to_owned())
    } else {
        TransportError::Ssh(stderr.trim().to_owned())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.settings.control_dir).await?;
        // stale socket from an interrupted run
        if self.control_path.exists() {
            let _ = tokio::fs::remove_file(&self.control_path).await;
        }

        let mut cmd = self.ssh();
        cmd.arg("-M")
            .arg("-N")
            .arg("-f")
            .arg("-o")
            .arg("ControlMaster=yes")
            .arg("-o")
            .arg(self.control_option())
            .arg(self.destination())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        tracing::debug!("Opening SSH control master to {}", self.peer());
        let output = self.run(cmd, "ssh -M").await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_ssh_error(&self.peer(), &stderr));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        let mut cmd = self.ssh();
        cmd.arg("-o")
            .arg(self.control_option())
            .arg("-O")
            .arg("exit")
            .arg(self.destination());
        match self.run(cmd, "ssh -O exit").await {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::debug!(
                "Closing control master for {} returned {}",
                self.peer(),
                output.status
            ),
            Err(e) => tracing::warn!("Failed to close control master for {}: {e}", self.peer()),
        }
    }

    async fn exec_command(
        &mut self,
        command: &str,
        exit_codes: &[i32],
    ) -> Result<CommandOutput, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let mut cmd = self.ssh();
        cmd.arg("-o")
            .arg(self.control_option())
            .arg("-o")
            .arg("ControlMaster=no")
            .arg(self.destination())
            .arg("--")
            .arg(command);

        let output = self.run(cmd, command).await?;
        let exit_code = output.status.code().unwrap_or(SSH_ERROR_EXIT);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if exit_code == SSH_ERROR_EXIT && !exit_codes.contains(&SSH_ERROR_EXIT) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_ssh_error(&self.peer(), &stderr));
        }
        if !exit_codes.contains(&exit_code) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::Command {
                command: command.to_owned(),
                exit_code,
                output: format!("{stdout}{stderr}").trim().to_owned(),
            });
        }

        Ok(CommandOutput {
            output: stdout,
            exit_code,
        })
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let mut cmd = Command::new(&self.settings.scp_binary);
        // -O: legacy protocol, dropbear usually ships without an sftp server
        cmd.arg("-O")
            .args(self.common_options())
            .arg("-o")
            .arg(self.control_option())
            .arg("-P")
            .arg(self.connection.port.to_string())
            .arg(local)
            .arg(format!("{}:{}", self.destination(), shell_quote(remote)))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = self.run(cmd, "scp").await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TransportError::Upload {
                path: remote.to_owned(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }

    fn spawn_detached(&self, command: &str) -> Result<Box<dyn DetachedProcess>, TransportError> {
        let mut cmd = self.ssh();
        cmd.arg("-o")
            .arg("ControlPath=none")
            .arg(self.destination())
            .arg("--")
            .arg(command)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = cmd.spawn()?;
        Ok(Box::new(ChildProcess::new(
            child,
            format!("`{command}` on {}", self.peer()),
        )))
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.connection.address, self.connection.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> SshTransport {
        SshTransport::new(
            SshSettings::default(),
            DeviceConnection {
                address: "10.0.0.1".to_owned(),
                port: 2222,
                username: "root".to_owned(),
                update_strategy: "openwrt".to_owned(),
            },
            7,
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_classify_ssh_errors() {
        let peer = "10.0.0.1:22";
        assert!(matches!(
            classify_ssh_error(peer, "ssh: connect to host 10.0.0.1 port 22: Connection refused"),
            TransportError::Refused(_)
        ));
        assert!(matches!(
            classify_ssh_error(peer, "ssh: connect to host 10.0.0.1 port 22: Connection timed out"),
            TransportError::Timeout(_)
        ));
        assert!(matches!(
            classify_ssh_error(peer, "ssh: connect to host 10.0.0.1 port 22: No route to host"),
            TransportError::Unreachable(_)
        ));
        assert!(matches!(
            classify_ssh_error(peer, "root@10.0.0.1: Permission denied (publickey)."),
            TransportError::Auth(_)
        ));
        assert!(matches!(
            classify_ssh_error(peer, "something else"),
            TransportError::Ssh(_)
        ));
    }

    #[test]
    fn test_transient_errors() {
        assert!(TransportError::Refused("x".to_owned()).is_transient());
        assert!(TransportError::Timeout("x".to_owned()).is_transient());
        assert!(!TransportError::Auth("x".to_owned()).is_transient());
        assert!(!TransportError::NotConnected.is_transient());
    }

    #[test]
    fn test_destination_and_control_path() {
        let t = transport();
        assert_eq!(t.destination(), "root@10.0.0.1");
        assert_eq!(t.peer(), "10.0.0.1:2222");
        assert!(t.control_path.ends_with("device-7.sock"));
    }

    #[test]
    fn test_host_key_checking_disabled_by_default() {
        let options = transport().common_options();
        assert!(options.iter().any(|o| o == "StrictHostKeyChecking=no"));
        assert!(!options.iter().any(|o| o == "-i"));
    }

    #[tokio::test]
    async fn test_exec_requires_connection() {
        let mut t = transport();
        let err = t.exec_command("true", &[0]).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
