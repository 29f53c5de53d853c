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

//! Detached worker processes backed by real OS children

use super::DetachedProcess;
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::process::Child;

const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    label: String,
}

impl ChildProcess {
    pub fn new(child: Child, label: impl Into<String>) -> Self {
        let label = label.into();
        tracing::debug!("Spawned worker {label} with PID {:?}", child.id());
        Self { child, label }
    }
}

#[async_trait]
impl DetachedProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait_timeout(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("Worker {} exited with {status}", self.label);
                true
            }
            Ok(Err(e)) => {
                tracing::warn!("Error waiting for worker {}: {e}", self.label);
                true
            }
            Err(_) => false,
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM, then SIGKILL after a grace period
    async fn terminate(&mut self) {
        let Some(raw_pid) = self.child.id() else {
            return;
        };
        tracing::warn!("Terminating worker {} (PID {raw_pid})", self.label);

        if let Ok(pid) = i32::try_from(raw_pid)
            && let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        {
            tracing::warn!("Failed to send SIGTERM: {e}");
        }

        if self.wait_timeout(GRACEFUL_TIMEOUT).await {
            return;
        }

        tracing::warn!("Worker {} did not stop gracefully, killing", self.label);
        if let Err(e) = self.child.kill().await {
            tracing::warn!("Failed to kill worker {}: {e}", self.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn(script: &str) -> ChildProcess {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        ChildProcess::new(child, "test")
    }

    #[tokio::test]
    async fn test_finished_worker() {
        let mut worker = spawn("exit 0");
        assert!(worker.wait_timeout(Duration::from_secs(5)).await);
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn test_hung_worker_is_terminated() {
        let mut worker = spawn("sleep 60");
        assert!(!worker.wait_timeout(Duration::from_millis(100)).await);
        assert!(worker.is_alive());

        worker.terminate().await;
        assert!(!worker.is_alive());
    }
}
