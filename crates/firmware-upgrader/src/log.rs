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

//! Per-operation audit log
//!
//! Every upgrade session owns one `UpgradeLog`. Lines are pushed to an optional
//! sink as soon as they are written so an in-progress operation can be inspected.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.at.format("%Y-%m-%d %H:%M:%S"), self.message)
    }
}

/// Receives log lines while a session is running
pub trait LogSink: Send + Sync {
    fn append(&self, line: &LogLine);
}

#[derive(Default)]
pub struct UpgradeLog {
    lines: Vec<LogLine>,
    sink: Option<Arc<dyn LogSink>>,
}

impl fmt::Debug for UpgradeLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeLog")
            .field("lines", &self.lines)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl UpgradeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
        Self {
            lines: Vec::new(),
            sink: Some(sink),
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        let line = LogLine {
            at: Utc::now(),
            message: message.into(),
        };
        tracing::debug!("# {}", line.message);
        if let Some(sink) = &self.sink {
            sink.append(&line);
        }
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.message.contains(needle))
    }

    /// Full text as persisted on the operation
    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
