// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskErrorKind {
    InvalidInput,
    NotFound,
    /// No free block-device node
    Exhausted,
    /// The worker pool spent its retry budget on dead workers
    WorkersDied,
    /// A single worker is no longer usable
    WorkerDead,
    CommandFailed,
    Protocol,
    Timeout,
    Unsupported,
    Unavailable,
    Io,
    /// One or more teardown steps failed; all steps were still run
    Teardown,
    Internal,
}

impl DiskErrorKind {
    pub fn code(self) -> u16 {
        match self {
            Self::InvalidInput => 400,
            Self::NotFound => 404,
            Self::Exhausted => 429,
            Self::WorkersDied => 503,
            Self::WorkerDead => 502,
            Self::CommandFailed => 500,
            Self::Protocol => 502,
            Self::Timeout => 504,
            Self::Unsupported => 501,
            Self::Unavailable => 503,
            Self::Io => 500,
            Self::Teardown => 500,
            Self::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct DiskError {
    pub kind: DiskErrorKind,
    pub message: String,
}

impl DiskError {
    pub fn new(kind: DiskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(DiskErrorKind::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(DiskErrorKind::NotFound, message)
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(DiskErrorKind::Exhausted, message)
    }

    pub fn workers_died(message: impl Into<String>) -> Self {
        Self::new(DiskErrorKind::WorkersDied, message)
    }

    pub fn worker_dead(message: impl Into<String>) -> Self {
        Self::new(DiskErrorKind::WorkerDead, message)
    }

    pub fn command_failed(command: &str, stderr: impl AsRef<str>) -> Self {
        Self::new(
            DiskErrorKind::CommandFailed,
            format!("{command} failed: {}", stderr.as_ref().trim()),
        )
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(DiskErrorKind::Protocol, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DiskErrorKind::Timeout, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(DiskErrorKind::Unsupported, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(DiskErrorKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(DiskErrorKind::Internal, message)
    }

    /// "Try later" conditions, as opposed to broken tooling
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self.kind,
            DiskErrorKind::Exhausted | DiskErrorKind::WorkersDied
        )
    }
}

impl From<std::io::Error> for DiskError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => DiskErrorKind::NotFound,
            std::io::ErrorKind::TimedOut => DiskErrorKind::Timeout,
            _ => DiskErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;
