use std::path::PathBuf;
use thiserror::Error;

use crate::healing::HealingStatus;

/// The central error type for the recovery core.
///
/// Most public entry points deliberately do not surface these errors (see the
/// boundary rules on `decide`, `submit` and the snapshot manager); they exist
/// so internal phases can propagate with `?` and be converted into a FAILED
/// task or a logged warning at the edge.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Healing error: {0}")]
    Healing(#[from] HealingError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum HealingError {
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: HealingStatus, to: HealingStatus },

    #[error("Healing task '{0}' not found")]
    TaskNotFound(String),

    #[error("invalid healing request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("{service} is unavailable")]
    Unavailable { service: String },

    #[error("{service} failed: {message}")]
    Failed { service: String, message: String },

    #[error("{service} timed out after {seconds} seconds")]
    Timeout { service: String, seconds: u64 },

    #[error("Failed to parse {service} response: {message}")]
    Parse { service: String, message: String },
}

impl CollaboratorError {
    pub fn failed(service: &str, message: impl Into<String>) -> Self {
        Self::Failed {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(service: &str, seconds: u64) -> Self {
        Self::Timeout {
            service: service.to_string(),
            seconds,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot storage error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Failed to serialize snapshot: {0}")]
    Serialize(String),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_SNAPSHOT_ERROR: u8 = 3;

/// Determine the appropriate process exit code for an error.
pub fn exit_code(e: &anyhow::Error) -> u8 {
    if let Some(err) = e.downcast_ref::<RecoveryError>() {
        return match err {
            RecoveryError::Config(_) => EXIT_CONFIG_ERROR,
            RecoveryError::Snapshot(_) => EXIT_SNAPSHOT_ERROR,
            _ => EXIT_ERROR,
        };
    }

    if e.downcast_ref::<SnapshotError>().is_some() {
        return EXIT_SNAPSHOT_ERROR;
    }

    // Errors raised through anyhow::Context in the config loader
    let msg = e.to_string().to_lowercase();
    if msg.contains("config") {
        return EXIT_CONFIG_ERROR;
    }

    EXIT_ERROR
}
