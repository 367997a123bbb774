//! External collaborator interfaces
//!
//! The recovery core drives several slow, unreliable services it does not
//! own: an AI diagnostic engine, an isolated sandbox, an independent auditor,
//! a key/value store, an inter-agent bus and the host's process control. Each
//! one is an async trait so the host can plug in real clients and tests can
//! plug in scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::CollaboratorError;

pub mod memory;
pub mod process;

pub use memory::{MemoryStore, RecordingBus};
pub use process::OsProcessControl;

/// Root-cause analysis engine
#[async_trait]
pub trait DiagnosticService: Send + Sync {
    /// Free-text analysis, possibly with fenced code. An empty string means
    /// the engine produced nothing usable.
    async fn analyze(
        &self,
        error: &str,
        log_context: &str,
        step_context: &serde_json::Value,
        auto_fix: bool,
    ) -> Result<String, CollaboratorError>;
}

/// Input to one sandbox run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub test_script: String,
    /// Path -> file content placed in the sandbox before the run
    pub target_files: BTreeMap<String, String>,
    pub command: Option<String>,
    pub timeout_secs: u64,
}

/// Output of one sandbox run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxRun {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Isolated fix validation
#[async_trait]
pub trait SandboxService: Send + Sync {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxRun, CollaboratorError>;
}

/// Auditor verdict on a proposed fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditVerdict {
    Approve,
    Reject,
    Adjust,
}

impl fmt::Display for AuditVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Approve => "APPROVE",
            Self::Reject => "REJECT",
            Self::Adjust => "ADJUST",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReview {
    pub verdict: AuditVerdict,
    pub reasoning: String,
}

/// Independent review of a proposed fix
#[async_trait]
pub trait AuditService: Send + Sync {
    async fn review_fix(&self, error: &str, analysis: &str) -> Result<AuditReview, CollaboratorError>;
}

/// Best-effort key/value persistence. Callers check `is_available` before
/// every call and skip persistence when it is false.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    fn is_available(&self) -> bool;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CollaboratorError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CollaboratorError>;
}

/// Message published on the inter-agent bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub correlation_id: String,
}

/// Fire-and-forget inter-agent messaging
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: BusEvent) -> Result<(), CollaboratorError>;
}

/// Host process control
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn restart_service(&self, name: &str) -> Result<(), CollaboratorError>;

    /// Replace the current process image. Only returns when that failed.
    fn re_exec_self(&self) -> CollaboratorError;
}

/// The full set of collaborators the core is wired with
#[derive(Clone)]
pub struct Collaborators {
    pub diagnostic: Arc<dyn DiagnosticService>,
    pub sandbox: Arc<dyn SandboxService>,
    pub audit: Arc<dyn AuditService>,
    pub store: Arc<dyn KeyValueStore>,
    pub bus: Arc<dyn EventBus>,
    pub process: Arc<dyn ProcessControl>,
}
