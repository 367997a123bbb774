//! Healing task model and state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::collaborators::{AuditVerdict, SandboxRun};
use crate::errors::HealingError;
use crate::observability::telemetry::record_transition;
use crate::redact::redact_secrets;

/// Lifecycle of a healing task.
///
/// `Pending -> Analyzing -> Fixing -> SandboxTesting -> GrishaReview -> Ready`,
/// with `Failed` reachable from every non-terminal state and
/// `Ready -> Acknowledged` driven by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingStatus {
    Pending,
    Analyzing,
    Fixing,
    SandboxTesting,
    GrishaReview,
    Ready,
    Failed,
    Acknowledged,
}

impl HealingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Fixing => "fixing",
            Self::SandboxTesting => "sandbox_testing",
            Self::GrishaReview => "grisha_review",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Acknowledged => "acknowledged",
        }
    }

    /// Counts against the concurrency bound
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Analyzing | Self::Fixing | Self::SandboxTesting | Self::GrishaReview
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Acknowledged)
    }

    fn phase_rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Analyzing => Some(1),
            Self::Fixing => Some(2),
            Self::SandboxTesting => Some(3),
            Self::GrishaReview => Some(4),
            Self::Ready => Some(5),
            Self::Failed | Self::Acknowledged => None,
        }
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: HealingStatus) -> bool {
        match (self, next) {
            (Self::Ready, Self::Acknowledged) => true,
            (current, Self::Failed) => !current.is_terminal(),
            (current, _) if current.is_terminal() => false,
            (current, next) => match (current.phase_rank(), next.phase_rank()) {
                // Strictly forward along the phase chain, one step at a time
                (Some(from), Some(to)) => to == from + 1,
                _ => false,
            },
        }
    }
}

impl fmt::Display for HealingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the sandbox phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxReport {
    pub success: bool,
    /// False when there was nothing to run
    pub executed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

impl SandboxReport {
    /// No code block in the analysis; the fix is not penalized for it
    pub fn nothing_to_test() -> Self {
        Self {
            success: true,
            executed: false,
            message: "no code to test".to_string(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn from_run(run: SandboxRun) -> Self {
        let message = if run.success {
            "sandbox run passed".to_string()
        } else {
            "sandbox run failed".to_string()
        };
        Self {
            success: run.success,
            executed: true,
            message,
            stdout: run.stdout,
            stderr: run.stderr,
        }
    }

    /// The sandbox could not produce a result at all
    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            success: false,
            executed: true,
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// One attempt to automatically diagnose, fix and validate a failed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingTask {
    pub task_id: String,
    pub step_id: String,
    pub error: String,
    pub step_context: serde_json::Value,
    pub log_context: String,
    pub status: HealingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub diagnostic_analysis: Option<String>,
    pub fix_description: Option<String>,
    pub sandbox_result: Option<SandboxReport>,
    pub audit_verdict: Option<AuditVerdict>,
    pub audit_reasoning: Option<String>,
    pub error_message: Option<String>,
    /// Fixed at submission
    pub priority: i32,
    pub acknowledged_action: Option<String>,
    /// Newer READY task for the same step that replaced this one in the fixed queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

impl HealingTask {
    pub fn new(
        task_id: String,
        step_id: String,
        error: String,
        step_context: serde_json::Value,
        log_context: String,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            step_id,
            error,
            step_context,
            log_context,
            status: HealingStatus::Pending,
            created_at: now,
            updated_at: now,
            diagnostic_analysis: None,
            fix_description: None,
            sandbox_result: None,
            audit_verdict: None,
            audit_reasoning: None,
            error_message: None,
            priority,
            acknowledged_action: None,
            superseded_by: None,
        }
    }

    /// Move to `next`, stamping `updated_at`.
    pub fn transition(&mut self, next: HealingStatus) -> Result<(), HealingError> {
        if !self.status.can_transition_to(next) {
            return Err(HealingError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        record_transition(&self.task_id, self.status.as_str(), next.as_str());
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Short-circuit to FAILED. Returns false if the task was already terminal.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.transition(HealingStatus::Failed).is_err() {
            return false;
        }
        self.error_message = Some(message.into());
        true
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Projection for the fixed queue. Only meaningful once READY.
    pub fn fixed_step_info(&self) -> FixedStepInfo {
        FixedStepInfo {
            task_id: self.task_id.clone(),
            step_id: self.step_id.clone(),
            fix_description: self.fix_description.clone().unwrap_or_default(),
            fixed_at: self.updated_at,
            audit_verdict: self.audit_verdict,
        }
    }

    pub fn to_record(&self) -> PersistedTaskRecord {
        PersistedTaskRecord::from(self)
    }
}

/// A READY fix waiting for the orchestrator to acknowledge it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedStepInfo {
    pub task_id: String,
    pub step_id: String,
    pub fix_description: String,
    pub fixed_at: DateTime<Utc>,
    pub audit_verdict: Option<AuditVerdict>,
}

/// Per-task record written to the key/value store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTaskRecord {
    pub task_id: String,
    pub step_id: String,
    pub error: String,
    pub status: HealingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub diagnostic_analysis: Option<String>,
    pub fix_description: Option<String>,
    pub sandbox_result: Option<SandboxReport>,
    pub audit_verdict: Option<AuditVerdict>,
    pub error_message: Option<String>,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_action: Option<String>,
}

impl From<&HealingTask> for PersistedTaskRecord {
    fn from(task: &HealingTask) -> Self {
        let redact = |s: &String| redact_secrets(s).into_owned();
        Self {
            task_id: task.task_id.clone(),
            step_id: task.step_id.clone(),
            error: redact(&task.error),
            status: task.status,
            created_at: task.created_at,
            updated_at: task.updated_at,
            diagnostic_analysis: task.diagnostic_analysis.as_ref().map(redact),
            fix_description: task.fix_description.as_ref().map(redact),
            sandbox_result: task.sandbox_result.clone(),
            audit_verdict: task.audit_verdict,
            error_message: task.error_message.as_ref().map(redact),
            priority: task.priority,
            acknowledged_action: task.acknowledged_action.clone(),
        }
    }
}
