//! Recovery core context
//!
//! [`RecoveryCore`] is the single object the task orchestrator owns. It wires
//! the classifier, strategy decider, healing scheduler, escalation engine and
//! snapshot manager to one set of collaborators and exposes the orchestrator
//! interface on top of them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::classifier::{ErrorCategory, ErrorClassifier};
use crate::collaborators::Collaborators;
use crate::config::RecoveryConfig;
use crate::escalation::{EscalationContext, EscalationEngine, EscalationReport};
use crate::healing::{
    FixedStepInfo, HealingRequest, HealingScheduler, HealingStatus, HealingTask, Notifier,
    SchedulerSummary,
};
use crate::snapshot::{RecoverySnapshot, SnapshotManager};
use crate::strategy::{RecoveryStrategy, StrategyDecider};

/// A failed step as reported by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub step_id: String,
    pub error: String,
    /// 1-based attempt number of the step that just failed
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default)]
    pub step_context: serde_json::Value,
    #[serde(default)]
    pub log_context: String,
    /// Healing priority; the configured default when absent
    #[serde(default)]
    pub priority: Option<i32>,
}

fn default_attempt() -> u32 {
    1
}

impl FailureReport {
    pub fn new(step_id: impl Into<String>, error: impl Into<String>, attempt: u32) -> Self {
        Self {
            step_id: step_id.into(),
            error: error.into(),
            attempt,
            step_context: serde_json::Value::Null,
            log_context: String::new(),
            priority: None,
        }
    }
}

/// Decision for a reported failure, plus the healing task it started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureOutcome {
    pub strategy: RecoveryStrategy,
    pub healing_task_id: Option<String>,
}

pub struct RecoveryCore {
    config: RecoveryConfig,
    decider: StrategyDecider,
    scheduler: HealingScheduler,
    escalation: EscalationEngine,
    snapshots: Arc<SnapshotManager>,
}

impl RecoveryCore {
    pub fn new(config: RecoveryConfig, collaborators: Collaborators) -> Self {
        let classifier = Arc::new(ErrorClassifier::new(&config.classifier));
        let decider = StrategyDecider::new(config.strategy.clone(), classifier);
        let scheduler = HealingScheduler::new(config.healing.clone(), &collaborators, &config.bus);
        let snapshots = Arc::new(SnapshotManager::new(
            &config.snapshot,
            collaborators.store.clone(),
        ));
        let escalation = EscalationEngine::new(
            config.escalation.clone(),
            collaborators.diagnostic.clone(),
            config.healing.diagnosis_timeout(),
            scheduler.clone(),
            snapshots.clone(),
            collaborators.process.clone(),
            Notifier::new(collaborators.bus.clone(), &config.bus),
        );

        Self {
            config,
            decider,
            scheduler,
            escalation,
            snapshots,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn classify(&self, error: &str) -> ErrorCategory {
        self.decider.classifier().classify(error)
    }

    /// Synchronous, no I/O, never fails.
    pub fn decide(
        &self,
        error: &str,
        attempt: u32,
        context: Option<&serde_json::Value>,
    ) -> RecoveryStrategy {
        self.decider.decide(error, attempt, context)
    }

    /// Decide, and start healing when the decision calls for it.
    pub async fn report_failure(&self, report: FailureReport) -> FailureOutcome {
        let strategy = self
            .decider
            .decide(&report.error, report.attempt, Some(&report.step_context));

        let healing_task_id = if strategy.requires_healing() {
            let priority = report
                .priority
                .unwrap_or(self.config.healing.default_priority);
            let request = HealingRequest::new(report.step_id, report.error)
                .with_context(report.step_context)
                .with_log_context(report.log_context)
                .with_priority(priority);
            Some(self.scheduler.submit(request).await)
        } else {
            None
        };

        FailureOutcome {
            strategy,
            healing_task_id,
        }
    }

    pub async fn submit_healing_task(
        &self,
        step_id: &str,
        error: &str,
        context: serde_json::Value,
        log_context: &str,
        priority: i32,
    ) -> String {
        let request = HealingRequest::new(step_id, error)
            .with_context(context)
            .with_log_context(log_context)
            .with_priority(priority);
        self.scheduler.submit(request).await
    }

    pub fn get_healing_status(&self, task_id: &str) -> Option<HealingStatus> {
        self.scheduler.status(task_id)
    }

    pub fn get_fixed_steps(&self) -> Vec<FixedStepInfo> {
        self.scheduler.fixed_steps()
    }

    pub async fn acknowledge_fix(&self, step_id: &str, action: &str) -> bool {
        self.scheduler.acknowledge(step_id, action).await
    }

    pub fn get_task_by_step(&self, step_id: &str) -> Option<HealingTask> {
        self.scheduler.task_by_step(step_id)
    }

    pub fn tasks(&self) -> Vec<HealingTask> {
        self.scheduler.tasks()
    }

    pub fn summary(&self) -> SchedulerSummary {
        self.scheduler.summary()
    }

    pub fn scheduler(&self) -> &HealingScheduler {
        &self.scheduler
    }

    pub fn escalation(&self) -> &EscalationEngine {
        &self.escalation
    }

    /// System-level escalation: analyze, decide, dispatch.
    pub async fn escalate(&self, ctx: &EscalationContext) -> EscalationReport {
        self.escalation.escalate(ctx).await
    }

    /// Snapshot left by a Phoenix restart, if any
    pub fn resume_from_snapshot(&self) -> Option<RecoverySnapshot> {
        let snapshot = self.snapshots.load_snapshot()?;
        info!(
            task_id = %snapshot.task_id,
            step_id = %snapshot.step_id,
            saved_at = %snapshot.timestamp,
            "Resuming after Phoenix restart"
        );
        Some(snapshot)
    }

    pub fn clear_snapshot(&self) -> bool {
        self.snapshots.clear_snapshot()
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }
}
