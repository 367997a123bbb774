//! Healing Task Scheduler
//!
//! Admission control, task registry and fixed queue for healing tasks.
//!
//! # Architecture
//!
//! ```text
//! submit ──► registry ──► active < max? ──yes──► ANALYZING ──► workflow (spawned)
//!                              │                                    │
//!                              no                                   ▼
//!                              ▼                              finish(task_id)
//!                           backlog ◄────── promote (same lock) ◄───┘
//! ```
//!
//! All scheduling state sits behind one `parking_lot::Mutex`. Counting the
//! active set, popping the backlog and starting a task happen inside a single
//! critical section, so concurrent completions can never over-admit. The lock
//! is never held across an `.await`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use super::backlog::Backlog;
use super::extract::tail_chars;
use super::notify::Notifier;
use super::persist::TaskPersister;
use super::task::{FixedStepInfo, HealingStatus, HealingTask};
use super::workflow;
use crate::collaborators::{AuditService, Collaborators, DiagnosticService, SandboxService};
use crate::config::{BusConfig, HealingConfig};
use crate::errors::{HealingError, RecoveryError};
use crate::observability::telemetry::{healing_span, log_safe};
use crate::redact::redact_secrets;

/// A failed step submitted for healing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingRequest {
    pub step_id: String,
    pub error: String,
    #[serde(default)]
    pub step_context: serde_json::Value,
    #[serde(default)]
    pub log_context: String,
    #[serde(default)]
    pub priority: i32,
}

impl HealingRequest {
    pub fn new(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            error: error.into(),
            step_context: serde_json::Value::Null,
            log_context: String::new(),
            priority: 0,
        }
    }

    pub fn with_context(mut self, step_context: serde_json::Value) -> Self {
        self.step_context = step_context;
        self
    }

    pub fn with_log_context(mut self, log_context: impl Into<String>) -> Self {
        self.log_context = log_context.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Reject requests a workflow could only run on partial data
    pub fn validate(&self) -> Result<(), HealingError> {
        if self.step_id.trim().is_empty() {
            return Err(HealingError::InvalidRequest("step_id is empty".into()));
        }
        if self.error.trim().is_empty() {
            return Err(HealingError::InvalidRequest("error is empty".into()));
        }
        if !(self.step_context.is_object() || self.step_context.is_null()) {
            return Err(HealingError::InvalidRequest(
                "step_context must be a JSON object".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSummary {
    pub total_tasks: usize,
    pub by_status: BTreeMap<String, usize>,
    pub active: usize,
    pub backlog: usize,
    pub fixed_queue: usize,
    pub max_concurrent: usize,
}

/// Collaborators the workflow talks to
pub(super) struct WorkflowServices {
    pub diagnostic: Arc<dyn DiagnosticService>,
    pub sandbox: Arc<dyn SandboxService>,
    pub audit: Arc<dyn AuditService>,
    pub persister: TaskPersister,
    pub notifier: Notifier,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<String, HealingTask>,
    /// Task ids in submission order
    order: Vec<String>,
    backlog: Backlog,
    active: HashSet<String>,
    fixed: Vec<FixedStepInfo>,
}

struct Inner {
    config: HealingConfig,
    state: Mutex<SchedulerState>,
    services: WorkflowServices,
}

/// Bounded-concurrency healing scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HealingScheduler {
    inner: Arc<Inner>,
}

impl HealingScheduler {
    pub fn new(config: HealingConfig, collaborators: &Collaborators, bus: &BusConfig) -> Self {
        let services = WorkflowServices {
            diagnostic: collaborators.diagnostic.clone(),
            sandbox: collaborators.sandbox.clone(),
            audit: collaborators.audit.clone(),
            persister: TaskPersister::new(collaborators.store.clone(), config.persistence_ttl()),
            notifier: Notifier::new(collaborators.bus.clone(), bus),
        };
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(SchedulerState::default()),
                services,
            }),
        }
    }

    pub fn config(&self) -> &HealingConfig {
        &self.inner.config
    }

    pub(super) fn services(&self) -> &WorkflowServices {
        &self.inner.services
    }

    /// Submit a failed step. Always returns a retrievable task id; the task
    /// starts now if a slot is free, otherwise it waits in the backlog.
    pub async fn submit(&self, request: HealingRequest) -> String {
        let task_id = format!("heal_{}", Uuid::new_v4().simple());
        let validation = request.validate();

        let log_context = tail_chars(
            &redact_secrets(&request.log_context),
            self.inner.config.log_context_limit,
        );
        let mut task = HealingTask::new(
            task_id.clone(),
            request.step_id,
            request.error,
            request.step_context,
            log_context,
            request.priority,
        );

        if let Err(e) = validation {
            warn!(task_id = %task_id, "Rejecting healing request: {}", e);
            task.fail(e.to_string());
            self.inner.services.persister.persist(&task).await;
            let mut state = self.inner.state.lock();
            state.order.push(task_id.clone());
            state.tasks.insert(task_id.clone(), task);
            return task_id;
        }

        // PENDING record lands before the workflow can write a later status
        self.inner.services.persister.persist(&task).await;

        info!(
            task_id = %task_id,
            step_id = %task.step_id,
            priority = task.priority,
            error = %log_safe(&task.error),
            "Healing task submitted"
        );

        let priority = task.priority;
        let mut state = self.inner.state.lock();
        state.order.push(task_id.clone());
        state.tasks.insert(task_id.clone(), task);
        if state.active.len() < self.inner.config.max_concurrent {
            self.start_locked(&mut state, &task_id);
        } else {
            state.backlog.push(task_id.clone(), priority);
            info!(
                task_id = %task_id,
                backlog = state.backlog.len(),
                "All healing slots busy; task queued"
            );
        }
        task_id
    }

    /// Move a PENDING task to ANALYZING and spawn its workflow.
    fn start_locked(&self, state: &mut SchedulerState, task_id: &str) {
        let Some(task) = state.tasks.get_mut(task_id) else {
            return;
        };
        if let Err(e) = task.transition(HealingStatus::Analyzing) {
            warn!(task_id, "Cannot start healing task: {}", e);
            return;
        }
        let span = healing_span(task_id, &task.step_id);

        state.active.insert(task_id.to_string());
        tokio::spawn(workflow::run(self.clone(), task_id.to_string()).instrument(span));
    }

    /// Fill free slots from the backlog, highest priority first.
    fn promote_locked(&self, state: &mut SchedulerState) {
        while state.active.len() < self.inner.config.max_concurrent {
            let Some(task_id) = state.backlog.pop() else {
                break;
            };
            let pending = state
                .tasks
                .get(&task_id)
                .map(|t| t.status == HealingStatus::Pending)
                .unwrap_or(false);
            if pending {
                info!(task_id = %task_id, "Promoting healing task from backlog");
                self.start_locked(state, &task_id);
            }
        }
    }

    /// Workflow cleanup: release the slot and promote, in one critical section.
    pub(super) fn finish(&self, task_id: &str) {
        let mut state = self.inner.state.lock();
        state.active.remove(task_id);
        self.promote_locked(&mut state);
    }

    /// Apply `f` to a task and return the updated copy.
    pub(super) fn modify<R>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut HealingTask) -> R,
    ) -> Result<(R, HealingTask), RecoveryError> {
        let mut state = self.inner.state.lock();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| HealingError::TaskNotFound(task_id.to_string()))?;
        let result = f(task);
        Ok((result, task.clone()))
    }

    /// Apply `f`, then transition to `next`.
    pub(super) fn advance(
        &self,
        task_id: &str,
        next: HealingStatus,
        f: impl FnOnce(&mut HealingTask),
    ) -> Result<HealingTask, RecoveryError> {
        let (transition, task) = self.modify(task_id, |task| {
            f(task);
            task.transition(next)
        })?;
        transition?;
        Ok(task)
    }

    /// Add a READY fix, replacing any un-acknowledged entry for the same step.
    ///
    /// A replaced task stays READY but records which task superseded it.
    pub(super) fn push_fixed(&self, info: FixedStepInfo) {
        let mut state = self.inner.state.lock();
        let replaced: Vec<String> = state
            .fixed
            .iter()
            .filter(|f| f.step_id == info.step_id && f.task_id != info.task_id)
            .map(|f| f.task_id.clone())
            .collect();
        for old in &replaced {
            info!(
                step_id = %info.step_id,
                task_id = %old,
                superseded_by = %info.task_id,
                "Un-acknowledged fix replaced by a newer one"
            );
            if let Some(task) = state.tasks.get_mut(old) {
                task.superseded_by = Some(info.task_id.clone());
                task.touch();
            }
        }
        state.fixed.retain(|f| f.step_id != info.step_id);
        state.fixed.push(info);
    }

    pub fn status(&self, task_id: &str) -> Option<HealingStatus> {
        self.inner.state.lock().tasks.get(task_id).map(|t| t.status)
    }

    pub fn task(&self, task_id: &str) -> Option<HealingTask> {
        self.inner.state.lock().tasks.get(task_id).cloned()
    }

    /// Un-acknowledged fixes, oldest first
    pub fn fixed_steps(&self) -> Vec<FixedStepInfo> {
        self.inner.state.lock().fixed.clone()
    }

    /// Consume the fixed-queue entry for `step_id`. False when there is none.
    pub async fn acknowledge(&self, step_id: &str, action: &str) -> bool {
        let acknowledged = {
            let mut state = self.inner.state.lock();
            let Some(pos) = state.fixed.iter().position(|f| f.step_id == step_id) else {
                return false;
            };
            let info = state.fixed.remove(pos);
            state.tasks.get_mut(&info.task_id).and_then(|task| {
                match task.transition(HealingStatus::Acknowledged) {
                    Ok(()) => {
                        task.acknowledged_action = Some(action.to_string());
                        Some(task.clone())
                    }
                    Err(e) => {
                        warn!(task_id = %info.task_id, "Acknowledged fix in unexpected state: {}", e);
                        None
                    }
                }
            })
        };

        if let Some(task) = acknowledged {
            info!(task_id = %task.task_id, step_id, action, "Fix acknowledged");
            self.inner.services.persister.persist(&task).await;
        }
        true
    }

    /// Most recently submitted task for a step
    pub fn task_by_step(&self, step_id: &str) -> Option<HealingTask> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.tasks.get(id))
            .find(|t| t.step_id == step_id)
            .cloned()
    }

    /// All tasks in submission order
    pub fn tasks(&self) -> Vec<HealingTask> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.state.lock().backlog.len()
    }

    pub fn summary(&self) -> SchedulerSummary {
        let state = self.inner.state.lock();
        let mut by_status = BTreeMap::new();
        for task in state.tasks.values() {
            *by_status.entry(task.status.to_string()).or_insert(0) += 1;
        }
        SchedulerSummary {
            total_tasks: state.tasks.len(),
            by_status,
            active: state.active.len(),
            backlog: state.backlog.len(),
            fixed_queue: state.fixed.len(),
            max_concurrent: self.inner.config.max_concurrent,
        }
    }
}
