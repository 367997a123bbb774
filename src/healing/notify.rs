//! Event-bus notifications for healing and escalation

use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use super::task::HealingTask;
use crate::collaborators::{BusEvent, EventBus};
use crate::config::BusConfig;
use crate::redact::redact_json;

pub const EVENT_STARTED: &str = "started";
pub const EVENT_FIX_READY: &str = "fix_ready";
pub const EVENT_USER_INTERVENTION: &str = "user_intervention";
pub const EVENT_PHOENIX_RESTART: &str = "phoenix_restart";

/// Fire-and-forget publisher. Bus failures are logged and dropped.
#[derive(Clone)]
pub struct Notifier {
    bus: Arc<dyn EventBus>,
    source: String,
    target: String,
}

impl Notifier {
    pub fn new(bus: Arc<dyn EventBus>, config: &BusConfig) -> Self {
        Self {
            bus,
            source: config.source.clone(),
            target: config.orchestrator.clone(),
        }
    }

    /// Task entered ANALYZING
    pub async fn started(&self, task: &HealingTask) {
        let payload = json!({
            "task_id": task.task_id,
            "step_id": task.step_id,
            "status": task.status,
            "priority": task.priority,
        });
        self.publish(EVENT_STARTED, payload, &task.task_id).await;
    }

    /// Task entered READY
    pub async fn fix_ready(&self, task: &HealingTask) {
        let payload = json!({
            "task_id": task.task_id,
            "step_id": task.step_id,
            "fix_description": task.fix_description,
            "audit_verdict": task.audit_verdict,
            "sandbox_passed": task.sandbox_result.as_ref().map(|r| r.success),
        });
        self.publish(EVENT_FIX_READY, payload, &task.task_id).await;
    }

    pub async fn publish(&self, event_type: &str, mut payload: serde_json::Value, correlation_id: &str) {
        redact_json(&mut payload);
        let event = BusEvent {
            from: self.source.clone(),
            to: self.target.clone(),
            event_type: event_type.to_string(),
            payload,
            correlation_id: correlation_id.to_string(),
        };
        if let Err(e) = self.bus.publish(event).await {
            warn!(event_type, correlation_id, "Failed to publish event: {}", e);
        }
    }
}
