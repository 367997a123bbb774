//! Best-effort persistence of healing task records

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::task::HealingTask;
use crate::collaborators::KeyValueStore;

const KEY_PREFIX: &str = "healing:task:";

/// Store key for a task record
pub fn task_key(task_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, task_id)
}

/// Writes task records to the key/value store. Failures only cost
/// durability; they are logged and never returned.
#[derive(Clone)]
pub struct TaskPersister {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl TaskPersister {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Persist the current record. Returns whether it was written.
    pub async fn persist(&self, task: &HealingTask) -> bool {
        if !self.store.is_available() {
            debug!(task_id = %task.task_id, "Store unavailable; skipping persistence");
            return false;
        }

        let body = match serde_json::to_string(&task.to_record()) {
            Ok(body) => body,
            Err(e) => {
                warn!(task_id = %task.task_id, "Failed to serialize task record: {}", e);
                return false;
            }
        };

        match self.store.set(&task_key(&task.task_id), body, self.ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(task_id = %task.task_id, "Failed to persist task record: {}", e);
                false
            }
        }
    }
}
