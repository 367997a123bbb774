//! Recovery Snapshot Manager
//!
//! Persists a resumable snapshot around a Phoenix (full-process) restart and
//! reads it back on the next startup. Every operation is best-effort:
//! failures are logged and reported as `false` / `None`, never raised.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collaborators::KeyValueStore;
use crate::config::SnapshotConfig;
use crate::errors::SnapshotError;
use crate::redact::{is_sensitive_key, redact_secrets, REDACTED};

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Resume metadata supplied by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotContext {
    pub task_id: String,
    pub step_id: String,
    pub reason: String,
}

/// What gets written to disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub version: u32,
    pub task_id: String,
    pub step_id: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    /// Whitelisted key/value entries present at save time
    #[serde(default)]
    pub external_state: BTreeMap<String, String>,
    /// Shallow copy of in-process state
    #[serde(default)]
    pub running_state: Map<String, Value>,
}

pub struct SnapshotManager {
    path: PathBuf,
    state_keys: Vec<String>,
    store: Arc<dyn KeyValueStore>,
}

impl SnapshotManager {
    pub fn new(config: &SnapshotConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            path: config.path.clone(),
            state_keys: config.state_keys.clone(),
            store,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Capture and atomically write a snapshot. Returns false on any failure.
    pub async fn save_snapshot(&self, running_state: &Map<String, Value>, ctx: &SnapshotContext) -> bool {
        let snapshot = RecoverySnapshot {
            version: SNAPSHOT_VERSION,
            task_id: ctx.task_id.clone(),
            step_id: ctx.step_id.clone(),
            reason: redact_secrets(&ctx.reason).into_owned(),
            timestamp: Utc::now(),
            external_state: self.capture_external_state().await,
            running_state: shallow_state(running_state),
        };

        let bytes = match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{}", SnapshotError::Serialize(e.to_string()));
                return false;
            }
        };

        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || write_atomic(&path, &bytes)).await;
        match written {
            Ok(Ok(())) => {
                info!(
                    path = %self.path.display(),
                    task_id = %ctx.task_id,
                    step_id = %ctx.step_id,
                    "Recovery snapshot saved"
                );
                true
            }
            Ok(Err(e)) => {
                warn!("{}", e);
                false
            }
            Err(e) => {
                warn!("Snapshot writer task failed: {}", e);
                false
            }
        }
    }

    async fn capture_external_state(&self) -> BTreeMap<String, String> {
        let mut captured = BTreeMap::new();
        if !self.store.is_available() {
            debug!("Store unavailable; snapshot carries no external state");
            return captured;
        }
        for key in &self.state_keys {
            match self.store.get(key).await {
                Ok(Some(value)) => {
                    captured.insert(key.clone(), redact_secrets(&value).into_owned());
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, "Failed to read state for snapshot: {}", e),
            }
        }
        captured
    }

    /// Parsed snapshot, or `None` if absent or unreadable
    pub fn load_snapshot(&self) -> Option<RecoverySnapshot> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), "Failed to read snapshot: {}", e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(path = %self.path.display(), "Ignoring corrupt snapshot: {}", e);
                None
            }
        }
    }

    /// Remove the snapshot. Returns whether a file was removed.
    pub fn clear_snapshot(&self) -> bool {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Recovery snapshot cleared");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %self.path.display(), "Failed to clear snapshot: {}", e);
                false
            }
        }
    }
}

/// Keep primitives, stringify nested values, redact secrets.
fn shallow_state(state: &Map<String, Value>) -> Map<String, Value> {
    state
        .iter()
        .map(|(key, value)| {
            let value = if is_sensitive_key(key) && !value.is_null() {
                Value::String(REDACTED.to_string())
            } else {
                match value {
                    Value::String(s) => Value::String(redact_secrets(s).into_owned()),
                    Value::Array(_) | Value::Object(_) => {
                        Value::String(redact_secrets(&value.to_string()).into_owned())
                    }
                    primitive => primitive.clone(),
                }
            };
            (key.clone(), value)
        })
        .collect()
}

/// Temp file in the target directory, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let io_err = |e: &dyn std::fmt::Display| SnapshotError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(|e| io_err(&e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| io_err(&e))?;
    tmp.write_all(bytes).map_err(|e| io_err(&e))?;
    tmp.as_file().sync_all().map_err(|e| io_err(&e))?;
    tmp.persist(path).map_err(|e| io_err(&e.error))?;
    Ok(())
}
