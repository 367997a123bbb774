//! In-process collaborator implementations
//!
//! `MemoryStore` stands in for the external key/value store when the host
//! runs without one; `RecordingBus` keeps published events in memory and can
//! forward them to a channel.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::{BusEvent, EventBus, KeyValueStore};
use crate::errors::CollaboratorError;

struct StoredValue {
    value: String,
    /// `None` when the TTL is too large to represent as an instant
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// TTL-aware in-memory key/value store
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability, simulating the store going away
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Read a value directly, ignoring availability
    pub fn peek(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|v| v.is_live(Instant::now()))
            .map(|v| v.value.clone())
    }

    /// Remaining TTL of a key; `Duration::MAX` if it never expires
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock();
        entries.get(key).map(|v| match v.expires_at {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CollaboratorError> {
        if !self.is_available() {
            return Err(CollaboratorError::Unavailable {
                service: "memory store".to_string(),
            });
        }
        self.entries.lock().insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CollaboratorError> {
        if !self.is_available() {
            return Err(CollaboratorError::Unavailable {
                service: "memory store".to_string(),
            });
        }
        let mut entries = self.entries.lock();
        let expired = entries
            .get(key)
            .map(|v| !v.is_live(Instant::now()))
            .unwrap_or(false);
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|v| v.value.clone()))
    }
}

/// Event bus that records every published event
pub struct RecordingBus {
    events: Mutex<Vec<BusEvent>>,
    forward: Option<mpsc::UnboundedSender<BusEvent>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            forward: None,
        }
    }

    /// Also forward each event to a channel
    pub fn with_forwarding(tx: mpsc::UnboundedSender<BusEvent>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            forward: Some(tx),
        }
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.events.lock().clone()
    }

    /// Events of one type, in publish order
    pub fn events_of_type(&self, event_type: &str) -> Vec<BusEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl Default for RecordingBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn publish(&self, event: BusEvent) -> Result<(), CollaboratorError> {
        if let Some(tx) = &self.forward {
            // A dropped receiver only loses the forwarded copy
            let _ = tx.send(event.clone());
        }
        self.events.lock().push(event);
        Ok(())
    }
}
