//! Configuration Management
//!
//! Loads recovery-core configuration from TOML files.
//! Configuration includes:
//! - Healing scheduler limits and phase timeouts
//! - Recovery decision table constants (backoffs, retry ceilings)
//! - Escalation thresholds and service keyword map
//! - Phoenix snapshot location and captured state keys
//! - Event bus identities and logging output
//!
//! Every default equals the built-in constant it replaces, so an empty file
//! behaves exactly like no file at all.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::RecoveryError;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "RECOVERY_CONFIG";

/// Config file looked up in the working directory when nothing else is given.
pub const DEFAULT_CONFIG_FILE: &str = "recovery.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default)]
    pub healing: HealingConfig,

    #[serde(default)]
    pub strategy: StrategyConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Healing scheduler and workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    /// Tasks allowed in an active phase at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Hard ceiling on the diagnostic call
    #[serde(default = "default_diagnosis_timeout")]
    pub diagnosis_timeout_secs: u64,
    /// Timeout handed to the sandbox collaborator
    #[serde(default = "default_sandbox_timeout")]
    pub sandbox_timeout_secs: u64,
    /// Ceiling on the audit call
    #[serde(default = "default_audit_timeout")]
    pub audit_timeout_secs: u64,
    /// TTL of persisted task records
    #[serde(default = "default_persistence_ttl")]
    pub persistence_ttl_secs: u64,
    /// Maximum characters of log context kept per task (tail is kept)
    #[serde(default = "default_log_context_limit")]
    pub log_context_limit: usize,
    /// Command the sandbox runs against the extracted test script
    #[serde(default)]
    pub sandbox_command: Option<String>,
    /// Priority used when a caller does not supply one
    #[serde(default)]
    pub default_priority: i32,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            diagnosis_timeout_secs: default_diagnosis_timeout(),
            sandbox_timeout_secs: default_sandbox_timeout(),
            audit_timeout_secs: default_audit_timeout(),
            persistence_ttl_secs: default_persistence_ttl(),
            log_context_limit: default_log_context_limit(),
            sandbox_command: None,
            default_priority: 0,
        }
    }
}

impl HealingConfig {
    pub fn diagnosis_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnosis_timeout_secs)
    }

    pub fn audit_timeout(&self) -> Duration {
        Duration::from_secs(self.audit_timeout_secs)
    }

    /// Outer guard around the sandbox call; the collaborator enforces the real limit.
    pub fn sandbox_guard(&self) -> Duration {
        Duration::from_secs(
            self.sandbox_timeout_secs
                .saturating_add(SANDBOX_GUARD_GRACE_SECS),
        )
    }

    pub fn persistence_ttl(&self) -> Duration {
        Duration::from_secs(self.persistence_ttl_secs)
    }
}

const SANDBOX_GUARD_GRACE_SECS: u64 = 5;
/// Upper bound for any phase timeout (one day)
const MAX_TIMEOUT_SECS: u64 = 86_400;
/// Upper bound for the task record TTL (one year)
const MAX_PERSISTENCE_TTL_SECS: u64 = 365 * 86_400;

/// Constants of the recovery decision table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_infrastructure_backoff")]
    pub infrastructure_backoff_secs: f64,
    #[serde(default = "default_infrastructure_max_retries")]
    pub infrastructure_max_retries: u32,
    #[serde(default = "default_transient_backoff")]
    pub transient_backoff_secs: f64,
    #[serde(default = "default_transient_max_retries")]
    pub transient_max_retries: u32,
    #[serde(default = "default_heal_max_retries")]
    pub heal_max_retries: u32,
    #[serde(default = "default_verification_backoff")]
    pub verification_retry_backoff_secs: f64,
    #[serde(default = "default_verification_max_retries")]
    pub verification_max_retries: u32,
    #[serde(default = "default_unknown_backoff")]
    pub unknown_retry_backoff_secs: f64,
    #[serde(default = "default_unknown_max_retries")]
    pub unknown_max_retries: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            infrastructure_backoff_secs: default_infrastructure_backoff(),
            infrastructure_max_retries: default_infrastructure_max_retries(),
            transient_backoff_secs: default_transient_backoff(),
            transient_max_retries: default_transient_max_retries(),
            heal_max_retries: default_heal_max_retries(),
            verification_retry_backoff_secs: default_verification_backoff(),
            verification_max_retries: default_verification_max_retries(),
            unknown_retry_backoff_secs: default_unknown_backoff(),
            unknown_max_retries: default_unknown_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Distinct error strings memoized before eviction
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Phoenix restarts below this confidence become user intervention
    #[serde(default = "default_phoenix_min_confidence")]
    pub phoenix_min_confidence: f64,
    /// Priority of healing tasks submitted for HOT_PATCH
    #[serde(default = "default_hot_patch_priority")]
    pub hot_patch_priority: i32,
    /// Service name -> root-cause keywords that identify it
    #[serde(default = "default_service_keywords")]
    pub service_keywords: BTreeMap<String, Vec<String>>,
    /// Program and arguments used to restart a service; `{service}` is
    /// replaced with the inferred service name
    #[serde(default = "default_restart_command")]
    pub restart_command: Vec<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            phoenix_min_confidence: default_phoenix_min_confidence(),
            hot_patch_priority: default_hot_patch_priority(),
            service_keywords: default_service_keywords(),
            restart_command: default_restart_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_path")]
    pub path: PathBuf,
    /// External key/value entries captured into the snapshot
    #[serde(default = "default_state_keys")]
    pub state_keys: Vec<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: default_snapshot_path(),
            state_keys: default_state_keys(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Sender name on published events
    #[serde(default = "default_bus_source")]
    pub source: String,
    /// Recipient of healing notifications
    #[serde(default = "default_bus_orchestrator")]
    pub orchestrator: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            source: default_bus_source(),
            orchestrator: default_bus_orchestrator(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}
fn default_diagnosis_timeout() -> u64 {
    180
}
fn default_sandbox_timeout() -> u64 {
    30
}
fn default_audit_timeout() -> u64 {
    180
}
fn default_persistence_ttl() -> u64 {
    24 * 60 * 60
}
fn default_log_context_limit() -> usize {
    5000
}
fn default_infrastructure_backoff() -> f64 {
    60.0
}
fn default_infrastructure_max_retries() -> u32 {
    3
}
fn default_transient_backoff() -> f64 {
    2.0
}
fn default_transient_max_retries() -> u32 {
    5
}
fn default_heal_max_retries() -> u32 {
    2
}
fn default_verification_backoff() -> f64 {
    2.0
}
fn default_verification_max_retries() -> u32 {
    2
}
fn default_unknown_backoff() -> f64 {
    1.0
}
fn default_unknown_max_retries() -> u32 {
    2
}
fn default_cache_capacity() -> usize {
    1024
}
fn default_phoenix_min_confidence() -> f64 {
    0.6
}
fn default_hot_patch_priority() -> i32 {
    1
}
fn default_service_keywords() -> BTreeMap<String, Vec<String>> {
    let mut map = BTreeMap::new();
    map.insert("redis".to_string(), vec!["redis".to_string()]);
    map.insert(
        "postgres".to_string(),
        vec!["postgres".to_string(), "postgresql".to_string()],
    );
    map.insert(
        "mcp".to_string(),
        vec!["mcp server".to_string(), "mcp".to_string()],
    );
    map
}
fn default_restart_command() -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "restart".to_string(),
        "{service}".to_string(),
    ]
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from(".recovery").join("phoenix_snapshot.json")
}
fn default_state_keys() -> Vec<String> {
    vec![
        "orchestrator:current_plan".to_string(),
        "orchestrator:current_step".to_string(),
        "orchestrator:session_id".to_string(),
    ]
}
fn default_bus_source() -> String {
    "healer".to_string()
}
fn default_bus_orchestrator() -> String {
    "orchestrator".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl RecoveryConfig {
    /// Load configuration: explicit path, then `$RECOVERY_CONFIG`, then
    /// `./recovery.toml`, then built-in defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let explicit = path
            .map(String::from)
            .or_else(|| std::env::var(CONFIG_ENV).ok());

        let mut config: Self = match explicit {
            Some(p) => {
                let content = std::fs::read_to_string(&p)
                    .with_context(|| format!("Failed to read config from {}", p))?;
                Self::from_toml(&content)?
            }
            None => match std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
                Ok(content) => Self::from_toml(&content)?,
                Err(_) => Self::default(),
            },
        };

        // Override with environment variables
        if let Ok(value) = std::env::var("RECOVERY_MAX_CONCURRENT") {
            if let Ok(n) = value.parse::<usize>() {
                config.healing.max_concurrent = n;
            }
        }
        if let Ok(value) = std::env::var("RECOVERY_DIAGNOSIS_TIMEOUT") {
            if let Ok(t) = value.parse::<u64>() {
                config.healing.diagnosis_timeout_secs = t;
            }
        }
        if let Ok(value) = std::env::var("RECOVERY_SNAPSHOT_PATH") {
            config.snapshot.path = PathBuf::from(value);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn validate(&self) -> std::result::Result<(), RecoveryError> {
        if self.healing.max_concurrent == 0 {
            return Err(RecoveryError::Config(
                "healing.max_concurrent must be at least 1".to_string(),
            ));
        }
        let healing = &self.healing;
        let timeouts = [
            ("diagnosis_timeout_secs", healing.diagnosis_timeout_secs),
            ("sandbox_timeout_secs", healing.sandbox_timeout_secs),
            ("audit_timeout_secs", healing.audit_timeout_secs),
        ];
        for (name, secs) in timeouts {
            if secs == 0 {
                return Err(RecoveryError::Config(format!(
                    "healing timeouts must be greater than 0 (healing.{})",
                    name
                )));
            }
            if secs > MAX_TIMEOUT_SECS {
                return Err(RecoveryError::Config(format!(
                    "healing.{} must be at most {}, got {}",
                    name, MAX_TIMEOUT_SECS, secs
                )));
            }
        }
        if healing.persistence_ttl_secs == 0
            || healing.persistence_ttl_secs > MAX_PERSISTENCE_TTL_SECS
        {
            return Err(RecoveryError::Config(format!(
                "healing.persistence_ttl_secs must be within [1, {}], got {}",
                MAX_PERSISTENCE_TTL_SECS, healing.persistence_ttl_secs
            )));
        }
        let confidence = self.escalation.phoenix_min_confidence;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(RecoveryError::Config(format!(
                "escalation.phoenix_min_confidence must be within [0, 1], got {}",
                confidence
            )));
        }
        Ok(())
    }
}
