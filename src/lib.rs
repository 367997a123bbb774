//! Recovery Core - fault recovery for multi-agent task execution
//!
//! When an execution step fails, the core classifies the failure, picks a
//! recovery strategy and, for real defects, runs a bounded-concurrency
//! self-healing workflow: diagnose, propose a fix, validate it in a sandbox
//! and have it audited before the stalled step resumes. As a last resort it
//! can snapshot its state and restart the whole process (Phoenix Protocol).
//!
//! - **Classification**: ordered pattern matching into a closed taxonomy
//! - **Strategy**: a pure decision table over category and attempt
//! - **Healing**: priority backlog, admission control, per-task state machine
//! - **Escalation**: confidence-gated hot-patch / service / process restart
//! - **Snapshots**: atomic, redacted, resumable Phoenix snapshots
//!
//! # Quick Start
//!
//! ```ignore
//! use recovery_core::{RecoveryConfig, RecoveryCore};
//!
//! let core = RecoveryCore::new(RecoveryConfig::load(None)?, collaborators);
//! let strategy = core.decide("ConnectionResetError", 1, None);
//! let task_id = core.submit_healing_task("step_4", "SyntaxError", ctx, logs, 0).await;
//! ```

// ─── Ambient ───────────────────────────────────────────────────────
pub mod cli;
pub mod config;
pub mod errors;
pub mod observability;
pub mod redact;

// ─── Decisions ─────────────────────────────────────────────────────
pub mod classifier;
pub mod strategy;

// ─── Healing & Escalation ──────────────────────────────────────────
pub mod collaborators;
pub mod escalation;
pub mod healing;
pub mod recovery;
pub mod snapshot;

pub use classifier::{ErrorCategory, ErrorClassifier};
pub use config::RecoveryConfig;
pub use errors::{RecoveryError, Result};
pub use recovery::{FailureOutcome, FailureReport, RecoveryCore};
pub use strategy::{RecoveryAction, RecoveryStrategy, StrategyDecider};
