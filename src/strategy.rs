//! Recovery Strategy Decider
//!
//! Turns `(error, attempt)` into a [`RecoveryStrategy`]. Pure apart from the
//! classifier's memo: no I/O, never panics, always returns something usable.
//! It sits on the path of every step failure in the host system.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::classifier::{ErrorCategory, ErrorClassifier};
use crate::config::StrategyConfig;

/// What the caller should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryAction {
    Retry,
    WaitAndRetry,
    Heal,
    Restart,
    AskUser,
    Escalate,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Retry => "RETRY",
            Self::WaitAndRetry => "WAIT_AND_RETRY",
            Self::Heal => "HEAL",
            Self::Restart => "RESTART",
            Self::AskUser => "ASK_USER",
            Self::Escalate => "ESCALATE",
        };
        f.write_str(name)
    }
}

/// Recovery decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub action: RecoveryAction,
    /// Seconds to wait before acting
    pub backoff: f64,
    pub max_retries: u32,
    /// Whether the handler needs step context and logs to act
    pub context_needed: bool,
    pub reason: String,
    /// Category the decision was derived from
    pub category: ErrorCategory,
}

impl RecoveryStrategy {
    fn new(category: ErrorCategory, action: RecoveryAction, reason: impl Into<String>) -> Self {
        Self {
            action,
            backoff: 0.0,
            max_retries: 0,
            context_needed: false,
            reason: reason.into(),
            category,
        }
    }

    fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff.max(0.0);
        self
    }

    fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn needing_context(mut self) -> Self {
        self.context_needed = true;
        self
    }

    /// True when the strategy should start a healing task
    pub fn requires_healing(&self) -> bool {
        self.action == RecoveryAction::Heal
    }
}

/// Text signatures of a step that legitimately failed its checks.
const LEGITIMATE_FAILURE_SIGNATURES: &[&str] = &[
    "no design files found",
    "files not found",
    "no files found",
    "empty result",
    "no results",
    "0 results",
    "criteria not met",
    "criteria were not met",
    "did not meet",
    "expected outcome not",
];

/// Text signatures of a broken verifier.
const VERIFIER_BUG_SIGNATURES: &[&str] = &[
    "crash",
    "infinite loop",
    "recursion",
    "panicked",
    "segfault",
    "internal error",
    "traceback",
    "stack overflow",
];

/// Verification failure split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationVerdict {
    /// The step itself failed its criteria; retrying it is reasonable
    LegitimateFailure,
    /// The verifier is broken; a human or the escalation path must look
    SystemBug,
}

/// Split a verification failure. A legitimate-failure match wins even when a
/// bug signature also matches.
pub fn split_verification_failure(error: &str) -> VerificationVerdict {
    let text = error.to_lowercase();
    let legitimate = LEGITIMATE_FAILURE_SIGNATURES.iter().any(|s| text.contains(s));
    if legitimate {
        VerificationVerdict::LegitimateFailure
    } else {
        VerificationVerdict::SystemBug
    }
}

/// Decision table over error categories
pub struct StrategyDecider {
    config: StrategyConfig,
    classifier: Arc<ErrorClassifier>,
}

impl StrategyDecider {
    pub fn new(config: StrategyConfig, classifier: Arc<ErrorClassifier>) -> Self {
        Self { config, classifier }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Decide a strategy for a failed step. `attempt` is 1-based; 0 is read as 1.
    pub fn decide(
        &self,
        error: &str,
        attempt: u32,
        context: Option<&serde_json::Value>,
    ) -> RecoveryStrategy {
        let category = self.classifier.classify(error);
        let strategy = self.decide_for(category, error, attempt);
        debug!(
            category = %category,
            action = %strategy.action,
            attempt = attempt,
            has_context = context.is_some(),
            "Recovery strategy decided"
        );
        strategy
    }

    /// Decision for an already-classified error
    pub fn decide_for(&self, category: ErrorCategory, error: &str, attempt: u32) -> RecoveryStrategy {
        let attempt = attempt.max(1);
        let cfg = &self.config;

        match category {
            ErrorCategory::Infrastructure => {
                if attempt <= cfg.infrastructure_max_retries {
                    RecoveryStrategy::new(
                        category,
                        RecoveryAction::WaitAndRetry,
                        format!(
                            "Infrastructure limit hit (attempt {}/{}); waiting before retry",
                            attempt, cfg.infrastructure_max_retries
                        ),
                    )
                    .with_backoff(cfg.infrastructure_backoff_secs * f64::from(attempt))
                    .with_max_retries(cfg.infrastructure_max_retries)
                } else {
                    RecoveryStrategy::new(
                        category,
                        RecoveryAction::AskUser,
                        format!(
                            "Infrastructure problem persists after {} attempts",
                            cfg.infrastructure_max_retries
                        ),
                    )
                }
            }
            ErrorCategory::Transient => RecoveryStrategy::new(
                category,
                RecoveryAction::Retry,
                "Transient failure; retrying with linear backoff",
            )
            .with_backoff(cfg.transient_backoff_secs * f64::from(attempt))
            .with_max_retries(cfg.transient_max_retries),
            ErrorCategory::Logic => RecoveryStrategy::new(
                category,
                RecoveryAction::Heal,
                "Code defect; a plain retry cannot fix it",
            )
            .with_max_retries(cfg.heal_max_retries)
            .needing_context(),
            ErrorCategory::State => RecoveryStrategy::new(
                category,
                RecoveryAction::Restart,
                "Inconsistent state; restarting the step",
            )
            .with_max_retries(1),
            ErrorCategory::Permission => RecoveryStrategy::new(
                category,
                RecoveryAction::AskUser,
                "Permission required from the user",
            ),
            ErrorCategory::UserInput => RecoveryStrategy::new(
                category,
                RecoveryAction::AskUser,
                "Input from the user is missing or invalid",
            ),
            ErrorCategory::Verification => match split_verification_failure(error) {
                VerificationVerdict::LegitimateFailure => RecoveryStrategy::new(
                    category,
                    RecoveryAction::Retry,
                    "Step did not meet its verification criteria; retrying",
                )
                .with_backoff(cfg.verification_retry_backoff_secs)
                .with_max_retries(cfg.verification_max_retries),
                VerificationVerdict::SystemBug => {
                    let reason = if matches_verifier_bug(error) {
                        "Verification system failure; escalating"
                    } else {
                        "Verification failed without a recognizable step failure; escalating"
                    };
                    RecoveryStrategy::new(category, RecoveryAction::Escalate, reason)
                        .needing_context()
                }
            },
            ErrorCategory::Unknown => {
                if attempt <= cfg.unknown_max_retries {
                    RecoveryStrategy::new(
                        category,
                        RecoveryAction::Retry,
                        "Unrecognized error; retrying once more",
                    )
                    .with_backoff(cfg.unknown_retry_backoff_secs)
                    .with_max_retries(cfg.unknown_max_retries)
                } else {
                    RecoveryStrategy::new(
                        category,
                        RecoveryAction::Escalate,
                        format!("Unrecognized error persists after {} attempts", attempt - 1),
                    )
                    .needing_context()
                }
            }
        }
    }
}

impl Default for StrategyDecider {
    fn default() -> Self {
        Self::new(StrategyConfig::default(), Arc::new(ErrorClassifier::default()))
    }
}

/// True when the text carries a broken-verifier signature.
pub fn matches_verifier_bug(error: &str) -> bool {
    let text = error.to_lowercase();
    VERIFIER_BUG_SIGNATURES.iter().any(|s| text.contains(s))
}
