//! System Escalation Strategy Engine
//!
//! When step-level recovery is not enough, the engine asks the diagnostic
//! service for a system-level assessment and picks one of four escalation
//! paths: hot-patch the step, restart a dependent service, restart the whole
//! process (Phoenix Protocol), or hand over to a human.
//!
//! The assessment contract is a JSON object embedded anywhere in the
//! diagnostic response. Anything unparseable degrades to a low-confidence
//! MINOR / HOT_PATCH assessment.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::collaborators::{DiagnosticService, ProcessControl};
use crate::config::EscalationConfig;
use crate::healing::notify::{EVENT_PHOENIX_RESTART, EVENT_USER_INTERVENTION};
use crate::healing::{HealingRequest, HealingScheduler, Notifier};
use crate::observability::telemetry::log_safe;
use crate::snapshot::{SnapshotContext, SnapshotManager};

/// Confidence assigned to a degraded assessment
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Minor,
    ServiceCritical,
    SystemCritical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationStrategy {
    HotPatch,
    ServiceRestart,
    PhoenixRestart,
    UserIntervention,
}

impl fmt::Display for EscalationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HotPatch => "HOT_PATCH",
            Self::ServiceRestart => "SERVICE_RESTART",
            Self::PhoenixRestart => "PHOENIX_RESTART",
            Self::UserIntervention => "USER_INTERVENTION",
        };
        f.write_str(name)
    }
}

/// System-level assessment of a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAnalysis {
    pub root_cause: String,
    pub severity: Severity,
    pub suggested_strategy: EscalationStrategy,
    pub fix_plan: String,
    /// Always within [0, 1]
    pub confidence: f64,
}

#[derive(Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    root_cause: String,
    severity: String,
    #[serde(alias = "strategy")]
    suggested_strategy: String,
    #[serde(default)]
    fix_plan: String,
    confidence: f64,
}

impl SystemAnalysis {
    pub fn fallback(root_cause: impl Into<String>) -> Self {
        Self {
            root_cause: root_cause.into(),
            severity: Severity::Minor,
            suggested_strategy: EscalationStrategy::HotPatch,
            fix_plan: String::new(),
            confidence: FALLBACK_CONFIDENCE,
        }
    }

    /// Parse the JSON object between the first `{` and the last `}`.
    pub fn parse(text: &str) -> Option<Self> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        let raw: RawAnalysis = serde_json::from_str(&text[start..=end]).ok()?;
        if !raw.confidence.is_finite() {
            return None;
        }
        Some(Self {
            root_cause: raw.root_cause,
            severity: parse_enum(&raw.severity)?,
            suggested_strategy: parse_enum(&raw.suggested_strategy)?,
            fix_plan: raw.fix_plan,
            confidence: raw.confidence.clamp(0.0, 1.0),
        })
    }
}

/// Case- and separator-insensitive enum parse ("service-critical" -> SERVICE_CRITICAL)
fn parse_enum<T: for<'de> Deserialize<'de>>(name: &str) -> Option<T> {
    let normalized = name.trim().to_uppercase().replace(['-', ' '], "_");
    serde_json::from_value(Value::String(normalized)).ok()
}

/// The failure being escalated
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationContext {
    /// Orchestrator task that owns the failing step
    pub task_id: String,
    pub step_id: String,
    pub error: String,
    #[serde(default)]
    pub log_context: String,
    #[serde(default)]
    pub step_context: Value,
    /// In-process state to carry across a Phoenix restart
    #[serde(default)]
    pub running_state: Map<String, Value>,
}

/// What dispatch actually did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    HealingSubmitted { task_id: String },
    ServiceRestarted { service: String },
    ServiceRestartFailed { service: String, error: String },
    /// No service could be inferred; nothing was restarted
    NoServiceIdentified,
    /// Snapshot saved but the re-exec did not happen
    PhoenixFailed { error: String },
    /// Snapshot could not be saved; a human was asked instead
    PhoenixAborted,
    UserNotified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationReport {
    pub analysis: SystemAnalysis,
    pub strategy: EscalationStrategy,
    pub outcome: DispatchOutcome,
}

pub struct EscalationEngine {
    config: EscalationConfig,
    diagnostic: Arc<dyn DiagnosticService>,
    analysis_timeout: Duration,
    scheduler: HealingScheduler,
    snapshots: Arc<SnapshotManager>,
    process: Arc<dyn ProcessControl>,
    notifier: Notifier,
}

impl EscalationEngine {
    pub fn new(
        config: EscalationConfig,
        diagnostic: Arc<dyn DiagnosticService>,
        analysis_timeout: Duration,
        scheduler: HealingScheduler,
        snapshots: Arc<SnapshotManager>,
        process: Arc<dyn ProcessControl>,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            diagnostic,
            analysis_timeout,
            scheduler,
            snapshots,
            process,
            notifier,
        }
    }

    /// System-level assessment. Never fails; degrades to the fallback.
    pub async fn analyze(&self, error: &str, log_context: &str, step_context: &Value) -> SystemAnalysis {
        let request_context = json!({
            "mode": "system_escalation",
            "step_context": step_context,
            "response_contract": {
                "root_cause": "string",
                "severity": "MINOR | SERVICE_CRITICAL | SYSTEM_CRITICAL",
                "suggested_strategy": "HOT_PATCH | SERVICE_RESTART | PHOENIX_RESTART | USER_INTERVENTION",
                "fix_plan": "string",
                "confidence": "number in [0, 1]",
            },
        });

        let call = self.diagnostic.analyze(error, log_context, &request_context, false);
        let response = match tokio::time::timeout(self.analysis_timeout, call).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!("System analysis failed: {}", e);
                return SystemAnalysis::fallback(error);
            }
            Err(_) => {
                warn!(
                    "System analysis timed out after {}s",
                    self.analysis_timeout.as_secs()
                );
                return SystemAnalysis::fallback(error);
            }
        };

        match SystemAnalysis::parse(&response) {
            Some(analysis) => analysis,
            None => {
                warn!(response = %log_safe(&response), "Unparseable system analysis; using fallback");
                SystemAnalysis::fallback(error)
            }
        }
    }

    /// The suggested strategy, except that a low-confidence Phoenix restart
    /// becomes user intervention.
    pub fn decide(&self, analysis: &SystemAnalysis) -> EscalationStrategy {
        decide_strategy(analysis, self.config.phoenix_min_confidence)
    }

    /// Service named by the root cause, if any keyword matches
    pub fn infer_service(&self, root_cause: &str) -> Option<String> {
        infer_service(&self.config, root_cause)
    }

    pub async fn dispatch(
        &self,
        strategy: EscalationStrategy,
        analysis: &SystemAnalysis,
        ctx: &EscalationContext,
    ) -> DispatchOutcome {
        info!(strategy = %strategy, step_id = %ctx.step_id, "Dispatching escalation");
        match strategy {
            EscalationStrategy::HotPatch => {
                let request = HealingRequest::new(&ctx.step_id, &ctx.error)
                    .with_context(ctx.step_context.clone())
                    .with_log_context(&ctx.log_context)
                    .with_priority(self.config.hot_patch_priority);
                let task_id = self.scheduler.submit(request).await;
                DispatchOutcome::HealingSubmitted { task_id }
            }
            EscalationStrategy::ServiceRestart => {
                let Some(service) = self.infer_service(&analysis.root_cause) else {
                    warn!(root_cause = %log_safe(&analysis.root_cause), "No service identified; not restarting anything");
                    return DispatchOutcome::NoServiceIdentified;
                };
                match self.process.restart_service(&service).await {
                    Ok(()) => {
                        info!(service = %service, "Service restarted");
                        DispatchOutcome::ServiceRestarted { service }
                    }
                    Err(e) => {
                        warn!(service = %service, "Service restart failed: {}", e);
                        DispatchOutcome::ServiceRestartFailed {
                            service,
                            error: e.to_string(),
                        }
                    }
                }
            }
            EscalationStrategy::PhoenixRestart => self.phoenix(analysis, ctx).await,
            EscalationStrategy::UserIntervention => {
                self.notify_user(analysis, ctx, None).await;
                DispatchOutcome::UserNotified
            }
        }
    }

    async fn phoenix(&self, analysis: &SystemAnalysis, ctx: &EscalationContext) -> DispatchOutcome {
        let snapshot_ctx = SnapshotContext {
            task_id: ctx.task_id.clone(),
            step_id: ctx.step_id.clone(),
            reason: analysis.root_cause.clone(),
        };
        if !self.snapshots.save_snapshot(&ctx.running_state, &snapshot_ctx).await {
            warn!("Snapshot failed; refusing Phoenix restart");
            self.notify_user(analysis, ctx, Some("snapshot could not be saved")).await;
            return DispatchOutcome::PhoenixAborted;
        }

        self.notifier
            .publish(
                EVENT_PHOENIX_RESTART,
                json!({
                    "task_id": ctx.task_id,
                    "step_id": ctx.step_id,
                    "root_cause": analysis.root_cause,
                    "confidence": analysis.confidence,
                    "snapshot": self.snapshots.path().display().to_string(),
                }),
                &ctx.task_id,
            )
            .await;

        warn!(task_id = %ctx.task_id, "Phoenix Protocol: re-executing process");
        let error = self.process.re_exec_self();
        warn!("Phoenix re-exec failed: {}", error);
        DispatchOutcome::PhoenixFailed {
            error: error.to_string(),
        }
    }

    async fn notify_user(&self, analysis: &SystemAnalysis, ctx: &EscalationContext, note: Option<&str>) {
        self.notifier
            .publish(
                EVENT_USER_INTERVENTION,
                json!({
                    "task_id": ctx.task_id,
                    "step_id": ctx.step_id,
                    "error": ctx.error,
                    "root_cause": analysis.root_cause,
                    "severity": analysis.severity,
                    "fix_plan": analysis.fix_plan,
                    "confidence": analysis.confidence,
                    "note": note,
                }),
                &ctx.task_id,
            )
            .await;
    }

    /// analyze → decide → dispatch
    pub async fn escalate(&self, ctx: &EscalationContext) -> EscalationReport {
        let analysis = self
            .analyze(&ctx.error, &ctx.log_context, &ctx.step_context)
            .await;
        let strategy = self.decide(&analysis);
        let outcome = self.dispatch(strategy, &analysis, ctx).await;
        EscalationReport {
            analysis,
            strategy,
            outcome,
        }
    }
}

pub fn decide_strategy(analysis: &SystemAnalysis, phoenix_min_confidence: f64) -> EscalationStrategy {
    match analysis.suggested_strategy {
        EscalationStrategy::PhoenixRestart if analysis.confidence < phoenix_min_confidence => {
            EscalationStrategy::UserIntervention
        }
        strategy => strategy,
    }
}

/// First service (in name order) whose keywords appear in the root cause
pub fn infer_service(config: &EscalationConfig, root_cause: &str) -> Option<String> {
    let text = root_cause.to_lowercase();
    config
        .service_keywords
        .iter()
        .find(|(_, keywords)| {
            keywords
                .iter()
                .any(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
        })
        .map(|(service, _)| service.clone())
}
