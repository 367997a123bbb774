use serde_json::json;

use recovery_core::collaborators::KeyValueStore;
use recovery_core::escalation::{
    DispatchOutcome, EscalationContext, EscalationStrategy, Severity, FALLBACK_CONFIDENCE,
};
use recovery_core::healing::notify::{EVENT_PHOENIX_RESTART, EVENT_USER_INTERVENTION};
use recovery_core::redact::REDACTED;

use super::support::{FakeProcess, HarnessBuilder, Script, ScriptedDiagnostic};

fn analysis(strategy: &str, root_cause: &str, confidence: f64) -> String {
    format!(
        "Assessment follows.\n{}\n",
        json!({
            "root_cause": root_cause,
            "severity": "SYSTEM_CRITICAL",
            "suggested_strategy": strategy,
            "fix_plan": "restart and resume",
            "confidence": confidence,
        })
    )
}

fn context() -> EscalationContext {
    let mut running_state = serde_json::Map::new();
    running_state.insert("current_step".into(), json!("step_12"));
    running_state.insert("api_key".into(), json!("sk-live-0000"));
    running_state.insert("plan".into(), json!({"steps": [1, 2, 3]}));
    running_state.insert("attempts".into(), json!(3));

    EscalationContext {
        task_id: "task_7".into(),
        step_id: "step_12".into(),
        error: "orchestrator stopped responding".into(),
        log_context: "heartbeat missed x3".into(),
        step_context: json!({"tool": "terminal"}),
        running_state,
    }
}

#[tokio::test]
async fn test_service_restart_for_named_service() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(&analysis(
        "SERVICE_RESTART",
        "Redis connection pool exhausted",
        0.8,
    )))
    .build();

    let report = h.core.escalate(&context()).await;

    assert_eq!(report.strategy, EscalationStrategy::ServiceRestart);
    assert_eq!(
        report.outcome,
        DispatchOutcome::ServiceRestarted {
            service: "redis".into()
        }
    );
    assert_eq!(h.process.restarts(), vec!["redis".to_string()]);
    // System analysis is not a fix request
    assert_eq!(h.diagnostic.auto_fix_flags(), vec![false]);
}

#[tokio::test]
async fn test_failed_service_restart_is_reported() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(&analysis(
        "service-restart",
        "postgresql refuses new connections",
        0.8,
    )))
    .process(FakeProcess::failing())
    .build();

    let report = h.core.escalate(&context()).await;
    match report.outcome {
        DispatchOutcome::ServiceRestartFailed { service, error } => {
            assert_eq!(service, "postgres");
            assert!(error.contains("unit not found"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_no_matching_service_restarts_nothing() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(&analysis(
        "SERVICE_RESTART",
        "an unnamed daemon crashed",
        0.8,
    )))
    .build();

    let report = h.core.escalate(&context()).await;
    assert_eq!(report.outcome, DispatchOutcome::NoServiceIdentified);
    assert!(h.process.restarts().is_empty());
}

#[tokio::test]
async fn test_phoenix_snapshots_then_re_execs() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(&analysis(
        "PHOENIX_RESTART",
        "orchestrator event loop wedged",
        0.9,
    )))
    .build();
    h.store
        .set("orchestrator:session_id", "sess-42".into(), std::time::Duration::from_secs(60))
        .await
        .unwrap();

    let report = h.core.escalate(&context()).await;

    assert_eq!(report.strategy, EscalationStrategy::PhoenixRestart);
    assert!(matches!(report.outcome, DispatchOutcome::PhoenixFailed { .. }));
    assert_eq!(h.process.re_execs(), 1);

    let events = h.bus.events_of_type(EVENT_PHOENIX_RESTART);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].correlation_id, "task_7");

    // What the restarted process sees
    let snapshot = h.core.resume_from_snapshot().expect("snapshot saved");
    assert_eq!(snapshot.task_id, "task_7");
    assert_eq!(snapshot.step_id, "step_12");
    assert_eq!(snapshot.reason, "orchestrator event loop wedged");
    assert_eq!(
        snapshot.external_state.get("orchestrator:session_id").map(String::as_str),
        Some("sess-42")
    );
    assert!(!snapshot.external_state.contains_key("orchestrator:current_plan"));
    assert_eq!(snapshot.running_state["current_step"], "step_12");
    assert_eq!(snapshot.running_state["api_key"], REDACTED);
    assert_eq!(snapshot.running_state["attempts"], 3);
    assert!(snapshot.running_state["plan"].is_string());

    assert!(h.core.clear_snapshot());
    assert!(h.core.resume_from_snapshot().is_none());
    assert!(!h.core.clear_snapshot());
}

#[tokio::test]
async fn test_low_confidence_phoenix_asks_user() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(&analysis(
        "PHOENIX_RESTART",
        "maybe a wedged loop",
        0.3,
    )))
    .build();

    let report = h.core.escalate(&context()).await;

    assert_eq!(report.strategy, EscalationStrategy::UserIntervention);
    assert_eq!(report.outcome, DispatchOutcome::UserNotified);
    assert_eq!(h.process.re_execs(), 0);
    assert!(h.core.resume_from_snapshot().is_none());

    let events = h.bus.events_of_type(EVENT_USER_INTERVENTION);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["root_cause"], "maybe a wedged loop");
}

#[tokio::test]
async fn test_phoenix_aborts_when_snapshot_cannot_be_written() {
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let path = blocker.path().join("phoenix_snapshot.json");
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(&analysis(
        "PHOENIX_RESTART",
        "orchestrator event loop wedged",
        0.95,
    )))
    .configure(|c| c.snapshot.path = path)
    .build();

    let report = h.core.escalate(&context()).await;

    assert_eq!(report.outcome, DispatchOutcome::PhoenixAborted);
    assert_eq!(h.process.re_execs(), 0);
    assert!(h.bus.events_of_type(EVENT_PHOENIX_RESTART).is_empty());
    let notes = h.bus.events_of_type(EVENT_USER_INTERVENTION);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].payload["note"], "snapshot could not be saved");
}

#[tokio::test]
async fn test_hot_patch_submits_priority_task() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(&analysis(
        "HOT_PATCH",
        "off-by-one in the planner",
        0.7,
    )))
    .build();

    let report = h.core.escalate(&context()).await;

    let DispatchOutcome::HealingSubmitted { task_id } = report.outcome else {
        panic!("expected a healing task, got {:?}", report.outcome);
    };
    let task = h.core.get_task_by_step("step_12").unwrap();
    assert_eq!(task.task_id, task_id);
    assert_eq!(task.priority, 1);
    assert_eq!(task.error, "orchestrator stopped responding");
}

#[tokio::test]
async fn test_unparseable_analysis_falls_back_to_hot_patch() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying("I am not sure what happened here.")).build();

    let report = h.core.escalate(&context()).await;

    assert_eq!(report.analysis.root_cause, "orchestrator stopped responding");
    assert_eq!(report.analysis.confidence, FALLBACK_CONFIDENCE);
    assert_eq!(report.strategy, EscalationStrategy::HotPatch);
    assert!(matches!(report.outcome, DispatchOutcome::HealingSubmitted { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_hung_analysis_times_out_to_minor_hot_patch() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::new(Script::Hang))
        .configure(|c| c.healing.diagnosis_timeout_secs = 2)
        .build();

    let report = h.core.escalate(&context()).await;

    assert_eq!(report.analysis.severity, Severity::Minor);
    assert_eq!(report.analysis.suggested_strategy, EscalationStrategy::HotPatch);
    assert_eq!(report.analysis.confidence, FALLBACK_CONFIDENCE);
    assert_eq!(report.analysis.root_cause, "orchestrator stopped responding");
    assert_eq!(report.strategy, EscalationStrategy::HotPatch);
    assert!(matches!(report.outcome, DispatchOutcome::HealingSubmitted { .. }));
}

#[tokio::test]
async fn test_failed_analysis_call_falls_back() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::new(Script::Fail("upstream 500".into()))).build();

    let report = h.core.escalate(&context()).await;

    assert_eq!(report.analysis.severity, Severity::Minor);
    assert_eq!(report.analysis.suggested_strategy, EscalationStrategy::HotPatch);
    assert_eq!(report.analysis.confidence, FALLBACK_CONFIDENCE);
    assert_eq!(h.process.restarts(), Vec::<String>::new());
    assert_eq!(h.process.re_execs(), 0);
}
