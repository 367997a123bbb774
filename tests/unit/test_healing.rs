use std::sync::Arc;
use tokio::sync::Semaphore;

use recovery_core::collaborators::AuditVerdict;
use recovery_core::healing::notify::{EVENT_FIX_READY, EVENT_STARTED};
use recovery_core::healing::HealingStatus;

use super::support::{
    record, wait_until, HarnessBuilder, SandboxScript, Script, ScriptedAudit, ScriptedDiagnostic,
    ANALYSIS_WITHOUT_CODE, ANALYSIS_WITH_CODE,
};

#[tokio::test]
async fn test_happy_path_reaches_fixed_queue() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(ANALYSIS_WITH_CODE)).build();

    let task_id = h
        .core
        .submit_healing_task("step_4", "IndexError: list index out of range", serde_json::json!({"file": "app/items.py"}), "Traceback ...", 0)
        .await;
    let bus = &h.bus;
    wait_until(|| !bus.events_of_type(EVENT_FIX_READY).is_empty(), "fix_ready event").await;

    let task = h.core.get_task_by_step("step_4").unwrap();
    assert_eq!(task.task_id, task_id);
    assert_eq!(task.status, HealingStatus::Ready);
    assert_eq!(
        task.fix_description.as_deref(),
        Some("guard the empty list before indexing")
    );
    assert_eq!(task.audit_verdict, Some(AuditVerdict::Approve));
    let sandbox = task.sandbox_result.unwrap();
    assert!(sandbox.success);
    assert!(sandbox.executed);

    let fixed = h.core.get_fixed_steps();
    assert_eq!(fixed.len(), 1);
    assert_eq!(fixed[0].step_id, "step_4");
    assert_eq!(fixed[0].task_id, task_id);

    // Diagnosis is asked for a fix
    assert_eq!(h.diagnostic.auto_fix_flags(), vec![true]);

    let requests = h.sandbox.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].target_files.contains_key("app/items.py"));
    assert_eq!(requests[0].test_script, "python -m pytest tests/test_items.py");
    assert_eq!(requests[0].timeout_secs, 30);

    let types: Vec<String> = h.bus.events().into_iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![EVENT_STARTED.to_string(), EVENT_FIX_READY.to_string()]);

    assert_eq!(record(&h.store, &task_id)["status"], "ready");
}

#[tokio::test]
async fn test_acknowledge_consumes_fix_once() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(ANALYSIS_WITH_CODE)).build();
    let task_id = h
        .core
        .submit_healing_task("step_1", "TypeError", serde_json::Value::Null, "", 0)
        .await;
    let core = &h.core;
    wait_until(|| !core.get_fixed_steps().is_empty(), "fix to be ready").await;

    assert!(h.core.acknowledge_fix("step_1", "retry_step").await);
    assert!(h.core.get_fixed_steps().is_empty());
    assert_eq!(h.core.get_healing_status(&task_id), Some(HealingStatus::Acknowledged));

    let persisted = record(&h.store, &task_id);
    assert_eq!(persisted["status"], "acknowledged");
    assert_eq!(persisted["acknowledged_action"], "retry_step");

    assert!(!h.core.acknowledge_fix("step_1", "retry_step").await);
    assert!(!h.core.acknowledge_fix("never_submitted", "retry_step").await);
}

#[tokio::test]
async fn test_at_most_max_concurrent_tasks_leave_pending() {
    let gate = Arc::new(Semaphore::new(0));
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(ANALYSIS_WITHOUT_CODE).gated(gate.clone()))
        .configure(|c| c.healing.max_concurrent = 3)
        .build();

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            h.core
                .submit_healing_task(&format!("step_{}", i), "SyntaxError", serde_json::Value::Null, "", 0)
                .await,
        );
    }

    let statuses: Vec<HealingStatus> = ids
        .iter()
        .map(|id| h.core.get_healing_status(id).unwrap())
        .collect();
    let started = statuses.iter().filter(|s| **s != HealingStatus::Pending).count();
    assert_eq!(started, 3);
    assert_eq!(statuses[3], HealingStatus::Pending);
    assert_eq!(h.core.summary().active, 3);
    assert_eq!(h.core.summary().backlog, 1);

    // Free one slot; the fourth task is promoted
    gate.add_permits(1);
    let core = &h.core;
    let fourth = ids[3].clone();
    wait_until(
        || core.get_healing_status(&fourth) != Some(HealingStatus::Pending),
        "fourth task to be promoted",
    )
    .await;
    assert!(h.core.summary().active <= 3);

    gate.add_permits(3);
    h.wait_until_idle().await;
    assert_eq!(h.core.get_fixed_steps().len(), 4);
    assert_eq!(h.core.summary().by_status.get("ready"), Some(&4));
}

#[tokio::test]
async fn test_higher_priority_promoted_first() {
    let gate = Arc::new(Semaphore::new(0));
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(ANALYSIS_WITHOUT_CODE).gated(gate.clone()))
        .configure(|c| c.healing.max_concurrent = 1)
        .build();

    let blocker = h
        .core
        .submit_healing_task("blocker", "SyntaxError", serde_json::Value::Null, "", 0)
        .await;
    let low = h
        .core
        .submit_healing_task("low", "SyntaxError", serde_json::Value::Null, "", 1)
        .await;
    let high = h
        .core
        .submit_healing_task("high", "SyntaxError", serde_json::Value::Null, "", 2)
        .await;

    assert_eq!(h.core.get_healing_status(&low), Some(HealingStatus::Pending));
    assert_eq!(h.core.get_healing_status(&high), Some(HealingStatus::Pending));

    gate.add_permits(1);
    h.wait_for_status(&blocker, HealingStatus::Ready).await;
    let core = &h.core;
    wait_until(
        || core.get_healing_status(&high) != Some(HealingStatus::Pending),
        "high-priority task to start",
    )
    .await;
    assert_eq!(h.core.get_healing_status(&low), Some(HealingStatus::Pending));
    assert_eq!(h.core.get_task_by_step("high").unwrap().priority, 2);

    gate.add_permits(2);
    h.wait_for_status(&low, HealingStatus::Ready).await;
}

#[tokio::test(start_paused = true)]
async fn test_diagnosis_timeout_fails_task() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::new(Script::Hang))
        .configure(|c| c.healing.diagnosis_timeout_secs = 2)
        .build();
    let task_id = h
        .core
        .submit_healing_task("step_9", "SyntaxError", serde_json::Value::Null, "", 0)
        .await;

    h.wait_for_status(&task_id, HealingStatus::Failed).await;
    let task = h.core.get_task_by_step("step_9").unwrap();
    assert_eq!(
        task.error_message.as_deref(),
        Some("diagnostic service timed out after 2 seconds")
    );
    assert_eq!(h.audit.calls(), 0);
    h.wait_until_idle().await;
}

#[tokio::test]
async fn test_audit_reject_fails_and_never_reaches_fixed_queue() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(ANALYSIS_WITH_CODE))
        .audit(ScriptedAudit::new(AuditVerdict::Reject, "patch hides the real bug"))
        .build();
    let task_id = h
        .core
        .submit_healing_task("step_2", "KeyError: 'id'", serde_json::Value::Null, "", 0)
        .await;

    h.wait_for_status(&task_id, HealingStatus::Failed).await;
    h.wait_until_idle().await;

    let task = h.core.get_task_by_step("step_2").unwrap();
    assert_eq!(task.audit_verdict, Some(AuditVerdict::Reject));
    assert!(task.error_message.unwrap().contains("patch hides the real bug"));
    assert!(h.core.get_fixed_steps().is_empty());
    assert!(!h.core.acknowledge_fix("step_2", "retry").await);
    assert!(h.bus.events_of_type(EVENT_FIX_READY).is_empty());
}

#[tokio::test]
async fn test_adjust_verdict_is_ready() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(ANALYSIS_WITHOUT_CODE))
        .audit(ScriptedAudit::new(AuditVerdict::Adjust, "rename the variable too"))
        .build();
    let task_id = h
        .core
        .submit_healing_task("step_3", "NameError", serde_json::Value::Null, "", 0)
        .await;
    h.wait_for_status(&task_id, HealingStatus::Ready).await;
    assert_eq!(
        h.core.get_task_by_step("step_3").unwrap().audit_reasoning.as_deref(),
        Some("rename the variable too")
    );
}

#[tokio::test]
async fn test_no_code_skips_sandbox() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(ANALYSIS_WITHOUT_CODE)).build();
    let task_id = h
        .core
        .submit_healing_task("step_5", "AttributeError", serde_json::Value::Null, "", 0)
        .await;
    h.wait_for_status(&task_id, HealingStatus::Ready).await;

    let task = h.core.get_task_by_step("step_5").unwrap();
    let sandbox = task.sandbox_result.unwrap();
    assert!(sandbox.success);
    assert!(!sandbox.executed);
    assert_eq!(sandbox.message, "no code to test");
    assert!(h.sandbox.requests().is_empty());
    assert_eq!(
        task.fix_description.as_deref(),
        Some("read `timeout_secs` instead of `timeout`")
    );
}

#[tokio::test]
async fn test_sandbox_failure_does_not_block() {
    for script in [SandboxScript::Fail, SandboxScript::Error] {
        let h = HarnessBuilder::new(ScriptedDiagnostic::replying(ANALYSIS_WITH_CODE))
            .sandbox(script)
            .build();
        let task_id = h
            .core
            .submit_healing_task("step_6", "ValueError", serde_json::Value::Null, "", 0)
            .await;
        h.wait_for_status(&task_id, HealingStatus::Ready).await;
        let sandbox = h.core.get_task_by_step("step_6").unwrap().sandbox_result.unwrap();
        assert!(!sandbox.success);
        assert_eq!(h.audit.calls(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_hung_sandbox_is_cut_off() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(ANALYSIS_WITH_CODE))
        .sandbox(SandboxScript::Hang)
        .configure(|c| c.healing.sandbox_timeout_secs = 1)
        .build();
    let task_id = h
        .core
        .submit_healing_task("step_7", "ValueError", serde_json::Value::Null, "", 0)
        .await;
    h.wait_for_status(&task_id, HealingStatus::Ready).await;

    let sandbox = h.core.get_task_by_step("step_7").unwrap().sandbox_result.unwrap();
    assert!(!sandbox.success);
    assert!(sandbox.message.contains("timed out after 6 seconds"));
}

#[tokio::test]
async fn test_empty_analysis_fails() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::new(Script::Empty)).build();
    let task_id = h
        .core
        .submit_healing_task("step_8", "SyntaxError", serde_json::Value::Null, "", 0)
        .await;
    h.wait_for_status(&task_id, HealingStatus::Failed).await;
    let message = h.core.get_task_by_step("step_8").unwrap().error_message.unwrap();
    assert!(message.contains("empty analysis"));
}

#[tokio::test]
async fn test_diagnostic_error_fails() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::new(Script::Fail("model unavailable".into()))).build();
    let task_id = h
        .core
        .submit_healing_task("step_8", "SyntaxError", serde_json::Value::Null, "", 0)
        .await;
    h.wait_for_status(&task_id, HealingStatus::Failed).await;
    let message = h.core.get_task_by_step("step_8").unwrap().error_message.unwrap();
    assert_eq!(message, "diagnostic service failed: model unavailable");
}

#[tokio::test]
async fn test_panicking_collaborator_is_contained() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::new(Script::Panic))
        .configure(|c| c.healing.max_concurrent = 1)
        .build();
    let first = h
        .core
        .submit_healing_task("step_a", "SyntaxError", serde_json::Value::Null, "", 0)
        .await;
    let second = h
        .core
        .submit_healing_task("step_b", "SyntaxError", serde_json::Value::Null, "", 0)
        .await;

    h.wait_for_status(&first, HealingStatus::Failed).await;
    // Slot released and the backlog promoted despite the panic
    h.wait_for_status(&second, HealingStatus::Failed).await;
    h.wait_until_idle().await;
    assert!(h
        .core
        .get_task_by_step("step_a")
        .unwrap()
        .error_message
        .unwrap()
        .contains("panicked"));
}

#[tokio::test]
async fn test_invalid_request_fails_fast() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(ANALYSIS_WITHOUT_CODE)).build();
    let task_id = h
        .core
        .submit_healing_task("step_x", "SyntaxError", serde_json::json!("not an object"), "", 0)
        .await;

    assert_eq!(h.core.get_healing_status(&task_id), Some(HealingStatus::Failed));
    let task = h.core.get_task_by_step("step_x").unwrap();
    assert!(task.error_message.unwrap().starts_with("invalid healing request"));
    assert_eq!(h.diagnostic.calls(), 0);
    assert_eq!(h.core.summary().active, 0);
    assert_eq!(record(&h.store, &task_id)["status"], "failed");
}

#[tokio::test]
async fn test_one_fixed_entry_per_step() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(ANALYSIS_WITHOUT_CODE)).build();

    let first = h
        .core
        .submit_healing_task("step_r", "SyntaxError", serde_json::Value::Null, "", 0)
        .await;
    h.wait_for_status(&first, HealingStatus::Ready).await;
    let core = &h.core;
    wait_until(|| core.get_fixed_steps().len() == 1, "first fix").await;

    let second = h
        .core
        .submit_healing_task("step_r", "SyntaxError again", serde_json::Value::Null, "", 0)
        .await;
    wait_until(
        || core.get_fixed_steps().first().map(|f| f.task_id.clone()) == Some(second.clone()),
        "second fix to replace the first",
    )
    .await;

    assert_eq!(h.core.get_fixed_steps().len(), 1);
    assert_eq!(h.core.get_task_by_step("step_r").unwrap().task_id, second);
    assert_eq!(h.core.tasks().len(), 2);
    assert_eq!(h.core.tasks()[0].task_id, first);

    let replaced = h.core.scheduler().task(&first).unwrap();
    assert_eq!(replaced.status, HealingStatus::Ready);
    assert_eq!(replaced.superseded_by.as_deref(), Some(second.as_str()));
    assert!(h.core.scheduler().task(&second).unwrap().superseded_by.is_none());
}

#[tokio::test]
async fn test_log_context_keeps_most_recent_lines() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::new(Script::Hang))
        .configure(|c| c.healing.log_context_limit = 10)
        .build();
    let task_id = h
        .core
        .submit_healing_task("step_l", "SyntaxError", serde_json::Value::Null, "old old old\nnewest", 0)
        .await;
    let task = h.core.scheduler().task(&task_id).unwrap();
    assert_eq!(task.log_context, "old\nnewest");
}

#[tokio::test]
async fn test_unavailable_store_does_not_affect_healing() {
    let h = HarnessBuilder::new(ScriptedDiagnostic::replying(ANALYSIS_WITHOUT_CODE)).build();
    h.store.set_available(false);

    let task_id = h
        .core
        .submit_healing_task("step_s", "SyntaxError", serde_json::Value::Null, "", 0)
        .await;
    h.wait_for_status(&task_id, HealingStatus::Ready).await;
    assert!(h.store.is_empty());
}
