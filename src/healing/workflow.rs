//! Per-task healing pipeline
//!
//! ANALYZING → FIXING → SANDBOX_TESTING → GRISHA_REVIEW → READY, with any
//! phase able to short-circuit to FAILED. Phases run strictly in order and
//! each one's record is persisted before the next begins. Whatever happens,
//! including a panic inside a collaborator, the slot is released and the
//! backlog re-scanned.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::{error, info, warn};

use super::extract::{
    extract_code_blocks, extract_fix_description, target_files, test_script, CodeBlock,
};
use super::scheduler::{HealingScheduler, WorkflowServices};
use super::task::{HealingStatus, HealingTask, SandboxReport};
use crate::collaborators::{AuditReview, AuditVerdict, SandboxRequest};
use crate::config::HealingConfig;
use crate::errors::{CollaboratorError, HealingError, RecoveryError};

const DIAGNOSTIC: &str = "diagnostic service";
const SANDBOX: &str = "sandbox";
const AUDIT: &str = "audit service";

/// Spawned entry point
pub(super) async fn run(scheduler: HealingScheduler, task_id: String) {
    let outcome = AssertUnwindSafe(execute(&scheduler, &task_id))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => fail_task(&scheduler, &task_id, failure_message(&e)).await,
        Err(_) => {
            error!(task_id = %task_id, "Healing workflow panicked");
            fail_task(&scheduler, &task_id, "healing workflow panicked".to_string()).await;
        }
    }

    scheduler.finish(&task_id);
}

async fn execute(scheduler: &HealingScheduler, task_id: &str) -> Result<(), RecoveryError> {
    let services = scheduler.services();
    let config = scheduler.config();

    // ANALYZING was entered at admission
    let task = scheduler
        .task(task_id)
        .ok_or_else(|| HealingError::TaskNotFound(task_id.to_string()))?;
    services.persister.persist(&task).await;
    services.notifier.started(&task).await;

    let analysis = diagnose(services, config, &task).await?;
    let task = scheduler.advance(task_id, HealingStatus::Fixing, |t| {
        t.diagnostic_analysis = Some(analysis.clone());
    })?;
    services.persister.persist(&task).await;

    let fix_description = extract_fix_description(&analysis);
    let blocks = extract_code_blocks(&analysis);
    let (_, task) = scheduler.modify(task_id, |t| {
        t.fix_description = Some(fix_description);
        t.touch();
    })?;
    services.persister.persist(&task).await;

    let task = scheduler.advance(task_id, HealingStatus::SandboxTesting, |_| {})?;
    services.persister.persist(&task).await;

    let report = sandbox(services, config, &blocks).await;
    if !report.success {
        info!(task_id, "Sandbox validation failed: {}; continuing to audit", report.message);
    }
    let task = scheduler.advance(task_id, HealingStatus::GrishaReview, |t| {
        t.sandbox_result = Some(report);
    })?;
    services.persister.persist(&task).await;

    let review = audit(services, config, &task.error, &analysis).await?;
    if review.verdict == AuditVerdict::Reject {
        warn!(task_id, "Audit rejected the fix");
        let (_, task) = scheduler.modify(task_id, |t| {
            t.audit_verdict = Some(review.verdict);
            t.audit_reasoning = Some(review.reasoning.clone());
            t.fail(format!("audit rejected the fix: {}", review.reasoning));
        })?;
        services.persister.persist(&task).await;
        return Ok(());
    }

    let task = scheduler.advance(task_id, HealingStatus::Ready, |t| {
        t.audit_verdict = Some(review.verdict);
        t.audit_reasoning = Some(review.reasoning);
    })?;
    // Durable before anyone is told
    services.persister.persist(&task).await;
    scheduler.push_fixed(task.fixed_step_info());
    services.notifier.fix_ready(&task).await;
    info!(task_id, step_id = %task.step_id, "Fix ready");
    Ok(())
}

async fn diagnose(
    services: &WorkflowServices,
    config: &HealingConfig,
    task: &HealingTask,
) -> Result<String, CollaboratorError> {
    let call = services
        .diagnostic
        .analyze(&task.error, &task.log_context, &task.step_context, true);

    match tokio::time::timeout(config.diagnosis_timeout(), call).await {
        Err(_) => Err(CollaboratorError::timeout(DIAGNOSTIC, config.diagnosis_timeout_secs)),
        Ok(Err(e)) => Err(e),
        Ok(Ok(analysis)) if analysis.trim().is_empty() => Err(CollaboratorError::failed(
            DIAGNOSTIC,
            "returned an empty analysis",
        )),
        Ok(Ok(analysis)) => Ok(analysis),
    }
}

/// Never fails the task: an unverifiable fix is annotated, not rejected.
async fn sandbox(
    services: &WorkflowServices,
    config: &HealingConfig,
    blocks: &[CodeBlock],
) -> SandboxReport {
    if blocks.is_empty() {
        return SandboxReport::nothing_to_test();
    }

    let request = SandboxRequest {
        test_script: test_script(blocks),
        target_files: target_files(blocks),
        command: config.sandbox_command.clone(),
        timeout_secs: config.sandbox_timeout_secs,
    };

    let guard = config.sandbox_guard();
    match tokio::time::timeout(guard, services.sandbox.run(request)).await {
        Ok(Ok(run)) => SandboxReport::from_run(run),
        Ok(Err(e)) => SandboxReport::errored(e.to_string()),
        Err(_) => SandboxReport::errored(CollaboratorError::timeout(SANDBOX, guard.as_secs()).to_string()),
    }
}

async fn audit(
    services: &WorkflowServices,
    config: &HealingConfig,
    error: &str,
    analysis: &str,
) -> Result<AuditReview, CollaboratorError> {
    match tokio::time::timeout(config.audit_timeout(), services.audit.review_fix(error, analysis)).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::timeout(AUDIT, config.audit_timeout_secs)),
    }
}

fn failure_message(err: &RecoveryError) -> String {
    match err {
        RecoveryError::Collaborator(e) => e.to_string(),
        RecoveryError::Healing(e) => e.to_string(),
        other => other.to_string(),
    }
}

async fn fail_task(scheduler: &HealingScheduler, task_id: &str, message: String) {
    warn!(task_id, "Healing task failed: {}", message);
    match scheduler.modify(task_id, |t| t.fail(message)) {
        Ok((true, task)) => {
            scheduler.services().persister.persist(&task).await;
        }
        Ok((false, _)) => {}
        Err(e) => warn!(task_id, "Could not record failure: {}", e),
    }
}
