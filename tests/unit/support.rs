//! Scripted collaborators and a harness wiring them into a `RecoveryCore`

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use recovery_core::collaborators::{
    AuditReview, AuditService, AuditVerdict, Collaborators, DiagnosticService, MemoryStore,
    ProcessControl, RecordingBus, SandboxRequest, SandboxRun, SandboxService,
};
use recovery_core::errors::CollaboratorError;
use recovery_core::healing::HealingStatus;
use recovery_core::{RecoveryConfig, RecoveryCore};

pub const ANALYSIS_WITH_CODE: &str = "The loop index is off by one when the list is empty.\n\
Fix: guard the empty list before indexing\n\
```python\n# file: app/items.py\ndef first(items):\n    return items[0] if items else None\n```\n\
```sh\npython -m pytest tests/test_items.py\n```";

pub const ANALYSIS_WITHOUT_CODE: &str =
    "Root cause: the config key was renamed.\nSolution: read `timeout_secs` instead of `timeout`";

pub enum Script {
    Reply(String),
    Empty,
    Fail(String),
    Hang,
    Panic,
}

pub struct ScriptedDiagnostic {
    script: Script,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
    auto_fix_flags: Mutex<Vec<bool>>,
}

impl ScriptedDiagnostic {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            gate: None,
            calls: AtomicUsize::new(0),
            auto_fix_flags: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::new(Script::Reply(text.to_string()))
    }

    /// Each call waits for one permit before answering
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn auto_fix_flags(&self) -> Vec<bool> {
        self.auto_fix_flags.lock().clone()
    }
}

#[async_trait]
impl DiagnosticService for ScriptedDiagnostic {
    async fn analyze(
        &self,
        _error: &str,
        _log_context: &str,
        _step_context: &serde_json::Value,
        auto_fix: bool,
    ) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.auto_fix_flags.lock().push(auto_fix);

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        match &self.script {
            Script::Reply(text) => Ok(text.clone()),
            Script::Empty => Ok("   ".to_string()),
            Script::Fail(message) => Err(CollaboratorError::failed("diagnostic service", message.clone())),
            Script::Hang => std::future::pending().await,
            Script::Panic => panic!("diagnostic engine exploded"),
        }
    }
}

#[derive(Clone, Copy)]
pub enum SandboxScript {
    Pass,
    Fail,
    Error,
    Hang,
}

pub struct ScriptedSandbox {
    script: Mutex<SandboxScript>,
    requests: Mutex<Vec<SandboxRequest>>,
}

impl ScriptedSandbox {
    pub fn new(script: SandboxScript) -> Self {
        Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, script: SandboxScript) {
        *self.script.lock() = script;
    }

    pub fn requests(&self) -> Vec<SandboxRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl SandboxService for ScriptedSandbox {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxRun, CollaboratorError> {
        self.requests.lock().push(request);
        let script = *self.script.lock();
        match script {
            SandboxScript::Pass => Ok(SandboxRun {
                success: true,
                stdout: "1 passed".into(),
                stderr: String::new(),
            }),
            SandboxScript::Fail => Ok(SandboxRun {
                success: false,
                stdout: String::new(),
                stderr: "AssertionError".into(),
            }),
            SandboxScript::Error => Err(CollaboratorError::failed("sandbox", "container did not start")),
            SandboxScript::Hang => std::future::pending().await,
        }
    }
}

pub struct ScriptedAudit {
    verdict: Mutex<AuditVerdict>,
    reasoning: String,
    calls: AtomicUsize,
}

impl ScriptedAudit {
    pub fn new(verdict: AuditVerdict, reasoning: &str) -> Self {
        Self {
            verdict: Mutex::new(verdict),
            reasoning: reasoning.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn approving() -> Self {
        Self::new(AuditVerdict::Approve, "fix addresses the root cause")
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditService for ScriptedAudit {
    async fn review_fix(&self, _error: &str, _analysis: &str) -> Result<AuditReview, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AuditReview {
            verdict: *self.verdict.lock(),
            reasoning: self.reasoning.clone(),
        })
    }
}

#[derive(Default)]
pub struct FakeProcess {
    restarts: Mutex<Vec<String>>,
    re_execs: AtomicUsize,
    fail_restarts: bool,
}

impl FakeProcess {
    pub fn failing() -> Self {
        Self {
            fail_restarts: true,
            ..Self::default()
        }
    }

    pub fn restarts(&self) -> Vec<String> {
        self.restarts.lock().clone()
    }

    pub fn re_execs(&self) -> usize {
        self.re_execs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessControl for FakeProcess {
    async fn restart_service(&self, name: &str) -> Result<(), CollaboratorError> {
        self.restarts.lock().push(name.to_string());
        if self.fail_restarts {
            return Err(CollaboratorError::failed("process control", "unit not found"));
        }
        Ok(())
    }

    fn re_exec_self(&self) -> CollaboratorError {
        self.re_execs.fetch_add(1, Ordering::SeqCst);
        CollaboratorError::failed("process control", "re-exec disabled in tests")
    }
}

pub struct Harness {
    pub core: RecoveryCore,
    pub diagnostic: Arc<ScriptedDiagnostic>,
    pub sandbox: Arc<ScriptedSandbox>,
    pub audit: Arc<ScriptedAudit>,
    pub store: Arc<MemoryStore>,
    pub bus: Arc<RecordingBus>,
    pub process: Arc<FakeProcess>,
    pub dir: TempDir,
}

pub struct HarnessBuilder {
    diagnostic: ScriptedDiagnostic,
    sandbox: ScriptedSandbox,
    audit: ScriptedAudit,
    process: FakeProcess,
    config: RecoveryConfig,
}

impl HarnessBuilder {
    pub fn new(diagnostic: ScriptedDiagnostic) -> Self {
        Self {
            diagnostic,
            sandbox: ScriptedSandbox::new(SandboxScript::Pass),
            audit: ScriptedAudit::approving(),
            process: FakeProcess::default(),
            config: RecoveryConfig::default(),
        }
    }

    pub fn sandbox(mut self, script: SandboxScript) -> Self {
        self.sandbox = ScriptedSandbox::new(script);
        self
    }

    pub fn audit(mut self, audit: ScriptedAudit) -> Self {
        self.audit = audit;
        self
    }

    pub fn process(mut self, process: FakeProcess) -> Self {
        self.process = process;
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut RecoveryConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = self.config;
        if config.snapshot.path == RecoveryConfig::default().snapshot.path {
            config.snapshot.path = dir.path().join("phoenix_snapshot.json");
        }

        let diagnostic = Arc::new(self.diagnostic);
        let sandbox = Arc::new(self.sandbox);
        let audit = Arc::new(self.audit);
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(RecordingBus::new());
        let process = Arc::new(self.process);

        let collaborators = Collaborators {
            diagnostic: diagnostic.clone(),
            sandbox: sandbox.clone(),
            audit: audit.clone(),
            store: store.clone(),
            bus: bus.clone(),
            process: process.clone(),
        };

        Harness {
            core: RecoveryCore::new(config, collaborators),
            diagnostic,
            sandbox,
            audit,
            store,
            bus,
            process,
            dir,
        }
    }
}

impl Harness {
    pub async fn wait_for_status(&self, task_id: &str, status: HealingStatus) {
        let core = &self.core;
        wait_until(|| core.get_healing_status(task_id) == Some(status), &format!("{} to reach {}", task_id, status)).await;
    }

    /// Wait until the task has left PENDING and all healing slots are idle
    pub async fn wait_until_idle(&self) {
        let core = &self.core;
        wait_until(|| core.summary().active == 0, "all healing slots to free").await;
    }
}

/// Poll `cond` every 10ms; panic after ~10s.
pub async fn wait_until(cond: impl Fn() -> bool, what: &str) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub fn record(store: &MemoryStore, task_id: &str) -> serde_json::Value {
    let raw = store
        .peek(&format!("healing:task:{}", task_id))
        .expect("task record persisted");
    serde_json::from_str(&raw).expect("record is JSON")
}
