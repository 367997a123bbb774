//! OS-backed process control
//!
//! Service restarts run a configured command template; the Phoenix path
//! replaces the current process with a fresh copy of the same binary and
//! arguments.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::ProcessControl;
use crate::config::EscalationConfig;
use crate::errors::CollaboratorError;

/// Placeholder substituted with the service name in the restart template
pub const SERVICE_PLACEHOLDER: &str = "{service}";

pub struct OsProcessControl {
    /// Program and arguments, e.g. `["systemctl", "restart", "{service}"]`
    restart_template: Vec<String>,
}

impl OsProcessControl {
    pub fn new(restart_template: Vec<String>) -> Self {
        Self { restart_template }
    }

    /// Uses `escalation.restart_command` as the restart template
    pub fn from_config(config: &EscalationConfig) -> Self {
        Self::new(config.restart_command.clone())
    }

    fn restart_command(&self, name: &str) -> Option<(String, Vec<String>)> {
        let (program, args) = self.restart_template.split_first()?;
        let args = args
            .iter()
            .map(|a| a.replace(SERVICE_PLACEHOLDER, name))
            .collect();
        Some((program.replace(SERVICE_PLACEHOLDER, name), args))
    }
}

#[async_trait]
impl ProcessControl for OsProcessControl {
    async fn restart_service(&self, name: &str) -> Result<(), CollaboratorError> {
        let (program, args) = self
            .restart_command(name)
            .ok_or_else(|| CollaboratorError::failed("process control", "no restart command configured"))?;

        info!(service = name, program = program.as_str(), "Restarting service");
        let status = Command::new(&program)
            .args(&args)
            .status()
            .await
            .map_err(|e| CollaboratorError::failed("process control", e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(CollaboratorError::failed(
                "process control",
                format!("restart of '{}' exited with {}", name, status),
            ))
        }
    }

    #[cfg(unix)]
    fn re_exec_self(&self) -> CollaboratorError {
        use std::os::unix::process::CommandExt;

        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => return CollaboratorError::failed("process control", e.to_string()),
        };
        let args: Vec<String> = std::env::args().skip(1).collect();
        warn!(exe = %exe.display(), "Re-executing current process");

        let err = std::process::Command::new(exe).args(args).exec();
        CollaboratorError::failed("process control", format!("exec failed: {}", err))
    }

    #[cfg(not(unix))]
    fn re_exec_self(&self) -> CollaboratorError {
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(e) => return CollaboratorError::failed("process control", e.to_string()),
        };
        let args: Vec<String> = std::env::args().skip(1).collect();
        warn!(exe = %exe.display(), "Spawning replacement process");

        match std::process::Command::new(exe).args(args).spawn() {
            Ok(_) => std::process::exit(0),
            Err(e) => CollaboratorError::failed("process control", format!("spawn failed: {}", e)),
        }
    }
}
