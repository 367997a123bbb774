//! Self-healing of failed execution steps
//!
//! A failed step submitted for healing becomes a [`HealingTask`] that the
//! [`HealingScheduler`] admits under a concurrency bound, or parks in a
//! priority backlog until a slot frees. Each admitted task runs the workflow
//! pipeline: diagnose, derive a fix, validate it in the sandbox, have it
//! audited, and finally land in the fixed queue for the orchestrator to pick
//! up and acknowledge.

pub mod backlog;
pub mod extract;
pub mod notify;
pub mod persist;
pub mod scheduler;
pub mod task;
mod workflow;

pub use backlog::Backlog;
pub use notify::Notifier;
pub use persist::TaskPersister;
pub use scheduler::{HealingRequest, HealingScheduler, SchedulerSummary};
pub use task::{FixedStepInfo, HealingStatus, HealingTask, PersistedTaskRecord, SandboxReport};
