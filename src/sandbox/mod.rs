//! Sandbox module - Watchdog supervisor protocol
//!
//! This module talks to the external privileged watchdog:
//! - Outcome and limit types for one supervised run
//! - Verdict file parsing
//! - Command-line construction and process supervision
//! - Sandbox account provisioning
//!
//! The sandbox module does NOT:
//! - Prepare jails or stage files (that's the executor's job)
//! - Map outcomes to platform verdicts
//! - Enforce limits itself

pub mod identity;
pub mod outcome;
pub mod verdict_file;
pub mod watchdog;

use std::ffi::OsStr;

use tokio::process::Command;

pub use identity::{IdentityService, SandboxIdentity};
pub use outcome::{ExecutionOutcome, OutcomeKind, ResourceLimits};
pub use verdict_file::{parse_verdict, VERDICT_FILE};
pub use watchdog::{run_supervised, Supervisor, SupervisorRun, WatchdogCommand, WatchdogSupervisor};

/// `program` wrapped in the privilege escalation command, if any
pub fn escalated(escalation: Option<&str>, program: impl AsRef<OsStr>) -> Command {
    match escalation {
        Some(wrapper) => {
            let mut cmd = Command::new(wrapper);
            cmd.arg(program);
            cmd
        }
        None => Command::new(program),
    }
}
