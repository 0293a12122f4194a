//! Native sandbox executor
//!
//! Runs a native binary inside a private copy of the chroot template. The
//! watchdog runs in the scratch root, jails the program into `chroot/` and
//! leaves `verdict.txt` in the scratch root.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, info};

use super::{file_name, SandboxSession};
use crate::core::utils::copy_tree;
use crate::core::JudgeId;
use crate::sandbox::{run_supervised, ExecutionOutcome, WatchdogCommand};
use crate::services::JudgeServices;

pub struct NativeSandboxExecutor {
    pub(super) session: SandboxSession,
}

impl NativeSandboxExecutor {
    /// Open a scratch space and stage the jail image into it
    pub async fn new(services: &Arc<JudgeServices>, owner: JudgeId) -> Result<Self> {
        let session = SandboxSession::open(services, owner)?;
        let template = &services.config.chroot_template;
        let jail = session.jail()?;

        info!("Staging chroot template {:?} into {:?}", template, jail);
        copy_tree(template, &jail)
            .await
            .with_context(|| format!("Failed to stage chroot template {:?}", template))?;

        Ok(Self { session })
    }

    pub async fn execute(&mut self, program: &Path) -> Result<ExecutionOutcome> {
        let limits = self.session.begin()?;
        let root = self.session.root()?;
        let jail = self.session.jail()?;

        debug!("Copying program into jail");
        let name = file_name(program)?;
        fs::copy(program, jail.join(&name))
            .await
            .with_context(|| format!("Failed to copy {:?} into the jail", program))?;

        let services = self.session.services.clone();
        let identity = services.identity.identity().await?;
        let config = &services.config;
        let command = WatchdogCommand::new(limits, identity, &jail, &root)
            .with_program([format!("/{}", name)])
            .with_stdin(self.session.stdin())
            .with_timeout(config.watchdog_timeout(config.native_watchdog_timeout, limits.real_time_ms));

        let (outcome, run) = run_supervised(services.supervisor.as_ref(), &command).await?;
        info!("Native program finished: {}", outcome);
        self.session.record(run);
        Ok(outcome)
    }
}
