//! Sandbox account
//!
//! The watchdog drops privileges to a dedicated account. The account is
//! provisioned once per process and its uid/gid are cached for every later
//! execution.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::unistd::User;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::escalated;

const USERADD: &str = "useradd";
/// `useradd` exit code for "user already exists"
const USERADD_EXISTS: i32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxIdentity {
    pub uid: u32,
    pub gid: u32,
}

/// Init-once lookup of the sandbox account
pub struct IdentityService {
    escalation: Option<String>,
    useradd: String,
    user: String,
    timeout: Duration,
    cached: OnceCell<SandboxIdentity>,
}

impl IdentityService {
    pub fn new(escalation: Option<String>, user: impl Into<String>, timeout: Duration) -> Self {
        Self {
            escalation,
            useradd: USERADD.to_string(),
            user: user.into(),
            timeout,
            cached: OnceCell::new(),
        }
    }

    #[cfg(test)]
    pub fn with_useradd(mut self, program: impl Into<String>) -> Self {
        self.useradd = program.into();
        self
    }

    /// Service that never touches the system account database
    #[cfg(test)]
    pub fn fixed(identity: SandboxIdentity) -> Self {
        Self {
            escalation: None,
            useradd: USERADD.to_string(),
            user: String::new(),
            timeout: Duration::ZERO,
            cached: OnceCell::new_with(Some(identity)),
        }
    }

    pub async fn identity(&self) -> Result<SandboxIdentity> {
        self.cached
            .get_or_try_init(|| self.provision())
            .await
            .copied()
    }

    async fn provision(&self) -> Result<SandboxIdentity> {
        let mut child = escalated(self.escalation.as_deref(), &self.useradd)
            .args(["-U", "-M", "-s", "/bin/false", self.user.as_str()])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to run useradd for the sandbox account")?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.context("Failed to wait for useradd")?,
            Err(_) => {
                warn!("useradd for sandbox account {} timed out", self.user);
                anyhow::bail!(
                    "useradd for sandbox account {} did not finish within {:?}",
                    self.user,
                    self.timeout
                );
            }
        };

        match status.code() {
            Some(0) => info!("Created sandbox account {}", self.user),
            Some(USERADD_EXISTS) => debug!("Sandbox account {} already exists", self.user),
            other => anyhow::bail!(
                "useradd for sandbox account {} failed with {:?}",
                self.user,
                other
            ),
        }

        let user = User::from_name(&self.user)
            .with_context(|| format!("Failed to look up sandbox account {}", self.user))?
            .ok_or_else(|| anyhow::anyhow!("Sandbox account {} does not exist", self.user))?;

        let identity = SandboxIdentity {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        };
        info!(
            "Sandbox account {} resolved to uid={} gid={}",
            self.user, identity.uid, identity.gid
        );
        Ok(identity)
    }
}
