//! Process-scoped services
//!
//! Everything that used to be a global: configuration, the language table,
//! the cached sandbox account, the supervisor, the scratch registry and the
//! cleanup registry. Built once in `main` and shared by `Arc`.

use std::sync::Arc;

use anyhow::Result;

use crate::config::JudgeConfig;
use crate::core::JudgeId;
use crate::languages::LanguageTable;
use crate::sandbox::{IdentityService, Supervisor, WatchdogSupervisor};
use crate::storage::{Janitor, ScratchRegistry, ScratchSpace};

pub struct JudgeServices {
    pub config: JudgeConfig,
    pub languages: LanguageTable,
    pub identity: IdentityService,
    pub supervisor: Arc<dyn Supervisor>,
    pub scratch: Arc<ScratchRegistry>,
    pub janitor: Janitor,
}

impl JudgeServices {
    /// Services backed by the real watchdog and sandbox account
    pub fn new(config: JudgeConfig) -> Result<Self> {
        let languages = LanguageTable::builtin()?;
        let identity = IdentityService::new(
            config.escalation_command.clone(),
            config.sandbox_user.clone(),
            config.provision_timeout,
        );
        let supervisor = Arc::new(WatchdogSupervisor::new(
            config.escalation_command.clone(),
            config.watchdog_binary.clone(),
        ));
        Ok(Self::with_parts(config, languages, identity, supervisor))
    }

    pub fn with_parts(
        config: JudgeConfig,
        languages: LanguageTable,
        identity: IdentityService,
        supervisor: Arc<dyn Supervisor>,
    ) -> Self {
        let scratch = Arc::new(ScratchRegistry::new());
        let janitor = Janitor::new();

        let registry = scratch.clone();
        janitor.register(move |owner| registry.release(owner).map(|_| ()));

        Self {
            config,
            languages,
            identity,
            supervisor,
            scratch,
            janitor,
        }
    }

    /// New node-local scratch space, registered to `owner`
    pub fn create_scratch(&self, owner: JudgeId) -> Result<ScratchSpace> {
        let space = ScratchSpace::create_local(&self.config.ramdisk_root)?;
        self.scratch.register(owner, &space);
        Ok(space)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_services, ScriptedSupervisor};

    #[test]
    fn test_janitor_releases_registered_scratch() {
        let (services, _roots) = test_services(ScriptedSupervisor::new("OK(1,1,1)"));
        let judge = JudgeId::new();
        let space = services.create_scratch(judge).unwrap();
        let path = space.path().unwrap().to_path_buf();

        services.janitor.clean_up(&judge).unwrap();

        assert!(space.is_closed());
        assert!(!path.exists());
        assert_eq!(services.scratch.live(&judge), 0);
    }
}
