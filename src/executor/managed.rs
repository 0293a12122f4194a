//! Managed runtime executor
//!
//! Runs compiled bytecode under the JVM. The watchdog runs with its own
//! syscall filter off (`--security=0`, `--jail=/`); isolation comes from a
//! generated security policy that grants exactly the staged read files and
//! the declared write files. The VM's own heap limit replaces the
//! watchdog's memory limit, and an out-of-memory hook touches a sentinel
//! file the executor checks afterwards.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{file_name, SandboxSession};
use crate::core::utils::{copy_tree, open_permissions};
use crate::core::JudgeId;
use crate::sandbox::outcome::Payload;
use crate::sandbox::{run_supervised, ExecutionOutcome, OutcomeKind, WatchdogCommand};
use crate::services::JudgeServices;

/// Touched by the VM when it runs out of heap
pub const OOM_SENTINEL: &str = "outOfMemory";
/// Security policy, kept outside the jail
pub const POLICY_FILE: &str = "judge.policy";
const MAIN_CLASS: &str = "Main";

pub struct ManagedRuntimeExecutor {
    pub(super) session: SandboxSession,
    write_files: Vec<String>,
}

impl ManagedRuntimeExecutor {
    pub async fn new(
        services: &Arc<JudgeServices>,
        owner: JudgeId,
        write_files: Vec<String>,
    ) -> Result<Self> {
        let session = SandboxSession::open(services, owner)?;
        let jail = session.jail()?;
        fs::create_dir_all(&jail)
            .await
            .with_context(|| format!("Failed to create jail {:?}", jail))?;

        Ok(Self {
            session,
            write_files,
        })
    }

    /// Run the class directory `program`
    pub async fn execute(&mut self, program: &Path) -> Result<ExecutionOutcome> {
        let limits = self.session.begin()?;
        let root = self.session.root()?;
        let jail = self.session.jail()?;

        let chrooted_program = jail.join(file_name(program)?);
        copy_tree(program, &chrooted_program)
            .await
            .with_context(|| format!("Failed to copy {:?} into the jail", program))?;

        let sentinel = jail.join(OOM_SENTINEL);
        let policy = root.join(POLICY_FILE);

        open_permissions(&root).await?;
        fs::write(&policy, build_policy(&jail, &self.session.provided, &self.write_files))
            .await
            .with_context(|| format!("Failed to write security policy {:?}", policy))?;

        let services = self.session.services.clone();
        let identity = services.identity.identity().await?;
        let config = &services.config;
        let heap = limits.memory_bytes.to_string();

        let command = WatchdogCommand::new(limits, identity, "/", &jail)
            .with_memory_limit(-1)
            .without_security()
            .with_program([
                config.java_binary.display().to_string(),
                "-classpath".to_string(),
                chrooted_program.display().to_string(),
                "-Djava.security.manager".to_string(),
                format!("-Djava.security.policy={}", policy.display()),
                format!("-Xmx{}", heap),
                format!("-Xms{}", heap),
                format!(
                    "-XX:OnOutOfMemoryError=touch {0}; echo \"\" > {0}",
                    sentinel.display()
                ),
                MAIN_CLASS.to_string(),
            ])
            .with_stdin(self.session.stdin())
            .with_timeout(config.watchdog_timeout(config.managed_watchdog_timeout, limits.real_time_ms));

        let (outcome, run) = run_supervised(services.supervisor.as_ref(), &command).await?;
        self.session.record(run);

        let out_of_memory = fs::symlink_metadata(&sentinel).await.is_ok();
        let outcome = apply_memory_policy(outcome, out_of_memory, limits.memory_bytes);
        info!("Managed program finished: {}", outcome);
        Ok(outcome)
    }
}

/// Whether the out-of-memory sentinel may replace a reported kind.
/// Security and platform faults always win over memory pressure.
pub fn sentinel_overrides(kind: OutcomeKind) -> bool {
    !matches!(
        kind,
        OutcomeKind::SecurityViolation
            | OutcomeKind::InternalError
            | OutcomeKind::IncorrectSecurityConfig
    )
}

/// Fold the sentinel into the supervisor's outcome. The VM does not expose
/// its true peak, so usage-carrying outcomes report the heap limit.
pub fn apply_memory_policy(
    mut outcome: ExecutionOutcome,
    out_of_memory: bool,
    memory_limit: u64,
) -> ExecutionOutcome {
    if out_of_memory {
        if sentinel_overrides(outcome.kind) {
            debug!("Out-of-memory sentinel present, overriding {}", outcome.kind);
            outcome.kind = OutcomeKind::MemoryLimit;
        } else {
            warn!(
                "Out-of-memory sentinel present but keeping {} from the watchdog",
                outcome.kind
            );
        }
    }
    if outcome.kind.payload() == Payload::Usage {
        outcome.peak_memory_bytes = i64::try_from(memory_limit).unwrap_or(i64::MAX);
    }
    outcome
}

fn build_policy(jail: &Path, read_files: &[String], write_files: &[String]) -> String {
    let grant = |file: &String, action: &str| {
        format!(
            "  permission java.io.FilePermission \"{}\", \"{}\";\n",
            jail.join(file).display(),
            action
        )
    };

    let mut policy = String::from("grant {\n");
    policy.extend(read_files.iter().map(|f| grant(f, "read")));
    policy.extend(write_files.iter().map(|f| grant(f, "write")));
    policy.push_str("};\n");
    policy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, JAIL_DIR};
    use crate::languages::Runtime;
    use crate::sandbox::outcome::UNKNOWN;
    use crate::testing::{limits, test_services, ScriptedSupervisor};
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_policy_grants_exactly_listed_files() {
        let policy = build_policy(
            Path::new("/s/chroot"),
            &["input.txt".to_string()],
            &["output.txt".to_string()],
        );

        assert_eq!(
            policy,
            "grant {\n  permission java.io.FilePermission \"/s/chroot/input.txt\", \"read\";\n  permission java.io.FilePermission \"/s/chroot/output.txt\", \"write\";\n};\n"
        );
        assert_eq!(build_policy(Path::new("/s/chroot"), &[], &[]), "grant {\n};\n");
    }

    #[test]
    fn test_sentinel_forces_memory_limit() {
        for kind in [
            OutcomeKind::Ok,
            OutcomeKind::RuntimeError,
            OutcomeKind::TimeLimit,
            OutcomeKind::OutputLimit,
            OutcomeKind::AbnormalTermination,
            OutcomeKind::MemoryLimit,
        ] {
            let outcome = ExecutionOutcome::with_usage(kind, 100, 90, 1234);
            let applied = apply_memory_policy(outcome, true, 64 << 20);

            assert_eq!(applied.kind, OutcomeKind::MemoryLimit, "{}", kind);
            assert_eq!(applied.peak_memory_bytes, 64 << 20);
            assert_eq!(applied.real_time_ms, 100);
        }
    }

    #[test]
    fn test_sentinel_never_masks_security_or_platform_faults() {
        let violation = apply_memory_policy(ExecutionOutcome::security_violation(59), true, 1024);
        assert_eq!(violation.kind, OutcomeKind::SecurityViolation);
        assert_eq!(violation.violating_syscall, 59);
        assert_eq!(violation.peak_memory_bytes, UNKNOWN);

        for kind in [OutcomeKind::InternalError, OutcomeKind::IncorrectSecurityConfig] {
            let applied = apply_memory_policy(ExecutionOutcome::bare(kind), true, 1024);
            assert_eq!(applied.kind, kind);
        }
    }

    #[test]
    fn test_peak_memory_reports_limit_without_sentinel() {
        let applied = apply_memory_policy(
            ExecutionOutcome::with_usage(OutcomeKind::Ok, 10, 10, 5),
            false,
            256 << 20,
        );
        assert_eq!(applied.kind, OutcomeKind::Ok);
        assert_eq!(applied.peak_memory_bytes, 256 << 20);
    }

    #[tokio::test]
    async fn test_managed_invocation_and_sentinel() {
        let supervisor = ScriptedSupervisor::new("RUNTIME_ERROR(10,10,10)").writing(OOM_SENTINEL, b"\n");
        let (services, roots) = test_services(supervisor.clone());
        let classes = roots.class_dir("program");
        let input = roots.local.path().join("input.txt");
        std::fs::write(&input, b"1 2").unwrap();

        let mut executor = Executor::for_runtime(
            Runtime::Managed,
            &services,
            JudgeId::new(),
            vec!["output.txt".to_string()],
        )
        .await
        .unwrap();
        executor.set_limits(limits()).unwrap();
        executor.provide_file(&input).await.unwrap();
        let root = executor.root().unwrap();
        let jail = root.join(JAIL_DIR);

        let outcome = executor.execute(&classes).await.unwrap();

        assert_eq!(outcome.kind, OutcomeKind::MemoryLimit);
        assert_eq!(outcome.peak_memory_bytes, limits().memory_bytes as i64);

        let command = &supervisor.invocations()[0];
        assert_eq!(command.memory_limit, -1);
        assert!(!command.security);
        assert_eq!(command.jail, Path::new("/"));
        assert_eq!(command.working_dir, jail);
        assert_eq!(command.program[1], "-classpath");
        assert_eq!(command.program[2], jail.join("program").display().to_string());
        assert_eq!(command.program.last().map(String::as_str), Some("Main"));
        assert!(command.program.contains(&format!("-Xmx{}", limits().memory_bytes)));

        let policy = std::fs::read_to_string(root.join(POLICY_FILE)).unwrap();
        assert!(policy.contains(&format!("\"{}\", \"read\"", jail.join("input.txt").display())));
        assert!(policy.contains(&format!("\"{}\", \"write\"", jail.join("output.txt").display())));

        let mode = std::fs::metadata(jail.join("program/Main.class"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o775);
    }
}
