//! Watchdog invocation
//!
//! Builds the supervisor command line, runs the supervisor under a hard
//! external timeout, and recovers the outcome from the verdict file it
//! leaves in its working directory. Limit enforcement belongs entirely to
//! the supervisor.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use super::escalated;
use super::identity::SandboxIdentity;
use super::outcome::{ExecutionOutcome, ResourceLimits};
use super::verdict_file::{read_verdict_file, VERDICT_FILE};

/// One supervisor invocation
#[derive(Debug, Clone)]
pub struct WatchdogCommand {
    pub limits: ResourceLimits,
    /// Memory limit passed to the supervisor; -1 disables its memory check
    pub memory_limit: i64,
    pub identity: SandboxIdentity,
    /// `false` adds `--security=0`
    pub security: bool,
    pub jail: PathBuf,
    /// Program and its arguments, as seen from inside the jail
    pub program: Vec<String>,
    /// Supervisor working directory; the verdict file appears here
    pub working_dir: PathBuf,
    pub stdin: Option<Vec<u8>>,
    pub hard_timeout: Duration,
}

impl WatchdogCommand {
    pub fn new(
        limits: ResourceLimits,
        identity: SandboxIdentity,
        jail: impl AsRef<Path>,
        working_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            limits,
            memory_limit: i64::try_from(limits.memory_bytes).unwrap_or(i64::MAX),
            identity,
            security: true,
            jail: jail.as_ref().to_path_buf(),
            program: Vec::new(),
            working_dir: working_dir.as_ref().to_path_buf(),
            stdin: None,
            hard_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_program(mut self, program: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.program = program.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_memory_limit(mut self, memory_limit: i64) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    pub fn without_security(mut self) -> Self {
        self.security = false;
        self
    }

    pub fn with_stdin(mut self, stdin: Option<Vec<u8>>) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn with_timeout(mut self, hard_timeout: Duration) -> Self {
        self.hard_timeout = hard_timeout;
        self
    }

    pub fn verdict_path(&self) -> PathBuf {
        self.working_dir.join(VERDICT_FILE)
    }

    /// Supervisor arguments, binary first
    pub fn args(&self, watchdog_binary: &str) -> Vec<String> {
        let mut args = vec![
            watchdog_binary.to_string(),
            format!("--memorylimit={}", self.memory_limit),
            format!("--cpulimit={}", self.limits.cpu_time_ms),
            format!("--timelimit={}", self.limits.real_time_ms),
            format!("--disklimit={}", self.limits.disk_bytes),
            format!("--gid={}", self.identity.gid),
            format!("--uid={}", self.identity.uid),
        ];
        if !self.security {
            args.push("--security=0".to_string());
        }
        args.push(format!("--jail={}", self.jail.display()));
        args.push("--".to_string());
        args.extend(self.program.iter().cloned());
        args
    }
}

/// Raw result of running the supervisor process
#[derive(Debug, Clone, Default)]
pub struct SupervisorRun {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// The hard timeout expired and the supervisor was killed
    pub timed_out: bool,
}

/// Something that can run a [`WatchdogCommand`]
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn supervise(&self, command: &WatchdogCommand) -> Result<SupervisorRun>;
}

/// Supervisor backed by the real watchdog binary
pub struct WatchdogSupervisor {
    escalation: Option<String>,
    binary: String,
}

impl WatchdogSupervisor {
    pub fn new(escalation: Option<String>, binary: impl Into<String>) -> Self {
        Self {
            escalation,
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl Supervisor for WatchdogSupervisor {
    async fn supervise(&self, command: &WatchdogCommand) -> Result<SupervisorRun> {
        let args = command.args(&self.binary);
        debug!("Executing in sandbox: {:?}", args);

        let mut cmd = escalated(self.escalation.as_deref(), &args[0]);
        cmd.args(&args[1..])
            .current_dir(&command.working_dir)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().context("Failed to spawn sandbox watchdog")?;

        let writer = match (child.stdin.take(), command.stdin.clone()) {
            (Some(mut pipe), Some(input)) => Some(tokio::spawn(async move {
                let written = pipe.write_all(&input).await;
                drop(pipe);
                written
            })),
            _ => None,
        };

        let waited = tokio::time::timeout(command.hard_timeout, child.wait_with_output()).await;

        let output = match waited {
            Ok(output) => output.context("Failed to wait for sandbox watchdog")?,
            Err(_) => {
                if let Some(writer) = writer {
                    writer.abort();
                }
                return Ok(SupervisorRun {
                    timed_out: true,
                    ..SupervisorRun::default()
                });
            }
        };

        if let Some(writer) = writer {
            match writer.await.context("Stdin writer task failed")? {
                Ok(()) => {}
                Err(e) if is_stream_closed(&e) => {
                    debug!("Sandboxed program closed its input early: {}", e)
                }
                Err(e) => return Err(e).context("Failed to feed input to sandboxed program"),
            }
        }

        Ok(SupervisorRun {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: false,
        })
    }
}

/// The child's end of a pipe going away is not an execution failure
fn is_stream_closed(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::BrokenPipe || e.to_string().to_lowercase() == "stream closed"
}

/// Run the supervisor and recover the outcome it reported
pub async fn run_supervised(
    supervisor: &dyn Supervisor,
    command: &WatchdogCommand,
) -> Result<(ExecutionOutcome, SupervisorRun)> {
    let run = supervisor.supervise(command).await?;

    if run.timed_out {
        error!(
            "Sandbox watchdog did not finish within {:?}, killed",
            command.hard_timeout
        );
        anyhow::bail!(
            "Sandbox watchdog killed after {:?} without a verdict",
            command.hard_timeout
        );
    }

    let outcome = read_verdict_file(&command.verdict_path())
        .await
        .with_context(|| format!("Watchdog exited with {:?}", run.exit_code))?;

    if run.exit_code != Some(0) {
        warn!(
            "Sandbox watchdog exited with {:?} but reported {}; stderr: {}",
            run.exit_code,
            outcome,
            String::from_utf8_lossy(&run.stderr)
        );
    }

    Ok((outcome, run))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::outcome::OutcomeKind;
    use crate::testing::ScriptedSupervisor;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            cpu_time_ms: 1000,
            real_time_ms: 2000,
            memory_bytes: 64 << 20,
            disk_bytes: 1 << 20,
        }
    }

    const IDENTITY: SandboxIdentity = SandboxIdentity { uid: 1001, gid: 1002 };

    #[test]
    fn test_native_args() {
        let command = WatchdogCommand::new(limits(), IDENTITY, "/tmp/s/chroot", "/tmp/s")
            .with_program(["/program"]);

        assert_eq!(
            command.args("olympus_watchdog"),
            vec![
                "olympus_watchdog",
                "--memorylimit=67108864",
                "--cpulimit=1000",
                "--timelimit=2000",
                "--disklimit=1048576",
                "--gid=1002",
                "--uid=1001",
                "--jail=/tmp/s/chroot",
                "--",
                "/program",
            ]
        );
    }

    #[test]
    fn test_security_off_and_memory_override() {
        let args = WatchdogCommand::new(limits(), IDENTITY, "/", "/tmp/s/chroot")
            .with_memory_limit(-1)
            .without_security()
            .with_program(["/usr/bin/java", "Main"])
            .args("olympus_watchdog");

        assert_eq!(args[1], "--memorylimit=-1");
        let jail = args.iter().position(|a| a == "--jail=/").unwrap();
        assert_eq!(args[jail - 1], "--security=0");
        assert_eq!(&args[jail + 1..], ["--", "/usr/bin/java", "Main"]);
    }

    #[tokio::test]
    async fn test_run_supervised_reads_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ScriptedSupervisor::new("TIME_LIMIT(2001,1000,1024)");
        let command = WatchdogCommand::new(limits(), IDENTITY, dir.path(), dir.path());

        let (outcome, run) = run_supervised(&supervisor, &command).await.unwrap();

        assert_eq!(outcome.kind, OutcomeKind::TimeLimit);
        assert_eq!(outcome.real_time_ms, 2001);
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(supervisor.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_verdict_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ScriptedSupervisor::silent();
        let command = WatchdogCommand::new(limits(), IDENTITY, dir.path(), dir.path());

        let err = run_supervised(&supervisor, &command).await.unwrap_err();
        assert!(format!("{:#}", err).contains("missing or unreadable"));
    }

    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ScriptedSupervisor::hanging();
        let command = WatchdogCommand::new(limits(), IDENTITY, dir.path(), dir.path());

        let err = run_supervised(&supervisor, &command).await.unwrap_err();
        assert!(err.to_string().contains("killed"));
    }

    /// Watchdog stand-in run through `sh`, so no freshly written file is executed
    fn fake_watchdog(dir: &Path, body: &str) -> WatchdogSupervisor {
        let script = dir.join("fake_watchdog.sh");
        std::fs::write(&script, body).unwrap();
        WatchdogSupervisor::new(Some("sh".to_string()), script.to_string_lossy())
    }

    #[tokio::test]
    async fn test_real_supervisor_feeds_stdin_and_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = fake_watchdog(dir.path(), "cat\necho 'OK(3,2,1)' > verdict.txt\n");
        let command = WatchdogCommand::new(limits(), IDENTITY, dir.path(), dir.path())
            .with_program(["/program"])
            .with_stdin(Some(b"ping".to_vec()))
            .with_timeout(Duration::from_secs(10));

        let (outcome, run) = run_supervised(&supervisor, &command).await.unwrap();

        assert_eq!(outcome, ExecutionOutcome::with_usage(OutcomeKind::Ok, 3, 2, 1));
        assert_eq!(run.stdout, b"ping");
    }

    #[tokio::test]
    async fn test_real_supervisor_tolerates_unread_input() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = fake_watchdog(dir.path(), "echo 'RUNTIME_ERROR(1,1,1)' > verdict.txt\nexit 1\n");
        let command = WatchdogCommand::new(limits(), IDENTITY, dir.path(), dir.path())
            .with_stdin(Some(vec![b'x'; 4 << 20]))
            .with_timeout(Duration::from_secs(10));

        let (outcome, run) = run_supervised(&supervisor, &command).await.unwrap();

        assert_eq!(outcome.kind, OutcomeKind::RuntimeError);
        assert_eq!(run.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_real_supervisor_is_killed_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = fake_watchdog(dir.path(), "sleep 5\necho 'OK(1,1,1)' > verdict.txt\n");
        let command = WatchdogCommand::new(limits(), IDENTITY, dir.path(), dir.path())
            .with_timeout(Duration::from_millis(200));

        let run = supervisor.supervise(&command).await.unwrap();

        assert!(run.timed_out);
        assert!(!command.verdict_path().exists());
    }
}
