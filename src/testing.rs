//! Test doubles shared by the unit tests

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use crate::config::JudgeConfig;
use crate::languages::LanguageTable;
use crate::sandbox::{
    IdentityService, ResourceLimits, SandboxIdentity, Supervisor, SupervisorRun, WatchdogCommand,
};
use crate::services::JudgeServices;

pub fn limits() -> ResourceLimits {
    ResourceLimits {
        cpu_time_ms: 1000,
        real_time_ms: 2000,
        memory_bytes: 64 << 20,
        disk_bytes: 1 << 20,
    }
}

pub fn has_program(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

/// Directory the sandboxed program sees as its root
fn program_root(command: &WatchdogCommand) -> PathBuf {
    if command.jail == Path::new("/") {
        command.working_dir.clone()
    } else {
        command.jail.clone()
    }
}

/// Supervisor that plays back a canned verdict
#[derive(Clone, Default)]
pub struct ScriptedSupervisor {
    verdict: Option<String>,
    hang: bool,
    files: Vec<(String, Vec<u8>)>,
    links: Vec<(String, PathBuf)>,
    stdout: Vec<u8>,
    invocations: Arc<Mutex<Vec<WatchdogCommand>>>,
}

impl ScriptedSupervisor {
    pub fn new(verdict: &str) -> Self {
        Self {
            verdict: Some(verdict.to_string()),
            ..Self::default()
        }
    }

    /// Exits without leaving a verdict file
    pub fn silent() -> Self {
        Self::default()
    }

    /// Never finishes within the hard timeout
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    /// Leave `name` in the program's root, as if the program wrote it
    pub fn writing(mut self, name: &str, content: &[u8]) -> Self {
        self.files.push((name.to_string(), content.to_vec()));
        self
    }

    pub fn linking(mut self, name: &str, target: impl AsRef<Path>) -> Self {
        self.links.push((name.to_string(), target.as_ref().to_path_buf()));
        self
    }

    pub fn with_stdout(mut self, stdout: &[u8]) -> Self {
        self.stdout = stdout.to_vec();
        self
    }

    pub fn invocations(&self) -> Vec<WatchdogCommand> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Supervisor for ScriptedSupervisor {
    async fn supervise(&self, command: &WatchdogCommand) -> Result<SupervisorRun> {
        self.invocations.lock().unwrap().push(command.clone());
        if self.hang {
            return Ok(SupervisorRun {
                timed_out: true,
                ..SupervisorRun::default()
            });
        }

        let root = program_root(command);
        for (name, content) in &self.files {
            tokio::fs::write(root.join(name), content).await?;
        }
        for (name, target) in &self.links {
            tokio::fs::symlink(target, root.join(name)).await?;
        }
        if let Some(verdict) = &self.verdict {
            tokio::fs::write(command.verdict_path(), format!("{}\n", verdict)).await?;
        }

        Ok(SupervisorRun {
            exit_code: Some(0),
            stdout: self.stdout.clone(),
            stderr: Vec::new(),
            timed_out: false,
        })
    }
}

/// Supervisor whose program copies its `input.txt` to `output.txt`
pub struct EchoSupervisor;

#[async_trait]
impl Supervisor for EchoSupervisor {
    async fn supervise(&self, command: &WatchdogCommand) -> Result<SupervisorRun> {
        let root = program_root(command);
        tokio::fs::copy(root.join("input.txt"), root.join("output.txt")).await?;
        tokio::fs::write(command.verdict_path(), "OK(1,1,1)\n").await?;
        Ok(SupervisorRun {
            exit_code: Some(0),
            ..SupervisorRun::default()
        })
    }
}

/// Supervisor that runs native programs unconfined and reports OK or
/// RUNTIME_ERROR by exit status
pub struct DirectSupervisor;

#[async_trait]
impl Supervisor for DirectSupervisor {
    async fn supervise(&self, command: &WatchdogCommand) -> Result<SupervisorRun> {
        let root = program_root(command);
        let program = command.program.first().context("No program to run")?;
        let binary = root.join(program.trim_start_matches('/'));

        let started = Instant::now();
        let mut child = tokio::process::Command::new(&binary)
            .args(&command.program[1..])
            .current_dir(&root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run {:?}", binary))?;

        if let Some(mut pipe) = child.stdin.take() {
            let input = command.stdin.clone().unwrap_or_default();
            // a program that exits without reading is not an error here
            let _ = pipe.write_all(&input).await;
        }
        let output = child.wait_with_output().await?;
        let elapsed = started.elapsed().as_millis();

        let kind = if output.status.success() {
            "OK"
        } else {
            "RUNTIME_ERROR"
        };
        tokio::fs::write(
            command.verdict_path(),
            format!("{}({},{},{})\n", kind, elapsed, elapsed, 1024),
        )
        .await?;

        Ok(SupervisorRun {
            exit_code: Some(0),
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out: false,
        })
    }
}

/// Temporary roots behind [`test_services`]
pub struct TestRoots {
    /// Node-local files owned by the test
    pub local: TempDir,
    pub ramdisk: TempDir,
    pub shared: TempDir,
    pub chroot: TempDir,
}

impl TestRoots {
    /// Dummy native program
    pub fn program(&self, name: &str) -> PathBuf {
        let path = self.local.path().join(name);
        std::fs::write(&path, b"\x7fELF").unwrap();
        path
    }

    /// Dummy class directory holding `Main.class`
    pub fn class_dir(&self, name: &str) -> PathBuf {
        let path = self.local.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("Main.class"), b"\xca\xfe\xba\xbe").unwrap();
        path
    }
}

pub fn test_services(supervisor: impl Supervisor + 'static) -> (Arc<JudgeServices>, TestRoots) {
    let roots = TestRoots {
        local: tempfile::tempdir().unwrap(),
        ramdisk: tempfile::tempdir().unwrap(),
        shared: tempfile::tempdir().unwrap(),
        chroot: tempfile::tempdir().unwrap(),
    };

    let config = JudgeConfig {
        escalation_command: None,
        chroot_template: roots.chroot.path().to_path_buf(),
        ramdisk_root: roots.ramdisk.path().to_path_buf(),
        shared_storage_root: roots.shared.path().to_path_buf(),
        ..JudgeConfig::default()
    };
    let identity = IdentityService::fixed(SandboxIdentity { uid: 1000, gid: 1000 });
    let services = JudgeServices::with_parts(
        config,
        LanguageTable::builtin().unwrap(),
        identity,
        Arc::new(supervisor),
    );

    (Arc::new(services), roots)
}
