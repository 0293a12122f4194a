//! Executor module - Sandboxed program invocation
//!
//! An executor owns one scratch space and runs one program in it, once:
//! - `NativeSandboxExecutor`: chroot jail + watchdog, for native binaries
//! - `ManagedRuntimeExecutor`: VM security policy + watchdog, for bytecode
//!
//! Executors never enforce limits or judge answers; they prepare the
//! sandbox, invoke the supervisor and hand back its outcome. Closing (or
//! dropping) an executor deletes its scratch space.

pub mod managed;
pub mod native;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, warn};

use crate::core::JudgeId;
use crate::error::ExecutorError;
use crate::languages::Runtime;
use crate::sandbox::{ExecutionOutcome, ResourceLimits, SupervisorRun};
use crate::services::JudgeServices;
use crate::storage::ScratchSpace;

pub use managed::ManagedRuntimeExecutor;
pub use native::NativeSandboxExecutor;

/// Jail directory inside an executor's scratch space
pub const JAIL_DIR: &str = "chroot";

/// Console I/O for the sandboxed program. Without it the program talks to
/// files only.
#[derive(Debug, Clone, Default)]
pub struct ConsoleStreams {
    pub stdin: Option<Vec<u8>>,
    pub capture_stdout: bool,
    pub capture_stderr: bool,
}

impl ConsoleStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    pub fn capture_stderr(mut self) -> Self {
        self.capture_stderr = true;
        self
    }
}

/// Streams captured from a console-mode run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// State shared by every executor variant
pub struct SandboxSession {
    services: Arc<JudgeServices>,
    scratch: ScratchSpace,
    limits: Option<ResourceLimits>,
    streams: Option<ConsoleStreams>,
    /// Files staged with `provide_file`, by name inside the jail
    provided: Vec<String>,
    executed: bool,
    output: Option<CapturedOutput>,
}

impl SandboxSession {
    fn open(services: &Arc<JudgeServices>, owner: JudgeId) -> Result<Self> {
        let scratch = services.create_scratch(owner)?;
        Ok(Self {
            services: services.clone(),
            scratch,
            limits: None,
            streams: None,
            provided: Vec::new(),
            executed: false,
            output: None,
        })
    }

    fn root(&self) -> Result<PathBuf> {
        Ok(self.scratch.path()?.to_path_buf())
    }

    fn jail(&self) -> Result<PathBuf> {
        Ok(self.root()?.join(JAIL_DIR))
    }

    fn set_limits(&mut self, limits: ResourceLimits) -> Result<(), ExecutorError> {
        if self.executed {
            return Err(ExecutorError::AlreadyExecuted);
        }
        if self.limits.is_some() {
            return Err(ExecutorError::AlreadyConfigured("limits"));
        }
        self.limits = Some(limits);
        Ok(())
    }

    fn set_streams(&mut self, streams: ConsoleStreams) -> Result<(), ExecutorError> {
        if self.executed {
            return Err(ExecutorError::AlreadyExecuted);
        }
        if self.streams.is_some() {
            return Err(ExecutorError::AlreadyConfigured("streams"));
        }
        self.streams = Some(streams);
        Ok(())
    }

    /// Copy `file` into the jail root
    async fn provide_file(&mut self, file: &Path) -> Result<()> {
        if self.executed {
            return Err(ExecutorError::AlreadyExecuted.into());
        }
        let name = file_name(file)?;
        let target = self.jail()?.join(&name);
        fs::copy(file, &target)
            .await
            .with_context(|| format!("Failed to provide {:?} to the sandbox", file))?;
        debug!("Provided {:?} as {:?}", file, target);
        self.provided.push(name);
        Ok(())
    }

    /// Mark the session as used and hand out its limits
    fn begin(&mut self) -> Result<ResourceLimits, ExecutorError> {
        if self.executed {
            return Err(ExecutorError::AlreadyExecuted);
        }
        let limits = self.limits.ok_or(ExecutorError::LimitsNotSet)?;
        self.executed = true;
        Ok(limits)
    }

    fn stdin(&self) -> Option<Vec<u8>> {
        self.streams.as_ref().and_then(|s| s.stdin.clone())
    }

    fn record(&mut self, run: SupervisorRun) {
        if let Some(streams) = &self.streams {
            self.output = Some(CapturedOutput {
                stdout: if streams.capture_stdout { run.stdout } else { Vec::new() },
                stderr: if streams.capture_stderr { run.stderr } else { Vec::new() },
            });
        }
    }

    /// Copy a regular file the program left in the jail root to `destination`
    async fn get_file(&self, name: &str, destination: &Path) -> Result<()> {
        if !self.executed {
            return Err(ExecutorError::NotExecuted.into());
        }
        if Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name) {
            anyhow::bail!("Refusing to retrieve {:?}: not a plain file name", name);
        }

        let source = self.jail()?.join(name);
        // A symlink planted by the program must not be followed
        match fs::symlink_metadata(&source).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(ExecutorError::FileNotProduced(name.to_string()).into()),
        }

        fs::copy(&source, destination)
            .await
            .with_context(|| format!("Failed to copy {:?} to {:?}", source, destination))?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.scratch.close()
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        if let Err(e) = self.scratch.close() {
            warn!("Failed to delete executor scratch space: {:#}", e);
        }
    }
}

/// Single-use sandboxed executor, chosen by the program's runtime
pub enum Executor {
    Native(NativeSandboxExecutor),
    Managed(ManagedRuntimeExecutor),
}

impl Executor {
    /// Executor for `runtime`. `write_files` lists the files a managed
    /// program may create; native jails impose no such list.
    pub async fn for_runtime(
        runtime: Runtime,
        services: &Arc<JudgeServices>,
        owner: JudgeId,
        write_files: Vec<String>,
    ) -> Result<Self> {
        match runtime {
            Runtime::Native => Ok(Executor::Native(NativeSandboxExecutor::new(services, owner).await?)),
            Runtime::Managed => Ok(Executor::Managed(
                ManagedRuntimeExecutor::new(services, owner, write_files).await?,
            )),
        }
    }

    fn session(&self) -> &SandboxSession {
        match self {
            Executor::Native(native) => &native.session,
            Executor::Managed(managed) => &managed.session,
        }
    }

    fn session_mut(&mut self) -> &mut SandboxSession {
        match self {
            Executor::Native(native) => &mut native.session,
            Executor::Managed(managed) => &mut managed.session,
        }
    }

    pub fn set_limits(&mut self, limits: ResourceLimits) -> Result<&mut Self, ExecutorError> {
        self.session_mut().set_limits(limits)?;
        Ok(self)
    }

    pub fn set_streams(&mut self, streams: ConsoleStreams) -> Result<&mut Self, ExecutorError> {
        self.session_mut().set_streams(streams)?;
        Ok(self)
    }

    /// Stage a file into the sandbox root, readable by the program
    pub async fn provide_file(&mut self, file: &Path) -> Result<()> {
        self.session_mut().provide_file(file).await
    }

    /// Run `program` under the configured limits. Program failures come back
    /// as outcomes; only environment failures are errors.
    pub async fn execute(&mut self, program: &Path) -> Result<ExecutionOutcome> {
        match self {
            Executor::Native(native) => native.execute(program).await,
            Executor::Managed(managed) => managed.execute(program).await,
        }
    }

    pub async fn get_file(&self, name: &str, destination: &Path) -> Result<()> {
        self.session().get_file(name, destination).await
    }

    /// Console output of the finished run
    pub fn take_output(&mut self) -> Option<CapturedOutput> {
        self.session_mut().output.take()
    }

    #[cfg(test)]
    pub fn root(&self) -> Result<PathBuf> {
        self.session().root()
    }

    pub fn close(&self) -> Result<()> {
        self.session().close()
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("{:?} has no usable file name", path))
}
