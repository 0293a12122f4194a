//! Compiler module - Source code compilation
//!
//! Thin wrappers over the supported compiler toolchains. A run either
//! produces the artifact, fails with a diagnostic meant for the contestant
//! (exit code 1), or fails because the toolchain itself misbehaved.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::error::CompileFailure;

/// Exit code compilers use for "your program does not compile"
const EXIT_COMPILE_ERROR: i32 = 1;

/// Supported compiler toolchains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilerBackend {
    /// GNU C++ (`g++`); artifact is a native executable
    Gnu,
    /// Free Pascal (`ppcx64`); artifact is a native executable
    FreePascal,
    /// `javac`; artifact is a class directory
    Javac,
}

impl CompilerBackend {
    fn program(&self) -> &'static str {
        match self {
            CompilerBackend::Gnu => "g++",
            CompilerBackend::FreePascal => "ppcx64",
            CompilerBackend::Javac => "javac",
        }
    }

    /// Full argument list (flags first, then backend-specific output and input)
    pub fn args(&self, flags: &[String], source: &Path, output: &Path) -> Vec<String> {
        let source = source.display().to_string();
        let output = output.display().to_string();
        let mut args: Vec<String> = flags.to_vec();

        match self {
            CompilerBackend::Gnu => {
                args.extend(["-w".to_string(), "-o".to_string(), output, source]);
            }
            CompilerBackend::FreePascal => {
                args.extend([format!("-o{}", output), "-l-".to_string(), "-v0".to_string(), source]);
            }
            CompilerBackend::Javac => {
                args.extend(["-d".to_string(), output, "-nowarn".to_string(), source]);
            }
        }
        args
    }

    /// Contestant-facing diagnostic from the compiler's output
    fn diagnostic(&self, stdout: &str, stderr: &str, source: &Path) -> String {
        match self {
            CompilerBackend::Gnu => stderr.to_string(),
            CompilerBackend::FreePascal => stdout.to_string(),
            CompilerBackend::Javac => {
                let prefix = format!("{}:", source.display());
                stderr
                    .lines()
                    .map(|line| line.strip_prefix(&prefix).unwrap_or(line))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
    }
}

/// A configured compiler invocation
#[derive(Debug, Clone)]
pub struct Compiler {
    backend: CompilerBackend,
    flags: Vec<String>,
    timeout: Duration,
}

impl Compiler {
    pub fn new(backend: CompilerBackend, flags: Vec<String>, timeout: Duration) -> Self {
        Self {
            backend,
            flags,
            timeout,
        }
    }

    /// Compile `source` into `output`
    pub async fn compile(&self, source: &Path, output: &Path) -> Result<(), CompileFailure> {
        let source = absolute(source).map_err(CompileFailure::Environment)?;
        let output = absolute(output).map_err(CompileFailure::Environment)?;

        if self.backend == CompilerBackend::Javac {
            fs::create_dir_all(&output)
                .await
                .with_context(|| format!("Failed to create class directory {:?}", output))
                .map_err(CompileFailure::Environment)?;
        }

        let args = self.backend.args(&self.flags, &source, &output);
        debug!("Compiling with {} {:?}", self.backend.program(), args);

        let child = Command::new(self.backend.program())
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Could not execute {}", self.backend.program()))
            .map_err(environment)?;

        let output_result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                environment(anyhow!(
                    "{} did not finish within {:?}",
                    self.backend.program(),
                    self.timeout
                ))
            })?
            .context("Failed to wait for compiler")
            .map_err(environment)?;

        let stdout = String::from_utf8_lossy(&output_result.stdout);
        let stderr = String::from_utf8_lossy(&output_result.stderr);

        match output_result.status.code() {
            Some(0) => {
                if fs::metadata(&output).await.is_err() {
                    return Err(environment(anyhow!(
                        "{} reported success but produced no {:?}",
                        self.backend.program(),
                        output
                    )));
                }
                info!("Compiled {:?} with {:?}", source, self.backend);
                Ok(())
            }
            Some(EXIT_COMPILE_ERROR) => {
                let diagnostic = self.backend.diagnostic(&stdout, &stderr, &source);
                debug!("Compilation error: {}", diagnostic);
                Err(CompileFailure::Diagnostic(diagnostic))
            }
            other => Err(environment(anyhow!(
                "{} exited with {:?}: {}",
                self.backend.program(),
                other,
                stderr.trim()
            ))),
        }
    }
}

fn environment(e: anyhow::Error) -> CompileFailure {
    error!("Compiler environment failure: {:#}", e);
    CompileFailure::Environment(e)
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Failed to resolve {:?}", path))
}
