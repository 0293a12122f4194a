//! Typed failures
//!
//! Matchable error kinds for the judging core. Boundary code wraps these in
//! `anyhow::Error` with context; callers that need to branch downcast back.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to read the supervisor's verdict text
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerdictError {
    #[error("malformed verdict: {0:?}")]
    MalformedVerdict(String),
    #[error("unknown outcome kind: {0:?}")]
    UnknownOutcomeKind(String),
}

/// Misuse of a single-use executor
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("resource limits must be set before execute")]
    LimitsNotSet,
    #[error("{0} already configured for this executor")]
    AlreadyConfigured(&'static str),
    #[error("executor has already run a program")]
    AlreadyExecuted,
    #[error("executor has not run a program yet")]
    NotExecuted,
    #[error("file {0:?} was not produced inside the sandbox")]
    FileNotProduced(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("scratch space {0:?} is already closed")]
    Closed(PathBuf),
}

/// Outcome of a compiler invocation that did not produce an artifact
#[derive(Debug, Error)]
pub enum CompileFailure {
    /// The submission is at fault; the diagnostic is shown to the contestant
    #[error("{0}")]
    Diagnostic(String),
    /// The compiler could not be run properly
    #[error("compiler environment failure: {0:#}")]
    Environment(anyhow::Error),
}

/// Judge lifecycle and input errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JudgeError {
    #[error("judge has not been compiled")]
    NotCompiled,
    #[error("judge has already been compiled")]
    AlreadyCompiled,
    #[error("judge is closed")]
    Closed,
    #[error("{0} file is not supplied")]
    MissingTestFile(String),
    #[error("unsupported snapshot version {0}")]
    SnapshotVersion(u32),
    #[error("compiled artifact does not match snapshot digest")]
    ArtifactMismatch,
    #[error("property {key} is missing or invalid: {value:?}")]
    InvalidProperty { key: String, value: Option<String> },
}
