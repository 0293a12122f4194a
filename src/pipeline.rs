//! Result pipeline
//!
//! Threads the compile, runtime and checking stages of one test into a
//! single verdict. Stage methods exist only on an open [`Pipeline`]; the
//! first failing stage turns it into a [`FailedPipeline`], which has no
//! stage methods at all, so callers chain stages with `?` and a failed
//! submission is never executed or checked.
//!
//! Stage inputs are `anyhow::Result`s: an `Err` from whatever produced the
//! stage outcome becomes INTERNAL_ERROR for that stage and never escapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::checker::{AnswerCheck, CheckerResult};
use crate::core::{FaultClass, JudgeStage, Verdict};
use crate::error::CompileFailure;
use crate::sandbox::outcome::UNKNOWN;
use crate::sandbox::{ExecutionOutcome, OutcomeKind};

/// Message shown instead of environment-fault diagnostics
pub const OPAQUE_INTERNAL_ERROR: &str = "internal error";

/// Result of the compile stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Ok,
    CompileError(String),
    InternalError(String),
}

impl From<Result<(), CompileFailure>> for CompileOutcome {
    fn from(result: Result<(), CompileFailure>) -> Self {
        match result {
            Ok(()) => CompileOutcome::Ok,
            Err(CompileFailure::Diagnostic(diagnostic)) => CompileOutcome::CompileError(diagnostic),
            Err(CompileFailure::Environment(e)) => CompileOutcome::InternalError(format!("{:#}", e)),
        }
    }
}

/// Everything a pipeline has accumulated. Serializable so the compile-time
/// prefix can travel inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    real_time_ms: i64,
    cpu_time_ms: i64,
    peak_memory_bytes: i64,
    violating_syscall: i64,
    failed: bool,
    verdict: Option<Verdict>,
    stages: BTreeMap<JudgeStage, bool>,
    error_messages: BTreeMap<JudgeStage, String>,
    checker_message: Option<String>,
    score: f64,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            real_time_ms: UNKNOWN,
            cpu_time_ms: UNKNOWN,
            peak_memory_bytes: UNKNOWN,
            violating_syscall: UNKNOWN,
            failed: false,
            verdict: None,
            stages: BTreeMap::new(),
            error_messages: BTreeMap::new(),
            checker_message: None,
            score: 0.0,
        }
    }
}

impl PipelineState {
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    /// Zero once failed, whatever was written before
    pub fn score(&self) -> f64 {
        if self.failed {
            0.0
        } else {
            self.score
        }
    }

    /// Continue from this state: open if nothing failed yet
    pub fn resume(self) -> Staged {
        if self.failed {
            Err(FailedPipeline { state: self })
        } else {
            Ok(Pipeline { state: self })
        }
    }

    pub fn build(&self) -> SolutionResult {
        if self.verdict == Some(Verdict::SecurityViolation) {
            return SolutionResult {
                verdict: self.verdict,
                cpu_time_ms: UNKNOWN,
                real_time_ms: UNKNOWN,
                peak_memory_bytes: UNKNOWN,
                violating_syscall: self.violating_syscall,
                score: 0.0,
                stages: self.stages.clone(),
                error_messages: self.error_messages.clone(),
                checker_message: self.checker_message.clone(),
            };
        }

        SolutionResult {
            verdict: self.verdict,
            cpu_time_ms: self.cpu_time_ms,
            real_time_ms: self.real_time_ms,
            peak_memory_bytes: self.peak_memory_bytes,
            violating_syscall: UNKNOWN,
            score: self.score(),
            stages: self.stages.clone(),
            error_messages: self.error_messages.clone(),
            checker_message: self.checker_message.clone(),
        }
    }

    fn succeed(&mut self, stage: JudgeStage) {
        self.stages.entry(stage).or_insert(true);
    }

    fn fail(&mut self, stage: JudgeStage, verdict: Verdict, message: impl Into<String>) {
        let message = message.into();
        match verdict.fault() {
            FaultClass::Environment => {
                error!("Solution failed on stage {} with {}: {}", stage, verdict, message)
            }
            FaultClass::User => {
                info!("Solution failed on stage {} with {}: {}", stage, verdict, message)
            }
        }
        self.verdict = Some(verdict);
        self.failed = true;
        self.stages.insert(stage, false);
        self.error_messages.insert(stage, message);
    }
}

/// Outcome of running a stage
pub type Staged = Result<Pipeline, FailedPipeline>;

/// A pipeline no stage has failed yet
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    state: PipelineState,
}

/// A pipeline frozen by its first failure
#[derive(Debug, Clone, PartialEq)]
pub struct FailedPipeline {
    state: PipelineState,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            state: PipelineState::default(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn into_state(self) -> PipelineState {
        self.state
    }

    pub fn compile_stage(mut self, outcome: anyhow::Result<CompileOutcome>) -> Staged {
        let stage = JudgeStage::Compilation;
        match outcome {
            Ok(CompileOutcome::Ok) => self.state.succeed(stage),
            Ok(CompileOutcome::CompileError(diagnostic)) => {
                self.state.fail(stage, Verdict::CompileError, diagnostic)
            }
            Ok(CompileOutcome::InternalError(detail)) => {
                error!("Compiler environment failure: {}", detail);
                self.state.fail(stage, Verdict::InternalError, "#errors.unknown")
            }
            Err(e) => self.state.fail(stage, Verdict::InternalError, format!("{:#}", e)),
        }
        self.settle()
    }

    pub fn runtime_stage(mut self, outcome: anyhow::Result<ExecutionOutcome>) -> Staged {
        let stage = JudgeStage::Runtime;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.state.fail(stage, Verdict::InternalError, format!("{:#}", e));
                return self.settle();
            }
        };

        self.state.cpu_time_ms = outcome.cpu_time_ms;
        self.state.real_time_ms = outcome.real_time_ms;
        self.state.peak_memory_bytes = outcome.peak_memory_bytes;
        self.state.violating_syscall = outcome.violating_syscall;
        if outcome.kind.is_environment_fault() {
            error!("Watchdog reported a platform fault: {}", outcome);
        }

        let failure = match outcome.kind {
            OutcomeKind::Ok => None,
            OutcomeKind::AbnormalTermination => {
                Some((Verdict::RuntimeError, "#errors.abnormalTermination"))
            }
            OutcomeKind::IncorrectSecurityConfig => {
                Some((Verdict::InternalError, "#errors.securityConfig"))
            }
            OutcomeKind::InternalError => Some((Verdict::InternalError, "#errors.internalError")),
            OutcomeKind::MemoryLimit => Some((Verdict::MemoryLimit, "#errors.memoryLimit")),
            OutcomeKind::OutputLimit => Some((Verdict::OutputLimit, "#errors.outputLimit")),
            OutcomeKind::RuntimeError => Some((Verdict::RuntimeError, "#errors.runtimeError")),
            OutcomeKind::SecurityViolation => {
                Some((Verdict::SecurityViolation, "#errors.securityViolation"))
            }
            OutcomeKind::TimeLimit => Some((Verdict::TimeLimit, "#errors.timeLimit")),
        };

        match failure {
            None => self.state.succeed(stage),
            Some((verdict, message)) => self.state.fail(stage, verdict, message),
        }
        self.settle()
    }

    /// Answer-side check. A passing check awards `max_score`.
    pub fn checking_stage(self, outcome: anyhow::Result<CheckerResult>, max_score: f64) -> Staged {
        self.check(outcome, Some(max_score))
    }

    /// Answer-side precondition (the output was produced and is readable).
    /// Failing it fails the answer stage; passing it decides nothing and
    /// awards nothing.
    pub fn output_stage(self, outcome: anyhow::Result<CheckerResult>) -> Staged {
        self.check(outcome, None)
    }

    fn check(mut self, outcome: anyhow::Result<CheckerResult>, award: Option<f64>) -> Staged {
        let stage = JudgeStage::Answer;
        match outcome {
            Ok(result) => {
                self.state.checker_message = Some(result.message);
                match result.check {
                    AnswerCheck::Ok => {
                        if let Some(max_score) = award {
                            self.state.verdict = Some(Verdict::Ok);
                            self.state.score = max_score;
                        }
                        self.state.succeed(stage);
                    }
                    AnswerCheck::PresentationError => self.state.fail(
                        stage,
                        Verdict::PresentationError,
                        "#answers.presentationError",
                    ),
                    AnswerCheck::WrongAnswer => {
                        self.state.fail(stage, Verdict::WrongAnswer, "#answers.wrongAnswer")
                    }
                }
            }
            Err(e) => self.state.fail(stage, Verdict::InternalError, format!("{:#}", e)),
        }
        self.settle()
    }

    fn settle(self) -> Staged {
        self.state.resume()
    }
}

impl FailedPipeline {
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn into_state(self) -> PipelineState {
        self.state
    }
}

/// Final state of a stage chain, failed or not
pub fn settled(staged: Staged) -> PipelineState {
    match staged {
        Ok(pipeline) => pipeline.into_state(),
        Err(failed) => failed.into_state(),
    }
}

/// Final verdict of one test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionResult {
    /// Unset when no stage decided a category (e.g. answer not checked)
    pub verdict: Option<Verdict>,
    pub cpu_time_ms: i64,
    pub real_time_ms: i64,
    pub peak_memory_bytes: i64,
    pub violating_syscall: i64,
    pub score: f64,
    pub stages: BTreeMap<JudgeStage, bool>,
    pub error_messages: BTreeMap<JudgeStage, String>,
    pub checker_message: Option<String>,
}

impl SolutionResult {
    /// Stage message safe to show the contestant
    pub fn public_message(&self, stage: JudgeStage) -> Option<&str> {
        let message = self.error_messages.get(&stage)?;
        match self.verdict.map(|v| v.fault()) {
            Some(FaultClass::Environment) => Some(OPAQUE_INTERNAL_ERROR),
            _ => Some(message),
        }
    }
}
