use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform-level result category of one judged test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Ok,
    WrongAnswer,
    PresentationError,
    TimeLimit,
    MemoryLimit,
    OutputLimit,
    RuntimeError,
    SecurityViolation,
    CompileError,
    InternalError,
}

impl Verdict {
    /// Who is to blame for this category
    pub fn fault(&self) -> FaultClass {
        match self {
            Verdict::InternalError => FaultClass::Environment,
            _ => FaultClass::User,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Ok => "ok",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::PresentationError => "presentation_error",
            Verdict::TimeLimit => "time_limit",
            Verdict::MemoryLimit => "memory_limit",
            Verdict::OutputLimit => "output_limit",
            Verdict::RuntimeError => "runtime_error",
            Verdict::SecurityViolation => "security_violation",
            Verdict::CompileError => "compile_error",
            Verdict::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

/// Phase of judging a single test
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeStage {
    Compilation,
    Runtime,
    Answer,
}

impl fmt::Display for JudgeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JudgeStage::Compilation => "compilation",
            JudgeStage::Runtime => "runtime",
            JudgeStage::Answer => "answer",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Caused by the submission; reported verbatim
    User,
    /// Caused by the platform; reported opaquely and alerted on
    Environment,
}
