//! Execution outcome model
//!
//! What one supervised run produced, and the limits it ran under.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::{property, Properties};
use crate::error::JudgeError;

/// Sentinel for a measurement the supervisor did not report
pub const UNKNOWN: i64 = -1;

/// Outcome kind reported by the sandbox supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Ok,
    SecurityViolation,
    MemoryLimit,
    OutputLimit,
    TimeLimit,
    RuntimeError,
    AbnormalTermination,
    InternalError,
    IncorrectSecurityConfig,
}

/// Numeric payload a kind carries in the verdict file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// `(realTimeMs, cpuTimeMs, peakMemoryBytes)`
    Usage,
    /// `(syscallId)`
    Syscall,
    None,
}

impl OutcomeKind {
    pub const ALL: [OutcomeKind; 9] = [
        OutcomeKind::Ok,
        OutcomeKind::SecurityViolation,
        OutcomeKind::MemoryLimit,
        OutcomeKind::OutputLimit,
        OutcomeKind::TimeLimit,
        OutcomeKind::RuntimeError,
        OutcomeKind::AbnormalTermination,
        OutcomeKind::InternalError,
        OutcomeKind::IncorrectSecurityConfig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Ok => "OK",
            OutcomeKind::SecurityViolation => "SECURITY_VIOLATION",
            OutcomeKind::MemoryLimit => "MEMORY_LIMIT",
            OutcomeKind::OutputLimit => "OUTPUT_LIMIT",
            OutcomeKind::TimeLimit => "TIME_LIMIT",
            OutcomeKind::RuntimeError => "RUNTIME_ERROR",
            OutcomeKind::AbnormalTermination => "ABNORMAL_TERMINATION",
            OutcomeKind::InternalError => "INTERNAL_ERROR",
            OutcomeKind::IncorrectSecurityConfig => "INCORRECT_SECURITY_CONFIG",
        }
    }

    /// Case-sensitive lookup of a verdict identifier
    pub fn from_ident(ident: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == ident)
    }

    pub fn payload(&self) -> Payload {
        match self {
            OutcomeKind::SecurityViolation => Payload::Syscall,
            OutcomeKind::InternalError | OutcomeKind::IncorrectSecurityConfig => Payload::None,
            _ => Payload::Usage,
        }
    }

    /// Whether the platform, not the submission, is at fault
    pub fn is_environment_fault(&self) -> bool {
        matches!(
            self,
            OutcomeKind::InternalError
                | OutcomeKind::IncorrectSecurityConfig
                | OutcomeKind::AbnormalTermination
        )
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one sandboxed run. Fields the kind does not carry are [`UNKNOWN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub kind: OutcomeKind,
    pub real_time_ms: i64,
    pub cpu_time_ms: i64,
    pub peak_memory_bytes: i64,
    /// Only meaningful for [`OutcomeKind::SecurityViolation`]
    pub violating_syscall: i64,
}

impl ExecutionOutcome {
    pub fn with_usage(kind: OutcomeKind, real_time_ms: i64, cpu_time_ms: i64, peak_memory_bytes: i64) -> Self {
        Self {
            kind,
            real_time_ms,
            cpu_time_ms,
            peak_memory_bytes,
            violating_syscall: UNKNOWN,
        }
    }

    pub fn security_violation(syscall: i64) -> Self {
        Self {
            kind: OutcomeKind::SecurityViolation,
            real_time_ms: UNKNOWN,
            cpu_time_ms: UNKNOWN,
            peak_memory_bytes: UNKNOWN,
            violating_syscall: syscall,
        }
    }

    pub fn bare(kind: OutcomeKind) -> Self {
        Self {
            kind,
            real_time_ms: UNKNOWN,
            cpu_time_ms: UNKNOWN,
            peak_memory_bytes: UNKNOWN,
            violating_syscall: UNKNOWN,
        }
    }
}

/// Verdict-file rendering of the outcome
impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind.payload() {
            Payload::Usage => write!(
                f,
                "{}({},{},{})",
                self.kind, self.real_time_ms, self.cpu_time_ms, self.peak_memory_bytes
            ),
            Payload::Syscall => write!(f, "{}({})", self.kind, self.violating_syscall),
            Payload::None => write!(f, "{}", self.kind),
        }
    }
}

/// Limits for one program invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_time_ms: u64,
    pub real_time_ms: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl ResourceLimits {
    /// Read `cpuTimeLimit`, `realTimeLimit`, `memoryLimit` and `diskLimit`
    pub fn from_properties(properties: &Properties) -> Result<Self, JudgeError> {
        Ok(Self {
            cpu_time_ms: property(properties, "cpuTimeLimit")?,
            real_time_ms: property(properties, "realTimeLimit")?,
            memory_bytes: property(properties, "memoryLimit")?,
            disk_bytes: property(properties, "diskLimit")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_matches_payload() {
        assert_eq!(
            ExecutionOutcome::with_usage(OutcomeKind::TimeLimit, 2001, 1000, 4096).to_string(),
            "TIME_LIMIT(2001,1000,4096)"
        );
        assert_eq!(
            ExecutionOutcome::security_violation(59).to_string(),
            "SECURITY_VIOLATION(59)"
        );
        assert_eq!(
            ExecutionOutcome::bare(OutcomeKind::IncorrectSecurityConfig).to_string(),
            "INCORRECT_SECURITY_CONFIG"
        );
    }

    #[test]
    fn test_from_ident_is_case_sensitive() {
        assert_eq!(OutcomeKind::from_ident("OK"), Some(OutcomeKind::Ok));
        assert_eq!(OutcomeKind::from_ident("ok"), None);
        assert_eq!(
            OutcomeKind::from_ident("ABNORMAL_TERMINATION"),
            Some(OutcomeKind::AbnormalTermination)
        );
    }

    #[test]
    fn test_limits_from_properties() {
        let properties: Properties = [
            ("cpuTimeLimit", "1000"),
            ("realTimeLimit", "3000"),
            ("memoryLimit", "268435456"),
            ("diskLimit", "1048576"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let limits = ResourceLimits::from_properties(&properties).unwrap();
        assert_eq!(limits.cpu_time_ms, 1000);
        assert_eq!(limits.real_time_ms, 3000);
        assert_eq!(limits.memory_bytes, 268_435_456);
        assert_eq!(limits.disk_bytes, 1_048_576);

        let mut incomplete = properties.clone();
        incomplete.remove("diskLimit");
        assert!(ResourceLimits::from_properties(&incomplete).is_err());
    }
}
