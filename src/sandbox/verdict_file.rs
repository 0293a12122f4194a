//! Watchdog verdict file parser
//!
//! The supervisor writes a single line before exiting:
//!
//! ```text
//! VERDICT := IDENT [ "(" VALUE { "," VALUE } ")" ]
//! VALUE   := DIGITS            (whitespace around a value is ignored)
//! ```
//!
//! Arity is fixed by the kind: usage kinds carry `(real, cpu, memory)`,
//! `SECURITY_VIOLATION` carries `(syscall)`, `INTERNAL_ERROR` and
//! `INCORRECT_SECURITY_CONFIG` carry nothing.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs;

use super::outcome::{ExecutionOutcome, OutcomeKind, Payload};
use crate::error::VerdictError;

/// File name the supervisor writes into its working directory
pub const VERDICT_FILE: &str = "verdict.txt";

/// Parse verdict text into an outcome
pub fn parse_verdict(text: &str) -> Result<ExecutionOutcome, VerdictError> {
    let line = text.trim();
    let malformed = || VerdictError::MalformedVerdict(line.to_string());

    let (ident, args) = match line.find('(') {
        Some(open) => {
            let inner = line[open + 1..].strip_suffix(')').ok_or_else(malformed)?;
            (&line[..open], Some(inner))
        }
        None => (line, None),
    };

    if ident.is_empty() || !ident.chars().all(|c| c.is_ascii_alphabetic() || c == '_') {
        return Err(malformed());
    }
    let kind = OutcomeKind::from_ident(ident)
        .ok_or_else(|| VerdictError::UnknownOutcomeKind(ident.to_string()))?;

    let values = match args {
        Some(inner) => parse_values(inner).ok_or_else(malformed)?,
        None => Vec::new(),
    };

    match (kind.payload(), values.as_slice()) {
        (Payload::Usage, &[real, cpu, memory]) => {
            Ok(ExecutionOutcome::with_usage(kind, real, cpu, memory))
        }
        (Payload::Syscall, &[syscall]) => Ok(ExecutionOutcome::security_violation(syscall)),
        (Payload::None, []) => Ok(ExecutionOutcome::bare(kind)),
        _ => Err(malformed()),
    }
}

fn parse_values(inner: &str) -> Option<Vec<i64>> {
    inner
        .split(',')
        .map(|raw| {
            let digits = raw.trim();
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()
        })
        .collect()
}

/// Read and parse the verdict file the supervisor left behind
pub async fn read_verdict_file(path: &Path) -> Result<ExecutionOutcome> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("Verdict file {:?} is missing or unreadable", path))?;

    parse_verdict(&text).with_context(|| format!("Failed to parse verdict file {:?}", path))
}
