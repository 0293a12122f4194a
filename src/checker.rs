//! Answer checking
//!
//! Compares a program's output against the reference answer, and checks
//! that file-based output was actually produced.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::ExecutorError;

/// Outcome of an answer check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerCheck {
    Ok,
    WrongAnswer,
    PresentationError,
}

/// Result of running a checker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerResult {
    pub check: AnswerCheck,
    pub message: String,
}

impl CheckerResult {
    fn new(check: AnswerCheck, message: &str) -> Self {
        Self {
            check,
            message: message.to_string(),
        }
    }
}

/// Charset both answers are decoded with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AnswerEncoding {
    #[default]
    #[serde(rename = "US-ASCII")]
    Ascii,
    #[serde(rename = "UTF-8")]
    Utf8,
}

impl AnswerEncoding {
    fn decode<'a>(&self, bytes: &'a [u8]) -> Option<&'a str> {
        match self {
            AnswerEncoding::Ascii if !bytes.is_ascii() => None,
            _ => std::str::from_utf8(bytes).ok(),
        }
    }
}

impl FromStr for AnswerEncoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "US-ASCII" | "ASCII" => Ok(AnswerEncoding::Ascii),
            "UTF-8" | "UTF8" => Ok(AnswerEncoding::Utf8),
            other => Err(anyhow!("Unsupported answer charset: {}", other)),
        }
    }
}

impl fmt::Display for AnswerEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerEncoding::Ascii => f.write_str("US-ASCII"),
            AnswerEncoding::Utf8 => f.write_str("UTF-8"),
        }
    }
}

/// Line-by-line comparison that ignores how tokens are separated within a
/// line and any trailing blank lines.
pub struct WhitespaceTokenizedVerifier {
    expected: PathBuf,
    encoding: AnswerEncoding,
}

impl WhitespaceTokenizedVerifier {
    pub fn new(expected: impl AsRef<Path>, encoding: AnswerEncoding) -> Self {
        Self {
            expected: expected.as_ref().to_path_buf(),
            encoding,
        }
    }

    pub async fn check(&self, actual: &[u8]) -> Result<CheckerResult> {
        let expected_bytes = fs::read(&self.expected)
            .await
            .with_context(|| format!("Failed to read reference answer {:?}", self.expected))?;
        let expected = self.encoding.decode(&expected_bytes).ok_or_else(|| {
            anyhow!("Reference answer {:?} is not valid {}", self.expected, self.encoding)
        })?;

        let Some(actual) = self.encoding.decode(actual) else {
            debug!("Program output is not valid {}", self.encoding);
            return Ok(CheckerResult::new(
                AnswerCheck::PresentationError,
                "verifier.encoding.invalid",
            ));
        };

        if tokenize(actual) == tokenize(expected) {
            Ok(CheckerResult::new(AnswerCheck::Ok, "verifier.tokens.match"))
        } else {
            Ok(CheckerResult::new(AnswerCheck::WrongAnswer, "verifier.tokens.mismatch"))
        }
    }
}

fn tokenize(text: &str) -> Vec<Vec<&str>> {
    let mut lines: Vec<Vec<&str>> = text
        .lines()
        .map(|line| line.split_whitespace().collect())
        .collect();
    while lines.last().is_some_and(|tokens| tokens.is_empty()) {
        lines.pop();
    }
    lines
}

/// The program's output file exists and is a regular file
pub async fn output_exists(path: &Path) -> CheckerResult {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => CheckerResult::new(AnswerCheck::Ok, "verifier.file.exists"),
        _ => CheckerResult::new(AnswerCheck::PresentationError, "verifier.file.doesntexist"),
    }
}

/// Turn a failed copy-out of the output file into a presentation error;
/// other failures stay errors.
pub fn output_retrieved(retrieval: Result<()>) -> Result<CheckerResult> {
    match retrieval {
        Ok(()) => Ok(CheckerResult::new(AnswerCheck::Ok, "verifier.file.exists")),
        Err(e) if is_not_found(&e) => {
            debug!("Output file was not produced: {:#}", e);
            Ok(CheckerResult::new(
                AnswerCheck::PresentationError,
                "verifier.file.doesntexist",
            ))
        }
        Err(e) => Err(e),
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ExecutorError>(),
            Some(ExecutorError::FileNotProduced(_))
        ) || cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io| io.kind() == io::ErrorKind::NotFound)
    })
}
