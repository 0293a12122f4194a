//! Shared judging vocabulary

pub mod utils;
pub mod verdict;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JudgeError;

pub use verdict::{FaultClass, JudgeStage, Verdict};

/// Free-form per-test or per-judge settings (limits, score, I/O mode)
pub type Properties = BTreeMap<String, String>;

/// Read a required, typed property
pub fn property<T: FromStr>(properties: &Properties, key: &str) -> Result<T, JudgeError> {
    let raw = properties.get(key);
    raw.and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| JudgeError::InvalidProperty {
            key: key.to_string(),
            value: raw.cloned(),
        })
}

/// Identity of one judge instance, stable across nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JudgeId(Uuid);

impl JudgeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JudgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JudgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
