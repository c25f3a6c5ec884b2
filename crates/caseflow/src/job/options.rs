//! Per-job analysis options.
//!
//! The set of keys is closed: anything not listed on `JobOptions` is a
//! validation error at the boundary, never silently dropped.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::JobError;

static LANGUAGE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]{2,3}(-[A-Za-z0-9]{2,8})*$").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct JobOptions {
    /// Run the transcription stage.
    #[serde(default = "default_true")]
    pub auto_transcribe: bool,
    /// Run speaker separation.
    #[serde(default = "default_true")]
    pub diarize: bool,
    /// Spoken language tag passed to the stages, e.g. `en` or `es-MX`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_hint: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            auto_transcribe: true,
            diarize: true,
            language_hint: None,
        }
    }
}

impl JobOptions {
    /// Parses options from a JSON value, rejecting unknown keys.
    pub fn from_value(value: serde_json::Value) -> Result<Self, JobError> {
        let options: JobOptions = serde_json::from_value(value)
            .map_err(|e| JobError::Validation(format!("invalid options: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if let Some(ref hint) = self.language_hint {
            if !LANGUAGE_TAG.is_match(hint) {
                return Err(JobError::Validation(format!(
                    "language_hint '{}' is not a language tag",
                    hint
                )));
            }
        }
        Ok(())
    }
}
