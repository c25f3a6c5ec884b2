//! The batch submission accepted at the boundary.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::options::JobOptions;
use crate::error::JobError;

/// A batch of previously uploaded media files to analyze as one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BatchRequest {
    pub case_id: String,
    pub user_id: String,
    pub upload_ids: Vec<String>,
    pub video_paths: Vec<PathBuf>,
    #[serde(default)]
    pub options: JobOptions,
}

impl BatchRequest {
    pub fn new(
        case_id: impl Into<String>,
        user_id: impl Into<String>,
        upload_ids: Vec<String>,
        video_paths: Vec<PathBuf>,
        options: JobOptions,
    ) -> Self {
        Self {
            case_id: case_id.into(),
            user_id: user_id.into(),
            upload_ids,
            video_paths,
            options,
        }
    }

    /// Parses a JSON submission. Unknown keys, at the top level or inside
    /// `options`, are rejected.
    pub fn from_json(content: &str) -> Result<Self, JobError> {
        let request: BatchRequest = serde_json::from_str(content)
            .map_err(|e| JobError::Validation(format!("malformed batch request: {}", e)))?;
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.case_id.trim().is_empty() {
            return Err(JobError::Validation("case_id is required".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(JobError::Validation("user_id is required".to_string()));
        }
        if self.video_paths.is_empty() {
            return Err(JobError::Validation(
                "video_paths must not be empty".to_string(),
            ));
        }
        if self.upload_ids.len() != self.video_paths.len() {
            return Err(JobError::Validation(format!(
                "upload_ids has {} entries but video_paths has {}",
                self.upload_ids.len(),
                self.video_paths.len()
            )));
        }
        if let Some(i) = self.upload_ids.iter().position(|u| u.trim().is_empty()) {
            return Err(JobError::Validation(format!("upload_ids[{}] is empty", i)));
        }
        if let Some(i) = self
            .video_paths
            .iter()
            .position(|p| p.as_os_str().is_empty())
        {
            return Err(JobError::Validation(format!("video_paths[{}] is empty", i)));
        }
        self.options.validate()
    }
}
