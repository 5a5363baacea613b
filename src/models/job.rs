use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Opaque job identifier. Generated as a UUID by the submitter, but treated
/// as an arbitrary non-empty token everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Furthest pipeline stage a job has successfully passed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStage {
    Submitted,
    Recognized,
    Delivered,
}

/// Status record for one OCR job, keyed by `(recipient_address, job_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrJob {
    pub job_id: JobId,
    pub recipient_address: String,
    pub original_file_name: String,
    pub submitted_at: DateTime<Utc>,
    pub stage: JobStage,
    pub is_completed: bool,
    pub error_detail: Option<String>,
}

impl OcrJob {
    /// Fresh record as written by the submitter before anything is queued.
    pub fn new(job_id: JobId, recipient_address: &str, original_file_name: &str) -> Self {
        Self {
            job_id,
            recipient_address: recipient_address.to_string(),
            original_file_name: original_file_name.to_string(),
            submitted_at: Utc::now(),
            stage: JobStage::Submitted,
            is_completed: false,
            error_detail: None,
        }
    }

    /// Record a successful stage. Any error left by an earlier attempt is
    /// overwritten.
    pub fn mark_succeeded(&mut self, stage: JobStage) {
        if stage > self.stage {
            self.stage = stage;
        }
        self.is_completed = true;
        self.error_detail = None;
    }

    /// Record a failed attempt. Only the final stage closes the job.
    pub fn mark_failed(&mut self, detail: &str, final_stage: bool) {
        if final_stage {
            self.is_completed = true;
        }
        self.error_detail = Some(detail.to_string());
    }
}
