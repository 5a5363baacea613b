use serde::{Deserialize, Serialize};

use crate::models::job::{JobId, JobStage, OcrJob};

/// Response after submitting an image for recognition.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status: String,
    pub message: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub recipient_address: String,
    pub original_file_name: String,
    pub submitted_at: chrono::DateTime<chrono::Utc>,
    pub stage: JobStage,
    pub is_completed: bool,
    pub error: Option<String>,
}

impl From<OcrJob> for JobStatusResponse {
    fn from(job: OcrJob) -> Self {
        Self {
            job_id: job.job_id,
            recipient_address: job.recipient_address,
            original_file_name: job.original_file_name,
            submitted_at: job.submitted_at,
            stage: job.stage,
            is_completed: job.is_completed,
            error: job.error_detail,
        }
    }
}
