use std::path::Path;

use crate::app_state::AppState;
use crate::models::job::{JobId, OcrJob};
use crate::models::message::{MessageFormatError, PipelineMessage, RecognitionMessage};
use crate::services::job_store::JobStoreError;
use crate::services::queue::QueueError;
use crate::services::storage::StorageError;

/// An uploaded image waiting to enter the pipeline.
#[derive(Debug, Clone)]
pub struct Submission {
    pub recipient_address: String,
    pub original_file_name: String,
    pub content_type: String,
    pub image: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid submission: {0}")]
    Invalid(#[from] MessageFormatError),

    #[error("Image is empty")]
    EmptyImage,

    #[error("Failed to record job: {0}")]
    JobStore(#[from] JobStoreError),

    #[error("Failed to store image: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to queue job: {0}")]
    Queue(#[from] QueueError),
}

/// Image blob name for a job, keeping the original file extension.
pub fn image_blob_name(job_id: &JobId, original_file_name: &str) -> String {
    let extension = Path::new(original_file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase());

    match extension {
        Some(ext) => format!("{job_id}.{ext}"),
        None => job_id.to_string(),
    }
}

/// Put a new job into the pipeline.
///
/// Order matters: the status record is written before the image is stored
/// and before the recognition message is published. A failure after the
/// record exists leaves the job incomplete; nothing is rolled back.
pub async fn submit_job(state: &AppState, submission: Submission) -> Result<JobId, SubmitError> {
    if submission.image.is_empty() {
        return Err(SubmitError::EmptyImage);
    }

    let job_id = JobId::generate();
    let blob_name = image_blob_name(&job_id, &submission.original_file_name);
    let message = RecognitionMessage::new(job_id.clone(), &blob_name, &submission.recipient_address)?;

    let job = OcrJob::new(
        job_id.clone(),
        &submission.recipient_address,
        &submission.original_file_name,
    );
    state.jobs.create(&job).await?;

    state
        .images
        .upload(&blob_name, &submission.image, &submission.content_type)
        .await?;

    state.recognition_queue.enqueue(&message.encode()).await?;

    metrics::counter!("jobs_submitted_total").increment(1);
    tracing::info!(
        job_id = %job_id,
        recipient = %submission.recipient_address,
        image_blob = %blob_name,
        "Job submitted"
    );

    Ok(job_id)
}
