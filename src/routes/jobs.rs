use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::{JobStatusResponse, SubmitJobResponse};
use crate::models::job::JobId;
use crate::services::submitter::{self, Submission, SubmitError};

/// POST /api/v1/jobs — upload an image (`image`) for a recipient (`email`).
pub async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitJobResponse>), StatusCode> {
    let mut recipient: Option<String> = None;
    let mut image: Option<(String, String, Vec<u8>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        match field.name() {
            Some("email") => {
                let value = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                recipient = Some(value.trim().to_string());
            }
            Some("image") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                image = Some((file_name, content_type, data.to_vec()));
            }
            _ => {}
        }
    }

    let recipient_address = recipient.ok_or(StatusCode::BAD_REQUEST)?;
    let (original_file_name, content_type, image) = image.ok_or(StatusCode::BAD_REQUEST)?;

    let submission = Submission {
        recipient_address,
        original_file_name,
        content_type,
        image,
    };

    let job_id = submitter::submit_job(&state, submission)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Job submission failed");
            submit_error_status(&e)
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id,
            status: "submitted".to_string(),
            message: "Image queued for recognition; results will be emailed".to_string(),
        }),
    ))
}

pub fn submit_error_status(error: &SubmitError) -> StatusCode {
    match error {
        SubmitError::Invalid(_) | SubmitError::EmptyImage => StatusCode::BAD_REQUEST,
        SubmitError::JobStore(_) | SubmitError::Storage(_) | SubmitError::Queue(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /api/v1/jobs/{recipient}/{job_id} — job status lookup.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path((recipient, job_id)): Path<(String, String)>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    let job = state
        .jobs
        .get(&recipient, &JobId::from(job_id))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Job status lookup failed");
            StatusCode::SERVICE_UNAVAILABLE
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(JobStatusResponse::from(job)))
}
