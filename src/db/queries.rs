use sqlx::{postgres::PgRow, PgPool, Row};

use crate::models::job::{JobId, JobStage, OcrJob};

fn job_from_row(row: &PgRow) -> Result<OcrJob, sqlx::Error> {
    let stage: String = row.try_get("stage")?;
    let stage = stage
        .parse::<JobStage>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let job_id: String = row.try_get("job_id")?;

    Ok(OcrJob {
        job_id: JobId::from(job_id),
        recipient_address: row.try_get("recipient_address")?,
        original_file_name: row.try_get("original_file_name")?,
        submitted_at: row.try_get("submitted_at")?,
        stage,
        is_completed: row.try_get("is_completed")?,
        error_detail: row.try_get("error_detail")?,
    })
}

/// Insert a new job record
pub async fn create_job(pool: &PgPool, job: &OcrJob) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO ocr_jobs
            (recipient_address, job_id, original_file_name, submitted_at, stage,
             is_completed, error_detail)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&job.recipient_address)
    .bind(job.job_id.as_str())
    .bind(&job.original_file_name)
    .bind(job.submitted_at)
    .bind(job.stage.to_string())
    .bind(job.is_completed)
    .bind(job.error_detail.as_deref())
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a job by recipient and ID
pub async fn get_job(
    pool: &PgPool,
    recipient_address: &str,
    job_id: &JobId,
) -> Result<Option<OcrJob>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT recipient_address, job_id, original_file_name, submitted_at, stage,
               is_completed, error_detail
        FROM ocr_jobs
        WHERE recipient_address = $1 AND job_id = $2
        "#,
    )
    .bind(recipient_address)
    .bind(job_id.as_str())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Overwrite the mutable fields of a job still at `expected_stage`.
/// Returns the number of rows touched.
pub async fn replace_job(
    pool: &PgPool,
    job: &OcrJob,
    expected_stage: JobStage,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE ocr_jobs
        SET stage = $1,
            is_completed = $2,
            error_detail = $3,
            updated_at = NOW()
        WHERE recipient_address = $4 AND job_id = $5 AND stage = $6
        "#,
    )
    .bind(job.stage.to_string())
    .bind(job.is_completed)
    .bind(job.error_detail.as_deref())
    .bind(&job.recipient_address)
    .bind(job.job_id.as_str())
    .bind(expected_stage.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
