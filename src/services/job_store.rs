use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::queries;
use crate::models::job::{JobId, JobStage, OcrJob};

/// Durable job status records keyed by `(recipient_address, job_id)`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &OcrJob) -> Result<(), JobStoreError>;

    async fn get(&self, recipient_address: &str, job_id: &JobId)
        -> Result<Option<OcrJob>, JobStoreError>;

    /// Replace the mutable fields of a record, but only if its stored stage
    /// is still `expected_stage`. Otherwise fails with
    /// [`JobStoreError::StageConflict`] and leaves the record untouched.
    async fn replace(&self, job: &OcrJob, expected_stage: JobStage)
        -> Result<(), JobStoreError>;

    async fn ping(&self) -> Result<(), JobStoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {job_id} for {recipient_address} not found")]
    NotFound {
        recipient_address: String,
        job_id: JobId,
    },

    #[error("Job {job_id} for {recipient_address} already exists")]
    AlreadyExists {
        recipient_address: String,
        job_id: JobId,
    },

    #[error("Job {job_id} for {recipient_address} moved on from stage {expected}")]
    StageConflict {
        recipient_address: String,
        job_id: JobId,
        expected: JobStage,
    },

    #[error("Job store unavailable: {0}")]
    Unavailable(String),
}

impl JobStoreError {
    fn not_found(job: &OcrJob) -> Self {
        Self::NotFound {
            recipient_address: job.recipient_address.clone(),
            job_id: job.job_id.clone(),
        }
    }

    fn stage_conflict(job: &OcrJob, expected: JobStage) -> Self {
        Self::StageConflict {
            recipient_address: job.recipient_address.clone(),
            job_id: job.job_id.clone(),
            expected,
        }
    }
}

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &OcrJob) -> Result<(), JobStoreError> {
        queries::create_job(&self.pool, job).await.map_err(|e| {
            let duplicate = e
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation());
            if duplicate {
                JobStoreError::AlreadyExists {
                    recipient_address: job.recipient_address.clone(),
                    job_id: job.job_id.clone(),
                }
            } else {
                JobStoreError::Database(e)
            }
        })
    }

    async fn get(
        &self,
        recipient_address: &str,
        job_id: &JobId,
    ) -> Result<Option<OcrJob>, JobStoreError> {
        Ok(queries::get_job(&self.pool, recipient_address, job_id).await?)
    }

    async fn replace(&self, job: &OcrJob, expected_stage: JobStage) -> Result<(), JobStoreError> {
        let updated = queries::replace_job(&self.pool, job, expected_stage).await?;
        if updated > 0 {
            return Ok(());
        }
        match queries::get_job(&self.pool, &job.recipient_address, &job.job_id).await? {
            Some(_) => Err(JobStoreError::stage_conflict(job, expected_stage)),
            None => Err(JobStoreError::not_found(job)),
        }
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-process job store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<(String, JobId), OcrJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, JobId), OcrJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn key(job: &OcrJob) -> (String, JobId) {
    (job.recipient_address.clone(), job.job_id.clone())
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &OcrJob) -> Result<(), JobStoreError> {
        let mut jobs = self.lock();
        if jobs.contains_key(&key(job)) {
            return Err(JobStoreError::AlreadyExists {
                recipient_address: job.recipient_address.clone(),
                job_id: job.job_id.clone(),
            });
        }
        jobs.insert(key(job), job.clone());
        Ok(())
    }

    async fn get(
        &self,
        recipient_address: &str,
        job_id: &JobId,
    ) -> Result<Option<OcrJob>, JobStoreError> {
        Ok(self
            .lock()
            .get(&(recipient_address.to_string(), job_id.clone()))
            .cloned())
    }

    async fn replace(&self, job: &OcrJob, expected_stage: JobStage) -> Result<(), JobStoreError> {
        match self.lock().get_mut(&key(job)) {
            Some(stored) if stored.stage == expected_stage => {
                *stored = job.clone();
                Ok(())
            }
            Some(_) => Err(JobStoreError::stage_conflict(job, expected_stage)),
            None => Err(JobStoreError::not_found(job)),
        }
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        Ok(())
    }
}
