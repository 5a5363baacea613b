//! Queue-driven pipeline workers.
//!
//! Both workers share one polling loop and one reconciliation policy and
//! differ only in their [`Stage`]. Per leased message:
//!
//! 1. Messages leased more than `poison_threshold` times are deleted
//!    unprocessed. The job is abandoned.
//! 2. Unparseable bodies are deleted without touching any job record.
//! 3. Messages whose job already passed this stage are deleted as duplicates.
//!    Messages whose job has not yet recorded the previous stage are left for
//!    redelivery.
//! 4. Otherwise the stage runs. The job record is then read again and the
//!    outcome written back only if no other worker moved the job on in the
//!    meantime. The consumed input blob is removed and the message deleted
//!    only after a successful stage *and* a successful status write.
//!    Failures stay queued and come back when the lease expires, eventually
//!    hitting the poison limit if they keep failing.

pub mod delivery;
pub mod recognition;

use std::sync::Arc;

use async_trait::async_trait;
use strum::Display;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerSettings;
use crate::models::job::{JobStage, OcrJob};
use crate::models::message::{MessageFormatError, PipelineMessage};
use crate::services::email::EmailError;
use crate::services::job_store::JobStore;
use crate::services::ocr::OcrError;
use crate::services::queue::{LeasedMessage, MessageQueue, QueueError};
use crate::services::storage::StorageError;

/// Failure of a stage's external work. Recorded on the job, never raised.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ocr(#[from] OcrError),

    #[error(transparent)]
    Email(#[from] EmailError),

    #[error("Failed to publish follow-up message: {0}")]
    Queue(#[from] QueueError),

    #[error("Failed to build follow-up message: {0}")]
    Message(#[from] MessageFormatError),

    #[error("Local staging failed: {0}")]
    Staging(#[from] std::io::Error),
}

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    type Message: PipelineMessage;

    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Stage the job must have recorded before this step may run.
    fn requires(&self) -> JobStage;

    /// Stage recorded on the job once this step succeeds.
    fn completes(&self) -> JobStage;

    /// Whether a failure here closes the job (no later stage will run).
    fn is_final(&self) -> bool;

    /// The step's external work. Must leave its input blob in place.
    async fn process(&self, message: &Self::Message) -> Result<(), ProcessError>;

    /// Remove the input blob once the job record shows this step done.
    async fn finish(&self, message: &Self::Message) -> Result<(), ProcessError>;
}

/// Result of evaluating one leased message, before reconciliation.
#[derive(Debug)]
pub enum StageOutcome<M> {
    Malformed(MessageFormatError),
    Failed { message: M, detail: String },
    Succeeded { message: M },
}

/// What finally happened to a leased message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Disposition {
    /// Stage succeeded, status written, message deleted.
    Completed,
    /// Stage failed, error recorded, message left for redelivery.
    Failed,
    /// Body could not be parsed; message deleted.
    Malformed,
    /// Redelivery limit exceeded; message deleted unprocessed.
    Poison,
    /// Job already past this stage; message deleted.
    Duplicate,
    /// Previous stage not yet recorded on the job; message left as is.
    Waiting,
    /// Job record could not be read or written; message left as is.
    StatusError,
}

pub struct Worker<S> {
    stage: S,
    queue: Arc<dyn MessageQueue>,
    jobs: Arc<dyn JobStore>,
    settings: WorkerSettings,
}

impl<S: Stage> Worker<S> {
    pub fn new(
        stage: S,
        queue: Arc<dyn MessageQueue>,
        jobs: Arc<dyn JobStore>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            stage,
            queue,
            jobs,
            settings,
        }
    }

    /// Poll until `cancel` fires. Cancellation is only observed between
    /// messages; a message being processed is always finished first.
    pub async fn run(&self, cancel: CancellationToken) {
        let stage = self.stage.name();
        tracing::info!(
            stage,
            lease_timeout_secs = self.settings.lease_timeout.as_secs(),
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            poison_threshold = self.settings.poison_threshold,
            "Worker started"
        );

        self.report_queue_depth().await;

        while !cancel.is_cancelled() {
            match self.poll_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => tracing::trace!(stage, "No messages available, sleeping"),
                Err(e) => tracing::error!(stage, error = %e, "Failed to lease message"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            self.report_queue_depth().await;
        }

        tracing::info!(stage, "Worker stopped");
    }

    /// Lease and fully handle at most one message.
    pub async fn poll_once(&self) -> Result<Option<Disposition>, QueueError> {
        let leased = match self.queue.lease(self.settings.lease_timeout).await? {
            Some(leased) => leased,
            None => return Ok(None),
        };
        Ok(Some(self.handle(&leased).await))
    }

    pub async fn handle(&self, leased: &LeasedMessage) -> Disposition {
        let disposition = self.dispose(leased).await;
        metrics::counter!(
            "pipeline_messages_total",
            "stage" => self.stage.name(),
            "disposition" => disposition.to_string()
        )
        .increment(1);
        disposition
    }

    async fn dispose(&self, leased: &LeasedMessage) -> Disposition {
        let stage = self.stage.name();
        let message_id = leased.lease.message_id.as_str();
        tracing::info!(
            stage,
            message_id,
            redelivery_count = leased.redelivery_count,
            body = %leased.body,
            "Processing queue message"
        );

        if leased.redelivery_count > self.settings.poison_threshold {
            tracing::warn!(
                stage,
                message_id,
                redelivery_count = leased.redelivery_count,
                poison_threshold = self.settings.poison_threshold,
                body = %leased.body,
                "Redelivery limit exceeded, deleting poison message"
            );
            self.confirm(leased).await;
            return Disposition::Poison;
        }

        let outcome = self.evaluate(leased).await;
        match outcome {
            Ok(outcome) => self.reconcile(leased, outcome).await,
            Err(disposition) => disposition,
        }
    }

    /// Parse, check the job and run the stage. `Err` carries an early
    /// disposition that needs no reconciliation.
    async fn evaluate(
        &self,
        leased: &LeasedMessage,
    ) -> Result<StageOutcome<S::Message>, Disposition> {
        let stage = self.stage.name();
        let message = match <S::Message as PipelineMessage>::decode(&leased.body) {
            Ok(message) => message,
            Err(e) => return Ok(StageOutcome::Malformed(e)),
        };

        let job = self.load(&message).await?;
        if job.stage >= self.stage.completes() {
            tracing::info!(
                stage,
                job_id = %job.job_id,
                job_stage = %job.stage,
                "Job already past this stage, deleting duplicate message"
            );
            self.confirm(leased).await;
            return Err(Disposition::Duplicate);
        }
        if job.stage < self.stage.requires() {
            tracing::info!(
                stage,
                job_id = %job.job_id,
                job_stage = %job.stage,
                "Previous stage not recorded yet, leaving message for redelivery"
            );
            return Err(Disposition::Waiting);
        }

        tracing::debug!(stage, job_id = %job.job_id, blob = message.blob_name(), "Running stage");
        match self.stage.process(&message).await {
            Ok(()) => Ok(StageOutcome::Succeeded { message }),
            Err(e) => {
                tracing::warn!(
                    stage,
                    job_id = %job.job_id,
                    redelivery_count = leased.redelivery_count,
                    error = %e,
                    "Stage processing failed"
                );
                Ok(StageOutcome::Failed {
                    message,
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Current job record for `message`, or the disposition to report when
    /// it cannot be read.
    async fn load(&self, message: &S::Message) -> Result<OcrJob, Disposition> {
        let stage = self.stage.name();
        let job_id = message.job_id();
        let recipient = message.recipient_address();

        match self.jobs.get(recipient, job_id).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => {
                tracing::error!(
                    stage,
                    job_id = %job_id,
                    recipient,
                    "Job record not found, leaving message for redelivery"
                );
                Err(Disposition::StatusError)
            }
            Err(e) => {
                tracing::error!(
                    stage,
                    job_id = %job_id,
                    recipient,
                    error = %e,
                    "Failed to load job status, leaving message for redelivery"
                );
                Err(Disposition::StatusError)
            }
        }
    }

    async fn reconcile(
        &self,
        leased: &LeasedMessage,
        outcome: StageOutcome<S::Message>,
    ) -> Disposition {
        let stage = self.stage.name();
        let (message, failure) = match outcome {
            StageOutcome::Malformed(e) => {
                tracing::warn!(
                    stage,
                    message_id = %leased.lease.message_id,
                    error = %e,
                    "Invalid message format, deleting"
                );
                self.confirm(leased).await;
                return Disposition::Malformed;
            }
            StageOutcome::Succeeded { message } => (message, None),
            StageOutcome::Failed { message, detail } => (message, Some(detail)),
        };

        // Re-read: another worker may have moved the job on while we ran.
        let mut job = match self.load(&message).await {
            Ok(job) => job,
            Err(disposition) => return disposition,
        };
        if job.stage >= self.stage.completes() {
            tracing::info!(
                stage,
                job_id = %job.job_id,
                job_stage = %job.stage,
                "Job completed this stage elsewhere, deleting message"
            );
            self.confirm(leased).await;
            return Disposition::Duplicate;
        }

        let read_stage = job.stage;
        match &failure {
            None => job.mark_succeeded(self.stage.completes()),
            Some(detail) => job.mark_failed(detail, self.stage.is_final()),
        }
        if let Err(e) = self.jobs.replace(&job, read_stage).await {
            tracing::error!(stage, job_id = %job.job_id, error = %e, "Failed to update job status");
            return Disposition::StatusError;
        }

        if failure.is_some() {
            return Disposition::Failed;
        }

        if let Err(e) = self.stage.finish(&message).await {
            tracing::warn!(
                stage,
                job_id = %job.job_id,
                blob = message.blob_name(),
                error = %e,
                "Failed to remove consumed blob"
            );
        }
        tracing::info!(stage, job_id = %job.job_id, "Message successfully processed, deleting");
        self.confirm(leased).await;
        Disposition::Completed
    }

    /// Delete the message. A lost lease is logged; the message will then be
    /// redelivered and resolved as a duplicate or retried.
    async fn confirm(&self, leased: &LeasedMessage) {
        if let Err(e) = self.queue.delete(&leased.lease).await {
            tracing::warn!(
                stage = self.stage.name(),
                message_id = %leased.lease.message_id,
                error = %e,
                "Failed to delete message"
            );
        }
    }

    async fn report_queue_depth(&self) {
        match self.queue.approximate_len().await {
            Ok(depth) => {
                tracing::info!(stage = self.stage.name(), depth, "Queue has approximately {depth} message(s)");
                metrics::gauge!("pipeline_queue_depth", "queue" => self.stage.name()).set(depth as f64);
            }
            Err(e) => tracing::debug!(stage = self.stage.name(), error = %e, "Queue depth unavailable"),
        }
    }
}
