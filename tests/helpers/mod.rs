//! Shared fixtures for pipeline tests: in-memory collaborators plus scripted
//! OCR and email fakes.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cloud_ocr::app_state::AppState;
use cloud_ocr::config::WorkerSettings;
use cloud_ocr::models::job::{JobId, JobStage, OcrJob};
use cloud_ocr::services::email::{EmailError, EmailSender, OutgoingEmail};
use cloud_ocr::services::job_store::{JobStore, JobStoreError, MemoryJobStore};
use cloud_ocr::services::ocr::{OcrEngine, OcrError};
use cloud_ocr::services::queue::MemoryQueue;
use cloud_ocr::services::storage::{BlobStore, MemoryBlobStore};
use cloud_ocr::workers::delivery::DeliveryWorker;
use cloud_ocr::workers::recognition::RecognitionWorker;

pub const RECIPIENT: &str = "alice@example.com";
pub const OCR_TIMEOUT: Duration = Duration::from_millis(50);

/// Job store that counts calls and can be told to fail writes.
#[derive(Default)]
pub struct CountingJobStore {
    inner: MemoryJobStore,
    pub gets: AtomicU32,
    pub replaces: AtomicU32,
    pub fail_writes: AtomicBool,
}

impl CountingJobStore {
    pub fn gets(&self) -> u32 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn replaces(&self) -> u32 {
        self.replaces.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for CountingJobStore {
    async fn create(&self, job: &OcrJob) -> Result<(), JobStoreError> {
        self.inner.create(job).await
    }

    async fn get(
        &self,
        recipient_address: &str,
        job_id: &JobId,
    ) -> Result<Option<OcrJob>, JobStoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(recipient_address, job_id).await
    }

    async fn replace(&self, job: &OcrJob, expected_stage: JobStage) -> Result<(), JobStoreError> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(JobStoreError::Unavailable("injected failure".to_string()));
        }
        self.inner.replace(job, expected_stage).await
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum OcrBehavior {
    /// Write `RECOGNIZED:` followed by the image bytes.
    Echo,
    /// Exit with an error.
    Fail,
    /// Never finish.
    Hang,
}

pub struct ScriptedOcr {
    behavior: Mutex<OcrBehavior>,
    pub calls: AtomicU32,
}

impl ScriptedOcr {
    pub fn new(behavior: OcrBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicU32::new(0),
        }
    }

    pub fn set(&self, behavior: OcrBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcr {
    async fn recognize(&self, image_path: &Path, output_path: &Path) -> Result<(), OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            OcrBehavior::Echo => {
                let mut text = b"RECOGNIZED:".to_vec();
                text.extend(tokio::fs::read(image_path).await?);
                tokio::fs::write(output_path, text).await?;
                Ok(())
            }
            OcrBehavior::Fail => Err(OcrError::ExitStatus {
                status: "exit status: 1".to_string(),
                stderr: "unreadable image".to_string(),
            }),
            OcrBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

/// Email sender that fails a set number of times, then records what it sends.
#[derive(Default)]
pub struct ScriptedEmail {
    failures_left: AtomicU32,
    pub sent: Mutex<Vec<OutgoingEmail>>,
}

impl ScriptedEmail {
    pub fn failing(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailSender for ScriptedEmail {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError> {
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(EmailError::Rejected {
                status: 503,
                body: "mail provider unavailable".to_string(),
            });
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

/// A complete in-memory pipeline with typed handles on every collaborator.
pub struct Pipeline {
    pub state: AppState,
    pub jobs: Arc<CountingJobStore>,
    pub images: Arc<MemoryBlobStore>,
    pub texts: Arc<MemoryBlobStore>,
    pub recognition_queue: Arc<MemoryQueue>,
    pub delivery_queue: Arc<MemoryQueue>,
    pub ocr: Arc<ScriptedOcr>,
    pub email: Arc<ScriptedEmail>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with(OcrBehavior::Echo, ScriptedEmail::default())
    }

    pub fn with(ocr: OcrBehavior, email: ScriptedEmail) -> Self {
        let jobs = Arc::new(CountingJobStore::default());
        let images = Arc::new(MemoryBlobStore::new());
        let texts = Arc::new(MemoryBlobStore::new());
        let recognition_queue = Arc::new(MemoryQueue::new());
        let delivery_queue = Arc::new(MemoryQueue::new());

        let state = AppState::new(
            jobs.clone(),
            images.clone(),
            texts.clone(),
            recognition_queue.clone(),
            delivery_queue.clone(),
        );

        Self {
            state,
            jobs,
            images,
            texts,
            recognition_queue,
            delivery_queue,
            ocr: Arc::new(ScriptedOcr::new(ocr)),
            email: Arc::new(email),
        }
    }

    pub fn recognition_worker(&self) -> RecognitionWorker {
        RecognitionWorker::recognition(&self.state, self.ocr.clone(), settings(), OCR_TIMEOUT)
    }

    pub fn delivery_worker(&self) -> DeliveryWorker {
        DeliveryWorker::delivery(&self.state, self.email.clone(), settings())
    }

    /// Write the job record and image the way the front end does.
    pub async fn seed_job(&self, job_id: &str, image_blob: &str) -> OcrJob {
        let job = OcrJob::new(JobId::from(job_id), RECIPIENT, "scan.png");
        self.jobs.create(&job).await.unwrap();
        self.images
            .upload(image_blob, b"image-bytes", "image/png")
            .await
            .unwrap();
        job
    }

    /// Seed a job that has already been recognized, with its text blob.
    pub async fn seed_recognized_job(&self, job_id: &str, text_blob: &str) -> OcrJob {
        let mut job = OcrJob::new(JobId::from(job_id), RECIPIENT, "scan.png");
        job.mark_succeeded(JobStage::Recognized);
        self.jobs.create(&job).await.unwrap();
        self.texts
            .upload(text_blob, b"hello from the scanner", "text/plain")
            .await
            .unwrap();
        job
    }

    /// Current job record, read without touching the call counters.
    pub async fn job(&self, job_id: &str) -> OcrJob {
        self.jobs
            .inner
            .get(RECIPIENT, &JobId::from(job_id))
            .await
            .unwrap()
            .expect("job record missing")
    }
}

pub fn settings() -> WorkerSettings {
    WorkerSettings {
        lease_timeout: Duration::from_secs(60),
        poll_interval: Duration::from_millis(10),
        poison_threshold: 10,
    }
}
