use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::app_state::AppState;
use crate::config::WorkerSettings;
use crate::models::job::JobStage;
use crate::models::message::{text_blob_name_for, DeliveryMessage, PipelineMessage, RecognitionMessage};
use crate::services::ocr::{OcrEngine, OcrError};
use crate::services::queue::MessageQueue;
use crate::services::storage::BlobStore;

use super::{ProcessError, Stage, Worker};

/// Turns an uploaded image into a text blob and hands it to delivery.
pub struct RecognitionStage {
    images: Arc<dyn BlobStore>,
    texts: Arc<dyn BlobStore>,
    delivery_queue: Arc<dyn MessageQueue>,
    ocr: Arc<dyn OcrEngine>,
    ocr_timeout: Duration,
}

impl RecognitionStage {
    pub fn new(
        images: Arc<dyn BlobStore>,
        texts: Arc<dyn BlobStore>,
        delivery_queue: Arc<dyn MessageQueue>,
        ocr: Arc<dyn OcrEngine>,
        ocr_timeout: Duration,
    ) -> Self {
        Self {
            images,
            texts,
            delivery_queue,
            ocr,
            ocr_timeout,
        }
    }

    async fn recognize(&self, image: &[u8], image_blob_name: &str) -> Result<Vec<u8>, ProcessError> {
        let staging = tempfile::Builder::new().prefix("cloud-ocr-").tempdir()?;
        let input = staging.path().join(staging_input_name(image_blob_name));
        let output = staging.path().join("recognized.txt");
        tokio::fs::write(&input, image).await?;

        let started = Instant::now();
        match tokio::time::timeout(self.ocr_timeout, self.ocr.recognize(&input, &output)).await {
            Ok(result) => result?,
            Err(_) => return Err(OcrError::Timeout(self.ocr_timeout).into()),
        }
        let elapsed = started.elapsed();
        metrics::histogram!("ocr_duration_seconds").record(elapsed.as_secs_f64());

        let text = tokio::fs::read(&output).await?;
        tracing::info!(
            image_blob = image_blob_name,
            ocr_duration_ms = elapsed.as_millis() as u64,
            text_bytes = text.len(),
            "OCR complete"
        );

        // Dropping `staging` removes the local copies.
        Ok(text)
    }
}

/// Local file name for a staged image, keeping only a safe extension.
fn staging_input_name(image_blob_name: &str) -> String {
    match Path::new(image_blob_name).extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.chars().all(|c| c.is_ascii_alphanumeric()) => format!("input.{ext}"),
        _ => "input".to_string(),
    }
}

#[async_trait]
impl Stage for RecognitionStage {
    type Message = RecognitionMessage;

    fn name(&self) -> &'static str {
        "recognition"
    }

    fn requires(&self) -> JobStage {
        JobStage::Submitted
    }

    fn completes(&self) -> JobStage {
        JobStage::Recognized
    }

    fn is_final(&self) -> bool {
        false
    }

    async fn process(&self, message: &RecognitionMessage) -> Result<(), ProcessError> {
        let image_blob_name = message.image_blob_name();
        tracing::debug!(job_id = %message.job_id(), image_blob = image_blob_name, "Downloading image");
        let image = self.images.download(image_blob_name).await?;

        let text = self.recognize(&image, image_blob_name).await?;

        let text_blob_name = text_blob_name_for(image_blob_name);
        self.texts
            .upload(&text_blob_name, &text, "text/plain; charset=utf-8")
            .await?;

        let delivery = DeliveryMessage::new(
            message.job_id().clone(),
            &text_blob_name,
            message.recipient_address(),
        )?;
        self.delivery_queue.enqueue(&delivery.encode()).await?;
        tracing::info!(job_id = %message.job_id(), text_blob = %text_blob_name, "Delivery task queued");
        Ok(())
    }

    async fn finish(&self, message: &RecognitionMessage) -> Result<(), ProcessError> {
        self.images.delete(message.image_blob_name()).await?;
        Ok(())
    }
}

pub type RecognitionWorker = Worker<RecognitionStage>;

impl Worker<RecognitionStage> {
    /// Worker consuming the recognition queue of `state`.
    pub fn recognition(
        state: &AppState,
        ocr: Arc<dyn OcrEngine>,
        settings: WorkerSettings,
        ocr_timeout: Duration,
    ) -> Self {
        let stage = RecognitionStage::new(
            state.images.clone(),
            state.texts.clone(),
            state.delivery_queue.clone(),
            ocr,
            ocr_timeout,
        );
        Worker::new(stage, state.recognition_queue.clone(), state.jobs.clone(), settings)
    }
}
