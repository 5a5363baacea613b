use std::sync::Arc;

use async_trait::async_trait;

use crate::app_state::AppState;
use crate::config::WorkerSettings;
use crate::models::job::JobStage;
use crate::models::message::{DeliveryMessage, PipelineMessage};
use crate::services::email::{EmailSender, OutgoingEmail};
use crate::services::storage::BlobStore;

use super::{ProcessError, Stage, Worker};

/// Emails recognized text to the recipient and removes the text blob.
pub struct DeliveryStage {
    texts: Arc<dyn BlobStore>,
    email: Arc<dyn EmailSender>,
}

impl DeliveryStage {
    pub fn new(texts: Arc<dyn BlobStore>, email: Arc<dyn EmailSender>) -> Self {
        Self { texts, email }
    }
}

#[async_trait]
impl Stage for DeliveryStage {
    type Message = DeliveryMessage;

    fn name(&self) -> &'static str {
        "delivery"
    }

    fn requires(&self) -> JobStage {
        JobStage::Recognized
    }

    fn completes(&self) -> JobStage {
        JobStage::Delivered
    }

    fn is_final(&self) -> bool {
        true
    }

    async fn process(&self, message: &DeliveryMessage) -> Result<(), ProcessError> {
        let text_blob_name = message.text_blob_name();
        let text = self.texts.download(text_blob_name).await?;

        let email = OutgoingEmail::recognition_result(message.recipient_address(), text);
        self.email.send(&email).await?;
        tracing::info!(
            job_id = %message.job_id(),
            recipient = message.recipient_address(),
            "Recognized text emailed"
        );
        Ok(())
    }

    async fn finish(&self, message: &DeliveryMessage) -> Result<(), ProcessError> {
        self.texts.delete(message.text_blob_name()).await?;
        Ok(())
    }
}

pub type DeliveryWorker = Worker<DeliveryStage>;

impl Worker<DeliveryStage> {
    /// Worker consuming the delivery queue of `state`.
    pub fn delivery(state: &AppState, email: Arc<dyn EmailSender>, settings: WorkerSettings) -> Self {
        let stage = DeliveryStage::new(state.texts.clone(), email);
        Worker::new(stage, state.delivery_queue.clone(), state.jobs.clone(), settings)
    }
}
