//! Pipeline behavior against in-memory queues and stores.

mod helpers;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cloud_ocr::models::job::JobStage;
use cloud_ocr::services::email::RESULT_ATTACHMENT_NAME;
use cloud_ocr::services::queue::{Lease, LeasedMessage, MemoryQueue, MessageQueue, QueueError};
use cloud_ocr::services::storage::{BlobStore, MemoryBlobStore, StorageError};
use cloud_ocr::workers::delivery::DeliveryWorker;
use cloud_ocr::workers::recognition::{RecognitionStage, RecognitionWorker};
use cloud_ocr::workers::{Disposition, Worker};
use helpers::*;
use tokio_util::sync::CancellationToken;

/// Runs one delivery poll from inside a recognition step.
struct Interleave {
    worker: DeliveryWorker,
    seen: Mutex<Vec<Option<Disposition>>>,
}

impl Interleave {
    fn new(pipeline: &Pipeline) -> Arc<Self> {
        Arc::new(Self {
            worker: pipeline.delivery_worker(),
            seen: Mutex::new(Vec::new()),
        })
    }

    async fn run(&self) {
        let disposition = self.worker.poll_once().await.unwrap();
        self.seen.lock().unwrap().push(disposition);
    }

    fn seen(&self) -> Vec<Option<Disposition>> {
        self.seen.lock().unwrap().clone()
    }
}

/// Delivery queue that runs the delivery worker right after each publish.
struct PublishThenDeliver {
    inner: Arc<MemoryQueue>,
    interleave: Arc<Interleave>,
}

#[async_trait]
impl MessageQueue for PublishThenDeliver {
    async fn enqueue(&self, body: &str) -> Result<(), QueueError> {
        self.inner.enqueue(body).await?;
        self.interleave.run().await;
        Ok(())
    }

    async fn lease(&self, timeout: Duration) -> Result<Option<LeasedMessage>, QueueError> {
        self.inner.lease(timeout).await
    }

    async fn delete(&self, lease: &Lease) -> Result<(), QueueError> {
        self.inner.delete(lease).await
    }

    async fn extend(&self, lease: &Lease, timeout: Duration) -> Result<(), QueueError> {
        self.inner.extend(lease, timeout).await
    }

    async fn release(&self, lease: &Lease) -> Result<(), QueueError> {
        self.inner.release(lease).await
    }

    async fn approximate_len(&self) -> Result<u64, QueueError> {
        self.inner.approximate_len().await
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.inner.ping().await
    }
}

/// Image store that runs the delivery worker before removing an image.
struct DeliverThenDelete {
    inner: Arc<MemoryBlobStore>,
    interleave: Arc<Interleave>,
}

#[async_trait]
impl BlobStore for DeliverThenDelete {
    async fn upload(&self, name: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.inner.upload(name, data, content_type).await
    }

    async fn download(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.download(name).await
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.interleave.run().await;
        self.inner.delete(name).await
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.exists(name).await
    }
}

fn recognition_worker_with(
    pipeline: &Pipeline,
    images: Arc<dyn BlobStore>,
    delivery_queue: Arc<dyn MessageQueue>,
) -> RecognitionWorker {
    let stage = RecognitionStage::new(
        images,
        pipeline.texts.clone(),
        delivery_queue,
        pipeline.ocr.clone(),
        OCR_TIMEOUT,
    );
    Worker::new(
        stage,
        pipeline.recognition_queue.clone(),
        pipeline.jobs.clone(),
        settings(),
    )
}

#[tokio::test]
async fn test_recognition_success_hands_off_to_delivery() {
    let pipeline = Pipeline::new();
    pipeline.seed_job("J1", "img1").await;
    pipeline
        .recognition_queue
        .enqueue("J1|img1|alice@example.com")
        .await
        .unwrap();

    let worker = pipeline.recognition_worker();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Completed));

    assert!(!pipeline.images.exists("img1").await.unwrap());
    assert_eq!(
        pipeline.texts.download("img1.txt").await.unwrap(),
        b"RECOGNIZED:image-bytes"
    );
    assert_eq!(
        pipeline.delivery_queue.bodies(),
        vec!["J1|img1.txt|alice@example.com".to_string()]
    );
    assert!(pipeline.recognition_queue.bodies().is_empty());

    let job = pipeline.job("J1").await;
    assert!(job.is_completed);
    assert!(job.error_detail.is_none());
    assert_eq!(job.stage, JobStage::Recognized);
}

#[tokio::test]
async fn test_full_pipeline_delivers_email() {
    let pipeline = Pipeline::new();
    pipeline.seed_job("J1", "img1").await;
    pipeline
        .recognition_queue
        .enqueue("J1|img1|alice@example.com")
        .await
        .unwrap();

    let recognition = pipeline.recognition_worker();
    let delivery = pipeline.delivery_worker();

    assert_eq!(recognition.poll_once().await.unwrap(), Some(Disposition::Completed));
    assert_eq!(delivery.poll_once().await.unwrap(), Some(Disposition::Completed));

    let sent = pipeline.email.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, RECIPIENT);
    let attachment = sent[0].attachment.as_ref().unwrap();
    assert_eq!(attachment.file_name, RESULT_ATTACHMENT_NAME);
    assert_eq!(attachment.content, b"RECOGNIZED:image-bytes");

    assert!(!pipeline.texts.exists("img1.txt").await.unwrap());
    assert!(pipeline.delivery_queue.bodies().is_empty());

    let job = pipeline.job("J1").await;
    assert!(job.is_completed);
    assert!(job.error_detail.is_none());
    assert_eq!(job.stage, JobStage::Delivered);
}

#[tokio::test]
async fn test_empty_queue_returns_none() {
    let pipeline = Pipeline::new();
    assert_eq!(pipeline.recognition_worker().poll_once().await.unwrap(), None);
    assert_eq!(pipeline.delivery_worker().poll_once().await.unwrap(), None);
}

#[tokio::test]
async fn test_poison_message_deleted_without_side_effects() {
    let pipeline = Pipeline::new();
    pipeline.seed_job("J1", "img1").await;
    let queue = &pipeline.recognition_queue;
    queue.enqueue("J1|img1|alice@example.com").await.unwrap();

    // Ten leases that never confirm.
    for _ in 0..10 {
        queue.lease(Duration::from_secs(60)).await.unwrap().unwrap();
        queue.expire_leases();
    }

    let worker = pipeline.recognition_worker();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Poison));

    assert!(queue.bodies().is_empty());
    assert_eq!(pipeline.jobs.gets(), 0);
    assert_eq!(pipeline.jobs.replaces(), 0);
    assert_eq!(pipeline.ocr.calls(), 0);
    assert!(pipeline.images.exists("img1").await.unwrap());
    assert!(pipeline.delivery_queue.bodies().is_empty());
}

#[tokio::test]
async fn test_ocr_timeouts_escalate_to_poison() {
    let pipeline = Pipeline::with(OcrBehavior::Hang, ScriptedEmail::default());
    pipeline.seed_job("J1", "img1").await;
    pipeline
        .recognition_queue
        .enqueue("J1|img1|alice@example.com")
        .await
        .unwrap();

    let worker = pipeline.recognition_worker();
    for attempt in 1..=10 {
        assert_eq!(
            worker.poll_once().await.unwrap(),
            Some(Disposition::Failed),
            "attempt {attempt}"
        );
        pipeline.recognition_queue.expire_leases();
    }
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Poison));

    assert_eq!(pipeline.ocr.calls(), 10);
    assert!(pipeline.recognition_queue.bodies().is_empty());
    assert!(pipeline.delivery_queue.bodies().is_empty());

    let job = pipeline.job("J1").await;
    assert!(!job.is_completed);
    assert_eq!(job.stage, JobStage::Submitted);
    assert!(job.error_detail.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_recognition_failure_records_error_and_keeps_message() {
    let pipeline = Pipeline::with(OcrBehavior::Fail, ScriptedEmail::default());
    pipeline.seed_job("J1", "img1").await;
    pipeline
        .recognition_queue
        .enqueue("J1|img1|alice@example.com")
        .await
        .unwrap();

    let worker = pipeline.recognition_worker();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Failed));

    assert_eq!(pipeline.recognition_queue.bodies().len(), 1);
    assert!(pipeline.images.exists("img1").await.unwrap());
    let job = pipeline.job("J1").await;
    assert!(job.error_detail.unwrap().contains("unreadable image"));

    // Still leased: nothing to pick up until the lease lapses.
    assert_eq!(worker.poll_once().await.unwrap(), None);

    pipeline.ocr.set(OcrBehavior::Echo);
    pipeline.recognition_queue.expire_leases();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Completed));

    let job = pipeline.job("J1").await;
    assert!(job.is_completed);
    assert!(job.error_detail.is_none());
}

#[tokio::test]
async fn test_malformed_messages_deleted_without_status_lookup() {
    let pipeline = Pipeline::new();
    let worker = pipeline.recognition_worker();

    for body in ["", "J1|img1", "J1||alice@example.com", "J1|img1|alice@example.com|extra"] {
        pipeline.recognition_queue.enqueue(body).await.unwrap();
        assert_eq!(
            worker.poll_once().await.unwrap(),
            Some(Disposition::Malformed),
            "body {body:?}"
        );
    }

    assert!(pipeline.recognition_queue.bodies().is_empty());
    assert_eq!(pipeline.jobs.gets(), 0);
    assert_eq!(pipeline.jobs.replaces(), 0);
}

#[tokio::test]
async fn test_delivery_retry_overwrites_stale_error() {
    let pipeline = Pipeline::with(OcrBehavior::Echo, ScriptedEmail::failing(1));
    pipeline.seed_recognized_job("J1", "img1.txt").await;
    pipeline
        .delivery_queue
        .enqueue("J1|img1.txt|alice@example.com")
        .await
        .unwrap();

    let worker = pipeline.delivery_worker();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Failed));

    let job = pipeline.job("J1").await;
    assert!(job.is_completed);
    assert!(job.error_detail.as_deref().unwrap().contains("503"));
    assert_eq!(pipeline.delivery_queue.bodies().len(), 1);
    assert!(pipeline.texts.exists("img1.txt").await.unwrap());

    pipeline.delivery_queue.expire_leases();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Completed));

    let job = pipeline.job("J1").await;
    assert!(job.is_completed);
    assert!(job.error_detail.is_none());
    assert_eq!(job.stage, JobStage::Delivered);
    assert_eq!(pipeline.email.sent().len(), 1);
    assert!(!pipeline.texts.exists("img1.txt").await.unwrap());
}

#[tokio::test]
async fn test_status_store_failure_leaves_message_queued() {
    let pipeline = Pipeline::new();
    let seeded = pipeline.seed_job("J1", "img1").await;
    pipeline
        .recognition_queue
        .enqueue("J1|img1|alice@example.com")
        .await
        .unwrap();
    pipeline.jobs.fail_writes.store(true, Ordering::SeqCst);

    let worker = pipeline.recognition_worker();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::StatusError));

    assert_eq!(pipeline.recognition_queue.bodies().len(), 1);
    assert_eq!(pipeline.job("J1").await, seeded);
    assert!(pipeline.images.exists("img1").await.unwrap());

    // The image is still there, so the retry can run the stage again.
    pipeline.jobs.fail_writes.store(false, Ordering::SeqCst);
    pipeline.recognition_queue.expire_leases();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Completed));
    assert!(!pipeline.images.exists("img1").await.unwrap());
    assert_eq!(pipeline.job("J1").await.stage, JobStage::Recognized);

    // One delivery message per attempt; the second is a duplicate.
    let delivery = pipeline.delivery_worker();
    assert_eq!(delivery.poll_once().await.unwrap(), Some(Disposition::Completed));
    assert_eq!(delivery.poll_once().await.unwrap(), Some(Disposition::Duplicate));
    assert_eq!(pipeline.email.sent().len(), 1);
}

#[tokio::test]
async fn test_missing_job_record_leaves_message_untouched() {
    let pipeline = Pipeline::new();
    pipeline
        .images
        .upload("img1", b"image-bytes", "image/png")
        .await
        .unwrap();
    pipeline
        .recognition_queue
        .enqueue("J404|img1|alice@example.com")
        .await
        .unwrap();

    let worker = pipeline.recognition_worker();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::StatusError));

    assert_eq!(pipeline.ocr.calls(), 0);
    assert!(pipeline.images.exists("img1").await.unwrap());
    assert_eq!(pipeline.recognition_queue.bodies().len(), 1);
}

#[tokio::test]
async fn test_redelivery_after_lost_lease_is_detected_as_duplicate() {
    let pipeline = Pipeline::new();
    pipeline.seed_job("J1", "img1").await;
    pipeline
        .recognition_queue
        .enqueue("J1|img1|alice@example.com")
        .await
        .unwrap();

    // The lease lapses while the worker is busy, so its final delete fails.
    let leased = pipeline
        .recognition_queue
        .lease(Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    pipeline.recognition_queue.expire_leases();

    let worker = pipeline.recognition_worker();
    assert_eq!(worker.handle(&leased).await, Disposition::Completed);
    assert_eq!(pipeline.recognition_queue.bodies().len(), 1);
    let after_first = pipeline.job("J1").await;

    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Duplicate));

    assert!(pipeline.recognition_queue.bodies().is_empty());
    assert_eq!(pipeline.job("J1").await, after_first);
    assert_eq!(pipeline.delivery_queue.bodies().len(), 1);
    assert_eq!(pipeline.ocr.calls(), 1);
    assert_eq!(pipeline.jobs.replaces(), 1);
}

#[tokio::test]
async fn test_duplicate_delivery_message_sends_one_email() {
    let pipeline = Pipeline::new();
    pipeline.seed_recognized_job("J1", "img1.txt").await;
    for _ in 0..2 {
        pipeline
            .delivery_queue
            .enqueue("J1|img1.txt|alice@example.com")
            .await
            .unwrap();
    }

    let worker = pipeline.delivery_worker();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Completed));
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Duplicate));

    assert_eq!(pipeline.email.sent().len(), 1);
    assert!(pipeline.delivery_queue.bodies().is_empty());
}

#[tokio::test]
async fn test_worker_loop_drains_queue_and_stops_on_cancel() {
    let pipeline = Pipeline::new();
    for (job, image) in [("J1", "img1"), ("J2", "img2")] {
        pipeline.seed_job(job, image).await;
        pipeline
            .recognition_queue
            .enqueue(&format!("{job}|{image}|alice@example.com"))
            .await
            .unwrap();
    }

    let worker = pipeline.recognition_worker();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    for _ in 0..200 {
        if pipeline.delivery_queue.bodies().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop after cancel")
        .unwrap();

    assert_eq!(pipeline.delivery_queue.bodies().len(), 2);
    assert!(pipeline.recognition_queue.bodies().is_empty());
    assert_eq!(pipeline.job("J2").await.stage, JobStage::Recognized);
}

#[tokio::test]
async fn test_delivery_waits_until_recognition_is_recorded() {
    let pipeline = Pipeline::new();
    pipeline.seed_job("J1", "img1").await;
    pipeline
        .recognition_queue
        .enqueue("J1|img1|alice@example.com")
        .await
        .unwrap();

    let interleave = Interleave::new(&pipeline);
    let delivery_queue = Arc::new(PublishThenDeliver {
        inner: pipeline.delivery_queue.clone(),
        interleave: interleave.clone(),
    });
    let worker = recognition_worker_with(&pipeline, pipeline.images.clone(), delivery_queue);

    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Completed));

    // Delivery saw the job before recognition recorded it and stood back.
    assert_eq!(interleave.seen(), vec![Some(Disposition::Waiting)]);
    assert!(pipeline.email.sent().is_empty());
    let job = pipeline.job("J1").await;
    assert_eq!(job.stage, JobStage::Recognized);
    assert!(job.error_detail.is_none());

    pipeline.delivery_queue.expire_leases();
    let delivery = pipeline.delivery_worker();
    assert_eq!(delivery.poll_once().await.unwrap(), Some(Disposition::Completed));

    let job = pipeline.job("J1").await;
    assert_eq!(job.stage, JobStage::Delivered);
    assert!(job.is_completed);
    assert_eq!(pipeline.email.sent().len(), 1);
}

#[tokio::test]
async fn test_delivery_before_image_cleanup_is_not_rolled_back() {
    let pipeline = Pipeline::new();
    pipeline.seed_job("J1", "img1").await;
    pipeline
        .recognition_queue
        .enqueue("J1|img1|alice@example.com")
        .await
        .unwrap();

    let interleave = Interleave::new(&pipeline);
    let images = Arc::new(DeliverThenDelete {
        inner: pipeline.images.clone(),
        interleave: interleave.clone(),
    });
    let worker = recognition_worker_with(&pipeline, images, pipeline.delivery_queue.clone());

    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Completed));
    assert_eq!(interleave.seen(), vec![Some(Disposition::Completed)]);

    let job = pipeline.job("J1").await;
    assert_eq!(job.stage, JobStage::Delivered);
    assert!(job.is_completed);
    assert!(job.error_detail.is_none());
    assert_eq!(pipeline.email.sent().len(), 1);
    assert!(!pipeline.images.exists("img1").await.unwrap());
}

#[tokio::test]
async fn test_delivery_failure_before_image_cleanup_is_kept() {
    let pipeline = Pipeline::with(OcrBehavior::Echo, ScriptedEmail::failing(1));
    pipeline.seed_job("J1", "img1").await;
    pipeline
        .recognition_queue
        .enqueue("J1|img1|alice@example.com")
        .await
        .unwrap();

    let interleave = Interleave::new(&pipeline);
    let images = Arc::new(DeliverThenDelete {
        inner: pipeline.images.clone(),
        interleave: interleave.clone(),
    });
    let worker = recognition_worker_with(&pipeline, images, pipeline.delivery_queue.clone());

    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Completed));
    assert_eq!(interleave.seen(), vec![Some(Disposition::Failed)]);

    let job = pipeline.job("J1").await;
    assert!(job.is_completed);
    assert!(job.error_detail.as_deref().unwrap().contains("503"));
    assert!(pipeline.email.sent().is_empty());

    pipeline.delivery_queue.expire_leases();
    let delivery = pipeline.delivery_worker();
    assert_eq!(delivery.poll_once().await.unwrap(), Some(Disposition::Completed));
    let job = pipeline.job("J1").await;
    assert_eq!(job.stage, JobStage::Delivered);
    assert!(job.error_detail.is_none());
}

#[tokio::test]
async fn test_delivery_status_failure_keeps_text_for_retry() {
    let pipeline = Pipeline::new();
    pipeline.seed_recognized_job("J1", "img1.txt").await;
    pipeline
        .delivery_queue
        .enqueue("J1|img1.txt|alice@example.com")
        .await
        .unwrap();
    pipeline.jobs.fail_writes.store(true, Ordering::SeqCst);

    let worker = pipeline.delivery_worker();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::StatusError));
    assert!(pipeline.texts.exists("img1.txt").await.unwrap());
    assert_eq!(pipeline.delivery_queue.bodies().len(), 1);

    pipeline.jobs.fail_writes.store(false, Ordering::SeqCst);
    pipeline.delivery_queue.expire_leases();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Completed));

    // At-least-once: the retry sends the email again.
    assert_eq!(pipeline.email.sent().len(), 2);
    assert!(!pipeline.texts.exists("img1.txt").await.unwrap());
    let job = pipeline.job("J1").await;
    assert_eq!(job.stage, JobStage::Delivered);
    assert!(job.error_detail.is_none());
}

#[tokio::test]
async fn test_delivery_poison_message_deleted_without_side_effects() {
    let pipeline = Pipeline::new();
    pipeline.seed_recognized_job("J1", "img1.txt").await;
    let queue = &pipeline.delivery_queue;
    queue.enqueue("J1|img1.txt|alice@example.com").await.unwrap();

    for _ in 0..10 {
        queue.lease(Duration::from_secs(60)).await.unwrap().unwrap();
        queue.expire_leases();
    }

    let worker = pipeline.delivery_worker();
    assert_eq!(worker.poll_once().await.unwrap(), Some(Disposition::Poison));

    assert!(queue.bodies().is_empty());
    assert_eq!(pipeline.jobs.gets(), 0);
    assert_eq!(pipeline.jobs.replaces(), 0);
    assert!(pipeline.email.sent().is_empty());
    assert!(pipeline.texts.exists("img1.txt").await.unwrap());
}

#[tokio::test]
async fn test_delivery_malformed_messages_deleted_without_status_lookup() {
    let pipeline = Pipeline::new();
    let worker = pipeline.delivery_worker();

    for body in ["", "J1|img1.txt", "J1|img1.txt|", "|img1.txt|alice@example.com|x"] {
        pipeline.delivery_queue.enqueue(body).await.unwrap();
        assert_eq!(
            worker.poll_once().await.unwrap(),
            Some(Disposition::Malformed),
            "body {body:?}"
        );
    }

    assert!(pipeline.delivery_queue.bodies().is_empty());
    assert_eq!(pipeline.jobs.gets(), 0);
    assert!(pipeline.email.sent().is_empty());
}
