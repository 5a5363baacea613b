use std::sync::Arc;

use crate::config::AppConfig;
use crate::db;
use crate::services::{
    job_store::{JobStore, PgJobStore},
    queue::{MessageQueue, QueueError, RedisQueue},
    storage::{BlobStore, R2Client, StorageError},
};

/// Handles shared by the HTTP front end and both workers. Built once at
/// startup and passed down explicitly.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub images: Arc<dyn BlobStore>,
    pub texts: Arc<dyn BlobStore>,
    pub recognition_queue: Arc<dyn MessageQueue>,
    pub delivery_queue: Arc<dyn MessageQueue>,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("Database initialization failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage initialization failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue initialization failed: {0}")]
    Queue(#[from] QueueError),
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        images: Arc<dyn BlobStore>,
        texts: Arc<dyn BlobStore>,
        recognition_queue: Arc<dyn MessageQueue>,
        delivery_queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            jobs,
            images,
            texts,
            recognition_queue,
            delivery_queue,
        }
    }

    /// Connect to PostgreSQL, R2 and Redis as described by `config`.
    /// Applies pending migrations.
    pub async fn connect(config: &AppConfig) -> Result<Self, InitError> {
        tracing::info!("Connecting to PostgreSQL job store");
        let pool = db::init_pool(&config.database_url).await?;
        db::run_migrations(&pool).await?;

        tracing::info!("Initializing R2 storage clients");
        let images = R2Client::new(
            &config.r2_image_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
        )?;
        let texts = R2Client::new(
            &config.r2_text_bucket,
            &config.r2_endpoint,
            &config.r2_access_key,
            &config.r2_secret_key,
        )?;

        tracing::info!(
            recognition_queue = %config.recognition_queue,
            delivery_queue = %config.delivery_queue,
            "Connecting to Redis work queues"
        );
        let recognition_queue = RedisQueue::new(&config.redis_url, &config.recognition_queue)?;
        let delivery_queue = RedisQueue::new(&config.redis_url, &config.delivery_queue)?;

        Ok(Self::new(
            Arc::new(PgJobStore::new(pool)),
            Arc::new(images),
            Arc::new(texts),
            Arc::new(recognition_queue),
            Arc::new(delivery_queue),
        ))
    }
}
