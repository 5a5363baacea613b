use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

/// Named object storage for input images and recognized text.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, name: &str, data: &[u8], content_type: &str)
        -> Result<(), StorageError>;

    /// Fetch a blob. Missing blobs are [`StorageError::NotFound`].
    async fn download(&self, name: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, name: &str) -> Result<(), StorageError>;

    async fn exists(&self, name: &str) -> Result<bool, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Blob {0} not found")]
    NotFound(String),

    #[error("S3 returned status {status} for {name}")]
    Status { name: String, status: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}

/// Client for Cloudflare R2 object storage (S3-compatible). One client per
/// bucket.
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

fn map_s3(name: &str, error: s3::error::S3Error) -> StorageError {
    match error {
        s3::error::S3Error::HttpFailWithBody(404, _) => StorageError::NotFound(name.to_string()),
        e => StorageError::S3(e),
    }
}

fn check_status(name: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(name.to_string())),
        status => Err(StorageError::Status {
            name: name.to_string(),
            status,
        }),
    }
}

#[async_trait]
impl BlobStore for R2Client {
    async fn upload(&self, name: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(name, data, content_type)
            .await
            .map_err(|e| map_s3(name, e))?;
        check_status(name, response.status_code())
    }

    async fn download(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(name).await.map_err(|e| map_s3(name, e))?;
        check_status(name, response.status_code())?;
        Ok(response.bytes().to_vec())
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(name).await.map_err(|e| map_s3(name, e))?;
        check_status(name, response.status_code())
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        let checked = match self.bucket.head_object(name).await {
            Ok((_, status)) => check_status(name, status),
            Err(e) => Err(map_s3(name, e)),
        };
        match checked {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// In-process blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, name: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        self.lock().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.lock().contains_key(name))
    }
}
