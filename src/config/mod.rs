use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string for the job status store
    pub database_url: String,

    /// Redis connection string for the work queues
    pub redis_url: String,

    /// Queue feeding the recognition worker
    #[serde(default = "default_recognition_queue")]
    pub recognition_queue: String,

    /// Queue feeding the delivery worker
    #[serde(default = "default_delivery_queue")]
    pub delivery_queue: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// Bucket holding uploaded images
    pub r2_image_bucket: String,

    /// Bucket holding recognized text
    pub r2_text_bucket: String,

    /// Leases beyond this count mark a message as poison
    #[serde(default = "default_poison_threshold")]
    pub poison_threshold: u32,

    #[serde(default = "default_recognition_lease_secs")]
    pub recognition_lease_secs: u64,

    #[serde(default = "default_delivery_lease_secs")]
    pub delivery_lease_secs: u64,

    /// Idle wait between polls of an empty queue
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Wall-clock budget for one OCR run
    #[serde(default = "default_ocr_timeout_secs")]
    pub ocr_timeout_secs: u64,

    /// OCR executable, invoked as `<command> [args..] <image> <output>`
    #[serde(default = "default_ocr_command")]
    pub ocr_command: String,

    /// Extra OCR arguments (comma-separated in the environment)
    #[serde(default)]
    pub ocr_args: Vec<String>,

    #[serde(default = "default_email_api_url")]
    pub email_api_url: String,

    /// Mail API key. Required by the delivery worker only.
    #[serde(default)]
    pub email_api_key: Option<String>,

    #[serde(default = "default_email_from_address")]
    pub email_from_address: String,

    #[serde(default = "default_email_from_name")]
    pub email_from_name: String,

    /// Prometheus listener for worker processes (e.g., "0.0.0.0:9100")
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_recognition_queue() -> String {
    "cloud_ocr:recognition".to_string()
}

fn default_delivery_queue() -> String {
    "cloud_ocr:delivery".to_string()
}

fn default_poison_threshold() -> u32 {
    10
}

fn default_recognition_lease_secs() -> u64 {
    180
}

fn default_delivery_lease_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_ocr_timeout_secs() -> u64 {
    120
}

fn default_ocr_command() -> String {
    "tesseract-processor".to_string()
}

fn default_email_api_url() -> String {
    "https://api.sendgrid.com/v3/mail/send".to_string()
}

fn default_email_from_address() -> String {
    "cloud-ocr@example.com".to_string()
}

fn default_email_from_name() -> String {
    "Cloud OCR".to_string()
}

/// Polling and lease parameters for one worker role.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub lease_timeout: Duration,
    pub poll_interval: Duration,
    pub poison_threshold: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn recognition_settings(&self) -> WorkerSettings {
        WorkerSettings {
            lease_timeout: Duration::from_secs(self.recognition_lease_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            poison_threshold: self.poison_threshold,
        }
    }

    pub fn delivery_settings(&self) -> WorkerSettings {
        WorkerSettings {
            lease_timeout: Duration::from_secs(self.delivery_lease_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            poison_threshold: self.poison_threshold,
        }
    }

    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }
}
