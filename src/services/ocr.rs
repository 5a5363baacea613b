use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

/// External text recognition engine.
///
/// Reads the image at `image_path` and writes the recognized text to
/// `output_path`. Callers bound the wall-clock time by dropping the future.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image_path: &Path, output_path: &Path) -> Result<(), OcrError>;
}

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("Failed to start OCR process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("OCR process exited with {status}: {stderr}")]
    ExitStatus { status: String, stderr: String },

    #[error("OCR process produced no output file")]
    MissingOutput,

    #[error("OCR timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("OCR staging failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs an external command as `<program> [args..] <image> <output>`.
pub struct CommandOcrEngine {
    program: String,
    args: Vec<String>,
}

impl CommandOcrEngine {
    pub fn new(program: &str, args: &[String]) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
        }
    }
}

#[async_trait]
impl OcrEngine for CommandOcrEngine {
    async fn recognize(&self, image_path: &Path, output_path: &Path) -> Result<(), OcrError> {
        tracing::debug!(
            program = %self.program,
            image = %image_path.display(),
            output = %output_path.display(),
            "Running OCR command"
        );

        // kill_on_drop: a timed-out recognition must not leave the child behind.
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image_path)
            .arg(output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(OcrError::Spawn)?;

        if !output.status.success() {
            return Err(OcrError::ExitStatus {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if !tokio::fs::try_exists(output_path).await? {
            return Err(OcrError::MissingOutput);
        }

        Ok(())
    }
}
