//! Queue payloads exchanged between pipeline stages.
//!
//! Both message kinds travel as `job_id|blob_name|recipient_address`. The
//! separator is not escaped, so no field may contain `|`.

use crate::models::job::JobId;

const SEPARATOR: char = '|';
const FIELD_COUNT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageFormatError {
    #[error("expected 3 '|'-separated fields, found {0}")]
    FieldCount(usize),

    #[error("{0} cannot be empty")]
    EmptyField(&'static str),

    #[error("{0} cannot contain '|'")]
    Separator(&'static str),
}

/// Common shape of the messages carried by the pipeline queues.
pub trait PipelineMessage: Sized + Send + Sync {
    fn decode(body: &str) -> Result<Self, MessageFormatError>;

    fn encode(&self) -> String;

    fn job_id(&self) -> &JobId;

    fn recipient_address(&self) -> &str;

    /// Blob the stage consumes.
    fn blob_name(&self) -> &str;
}

fn check_field(name: &'static str, value: &str) -> Result<(), MessageFormatError> {
    if value.is_empty() {
        return Err(MessageFormatError::EmptyField(name));
    }
    if value.contains(SEPARATOR) {
        return Err(MessageFormatError::Separator(name));
    }
    Ok(())
}

fn split_fields<'a>(
    body: &'a str,
    names: [&'static str; FIELD_COUNT],
) -> Result<[&'a str; FIELD_COUNT], MessageFormatError> {
    let parts: Vec<&str> = body.split(SEPARATOR).collect();
    if parts.len() != FIELD_COUNT {
        return Err(MessageFormatError::FieldCount(parts.len()));
    }
    for (name, value) in names.into_iter().zip(parts.iter().copied()) {
        check_field(name, value)?;
    }
    Ok([parts[0], parts[1], parts[2]])
}

macro_rules! pipeline_message {
    ($(#[$doc:meta])* $name:ident, $blob:ident, $blob_label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            job_id: JobId,
            $blob: String,
            recipient_address: String,
        }

        impl $name {
            pub fn new(
                job_id: JobId,
                $blob: &str,
                recipient_address: &str,
            ) -> Result<Self, MessageFormatError> {
                check_field("job ID", job_id.as_str())?;
                check_field($blob_label, $blob)?;
                check_field("recipient address", recipient_address)?;
                Ok(Self {
                    job_id,
                    $blob: $blob.to_string(),
                    recipient_address: recipient_address.to_string(),
                })
            }

            pub fn $blob(&self) -> &str {
                &self.$blob
            }
        }

        impl PipelineMessage for $name {
            fn decode(body: &str) -> Result<Self, MessageFormatError> {
                let [job_id, blob, recipient] =
                    split_fields(body, ["job ID", $blob_label, "recipient address"])?;
                Ok(Self {
                    job_id: JobId::from(job_id),
                    $blob: blob.to_string(),
                    recipient_address: recipient.to_string(),
                })
            }

            fn encode(&self) -> String {
                format!(
                    "{}{SEPARATOR}{}{SEPARATOR}{}",
                    self.job_id, self.$blob, self.recipient_address
                )
            }

            fn job_id(&self) -> &JobId {
                &self.job_id
            }

            fn recipient_address(&self) -> &str {
                &self.recipient_address
            }

            fn blob_name(&self) -> &str {
                &self.$blob
            }
        }
    };
}

pipeline_message!(
    /// Work item for the recognition stage: `job_id|image_blob_name|recipient`.
    RecognitionMessage,
    image_blob_name,
    "image blob name"
);

pipeline_message!(
    /// Work item for the delivery stage: `job_id|text_blob_name|recipient`.
    DeliveryMessage,
    text_blob_name,
    "text blob name"
);

/// Name of the recognized-text blob produced from an input image blob.
pub fn text_blob_name_for(image_blob_name: &str) -> String {
    format!("{image_blob_name}.txt")
}
