use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;

pub const RESULT_SUBJECT: &str = "Image recognition results";
pub const RESULT_BODY: &str = "Please find your recognized text attached.";
pub const RESULT_ATTACHMENT_NAME: &str = "recognized-text.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<Attachment>,
}

impl OutgoingEmail {
    /// The results email carrying recognized text as a plain-text attachment.
    pub fn recognition_result(to: &str, text: Vec<u8>) -> Self {
        Self {
            to: to.to_string(),
            subject: RESULT_SUBJECT.to_string(),
            body: RESULT_BODY.to_string(),
            attachment: Some(Attachment {
                file_name: RESULT_ATTACHMENT_NAME.to_string(),
                content_type: "text/plain".to_string(),
                content: text,
            }),
        }
    }
}

/// External email delivery provider.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Email provider rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Client for an HTTP mail-send API speaking the SendGrid v3 JSON format.
pub struct HttpEmailClient {
    http: Client,
    api_url: String,
    api_key: String,
    from_address: String,
    from_name: String,
}

impl HttpEmailClient {
    pub fn new(api_url: &str, api_key: &str, from_address: &str, from_name: &str) -> Self {
        Self {
            http: Client::new(),
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            from_address: from_address.to_string(),
            from_name: from_name.to_string(),
        }
    }

    fn request_body(&self, email: &OutgoingEmail) -> serde_json::Value {
        let mut body = serde_json::json!({
            "personalizations": [{ "to": [{ "email": email.to }] }],
            "from": { "email": self.from_address, "name": self.from_name },
            "subject": email.subject,
            "content": [
                { "type": "text/plain", "value": email.body },
                { "type": "text/html", "value": email.body }
            ]
        });

        if let Some(attachment) = &email.attachment {
            body["attachments"] = serde_json::json!([{
                "content": base64::engine::general_purpose::STANDARD.encode(&attachment.content),
                "type": attachment.content_type,
                "filename": attachment.file_name,
                "disposition": "attachment"
            }]);
        }

        body
    }
}

#[async_trait]
impl EmailSender for HttpEmailClient {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError> {
        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(email))
            .send()
            .await
            .map_err(EmailError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(to = %email.to, status = status.as_u16(), "Email accepted by provider");
        Ok(())
    }
}
