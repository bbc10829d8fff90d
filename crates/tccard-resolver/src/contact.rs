//! Contact-form submission to the profile backend.

use serde::Deserialize;
use tccard_core::{ContactMessage, ContactValidationError};
use tccard_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ContactError {
    #[error(transparent)]
    Invalid(#[from] ContactValidationError),
    #[error("contact form endpoint unreachable: {0}")]
    Transport(#[from] FetchError),
    #[error("contact form rejected: {0}")]
    Rejected(String),
    #[error("unreadable contact form response: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct FormResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContactFormClient {
    http: HttpFetcher,
    endpoint: String,
}

impl ContactFormClient {
    pub fn new(http: HttpFetcher, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    /// Send `message` to the profile owner at `recipient`. One attempt, no retry.
    pub async fn submit(
        &self,
        message: &ContactMessage,
        recipient: &str,
        profile_url: &str,
    ) -> Result<(), ContactError> {
        message.validate()?;

        let name = message.name.trim();
        let subject = format!("New message from {name}");
        let query = [
            ("action", "sendContactEmail"),
            ("name", name),
            ("email", message.email.trim()),
            ("phone", message.phone.as_deref().map(str::trim).unwrap_or("")),
            ("message", message.message.trim()),
            ("recipient", recipient),
            ("subject", subject.as_str()),
            ("profileUrl", profile_url),
        ];

        let resp = self.http.get_with_query(&self.endpoint, &query).await?;
        let parsed: FormResponse = serde_json::from_slice(&resp.body)?;
        if parsed.status != "success" {
            let reason = parsed
                .message
                .unwrap_or_else(|| "Please try again later".to_string());
            warn!(%recipient, %reason, "contact form rejected");
            return Err(ContactError::Rejected(reason));
        }
        info!(%recipient, "contact message delivered");
        Ok(())
    }
}
