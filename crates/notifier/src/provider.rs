//! Delivery providers performing the per-recipient network send.
//!
//! The engine only depends on the `DeliveryProvider` trait; each channel is
//! wired to one implementation. `LogProvider` is a dry-run used when no
//! credentials are configured.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use beacon_common::types::Channel;

use crate::error::NotifierError;

/// A fully rendered message for one recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub channel: Channel,
    /// Email address or phone number
    pub to: String,
    /// Email only
    pub subject: Option<String>,
    pub body: String,
    /// Email only
    pub is_html: bool,
}

/// Sends one message. Each call succeeds or fails independently of all others.
#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifierError>;
}

/// Dry-run provider that only logs what would have been sent.
pub struct LogProvider;

#[async_trait]
impl DeliveryProvider for LogProvider {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifierError> {
        info!(
            channel = %message.channel,
            to = %message.to,
            subject = ?message.subject,
            body_len = message.body.len(),
            "Dry-run delivery"
        );
        Ok(())
    }
}

/// Email delivery through the Resend HTTP API.
pub struct ResendEmailProvider {
    client: reqwest::Client,
    api_key: String,
    from: String,
    endpoint: String,
}

impl ResendEmailProvider {
    const DEFAULT_ENDPOINT: &str = "https://api.resend.com/emails";

    pub fn new(api_key: String, from: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            from,
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
        }
    }
}

#[async_trait]
impl DeliveryProvider for ResendEmailProvider {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifierError> {
        let content_key = if message.is_html { "html" } else { "text" };
        let mut body = json!({
            "from": self.from,
            "to": [message.to],
            "subject": message.subject.clone().unwrap_or_default(),
        });
        body[content_key] = json!(message.body);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifierError::delivery(Channel::Email, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(NotifierError::delivery(
                Channel::Email,
                format!("Resend returned {}: {}", status, detail),
            ));
        }

        Ok(())
    }
}

/// SMS delivery through a JSON HTTP gateway (`POST {to, message}`).
pub struct HttpSmsProvider {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpSmsProvider {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            token,
        }
    }
}

#[async_trait]
impl DeliveryProvider for HttpSmsProvider {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifierError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&json!({ "to": message.to, "message": message.body }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifierError::delivery(Channel::Sms, e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifierError::delivery(
                Channel::Sms,
                format!("SMS gateway returned {}", response.status()),
            ));
        }

        Ok(())
    }
}
