use anyhow::Context;
use async_trait::async_trait;
use parity_server_models::webhooks::WebhookMessage;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use uuid::Uuid;

const USER_AGENT: &str = "Parity-Server/1.0";

/// Where a notification goes. The webhook id is only set on fan-out pushes to
/// registered webhooks.
#[derive(Clone, Debug, PartialEq)]
pub struct WebhookTarget {
    pub url: String,
    pub webhook_id: Option<Uuid>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookClient: Send + Sync {
    /// Push an availability hint to a runner URL. Any 2xx response counts as
    /// delivered.
    async fn notify(&self, target: WebhookTarget, message: WebhookMessage) -> Result<(), WebhookClientError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookClientError {
    #[error("sending request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook returned status {0}")]
    Status(StatusCode),
}

pub struct HttpWebhookClient {
    http_client: Client,
}

impl HttpWebhookClient {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn notify(&self, target: WebhookTarget, message: WebhookMessage) -> Result<(), WebhookClientError> {
        let WebhookTarget { url, webhook_id } = target;
        let mut request = self.http_client.post(&url).json(&message);
        if let Some(id) = webhook_id {
            request = request.header("X-Webhook-ID", id.to_string());
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() { Ok(()) } else { Err(WebhookClientError::Status(status)) }
    }
}
