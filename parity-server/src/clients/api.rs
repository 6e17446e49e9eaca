use anyhow::Context;
use parity_server_models::{errors::RequestHandlerError, tasks::AssignTaskRequest};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use uuid::Uuid;

/// Thin client for the control plane's own API, used by CLI subcommands that
/// talk to a running server.
pub struct ServerApiClient {
    http_client: Client,
    base_url: String,
}

impl ServerApiClient {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build API client")?;
        Ok(Self { http_client, base_url })
    }

    pub async fn assign_task(&self, task_id: Uuid, runner_id: &str) -> Result<(), RequestError> {
        let url = format!("{}/tasks/{task_id}/assign", self.base_url);
        let request = AssignTaskRequest { runner_id: runner_id.into() };
        let response = self.http_client.post(&url).json(&request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let err: RequestHandlerError = response.json().await.map_err(|_| RequestError::InvalidError(status))?;
        Err(RequestError::Handler { code: err.error_code, details: err.message })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("sending request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("api error, code = {code}, details = {details}")]
    Handler { code: String, details: String },

    #[error("invalid error response for status: {0}")]
    InvalidError(StatusCode),
}
