use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::info;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Narrow contract with the blob storage that holds large container image
/// artifacts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a blob under the given key and return the URL it is served from.
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<String, ArtifactStoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactStoreError {
    #[error("sending request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("blob store returned status {0}")]
    Status(StatusCode),
}

pub struct HttpArtifactStoreArgs {
    pub endpoint: String,
    pub bucket: String,
    pub api_key: String,
}

pub struct HttpArtifactStore {
    http_client: Client,
    endpoint: String,
    bucket: String,
    api_key: String,
}

impl HttpArtifactStore {
    pub fn new(args: HttpArtifactStoreArgs) -> anyhow::Result<Self> {
        let HttpArtifactStoreArgs { endpoint, bucket, api_key } = args;
        let http_client =
            Client::builder().timeout(UPLOAD_TIMEOUT).build().context("Failed to build blob store client")?;
        Ok(Self { http_client, endpoint, bucket, api_key })
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<String, ArtifactStoreError> {
        let Self { endpoint, bucket, .. } = self;
        let url = format!("{endpoint}/{bucket}/{key}");
        let size = bytes.len();
        let response =
            self.http_client.put(&url).header("x-api-key", &self.api_key).body(bytes).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArtifactStoreError::Status(status));
        }
        info!("Uploaded {size} byte artifact to {url}");
        Ok(url)
    }
}
