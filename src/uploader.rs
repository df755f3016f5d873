// Transfer of one buffer to one negotiated slot URL.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_LENGTH;
use reqwest::Client;

use crate::error::UploadError;

/// Single-shot transfer of exact bytes to a destination URL.
#[async_trait]
pub trait SlotUploader: Send + Sync {
    async fn upload(&self, url: &str, content: Bytes) -> Result<(), UploadError>;
}

/// PUTs the raw bytes to a pre-signed URL. No auth header is sent; the URL
/// itself carries the grant.
#[derive(Clone)]
pub struct HttpSlotUploader {
    client: Client,
}

impl HttpSlotUploader {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build upload HTTP client")?;
        Ok(HttpSlotUploader { client })
    }
}

#[async_trait]
impl SlotUploader for HttpSlotUploader {
    async fn upload(&self, url: &str, content: Bytes) -> Result<(), UploadError> {
        let res = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, content.len())
            .body(content)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(UploadError::Rejected { status, body });
        }
        Ok(())
    }
}
