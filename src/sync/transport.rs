//! The transfer interface and its HTTP implementation.
//!
//! Routes, relative to the peer's base URL:
//!
//! ```text
//! PUT  /recordings/{id}/metadata                              JSON body
//! GET  /recordings/{id}/metadata
//! PUT  /recordings/{id}/slices/{filename}?partial=&offset=    raw body
//! GET  /recordings/{id}/slices/{hash}                         `filename` header
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::debug;

use crate::error::TransferError;
use crate::slice::SlicePayload;

/// Header naming the stored file of a pulled slice.
pub const FILENAME_HEADER: &str = "filename";

/// A slice file fetched from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledSlice {
    /// `<hash>.bin` or `<hash>.bin.<ext>`, as stored by the peer.
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// One side of the sync protocol.
///
/// Implementations are shared between upload tasks behind an `Arc`, so
/// connection state lives inside the implementation, not in the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn push_metadata(&self, id: &str, metadata: &Value) -> Result<(), TransferError>;

    async fn push_slice(&self, id: &str, payload: &SlicePayload) -> Result<(), TransferError>;

    async fn pull_metadata(&self, id: &str) -> Result<Value, TransferError>;

    async fn pull_slice(&self, id: &str, hash: &str) -> Result<PulledSlice, TransferError>;
}

/// [`Transport`] over HTTP with a bounded per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: Client,
}

fn request_error(err: reqwest::Error) -> TransferError {
    if err.is_timeout() {
        TransferError::Timeout
    } else {
        TransferError::Network(err.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(TransferError::Status { status: status.as_u16(), message })
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder().timeout(timeout).build().map_err(request_error)?;
        Ok(Self { base_url: base_url.into().trim_end_matches('/').to_string(), client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn recording_url(&self, id: &str) -> String {
        format!("{}/recordings/{}", self.base_url, id)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn push_metadata(&self, id: &str, metadata: &Value) -> Result<(), TransferError> {
        let url = format!("{}/metadata", self.recording_url(id));
        let response = self.client.put(&url).json(metadata).send().await.map_err(request_error)?;
        check_status(response).await?;
        debug!(id, "Pushed metadata");
        Ok(())
    }

    async fn push_slice(&self, id: &str, payload: &SlicePayload) -> Result<(), TransferError> {
        let url = format!("{}/slices/{}", self.recording_url(id), payload.filename);
        let response = self
            .client
            .put(&url)
            .query(&[("partial", payload.partial.to_string()), ("offset", payload.offset.to_string())])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload.bytes.clone())
            .send()
            .await
            .map_err(request_error)?;
        check_status(response).await?;
        debug!(id, file = %payload.filename, bytes = payload.bytes.len(), partial = payload.partial, "Pushed slice");
        Ok(())
    }

    async fn pull_metadata(&self, id: &str) -> Result<Value, TransferError> {
        let url = format!("{}/metadata", self.recording_url(id));
        let response = self.client.get(&url).send().await.map_err(request_error)?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| TransferError::Malformed(format!("metadata body: {}", e)))
    }

    async fn pull_slice(&self, id: &str, hash: &str) -> Result<PulledSlice, TransferError> {
        let url = format!("{}/slices/{}", self.recording_url(id), hash);
        let response = self.client.get(&url).send().await.map_err(request_error)?;
        let response = check_status(response).await?;
        let filename = response
            .headers()
            .get(FILENAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| TransferError::Malformed(format!("no {} header for slice {}", FILENAME_HEADER, hash)))?;
        let bytes = response.bytes().await.map_err(request_error)?.to_vec();
        Ok(PulledSlice { filename, bytes })
    }
}
