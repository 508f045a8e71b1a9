use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;

use super::retry::{is_retryable_http_status, retry_async, RetryConfig};
use crate::cache::Validators;
use crate::error::PipelineError;

/// Invoked with the total bytes received so far while a body streams in.
pub type ChunkFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum SourceResponse {
    /// The server confirmed our validators; the cached artifact is current.
    NotModified,
    Modified {
        body: String,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

/// Seam between the orchestrator and the network. Production uses the
/// reqwest-backed client below; tests may substitute their own.
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn fetch(
        &self,
        source_id: &str,
        url: &str,
        validators: &Validators,
        on_chunk: Option<ChunkFn>,
    ) -> Result<SourceResponse, PipelineError>;
}

pub struct HttpSourceClient {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl HttpSourceClient {
    pub fn new(timeout: Duration, retry: RetryConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PipelineError::Config(format!("http client: {}", err)))?;
        Ok(Self { client, retry })
    }

    async fn attempt(
        &self,
        source_id: &str,
        url: &str,
        validators: &Validators,
        on_chunk: &Option<ChunkFn>,
    ) -> Result<SourceResponse, PipelineError> {
        let mut request = self.client.get(url);
        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request
            .send()
            .await
            .map_err(|err| PipelineError::network(source_id, err.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(SourceResponse::NotModified);
        }
        if !status.is_success() {
            let message = format!("unexpected status {}", status);
            return Err(if is_retryable_http_status(status.as_u16()) {
                PipelineError::network(source_id, message)
            } else {
                PipelineError::network_fatal(source_id, message)
            });
        }

        let etag = header_value(&response, ETAG);
        let last_modified = header_value(&response, LAST_MODIFIED);

        let mut response = response;
        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| PipelineError::network(source_id, err.to_string()))?
        {
            body.extend_from_slice(&chunk);
            if let Some(on_chunk) = on_chunk {
                on_chunk(body.len() as u64);
            }
        }

        Ok(SourceResponse::Modified {
            body: String::from_utf8_lossy(&body).into_owned(),
            etag,
            last_modified,
        })
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch(
        &self,
        source_id: &str,
        url: &str,
        validators: &Validators,
        on_chunk: Option<ChunkFn>,
    ) -> Result<SourceResponse, PipelineError> {
        retry_async(&self.retry, source_id, || {
            self.attempt(source_id, url, validators, &on_chunk)
        })
        .await
    }
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}
