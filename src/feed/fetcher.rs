//! Raw transport for GBFS files.
//!
//! `http`/`https` URLs go through the shared `reqwest::Client`; `file` URLs are
//! read straight from disk, which is how local fixtures and mirrored bundles are
//! loaded. Retrying is not done here: a failed fetch is reported once and the
//! caller's [`UpdateStrategy`](crate::feed::UpdateStrategy) decides when to try again.

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Hard cap on a single file. Geofencing zones for large systems run to several MB.
const MAX_FEED_SIZE: usize = 50 * 1024 * 1024; // 50MB

/// Errors that can occur while fetching a single file.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Server (or file) returned no content
    #[error("Empty response body")]
    EmptyBody,
    /// Local file could not be read
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),
    /// URL scheme is neither http(s) nor file
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
}

/// Fetches the raw bytes behind `url`.
///
/// `headers` and `timeout` apply to HTTP requests only. Any non-2xx status and
/// any empty body are failures.
pub async fn fetch_bytes(
    client: &reqwest::Client,
    url: &Url,
    headers: HeaderMap,
    timeout: Duration,
) -> Result<Bytes, FetchError> {
    let bytes = match url.scheme() {
        "http" | "https" => {
            tokio::time::timeout(timeout, fetch_http(client, url, headers))
                .await
                .map_err(|_| FetchError::Timeout(timeout))??
        }
        "file" => fetch_file(url).await?,
        scheme => return Err(FetchError::UnsupportedScheme(scheme.to_owned())),
    };

    if bytes.is_empty() {
        return Err(FetchError::EmptyBody);
    }
    Ok(bytes)
}

async fn fetch_http(
    client: &reqwest::Client,
    url: &Url,
    headers: HeaderMap,
) -> Result<Bytes, FetchError> {
    let response = client
        .get(url.as_str())
        .headers(headers)
        .send()
        .await
        .map_err(FetchError::Network)?;

    if !response.status().is_success() {
        tracing::warn!(url = %url, status = %response.status(), "Got non-success status code");
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }

    read_limited_bytes(response, MAX_FEED_SIZE).await
}

async fn fetch_file(url: &Url) -> Result<Bytes, FetchError> {
    let path = url
        .to_file_path()
        .map_err(|_| FetchError::UnsupportedScheme(format!("file URL without local path: {url}")))?;

    let metadata = tokio::fs::metadata(&path).await?;
    if metadata.len() > MAX_FEED_SIZE as u64 {
        return Err(FetchError::ResponseTooLarge);
    }
    Ok(Bytes::from(tokio::fs::read(&path).await?))
}

async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> Result<Bytes, FetchError> {
    // Capture Content-Length for completeness check
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(Bytes::from(bytes))
}
