//! Upstream HTTP access.
//!
//! One GET per read request. The response body is exposed as an [`AsyncRead`]
//! so a session can pull it block by block; dropping the [`Body`] releases the
//! underlying connection back to the pool (or closes it).

use futures::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::config::{validate_url, Config, UrlError};

/// Forward-only response body.
pub type Body = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("file not found")]
    NotFound,

    #[error("unexpected response code: {0}")]
    UpstreamError(u16),

    #[error("origin unreachable: {0}")]
    Unreachable(String),

    #[error("invalid target URL: {0}")]
    InvalidUrl(#[from] UrlError),
}

pub struct FetchResult {
    pub status: StatusCode,
    /// Declared Content-Length, if the origin sent one.
    pub content_length: Option<u64>,
    pub body: Body,
}

/// Shared HTTP client plus the origin it resolves filenames against.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    origin: String,
    header_timeout: Duration,
}

fn forwarded_headers(from: SocketAddr) -> HeaderMap {
    let mut headers = HeaderMap::new();
    // SocketAddr's Display output is always a valid header value.
    if let Ok(value) = HeaderValue::from_str(&from.to_string()) {
        headers.insert("x-forwarded-from", value);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("tftp"));
    if let Ok(value) = HeaderValue::from_str(&format!("for=\"{from}\",proto=tftp")) {
        headers.insert("forwarded", value);
    }
    headers
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Result<HttpFetcher, reqwest::Error> {
        let client = Client::builder().pool_max_idle_per_host(config.http_max_idle).build()?;
        Ok(HttpFetcher { client, origin: config.http_url.clone(), header_timeout: config.http_timeout })
    }

    /// Appends `filename` to the origin verbatim. `..` segments are not rejected.
    pub fn target_url(&self, filename: &str) -> Result<reqwest::Url, UrlError> {
        validate_url(&format!("{}{}", self.origin, filename))
    }

    pub async fn fetch(&self, filename: &str, from: SocketAddr) -> Result<FetchResult, FetchError> {
        let url = self.target_url(filename)?;
        log::info!("{from} - {url} GET");

        let request = self.client.get(url.clone()).headers(forwarded_headers(from)).send();
        // `send` resolves once the response head is in. The deadline also covers connecting,
        // so HTTP_TIMEOUT bounds the whole wait for headers, not only the time after the write.
        let response = match tokio::time::timeout(self.header_timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(FetchError::Unreachable(e.to_string())),
            Err(_) => {
                return Err(FetchError::Unreachable(format!(
                    "no response headers within {}s",
                    self.header_timeout.as_secs()
                )))
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            log::info!("{from} - '{url}' not found");
            return Err(FetchError::NotFound);
        } else if status != StatusCode::OK {
            log::warn!("{from} - unexpected response status code is: {}", status.as_u16());
            return Err(FetchError::UpstreamError(status.as_u16()));
        }

        let content_length = response.content_length();
        let stream = response.bytes_stream().map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(FetchResult { status, content_length, body: Box::pin(StreamReader::new(stream)) })
    }
}
