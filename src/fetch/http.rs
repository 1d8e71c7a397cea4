//! HTTP source using `Range` requests.

use std::time::Duration;

use bytes::Bytes;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use tracing::debug;

use super::{FetchError, Fetcher};

/// Fetches byte ranges of a single URL.
///
/// Uses the blocking client, so it must not be driven from inside an async
/// task; `SharedBlockCache::fetch_range_async` already runs fetches on the
/// blocking pool.
pub struct HttpFetcher {
    client: Client,
    url: String,
}

impl HttpFetcher {
    pub fn new(url: impl Into<String>) -> Result<Self, FetchError> {
        Self::with_timeout(url, Duration::from_secs(60))
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Total size of the remote resource, from a `HEAD` request.
    pub fn content_length(&self) -> Result<u64, FetchError> {
        let response = self.client.head(&self.url).send()?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| anyhow::anyhow!("{} did not report a Content-Length", self.url).into())
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, start: u64, end: u64) -> Result<Bytes, FetchError> {
        if start == end {
            return Ok(Bytes::new());
        }

        // HTTP byte ranges are inclusive.
        let response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", start, end - 1))
            .send()?;

        let status = response.status();
        let body = match status {
            StatusCode::PARTIAL_CONTENT => response.bytes()?,
            // Servers that ignore Range send the whole body.
            StatusCode::OK => {
                let full = response.bytes()?;
                if (full.len() as u64) < end {
                    return Err(FetchError::ShortRead {
                        expected: end - start,
                        actual: (full.len() as u64).saturating_sub(start),
                    });
                }
                full.slice(start as usize..end as usize)
            }
            other => return Err(FetchError::Status(other.as_u16())),
        };

        debug!(url = %self.url, start, end, status = status.as_u16(), "Fetched HTTP range");
        Ok(body)
    }
}
