//! Backing sources the cache fills itself from.
//!
//! The cache only knows a [`Fetcher`]: something that returns the bytes
//! `[start, end)` of the resource or fails. Any closure with the matching
//! signature is a fetcher; [`FileFetcher`] and [`HttpFetcher`] cover the
//! local and remote sources the CLI works with.

mod file;
mod http;

pub use file::FileFetcher;
pub use http::HttpFetcher;

use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Source of truth for the cached resource.
///
/// Implementations must return exactly `end - start` bytes. They are called
/// from whichever thread misses the cache, possibly several at once for
/// disjoint ranges. Retries and timeouts are the fetcher's business.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, start: u64, end: u64) -> Result<Bytes, FetchError>;
}

impl<F> Fetcher for F
where
    F: Fn(u64, u64) -> Result<Bytes, FetchError> + Send + Sync,
{
    fn fetch(&self, start: u64, end: u64) -> Result<Bytes, FetchError> {
        self(start, end)
    }
}

/// Fetch `[start, end)` and check the length of what came back.
pub(crate) fn fetch_exact(
    fetcher: &dyn Fetcher,
    start: u64,
    end: u64,
) -> Result<Bytes, FetchError> {
    let data = fetcher.fetch(start, end)?;
    let expected = end - start;
    if data.len() as u64 != expected {
        return Err(FetchError::ShortRead {
            expected,
            actual: data.len() as u64,
        });
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_is_fetcher() {
        let fetcher = |start: u64, end: u64| -> Result<Bytes, FetchError> {
            Ok(Bytes::from((start..end).map(|i| i as u8).collect::<Vec<_>>()))
        };
        let data = fetch_exact(&fetcher, 10, 14).unwrap();
        assert_eq!(&data[..], &[10, 11, 12, 13]);
    }

    #[test]
    fn test_wrong_length_is_short_read() {
        let fetcher =
            |_: u64, _: u64| -> Result<Bytes, FetchError> { Ok(Bytes::from_static(b"abc")) };
        let err = fetch_exact(&fetcher, 0, 8).unwrap_err();
        assert!(matches!(
            err,
            FetchError::ShortRead {
                expected: 8,
                actual: 3
            }
        ));
    }
}
