//! File-like reading on top of a pluggable block cache.
//!
//! [`CachedFile`] turns any [`BlockCache`] into a `Read + Seek` handle over
//! the remote resource. [`SharedBlockCache`] is one strategy; [`Uncached`]
//! forwards every read straight to its fetcher.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::cache::{CacheError, SharedBlockCache};
use crate::fetch::{fetch_exact, Fetcher};

/// A strategy for serving positional reads of a fixed-size resource.
pub trait BlockCache: Send + Sync {
    /// Total length of the resource.
    fn size(&self) -> u64;

    /// Fill `buf` starting at `offset`, stopping at the end of the resource.
    /// Returns the number of bytes written; 0 at or past the end.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, CacheError>;
}

/// Clamp a read of `want` bytes at `offset` to a resource of `size` bytes.
fn readable(size: u64, offset: u64, want: usize) -> u64 {
    size.saturating_sub(offset).min(want as u64)
}

impl BlockCache for SharedBlockCache {
    fn size(&self) -> u64 {
        SharedBlockCache::size(self)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, CacheError> {
        let n = readable(self.size(), offset, buf.len());
        if n == 0 {
            return Ok(0);
        }
        let data = self.fetch_range(offset, offset + n)?;
        buf[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }
}

impl<C: BlockCache + ?Sized> BlockCache for Arc<C> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, CacheError> {
        (**self).read_at(offset, buf)
    }
}

/// Pass-through strategy: every read goes to the fetcher.
pub struct Uncached<F> {
    fetcher: F,
    size: u64,
}

impl<F: Fetcher> Uncached<F> {
    pub fn new(fetcher: F, size: u64) -> Self {
        Self { fetcher, size }
    }
}

impl<F: Fetcher> BlockCache for Uncached<F> {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, CacheError> {
        let n = readable(self.size, offset, buf.len());
        if n == 0 {
            return Ok(0);
        }
        let end = offset + n;
        let data = fetch_exact(&self.fetcher, offset, end).map_err(|source| CacheError::Fetch {
            start: offset,
            end,
            source,
        })?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

/// A seekable reader over a cached resource.
pub struct CachedFile<C> {
    cache: C,
    pos: u64,
}

impl<C: BlockCache> CachedFile<C> {
    pub fn new(cache: C) -> Self {
        Self { cache, pos: 0 }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn size(&self) -> u64 {
        self.cache.size()
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn into_inner(self) -> C {
        self.cache
    }
}

impl<C: BlockCache> Read for CachedFile<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.cache.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<C: BlockCache> Seek for CachedFile<C> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(p) => {
                self.pos = p;
                return Ok(p);
            }
            SeekFrom::End(delta) => (self.cache.size(), delta),
            SeekFrom::Current(delta) => (self.pos, delta),
        };
        match base.checked_add_signed(offset) {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use bytes::Bytes;

    fn pattern_fetcher(start: u64, end: u64) -> Result<Bytes, FetchError> {
        Ok(Bytes::from((start..end).map(|i| (i % 251) as u8).collect::<Vec<_>>()))
    }

    #[test]
    fn test_uncached_read_and_seek() {
        let mut file = CachedFile::new(Uncached::new(pattern_fetcher, 1000));

        let mut buf = [0u8; 4];
        file.seek(SeekFrom::Start(500)).unwrap();
        file.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [249, 250, 0, 1]);
        assert_eq!(file.position(), 504);

        file.seek(SeekFrom::End(-2)).unwrap();
        let mut rest = Vec::new();
        file.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, vec![(998 % 251) as u8, (999 % 251) as u8]);
    }

    #[test]
    fn test_read_past_end_returns_zero() {
        let mut file = CachedFile::new(Uncached::new(pattern_fetcher, 10));
        file.seek(SeekFrom::Start(50)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_negative_seek_fails() {
        let mut file = CachedFile::new(Uncached::new(pattern_fetcher, 10));
        let err = file.seek(SeekFrom::Current(-1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
