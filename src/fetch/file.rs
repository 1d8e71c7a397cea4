//! Local file source.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::{FetchError, Fetcher};

/// Reads byte ranges from a file on local disk.
pub struct FileFetcher {
    path: PathBuf,
    file: Mutex<File>,
    len: u64,
}

impl FileFetcher {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FetchError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            file: Mutex::new(file),
            len,
        })
    }

    /// Length of the file at open time.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Fetcher for FileFetcher {
    fn fetch(&self, start: u64, end: u64) -> Result<Bytes, FetchError> {
        let mut buf = vec![0u8; (end - start) as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(&mut buf)?;
        }
        debug!(path = %self.path.display(), start, end, "Read range from local file");
        Ok(Bytes::from(buf))
    }
}
