//! Elastic file-handle pool.
//!
//! Each container file gets one pool. A tile decode checks a handle out,
//! performs `seek + read`, and hands it back on drop of the guard. The pool
//! grows on demand up to a fixed maximum; beyond that, checkouts block until
//! another task returns a handle.
//!
//! The OME-TIFF path keeps a second pool of its own because a sequence of
//! tag reads needs exclusive ownership of a handle for its whole duration.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

use crate::error::SlideError;

use super::RangeRead;

/// Pool of read handles onto a single file.
pub struct FilePool {
    path: PathBuf,
    file_len: u64,
    /// Idle handles ready for checkout. A plain mutex: the critical section
    /// is a push/pop.
    idle: Mutex<Vec<File>>,
    /// Caps the number of handles that exist at once.
    permits: Semaphore,
}

impl std::fmt::Debug for FilePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePool")
            .field("path", &self.path)
            .field("file_len", &self.file_len)
            .finish_non_exhaustive()
    }
}

impl FilePool {
    /// Open a pool over `path`, statting it once for the total length.
    ///
    /// No handle is opened until the first checkout.
    pub async fn open(path: impl AsRef<Path>, max_handles: usize) -> Result<Self, SlideError> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SlideError::from_io(e, &path))?;

        debug!(path = %path.display(), len = metadata.len(), "opened file pool");

        Ok(Self {
            file_len: metadata.len(),
            idle: Mutex::new(Vec::new()),
            permits: Semaphore::new(max_handles.max(1)),
            path,
        })
    }

    /// Path of the pooled file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total length of the pooled file in bytes.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Check a handle out of the pool, opening a new one if none is idle.
    ///
    /// Blocks when `max_handles` handles are already checked out.
    pub async fn checkout(&self) -> Result<PooledFile<'_>, SlideError> {
        let permit = self.permits.acquire().await.map_err(|_| SlideError::Closed)?;

        let existing = self.idle.lock().expect("file pool poisoned").pop();
        let file = match existing {
            Some(file) => file,
            None => File::open(&self.path)
                .await
                .map_err(|e| SlideError::from_io(e, &self.path))?,
        };

        Ok(PooledFile {
            pool: self,
            file: Some(file),
            _permit: permit,
        })
    }

    /// Drop every idle handle. Outstanding checkouts are unaffected; their
    /// handles are discarded on return.
    pub fn drain(&self) {
        self.idle.lock().expect("file pool poisoned").clear();
        self.permits.close();
    }

    fn put_back(&self, file: File) {
        // After drain() the semaphore is closed and handles are discarded.
        if !self.permits.is_closed() {
            self.idle.lock().expect("file pool poisoned").push(file);
        }
    }
}

#[async_trait]
impl RangeRead for FilePool {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, SlideError> {
        let mut handle = self.checkout().await?;
        handle.read_exact_at(offset, len).await
    }

    fn len(&self) -> u64 {
        self.file_len
    }
}

/// A handle checked out of a [`FilePool`]; returned on drop.
pub struct PooledFile<'a> {
    pool: &'a FilePool,
    file: Option<File>,
    _permit: SemaphorePermit<'a>,
}

impl std::fmt::Debug for PooledFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledFile").finish_non_exhaustive()
    }
}

impl PooledFile<'_> {
    /// Seek to `offset` and read exactly `len` bytes.
    pub async fn read_exact_at(&mut self, offset: u64, len: usize) -> Result<Bytes, SlideError> {
        let end = offset.checked_add(len as u64).ok_or(SlideError::Io {
            message: format!("range overflow at offset {offset}"),
        })?;
        if end > self.pool.file_len {
            return Err(SlideError::Io {
                message: format!(
                    "range out of bounds: {len} bytes at offset {offset}, file is {} bytes",
                    self.pool.file_len
                ),
            });
        }

        let file = self.file.as_mut().expect("pooled file already returned");
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| SlideError::from_io(e, &self.pool.path))?;

        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| SlideError::from_io(e, &self.pool.path))?;
        Ok(Bytes::from(buf))
    }
}

impl Drop for PooledFile<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.pool.put_back(file);
        }
    }
}
