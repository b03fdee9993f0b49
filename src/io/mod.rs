//! I/O primitives: the `RangeRead` seam and endian helpers.

mod file_pool;

pub use file_pool::{FilePool, PooledFile};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::SlideError;

/// Trait for reading byte ranges out of a container file.
///
/// Header codecs and the TIFF walker are written against this seam rather
/// than a concrete file type, so tests can parse from in-memory buffers and
/// production code can parse through the pooled file handles.
#[async_trait]
pub trait RangeRead: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Returns an error if the range is out of bounds or the read fails.
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, SlideError>;

    /// Total size of the underlying resource in bytes.
    fn len(&self) -> u64;

    /// True when the resource is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RangeRead for Bytes {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, SlideError> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(SlideError::Io {
            message: format!("range overflow at offset {offset}"),
        })?;
        if end > Bytes::len(self) {
            return Err(SlideError::Io {
                message: format!(
                    "range out of bounds: {len} bytes at offset {offset}, size {}",
                    Bytes::len(self)
                ),
            });
        }
        Ok(self.slice(start..end))
    }

    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }
}

// =============================================================================
// Endian Helpers
// =============================================================================
//
// SIS/ETS data is always little-endian and must be decoded explicitly on
// every host; TIFF data follows the byte order declared in its header.

/// Read a little-endian u16 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 2 bytes.
#[inline]
pub fn read_u16_le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Read a big-endian u16 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 2 bytes.
#[inline]
pub fn read_u16_be(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Read a little-endian u32 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 4 bytes.
#[inline]
pub fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Read a big-endian u32 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 4 bytes.
#[inline]
pub fn read_u32_be(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Read a little-endian u64 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 8 bytes.
#[inline]
pub fn read_u64_le(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Read a big-endian u64 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 8 bytes.
#[inline]
pub fn read_u64_be(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
