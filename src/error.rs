//! Error taxonomy for slide opening and tile reads.
//!
//! All variants carry owned, printable data (no wrapped `std::io::Error`),
//! which keeps the enum `Clone`. This matters for the tile store: when
//! several readers wait on one in-flight decode, every waiter receives the
//! winning decode's error, so the error must be cheap to hand out.
//!
//! Errors raised while opening a slide abort the open and free all partial
//! state. Errors raised by a tile read surface to that caller only; the
//! slide stays usable for other tiles.

use thiserror::Error;

/// Errors produced by container discovery, header parsing, pyramid
/// inference, tile reads and the DeepZoom adapter.
#[derive(Debug, Clone, Error)]
pub enum SlideError {
    /// A file or sidecar referenced by the container is missing.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// Magic bytes at the start of a header did not match.
    #[error("bad magic in {context}: expected {expected:?}, found {found:?}")]
    BadMagic {
        context: &'static str,
        expected: [u8; 4],
        found: [u8; 4],
    },

    /// A fixed header field held a value outside its allowed set.
    #[error("corrupt header: {field} = {value}")]
    CorruptHeader { field: &'static str, value: u64 },

    /// The tile directory contradicts the pyramid inferred from it.
    #[error("inconsistent pyramid: {message}")]
    InconsistentPyramid { message: String },

    /// The container names a compression scheme with no installed codec.
    #[error("unsupported codec: compression {compression}")]
    UnsupportedCodec { compression: u32 },

    /// A codec collaborator rejected the tile payload.
    #[error("decode failed: {message}")]
    DecodeFailed { message: String },

    /// No tile-directory entry exists for the requested key.
    #[error("missing tile: level {level}, col {col}, row {row}, plane {plane}")]
    MissingTile {
        level: u32,
        col: u32,
        row: u32,
        plane: u32,
    },

    /// A required metadata attribute is absent (e.g. OME `SizeX`/`SizeY`).
    #[error("missing metadata attribute: {attribute}")]
    MissingMetadata { attribute: &'static str },

    /// The file is not one of the containers this crate reads.
    #[error("unsupported container: {reason}")]
    Unsupported { reason: String },

    /// A tile or level coordinate is outside the addressable range.
    #[error("out of range: level {level}, col {col}, row {row}")]
    TileOutOfRange { level: u32, col: u32, row: u32 },

    /// The slide was closed while the request was outstanding.
    #[error("slide is closed")]
    Closed,

    /// Underlying I/O failure; retriable by the caller.
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl SlideError {
    /// Wrap an I/O error, mapping missing files to [`SlideError::NotFound`].
    pub(crate) fn from_io(err: std::io::Error, path: &std::path::Path) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            SlideError::NotFound {
                path: path.display().to_string(),
            }
        } else {
            SlideError::Io {
                message: format!("{}: {err}", path.display()),
            }
        }
    }
}

impl From<std::io::Error> for SlideError {
    fn from(err: std::io::Error) -> Self {
        SlideError::Io {
            message: err.to_string(),
        }
    }
}
