//! Pixel decoder collaborators.
//!
//! The core does not own pixel decoding. Each compression scheme is served
//! by a [`TileCodec`] collaborator that fills a caller-supplied RGBA
//! destination from the compressed payload. A [`CodecRegistry`] maps the
//! container's compression code to the installed collaborator.
//!
//! JPEG ships built in, backed by the `image` crate. The JPEG-2000, PNG and
//! BMP slots start empty and fail with [`SlideError::UnsupportedCodec`]
//! until the host installs an implementation via
//! [`CodecRegistry::install`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SlideError;
use crate::format::ets::Compression;

/// How the decoded samples are laid into the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    /// Packed colour: destination receives RGBA, alpha forced opaque.
    Rgb,
    /// One fluorescence plane: the decoded scalar channel is replicated
    /// across R, G and B with opaque alpha.
    // TODO: decide whether multi-plane slides should instead keep scalar
    // planes end to end; vendor files exist in both arrangements and the
    // compositor currently assumes 4-byte pixels everywhere.
    SingleChannel,
}

/// A pixel decoder for one compression scheme.
///
/// `decode` must fill all `width * height * 4` destination bytes or fail;
/// partially written destinations are discarded by the caller.
pub trait TileCodec: Send + Sync {
    fn decode(
        &self,
        input: &[u8],
        dest: &mut [u8],
        width: u32,
        height: u32,
        mode: CodecMode,
    ) -> Result<(), SlideError>;
}

impl std::fmt::Debug for dyn TileCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn TileCodec")
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Installed codecs, keyed by the container compression code.
pub struct CodecRegistry {
    codecs: HashMap<Compression, Arc<dyn TileCodec>>,
}

impl CodecRegistry {
    /// Empty registry with no codecs installed.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with the built-in JPEG codec installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.install(Compression::Jpeg, Arc::new(JpegCodec));
        registry
    }

    /// Install (or replace) the codec for a compression scheme.
    pub fn install(&mut self, compression: Compression, codec: Arc<dyn TileCodec>) {
        self.codecs.insert(compression, codec);
    }

    /// Look up the codec for a compression scheme.
    pub fn get(&self, compression: Compression) -> Result<&Arc<dyn TileCodec>, SlideError> {
        self.codecs
            .get(&compression)
            .ok_or(SlideError::UnsupportedCodec {
                compression: compression.code(),
            })
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// =============================================================================
// Built-in JPEG
// =============================================================================

/// JPEG decoder backed by the `image` crate.
pub struct JpegCodec;

impl TileCodec for JpegCodec {
    fn decode(
        &self,
        input: &[u8],
        dest: &mut [u8],
        width: u32,
        height: u32,
        mode: CodecMode,
    ) -> Result<(), SlideError> {
        let decoded = image::load_from_memory_with_format(input, image::ImageFormat::Jpeg)
            .map_err(|e| SlideError::DecodeFailed {
                message: format!("JPEG: {e}"),
            })?;

        if decoded.width() != width || decoded.height() != height {
            return Err(SlideError::DecodeFailed {
                message: format!(
                    "JPEG tile is {}x{}, expected {}x{}",
                    decoded.width(),
                    decoded.height(),
                    width,
                    height
                ),
            });
        }

        let expected = width as usize * height as usize * 4;
        if dest.len() != expected {
            return Err(SlideError::DecodeFailed {
                message: format!(
                    "destination holds {} bytes, tile needs {expected}",
                    dest.len()
                ),
            });
        }

        match mode {
            CodecMode::Rgb => {
                let rgba = decoded.to_rgba8();
                dest.copy_from_slice(rgba.as_raw());
            }
            CodecMode::SingleChannel => {
                let gray = decoded.to_luma8();
                for (pixel, out) in gray.as_raw().iter().zip(dest.chunks_exact_mut(4)) {
                    out[0] = *pixel;
                    out[1] = *pixel;
                    out[2] = *pixel;
                    out[3] = 0xFF;
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
