//! vsislide - a reader for Olympus whole-slide images.
//!
//! This crate opens the three spellings of an Olympus slide — a `.vsi`
//! descriptor with its sidecar directory, a bare `.ets` SIS/ETS container,
//! or an Olympus OME-TIFF export — reconstructs the multi-resolution,
//! multi-plane pyramid, and serves decoded RGBA tiles through a shared
//! cache with single-flight decoding. A DeepZoom adapter maps viewer
//! coordinates onto physical slide reads.
//!
//! ```ignore
//! use vsislide::{DeepZoom, DeepZoomOptions, Slide};
//! use std::sync::Arc;
//!
//! let slide = Arc::new(Slide::open("scan.vsi").await?);
//! println!("{}x{} pixels, {} levels", slide.dimensions().0,
//!          slide.dimensions().1, slide.level_count());
//!
//! let tile = slide.read_tile(0, 0, 0, 0).await?;     // pinned RGBA buffer
//! let dz = DeepZoom::new(slide.clone(), DeepZoomOptions::default());
//! let dz_tile = dz.read_tile(dz.level_count() - 1, 0, 0, 0).await?;
//! # drop((tile, dz_tile));
//! slide.close().await;
//! ```
//!
//! The core is library-only: no CLI, no network I/O, no persisted state.
//! Pixel decoders are collaborators behind [`TileCodec`]; JPEG ships built
//! in and the remaining schemes accept host-installed implementations.

pub mod config;
pub mod deepzoom;
pub mod error;
pub mod format;
pub mod io;
pub mod pyramid;
pub mod slide;
pub mod tile;

// Re-export the everyday surface.
pub use config::{DeepZoomOptions, SlideOptions};
pub use deepzoom::{DeepZoom, DzTile, DzTileInfo};
pub use error::SlideError;
pub use format::{ContainerKind, DiscoveredContainer};
pub use pyramid::LevelDescriptor;
pub use slide::{keys, Slide};
pub use tile::{CodecMode, CodecRegistry, PinnedTile, TileCodec, TileKey};
