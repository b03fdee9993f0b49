//! The slide facade.
//!
//! A [`Slide`] owns everything belonging to one opened container: the
//! parsed headers and tile directory (or TIFF structure), the inferred
//! level table, the property table, the decoded-tile store and the file
//! handle pool. It is safe to share across tasks and threads; tile reads
//! are independent and only serialise on the per-key decode and the
//! cache's internal bookkeeping.
//!
//! Opening runs discovery, format selection, header parsing, tile-directory
//! load, pyramid inference and property extraction, in that order. Any
//! failure aborts the open and releases everything acquired so far; no
//! half-open slide value exists.

mod properties;

pub use properties::keys;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::config::SlideOptions;
use crate::error::SlideError;
use crate::format::detect::{self, ContainerKind, DiscoveredContainer};
use crate::format::ets::{Colorspace, EtsVolume};
use crate::format::ome_tiff::{decode_tiff_tile, OmeTiffVolume};
use crate::io::FilePool;
use crate::pyramid::{self, LevelDescriptor};
use crate::tile::cache::{PinnedTile, TileEntry, TileKey};
use crate::tile::codec::{CodecMode, CodecRegistry};
use crate::tile::store::{TileSource, TileStore};

// =============================================================================
// Backing Volume
// =============================================================================

/// Format-specific backing for a slide.
///
/// An enum rather than a trait object: tile fetching is generic over the
/// reader seam, which would make a trait not object-safe.
enum Volume {
    Ets(EtsVolume),
    OmeTiff(OmeTiffVolume),
}

// =============================================================================
// Slide
// =============================================================================

/// An opened Olympus slide.
pub struct Slide {
    container: DiscoveredContainer,
    volume: Volume,
    pool: Arc<FilePool>,
    codecs: Arc<CodecRegistry>,
    levels: Vec<LevelDescriptor>,
    plane_count: u32,
    properties: BTreeMap<String, String>,
    store: TileStore,
    closed: AtomicBool,
}

impl std::fmt::Debug for Slide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slide").finish_non_exhaustive()
    }
}

impl Slide {
    /// Open a slide with default options and the built-in codecs.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SlideError> {
        Self::open_with(path, SlideOptions::default(), CodecRegistry::with_defaults()).await
    }

    /// Open a slide with explicit options and codec collaborators.
    pub async fn open_with(
        path: impl AsRef<Path>,
        options: SlideOptions,
        codecs: CodecRegistry,
    ) -> Result<Self, SlideError> {
        let path = path.as_ref();
        let container = detect::discover(path).await?;
        let pool = Arc::new(FilePool::open(&container.data_path, options.max_file_handles).await?);

        let (volume, levels, plane_count) = match container.kind {
            ContainerKind::Ets => {
                let volume = EtsVolume::open(pool.as_ref()).await?;
                let pyramid = pyramid::infer(&volume.tiles, &volume.header)?;
                (Volume::Ets(volume), pyramid.levels, pyramid.plane_count)
            }
            ContainerKind::OmeTiff => {
                let volume = OmeTiffVolume::open(pool.as_ref()).await?;
                let levels = volume.level_descriptors();
                let plane_count = volume.plane_count;
                (Volume::OmeTiff(volume), levels, plane_count)
            }
        };

        let table = match &volume {
            Volume::Ets(v) => properties::build_ets(v, &levels, container.descriptor.as_ref()),
            Volume::OmeTiff(v) => {
                properties::build_ome_tiff(v, &levels, container.descriptor.as_ref())
            }
        };

        debug!(
            path = %path.display(),
            data = %container.data_path.display(),
            levels = levels.len(),
            planes = plane_count,
            "opened slide"
        );

        Ok(Slide {
            container,
            volume,
            pool,
            codecs: Arc::new(codecs),
            levels,
            plane_count,
            properties: table,
            store: TileStore::new(options.cache_capacity),
            closed: AtomicBool::new(false),
        })
    }

    // -------------------------------------------------------------------------
    // Metadata accessors
    // -------------------------------------------------------------------------

    /// Path of the file holding tile data (the sidecar for `.vsi` input).
    pub fn data_path(&self) -> &Path {
        &self.container.data_path
    }

    /// Number of pyramid levels; level 0 is the highest resolution.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Number of logical planes. Brightfield slides have exactly one.
    pub fn plane_count(&self) -> u32 {
        self.plane_count
    }

    /// Full-resolution dimensions, `(width, height)`.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.levels[0].width, self.levels[0].height)
    }

    /// Dimensions of one level, or `None` when out of range.
    pub fn level_dimensions(&self, level: usize) -> Option<(u32, u32)> {
        self.levels.get(level).map(|l| (l.width, l.height))
    }

    /// Downsample of one level relative to level 0.
    pub fn level_downsample(&self, level: usize) -> Option<f64> {
        self.levels.get(level).map(|l| l.downsample)
    }

    /// Tile size of one level, `(tile_width, tile_height)`.
    pub fn tile_size(&self, level: usize) -> Option<(u32, u32)> {
        self.levels.get(level).map(|l| (l.tile_width, l.tile_height))
    }

    /// The full level table.
    pub fn levels(&self) -> &[LevelDescriptor] {
        &self.levels
    }

    /// The property table assembled at open.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// One property value.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// The decoded-tile store, for cache statistics.
    pub fn store(&self) -> &TileStore {
        &self.store
    }

    /// Index of the level whose downsample is the largest one not
    /// exceeding `downsample`; level 0 when every level is finer.
    pub fn best_level_for_downsample(&self, downsample: f64) -> usize {
        let mut best = 0;
        let mut best_downsample = self.levels[0].downsample;
        for (index, level) in self.levels.iter().enumerate() {
            if level.downsample <= downsample && level.downsample >= best_downsample {
                best = index;
                best_downsample = level.downsample;
            }
        }
        best
    }

    // -------------------------------------------------------------------------
    // Tile reads
    // -------------------------------------------------------------------------

    /// Read one decoded tile, pinned until the returned handle drops.
    ///
    /// The buffer is always the full `tile_width x tile_height`; on the
    /// right and bottom level edges the logical image may end inside the
    /// tile and callers composite only the sub-rectangle they need.
    pub async fn read_tile(
        &self,
        level: u32,
        col: u32,
        row: u32,
        plane: u32,
    ) -> Result<PinnedTile, SlideError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SlideError::Closed);
        }

        let descriptor = self
            .levels
            .get(level as usize)
            .ok_or(SlideError::TileOutOfRange { level, col, row })?;
        if col >= descriptor.tiles_across || row >= descriptor.tiles_down {
            return Err(SlideError::TileOutOfRange { level, col, row });
        }
        if plane >= self.plane_count {
            return Err(SlideError::TileOutOfRange { level, col, row });
        }

        let key = TileKey {
            level,
            col,
            row,
            plane,
        };
        self.store.read_tile(key, &BackendSource { slide: self }).await
    }

    /// Read an axis-aligned region into a fresh RGBA buffer.
    ///
    /// `x` and `y` are level-0 coordinates of the region's top-left corner;
    /// `width` and `height` are in level-`level` pixels. Pixels outside the
    /// level image, and pixels of tiles absent from a sparse directory,
    /// stay zeroed.
    pub async fn read_region(
        &self,
        x: i64,
        y: i64,
        level: u32,
        width: u32,
        height: u32,
        plane: u32,
    ) -> Result<Bytes, SlideError> {
        let mut dest = vec![0u8; width as usize * height as usize * 4];
        self.read_region_into(x, y, level, width, height, plane, &mut dest)
            .await?;
        Ok(Bytes::from(dest))
    }

    /// Read an axis-aligned region into a caller-supplied RGBA buffer of
    /// exactly `width * height * 4` bytes.
    #[allow(clippy::too_many_arguments)]
    pub async fn read_region_into(
        &self,
        x: i64,
        y: i64,
        level: u32,
        width: u32,
        height: u32,
        plane: u32,
        dest: &mut [u8],
    ) -> Result<(), SlideError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SlideError::Closed);
        }
        let descriptor = *self.levels.get(level as usize).ok_or({
            SlideError::TileOutOfRange { level, col: 0, row: 0 }
        })?;

        let expected = width as usize * height as usize * 4;
        if dest.len() != expected {
            return Err(SlideError::Io {
                message: format!(
                    "destination holds {} bytes, region needs {expected}",
                    dest.len()
                ),
            });
        }
        if width == 0 || height == 0 {
            return Ok(());
        }

        // Region origin in level-local pixels.
        let lx = (x as f64 / descriptor.downsample).floor() as i64;
        let ly = (y as f64 / descriptor.downsample).floor() as i64;

        let tile_w = descriptor.tile_width as i64;
        let tile_h = descriptor.tile_height as i64;
        let col_first = (lx.div_euclid(tile_w)).max(0);
        let col_last = ((lx + width as i64 - 1).div_euclid(tile_w))
            .min(descriptor.tiles_across as i64 - 1);
        let row_first = (ly.div_euclid(tile_h)).max(0);
        let row_last = ((ly + height as i64 - 1).div_euclid(tile_h))
            .min(descriptor.tiles_down as i64 - 1);

        for tile_row in row_first..=row_last {
            for tile_col in col_first..=col_last {
                let tile = match self
                    .read_tile(level, tile_col as u32, tile_row as u32, plane)
                    .await
                {
                    Ok(tile) => tile,
                    // Sparse directories simply have no entry for some grid
                    // positions; those pixels keep the background fill.
                    Err(SlideError::MissingTile { .. }) => continue,
                    Err(err) => return Err(err),
                };

                // The decoded buffer is always a full tile; clip it to the
                // level image and then to the requested rectangle. A tile
                // whose decoded extent runs past its grid cell gets the
                // same sub-rectangle treatment here.
                let tile_x0 = tile_col * tile_w;
                let tile_y0 = tile_row * tile_h;
                let valid_w = tile_w.min(descriptor.width as i64 - tile_x0);
                let valid_h = tile_h.min(descriptor.height as i64 - tile_y0);

                let copy_x0 = lx.max(tile_x0);
                let copy_x1 = (lx + width as i64).min(tile_x0 + valid_w);
                let copy_y0 = ly.max(tile_y0);
                let copy_y1 = (ly + height as i64).min(tile_y0 + valid_h);
                if copy_x0 >= copy_x1 || copy_y0 >= copy_y1 {
                    continue;
                }

                let data = tile.data();
                let row_bytes = (copy_x1 - copy_x0) as usize * 4;
                for line in copy_y0..copy_y1 {
                    let src = ((line - tile_y0) * tile_w + (copy_x0 - tile_x0)) as usize * 4;
                    let dst = ((line - ly) * width as i64 + (copy_x0 - lx)) as usize * 4;
                    dest[dst..dst + row_bytes].copy_from_slice(&data[src..src + row_bytes]);
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Mark the slide closed, wait for every outstanding pinned tile to be
    /// released, then release the pooled file handles.
    ///
    /// Reads issued after `close` begins fail with [`SlideError::Closed`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.store.ledger().wait_drained().await;
        self.pool.drain();
        debug!(data = %self.container.data_path.display(), "closed slide");
    }
}

// =============================================================================
// Backend Fetch
// =============================================================================

/// Cache-miss fetcher: locates, reads and decodes one tile.
struct BackendSource<'a> {
    slide: &'a Slide,
}

#[async_trait]
impl TileSource for BackendSource<'_> {
    async fn fetch_tile(&self, key: TileKey) -> Result<TileEntry, SlideError> {
        let slide = self.slide;
        match &slide.volume {
            Volume::Ets(volume) => {
                let entry = volume
                    .find_tile(key.level, key.plane, key.col, key.row)
                    .ok_or(SlideError::MissingTile {
                        level: key.level,
                        col: key.col,
                        row: key.row,
                        plane: key.plane,
                    })?;

                let mut handle = slide.pool.checkout().await?;
                let payload = handle
                    .read_exact_at(entry.offset, entry.bytes as usize)
                    .await?;
                drop(handle);

                let header = &volume.header;
                let mode = if header.colorspace == Colorspace::Fluorescence
                    && slide.plane_count > 1
                {
                    CodecMode::SingleChannel
                } else {
                    CodecMode::Rgb
                };

                let width = header.tile_width;
                let height = header.tile_height;
                let mut dest = vec![0u8; width as usize * height as usize * 4];
                slide
                    .codecs
                    .get(header.compression)?
                    .decode(&payload, &mut dest, width, height, mode)?;

                Ok(TileEntry::new(Bytes::from(dest), width, height))
            }
            Volume::OmeTiff(volume) => {
                let (offset, length, compression) = volume
                    .tile_location(key.level, key.plane, key.col, key.row)
                    .ok_or(SlideError::MissingTile {
                        level: key.level,
                        col: key.col,
                        row: key.row,
                        plane: key.plane,
                    })?;

                let mut handle = slide.pool.checkout().await?;
                let payload = handle.read_exact_at(offset, length as usize).await?;
                drop(handle);

                let level = &volume.levels[key.level as usize];
                let mode = if slide.plane_count > 1 {
                    CodecMode::SingleChannel
                } else {
                    CodecMode::Rgb
                };

                let (width, height) = (level.tile_width, level.tile_height);
                let mut dest = vec![0u8; width as usize * height as usize * 4];
                decode_tiff_tile(
                    &payload,
                    compression,
                    &mut dest,
                    width,
                    height,
                    mode,
                    &slide.codecs,
                )?;

                Ok(TileEntry::new(Bytes::from(dest), width, height))
            }
        }
    }
}
