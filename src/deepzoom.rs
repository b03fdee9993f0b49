//! DeepZoom coordinate adapter.
//!
//! DeepZoom pyramids number levels from 0 (a 1x1 image) up to the full
//! resolution, the opposite of the slide's native numbering, and they tile
//! with a fixed edge plus a pixel overlap on interior sides. This adapter
//! precomputes the whole mapping at construction and translates DeepZoom
//! `(level, col, row)` requests into physical region reads against the
//! slide, which an external rasterizer then scales to the final tile size.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::config::DeepZoomOptions;
use crate::error::SlideError;
use crate::slide::{keys, Slide};

// =============================================================================
// Geometry
// =============================================================================

/// The precomputed level mapping, independent of any I/O.
#[derive(Debug, Clone)]
struct Geometry {
    tile_size: u64,
    overlap: u64,
    /// Level-0 coordinate offset of the active area.
    l0_offset: (f64, f64),
    /// Active-area dimensions of each slide level.
    l_dimensions: Vec<(f64, f64)>,
    /// Number of DeepZoom levels.
    dz_levels: usize,
    /// Pixel dimensions of each DeepZoom level, index 0 = 1x1.
    z_dimensions: Vec<(u64, u64)>,
    /// Tile-grid dimensions of each DeepZoom level.
    t_dimensions: Vec<(u64, u64)>,
    /// Preferred slide level for each DeepZoom level.
    slide_from_dz: Vec<usize>,
    /// Native downsample of each slide level.
    l0_l_downsamples: Vec<f64>,
    /// Remaining downsample between each DeepZoom level and its slide level.
    l_z_downsamples: Vec<f64>,
}

/// Bounds of the non-empty region: `(x, y, width, height)` in level-0 pixels.
type Bounds = (f64, f64, f64, f64);

impl Geometry {
    fn build(
        level_dimensions: &[(u32, u32)],
        downsamples: &[f64],
        bounds: Option<Bounds>,
        options: &DeepZoomOptions,
    ) -> Self {
        let (level0_w, level0_h) = level_dimensions[0];

        // Active area: scaled level dimensions plus the level-0 offset.
        let (l0_offset, scale) = match bounds {
            Some((x, y, w, h)) => (
                (x, y),
                (
                    if w > 0.0 { w / level0_w as f64 } else { 1.0 },
                    if h > 0.0 { h / level0_h as f64 } else { 1.0 },
                ),
            ),
            None => ((0.0, 0.0), (1.0, 1.0)),
        };
        let l_dimensions: Vec<(f64, f64)> = level_dimensions
            .iter()
            .map(|&(w, h)| ((w as f64 * scale.0).ceil(), (h as f64 * scale.1).ceil()))
            .collect();

        // Level count: halve from the active level-0 size until 1x1.
        let (mut w, mut h) = (l_dimensions[0].0 as u64, l_dimensions[0].1 as u64);
        let mut dz_levels = 1;
        while w > 1 || h > 1 {
            w = w.div_ceil(2).max(1);
            h = h.div_ceil(2).max(1);
            dz_levels += 1;
        }

        // Per-level pixel sizes, highest resolution last.
        let mut z_dimensions = vec![(0u64, 0u64); dz_levels];
        let (mut w, mut h) = (l_dimensions[0].0 as u64, l_dimensions[0].1 as u64);
        for slot in z_dimensions.iter_mut().rev() {
            *slot = (w, h);
            w = w.div_ceil(2).max(1);
            h = h.div_ceil(2).max(1);
        }

        let tile_size = options.tile_size as u64;
        let t_dimensions: Vec<(u64, u64)> = z_dimensions
            .iter()
            .map(|&(w, h)| (w.div_ceil(tile_size), h.div_ceil(tile_size)))
            .collect();

        // Preferred slide level and remaining downsample per DeepZoom level.
        let mut slide_from_dz = Vec::with_capacity(dz_levels);
        let mut l_z_downsamples = Vec::with_capacity(dz_levels);
        for dz in 0..dz_levels {
            let l0_z_downsample = 2f64.powi((dz_levels - dz - 1) as i32);
            let slide_level = best_level_for_downsample(downsamples, l0_z_downsample);
            slide_from_dz.push(slide_level);
            l_z_downsamples.push(l0_z_downsample / downsamples[slide_level]);
        }

        Geometry {
            tile_size,
            overlap: options.overlap as u64,
            l0_offset,
            l_dimensions,
            dz_levels,
            z_dimensions,
            t_dimensions,
            slide_from_dz,
            l0_l_downsamples: downsamples.to_vec(),
            l_z_downsamples,
        }
    }

    fn tile_info(&self, dz_level: usize, col: u64, row: u64) -> Result<DzTileInfo, SlideError> {
        if dz_level >= self.dz_levels
            || col >= self.t_dimensions[dz_level].0
            || row >= self.t_dimensions[dz_level].1
        {
            return Err(SlideError::TileOutOfRange {
                level: dz_level as u32,
                col: col as u32,
                row: row as u32,
            });
        }

        let slide_level = self.slide_from_dz[dz_level];
        let (t_cols, t_rows) = self.t_dimensions[dz_level];
        let (z_w, z_h) = self.z_dimensions[dz_level];

        // Overlap applies on interior sides only.
        let overlap_tl = (
            self.overlap * (col != 0) as u64,
            self.overlap * (row != 0) as u64,
        );
        let overlap_br = (
            self.overlap * (col != t_cols - 1) as u64,
            self.overlap * (row != t_rows - 1) as u64,
        );

        // Final tile size in DeepZoom pixels, clipped at the level edge.
        let z_size = (
            self.tile_size.min(z_w - self.tile_size * col) + overlap_tl.0 + overlap_br.0,
            self.tile_size.min(z_h - self.tile_size * row) + overlap_tl.1 + overlap_br.1,
        );

        let z_location = (self.tile_size * col, self.tile_size * row);
        let l_downsample = self.l_z_downsamples[dz_level];
        let l_location = (
            l_downsample * (z_location.0 as f64 - overlap_tl.0 as f64),
            l_downsample * (z_location.1 as f64 - overlap_tl.1 as f64),
        );

        // Round the location down and the size up, and shift by the active
        // area's offset.
        let l0_downsample = self.l0_l_downsamples[slide_level];
        let l0_location = (
            l0_downsample * l_location.0 + self.l0_offset.0,
            l0_downsample * l_location.1 + self.l0_offset.1,
        );

        let (l_dim_w, l_dim_h) = self.l_dimensions[slide_level];
        let l_size = (
            (l_downsample * z_size.0 as f64)
                .ceil()
                .min(l_dim_w - l_location.0.ceil()),
            (l_downsample * z_size.1 as f64)
                .ceil()
                .min(l_dim_h - l_location.1.ceil()),
        );

        Ok(DzTileInfo {
            x: l0_location.0 as i64,
            y: l0_location.1 as i64,
            slide_level,
            width: l_size.0.max(0.0) as u32,
            height: l_size.1.max(0.0) as u32,
            scale_width: z_size.0 as u32,
            scale_height: z_size.1 as u32,
        })
    }
}

/// Index of the entry with the largest downsample not exceeding the
/// requested one; 0 when every level is finer.
fn best_level_for_downsample(downsamples: &[f64], requested: f64) -> usize {
    let mut best = 0;
    let mut best_downsample = downsamples[0];
    for (index, &downsample) in downsamples.iter().enumerate() {
        if downsample <= requested && downsample >= best_downsample {
            best = index;
            best_downsample = downsample;
        }
    }
    best
}

// =============================================================================
// Public Types
// =============================================================================

/// Where and how to read one DeepZoom tile from the slide.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DzTileInfo {
    /// Level-0 x coordinate of the region's top-left corner.
    pub x: i64,
    /// Level-0 y coordinate of the region's top-left corner.
    pub y: i64,
    /// Slide level to read from.
    pub slide_level: usize,
    /// Region width in slide-level pixels.
    pub width: u32,
    /// Region height in slide-level pixels.
    pub height: u32,
    /// Final tile width after rasterizer scaling.
    pub scale_width: u32,
    /// Final tile height after rasterizer scaling.
    pub scale_height: u32,
}

/// One fetched DeepZoom tile: the physical pixels plus the scaling target.
///
/// `data` holds `info.width x info.height` RGBA pixels; the rasterizer
/// resizes to `info.scale_width x info.scale_height` when they differ.
#[derive(Debug, Clone)]
pub struct DzTile {
    pub data: Bytes,
    pub info: DzTileInfo,
}

// =============================================================================
// Adapter
// =============================================================================

/// DeepZoom view over an opened [`Slide`].
pub struct DeepZoom {
    slide: Arc<Slide>,
    geometry: Geometry,
}

impl DeepZoom {
    /// Build the adapter, precomputing every level table.
    pub fn new(slide: Arc<Slide>, options: DeepZoomOptions) -> Self {
        let level_dimensions: Vec<(u32, u32)> = (0..slide.level_count())
            .map(|i| slide.level_dimensions(i).expect("level index in range"))
            .collect();
        let downsamples: Vec<f64> = (0..slide.level_count())
            .map(|i| slide.level_downsample(i).expect("level index in range"))
            .collect();

        let bounds = if options.limit_bounds {
            let get = |key: &str| {
                slide
                    .property(key)
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0)
            };
            Some((
                get(keys::BOUNDS_X),
                get(keys::BOUNDS_Y),
                get(keys::BOUNDS_WIDTH),
                get(keys::BOUNDS_HEIGHT),
            ))
        } else {
            None
        };

        let geometry = Geometry::build(&level_dimensions, &downsamples, bounds, &options);
        DeepZoom { slide, geometry }
    }

    /// The slide underneath.
    pub fn slide(&self) -> &Arc<Slide> {
        &self.slide
    }

    /// Number of DeepZoom levels.
    pub fn level_count(&self) -> usize {
        self.geometry.dz_levels
    }

    /// Number of logical planes, from the slide.
    pub fn plane_count(&self) -> u32 {
        self.slide.plane_count()
    }

    /// Pixel dimensions of one DeepZoom level.
    pub fn level_dimensions(&self, dz_level: usize) -> Option<(u64, u64)> {
        self.geometry.z_dimensions.get(dz_level).copied()
    }

    /// Tile-grid dimensions of one DeepZoom level.
    pub fn level_tiles(&self, dz_level: usize) -> Option<(u64, u64)> {
        self.geometry.t_dimensions.get(dz_level).copied()
    }

    /// Total tile count across every level.
    pub fn tile_count(&self) -> u64 {
        self.geometry
            .t_dimensions
            .iter()
            .map(|&(w, h)| w * h)
            .sum()
    }

    /// Microns per pixel from the slide properties, 0 when unknown.
    pub fn micron_per_pixel(&self) -> (f64, f64) {
        let get = |key: &str| {
            self.slide
                .property(key)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        (get(keys::MPP_X), get(keys::MPP_Y))
    }

    /// Resolve one DeepZoom tile to its physical read parameters.
    pub fn tile_info(&self, dz_level: usize, col: u64, row: u64) -> Result<DzTileInfo, SlideError> {
        self.geometry.tile_info(dz_level, col, row)
    }

    /// Fetch one DeepZoom tile: resolve, read the region, hand back pixels
    /// plus the final scaling target.
    pub async fn read_tile(
        &self,
        dz_level: usize,
        col: u64,
        row: u64,
        plane: u32,
    ) -> Result<DzTile, SlideError> {
        let info = self.tile_info(dz_level, col, row)?;
        let data = self
            .slide
            .read_region(
                info.x,
                info.y,
                info.slide_level as u32,
                info.width,
                info.height,
                plane,
            )
            .await?;
        Ok(DzTile { data, info })
    }
}

// =============================================================================
// Tests
// =============================================================================
