//! Pyramid inference from the flat tile directory.
//!
//! ETS containers carry no authoritative table of levels or dimensions: the
//! only source of truth is the unordered tile directory itself. Observed
//! vendor files adhere to strict 2x pyramids, so the level count, the plane
//! count and every level's pixel dimensions are derived here from the
//! maxima seen while scanning the directory once.

use serde::Serialize;
use tracing::debug;

use crate::error::SlideError;
use crate::format::ets::{EtsHeader, TileDirectoryEntry};

// =============================================================================
// Level Descriptor
// =============================================================================

/// Immutable description of one pyramid level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LevelDescriptor {
    /// Level image width in pixels.
    pub width: u32,

    /// Level image height in pixels.
    pub height: u32,

    /// Tile width in pixels; identical across levels.
    pub tile_width: u32,

    /// Tile height in pixels; identical across levels.
    pub tile_height: u32,

    /// Number of tile columns covering the level.
    pub tiles_across: u32,

    /// Number of tile rows covering the level.
    pub tiles_down: u32,

    /// Downsample factor relative to level 0.
    pub downsample: f64,

    /// Wire code of the tile compression scheme.
    pub compression: u32,

    /// Number of logical planes addressable at this level.
    pub plane_count: u32,
}

impl LevelDescriptor {
    /// Number of tiles covering the level.
    pub fn tile_count(&self) -> u64 {
        self.tiles_across as u64 * self.tiles_down as u64
    }
}

/// A fully inferred pyramid.
#[derive(Debug, Clone)]
pub struct Pyramid {
    pub levels: Vec<LevelDescriptor>,
    pub plane_count: u32,
}

// =============================================================================
// Inference
// =============================================================================

/// Transient accumulator for one pass over the tile directory.
///
/// Tracks the maximum column and row coordinate per level and the maximum
/// channel index overall; discarded once [`PyramidInference::build`] runs.
#[derive(Debug, Default)]
pub struct PyramidInference {
    max_col: Vec<u32>,
    max_row: Vec<u32>,
    max_channel: u32,
    observed: usize,
}

impl PyramidInference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one directory entry into the running maxima.
    pub fn observe(&mut self, entry: &TileDirectoryEntry) {
        let level = entry.level as usize;
        if self.max_col.len() <= level {
            self.max_col.resize(level + 1, 0);
            self.max_row.resize(level + 1, 0);
        }
        self.max_col[level] = self.max_col[level].max(entry.coord[0]);
        self.max_row[level] = self.max_row[level].max(entry.coord[1]);
        self.max_channel = self.max_channel.max(entry.coord[2]);
        self.observed += 1;
    }

    /// Derive the level table from the accumulated maxima.
    ///
    /// Level 0 spans `tile_width x (max_col + 1)` pixels (likewise for
    /// rows); each deeper level halves the previous one with ceiling
    /// rounding, and the downsample of level L is `2^L`.
    pub fn build(mut self, header: &EtsHeader) -> Result<Pyramid, SlideError> {
        if self.observed == 0 {
            return Err(SlideError::InconsistentPyramid {
                message: "tile directory is empty".to_string(),
            });
        }

        let plane_count = self.max_channel + 1;

        // The highest-resolution level must own the largest tile grid, so
        // the per-level maxima are ordered descending before sizing.
        // TODO: the column and row maxima sort independently, which on a
        // malformed directory can pair one level's columns with another
        // level's rows; compare against a joint sort keyed by tile area
        // over a corpus of vendor slides.
        self.max_col.sort_unstable_by(|a, b| b.cmp(a));
        self.max_row.sort_unstable_by(|a, b| b.cmp(a));

        let level_count = self.max_col.len();
        let mut levels = Vec::with_capacity(level_count);
        let mut width = header
            .tile_width
            .checked_mul(self.max_col[0] + 1)
            .ok_or_else(|| SlideError::InconsistentPyramid {
                message: format!("level 0 width overflows: {} tile columns", self.max_col[0] + 1),
            })?;
        let mut height = header
            .tile_height
            .checked_mul(self.max_row[0] + 1)
            .ok_or_else(|| SlideError::InconsistentPyramid {
                message: format!("level 0 height overflows: {} tile rows", self.max_row[0] + 1),
            })?;

        for level in 0..level_count {
            if level > 0 {
                width = width.div_ceil(2);
                height = height.div_ceil(2);
            }
            levels.push(LevelDescriptor {
                width,
                height,
                tile_width: header.tile_width,
                tile_height: header.tile_height,
                tiles_across: width.div_ceil(header.tile_width),
                tiles_down: height.div_ceil(header.tile_height),
                downsample: (1u64 << level) as f64,
                compression: header.compression.code(),
                plane_count,
            });
        }

        debug!(
            levels = levels.len(),
            planes = plane_count,
            width = levels[0].width,
            height = levels[0].height,
            "inferred pyramid"
        );

        Ok(Pyramid {
            levels,
            plane_count,
        })
    }

    /// Sorted per-level column maxima, available after [`Self::build`] ran
    /// the sort. Used by the validation pass.
    fn sorted_maxima(&self) -> (&[u32], &[u32]) {
        (&self.max_col, &self.max_row)
    }
}

/// Infer the pyramid from a tile directory, then re-walk the directory to
/// reject entries that contradict the inferred shape.
pub fn infer(tiles: &[TileDirectoryEntry], header: &EtsHeader) -> Result<Pyramid, SlideError> {
    let mut inference = PyramidInference::new();
    for tile in tiles {
        inference.observe(tile);
    }

    // Hold a copy of the maxima for validation; build consumes the rest.
    let mut shadow = PyramidInference {
        max_col: inference.max_col.clone(),
        max_row: inference.max_row.clone(),
        max_channel: inference.max_channel,
        observed: inference.observed,
    };
    let pyramid = inference.build(header)?;
    shadow.max_col.sort_unstable_by(|a, b| b.cmp(a));
    shadow.max_row.sort_unstable_by(|a, b| b.cmp(a));
    let (max_col, max_row) = shadow.sorted_maxima();

    let level_count = pyramid.levels.len() as u32;
    for tile in tiles {
        if tile.level >= level_count {
            return Err(SlideError::InconsistentPyramid {
                message: format!(
                    "tile at ({}, {}) names level {} of {}",
                    tile.coord[0], tile.coord[1], tile.level, level_count
                ),
            });
        }
        let level = tile.level as usize;
        if tile.coord[0] > max_col[level] || tile.coord[1] > max_row[level] {
            return Err(SlideError::InconsistentPyramid {
                message: format!(
                    "tile at ({}, {}) exceeds the level-{} grid ({}, {})",
                    tile.coord[0], tile.coord[1], tile.level, max_col[level], max_row[level]
                ),
            });
        }
    }

    Ok(pyramid)
}

// =============================================================================
// Tests
// =============================================================================
