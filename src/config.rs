//! Options for opening slides and DeepZoom adapters.
//!
//! The crate is library-only: there is no CLI and no environment lookup.
//! Hosts construct these structs (or take the defaults) and hand them to
//! [`crate::Slide::open_with`] / [`crate::DeepZoom::new`].

// =============================================================================
// Default Values
// =============================================================================

/// Default decoded-tile cache budget: 128MB.
///
/// A 512x512 RGBA tile is 1MB, so the default holds on the order of a
/// hundred decoded tiles.
pub const DEFAULT_CACHE_CAPACITY: usize = 128 * 1024 * 1024;

/// Default maximum number of pooled file handles per container file.
pub const DEFAULT_MAX_FILE_HANDLES: usize = 8;

/// Default DeepZoom tile edge in pixels.
pub const DEFAULT_DEEPZOOM_TILE_SIZE: u32 = 254;

/// Default DeepZoom overlap in pixels added to each interior tile edge.
pub const DEFAULT_DEEPZOOM_OVERLAP: u32 = 1;

// =============================================================================
// Slide Options
// =============================================================================

/// Tunables applied when opening a [`crate::Slide`].
#[derive(Debug, Clone)]
pub struct SlideOptions {
    /// Byte budget for the decoded-tile cache.
    ///
    /// The budget is soft: pinned tiles are never evicted, so a burst of
    /// outstanding pins can push the cache past this value until the pins
    /// are released.
    pub cache_capacity: usize,

    /// Maximum number of concurrently checked-out file handles for the
    /// container's data file. Exhaustion blocks the requesting task until a
    /// handle is returned.
    pub max_file_handles: usize,
}

impl Default for SlideOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_file_handles: DEFAULT_MAX_FILE_HANDLES,
        }
    }
}

// =============================================================================
// DeepZoom Options
// =============================================================================

/// Parameters of a DeepZoom pyramid laid over a slide.
#[derive(Debug, Clone)]
pub struct DeepZoomOptions {
    /// Tile edge in pixels, excluding overlap.
    pub tile_size: u32,

    /// Extra pixels added to each interior edge of a tile.
    pub overlap: u32,

    /// Restrict the pyramid to the non-empty slide region described by the
    /// `bounds-*` properties, when the slide carries them.
    pub limit_bounds: bool,
}

impl Default for DeepZoomOptions {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_DEEPZOOM_TILE_SIZE,
            overlap: DEFAULT_DEEPZOOM_OVERLAP,
            limit_bounds: false,
        }
    }
}
