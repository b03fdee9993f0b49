//! Tile retrieval: decoded-tile cache, codec collaborators and the
//! single-flight store.

pub mod cache;
pub mod codec;
pub mod store;

pub use cache::{PinnedTile, TileCache, TileEntry, TileKey};
pub use codec::{CodecMode, CodecRegistry, JpegCodec, TileCodec};
pub use store::{TileSource, TileStore};
