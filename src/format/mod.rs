//! Container formats: discovery, the SIS/ETS codec, the TIFF walker and the
//! OME structures built on it.

pub mod detect;
pub mod ets;
pub mod ome;
pub mod ome_tiff;
pub mod tiff;

pub use detect::{discover, ContainerKind, DiscoveredContainer, VsiDescriptor};
pub use ets::{
    ChannelKind, Colorspace, Compression, EtsHeader, EtsVolume, PixelType, SisHeader,
    TileDirectoryEntry,
};
pub use ome::{OmeChannel, OmeDocument, OmeImage};
pub use ome_tiff::OmeTiffVolume;
