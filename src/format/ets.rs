//! SIS/ETS container codec.
//!
//! An `.ets` file opens with a 64-byte SIS header, followed by a 228-byte
//! ETS header at the offset the SIS header declares, followed (at
//! `tile_dir_offset`) by a flat directory of 36-byte tile records, followed
//! by the compressed tile payloads in arbitrary order.
//!
//! Every integer is little-endian and is decoded explicitly, never
//! reinterpreted from memory, so the codec behaves identically on any host.
//! Each `parse` has a symmetric `encode` used by tests and fixture builders.

use bytes::Bytes;
use tracing::debug;

use crate::error::SlideError;
use crate::io::{read_u32_le, read_u64_le, RangeRead};

/// First four container bytes. The SIS magic is three letters and a NUL.
pub const SIS_MAGIC: [u8; 4] = *b"SIS\0";

/// Magic opening the embedded ETS header.
pub const ETS_MAGIC: [u8; 4] = *b"ETS\0";

/// On-disk size of the SIS header.
pub const SIS_HEADER_LEN: usize = 64;

/// On-disk size of the ETS header.
pub const ETS_HEADER_LEN: usize = 228;

/// On-disk size of one tile-directory record.
pub const TILE_ENTRY_LEN: usize = 36;

/// Offset of the background-colour area inside the ETS header.
const BACKGROUND_OFFSET: usize = 108;

/// The background-colour area spans ten u32 slots.
const BACKGROUND_SLOTS: usize = 10;

// =============================================================================
// Field Enums
// =============================================================================

/// Sample representation of stored pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    /// 8-bit unsigned samples.
    UInt8 = 2,
    /// 32-bit signed samples.
    Int32 = 4,
}

impl PixelType {
    pub fn from_u32(value: u32) -> Result<Self, SlideError> {
        match value {
            2 => Ok(PixelType::UInt8),
            4 => Ok(PixelType::Int32),
            _ => Err(SlideError::CorruptHeader {
                field: "pixelType",
                value: value as u64,
            }),
        }
    }

    /// Width in bytes of one stored sample.
    pub fn byte_width(self) -> usize {
        match self {
            PixelType::UInt8 => 1,
            PixelType::Int32 => 4,
        }
    }
}

/// Number of colour components per stored pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Grayscale = 1,
    Rgb = 3,
}

impl ChannelKind {
    pub fn from_u32(value: u32) -> Result<Self, SlideError> {
        match value {
            1 => Ok(ChannelKind::Grayscale),
            3 => Ok(ChannelKind::Rgb),
            _ => Err(SlideError::CorruptHeader {
                field: "channelKind",
                value: value as u64,
            }),
        }
    }

    /// Components per pixel; also the background-vector element count.
    pub fn component_count(self) -> usize {
        self as usize
    }
}

/// Acquisition colourspace of the slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    /// Multi-plane fluorescence data; one logical channel per plane.
    Fluorescence = 1,
    /// Single-plane brightfield data with packed RGB tiles.
    Brightfield = 4,
}

impl Colorspace {
    pub fn from_u32(value: u32) -> Result<Self, SlideError> {
        match value {
            1 => Ok(Colorspace::Fluorescence),
            4 => Ok(Colorspace::Brightfield),
            _ => Err(SlideError::CorruptHeader {
                field: "colorspace",
                value: value as u64,
            }),
        }
    }
}

/// Tile payload compression scheme.
///
/// `Png` and `Bmp` appear in the wild but have no built-in decoder; tiles
/// compressed with them fail with [`SlideError::UnsupportedCodec`] unless
/// the host installs a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    Jpeg = 2,
    Jp2 = 3,
    Png = 8,
    Bmp = 9,
}

impl Compression {
    pub fn from_u32(value: u32) -> Result<Self, SlideError> {
        match value {
            2 => Ok(Compression::Jpeg),
            3 => Ok(Compression::Jp2),
            8 => Ok(Compression::Png),
            9 => Ok(Compression::Bmp),
            _ => Err(SlideError::CorruptHeader {
                field: "compression",
                value: value as u64,
            }),
        }
    }

    /// Numeric wire code.
    pub fn code(self) -> u32 {
        self as u32
    }
}

// =============================================================================
// SIS Header
// =============================================================================

/// The 64-byte SIS wrapper at file offset 0.
///
/// Fields documented as reserved must be zero; the two `misc` words carry
/// unidentified but varying values and are preserved as read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SisHeader {
    pub version: u32,
    /// Dimensionality tag; observed values are 4 and 6.
    pub ndim: u32,
    /// Offset of the ETS header; always 64.
    pub ets_offset: u64,
    /// Byte length of the ETS header; always 228.
    pub ets_len: u32,
    /// Offset of the tile directory.
    pub tile_dir_offset: u64,
    /// Number of records in the tile directory.
    pub tile_count: u32,
    /// Two unidentified words at offsets 48 and 56.
    pub misc: [u32; 2],
}

fn check_field(field: &'static str, value: u64, expected: u64) -> Result<(), SlideError> {
    if value != expected {
        return Err(SlideError::CorruptHeader { field, value });
    }
    Ok(())
}

impl SisHeader {
    /// Parse the SIS header from the first 64 container bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, SlideError> {
        if bytes.len() < SIS_HEADER_LEN {
            return Err(SlideError::CorruptHeader {
                field: "sisHeaderLength",
                value: bytes.len() as u64,
            });
        }

        let magic: [u8; 4] = bytes[0..4].try_into().unwrap();
        if magic != SIS_MAGIC {
            return Err(SlideError::BadMagic {
                context: "SIS header",
                expected: SIS_MAGIC,
                found: magic,
            });
        }

        let header_size = read_u32_le(&bytes[4..]);
        check_field("headerSize", header_size as u64, SIS_HEADER_LEN as u64)?;

        let version = read_u32_le(&bytes[8..]);

        let ndim = read_u32_le(&bytes[12..]);
        if ndim != 4 && ndim != 6 {
            return Err(SlideError::CorruptHeader {
                field: "Ndim",
                value: ndim as u64,
            });
        }

        let ets_offset = read_u64_le(&bytes[16..]);
        check_field("etsOffset", ets_offset, SIS_HEADER_LEN as u64)?;

        let ets_len = read_u32_le(&bytes[24..]);
        check_field("etsBytes", ets_len as u64, ETS_HEADER_LEN as u64)?;

        check_field("reserved@28", read_u32_le(&bytes[28..]) as u64, 0)?;

        let tile_dir_offset = read_u64_le(&bytes[32..]);
        let tile_count = read_u32_le(&bytes[40..]);

        check_field("reserved@44", read_u32_le(&bytes[44..]) as u64, 0)?;
        let misc0 = read_u32_le(&bytes[48..]);
        check_field("reserved@52", read_u32_le(&bytes[52..]) as u64, 0)?;
        let misc1 = read_u32_le(&bytes[56..]);
        check_field("reserved@60", read_u32_le(&bytes[60..]) as u64, 0)?;

        Ok(SisHeader {
            version,
            ndim,
            ets_offset,
            ets_len,
            tile_dir_offset,
            tile_count,
            misc: [misc0, misc1],
        })
    }

    /// Encode back to the 64-byte on-disk form.
    pub fn encode(&self) -> [u8; SIS_HEADER_LEN] {
        let mut out = [0u8; SIS_HEADER_LEN];
        out[0..4].copy_from_slice(&SIS_MAGIC);
        out[4..8].copy_from_slice(&(SIS_HEADER_LEN as u32).to_le_bytes());
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..16].copy_from_slice(&self.ndim.to_le_bytes());
        out[16..24].copy_from_slice(&self.ets_offset.to_le_bytes());
        out[24..28].copy_from_slice(&self.ets_len.to_le_bytes());
        out[32..40].copy_from_slice(&self.tile_dir_offset.to_le_bytes());
        out[40..44].copy_from_slice(&self.tile_count.to_le_bytes());
        out[48..52].copy_from_slice(&self.misc[0].to_le_bytes());
        out[56..60].copy_from_slice(&self.misc[1].to_le_bytes());
        out
    }
}

// =============================================================================
// ETS Header
// =============================================================================

/// The 228-byte ETS header describing tile geometry and encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtsHeader {
    pub version: u32,
    pub pixel_type: PixelType,
    pub channel_kind: ChannelKind,
    pub colorspace: Colorspace,
    pub compression: Compression,
    /// Codec quality knob; typically 90 or 100 for JPEG.
    pub quality: u32,
    /// Tile width in pixels; identical on every level.
    pub tile_width: u32,
    /// Tile height in pixels; identical on every level.
    pub tile_height: u32,
    /// Tile depth; this reader handles single-Z slides only.
    pub tile_depth: u32,
    /// Background colour, one 8-bit value per component.
    pub background_color: Vec<u8>,
    pub component_order: u32,
    pub use_pyramid: u32,
}

impl EtsHeader {
    /// Parse the ETS header from its 228 on-disk bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, SlideError> {
        if bytes.len() < ETS_HEADER_LEN {
            return Err(SlideError::CorruptHeader {
                field: "etsHeaderLength",
                value: bytes.len() as u64,
            });
        }

        let magic: [u8; 4] = bytes[0..4].try_into().unwrap();
        if magic != ETS_MAGIC {
            return Err(SlideError::BadMagic {
                context: "ETS header",
                expected: ETS_MAGIC,
                found: magic,
            });
        }

        let version = read_u32_le(&bytes[4..]);
        let pixel_type = PixelType::from_u32(read_u32_le(&bytes[8..]))?;
        let channel_kind = ChannelKind::from_u32(read_u32_le(&bytes[12..]))?;
        let colorspace = Colorspace::from_u32(read_u32_le(&bytes[16..]))?;
        let compression = Compression::from_u32(read_u32_le(&bytes[20..]))?;
        let quality = read_u32_le(&bytes[24..]);

        let tile_width = read_u32_le(&bytes[28..]);
        let tile_height = read_u32_le(&bytes[32..]);
        if tile_width == 0 {
            return Err(SlideError::CorruptHeader {
                field: "tileWidth",
                value: 0,
            });
        }
        if tile_height == 0 {
            return Err(SlideError::CorruptHeader {
                field: "tileHeight",
                value: 0,
            });
        }

        let tile_depth = read_u32_le(&bytes[36..]);
        check_field("tileDepth", tile_depth as u64, 1)?;

        // 68 bytes at offset 40 are skipped, then the background-colour
        // vector: one element per component, element width set by the pixel
        // type, clamped to 8 bits, inside a ten-slot u32 region.
        let element_width = pixel_type.byte_width();
        let mut background_color = Vec::with_capacity(channel_kind.component_count());
        for i in 0..channel_kind.component_count() {
            let at = BACKGROUND_OFFSET + i * element_width;
            let raw = match pixel_type {
                PixelType::UInt8 => bytes[at] as u32,
                PixelType::Int32 => read_u32_le(&bytes[at..]),
            };
            background_color.push(raw.min(u8::MAX as u32) as u8);
        }

        let after_background = BACKGROUND_OFFSET + BACKGROUND_SLOTS * 4;
        let component_order = read_u32_le(&bytes[after_background..]);
        let use_pyramid = read_u32_le(&bytes[after_background + 4..]);

        Ok(EtsHeader {
            version,
            pixel_type,
            channel_kind,
            colorspace,
            compression,
            quality,
            tile_width,
            tile_height,
            tile_depth,
            background_color,
            component_order,
            use_pyramid,
        })
    }

    /// Encode back to the 228-byte on-disk form.
    pub fn encode(&self) -> [u8; ETS_HEADER_LEN] {
        let mut out = [0u8; ETS_HEADER_LEN];
        out[0..4].copy_from_slice(&ETS_MAGIC);
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&(self.pixel_type as u32).to_le_bytes());
        out[12..16].copy_from_slice(&(self.channel_kind as u32).to_le_bytes());
        out[16..20].copy_from_slice(&(self.colorspace as u32).to_le_bytes());
        out[20..24].copy_from_slice(&self.compression.code().to_le_bytes());
        out[24..28].copy_from_slice(&self.quality.to_le_bytes());
        out[28..32].copy_from_slice(&self.tile_width.to_le_bytes());
        out[32..36].copy_from_slice(&self.tile_height.to_le_bytes());
        out[36..40].copy_from_slice(&self.tile_depth.to_le_bytes());

        let element_width = self.pixel_type.byte_width();
        for (i, &component) in self.background_color.iter().enumerate() {
            let at = BACKGROUND_OFFSET + i * element_width;
            match self.pixel_type {
                PixelType::UInt8 => out[at] = component,
                PixelType::Int32 => {
                    out[at..at + 4].copy_from_slice(&(component as u32).to_le_bytes())
                }
            }
        }

        let after_background = BACKGROUND_OFFSET + BACKGROUND_SLOTS * 4;
        out[after_background..after_background + 4]
            .copy_from_slice(&self.component_order.to_le_bytes());
        out[after_background + 4..after_background + 8]
            .copy_from_slice(&self.use_pyramid.to_le_bytes());
        out
    }
}

// =============================================================================
// Tile Directory
// =============================================================================

/// One 36-byte record of the tile directory. Immutable after load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDirectoryEntry {
    /// Tile column, tile row, channel.
    pub coord: [u32; 3],
    /// Pyramid level the tile belongs to.
    pub level: u32,
    /// Absolute file offset of the compressed payload.
    pub offset: u64,
    /// Compressed payload length.
    pub bytes: u32,
}

impl TileDirectoryEntry {
    /// Parse one record from its 36 on-disk bytes.
    pub fn parse(bytes: &[u8]) -> Self {
        TileDirectoryEntry {
            coord: [
                read_u32_le(&bytes[4..]),
                read_u32_le(&bytes[8..]),
                read_u32_le(&bytes[12..]),
            ],
            level: read_u32_le(&bytes[16..]),
            offset: read_u64_le(&bytes[20..]),
            bytes: read_u32_le(&bytes[28..]),
        }
    }

    /// Encode back to the 36-byte on-disk form.
    pub fn encode(&self) -> [u8; TILE_ENTRY_LEN] {
        let mut out = [0u8; TILE_ENTRY_LEN];
        out[4..8].copy_from_slice(&self.coord[0].to_le_bytes());
        out[8..12].copy_from_slice(&self.coord[1].to_le_bytes());
        out[12..16].copy_from_slice(&self.coord[2].to_le_bytes());
        out[16..20].copy_from_slice(&self.level.to_le_bytes());
        out[20..28].copy_from_slice(&self.offset.to_le_bytes());
        out[28..32].copy_from_slice(&self.bytes.to_le_bytes());
        out
    }
}

/// Parse `tile_count` directory records, validating payload extents against
/// the container length.
pub fn parse_tile_directory(
    bytes: &[u8],
    tile_count: u32,
    file_len: u64,
) -> Result<Vec<TileDirectoryEntry>, SlideError> {
    let needed = tile_count as usize * TILE_ENTRY_LEN;
    if bytes.len() < needed {
        return Err(SlideError::CorruptHeader {
            field: "tileDirectoryLength",
            value: bytes.len() as u64,
        });
    }

    let mut entries = Vec::with_capacity(tile_count as usize);
    for chunk in bytes[..needed].chunks_exact(TILE_ENTRY_LEN) {
        let entry = TileDirectoryEntry::parse(chunk);
        let end = entry.offset.saturating_add(entry.bytes as u64);
        if end > file_len {
            return Err(SlideError::CorruptHeader {
                field: "tilePayloadExtent",
                value: end,
            });
        }
        entries.push(entry);
    }
    Ok(entries)
}

// =============================================================================
// ETS Volume
// =============================================================================

/// A fully loaded `.ets` container: headers, tile directory and the pool of
/// read handles onto the data file.
pub struct EtsVolume {
    pub sis: SisHeader,
    pub header: EtsHeader,
    pub tiles: Vec<TileDirectoryEntry>,
    /// Raw header and directory bytes, retained for the quickhash property.
    pub(crate) raw_prefix: Bytes,
    pub(crate) raw_directory: Bytes,
}

impl EtsVolume {
    /// Read and validate the SIS header, ETS header and tile directory.
    pub async fn open<R: RangeRead + ?Sized>(reader: &R) -> Result<Self, SlideError> {
        let prefix_len = SIS_HEADER_LEN + ETS_HEADER_LEN;
        let raw_prefix = reader.read_exact_at(0, prefix_len).await?;

        let sis = SisHeader::parse(&raw_prefix[..SIS_HEADER_LEN])?;
        let ets_at = sis.ets_offset as usize;
        let header = EtsHeader::parse(&raw_prefix[ets_at..ets_at + ETS_HEADER_LEN])?;

        let dir_len = sis.tile_count as usize * TILE_ENTRY_LEN;
        let raw_directory = reader.read_exact_at(sis.tile_dir_offset, dir_len).await?;
        let tiles = parse_tile_directory(&raw_directory, sis.tile_count, reader.len())?;

        debug!(
            tiles = tiles.len(),
            tile_width = header.tile_width,
            tile_height = header.tile_height,
            compression = ?header.compression,
            colorspace = ?header.colorspace,
            "loaded ETS container"
        );

        Ok(EtsVolume {
            sis,
            header,
            tiles,
            raw_prefix,
            raw_directory,
        })
    }

    /// Locate a directory entry by linear scan on (level, channel, col, row).
    pub fn find_tile(
        &self,
        level: u32,
        channel: u32,
        col: u32,
        row: u32,
    ) -> Option<&TileDirectoryEntry> {
        self.tiles.iter().find(|t| {
            t.level == level && t.coord[2] == channel && t.coord[0] == col && t.coord[1] == row
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
