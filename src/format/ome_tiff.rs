//! OME-TIFF sidecar volume.
//!
//! Structurally parallel to the ETS path, but the pyramid comes from a
//! chain of TIFF directories instead of a tile directory: each directory is
//! one level x channel combination, grouped by level then channel in file
//! order. The OME XML in the first directory's `ImageDescription` supplies
//! the level count (`Image` nodes) and the plane count (`Channel` nodes of
//! the first image).
//!
//! Unlike ETS, the pyramid is not assumed to be exactly 2x: each level's
//! downsample is computed from the observed widths.

use tracing::{debug, warn};

use crate::error::SlideError;
use crate::format::ome::{self, OmeDocument};
use crate::format::tiff::{self, Tag, TiffHeader};
use crate::io::RangeRead;
use crate::pyramid::LevelDescriptor;
use crate::tile::codec::{CodecMode, CodecRegistry};

/// TIFF compression code: uncompressed.
const COMPRESSION_NONE: u16 = 1;

/// TIFF compression code: JPEG.
const COMPRESSION_JPEG: u16 = 7;

/// TIFF compression code: Aperio-style JPEG 2000.
const COMPRESSION_JP2K: u16 = 34712;

// =============================================================================
// Volume Structure
// =============================================================================

/// One level x channel TIFF directory with its tile location tables loaded.
#[derive(Debug, Clone)]
pub struct OmeChannelDirectory {
    pub compression: u16,
    tile_offsets: Vec<u64>,
    tile_byte_counts: Vec<u64>,
}

/// One pyramid level: agreed geometry plus one directory per channel.
#[derive(Debug, Clone)]
pub struct OmeLevel {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tiles_across: u32,
    pub tiles_down: u32,
    pub channels: Vec<OmeChannelDirectory>,
}

/// A fully loaded OME-TIFF sidecar.
#[derive(Debug)]
pub struct OmeTiffVolume {
    pub header: TiffHeader,
    pub ome: OmeDocument,
    pub levels: Vec<OmeLevel>,
    pub plane_count: u32,
    /// Page origin of the first directory in pixels, when its position
    /// tags carry one.
    pub page_origin: (Option<f64>, Option<f64>),
    /// Raw OME XML, retained for the quickhash property.
    pub(crate) raw_xml: String,
}

impl OmeTiffVolume {
    /// Parse the directory chain and OME XML, loading every level's tile
    /// location tables.
    pub async fn open<R: RangeRead + ?Sized>(reader: &R) -> Result<Self, SlideError> {
        let header = tiff::read_header(reader).await?;
        let directories = tiff::read_directories(reader, &header).await?;

        let first = directories.first().ok_or(SlideError::CorruptHeader {
            field: "directoryCount",
            value: 0,
        })?;
        let description_entry =
            first
                .get(Tag::ImageDescription)
                .ok_or(SlideError::MissingMetadata {
                    attribute: "ImageDescription",
                })?;
        let raw_xml = tiff::read_string(reader, &header, description_entry).await?;
        let ome = ome::parse(&raw_xml)?;
        let page_origin = tiff::read_page_origin(reader, &header, first).await?;

        let level_count = ome.images.len();
        if level_count == 0 {
            return Err(SlideError::MissingMetadata { attribute: "Image" });
        }
        let plane_count = ome.images[0].channels.len().max(1);

        let tiled: Vec<_> = directories.iter().filter(|d| d.is_tiled()).collect();
        if tiled.len() != level_count * plane_count {
            return Err(SlideError::InconsistentPyramid {
                message: format!(
                    "{} tiled directories cannot cover {level_count} levels x {plane_count} channels",
                    tiled.len()
                ),
            });
        }

        let mut levels = Vec::with_capacity(level_count);
        for (level_index, group) in tiled.chunks(plane_count).enumerate() {
            let mut level: Option<OmeLevel> = None;

            for (channel_index, &directory) in group.iter().enumerate() {
                let order = header.byte_order;
                let width = required_tag(directory, Tag::ImageWidth, order)?;
                let height = required_tag(directory, Tag::ImageLength, order)?;
                let tile_width = required_tag(directory, Tag::TileWidth, order)?;
                let tile_height = required_tag(directory, Tag::TileLength, order)?;
                if tile_width == 0 || tile_height == 0 {
                    return Err(SlideError::CorruptHeader {
                        field: "TileWidth",
                        value: tile_width as u64,
                    });
                }

                let compression = directory
                    .scalar(Tag::Compression, order)
                    .unwrap_or(COMPRESSION_NONE as u64) as u16;

                let offsets_entry =
                    directory
                        .get(Tag::TileOffsets)
                        .ok_or(SlideError::MissingMetadata {
                            attribute: "TileOffsets",
                        })?;
                let counts_entry =
                    directory
                        .get(Tag::TileByteCounts)
                        .ok_or(SlideError::MissingMetadata {
                            attribute: "TileByteCounts",
                        })?;
                let tile_offsets = tiff::read_u64_array(reader, &header, offsets_entry).await?;
                let tile_byte_counts = tiff::read_u64_array(reader, &header, counts_entry).await?;

                let tiles_across = width.div_ceil(tile_width);
                let tiles_down = height.div_ceil(tile_height);
                let tile_total = tiles_across as usize * tiles_down as usize;
                if tile_offsets.len() < tile_total || tile_byte_counts.len() < tile_total {
                    return Err(SlideError::CorruptHeader {
                        field: "tileLocationTableLength",
                        value: tile_offsets.len().min(tile_byte_counts.len()) as u64,
                    });
                }

                let channel = OmeChannelDirectory {
                    compression,
                    tile_offsets,
                    tile_byte_counts,
                };

                match &mut level {
                    None => {
                        level = Some(OmeLevel {
                            width,
                            height,
                            tile_width,
                            tile_height,
                            tiles_across,
                            tiles_down,
                            channels: vec![channel],
                        });
                    }
                    Some(level) => {
                        // Channels of one level must agree on geometry.
                        if level.width != width
                            || level.height != height
                            || level.tile_width != tile_width
                            || level.tile_height != tile_height
                        {
                            return Err(SlideError::InconsistentPyramid {
                                message: format!(
                                    "level {level_index} channel {channel_index} is \
                                     {width}x{height} ({tile_width}x{tile_height} tiles), \
                                     other channels are {}x{} ({}x{} tiles)",
                                    level.width, level.height, level.tile_width, level.tile_height
                                ),
                            });
                        }
                        level.channels.push(channel);
                    }
                }
            }

            let level = level.expect("chunk groups are never empty");
            let declared = &ome.images[level_index];
            if declared.size_x != level.width || declared.size_y != level.height {
                warn!(
                    level = level_index,
                    tiff_width = level.width,
                    tiff_height = level.height,
                    ome_width = declared.size_x,
                    ome_height = declared.size_y,
                    "OME XML and TIFF tags disagree on level size; trusting TIFF tags"
                );
            }
            levels.push(level);
        }

        debug!(
            levels = levels.len(),
            planes = plane_count,
            width = levels[0].width,
            height = levels[0].height,
            "loaded OME-TIFF sidecar"
        );

        Ok(OmeTiffVolume {
            header,
            ome,
            levels,
            plane_count: plane_count as u32,
            page_origin,
            raw_xml,
        })
    }

    /// Downsample of a level, from observed widths.
    pub fn downsample(&self, level: usize) -> f64 {
        self.levels[0].width as f64 / self.levels[level].width as f64
    }

    /// File extent of a tile payload: `(offset, length, compression)`.
    pub fn tile_location(&self, level: u32, plane: u32, col: u32, row: u32) -> Option<(u64, u64, u16)> {
        let level = self.levels.get(level as usize)?;
        let channel = level.channels.get(plane as usize)?;
        if col >= level.tiles_across || row >= level.tiles_down {
            return None;
        }
        let index = (row * level.tiles_across + col) as usize;
        Some((
            channel.tile_offsets[index],
            channel.tile_byte_counts[index],
            channel.compression,
        ))
    }

    /// Level table in the shape the slide facade serves.
    pub fn level_descriptors(&self) -> Vec<LevelDescriptor> {
        self.levels
            .iter()
            .enumerate()
            .map(|(i, level)| LevelDescriptor {
                width: level.width,
                height: level.height,
                tile_width: level.tile_width,
                tile_height: level.tile_height,
                tiles_across: level.tiles_across,
                tiles_down: level.tiles_down,
                downsample: self.downsample(i),
                compression: level.channels[0].compression as u32,
                plane_count: self.plane_count,
            })
            .collect()
    }
}

fn required_tag(
    directory: &tiff::Directory,
    tag: Tag,
    order: tiff::ByteOrder,
) -> Result<u32, SlideError> {
    directory
        .scalar(tag, order)
        .map(|v| v as u32)
        .ok_or(SlideError::MissingMetadata {
            attribute: match tag {
                Tag::ImageWidth => "ImageWidth",
                Tag::ImageLength => "ImageLength",
                Tag::TileWidth => "TileWidth",
                Tag::TileLength => "TileLength",
                _ => "tag",
            },
        })
}

// =============================================================================
// Tile Decoding
// =============================================================================

/// Decode a TIFF tile payload into an RGBA destination.
///
/// JPEG delegates to the installed codec collaborator; uncompressed
/// payloads are expanded from packed RGB or copied straight through when
/// already RGBA.
pub fn decode_tiff_tile(
    input: &[u8],
    compression: u16,
    dest: &mut [u8],
    width: u32,
    height: u32,
    mode: CodecMode,
    codecs: &CodecRegistry,
) -> Result<(), SlideError> {
    match compression {
        COMPRESSION_JPEG => codecs
            .get(crate::format::ets::Compression::Jpeg)?
            .decode(input, dest, width, height, mode),
        COMPRESSION_JP2K => codecs
            .get(crate::format::ets::Compression::Jp2)?
            .decode(input, dest, width, height, mode),
        COMPRESSION_NONE => {
            let pixels = width as usize * height as usize;
            if input.len() == pixels * 4 {
                dest.copy_from_slice(input);
                Ok(())
            } else if input.len() == pixels * 3 {
                for (rgb, out) in input.chunks_exact(3).zip(dest.chunks_exact_mut(4)) {
                    out[0] = rgb[0];
                    out[1] = rgb[1];
                    out[2] = rgb[2];
                    out[3] = 0xFF;
                }
                Ok(())
            } else if input.len() == pixels {
                for (&sample, out) in input.iter().zip(dest.chunks_exact_mut(4)) {
                    out[0] = sample;
                    out[1] = sample;
                    out[2] = sample;
                    out[3] = 0xFF;
                }
                Ok(())
            } else {
                Err(SlideError::DecodeFailed {
                    message: format!(
                        "uncompressed tile holds {} bytes for {width}x{height} pixels",
                        input.len()
                    ),
                })
            }
        }
        other => Err(SlideError::UnsupportedCodec {
            compression: other as u32,
        }),
    }
}

// =============================================================================
// Tests
// =============================================================================
