//! Fixture builders for the integration tests.
//!
//! Everything here goes through the crate's public encoders, so the bytes
//! written to disk are exactly what the parsers are specified to read.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vsislide::format::ets::{
    ChannelKind, Colorspace, Compression, EtsHeader, PixelType, SisHeader, TileDirectoryEntry,
    ETS_HEADER_LEN, SIS_HEADER_LEN,
};
use vsislide::tile::{CodecMode, JpegCodec, TileCodec};
use vsislide::SlideError;

// =============================================================================
// ETS Archive Builder
// =============================================================================

/// One tile to place in a generated archive.
pub struct PlannedTile {
    pub level: u32,
    pub col: u32,
    pub row: u32,
    pub channel: u32,
    /// Solid fill of the JPEG payload.
    pub color: [u8; 3],
}

/// Builds a complete `.ets` archive with JPEG tile payloads.
pub struct EtsBuilder {
    tile_width: u32,
    tile_height: u32,
    channel_kind: ChannelKind,
    colorspace: Colorspace,
    background: Vec<u8>,
    tiles: Vec<PlannedTile>,
}

impl EtsBuilder {
    /// Brightfield archive with square tiles of the given edge.
    pub fn brightfield(tile_edge: u32) -> Self {
        Self {
            tile_width: tile_edge,
            tile_height: tile_edge,
            channel_kind: ChannelKind::Rgb,
            colorspace: Colorspace::Brightfield,
            background: vec![255, 255, 255],
            tiles: Vec::new(),
        }
    }

    /// Fluorescence archive (grayscale payloads, multiple channels).
    pub fn fluorescence(tile_edge: u32) -> Self {
        Self {
            tile_width: tile_edge,
            tile_height: tile_edge,
            channel_kind: ChannelKind::Grayscale,
            colorspace: Colorspace::Fluorescence,
            background: vec![0],
            tiles: Vec::new(),
        }
    }

    pub fn tile(mut self, level: u32, col: u32, row: u32, color: [u8; 3]) -> Self {
        self.tiles.push(PlannedTile {
            level,
            col,
            row,
            channel: 0,
            color,
        });
        self
    }

    pub fn plane_tile(mut self, level: u32, col: u32, row: u32, channel: u32, gray: u8) -> Self {
        self.tiles.push(PlannedTile {
            level,
            col,
            row,
            channel,
            color: [gray, gray, gray],
        });
        self
    }

    /// Assemble the archive bytes: SIS + ETS headers, payloads, directory.
    pub fn build(&self) -> Vec<u8> {
        let header_len = SIS_HEADER_LEN + ETS_HEADER_LEN;
        let mut payloads = Vec::new();
        let mut entries = Vec::new();
        let mut cursor = header_len as u64;

        for tile in &self.tiles {
            let payload = match self.colorspace {
                Colorspace::Brightfield => {
                    encode_jpeg_rgb(self.tile_width, self.tile_height, tile.color)
                }
                Colorspace::Fluorescence => {
                    encode_jpeg_gray(self.tile_width, self.tile_height, tile.color[0])
                }
            };
            entries.push(TileDirectoryEntry {
                coord: [tile.col, tile.row, tile.channel],
                level: tile.level,
                offset: cursor,
                bytes: payload.len() as u32,
            });
            cursor += payload.len() as u64;
            payloads.push(payload);
        }

        let sis = SisHeader {
            version: 2,
            ndim: 4,
            ets_offset: SIS_HEADER_LEN as u64,
            ets_len: ETS_HEADER_LEN as u32,
            tile_dir_offset: cursor,
            tile_count: entries.len() as u32,
            misc: [0, 0],
        };
        let ets = EtsHeader {
            version: 0x30001,
            pixel_type: PixelType::UInt8,
            channel_kind: self.channel_kind,
            colorspace: self.colorspace,
            compression: Compression::Jpeg,
            quality: 90,
            tile_width: self.tile_width,
            tile_height: self.tile_height,
            tile_depth: 1,
            background_color: self.background.clone(),
            component_order: 0,
            use_pyramid: 1,
        };

        let mut out = Vec::new();
        out.extend_from_slice(&sis.encode());
        out.extend_from_slice(&ets.encode());
        for payload in &payloads {
            out.extend_from_slice(payload);
        }
        for entry in &entries {
            out.extend_from_slice(&entry.encode());
        }
        out
    }

    /// Write the archive to `dir/frame_t.ets` and return its path.
    pub fn write_to(&self, dir: &Path) -> PathBuf {
        let path = dir.join("frame_t.ets");
        write_file(&path, &self.build());
        path
    }
}

pub fn encode_jpeg_rgb(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut out = std::io::Cursor::new(Vec::new());
    image.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

pub fn encode_jpeg_gray(width: u32, height: u32, gray: u8) -> Vec<u8> {
    let image = image::GrayImage::from_pixel(width, height, image::Luma([gray]));
    let mut out = std::io::Cursor::new(Vec::new());
    image.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

// =============================================================================
// VSI Tree Builder
// =============================================================================

/// What a generated `.vsi` descriptor should carry.
#[derive(Debug, Clone, Default)]
pub struct VsiDescriptorSpec {
    /// Microns per pixel, published through centimetre resolution tags.
    pub mpp: Option<f64>,
    /// Scan origin in pixels, published through page-position tags.
    pub origin: Option<(u32, u32)>,
    /// Declared scan region, published through an embedded OME description.
    pub scan_size: Option<(u32, u32)>,
}

/// Lay out `<dir>/<name>.vsi` plus `_<name>_/stack10000/frame_t.ets` and
/// return the `.vsi` path.
pub fn write_vsi_tree(dir: &Path, name: &str, ets: &EtsBuilder, mpp: Option<f64>) -> PathBuf {
    write_vsi_tree_with(
        dir,
        name,
        ets,
        &VsiDescriptorSpec {
            mpp,
            ..VsiDescriptorSpec::default()
        },
    )
}

/// `write_vsi_tree` with full control over the descriptor contents.
pub fn write_vsi_tree_with(
    dir: &Path,
    name: &str,
    ets: &EtsBuilder,
    spec: &VsiDescriptorSpec,
) -> PathBuf {
    let vsi = dir.join(format!("{name}.vsi"));
    write_file(&vsi, &build_vsi_descriptor_with(spec));

    let stack = dir.join(format!("_{name}_")).join("stack10000");
    std::fs::create_dir_all(&stack).unwrap();
    ets.write_to(&stack);
    vsi
}

/// A minimal `.vsi` descriptor carrying only resolution tags (or nothing).
pub fn build_vsi_descriptor(mpp: Option<f64>) -> Vec<u8> {
    build_vsi_descriptor_with(&VsiDescriptorSpec {
        mpp,
        ..VsiDescriptorSpec::default()
    })
}

/// Assemble a `.vsi` descriptor: a classic little-endian TIFF whose first
/// directory carries the tags the spec asks for, in ascending tag order.
pub fn build_vsi_descriptor_with(spec: &VsiDescriptorSpec) -> Vec<u8> {
    enum Value {
        Inline(u32),
        Blob(Vec<u8>),
    }
    struct PlannedEntry {
        tag: u16,
        field_type: u16,
        count: u32,
        value: Value,
    }

    let rational = |numerator: u32, denominator: u32| {
        let mut blob = Vec::new();
        blob.extend_from_slice(&numerator.to_le_bytes());
        blob.extend_from_slice(&denominator.to_le_bytes());
        blob
    };

    // Resolution in pixels per unit: centimetres when an mpp is requested,
    // a unitless 1 px/unit otherwise (positions still convert).
    let needs_resolution = spec.mpp.is_some() || spec.origin.is_some();
    let resolution = spec
        .mpp
        .map(|mpp| (10_000.0 / mpp).round() as u32)
        .unwrap_or(1);
    let resolution_unit: u32 = if spec.mpp.is_some() { 3 } else { 1 };

    let mut entries = Vec::new();
    if let Some((width, height)) = spec.scan_size {
        let xml = format!(
            "<OME xmlns=\"http://www.openmicroscopy.org/Schemas/OME/2016-06\">\
             <Image Name=\"scan\"><Pixels SizeX=\"{width}\" SizeY=\"{height}\"/>\
             </Image></OME>"
        );
        let mut blob = xml.into_bytes();
        blob.push(0);
        entries.push(PlannedEntry {
            tag: 270, // ImageDescription
            field_type: 2,
            count: blob.len() as u32,
            value: Value::Blob(blob),
        });
    }
    if needs_resolution {
        for tag in [282u16, 283] {
            entries.push(PlannedEntry {
                tag,
                field_type: 5,
                count: 1,
                value: Value::Blob(rational(resolution, 1)),
            });
        }
    }
    if let Some((x, y)) = spec.origin {
        // Position = origin_px / resolution, so position x resolution
        // lands back on the pixel origin.
        for (tag, origin_px) in [(286u16, x), (287, y)] {
            entries.push(PlannedEntry {
                tag,
                field_type: 5,
                count: 1,
                value: Value::Blob(rational(origin_px, resolution)),
            });
        }
    }
    if needs_resolution {
        entries.push(PlannedEntry {
            tag: 296, // ResolutionUnit
            field_type: 3,
            count: 1,
            value: Value::Inline(resolution_unit),
        });
    }
    entries.sort_by_key(|e| e.tag);

    let mut out = Vec::new();
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&8u32.to_le_bytes());

    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    let mut blob_at = 8 + 2 + entries.len() * 12 + 4;
    for entry in &entries {
        out.extend_from_slice(&entry.tag.to_le_bytes());
        out.extend_from_slice(&entry.field_type.to_le_bytes());
        out.extend_from_slice(&entry.count.to_le_bytes());
        match &entry.value {
            Value::Inline(value) => out.extend_from_slice(&value.to_le_bytes()),
            Value::Blob(blob) => {
                out.extend_from_slice(&(blob_at as u32).to_le_bytes());
                blob_at += blob.len();
            }
        }
    }
    out.extend_from_slice(&0u32.to_le_bytes());

    for entry in &entries {
        if let Value::Blob(blob) = &entry.value {
            out.extend_from_slice(blob);
        }
    }
    out
}

// =============================================================================
// OME-TIFF Builder
// =============================================================================

/// Assemble an Olympus OME-TIFF: one tiled directory per level x channel,
/// level-major, uncompressed 8-bit grayscale tiles. Each tile payload is
/// filled with `0x10 * (level + 1) + plane`.
pub fn build_ome_tiff(level_sizes: &[(u32, u32)], planes: usize, tile_edge: u32) -> Vec<u8> {
    build_ome_tiff_with_xml(level_sizes, &build_ome_xml(level_sizes, planes), planes, tile_edge)
}

/// `build_ome_tiff` with a caller-supplied OME document, so the XML can
/// declare geometry that differs from the TIFF directories.
pub fn build_ome_tiff_with_xml(
    level_sizes: &[(u32, u32)],
    xml: &str,
    planes: usize,
    tile_edge: u32,
) -> Vec<u8> {
    let xml_bytes = xml.as_bytes();

    let mut out = Vec::new();
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    let first_dir_slot = out.len();
    out.extend_from_slice(&0u32.to_le_bytes());

    let xml_offset = out.len() as u32;
    out.extend_from_slice(xml_bytes);
    out.push(0);

    struct DirPlan {
        width: u32,
        height: u32,
        offsets: Vec<u32>,
        counts: Vec<u32>,
    }
    let mut plans = Vec::new();
    for (level, &(width, height)) in level_sizes.iter().enumerate() {
        for plane in 0..planes {
            let across = width.div_ceil(tile_edge);
            let down = height.div_ceil(tile_edge);
            let mut offsets = Vec::new();
            let mut counts = Vec::new();
            for _ in 0..(across * down) {
                let payload =
                    vec![(0x10 * (level + 1) + plane) as u8; (tile_edge * tile_edge) as usize];
                offsets.push(out.len() as u32);
                counts.push(payload.len() as u32);
                out.extend_from_slice(&payload);
            }
            plans.push(DirPlan {
                width,
                height,
                offsets,
                counts,
            });
        }
    }

    let entry = |tag: u16, field_type: u16, count: u32, value: u32| {
        let mut e = Vec::new();
        e.extend_from_slice(&tag.to_le_bytes());
        e.extend_from_slice(&field_type.to_le_bytes());
        e.extend_from_slice(&count.to_le_bytes());
        e.extend_from_slice(&value.to_le_bytes());
        e
    };

    let mut pending_link = first_dir_slot;
    for (i, plan) in plans.iter().enumerate() {
        let offsets_at = out.len() as u32;
        for v in &plan.offsets {
            out.extend_from_slice(&v.to_le_bytes());
        }
        let counts_at = out.len() as u32;
        for v in &plan.counts {
            out.extend_from_slice(&v.to_le_bytes());
        }

        let dir_at = out.len() as u32;
        out[pending_link..pending_link + 4].copy_from_slice(&dir_at.to_le_bytes());

        let include_description = i == 0;
        let entry_count: u16 = if include_description { 8 } else { 7 };
        out.extend_from_slice(&entry_count.to_le_bytes());
        out.extend(entry(256, 4, 1, plan.width)); // ImageWidth
        out.extend(entry(257, 4, 1, plan.height)); // ImageLength
        out.extend(entry(259, 3, 1, 1)); // Compression = none
        if include_description {
            out.extend(entry(270, 2, xml_bytes.len() as u32 + 1, xml_offset));
        }
        out.extend(entry(322, 3, 1, tile_edge)); // TileWidth
        out.extend(entry(323, 3, 1, tile_edge)); // TileLength
        if plan.offsets.len() == 1 {
            out.extend(entry(324, 4, 1, plan.offsets[0]));
            out.extend(entry(325, 4, 1, plan.counts[0]));
        } else {
            out.extend(entry(324, 4, plan.offsets.len() as u32, offsets_at));
            out.extend(entry(325, 4, plan.counts.len() as u32, counts_at));
        }

        pending_link = out.len();
        out.extend_from_slice(&0u32.to_le_bytes());
    }

    out
}

pub fn build_ome_xml(level_sizes: &[(u32, u32)], planes: usize) -> String {
    let mut xml = String::from(
        "<OME xmlns=\"http://www.openmicroscopy.org/Schemas/OME/2016-06\">\
         <Experimenter UserName=\"olympus\"/>\
         <Instrument><Microscope Manufacturer=\"Olympus\" Model=\"VS200\"/>\
         <Objective NominalMagnification=\"20.0\"/></Instrument>",
    );
    for (i, &(w, h)) in level_sizes.iter().enumerate() {
        xml.push_str(&format!(
            "<Image ID=\"Image:{i}\" Name=\"level{i}\">\
             <Pixels SizeX=\"{w}\" SizeY=\"{h}\" PhysicalSizeX=\"0.5\" PhysicalSizeY=\"0.5\">"
        ));
        for c in 0..planes {
            xml.push_str(&format!("<Channel ID=\"Channel:{i}:{c}\" Name=\"ch{c}\"/>"));
        }
        xml.push_str("</Pixels></Image>");
    }
    xml.push_str("</OME>");
    xml
}

// =============================================================================
// Counting Codec
// =============================================================================

/// JPEG codec that counts its decode invocations.
pub struct CountingJpeg {
    inner: JpegCodec,
    decodes: Arc<AtomicUsize>,
}

impl CountingJpeg {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let decodes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner: JpegCodec,
                decodes: decodes.clone(),
            },
            decodes,
        )
    }
}

impl TileCodec for CountingJpeg {
    fn decode(
        &self,
        input: &[u8],
        dest: &mut [u8],
        width: u32,
        height: u32,
        mode: CodecMode,
    ) -> Result<(), SlideError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(input, dest, width, height, mode)
    }
}

// =============================================================================
// Small Helpers
// =============================================================================

/// Route tracing output through the test harness; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn write_file(path: &Path, contents: &[u8]) {
    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(contents).unwrap();
}

/// Average RGB of a decoded RGBA buffer; JPEG fixtures are solid fills, so
/// comparing averages within a small tolerance identifies the tile.
pub fn average_rgb(rgba: &[u8]) -> [u8; 3] {
    let mut sums = [0u64; 3];
    let pixels = (rgba.len() / 4) as u64;
    for pixel in rgba.chunks_exact(4) {
        sums[0] += pixel[0] as u64;
        sums[1] += pixel[1] as u64;
        sums[2] += pixel[2] as u64;
    }
    [
        (sums[0] / pixels) as u8,
        (sums[1] / pixels) as u8,
        (sums[2] / pixels) as u8,
    ]
}

pub fn close_to(actual: [u8; 3], expected: [u8; 3]) -> bool {
    actual
        .iter()
        .zip(expected.iter())
        .all(|(a, e)| a.abs_diff(*e) < 12)
}
