//! Minimal TIFF/BigTIFF directory walker.
//!
//! The OME-TIFF sidecar and the `.vsi` descriptor are both TIFFs, but this
//! crate needs only a narrow slice of the format: the header, the directory
//! chain, and a dozen tags (geometry, tile locations, description,
//! resolution). This walker reads exactly that through the [`RangeRead`]
//! seam, honouring the byte order the file declares.

use bytes::Bytes;

use crate::error::SlideError;
use crate::io::{
    read_u16_be, read_u16_le, read_u32_be, read_u32_le, read_u64_be, read_u64_le, RangeRead,
};

/// Bytes needed to classify a TIFF or BigTIFF header.
pub const TIFF_PROBE_LEN: usize = 16;

/// Upper bound on directories in one file; a chain longer than this is
/// taken to be a cycle.
const MAX_DIRECTORIES: usize = 4096;

// =============================================================================
// Byte Order
// =============================================================================

/// Byte order declared in the first two bytes of a TIFF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// "II" — Intel order.
    Little,
    /// "MM" — Motorola order.
    Big,
}

impl ByteOrder {
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        match self {
            ByteOrder::Little => read_u16_le(bytes),
            ByteOrder::Big => read_u16_be(bytes),
        }
    }

    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        match self {
            ByteOrder::Little => read_u32_le(bytes),
            ByteOrder::Big => read_u32_be(bytes),
        }
    }

    #[inline]
    pub fn read_u64(self, bytes: &[u8]) -> u64 {
        match self {
            ByteOrder::Little => read_u64_le(bytes),
            ByteOrder::Big => read_u64_be(bytes),
        }
    }
}

// =============================================================================
// Tags and Field Types
// =============================================================================

/// The tags this reader consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Tag {
    SubFileType = 254,
    ImageWidth = 256,
    ImageLength = 257,
    Compression = 259,
    ImageDescription = 270,
    XResolution = 282,
    YResolution = 283,
    XPosition = 286,
    YPosition = 287,
    ResolutionUnit = 296,
    TileWidth = 322,
    TileLength = 323,
    TileOffsets = 324,
    TileByteCounts = 325,
}

impl Tag {
    pub fn id(self) -> u16 {
        self as u16
    }
}

/// TIFF field types that can back the tags above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Byte,
    Ascii,
    Short,
    Long,
    Rational,
    Long8,
}

impl FieldType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(FieldType::Byte),
            2 => Some(FieldType::Ascii),
            3 => Some(FieldType::Short),
            4 => Some(FieldType::Long),
            5 => Some(FieldType::Rational),
            16 => Some(FieldType::Long8),
            _ => None,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            FieldType::Byte | FieldType::Ascii => 1,
            FieldType::Short => 2,
            FieldType::Long => 4,
            FieldType::Rational | FieldType::Long8 => 8,
        }
    }
}

// =============================================================================
// Header
// =============================================================================

/// Parsed TIFF or BigTIFF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    pub byte_order: ByteOrder,
    pub big_tiff: bool,
    pub first_dir_offset: u64,
}

impl TiffHeader {
    /// Parse the header from the first file bytes.
    pub fn parse(bytes: &[u8], file_len: u64) -> Result<Self, SlideError> {
        if bytes.len() < 8 {
            return Err(SlideError::CorruptHeader {
                field: "tiffHeaderLength",
                value: bytes.len() as u64,
            });
        }

        let byte_order = match &bytes[0..2] {
            b"II" => ByteOrder::Little,
            b"MM" => ByteOrder::Big,
            _ => {
                return Err(SlideError::BadMagic {
                    context: "TIFF header",
                    expected: *b"II*\0",
                    found: [bytes[0], bytes[1], bytes[2], bytes[3]],
                })
            }
        };

        let version = byte_order.read_u16(&bytes[2..4]);
        let (big_tiff, first_dir_offset) = match version {
            42 => (false, byte_order.read_u32(&bytes[4..8]) as u64),
            43 => {
                if bytes.len() < TIFF_PROBE_LEN {
                    return Err(SlideError::CorruptHeader {
                        field: "tiffHeaderLength",
                        value: bytes.len() as u64,
                    });
                }
                let offset_size = byte_order.read_u16(&bytes[4..6]);
                if offset_size != 8 {
                    return Err(SlideError::CorruptHeader {
                        field: "bigTiffOffsetSize",
                        value: offset_size as u64,
                    });
                }
                (true, byte_order.read_u64(&bytes[8..16]))
            }
            other => {
                return Err(SlideError::CorruptHeader {
                    field: "tiffVersion",
                    value: other as u64,
                })
            }
        };

        if first_dir_offset >= file_len {
            return Err(SlideError::CorruptHeader {
                field: "firstDirectoryOffset",
                value: first_dir_offset,
            });
        }

        Ok(TiffHeader {
            byte_order,
            big_tiff,
            first_dir_offset,
        })
    }

    fn entry_size(&self) -> usize {
        if self.big_tiff {
            20
        } else {
            12
        }
    }

    fn count_size(&self) -> usize {
        if self.big_tiff {
            8
        } else {
            2
        }
    }

    fn next_offset_size(&self) -> usize {
        if self.big_tiff {
            8
        } else {
            4
        }
    }
}

/// Quick probe: do these bytes open a classic TIFF or BigTIFF?
pub fn is_tiff(bytes: &[u8]) -> bool {
    if bytes.len() < 8 {
        return false;
    }
    let order = match &bytes[0..2] {
        b"II" => ByteOrder::Little,
        b"MM" => ByteOrder::Big,
        _ => return false,
    };
    matches!(order.read_u16(&bytes[2..4]), 42 | 43)
}

// =============================================================================
// Directory Entries
// =============================================================================

/// One directory entry: tag, type, count and the raw value/offset field.
#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub tag_id: u16,
    pub field_type: Option<FieldType>,
    pub count: u64,
    /// Raw value/offset field bytes; the first 4 are meaningful in classic
    /// TIFF, all 8 in BigTIFF.
    value: [u8; 8],
    value_len: usize,
}

impl DirEntry {
    fn parse(bytes: &[u8], header: &TiffHeader) -> Self {
        let order = header.byte_order;
        let tag_id = order.read_u16(&bytes[0..2]);
        let field_type = FieldType::from_u16(order.read_u16(&bytes[2..4]));

        let (count, value, value_len) = if header.big_tiff {
            let mut value = [0u8; 8];
            value.copy_from_slice(&bytes[12..20]);
            (order.read_u64(&bytes[4..12]), value, 8)
        } else {
            let mut value = [0u8; 8];
            value[..4].copy_from_slice(&bytes[8..12]);
            (order.read_u32(&bytes[4..8]) as u64, value, 4)
        };

        DirEntry {
            tag_id,
            field_type,
            count,
            value,
            value_len,
        }
    }

    /// Total byte size of the value data.
    pub fn value_byte_len(&self) -> Option<u64> {
        self.field_type
            .map(|t| t.size_in_bytes() as u64 * self.count)
    }

    /// True when the value is stored inside the entry itself.
    pub fn is_inline(&self) -> bool {
        self.value_byte_len()
            .is_some_and(|len| len <= self.value_len as u64)
    }

    /// File offset of an out-of-line value.
    pub fn value_offset(&self, order: ByteOrder) -> u64 {
        if self.value_len == 8 {
            order.read_u64(&self.value)
        } else {
            order.read_u32(&self.value) as u64
        }
    }

    /// Raw inline value bytes.
    fn inline_bytes(&self) -> &[u8] {
        &self.value[..self.value_len]
    }

    /// Single scalar value widened to u64, for SHORT/LONG/LONG8 entries
    /// with count 1.
    pub fn scalar(&self, order: ByteOrder) -> Option<u64> {
        if self.count != 1 || !self.is_inline() {
            return None;
        }
        match self.field_type? {
            FieldType::Short => Some(order.read_u16(self.inline_bytes()) as u64),
            FieldType::Long => Some(order.read_u32(self.inline_bytes()) as u64),
            FieldType::Long8 => Some(order.read_u64(self.inline_bytes())),
            _ => None,
        }
    }
}

// =============================================================================
// Directory
// =============================================================================

/// A parsed directory: entries in file order plus the next-directory link.
#[derive(Debug, Clone)]
pub struct Directory {
    pub entries: Vec<DirEntry>,
    pub next_offset: u64,
}

impl Directory {
    /// Find an entry by tag.
    pub fn get(&self, tag: Tag) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.tag_id == tag.id())
    }

    /// Scalar value for `tag`, widened to u64.
    pub fn scalar(&self, tag: Tag, order: ByteOrder) -> Option<u64> {
        self.get(tag)?.scalar(order)
    }

    /// True when the directory carries tile geometry tags.
    pub fn is_tiled(&self) -> bool {
        self.get(Tag::TileWidth).is_some() && self.get(Tag::TileLength).is_some()
    }
}

// =============================================================================
// Walker
// =============================================================================

/// Read and parse the file header.
pub async fn read_header<R: RangeRead + ?Sized>(reader: &R) -> Result<TiffHeader, SlideError> {
    let probe_len = TIFF_PROBE_LEN.min(reader.len() as usize);
    let bytes = reader.read_exact_at(0, probe_len).await?;
    TiffHeader::parse(&bytes, reader.len())
}

/// Read one directory at `offset`.
pub async fn read_directory<R: RangeRead + ?Sized>(
    reader: &R,
    header: &TiffHeader,
    offset: u64,
) -> Result<Directory, SlideError> {
    let count_bytes = reader.read_exact_at(offset, header.count_size()).await?;
    let entry_count = if header.big_tiff {
        header.byte_order.read_u64(&count_bytes)
    } else {
        header.byte_order.read_u16(&count_bytes) as u64
    };

    if entry_count as usize > MAX_DIRECTORIES * 64 {
        return Err(SlideError::CorruptHeader {
            field: "directoryEntryCount",
            value: entry_count,
        });
    }

    let body_len = entry_count as usize * header.entry_size() + header.next_offset_size();
    let body = reader
        .read_exact_at(offset + header.count_size() as u64, body_len)
        .await?;

    let mut entries = Vec::with_capacity(entry_count as usize);
    for i in 0..entry_count as usize {
        let at = i * header.entry_size();
        entries.push(DirEntry::parse(&body[at..at + header.entry_size()], header));
    }

    let next_at = entry_count as usize * header.entry_size();
    let next_offset = if header.big_tiff {
        header.byte_order.read_u64(&body[next_at..])
    } else {
        header.byte_order.read_u32(&body[next_at..]) as u64
    };

    Ok(Directory {
        entries,
        next_offset,
    })
}

/// Walk the whole directory chain.
pub async fn read_directories<R: RangeRead + ?Sized>(
    reader: &R,
    header: &TiffHeader,
) -> Result<Vec<Directory>, SlideError> {
    let mut directories = Vec::new();
    let mut offset = header.first_dir_offset;

    while offset != 0 {
        if offset >= reader.len() {
            return Err(SlideError::CorruptHeader {
                field: "directoryOffset",
                value: offset,
            });
        }
        if directories.len() >= MAX_DIRECTORIES {
            return Err(SlideError::CorruptHeader {
                field: "directoryChainLength",
                value: directories.len() as u64,
            });
        }
        let directory = read_directory(reader, header, offset).await?;
        offset = directory.next_offset;
        directories.push(directory);
    }

    Ok(directories)
}

// =============================================================================
// Value Readers
// =============================================================================

/// Read an entry's value bytes, inline or from its offset.
async fn read_value_bytes<R: RangeRead + ?Sized>(
    reader: &R,
    header: &TiffHeader,
    entry: &DirEntry,
) -> Result<Bytes, SlideError> {
    let len = entry.value_byte_len().ok_or(SlideError::CorruptHeader {
        field: "fieldType",
        value: entry.tag_id as u64,
    })? as usize;

    if entry.is_inline() {
        Ok(Bytes::copy_from_slice(&entry.inline_bytes()[..len]))
    } else {
        reader
            .read_exact_at(entry.value_offset(header.byte_order), len)
            .await
    }
}

/// Read a SHORT/LONG/LONG8 array widened to u64 (tile offsets, byte counts).
pub async fn read_u64_array<R: RangeRead + ?Sized>(
    reader: &R,
    header: &TiffHeader,
    entry: &DirEntry,
) -> Result<Vec<u64>, SlideError> {
    let element = entry.field_type.ok_or(SlideError::CorruptHeader {
        field: "fieldType",
        value: entry.tag_id as u64,
    })?;
    let bytes = read_value_bytes(reader, header, entry).await?;
    let order = header.byte_order;

    let values = match element {
        FieldType::Short => bytes.chunks_exact(2).map(|c| order.read_u16(c) as u64).collect(),
        FieldType::Long => bytes.chunks_exact(4).map(|c| order.read_u32(c) as u64).collect(),
        FieldType::Long8 => bytes.chunks_exact(8).map(|c| order.read_u64(c)).collect(),
        _ => {
            return Err(SlideError::CorruptHeader {
                field: "arrayFieldType",
                value: entry.tag_id as u64,
            })
        }
    };
    Ok(values)
}

/// Read an ASCII value, trimming trailing NULs.
pub async fn read_string<R: RangeRead + ?Sized>(
    reader: &R,
    header: &TiffHeader,
    entry: &DirEntry,
) -> Result<String, SlideError> {
    let bytes = read_value_bytes(reader, header, entry).await?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Read a RATIONAL value as numerator / denominator.
pub async fn read_rational<R: RangeRead + ?Sized>(
    reader: &R,
    header: &TiffHeader,
    entry: &DirEntry,
) -> Result<Option<f64>, SlideError> {
    if entry.field_type != Some(FieldType::Rational) || entry.count == 0 {
        return Ok(None);
    }
    let bytes = read_value_bytes(reader, header, entry).await?;
    let numerator = header.byte_order.read_u32(&bytes[0..4]) as f64;
    let denominator = header.byte_order.read_u32(&bytes[4..8]) as f64;
    if denominator == 0.0 {
        return Ok(None);
    }
    Ok(Some(numerator / denominator))
}

/// Read the directory's page origin in pixels.
///
/// `XPosition`/`YPosition` record the image's offset on the scanned page
/// in resolution units; multiplying by the matching resolution (pixels per
/// unit) yields pixels. Each axis resolves independently and is `None`
/// when either its position or its resolution tag is absent.
pub async fn read_page_origin<R: RangeRead + ?Sized>(
    reader: &R,
    header: &TiffHeader,
    directory: &Directory,
) -> Result<(Option<f64>, Option<f64>), SlideError> {
    let mut origin_x = None;
    let mut origin_y = None;
    for (position_tag, resolution_tag, out) in [
        (Tag::XPosition, Tag::XResolution, &mut origin_x),
        (Tag::YPosition, Tag::YResolution, &mut origin_y),
    ] {
        let (Some(position), Some(resolution)) =
            (directory.get(position_tag), directory.get(resolution_tag))
        else {
            continue;
        };
        let position = read_rational(reader, header, position).await?;
        let resolution = read_rational(reader, header, resolution).await?;
        if let (Some(position), Some(resolution)) = (position, resolution) {
            *out = Some(position * resolution);
        }
    }
    Ok((origin_x, origin_y))
}

// =============================================================================
// Tests
// =============================================================================
