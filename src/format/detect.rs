//! Container discovery.
//!
//! A user hands this module a path; it classifies the path into one of the
//! containers the crate reads and resolves the file that actually holds the
//! pixel data. Three spellings are accepted:
//!
//! - `.ets` — a SIS/ETS container, opened directly.
//! - `.tif` — an OME-TIFF whose OME XML carries the Olympus experimenter
//!   sentinel.
//! - `.vsi` — a descriptor whose pixel data live in a sidecar directory
//!   `_<stem>_/stackN/frame_t.{ets|tif}` next to it.
//!
//! The `.vsi` descriptor is itself a small TIFF; its first directory is
//! harvested for resolution tags (microns per pixel) and, when present, an
//! embedded OME XML document.

use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::SlideError;
use crate::format::ets::SIS_MAGIC;
use crate::format::ome::{self, OmeDocument};
use crate::format::tiff::{self, Tag};
use crate::io::FilePool;

/// Resolution units of the TIFF `ResolutionUnit` tag.
const RESUNIT_INCH: u64 = 2;
const RESUNIT_CENTIMETER: u64 = 3;

// =============================================================================
// Discovery Result
// =============================================================================

/// Format of the file holding the pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// SIS/ETS tile container.
    Ets,
    /// OME-TIFF pyramid.
    OmeTiff,
}

/// Metadata harvested from a `.vsi` descriptor TIFF.
#[derive(Debug, Clone, Default)]
pub struct VsiDescriptor {
    pub path: PathBuf,
    /// Microns per pixel derived from the descriptor's resolution tags.
    pub mpp_x: Option<f64>,
    pub mpp_y: Option<f64>,
    /// Scan origin in pixels, from the descriptor's page-position tags.
    pub bounds_x: Option<f64>,
    pub bounds_y: Option<f64>,
    /// OME XML embedded in the descriptor's `ImageDescription`, when present.
    pub ome: Option<OmeDocument>,
}

/// A classified container, ready to open.
#[derive(Debug, Clone)]
pub struct DiscoveredContainer {
    pub kind: ContainerKind,
    /// The file holding tile data (the sidecar for `.vsi` input).
    pub data_path: PathBuf,
    /// Present when discovery went through a `.vsi` descriptor.
    pub descriptor: Option<VsiDescriptor>,
}

// =============================================================================
// Discovery
// =============================================================================

/// Classify `path` and resolve its data file.
pub async fn discover(path: &Path) -> Result<DiscoveredContainer, SlideError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("ets") => {
            probe_sis_magic(path).await?;
            Ok(DiscoveredContainer {
                kind: ContainerKind::Ets,
                data_path: path.to_path_buf(),
                descriptor: None,
            })
        }
        Some("tif") => {
            identify_ome_tiff(path).await?;
            Ok(DiscoveredContainer {
                kind: ContainerKind::OmeTiff,
                data_path: path.to_path_buf(),
                descriptor: None,
            })
        }
        Some("vsi") => discover_vsi(path).await,
        _ => Err(SlideError::Unsupported {
            reason: format!("unrecognized extension: {}", path.display()),
        }),
    }
}

/// Confirm the container-family magic at the start of an `.ets` file.
async fn probe_sis_magic(path: &Path) -> Result<(), SlideError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SlideError::from_io(e, path))?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .await
        .map_err(|e| SlideError::from_io(e, path))?;

    if magic != SIS_MAGIC {
        return Err(SlideError::BadMagic {
            context: "ETS container",
            expected: SIS_MAGIC,
            found: magic,
        });
    }
    Ok(())
}

/// Confirm a standalone `.tif` is an Olympus OME-TIFF export.
///
/// The file must pass the TIFF magic test and its first directory's
/// `ImageDescription` must parse as OME XML whose experimenter username is
/// the Olympus sentinel.
async fn identify_ome_tiff(path: &Path) -> Result<(), SlideError> {
    let pool = FilePool::open(path, 2).await?;
    let header = tiff::read_header(&pool).await?;
    let directory = tiff::read_directory(&pool, &header, header.first_dir_offset).await?;

    let entry = directory
        .get(Tag::ImageDescription)
        .ok_or_else(|| SlideError::Unsupported {
            reason: "TIFF has no ImageDescription to identify the vendor".to_string(),
        })?;
    let description = tiff::read_string(&pool, &header, entry).await?;

    let ome = ome::parse(&description)?;
    if !ome.is_olympus() {
        return Err(SlideError::Unsupported {
            reason: format!(
                "OME experimenter is {:?}, not {:?}",
                ome.experimenter_username,
                ome::OLYMPUS_EXPERIMENTER
            ),
        });
    }
    Ok(())
}

/// Resolve a `.vsi` descriptor to its sidecar data file.
async fn discover_vsi(path: &Path) -> Result<DiscoveredContainer, SlideError> {
    // The descriptor itself must exist and look like a TIFF.
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SlideError::from_io(e, path))?;
    let mut probe = [0u8; 8];
    file.read_exact(&mut probe)
        .await
        .map_err(|e| SlideError::from_io(e, path))?;
    if !tiff::is_tiff(&probe) {
        return Err(SlideError::BadMagic {
            context: "VSI descriptor",
            expected: *b"II*\0",
            found: [probe[0], probe[1], probe[2], probe[3]],
        });
    }
    drop(file);

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| SlideError::Unsupported {
            reason: format!("cannot derive basename from {}", path.display()),
        })?;
    let slidedat_dir = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("_{stem}_"));

    let sidecar = locate_sidecar(&slidedat_dir).await?;
    debug!(sidecar = %sidecar.display(), "resolved VSI sidecar");

    let kind = match sidecar.extension().and_then(|e| e.to_str()) {
        Some("ets") => {
            probe_sis_magic(&sidecar).await?;
            ContainerKind::Ets
        }
        Some("tif") => ContainerKind::OmeTiff,
        _ => {
            return Err(SlideError::Unsupported {
                reason: format!("sidecar has unexpected extension: {}", sidecar.display()),
            })
        }
    };

    let descriptor = harvest_descriptor(path).await.unwrap_or_else(|e| {
        // The sidecar carries the pixels; a descriptor that cannot be
        // harvested only costs properties.
        debug!(error = %e, "could not harvest VSI descriptor metadata");
        VsiDescriptor {
            path: path.to_path_buf(),
            ..VsiDescriptor::default()
        }
    });

    Ok(DiscoveredContainer {
        kind,
        data_path: sidecar,
        descriptor: Some(descriptor),
    })
}

/// Scan `_<stem>_` for the first `stack1*` directory holding a
/// `frame_t.*` data file.
async fn locate_sidecar(slidedat_dir: &Path) -> Result<PathBuf, SlideError> {
    let mut entries = tokio::fs::read_dir(slidedat_dir)
        .await
        .map_err(|e| SlideError::from_io(e, slidedat_dir))?;

    let mut stacks = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SlideError::from_io(e, slidedat_dir))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with("stack1") && entry.file_type().await.map_or(false, |t| t.is_dir()) {
            stacks.push(entry.path());
        }
    }
    stacks.sort();

    for stack in &stacks {
        let mut files = tokio::fs::read_dir(stack)
            .await
            .map_err(|e| SlideError::from_io(e, stack))?;
        let mut frames = Vec::new();
        while let Some(entry) = files
            .next_entry()
            .await
            .map_err(|e| SlideError::from_io(e, stack))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("frame_t") {
                    frames.push(entry.path());
                }
            }
        }
        frames.sort();
        if let Some(frame) = frames.into_iter().next() {
            return Ok(frame);
        }
    }

    Err(SlideError::NotFound {
        path: slidedat_dir.join("stack1/frame_t.*").display().to_string(),
    })
}

/// Pull resolution tags and any embedded OME XML out of the descriptor.
async fn harvest_descriptor(path: &Path) -> Result<VsiDescriptor, SlideError> {
    let pool = FilePool::open(path, 2).await?;
    let header = tiff::read_header(&pool).await?;
    let directory = tiff::read_directory(&pool, &header, header.first_dir_offset).await?;

    let unit = directory
        .scalar(Tag::ResolutionUnit, header.byte_order)
        .unwrap_or(RESUNIT_INCH);
    let mut mpp_x = None;
    let mut mpp_y = None;
    for (tag, out) in [(Tag::XResolution, &mut mpp_x), (Tag::YResolution, &mut mpp_y)] {
        if let Some(entry) = directory.get(tag) {
            if let Some(resolution) = tiff::read_rational(&pool, &header, entry).await? {
                *out = match unit {
                    RESUNIT_CENTIMETER => Some(10_000.0 / resolution),
                    RESUNIT_INCH => Some(25_400.0 / resolution),
                    _ => None,
                };
            }
        }
    }

    let (bounds_x, bounds_y) = tiff::read_page_origin(&pool, &header, &directory).await?;

    let ome = match directory.get(Tag::ImageDescription) {
        Some(entry) => {
            let description = tiff::read_string(&pool, &header, entry).await?;
            ome::parse(&description).ok()
        }
        None => None,
    };

    Ok(VsiDescriptor {
        path: path.to_path_buf(),
        mpp_x,
        mpp_y,
        bounds_x,
        bounds_y,
        ome,
    })
}

// =============================================================================
// Tests
// =============================================================================
