//! Vendor metadata exposed as a string-to-string table.
//!
//! Values are opaque to the core: everything is formatted to a string at
//! open time and the table never changes afterwards. Keys that cannot be
//! determined for a given slide are simply absent.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::format::detect::VsiDescriptor;
use crate::format::ets::{ChannelKind, EtsVolume};
use crate::format::ome_tiff::OmeTiffVolume;
use crate::pyramid::LevelDescriptor;

/// Property key names.
pub mod keys {
    pub const VENDOR: &str = "vendor";
    pub const QUICKHASH1: &str = "quickhash-1";
    pub const MPP_X: &str = "mpp-x";
    pub const MPP_Y: &str = "mpp-y";
    pub const BOUNDS_X: &str = "bounds-x";
    pub const BOUNDS_Y: &str = "bounds-y";
    pub const BOUNDS_WIDTH: &str = "bounds-width";
    pub const BOUNDS_HEIGHT: &str = "bounds-height";
    pub const BACKGROUND_COLOR: &str = "background-color";
    pub const OBJECTIVE_POWER: &str = "objective-power";
    pub const COMMENT: &str = "comment";
}

/// Vendor string for every slide this crate opens.
const VENDOR_OLYMPUS: &str = "olympus";

fn hex_digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Publish the `bounds-*` keys a genuine source supplied; the rest stay
/// absent.
///
/// The origin comes from TIFF page-position tags. The size comes from an
/// OME declaration of the scan region and is published only when it names
/// a region smaller than the (tile-padded) pyramid level 0 — a declaration
/// merely restating the full level carries no bounds information.
fn insert_bounds(
    table: &mut BTreeMap<String, String>,
    origin: (Option<f64>, Option<f64>),
    declared: Option<(u32, u32)>,
    level0: &LevelDescriptor,
) {
    if let Some(x) = origin.0 {
        table.insert(keys::BOUNDS_X.to_string(), (x.round() as i64).to_string());
    }
    if let Some(y) = origin.1 {
        table.insert(keys::BOUNDS_Y.to_string(), (y.round() as i64).to_string());
    }
    if let Some((width, height)) = declared {
        let smaller = width < level0.width || height < level0.height;
        if smaller && width <= level0.width && height <= level0.height {
            table.insert(keys::BOUNDS_WIDTH.to_string(), width.to_string());
            table.insert(keys::BOUNDS_HEIGHT.to_string(), height.to_string());
        }
    }
}

fn insert_descriptor(table: &mut BTreeMap<String, String>, descriptor: Option<&VsiDescriptor>) {
    let Some(descriptor) = descriptor else {
        return;
    };
    if let Some(mpp_x) = descriptor.mpp_x {
        table.insert(keys::MPP_X.to_string(), mpp_x.to_string());
    }
    if let Some(mpp_y) = descriptor.mpp_y {
        table.insert(keys::MPP_Y.to_string(), mpp_y.to_string());
    }
    if let Some(ome) = &descriptor.ome {
        if let Some(magnification) = ome.objective_magnification {
            table.insert(keys::OBJECTIVE_POWER.to_string(), magnification.to_string());
        }
    }
}

/// Assemble the table for an ETS-backed slide.
pub(crate) fn build_ets(
    volume: &EtsVolume,
    levels: &[LevelDescriptor],
    descriptor: Option<&VsiDescriptor>,
) -> BTreeMap<String, String> {
    let mut table = BTreeMap::new();
    table.insert(keys::VENDOR.to_string(), VENDOR_OLYMPUS.to_string());

    // Hash over exactly the parsed subset: headers plus tile directory.
    table.insert(
        keys::QUICKHASH1.to_string(),
        hex_digest(&[&volume.raw_prefix, &volume.raw_directory]),
    );

    let rgb = match volume.header.channel_kind {
        ChannelKind::Rgb => {
            let c = &volume.header.background_color;
            [c[0], c[1], c[2]]
        }
        ChannelKind::Grayscale => {
            let g = volume.header.background_color.first().copied().unwrap_or(0);
            [g, g, g]
        }
    };
    table.insert(
        keys::BACKGROUND_COLOR.to_string(),
        format!("{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2]),
    );

    // An ETS container carries no bounds of its own; the descriptor's
    // position tags give the origin and its OME XML's largest declared
    // image gives the scan region, when either exists.
    let origin = descriptor
        .map(|d| (d.bounds_x, d.bounds_y))
        .unwrap_or((None, None));
    let declared = descriptor
        .and_then(|d| d.ome.as_ref())
        .and_then(|ome| {
            ome.images
                .iter()
                .max_by_key(|image| image.size_x as u64 * image.size_y as u64)
        })
        .map(|image| (image.size_x, image.size_y));
    insert_bounds(&mut table, origin, declared, &levels[0]);

    insert_descriptor(&mut table, descriptor);
    table
}

/// Assemble the table for an OME-TIFF-backed slide.
pub(crate) fn build_ome_tiff(
    volume: &OmeTiffVolume,
    levels: &[LevelDescriptor],
    descriptor: Option<&VsiDescriptor>,
) -> BTreeMap<String, String> {
    let mut table = BTreeMap::new();
    table.insert(keys::VENDOR.to_string(), VENDOR_OLYMPUS.to_string());

    table.insert(
        keys::QUICKHASH1.to_string(),
        hex_digest(&[
            volume.raw_xml.as_bytes(),
            &levels[0].width.to_le_bytes(),
            &levels[0].height.to_le_bytes(),
        ]),
    );

    let first_image = &volume.ome.images[0];
    if first_image.physical_size_x > 0.0 {
        table.insert(
            keys::MPP_X.to_string(),
            first_image.physical_size_x.to_string(),
        );
    }
    if first_image.physical_size_y > 0.0 {
        table.insert(
            keys::MPP_Y.to_string(),
            first_image.physical_size_y.to_string(),
        );
    }
    if let Some(magnification) = volume.ome.objective_magnification {
        table.insert(keys::OBJECTIVE_POWER.to_string(), magnification.to_string());
    }
    if !first_image.name.is_empty() {
        table.insert(keys::COMMENT.to_string(), first_image.name.clone());
    }

    // Origin from the file's own position tags; size from the OME XML when
    // it declares a region smaller than the TIFF level geometry.
    insert_bounds(
        &mut table,
        volume.page_origin,
        Some((first_image.size_x, first_image.size_y)),
        &levels[0],
    );

    // Descriptor values fill remaining gaps but never override the OME XML.
    let mut from_descriptor = BTreeMap::new();
    insert_descriptor(&mut from_descriptor, descriptor);
    for (key, value) in from_descriptor {
        table.entry(key).or_insert(value);
    }
    table
}
