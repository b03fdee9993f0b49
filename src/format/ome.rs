//! OME XML extraction.
//!
//! OME-TIFF sidecars (and some `.vsi` descriptors) embed an Open Microscopy
//! Environment XML document in their `ImageDescription` tag. This module
//! pulls out the slice of it the reader uses: the experimenter sentinel that
//! identifies Olympus exports, instrument identity, and per-image geometry
//! and channel descriptions.
//!
//! Optional attributes default to zero/empty; the pixel dimensions `SizeX`
//! and `SizeY` are required and their absence is a hard failure.

use roxmltree::{Document, Node};

use crate::error::SlideError;

/// Experimenter username that marks a document as an Olympus export.
pub const OLYMPUS_EXPERIMENTER: &str = "olympus";

// =============================================================================
// Model
// =============================================================================

/// One `Channel` node under `Pixels`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OmeChannel {
    pub name: String,
    /// Emission wavelength in the unit the document uses; 0 when absent.
    pub emission_wavelength: f64,
    /// Raw `Color` attribute (a signed packed RGBA integer); empty when absent.
    pub color: String,
}

/// One `Image` node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OmeImage {
    pub name: String,
    pub acquisition_date: String,
    /// Pixel width; required.
    pub size_x: u32,
    /// Pixel height; required.
    pub size_y: u32,
    /// Physical pixel width in micrometers; 0 when absent.
    pub physical_size_x: f64,
    /// Physical pixel height in micrometers; 0 when absent.
    pub physical_size_y: f64,
    pub channels: Vec<OmeChannel>,
    /// `ExposureTime` of each `Plane` node, in document order.
    pub exposure_times: Vec<f64>,
}

/// The extracted document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OmeDocument {
    pub experimenter_username: Option<String>,
    pub microscope_manufacturer: String,
    pub microscope_model: String,
    /// Number of `LightSource` nodes; a channel-count estimate.
    pub light_source_count: usize,
    /// `NominalMagnification` of the first objective, when present.
    pub objective_magnification: Option<f64>,
    pub images: Vec<OmeImage>,
}

impl OmeDocument {
    /// True when the experimenter sentinel marks an Olympus export.
    pub fn is_olympus(&self) -> bool {
        self.experimenter_username.as_deref() == Some(OLYMPUS_EXPERIMENTER)
    }
}

// =============================================================================
// Parsing
// =============================================================================

fn attr_f64(node: Node<'_, '_>, name: &str) -> f64 {
    node.attribute(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0)
}

fn attr_string(node: Node<'_, '_>, name: &str) -> String {
    node.attribute(name).unwrap_or_default().to_string()
}

fn required_u32(node: Node<'_, '_>, name: &'static str) -> Result<u32, SlideError> {
    node.attribute(name)
        .and_then(|v| v.parse().ok())
        .ok_or(SlideError::MissingMetadata { attribute: name })
}

fn named<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    // Comparison by local name: OME documents are namespaced.
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

/// Parse an OME XML document.
///
/// Returns [`SlideError::Unsupported`] when the text is not an OME document
/// at all, and [`SlideError::MissingMetadata`] when an image omits its
/// required pixel dimensions.
pub fn parse(xml: &str) -> Result<OmeDocument, SlideError> {
    let document = Document::parse(xml).map_err(|e| SlideError::Unsupported {
        reason: format!("not parseable as OME XML: {e}"),
    })?;

    let root = document.root_element();
    if root.tag_name().name() != "OME" {
        return Err(SlideError::Unsupported {
            reason: format!("root element is <{}>, not <OME>", root.tag_name().name()),
        });
    }

    let mut ome = OmeDocument {
        experimenter_username: root
            .children()
            .find(|n| n.is_element() && n.tag_name().name() == "Experimenter")
            .and_then(|n| n.attribute("UserName"))
            .map(str::to_string),
        ..OmeDocument::default()
    };

    if let Some(instrument) = named(root, "Instrument").next() {
        if let Some(microscope) = named(instrument, "Microscope").next() {
            ome.microscope_manufacturer = attr_string(microscope, "Manufacturer");
            ome.microscope_model = attr_string(microscope, "Model");
        }
        ome.light_source_count = named(instrument, "LightSource").count();
        ome.objective_magnification = named(instrument, "Objective")
            .next()
            .and_then(|n| n.attribute("NominalMagnification"))
            .and_then(|v| v.parse().ok());
    }

    for image in named(root, "Image") {
        let mut out = OmeImage {
            name: attr_string(image, "Name"),
            acquisition_date: named(image, "AcquisitionDate")
                .next()
                .and_then(|n| n.text())
                .unwrap_or_default()
                .to_string(),
            ..OmeImage::default()
        };

        let pixels = named(image, "Pixels")
            .next()
            .ok_or(SlideError::MissingMetadata { attribute: "Pixels" })?;
        out.size_x = required_u32(pixels, "SizeX")?;
        out.size_y = required_u32(pixels, "SizeY")?;
        out.physical_size_x = attr_f64(pixels, "PhysicalSizeX");
        out.physical_size_y = attr_f64(pixels, "PhysicalSizeY");

        for channel in named(pixels, "Channel") {
            out.channels.push(OmeChannel {
                name: attr_string(channel, "Name"),
                emission_wavelength: attr_f64(channel, "EmissionWavelength"),
                color: attr_string(channel, "Color"),
            });
        }
        for plane in named(pixels, "Plane") {
            out.exposure_times.push(attr_f64(plane, "ExposureTime"));
        }

        ome.images.push(out);
    }

    Ok(ome)
}

// =============================================================================
// Tests
// =============================================================================
