//! End-to-end tests over generated Olympus OME-TIFF sidecars.

use super::test_utils::{build_ome_tiff, write_file};

use vsislide::{Slide, SlideError};

fn write_tif(dir: &std::path::Path, level_sizes: &[(u32, u32)], planes: usize) -> std::path::PathBuf {
    let path = dir.join("frame_t.tif");
    write_file(&path, &build_ome_tiff(level_sizes, planes, 64));
    path
}

#[tokio::test]
async fn test_open_structure() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tif(dir.path(), &[(128, 128), (64, 64)], 2);

    let slide = Slide::open(&path).await.unwrap();
    assert_eq!(slide.level_count(), 2);
    assert_eq!(slide.plane_count(), 2);
    assert_eq!(slide.dimensions(), (128, 128));
    assert_eq!(slide.level_dimensions(1), Some((64, 64)));
    assert_eq!(slide.level_downsample(0), Some(1.0));
    assert_eq!(slide.level_downsample(1), Some(2.0));
    assert_eq!(slide.tile_size(0), Some((64, 64)));
}

#[tokio::test]
async fn test_non_power_of_two_downsample() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tif(dir.path(), &[(192, 192), (64, 64)], 1);

    let slide = Slide::open(&path).await.unwrap();
    assert_eq!(slide.level_downsample(1), Some(3.0));
    assert_eq!(slide.best_level_for_downsample(2.9), 0);
    assert_eq!(slide.best_level_for_downsample(3.0), 1);
}

#[tokio::test]
async fn test_plane_tiles_decode_with_marker_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tif(dir.path(), &[(128, 128), (64, 64)], 2);
    let slide = Slide::open(&path).await.unwrap();

    // The fixture fills each tile with 0x10*(level+1) + plane; the decoded
    // RGBA replicates that scalar across RGB.
    for (level, plane, expected) in [(0u32, 0u32, 0x10u8), (0, 1, 0x11), (1, 0, 0x20), (1, 1, 0x21)]
    {
        let tile = slide.read_tile(level, 0, 0, plane).await.unwrap();
        let sample = &tile.data()[0..4];
        assert_eq!(sample, &[expected, expected, expected, 0xFF]);
    }
}

#[tokio::test]
async fn test_plane_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tif(dir.path(), &[(64, 64)], 2);
    let slide = Slide::open(&path).await.unwrap();

    assert!(matches!(
        slide.read_tile(0, 0, 0, 2).await.unwrap_err(),
        SlideError::TileOutOfRange { .. }
    ));
}

#[tokio::test]
async fn test_properties_from_ome_xml() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tif(dir.path(), &[(128, 128)], 1);
    let slide = Slide::open(&path).await.unwrap();

    assert_eq!(slide.property(vsislide::keys::VENDOR), Some("olympus"));
    assert_eq!(slide.property(vsislide::keys::MPP_X), Some("0.5"));
    assert_eq!(slide.property(vsislide::keys::MPP_Y), Some("0.5"));
    assert_eq!(slide.property(vsislide::keys::OBJECTIVE_POWER), Some("20"));
    assert_eq!(slide.property(vsislide::keys::COMMENT), Some("level0"));
    assert!(slide.property(vsislide::keys::QUICKHASH1).is_some());

    // The XML restates the TIFF geometry and the file carries no position
    // tags: no bounds source exists, so every bounds key is absent.
    for key in [
        vsislide::keys::BOUNDS_X,
        vsislide::keys::BOUNDS_Y,
        vsislide::keys::BOUNDS_WIDTH,
        vsislide::keys::BOUNDS_HEIGHT,
    ] {
        assert_eq!(slide.property(key), None, "{key} must be absent");
    }
}

#[tokio::test]
async fn test_bounds_from_declared_sub_region() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame_t.tif");

    // The TIFF pyramid is padded to 128x128, but the OME XML declares the
    // meaningful scan region as 96x80.
    let xml = super::test_utils::build_ome_xml(&[(96, 80)], 1);
    super::test_utils::write_file(
        &path,
        &super::test_utils::build_ome_tiff_with_xml(&[(128, 128)], &xml, 1, 64),
    );

    let slide = Slide::open(&path).await.unwrap();
    assert_eq!(slide.dimensions(), (128, 128));
    assert_eq!(slide.property(vsislide::keys::BOUNDS_WIDTH), Some("96"));
    assert_eq!(slide.property(vsislide::keys::BOUNDS_HEIGHT), Some("80"));
    // No position tags: the origin keys stay absent.
    assert_eq!(slide.property(vsislide::keys::BOUNDS_X), None);
    assert_eq!(slide.property(vsislide::keys::BOUNDS_Y), None);
}

#[tokio::test]
async fn test_read_region_across_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_tif(dir.path(), &[(128, 128)], 1);
    let slide = Slide::open(&path).await.unwrap();

    let region = slide.read_region(32, 32, 0, 64, 64, 0).await.unwrap();
    assert_eq!(region.len(), 64 * 64 * 4);
    // Single level, uniform marker: the whole region is 0x10.
    assert!(region.chunks_exact(4).all(|p| p == [0x10, 0x10, 0x10, 0xFF]));
}
