//! End-to-end tests over generated `.ets` archives.

use super::test_utils::{average_rgb, close_to, EtsBuilder};

use vsislide::{Slide, SlideError};

const RED: [u8; 3] = [200, 40, 40];
const GREEN: [u8; 3] = [40, 200, 40];
const BLUE: [u8; 3] = [40, 40, 200];
const GRAY: [u8; 3] = [128, 128, 128];

fn four_tile_archive(tile_edge: u32) -> EtsBuilder {
    EtsBuilder::brightfield(tile_edge)
        .tile(0, 0, 0, RED)
        .tile(0, 1, 0, GREEN)
        .tile(0, 0, 1, BLUE)
        .tile(0, 1, 1, GRAY)
}

#[tokio::test]
async fn test_single_level_archive_shape() {
    let dir = tempfile::tempdir().unwrap();
    let path = four_tile_archive(512).write_to(dir.path());

    let slide = Slide::open(&path).await.unwrap();
    assert_eq!(slide.level_count(), 1);
    assert_eq!(slide.plane_count(), 1);
    assert_eq!(slide.dimensions(), (1024, 1024));
    assert_eq!(slide.level_dimensions(0), Some((1024, 1024)));
    assert_eq!(slide.level_downsample(0), Some(1.0));
    assert_eq!(slide.tile_size(0), Some((512, 512)));
}

#[tokio::test]
async fn test_second_level_halves_dimensions() {
    let dir = tempfile::tempdir().unwrap();
    let path = four_tile_archive(512)
        .tile(1, 0, 0, GRAY)
        .write_to(dir.path());

    let slide = Slide::open(&path).await.unwrap();
    assert_eq!(slide.level_count(), 2);
    assert_eq!(slide.level_dimensions(1), Some((512, 512)));
    assert_eq!(slide.level_downsample(1), Some(2.0));
}

#[tokio::test]
async fn test_fluorescence_planes_addressable() {
    let dir = tempfile::tempdir().unwrap();
    // Two planes over two levels: a 2x2 grid at level 0 and the single
    // level-1 tile, per plane, each with a distinctive gray.
    let mut builder = EtsBuilder::fluorescence(64);
    for channel in 0..2u32 {
        for row in 0..2u32 {
            for col in 0..2u32 {
                // Spaced widely enough that lossy decode keeps them apart.
                let gray = (16 + channel * 120 + row * 32 + col * 16) as u8;
                builder = builder.plane_tile(0, col, row, channel, gray);
            }
        }
        builder = builder.plane_tile(1, 0, 0, channel, (96 + channel * 120) as u8);
    }
    let path = builder.write_to(dir.path());

    let slide = Slide::open(&path).await.unwrap();
    assert_eq!(slide.plane_count(), 2);
    assert_eq!(slide.level_count(), 2);
    assert_eq!(slide.level_dimensions(1), Some((64, 64)));

    // Every (level, col, row, plane) combination resolves to its own tile.
    let mut seen = Vec::new();
    for plane in 0..2 {
        for row in 0..2 {
            for col in 0..2 {
                let tile = slide.read_tile(0, col, row, plane).await.unwrap();
                seen.push(average_rgb(tile.data())[0]);
            }
        }
        let top = slide.read_tile(1, 0, 0, plane).await.unwrap();
        seen.push(average_rgb(top.data())[0]);
    }
    assert_eq!(seen.len(), 10);
    // Grays were chosen distinct; decoded averages must keep them distinct.
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 10);
}

#[tokio::test]
async fn test_tile_pixels_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = four_tile_archive(64).write_to(dir.path());

    let slide = Slide::open(&path).await.unwrap();
    for (col, row, expected) in [(0, 0, RED), (1, 0, GREEN), (0, 1, BLUE), (1, 1, GRAY)] {
        let tile = slide.read_tile(0, col, row, 0).await.unwrap();
        assert_eq!(tile.width(), 64);
        assert_eq!(tile.height(), 64);
        assert_eq!(tile.data().len(), 64 * 64 * 4);
        let got = average_rgb(tile.data());
        assert!(close_to(got, expected), "tile ({col},{row}): {got:?}");
    }
}

#[tokio::test]
async fn test_missing_tile_surfaces_and_slide_stays_usable() {
    let dir = tempfile::tempdir().unwrap();
    // Sparse level 0: only (0,0) and (1,1) exist in a 2x2 grid.
    let path = EtsBuilder::brightfield(64)
        .tile(0, 0, 0, RED)
        .tile(0, 1, 1, BLUE)
        .write_to(dir.path());

    let slide = Slide::open(&path).await.unwrap();
    let err = slide.read_tile(0, 1, 0, 0).await.unwrap_err();
    assert!(matches!(
        err,
        SlideError::MissingTile {
            level: 0,
            col: 1,
            row: 0,
            plane: 0
        }
    ));

    // The failure is per-tile; other reads keep working.
    let tile = slide.read_tile(0, 0, 0, 0).await.unwrap();
    assert!(close_to(average_rgb(tile.data()), RED));
}

#[tokio::test]
async fn test_out_of_grid_requests_fail() {
    let dir = tempfile::tempdir().unwrap();
    let path = four_tile_archive(64).write_to(dir.path());
    let slide = Slide::open(&path).await.unwrap();

    assert!(matches!(
        slide.read_tile(1, 0, 0, 0).await.unwrap_err(),
        SlideError::TileOutOfRange { .. }
    ));
    assert!(matches!(
        slide.read_tile(0, 2, 0, 0).await.unwrap_err(),
        SlideError::TileOutOfRange { .. }
    ));
    assert!(matches!(
        slide.read_tile(0, 0, 0, 1).await.unwrap_err(),
        SlideError::TileOutOfRange { .. }
    ));
}

#[tokio::test]
async fn test_read_region_spanning_tiles() {
    let dir = tempfile::tempdir().unwrap();
    let path = four_tile_archive(64).write_to(dir.path());
    let slide = Slide::open(&path).await.unwrap();

    // A 64x64 window centred on the archive: one 32x32 quadrant from each
    // of the four tiles.
    let region = slide.read_region(32, 32, 0, 64, 64, 0).await.unwrap();
    assert_eq!(region.len(), 64 * 64 * 4);

    let pixel = |x: usize, y: usize| {
        let at = (y * 64 + x) * 4;
        [region[at], region[at + 1], region[at + 2]]
    };
    assert!(close_to(pixel(8, 8), RED));
    assert!(close_to(pixel(56, 8), GREEN));
    assert!(close_to(pixel(8, 56), BLUE));
    assert!(close_to(pixel(56, 56), GRAY));
}

#[tokio::test]
async fn test_read_region_outside_level_is_background() {
    let dir = tempfile::tempdir().unwrap();
    let path = EtsBuilder::brightfield(64).tile(0, 0, 0, RED).write_to(dir.path());
    let slide = Slide::open(&path).await.unwrap();

    // Window hangs off the right edge of the 64x64 level.
    let region = slide.read_region(32, 0, 0, 64, 64, 0).await.unwrap();
    let right_edge = {
        let at = (10 * 64 + 60) * 4;
        [region[at], region[at + 1], region[at + 2], region[at + 3]]
    };
    assert_eq!(right_edge, [0, 0, 0, 0]);

    let left_edge = {
        let at = (10 * 64 + 8) * 4;
        [region[at], region[at + 1], region[at + 2]]
    };
    assert!(close_to(left_edge, RED));
}

#[tokio::test]
async fn test_properties() {
    let dir = tempfile::tempdir().unwrap();
    let path = four_tile_archive(64).write_to(dir.path());
    let slide = Slide::open(&path).await.unwrap();

    assert_eq!(slide.property(vsislide::keys::VENDOR), Some("olympus"));
    assert_eq!(
        slide.property(vsislide::keys::BACKGROUND_COLOR),
        Some("ffffff")
    );

    // A bare archive supplies no bounds source, so the keys are absent.
    for key in [
        vsislide::keys::BOUNDS_X,
        vsislide::keys::BOUNDS_Y,
        vsislide::keys::BOUNDS_WIDTH,
        vsislide::keys::BOUNDS_HEIGHT,
    ] {
        assert_eq!(slide.property(key), None, "{key} must be absent");
    }

    let quickhash = slide.property(vsislide::keys::QUICKHASH1).unwrap();
    assert_eq!(quickhash.len(), 64);

    // The hash is stable across reopens of the same archive.
    let again = Slide::open(&path).await.unwrap();
    assert_eq!(again.property(vsislide::keys::QUICKHASH1), Some(quickhash));
}

#[tokio::test]
async fn test_quickhash_differs_between_archives() {
    let dir = tempfile::tempdir().unwrap();
    let first = four_tile_archive(64).write_to(dir.path());
    let slide_a = Slide::open(&first).await.unwrap();

    let other_dir = tempfile::tempdir().unwrap();
    let second = EtsBuilder::brightfield(64)
        .tile(0, 0, 0, RED)
        .write_to(other_dir.path());
    let slide_b = Slide::open(&second).await.unwrap();

    assert_ne!(
        slide_a.property(vsislide::keys::QUICKHASH1),
        slide_b.property(vsislide::keys::QUICKHASH1)
    );
}

#[tokio::test]
async fn test_best_level_for_downsample() {
    let dir = tempfile::tempdir().unwrap();
    let path = four_tile_archive(64)
        .tile(1, 0, 0, GRAY)
        .tile(2, 0, 0, GRAY)
        .write_to(dir.path());
    let slide = Slide::open(&path).await.unwrap();

    assert_eq!(slide.best_level_for_downsample(1.0), 0);
    assert_eq!(slide.best_level_for_downsample(1.9), 0);
    assert_eq!(slide.best_level_for_downsample(2.0), 1);
    assert_eq!(slide.best_level_for_downsample(3.5), 1);
    assert_eq!(slide.best_level_for_downsample(64.0), 2);
}

#[tokio::test]
async fn test_corrupt_header_aborts_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = four_tile_archive(64).write_to(dir.path());

    // Flip the ETS tile depth to a z-stack value.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[64 + 36..64 + 40].copy_from_slice(&2u32.to_le_bytes());
    std::fs::write(&path, &bytes).unwrap();

    let err = Slide::open(&path).await.unwrap_err();
    assert!(matches!(
        err,
        SlideError::CorruptHeader {
            field: "tileDepth",
            value: 2
        }
    ));
}
