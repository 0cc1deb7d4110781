//! Slippy-map tile math.
//!
//! Converts between WGS84 coordinates and web mercator tile indices, picks
//! the zoom level at which a bounding box fits a fixed-size tile grid, and
//! regularizes tile spans to that grid.

use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::Extremes;

/// Deepest zoom level served by common tile providers.
pub const MAX_ZOOM: u8 = 22;

/// Address of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(zoom: u8, x: u32, y: u32) -> Self {
        Self { zoom, x, y }
    }
}

/// Inclusive rectangle of tile indices at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRange {
    pub zoom: u8,
    pub x_min: u32,
    pub x_max: u32,
    pub y_min: u32,
    pub y_max: u32,
}

impl TileRange {
    /// Number of tiles along x.
    pub fn width(&self) -> u32 {
        self.x_max - self.x_min + 1
    }

    /// Number of tiles along y.
    pub fn height(&self) -> u32 {
        self.y_max - self.y_min + 1
    }

    /// Total tile count.
    pub fn len(&self) -> usize {
        self.width() as usize * self.height() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column-major iteration (x outer, y inner), the order tiles are
    /// stacked into a map image.
    pub fn iter(&self) -> impl Iterator<Item = TileKey> + '_ {
        (self.x_min..=self.x_max)
            .flat_map(move |x| (self.y_min..=self.y_max).map(move |y| TileKey::new(self.zoom, x, y)))
    }
}

// ============================================================================
// Web Mercator Math
// ============================================================================

#[inline]
fn tiles_per_axis(zoom: u8) -> f64 {
    2.0_f64.powi(zoom as i32)
}

/// Convert longitude to fractional tile X coordinate at given zoom
#[inline]
pub fn lon_to_tile_x(lon: f64, zoom: u8) -> f64 {
    (lon + 180.0) / 360.0 * tiles_per_axis(zoom)
}

/// Convert latitude to fractional tile Y coordinate at given zoom
#[inline]
pub fn lat_to_tile_y(lat: f64, zoom: u8) -> f64 {
    let lat_rad = lat.to_radians();
    (1.0 - lat_rad.tan().asinh() / PI) / 2.0 * tiles_per_axis(zoom)
}

/// Tile indices containing a coordinate.
///
/// No clamping is applied: latitudes beyond roughly ±85.05° or longitudes
/// outside ±180° produce indices outside `[0, 2^zoom)`.
pub fn deg_to_tile(lat: f64, lon: f64, zoom: u8) -> (i64, i64) {
    let x = lon_to_tile_x(lon, zoom).floor() as i64;
    let y = lat_to_tile_y(lat, zoom).floor() as i64;
    (x, y)
}

/// North-west corner (lat, lon) of a tile.
pub fn tile_to_deg(x: i64, y: i64, zoom: u8) -> (f64, f64) {
    let n = tiles_per_axis(zoom);
    let lon = x as f64 / n * 360.0 - 180.0;
    let lat_rad = (PI * (1.0 - 2.0 * y as f64 / n)).sinh().atan();
    (lat_rad.to_degrees(), lon)
}

/// Local cache path of a tile: `{root}/{zoom}/{x}/{y}.png`.
pub fn tile_path(root: &Path, key: TileKey) -> PathBuf {
    root.join(key.zoom.to_string())
        .join(key.x.to_string())
        .join(format!("{}.png", key.y))
}

// ============================================================================
// Zoom Selection
// ============================================================================

/// Most detailed zoom at which the bounding box spans at most `map_size`
/// tiles on both axes.
///
/// Zoom levels are walked from 0 upwards. As soon as either span exceeds
/// `map_size` the previous level wins. A level where one span hits
/// `map_size` exactly while the other stays below is taken immediately,
/// which favours the larger usable zoom. If the box still fits at
/// `max_zoom`, `max_zoom` is returned.
pub fn auto_zoom(
    lat_min: f64,
    lon_min: f64,
    lat_max: f64,
    lon_max: f64,
    map_size: u32,
    max_zoom: u8,
) -> u8 {
    let map_size = map_size as i64;
    if max_zoom > MAX_ZOOM {
        warn!("[auto_zoom] max zoom {} capped to {}", max_zoom, MAX_ZOOM);
    }
    let max_zoom = max_zoom.min(MAX_ZOOM);

    for zoom in 0..=max_zoom {
        let (x_min, y_min) = deg_to_tile(lat_min, lon_min, zoom);
        let (x_max, y_max) = deg_to_tile(lat_max, lon_max, zoom);

        let width = (x_max - x_min).abs();
        let height = (y_max - y_min).abs();

        if width > map_size || height > map_size {
            debug!(
                "[auto_zoom] zoom {} overflows (width {}, height {}), using {}",
                zoom,
                width,
                height,
                zoom.saturating_sub(1)
            );
            return zoom.saturating_sub(1);
        }

        if (width == map_size && height < map_size) || (width < map_size && height == map_size) {
            debug!(
                "[auto_zoom] zoom {} fills the grid (width {}, height {})",
                zoom, width, height
            );
            return zoom;
        }
    }

    debug!("[auto_zoom] box fits at max zoom {}", max_zoom);
    max_zoom
}

/// Grow or shrink a tile index span until `|end - init| == target`.
///
/// Growth alternates between the end and the start side (the start never
/// drops below 0); shrinking alternates between the start and the end side.
/// A single-tile span (`init == end`) therefore grows to the full target.
pub fn tile_span_adjust(init: i64, end: i64, target: u32) -> (i64, i64) {
    let target = target as i64;
    let (mut init, mut end) = if init <= end { (init, end) } else { (end, init) };

    let mut step = 0usize;
    while end - init < target {
        if step % 2 == 0 || init <= 0 {
            end += 1;
        } else {
            init -= 1;
        }
        step += 1;
    }

    if end - init > target {
        warn!(
            "[tile_span_adjust] Shrinking span {}..{} to {} tiles",
            init, end, target
        );
    }
    step = 0;
    while end - init > target {
        if step % 2 == 0 {
            init += 1;
        } else {
            end -= 1;
        }
        step += 1;
    }

    (init, end)
}

/// Tile range covering a bounding box, widened by `extra` tiles per side and
/// clipped to the valid index space of the zoom level.
pub fn tile_range(bbox: &Extremes, zoom: u8, extra: u32) -> TileRange {
    let (x0, y0) = deg_to_tile(bbox.lat_max, bbox.lon_min, zoom);
    let (x1, y1) = deg_to_tile(bbox.lat_min, bbox.lon_max, zoom);
    clip_range(zoom, x0.min(x1), x0.max(x1), y0.min(y1), y0.max(y1), extra)
}

/// Clip signed tile indices (widened by `extra`) into a [`TileRange`].
pub fn clip_range(zoom: u8, x_min: i64, x_max: i64, y_min: i64, y_max: i64, extra: u32) -> TileRange {
    // Indices are u32, so the world edge saturates past zoom 32
    let last = (1i64 << zoom.min(32)) - 1;
    let extra = extra as i64;
    let clip = |v: i64| v.clamp(0, last) as u32;
    TileRange {
        zoom,
        x_min: clip(x_min - extra),
        x_max: clip(x_max + extra),
        y_min: clip(y_min - extra),
        y_max: clip(y_max + extra),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_origin_tile() {
        assert_eq!(deg_to_tile(0.0, 0.0, 0), (0, 0));
        let (lat, lon) = tile_to_deg(0, 0, 0);
        assert!((lat - 85.0511).abs() < 1e-3);
        assert!((lon + 180.0).abs() < 1e-9);
    }

    #[test]
    fn test_known_tile() {
        // Madrid at zoom 10
        assert_eq!(deg_to_tile(40.4168, -3.7038, 10), (501, 386));
    }

    #[test]
    fn test_round_trip_corner() {
        let (lat, lon) = tile_to_deg(501, 388, 10);
        assert_eq!(deg_to_tile(lat - 1e-9, lon + 1e-9, 10), (501, 386));
    }

    #[test]
    fn test_clip_range_at_extreme_zoom() {
        let range = clip_range(80, -5, 10, 3, 1 << 40, 2);
        assert_eq!(range.zoom, 80);
        assert_eq!((range.x_min, range.x_max), (0, 12));
        assert_eq!(range.y_max, u32::MAX);
        assert_eq!(clip_range(0, -1, 1, -1, 1, 0).x_max, 0);
    }

    #[test]
    fn test_auto_zoom_caps_max_zoom() {
        assert_eq!(auto_zoom(40.0, -3.0, 40.0, -3.0, 2, 200), MAX_ZOOM);
    }

    #[test]
    fn test_tile_path_layout() {
        let p = tile_path(Path::new("/cache"), TileKey::new(3, 4, 5));
        assert_eq!(p, PathBuf::from("/cache/3/4/5.png"));
    }

    #[test]
    fn test_auto_zoom_point_returns_max() {
        assert_eq!(auto_zoom(40.0, -3.0, 40.0, -3.0, 2, 16), 16);
    }

    #[test]
    fn test_auto_zoom_world_is_zero() {
        assert_eq!(auto_zoom(-80.0, -170.0, 80.0, 170.0, 2, 16), 1);
        assert_eq!(auto_zoom(-80.0, -170.0, 80.0, 170.0, 0, 16), 0);
    }

    #[test]
    fn test_span_adjust_single_tile() {
        assert_eq!(tile_span_adjust(5, 5, 2), (4, 6));
        assert_eq!(tile_span_adjust(5, 6, 2), (5, 7));
    }

    #[test]
    fn test_span_adjust_at_origin_grows_end() {
        assert_eq!(tile_span_adjust(0, 0, 2), (0, 2));
    }

    #[test]
    fn test_span_adjust_shrinks() {
        let (i, e) = tile_span_adjust(10, 15, 2);
        assert_eq!(e - i, 2);
        assert!(i >= 10 && e <= 15);
    }

    #[test]
    fn test_tile_range_clipped() {
        let bbox = Extremes {
            lat_min: 0.0,
            lat_max: 1.0,
            lon_min: -180.0,
            lon_max: -179.0,
        };
        let range = tile_range(&bbox, 2, 1);
        assert_eq!(range.x_min, 0);
        assert!(range.x_max <= 3 && range.y_max <= 3);
        assert_eq!(range.iter().count(), range.len());
    }

    proptest! {
        #[test]
        fn prop_auto_zoom_fits_grid(
            lat_a in -85.0f64..85.0,
            lat_b in -85.0f64..85.0,
            lon_a in -179.9f64..179.9,
            lon_b in -179.9f64..179.9,
            map_size in 1u32..4,
        ) {
            let (lat_min, lat_max) = (lat_a.min(lat_b), lat_a.max(lat_b));
            let (lon_min, lon_max) = (lon_a.min(lon_b), lon_a.max(lon_b));
            let zoom = auto_zoom(lat_min, lon_min, lat_max, lon_max, map_size, 16);
            let (x0, y0) = deg_to_tile(lat_min, lon_min, zoom);
            let (x1, y1) = deg_to_tile(lat_max, lon_max, zoom);
            prop_assert!((x1 - x0).abs() <= map_size as i64 || zoom == 0);
            prop_assert!((y1 - y0).abs() <= map_size as i64 || zoom == 0);
        }
    }
}
