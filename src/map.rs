//! Map grid planning.
//!
//! Picks the zoom at which a track fits a fixed square tile grid, regularizes
//! the grid to exactly `map_size + 1` tiles per axis (clipped at the edges of
//! the world) and reports its geographic box, so a renderer can stack the
//! tiles column by column and place the track on top.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::MapConfig;
use crate::tiles::{auto_zoom, clip_range, deg_to_tile, tile_span_adjust, tile_to_deg, TileKey, TileRange};
use crate::track::{reduce_points, Track};
use crate::{Extremes, SegmentId, TrackRow};

/// Tile grid and geographic box of a map background.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapPlan {
    pub zoom: u8,
    /// Tiles shown on the map
    pub grid: TileRange,
    /// Tiles fetched: the grid plus `extra_tiles` on each side
    pub fetch: TileRange,
    /// Geographic extent of `grid`
    pub bbox: Extremes,
}

impl MapPlan {
    /// Grid tiles in column-major order.
    pub fn tiles(&self) -> Vec<TileKey> {
        self.grid.iter().collect()
    }
}

/// Plan the map background for a track's extremes.
pub fn plan_map(extremes: &Extremes, config: &MapConfig) -> MapPlan {
    let zoom = auto_zoom(
        extremes.lat_min,
        extremes.lon_min,
        extremes.lat_max,
        extremes.lon_max,
        config.map_size,
        config.max_zoom,
    );

    let (x0, y0) = deg_to_tile(extremes.lat_max, extremes.lon_min, zoom);
    let (x1, y1) = deg_to_tile(extremes.lat_min, extremes.lon_max, zoom);
    let (x0, x1) = tile_span_adjust(x0, x1, config.map_size);
    let (y0, y1) = tile_span_adjust(y0, y1, config.map_size);

    let grid = clip_range(zoom, x0, x1, y0, y1, 0);
    let fetch = clip_range(zoom, x0, x1, y0, y1, config.extra_tiles);

    let (lat_max, lon_max) = tile_to_deg(grid.x_max as i64 + 1, grid.y_min as i64, zoom);
    let (lat_min, lon_min) = tile_to_deg(grid.x_min as i64, grid.y_max as i64 + 1, zoom);
    let bbox = Extremes {
        lat_min,
        lat_max,
        lon_min,
        lon_max,
    };

    debug!(
        "[Map] zoom {}, grid x {}..={} y {}..={}",
        zoom, grid.x_min, grid.x_max, grid.y_min, grid.y_max
    );
    MapPlan {
        zoom,
        grid,
        fetch,
        bbox,
    }
}

/// Rows to draw over the map, per segment, thinned to at most
/// `max_displayed_points` each.
pub fn display_segments(track: &Track, config: &MapConfig) -> Vec<(SegmentId, Vec<TrackRow>)> {
    let rows = track.rows();
    track
        .segment_ids()
        .into_iter()
        .map(|id| {
            let segment: Vec<TrackRow> = rows.iter().filter(|r| r.segment == id).copied().collect();
            (id, reduce_points(&segment, config.max_displayed_points))
        })
        .collect()
}

#[cfg(feature = "http")]
pub use prepare::{prepare_map, PreparedMap};

#[cfg(feature = "http")]
mod prepare {
    use std::path::PathBuf;

    use log::{info, warn};

    use super::MapPlan;
    use crate::http::{TileClient, TileFetcher};
    use crate::tile_store::TileStore;

    /// Fetched map grid, ready for composition.
    #[derive(Debug, Clone, PartialEq)]
    pub struct PreparedMap {
        pub plan: MapPlan,
        /// Grid tile paths in column-major order
        pub tile_paths: Vec<PathBuf>,
        /// Valid tiles among everything fetched (grid plus margin)
        pub valid_tiles: usize,
    }

    impl PreparedMap {
        /// Tile paths grouped by column, each top to bottom.
        pub fn columns(&self) -> Vec<&[PathBuf]> {
            let height = self.plan.grid.height() as usize;
            self.tile_paths.chunks(height.max(1)).collect()
        }
    }

    /// Ensure every tile of the plan is cached.
    pub fn prepare_map<C: TileClient>(plan: MapPlan, fetcher: &TileFetcher<C>, store: &TileStore) -> PreparedMap {
        let valid_tiles = fetcher.ensure_tiles(store, &plan.fetch);
        if valid_tiles < plan.fetch.len() {
            warn!(
                "[Map] Only {}/{} tiles valid at zoom {}",
                valid_tiles,
                plan.fetch.len(),
                plan.zoom
            );
        }
        let tile_paths = plan.grid.iter().map(|key| fetcher.tile_path(key)).collect();
        info!("[Map] Prepared {}x{} grid at zoom {}", plan.grid.width(), plan.grid.height(), plan.zoom);
        PreparedMap {
            plan,
            tile_paths,
            valid_tiles,
        }
    }
}
